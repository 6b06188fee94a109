//! Task executor sidecar boundary.
//!
//! Every unit runs an execd daemon inside its shared process namespace.
//! The controllers talk to it through the [`TaskExecutor`] trait; the
//! production implementation is a small HTTP client. The contract is
//! deliberately minimal: submit, poll, stop - and stop is idempotent, so
//! teardown can re-run safely after a crash.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::crd::{Task, TaskState};
use crate::runtime::Unit;
use crate::{Error, Result};

/// Contract with the per-unit task executor daemon
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Submit a task for execution inside the unit.
    ///
    /// Rejected if the unit's process namespace is not shared/ready.
    /// Submitting a task the executor already knows is a no-op success, so
    /// re-reconciliation never duplicates work.
    async fn submit_task(&self, unit: &Unit, task: &Task) -> Result<()>;

    /// Current state of a previously submitted task. A task the executor
    /// does not know is `Unknown`, never an error.
    async fn get_task_status(&self, unit: &Unit, task_name: &str) -> Result<TaskState>;

    /// Stop a task, best effort. Stopping an already-stopped or unknown
    /// task is a no-op success.
    async fn stop_task(&self, unit: &Unit, task_name: &str) -> Result<()>;
}

#[derive(Deserialize)]
struct TaskStatusResponse {
    state: TaskState,
}

/// HTTP client for the execd daemon listening inside each unit
pub struct ExecdClient {
    http: reqwest::Client,
    port: u16,
}

impl ExecdClient {
    /// Create a client targeting execd on the given container port
    pub fn new(port: u16) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            port,
        }
    }

    fn base_url(&self, unit: &Unit) -> Result<String> {
        let address = unit.address.as_deref().ok_or_else(|| {
            Error::task_executor(format!("unit {} has no address yet", unit.name))
        })?;
        Ok(format!("http://{address}:{}/v1/tasks", self.port))
    }
}

#[async_trait]
impl TaskExecutor for ExecdClient {
    async fn submit_task(&self, unit: &Unit, task: &Task) -> Result<()> {
        if !unit.ready {
            return Err(Error::task_executor(format!(
                "unit {} is not ready to accept tasks",
                unit.name
            )));
        }
        let url = self.base_url(unit)?;
        let resp = self
            .http
            .post(&url)
            .json(task)
            .send()
            .await
            .map_err(|e| Error::task_executor(format!("submit {}: {e}", task.name)))?;

        match resp.status() {
            s if s.is_success() => Ok(()),
            // Already submitted: identical deterministic name, same work
            reqwest::StatusCode::CONFLICT => {
                debug!(task = %task.name, unit = %unit.name, "task already submitted");
                Ok(())
            }
            s => Err(Error::task_executor(format!(
                "executor rejected task {} on {}: {s}",
                task.name, unit.name
            ))),
        }
    }

    async fn get_task_status(&self, unit: &Unit, task_name: &str) -> Result<TaskState> {
        let url = format!("{}/{task_name}", self.base_url(unit)?);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::task_executor(format!("status {task_name}: {e}")))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(TaskState::Unknown);
        }
        let status: TaskStatusResponse = resp
            .error_for_status()
            .map_err(|e| Error::task_executor(format!("status {task_name}: {e}")))?
            .json()
            .await
            .map_err(|e| Error::task_executor(format!("status {task_name}: {e}")))?;
        Ok(status.state)
    }

    async fn stop_task(&self, unit: &Unit, task_name: &str) -> Result<()> {
        let url = format!("{}/{task_name}/stop", self.base_url(unit)?);
        let resp = self
            .http
            .post(&url)
            .send()
            .await
            .map_err(|e| Error::task_executor(format!("stop {task_name}: {e}")))?;

        match resp.status() {
            s if s.is_success() => Ok(()),
            // Unknown or already stopped: idempotent no-op
            reqwest::StatusCode::NOT_FOUND | reqwest::StatusCode::GONE => Ok(()),
            s => Err(Error::task_executor(format!(
                "executor refused to stop {task_name} on {}: {s}",
                unit.name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(address: Option<&str>, ready: bool) -> Unit {
        Unit {
            name: "pool-a-u0".into(),
            ready,
            failed: false,
            address: address.map(String::from),
        }
    }

    #[test]
    fn test_base_url_requires_an_address() {
        let client = ExecdClient::new(8080);
        assert!(client.base_url(&unit(None, true)).is_err());
        assert_eq!(
            client.base_url(&unit(Some("10.0.0.5"), true)).unwrap(),
            "http://10.0.0.5:8080/v1/tasks"
        );
    }

    /// Submission against a not-ready unit is rejected locally, before any
    /// network traffic: the process namespace contract is not yet in place.
    #[tokio::test]
    async fn test_submit_rejects_not_ready_unit() {
        let client = ExecdClient::new(8080);
        let task = Task {
            name: "batch-x-0".into(),
            process: None,
        };
        let err = client
            .submit_task(&unit(Some("10.0.0.5"), false), &task)
            .await
            .expect_err("must reject");
        assert!(err.to_string().contains("not ready"));
    }

    #[test]
    fn test_task_state_wire_format() {
        let resp: TaskStatusResponse =
            serde_json::from_str(r#"{"state":"Running"}"#).expect("parse");
        assert_eq!(resp.state, TaskState::Running);

        let resp: TaskStatusResponse =
            serde_json::from_str(r#"{"state":"Succeeded"}"#).expect("parse");
        assert_eq!(resp.state, TaskState::Succeeded);
    }
}
