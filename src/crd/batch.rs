//! BatchSandbox Custom Resource Definition
//!
//! A BatchSandbox requests `replicas` sandbox units, either claimed from a
//! SandboxPool (O(1) fast path) or provisioned inline from a template (the
//! explicitly slower O(N) fallback). It optionally carries a task template
//! plus per-replica shard patches that customize each ordinal's task.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{AllocationPolicy, BatchPhase, TaskTemplateSpec, UnitTemplateSpec};
use crate::{Error, ALLOCATION_ANNOTATION};

/// Specification for a BatchSandbox
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "sandbox.dev",
    version = "v1alpha1",
    kind = "BatchSandbox",
    plural = "batchsandboxes",
    shortname = "bsb",
    status = "BatchSandboxStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".status.desired"}"#,
    printcolumn = r#"{"name":"Allocated","type":"integer","jsonPath":".status.allocated"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BatchSandboxSpec {
    /// Desired number of replicas
    #[serde(default)]
    pub replicas: u32,

    /// Name of the SandboxPool to claim units from. When unset, units are
    /// provisioned directly from `template`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_ref: Option<String>,

    /// Inline unit template for the non-pooled path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<UnitTemplateSpec>,

    /// Base task spec executed in every replica. When unset, no tasks are
    /// scheduled and the batch is purely an allocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_template: Option<TaskTemplateSpec>,

    /// Per-replica merge-patch overlays, index-aligned with replica
    /// ordinals. Applied with RFC 7396 semantics: a patched field fully
    /// replaces the base field, arrays included. Ordinals beyond the list
    /// fall back to the unpatched template.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shard_task_patches: Vec<serde_json::Value>,

    /// RFC 3339 instant after which the batch is torn down, equivalent to
    /// an explicit delete
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_time: Option<String>,

    /// What to do when the pool cannot deliver every replica
    #[serde(default)]
    pub allocation_policy: AllocationPolicy,
}

impl BatchSandboxSpec {
    /// Validate the batch specification
    pub fn validate(&self) -> Result<(), Error> {
        if self.replicas > 0 && self.pool_ref.is_none() && self.template.is_none() {
            return Err(Error::validation(
                "batch needs either poolRef or an inline template to provision units",
            ));
        }
        if !self.shard_task_patches.is_empty() && self.task_template.is_none() {
            return Err(Error::validation(
                "shardTaskPatches require a taskTemplate to patch",
            ));
        }
        if let Some(ref raw) = self.expire_time {
            DateTime::parse_from_rfc3339(raw).map_err(|e| {
                Error::validation(format!("expireTime {raw:?} is not RFC 3339: {e}"))
            })?;
        }
        Ok(())
    }

    /// Parsed expiry instant, if one is set
    pub fn expire_at(&self) -> Option<DateTime<Utc>> {
        self.expire_time
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|t| t.with_timezone(&Utc))
    }

    /// True once the expiry instant has passed
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expire_at().map(|t| t <= now).unwrap_or(false)
    }
}

/// Status for a BatchSandbox.
///
/// Counters are recomputed from live child state on every reconcile pass;
/// nothing here is a cache the controller trusts blindly.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatchSandboxStatus {
    /// Current lifecycle phase
    #[serde(default)]
    pub phase: BatchPhase,

    /// Desired replica count (mirrors spec.replicas at observation time)
    #[serde(default)]
    pub desired: u32,

    /// Total units currently associated with the batch
    #[serde(default)]
    pub total: u32,

    /// Units claimed or provisioned so far
    #[serde(default)]
    pub allocated: u32,

    /// Units reporting ready
    #[serde(default)]
    pub ready: u32,

    /// Tasks currently running
    #[serde(default)]
    pub task_running: u32,

    /// Tasks that exited successfully
    #[serde(default)]
    pub task_succeeded: u32,

    /// Tasks that failed (including ordinals with unpatchable shard patches)
    #[serde(default)]
    pub task_failed: u32,

    /// Tasks in an unknown state
    #[serde(default)]
    pub task_unknown: u32,

    /// Claim attempts made while the pool lacked capacity. Drives the
    /// Strict-policy retry budget; reset once allocation completes.
    #[serde(default)]
    pub allocation_attempts: u32,

    /// When the batch will expire, if a TTL is set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_at: Option<String>,

    /// Human-readable reason for Degraded, or per-pass diagnostics
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl BatchSandbox {
    /// The claimed unit names recorded on this batch, in ordinal order.
    ///
    /// This annotation is the single source of truth for which concrete
    /// units belong to the batch. An absent annotation means nothing has
    /// been recorded yet.
    pub fn allocation(&self) -> Result<Vec<String>, Error> {
        match self
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(ALLOCATION_ANNOTATION))
        {
            None => Ok(Vec::new()),
            Some(raw) => serde_json::from_str(raw).map_err(|e| {
                Error::serialization(format!(
                    "corrupt allocation annotation on batch {:?}: {e}",
                    self.metadata.name
                ))
            }),
        }
    }

    /// Return a copy of this batch with the allocation annotation replaced
    pub fn with_allocation(&self, units: &[String]) -> Result<BatchSandbox, Error> {
        let raw = serde_json::to_string(units)
            .map_err(|e| Error::serialization(format!("allocation annotation: {e}")))?;
        let mut updated = self.clone();
        updated
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(ALLOCATION_ANNOTATION.to_string(), raw);
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use kube::api::ObjectMeta;

    fn sample_batch() -> BatchSandbox {
        BatchSandbox {
            metadata: ObjectMeta {
                name: Some("batch-x".into()),
                namespace: Some("default".into()),
                ..Default::default()
            },
            spec: BatchSandboxSpec {
                replicas: 2,
                pool_ref: Some("pool-a".into()),
                ..Default::default()
            },
            status: None,
        }
    }

    #[test]
    fn test_validation_requires_a_provisioning_source() {
        let mut batch = sample_batch();
        assert!(batch.spec.validate().is_ok());

        batch.spec.pool_ref = None;
        assert!(batch.spec.validate().is_err());

        // Zero replicas is fine with no source at all
        batch.spec.replicas = 0;
        assert!(batch.spec.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_patches_without_template() {
        let mut batch = sample_batch();
        batch.spec.shard_task_patches = vec![serde_json::json!({"spec": {}})];
        assert!(batch.spec.validate().is_err());

        batch.spec.task_template = Some(TaskTemplateSpec::default());
        assert!(batch.spec.validate().is_ok());
    }

    #[test]
    fn test_expire_time_parsing() {
        let mut batch = sample_batch();
        batch.spec.expire_time = Some("not-a-time".into());
        assert!(batch.spec.validate().is_err());
        assert_eq!(batch.spec.expire_at(), None);

        batch.spec.expire_time = Some("2026-01-02T03:04:05Z".into());
        assert!(batch.spec.validate().is_ok());

        let before = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2026, 1, 3, 0, 0, 0).unwrap();
        assert!(!batch.spec.is_expired(before));
        assert!(batch.spec.is_expired(after));
    }

    #[test]
    fn test_allocation_annotation_round_trip() {
        let batch = sample_batch();
        assert!(batch.allocation().expect("allocation").is_empty());

        let units = vec!["pool-a-u0".to_string(), "pool-a-u1".to_string()];
        let updated = batch.with_allocation(&units).expect("update");
        assert_eq!(updated.allocation().expect("allocation"), units);
    }

    #[test]
    fn test_corrupt_allocation_annotation_is_an_error() {
        let mut batch = sample_batch();
        batch
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(ALLOCATION_ANNOTATION.into(), "[truncated".into());
        assert!(batch.allocation().is_err());
    }
}
