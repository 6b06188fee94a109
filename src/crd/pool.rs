//! SandboxPool Custom Resource Definition
//!
//! A SandboxPool keeps a buffer of pre-warmed, ready-to-allocate sandbox
//! units matching a template. Batches claim units from it atomically; the
//! allocation bookkeeping lives in a single annotation on the pool object
//! (see [`crate::ALLOCATIONS_ANNOTATION`]) so that a claim of any size is
//! one conditional write.

use std::collections::{BTreeMap, BTreeSet};

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{CapacitySpec, UnitTemplateSpec};
use crate::{Error, ALLOCATIONS_ANNOTATION, FORCE_DELETE_ANNOTATION};

/// The allocation table: batch name -> claimed unit names, in ordinal order.
///
/// Stored as JSON in the pool's allocations annotation. A unit named in any
/// entry is allocated; everything else is buffer. Keyed by batch identity so
/// a crashed-and-retried claim is a lookup, not a double claim.
pub type AllocationTable = BTreeMap<String, Vec<String>>;

/// Specification for a SandboxPool
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "sandbox.dev",
    version = "v1alpha1",
    kind = "SandboxPool",
    plural = "sandboxpools",
    shortname = "sbp",
    status = "SandboxPoolStatus",
    namespaced,
    printcolumn = r#"{"name":"Total","type":"integer","jsonPath":".status.total"}"#,
    printcolumn = r#"{"name":"Allocated","type":"integer","jsonPath":".status.allocated"}"#,
    printcolumn = r#"{"name":"Available","type":"integer","jsonPath":".status.available"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SandboxPoolSpec {
    /// Template for every unit this pool provisions
    pub template: UnitTemplateSpec,

    /// Capacity bounds for the buffer and the pool as a whole
    pub capacity: CapacitySpec,
}

impl SandboxPoolSpec {
    /// Validate the pool specification
    pub fn validate(&self) -> Result<(), Error> {
        self.capacity.validate()?;
        if self.template.spec.containers.is_empty() {
            return Err(Error::validation(
                "pool template must declare at least one container",
            ));
        }
        Ok(())
    }
}

/// Status for a SandboxPool.
///
/// A live view, not a cache: every reconcile re-derives these counts from
/// the actual child units and the allocation table.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SandboxPoolStatus {
    /// Total live units (allocated + available)
    #[serde(default)]
    pub total: u32,

    /// Units currently claimed by batches
    #[serde(default)]
    pub allocated: u32,

    /// Unallocated ready units (the standby buffer)
    #[serde(default)]
    pub available: u32,

    /// Human-readable reason when the pool cannot make progress
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl SandboxPool {
    /// Parse the allocation table from the pool's annotations.
    ///
    /// A missing annotation is an empty table; a corrupt one is a
    /// serialization error rather than silently dropping claims.
    pub fn allocation_table(&self) -> Result<AllocationTable, Error> {
        match self
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(ALLOCATIONS_ANNOTATION))
        {
            None => Ok(AllocationTable::new()),
            Some(raw) => serde_json::from_str(raw).map_err(|e| {
                Error::serialization(format!(
                    "corrupt allocation table on pool {:?}: {e}",
                    self.metadata.name
                ))
            }),
        }
    }

    /// Return a copy of this pool with the allocation table replaced.
    ///
    /// The copy retains the observed `resourceVersion`, so writing it back
    /// with a conditional replace is the compare-and-swap this design
    /// relies on: if anyone else moved the table first, the write 409s.
    pub fn with_allocation_table(&self, table: &AllocationTable) -> Result<SandboxPool, Error> {
        let raw = serde_json::to_string(table)
            .map_err(|e| Error::serialization(format!("allocation table: {e}")))?;
        let mut updated = self.clone();
        updated
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(ALLOCATIONS_ANNOTATION.to_string(), raw);
        Ok(updated)
    }

    /// All unit names currently claimed by any batch
    pub fn allocated_unit_names(&self) -> Result<BTreeSet<String>, Error> {
        Ok(self
            .allocation_table()?
            .into_values()
            .flatten()
            .collect())
    }

    /// True if the pool is annotated for forced deletion (destroy all units
    /// even while some are allocated)
    pub fn force_delete(&self) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(FORCE_DELETE_ANNOTATION))
            .map(|v| v == "true")
            .unwrap_or(false)
    }
}
