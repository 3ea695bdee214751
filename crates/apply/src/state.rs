//! Reconciliation state: what the last run left behind in the cluster.

use std::collections::BTreeSet;

use keel_core::{ArtifactRef, ResourceKey, StackId, Topology};
use keel_persist::{now_ms, Backend, BackendError, Lease};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Action, ApplyError, ApplyReport, ChangePlan, OpStatus};

/// Bumped when the persisted document changes shape.
pub const STATE_FORMAT: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Converged,
    Partial,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationState {
    pub format: u32,
    /// Assigned by the backend on write; not part of the stored body.
    #[serde(skip)]
    pub serial: u64,
    pub run_id: String,
    pub namespace: String,
    pub topology: Topology,
    pub artifact: ArtifactRef,
    /// Fingerprint of the desired set the run worked from.
    pub desired_fingerprint: String,
    pub applied: BTreeSet<ResourceKey>,
    pub outcome: RunOutcome,
    pub updated_at_ms: i64,
}

impl ReconciliationState {
    /// Namespaces any applied key lives in (or is).
    pub fn namespaces(&self) -> BTreeSet<String> {
        self.applied.iter().filter_map(|k| k.scope().map(|s| s.to_string())).collect()
    }
}

pub fn load(backend: &dyn Backend, stack: &StackId) -> Result<Option<ReconciliationState>, ApplyError> {
    let Some(record) = backend.get_state(stack)? else {
        return Ok(None);
    };
    let mut state: ReconciliationState =
        serde_json::from_slice(&record.body).map_err(|e| ApplyError::Backend(BackendError::Corrupt(e.to_string())))?;
    state.serial = record.serial;
    debug!(stack = %stack, serial = state.serial, applied = state.applied.len(), "previous reconciliation state");
    Ok(Some(state))
}

pub fn save(backend: &dyn Backend, lease: &Lease, state: &mut ReconciliationState) -> Result<u64, BackendError> {
    let body = serde_json::to_vec(state).map_err(|e| BackendError::Corrupt(e.to_string()))?;
    state.serial = backend.put_state(lease, &body)?;
    Ok(state.serial)
}

/// Key set after a run: `(previous ∪ unchanged ∪ created/updated) − deleted`,
/// minus keys the plan forgot. On full success this is the desired set.
pub fn applied_keys(previous: &BTreeSet<ResourceKey>, plan: &ChangePlan, report: &ApplyReport) -> BTreeSet<ResourceKey> {
    let mut keys: BTreeSet<ResourceKey> = previous.difference(&plan.forgotten).cloned().collect();
    keys.extend(plan.unchanged.iter().cloned());
    for op in report.ops.iter().filter(|o| o.status == OpStatus::Succeeded) {
        match op.action {
            Action::Create | Action::Update => {
                keys.insert(op.key.clone());
            }
            Action::Delete => {
                keys.remove(&op.key);
            }
        }
    }
    keys
}

pub(crate) fn new_run_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub(crate) fn stamp(mut state: ReconciliationState) -> ReconciliationState {
    state.format = STATE_FORMAT;
    state.updated_at_ms = now_ms();
    state
}
