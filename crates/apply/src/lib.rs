//! Keel apply: validate → observe → plan → apply for one desired resource set,
//! plus the reconciliation state that lets later runs clean up after earlier ones.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Instant;

use keel_core::{ResourceKey, ResourceKind, ANNOTATION_FINGERPRINT, LABEL_MANAGED_BY, LABEL_STACK, MANAGED_BY_VALUE};
use keel_kubehub::{Cluster, ClusterError};
use keel_persist::{Backend, BackendError, Lease};
use keel_plan::{fingerprint_of, stack_selector, DesiredResourceSet};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, error, info, warn};

pub mod state;
mod validate;

pub use state::{ReconciliationState, RunOutcome};
pub use validate::{validate, ValidationError, ValidationPolicy};

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("invalid desired state: {0}")]
    Invalid(#[from] ValidationError),
    #[error("observing live state: {0}")]
    Observe(#[source] ClusterError),
    #[error("backend: {0}")]
    Backend(#[from] BackendError),
    #[error("apply partially failed: {}", .0.summary())]
    Partial(ApplyReport),
    /// The cluster was changed but the state document could not be written.
    #[error("state not recorded after apply ({}): {source}", .report.summary())]
    StateWrite { report: ApplyReport, #[source] source: BackendError },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
    Delete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedOp {
    pub action: Action,
    pub key: ResourceKey,
    /// Full manifest for create/update. Never serialized (secrets).
    #[serde(skip)]
    pub manifest: Option<Json>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<DiffSummary>,
}

/// Ordered create/update/delete operations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangePlan {
    pub ops: Vec<PlannedOp>,
    /// Desired keys whose live object already matches.
    pub unchanged: Vec<ResourceKey>,
    /// Previously-applied keys that are gone or no longer ours; dropped from state.
    pub forgotten: BTreeSet<ResourceKey>,
}

impl ChangePlan {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn count(&self, action: Action) -> usize {
        self.ops.iter().filter(|o| o.action == action).count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum OpStatus {
    Succeeded,
    Failed(String),
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpReport {
    pub action: Action,
    pub key: ResourceKey,
    #[serde(flatten)]
    pub status: OpStatus,
}

impl OpReport {
    pub fn new(action: Action, key: ResourceKey, status: OpStatus) -> Self {
        Self { action, key, status }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyReport {
    pub dry_run: bool,
    pub ops: Vec<OpReport>,
}

impl ApplyReport {
    pub fn is_success(&self) -> bool {
        self.ops.iter().all(|o| o.status == OpStatus::Succeeded)
    }

    pub fn failed(&self) -> Option<&OpReport> {
        self.ops.iter().find(|o| matches!(o.status, OpStatus::Failed(_)))
    }

    pub fn summary(&self) -> String {
        let ok = self.ops.iter().filter(|o| o.status == OpStatus::Succeeded).count();
        let skipped = self.ops.iter().filter(|o| o.status == OpStatus::Skipped).count();
        match self.failed() {
            Some(OpReport { action, key, status: OpStatus::Failed(reason) }) => {
                format!("{} {} failed ({}); {} succeeded, {} skipped", action, key, reason, ok, skipped)
            }
            _ => format!("{} succeeded, {} skipped", ok, skipped),
        }
    }
}

/// What was found in the cluster for the keys this run cares about.
#[derive(Debug, Clone, Default)]
pub struct LiveState {
    /// Objects of this stack, plus whatever the desired and previous keys point at.
    pub objects: BTreeMap<ResourceKey, Json>,
    /// Every managed-kind object in each namespace involved, whoever owns it.
    pub occupants: BTreeMap<String, BTreeSet<ResourceKey>>,
}

impl LiveState {
    pub fn get(&self, key: &ResourceKey) -> Option<&Json> {
        self.objects.get(key)
    }

    pub fn occupants_of(&self, namespace: &str) -> impl Iterator<Item = &ResourceKey> {
        self.occupants.get(namespace).into_iter().flatten()
    }
}

/// Remove server-populated fields before diffing.
pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
        meta.remove("resourceVersion");
        meta.remove("generation");
        meta.remove("creationTimestamp");
        meta.remove("uid");
        if let Some(ann) = meta.get_mut("annotations").and_then(|a| a.as_object_mut()) {
            ann.remove(ANNOTATION_FINGERPRINT);
        }
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

/// Count field-level adds/updates/removes going from `base` to `target`.
pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, s: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, s),
                        None => s.adds += 1,
                    }
                }
                s.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (Json::Array(aa), Json::Array(bb)) => {
                s.updates += aa.iter().zip(bb).filter(|(x, y)| x != y).count();
                s.adds += aa.len().saturating_sub(bb.len());
                s.removes += bb.len().saturating_sub(aa.len());
            }
            (av, bv) => {
                if av != bv {
                    s.updates += 1;
                }
            }
        }
    }
    let mut s = DiffSummary::default();
    walk(target, base, &mut s);
    s
}

fn key_of(kind: ResourceKind, obj: &Json) -> Option<ResourceKey> {
    let name = obj.pointer("/metadata/name")?.as_str()?;
    if kind.namespaced() {
        let ns = obj.pointer("/metadata/namespace")?.as_str()?;
        Some(ResourceKey::namespaced(kind, ns, name))
    } else {
        Some(ResourceKey::cluster(kind, name))
    }
}

/// Whether a live object carries this stack's ownership labels.
fn owned_by(obj: &Json, stack_label: &str) -> bool {
    fn label<'a>(obj: &'a Json, k: &str) -> Option<&'a str> {
        obj.pointer("/metadata/labels")?.get(k)?.as_str()
    }
    label(obj, LABEL_MANAGED_BY) == Some(MANAGED_BY_VALUE) && label(obj, LABEL_STACK) == Some(stack_label)
}

/// Read every desired key, every previously-applied key, and everything in
/// the namespaces involved. Only objects labelled with this stack (or named by
/// a key) become candidates; the rest is recorded as namespace occupants.
pub async fn observe<C: Cluster + ?Sized>(
    cluster: &C,
    set: &DesiredResourceSet,
    previous: Option<&ReconciliationState>,
) -> Result<LiveState, ClusterError> {
    let mut keys: BTreeSet<ResourceKey> = set.keys().cloned().collect();
    let mut namespaces = BTreeSet::from([set.namespace.clone()]);
    if let Some(p) = previous {
        keys.extend(p.applied.iter().cloned());
        namespaces.extend(p.namespaces());
    }

    let mut live = LiveState::default();
    for key in &keys {
        if let Some(obj) = cluster.get(key).await? {
            live.objects.insert(key.clone(), obj);
        }
    }

    let selector = stack_selector(&set.stack);
    for obj in cluster.list(ResourceKind::Namespace, None, &selector).await? {
        if let Some(key) = key_of(ResourceKind::Namespace, &obj) {
            namespaces.insert(key.name.clone());
            live.objects.entry(key).or_insert(obj);
        }
    }

    let stack_label = set.stack.label_value();
    for ns in &namespaces {
        let occupants = live.occupants.entry(ns.clone()).or_default();
        for kind in ResourceKind::ALL.into_iter().filter(|k| k.namespaced()) {
            for obj in cluster.list(kind, Some(ns), "").await? {
                let Some(key) = key_of(kind, &obj) else { continue };
                occupants.insert(key.clone());
                if owned_by(&obj, &stack_label) {
                    live.objects.entry(key).or_insert(obj);
                }
            }
        }
    }
    debug!(observed = live.objects.len(), namespaces = namespaces.len(), "live state observed");
    Ok(live)
}

/// Execution phase of an op; the plan is sorted by this, then by key.
fn phase(op: &PlannedOp) -> u8 {
    match (op.action, op.key.kind) {
        (Action::Create, ResourceKind::Namespace) => 0,
        (Action::Delete, k) if k.is_workload() => 1,
        (Action::Delete, ResourceKind::ConfigMap | ResourceKind::Secret) => 2,
        (_, ResourceKind::ConfigMap | ResourceKind::Secret) => 3,
        (_, k) if k.is_workload() => 4,
        _ => 5,
    }
}

/// Minimal diff between the desired set and what was observed.
pub fn plan_changes(set: &DesiredResourceSet, live: &LiveState, previous: Option<&ReconciliationState>) -> ChangePlan {
    let stack_label = set.stack.label_value();
    let mut plan = ChangePlan::default();

    for r in &set.resources {
        match live.get(&r.key) {
            None => plan.ops.push(PlannedOp { action: Action::Create, key: r.key.clone(), manifest: Some(r.manifest.clone()), diff: None }),
            // namespaces are created, never rewritten; an adopted one keeps its labels
            Some(_) if r.key.kind == ResourceKind::Namespace => plan.unchanged.push(r.key.clone()),
            Some(obj) if fingerprint_of(obj).is_some() && fingerprint_of(obj) == r.fingerprint() => plan.unchanged.push(r.key.clone()),
            Some(obj) => {
                let diff = diff_summary(&strip_noisy(r.manifest.clone()), &strip_noisy(obj.clone()));
                plan.ops.push(PlannedOp { action: Action::Update, key: r.key.clone(), manifest: Some(r.manifest.clone()), diff: Some(diff) });
            }
        }
    }

    let mut candidates: BTreeSet<&ResourceKey> = live.objects.keys().collect();
    if let Some(p) = previous {
        candidates.extend(p.applied.iter());
    }
    let mut owned_namespaces = Vec::new();
    for key in candidates.into_iter().filter(|k| !set.contains(k)) {
        match live.get(key) {
            None => {
                plan.forgotten.insert(key.clone());
            }
            Some(obj) if key.kind == ResourceKind::Namespace && !owned_by(obj, &stack_label) => {
                debug!(ns = %key.name, "leaving adopted namespace in place");
                plan.forgotten.insert(key.clone());
            }
            Some(_) if key.kind == ResourceKind::Namespace => owned_namespaces.push(key),
            Some(_) => plan.ops.push(PlannedOp { action: Action::Delete, key: key.clone(), manifest: None, diff: None }),
        }
    }

    // deleting a namespace cascades, so it only goes once nothing else lives there
    let deleted: BTreeSet<&ResourceKey> = plan.ops.iter().filter(|o| o.action == Action::Delete).map(|o| &o.key).collect();
    let mut doomed = Vec::new();
    for key in owned_namespaces {
        let remaining = live.occupants_of(&key.name).filter(|k| !deleted.contains(k)).count();
        if remaining == 0 {
            doomed.push(key.clone());
        } else {
            info!(ns = %key.name, remaining, "namespace still in use; leaving it in place");
            plan.forgotten.insert(key.clone());
        }
    }
    plan.ops.extend(doomed.into_iter().map(|key| PlannedOp { action: Action::Delete, key, manifest: None, diff: None }));

    plan.ops.sort_by(|a, b| phase(a).cmp(&phase(b)).then_with(|| a.key.cmp(&b.key)));
    plan
}

/// Run the plan in order, stopping at the first failure.
pub async fn execute<C: Cluster + ?Sized>(cluster: &C, plan: &ChangePlan) -> ApplyReport {
    let mut report = ApplyReport { dry_run: false, ops: Vec::with_capacity(plan.ops.len()) };
    let mut stopped = false;
    for op in &plan.ops {
        if stopped {
            report.ops.push(OpReport::new(op.action, op.key.clone(), OpStatus::Skipped));
            continue;
        }
        let res = match (op.action, op.manifest.as_ref()) {
            (Action::Delete, _) => cluster.delete(&op.key).await,
            (Action::Create, Some(m)) => match cluster.create(&op.key, m).await {
                // raced with another writer; converge instead of failing
                Err(ClusterError::AlreadyExists(_)) => cluster.update(&op.key, m).await,
                other => other,
            },
            (Action::Update, Some(m)) => cluster.update(&op.key, m).await,
            (_, None) => Err(ClusterError::InvalidManifest { key: op.key.to_string(), reason: "no manifest planned".into() }),
        };
        let status = match res {
            Ok(()) => {
                info!(action = %op.action, key = %op.key, "applied");
                OpStatus::Succeeded
            }
            Err(e) => {
                warn!(action = %op.action, key = %op.key, error = %e, "operation failed; skipping the rest");
                stopped = true;
                OpStatus::Failed(e.to_string())
            }
        };
        report.ops.push(OpReport::new(op.action, op.key.clone(), status));
    }
    report
}

/// Result of a dry run.
#[derive(Debug, Clone)]
pub struct Preview {
    pub plan: ChangePlan,
    pub previous: Option<ReconciliationState>,
}

/// Result of a real run.
#[derive(Debug, Clone)]
pub struct Reconciled {
    pub plan: ChangePlan,
    pub report: ApplyReport,
    pub state: ReconciliationState,
}

/// Drives one desired set against a cluster, keeping state in the backend.
pub struct Reconciler<'a, C: ?Sized> {
    cluster: &'a C,
    backend: &'a dyn Backend,
    policy: ValidationPolicy,
}

impl<'a, C: Cluster + ?Sized> Reconciler<'a, C> {
    pub fn new(cluster: &'a C, backend: &'a dyn Backend, policy: ValidationPolicy) -> Self {
        Self { cluster, backend, policy }
    }

    /// validate → observe → plan; nothing is mutated.
    pub async fn preview(&self, set: &DesiredResourceSet) -> Result<Preview, ApplyError> {
        validate(set, &self.policy)?;
        let previous = state::load(self.backend, &set.stack)?;
        let live = observe(self.cluster, set, previous.as_ref()).await.map_err(ApplyError::Observe)?;
        let plan = plan_changes(set, &live, previous.as_ref());
        info!(
            creates = plan.count(Action::Create),
            updates = plan.count(Action::Update),
            deletes = plan.count(Action::Delete),
            unchanged = plan.unchanged.len(),
            "change plan computed"
        );
        Ok(Preview { plan, previous })
    }

    /// Full reconciliation under `lease`. State is written even when an
    /// operation fails, then the failure is returned as [`ApplyError::Partial`].
    /// The lease is re-checked before the first mutation; a failed state write
    /// still hands back the per-operation report.
    pub async fn apply(&self, lease: &Lease, set: &DesiredResourceSet) -> Result<Reconciled, ApplyError> {
        let t0 = Instant::now();
        counter!("apply_attempts", 1u64);
        let Preview { plan, previous } = match self.preview(set).await {
            Ok(p) => p,
            Err(e) => {
                counter!("apply_err", 1u64);
                return Err(e);
            }
        };

        // a lease lost to expiry or takeover must not reach the cluster
        if let Err(e) = self.backend.check_lease(lease) {
            counter!("apply_err", 1u64);
            warn!(scope = %lease.scope, holder = %lease.holder, error = %e, "lease no longer held; nothing applied");
            return Err(e.into());
        }

        let report = execute(self.cluster, &plan).await;
        let previous_keys = previous.as_ref().map(|p| p.applied.clone()).unwrap_or_default();
        let applied = state::applied_keys(&previous_keys, &plan, &report);
        let outcome = if report.is_success() { RunOutcome::Converged } else { RunOutcome::Partial };
        let desired_fingerprint = set.fingerprint().unwrap_or_default();
        let mut next = state::stamp(ReconciliationState {
            format: state::STATE_FORMAT,
            serial: 0,
            run_id: state::new_run_id(),
            namespace: set.namespace.clone(),
            topology: set.topology,
            artifact: set.artifact.clone(),
            desired_fingerprint,
            applied,
            outcome,
            updated_at_ms: 0,
        });
        let serial = match state::save(self.backend, lease, &mut next) {
            Ok(serial) => serial,
            Err(source) => {
                counter!("apply_err", 1u64);
                error!(error = %source, summary = %report.summary(), "cluster changed but state not recorded");
                return Err(ApplyError::StateWrite { report, source });
            }
        };
        histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);

        if !report.is_success() {
            counter!("apply_err", 1u64);
            warn!(serial, summary = %report.summary(), "reconciliation incomplete");
            return Err(ApplyError::Partial(report));
        }
        counter!("apply_ok", 1u64);
        info!(serial, mutations = report.ops.len(), "reconciliation converged");
        Ok(Reconciled { plan, report, state: next })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_noisy_prunes_server_fields_and_fingerprint() {
        let v = serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "booker-config",
                "namespace": "bookings",
                "managedFields": [ {"manager": "keel"} ],
                "resourceVersion": "123",
                "uid": "0b1c",
                "generation": 5,
                "creationTimestamp": "2020-01-01T00:00:00Z",
                "annotations": { "keel.dev/fingerprint": "ab", "team": "x" }
            },
            "status": { "obs": true },
            "data": { "k": "v" }
        });
        let pruned = strip_noisy(v);
        let meta = pruned["metadata"].as_object().unwrap();
        for gone in ["managedFields", "resourceVersion", "uid", "generation", "creationTimestamp"] {
            assert!(!meta.contains_key(gone), "{gone}");
        }
        assert_eq!(meta["annotations"], serde_json::json!({"team": "x"}));
        assert!(pruned.get("status").is_none());
    }

    #[test]
    fn diff_summary_counts_adds_updates_removes() {
        let base = serde_json::json!({ "a": 1, "b": { "x": 1 }, "c": [1, 2, 3] });
        let target = serde_json::json!({ "a": 2, "b": { "x": 1, "y": 2 }, "c": [1, 9], "d": true });
        let s = diff_summary(&target, &base);
        // a and c[1] updated; b.y and d added; c shrank by one
        assert_eq!(s, DiffSummary { adds: 2, updates: 2, removes: 1 });
    }

    #[test]
    fn ownership_needs_both_labels() {
        let ours = serde_json::json!({"metadata": {"labels": {LABEL_MANAGED_BY: "keel", LABEL_STACK: "bookings.booker"}}});
        let adopted = serde_json::json!({"metadata": {"labels": {"team": "payments"}}});
        assert!(owned_by(&ours, "bookings.booker"));
        assert!(!owned_by(&ours, "other.stack"));
        assert!(!owned_by(&adopted, "bookings.booker"));
    }

    #[test]
    fn phases_order_namespace_first_and_last() {
        let op = |action, key| PlannedOp { action, key, manifest: None, diff: None };
        let ns = ResourceKey::namespace("bookings");
        let dep = ResourceKey::namespaced(ResourceKind::Deployment, "bookings", "booker");
        let cm = ResourceKey::namespaced(ResourceKind::ConfigMap, "bookings", "booker-config");
        assert!(phase(&op(Action::Create, ns.clone())) < phase(&op(Action::Delete, dep.clone())));
        assert!(phase(&op(Action::Delete, dep.clone())) < phase(&op(Action::Delete, cm.clone())));
        assert!(phase(&op(Action::Delete, cm.clone())) < phase(&op(Action::Create, cm)));
        assert!(phase(&op(Action::Create, dep)) < phase(&op(Action::Delete, ns)));
    }
}
