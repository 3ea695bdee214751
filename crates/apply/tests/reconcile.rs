use std::collections::BTreeSet;
use std::time::Duration;

use keel_apply::{Action, ApplyError, OpStatus, Reconciled, Reconciler, RunOutcome, ValidationPolicy};
use keel_core::{ArtifactRef, ResourceKey, ResourceKind, StackId, Topology};
use keel_kubehub::{MemoryCluster, Verb};
use keel_persist::{Backend, BackendError, MemoryBackend};
use keel_plan::{plan, ConfigPayload, DesiredResourceSet, PlanInputs};
use serde_json::json;

fn stack() -> StackId {
    StackId::new("bookings", "booker")
}

fn desired(topology: Topology, namespace: &str, tag: &str) -> DesiredResourceSet {
    desired_for("booker", stack(), topology, namespace, tag)
}

fn desired_for(service: &str, stack: StackId, topology: Topology, namespace: &str, tag: &str) -> DesiredResourceSet {
    let repo = format!("ghcr.io/acme/{service}");
    let mut i = PlanInputs::new(service, namespace, stack, ArtifactRef::new(repo, tag).unwrap(), topology);
    i.resolved = [("base_url", "https://cfg.example/x")].into_iter().collect();
    i.secrets.insert("api_key", "abc123").unwrap();
    i.config = ConfigPayload::Blob(br#"{"activities":[]}"#.to_vec());
    plan(&i).unwrap()
}

async fn run(cluster: &MemoryCluster, backend: &MemoryBackend, set: &DesiredResourceSet) -> Result<Reconciled, ApplyError> {
    let lease = backend.acquire_lock(&set.stack, "test-run", Duration::from_secs(60)).unwrap();
    let res = Reconciler::new(cluster, backend, ValidationPolicy::default()).apply(&lease, set).await;
    backend.release_lock(&lease).unwrap();
    res
}

fn workloads(cluster: &MemoryCluster) -> Vec<ResourceKey> {
    cluster.keys().into_iter().filter(|k| k.kind.is_workload()).collect()
}

#[tokio::test]
async fn second_identical_run_makes_no_mutations() {
    let cluster = MemoryCluster::new();
    let backend = MemoryBackend::new();
    let set = desired(Topology::Service, "bookings", "3f2c1ab");

    let first = run(&cluster, &backend, &set).await.unwrap();
    assert_eq!(first.report.ops.len(), 3);
    assert!(first.report.ops.iter().all(|o| o.action == Action::Create));
    assert_eq!(first.state.applied, set.keys().cloned().collect::<BTreeSet<_>>());

    cluster.reset_calls();
    let second = run(&cluster, &backend, &set).await.unwrap();
    assert!(second.plan.is_empty());
    assert_eq!(cluster.mutation_count(), 0);
    assert_eq!(second.state.serial, first.state.serial + 1);
}

#[tokio::test]
async fn new_commit_updates_only_the_workload() {
    let cluster = MemoryCluster::new();
    let backend = MemoryBackend::new();
    run(&cluster, &backend, &desired(Topology::ScheduledJob, "bookings", "3f2c1ab")).await.unwrap();

    let next = run(&cluster, &backend, &desired(Topology::ScheduledJob, "bookings", "9fceb02")).await.unwrap();
    let ops: Vec<_> = next.plan.ops.iter().map(|o| (o.action, o.key.kind)).collect();
    assert_eq!(ops, vec![(Action::Update, ResourceKind::CronJob)]);
    assert!(next.plan.ops[0].diff.as_ref().map(|d| d.updates > 0).unwrap_or(false));

    let cj = cluster.object(&ResourceKey::namespaced(ResourceKind::CronJob, "bookings", "booker")).unwrap();
    let image = cj.pointer("/spec/jobTemplate/spec/template/spec/containers/0/image").unwrap();
    assert_eq!(image, "ghcr.io/acme/booker:9fceb02");
}

#[tokio::test]
async fn topology_switch_leaves_exactly_one_workload() {
    let cluster = MemoryCluster::new();
    let backend = MemoryBackend::new();
    run(&cluster, &backend, &desired(Topology::Service, "bookings", "3f2c1ab")).await.unwrap();
    assert_eq!(workloads(&cluster), vec![ResourceKey::namespaced(ResourceKind::Deployment, "bookings", "booker")]);

    let switched = run(&cluster, &backend, &desired(Topology::ScheduledJob, "bookings", "3f2c1ab")).await.unwrap();
    // the old workload goes before anything new is written
    assert_eq!(switched.plan.ops[0].action, Action::Delete);
    assert_eq!(switched.plan.ops[0].key.kind, ResourceKind::Deployment);
    assert_eq!(workloads(&cluster), vec![ResourceKey::namespaced(ResourceKind::CronJob, "bookings", "booker")]);
    assert!(cluster.object(&ResourceKey::namespaced(ResourceKind::ConfigMap, "bookings", "booker-config")).is_some());

    run(&cluster, &backend, &desired(Topology::Service, "bookings", "3f2c1ab")).await.unwrap();
    assert_eq!(workloads(&cluster), vec![ResourceKey::namespaced(ResourceKind::Deployment, "bookings", "booker")]);
    assert!(cluster.object(&ResourceKey::namespaced(ResourceKind::ConfigMap, "bookings", "booker-config")).is_none());
}

#[tokio::test]
async fn namespace_move_removes_owned_namespace_last() {
    let cluster = MemoryCluster::new();
    let backend = MemoryBackend::new();
    run(&cluster, &backend, &desired(Topology::Service, "bookings", "3f2c1ab")).await.unwrap();

    let moved = run(&cluster, &backend, &desired(Topology::Service, "bookings-v2", "3f2c1ab")).await.unwrap();
    let first = moved.plan.ops.first().unwrap();
    let last = moved.plan.ops.last().unwrap();
    assert_eq!((first.action, first.key.clone()), (Action::Create, ResourceKey::namespace("bookings-v2")));
    assert_eq!((last.action, last.key.clone()), (Action::Delete, ResourceKey::namespace("bookings")));
    assert!(cluster.object(&ResourceKey::namespace("bookings")).is_none());
    assert!(cluster.keys().iter().all(|k| k.scope() == Some("bookings-v2")));
}

#[tokio::test]
async fn adopted_namespace_is_never_deleted() {
    let cluster = MemoryCluster::new();
    let backend = MemoryBackend::new();
    cluster.seed(
        ResourceKey::namespace("shared"),
        json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "shared", "labels": {"team": "platform"}}}),
    );

    let first = run(&cluster, &backend, &desired(Topology::Service, "shared", "3f2c1ab")).await.unwrap();
    assert!(first.plan.ops.iter().all(|o| o.key.kind != ResourceKind::Namespace));
    assert!(first.state.applied.contains(&ResourceKey::namespace("shared")));

    run(&cluster, &backend, &desired(Topology::Service, "bookings", "3f2c1ab")).await.unwrap();
    let ns = cluster.object(&ResourceKey::namespace("shared")).unwrap();
    assert_eq!(ns.pointer("/metadata/labels/team").unwrap(), "platform");
    assert!(cluster.object(&ResourceKey::namespaced(ResourceKind::Deployment, "shared", "booker")).is_none());
}

#[tokio::test]
async fn failure_stops_execution_and_state_keeps_what_was_created() {
    let cluster = MemoryCluster::new();
    let backend = MemoryBackend::new();
    cluster.fail_on(Verb::Create, ResourceKind::CronJob, "admission webhook denied");

    let err = run(&cluster, &backend, &desired(Topology::ScheduledJob, "bookings", "3f2c1ab")).await.unwrap_err();
    let report = match err {
        ApplyError::Partial(report) => report,
        other => panic!("expected partial failure, got {other}"),
    };
    let kinds: Vec<_> = report.ops.iter().map(|o| o.key.kind).collect();
    assert_eq!(kinds, vec![ResourceKind::Namespace, ResourceKind::ConfigMap, ResourceKind::Secret, ResourceKind::CronJob]);
    assert!(report.ops[..3].iter().all(|o| o.status == OpStatus::Succeeded));
    assert!(matches!(report.ops[3].status, OpStatus::Failed(_)));
    assert!(report.summary().contains("admission webhook denied"));

    let state = keel_apply::state::load(&backend, &stack()).unwrap().unwrap();
    assert_eq!(state.outcome, RunOutcome::Partial);
    assert_eq!(state.applied.len(), 3);
    assert!(state.applied.contains(&ResourceKey::namespaced(ResourceKind::ConfigMap, "bookings", "booker-config")));

    cluster.clear_failures();
    cluster.reset_calls();
    let healed = run(&cluster, &backend, &desired(Topology::ScheduledJob, "bookings", "3f2c1ab")).await.unwrap();
    assert_eq!(cluster.mutation_count(), 1);
    assert_eq!(healed.state.outcome, RunOutcome::Converged);
}

#[tokio::test]
async fn skipped_operations_follow_a_failure() {
    let cluster = MemoryCluster::new();
    let backend = MemoryBackend::new();
    cluster.fail_on(Verb::Create, ResourceKind::Secret, "quota exceeded");
    let err = run(&cluster, &backend, &desired(Topology::Service, "bookings", "3f2c1ab")).await.unwrap_err();
    let ApplyError::Partial(report) = err else { panic!("expected partial failure") };
    assert_eq!(report.ops.last().map(|o| (&o.status, o.key.kind)), Some((&OpStatus::Skipped, ResourceKind::Deployment)));
    assert!(cluster.object(&ResourceKey::namespaced(ResourceKind::Deployment, "bookings", "booker")).is_none());
}

#[tokio::test]
async fn preview_observes_without_mutating() {
    let cluster = MemoryCluster::new();
    let backend = MemoryBackend::new();
    let set = desired(Topology::Service, "bookings", "3f2c1ab");
    let preview = Reconciler::new(&cluster, &backend, ValidationPolicy::default()).preview(&set).await.unwrap();
    assert_eq!(preview.plan.count(Action::Create), 3);
    assert!(preview.previous.is_none());
    assert_eq!(cluster.mutation_count(), 0);
    assert!(backend.get_state(&stack()).unwrap().is_none());
}

#[tokio::test]
async fn invalid_set_touches_nothing() {
    let cluster = MemoryCluster::new();
    let backend = MemoryBackend::new();
    let set = desired(Topology::Service, "bookings", "3f2c1ab");
    let lease = backend.acquire_lock(&stack(), "t", Duration::from_secs(60)).unwrap();
    let policy = ValidationPolicy { required_secret_keys: vec!["db_password".into()] };
    let err = Reconciler::new(&cluster, &backend, policy).apply(&lease, &set).await.unwrap_err();
    assert!(matches!(err, ApplyError::Invalid(_)), "{err}");
    assert!(cluster.calls().is_empty());
}

#[tokio::test]
async fn namespace_still_used_by_another_stack_survives_a_move() {
    let cluster = MemoryCluster::new();
    let backend = MemoryBackend::new();
    let alpha = |ns: &str| desired_for("alpha", StackId::new("apps", "alpha"), Topology::Service, ns, "3f2c1ab");
    let beta = |ns: &str| desired_for("beta", StackId::new("apps", "beta"), Topology::Service, ns, "3f2c1ab");

    let first = run(&cluster, &backend, &alpha("shared")).await.unwrap();
    assert!(first.plan.ops.iter().any(|o| (o.action, &o.key) == (Action::Create, &ResourceKey::namespace("shared"))));
    run(&cluster, &backend, &beta("shared")).await.unwrap();

    let moved = run(&cluster, &backend, &alpha("alpha-only")).await.unwrap();
    assert!(moved.plan.ops.iter().all(|o| o.key != ResourceKey::namespace("shared")));
    assert!(moved.plan.forgotten.contains(&ResourceKey::namespace("shared")));
    assert!(!moved.state.applied.contains(&ResourceKey::namespace("shared")));
    assert!(cluster.object(&ResourceKey::namespace("shared")).is_some());
    assert!(cluster.object(&ResourceKey::namespaced(ResourceKind::Deployment, "shared", "beta")).is_some());
    assert!(cluster.object(&ResourceKey::namespaced(ResourceKind::Deployment, "shared", "alpha")).is_none());

    // once the other stack has left, the namespace alpha created is cleaned up
    run(&cluster, &backend, &beta("beta-only")).await.unwrap();
    assert!(cluster.object(&ResourceKey::namespace("shared")).is_some());
    let cleanup = run(&cluster, &backend, &alpha("alpha-only")).await.unwrap();
    let ops: Vec<_> = cleanup.plan.ops.iter().map(|o| (o.action, o.key.clone())).collect();
    assert_eq!(ops, vec![(Action::Delete, ResourceKey::namespace("shared"))]);
    assert!(cluster.object(&ResourceKey::namespace("shared")).is_none());
}

#[tokio::test]
async fn lease_taken_over_before_apply_mutates_nothing() {
    let cluster = MemoryCluster::new();
    let backend = MemoryBackend::new();
    let set = desired(Topology::Service, "bookings", "3f2c1ab");
    let stale = backend.acquire_lock(&stack(), "slow-run", Duration::from_millis(0)).unwrap();
    backend.acquire_lock(&stack(), "other-run", Duration::from_secs(60)).unwrap();

    let err = Reconciler::new(&cluster, &backend, ValidationPolicy::default()).apply(&stale, &set).await.unwrap_err();
    assert!(matches!(err, ApplyError::Backend(BackendError::LockNotHeld(_))), "{err}");
    assert_eq!(cluster.mutation_count(), 0);
    assert!(backend.get_state(&stack()).unwrap().is_none());
    assert_eq!(backend.lock_info(&stack()).unwrap().map(|l| l.holder), Some("other-run".to_string()));
}
