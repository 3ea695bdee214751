//! Keel release pipeline.
//!
//! Sequences build → lock → resolve → plan → reconcile → publish for one
//! stack. The lock is taken after the image exists and is released on every
//! exit path. Frontends (the CLI) only talk to [`Pipeline`].

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use keel_apply::{ApplyError, ApplyReport, ChangePlan, Preview, ReconciliationState, Reconciler, ValidationError};
use keel_build::{ArtifactBuilder, BuildError, BuildRequest, RegistryCredentials};
use keel_core::{ArtifactRef, StackId, Topology};
use keel_kubehub::{Cluster, ClusterError};
use keel_persist::{Backend, BackendError, Lease, LockInfo};
use keel_plan::{ConfigPayload, DesiredResourceSet, PlanError, PlanInputs, SecretPayload};
use keel_resolve::{OutputSource, ResolveError, ResolvedConfig, Resolver, DEFAULT_LOCATION};
use metrics::{counter, histogram};
use serde::Serialize;
use tracing::{error, info, warn};

pub mod config;
pub mod lock;

pub use config::{ConfigError, ReleaseConfig, DEFAULT_CONFIG_PATH};
pub use lock::LockRetry;

/// Outputs every successful release publishes under its own stack.
pub const OUTPUT_IMAGE: &str = "image";
pub const OUTPUT_NAMESPACE: &str = "namespace";
pub const OUTPUT_WORKLOAD_KIND: &str = "workload_kind";
pub const OUTPUT_WORKLOAD_NAME: &str = "workload_name";

/// Why the desired set was refused before anything was applied.
#[derive(Debug, thiserror::Error)]
pub enum DesiredStateError {
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

#[derive(Debug, thiserror::Error)]
pub enum ReleaseError {
    #[error("build failed: {0}")]
    BuildFailure(#[from] BuildError),
    #[error("configuration unavailable: {0}")]
    ConfigurationUnavailable(#[from] ResolveError),
    #[error("invalid desired state: {0}")]
    InvalidDesiredState(#[from] DesiredStateError),
    #[error("apply partially failed: {}", .0.summary())]
    ApplyPartialFailure(ApplyReport),
    #[error("lock for {scope} still held by {holder} after {attempts} attempts")]
    LockContention { scope: StackId, holder: String, attempts: u32 },
    #[error("cluster: {0}")]
    Cluster(#[from] ClusterError),
    #[error("backend: {0}")]
    Backend(#[from] BackendError),
    /// The cluster was changed but the state write failed; carries what was done.
    #[error("state not recorded after apply ({}): {source}", .report.summary())]
    StateWrite { report: ApplyReport, #[source] source: BackendError },
    #[error("config: {0}")]
    Config(#[from] ConfigError),
}

impl ReleaseError {
    /// Process exit status for this error class.
    pub fn exit_code(&self) -> i32 {
        match self {
            ReleaseError::Config(_) => 2,
            ReleaseError::BuildFailure(_) => 10,
            ReleaseError::ConfigurationUnavailable(_) => 11,
            ReleaseError::InvalidDesiredState(_) => 12,
            ReleaseError::ApplyPartialFailure(_) => 13,
            ReleaseError::LockContention { .. } => 14,
            ReleaseError::Cluster(_) => 15,
            ReleaseError::Backend(_) | ReleaseError::StateWrite { .. } => 16,
        }
    }

    /// Short class name for logs and JSON output.
    pub fn class(&self) -> &'static str {
        match self {
            ReleaseError::Config(_) => "Config",
            ReleaseError::BuildFailure(_) => "BuildFailure",
            ReleaseError::ConfigurationUnavailable(_) => "ConfigurationUnavailable",
            ReleaseError::InvalidDesiredState(_) => "InvalidDesiredState",
            ReleaseError::ApplyPartialFailure(_) => "ApplyPartialFailure",
            ReleaseError::LockContention { .. } => "LockContention",
            ReleaseError::Cluster(_) => "Cluster",
            ReleaseError::Backend(_) | ReleaseError::StateWrite { .. } => "Backend",
        }
    }

    /// Per-operation report, when the cluster was touched before the failure.
    pub fn report(&self) -> Option<&ApplyReport> {
        match self {
            ReleaseError::ApplyPartialFailure(report) | ReleaseError::StateWrite { report, .. } => Some(report),
            _ => None,
        }
    }
}

impl From<ApplyError> for ReleaseError {
    fn from(e: ApplyError) -> Self {
        match e {
            ApplyError::Invalid(v) => ReleaseError::InvalidDesiredState(v.into()),
            ApplyError::Observe(c) => ReleaseError::Cluster(c),
            ApplyError::Backend(b) => ReleaseError::Backend(b),
            ApplyError::Partial(report) => ReleaseError::ApplyPartialFailure(report),
            ApplyError::StateWrite { report, source } => ReleaseError::StateWrite { report, source },
        }
    }
}

impl From<PlanError> for ReleaseError {
    fn from(e: PlanError) -> Self {
        ReleaseError::InvalidDesiredState(e.into())
    }
}

pub type ReleaseResult<T> = Result<T, ReleaseError>;

/// Invocation inputs of one release.
#[derive(Debug, Clone, Default)]
pub struct ReleaseRequest {
    /// Commit identifier; becomes the image tag.
    pub commit: String,
    pub credentials: Option<RegistryCredentials>,
    /// Deploy this image instead of building one.
    pub prebuilt: Option<ArtifactRef>,
    /// Pipeline-supplied secret values; win over resolved outputs.
    pub secrets: SecretPayload,
}

impl ReleaseRequest {
    pub fn new(commit: impl Into<String>) -> Self {
        Self { commit: commit.into(), ..Default::default() }
    }

    pub fn prebuilt(mut self, artifact: ArtifactRef) -> Self {
        self.prebuilt = Some(artifact);
        self
    }

    pub fn secrets(mut self, secrets: SecretPayload) -> Self {
        self.secrets = secrets;
        self
    }
}

/// Result of a converged release.
#[derive(Debug, Clone, Serialize)]
pub struct Released {
    pub artifact: ArtifactRef,
    pub plan: ChangePlan,
    pub report: ApplyReport,
    pub state: ReconciliationState,
    pub outputs: BTreeMap<String, String>,
}

/// Result of a dry run.
#[derive(Debug, Clone, Serialize)]
pub struct Planned {
    pub artifact: ArtifactRef,
    pub desired_fingerprint: String,
    pub plan: ChangePlan,
    pub previous_serial: Option<u64>,
}

pub struct Pipeline {
    config: ReleaseConfig,
    stack: StackId,
    backend: Arc<dyn Backend>,
    locations: BTreeMap<String, Arc<dyn Backend>>,
    builder: Arc<dyn ArtifactBuilder>,
}

impl Pipeline {
    /// `backend` holds this stack's state, lock and outputs and is also the
    /// `default` resolver location.
    pub fn new(config: ReleaseConfig, backend: Arc<dyn Backend>, builder: Arc<dyn ArtifactBuilder>) -> ReleaseResult<Self> {
        config.check()?;
        let stack = config.stack_id()?;
        Ok(Self { config, stack, backend, locations: BTreeMap::new(), builder })
    }

    /// Register an extra backend location for remote outputs.
    pub fn with_location(mut self, name: impl Into<String>, backend: Arc<dyn Backend>) -> Self {
        self.locations.insert(name.into(), backend);
        self
    }

    pub fn config(&self) -> &ReleaseConfig {
        &self.config
    }

    pub fn stack(&self) -> &StackId {
        &self.stack
    }

    fn location(&self, name: &str) -> ReleaseResult<&Arc<dyn Backend>> {
        if name == DEFAULT_LOCATION {
            return Ok(&self.backend);
        }
        self.locations.get(name).ok_or_else(|| ResolveError::UnknownBackend(name.to_string()).into())
    }

    fn resolver(&self) -> Resolver {
        let own: Arc<dyn OutputSource> = Arc::new(self.backend.clone());
        self.locations
            .iter()
            .fold(Resolver::with_default(own), |r, (name, b)| r.location(name.clone(), Arc::new(b.clone()) as Arc<dyn OutputSource>))
    }

    /// Resolve every configured remote output. Each call reads the backend again.
    pub fn resolve(&self) -> ReleaseResult<ResolvedConfig> {
        let resolved = self.resolver().resolve(&self.config.outputs)?;
        Ok(resolved)
    }

    /// Build and push, or take the pre-built reference.
    pub async fn artifact(&self, req: &ReleaseRequest) -> ReleaseResult<ArtifactRef> {
        if let Some(a) = &req.prebuilt {
            if a.tag != req.commit && !req.commit.is_empty() {
                warn!(image = %a, commit = %req.commit, "pre-built image tag differs from commit");
            }
            info!(image = %a, "build skipped; using pre-built image");
            return Ok(a.clone());
        }
        let build = BuildRequest {
            context: self.config.context.clone(),
            dockerfile: self.config.dockerfile.clone(),
            repository: self.config.repository.clone(),
            commit: req.commit.clone(),
            credentials: req.credentials.clone(),
            platform: self.config.platform.clone(),
        };
        let t0 = Instant::now();
        let artifact = self.builder.build_and_push(&build).await?;
        histogram!("build_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(image = %artifact, "image published");
        Ok(artifact)
    }

    fn config_payload(&self) -> ReleaseResult<ConfigPayload> {
        match &self.config.config_payload {
            None => Ok(ConfigPayload::Empty),
            Some(path) => {
                let payload = ConfigPayload::load(path).map_err(ConfigError::Payload)?;
                payload.check_size()?;
                Ok(payload)
            }
        }
    }

    /// Resolve and plan. Touches neither the lock nor the cluster.
    pub fn desired(&self, artifact: &ArtifactRef, secrets: &SecretPayload) -> ReleaseResult<DesiredResourceSet> {
        let resolved = self.resolve()?;
        self.plan_with(artifact, resolved, secrets)
    }

    fn plan_with(&self, artifact: &ArtifactRef, resolved: ResolvedConfig, secrets: &SecretPayload) -> ReleaseResult<DesiredResourceSet> {
        let mut inputs = PlanInputs::new(&self.config.service, &self.config.namespace, self.stack.clone(), artifact.clone(), self.config.topology);
        inputs.resolved = resolved;
        inputs.secrets = secrets.clone();
        inputs.schedule = self.config.schedule.clone();
        if self.config.topology == Topology::ScheduledJob {
            inputs.config = self.config_payload()?;
        }
        Ok(keel_plan::plan(&inputs)?)
    }

    /// Dry run: everything up to the change plan. No build, no lock, no mutation.
    pub async fn plan<C: Cluster + ?Sized>(&self, cluster: &C, commit: &str, secrets: &SecretPayload) -> ReleaseResult<Planned> {
        let artifact = ArtifactRef::new(&self.config.repository, commit).map_err(|e| ConfigError::Invalid(format!("commit: {e}")))?;
        let set = self.desired(&artifact, secrets)?;
        let Preview { plan, previous } =
            Reconciler::new(cluster, self.backend.as_ref(), self.config.validation_policy()).preview(&set).await?;
        Ok(Planned {
            artifact,
            desired_fingerprint: set.fingerprint()?,
            plan,
            previous_serial: previous.map(|p| p.serial),
        })
    }

    /// The full run. The lock is taken after the image exists and released on every path.
    pub async fn release<C: Cluster + ?Sized>(&self, cluster: &C, req: &ReleaseRequest) -> ReleaseResult<Released> {
        let t0 = Instant::now();
        counter!("release_attempts", 1u64);
        let res = self.release_inner(cluster, req).await;
        histogram!("release_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match &res {
            Ok(r) => {
                counter!("release_ok", 1u64);
                info!(stack = %self.stack, image = %r.artifact, serial = r.state.serial, "release converged");
            }
            Err(e) => {
                counter!("release_err", 1u64);
                error!(stack = %self.stack, class = e.class(), error = %e, "release failed");
            }
        }
        res
    }

    async fn release_inner<C: Cluster + ?Sized>(&self, cluster: &C, req: &ReleaseRequest) -> ReleaseResult<Released> {
        let artifact = self.artifact(req).await?;
        let holder = format!("{}/{}", req.commit, uuid::Uuid::new_v4());
        let lease = self.lock_in(&self.backend, &self.stack, &holder).await?;
        let res = self.release_locked(cluster, &lease, artifact, &req.secrets).await;
        self.unlock_lease(self.backend.as_ref(), &lease, res)
    }

    async fn release_locked<C: Cluster + ?Sized>(
        &self,
        cluster: &C,
        lease: &Lease,
        artifact: ArtifactRef,
        secrets: &SecretPayload,
    ) -> ReleaseResult<Released> {
        let set = self.desired(&artifact, secrets)?;
        let reconciled =
            Reconciler::new(cluster, self.backend.as_ref(), self.config.validation_policy()).apply(lease, &set).await?;
        let outputs = published_outputs(&set);
        self.backend.put_outputs(lease, &outputs)?;
        info!(stack = %self.stack, outputs = outputs.len(), "stack outputs published");
        Ok(Released { artifact, plan: reconciled.plan, report: reconciled.report, state: reconciled.state, outputs })
    }

    async fn lock_in(&self, backend: &Arc<dyn Backend>, scope: &StackId, holder: &str) -> ReleaseResult<Lease> {
        lock::acquire(backend, scope, holder, self.config.lock.ttl(), self.config.lock.retry()).await.map_err(|e| match e {
            lock::AcquireError::Contended { holder, attempts } => ReleaseError::LockContention { scope: scope.clone(), holder, attempts },
            lock::AcquireError::Backend(b) => ReleaseError::Backend(b),
        })
    }

    fn unlock_lease<T>(&self, backend: &dyn Backend, lease: &Lease, res: ReleaseResult<T>) -> ReleaseResult<T> {
        match (backend.release_lock(lease), res) {
            (Ok(()), res) => res,
            (Err(e), Ok(_)) => {
                error!(scope = %lease.scope, error = %e, "lock release failed");
                Err(e.into())
            }
            (Err(e), Err(orig)) => {
                warn!(scope = %lease.scope, error = %e, "lock release failed after an earlier error");
                Err(orig)
            }
        }
    }

    /// Last persisted reconciliation state of this stack.
    pub fn state(&self) -> ReleaseResult<Option<ReconciliationState>> {
        Ok(keel_apply::state::load(self.backend.as_ref(), &self.stack)?)
    }

    /// Outputs of any stack in a named backend location.
    pub fn outputs(&self, location: &str, stack: &StackId) -> ReleaseResult<Option<BTreeMap<String, String>>> {
        Ok(self.location(location)?.get_outputs(stack)?)
    }

    /// Merge `values` into a stack's outputs under that stack's lock.
    pub async fn set_outputs(&self, location: &str, stack: &StackId, values: BTreeMap<String, String>) -> ReleaseResult<BTreeMap<String, String>> {
        let backend = self.location(location)?.clone();
        let holder = format!("outputs/{}", uuid::Uuid::new_v4());
        let lease = self.lock_in(&backend, stack, &holder).await?;
        let res = (|| -> ReleaseResult<BTreeMap<String, String>> {
            let mut merged = backend.get_outputs(stack)?.unwrap_or_default();
            merged.extend(values);
            backend.put_outputs(&lease, &merged)?;
            Ok(merged)
        })();
        let merged = self.unlock_lease(backend.as_ref(), &lease, res)?;
        info!(stack = %stack, location, keys = merged.len(), "outputs written");
        Ok(merged)
    }

    pub fn lock_info(&self) -> ReleaseResult<Option<LockInfo>> {
        Ok(self.backend.lock_info(&self.stack)?)
    }

    /// Operator escape hatch for a lock left by a crashed run.
    pub fn force_unlock(&self) -> ReleaseResult<Option<LockInfo>> {
        let removed = self.backend.force_unlock(&self.stack)?;
        match &removed {
            Some(l) => warn!(stack = %self.stack, holder = %l.holder, "lock force-released"),
            None => info!(stack = %self.stack, "no lock held"),
        }
        Ok(removed)
    }
}

/// What this stack exposes to others after converging.
pub fn published_outputs(set: &DesiredResourceSet) -> BTreeMap<String, String> {
    let naming = set.naming();
    BTreeMap::from([
        (OUTPUT_IMAGE.to_string(), set.artifact.image()),
        (OUTPUT_NAMESPACE.to_string(), set.namespace.clone()),
        (OUTPUT_WORKLOAD_KIND.to_string(), set.topology.workload_kind().kind().to_string()),
        (OUTPUT_WORKLOAD_NAME.to_string(), naming.workload_name().to_string()),
    ])
}
