//! `keel.yaml`: what to build, where it runs, and which remote outputs it needs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use keel_apply::ValidationPolicy;
use keel_core::{is_dns1123_label, StackId, Topology};
use keel_plan::{valid_key, DEFAULT_SCHEDULE};
use keel_resolve::{OutputRequest, DEFAULT_LOCATION};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::lock::LockRetry;

pub const DEFAULT_CONFIG_PATH: &str = "keel.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io { path: PathBuf, #[source] source: std::io::Error },
    #[error("parsing config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("{var}={value:?} is not valid")]
    Env { var: &'static str, value: String },
    #[error("config payload: {0}")]
    Payload(#[source] keel_plan::PlanError),
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseConfig {
    /// Logical service name; every resource name derives from it.
    pub service: String,
    /// Target namespace.
    pub namespace: String,
    /// This stack in the shared backend (`namespace/stack`); defaults to `<namespace>/<service>`.
    #[serde(default)]
    pub stack: Option<String>,
    /// Registry repository without tag.
    pub repository: String,
    #[serde(default = "default_context")]
    pub context: PathBuf,
    #[serde(default)]
    pub dockerfile: Option<PathBuf>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub topology: Topology,
    #[serde(default = "default_schedule")]
    pub schedule: String,
    /// File or directory mounted into the scheduled job.
    #[serde(default)]
    pub config_payload: Option<PathBuf>,
    /// Remote outputs that feed the secret object.
    #[serde(default)]
    pub outputs: Vec<OutputRequest>,
    /// Extra backend locations by name (SQLite paths). `default` is this stack's own backend.
    #[serde(default)]
    pub backends: BTreeMap<String, String>,
    #[serde(default)]
    pub required_secrets: RequiredSecrets,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default)]
    pub lock: LockSettings,
}

/// Secret keys each topology refuses to run without.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RequiredSecrets {
    #[serde(default)]
    pub service: Vec<String>,
    #[serde(default)]
    pub scheduled_job: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeouts {
    #[serde(default = "default_cluster_secs")]
    pub cluster_secs: u64,
    #[serde(default = "default_backend_secs")]
    pub backend_secs: u64,
    #[serde(default = "default_build_secs")]
    pub build_secs: u64,
    #[serde(default = "default_push_secs")]
    pub push_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            cluster_secs: default_cluster_secs(),
            backend_secs: default_backend_secs(),
            build_secs: default_build_secs(),
            push_secs: default_push_secs(),
        }
    }
}

impl Timeouts {
    pub fn cluster(&self) -> Duration {
        Duration::from_secs(self.cluster_secs)
    }
    pub fn backend(&self) -> Duration {
        Duration::from_secs(self.backend_secs)
    }
    pub fn build(&self) -> Duration {
        Duration::from_secs(self.build_secs)
    }
    pub fn push(&self) -> Duration {
        Duration::from_secs(self.push_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockSettings {
    /// Lease lifetime; an expired lease may be taken over.
    #[serde(default = "default_lock_ttl_secs")]
    pub ttl_secs: u64,
    /// Extra attempts after the first contended one.
    #[serde(default = "default_lock_retries")]
    pub retries: u32,
    #[serde(default = "default_lock_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self { ttl_secs: default_lock_ttl_secs(), retries: default_lock_retries(), backoff_ms: default_lock_backoff_ms() }
    }
}

impl LockSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn retry(&self) -> LockRetry {
        LockRetry::new(self.retries, Duration::from_millis(self.backoff_ms))
    }
}

fn default_context() -> PathBuf {
    PathBuf::from(".")
}
fn default_schedule() -> String {
    DEFAULT_SCHEDULE.to_string()
}
fn default_cluster_secs() -> u64 {
    60
}
fn default_backend_secs() -> u64 {
    30
}
fn default_build_secs() -> u64 {
    900
}
fn default_push_secs() -> u64 {
    300
}
fn default_lock_ttl_secs() -> u64 {
    1800
}
fn default_lock_retries() -> u32 {
    5
}
fn default_lock_backoff_ms() -> u64 {
    1000
}

impl ReleaseConfig {
    /// Minimal config; everything else takes its default.
    pub fn new(service: impl Into<String>, namespace: impl Into<String>, repository: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            namespace: namespace.into(),
            stack: None,
            repository: repository.into(),
            context: default_context(),
            dockerfile: None,
            platform: None,
            topology: Topology::default(),
            schedule: default_schedule(),
            config_payload: None,
            outputs: Vec::new(),
            backends: BTreeMap::new(),
            required_secrets: RequiredSecrets::default(),
            timeouts: Timeouts::default(),
            lock: LockSettings::default(),
        }
    }

    /// Read `path`, apply `KEEL_*` overrides and check the result.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        let mut cfg = Self::from_yaml(&raw)?;
        cfg.apply_env(|k| std::env::var(k).ok())?;
        cfg.check()?;
        debug!(path = %path.display(), service = %cfg.service, ns = %cfg.namespace, "config loaded");
        Ok(cfg)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Environment overrides for the tuning knobs. `lookup` is `std::env::var` outside tests.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("KEEL_NAMESPACE") {
            self.namespace = v;
        }
        if let Some(v) = lookup("KEEL_REPOSITORY") {
            self.repository = v;
        }
        if let Some(v) = lookup("KEEL_TOPOLOGY") {
            self.topology = v.parse().map_err(|_| ConfigError::Env { var: "KEEL_TOPOLOGY", value: v.clone() })?;
        }
        if let Some(v) = lookup("KEEL_SCHEDULE") {
            self.schedule = v;
        }
        env_num(&lookup, "KEEL_CLUSTER_TIMEOUT_SECS", &mut self.timeouts.cluster_secs)?;
        env_num(&lookup, "KEEL_BACKEND_TIMEOUT_SECS", &mut self.timeouts.backend_secs)?;
        env_num(&lookup, "KEEL_BUILD_TIMEOUT_SECS", &mut self.timeouts.build_secs)?;
        env_num(&lookup, "KEEL_PUSH_TIMEOUT_SECS", &mut self.timeouts.push_secs)?;
        env_num(&lookup, "KEEL_LOCK_TTL_SECS", &mut self.lock.ttl_secs)?;
        env_num(&lookup, "KEEL_LOCK_RETRIES", &mut self.lock.retries)?;
        env_num(&lookup, "KEEL_LOCK_BACKOFF_MS", &mut self.lock.backoff_ms)?;
        Ok(())
    }

    /// Structural checks that need no backend or cluster.
    pub fn check(&self) -> Result<(), ConfigError> {
        if !is_dns1123_label(&self.service) {
            return Err(ConfigError::Invalid(format!("service {:?} is not a DNS-1123 label", self.service)));
        }
        if !is_dns1123_label(&self.namespace) {
            return Err(ConfigError::Invalid(format!("namespace {:?} is not a DNS-1123 label", self.namespace)));
        }
        if self.repository.trim().is_empty() {
            return Err(ConfigError::Invalid("repository is empty".into()));
        }
        self.stack_id()?;
        if self.backends.contains_key(DEFAULT_LOCATION) {
            return Err(ConfigError::Invalid(format!("backend location {DEFAULT_LOCATION:?} is reserved for this stack")));
        }
        for req in &self.outputs {
            let loc = req.location();
            if loc != DEFAULT_LOCATION && !self.backends.contains_key(loc) {
                return Err(ConfigError::Invalid(format!("output {} of {} names unknown backend {loc:?}", req.output, req.stack)));
            }
            if !valid_key(req.key()) {
                return Err(ConfigError::Invalid(format!("output {} of {} exposes {:?}, not a valid secret key", req.output, req.stack, req.key())));
            }
        }
        if self.lock.ttl_secs == 0 {
            return Err(ConfigError::Invalid("lock.ttl_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn stack_id(&self) -> Result<StackId, ConfigError> {
        match &self.stack {
            Some(s) => s.parse().map_err(|e| ConfigError::Invalid(format!("stack: {e}"))),
            None => Ok(StackId::new(&self.namespace, &self.service)),
        }
    }

    /// Validation policy for the configured topology.
    pub fn validation_policy(&self) -> ValidationPolicy {
        let keys = match self.topology {
            Topology::Service => &self.required_secrets.service,
            Topology::ScheduledJob => &self.required_secrets.scheduled_job,
        };
        ValidationPolicy { required_secret_keys: keys.clone() }
    }
}

fn env_num<F, T>(lookup: &F, var: &'static str, slot: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    if let Some(v) = lookup(var) {
        *slot = v.trim().parse().map_err(|_| ConfigError::Env { var, value: v.clone() })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
service: booker
namespace: bookings
repository: ghcr.io/acme/booker
topology: scheduled-job
config_payload: assets
outputs:
  - namespace: platform
    stack: config-api
    output: base_url
  - backend: shared
    namespace: platform
    stack: auth
    output: client_key
    as: api_key
backends:
  shared: /var/lib/keel/shared.db
required_secrets:
  scheduled-job: [api_key]
lock:
  retries: 2
"#;

    #[test]
    fn sample_parses_with_defaults() {
        let cfg = ReleaseConfig::from_yaml(SAMPLE).unwrap();
        cfg.check().unwrap();
        assert_eq!(cfg.topology, Topology::ScheduledJob);
        assert_eq!(cfg.schedule, DEFAULT_SCHEDULE);
        assert_eq!(cfg.stack_id().unwrap(), StackId::new("bookings", "booker"));
        assert_eq!(cfg.outputs[1].key(), "api_key");
        assert_eq!(cfg.outputs[1].stack, StackId::new("platform", "auth"));
        assert_eq!(cfg.outputs[0].location(), DEFAULT_LOCATION);
        assert_eq!(cfg.lock.retries, 2);
        assert_eq!(cfg.lock.backoff_ms, 1000);
        assert_eq!(cfg.timeouts.cluster(), Duration::from_secs(60));
        assert_eq!(cfg.validation_policy().required_secret_keys, vec!["api_key".to_string()]);
    }

    #[test]
    fn env_overrides_tuning_knobs() {
        let mut cfg = ReleaseConfig::from_yaml(SAMPLE).unwrap();
        let env: BTreeMap<&str, &str> = [("KEEL_TOPOLOGY", "service"), ("KEEL_LOCK_RETRIES", "7"), ("KEEL_CLUSTER_TIMEOUT_SECS", "5")].into();
        cfg.apply_env(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.topology, Topology::Service);
        assert_eq!(cfg.lock.retries, 7);
        assert_eq!(cfg.timeouts.cluster_secs, 5);
        assert!(cfg.validation_policy().required_secret_keys.is_empty());

        let err = cfg.apply_env(|k| (k == "KEEL_LOCK_TTL_SECS").then(|| "soon".to_string())).unwrap_err();
        assert!(matches!(err, ConfigError::Env { var: "KEEL_LOCK_TTL_SECS", .. }));
    }

    #[test]
    fn unknown_backend_location_is_rejected() {
        let mut cfg = ReleaseConfig::from_yaml(SAMPLE).unwrap();
        cfg.backends.clear();
        assert!(matches!(cfg.check(), Err(ConfigError::Invalid(m)) if m.contains("shared")));
    }

    #[test]
    fn output_exposed_under_a_bad_key_is_rejected() {
        let mut cfg = ReleaseConfig::new("booker", "bookings", "ghcr.io/acme/booker");
        cfg.outputs = vec![OutputRequest::new(StackId::new("platform", "config-api"), "url").alias("base url/x")];
        assert!(matches!(cfg.check(), Err(ConfigError::Invalid(m)) if m.contains("base url/x")));
        cfg.outputs = vec![OutputRequest::new(StackId::new("platform", "config-api"), "url").alias("base_url")];
        cfg.check().unwrap();
    }

    #[test]
    fn explicit_stack_must_be_namespaced() {
        let mut cfg = ReleaseConfig::new("booker", "bookings", "ghcr.io/acme/booker");
        cfg.stack = Some("booker".into());
        assert!(cfg.check().is_err());
        cfg.stack = Some("prod/booker".into());
        assert_eq!(cfg.stack_id().unwrap().namespace, "prod");
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keel.yaml");
        std::fs::write(&path, "service: booker\nnamespace: bookings\nrepository: ghcr.io/acme/booker\n").unwrap();
        let cfg = ReleaseConfig::load(&path).unwrap();
        assert_eq!(cfg.service, "booker");
        assert!(matches!(ReleaseConfig::load(&dir.path().join("missing.yaml")), Err(ConfigError::Io { .. })));
    }
}
