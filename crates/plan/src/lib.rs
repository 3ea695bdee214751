//! Keel planner: turns an artifact, resolved remote configuration and the
//! static payloads into the Desired Resource Set for one workload.
//!
//! Planning is pure. Names derive only from the service name and namespace, and
//! every map is ordered, so identical inputs give byte-identical output.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use keel_core::{
    ArtifactRef, ResourceKey, ResourceKind, StackId, Topology, ANNOTATION_FINGERPRINT, LABEL_MANAGED_BY, LABEL_NAME,
    LABEL_STACK, MANAGED_BY_VALUE,
};
use keel_resolve::ResolvedConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

mod manifests;
mod payload;

pub use manifests::{CONFIG_MOUNT_PATH, LIMITS_CPU, LIMITS_MEMORY, REQUESTS_CPU, REQUESTS_MEMORY, WORKING_DIR};
pub use payload::{valid_key, ConfigPayload, SecretPayload, BLOB_KEY};

/// Default CronJob schedule: daily at 05:00 UTC.
pub const DEFAULT_SCHEDULE: &str = "0 5 * * *";

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("reading {path}: {source}")]
    Io { path: String, #[source] source: std::io::Error },
    #[error("{0:?} is not a valid config/secret key")]
    InvalidPayloadKey(String),
    #[error("config payload is {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("serializing manifest: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("rendering yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Everything the planner needs for one run.
#[derive(Debug, Clone)]
pub struct PlanInputs {
    /// Logical service name; every resource name derives from it.
    pub service: String,
    pub namespace: String,
    pub stack: StackId,
    pub artifact: ArtifactRef,
    pub topology: Topology,
    pub resolved: ResolvedConfig,
    pub config: ConfigPayload,
    pub secrets: SecretPayload,
    pub schedule: String,
}

impl PlanInputs {
    pub fn new(service: impl Into<String>, namespace: impl Into<String>, stack: StackId, artifact: ArtifactRef, topology: Topology) -> Self {
        Self {
            service: service.into(),
            namespace: namespace.into(),
            stack,
            artifact,
            topology,
            resolved: ResolvedConfig::default(),
            config: ConfigPayload::Empty,
            secrets: SecretPayload::default(),
            schedule: DEFAULT_SCHEDULE.to_string(),
        }
    }
}

/// Deterministic resource names for one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Naming {
    pub service: String,
    pub namespace: String,
}

impl Naming {
    pub fn new(service: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self { service: service.into(), namespace: namespace.into() }
    }

    pub fn config_name(&self) -> String {
        format!("{}-config", self.service)
    }

    pub fn secret_name(&self) -> String {
        format!("{}-secrets", self.service)
    }

    pub fn workload_name(&self) -> &str {
        &self.service
    }

    pub fn namespace_key(&self) -> ResourceKey {
        ResourceKey::namespace(&self.namespace)
    }

    pub fn config_key(&self) -> ResourceKey {
        ResourceKey::namespaced(ResourceKind::ConfigMap, &self.namespace, self.config_name())
    }

    pub fn secret_key(&self) -> ResourceKey {
        ResourceKey::namespaced(ResourceKind::Secret, &self.namespace, self.secret_name())
    }

    pub fn workload_key(&self, topology: Topology) -> ResourceKey {
        ResourceKey::namespaced(topology.workload_kind(), &self.namespace, &self.service)
    }
}

/// One resource the cluster should hold, as a full manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredResource {
    pub key: ResourceKey,
    pub manifest: Json,
}

impl DesiredResource {
    pub fn fingerprint(&self) -> Option<&str> {
        fingerprint_of(&self.manifest)
    }
}

/// The complete set of resources for one run, in creation order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredResourceSet {
    pub stack: StackId,
    pub service: String,
    pub namespace: String,
    pub topology: Topology,
    pub artifact: ArtifactRef,
    pub resources: Vec<DesiredResource>,
}

impl DesiredResourceSet {
    pub fn keys(&self) -> impl Iterator<Item = &ResourceKey> {
        self.resources.iter().map(|r| &r.key)
    }

    pub fn get(&self, key: &ResourceKey) -> Option<&DesiredResource> {
        self.resources.iter().find(|r| &r.key == key)
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.get(key).is_some()
    }

    pub fn workloads(&self) -> impl Iterator<Item = &DesiredResource> {
        self.resources.iter().filter(|r| r.key.kind.is_workload())
    }

    pub fn naming(&self) -> Naming {
        Naming::new(&self.service, &self.namespace)
    }

    /// Canonical serialization; identical inputs give identical bytes.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, PlanError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// sha256 over the canonical bytes.
    pub fn fingerprint(&self) -> Result<String, PlanError> {
        Ok(hex::encode(Sha256::digest(self.canonical_bytes()?)))
    }

    /// Copy with secret values replaced, for display.
    pub fn redacted(&self) -> Self {
        let mut out = self.clone();
        for r in out.resources.iter_mut().filter(|r| r.key.kind == ResourceKind::Secret) {
            if let Some(data) = r.manifest.get_mut("data").and_then(|d| d.as_object_mut()) {
                for v in data.values_mut() {
                    *v = Json::String("<redacted>".into());
                }
            }
        }
        out
    }

    /// Multi-document YAML of the manifests.
    pub fn to_yaml(&self) -> Result<String, PlanError> {
        let mut out = String::new();
        for r in &self.resources {
            out.push_str("---\n");
            out.push_str(&serde_yaml::to_string(&r.manifest)?);
        }
        Ok(out)
    }
}

/// Fingerprint annotation carried by a manifest, live or desired.
pub fn fingerprint_of(manifest: &Json) -> Option<&str> {
    manifest
        .pointer("/metadata/annotations")
        .and_then(|a| a.get(ANNOTATION_FINGERPRINT))
        .and_then(|v| v.as_str())
}

/// Labels every managed resource carries.
pub fn labels(service: &str, stack: &StackId) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_NAME.to_string(), service.to_string()),
        (LABEL_MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string()),
        (LABEL_STACK.to_string(), stack.label_value()),
    ])
}

/// Equality selector matching everything this stack manages.
pub fn stack_selector(stack: &StackId) -> String {
    format!("{}={},{}={}", LABEL_MANAGED_BY, MANAGED_BY_VALUE, LABEL_STACK, stack.label_value())
}

/// Hash the manifest and stamp the result into its annotations.
fn seal(key: ResourceKey, mut manifest: Json) -> Result<DesiredResource, PlanError> {
    let digest = hex::encode(Sha256::digest(serde_json::to_vec(&manifest)?));
    if let Some(meta) = manifest.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        let ann = meta.entry("annotations").or_insert_with(|| Json::Object(Default::default()));
        if let Some(a) = ann.as_object_mut() {
            a.insert(ANNOTATION_FINGERPRINT.to_string(), Json::String(digest));
        }
    }
    Ok(DesiredResource { key, manifest })
}

/// Merge resolved outputs with pipeline secrets; pipeline values win.
pub fn merged_secret_data(resolved: &ResolvedConfig, secrets: &SecretPayload) -> BTreeMap<String, String> {
    let mut data: BTreeMap<String, String> = resolved.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    for (k, v) in secrets.iter() {
        data.insert(k.clone(), v.clone());
    }
    data
}

/// Compute the Desired Resource Set.
pub fn plan(inputs: &PlanInputs) -> Result<DesiredResourceSet, PlanError> {
    let naming = Naming::new(&inputs.service, &inputs.namespace);
    let labels = labels(&inputs.service, &inputs.stack);
    let secret_data = merged_secret_data(&inputs.resolved, &inputs.secrets);
    let has_secret = !secret_data.is_empty();
    let mut resources = Vec::with_capacity(4);

    resources.push(seal(naming.namespace_key(), manifests::namespace(&naming, &labels)?)?);

    let mounts_config = inputs.topology == Topology::ScheduledJob;
    if mounts_config {
        inputs.config.check_size()?;
        resources.push(seal(naming.config_key(), manifests::config_map(&naming, &labels, &inputs.config)?)?);
    }
    if has_secret {
        resources.push(seal(naming.secret_key(), manifests::secret(&naming, &labels, &secret_data)?)?);
    }

    let workload = match inputs.topology {
        Topology::Service => manifests::deployment(&naming, &labels, &inputs.artifact, has_secret)?,
        Topology::ScheduledJob => manifests::cron_job(&naming, &labels, &inputs.artifact, &inputs.schedule, has_secret)?,
    };
    resources.push(seal(naming.workload_key(inputs.topology), workload)?);

    // keys only; values never reach the log
    debug!(secret_keys = ?secret_data.keys().collect::<Vec<_>>(), "secret object keys");
    info!(
        service = %inputs.service,
        ns = %inputs.namespace,
        topology = %inputs.topology,
        image = %inputs.artifact,
        resources = resources.len(),
        "desired resource set planned"
    );
    Ok(DesiredResourceSet {
        stack: inputs.stack.clone(),
        service: inputs.service.clone(),
        namespace: inputs.namespace.clone(),
        topology: inputs.topology,
        artifact: inputs.artifact.clone(),
        resources,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(topology: Topology) -> PlanInputs {
        PlanInputs::new(
            "booker",
            "bookings",
            StackId::new("bookings", "booker"),
            ArtifactRef::new("ghcr.io/acme/booker", "3f2c1ab").unwrap(),
            topology,
        )
    }

    #[test]
    fn naming_is_derived_from_service_and_namespace() {
        let n = Naming::new("booker", "bookings");
        assert_eq!(n.config_name(), "booker-config");
        assert_eq!(n.secret_name(), "booker-secrets");
        assert_eq!(n.workload_key(Topology::Service).kind, ResourceKind::Deployment);
        assert_eq!(n.workload_key(Topology::ScheduledJob).to_string(), "batch/v1/CronJob bookings/booker");
    }

    #[test]
    fn pipeline_secrets_win_on_collision() {
        let resolved: ResolvedConfig = [("api_key", "from-remote"), ("base_url", "u")].into_iter().collect();
        let mut secrets = SecretPayload::new();
        secrets.insert("api_key", "from-pipeline").unwrap();
        let merged = merged_secret_data(&resolved, &secrets);
        assert_eq!(merged["api_key"], "from-pipeline");
        assert_eq!(merged["base_url"], "u");
    }

    #[test]
    fn every_resource_is_labelled_and_fingerprinted() {
        let mut i = inputs(Topology::ScheduledJob);
        i.secrets.insert("api_key", "k").unwrap();
        let set = plan(&i).unwrap();
        assert_eq!(set.resources.len(), 4);
        for r in &set.resources {
            let l = r.manifest.pointer("/metadata/labels").unwrap();
            assert_eq!(l[LABEL_MANAGED_BY], "keel");
            assert_eq!(l[LABEL_STACK], "bookings.booker");
            assert_eq!(r.fingerprint().map(str::len), Some(64), "{}", r.key);
        }
    }

    #[test]
    fn fingerprint_tracks_content() {
        let a = plan(&inputs(Topology::Service)).unwrap();
        let mut changed = inputs(Topology::Service);
        changed.artifact = ArtifactRef::new("ghcr.io/acme/booker", "9fceb02").unwrap();
        let b = plan(&changed).unwrap();
        // namespace unchanged, workload changed
        assert_eq!(a.resources[0].fingerprint(), b.resources[0].fingerprint());
        assert_ne!(a.resources.last().unwrap().fingerprint(), b.resources.last().unwrap().fingerprint());
    }

    #[test]
    fn redaction_hides_secret_values() {
        let mut i = inputs(Topology::Service);
        i.secrets.insert("api_key", "abc123").unwrap();
        let set = plan(&i).unwrap();
        let yaml = set.redacted().to_yaml().unwrap();
        assert!(yaml.contains("<redacted>"));
        // base64("abc123")
        assert!(!yaml.contains("YWJjMTIz"));
        assert!(set.to_yaml().unwrap().contains("YWJjMTIz"));
    }

    #[test]
    fn selector_covers_managed_by_and_stack() {
        assert_eq!(stack_selector(&StackId::new("bookings", "booker")), "app.kubernetes.io/managed-by=keel,keel.dev/stack=bookings.booker");
    }
}
