//! Keel core types: artifacts, topology, resource identity and stack scoping.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Label carrying the logical service name on every managed resource.
pub const LABEL_NAME: &str = "app.kubernetes.io/name";
/// Label marking resources this tool owns.
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
/// Label scoping managed resources to one logical stack.
pub const LABEL_STACK: &str = "keel.dev/stack";
pub const MANAGED_BY_VALUE: &str = "keel";
/// Content fingerprint of the manifest as planned (sha256, hex).
pub const ANNOTATION_FINGERPRINT: &str = "keel.dev/fingerprint";
/// Field manager used for server-side apply.
pub const FIELD_MANAGER: &str = "keel";

static DNS1123_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]{0,61}[a-z0-9])?$").expect("static regex"));
static DNS1123_SUBDOMAIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").expect("static regex")
});
static IMAGE_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}$").expect("static regex"));

/// Tags that move between builds and therefore can never pin a release.
const FLOATING_TAGS: &[&str] = &["latest", "stable", "main", "master"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    #[error("invalid image tag {0:?}")]
    InvalidTag(String),
    #[error("floating image tag {0:?} cannot pin a release")]
    FloatingTag(String),
    #[error("invalid registry repository {0:?}")]
    InvalidRepository(String),
    #[error("unknown topology {0:?} (expect service or scheduled-job)")]
    UnknownTopology(String),
    #[error("invalid stack id {0:?} (expect namespace/stack)")]
    InvalidStackId(String),
    #[error("unknown resource kind {0:?}")]
    UnknownKind(String),
}

pub fn is_dns1123_label(s: &str) -> bool {
    DNS1123_LABEL.is_match(s)
}

pub fn is_dns1123_subdomain(s: &str) -> bool {
    s.len() <= 253 && DNS1123_SUBDOMAIN.is_match(s)
}

/// Validate a registry tag; floating tags are refused.
pub fn validate_tag(tag: &str) -> Result<(), CoreError> {
    if !IMAGE_TAG.is_match(tag) {
        return Err(CoreError::InvalidTag(tag.to_string()));
    }
    if FLOATING_TAGS.iter().any(|t| t.eq_ignore_ascii_case(tag)) {
        return Err(CoreError::FloatingTag(tag.to_string()));
    }
    Ok(())
}

/// Immutable reference to a built image: `repository:tag`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Registry path without tag, e.g. `ghcr.io/acme/booker`.
    pub repository: String,
    /// Commit identifier of the triggering push.
    pub tag: String,
}

impl ArtifactRef {
    pub fn new(repository: impl Into<String>, tag: impl Into<String>) -> Result<Self, CoreError> {
        let repository = repository.into();
        let tag = tag.into();
        if repository.is_empty() || repository.contains('@') || repository.ends_with(':') || repository.contains(char::is_whitespace) {
            return Err(CoreError::InvalidRepository(repository));
        }
        validate_tag(&tag)?;
        Ok(Self { repository, tag })
    }

    /// Full pull reference.
    pub fn image(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }

    /// Split `repo[:port]/path:tag` back into an artifact reference.
    pub fn parse(image: &str) -> Result<Self, CoreError> {
        // last ':' after the last '/' separates the tag; a port colon sits before a '/'
        let slash = image.rfind('/').map(|i| i + 1).unwrap_or(0);
        match image[slash..].rfind(':') {
            Some(i) => Self::new(&image[..slash + i], &image[slash + i + 1..]),
            None => Err(CoreError::InvalidTag(String::new())),
        }
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

/// Which workload shape runs the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Topology {
    /// Always-on Deployment with one replica.
    Service,
    /// CronJob triggered on a fixed schedule.
    #[default]
    ScheduledJob,
}

impl Topology {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topology::Service => "service",
            Topology::ScheduledJob => "scheduled-job",
        }
    }

    /// Workload kind that realises this topology.
    pub fn workload_kind(&self) -> ResourceKind {
        match self {
            Topology::Service => ResourceKind::Deployment,
            Topology::ScheduledJob => ResourceKind::CronJob,
        }
    }
}

impl FromStr for Topology {
    type Err = CoreError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "service" | "deployment" => Ok(Topology::Service),
            "scheduled-job" | "scheduled_job" | "cronjob" | "job" => Ok(Topology::ScheduledJob),
            other => Err(CoreError::UnknownTopology(other.to_string())),
        }
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The closed set of kinds this tool ever manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Namespace,
    ConfigMap,
    Secret,
    Deployment,
    CronJob,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 5] = [
        ResourceKind::Namespace,
        ResourceKind::ConfigMap,
        ResourceKind::Secret,
        ResourceKind::Deployment,
        ResourceKind::CronJob,
    ];

    pub fn group(&self) -> &'static str {
        match self {
            ResourceKind::Namespace | ResourceKind::ConfigMap | ResourceKind::Secret => "",
            ResourceKind::Deployment => "apps",
            ResourceKind::CronJob => "batch",
        }
    }

    pub fn version(&self) -> &'static str {
        "v1"
    }

    pub fn api_version(&self) -> String {
        if self.group().is_empty() {
            self.version().to_string()
        } else {
            format!("{}/{}", self.group(), self.version())
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ResourceKind::Namespace => "Namespace",
            ResourceKind::ConfigMap => "ConfigMap",
            ResourceKind::Secret => "Secret",
            ResourceKind::Deployment => "Deployment",
            ResourceKind::CronJob => "CronJob",
        }
    }

    pub fn plural(&self) -> &'static str {
        match self {
            ResourceKind::Namespace => "namespaces",
            ResourceKind::ConfigMap => "configmaps",
            ResourceKind::Secret => "secrets",
            ResourceKind::Deployment => "deployments",
            ResourceKind::CronJob => "cronjobs",
        }
    }

    pub fn namespaced(&self) -> bool {
        !matches!(self, ResourceKind::Namespace)
    }

    pub fn is_workload(&self) -> bool {
        matches!(self, ResourceKind::Deployment | ResourceKind::CronJob)
    }

    /// `v1/ConfigMap` or `apps/v1/Deployment`, the key format used across the CLI.
    pub fn gvk_key(&self) -> String {
        format!("{}/{}", self.api_version(), self.kind())
    }
}

impl FromStr for ResourceKind {
    type Err = CoreError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = s.rsplit('/').next().unwrap_or(s);
        ResourceKind::ALL
            .iter()
            .copied()
            .find(|k| k.kind().eq_ignore_ascii_case(kind))
            .ok_or_else(|| CoreError::UnknownKind(s.to_string()))
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

/// Identity of one cluster object: kind + optional namespace + name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub kind: ResourceKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceKey {
    pub fn cluster(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self { kind, namespace: None, name: name.into() }
    }

    pub fn namespaced(kind: ResourceKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { kind, namespace: Some(namespace.into()), name: name.into() }
    }

    pub fn namespace(name: impl Into<String>) -> Self {
        Self::cluster(ResourceKind::Namespace, name)
    }

    /// Namespace an operation on this key touches; for a Namespace that is itself.
    pub fn scope(&self) -> Option<&str> {
        match self.kind {
            ResourceKind::Namespace => Some(self.name.as_str()),
            _ => self.namespace.as_deref(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind.gvk_key(), ns, self.name),
            None => write!(f, "{} {}", self.kind.gvk_key(), self.name),
        }
    }
}

/// A logical stack in the shared backend: `(namespace, stack)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StackId {
    pub namespace: String,
    pub stack: String,
}

impl StackId {
    pub fn new(namespace: impl Into<String>, stack: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), stack: stack.into() }
    }

    /// Label-safe rendering (`<namespace>.<stack>`, lowercased, non-alnum → `-`).
    pub fn label_value(&self) -> String {
        let raw = format!("{}.{}", self.namespace, self.stack).to_ascii_lowercase();
        let mut out: String = raw
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' { c } else { '-' })
            .collect();
        out.truncate(63);
        out.trim_matches(|c: char| !c.is_ascii_alphanumeric()).to_string()
    }
}

impl FromStr for StackId {
    type Err = CoreError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, st)) if !ns.is_empty() && !st.is_empty() && !st.contains('/') => Ok(Self::new(ns, st)),
            _ => Err(CoreError::InvalidStackId(s.to_string())),
        }
    }
}

impl fmt::Display for StackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.stack)
    }
}

pub mod prelude {
    pub use super::{ArtifactRef, ResourceKey, ResourceKind, StackId, Topology};
}
