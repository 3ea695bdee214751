//! Structural checks run before the cluster is touched.

use std::collections::BTreeSet;

use keel_core::{is_dns1123_label, is_dns1123_subdomain, ArtifactRef, CoreError, ResourceKind, Topology};
use keel_plan::{valid_key, DesiredResourceSet};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("namespace {0:?} is not a DNS-1123 label")]
    InvalidNamespace(String),
    #[error("{key}: name is not a valid object name")]
    InvalidName { key: String },
    #[error("expected exactly one workload, found {0}")]
    WorkloadCount(usize),
    #[error("workload kind {found} does not match topology {topology}")]
    WorkloadKind { found: ResourceKind, topology: Topology },
    #[error("{key} lies outside namespace {expected}")]
    ForeignNamespace { key: String, expected: String },
    #[error("namespace object missing for {0}")]
    MissingNamespace(String),
    #[error("{key}: data key {data_key:?} is not a valid config/secret key")]
    InvalidDataKey { key: String, data_key: String },
    #[error("duplicate resource {0}")]
    DuplicateKey(String),
    #[error("service shape requires a secret object")]
    MissingSecret,
    #[error("secret is missing required key {0:?}")]
    MissingSecretKey(String),
    #[error("{key}: workload has no container image")]
    MissingImage { key: String },
    #[error("{key}: image {image} is not pinned: {reason}")]
    UnpinnedImage { key: String, image: String, reason: CoreError },
    #[error("{key}: schedule {schedule:?} must have five fields")]
    BadSchedule { key: String, schedule: String },
}

/// Per-run validation knobs, chosen by the caller for the active topology.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationPolicy {
    /// Keys the secret object must carry.
    #[serde(default)]
    pub required_secret_keys: Vec<String>,
}

fn containers(manifest: &Json, kind: ResourceKind) -> Vec<&Json> {
    let ptr = match kind {
        ResourceKind::Deployment => "/spec/template/spec/containers",
        ResourceKind::CronJob => "/spec/jobTemplate/spec/template/spec/containers",
        _ => return Vec::new(),
    };
    manifest.pointer(ptr).and_then(|c| c.as_array()).map(|a| a.iter().collect()).unwrap_or_default()
}

/// Check the set; the first violation wins.
pub fn validate(set: &DesiredResourceSet, policy: &ValidationPolicy) -> Result<(), ValidationError> {
    if !is_dns1123_label(&set.namespace) {
        return Err(ValidationError::InvalidNamespace(set.namespace.clone()));
    }

    let mut seen = BTreeSet::new();
    for r in &set.resources {
        if !seen.insert(&r.key) {
            return Err(ValidationError::DuplicateKey(r.key.to_string()));
        }
        let name_ok = match r.key.kind {
            ResourceKind::Namespace => is_dns1123_label(&r.key.name),
            k if k.is_workload() => is_dns1123_label(&r.key.name),
            _ => is_dns1123_subdomain(&r.key.name),
        };
        if !name_ok {
            return Err(ValidationError::InvalidName { key: r.key.to_string() });
        }
        if matches!(r.key.kind, ResourceKind::ConfigMap | ResourceKind::Secret) {
            let data_keys = ["data", "binaryData"]
                .into_iter()
                .filter_map(|field| r.manifest.get(field).and_then(|d| d.as_object()))
                .flat_map(|d| d.keys());
            for k in data_keys {
                if !valid_key(k) {
                    return Err(ValidationError::InvalidDataKey { key: r.key.to_string(), data_key: k.clone() });
                }
            }
        }
        match r.key.kind {
            ResourceKind::Namespace if r.key.name != set.namespace => {
                return Err(ValidationError::ForeignNamespace { key: r.key.to_string(), expected: set.namespace.clone() });
            }
            k if k.namespaced() && r.key.namespace.as_deref() != Some(set.namespace.as_str()) => {
                return Err(ValidationError::ForeignNamespace { key: r.key.to_string(), expected: set.namespace.clone() });
            }
            _ => {}
        }
    }
    if !set.resources.iter().any(|r| r.key.kind == ResourceKind::Namespace) {
        return Err(ValidationError::MissingNamespace(set.namespace.clone()));
    }

    let workloads: Vec<_> = set.workloads().collect();
    if workloads.len() != 1 {
        return Err(ValidationError::WorkloadCount(workloads.len()));
    }
    let workload = workloads[0];
    if workload.key.kind != set.topology.workload_kind() {
        return Err(ValidationError::WorkloadKind { found: workload.key.kind, topology: set.topology });
    }

    let secret = set.resources.iter().find(|r| r.key.kind == ResourceKind::Secret);
    if secret.is_none() && set.topology == Topology::Service {
        return Err(ValidationError::MissingSecret);
    }
    let secret_keys: BTreeSet<&str> = secret
        .and_then(|s| s.manifest.get("data"))
        .and_then(|d| d.as_object())
        .map(|d| d.keys().map(String::as_str).collect())
        .unwrap_or_default();
    for required in &policy.required_secret_keys {
        if !secret_keys.contains(required.as_str()) {
            return Err(ValidationError::MissingSecretKey(required.clone()));
        }
    }

    let key = workload.key.to_string();
    let cs = containers(&workload.manifest, workload.key.kind);
    if cs.is_empty() {
        return Err(ValidationError::MissingImage { key });
    }
    for c in cs {
        let image = c.get("image").and_then(|i| i.as_str()).ok_or_else(|| ValidationError::MissingImage { key: key.clone() })?;
        ArtifactRef::parse(image).map_err(|reason| ValidationError::UnpinnedImage { key: key.clone(), image: image.to_string(), reason })?;
    }

    if workload.key.kind == ResourceKind::CronJob {
        let schedule = workload.manifest.pointer("/spec/schedule").and_then(|s| s.as_str()).unwrap_or_default();
        if schedule.split_whitespace().count() != 5 {
            return Err(ValidationError::BadSchedule { key, schedule: schedule.to_string() });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{ResourceKey, StackId};
    use keel_plan::{plan, DesiredResource, PlanInputs};

    fn planned(topology: Topology) -> DesiredResourceSet {
        let mut i = PlanInputs::new(
            "booker",
            "bookings",
            StackId::new("bookings", "booker"),
            ArtifactRef::new("ghcr.io/acme/booker", "3f2c1ab").unwrap(),
            topology,
        );
        i.secrets.insert("api_key", "abc123").unwrap();
        plan(&i).unwrap()
    }

    #[test]
    fn planned_sets_pass() {
        let policy = ValidationPolicy { required_secret_keys: vec!["api_key".into()] };
        validate(&planned(Topology::Service), &policy).unwrap();
        validate(&planned(Topology::ScheduledJob), &policy).unwrap();
    }

    #[test]
    fn missing_required_secret_key_fails() {
        let policy = ValidationPolicy { required_secret_keys: vec!["base_url".into()] };
        assert_eq!(validate(&planned(Topology::Service), &policy), Err(ValidationError::MissingSecretKey("base_url".into())));
    }

    #[test]
    fn service_without_secret_fails() {
        let mut set = planned(Topology::Service);
        set.resources.retain(|r| r.key.kind != ResourceKind::Secret);
        assert_eq!(validate(&set, &ValidationPolicy::default()), Err(ValidationError::MissingSecret));
    }

    #[test]
    fn second_workload_fails() {
        let mut set = planned(Topology::Service);
        set.resources.push(DesiredResource {
            key: ResourceKey::namespaced(ResourceKind::CronJob, "bookings", "booker"),
            manifest: serde_json::json!({"spec": {"schedule": "0 5 * * *"}}),
        });
        assert_eq!(validate(&set, &ValidationPolicy::default()), Err(ValidationError::WorkloadCount(2)));
    }

    #[test]
    fn floating_image_fails() {
        let mut set = planned(Topology::Service);
        let w = set.resources.iter_mut().find(|r| r.key.kind.is_workload()).unwrap();
        w.manifest["spec"]["template"]["spec"]["containers"][0]["image"] = "ghcr.io/acme/booker:latest".into();
        assert!(matches!(validate(&set, &ValidationPolicy::default()), Err(ValidationError::UnpinnedImage { .. })));
    }

    #[test]
    fn bad_namespace_and_schedule_fail() {
        let mut set = planned(Topology::ScheduledJob);
        let w = set.resources.iter_mut().find(|r| r.key.kind.is_workload()).unwrap();
        w.manifest["spec"]["schedule"] = "@daily".into();
        assert!(matches!(validate(&set, &ValidationPolicy::default()), Err(ValidationError::BadSchedule { .. })));

        let mut set = planned(Topology::Service);
        set.namespace = "Bookings".into();
        assert!(matches!(validate(&set, &ValidationPolicy::default()), Err(ValidationError::InvalidNamespace(_))));
    }

    #[test]
    fn resource_outside_namespace_fails() {
        let mut set = planned(Topology::Service);
        let s = set.resources.iter_mut().find(|r| r.key.kind == ResourceKind::Secret).unwrap();
        s.key.namespace = Some("default".into());
        assert!(matches!(validate(&set, &ValidationPolicy::default()), Err(ValidationError::ForeignNamespace { .. })));
    }

    #[test]
    fn resolved_output_under_a_bad_key_fails() {
        let mut i = PlanInputs::new(
            "booker",
            "bookings",
            StackId::new("bookings", "booker"),
            ArtifactRef::new("ghcr.io/acme/booker", "3f2c1ab").unwrap(),
            Topology::Service,
        );
        i.resolved = [("base url/x", "https://cfg.example/x")].into_iter().collect();
        let set = plan(&i).unwrap();
        match validate(&set, &ValidationPolicy::default()) {
            Err(ValidationError::InvalidDataKey { data_key, .. }) => assert_eq!(data_key, "base url/x"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn bad_config_map_key_fails() {
        let mut set = planned(Topology::ScheduledJob);
        set.resources.push(DesiredResource {
            key: ResourceKey::namespaced(ResourceKind::ConfigMap, "bookings", "booker-extra"),
            manifest: serde_json::json!({"binaryData": {"..": "AA=="}}),
        });
        assert!(matches!(validate(&set, &ValidationPolicy::default()), Err(ValidationError::InvalidDataKey { .. })));
    }

    #[test]
    fn duplicates_fail() {
        let mut set = planned(Topology::Service);
        let dup = set.resources[1].clone();
        set.resources.insert(1, dup);
        assert!(matches!(validate(&set, &ValidationPolicy::default()), Err(ValidationError::DuplicateKey(_))));
    }
}
