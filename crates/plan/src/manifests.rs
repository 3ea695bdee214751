//! Typed construction of the four manifests, converted to JSON at the edge.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::batch::v1::{CronJob, CronJobSpec, JobSpec, JobTemplateSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, EnvFromSource, Namespace, PodSpec, PodTemplateSpec, ResourceRequirements,
    Secret, SecretEnvSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::ByteString;
use keel_core::{ArtifactRef, LABEL_NAME};
use serde_json::Value as Json;

use crate::{ConfigPayload, Naming, PlanError};

pub const REQUESTS_CPU: &str = "50m";
pub const REQUESTS_MEMORY: &str = "64Mi";
pub const LIMITS_CPU: &str = "200m";
pub const LIMITS_MEMORY: &str = "128Mi";
/// Where the config payload is mounted inside the container.
pub const CONFIG_MOUNT_PATH: &str = "/app/assets";
pub const WORKING_DIR: &str = "/app";

const CONFIG_VOLUME: &str = "config";
const HISTORY_LIMIT: i32 = 3;

fn meta(name: &str, namespace: Option<&str>, labels: &BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(|s| s.to_string()),
        labels: Some(labels.clone()),
        ..Default::default()
    }
}

fn resources() -> ResourceRequirements {
    ResourceRequirements {
        requests: Some(BTreeMap::from([
            ("cpu".to_string(), Quantity(REQUESTS_CPU.into())),
            ("memory".to_string(), Quantity(REQUESTS_MEMORY.into())),
        ])),
        limits: Some(BTreeMap::from([
            ("cpu".to_string(), Quantity(LIMITS_CPU.into())),
            ("memory".to_string(), Quantity(LIMITS_MEMORY.into())),
        ])),
        ..Default::default()
    }
}

fn container(naming: &Naming, artifact: &ArtifactRef, secret: bool, mount_config: bool) -> Container {
    Container {
        name: naming.service.clone(),
        image: Some(artifact.image()),
        image_pull_policy: Some("IfNotPresent".into()),
        working_dir: mount_config.then(|| WORKING_DIR.to_string()),
        env_from: secret.then(|| {
            vec![EnvFromSource {
                secret_ref: Some(SecretEnvSource { name: Some(naming.secret_name()), optional: Some(false) }),
                ..Default::default()
            }]
        }),
        volume_mounts: mount_config.then(|| {
            vec![VolumeMount {
                name: CONFIG_VOLUME.into(),
                mount_path: CONFIG_MOUNT_PATH.into(),
                read_only: Some(true),
                ..Default::default()
            }]
        }),
        resources: Some(resources()),
        ..Default::default()
    }
}

pub(crate) fn namespace(naming: &Naming, labels: &BTreeMap<String, String>) -> Result<Json, PlanError> {
    let ns = Namespace { metadata: meta(&naming.namespace, None, labels), ..Default::default() };
    Ok(serde_json::to_value(&ns)?)
}

/// UTF-8 files go to `data`, everything else to `binaryData`.
pub(crate) fn config_map(naming: &Naming, labels: &BTreeMap<String, String>, payload: &ConfigPayload) -> Result<Json, PlanError> {
    let mut data = BTreeMap::new();
    let mut binary = BTreeMap::new();
    for (k, bytes) in payload.entries() {
        match String::from_utf8(bytes) {
            Ok(text) => {
                data.insert(k, text);
            }
            Err(e) => {
                binary.insert(k, ByteString(e.into_bytes()));
            }
        }
    }
    let cm = ConfigMap {
        metadata: meta(&naming.config_name(), Some(&naming.namespace), labels),
        data: (!data.is_empty()).then_some(data),
        binary_data: (!binary.is_empty()).then_some(binary),
        ..Default::default()
    };
    Ok(serde_json::to_value(&cm)?)
}

pub(crate) fn secret(naming: &Naming, labels: &BTreeMap<String, String>, data: &BTreeMap<String, String>) -> Result<Json, PlanError> {
    let s = Secret {
        metadata: meta(&naming.secret_name(), Some(&naming.namespace), labels),
        type_: Some("Opaque".into()),
        data: Some(data.iter().map(|(k, v)| (k.clone(), ByteString(v.as_bytes().to_vec()))).collect()),
        ..Default::default()
    };
    Ok(serde_json::to_value(&s)?)
}

pub(crate) fn deployment(
    naming: &Naming,
    labels: &BTreeMap<String, String>,
    artifact: &ArtifactRef,
    secret: bool,
) -> Result<Json, PlanError> {
    let selector = BTreeMap::from([(LABEL_NAME.to_string(), naming.service.clone())]);
    let d = Deployment {
        metadata: meta(naming.workload_name(), Some(&naming.namespace), labels),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector { match_labels: Some(selector), ..Default::default() },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta { labels: Some(labels.clone()), ..Default::default() }),
                spec: Some(PodSpec {
                    containers: vec![container(naming, artifact, secret, false)],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    };
    Ok(serde_json::to_value(&d)?)
}

pub(crate) fn cron_job(
    naming: &Naming,
    labels: &BTreeMap<String, String>,
    artifact: &ArtifactRef,
    schedule: &str,
    secret: bool,
) -> Result<Json, PlanError> {
    let pod = PodTemplateSpec {
        metadata: Some(ObjectMeta { labels: Some(labels.clone()), ..Default::default() }),
        spec: Some(PodSpec {
            containers: vec![container(naming, artifact, secret, true)],
            restart_policy: Some("Never".into()),
            volumes: Some(vec![Volume {
                name: CONFIG_VOLUME.into(),
                config_map: Some(ConfigMapVolumeSource { name: Some(naming.config_name()), ..Default::default() }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    };
    let cj = CronJob {
        metadata: meta(naming.workload_name(), Some(&naming.namespace), labels),
        spec: Some(CronJobSpec {
            schedule: schedule.to_string(),
            concurrency_policy: Some("Forbid".into()),
            successful_jobs_history_limit: Some(HISTORY_LIMIT),
            failed_jobs_history_limit: Some(HISTORY_LIMIT),
            job_template: JobTemplateSpec {
                metadata: Some(ObjectMeta { labels: Some(labels.clone()), ..Default::default() }),
                spec: Some(JobSpec { template: pod, ..Default::default() }),
            },
            ..Default::default()
        }),
        ..Default::default()
    };
    Ok(serde_json::to_value(&cj)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_payload_goes_to_binary_data() {
        let n = Naming::new("booker", "bookings");
        let mut files = BTreeMap::new();
        files.insert("a.json".to_string(), b"{}".to_vec());
        files.insert("b.bin".to_string(), vec![0xff, 0xfe, 0x00]);
        let cm = config_map(&n, &BTreeMap::new(), &ConfigPayload::Files(files)).unwrap();
        assert_eq!(cm["data"]["a.json"], "{}");
        assert!(cm["data"].get("b.bin").is_none());
        assert_eq!(cm["binaryData"]["b.bin"], "//4A");
    }

    #[test]
    fn deployment_without_secret_has_no_env_from() {
        let n = Naming::new("booker", "bookings");
        let a = ArtifactRef::new("ghcr.io/acme/booker", "3f2c1ab").unwrap();
        let d = deployment(&n, &BTreeMap::new(), &a, false).unwrap();
        assert!(d.pointer("/spec/template/spec/containers/0/envFrom").is_none());
        assert_eq!(d.pointer("/spec/template/spec/containers/0/resources/limits/memory").unwrap(), "128Mi");
        assert_eq!(d["apiVersion"], "apps/v1");
        assert_eq!(d["kind"], "Deployment");
    }
}
