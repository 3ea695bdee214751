//! Keel kubehub: client setup and the `Cluster` capability the applier drives.
//!
//! Only the five kinds in [`ResourceKind`] are ever touched, so API resources are
//! built from static GVK data instead of running discovery on every call.

#![forbid(unsafe_code)]

use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use keel_core::{ResourceKey, ResourceKind, FIELD_MANAGER};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    config::{KubeConfigOptions, Kubeconfig},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::Discovery,
    Client, Config,
};
use metrics::{counter, histogram};
use serde_json::Value as Json;
use tracing::{debug, info};

mod memory;

pub use memory::{ClusterCall, MemoryCluster, Verb};

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("kube config: {0}")]
    Config(String),
    #[error("kube api: {0}")]
    Api(#[from] kube::Error),
    #[error("{verb} {key} timed out after {after:?}")]
    Timeout { verb: Verb, key: String, after: Duration },
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("manifest for {key} is not a valid object: {reason}")]
    InvalidManifest { key: String, reason: String },
    #[error("cluster does not serve {0}")]
    Unserved(String),
    #[error("{0}")]
    Rejected(String),
}

/// List/get/create/update/delete over the managed kinds, keyed by `(namespace, name)`.
#[async_trait]
pub trait Cluster: Send + Sync {
    async fn get(&self, key: &ResourceKey) -> Result<Option<Json>, ClusterError>;

    /// List objects of `kind` matching an equality label selector (`k=v,k2=v2`).
    /// `namespace = None` lists across all namespaces.
    async fn list(&self, kind: ResourceKind, namespace: Option<&str>, label_selector: &str) -> Result<Vec<Json>, ClusterError>;

    async fn create(&self, key: &ResourceKey, manifest: &Json) -> Result<(), ClusterError>;

    async fn update(&self, key: &ResourceKey, manifest: &Json) -> Result<(), ClusterError>;

    /// Deleting an object that is already gone succeeds.
    async fn delete(&self, key: &ResourceKey) -> Result<(), ClusterError>;
}

#[async_trait]
impl<C: Cluster + ?Sized> Cluster for std::sync::Arc<C> {
    async fn get(&self, key: &ResourceKey) -> Result<Option<Json>, ClusterError> { (**self).get(key).await }
    async fn list(&self, kind: ResourceKind, namespace: Option<&str>, label_selector: &str) -> Result<Vec<Json>, ClusterError> {
        (**self).list(kind, namespace, label_selector).await
    }
    async fn create(&self, key: &ResourceKey, manifest: &Json) -> Result<(), ClusterError> { (**self).create(key, manifest).await }
    async fn update(&self, key: &ResourceKey, manifest: &Json) -> Result<(), ClusterError> { (**self).update(key, manifest).await }
    async fn delete(&self, key: &ResourceKey) -> Result<(), ClusterError> { (**self).delete(key).await }
}

/// Build a client from an explicit kubeconfig (CI-supplied credentials) or the
/// ambient environment (in-cluster service account / `KUBECONFIG`).
pub async fn connect(kubeconfig: Option<&Path>, context: Option<&str>, timeout: Duration) -> Result<Client, ClusterError> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kc = Kubeconfig::read_from(path).map_err(|e| ClusterError::Config(format!("reading {}: {}", path.display(), e)))?;
            let opts = KubeConfigOptions { context: context.map(|s| s.to_string()), ..Default::default() };
            Config::from_custom_kubeconfig(kc, &opts).await.map_err(|e| ClusterError::Config(e.to_string()))?
        }
        None => Config::infer().await.map_err(|e| ClusterError::Config(e.to_string()))?,
    };
    config.connect_timeout = Some(timeout);
    config.read_timeout = Some(timeout);
    config.write_timeout = Some(timeout);
    info!(cluster = %config.cluster_url, "kube client configured");
    Client::try_from(config).map_err(ClusterError::Api)
}

pub fn api_resource(kind: ResourceKind) -> ApiResource {
    let gvk = GroupVersionKind::gvk(kind.group(), kind.version(), kind.kind());
    ApiResource::from_gvk_with_plural(&gvk, kind.plural())
}

/// Cluster backed by a live API server.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    timeout: Duration,
}

impl KubeCluster {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    fn api(&self, kind: ResourceKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = api_resource(kind);
        match (kind.namespaced(), namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        }
    }

    async fn bounded<T, F>(&self, verb: Verb, key: &ResourceKey, fut: F) -> Result<T, ClusterError>
    where
        F: std::future::Future<Output = Result<T, kube::Error>>,
    {
        let t0 = Instant::now();
        let res = match tokio::time::timeout(self.timeout, fut).await {
            Ok(r) => r.map_err(|e| classify(e, key)),
            Err(_) => Err(ClusterError::Timeout { verb, key: key.to_string(), after: self.timeout }),
        };
        histogram!("cluster_call_ms", t0.elapsed().as_secs_f64() * 1000.0);
        if res.is_err() {
            counter!("cluster_call_err", 1u64);
        }
        res
    }

    /// Check that the API server serves every managed kind (e.g. `batch/v1` CronJob).
    pub async fn preflight(&self) -> Result<(), ClusterError> {
        let discovery = tokio::time::timeout(self.timeout, Discovery::new(self.client.clone()).run())
            .await
            .map_err(|_| ClusterError::Timeout { verb: Verb::List, key: "discovery".into(), after: self.timeout })??;
        for kind in ResourceKind::ALL {
            let served = discovery.groups().any(|g| {
                g.recommended_resources()
                    .iter()
                    .any(|(ar, _)| ar.group == kind.group() && ar.version == kind.version() && ar.kind == kind.kind())
            });
            if !served {
                return Err(ClusterError::Unserved(kind.gvk_key()));
            }
        }
        debug!("preflight: all managed kinds served");
        Ok(())
    }
}

fn classify(e: kube::Error, key: &ResourceKey) -> ClusterError {
    match &e {
        kube::Error::Api(ae) if ae.code == 409 => ClusterError::AlreadyExists(key.to_string()),
        kube::Error::Api(ae) if ae.code == 404 => ClusterError::NotFound(key.to_string()),
        kube::Error::Api(ae) if ae.code == 422 || ae.code == 400 => ClusterError::Rejected(format!("{}: {}", key, ae.message)),
        _ => ClusterError::Api(e),
    }
}

fn to_dynamic(key: &ResourceKey, manifest: &Json) -> Result<DynamicObject, ClusterError> {
    serde_json::from_value(manifest.clone()).map_err(|e| ClusterError::InvalidManifest { key: key.to_string(), reason: e.to_string() })
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn get(&self, key: &ResourceKey) -> Result<Option<Json>, ClusterError> {
        let api = self.api(key.kind, key.namespace.as_deref());
        let obj = self.bounded(Verb::Get, key, api.get_opt(&key.name)).await?;
        match obj {
            Some(o) => Ok(Some(serde_json::to_value(&o).map_err(|e| ClusterError::InvalidManifest { key: key.to_string(), reason: e.to_string() })?)),
            None => Ok(None),
        }
    }

    async fn list(&self, kind: ResourceKind, namespace: Option<&str>, label_selector: &str) -> Result<Vec<Json>, ClusterError> {
        let api = self.api(kind, namespace);
        let lp = ListParams::default().labels(label_selector);
        let probe = ResourceKey { kind, namespace: namespace.map(|s| s.to_string()), name: "*".into() };
        let list = self.bounded(Verb::List, &probe, api.list(&lp)).await?;
        let mut out = Vec::with_capacity(list.items.len());
        for o in list.items {
            match serde_json::to_value(&o) {
                Ok(v) => out.push(v),
                Err(e) => return Err(ClusterError::InvalidManifest { key: probe.to_string(), reason: e.to_string() }),
            }
        }
        Ok(out)
    }

    async fn create(&self, key: &ResourceKey, manifest: &Json) -> Result<(), ClusterError> {
        let api = self.api(key.kind, key.namespace.as_deref());
        let obj = to_dynamic(key, manifest)?;
        let pp = PostParams { field_manager: Some(FIELD_MANAGER.to_string()), ..Default::default() };
        self.bounded(Verb::Create, key, api.create(&pp, &obj)).await?;
        counter!("cluster_create_total", 1u64);
        Ok(())
    }

    async fn update(&self, key: &ResourceKey, manifest: &Json) -> Result<(), ClusterError> {
        let api = self.api(key.kind, key.namespace.as_deref());
        // Server-side apply; we are the only intended writer of these fields
        let pp = PatchParams::apply(FIELD_MANAGER).force();
        self.bounded(Verb::Update, key, api.patch(&key.name, &pp, &Patch::Apply(manifest))).await?;
        counter!("cluster_update_total", 1u64);
        Ok(())
    }

    async fn delete(&self, key: &ResourceKey) -> Result<(), ClusterError> {
        let api = self.api(key.kind, key.namespace.as_deref());
        match self.bounded(Verb::Delete, key, api.delete(&key.name, &DeleteParams::background())).await {
            Ok(_) | Err(ClusterError::NotFound(_)) => {
                counter!("cluster_delete_total", 1u64);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
