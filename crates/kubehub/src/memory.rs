//! In-memory cluster used by tests and `--cluster memory` dry runs.
//! Mimics the server bits the applier can observe: uid/resourceVersion
//! assignment, namespace cascade on delete, 409 on duplicate create.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Mutex;

use async_trait::async_trait;
use keel_core::{ResourceKey, ResourceKind};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::{Cluster, ClusterError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verb {
    Get,
    List,
    Create,
    Update,
    Delete,
}

impl Verb {
    pub fn is_mutation(&self) -> bool {
        matches!(self, Verb::Create | Verb::Update | Verb::Delete)
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verb::Get => "get",
            Verb::List => "list",
            Verb::Create => "create",
            Verb::Update => "update",
            Verb::Delete => "delete",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterCall {
    pub verb: Verb,
    pub key: ResourceKey,
}

#[derive(Debug, Default)]
struct Inner {
    objects: BTreeMap<ResourceKey, Json>,
    calls: Vec<ClusterCall>,
    failures: HashMap<(Verb, ResourceKind), String>,
    unreachable: bool,
    next_rv: u64,
}

#[derive(Debug, Default)]
pub struct MemoryCluster {
    inner: Mutex<Inner>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an object as if someone else had created it (not recorded as a call).
    pub fn seed(&self, key: ResourceKey, manifest: Json) {
        let mut g = self.lock();
        let stored = stamp(&mut g, &key, manifest, None);
        g.objects.insert(key, stored);
    }

    /// Make every `verb` on `kind` fail with `reason` until cleared.
    pub fn fail_on(&self, verb: Verb, kind: ResourceKind, reason: impl Into<String>) {
        self.lock().failures.insert((verb, kind), reason.into());
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Simulate an API server that cannot be reached at all.
    pub fn set_unreachable(&self, on: bool) {
        self.lock().unreachable = on;
    }

    pub fn object(&self, key: &ResourceKey) -> Option<Json> {
        self.lock().objects.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<ResourceKey> {
        self.lock().objects.keys().cloned().collect()
    }

    pub fn calls(&self) -> Vec<ClusterCall> {
        self.lock().calls.clone()
    }

    pub fn mutation_count(&self) -> usize {
        self.lock().calls.iter().filter(|c| c.verb.is_mutation()).count()
    }

    pub fn reset_calls(&self) {
        self.lock().calls.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panicking test thread must not hide the state from the assertions that follow.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn enter(&self, verb: Verb, key: &ResourceKey) -> Result<std::sync::MutexGuard<'_, Inner>, ClusterError> {
        let mut g = self.lock();
        if g.unreachable {
            return Err(ClusterError::Config("cluster unreachable".into()));
        }
        g.calls.push(ClusterCall { verb, key: key.clone() });
        if let Some(reason) = g.failures.get(&(verb, key.kind)) {
            return Err(ClusterError::Rejected(format!("{}: {}", key, reason)));
        }
        Ok(g)
    }
}

/// Assign server-owned metadata the way an API server would.
fn stamp(inner: &mut Inner, key: &ResourceKey, mut manifest: Json, prev: Option<&Json>) -> Json {
    inner.next_rv += 1;
    let rv = inner.next_rv.to_string();
    let uid = prev
        .and_then(|p| p.pointer("/metadata/uid").and_then(|v| v.as_str()).map(|s| s.to_string()))
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    if let Some(obj) = manifest.as_object_mut() {
        let meta = obj.entry("metadata").or_insert_with(|| Json::Object(Default::default()));
        if let Some(m) = meta.as_object_mut() {
            m.insert("name".into(), Json::String(key.name.clone()));
            if let Some(ns) = &key.namespace {
                m.insert("namespace".into(), Json::String(ns.clone()));
            }
            m.insert("uid".into(), Json::String(uid));
            m.insert("resourceVersion".into(), Json::String(rv));
            m.insert("creationTimestamp".into(), Json::String("2024-01-01T00:00:00Z".into()));
        }
        if key.kind.is_workload() {
            obj.insert("status".into(), serde_json::json!({ "observedGeneration": inner.next_rv }));
        }
    }
    manifest
}

/// Equality-only selector matching (`k=v,k2=v2`).
fn matches_selector(obj: &Json, selector: &str) -> bool {
    let labels = obj.pointer("/metadata/labels").and_then(|l| l.as_object());
    selector.split(',').map(str::trim).filter(|s| !s.is_empty()).all(|term| match term.split_once('=') {
        Some((k, v)) => labels.and_then(|l| l.get(k.trim())).and_then(|x| x.as_str()) == Some(v.trim()),
        None => false,
    })
}

#[async_trait]
impl Cluster for MemoryCluster {
    async fn get(&self, key: &ResourceKey) -> Result<Option<Json>, ClusterError> {
        let g = self.enter(Verb::Get, key)?;
        Ok(g.objects.get(key).cloned())
    }

    async fn list(&self, kind: ResourceKind, namespace: Option<&str>, label_selector: &str) -> Result<Vec<Json>, ClusterError> {
        let probe = ResourceKey { kind, namespace: namespace.map(|s| s.to_string()), name: "*".into() };
        let g = self.enter(Verb::List, &probe)?;
        Ok(g.objects
            .iter()
            .filter(|(k, _)| k.kind == kind)
            .filter(|(k, _)| namespace.map(|ns| k.namespace.as_deref() == Some(ns)).unwrap_or(true))
            .filter(|(_, v)| matches_selector(v, label_selector))
            .map(|(_, v)| v.clone())
            .collect())
    }

    async fn create(&self, key: &ResourceKey, manifest: &Json) -> Result<(), ClusterError> {
        let mut g = self.enter(Verb::Create, key)?;
        if g.objects.contains_key(key) {
            return Err(ClusterError::AlreadyExists(key.to_string()));
        }
        if let Some(ns) = key.namespace.as_deref() {
            if !g.objects.contains_key(&ResourceKey::namespace(ns)) {
                return Err(ClusterError::NotFound(format!("namespace {}", ns)));
            }
        }
        let stored = stamp(&mut g, key, manifest.clone(), None);
        g.objects.insert(key.clone(), stored);
        Ok(())
    }

    async fn update(&self, key: &ResourceKey, manifest: &Json) -> Result<(), ClusterError> {
        let mut g = self.enter(Verb::Update, key)?;
        let prev = g.objects.get(key).cloned();
        if prev.is_none() {
            if let Some(ns) = key.namespace.as_deref() {
                if !g.objects.contains_key(&ResourceKey::namespace(ns)) {
                    return Err(ClusterError::NotFound(format!("namespace {}", ns)));
                }
            }
        }
        let stored = stamp(&mut g, key, manifest.clone(), prev.as_ref());
        g.objects.insert(key.clone(), stored);
        Ok(())
    }

    async fn delete(&self, key: &ResourceKey) -> Result<(), ClusterError> {
        let mut g = self.enter(Verb::Delete, key)?;
        g.objects.remove(key);
        if key.kind == ResourceKind::Namespace {
            g.objects.retain(|k, _| k.namespace.as_deref() != Some(key.name.as_str()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cm(ns: &str, name: &str, stack: &str) -> Json {
        json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": name, "namespace": ns, "labels": {"keel.dev/stack": stack}},
            "data": {"k": "v"}
        })
    }

    #[tokio::test]
    async fn create_requires_namespace_and_rejects_duplicates() {
        let c = MemoryCluster::new();
        let key = ResourceKey::namespaced(ResourceKind::ConfigMap, "apps", "a");
        assert!(matches!(c.create(&key, &cm("apps", "a", "s")).await, Err(ClusterError::NotFound(_))));
        c.create(&ResourceKey::namespace("apps"), &json!({"apiVersion": "v1", "kind": "Namespace"})).await.unwrap();
        c.create(&key, &cm("apps", "a", "s")).await.unwrap();
        assert!(matches!(c.create(&key, &cm("apps", "a", "s")).await, Err(ClusterError::AlreadyExists(_))));
        let stored = c.object(&key).unwrap();
        assert!(stored.pointer("/metadata/uid").is_some());
        // attempts are recorded, including rejected ones
        assert_eq!(c.mutation_count(), 4);
    }

    #[tokio::test]
    async fn list_filters_by_selector_and_namespace() {
        let c = MemoryCluster::new();
        c.seed(ResourceKey::namespaced(ResourceKind::ConfigMap, "a", "x"), cm("a", "x", "one"));
        c.seed(ResourceKey::namespaced(ResourceKind::ConfigMap, "b", "y"), cm("b", "y", "one"));
        c.seed(ResourceKey::namespaced(ResourceKind::ConfigMap, "a", "z"), cm("a", "z", "two"));
        assert_eq!(c.list(ResourceKind::ConfigMap, None, "keel.dev/stack=one").await.unwrap().len(), 2);
        assert_eq!(c.list(ResourceKind::ConfigMap, Some("a"), "keel.dev/stack=one").await.unwrap().len(), 1);
        assert_eq!(c.list(ResourceKind::Secret, None, "").await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn namespace_delete_cascades() {
        let c = MemoryCluster::new();
        c.seed(ResourceKey::namespace("a"), json!({"apiVersion": "v1", "kind": "Namespace"}));
        c.seed(ResourceKey::namespaced(ResourceKind::ConfigMap, "a", "x"), cm("a", "x", "one"));
        c.delete(&ResourceKey::namespace("a")).await.unwrap();
        assert!(c.keys().is_empty());
        // deleting again is fine
        c.delete(&ResourceKey::namespace("a")).await.unwrap();
    }

    #[tokio::test]
    async fn injected_failures_are_reported() {
        let c = MemoryCluster::new();
        c.fail_on(Verb::Create, ResourceKind::Secret, "admission denied");
        let key = ResourceKey::namespaced(ResourceKind::Secret, "a", "s");
        let err = c.create(&key, &json!({})).await.unwrap_err();
        assert!(err.to_string().contains("admission denied"));
        c.set_unreachable(true);
        assert!(c.get(&key).await.is_err());
    }
}
