//! Keel resolver: reads named outputs persisted by other, independently
//! deployed stacks. Nothing is cached between runs; every [`Resolver::resolve`]
//! call goes back to the backend so upstream changes show up on the next run.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use keel_core::StackId;
use keel_persist::{Backend, BackendError, OutputLookup};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Name of the backend location used when a request does not name one.
pub const DEFAULT_LOCATION: &str = "default";

/// The only capability the resolver needs from a backend.
pub trait OutputSource: Send + Sync {
    fn get(&self, stack: &StackId, key: &str) -> Result<OutputLookup, BackendError>;
}

impl<B: Backend + ?Sized> OutputSource for B {
    fn get(&self, stack: &StackId, key: &str) -> Result<OutputLookup, BackendError> {
        self.get_output(stack, key)
    }
}

/// One remote value to fetch, and the key it is exposed under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRequest {
    /// Backend location name; `None` means [`DEFAULT_LOCATION`].
    #[serde(default)]
    pub backend: Option<String>,
    /// Flattened so config reads `{ namespace, stack, output }`.
    #[serde(flatten)]
    pub stack: StackId,
    pub output: String,
    /// Key in the resolved configuration; defaults to `output`.
    #[serde(default, rename = "as")]
    pub alias: Option<String>,
}

impl OutputRequest {
    pub fn new(stack: StackId, output: impl Into<String>) -> Self {
        Self { backend: None, stack, output: output.into(), alias: None }
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.output)
    }

    pub fn location(&self) -> &str {
        self.backend.as_deref().unwrap_or(DEFAULT_LOCATION)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("stack {stack} has never been applied (backend {location})")]
    StackNotFound { stack: StackId, location: String },
    #[error("stack {stack} has no output {output:?}")]
    OutputNotFound { stack: StackId, output: String },
    #[error("no backend location named {0:?}")]
    UnknownBackend(String),
    #[error("two requests resolve to key {0:?}")]
    DuplicateKey(String),
    #[error("reading {stack} from backend {location}: {source}")]
    Backend { stack: StackId, location: String, #[source] source: BackendError },
}

/// Resolved values keyed by request alias. `Debug` never prints values.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ResolvedConfig(BTreeMap<String, String>);

impl ResolvedConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> BTreeMap<String, String> {
        self.0
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ResolvedConfig {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl fmt::Debug for ResolvedConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.0.keys()).finish()
    }
}

/// Per-run resolver over one or more named backend locations.
pub struct Resolver {
    sources: BTreeMap<String, Arc<dyn OutputSource>>,
}

impl Resolver {
    pub fn new() -> Self {
        Self { sources: BTreeMap::new() }
    }

    /// Single-location resolver.
    pub fn with_default(source: Arc<dyn OutputSource>) -> Self {
        Self::new().location(DEFAULT_LOCATION, source)
    }

    pub fn location(mut self, name: impl Into<String>, source: Arc<dyn OutputSource>) -> Self {
        self.sources.insert(name.into(), source);
        self
    }

    /// Fetch one value. An empty value is returned as-is.
    pub fn resolve_one(&self, req: &OutputRequest) -> Result<String, ResolveError> {
        let location = req.location();
        let source = self.sources.get(location).ok_or_else(|| ResolveError::UnknownBackend(location.to_string()))?;
        let lookup = source
            .get(&req.stack, &req.output)
            .map_err(|e| ResolveError::Backend { stack: req.stack.clone(), location: location.to_string(), source: e })?;
        match lookup {
            OutputLookup::Found(v) => {
                if v.is_empty() {
                    debug!(stack = %req.stack, output = %req.output, "remote output is present but empty");
                }
                Ok(v)
            }
            OutputLookup::MissingKey => Err(ResolveError::OutputNotFound { stack: req.stack.clone(), output: req.output.clone() }),
            OutputLookup::MissingStack => Err(ResolveError::StackNotFound { stack: req.stack.clone(), location: location.to_string() }),
        }
    }

    /// Fetch every request; the first failure aborts.
    pub fn resolve(&self, requests: &[OutputRequest]) -> Result<ResolvedConfig, ResolveError> {
        let t0 = Instant::now();
        let mut out = BTreeMap::new();
        for req in requests {
            if out.contains_key(req.key()) {
                return Err(ResolveError::DuplicateKey(req.key().to_string()));
            }
            match self.resolve_one(req) {
                Ok(v) => {
                    out.insert(req.key().to_string(), v);
                }
                Err(e) => {
                    counter!("resolve_err", 1u64);
                    return Err(e);
                }
            }
        }
        histogram!("resolve_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(count = out.len(), "remote outputs resolved");
        Ok(ResolvedConfig(out))
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_persist::MemoryBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn upstream() -> StackId {
        StackId::new("platform", "config-api")
    }

    #[test]
    fn resolves_aliased_outputs() {
        let b = MemoryBackend::new().with_outputs(&upstream(), [("url", "https://cfg.example/x")]);
        let r = Resolver::with_default(Arc::new(b));
        let cfg = r.resolve(&[OutputRequest::new(upstream(), "url").alias("base_url")]).unwrap();
        assert_eq!(cfg.get("base_url"), Some("https://cfg.example/x"));
        assert_eq!(cfg.len(), 1);
    }

    #[test]
    fn missing_stack_and_missing_key_are_distinct() {
        let r = Resolver::with_default(Arc::new(MemoryBackend::new().with_outputs(&upstream(), [("other", "x")])));
        let err = r.resolve_one(&OutputRequest::new(StackId::new("platform", "never"), "url")).unwrap_err();
        assert!(matches!(err, ResolveError::StackNotFound { .. }), "{err}");
        let err = r.resolve_one(&OutputRequest::new(upstream(), "url")).unwrap_err();
        assert!(matches!(err, ResolveError::OutputNotFound { .. }), "{err}");
    }

    #[test]
    fn empty_value_is_legitimate() {
        let r = Resolver::with_default(Arc::new(MemoryBackend::new().with_outputs(&upstream(), [("url", "")])));
        assert_eq!(r.resolve_one(&OutputRequest::new(upstream(), "url")).unwrap(), "");
    }

    #[test]
    fn unknown_location_and_duplicate_keys_fail() {
        let r = Resolver::with_default(Arc::new(MemoryBackend::new().with_outputs(&upstream(), [("a", "1"), ("b", "2")])));
        let mut req = OutputRequest::new(upstream(), "a");
        req.backend = Some("elsewhere".into());
        assert!(matches!(r.resolve_one(&req), Err(ResolveError::UnknownBackend(_))));
        let dup = [OutputRequest::new(upstream(), "a").alias("k"), OutputRequest::new(upstream(), "b").alias("k")];
        assert!(matches!(r.resolve(&dup), Err(ResolveError::DuplicateKey(_))));
    }

    struct Counting {
        inner: MemoryBackend,
        reads: AtomicUsize,
    }

    impl OutputSource for Counting {
        fn get(&self, stack: &StackId, key: &str) -> Result<OutputLookup, BackendError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.get_output(stack, key)
        }
    }

    #[test]
    fn every_resolve_reads_the_backend() {
        let src = Arc::new(Counting { inner: MemoryBackend::new().with_outputs(&upstream(), [("url", "v1")]), reads: AtomicUsize::new(0) });
        let r = Resolver::with_default(src.clone());
        let reqs = [OutputRequest::new(upstream(), "url")];
        r.resolve(&reqs).unwrap();
        r.resolve(&reqs).unwrap();
        assert_eq!(src.reads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn debug_output_hides_values() {
        let cfg: ResolvedConfig = [("api_key", "abc123")].into_iter().collect();
        let dbg = format!("{:?}", cfg);
        assert!(dbg.contains("api_key"));
        assert!(!dbg.contains("abc123"));
    }
}
