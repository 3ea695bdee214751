//! Keel persistence: the shared backend holding stack outputs, reconciliation
//! state and the per-stack lock. Keep code tiny and predictable.
//!
//! Writes require a [`Lease`] obtained from [`Backend::acquire_lock`]; the
//! backend refuses state writes from a holder that does not own the lock.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::time::Duration;

use keel_core::StackId;
use serde::{Deserialize, Serialize};

mod memory;
mod sqlite;

pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("lock for {scope} held by {holder} until {expires_at_ms}")]
    LockHeld { scope: StackId, holder: String, expires_at_ms: i64 },
    #[error("lock for {0} not held by this run (expired or taken over)")]
    LockNotHeld(StackId),
    #[error("stored state is corrupt: {0}")]
    Corrupt(String),
    #[error("backend connection poisoned")]
    Poisoned,
}

impl BackendError {
    pub fn is_contention(&self) -> bool {
        matches!(self, BackendError::LockHeld { .. })
    }
}

/// Result of reading a single output of another stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLookup {
    Found(String),
    /// The stack exists but has no output by that name.
    MissingKey,
    /// The stack has never been applied.
    MissingStack,
}

/// One persisted reconciliation state document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateRecord {
    pub serial: u64,
    pub ts_ms: i64,
    /// JSON document, opaque to this crate.
    pub body: Vec<u8>,
}

/// Proof of holding the lock for one stack scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub scope: StackId,
    pub holder: String,
    pub acquired_at_ms: i64,
    pub expires_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub holder: String,
    pub acquired_at_ms: i64,
    pub expires_at_ms: i64,
}

pub trait Backend: Send + Sync {
    /// Read one output of `stack`, distinguishing a missing stack from a missing key.
    fn get_output(&self, stack: &StackId, key: &str) -> Result<OutputLookup, BackendError>;

    /// All outputs of a stack; `None` if it was never applied.
    fn get_outputs(&self, stack: &StackId) -> Result<Option<BTreeMap<String, String>>, BackendError>;

    /// Replace the outputs of the leased stack.
    fn put_outputs(&self, lease: &Lease, outputs: &BTreeMap<String, String>) -> Result<(), BackendError>;

    /// Latest reconciliation state of a stack.
    fn get_state(&self, stack: &StackId) -> Result<Option<StateRecord>, BackendError>;

    /// Append a new state document for the leased stack; returns the new serial.
    fn put_state(&self, lease: &Lease, body: &[u8]) -> Result<u64, BackendError>;

    /// Take the lock or fail with [`BackendError::LockHeld`]. Expired locks are taken over.
    fn acquire_lock(&self, scope: &StackId, holder: &str, ttl: Duration) -> Result<Lease, BackendError>;

    /// Release a lease. Releasing a lock that was already taken over is an error;
    /// releasing one that no longer exists is not.
    fn release_lock(&self, lease: &Lease) -> Result<(), BackendError>;

    /// Fails with [`BackendError::LockNotHeld`] once the lease expired or was taken over.
    fn check_lease(&self, lease: &Lease) -> Result<(), BackendError>;

    fn lock_info(&self, scope: &StackId) -> Result<Option<LockInfo>, BackendError>;

    /// Operator escape hatch; returns the removed lock, if any.
    fn force_unlock(&self, scope: &StackId) -> Result<Option<LockInfo>, BackendError>;
}

impl<B: Backend + ?Sized> Backend for std::sync::Arc<B> {
    fn get_output(&self, stack: &StackId, key: &str) -> Result<OutputLookup, BackendError> { (**self).get_output(stack, key) }
    fn get_outputs(&self, stack: &StackId) -> Result<Option<BTreeMap<String, String>>, BackendError> { (**self).get_outputs(stack) }
    fn put_outputs(&self, lease: &Lease, outputs: &BTreeMap<String, String>) -> Result<(), BackendError> { (**self).put_outputs(lease, outputs) }
    fn get_state(&self, stack: &StackId) -> Result<Option<StateRecord>, BackendError> { (**self).get_state(stack) }
    fn put_state(&self, lease: &Lease, body: &[u8]) -> Result<u64, BackendError> { (**self).put_state(lease, body) }
    fn acquire_lock(&self, scope: &StackId, holder: &str, ttl: Duration) -> Result<Lease, BackendError> { (**self).acquire_lock(scope, holder, ttl) }
    fn release_lock(&self, lease: &Lease) -> Result<(), BackendError> { (**self).release_lock(lease) }
    fn check_lease(&self, lease: &Lease) -> Result<(), BackendError> { (**self).check_lease(lease) }
    fn lock_info(&self, scope: &StackId) -> Result<Option<LockInfo>, BackendError> { (**self).lock_info(scope) }
    fn force_unlock(&self, scope: &StackId) -> Result<Option<LockInfo>, BackendError> { (**self).force_unlock(scope) }
}

/// Milliseconds since epoch.
pub fn now_ms() -> i64 {
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    now.as_millis() as i64
}

fn ttl_ms(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

/// How many state documents are retained per stack.
pub const STATE_HISTORY: usize = 3;

#[allow(unreachable_code)]
pub fn maybe_compress(body: &[u8]) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        let lvl: i32 = std::env::var("KEEL_ZSTD_LEVEL").ok().and_then(|s| s.parse().ok()).unwrap_or(3);
        return zstd::encode_all(body, lvl).unwrap_or_else(|_| body.to_vec());
    }
    body.to_vec()
}

pub fn maybe_decompress(blob: &[u8]) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        if let Ok(de) = zstd::decode_all(std::io::Cursor::new(blob)) {
            return de;
        }
    }
    blob.to_vec()
}
