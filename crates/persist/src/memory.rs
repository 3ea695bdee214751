use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use keel_core::StackId;

use crate::{now_ms, ttl_ms, Backend, BackendError, Lease, LockInfo, OutputLookup, StateRecord, STATE_HISTORY};

#[derive(Debug, Default)]
struct Inner {
    outputs: HashMap<StackId, BTreeMap<String, String>>,
    state: HashMap<StackId, Vec<StateRecord>>,
    locks: HashMap<StackId, LockInfo>,
}

/// In-process backend for tests and local dry runs.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    inner: Mutex<Inner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed another stack's outputs without going through the lock.
    pub fn with_outputs<I, K, V>(self, stack: &StackId, outputs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        if let Ok(mut g) = self.inner.lock() {
            let entry = g.outputs.entry(stack.clone()).or_default();
            for (k, v) in outputs {
                entry.insert(k.into(), v.into());
            }
        }
        self
    }

    fn inner(&self) -> Result<std::sync::MutexGuard<'_, Inner>, BackendError> {
        self.inner.lock().map_err(|_| BackendError::Poisoned)
    }
}

fn check_lease(inner: &Inner, lease: &Lease) -> Result<(), BackendError> {
    match inner.locks.get(&lease.scope) {
        Some(l) if l.holder == lease.holder && l.expires_at_ms > now_ms() => Ok(()),
        _ => Err(BackendError::LockNotHeld(lease.scope.clone())),
    }
}

impl Backend for MemoryBackend {
    fn get_output(&self, stack: &StackId, key: &str) -> Result<OutputLookup, BackendError> {
        let g = self.inner()?;
        Ok(match g.outputs.get(stack) {
            None => OutputLookup::MissingStack,
            Some(map) => match map.get(key) {
                Some(v) => OutputLookup::Found(v.clone()),
                None => OutputLookup::MissingKey,
            },
        })
    }

    fn get_outputs(&self, stack: &StackId) -> Result<Option<BTreeMap<String, String>>, BackendError> {
        Ok(self.inner()?.outputs.get(stack).cloned())
    }

    fn put_outputs(&self, lease: &Lease, outputs: &BTreeMap<String, String>) -> Result<(), BackendError> {
        let mut g = self.inner()?;
        check_lease(&g, lease)?;
        g.outputs.insert(lease.scope.clone(), outputs.clone());
        Ok(())
    }

    fn get_state(&self, stack: &StackId) -> Result<Option<StateRecord>, BackendError> {
        Ok(self.inner()?.state.get(stack).and_then(|v| v.last().cloned()))
    }

    fn put_state(&self, lease: &Lease, body: &[u8]) -> Result<u64, BackendError> {
        let mut g = self.inner()?;
        check_lease(&g, lease)?;
        g.outputs.entry(lease.scope.clone()).or_default();
        let history = g.state.entry(lease.scope.clone()).or_default();
        let serial = history.last().map(|r| r.serial).unwrap_or(0) + 1;
        history.push(StateRecord { serial, ts_ms: now_ms(), body: body.to_vec() });
        if history.len() > STATE_HISTORY {
            let excess = history.len() - STATE_HISTORY;
            history.drain(..excess);
        }
        Ok(serial)
    }

    fn acquire_lock(&self, scope: &StackId, holder: &str, ttl: Duration) -> Result<Lease, BackendError> {
        let mut g = self.inner()?;
        let now = now_ms();
        if let Some(cur) = g.locks.get(scope).cloned() {
            if cur.holder != holder && cur.expires_at_ms > now {
                return Err(BackendError::LockHeld { scope: scope.clone(), holder: cur.holder, expires_at_ms: cur.expires_at_ms });
            }
        }
        let info = LockInfo { holder: holder.to_string(), acquired_at_ms: now, expires_at_ms: now.saturating_add(ttl_ms(ttl)) };
        g.locks.insert(scope.clone(), info.clone());
        Ok(Lease { scope: scope.clone(), holder: info.holder, acquired_at_ms: info.acquired_at_ms, expires_at_ms: info.expires_at_ms })
    }

    fn release_lock(&self, lease: &Lease) -> Result<(), BackendError> {
        let mut g = self.inner()?;
        let holder = g.locks.get(&lease.scope).map(|cur| cur.holder.clone());
        match holder {
            None => Ok(()),
            Some(h) if h == lease.holder => {
                g.locks.remove(&lease.scope);
                Ok(())
            }
            Some(_) => Err(BackendError::LockNotHeld(lease.scope.clone())),
        }
    }

    fn check_lease(&self, lease: &Lease) -> Result<(), BackendError> {
        check_lease(&*self.inner()?, lease)
    }

    fn lock_info(&self, scope: &StackId) -> Result<Option<LockInfo>, BackendError> {
        Ok(self.inner()?.locks.get(scope).cloned())
    }

    fn force_unlock(&self, scope: &StackId) -> Result<Option<LockInfo>, BackendError> {
        Ok(self.inner()?.locks.remove(scope))
    }
}
