//! SQLite-backed shared backend. Simple, synchronous; the pipeline is not
//! latency sensitive here. The database file sits on storage every run can reach.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use keel_core::StackId;
use metrics::{counter, histogram};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, info, warn};

use crate::{maybe_compress, maybe_decompress, now_ms, ttl_ms, Backend, BackendError, Lease, LockInfo, OutputLookup, StateRecord, STATE_HISTORY};

pub struct SqliteBackend {
    db: Mutex<Connection>,
}

impl SqliteBackend {
    pub fn open_default() -> Result<Self, BackendError> {
        let path = std::env::var("KEEL_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path, default_busy_timeout())
    }

    /// Open (or create) the database. `busy_timeout` bounds how long a call waits
    /// on another process holding the SQLite write lock.
    pub fn open(path: &str, busy_timeout: Duration) -> Result<Self, BackendError> {
        let started = Instant::now();
        let db = Connection::open(path)?;
        db.busy_timeout(busy_timeout)?;
        if let Err(e) = db.pragma_update(None, "journal_mode", "WAL") {
            warn!(error = %e, path, "WAL unavailable; using default journal");
        }
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS stacks (
                namespace  TEXT NOT NULL,
                stack      TEXT NOT NULL,
                created_ms INTEGER NOT NULL,
                PRIMARY KEY (namespace, stack)
            );
            CREATE TABLE IF NOT EXISTS outputs (
                namespace TEXT NOT NULL,
                stack     TEXT NOT NULL,
                name      TEXT NOT NULL,
                value     TEXT NOT NULL,
                PRIMARY KEY (namespace, stack, name)
            );
            CREATE TABLE IF NOT EXISTS state (
                namespace TEXT NOT NULL,
                stack     TEXT NOT NULL,
                serial    INTEGER NOT NULL,
                ts_ms     INTEGER NOT NULL,
                body      BLOB NOT NULL,
                PRIMARY KEY (namespace, stack, serial)
            );
            CREATE TABLE IF NOT EXISTS locks (
                namespace   TEXT NOT NULL,
                stack       TEXT NOT NULL,
                holder      TEXT NOT NULL,
                acquired_ms INTEGER NOT NULL,
                expires_ms  INTEGER NOT NULL,
                PRIMARY KEY (namespace, stack)
            );",
        )?;
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(path, "sqlite backend opened");
        Ok(Self { db: Mutex::new(db) })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, BackendError> {
        self.db.lock().map_err(|_| BackendError::Poisoned)
    }
}

fn read_lock(conn: &Connection, scope: &StackId) -> Result<Option<LockInfo>, BackendError> {
    let row = conn
        .query_row(
            "SELECT holder, acquired_ms, expires_ms FROM locks WHERE namespace = ?1 AND stack = ?2",
            (&scope.namespace, &scope.stack),
            |r| Ok(LockInfo { holder: r.get(0)?, acquired_at_ms: r.get(1)?, expires_at_ms: r.get(2)? }),
        )
        .optional()?;
    Ok(row)
}

/// The lease must still own an unexpired lock.
fn check_lease(conn: &Connection, lease: &Lease) -> Result<(), BackendError> {
    match read_lock(conn, &lease.scope)? {
        Some(l) if l.holder == lease.holder && l.expires_at_ms > now_ms() => Ok(()),
        _ => Err(BackendError::LockNotHeld(lease.scope.clone())),
    }
}

fn touch_stack(conn: &Connection, stack: &StackId) -> Result<(), BackendError> {
    conn.execute(
        "INSERT OR IGNORE INTO stacks(namespace, stack, created_ms) VALUES (?1, ?2, ?3)",
        (&stack.namespace, &stack.stack, now_ms()),
    )?;
    Ok(())
}

fn stack_exists(conn: &Connection, stack: &StackId) -> Result<bool, BackendError> {
    let found = conn
        .query_row(
            "SELECT 1 FROM stacks WHERE namespace = ?1 AND stack = ?2",
            (&stack.namespace, &stack.stack),
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

impl Backend for SqliteBackend {
    fn get_output(&self, stack: &StackId, key: &str) -> Result<OutputLookup, BackendError> {
        let started = Instant::now();
        let db = self.conn()?;
        if !stack_exists(&db, stack)? {
            return Ok(OutputLookup::MissingStack);
        }
        let value: Option<String> = db
            .query_row(
                "SELECT value FROM outputs WHERE namespace = ?1 AND stack = ?2 AND name = ?3",
                (&stack.namespace, &stack.stack, key),
                |r| r.get(0),
            )
            .optional()?;
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(match value {
            Some(v) => OutputLookup::Found(v),
            None => OutputLookup::MissingKey,
        })
    }

    fn get_outputs(&self, stack: &StackId) -> Result<Option<BTreeMap<String, String>>, BackendError> {
        let db = self.conn()?;
        if !stack_exists(&db, stack)? {
            return Ok(None);
        }
        let mut stmt = db.prepare("SELECT name, value FROM outputs WHERE namespace = ?1 AND stack = ?2 ORDER BY name")?;
        let mut rows = stmt.query((&stack.namespace, &stack.stack))?;
        let mut out = BTreeMap::new();
        while let Some(row) = rows.next()? {
            out.insert(row.get::<_, String>(0)?, row.get::<_, String>(1)?);
        }
        Ok(Some(out))
    }

    fn put_outputs(&self, lease: &Lease, outputs: &BTreeMap<String, String>) -> Result<(), BackendError> {
        let started = Instant::now();
        let mut db = self.conn()?;
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        check_lease(&tx, lease)?;
        touch_stack(&tx, &lease.scope)?;
        tx.execute(
            "DELETE FROM outputs WHERE namespace = ?1 AND stack = ?2",
            (&lease.scope.namespace, &lease.scope.stack),
        )?;
        for (name, value) in outputs {
            tx.execute(
                "INSERT INTO outputs(namespace, stack, name, value) VALUES (?1, ?2, ?3, ?4)",
                (&lease.scope.namespace, &lease.scope.stack, name, value),
            )?;
        }
        tx.commit()?;
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_outputs_put_total", 1u64);
        Ok(())
    }

    fn get_state(&self, stack: &StackId) -> Result<Option<StateRecord>, BackendError> {
        let started = Instant::now();
        let db = self.conn()?;
        let row = db
            .query_row(
                "SELECT serial, ts_ms, body FROM state WHERE namespace = ?1 AND stack = ?2 ORDER BY serial DESC LIMIT 1",
                (&stack.namespace, &stack.stack),
                |r| {
                    let serial: i64 = r.get(0)?;
                    let ts_ms: i64 = r.get(1)?;
                    let body: Vec<u8> = r.get(2)?;
                    Ok((serial, ts_ms, body))
                },
            )
            .optional()?;
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        match row {
            Some((serial, ts_ms, body)) => {
                let serial = u64::try_from(serial).map_err(|_| BackendError::Corrupt(format!("negative serial {serial}")))?;
                Ok(Some(StateRecord { serial, ts_ms, body: maybe_decompress(&body) }))
            }
            None => Ok(None),
        }
    }

    fn put_state(&self, lease: &Lease, body: &[u8]) -> Result<u64, BackendError> {
        let started = Instant::now();
        let mut db = self.conn()?;
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        check_lease(&tx, lease)?;
        touch_stack(&tx, &lease.scope)?;
        let ns = &lease.scope.namespace;
        let st = &lease.scope.stack;
        let prev: i64 = tx.query_row(
            "SELECT COALESCE(MAX(serial), 0) FROM state WHERE namespace = ?1 AND stack = ?2",
            (ns, st),
            |r| r.get(0),
        )?;
        let serial = prev + 1;
        tx.execute(
            "INSERT INTO state(namespace, stack, serial, ts_ms, body) VALUES (?1, ?2, ?3, ?4, ?5)",
            (ns, st, serial, now_ms(), maybe_compress(body)),
        )?;
        // Keep the latest few documents per stack
        tx.execute(
            "DELETE FROM state WHERE namespace = ?1 AND stack = ?2 AND serial <= ?3",
            (ns, st, serial - STATE_HISTORY as i64),
        )?;
        tx.commit()?;
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_state_put_total", 1u64);
        Ok(serial as u64)
    }

    fn acquire_lock(&self, scope: &StackId, holder: &str, ttl: Duration) -> Result<Lease, BackendError> {
        let mut db = self.conn()?;
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = now_ms();
        if let Some(cur) = read_lock(&tx, scope)? {
            if cur.holder != holder && cur.expires_at_ms > now {
                counter!("persist_lock_contended_total", 1u64);
                return Err(BackendError::LockHeld { scope: scope.clone(), holder: cur.holder, expires_at_ms: cur.expires_at_ms });
            }
            if cur.holder != holder {
                warn!(scope = %scope, stale_holder = %cur.holder, "taking over expired lock");
            }
        }
        let expires = now.saturating_add(ttl_ms(ttl));
        tx.execute(
            "INSERT OR REPLACE INTO locks(namespace, stack, holder, acquired_ms, expires_ms) VALUES (?1, ?2, ?3, ?4, ?5)",
            (&scope.namespace, &scope.stack, holder, now, expires),
        )?;
        tx.commit()?;
        counter!("persist_lock_acquired_total", 1u64);
        info!(scope = %scope, holder, "lock acquired");
        Ok(Lease { scope: scope.clone(), holder: holder.to_string(), acquired_at_ms: now, expires_at_ms: expires })
    }

    fn release_lock(&self, lease: &Lease) -> Result<(), BackendError> {
        let mut db = self.conn()?;
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        match read_lock(&tx, &lease.scope)? {
            None => {}
            Some(cur) if cur.holder == lease.holder => {
                tx.execute(
                    "DELETE FROM locks WHERE namespace = ?1 AND stack = ?2 AND holder = ?3",
                    (&lease.scope.namespace, &lease.scope.stack, &lease.holder),
                )?;
            }
            Some(_) => return Err(BackendError::LockNotHeld(lease.scope.clone())),
        }
        tx.commit()?;
        info!(scope = %lease.scope, holder = %lease.holder, "lock released");
        Ok(())
    }

    fn check_lease(&self, lease: &Lease) -> Result<(), BackendError> {
        let db = self.conn()?;
        check_lease(&db, lease)
    }

    fn lock_info(&self, scope: &StackId) -> Result<Option<LockInfo>, BackendError> {
        let db = self.conn()?;
        read_lock(&db, scope)
    }

    fn force_unlock(&self, scope: &StackId) -> Result<Option<LockInfo>, BackendError> {
        let mut db = self.conn()?;
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let cur = read_lock(&tx, scope)?;
        tx.execute("DELETE FROM locks WHERE namespace = ?1 AND stack = ?2", (&scope.namespace, &scope.stack))?;
        tx.commit()?;
        if let Some(c) = &cur {
            warn!(scope = %scope, holder = %c.holder, "lock force-released");
        }
        Ok(cur)
    }
}

fn default_busy_timeout() -> Duration {
    let secs = std::env::var("KEEL_BACKEND_TIMEOUT_SECS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(30);
    Duration::from_secs(secs)
}

fn default_db_path() -> String {
    db_path_under(std::env::var_os("HOME"))
}

/// `<home>/.keel/keel.db`, or `keel.db` in the working directory without a home.
fn db_path_under(home: Option<std::ffi::OsString>) -> String {
    let Some(home) = home else {
        return "keel.db".to_string();
    };
    let dir = std::path::PathBuf::from(home).join(".keel");
    if let Err(e) = std::fs::create_dir_all(&dir) {
        warn!(dir = %dir.display(), error = %e, "cannot create the backend directory; opening the database will fail");
    }
    dir.join("keel.db").to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conformance;

    fn temp_backend() -> (tempfile::TempDir, SqliteBackend) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keel-test.db");
        let b = SqliteBackend::open(path.to_str().unwrap(), Duration::from_secs(2)).unwrap();
        (dir, b)
    }

    #[test]
    fn outputs_lookup() {
        let (_d, b) = temp_backend();
        conformance::outputs_distinguish_missing_stack_key_and_empty(&b);
    }

    #[test]
    fn lock_exclusion() {
        let (_d, b) = temp_backend();
        conformance::lock_excludes_other_holders_until_released(&b);
    }

    #[test]
    fn lock_takeover() {
        let (_d, b) = temp_backend();
        conformance::expired_lock_is_taken_over(&b);
    }

    #[test]
    fn state_rotation() {
        let (_d, b) = temp_backend();
        conformance::state_serials_increase_and_history_rotates(&b);
        let db = b.conn().unwrap();
        let rows: i64 = db.query_row("SELECT COUNT(*) FROM state", [], |r| r.get(0)).unwrap();
        assert_eq!(rows as usize, STATE_HISTORY);
    }

    #[test]
    fn lock_is_shared_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.db");
        let a = SqliteBackend::open(path.to_str().unwrap(), Duration::from_secs(2)).unwrap();
        let b = SqliteBackend::open(path.to_str().unwrap(), Duration::from_secs(2)).unwrap();
        let stack = StackId::new("apps", "booker");
        let lease = a.acquire_lock(&stack, "run-a", Duration::from_secs(60)).unwrap();
        assert!(b.acquire_lock(&stack, "run-b", Duration::from_secs(60)).unwrap_err().is_contention());
        a.release_lock(&lease).unwrap();
        assert!(b.acquire_lock(&stack, "run-b", Duration::from_secs(60)).is_ok());
    }

    #[test]
    fn default_path_lives_under_home() {
        let home = tempfile::tempdir().unwrap();
        let path = db_path_under(Some(home.path().as_os_str().to_owned()));
        assert!(path.ends_with("keel.db"));
        assert!(home.path().join(".keel").is_dir());
        SqliteBackend::open(&path, Duration::from_secs(2)).unwrap();

        // a home that is a plain file cannot hold the directory; the path is still returned
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = db_path_under(Some(file.path().as_os_str().to_owned()));
        assert!(SqliteBackend::open(&path, Duration::from_secs(2)).is_err());
        assert_eq!(db_path_under(None), "keel.db");
    }
}
