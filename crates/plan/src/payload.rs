use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use tracing::{debug, warn};

use crate::PlanError;

/// Key used when the payload is a single file rather than a directory.
pub const BLOB_KEY: &str = "config.json";

fn max_payload_bytes() -> usize {
    std::env::var("KEEL_MAX_PAYLOAD_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000) // ConfigMaps are capped at 1 MiB server-side
}

/// ConfigMap/Secret data keys: `[-._a-zA-Z0-9]+`, not `.` or `..`.
pub fn valid_key(k: &str) -> bool {
    !k.is_empty()
        && k != "."
        && k != ".."
        && k.len() <= 253
        && k.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.')
}

/// Static configuration shipped with the source tree, treated as opaque bytes.
#[derive(Clone, Default, PartialEq, Eq)]
pub enum ConfigPayload {
    #[default]
    Empty,
    /// One document, stored under [`BLOB_KEY`].
    Blob(Vec<u8>),
    /// Top-level files of a directory, keyed by file name.
    Files(BTreeMap<String, Vec<u8>>),
}

impl ConfigPayload {
    /// Load a file as a blob or a directory as files.
    pub fn load(path: &Path) -> Result<Self, PlanError> {
        let meta = std::fs::metadata(path).map_err(|e| PlanError::Io { path: path.display().to_string(), source: e })?;
        let payload = if meta.is_dir() {
            Self::load_dir(path)?
        } else {
            let bytes = std::fs::read(path).map_err(|e| PlanError::Io { path: path.display().to_string(), source: e })?;
            ConfigPayload::Blob(bytes)
        };
        payload.check_size()?;
        Ok(payload)
    }

    /// Regular files directly under `dir`. Nested directories cannot be
    /// expressed as ConfigMap keys and are skipped.
    pub fn load_dir(dir: &Path) -> Result<Self, PlanError> {
        let io = |e| PlanError::Io { path: dir.display().to_string(), source: e };
        let mut files = BTreeMap::new();
        for entry in std::fs::read_dir(dir).map_err(io)? {
            let entry = entry.map_err(io)?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().map_err(io)?.is_dir() {
                warn!(path = %path.display(), "skipping nested directory in config payload");
                continue;
            }
            if !valid_key(&name) {
                return Err(PlanError::InvalidPayloadKey(name));
            }
            let bytes = std::fs::read(&path).map_err(|e| PlanError::Io { path: path.display().to_string(), source: e })?;
            files.insert(name, bytes);
        }
        debug!(dir = %dir.display(), files = files.len(), "config payload loaded");
        Ok(ConfigPayload::Files(files))
    }

    pub fn is_empty(&self) -> bool {
        match self {
            ConfigPayload::Empty => true,
            ConfigPayload::Blob(_) => false,
            ConfigPayload::Files(f) => f.is_empty(),
        }
    }

    pub fn size(&self) -> usize {
        match self {
            ConfigPayload::Empty => 0,
            ConfigPayload::Blob(b) => b.len(),
            ConfigPayload::Files(f) => f.iter().map(|(k, v)| k.len() + v.len()).sum(),
        }
    }

    pub fn check_size(&self) -> Result<(), PlanError> {
        let max = max_payload_bytes();
        if self.size() > max {
            return Err(PlanError::PayloadTooLarge { size: self.size(), max });
        }
        Ok(())
    }

    /// Entries as they land in the config object.
    pub fn entries(&self) -> BTreeMap<String, Vec<u8>> {
        match self {
            ConfigPayload::Empty => BTreeMap::new(),
            ConfigPayload::Blob(b) => BTreeMap::from([(BLOB_KEY.to_string(), b.clone())]),
            ConfigPayload::Files(f) => f.clone(),
        }
    }
}

impl fmt::Debug for ConfigPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigPayload::Empty => f.write_str("Empty"),
            ConfigPayload::Blob(b) => write!(f, "Blob({} bytes)", b.len()),
            ConfigPayload::Files(files) => f.debug_map().entries(files.iter().map(|(k, v)| (k, v.len()))).finish(),
        }
    }
}

/// Pipeline-supplied secret values. `Debug` prints keys only.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecretPayload(BTreeMap<String, String>);

impl SecretPayload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<(), PlanError> {
        let key = key.into();
        if !valid_key(&key) {
            return Err(PlanError::InvalidPayloadKey(key));
        }
        self.0.insert(key, value.into());
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Debug for SecretPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.0.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_lands_under_fixed_key() {
        let p = ConfigPayload::Blob(br#"{"activities":[]}"#.to_vec());
        let e = p.entries();
        assert_eq!(e.len(), 1);
        assert_eq!(e[BLOB_KEY], br#"{"activities":[]}"#.to_vec());
    }

    #[test]
    fn load_dir_reads_top_level_files_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("activities.json"), b"[]").unwrap();
        std::fs::write(dir.path().join("logo.png"), [0x89u8, 0x50, 0xff]).unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested").join("x.json"), b"{}").unwrap();
        let p = ConfigPayload::load(dir.path()).unwrap();
        let e = p.entries();
        assert_eq!(e.keys().cloned().collect::<Vec<_>>(), vec!["activities.json".to_string(), "logo.png".to_string()]);
    }

    #[test]
    fn load_file_is_a_blob() {
        let dir = tempfile::tempdir().unwrap();
        let f = dir.path().join("bookable.json");
        std::fs::write(&f, b"{}").unwrap();
        assert_eq!(ConfigPayload::load(&f).unwrap(), ConfigPayload::Blob(b"{}".to_vec()));
        assert!(matches!(ConfigPayload::load(&dir.path().join("missing")), Err(PlanError::Io { .. })));
    }

    #[test]
    fn secret_keys_are_checked_and_values_hidden() {
        let mut s = SecretPayload::new();
        s.insert("api_key", "abc123").unwrap();
        assert!(matches!(s.insert("bad/key", "x"), Err(PlanError::InvalidPayloadKey(_))));
        let dbg = format!("{:?}", s);
        assert!(dbg.contains("api_key") && !dbg.contains("abc123"));
    }
}
