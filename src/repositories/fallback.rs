//! Small-capacity key-value tier.
//!
//! Mirrors the synchronous, quota-limited storage a browser grants every
//! origin: values are strings, writes are all-or-nothing and fail with
//! [`SyncError::QuotaExceeded`] once the byte budget would be exceeded.

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use dashmap::DashMap;

use crate::error::{SyncError, SyncResult};

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> SyncResult<Option<String>>;

    fn set(&self, key: &str, value: &str) -> SyncResult<()>;

    fn remove(&self, key: &str) -> SyncResult<()>;

    /// Bytes currently used, as counted against the quota.
    fn used_bytes(&self) -> usize;
}

fn entry_size(key: &str, value: &str) -> usize {
    key.len() + value.len()
}

fn quota_error(key: &str, needed: usize, quota: usize) -> SyncError {
    SyncError::QuotaExceeded(format!(
        "writing {key} needs {needed} bytes, quota is {quota} bytes"
    ))
}

/// In-process store with a byte quota.
#[derive(Debug)]
pub struct MemoryKeyValueStore {
    entries: DashMap<String, String>,
    quota_bytes: usize,
}

impl MemoryKeyValueStore {
    pub fn new(quota_bytes: usize) -> Self {
        Self {
            entries: DashMap::new(),
            quota_bytes,
        }
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> SyncResult<Option<String>> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    fn set(&self, key: &str, value: &str) -> SyncResult<()> {
        let current = self
            .entries
            .get(key)
            .map(|entry| entry_size(key, entry.value()))
            .unwrap_or(0);
        let needed = self.used_bytes() - current + entry_size(key, value);
        if needed > self.quota_bytes {
            return Err(quota_error(key, needed, self.quota_bytes));
        }
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> SyncResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    fn used_bytes(&self) -> usize {
        self.entries
            .iter()
            .map(|entry| entry_size(entry.key(), entry.value()))
            .sum()
    }
}

/// One file per key inside a directory, with a byte quota over the directory.
#[derive(Debug)]
pub struct FileKeyValueStore {
    dir: PathBuf,
    quota_bytes: usize,
}

impl FileKeyValueStore {
    pub fn open(dir: impl Into<PathBuf>, quota_bytes: usize) -> SyncResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, quota_bytes })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let file_name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{file_name}.json"))
    }

    fn file_len(path: &Path) -> usize {
        fs::metadata(path).map(|meta| meta.len() as usize).unwrap_or(0)
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn get(&self, key: &str) -> SyncResult<Option<String>> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(value) => Ok(Some(value)),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> SyncResult<()> {
        let path = self.path_for(key);
        let needed = self.used_bytes() - Self::file_len(&path) + value.len();
        if needed > self.quota_bytes {
            return Err(quota_error(key, needed, self.quota_bytes));
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> SyncResult<()> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    fn used_bytes(&self) -> usize {
        fs::read_dir(&self.dir)
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .filter(|entry| {
                        entry.path().extension().and_then(|ext| ext.to_str()) == Some("json")
                    })
                    .map(|entry| Self::file_len(&entry.path()))
                    .sum()
            })
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_rejects_writes_over_quota() {
        let store = MemoryKeyValueStore::new(16);
        store.set("a", "0123456789").expect("fits");
        let error = store.set("b", "0123456789").expect_err("over quota");
        assert!(error.is_quota_exceeded());
        assert_eq!(store.get("b").expect("get"), None);
        assert_eq!(store.get("a").expect("get").as_deref(), Some("0123456789"));
    }

    #[test]
    fn memory_store_overwrite_reuses_own_bytes() {
        let store = MemoryKeyValueStore::new(12);
        store.set("k", "0123456789").expect("fits");
        store.set("k", "9876543210").expect("same size fits");
        assert_eq!(store.used_bytes(), 11);
    }

    #[test]
    fn file_store_round_trip_and_quota() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileKeyValueStore::open(dir.path(), 8).expect("open");
        assert_eq!(store.get("canvas:x").expect("get"), None);
        store.set("canvas:x", "1234").expect("fits");
        assert_eq!(store.get("canvas:x").expect("get").as_deref(), Some("1234"));
        assert!(store.set("other", "123456").expect_err("over").is_quota_exceeded());
        store.remove("canvas:x").expect("remove");
        store.remove("canvas:x").expect("remove twice");
        assert_eq!(store.used_bytes(), 0);
    }
}
