// The object-storage seam. Scene objects and uploaded logs travel through
// this interface; fetches happen only during GetObjects handling and log
// upload happens only at exit, so blocking calls are acceptable here.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object {key:?} not found")]
    NotFound { key: String },
    #[error("storage i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("unsupported storage uri {uri:?}")]
    UnsupportedScheme { uri: String },
}

pub trait ObjectStore {
    fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;
    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError>;
}

/// Directory-backed store; keys map to file paths under the root
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ObjectStore for FsStore {
    fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.root.join(key);
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(StorageError::NotFound {
                key: key.to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, bytes)?;
        Ok(())
    }
}

/// In-memory store for tests and dry runs
#[derive(Default)]
pub struct MemoryStore {
    objects: RefCell<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ObjectStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.objects
            .borrow()
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                key: key.to_string(),
            })
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        self.objects
            .borrow_mut()
            .insert(key.to_string(), bytes.to_vec());
        Ok(())
    }
}

/// Open a store from a storage URI: `file://PATH`, a bare path, or `mem://`
pub fn open_store(uri: &str) -> Result<Box<dyn ObjectStore>, StorageError> {
    if let Some(path) = uri.strip_prefix("file://") {
        return Ok(Box::new(FsStore::new(path)));
    }
    if uri == "mem://" {
        return Ok(Box::new(MemoryStore::new()));
    }
    if !uri.contains("://") {
        return Ok(Box::new(FsStore::new(uri)));
    }
    Err(StorageError::UnsupportedScheme {
        uri: uri.to_string(),
    })
}

#[cfg(test)]
mod storage_tests {
    use super::{open_store, MemoryStore, ObjectStore, StorageError};

    #[test]
    fn memory_store_round_trips() {
        let store = MemoryStore::new();
        store.put("T3", b"treelet bytes").unwrap();
        assert_eq!(store.get("T3").unwrap(), b"treelet bytes");
        assert!(matches!(
            store.get("T4"),
            Err(StorageError::NotFound { .. })
        ));
    }

    #[test]
    fn uri_scheme_selection() {
        assert!(open_store("mem://").is_ok());
        assert!(open_store("file:///tmp/scene").is_ok());
        assert!(open_store("/tmp/scene").is_ok());
        assert!(matches!(
            open_store("s4://bucket"),
            Err(StorageError::UnsupportedScheme { .. })
        ));
    }
}
