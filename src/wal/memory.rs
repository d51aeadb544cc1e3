//! In-memory backend.
//!
//! Stands in for remote object storage in hermetic tests, and doubles as
//! the scratch store for simulated peers.

use std::collections::BTreeMap;
use std::sync::{Mutex, OnceLock};

use super::walfile::{LocalStore, WalFile};
use super::WalError;
use crate::core::ReplicaId;

pub struct MemoryWalFile {
    uuid: String,
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
    replica: OnceLock<ReplicaId>,
}

impl MemoryWalFile {
    pub fn new(uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            blobs: Mutex::new(BTreeMap::new()),
            replica: OnceLock::new(),
        }
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.lock().map(|b| b.len()).unwrap_or(0)
    }

    /// Drop a raw blob straight into the store, bypassing the codec. Test
    /// scaffolding for pre-seeded backends.
    pub fn insert_raw(&self, name: impl Into<String>, bytes: Vec<u8>) {
        if let Ok(mut blobs) = self.blobs.lock() {
            blobs.insert(name.into(), bytes);
        }
    }
}

impl WalFile for MemoryWalFile {
    fn uuid(&self) -> &str {
        &self.uuid
    }

    fn root(&self) -> &str {
        "memory"
    }

    fn list(&self) -> Result<Vec<String>, WalError> {
        let blobs = self.blobs.lock().map_err(|_| WalError::LockPoisoned)?;
        Ok(blobs.keys().cloned().collect())
    }

    fn read(&self, name: &str) -> Result<Vec<u8>, WalError> {
        let blobs = self.blobs.lock().map_err(|_| WalError::LockPoisoned)?;
        blobs.get(name).cloned().ok_or_else(|| WalError::Io {
            path: None,
            source: std::io::Error::new(std::io::ErrorKind::NotFound, name.to_string()),
        })
    }

    fn write(&self, name: &str, bytes: &[u8]) -> Result<(), WalError> {
        let mut blobs = self.blobs.lock().map_err(|_| WalError::LockPoisoned)?;
        blobs.insert(name.to_string(), bytes.to_vec());
        Ok(())
    }

    fn remove(&self, names: &[String]) -> Result<(), WalError> {
        let mut blobs = self.blobs.lock().map_err(|_| WalError::LockPoisoned)?;
        for name in names {
            blobs.remove(name);
        }
        Ok(())
    }
}

impl LocalStore for MemoryWalFile {
    fn replica_id(&self) -> Result<ReplicaId, WalError> {
        Ok(*self.replica.get_or_init(ReplicaId::random))
    }

    fn purge(&self) -> Result<(), WalError> {
        let mut blobs = self.blobs.lock().map_err(|_| WalError::LockPoisoned)?;
        blobs.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_remove() {
        let wf = MemoryWalFile::new("alice@example.com");
        wf.write("a", b"1").expect("write");
        wf.write("b", b"2").expect("write");
        assert_eq!(wf.list().expect("list"), vec!["a", "b"]);
        assert_eq!(wf.read("a").expect("read"), b"1");

        wf.remove(&["a".to_string()]).expect("remove");
        assert_eq!(wf.blob_count(), 1);
    }

    #[test]
    fn read_missing_blob_errors() {
        let wf = MemoryWalFile::new("x");
        assert!(wf.read("nope").is_err());
    }

    #[test]
    fn purge_clears_everything() {
        let wf = MemoryWalFile::new("x");
        wf.write("a", b"1").expect("write");
        wf.purge().expect("purge");
        assert_eq!(wf.blob_count(), 0);
    }

    #[test]
    fn replica_id_is_stable() {
        let wf = MemoryWalFile::new("x");
        assert_eq!(
            wf.replica_id().expect("id"),
            wf.replica_id().expect("id")
        );
    }
}
