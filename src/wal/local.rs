//! Local filesystem backend.

use std::fs;
use std::path::{Path, PathBuf};

use super::walfile::{LocalStore, WalFile};
use super::WalError;
use crate::core::ReplicaId;
use crate::paths;

/// All blobs live flat under a single configured root directory, alongside
/// the `primary.db` root blob and any plain-text exports.
pub struct LocalWalFile {
    root_dir: PathBuf,
    root_str: String,
}

impl LocalWalFile {
    pub fn new(root_dir: impl Into<PathBuf>) -> Result<Self, WalError> {
        let root_dir = root_dir.into();
        fs::create_dir_all(&root_dir).map_err(|e| WalError::Io {
            path: Some(root_dir.clone()),
            source: e,
        })?;
        let root_str = root_dir.display().to_string();
        Ok(Self { root_dir, root_str })
    }

    fn blob_path(&self, name: &str) -> PathBuf {
        self.root_dir.join(paths::blob_file_name(name))
    }

    fn io_err(&self, path: &Path, source: std::io::Error) -> WalError {
        WalError::Io {
            path: Some(path.to_path_buf()),
            source,
        }
    }
}

impl WalFile for LocalWalFile {
    fn uuid(&self) -> &str {
        "local"
    }

    fn root(&self) -> &str {
        &self.root_str
    }

    fn list(&self) -> Result<Vec<String>, WalError> {
        let entries = fs::read_dir(&self.root_dir)
            .map_err(|e| self.io_err(&self.root_dir, e))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| self.io_err(&self.root_dir, e))?;
            let file_name = entry.file_name();
            if let Some(name) = file_name.to_str()
                && let Some(id) = paths::parse_blob_file_name(name)
            {
                names.push(id.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn read(&self, name: &str) -> Result<Vec<u8>, WalError> {
        let path = self.blob_path(name);
        fs::read(&path).map_err(|e| self.io_err(&path, e))
    }

    fn write(&self, name: &str, bytes: &[u8]) -> Result<(), WalError> {
        let path = self.blob_path(name);
        let temp = tempfile::NamedTempFile::new_in(&self.root_dir)
            .map_err(|e| self.io_err(&self.root_dir, e))?;
        fs::write(temp.path(), bytes).map_err(|e| self.io_err(temp.path(), e))?;
        temp.persist(&path)
            .map_err(|e| self.io_err(&path, std::io::Error::other(e)))?;
        Ok(())
    }

    fn remove(&self, names: &[String]) -> Result<(), WalError> {
        for name in names {
            let path = self.blob_path(name);
            if let Err(e) = fs::remove_file(&path)
                && e.kind() != std::io::ErrorKind::NotFound
            {
                tracing::warn!("failed to remove blob {}: {e}", path.display());
            }
        }
        Ok(())
    }
}

impl LocalStore for LocalWalFile {
    fn replica_id(&self) -> Result<ReplicaId, WalError> {
        let path = self.root_dir.join(paths::ROOT_FILE_NAME);
        match fs::read(&path) {
            Ok(bytes) if bytes.len() >= 4 => Ok(ReplicaId(u32::from_le_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3],
            ]))),
            Ok(_) | Err(_) => {
                let replica = ReplicaId::random();
                fs::write(&path, replica.as_u32().to_le_bytes())
                    .map_err(|e| self.io_err(&path, e))?;
                Ok(replica)
            }
        }
    }

    fn purge(&self) -> Result<(), WalError> {
        fs::remove_dir_all(&self.root_dir).map_err(|e| self.io_err(&self.root_dir, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, LocalWalFile) {
        let dir = tempfile::tempdir().expect("tempdir");
        let wf = LocalWalFile::new(dir.path()).expect("new");
        (dir, wf)
    }

    #[test]
    fn write_list_read_roundtrip() {
        let (_dir, wf) = store();
        wf.write("abc123", b"payload").expect("write");
        assert_eq!(wf.list().expect("list"), vec!["abc123".to_string()]);
        assert_eq!(wf.read("abc123").expect("read"), b"payload");
    }

    #[test]
    fn list_ignores_foreign_files() {
        let (dir, wf) = store();
        fs::write(dir.path().join("primary.db"), [1, 2, 3, 4]).expect("write");
        fs::write(dir.path().join("export_1.txt"), "x").expect("write");
        wf.write("abc", b"p").expect("write");
        assert_eq!(wf.list().expect("list"), vec!["abc".to_string()]);
    }

    #[test]
    fn remove_is_best_effort() {
        let (_dir, wf) = store();
        wf.write("abc", b"p").expect("write");
        wf.remove(&["abc".to_string(), "missing".to_string()])
            .expect("remove");
        assert!(wf.list().expect("list").is_empty());
    }

    #[test]
    fn replica_id_is_created_once_and_persisted() {
        let (_dir, wf) = store();
        let first = wf.replica_id().expect("create");
        let second = wf.replica_id().expect("load");
        assert_eq!(first, second);
    }

    #[test]
    fn purge_wipes_the_root() {
        let (dir, wf) = store();
        wf.write("abc", b"p").expect("write");
        wf.purge().expect("purge");
        assert!(!dir.path().exists());
    }
}
