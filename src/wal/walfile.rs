//! Storage-agnostic log-file interface.

use super::WalError;
use crate::core::ReplicaId;

/// A named store of opaque blobs keyed by content checksum.
///
/// Implementations cover local disk, remote object storage, and live peer
/// channels; the sync engine only ever speaks this interface. Blob names
/// are the hex md5 of their contents, so writes are idempotent and reads
/// are self-verifying.
pub trait WalFile: Send + Sync {
    /// Stable name of the backend: `"local"`, or the owning user's email.
    fn uuid(&self) -> &str;

    /// Opaque namespace the blobs live under (a directory path, a bucket
    /// prefix, a channel id).
    fn root(&self) -> &str;

    /// Checksums of the blobs currently present.
    fn list(&self) -> Result<Vec<String>, WalError>;

    /// Raw bytes of one blob.
    fn read(&self, name: &str) -> Result<Vec<u8>, WalError>;

    /// Atomically publish a blob under `name`.
    fn write(&self, name: &str, bytes: &[u8]) -> Result<(), WalError>;

    /// Best-effort removal of the named blobs.
    fn remove(&self, names: &[String]) -> Result<(), WalError>;
}

/// Extra surface of the replica-owned backend.
pub trait LocalStore: WalFile {
    /// The replica id persisted in the root blob, created on first run.
    fn replica_id(&self) -> Result<ReplicaId, WalError>;

    /// Wipe every blob, including the root blob. Used on purge-exit.
    fn purge(&self) -> Result<(), WalError>;
}
