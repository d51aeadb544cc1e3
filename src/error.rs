use thiserror::Error;

use crate::core::{CompactError, IntegrityError};
use crate::repo::RepoError;
use crate::sync::SyncError;
use crate::wal::{CodecError, WalError};

/// Crate-level convenience error.
///
/// Not a "god error": it is a thin wrapper over canonical capability errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Repo(#[from] RepoError),

    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    #[error(transparent)]
    Compact(#[from] CompactError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Wal(#[from] WalError),

    #[error(transparent)]
    Sync(#[from] SyncError),
}
