//! Blob storage: versioned codec and the log-file abstraction.

use std::path::PathBuf;

use thiserror::Error;

pub mod codec;
pub mod local;
pub mod memory;
pub mod walfile;

pub use codec::{LATEST_WAL_SCHEMA, build_blob, checksum_hex, read_blob};
pub use local::LocalWalFile;
pub use memory::MemoryWalFile;
pub use walfile::{LocalStore, WalFile};

#[derive(Debug, Error)]
pub enum WalError {
    #[error("io error at {path:?}: {source}")]
    Io {
        path: Option<PathBuf>,
        #[source]
        source: std::io::Error,
    },
    #[error("backend {uuid} does not support {op}")]
    Unsupported { uuid: String, op: &'static str },
    #[error("backend lock poisoned")]
    LockPoisoned,
    #[error("peer channel unavailable")]
    ChannelClosed,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unrecognised wal schema {0}")]
    UnsupportedSchema(u16),
    #[error("cbor encode: {0}")]
    Encode(#[from] minicbor::encode::Error<std::convert::Infallible>),
    #[error("io error while framing blob: {0}")]
    Io(#[from] std::io::Error),
}
