//! Sync engine: pull/push coordination, gather, and the live peer channel.

use thiserror::Error;

pub mod engine;
pub mod peer;
pub mod runtime;

pub use engine::SyncEngine;
pub use peer::{PeerMessage, PeerReceiver, PeerSender, PeerTransport, PeerWalFile};
pub use runtime::{Notification, SyncHandle, SyncRuntime};

use crate::wal::{CodecError, WalError};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("backend {uuid}: {source}")]
    Backend {
        uuid: String,
        #[source]
        source: WalError,
    },
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("peer transport: {0}")]
    Transport(String),
    #[error("registry lock poisoned")]
    LockPoisoned,
    #[error("sync runtime channel closed")]
    ChannelClosed,
}

/// How the runtime should come down. Purge is a control-flow exit request,
/// not a failure: it wipes the local store after the final flush.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Shutdown {
    Normal,
    Purge,
}
