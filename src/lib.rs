#![forbid(unsafe_code)]

pub mod config;
pub mod core;
pub mod error;
mod paths;
pub mod repo;
pub mod sync;
pub mod telemetry;
pub mod undo;
pub mod wal;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export core types at crate root for convenience
pub use crate::core::{
    Event, EventKind, Item, ItemKey, Lamport, LamportClock, LineFriends, ReplicaId, compare, merge,
};
pub use crate::repo::{ListRepo, RepoError};
pub use crate::sync::{Shutdown, SyncEngine, SyncHandle};
pub use crate::wal::{LocalStore, LocalWalFile, MemoryWalFile, WalFile};
