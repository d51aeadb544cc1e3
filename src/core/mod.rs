//! Event-log core: data model, ordering, merge, projection, compaction.

pub mod clock;
pub mod compact;
pub mod event;
pub mod friends;
pub mod integrity;
pub mod list;
pub mod matching;
pub mod merge;
pub mod replay;

pub use clock::LamportClock;
pub use compact::{CompactError, compact};
pub use event::{Event, EventKind, ItemKey, Lamport, LineFriends, ReplicaId, compare};
pub use friends::{FriendChange, FriendsState};
pub use integrity::{IntegrityError, lists_equivalent, project_and_match, recover, verify_list};
pub use list::{Item, ListState};
pub use matching::MatchGroup;
pub use merge::merge;
pub use replay::{Projection, ReplayOutcome};
