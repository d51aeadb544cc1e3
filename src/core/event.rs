//! Event and key model for the replicated list log.

use std::cmp::Ordering;
use std::fmt;

/// Per-replica Lamport counter value.
pub type Lamport = i64;

/// Randomly chosen per-device identity, persisted in the root local blob.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReplicaId(pub u32);

impl ReplicaId {
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identity of a list item: `"<replica>:<lamport-of-birth>"`.
///
/// Computed once at birth and never changes for the life of the item.
/// Treated as opaque thereafter.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemKey(String);

impl ItemKey {
    pub fn new(replica: ReplicaId, lamport: Lamport) -> Self {
        Self(format!("{}:{}", replica.0, lamport))
    }

    /// The sentinel key used when no target is named.
    pub fn absent() -> Self {
        Self("0:0".to_string())
    }

    pub fn is_absent(&self) -> bool {
        self.0 == "0:0"
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemKey {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

/// The mutation kinds carried by the log.
///
/// Discriminant order is part of the on-disk format; `Null` is reserved.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Null,
    Add,
    Update,
    MoveUp,
    MoveDown,
    Show,
    Hide,
    Delete,
}

impl EventKind {
    pub const ALL: [Self; 8] = [
        Self::Null,
        Self::Add,
        Self::Update,
        Self::MoveUp,
        Self::MoveDown,
        Self::Show,
        Self::Hide,
        Self::Delete,
    ];

    #[must_use]
    pub const fn as_u16(self) -> u16 {
        match self {
            Self::Null => 0,
            Self::Add => 1,
            Self::Update => 2,
            Self::MoveUp => 3,
            Self::MoveDown => 4,
            Self::Show => 5,
            Self::Hide => 6,
            Self::Delete => 7,
        }
    }

    pub const fn from_u16(raw: u16) -> Option<Self> {
        match raw {
            0 => Some(Self::Null),
            1 => Some(Self::Add),
            2 => Some(Self::Update),
            3 => Some(Self::MoveUp),
            4 => Some(Self::MoveDown),
            5 => Some(Self::Show),
            6 => Some(Self::Hide),
            7 => Some(Self::Delete),
            _ => None,
        }
    }

    /// Canonical wire tag used by the current blob schema.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Add => "add",
            Self::Update => "update",
            Self::MoveUp => "move_up",
            Self::MoveDown => "move_down",
            Self::Show => "show",
            Self::Hide => "hide",
            Self::Delete => "delete",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "null" => Some(Self::Null),
            "add" => Some(Self::Add),
            "update" => Some(Self::Update),
            "move_up" => Some(Self::MoveUp),
            "move_down" => Some(Self::MoveDown),
            "show" => Some(Self::Show),
            "hide" => Some(Self::Hide),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sharing state derived from `@mentions` embedded in the line text.
///
/// `offset` is the byte position where the appended mention block starts;
/// `emails` is kept sorted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LineFriends {
    pub processed: bool,
    pub offset: i32,
    pub emails: Vec<String>,
}

impl LineFriends {
    pub fn contains(&self, email: &str) -> bool {
        self.emails.iter().any(|e| e == email)
    }
}

/// An immutable record describing a single mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub replica: ReplicaId,
    pub lamport: Lamport,
    pub kind: EventKind,
    pub item_key: ItemKey,
    pub target_key: ItemKey,
    pub line: String,
    pub note: Option<Vec<u8>>,
    pub friends: LineFriends,
}

impl Event {
    /// Identity of the event itself, used for replay idempotence.
    pub fn dedup_key(&self) -> String {
        format!("{}:{}", self.replica.0, self.lamport)
    }
}

/// Total order on events: by Lamport timestamp, ties broken by replica id.
///
/// Equality by both fields marks a duplicate. The tie-break guarantees
/// convergence across replicas without a coordinator.
pub fn compare(a: &Event, b: &Event) -> Ordering {
    a.lamport
        .cmp(&b.lamport)
        .then(a.replica.cmp(&b.replica))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(replica: u32, lamport: Lamport) -> Event {
        Event {
            replica: ReplicaId(replica),
            lamport,
            kind: EventKind::Add,
            item_key: ItemKey::new(ReplicaId(replica), lamport),
            target_key: ItemKey::absent(),
            line: String::new(),
            note: None,
            friends: LineFriends::default(),
        }
    }

    #[test]
    fn order_is_lamport_then_replica() {
        assert_eq!(compare(&event(2, 1), &event(1, 2)), Ordering::Less);
        assert_eq!(compare(&event(1, 3), &event(2, 3)), Ordering::Less);
        assert_eq!(compare(&event(5, 3), &event(2, 3)), Ordering::Greater);
        assert_eq!(compare(&event(4, 7), &event(4, 7)), Ordering::Equal);
    }

    #[test]
    fn item_key_form() {
        let key = ItemKey::new(ReplicaId(7), 42);
        assert_eq!(key.as_str(), "7:42");
        assert!(!key.is_absent());
        assert!(ItemKey::absent().is_absent());
    }

    #[test]
    fn kind_tag_roundtrip() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::parse(kind.as_str()), Some(kind));
            assert_eq!(EventKind::from_u16(kind.as_u16()), Some(kind));
        }
        assert_eq!(EventKind::parse("resurrect"), None);
        assert_eq!(EventKind::from_u16(99), None);
    }

    #[test]
    fn dedup_key_matches_identity() {
        assert_eq!(event(3, 9).dedup_key(), "3:9");
    }
}
