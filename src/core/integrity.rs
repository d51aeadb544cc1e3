//! Post-replay structural checks and last-resort log recovery.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

use super::clock::LamportClock;
use super::event::{Event, EventKind, ItemKey, LineFriends, ReplicaId};
use super::list::Item;
use super::replay::Projection;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("list integrity error: head has a child pointer")]
    HeadHasChild,
    #[error("list integrity error: item {key} child link does not point to the previous item")]
    BrokenBackLink { key: String },
    #[error("list integrity error: item {key} appeared twice in the live chain")]
    DuplicateKey { key: String },
    #[error("list integrity error: item {key} does not match its position in the match list")]
    MatchMismatch { key: String },
    #[error("list integrity error: {count} orphaned items in the match set")]
    OrphanedItems { count: usize },
}

/// Replay `log` into a scratch projection and compute its full match list
/// (empty query, hidden items included).
pub fn project_and_match(log: &[Event]) -> (Projection, Vec<Item>) {
    let mut projection = Projection::new(None);
    projection.replay(log);
    let (matches, _, _) = projection.match_items(&[], true, None, 0, 0);
    (projection, matches)
}

/// Structural check of a projected list against its own match set.
///
/// Walks from the head following `parent` links and verifies the back-link
/// of every step, that no key repeats (which would indicate a cycle), and
/// that the walk agrees item-for-item with the match list.
pub fn verify_list(projection: &Projection, matches: &[Item]) -> Result<(), IntegrityError> {
    let Some(root_key) = projection.list.root_key() else {
        if matches.is_empty() {
            return Ok(());
        }
        return Err(IntegrityError::OrphanedItems {
            count: matches.len(),
        });
    };

    if projection
        .list
        .get(root_key)
        .is_some_and(|root| root.child.is_some())
    {
        return Err(IntegrityError::HeadHasChild);
    }

    let mut seen: HashSet<ItemKey> = HashSet::new();
    let mut prev: Option<ItemKey> = None;
    let mut i = 0usize;

    let mut cursor = Some(root_key.clone());
    while let Some(key) = cursor {
        let Some(item) = projection.list.get(&key) else {
            return Err(IntegrityError::BrokenBackLink {
                key: key.as_str().to_string(),
            });
        };

        if item.child != prev {
            return Err(IntegrityError::BrokenBackLink {
                key: key.as_str().to_string(),
            });
        }
        if !seen.insert(key.clone()) {
            return Err(IntegrityError::DuplicateKey {
                key: key.as_str().to_string(),
            });
        }
        let matches_position = matches.get(i).is_some_and(|m| {
            m.key == item.key
                && m.line == item.line
                && m.note == item.note
                && m.hidden == item.hidden
        });
        if !matches_position {
            return Err(IntegrityError::MatchMismatch {
                key: key.as_str().to_string(),
            });
        }

        prev = Some(key);
        cursor = item.parent.clone();
        i += 1;
    }

    if i != matches.len() {
        return Err(IntegrityError::OrphanedItems {
            count: matches.len() - i,
        });
    }
    Ok(())
}

/// Rebuild a minimal equivalent log from the surviving item set.
///
/// Collects the best-known line/note/hidden state for every matched item
/// from both the match list and a single walk of the broken log, then emits
/// a fresh log of Adds (each anchored to the previously emitted item) and
/// Hides, incrementing the Lamport clock for every event. Used only as a
/// last resort.
pub fn recover(
    log: &[Event],
    matches: &[Item],
    clock: &mut LamportClock,
    replica: ReplicaId,
) -> Vec<Event> {
    struct Survivor {
        line: String,
        note: Option<Vec<u8>>,
        hidden: bool,
    }

    let mut order: Vec<ItemKey> = Vec::new();
    let mut surviving: HashMap<ItemKey, Survivor> = HashMap::new();
    for m in matches {
        if !surviving.contains_key(&m.key) {
            order.push(m.key.clone());
        }
        surviving.insert(
            m.key.clone(),
            Survivor {
                line: m.line.clone(),
                note: m.note.clone(),
                hidden: m.hidden,
            },
        );
    }

    // One pass over the log refines the map. Moves are irrelevant here; the
    // match list already fixes the ordering. Deletes are honoured, though a
    // later Add/Update may bring the item back.
    for e in log {
        match e.kind {
            EventKind::Add => {
                let survivor = surviving.entry(e.item_key.clone()).or_insert(Survivor {
                    line: String::new(),
                    note: None,
                    hidden: false,
                });
                survivor.line = e.line.clone();
                survivor.note = e.note.clone();
            }
            EventKind::Update => {
                let survivor = surviving.entry(e.item_key.clone()).or_insert(Survivor {
                    line: String::new(),
                    note: None,
                    hidden: false,
                });
                if e.line.is_empty() {
                    survivor.note = e.note.clone();
                } else {
                    survivor.line = e.line.clone();
                }
            }
            EventKind::Show => {
                if let Some(survivor) = surviving.get_mut(&e.item_key) {
                    survivor.hidden = false;
                }
            }
            EventKind::Hide => {
                if let Some(survivor) = surviving.get_mut(&e.item_key) {
                    survivor.hidden = true;
                }
            }
            EventKind::Delete => {
                surviving.remove(&e.item_key);
            }
            _ => {}
        }
    }

    let mut fresh: Vec<Event> = Vec::new();
    let mut prev: Option<ItemKey> = None;
    for key in order {
        let Some(survivor) = surviving.get(&key) else {
            continue;
        };
        fresh.push(Event {
            replica,
            lamport: clock.tick(),
            kind: EventKind::Add,
            item_key: key.clone(),
            target_key: prev.clone().unwrap_or_else(ItemKey::absent),
            line: survivor.line.clone(),
            note: survivor.note.clone(),
            friends: LineFriends::default(),
        });
        if survivor.hidden {
            fresh.push(Event {
                replica,
                lamport: clock.tick(),
                kind: EventKind::Hide,
                item_key: key.clone(),
                target_key: ItemKey::absent(),
                line: String::new(),
                note: None,
                friends: LineFriends::default(),
            });
        }
        prev = Some(key);
    }
    fresh
}

/// Structural equivalence of two projected lists: same keys, same order,
/// same line/note/hidden state.
pub fn lists_equivalent(a: &Projection, b: &Projection) -> bool {
    let mut left = a.list.walk();
    let mut right = b.list.walk();
    loop {
        match (left.next(), right.next()) {
            (None, None) => return true,
            (Some(l), Some(r)) => {
                if l.key != r.key || l.line != r.line || l.note != r.note || l.hidden != r.hidden {
                    return false;
                }
            }
            _ => return false,
        }
    }
}
