//! Projected list state: an arena of items addressed by stable keys.
//!
//! Neighbour links are stored as keys rather than pointers so the structural
//! invariants can be checked without chasing raw references. `child` points
//! towards the head of the list, `parent` towards the tail. The root is the
//! item whose `child` is empty.

use std::collections::HashMap;

use super::event::{ItemKey, LineFriends};

/// A single projected list item. Tombstones stay in the arena (for key
/// resolution) but are unlinked from the live list.
#[derive(Clone, Debug)]
pub struct Item {
    pub key: ItemKey,
    pub line: String,
    pub note: Option<Vec<u8>>,
    pub hidden: bool,
    pub tombstone: bool,
    pub friends: LineFriends,
    pub child: Option<ItemKey>,
    pub parent: Option<ItemKey>,
    /// Transient neighbours computed by a match pass; never persisted.
    pub match_child: Option<ItemKey>,
    pub match_parent: Option<ItemKey>,
}

impl Item {
    fn new(key: ItemKey, line: String, note: Option<Vec<u8>>, friends: LineFriends) -> Self {
        Self {
            key,
            line,
            note,
            hidden: false,
            tombstone: false,
            friends,
            child: None,
            parent: None,
            match_child: None,
            match_parent: None,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ListState {
    items: HashMap<ItemKey, Item>,
    root: Option<ItemKey>,
}

impl ListState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Key of the head item, if any.
    pub fn root_key(&self) -> Option<&ItemKey> {
        self.root.as_ref()
    }

    pub fn get(&self, key: &ItemKey) -> Option<&Item> {
        self.items.get(key)
    }

    pub fn get_mut(&mut self, key: &ItemKey) -> Option<&mut Item> {
        self.items.get_mut(key)
    }

    /// Like [`get`](Self::get), but tombstones read as absent.
    pub fn get_live(&self, key: &ItemKey) -> Option<&Item> {
        self.items.get(key).filter(|item| !item.tombstone)
    }

    pub fn live_len(&self) -> usize {
        self.walk().count()
    }

    /// Splice a fresh item into the list directly below `child` (or at the
    /// head when `child` is empty). Overwrites any tombstone under `key`.
    pub fn splice_in(
        &mut self,
        key: ItemKey,
        line: String,
        note: Option<Vec<u8>>,
        hidden: bool,
        friends: LineFriends,
        child: Option<ItemKey>,
    ) {
        let mut item = Item::new(key.clone(), line, note, friends);
        item.hidden = hidden;

        match child {
            None => {
                if let Some(old_root) = self.root.take() {
                    if let Some(prev) = self.items.get_mut(&old_root) {
                        prev.child = Some(key.clone());
                    }
                    item.parent = Some(old_root);
                }
                self.root = Some(key.clone());
            }
            Some(child_key) => {
                let below = self
                    .items
                    .get(&child_key)
                    .and_then(|c| c.parent.clone());
                if let Some(below_key) = &below {
                    if let Some(below_item) = self.items.get_mut(below_key) {
                        below_item.child = Some(key.clone());
                    }
                    item.parent = below;
                }
                if let Some(child_item) = self.items.get_mut(&child_key) {
                    child_item.parent = Some(key.clone());
                }
                item.child = Some(child_key);
            }
        }

        self.items.insert(key, item);
    }

    /// Remove an item from the live chain, leaving its arena entry in place.
    /// The unlinked item's own links are cleared.
    pub fn unlink(&mut self, key: &ItemKey) {
        let (child, parent) = match self.items.get(key) {
            Some(item) => (item.child.clone(), item.parent.clone()),
            None => return,
        };

        match &child {
            Some(child_key) => {
                if let Some(child_item) = self.items.get_mut(child_key) {
                    child_item.parent = parent.clone();
                }
            }
            None => {
                // Unlinking the head moves the root down.
                self.root = parent.clone();
            }
        }
        if let Some(parent_key) = &parent {
            if let Some(parent_item) = self.items.get_mut(parent_key) {
                parent_item.child = child;
            }
        }

        if let Some(item) = self.items.get_mut(key) {
            item.child = None;
            item.parent = None;
        }
    }

    /// Head-to-tail traversal of the live list, following `parent` links.
    pub fn walk(&self) -> Walk<'_> {
        Walk {
            state: self,
            next: self.root.clone(),
        }
    }

    /// Keys of the live list in head-to-tail order.
    pub fn order(&self) -> Vec<ItemKey> {
        self.walk().map(|item| item.key.clone()).collect()
    }
}

pub struct Walk<'a> {
    state: &'a ListState,
    next: Option<ItemKey>,
}

impl<'a> Iterator for Walk<'a> {
    type Item = &'a Item;

    fn next(&mut self) -> Option<&'a Item> {
        let key = self.next.take()?;
        let item = self.state.items.get(&key)?;
        self.next = item.parent.clone();
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::ReplicaId;

    fn key(n: i64) -> ItemKey {
        ItemKey::new(ReplicaId(1), n)
    }

    fn splice(state: &mut ListState, n: i64, child: Option<i64>) {
        state.splice_in(
            key(n),
            format!("line {n}"),
            None,
            false,
            LineFriends::default(),
            child.map(key),
        );
    }

    fn order(state: &ListState) -> Vec<String> {
        state
            .walk()
            .map(|item| item.key.as_str().to_string())
            .collect()
    }

    #[test]
    fn splice_at_head_pushes_old_root_down() {
        let mut state = ListState::new();
        splice(&mut state, 1, None);
        splice(&mut state, 2, None);
        assert_eq!(order(&state), vec!["1:2", "1:1"]);
        assert_eq!(state.root_key(), Some(&key(2)));
    }

    #[test]
    fn splice_below_child() {
        let mut state = ListState::new();
        splice(&mut state, 1, None);
        splice(&mut state, 2, Some(1)); // directly below 1
        splice(&mut state, 3, Some(1)); // between 1 and 2
        assert_eq!(order(&state), vec!["1:1", "1:3", "1:2"]);
    }

    #[test]
    fn unlink_head_moves_root() {
        let mut state = ListState::new();
        splice(&mut state, 1, None);
        splice(&mut state, 2, None);
        state.unlink(&key(2));
        assert_eq!(order(&state), vec!["1:1"]);
        assert_eq!(state.root_key(), Some(&key(1)));
    }

    #[test]
    fn unlink_middle_bridges_neighbours() {
        let mut state = ListState::new();
        splice(&mut state, 1, None);
        splice(&mut state, 2, Some(1));
        splice(&mut state, 3, Some(2));
        state.unlink(&key(2));
        assert_eq!(order(&state), vec!["1:1", "1:3"]);
        let tail = state.get(&key(3)).unwrap();
        assert_eq!(tail.child.as_ref(), Some(&key(1)));
    }

    #[test]
    fn unlink_sole_item_empties_list() {
        let mut state = ListState::new();
        splice(&mut state, 1, None);
        state.unlink(&key(1));
        assert_eq!(state.root_key(), None);
        assert_eq!(state.live_len(), 0);
    }

    #[test]
    fn tombstone_reads_absent_via_get_live() {
        let mut state = ListState::new();
        splice(&mut state, 1, None);
        state.get_mut(&key(1)).unwrap().tombstone = true;
        assert!(state.get(&key(1)).is_some());
        assert!(state.get_live(&key(1)).is_none());
    }
}
