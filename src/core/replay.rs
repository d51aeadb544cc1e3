//! Deterministic projection of an event log into list state.

use std::collections::{HashMap, HashSet};

use super::clock::LamportClock;
use super::event::{Event, EventKind, ItemKey, Lamport, LineFriends, ReplicaId};
use super::friends::{FriendChange, FriendsState};
use super::list::{Item, ListState};
use super::matching::MatchGroup;

/// What a replay pass touched.
#[derive(Debug, Default)]
pub struct ReplayOutcome {
    pub changed: HashSet<ItemKey>,
    pub friend_changes: Vec<FriendChange>,
}

/// Replayable projection state: the list arena, the Lamport clock, the
/// friend set, and the idempotence caches.
///
/// Applying the same event twice is a no-op, as is applying an event that is
/// older than the last applied event of the same (kind, key) pair. This is
/// what makes replay safe under redelivery and arbitrary merge interleaving.
#[derive(Clone, Debug)]
pub struct Projection {
    pub list: ListState,
    pub clock: LamportClock,
    pub friends: FriendsState,
    processed: HashSet<String>,
    last_applied: HashMap<(EventKind, ItemKey), (Lamport, ReplicaId)>,
}

impl Projection {
    pub fn new(owner_email: Option<String>) -> Self {
        Self {
            list: ListState::new(),
            clock: LamportClock::new(),
            friends: FriendsState::new(owner_email),
            processed: HashSet::new(),
            last_applied: HashMap::new(),
        }
    }

    /// Fold a partial log into the projection, in order.
    pub fn replay(&mut self, events: &[Event]) -> ReplayOutcome {
        let mut out = ReplayOutcome::default();
        for e in events {
            self.apply(e, &mut out);
        }
        out
    }

    fn apply(&mut self, e: &Event, out: &mut ReplayOutcome) {
        // Exact-duplicate elision.
        if !self.processed.insert(e.dedup_key()) {
            return;
        }

        // Per-(kind, key) idempotence: an older-or-equal event of the same
        // kind against the same item is a no-op.
        let cache_key = (e.kind, e.item_key.clone());
        if let Some(&(lamport, replica)) = self.last_applied.get(&cache_key)
            && (lamport, replica) >= (e.lamport, e.replica)
        {
            return;
        }
        self.last_applied.insert(cache_key, (e.lamport, e.replica));

        self.clock.observe(e.lamport);

        let item_live = self.list.get_live(&e.item_key).is_some();
        let target = if e.target_key.is_absent() || e.target_key == e.item_key {
            None
        } else {
            self.list.get_live(&e.target_key).map(|t| t.key.clone())
        };
        // Inserts with no resolvable anchor land directly below the current
        // head, so a Lamport tie between two head-inserts resolves to the
        // merge order rather than reversing it.
        let insert_anchor = target
            .clone()
            .or_else(|| self.list.root_key().cloned())
            .filter(|k| k != &e.item_key);

        // Orphaned events: only Add and Update may act on a missing item
        // (Update tolerates out-of-order delivery by degrading to an Add).
        if !item_live && !matches!(e.kind, EventKind::Add | EventKind::Update) {
            return;
        }

        let existing_line = self.list.get_live(&e.item_key).map(|i| i.line.clone());
        out.friend_changes
            .extend(self.friends.observe(e, existing_line.as_deref()));

        match e.kind {
            EventKind::Add => {
                if item_live {
                    // A resurrected Add against a live item (undo-of-delete
                    // racing the delete itself) degrades to two updates:
                    // line first, then note.
                    self.update_item(&e.item_key, &e.line, &e.note, &e.friends);
                    self.update_item(&e.item_key, "", &e.note, &e.friends);
                } else {
                    self.list.splice_in(
                        e.item_key.clone(),
                        e.line.clone(),
                        e.note.clone(),
                        false,
                        e.friends.clone(),
                        insert_anchor,
                    );
                }
            }
            EventKind::Update => {
                if item_live {
                    self.update_item(&e.item_key, &e.line, &e.note, &e.friends);
                } else {
                    // The item may have been deleted concurrently elsewhere
                    // (or the Add has not arrived yet); bring it back with
                    // the updated content.
                    self.list.splice_in(
                        e.item_key.clone(),
                        e.line.clone(),
                        e.note.clone(),
                        false,
                        e.friends.clone(),
                        insert_anchor,
                    );
                }
            }
            EventKind::MoveUp | EventKind::MoveDown => {
                // A move anchors to its new intended child; with no
                // resolvable anchor there is nowhere to land.
                if target.is_none() {
                    return;
                }
                self.move_item(&e.item_key, target);
            }
            EventKind::Show => {
                if let Some(item) = self.list.get_mut(&e.item_key) {
                    item.hidden = false;
                }
            }
            EventKind::Hide => {
                if let Some(item) = self.list.get_mut(&e.item_key) {
                    item.hidden = true;
                }
            }
            EventKind::Delete => {
                self.list.unlink(&e.item_key);
                if let Some(item) = self.list.get_mut(&e.item_key) {
                    item.tombstone = true;
                }
            }
            EventKind::Null => return,
        }

        out.changed.insert(e.item_key.clone());
    }

    fn update_item(&mut self, key: &ItemKey, line: &str, note: &Option<Vec<u8>>, friends: &LineFriends) {
        let owner = self.friends.owner().map(str::to_string);
        let Some(item) = self.list.get_mut(key) else {
            return;
        };

        if !line.is_empty() {
            item.line = line.to_string();
            // Share sets only ever grow through updates; the owner's own
            // email never appears in them.
            let mut emails: HashSet<String> = item.friends.emails.iter().cloned().collect();
            emails.extend(friends.emails.iter().cloned());
            let mut emails: Vec<String> = emails
                .into_iter()
                .filter(|e| Some(e.as_str()) != owner.as_deref())
                .collect();
            emails.sort();
            item.friends.emails = emails;
            item.friends.processed = friends.processed;
            item.friends.offset = friends.offset;
        } else {
            item.note = note.clone();
        }

        item.tombstone = false;
    }

    /// A move is a delete plus a re-add under the same key, anchored to the
    /// new intended child. `hidden` survives the hop.
    fn move_item(&mut self, key: &ItemKey, target: Option<ItemKey>) {
        let Some(item) = self.list.get_live(key) else {
            return;
        };
        let (line, note, hidden, friends) = (
            item.line.clone(),
            item.note.clone(),
            item.hidden,
            item.friends.clone(),
        );
        self.list.unlink(key);
        self.list
            .splice_in(key.clone(), line, note, hidden, friends, target);
    }

    /// Filter the live list by conjunctive keyword groups.
    ///
    /// The currently selected item and items with empty lines (a row still
    /// being typed) always match. `offset`/`limit` paginate; `limit == 0`
    /// means unbounded. Returns the page items, the new selection index,
    /// and the page's arena keys in order.
    pub fn match_items(
        &mut self,
        groups: &[MatchGroup],
        show_hidden: bool,
        cur_key: Option<&ItemKey>,
        offset: usize,
        limit: usize,
    ) -> (Vec<Item>, Option<usize>, Vec<ItemKey>) {
        let traversal = self.list.order();
        let mut page_keys: Vec<ItemKey> = Vec::new();
        let mut selected = None;
        let mut last_matched: Option<ItemKey> = None;
        let mut idx = 0usize;

        for key in traversal {
            // Transient match links are recomputed on every pass.
            if let Some(item) = self.list.get_mut(&key) {
                item.match_child = None;
                item.match_parent = None;
            }

            let Some(item) = self.list.get(&key) else {
                continue;
            };
            if !show_hidden && item.hidden {
                continue;
            }

            let auto = Some(&key) == cur_key || item.line.is_empty();
            let matched = auto || groups.iter().all(|g| g.matches(&item.line));
            if !matched {
                continue;
            }

            if idx >= offset {
                if let Some(prev) = &last_matched
                    && let Some(prev_item) = self.list.get_mut(prev)
                {
                    prev_item.match_parent = Some(key.clone());
                }
                if let Some(item) = self.list.get_mut(&key) {
                    item.match_child = last_matched.clone();
                }
                last_matched = Some(key.clone());

                if Some(&key) == cur_key {
                    selected = Some(idx);
                }
                page_keys.push(key);
            }
            idx += 1;

            if limit > 0 && idx == offset + limit {
                break;
            }
        }

        let items = page_keys
            .iter()
            .filter_map(|k| self.list.get(k).cloned())
            .collect();
        (items, selected, page_keys)
    }
}
