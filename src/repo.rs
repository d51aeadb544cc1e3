//! Caller-facing mutation API over the projected list.
//!
//! Every operation takes an index into the current match list, emits one
//! event, applies it synchronously to the projection, appends it to the
//! local log, and hands a copy to the sync engine's events channel. The
//! projection therefore always reflects the caller's own edits immediately;
//! convergence with other replicas happens through replayed deltas.

use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam::channel::Sender;
use thiserror::Error;

use crate::core::{
    Event, EventKind, FriendChange, Item, ItemKey, LamportClock, LineFriends, MatchGroup,
    Projection, ReplicaId, merge,
};
use crate::paths;
use crate::undo::{EventTemplate, UndoRing};
use crate::wal::{WalError, WalFile, build_blob, checksum_hex};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("list item index out of bounds: {idx}")]
    OutOfBounds { idx: usize },
    #[error("failed to write export file {path}: {source}")]
    Export {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// A collaborator cursor update: either locally produced (broadcast to
/// peers) or received from a peer channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CursorMove {
    pub email: String,
    pub item_key: ItemKey,
    pub unix_nanos: i64,
}

/// The replicated list store for one replica.
pub struct ListRepo {
    replica: ReplicaId,
    projection: Projection,
    log: Arc<RwLock<Vec<Event>>>,
    events_tx: Sender<Event>,
    undo: UndoRing,
    matched_keys: Vec<ItemKey>,
    previous_cur_key: Option<ItemKey>,
    cursor_tx: Option<Sender<CursorMove>>,
    collab_positions: HashMap<String, CursorMove>,
    pending_friend_changes: Vec<FriendChange>,
}

impl ListRepo {
    pub fn new(replica: ReplicaId, email: Option<String>, events_tx: Sender<Event>) -> Self {
        Self {
            replica,
            projection: Projection::new(email),
            log: Arc::new(RwLock::new(Vec::new())),
            events_tx,
            undo: UndoRing::new(),
            matched_keys: Vec::new(),
            previous_cur_key: None,
            cursor_tx: None,
            collab_positions: HashMap::new(),
            pending_friend_changes: Vec::new(),
        }
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    pub fn email(&self) -> Option<&str> {
        self.projection.friends.owner()
    }

    /// Shared handle to the cumulative local log; the sync engine reads it
    /// for gathers and full-log flushes.
    pub fn log(&self) -> Arc<RwLock<Vec<Event>>> {
        Arc::clone(&self.log)
    }

    pub fn clock(&self) -> &LamportClock {
        &self.projection.clock
    }

    /// Wire up the channel that carries local cursor moves to peers.
    pub fn set_cursor_channel(&mut self, tx: Sender<CursorMove>) {
        self.cursor_tx = Some(tx);
    }

    /// Friend-set changes accumulated since the last drain; the sync layer
    /// turns these into peer backend registrations.
    pub fn take_friend_changes(&mut self) -> Vec<FriendChange> {
        std::mem::take(&mut self.pending_friend_changes)
    }

    pub fn item(&self, key: &ItemKey) -> Option<&Item> {
        self.projection.list.get(key)
    }

    // -----------------------------------------------------------------------
    // Event emission
    // -----------------------------------------------------------------------

    fn emit(
        &mut self,
        kind: EventKind,
        item_key: Option<ItemKey>,
        target_key: ItemKey,
        line: String,
        note: Option<Vec<u8>>,
    ) -> ItemKey {
        let lamport = self.projection.clock.tick();
        let item_key = item_key.unwrap_or_else(|| ItemKey::new(self.replica, lamport));

        let mut e = Event {
            replica: self.replica,
            lamport,
            kind,
            item_key: item_key.clone(),
            target_key,
            line,
            note,
            friends: LineFriends::default(),
        };

        if matches!(kind, EventKind::Add | EventKind::Update) && !e.line.is_empty() {
            let existing = self
                .projection
                .list
                .get(&item_key)
                .map(|item| item.friends.emails.clone())
                .unwrap_or_default();
            e = self.projection.friends.reposition(e, &existing);
        }

        // The sync engine may not be running (tests, purge teardown); a
        // closed channel just means nobody is listening.
        let _ = self.events_tx.send(e.clone());

        if let Ok(mut log) = self.log.write() {
            log.push(e.clone());
        }

        let outcome = self.projection.replay(std::slice::from_ref(&e));
        self.pending_friend_changes.extend(outcome.friend_changes);
        item_key
    }

    fn matched(&self, idx: usize) -> Result<&ItemKey, RepoError> {
        self.matched_keys
            .get(idx)
            .ok_or(RepoError::OutOfBounds { idx })
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    /// Insert a new item below match position `idx - 1` (or at the head for
    /// `idx == 0` on an empty list). Returns the new item's key.
    pub fn add(&mut self, line: &str, note: Option<Vec<u8>>, idx: usize) -> Result<ItemKey, RepoError> {
        if idx > self.matched_keys.len() {
            return Err(RepoError::OutOfBounds { idx });
        }
        let child = if idx > 0 {
            self.matched_keys[idx - 1].clone()
        } else {
            ItemKey::absent()
        };

        let key = self.emit(
            EventKind::Add,
            None,
            child.clone(),
            line.to_string(),
            note.clone(),
        );

        self.undo.record(
            EventTemplate {
                kind: EventKind::Add,
                item_key: key.clone(),
                target_key: child.clone(),
                line: line.to_string(),
                note: note.clone(),
            },
            EventTemplate {
                kind: EventKind::Delete,
                item_key: key.clone(),
                target_key: child,
                line: line.to_string(),
                note,
            },
        );
        Ok(key)
    }

    /// Update the line (when non-empty) or the note of the item at `idx`.
    pub fn update(&mut self, line: &str, note: Option<Vec<u8>>, idx: usize) -> Result<(), RepoError> {
        let key = self.matched(idx)?.clone();
        let (old_line, old_note, child) = match self.projection.list.get(&key) {
            Some(item) => (
                item.line.clone(),
                item.note.clone(),
                item.child.clone().unwrap_or_else(ItemKey::absent),
            ),
            None => (String::new(), None, ItemKey::absent()),
        };

        self.undo.record(
            EventTemplate {
                kind: EventKind::Update,
                item_key: key.clone(),
                target_key: child.clone(),
                line: line.to_string(),
                note: note.clone(),
            },
            EventTemplate {
                kind: EventKind::Update,
                item_key: key.clone(),
                target_key: child.clone(),
                line: old_line,
                note: old_note,
            },
        );

        self.emit(EventKind::Update, Some(key), child, line.to_string(), note);
        Ok(())
    }

    /// Delete the item at `idx`. Returns the key the cursor should land on.
    pub fn delete(&mut self, idx: usize) -> Result<Option<ItemKey>, RepoError> {
        let key = self.matched(idx)?.clone();
        let (old_line, old_note, child, next_cursor) = match self.projection.list.get(&key) {
            Some(item) => (
                item.line.clone(),
                item.note.clone(),
                item.child.clone().unwrap_or_else(ItemKey::absent),
                item.match_child.clone(),
            ),
            None => (String::new(), None, ItemKey::absent(), None),
        };

        self.undo.record(
            EventTemplate {
                kind: EventKind::Delete,
                item_key: key.clone(),
                target_key: ItemKey::absent(),
                line: old_line.clone(),
                note: old_note.clone(),
            },
            EventTemplate {
                kind: EventKind::Add,
                item_key: key.clone(),
                target_key: child,
                line: old_line,
                note: old_note,
            },
        );

        self.emit(EventKind::Delete, Some(key), ItemKey::absent(), String::new(), None);
        Ok(next_cursor)
    }

    /// Swap the item at `idx` with the matched item above it. A move with
    /// nothing above it (or no resolvable anchor) is a no-op that emits no
    /// event; the result reports whether a move happened.
    pub fn move_up(&mut self, idx: usize) -> Result<bool, RepoError> {
        let key = self.matched(idx)?.clone();
        let Some(item) = self.projection.list.get(&key) else {
            return Ok(false);
        };
        let old_child = item.child.clone();
        // The new intended child is whatever sits above the matched item
        // being displaced (hidden neighbours included).
        let target = item
            .match_child
            .clone()
            .and_then(|mc| self.projection.list.get(&mc))
            .and_then(|mc| mc.child.clone());
        let Some(target) = target else {
            return Ok(false);
        };

        self.undo.record(
            EventTemplate {
                kind: EventKind::MoveUp,
                item_key: key.clone(),
                target_key: target.clone(),
                line: String::new(),
                note: None,
            },
            EventTemplate {
                kind: EventKind::MoveDown,
                item_key: key.clone(),
                target_key: old_child.unwrap_or_else(ItemKey::absent),
                line: String::new(),
                note: None,
            },
        );

        self.emit(EventKind::MoveUp, Some(key), target, String::new(), None);
        Ok(true)
    }

    /// Swap the item at `idx` with the matched item below it.
    pub fn move_down(&mut self, idx: usize) -> Result<bool, RepoError> {
        let key = self.matched(idx)?.clone();
        let Some(item) = self.projection.list.get(&key) else {
            return Ok(false);
        };
        let old_child = item.child.clone();
        let Some(target) = item.match_parent.clone() else {
            return Ok(false);
        };

        self.undo.record(
            EventTemplate {
                kind: EventKind::MoveDown,
                item_key: key.clone(),
                target_key: target.clone(),
                line: String::new(),
                note: None,
            },
            EventTemplate {
                kind: EventKind::MoveUp,
                item_key: key.clone(),
                target_key: old_child.unwrap_or_else(ItemKey::absent),
                line: String::new(),
                note: None,
            },
        );

        self.emit(EventKind::MoveDown, Some(key), target, String::new(), None);
        Ok(true)
    }

    /// Toggle an item between hidden and visible. Returns the key the
    /// cursor should land on afterwards.
    pub fn toggle_visibility(&mut self, idx: usize) -> Result<Option<ItemKey>, RepoError> {
        let key = self.matched(idx)?.clone();
        let Some(item) = self.projection.list.get(&key) else {
            return Ok(None);
        };

        let (kind, inverse_kind, next_cursor) = if item.hidden {
            // The newly shown item keeps the cursor.
            (EventKind::Show, EventKind::Hide, Some(key.clone()))
        } else {
            let next = item
                .match_parent
                .clone()
                .or_else(|| item.match_child.clone());
            (EventKind::Hide, EventKind::Show, next)
        };

        self.undo.record(
            EventTemplate {
                kind,
                item_key: key.clone(),
                target_key: ItemKey::absent(),
                line: String::new(),
                note: None,
            },
            EventTemplate {
                kind: inverse_kind,
                item_key: key.clone(),
                target_key: ItemKey::absent(),
                line: String::new(),
                note: None,
            },
        );

        self.emit(kind, Some(key), ItemKey::absent(), String::new(), None);
        Ok(next_cursor)
    }

    // -----------------------------------------------------------------------
    // Undo / redo
    // -----------------------------------------------------------------------

    /// Emit the inverse of the last recorded mutation. When the inverse is
    /// an Add (undoing a delete), the item is resurrected under a fresh key
    /// and Lamport so it can never collide with a not-yet-observed original.
    pub fn undo(&mut self) -> Result<Option<ItemKey>, RepoError> {
        let Some(entry) = self.undo.undo_peek() else {
            return Ok(None);
        };
        let template = entry.inverse.clone();
        let fresh = template.kind == EventKind::Add;

        let key = self.emit(
            template.kind,
            if fresh { None } else { Some(template.item_key) },
            template.target_key,
            template.line,
            template.note,
        );
        if fresh {
            self.undo.rekey_undone(&key);
        }
        self.undo.undo_commit();
        Ok(Some(key))
    }

    /// Re-emit the last undone mutation, with the same fresh-key rule as
    /// [`undo`](Self::undo).
    pub fn redo(&mut self) -> Result<Option<ItemKey>, RepoError> {
        let Some(entry) = self.undo.redo_peek() else {
            return Ok(None);
        };
        let template = entry.forward.clone();
        let fresh = template.kind == EventKind::Add;

        let key = self.emit(
            template.kind,
            if fresh { None } else { Some(template.item_key) },
            template.target_key,
            template.line,
            template.note,
        );
        if fresh {
            self.undo.rekey_redone(&key);
        }
        self.undo.redo_commit();
        Ok(Some(key))
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Filter the list by conjunctive keyword groups and refresh the match
    /// state that the index-based mutations operate on.
    pub fn match_items(
        &mut self,
        groups: &[MatchGroup],
        show_hidden: bool,
        cur_key: Option<&ItemKey>,
        offset: usize,
        limit: usize,
    ) -> (Vec<Item>, Option<usize>) {
        // Broadcast a cursor move only when the selection actually changed;
        // re-broadcasting on every refresh would bounce between clients
        // forever.
        if self.previous_cur_key.as_ref() != cur_key
            && let Some(tx) = &self.cursor_tx
        {
            let _ = tx.send(CursorMove {
                email: String::new(),
                item_key: cur_key.cloned().unwrap_or_else(ItemKey::absent),
                unix_nanos: now_nanos(),
            });
        }
        self.previous_cur_key = cur_key.cloned();

        let (items, selected, keys) =
            self.projection
                .match_items(groups, show_hidden, cur_key, offset, limit);
        self.matched_keys = keys;
        (items, selected)
    }

    /// Fold a delta pulled from backends or peers into local state and the
    /// cumulative log. Returns the set of keys the delta touched.
    pub fn replay(&mut self, delta: &[Event]) -> std::collections::HashSet<ItemKey> {
        if delta.is_empty() {
            return std::collections::HashSet::new();
        }
        let outcome = self.projection.replay(delta);
        self.pending_friend_changes.extend(outcome.friend_changes);
        if let Ok(mut log) = self.log.write() {
            let merged = merge(&log, delta);
            *log = merged;
        }
        outcome.changed
    }

    // -----------------------------------------------------------------------
    // Collaborator cursors
    // -----------------------------------------------------------------------

    /// Record a peer cursor position; newest per peer wins. Returns whether
    /// anything changed.
    pub fn set_collab_position(&mut self, ev: CursorMove) -> bool {
        match self.collab_positions.get(&ev.email) {
            Some(old) if old.unix_nanos >= ev.unix_nanos => false,
            _ => {
                self.collab_positions.insert(ev.email.clone(), ev);
                true
            }
        }
    }

    /// Item key → collaborators currently sitting on it.
    pub fn collab_positions(&self) -> HashMap<String, Vec<String>> {
        let mut positions: HashMap<String, Vec<String>> = HashMap::new();
        for (email, ev) in &self.collab_positions {
            positions
                .entry(ev.item_key.as_str().to_string())
                .or_default()
                .push(email.clone());
        }
        for emails in positions.values_mut() {
            emails.sort();
        }
        positions
    }

    // -----------------------------------------------------------------------
    // Export / import
    // -----------------------------------------------------------------------

    /// Write the current match set as plain text, one line per visible
    /// item, into `dir`. Notes are ignored.
    pub fn export_plain_text(
        &mut self,
        groups: &[MatchGroup],
        show_hidden: bool,
        dir: &Path,
    ) -> Result<PathBuf, RepoError> {
        let (items, _, _) = self
            .projection
            .match_items(groups, show_hidden, None, 0, 0);
        let path = dir.join(paths::export_file_name(now_nanos()));
        let export_err = |source: std::io::Error| RepoError::Export {
            path: path.display().to_string(),
            source,
        };

        let mut file = std::fs::File::create(&path).map_err(export_err)?;
        for item in items {
            writeln!(file, "{}", item.line).map_err(export_err)?;
        }
        Ok(path)
    }
}

/// Seed a backend from line-separated plain text: one Add per non-empty
/// line (plus a Hide when `hidden` is set), flushed as a single blob.
pub fn build_wal_from_plain_text(
    wf: &dyn WalFile,
    reader: impl BufRead,
    hidden: bool,
) -> Result<String, WalError> {
    let replica = ReplicaId::random();
    let mut clock = LamportClock::new();
    let mut events = Vec::new();

    for line in reader.lines() {
        let line = line.map_err(|e| WalError::Io {
            path: None,
            source: e,
        })?;
        if line.is_empty() {
            continue;
        }

        let lamport = clock.tick();
        let key = ItemKey::new(replica, lamport);
        events.push(Event {
            replica,
            lamport,
            kind: EventKind::Add,
            item_key: key.clone(),
            target_key: ItemKey::absent(),
            line,
            note: None,
            friends: LineFriends::default(),
        });
        if hidden {
            events.push(Event {
                replica,
                lamport: clock.tick(),
                kind: EventKind::Hide,
                item_key: key,
                target_key: ItemKey::absent(),
                line: String::new(),
                note: None,
                friends: LineFriends::default(),
            });
        }
    }

    let blob = build_blob(&events).map_err(|e| WalError::Io {
        path: None,
        source: std::io::Error::other(e),
    })?;
    let checksum = checksum_hex(&blob);
    wf.write(&checksum, &blob)?;
    Ok(checksum)
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}
