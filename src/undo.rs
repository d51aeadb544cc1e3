//! In-memory undo/redo ring of (forward, inverse) event templates.

use crate::core::{EventKind, ItemKey};

/// The reusable part of an event: everything except replica and Lamport,
/// which are always assigned fresh at emit time.
#[derive(Clone, Debug)]
pub struct EventTemplate {
    pub kind: EventKind,
    pub item_key: ItemKey,
    pub target_key: ItemKey,
    pub line: String,
    pub note: Option<Vec<u8>>,
}

#[derive(Clone, Debug)]
pub struct UndoEntry {
    pub forward: EventTemplate,
    pub inverse: EventTemplate,
}

/// Linear history with a cursor. Recording a new entry truncates the redo
/// tail, as in any editor.
#[derive(Debug, Default)]
pub struct UndoRing {
    entries: Vec<UndoEntry>,
    cursor: usize,
}

impl UndoRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, forward: EventTemplate, inverse: EventTemplate) {
        self.entries.truncate(self.cursor);
        self.entries.push(UndoEntry { forward, inverse });
        self.cursor += 1;
    }

    /// Entry that an undo would replay (inverse direction), if any.
    pub fn undo_peek(&self) -> Option<&UndoEntry> {
        self.cursor.checked_sub(1).and_then(|i| self.entries.get(i))
    }

    pub fn undo_commit(&mut self) {
        if self.cursor > 0 {
            self.cursor -= 1;
        }
    }

    /// Entry that a redo would replay (forward direction), if any.
    pub fn redo_peek(&self) -> Option<&UndoEntry> {
        self.entries.get(self.cursor)
    }

    pub fn redo_commit(&mut self) {
        if self.cursor < self.entries.len() {
            self.cursor += 1;
        }
    }

    /// Rebind the entry an undo just replayed to a fresh item key. Needed
    /// when the inverse was an Add: the resurrected item is born under a
    /// new key, and any later redo must follow it.
    pub fn rekey_undone(&mut self, key: &ItemKey) {
        if let Some(i) = self.cursor.checked_sub(1)
            && let Some(entry) = self.entries.get_mut(i)
        {
            entry.forward.item_key = key.clone();
            entry.inverse.item_key = key.clone();
        }
    }

    /// Same as [`rekey_undone`](Self::rekey_undone), for the redo side.
    pub fn rekey_redone(&mut self, key: &ItemKey) {
        if let Some(entry) = self.entries.get_mut(self.cursor) {
            entry.forward.item_key = key.clone();
            entry.inverse.item_key = key.clone();
        }
    }
}
