//! Sharing state derived from `@mentions` and friend-config lines.
//!
//! A config line has the shape `fzn_cfg:friend <email> @<owner>` and is only
//! honoured when addressed to the local user. Regular lines share an item by
//! mentioning `@<email>` of a known friend; mentions are repositioned to a
//! sorted block at the end of the line so the visible text stays stable.

use std::collections::{BTreeSet, HashMap};

use super::event::{Event, EventKind, ItemKey, Lamport};

pub const FRIEND_CONFIG_PREFIX: &str = "fzn_cfg:friend";

/// A change to the friend set, surfaced to the sync layer so it can attach
/// or detach the matching peer backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FriendChange {
    Added { email: String },
    Removed { email: String },
}

/// Per-friend bookkeeping: for each email, the items whose config lines
/// reference it, with the Lamport timestamp of the last change.
#[derive(Clone, Debug, Default)]
pub struct FriendsState {
    owner: Option<String>,
    friends: HashMap<String, HashMap<ItemKey, Lamport>>,
    most_recent_change: Lamport,
}

impl FriendsState {
    pub fn new(owner: Option<String>) -> Self {
        Self {
            owner: owner.map(|e| e.to_lowercase()),
            friends: HashMap::new(),
            most_recent_change: 0,
        }
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub fn is_friend(&self, email: &str) -> bool {
        self.friends.contains_key(&email.to_lowercase())
    }

    pub fn emails(&self) -> Vec<String> {
        let mut emails: Vec<String> = self
            .friends
            .keys()
            .filter(|e| Some(e.as_str()) != self.owner.as_deref())
            .cloned()
            .collect();
        emails.sort();
        emails
    }

    pub fn most_recent_change(&self) -> Lamport {
        self.most_recent_change
    }

    /// Extract the friend email from a config line addressed to the owner.
    pub fn email_from_config_line(&self, line: &str) -> Option<String> {
        let owner = self.owner.as_deref()?;
        let words: Vec<&str> = line.split_whitespace().collect();
        if words.len() == 3
            && words[0] == FRIEND_CONFIG_PREFIX
            && words[2].strip_prefix('@') == Some(owner)
        {
            return Some(words[1].to_lowercase());
        }
        None
    }

    /// Mentions in `line` that name known friends, unioned with the item's
    /// existing share set. The second result reports whether the mentions
    /// already sit in a single trailing block.
    pub fn friends_from_line(&self, line: &str, existing: &[String]) -> (Vec<String>, bool) {
        let mut found: BTreeSet<String> = existing.iter().cloned().collect();
        let mut seen_friend = false;
        let mut ordered = true;

        for word in line.split(' ') {
            let mention = word.strip_prefix('@');
            match mention {
                Some(email) if word.len() > 1 && self.is_friend(email) => {
                    // Case is preserved here; it is normalised on reposition.
                    if !found.insert(email.to_string()) {
                        ordered = false;
                    }
                    seen_friend = true;
                }
                _ => {
                    if seen_friend {
                        ordered = false;
                    }
                }
            }
        }
        (found.into_iter().collect(), ordered)
    }

    /// Move mentions to a sorted, lower-cased block at the end of the line
    /// and record the resulting share set on the event.
    pub fn reposition(&self, mut e: Event, existing: &[String]) -> Event {
        if e.line.is_empty() || e.friends.processed {
            return e;
        }

        let friends = if self.email_from_config_line(&e.line).is_some() {
            // Config lines are only ever visible to the owner.
            match &self.owner {
                Some(owner) => vec![owner.clone()],
                None => return e,
            }
        } else {
            let (friends, _) = self.friends_from_line(&e.line, existing);
            if friends.is_empty() {
                e.friends.processed = true;
                e.friends.offset = e.line.len() as i32;
                return e;
            }
            friends
        };

        let mut new_line = e.line.clone();
        for f in &friends {
            let at_friend = format!("@{f}");
            if new_line == at_friend {
                new_line.clear();
            } else {
                new_line = new_line.replace(&format!(" {at_friend}"), "");
                new_line = new_line.replace(&format!("{at_friend} "), "");
            }
        }

        let mut emails: Vec<String> = friends.iter().map(|f| f.to_lowercase()).collect();
        emails.sort();
        emails.dedup();

        let mut friend_block = String::new();
        for email in &emails {
            friend_block.push_str(" @");
            friend_block.push_str(email);
        }

        e.friends.offset = new_line.len() as i32;
        new_line.push_str(&friend_block);
        e.line = new_line;
        e.friends.processed = true;
        e.friends.emails = emails;
        e
    }

    /// Fold a replayed event into the friend set, using the item's previous
    /// line to detect config changes. Add and delete are handled in one call
    /// so the two sides of a rename stay atomic.
    pub fn observe(&mut self, e: &Event, existing_line: Option<&str>) -> Vec<FriendChange> {
        let before = existing_line.and_then(|line| self.email_from_config_line(line));

        let (to_remove, to_add) = match e.kind {
            EventKind::Add | EventKind::Update => {
                let after = self.email_from_config_line(&e.line);
                if before == after {
                    (None, None)
                } else {
                    (before, after)
                }
            }
            EventKind::Delete => (before, None),
            _ => return Vec::new(),
        };

        if to_remove.is_none() && to_add.is_none() {
            return Vec::new();
        }

        let mut changes = Vec::new();

        if let Some(email) = to_add {
            let items = self.friends.entry(email.clone()).or_default();
            let newer = items
                .get(&e.item_key)
                .is_none_or(|&last| e.lamport > last);
            if newer {
                items.insert(e.item_key.clone(), e.lamport);
                changes.push(FriendChange::Added { email });
            }
        }

        if let Some(email) = to_remove
            && Some(email.as_str()) != self.owner.as_deref()
        {
            let mut now_empty = false;
            if let Some(items) = self.friends.get_mut(&email)
                && items.get(&e.item_key).is_some_and(|&last| e.lamport > last)
            {
                items.remove(&e.item_key);
                now_empty = items.is_empty();
            }
            if now_empty {
                self.friends.remove(&email);
                changes.push(FriendChange::Removed { email });
            }
        }

        if !changes.is_empty() && self.most_recent_change < e.lamport {
            self.most_recent_change = e.lamport;
        }
        changes
    }
}

/// Backend access check: the owner's backends always receive; otherwise the
/// event must be shared with the backend's email.
pub fn email_has_access(e: &Event, email: &str) -> bool {
    e.friends.contains(email)
}
