//! Projection-preserving log compaction.

use std::collections::HashSet;

use thiserror::Error;

use super::clock::LamportClock;
use super::event::{Event, EventKind, ItemKey, ReplicaId, compare};
use super::integrity::{IntegrityError, lists_equivalent, project_and_match, recover, verify_list};

#[derive(Debug, Error)]
pub enum CompactError {
    /// The incoming log failed its integrity check and was rebuilt from the
    /// surviving items. The caller should push the repaired log rather than
    /// silently overwrite.
    #[error("log integrity was recovered; the repaired log must be re-pushed")]
    Recovered { log: Vec<Event> },

    /// Recovery itself produced a broken list. Nothing more can be done.
    #[error("log recovery failed: {0}")]
    RecoveryFailed(#[source] IntegrityError),

    /// Compaction changed the projection. The sweep is buggy; fail loudly
    /// rather than ship a log that replays differently.
    #[error("compaction changed the projection: {0}")]
    InternalInvariant(#[source] IntegrityError),

    /// The compacted projection silently diverged from the original.
    #[error("compacted log is not equivalent to its source")]
    NotEquivalent,
}

/// Drop superseded Update events from a log while preserving its projection.
///
/// The sweep runs newest to oldest: for each item, the first line-bearing
/// Update seen is kept and older ones dropped, and independently the first
/// note-only Update. Everything else survives: Moves stay so ordering
/// resolves identically once anchors exist, and Delete purging is
/// intentionally disabled.
///
/// The input is re-sorted first (legacy logs were not always ordered)
/// and the result is proven list-equivalent to the input before returning.
pub fn compact(
    mut log: Vec<Event>,
    clock: &mut LamportClock,
    replica: ReplicaId,
) -> Result<Vec<Event>, CompactError> {
    if log.is_empty() {
        return Ok(log);
    }

    log.sort_by(compare);

    let (original, matches) = project_and_match(&log);
    if verify_list(&original, &matches).is_err() {
        let repaired = recover(&log, &matches, clock, replica);
        let (rebuilt, rebuilt_matches) = project_and_match(&repaired);
        verify_list(&rebuilt, &rebuilt_matches).map_err(CompactError::RecoveryFailed)?;
        return Err(CompactError::Recovered { log: repaired });
    }

    let mut kept_line_update: HashSet<ItemKey> = HashSet::new();
    let mut kept_note_update: HashSet<ItemKey> = HashSet::new();

    let mut compacted: Vec<Event> = Vec::with_capacity(log.len());
    for e in log.iter().rev() {
        if e.kind == EventKind::Update {
            if !e.line.is_empty() {
                if !kept_line_update.insert(e.item_key.clone()) {
                    continue;
                }
            } else if !kept_note_update.insert(e.item_key.clone()) {
                continue;
            }
        }
        compacted.push(e.clone());
    }
    compacted.reverse();

    let (swept, swept_matches) = project_and_match(&compacted);
    verify_list(&swept, &swept_matches).map_err(CompactError::InternalInvariant)?;
    if !lists_equivalent(&original, &swept) {
        return Err(CompactError::NotEquivalent);
    }

    Ok(compacted)
}
