//! Compaction equivalence over large generated logs.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use plait::core::{LamportClock, compact, lists_equivalent, project_and_match};
use plait::{Event, EventKind, ItemKey, LineFriends, ReplicaId};

/// A busy single-replica editing session: items are created, renamed many
/// times, annotated, shuffled, hidden, and some deleted for good.
fn editing_session(seed: u64, events: usize, keyspace: usize) -> Vec<Event> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut live: Vec<ItemKey> = Vec::new();
    let mut log = Vec::new();

    for lamport in 1..=events as i64 {
        let make = |kind: EventKind, item: ItemKey| Event {
            replica: ReplicaId(1),
            lamport,
            kind,
            item_key: item,
            target_key: ItemKey::absent(),
            line: String::new(),
            note: None,
            friends: LineFriends::default(),
        };

        let roll: u32 = if live.len() < 3 { 0 } else { rng.gen_range(0..12) };
        let e = match roll {
            0 | 1 if live.len() < keyspace => {
                let key = ItemKey::new(ReplicaId(1), lamport);
                let target = if live.is_empty() {
                    ItemKey::absent()
                } else {
                    live[rng.gen_range(0..live.len())].clone()
                };
                live.push(key.clone());
                let mut e = make(EventKind::Add, key);
                e.target_key = target;
                e.line = format!("item {lamport}");
                e
            }
            0..=5 => {
                let key = live[rng.gen_range(0..live.len())].clone();
                let mut e = make(EventKind::Update, key);
                if rng.gen_bool(0.7) {
                    e.line = format!("rename {lamport}");
                } else {
                    e.note = Some(format!("note {lamport}").into_bytes());
                }
                e
            }
            6 | 7 => {
                let key = live[rng.gen_range(0..live.len())].clone();
                let target = live[rng.gen_range(0..live.len())].clone();
                let mut e = make(
                    if rng.gen_bool(0.5) {
                        EventKind::MoveUp
                    } else {
                        EventKind::MoveDown
                    },
                    key,
                );
                e.target_key = target;
                e
            }
            8 | 9 => {
                let key = live[rng.gen_range(0..live.len())].clone();
                make(
                    if rng.gen_bool(0.5) {
                        EventKind::Hide
                    } else {
                        EventKind::Show
                    },
                    key,
                )
            }
            _ => {
                // Deleted keys leave the pool so later edits never try to
                // resurrect them.
                if live.len() > 3 {
                    let key = live.swap_remove(rng.gen_range(0..live.len()));
                    make(EventKind::Delete, key)
                } else {
                    let key = live[rng.gen_range(0..live.len())].clone();
                    make(EventKind::Show, key)
                }
            }
        };
        log.push(e);
    }
    log
}

#[test]
fn compaction_preserves_projection_on_large_logs() {
    let log = editing_session(1, 1000, 100);
    let (before, _) = project_and_match(&log);

    let mut clock = LamportClock::new();
    clock.observe(log.len() as i64);
    let compacted = compact(log.clone(), &mut clock, ReplicaId(1)).expect("compact");

    assert!(compacted.len() <= log.len());
    let (after, _) = project_and_match(&compacted);
    assert!(lists_equivalent(&before, &after));
}

#[test]
fn compaction_is_effective_on_update_heavy_logs() {
    let log = editing_session(2, 1000, 50);
    let updates_before = log
        .iter()
        .filter(|e| e.kind == EventKind::Update)
        .count();

    let mut clock = LamportClock::new();
    clock.observe(log.len() as i64);
    let compacted = compact(log, &mut clock, ReplicaId(1)).expect("compact");
    let updates_after = compacted
        .iter()
        .filter(|e| e.kind == EventKind::Update)
        .count();

    assert!(
        updates_after < updates_before,
        "expected superseded updates to be dropped ({updates_after} vs {updates_before})"
    );
}

#[test]
fn compaction_is_idempotent() {
    let log = editing_session(3, 600, 60);
    let mut clock = LamportClock::new();
    clock.observe(log.len() as i64);

    let once = compact(log, &mut clock, ReplicaId(1)).expect("first pass");
    let twice = compact(once.clone(), &mut clock, ReplicaId(1)).expect("second pass");
    assert_eq!(once, twice);
}

#[test]
fn structural_events_survive_compaction() {
    let log = editing_session(4, 800, 80);
    let count = |log: &[Event], kind: EventKind| {
        log.iter().filter(|e| e.kind == kind).count()
    };
    let adds = count(&log, EventKind::Add);
    let deletes = count(&log, EventKind::Delete);
    let moves = count(&log, EventKind::MoveUp) + count(&log, EventKind::MoveDown);

    let mut clock = LamportClock::new();
    clock.observe(log.len() as i64);
    let compacted = compact(log, &mut clock, ReplicaId(1)).expect("compact");

    assert_eq!(count(&compacted, EventKind::Add), adds);
    assert_eq!(count(&compacted, EventKind::Delete), deletes);
    assert_eq!(
        count(&compacted, EventKind::MoveUp) + count(&compacted, EventKind::MoveDown),
        moves
    );
}
