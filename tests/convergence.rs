//! Cross-replica convergence properties of merge and replay.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use plait::core::{Projection, project_and_match, verify_list};
use plait::{Event, EventKind, ItemKey, LineFriends, ReplicaId, compare, merge};

fn add(replica: u32, lamport: i64, line: &str, target: ItemKey) -> Event {
    Event {
        replica: ReplicaId(replica),
        lamport,
        kind: EventKind::Add,
        item_key: ItemKey::new(ReplicaId(replica), lamport),
        target_key: target,
        line: line.to_string(),
        note: None,
        friends: LineFriends::default(),
    }
}

fn event(replica: u32, lamport: i64, kind: EventKind, item: ItemKey) -> Event {
    Event {
        replica: ReplicaId(replica),
        lamport,
        kind,
        item_key: item,
        target_key: ItemKey::absent(),
        line: String::new(),
        note: None,
        friends: LineFriends::default(),
    }
}

fn order_of(log: &[Event]) -> Vec<(String, String, bool)> {
    let mut projection = Projection::new(None);
    projection.replay(log);
    projection
        .list
        .walk()
        .map(|item| (item.key.as_str().to_string(), item.line.clone(), item.hidden))
        .collect()
}

/// Pseudo-random but structurally valid single-replica log.
fn random_log(seed: u64, replica: u32, events: usize, keyspace: usize) -> Vec<Event> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut keys: Vec<ItemKey> = Vec::new();
    let mut log = Vec::new();

    for lamport in 1..=events as i64 {
        let roll: u32 = if keys.len() < 3 { 0 } else { rng.gen_range(0..10) };
        let e = match roll {
            0..=2 if keys.len() < keyspace => {
                let target = if keys.is_empty() || rng.gen_bool(0.3) {
                    ItemKey::absent()
                } else {
                    keys[rng.gen_range(0..keys.len())].clone()
                };
                let e = add(replica, lamport, &format!("line {replica}:{lamport}"), target);
                keys.push(e.item_key.clone());
                e
            }
            0..=5 => {
                let key = keys[rng.gen_range(0..keys.len())].clone();
                let mut e = event(replica, lamport, EventKind::Update, key);
                if rng.gen_bool(0.5) {
                    e.line = format!("updated {replica}:{lamport}");
                } else {
                    e.note = Some(vec![lamport as u8]);
                }
                e
            }
            6 => {
                let key = keys[rng.gen_range(0..keys.len())].clone();
                event(replica, lamport, EventKind::Delete, key)
            }
            7 => {
                let key = keys[rng.gen_range(0..keys.len())].clone();
                let target = keys[rng.gen_range(0..keys.len())].clone();
                let mut e = event(replica, lamport, EventKind::MoveUp, key);
                e.target_key = target;
                e
            }
            8 => {
                let key = keys[rng.gen_range(0..keys.len())].clone();
                event(replica, lamport, EventKind::Hide, key)
            }
            _ => {
                let key = keys[rng.gen_range(0..keys.len())].clone();
                event(replica, lamport, EventKind::Show, key)
            }
        };
        log.push(e);
    }
    log
}

#[test]
fn merged_logs_are_sorted_and_duplicate_free() {
    let a = random_log(11, 1, 200, 40);
    let b = random_log(22, 2, 200, 40);
    let merged = merge(&a, &b);
    for pair in merged.windows(2) {
        assert_eq!(compare(&pair[0], &pair[1]), std::cmp::Ordering::Less);
    }
}

#[test]
fn merge_commutes_on_random_logs() {
    let a = random_log(1, 1, 300, 50);
    let b = random_log(2, 2, 300, 50);
    assert_eq!(merge(&a, &b), merge(&b, &a));
}

#[test]
fn merge_associates_on_random_logs() {
    let a = random_log(3, 1, 150, 30);
    let b = random_log(4, 2, 150, 30);
    let c = random_log(5, 3, 150, 30);
    assert_eq!(merge(&merge(&a, &b), &c), merge(&a, &merge(&b, &c)));
}

#[test]
fn replay_of_merge_equals_replay_then_apply() {
    // The pull-loop pattern: local state first, then a delta from a peer
    // that has already observed it (so its Lamports run ahead).
    let a = random_log(6, 1, 250, 40);
    let max_lamport = a.iter().map(|e| e.lamport).max().unwrap_or(0);

    let keys: Vec<ItemKey> = a
        .iter()
        .filter(|e| e.kind == EventKind::Add)
        .map(|e| e.item_key.clone())
        .collect();
    let mut rng = StdRng::seed_from_u64(7);
    let mut b = Vec::new();
    for i in 0..120i64 {
        let lamport = max_lamport + 1 + i;
        let key = keys[rng.gen_range(0..keys.len())].clone();
        let e = match rng.gen_range(0..4) {
            0 => {
                let mut e = event(2, lamport, EventKind::Update, key);
                e.line = format!("peer edit {lamport}");
                e
            }
            1 => event(2, lamport, EventKind::Hide, key),
            2 => event(2, lamport, EventKind::Show, key),
            _ => {
                let target = keys[rng.gen_range(0..keys.len())].clone();
                let mut e = event(2, lamport, EventKind::MoveUp, key);
                e.target_key = target;
                e
            }
        };
        b.push(e);
    }

    let merged_order = order_of(&merge(&a, &b));

    let mut stepped = Projection::new(None);
    stepped.replay(&a);
    stepped.replay(&b);
    let stepped_order: Vec<(String, String, bool)> = stepped
        .list
        .walk()
        .map(|item| (item.key.as_str().to_string(), item.line.clone(), item.hidden))
        .collect();

    assert_eq!(merged_order, stepped_order);
}

#[test]
fn replicas_converge_regardless_of_merge_direction() {
    let a = random_log(8, 1, 400, 60);
    let b = random_log(9, 2, 400, 60);

    assert_eq!(order_of(&merge(&a, &b)), order_of(&merge(&b, &a)));
}

#[test]
fn replayed_state_always_passes_integrity() {
    for seed in 0..8 {
        let a = random_log(seed, 1, 300, 50);
        let b = random_log(seed + 100, 2, 300, 50);
        let (projection, matches) = project_and_match(&merge(&a, &b));
        verify_list(&projection, &matches)
            .unwrap_or_else(|e| panic!("seed {seed} failed integrity: {e}"));
    }
}

#[test]
fn two_replica_add_resolves_tie_to_lower_replica() {
    // Both replicas add their first item concurrently at Lamport 1.
    let r1 = add(1, 1, "a", ItemKey::absent());
    let r2 = add(2, 1, "b", ItemKey::absent());

    let expected = vec![
        ("1:1".to_string(), "a".to_string(), false),
        ("2:1".to_string(), "b".to_string(), false),
    ];
    assert_eq!(order_of(&merge(&[r1.clone()], &[r2.clone()])), expected);
    assert_eq!(order_of(&merge(&[r2], &[r1])), expected);
}

#[test]
fn out_of_order_update_precedes_its_add() {
    let mut update = event(7, 10, EventKind::Update, ItemKey::from("7:5"));
    update.line = "x".to_string();
    let mut late_add = add(7, 3, "", ItemKey::absent());
    late_add.item_key = ItemKey::from("7:5");

    // Delivery order: the Update arrives first.
    let order = order_of(&[update, late_add]);
    assert_eq!(order, vec![("7:5".to_string(), "x".to_string(), false)]);
}

#[test]
fn chunked_delivery_matches_one_shot_replay() {
    // A merged log delivered as many small partials (the shape the pull
    // loop and gather produce) must project exactly like one big replay.
    let merged = merge(&random_log(42, 1, 200, 30), &random_log(43, 2, 200, 30));
    let baseline = order_of(&merged);

    for chunk_size in [1usize, 7, 50] {
        let mut p = Projection::new(None);
        for chunk in merged.chunks(chunk_size) {
            p.replay(chunk);
        }
        let order: Vec<(String, String, bool)> = p
            .list
            .walk()
            .map(|item| (item.key.as_str().to_string(), item.line.clone(), item.hidden))
            .collect();
        assert_eq!(order, baseline, "chunk size {chunk_size} diverged");
    }
}

#[test]
fn redelivered_chunks_are_idempotent() {
    let merged = merge(&random_log(50, 1, 150, 25), &random_log(51, 2, 150, 25));
    let baseline = order_of(&merged);

    // Deliver everything, then re-deliver overlapping slices.
    let mut p = Projection::new(None);
    p.replay(&merged);
    p.replay(&merged[..merged.len() / 2]);
    p.replay(&merged[merged.len() / 4..]);
    let order: Vec<(String, String, bool)> = p
        .list
        .walk()
        .map(|item| (item.key.as_str().to_string(), item.line.clone(), item.hidden))
        .collect();
    assert_eq!(order, baseline);
}

#[test]
fn lamport_clock_stays_ahead_of_observed_events() {
    let log = random_log(77, 3, 100, 20);
    let mut projection = Projection::new(None);
    projection.replay(&log);

    let max_seen = log.iter().map(|e| e.lamport).max().unwrap_or(0);
    assert!(projection.clock.current() >= max_seen);
    assert!(projection.clock.tick() > max_seen);
}
