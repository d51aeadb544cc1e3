//! Sync engine and runtime behaviour across backends.

use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::unbounded;

use plait::config::SyncConfig;
use plait::core::merge;
use plait::sync::{Notification, SyncRuntime};
use plait::wal::{LocalStore, build_blob, checksum_hex, read_blob};
use plait::{
    Event, EventKind, ItemKey, LineFriends, ListRepo, MemoryWalFile, ReplicaId, Shutdown,
    SyncEngine, WalFile,
};

fn event(replica: u32, lamport: i64, line: &str) -> Event {
    Event {
        replica: ReplicaId(replica),
        lamport,
        kind: EventKind::Add,
        item_key: ItemKey::new(ReplicaId(replica), lamport),
        target_key: ItemKey::absent(),
        line: line.to_string(),
        note: None,
        friends: LineFriends::default(),
    }
}

fn quick_cfg() -> SyncConfig {
    SyncConfig {
        pull_interval_secs: 1,
        push_debounce_secs: 0,
        gather_blob_threshold: 10,
        web_ping_secs: 30,
        web_refresh_secs: 60,
        pull_workers: 4,
    }
}

#[test]
fn gather_consolidates_eleven_tiny_blobs() {
    let local = Arc::new(MemoryWalFile::new("local"));
    let engine = SyncEngine::new(Arc::clone(&local), Some("me@example.com".to_string()), 10, 4);

    let backend = Arc::new(MemoryWalFile::new("me@example.com"));
    engine.add_walfile(backend.clone() as Arc<dyn WalFile>, true, false);

    // Eleven single-event blobs whose union is the log L.
    let mut union: Vec<Event> = Vec::new();
    for lamport in 1..=11 {
        let events = vec![event(2, lamport, &format!("tiny {lamport}"))];
        union = merge(&union, &events);
        let blob = build_blob(&events).expect("encode");
        backend.insert_raw(checksum_hex(&blob), blob);
    }

    let local_log = vec![event(1, 20, "local item")];
    let delta = engine
        .pull(&[backend.clone() as Arc<dyn WalFile>], &local_log)
        .expect("pull");
    assert_eq!(delta.len(), 11);

    // Exactly one blob remains; its name is the checksum of its contents,
    // and it decodes to merge(local, L).
    let names = backend.list().expect("list");
    assert_eq!(names.len(), 1, "expected consolidation to one blob");
    let bytes = backend.read(&names[0]).expect("read");
    assert_eq!(checksum_hex(&bytes), names[0]);
    assert_eq!(
        read_blob(&bytes).expect("decode"),
        merge(&local_log, &union)
    );
    assert!(engine.is_processed(&names[0]));
}

#[test]
fn pushed_blobs_are_never_pulled_back() {
    let local = Arc::new(MemoryWalFile::new("local"));
    let engine = SyncEngine::new(Arc::clone(&local), None, 10, 4);

    let backend = Arc::new(MemoryWalFile::new("store@example.com"));
    engine.add_walfile(backend.clone() as Arc<dyn WalFile>, true, false);

    let checksum = engine
        .push(backend.as_ref(), &[event(1, 1, "mine")], None)
        .expect("push")
        .expect("written");

    // The checksum is registered before the write could ever be listed.
    assert!(engine.is_processed(&checksum));

    let delta = engine
        .pull(&[backend as Arc<dyn WalFile>], &[])
        .expect("pull");
    assert!(delta.is_empty(), "own blob must not be re-enqueued");
}

#[test]
fn processed_set_covers_every_checksum_we_wrote() {
    let local = Arc::new(MemoryWalFile::new("local"));
    let engine = SyncEngine::new(Arc::clone(&local), None, 10, 4);

    let mut written = Vec::new();
    for lamport in 1..=5 {
        if let Some(checksum) = engine
            .push(local.as_ref(), &[event(1, lamport, "x")], None)
            .expect("push")
        {
            written.push(checksum);
        }
    }
    for checksum in written {
        assert!(engine.is_processed(&checksum));
    }
}

#[test]
fn pull_of_only_processed_blobs_is_an_empty_delta() {
    let local = Arc::new(MemoryWalFile::new("local"));
    let engine = SyncEngine::new(Arc::clone(&local), None, 10, 4);

    let backend = Arc::new(MemoryWalFile::new("store@example.com"));
    engine.add_walfile(backend.clone() as Arc<dyn WalFile>, true, false);
    let blob = build_blob(&[event(3, 3, "seen before")]).expect("encode");
    backend.insert_raw(checksum_hex(&blob), blob);

    let first = engine
        .pull(&[backend.clone() as Arc<dyn WalFile>], &[])
        .expect("pull");
    assert_eq!(first.len(), 1);

    let second = engine
        .pull(&[backend as Arc<dyn WalFile>], &[])
        .expect("pull");
    assert!(second.is_empty());
}

#[test]
fn two_replicas_converge_through_a_shared_backend() {
    let shared = Arc::new(MemoryWalFile::new("shared@example.com"));

    // Replica A.
    let local_a = Arc::new(MemoryWalFile::new("local"));
    let engine_a = Arc::new(SyncEngine::new(Arc::clone(&local_a), None, 100, 2));
    engine_a.add_walfile(shared.clone() as Arc<dyn WalFile>, true, false);
    let (events_tx_a, events_rx_a) = unbounded();
    let replica_a = local_a.replica_id().expect("id");
    let repo_a = ListRepo::new(replica_a, None, events_tx_a);
    let handle_a =
        SyncRuntime::start(repo_a, Arc::clone(&engine_a), events_rx_a, None, &quick_cfg())
            .expect("start a");

    // Replica B.
    let local_b = Arc::new(MemoryWalFile::new("local"));
    let engine_b = Arc::new(SyncEngine::new(Arc::clone(&local_b), None, 100, 2));
    engine_b.add_walfile(shared.clone() as Arc<dyn WalFile>, true, false);
    let (events_tx_b, events_rx_b) = unbounded();
    let repo_b = ListRepo::new(ReplicaId(99), None, events_tx_b);
    let handle_b =
        SyncRuntime::start(repo_b, Arc::clone(&engine_b), events_rx_b, None, &quick_cfg())
            .expect("start b");

    // A writes; the debounced push lands on the shared backend, and B's
    // pull loop replays it.
    handle_a
        .with_repo(|repo| {
            repo.match_items(&[], true, None, 0, 0);
            repo.add("hello from a", None, 0).expect("add");
        })
        .expect("task");

    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    let mut converged = false;
    while std::time::Instant::now() < deadline {
        match handle_b.notifications().recv_timeout(Duration::from_secs(5)) {
            Ok(Notification::Refresh { .. }) => {
                let lines: Vec<String> = handle_b
                    .with_repo(|repo| {
                        let (items, _) = repo.match_items(&[], true, None, 0, 0);
                        items.into_iter().map(|i| i.line).collect()
                    })
                    .expect("task");
                if lines == vec!["hello from a".to_string()] {
                    converged = true;
                    break;
                }
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }
    assert!(converged, "replica B never saw replica A's edit");

    handle_a.stop(Shutdown::Normal);
    handle_b.stop(Shutdown::Normal);
}
