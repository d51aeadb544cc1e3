//! Fiber wiring for a running replica.
//!
//! Projection state is only ever touched on the selector thread: replay
//! deltas, incoming peer cursor moves, and caller tasks all funnel through
//! one `select!` loop, so every operation sees a well-defined snapshot.
//! The pull, push, peer-refresh, and cursor-broadcast loops run on their
//! own threads and communicate with the selector exclusively via channels.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender, bounded, unbounded};

use super::engine::SyncEngine;
use super::peer::{PeerMessage, PeerTransport, PeerWalFile, run_peer_consumer};
use super::{Shutdown, SyncError};
use crate::config::SyncConfig;
use crate::core::{Event, FriendChange, ItemKey};
use crate::repo::{CursorMove, ListRepo};
use crate::wal::build_blob;

/// Out-of-band notifications for the embedding client (a TUI, a test).
#[derive(Clone, Debug)]
pub enum Notification {
    /// A replayed delta touched these keys; re-render.
    Refresh { changed: Vec<ItemKey> },
    /// A collaborator cursor moved.
    CollabMoved,
}

pub type RepoTask = Box<dyn FnOnce(&mut ListRepo) + Send + 'static>;

/// Handle to a running replica. Tasks execute serially on the selector
/// thread; dropping the handle without [`stop`](SyncHandle::stop) leaves
/// the fibers running detached.
pub struct SyncHandle {
    tasks: Sender<RepoTask>,
    notifications: Receiver<Notification>,
    stop_tx: Sender<Shutdown>,
    joins: Vec<JoinHandle<()>>,
}

impl SyncHandle {
    /// Run a closure against the repo on the selector thread and wait for
    /// its result.
    pub fn with_repo<R, F>(&self, f: F) -> Result<R, SyncError>
    where
        R: Send + 'static,
        F: FnOnce(&mut ListRepo) -> R + Send + 'static,
    {
        let (tx, rx) = bounded(1);
        self.tasks
            .send(Box::new(move |repo| {
                let _ = tx.send(f(repo));
            }))
            .map_err(|_| SyncError::ChannelClosed)?;
        rx.recv().map_err(|_| SyncError::ChannelClosed)
    }

    pub fn notifications(&self) -> &Receiver<Notification> {
        &self.notifications
    }

    /// Shut the replica down: stop the loops, drain the push fiber with a
    /// final synchronous flush, then run the engine's finish step (which
    /// purges the local store when asked to).
    pub fn stop(mut self, mode: Shutdown) {
        let _ = self.stop_tx.send(mode);
        for join in self.joins.drain(..) {
            let _ = join.join();
        }
    }
}

pub struct SyncRuntime;

impl SyncRuntime {
    /// Boot the fibers for `repo` over `engine`. The events channel's
    /// receiving half (fed by the repo's emits) must be handed over here.
    pub fn start(
        mut repo: ListRepo,
        engine: Arc<SyncEngine>,
        events_rx: Receiver<Event>,
        transport: Option<Arc<dyn PeerTransport>>,
        cfg: &SyncConfig,
    ) -> Result<SyncHandle, SyncError> {
        let (replay_tx, replay_rx) = bounded::<Vec<Event>>(16);
        let (remote_cursor_tx, remote_cursor_rx) = bounded::<CursorMove>(64);
        let (task_tx, task_rx) = unbounded::<RepoTask>();
        let (notif_tx, notif_rx) = bounded::<Notification>(128);
        let (stop_tx, stop_rx) = bounded::<Shutdown>(1);
        let (pull_stop_tx, pull_stop_rx) = bounded::<()>(1);
        let (push_stop_tx, push_stop_rx) = bounded::<()>(1);
        let (push_ack_tx, push_ack_rx) = bounded::<()>(1);
        let (web_stop_tx, web_stop_rx) = bounded::<()>(1);
        let (ws_tx, ws_rx) = unbounded::<PeerMessage>();
        let (local_cursor_tx, local_cursor_rx) = unbounded::<CursorMove>();

        let ws_tx = transport.as_ref().map(|_| ws_tx);
        repo.set_cursor_channel(local_cursor_tx);

        // Initial load from the local backend, before anything else runs.
        let local_delta = engine.pull(&[engine.local_walfile()], &[])?;
        repo.replay(&local_delta);
        apply_friend_changes(&mut repo, &engine, ws_tx.as_ref());

        let mut joins = Vec::new();

        // Pull loop: fixed delay measured from the END of each cycle, so a
        // slow pull never piles onto itself.
        {
            let engine = Arc::clone(&engine);
            let log = repo.log();
            let replay_tx = replay_tx.clone();
            let pull_interval = cfg.pull_interval();
            joins.push(std::thread::spawn(move || {
                loop {
                    let snapshot = log.read().map(|l| l.clone()).unwrap_or_default();
                    match engine.pull(&engine.sync_walfiles(), &snapshot) {
                        Ok(delta) => {
                            if !delta.is_empty() && replay_tx.send(delta).is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::warn!("pull cycle failed: {e}"),
                    }
                    crossbeam::select! {
                        recv(channel::after(pull_interval)) -> _ => {},
                        recv(pull_stop_rx) -> _ => break,
                    }
                }
            }));
        }

        // Push loop: aggregate emitted events, debounce, flush in batches.
        {
            let engine = Arc::clone(&engine);
            let log = repo.log();
            let ws_tx = ws_tx.clone();
            let push_debounce = cfg.push_debounce();
            joins.push(std::thread::spawn(move || {
                let mut batch: Vec<Event> = Vec::new();
                let mut debounce = channel::never();
                let flush = |batch: &mut Vec<Event>| {
                    let full = log.read().map(|l| l.clone()).unwrap_or_default();
                    engine.flush_partial(batch, &full);
                    batch.clear();
                };
                loop {
                    let mut rearm = false;
                    let mut fire = false;
                    let mut stopping = false;
                    let mut acknowledge = false;
                    crossbeam::select! {
                        recv(events_rx) -> msg => match msg {
                            Ok(e) => {
                                // Live single-event blobs go to peers right
                                // away; the blob push waits for the debounce.
                                if let Some(ws_tx) = &ws_tx {
                                    live_peer_push(&engine, ws_tx, &e);
                                }
                                batch.push(e);
                                rearm = true;
                            }
                            Err(_) => stopping = true,
                        },
                        recv(debounce) -> _ => fire = true,
                        recv(push_stop_rx) -> _ => {
                            stopping = true;
                            acknowledge = true;
                        },
                    }

                    if rearm {
                        // Every emitted event re-arms the one-shot timer;
                        // the flush fires once the caller goes idle.
                        debounce = channel::after(push_debounce);
                    }
                    if fire {
                        flush(&mut batch);
                        debounce = channel::never();
                    }
                    if stopping {
                        flush(&mut batch);
                        if acknowledge {
                            let _ = push_ack_tx.send(());
                        }
                        break;
                    }
                }
            }));
        }

        // Peer channel: refresh loop with exponential backoff owns the
        // connection; each established connection gets its own consumer.
        if let (Some(transport), Some(ws)) = (transport.as_ref(), ws_tx.as_ref()) {
            // The user's own peer walfile receives everything (it fans out
            // to their other devices) and counts as owned.
            if let Some(email) = engine.email().map(str::to_string) {
                engine.add_walfile(Arc::new(PeerWalFile::new(email, ws.clone())), true, true);
            }
            let transport = Arc::clone(transport);
            let replay_tx = replay_tx.clone();
            let remote_cursor_tx = remote_cursor_tx.clone();
            let ping_interval = cfg.web_ping_interval();
            let refresh_interval = cfg.web_refresh_interval();
            joins.push(std::thread::spawn(move || {
                run_web_loop(
                    transport,
                    ws_rx,
                    replay_tx,
                    remote_cursor_tx,
                    ping_interval,
                    refresh_interval,
                    web_stop_rx,
                );
            }));

            // Cursor broadcaster: local moves fan out to every peer.
            let engine_cb = Arc::clone(&engine);
            let ws_tx_cb = ws_tx.clone();
            joins.push(std::thread::spawn(move || {
                while let Ok(mv) = local_cursor_rx.recv() {
                    let Some(ws_tx) = &ws_tx_cb else { break };
                    for wf in engine_cb.web_walfiles() {
                        let _ = ws_tx.send(PeerMessage::Position {
                            uuid: wf.uuid().to_string(),
                            item_key: mv.item_key.clone(),
                            unix_nanos: mv.unix_nanos,
                        });
                    }
                }
            }));
        }

        // Selector: the only thread that touches the projection.
        {
            let engine = Arc::clone(&engine);
            let ws_tx = ws_tx.clone();
            // Held so the cursor channel cannot disconnect while the
            // selector runs (no peer transport means no other sender).
            let remote_cursor_keepalive = remote_cursor_tx.clone();
            joins.insert(
                0,
                std::thread::spawn(move || {
                    let _remote_cursor_keepalive = remote_cursor_keepalive;
                    loop {
                        crossbeam::select! {
                            recv(replay_rx) -> msg => match msg {
                                Ok(delta) => {
                                    let changed = repo.replay(&delta);
                                    apply_friend_changes(&mut repo, &engine, ws_tx.as_ref());
                                    let _ = notif_tx.try_send(Notification::Refresh {
                                        changed: changed.into_iter().collect(),
                                    });
                                }
                                Err(_) => break,
                            },
                            recv(remote_cursor_rx) -> msg => match msg {
                                Ok(mv) => {
                                    if repo.set_collab_position(mv) {
                                        let _ = notif_tx.try_send(Notification::CollabMoved);
                                    }
                                }
                                Err(_) => break,
                            },
                            recv(task_rx) -> msg => match msg {
                                Ok(task) => {
                                    task(&mut repo);
                                    apply_friend_changes(&mut repo, &engine, ws_tx.as_ref());
                                }
                                Err(_) => break,
                            },
                            recv(stop_rx) -> msg => {
                                let mode = msg.unwrap_or(Shutdown::Normal);
                                let _ = pull_stop_tx.send(());
                                let _ = web_stop_tx.send(());
                                let _ = push_stop_tx.send(());
                                // Wait for the push fiber's final flush.
                                let _ = push_ack_rx.recv_timeout(Duration::from_secs(10));
                                let full =
                                    repo.log().read().map(|l| l.clone()).unwrap_or_default();
                                if let Err(e) =
                                    engine.finish(&full, matches!(mode, Shutdown::Purge))
                                {
                                    tracing::warn!("finish failed: {e}");
                                }
                                break;
                            }
                        }
                    }
                }),
            );
        }

        Ok(SyncHandle {
            tasks: task_tx,
            notifications: notif_rx,
            stop_tx,
            joins,
        })
    }
}

fn live_peer_push(engine: &SyncEngine, ws_tx: &Sender<PeerMessage>, e: &Event) {
    for wf in engine.web_walfiles() {
        let filtered = engine.filter_for(std::slice::from_ref(e), wf.as_ref());
        if filtered.is_empty() {
            continue;
        }
        match build_blob(&filtered) {
            Ok(payload) => {
                let _ = ws_tx.send(PeerMessage::Wal {
                    to: wf.uuid().to_string(),
                    payload,
                });
            }
            Err(err) => tracing::warn!("peer blob encode failed: {err}"),
        }
    }
}

fn apply_friend_changes(
    repo: &mut ListRepo,
    engine: &SyncEngine,
    ws_tx: Option<&Sender<PeerMessage>>,
) {
    for change in repo.take_friend_changes() {
        match change {
            FriendChange::Added { email } => {
                tracing::info!("sharing with {email}");
                if let Some(ws_tx) = ws_tx {
                    engine.add_walfile(
                        Arc::new(PeerWalFile::new(email, ws_tx.clone())),
                        false,
                        true,
                    );
                }
            }
            FriendChange::Removed { email } => {
                tracing::info!("no longer sharing with {email}");
                engine.remove_walfile(&email);
            }
        }
    }
}

fn run_web_loop(
    transport: Arc<dyn PeerTransport>,
    ws_rx: Receiver<PeerMessage>,
    replay_tx: Sender<Vec<Event>>,
    remote_cursor_tx: Sender<CursorMove>,
    ping_interval: Duration,
    refresh_interval: Duration,
    stop_rx: Receiver<()>,
) {
    let mut backoff = Duration::from_secs(1);
    let mut refresh = channel::after(Duration::ZERO);
    let ping = channel::tick(ping_interval);
    let mut sender: Option<Box<dyn super::peer::PeerSender>> = None;
    let mut nonce: u64 = 0;

    loop {
        let mut reconnect = false;
        let mut rearm: Option<Duration> = None;
        let mut stopping = false;
        crossbeam::select! {
            recv(refresh) -> _ => reconnect = true,
            recv(ping) -> _ => {
                if let Some(tx) = &mut sender {
                    nonce += 1;
                    if tx.send(&PeerMessage::Ping { nonce }).is_err() {
                        sender = None;
                        rearm = Some(Duration::ZERO);
                    }
                }
            },
            recv(ws_rx) -> msg => match msg {
                Ok(m) => {
                    if let Some(tx) = &mut sender
                        && tx.send(&m).is_err()
                    {
                        sender = None;
                        rearm = Some(Duration::ZERO);
                    }
                }
                Err(_) => stopping = true,
            },
            recv(stop_rx) -> _ => stopping = true,
        }

        if stopping {
            if let Some(mut old) = sender.take() {
                old.close();
            }
            break;
        }

        if reconnect {
            if let Some(mut old) = sender.take() {
                old.close();
            }
            match transport.connect() {
                Ok((tx, rx)) => {
                    sender = Some(tx);
                    backoff = Duration::from_secs(1);
                    rearm = Some(refresh_interval);
                    let replay_tx = replay_tx.clone();
                    let remote_cursor_tx = remote_cursor_tx.clone();
                    // The consumer lives until the connection drops; it is
                    // torn down implicitly when `close` breaks its recv.
                    std::thread::spawn(move || {
                        run_peer_consumer(rx, replay_tx, remote_cursor_tx);
                    });
                }
                Err(e) => {
                    tracing::warn!("peer connect failed, retrying in {backoff:?}: {e}");
                    rearm = Some(backoff);
                    backoff = (backoff * 2).min(refresh_interval);
                }
            }
        }

        if let Some(delay) = rearm {
            refresh = channel::after(delay);
        }
    }
}
