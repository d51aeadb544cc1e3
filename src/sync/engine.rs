//! Pull/push coordinator over the registered walfile backends.
//!
//! Backends live in three registries: `all` (fan-out target for pushes),
//! `sync` (backends owned by this user: fan-in source for pulls, eligible
//! for gather), and `web` (live peer channels). Lock order is fixed
//! all → sync → web, and no registry lock is ever held across backend I/O.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};

use super::SyncError;
use crate::core::{Event, friends::email_has_access, merge};
use crate::wal::{LocalStore, WalFile, build_blob, checksum_hex, read_blob};

use std::sync::Arc;

pub struct SyncEngine {
    local: Arc<dyn LocalStore>,
    local_wf: Arc<dyn WalFile>,
    email: Option<String>,
    gather_threshold: usize,
    pull_workers: usize,
    all: RwLock<BTreeMap<String, Arc<dyn WalFile>>>,
    sync: RwLock<BTreeMap<String, Arc<dyn WalFile>>>,
    web: RwLock<BTreeMap<String, Arc<dyn WalFile>>>,
    /// Content checksums this replica has decoded or produced. Consulted
    /// before every read and extended before every write, so a pushed blob
    /// can never be pulled back in.
    processed: Mutex<HashSet<String>>,
}

struct BackendPull {
    wf: Arc<dyn WalFile>,
    listed: usize,
    wal: Vec<Event>,
    pulled: Vec<String>,
}

impl SyncEngine {
    pub fn new<L>(
        local: Arc<L>,
        email: Option<String>,
        gather_threshold: usize,
        pull_workers: usize,
    ) -> Self
    where
        L: LocalStore + 'static,
    {
        let local_wf: Arc<dyn WalFile> = local.clone();
        let engine = Self {
            local: local as Arc<dyn LocalStore>,
            local_wf: local_wf.clone(),
            email: email.map(|e| e.to_lowercase()),
            gather_threshold,
            pull_workers: pull_workers.max(1),
            all: RwLock::new(BTreeMap::new()),
            sync: RwLock::new(BTreeMap::new()),
            web: RwLock::new(BTreeMap::new()),
            processed: Mutex::new(HashSet::new()),
        };
        engine.add_walfile(local_wf, true, false);
        engine
    }

    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    pub fn local_walfile(&self) -> Arc<dyn WalFile> {
        Arc::clone(&self.local_wf)
    }

    // -----------------------------------------------------------------------
    // Registries
    // -----------------------------------------------------------------------

    pub fn add_walfile(&self, wf: Arc<dyn WalFile>, owned: bool, web: bool) {
        let uuid = wf.uuid().to_string();
        if let Ok(mut all) = self.all.write() {
            all.insert(uuid.clone(), Arc::clone(&wf));
        }
        if owned && let Ok(mut sync) = self.sync.write() {
            sync.insert(uuid.clone(), Arc::clone(&wf));
        }
        if web && let Ok(mut web_map) = self.web.write() {
            web_map.insert(uuid, wf);
        }
    }

    pub fn remove_walfile(&self, uuid: &str) {
        if let Ok(mut all) = self.all.write() {
            all.remove(uuid);
        }
        if let Ok(mut sync) = self.sync.write() {
            sync.remove(uuid);
        }
        if let Ok(mut web) = self.web.write() {
            web.remove(uuid);
        }
    }

    pub fn all_walfiles(&self) -> Vec<Arc<dyn WalFile>> {
        self.all
            .read()
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn sync_walfiles(&self) -> Vec<Arc<dyn WalFile>> {
        self.sync
            .read()
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn web_walfiles(&self) -> Vec<Arc<dyn WalFile>> {
        self.web
            .read()
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    fn is_sync(&self, uuid: &str) -> bool {
        self.sync
            .read()
            .map(|m| m.contains_key(uuid))
            .unwrap_or(false)
    }

    fn is_web(&self, uuid: &str) -> bool {
        self.web
            .read()
            .map(|m| m.contains_key(uuid))
            .unwrap_or(false)
    }

    fn not_owned_walfiles(&self) -> Vec<Arc<dyn WalFile>> {
        self.all_walfiles()
            .into_iter()
            .filter(|wf| !self.is_sync(wf.uuid()))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Processed-blob set
    // -----------------------------------------------------------------------

    pub fn mark_processed(&self, checksum: &str) {
        if let Ok(mut processed) = self.processed.lock() {
            processed.insert(checksum.to_string());
        }
    }

    pub fn is_processed(&self, checksum: &str) -> bool {
        self.processed
            .lock()
            .map(|p| p.contains(checksum))
            .unwrap_or(false)
    }

    // -----------------------------------------------------------------------
    // Access filter
    // -----------------------------------------------------------------------

    /// Events a backend is allowed to receive. Owned (non-web, or
    /// our-own-email web) backends get everything; a peer backend only gets
    /// events whose share set names it.
    pub fn filter_for(&self, events: &[Event], wf: &dyn WalFile) -> Vec<Event> {
        let uuid = wf.uuid();
        let owned = !self.is_web(uuid) || self.email.as_deref() == Some(uuid);
        if owned {
            return events.to_vec();
        }
        events
            .iter()
            .filter(|e| email_has_access(e, uuid))
            .cloned()
            .collect()
    }

    // -----------------------------------------------------------------------
    // Push
    // -----------------------------------------------------------------------

    /// Publish a log to one backend. Without `prebuilt` bytes the log is
    /// access-filtered and encoded first; an empty filtered log publishes
    /// nothing. Returns the blob checksum when something was written.
    pub fn push(
        &self,
        wf: &dyn WalFile,
        events: &[Event],
        prebuilt: Option<&[u8]>,
    ) -> Result<Option<String>, SyncError> {
        let built;
        let bytes: &[u8] = match prebuilt {
            Some(bytes) => bytes,
            None => {
                let filtered = self.filter_for(events, wf);
                if filtered.is_empty() {
                    return Ok(None);
                }
                built = build_blob(&filtered)?;
                &built
            }
        };

        let checksum = checksum_hex(bytes);
        // Registered before the write: the pull loop runs concurrently and
        // must never re-ingest a blob this replica produced.
        self.mark_processed(&checksum);
        wf.write(&checksum, bytes).map_err(|e| SyncError::Backend {
            uuid: wf.uuid().to_string(),
            source: e,
        })?;
        Ok(Some(checksum))
    }

    /// Aggregated flush: owned backends get the full cumulative log in one
    /// prebuilt blob, everyone else gets the access-filtered batch. Write
    /// failures are logged and not retried here; the events remain in the
    /// local log and ride along with the next flush.
    pub fn flush_partial(&self, batch: &[Event], full_log: &[Event]) {
        if batch.is_empty() {
            return;
        }
        let full_blob = match build_blob(full_log) {
            Ok(blob) => blob,
            Err(e) => {
                tracing::warn!("flush aborted, could not encode log: {e}");
                return;
            }
        };

        for wf in self.all_walfiles() {
            let result = if self.is_sync(wf.uuid()) {
                self.push(wf.as_ref(), full_log, Some(&full_blob))
            } else {
                self.push(wf.as_ref(), batch, None)
            };
            if let Err(e) = result {
                tracing::warn!("push to {} failed: {e}", wf.uuid());
            }
        }
    }

    // -----------------------------------------------------------------------
    // Pull
    // -----------------------------------------------------------------------

    /// One pull cycle over the given backends: list, read and decode every
    /// unseen blob, merge per backend and then across backends, gather any
    /// sync backend that has fragmented past the threshold, and finally ack
    /// every successfully decoded name. Backends are pulled in parallel,
    /// bounded by the configured worker count.
    pub fn pull(
        &self,
        walfiles: &[Arc<dyn WalFile>],
        local_log: &[Event],
    ) -> Result<Vec<Event>, SyncError> {
        let results = Mutex::new(Vec::with_capacity(walfiles.len()));
        let next = AtomicUsize::new(0);
        let workers = self.pull_workers.min(walfiles.len().max(1));

        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    loop {
                        let i = next.fetch_add(1, Ordering::SeqCst);
                        let Some(wf) = walfiles.get(i) else {
                            break;
                        };
                        if let Some(pull) = self.pull_backend(wf)
                            && let Ok(mut results) = results.lock()
                        {
                            results.push(pull);
                        }
                    }
                });
            }
        });

        let results = results.into_inner().map_err(|_| SyncError::LockPoisoned)?;

        let mut delta: Vec<Event> = Vec::new();
        let mut to_ack: Vec<String> = Vec::new();
        for backend in results {
            delta = merge(&delta, &backend.wal);

            if backend.listed > self.gather_threshold && self.is_sync(backend.wf.uuid()) {
                self.gather(&backend, local_log)?;
            }
            to_ack.extend(backend.pulled);
        }

        // Ack only after every decode in the cycle has succeeded.
        for name in to_ack {
            self.mark_processed(&name);
        }
        Ok(delta)
    }

    fn pull_backend(&self, wf: &Arc<dyn WalFile>) -> Option<BackendPull> {
        let names = match wf.list() {
            Ok(names) => names,
            Err(e) => {
                // Skip this backend for the cycle; the next pull retries.
                tracing::warn!("list on {} failed: {e}", wf.uuid());
                return None;
            }
        };

        let mut wal: Vec<Event> = Vec::new();
        let mut pulled: Vec<String> = Vec::new();
        for name in &names {
            if !self.is_processed(name) {
                let bytes = match wf.read(name) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::warn!("read of {name} on {} failed: {e}", wf.uuid());
                        continue;
                    }
                };
                match read_blob(&bytes) {
                    Ok(events) => wal = merge(&wal, &events),
                    Err(e) => {
                        // Incompatible blob; leave it unacked and move on.
                        tracing::warn!("undecodable blob {name} on {}: {e}", wf.uuid());
                        continue;
                    }
                }
            }
            pulled.push(name.clone());
        }

        Some(BackendPull {
            wf: Arc::clone(wf),
            listed: names.len(),
            wal,
            pulled,
        })
    }

    /// Consolidate a fragmented backend: merge its blobs with the local
    /// log, publish the union as a single blob there and to every
    /// non-owned backend, then remove the now-obsolete fragments (keeping
    /// the fresh blob if its checksum collides with an existing one).
    fn gather(&self, backend: &BackendPull, local_log: &[Event]) -> Result<(), SyncError> {
        let consolidated = merge(local_log, &backend.wal);
        let Some(checksum) = self.push(backend.wf.as_ref(), &consolidated, None)? else {
            return Ok(());
        };

        for wf in self.not_owned_walfiles() {
            if let Err(e) = self.push(wf.as_ref(), &consolidated, None) {
                tracing::warn!("gather fan-out to {} failed: {e}", wf.uuid());
            }
        }

        let obsolete: Vec<String> = backend
            .pulled
            .iter()
            .filter(|name| **name != checksum)
            .cloned()
            .collect();
        if let Err(e) = backend.wf.remove(&obsolete) {
            tracing::warn!("gather cleanup on {} failed: {e}", backend.wf.uuid());
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Final persistence step. A normal exit pushes the whole in-memory
    /// log to the local backend and prunes every older local blob; a purge
    /// wipes the local store entirely.
    pub fn finish(&self, full_log: &[Event], purge: bool) -> Result<(), SyncError> {
        if purge {
            return self.local.purge().map_err(|e| SyncError::Backend {
                uuid: self.local_wf.uuid().to_string(),
                source: e,
            });
        }

        let Some(checksum) = self.push(self.local_wf.as_ref(), full_log, None)? else {
            return Ok(());
        };
        let names = self.local_wf.list().map_err(|e| SyncError::Backend {
            uuid: self.local_wf.uuid().to_string(),
            source: e,
        })?;
        let obsolete: Vec<String> = names.into_iter().filter(|n| n != &checksum).collect();
        let _ = self.local_wf.remove(&obsolete);
        Ok(())
    }
}
