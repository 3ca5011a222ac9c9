// Shared-document pool: one entry per room, reference counted.
//
// The pool is the sole owner of a pooled document. Consumers hold leases;
// the entry is torn down synchronously when the last lease goes away, and a
// later acquire for the same room builds a fresh entry. Each entry carries
// the full per-room machinery: live doc, relay session, local cache
// persister, and the cold-start snapshot fallback.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use cowrite_common::protocol::RoomId;
use tokio::sync::{broadcast, mpsc, watch};

use crate::backend::{SnapshotSource, TokenProvider};
use crate::cache::LocalDocCache;
use crate::config::TuningConfig;
use crate::doc_state::LiveDoc;
use crate::session::{
    spawn_session, Connector, SessionConfig, SessionHandle, SessionState, SessionStatus,
};
use crate::snapshot::{ReadOnlyDoc, SnapshotFallback};

/// Settings shared by every entry the pool constructs.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub relay_url: String,
    pub cache_dir: PathBuf,
    pub tuning: TuningConfig,
    pub network_online: bool,
}

/// Everything the pool runs for one room.
pub struct PoolEntry {
    doc: Arc<LiveDoc>,
    session: SessionHandle,
    status_rx: watch::Receiver<SessionStatus>,
    cache_ready_rx: watch::Receiver<bool>,
    snapshot_rx: watch::Receiver<Option<ReadOnlyDoc>>,
    /// Dropping this stops the cache persister; the persister holds the doc
    /// alive, so it cannot learn about teardown from the update bus.
    _cache_stop_tx: mpsc::UnboundedSender<()>,
}

impl PoolEntry {
    pub fn doc(&self) -> &Arc<LiveDoc> {
        &self.doc
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status_rx.clone()
    }

    /// True once the local cache finished its initial load. Orthogonal to
    /// relay readiness: a doc can be cache-ready while offline.
    pub fn cache_ready(&self) -> watch::Receiver<bool> {
        self.cache_ready_rx.clone()
    }

    /// Read-only snapshot view published during cold start, `None` otherwise.
    pub fn snapshot(&self) -> watch::Receiver<Option<ReadOnlyDoc>> {
        self.snapshot_rx.clone()
    }
}

struct PoolSlot {
    entry: Arc<PoolEntry>,
    refcount: u32,
}

type SlotMap = Arc<Mutex<HashMap<String, PoolSlot>>>;

fn lock_slots(slots: &Mutex<HashMap<String, PoolSlot>>) -> MutexGuard<'_, HashMap<String, PoolSlot>> {
    slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A borrowed reference to a pool entry. Dropping it releases the
/// reference; `release` does the same but reads better at call sites.
pub struct DocLease {
    slots: SlotMap,
    key: String,
    entry: Arc<PoolEntry>,
    released: bool,
}

impl DocLease {
    pub fn entry(&self) -> &Arc<PoolEntry> {
        &self.entry
    }

    pub fn doc(&self) -> &Arc<LiveDoc> {
        &self.entry.doc
    }

    pub fn session(&self) -> &SessionHandle {
        &self.entry.session
    }

    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.entry.status()
    }

    pub fn cache_ready(&self) -> watch::Receiver<bool> {
        self.entry.cache_ready()
    }

    pub fn snapshot(&self) -> watch::Receiver<Option<ReadOnlyDoc>> {
        self.entry.snapshot()
    }

    /// Give the reference back. At zero the entry is removed from the pool
    /// and its session told to tear down.
    pub fn release(self) {}
}

impl Drop for DocLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let mut slots = lock_slots(&self.slots);
        let Some(slot) = slots.get_mut(&self.key) else { return };
        slot.refcount -= 1;
        if slot.refcount == 0 {
            let slot = slots.remove(&self.key);
            drop(slots);
            if let Some(slot) = slot {
                slot.entry.session.close();
            }
            tracing::debug!(room = %self.key, "pool entry torn down");
        }
    }
}

/// The pool itself. Injectable so tests construct isolated instances; the
/// application typically holds exactly one.
pub struct DocPool<B, C> {
    backend: Arc<B>,
    connector: C,
    config: PoolConfig,
    slots: SlotMap,
}

impl<B, C> DocPool<B, C>
where
    B: TokenProvider + SnapshotSource,
    C: Connector + Clone,
{
    pub fn new(backend: Arc<B>, connector: C, config: PoolConfig) -> DocPool<B, C> {
        DocPool { backend, connector, config, slots: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Get or create the entry for `room`. The `RoomId` type is the
    /// normalization boundary: two ids that render the same share an entry.
    pub fn acquire(&self, room: &RoomId) -> DocLease {
        let key = room.to_string();
        let mut slots = lock_slots(&self.slots);
        if let Some(slot) = slots.get_mut(&key) {
            slot.refcount += 1;
            return DocLease {
                slots: self.slots.clone(),
                key,
                entry: slot.entry.clone(),
                released: false,
            };
        }

        let entry = Arc::new(self.build_entry(room));
        tracing::debug!(room = %key, "pool entry created");
        slots.insert(key.clone(), PoolSlot { entry: entry.clone(), refcount: 1 });
        DocLease { slots: self.slots.clone(), key, entry, released: false }
    }

    pub fn entry_count(&self) -> usize {
        lock_slots(&self.slots).len()
    }

    #[cfg(test)]
    fn refcount_of(&self, room: &RoomId) -> Option<u32> {
        lock_slots(&self.slots).get(&room.to_string()).map(|slot| slot.refcount)
    }

    fn build_entry(&self, room: &RoomId) -> PoolEntry {
        let doc = Arc::new(LiveDoc::new(room.clone()));

        let (status_rx, session) = spawn_session(
            doc.clone(),
            self.backend.clone(),
            self.connector.clone(),
            SessionConfig {
                relay_url: self.config.relay_url.clone(),
                tuning: self.config.tuning.clone(),
                network_online: self.config.network_online,
            },
        );

        let (cache_ready_tx, cache_ready_rx) = watch::channel(false);
        let (cache_stop_tx, cache_stop_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_cache(
            doc.clone(),
            self.config.cache_dir.clone(),
            cache_ready_tx,
            cache_stop_rx,
        ));

        let fallback = SnapshotFallback::new(self.backend.clone(), room.clone());
        let snapshot_rx = fallback.watch();
        tokio::spawn(run_fallback_monitor(
            fallback,
            doc.clone(),
            status_rx.clone(),
            cache_ready_rx.clone(),
        ));

        PoolEntry {
            doc,
            session,
            status_rx,
            cache_ready_rx,
            snapshot_rx,
            _cache_stop_tx: cache_stop_tx,
        }
    }
}

/// Load the local cache into the doc, mark readiness, then persist every
/// update (local and remote) for offline restarts. Runs until the owning
/// pool entry drops its stop handle.
async fn run_cache(
    doc: Arc<LiveDoc>,
    cache_dir: PathBuf,
    ready_tx: watch::Sender<bool>,
    mut stop_rx: mpsc::UnboundedReceiver<()>,
) {
    // Subscribe before loading so edits made during the load are not lost.
    let mut updates_rx = doc.subscribe_updates();

    let mut cache = match LocalDocCache::open(&cache_dir, doc.room()) {
        Ok(cache) => cache,
        Err(error) => {
            tracing::warn!(room = %doc.room(), %error, "local cache unavailable; running without persistence");
            let _ = ready_tx.send(true);
            // Nothing to persist, but the readiness feed must stay alive
            // until teardown or its watchers would stop re-evaluating.
            let _ = stop_rx.recv().await;
            return;
        }
    };
    match cache.load_into(&doc) {
        Ok(summary) => {
            tracing::debug!(
                room = %doc.room(),
                snapshot = summary.snapshot_loaded,
                updates = summary.updates_applied,
                "local cache loaded"
            );
        }
        Err(error) => tracing::warn!(room = %doc.room(), %error, "local cache load failed"),
    }
    let _ = ready_tx.send(true);

    loop {
        let update = tokio::select! {
            _ = stop_rx.recv() => break,
            update = updates_rx.recv() => update,
        };
        match update {
            Ok(update) => {
                if let Err(error) = cache.append_update(&update.payload) {
                    tracing::warn!(room = %doc.room(), %error, "failed to persist update");
                    continue;
                }
                match cache.compact(&doc) {
                    Ok(true) => tracing::debug!(room = %doc.room(), "compacted local cache"),
                    Ok(false) => {}
                    Err(error) => {
                        tracing::warn!(room = %doc.room(), %error, "local cache compaction failed");
                    }
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                // The log missed updates; rebase it on a fresh snapshot.
                tracing::warn!(room = %doc.room(), skipped, "update bus lagged; snapshotting cache");
                if let Err(error) = cache.save_snapshot(&doc.encode_snapshot()) {
                    tracing::warn!(room = %doc.room(), %error, "cache snapshot failed");
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Re-evaluate the cold-start condition whenever session status or cache
/// readiness changes. Cold start requires the cache load to have finished
/// and produced nothing; a still-loading cache is not a cold start yet.
async fn run_fallback_monitor<S: SnapshotSource>(
    fallback: SnapshotFallback<S>,
    doc: Arc<LiveDoc>,
    mut status_rx: watch::Receiver<SessionStatus>,
    mut cache_ready_rx: watch::Receiver<bool>,
) {
    loop {
        let offline = matches!(
            status_rx.borrow_and_update().state,
            SessionState::Offline | SessionState::Revoked
        );
        let cache_ready = *cache_ready_rx.borrow_and_update();
        if let Err(error) = fallback.refresh(offline && cache_ready, doc.has_content()).await {
            tracing::warn!(room = %doc.room(), %error, "snapshot fallback refresh failed");
        }

        tokio::select! {
            changed = status_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            changed = cache_ready_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}
