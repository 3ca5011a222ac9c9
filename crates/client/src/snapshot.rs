// Cold-start fallback: a read-only document materialized from the latest
// durable snapshot.
//
// Activates only when the session is offline AND the local cache produced no
// content. The moment either condition flips, the published document resets
// to `None` so a reconnected session never renders through a stale snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use cowrite_common::doc::ReplicatedDoc;
use cowrite_common::protocol::RoomId;
use tokio::sync::watch;

use crate::backend::SnapshotSource;
use crate::presence::{EmptyPresence, PresenceFeed, RemoteUser};

/// A snapshot document paired with the no-op presence surface, so read-only
/// views travel through the same rendering seams as live documents.
#[derive(Clone)]
pub struct ReadOnlyDoc {
    doc: Arc<ReplicatedDoc>,
    presence: EmptyPresence,
}

impl ReadOnlyDoc {
    fn new(doc: Arc<ReplicatedDoc>) -> ReadOnlyDoc {
        ReadOnlyDoc { doc, presence: EmptyPresence::new() }
    }

    pub fn doc(&self) -> &Arc<ReplicatedDoc> {
        &self.doc
    }
}

impl PresenceFeed for ReadOnlyDoc {
    fn roster(&self) -> watch::Receiver<Vec<RemoteUser>> {
        self.presence.roster()
    }
}

/// Loader for one room. `refresh` is called whenever the offline or
/// local-content condition may have changed; results from superseded calls
/// are discarded, not applied.
pub struct SnapshotFallback<S> {
    source: Arc<S>,
    room: RoomId,
    generation: AtomicU64,
    doc_tx: watch::Sender<Option<ReadOnlyDoc>>,
}

impl<S: SnapshotSource> SnapshotFallback<S> {
    pub fn new(source: Arc<S>, room: RoomId) -> SnapshotFallback<S> {
        let (doc_tx, _) = watch::channel(None);
        SnapshotFallback { source, room, generation: AtomicU64::new(0), doc_tx }
    }

    /// The read-only snapshot view, `None` outside cold start.
    pub fn watch(&self) -> watch::Receiver<Option<ReadOnlyDoc>> {
        self.doc_tx.subscribe()
    }

    pub fn current(&self) -> Option<ReadOnlyDoc> {
        self.doc_tx.borrow().clone()
    }

    /// Re-evaluate the cold-start condition and load or reset accordingly.
    ///
    /// Every call supersedes the ones before it: an in-flight download whose
    /// ticket is no longer current drops its result on the floor.
    pub async fn refresh(&self, offline: bool, has_local_content: bool) -> Result<()> {
        let ticket = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        if !(offline && !has_local_content) {
            self.publish(ticket, None);
            return Ok(());
        }

        let url = self
            .source
            .snapshot_url(&self.room)
            .await
            .with_context(|| format!("failed to resolve snapshot url for {}", self.room))?;
        let Some(url) = url else {
            // Nothing durable exists yet; cold start legitimately renders empty.
            self.publish(ticket, None);
            return Ok(());
        };

        let payload = self
            .source
            .fetch_snapshot(&url)
            .await
            .with_context(|| format!("failed to download snapshot for {}", self.room))?;
        let doc = ReplicatedDoc::from_snapshot(&payload)
            .with_context(|| format!("snapshot for {} is not a v2 update", self.room))?;

        if self.publish(ticket, Some(ReadOnlyDoc::new(Arc::new(doc)))) {
            tracing::debug!(room = %self.room, bytes = payload.len(), "loaded offline snapshot");
        } else {
            tracing::debug!(room = %self.room, "discarding superseded snapshot load");
        }
        Ok(())
    }

    /// Publish only if `ticket` is still the latest refresh. Returns whether
    /// the value was applied.
    fn publish(&self, ticket: u64, view: Option<ReadOnlyDoc>) -> bool {
        let mut applied = false;
        self.doc_tx.send_if_modified(|current| {
            if self.generation.load(Ordering::SeqCst) != ticket {
                return false;
            }
            applied = true;
            match (&view, &*current) {
                (None, None) => false,
                (Some(next), Some(existing)) if Arc::ptr_eq(&next.doc, &existing.doc) => false,
                _ => {
                    *current = view.clone();
                    true
                }
            }
        });
        applied
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    use cowrite_common::protocol::ResourceType;
    use tokio::sync::Notify;

    use super::*;
    use crate::backend::BackendError;

    struct MockSnapshots {
        url: StdMutex<Option<String>>,
        payload: StdMutex<Vec<u8>>,
        fetches: AtomicUsize,
        gate: Option<Arc<Notify>>,
    }

    impl MockSnapshots {
        fn snapshot_of(text: &str) -> Vec<u8> {
            let doc = ReplicatedDoc::new();
            doc.insert_text("body", 0, text);
            doc.encode_snapshot()
        }

        fn serving(text: &str) -> Arc<Self> {
            Arc::new(Self {
                url: StdMutex::new(Some("https://snapshots.test/one".into())),
                payload: StdMutex::new(Self::snapshot_of(text)),
                fetches: AtomicUsize::new(0),
                gate: None,
            })
        }

        fn gated(text: &str, gate: Arc<Notify>) -> Arc<Self> {
            Arc::new(Self {
                url: StdMutex::new(Some("https://snapshots.test/one".into())),
                payload: StdMutex::new(Self::snapshot_of(text)),
                fetches: AtomicUsize::new(0),
                gate: Some(gate),
            })
        }

        fn empty() -> Arc<Self> {
            Arc::new(Self {
                url: StdMutex::new(None),
                payload: StdMutex::new(Vec::new()),
                fetches: AtomicUsize::new(0),
                gate: None,
            })
        }
    }

    impl SnapshotSource for MockSnapshots {
        async fn snapshot_url(&self, _room: &RoomId) -> Result<Option<String>, BackendError> {
            Ok(self.url.lock().unwrap().clone())
        }

        async fn fetch_snapshot(&self, _url: &str) -> Result<Vec<u8>, BackendError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            Ok(self.payload.lock().unwrap().clone())
        }
    }

    fn room() -> RoomId {
        RoomId::new(ResourceType::Doc, "snap-test")
    }

    #[tokio::test]
    async fn cold_start_materializes_a_read_only_snapshot() {
        let source = MockSnapshots::serving("durable content");
        let fallback = SnapshotFallback::new(source.clone(), room());

        fallback.refresh(true, false).await.unwrap();

        let view = fallback.current().expect("cold start should publish a snapshot view");
        assert_eq!(view.doc().get_text_string("body"), "durable content");
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);

        // The view renders like a live doc but its roster is permanently empty.
        assert!(view.roster().borrow().is_empty());
    }

    #[tokio::test]
    async fn stays_empty_outside_cold_start() {
        let source = MockSnapshots::serving("never shown");
        let fallback = SnapshotFallback::new(source.clone(), room());

        fallback.refresh(false, false).await.unwrap();
        fallback.refresh(false, true).await.unwrap();
        fallback.refresh(true, true).await.unwrap();

        assert!(fallback.current().is_none());
        assert_eq!(source.fetches.load(Ordering::SeqCst), 0, "no downloads outside cold start");
    }

    #[tokio::test]
    async fn reconnect_resets_the_published_snapshot() {
        let source = MockSnapshots::serving("stale after reconnect");
        let fallback = Arc::new(SnapshotFallback::new(source, room()));
        let mut watcher = fallback.watch();

        fallback.refresh(true, false).await.unwrap();
        assert!(fallback.current().is_some());

        fallback.refresh(false, false).await.unwrap();
        assert!(fallback.current().is_none());
        watcher.changed().await.unwrap();
        assert!(watcher.borrow_and_update().is_none());
    }

    #[tokio::test]
    async fn missing_snapshot_is_not_an_error() {
        let fallback = SnapshotFallback::new(MockSnapshots::empty(), room());
        fallback.refresh(true, false).await.unwrap();
        assert!(fallback.current().is_none());
    }

    #[tokio::test]
    async fn superseded_download_is_discarded() {
        let gate = Arc::new(Notify::new());
        let source = MockSnapshots::gated("late arrival", gate.clone());
        let fallback = Arc::new(SnapshotFallback::new(source.clone(), room()));

        let slow = tokio::spawn({
            let fallback = fallback.clone();
            async move { fallback.refresh(true, false).await }
        });
        // Let the slow refresh reach its download before superseding it.
        while source.fetches.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        fallback.refresh(false, true).await.unwrap();
        gate.notify_one();
        slow.await.unwrap().unwrap();

        assert!(fallback.current().is_none(), "stale download must not surface");
    }
}
