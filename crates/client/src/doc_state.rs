// Live state for one shared document: the CRDT doc, its awareness channel,
// and the fanout channels downstream consumers (session, cache, presence)
// subscribe to.
//
// The `Doc` lives inside `Awareness`; all access goes through the lock. Edits
// never hand update bytes around by hand: `edit` diffs the doc before/after
// the closure and publishes the delta, so every write path feeds the cache
// and the relay the same way.

use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use cowrite_common::protocol::RoomId;
use cowrite_common::types::PresenceState;
use tokio::sync::{broadcast, watch};
use yrs::sync::{Awareness, DefaultProtocol, Message, Protocol, SyncMessage};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, Transact, Update};

const UPDATE_BUFFER: usize = 256;

/// Where a published document update came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    /// Produced by a local `edit` call; the session forwards it to the relay.
    Local,
    /// Decoded from a relay frame; never echoed back to the relay.
    Remote,
}

/// One v1-encoded document delta on the update bus.
#[derive(Debug, Clone)]
pub struct DocUpdate {
    pub origin: UpdateOrigin,
    pub payload: Vec<u8>,
}

/// One peer's awareness entry, local client included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    pub client_id: u64,
    pub clock: u32,
    pub state: PresenceState,
}

/// Shared live document for one room.
pub struct LiveDoc {
    room: RoomId,
    client_id: u64,
    awareness: Mutex<Awareness>,
    updates_tx: broadcast::Sender<DocUpdate>,
    awareness_tx: broadcast::Sender<Vec<u8>>,
    peers_tx: watch::Sender<Vec<PeerEntry>>,
}

impl LiveDoc {
    pub fn new(room: RoomId) -> LiveDoc {
        Self::from_doc(room, Doc::new())
    }

    /// Fixed client id, for deterministic tests.
    pub fn with_client_id(room: RoomId, client_id: u64) -> LiveDoc {
        Self::from_doc(room, Doc::with_client_id(client_id))
    }

    fn from_doc(room: RoomId, doc: Doc) -> LiveDoc {
        let client_id = doc.client_id();
        let (updates_tx, _) = broadcast::channel(UPDATE_BUFFER);
        let (awareness_tx, _) = broadcast::channel(UPDATE_BUFFER);
        let (peers_tx, _) = watch::channel(Vec::new());
        LiveDoc {
            room,
            client_id,
            awareness: Mutex::new(Awareness::new(doc)),
            updates_tx,
            awareness_tx,
            peers_tx,
        }
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    fn lock(&self) -> MutexGuard<'_, Awareness> {
        self.awareness.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// True once the doc has ever absorbed content, locally or from a peer.
    pub fn has_content(&self) -> bool {
        let guard = self.lock();
        let txn = guard.doc().transact();
        txn.state_vector() != yrs::StateVector::default()
    }

    /// Run a write closure against the doc and publish the resulting delta
    /// (if any) on the update bus with `Local` origin. The closure must not
    /// hold a transaction past its return.
    pub fn edit<R>(&self, f: impl FnOnce(&Doc) -> R) -> R {
        let guard = self.lock();
        let doc = guard.doc();
        let before = doc.transact().state_vector();
        let result = f(doc);

        let txn = doc.transact();
        if txn.state_vector() != before {
            let payload = txn.encode_diff_v1(&before);
            drop(txn);
            let _ = self.updates_tx.send(DocUpdate { origin: UpdateOrigin::Local, payload });
        }
        result
    }

    /// Feed one binary relay frame through the y-sync protocol. Returns the
    /// encoded reply frames to send back. Document changes carried by the
    /// frame land on the update bus with `Remote` origin; awareness changes
    /// refresh the peer roster.
    pub fn handle_binary_frame(&self, payload: &[u8]) -> Result<Vec<Vec<u8>>> {
        let responses = {
            let guard = self.lock();
            let before = guard.doc().transact().state_vector();
            let responses = DefaultProtocol
                .handle(&guard, payload)
                .map_err(|e| anyhow::anyhow!("y-sync frame rejected: {e}"))?;

            let txn = guard.doc().transact();
            if txn.state_vector() != before {
                let delta = txn.encode_diff_v1(&before);
                drop(txn);
                let _ = self
                    .updates_tx
                    .send(DocUpdate { origin: UpdateOrigin::Remote, payload: delta });
            }
            self.refresh_peers(&guard);
            responses
        };
        Ok(responses.into_iter().map(|message| message.encode_v1()).collect())
    }

    /// Publish this client's presence payload to peers.
    pub fn set_local_presence(&self, presence: &PresenceState) -> Result<()> {
        let guard = self.lock();
        guard.set_local_state(presence).context("failed to set local awareness state")?;
        self.announce_local(&guard)
    }

    /// Remove this client's awareness entry. Peers see a leave; must run
    /// before the session socket is destroyed.
    pub fn clear_local_presence(&self) -> Result<()> {
        let guard = self.lock();
        guard.clean_local_state();
        self.announce_local(&guard)
    }

    fn announce_local(&self, guard: &Awareness) -> Result<()> {
        let update = guard
            .update_with_clients([self.client_id])
            .context("failed to encode local awareness update")?;
        let frame = Message::Awareness(update).encode_v1();
        let _ = self.awareness_tx.send(frame);
        self.refresh_peers(guard);
        Ok(())
    }

    /// Encoded frame carrying the current local awareness entry, for
    /// re-announcing after a reconnect.
    pub fn local_awareness_frame(&self) -> Result<Vec<u8>> {
        let guard = self.lock();
        let update = guard
            .update_with_clients([self.client_id])
            .context("failed to encode local awareness update")?;
        Ok(Message::Awareness(update).encode_v1())
    }

    /// Opening sync handshake frame: SyncStep1 with our state vector.
    pub fn sync_step1(&self) -> Vec<u8> {
        let guard = self.lock();
        let sv = guard.doc().transact().state_vector();
        Message::Sync(SyncMessage::SyncStep1(sv)).encode_v1()
    }

    /// Apply a v2 snapshot loaded from the local cache. Does not publish on
    /// the update bus; cache loads happen before any session attaches.
    pub fn apply_snapshot(&self, data: &[u8]) -> Result<()> {
        let update = Update::decode_v2(data).context("failed to decode cached snapshot")?;
        self.apply_quietly(update)
    }

    /// Apply one v1 update from the cache log, also without publishing.
    pub fn apply_cached_update(&self, data: &[u8]) -> Result<()> {
        let update = Update::decode_v1(data).context("failed to decode cached update")?;
        self.apply_quietly(update)
    }

    fn apply_quietly(&self, update: Update) -> Result<()> {
        let guard = self.lock();
        let mut txn = guard.doc().transact_mut();
        txn.apply_update(update).context("failed to apply update to document")?;
        Ok(())
    }

    /// Full document state as a v2 snapshot, for cache compaction.
    pub fn encode_snapshot(&self) -> Vec<u8> {
        let guard = self.lock();
        let txn = guard.doc().transact();
        txn.encode_state_as_update_v2(&yrs::StateVector::default())
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<DocUpdate> {
        self.updates_tx.subscribe()
    }

    pub fn subscribe_awareness(&self) -> broadcast::Receiver<Vec<u8>> {
        self.awareness_tx.subscribe()
    }

    pub fn watch_peers(&self) -> watch::Receiver<Vec<PeerEntry>> {
        self.peers_tx.subscribe()
    }

    fn refresh_peers(&self, guard: &Awareness) {
        let mut peers: Vec<PeerEntry> = guard
            .iter()
            .filter_map(|(client_id, state)| {
                let raw = state.data?;
                let presence: PresenceState = serde_json::from_str(raw.as_ref()).ok()?;
                Some(PeerEntry { client_id, clock: state.clock, state: presence })
            })
            .collect();
        peers.sort_by_key(|peer| peer.client_id);
        self.peers_tx.send_if_modified(|current| {
            if *current == peers {
                false
            } else {
                *current = peers;
                true
            }
        });
    }
}

/// Wrap a raw v1 document delta into an encoded y-sync update frame.
pub fn encode_update_frame(payload: Vec<u8>) -> Vec<u8> {
    Message::Sync(SyncMessage::Update(payload)).encode_v1()
}
