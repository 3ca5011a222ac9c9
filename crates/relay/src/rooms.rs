// Room registry: shared replicated documents, fanout, and snapshot bookkeeping.
//
// One `Room` exists per active room id, created on first join and dropped when
// the last connection leaves. Doc rooms hydrate from the durable snapshot on
// open and persist back on drain or after enough accumulated updates. Presence
// rooms skip the document machinery entirely and only carry a roster.
//
// Fanout uses a broadcast channel of `RoomEvent`s tagged with the originating
// connection; each socket task filters out its own echoes.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use cowrite_common::protocol::messages::{self, PresenceInfo, ServerMessage};
use cowrite_common::protocol::{ErrorCode, ResourceType, RoomId};
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, Mutex as TokioMutex};
use tracing::{debug, info, warn};
use yrs::encoding::read::Cursor;
use yrs::sync::{Awareness, DefaultProtocol, Message, MessageReader, Protocol, SyncMessage};
use yrs::updates::decoder::{Decode, DecoderV1};
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::snapshot::{PersistOutcome, SnapshotStore};

/// Broadcast buffer per room; a receiver this far behind gets a full resync.
const EVENT_BUFFER_SIZE: usize = 256;

/// Colors assigned to collaborators, keyed by a hash of the user id so every
/// relay instance picks the same one.
const USER_COLORS: &[&str] = &[
    "#2563eb", "#7c3aed", "#db2777", "#dc2626", "#ea580c", "#ca8a04", "#16a34a", "#0d9488",
    "#0891b2", "#4f46e5",
];

pub fn color_for(user_id: &str) -> String {
    let digest = Sha256::digest(user_id.as_bytes());
    USER_COLORS[digest[0] as usize % USER_COLORS.len()].to_owned()
}

/// Operational knobs, fixed at startup.
#[derive(Debug, Clone)]
pub struct RelayTuning {
    /// Connections allowed per room before joins are refused.
    pub max_room_clients: usize,
    /// Applied updates between snapshot writes.
    pub snapshot_every_updates: u64,
}

impl Default for RelayTuning {
    fn default() -> Self {
        Self { max_room_clients: 64, snapshot_every_updates: 256 }
    }
}

/// One event on a room's fanout channel.
#[derive(Debug, Clone)]
pub enum RoomEvent {
    /// A y-protocol frame. Skipped by the originating connection.
    Binary { from: u64, payload: Vec<u8> },
    /// An encoded server message. `from: None` marks relay-originated fanout
    /// that every connection should deliver.
    Text { from: Option<u64>, payload: String },
    /// Authorization for `user_id` was revoked; matching connections close.
    Revoke { user_id: String, reason: String },
}

/// Identity of one connection's user inside a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomMember {
    pub user_id: String,
    pub user_name: String,
    pub user_color: String,
}

/// What a binary frame produced: direct replies for the sender, plus a flag
/// marking that the client opened a sync handshake (the caller answers it
/// with `sync_complete`).
#[derive(Debug, Default)]
pub struct BinaryDispatch {
    pub replies: Vec<Vec<u8>>,
    pub synced: bool,
}

pub struct Room {
    id: RoomId,
    awareness: TokioMutex<Awareness>,
    events: broadcast::Sender<RoomEvent>,
    members: StdMutex<HashMap<u64, RoomMember>>,
    /// Workspace-presence roster, keyed by user id. Presence rooms only.
    presence: StdMutex<HashMap<String, PresenceInfo>>,
    /// Which awareness client ids each connection has spoken for, so their
    /// entries can be cleared when the connection goes away.
    seen_awareness: StdMutex<HashMap<u64, HashSet<u64>>>,
    snapshot_version: AtomicU64,
    /// Updates applied since the last accepted snapshot write.
    pending_updates: AtomicU64,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Room {
    pub fn id(&self) -> &RoomId {
        &self.id
    }

    pub fn is_presence(&self) -> bool {
        self.id.is_presence()
    }

    /// Latest durable snapshot version this room knows about (0 = never
    /// persisted). Reported to clients in `sync_complete`.
    pub fn snapshot_version(&self) -> u64 {
        self.snapshot_version.load(Ordering::Relaxed)
    }

    pub fn member(&self, conn_id: u64) -> Option<RoomMember> {
        lock(&self.members).get(&conn_id).cloned()
    }

    /// Apply one binary y-protocol frame from `conn_id` against the shared
    /// document, fanning accepted updates out to the other connections.
    pub async fn handle_binary(&self, conn_id: u64, payload: &[u8]) -> Result<BinaryDispatch> {
        let protocol = DefaultProtocol;
        let mut dispatch = BinaryDispatch::default();
        let mut fanout = Vec::new();
        let mut applied = 0u64;

        {
            let awareness = self.awareness.lock().await;
            let mut decoder = DecoderV1::new(Cursor::new(payload));
            let mut reader = MessageReader::new(&mut decoder);

            while let Some(next_message) = reader.next() {
                let message = next_message.context("failed to decode y-sync message")?;
                match message {
                    Message::Sync(SyncMessage::SyncStep1(state_vector)) => {
                        if let Some(response) = protocol
                            .handle_sync_step1(&awareness, state_vector)
                            .context("failed to process sync step 1")?
                        {
                            dispatch.replies.push(response.encode_v1());
                        }

                        // Offer our own step 1 so the handshake runs both ways.
                        let server_sv = awareness.doc().transact().state_vector();
                        dispatch
                            .replies
                            .push(Message::Sync(SyncMessage::SyncStep1(server_sv)).encode_v1());
                        dispatch.synced = true;
                    }
                    Message::Sync(SyncMessage::SyncStep2(update)) => {
                        let decoded = Update::decode_v1(&update)
                            .context("failed to decode sync step 2 update")?;
                        protocol
                            .handle_sync_step2(&awareness, decoded)
                            .context("failed to process sync step 2")?;

                        // Step 2 carries client edits during handshake; fan it
                        // out as a regular update.
                        fanout.push(Message::Sync(SyncMessage::Update(update)).encode_v1());
                        applied += 1;
                    }
                    Message::Sync(SyncMessage::Update(update)) => {
                        let decoded = Update::decode_v1(&update)
                            .context("failed to decode incremental update")?;
                        protocol
                            .handle_update(&awareness, decoded)
                            .context("failed to process incremental update")?;
                        fanout.push(Message::Sync(SyncMessage::Update(update)).encode_v1());
                        applied += 1;
                    }
                    Message::Awareness(update) => {
                        {
                            let mut seen = lock(&self.seen_awareness);
                            seen.entry(conn_id).or_default().extend(update.clients.keys().copied());
                        }
                        if let Some(summary) = awareness
                            .apply_update_summary(update)
                            .context("failed to apply awareness update")?
                        {
                            let changed = summary.all_changes();
                            if !changed.is_empty() {
                                let rebroadcast = awareness
                                    .update_with_clients(changed)
                                    .context("failed to encode awareness rebroadcast")?;
                                fanout.push(Message::Awareness(rebroadcast).encode_v1());
                            }
                        }
                    }
                    other => {
                        if let Some(response) = protocol
                            .handle_message(&awareness, other)
                            .context("failed to process y-sync message")?
                        {
                            dispatch.replies.push(response.encode_v1());
                        }
                    }
                }
            }
        }

        for payload in fanout {
            let _ = self.events.send(RoomEvent::Binary { from: conn_id, payload });
        }
        if applied > 0 {
            self.pending_updates.fetch_add(applied, Ordering::Relaxed);
        }
        Ok(dispatch)
    }

    /// Server-initiated half of the sync handshake: step 1 with our state
    /// vector. Sent in answer to a client `sync_request`.
    pub async fn sync_offer(&self) -> Vec<u8> {
        let awareness = self.awareness.lock().await;
        let server_sv = awareness.doc().transact().state_vector();
        Message::Sync(SyncMessage::SyncStep1(server_sv)).encode_v1()
    }

    /// The whole document as one update frame, for receivers that fell too
    /// far behind the fanout channel.
    pub async fn full_state_frame(&self) -> Vec<u8> {
        let awareness = self.awareness.lock().await;
        let update =
            awareness.doc().transact().encode_state_as_update_v1(&StateVector::default());
        Message::Sync(SyncMessage::Update(update)).encode_v1()
    }

    /// Record `conn_id`'s workspace presence and fan the change out.
    pub fn apply_presence(
        &self,
        conn_id: u64,
        current_path: String,
        resource_type: Option<ResourceType>,
        resource_id: Option<String>,
    ) -> Option<PresenceInfo> {
        let member = self.member(conn_id)?;
        let info = PresenceInfo {
            user_id: member.user_id.clone(),
            user_name: member.user_name,
            user_color: member.user_color,
            current_path,
            resource_type,
            resource_id,
        };
        lock(&self.presence).insert(member.user_id, info.clone());
        self.send_text(Some(conn_id), &ServerMessage::PresenceChanged { user: info.clone() });
        Some(info)
    }

    /// Current roster, sorted by user id for stable snapshots.
    pub fn presence_users(&self) -> Vec<PresenceInfo> {
        let mut users: Vec<PresenceInfo> = lock(&self.presence).values().cloned().collect();
        users.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        users
    }

    fn send_text(&self, from: Option<u64>, message: &ServerMessage) {
        match messages::encode_server(message) {
            Ok(payload) => {
                let _ = self.events.send(RoomEvent::Text { from, payload });
            }
            Err(error) => warn!(room = %self.id, %error, "failed to encode server message"),
        }
    }

    /// Clear awareness entries for every client id `conn_id` spoke for and
    /// broadcast the removal so peers drop the cursor immediately.
    async fn clear_awareness_for(&self, conn_id: u64) {
        let ids: Vec<u64> = match lock(&self.seen_awareness).remove(&conn_id) {
            Some(ids) => ids.into_iter().collect(),
            None => return,
        };
        if ids.is_empty() {
            return;
        }

        let awareness = self.awareness.lock().await;
        for id in &ids {
            awareness.remove_state(*id);
        }
        match awareness.update_with_clients(ids) {
            Ok(update) => {
                let payload = Message::Awareness(update).encode_v1();
                let _ = self.events.send(RoomEvent::Binary { from: conn_id, payload });
            }
            Err(error) => {
                warn!(room = %self.id, %error, "failed to encode awareness removal");
            }
        }
    }

    #[cfg(test)]
    async fn text_for_tests(&self, name: &str) -> String {
        use yrs::GetString;
        let awareness = self.awareness.lock().await;
        let txn = awareness.doc().transact();
        txn.get_text(name).map(|text| text.get_string(&txn)).unwrap_or_default()
    }
}

/// A live connection's handle into a room.
pub struct RoomConn {
    pub room: Arc<Room>,
    pub conn_id: u64,
    pub member: RoomMember,
    pub events: broadcast::Receiver<RoomEvent>,
}

#[derive(Debug)]
pub enum JoinError {
    /// The room is at its connection cap.
    Full,
    /// The durable snapshot could not be loaded or applied.
    Unavailable(anyhow::Error),
}

pub struct RoomRegistry {
    rooms: TokioMutex<HashMap<String, Arc<Room>>>,
    snapshots: Arc<dyn SnapshotStore>,
    tuning: RelayTuning,
    next_conn_id: AtomicU64,
    datastore_available: AtomicBool,
}

impl RoomRegistry {
    pub fn new(snapshots: Arc<dyn SnapshotStore>, tuning: RelayTuning) -> RoomRegistry {
        RoomRegistry {
            rooms: TokioMutex::new(HashMap::new()),
            snapshots,
            tuning,
            next_conn_id: AtomicU64::new(1),
            datastore_available: AtomicBool::new(true),
        }
    }

    /// Join `room_id`, creating and hydrating the room on first use.
    pub async fn join(
        &self,
        room_id: &RoomId,
        user_id: &str,
        user_name: &str,
    ) -> Result<RoomConn, JoinError> {
        let mut rooms = self.rooms.lock().await;
        let key = room_id.to_string();
        let room = match rooms.get(&key) {
            Some(room) => room.clone(),
            None => {
                let room = self.hydrate_room(room_id).await.map_err(JoinError::Unavailable)?;
                rooms.insert(key, room.clone());
                room
            }
        };

        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let member = RoomMember {
            user_id: user_id.to_owned(),
            user_name: user_name.to_owned(),
            user_color: color_for(user_id),
        };

        // Subscribe before releasing the registry lock so no peer fanout is
        // missed between join and the first poll.
        let events = room.events.subscribe();
        {
            let mut members = lock(&room.members);
            if members.len() >= self.tuning.max_room_clients {
                return Err(JoinError::Full);
            }
            members.insert(conn_id, member.clone());
        }
        drop(rooms);

        if !room.is_presence() {
            room.send_text(
                Some(conn_id),
                &ServerMessage::UserJoined {
                    user_id: member.user_id.clone(),
                    user_name: member.user_name.clone(),
                    user_color: member.user_color.clone(),
                },
            );
        }

        Ok(RoomConn { room, conn_id, member, events })
    }

    async fn hydrate_room(&self, room_id: &RoomId) -> Result<Arc<Room>> {
        let (events, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        let doc = Doc::new();
        let mut snapshot_version = 0;

        if !room_id.is_presence() {
            if let Some(stored) = self.snapshots.load(&room_id.to_string()).await? {
                let update = Update::decode_v2(&stored.payload)
                    .context("stored snapshot failed to decode")?;
                doc.transact_mut()
                    .apply_update(update)
                    .context("stored snapshot failed to apply")?;
                snapshot_version = stored.version;
                debug!(room = %room_id, version = snapshot_version, "hydrated room from snapshot");
            }
        }

        Ok(Arc::new(Room {
            id: room_id.clone(),
            awareness: TokioMutex::new(Awareness::new(doc)),
            events,
            members: StdMutex::new(HashMap::new()),
            presence: StdMutex::new(HashMap::new()),
            seen_awareness: StdMutex::new(HashMap::new()),
            snapshot_version: AtomicU64::new(snapshot_version),
            pending_updates: AtomicU64::new(0),
        }))
    }

    /// Drop `conn_id` from the room: clear its awareness entries, fan out the
    /// departure once the user's last connection is gone, and persist + retire
    /// the room when it drains.
    pub async fn leave(&self, room: &Arc<Room>, conn_id: u64) {
        let (member, user_still_here, drained) = {
            let mut rooms = self.rooms.lock().await;
            let mut members = lock(&room.members);
            let Some(member) = members.remove(&conn_id) else {
                return;
            };
            let user_still_here = members.values().any(|other| other.user_id == member.user_id);
            let drained = members.is_empty();
            drop(members);
            if drained {
                rooms.remove(&room.id.to_string());
            }
            (member, user_still_here, drained)
        };

        if room.is_presence() {
            if !user_still_here {
                lock(&room.presence).remove(&member.user_id);
                room.send_text(
                    Some(conn_id),
                    &ServerMessage::UserLeftPresence { user_id: member.user_id },
                );
            }
        } else {
            room.clear_awareness_for(conn_id).await;
            if !user_still_here {
                room.send_text(Some(conn_id), &ServerMessage::UserLeft { user_id: member.user_id });
            }
        }

        if drained {
            self.persist_room(room).await;
        }
    }

    /// Persist the room when enough updates have accumulated.
    pub async fn maybe_persist(&self, room: &Arc<Room>) {
        if room.pending_updates.load(Ordering::Relaxed) >= self.tuning.snapshot_every_updates {
            self.persist_room(room).await;
        }
    }

    /// Write the room's state as the next snapshot version. A no-op while no
    /// updates are pending.
    pub async fn persist_room(&self, room: &Arc<Room>) {
        if room.is_presence() || room.pending_updates.load(Ordering::Relaxed) == 0 {
            return;
        }

        let (payload, target_version) = {
            let awareness = room.awareness.lock().await;
            let payload =
                awareness.doc().transact().encode_state_as_update_v2(&StateVector::default());
            (payload, room.snapshot_version.load(Ordering::Relaxed) + 1)
        };

        match self.snapshots.persist(&room.id.to_string(), target_version, &payload).await {
            Ok(PersistOutcome::Persisted) => {
                room.snapshot_version.store(target_version, Ordering::Relaxed);
                room.pending_updates.store(0, Ordering::Relaxed);
                debug!(room = %room.id, version = target_version, "persisted room snapshot");
                self.set_datastore_health(true, None).await;
            }
            Ok(PersistOutcome::Stale { current }) => {
                // Another relay instance won the write. Adopt its version so
                // the next attempt lands above it, and tell the room.
                warn!(
                    room = %room.id,
                    attempted = target_version,
                    current,
                    "snapshot write lost to a newer stored version"
                );
                room.snapshot_version.store(current, Ordering::Relaxed);
                room.send_text(
                    None,
                    &ServerMessage::Error {
                        code: ErrorCode::PersistStaleSnapshot.as_str().to_owned(),
                    },
                );
                self.set_datastore_health(true, None).await;
            }
            Err(error) => {
                warn!(room = %room.id, %error, "snapshot persist failed");
                self.set_datastore_health(false, Some("snapshot datastore unreachable".to_owned()))
                    .await;
            }
        }
    }

    /// Push a revocation to every connection `user_id` holds in `room_id`.
    /// Returns how many connections were told to close.
    pub async fn revoke(&self, room_id: &RoomId, user_id: &str, reason: &str) -> usize {
        let room = { self.rooms.lock().await.get(&room_id.to_string()).cloned() };
        let Some(room) = room else {
            return 0;
        };

        let affected =
            lock(&room.members).values().filter(|member| member.user_id == user_id).count();
        if affected > 0 {
            let _ = room.events.send(RoomEvent::Revoke {
                user_id: user_id.to_owned(),
                reason: reason.to_owned(),
            });
        }
        affected
    }

    /// Current datastore health as a `service_status` message.
    pub fn status_message(&self) -> ServerMessage {
        let available = self.datastore_available.load(Ordering::Relaxed);
        ServerMessage::ServiceStatus {
            available,
            degraded_reason: (!available).then(|| "snapshot datastore unreachable".to_owned()),
        }
    }

    async fn set_datastore_health(&self, available: bool, reason: Option<String>) {
        let was = self.datastore_available.swap(available, Ordering::Relaxed);
        if was == available {
            return;
        }
        if available {
            info!("snapshot datastore recovered");
        } else {
            warn!("snapshot datastore degraded; serving without persistence");
        }

        let message = ServerMessage::ServiceStatus { available, degraded_reason: reason };
        let rooms: Vec<Arc<Room>> = self.rooms.lock().await.values().cloned().collect();
        for room in rooms {
            room.send_text(None, &message);
        }
    }

    #[cfg(test)]
    pub async fn room_count(&self) -> usize {
        self.rooms.lock().await.len()
    }
}
