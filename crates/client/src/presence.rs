// Remote-presence roster derived from a room's awareness channel.
//
// The awareness channel keeps raw entries around until their owner times out,
// which is far too long for cursors. This layer re-evaluates on a fixed
// cadence and derives the roster a UI actually wants: stale clients removed,
// quiet cursors flagged idle, the local client excluded.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cowrite_common::types::{CursorRange, PresenceState};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::doc_state::{LiveDoc, PeerEntry};

/// Clients with no awareness update for longer than this are dropped from
/// the roster. Covers unclean disconnects the relay has not noticed yet.
pub const STALE_AFTER: Duration = Duration::from_secs(10);

/// Clients whose cursor has not moved for at least this long are flagged
/// idle (but stay on the roster).
pub const IDLE_AFTER: Duration = Duration::from_secs(30);

/// Cadence of the re-evaluation tick. Staleness and idleness transitions
/// happen without any new awareness event, so polling is required.
pub const EVAL_INTERVAL: Duration = Duration::from_secs(1);

/// One remote collaborator as the UI should present them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteUser {
    pub client_id: u64,
    pub name: String,
    pub color: String,
    pub cursor: Option<CursorRange>,
    pub is_idle: bool,
}

struct ClientRecord {
    state: PresenceState,
    clock: u32,
    last_update: Instant,
    cursor_changed: Instant,
}

/// Pure roster bookkeeping, separated from the tick loop so the threshold
/// rules are testable without a runtime.
pub struct RosterState {
    local_client_id: u64,
    records: HashMap<u64, ClientRecord>,
}

impl RosterState {
    pub fn new(local_client_id: u64) -> RosterState {
        RosterState { local_client_id, records: HashMap::new() }
    }

    /// Fold one observation of the awareness channel into the records.
    /// `peers` is the full current roster; clients missing from it left
    /// cleanly and are forgotten at once.
    pub fn observe(&mut self, now: Instant, peers: &[PeerEntry]) {
        self.records.retain(|client_id, _| peers.iter().any(|p| p.client_id == *client_id));

        for peer in peers {
            match self.records.get_mut(&peer.client_id) {
                Some(record) => {
                    if peer.clock != record.clock {
                        record.last_update = now;
                    }
                    if peer.state.cursor != record.state.cursor {
                        record.cursor_changed = now;
                    }
                    record.state = peer.state.clone();
                    record.clock = peer.clock;
                }
                None => {
                    self.records.insert(
                        peer.client_id,
                        ClientRecord {
                            state: peer.state.clone(),
                            clock: peer.clock,
                            last_update: now,
                            cursor_changed: now,
                        },
                    );
                }
            }
        }
    }

    /// Derive the visible roster at `now`, sorted by client id.
    pub fn roster(&self, now: Instant) -> Vec<RemoteUser> {
        let mut users: Vec<RemoteUser> = self
            .records
            .iter()
            .filter(|(client_id, _)| **client_id != self.local_client_id)
            .filter(|(_, record)| now.duration_since(record.last_update) <= STALE_AFTER)
            .map(|(client_id, record)| RemoteUser {
                client_id: *client_id,
                name: record.state.name.clone(),
                color: record.state.color.clone(),
                cursor: record.state.cursor,
                is_idle: now.duration_since(record.cursor_changed) >= IDLE_AFTER,
            })
            .collect();
        users.sort_by_key(|user| user.client_id);
        users
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

/// The presence surface a rendering host consumes alongside a document.
/// Live documents expose the tracker's derived roster; read-only snapshot
/// views expose a permanently empty one through [`EmptyPresence`].
pub trait PresenceFeed {
    /// Current roster plus subsequent changes.
    fn roster(&self) -> watch::Receiver<Vec<RemoteUser>>;
}

/// Watches a `LiveDoc`'s peer feed and publishes the derived roster.
/// Dropping the tracker stops the task and clears the published roster.
pub struct PresenceTracker {
    _task: JoinHandle<()>,
    _stop_tx: mpsc::UnboundedSender<()>,
    roster_rx: watch::Receiver<Vec<RemoteUser>>,
}

impl PresenceTracker {
    pub fn spawn(doc: Arc<LiveDoc>) -> PresenceTracker {
        let (roster_tx, roster_rx) = watch::channel(Vec::new());
        let (stop_tx, stop_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(doc, roster_tx, stop_rx));
        PresenceTracker { _task: task, _stop_tx: stop_tx, roster_rx }
    }
}

impl PresenceFeed for PresenceTracker {
    fn roster(&self) -> watch::Receiver<Vec<RemoteUser>> {
        self.roster_rx.clone()
    }
}

/// No-op feed for surfaces with no awareness channel behind them. The
/// roster is empty and never changes, but the receiver stays live for as
/// long as any clone of the feed exists.
#[derive(Clone)]
pub struct EmptyPresence {
    _tx: Arc<watch::Sender<Vec<RemoteUser>>>,
    rx: watch::Receiver<Vec<RemoteUser>>,
}

impl EmptyPresence {
    pub fn new() -> EmptyPresence {
        let (tx, rx) = watch::channel(Vec::new());
        EmptyPresence { _tx: Arc::new(tx), rx }
    }
}

impl Default for EmptyPresence {
    fn default() -> EmptyPresence {
        EmptyPresence::new()
    }
}

impl PresenceFeed for EmptyPresence {
    fn roster(&self) -> watch::Receiver<Vec<RemoteUser>> {
        self.rx.clone()
    }
}

async fn run(
    doc: Arc<LiveDoc>,
    roster_tx: watch::Sender<Vec<RemoteUser>>,
    mut stop_rx: mpsc::UnboundedReceiver<()>,
) {
    let mut peers_rx = doc.watch_peers();
    let mut ticker = time::interval(EVAL_INTERVAL);
    let mut state = RosterState::new(doc.client_id());

    state.observe(Instant::now(), &peers_rx.borrow_and_update());

    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            changed = peers_rx.changed() => match changed {
                Ok(()) => {
                    let now = Instant::now();
                    state.observe(now, &peers_rx.borrow_and_update());
                    publish(&roster_tx, state.roster(now));
                }
                Err(_) => break,
            },
            _ = ticker.tick() => {
                publish(&roster_tx, state.roster(Instant::now()));
            }
        }
    }

    // Derived presence must not outlive its observer.
    state.clear();
    let _ = roster_tx.send(Vec::new());
}

fn publish(tx: &watch::Sender<Vec<RemoteUser>>, roster: Vec<RemoteUser>) {
    tx.send_if_modified(|current| {
        if *current == roster {
            false
        } else {
            *current = roster;
            true
        }
    });
}

#[cfg(test)]
mod tests {
    use cowrite_common::protocol::{ResourceType, RoomId};

    use super::*;

    fn peer(client_id: u64, clock: u32, state: PresenceState) -> PeerEntry {
        PeerEntry { client_id, clock, state }
    }

    fn ada() -> PresenceState {
        PresenceState::new("Ada", "#8833ff").with_cursor(0, 0)
    }

    #[test]
    fn local_client_never_appears_in_the_roster() {
        let mut state = RosterState::new(1);
        let now = Instant::now();
        state.observe(now, &[peer(1, 1, ada()), peer(2, 1, ada())]);
        let roster = state.roster(now);
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].client_id, 2);
    }

    #[test]
    fn silent_clients_drop_out_strictly_after_ten_seconds() {
        let mut state = RosterState::new(1);
        let start = Instant::now();
        state.observe(start, &[peer(2, 1, ada())]);

        // At exactly the threshold the client is still visible.
        let at_threshold = start + STALE_AFTER;
        assert_eq!(state.roster(at_threshold).len(), 1);

        let past_threshold = at_threshold + Duration::from_millis(1);
        assert!(state.roster(past_threshold).is_empty(), "raw entry remains but roster drops it");
    }

    #[test]
    fn awareness_updates_keep_a_client_fresh() {
        let mut state = RosterState::new(1);
        let start = Instant::now();
        state.observe(start, &[peer(2, 1, ada())]);

        // Clock bump at t+8s refreshes the staleness timer.
        state.observe(start + Duration::from_secs(8), &[peer(2, 2, ada())]);
        let later = start + Duration::from_secs(15);
        assert_eq!(state.roster(later).len(), 1, "updated 7s ago, not stale");

        // Same clock seen again does not refresh.
        state.observe(later, &[peer(2, 2, ada())]);
        assert!(state.roster(later + Duration::from_secs(4)).is_empty());
    }

    #[test]
    fn idle_flips_at_thirty_seconds_of_cursor_silence() {
        let mut state = RosterState::new(1);
        let start = Instant::now();
        state.observe(start, &[peer(2, 1, ada())]);

        // Keep the client non-stale with cursor-free presence bumps.
        for (tick, clock) in [(9u64, 2u32), (18, 3), (27, 4)] {
            state.observe(start + Duration::from_secs(tick), &[peer(2, clock, ada())]);
        }

        let just_before = start + Duration::from_secs(30) - Duration::from_millis(1);
        assert!(!state.roster(just_before)[0].is_idle);

        let at_threshold = start + Duration::from_secs(30);
        assert!(state.roster(at_threshold)[0].is_idle, "idle at exactly 30s");
    }

    #[test]
    fn cursor_movement_resets_the_idle_timer() {
        let mut state = RosterState::new(1);
        let start = Instant::now();
        state.observe(start, &[peer(2, 1, ada())]);

        let moved = ada().with_cursor(5, 9);
        state.observe(start + Duration::from_secs(25), &[peer(2, 2, moved.clone())]);

        let would_have_idled = start + Duration::from_secs(35);
        state.observe(would_have_idled - Duration::from_secs(1), &[peer(2, 3, moved)]);
        assert!(!state.roster(would_have_idled)[0].is_idle, "cursor moved 10s ago");
    }

    #[test]
    fn cleanly_departed_clients_are_forgotten_immediately() {
        let mut state = RosterState::new(1);
        let now = Instant::now();
        state.observe(now, &[peer(2, 1, ada()), peer(3, 1, ada())]);
        state.observe(now + Duration::from_secs(1), &[peer(3, 1, ada())]);
        let roster = state.roster(now + Duration::from_secs(1));
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].client_id, 3);
    }

    async fn settle() {
        for _ in 0..32 {
            tokio::task::yield_now().await;
        }
    }

    fn test_room() -> RoomId {
        RoomId::new(ResourceType::Doc, "presence-test")
    }

    #[tokio::test(start_paused = true)]
    async fn tracker_reflects_peer_presence_and_clears_on_drop() {
        let doc = Arc::new(LiveDoc::with_client_id(test_room(), 1));
        let tracker = PresenceTracker::spawn(doc.clone());
        let roster = tracker.roster();

        let peer_doc = LiveDoc::with_client_id(test_room(), 2);
        peer_doc.set_local_presence(&PresenceState::new("Grace", "#00aa55")).unwrap();
        let frame = peer_doc.local_awareness_frame().unwrap();
        doc.handle_binary_frame(&frame).unwrap();
        settle().await;

        assert_eq!(roster.borrow().len(), 1);
        assert_eq!(roster.borrow()[0].name, "Grace");
        assert!(!roster.borrow()[0].is_idle);

        drop(tracker);
        settle().await;
        assert!(roster.borrow().is_empty(), "teardown clears the roster");
    }

    #[tokio::test]
    async fn empty_feed_stays_subscribed_and_empty() {
        let feed = EmptyPresence::new();
        let roster = feed.roster();
        assert!(roster.borrow().is_empty());

        // Clones share the sender, so receivers outlive the original handle.
        let clone = feed.clone();
        drop(feed);
        assert!(!roster.has_changed().unwrap(), "no spurious change notifications");
        assert!(clone.roster().borrow().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn tracker_expires_silent_peers_on_its_own_tick() {
        let doc = Arc::new(LiveDoc::with_client_id(test_room(), 1));
        let tracker = PresenceTracker::spawn(doc.clone());
        let roster = tracker.roster();

        let peer_doc = LiveDoc::with_client_id(test_room(), 2);
        peer_doc.set_local_presence(&PresenceState::new("Grace", "#00aa55")).unwrap();
        doc.handle_binary_frame(&peer_doc.local_awareness_frame().unwrap()).unwrap();
        settle().await;
        assert_eq!(roster.borrow().len(), 1);

        // No further awareness traffic: the periodic re-evaluation alone
        // must drop the peer once it crosses the staleness threshold.
        for _ in 0..12 {
            time::advance(Duration::from_secs(1)).await;
            settle().await;
        }
        assert!(roster.borrow().is_empty());
    }
}
