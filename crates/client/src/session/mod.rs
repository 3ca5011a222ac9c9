// Session actor: owns the relay socket for one room and drives the
// connection lifecycle around it.
//
// One actor per acquired room. It dials, authenticates with a fresh
// one-time token, runs the y-sync handshake, then pumps frames between the
// socket and the `LiveDoc` until the socket drops or the handle tells it to
// stop. Recovery pacing lives in `machine`; socket mechanics in `transport`.

pub mod machine;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use cowrite_common::protocol::messages::{self, ClientMessage, PresenceInfo, ServerMessage};
use cowrite_common::protocol::{ErrorCode, ResourceType, Severity};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;

use crate::backend::TokenProvider;
use crate::config::TuningConfig;
use crate::doc_state::{encode_update_frame, DocUpdate, LiveDoc, UpdateOrigin};

pub use machine::{Reconnect, SessionMachine, SessionState, SessionStatus};
pub use transport::{Connector, Frame, RelayConn, WsConnector};

/// Connection parameters for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub relay_url: String,
    pub tuning: TuningConfig,
    /// Initial network hint; updated later through the handle.
    pub network_online: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    SetNetworkOnline(bool),
    Reconnect,
    PublishPresence {
        current_path: String,
        resource_type: Option<ResourceType>,
        resource_id: Option<String>,
    },
    Close,
}

/// Handle to a running session. Dropping it stops the actor; `close` does
/// the same but lets callers sequence the teardown explicitly.
pub struct SessionHandle {
    _task: JoinHandle<()>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    workspace_rx: watch::Receiver<Vec<PresenceInfo>>,
}

impl SessionHandle {
    /// Report a host-level network transition. Going offline parks retries
    /// without touching a working socket; coming online restores the full
    /// recovery budget and reconnects if needed.
    pub fn set_network_online(&self, online: bool) {
        let _ = self.cmd_tx.send(Command::SetNetworkOnline(online));
    }

    /// Drop the current socket (if any) and dial fresh with a clean budget.
    pub fn reconnect(&self) {
        let _ = self.cmd_tx.send(Command::Reconnect);
    }

    /// Announce where this user is in the workspace. Re-announced after
    /// every reconnect.
    pub fn publish_presence(
        &self,
        current_path: impl Into<String>,
        resource_type: Option<ResourceType>,
        resource_id: Option<String>,
    ) {
        let _ = self.cmd_tx.send(Command::PublishPresence {
            current_path: current_path.into(),
            resource_type,
            resource_id,
        });
    }

    /// Workspace-presence roster for presence rooms. Empty while offline.
    pub fn workspace_presence(&self) -> watch::Receiver<Vec<PresenceInfo>> {
        self.workspace_rx.clone()
    }

    /// Stop the session: awareness entry cleared and flushed, then the
    /// socket is destroyed.
    pub fn close(&self) {
        let _ = self.cmd_tx.send(Command::Close);
    }
}

/// Spawn the session actor for `doc` and return its status feed and handle.
pub fn spawn_session<P: TokenProvider, C: Connector>(
    doc: Arc<LiveDoc>,
    tokens: Arc<P>,
    connector: C,
    config: SessionConfig,
) -> (watch::Receiver<SessionStatus>, SessionHandle) {
    let (status_tx, status_rx) = watch::channel(SessionStatus::new(config.network_online));
    let (workspace_tx, workspace_rx) = watch::channel(Vec::new());
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

    let actor = SessionActor {
        doc,
        tokens,
        connector,
        relay_url: config.relay_url,
        machine: SessionMachine::new(config.tuning.clone()),
        tuning: config.tuning,
        status_tx,
        workspace_tx,
        cmd_rx,
        last_presence: None,
    };
    let task = tokio::spawn(actor.run());

    (status_rx, SessionHandle { _task: task, cmd_tx, workspace_rx })
}

/// Why a connection attempt did not reach sync confirmation.
#[derive(Debug)]
enum AttemptFailure {
    /// Retry under the backoff policy.
    Recoverable(Option<ErrorCode>),
    /// Stop retrying until a manual reconnect or a network transition.
    Fatal(ErrorCode),
    /// permission_revoked arrived; the session is dead for good.
    Revoked,
}

/// What a live text frame asks the pump to do next.
enum TextOutcome {
    Continue,
    Lost,
    Fatal(ErrorCode),
    Revoked,
}

/// Next phase of the actor loop.
enum Step {
    Attempt,
    Backoff(Duration),
    /// Offline with no scheduled retry; only commands can wake it.
    Park,
    Stop,
}

struct SessionActor<P, C: Connector> {
    doc: Arc<LiveDoc>,
    tokens: Arc<P>,
    connector: C,
    relay_url: String,
    tuning: TuningConfig,
    machine: SessionMachine,
    status_tx: watch::Sender<SessionStatus>,
    workspace_tx: watch::Sender<Vec<PresenceInfo>>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    last_presence: Option<ClientMessage>,
}

impl<P: TokenProvider, C: Connector> SessionActor<P, C> {
    async fn run(mut self) {
        let mut step = Step::Attempt;
        loop {
            step = match step {
                Step::Attempt => {
                    if self.status_tx.borrow().network_online {
                        self.do_attempt().await
                    } else {
                        Step::Park
                    }
                }
                Step::Backoff(delay) => self.do_backoff(delay).await,
                Step::Park => self.do_park().await,
                Step::Stop => return,
            };
        }
    }

    fn set_status(&self, f: impl FnOnce(&mut SessionStatus)) {
        self.status_tx.send_if_modified(|status| {
            let before = status.clone();
            f(status);
            *status != before
        });
    }

    /// One full connection attempt: token, dial, auth, sync handshake. The
    /// handshake must confirm within the sync window or the attempt fails.
    async fn do_attempt(&mut self) -> Step {
        self.set_status(|s| {
            s.state = SessionState::Connecting;
            s.loading = true;
            s.synced = false;
        });

        // The token fetch runs outside the sync window; the backend client
        // carries its own HTTP timeout. Every attempt gets a fresh token.
        let token = match self.tokens.collab_token(self.doc.room()).await {
            Ok(token) => token,
            Err(error) if error.is_terminal() => {
                tracing::warn!(room = %self.doc.room(), %error, "token fetch rejected");
                return self.fail_fatal(error.code);
            }
            Err(error) => {
                tracing::debug!(room = %self.doc.room(), %error, "token fetch failed");
                return self.fail_recoverable(Some(error.code));
            }
        };

        // Subscribe before the handshake so no local update can fall in the
        // gap between sync confirmation and the live pump.
        let updates_rx = self.doc.subscribe_updates();
        let awareness_rx = self.doc.subscribe_awareness();

        let window = self.tuning.sync_confirm_timeout();
        let established = tokio::select! {
            outcome = time::timeout(
                window,
                establish(&self.doc, &self.connector, &self.relay_url, &self.status_tx, token),
            ) => outcome,
            cmd = self.cmd_rx.recv() => {
                // Dropping the attempt future tears the half-open socket down.
                return self.on_command_mid_attempt(cmd);
            }
        };

        match established {
            Ok(Ok((mut conn, snapshot_version))) => {
                self.machine.on_sync_confirmed();
                self.set_status(|s| {
                    s.state = SessionState::Connected;
                    s.synced = true;
                    s.loading = false;
                    s.last_error = None;
                    s.snapshot_version = snapshot_version;
                });
                tracing::info!(room = %self.doc.room(), snapshot_version, "session connected");

                if let Some(presence) = self.last_presence.clone() {
                    if send_text(&mut conn, &presence).await.is_err() {
                        return self.connection_lost(conn).await;
                    }
                }
                self.live(conn, updates_rx, awareness_rx).await
            }
            Ok(Err(AttemptFailure::Recoverable(code))) => self.fail_recoverable(code),
            Ok(Err(AttemptFailure::Fatal(code))) => self.fail_fatal(code),
            Ok(Err(AttemptFailure::Revoked)) => self.enter_revoked(),
            Err(_elapsed) => {
                tracing::debug!(room = %self.doc.room(), "no sync confirmation within the window");
                self.fail_recoverable(Some(ErrorCode::ConnectionTimeout))
            }
        }
    }

    /// Pump frames until the socket drops or a command ends the phase.
    async fn live(
        &mut self,
        mut conn: C::Conn,
        mut updates_rx: broadcast::Receiver<DocUpdate>,
        mut awareness_rx: broadcast::Receiver<Vec<u8>>,
    ) -> Step {
        loop {
            tokio::select! {
                incoming = conn.recv() => match incoming {
                    Ok(Some(Frame::Binary(payload))) => {
                        match self.doc.handle_binary_frame(&payload) {
                            Ok(responses) => {
                                for response in responses {
                                    if conn.send(Frame::Binary(response)).await.is_err() {
                                        return self.connection_lost(conn).await;
                                    }
                                }
                            }
                            Err(error) => {
                                tracing::warn!(room = %self.doc.room(), %error, "dropping bad y-sync frame");
                            }
                        }
                    }
                    Ok(Some(Frame::Text(raw))) => match self.on_live_text(&raw, &mut conn).await {
                        TextOutcome::Continue => {}
                        TextOutcome::Lost => return self.connection_lost(conn).await,
                        TextOutcome::Fatal(code) => {
                            conn.close().await;
                            return self.fail_fatal(code);
                        }
                        TextOutcome::Revoked => {
                            teardown_presence(&self.doc, &mut conn).await;
                            return self.enter_revoked();
                        }
                    },
                    Ok(None) => return self.connection_lost(conn).await,
                    Err(error) => {
                        tracing::debug!(room = %self.doc.room(), %error, "relay socket error");
                        return self.connection_lost(conn).await;
                    }
                },
                update = updates_rx.recv() => match update {
                    Ok(update) => {
                        if update.origin == UpdateOrigin::Local
                            && conn
                                .send(Frame::Binary(encode_update_frame(update.payload)))
                                .await
                                .is_err()
                        {
                            return self.connection_lost(conn).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(room = %self.doc.room(), skipped, "update bus lagged; resyncing");
                        if resync(&mut conn, &self.doc).await.is_err() {
                            return self.connection_lost(conn).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return self.close_live(conn).await;
                    }
                },
                frame = awareness_rx.recv() => match frame {
                    Ok(payload) => {
                        if conn.send(Frame::Binary(payload)).await.is_err() {
                            return self.connection_lost(conn).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        // Skipped intermediates are superseded; send the
                        // current entry instead.
                        if let Ok(payload) = self.doc.local_awareness_frame() {
                            if conn.send(Frame::Binary(payload)).await.is_err() {
                                return self.connection_lost(conn).await;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return self.close_live(conn).await;
                    }
                },
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::SetNetworkOnline(online)) => {
                        // A network hint alone never tears down a working socket.
                        self.set_status(|s| s.network_online = online);
                    }
                    Some(Command::Reconnect) => {
                        conn.close().await;
                        self.machine.reset();
                        return Step::Attempt;
                    }
                    Some(Command::PublishPresence { current_path, resource_type, resource_id }) => {
                        let message =
                            ClientMessage::PresenceUpdate { current_path, resource_type, resource_id };
                        self.last_presence = Some(message.clone());
                        if send_text(&mut conn, &message).await.is_err() {
                            return self.connection_lost(conn).await;
                        }
                    }
                    Some(Command::Close) | None => return self.close_live(conn).await,
                },
            }
        }
    }

    /// Handle one decoded server text frame while live.
    async fn on_live_text(&mut self, raw: &str, conn: &mut C::Conn) -> TextOutcome {
        let message = match messages::decode_server(raw) {
            Ok(message) => message,
            Err(error) => {
                tracing::debug!(room = %self.doc.room(), %error, "dropping undecodable text frame");
                return TextOutcome::Continue;
            }
        };

        match message {
            ServerMessage::SyncComplete { snapshot_version } => {
                self.machine.on_sync_confirmed();
                self.set_status(|s| {
                    s.synced = true;
                    s.snapshot_version = snapshot_version;
                    s.last_error = None;
                });
                TextOutcome::Continue
            }
            ServerMessage::Error { code } => self.on_live_error(&code, conn).await,
            ServerMessage::PermissionRevoked { reason } => {
                tracing::warn!(room = %self.doc.room(), reason, "authorization revoked");
                TextOutcome::Revoked
            }
            ServerMessage::ServiceStatus { available, degraded_reason } => {
                self.set_status(|s| {
                    s.degraded_reason = if available {
                        None
                    } else {
                        Some(degraded_reason.unwrap_or_else(|| "relay degraded".to_owned()))
                    };
                });
                TextOutcome::Continue
            }
            ServerMessage::PresenceSnapshot { users } => {
                let _ = self.workspace_tx.send(users);
                TextOutcome::Continue
            }
            ServerMessage::PresenceChanged { user } => {
                self.workspace_tx.send_modify(|roster| {
                    match roster.iter().position(|u| u.user_id == user.user_id) {
                        Some(index) => roster[index] = user,
                        None => roster.push(user),
                    }
                });
                TextOutcome::Continue
            }
            ServerMessage::UserLeftPresence { user_id } => {
                self.workspace_tx.send_modify(|roster| roster.retain(|u| u.user_id != user_id));
                TextOutcome::Continue
            }
            ServerMessage::UserJoined { user_id, user_name, .. } => {
                tracing::debug!(room = %self.doc.room(), user_id, user_name, "collaborator joined");
                TextOutcome::Continue
            }
            ServerMessage::UserLeft { user_id } => {
                tracing::debug!(room = %self.doc.room(), user_id, "collaborator left");
                TextOutcome::Continue
            }
            ServerMessage::AuthOk { .. } | ServerMessage::AuthError { .. } => {
                tracing::debug!(room = %self.doc.room(), "unexpected auth message mid-session");
                TextOutcome::Continue
            }
        }
    }

    async fn on_live_error(&mut self, raw_code: &str, conn: &mut C::Conn) -> TextOutcome {
        match failure_for_code(raw_code) {
            AttemptFailure::Recoverable(Some(ErrorCode::TokenRefreshRequired)) => {
                // Rotate the token in place; the socket stays up.
                match self.tokens.collab_token(self.doc.room()).await {
                    Ok(token) => {
                        let message = ClientMessage::TokenRefresh { token };
                        if send_text(conn, &message).await.is_err() {
                            return TextOutcome::Lost;
                        }
                        TextOutcome::Continue
                    }
                    Err(error) if error.is_terminal() => TextOutcome::Fatal(error.code),
                    Err(_) => TextOutcome::Lost,
                }
            }
            AttemptFailure::Recoverable(code) => {
                tracing::warn!(room = %self.doc.room(), code = raw_code, "recoverable relay error");
                self.set_status(|s| s.last_error = code);
                if matches!(code, Some(ErrorCode::SyncFailed | ErrorCode::SyncConflict)) {
                    self.set_status(|s| s.synced = false);
                    if resync(conn, &self.doc).await.is_err() {
                        return TextOutcome::Lost;
                    }
                }
                TextOutcome::Continue
            }
            AttemptFailure::Fatal(code) => TextOutcome::Fatal(code),
            AttemptFailure::Revoked => TextOutcome::Revoked,
        }
    }

    /// Sleep out a backoff delay, still honoring commands.
    async fn do_backoff(&mut self, delay: Duration) -> Step {
        let sleep = time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return Step::Attempt,
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::SetNetworkOnline(online)) => {
                        let was_online = self.status_tx.borrow().network_online;
                        self.set_status(|s| s.network_online = online);
                        if online && !was_online {
                            self.machine.reset();
                            return Step::Attempt;
                        }
                        if !online {
                            return Step::Park;
                        }
                    }
                    Some(Command::Reconnect) => {
                        self.machine.reset();
                        return Step::Attempt;
                    }
                    Some(Command::PublishPresence { current_path, resource_type, resource_id }) => {
                        self.last_presence = Some(ClientMessage::PresenceUpdate {
                            current_path,
                            resource_type,
                            resource_id,
                        });
                    }
                    Some(Command::Close) | None => return self.stop_offline(),
                },
            }
        }
    }

    /// Offline with no scheduled retry. Wait for a command that changes
    /// the situation.
    async fn do_park(&mut self) -> Step {
        self.set_status(|s| {
            s.state = SessionState::Offline;
            s.synced = false;
            s.loading = false;
        });
        loop {
            match self.cmd_rx.recv().await {
                Some(Command::SetNetworkOnline(online)) => {
                    let was_online = self.status_tx.borrow().network_online;
                    self.set_status(|s| s.network_online = online);
                    if online && !was_online {
                        self.machine.reset();
                        return Step::Attempt;
                    }
                }
                Some(Command::Reconnect) => {
                    self.machine.reset();
                    return Step::Attempt;
                }
                Some(Command::PublishPresence { current_path, resource_type, resource_id }) => {
                    self.last_presence = Some(ClientMessage::PresenceUpdate {
                        current_path,
                        resource_type,
                        resource_id,
                    });
                }
                Some(Command::Close) | None => return self.stop_offline(),
            }
        }
    }

    fn on_command_mid_attempt(&mut self, cmd: Option<Command>) -> Step {
        match cmd {
            Some(Command::SetNetworkOnline(online)) => {
                self.set_status(|s| s.network_online = online);
                if online {
                    self.machine.reset();
                    Step::Attempt
                } else {
                    Step::Park
                }
            }
            Some(Command::Reconnect) => {
                self.machine.reset();
                Step::Attempt
            }
            Some(Command::PublishPresence { current_path, resource_type, resource_id }) => {
                self.last_presence = Some(ClientMessage::PresenceUpdate {
                    current_path,
                    resource_type,
                    resource_id,
                });
                Step::Attempt
            }
            Some(Command::Close) | None => self.stop_offline(),
        }
    }

    fn fail_recoverable(&mut self, code: Option<ErrorCode>) -> Step {
        self.set_status(|s| {
            s.state = SessionState::Offline;
            s.synced = false;
            s.loading = false;
            if code.is_some() {
                s.last_error = code;
            }
        });
        match self.machine.on_attempt_failed() {
            Reconnect::Retry { delay } => Step::Backoff(delay),
            Reconnect::Recreate { delay } => {
                tracing::info!(
                    room = %self.doc.room(),
                    recreation = self.machine.recreations(),
                    "recreating relay connection"
                );
                Step::Backoff(delay)
            }
            Reconnect::GiveUp => {
                tracing::warn!(room = %self.doc.room(), "reconnect budget exhausted; staying offline");
                Step::Park
            }
        }
    }

    fn fail_fatal(&mut self, code: ErrorCode) -> Step {
        tracing::warn!(room = %self.doc.room(), %code, "terminal session error; retries stopped");
        self.set_status(|s| {
            s.state = SessionState::Offline;
            s.synced = false;
            s.loading = false;
            s.last_error = Some(code);
        });
        Step::Park
    }

    fn enter_revoked(&mut self) -> Step {
        self.set_status(|s| {
            s.state = SessionState::Revoked;
            s.synced = false;
            s.loading = false;
            s.last_error = Some(ErrorCode::AuthForbidden);
        });
        Step::Stop
    }

    /// The socket died under us. Clear ephemeral rosters and redial at once;
    /// backoff only starts once attempts fail.
    async fn connection_lost(&mut self, mut conn: C::Conn) -> Step {
        conn.close().await;
        self.workspace_tx.send_if_modified(|roster| {
            if roster.is_empty() {
                false
            } else {
                roster.clear();
                true
            }
        });
        self.set_status(|s| {
            s.state = SessionState::Offline;
            s.synced = false;
        });
        tracing::info!(room = %self.doc.room(), "relay connection lost; reconnecting");
        Step::Attempt
    }

    async fn close_live(&mut self, mut conn: C::Conn) -> Step {
        teardown_presence(&self.doc, &mut conn).await;
        self.set_status(|s| {
            s.state = SessionState::Offline;
            s.synced = false;
            s.loading = false;
        });
        Step::Stop
    }

    fn stop_offline(&mut self) -> Step {
        let _ = self.doc.clear_local_presence();
        self.set_status(|s| {
            s.state = SessionState::Offline;
            s.synced = false;
            s.loading = false;
        });
        Step::Stop
    }
}

/// Dial, authenticate, and run the sync handshake to completion. Returns
/// the live socket and the relay's durable snapshot version.
async fn establish<C: Connector>(
    doc: &LiveDoc,
    connector: &C,
    relay_url: &str,
    status_tx: &watch::Sender<SessionStatus>,
    token: String,
) -> Result<(C::Conn, u64), AttemptFailure> {
    let mut conn = connector.connect(relay_url, doc.room()).await.map_err(|error| {
        tracing::debug!(room = %doc.room(), %error, "relay dial failed");
        AttemptFailure::Recoverable(Some(ErrorCode::ConnectionClosed))
    })?;

    send_text(&mut conn, &ClientMessage::Auth { token }).await?;

    loop {
        match conn.recv().await {
            Ok(Some(Frame::Text(raw))) => match messages::decode_server(&raw) {
                Ok(ServerMessage::AuthOk { user_id, user_name }) => {
                    tracing::debug!(room = %doc.room(), user_id, user_name, "relay auth accepted");
                    break;
                }
                Ok(ServerMessage::AuthError { code }) => return Err(failure_for_code(&code)),
                Ok(other) => tracing::debug!(?other, "ignoring pre-auth message"),
                Err(error) => tracing::debug!(%error, "dropping undecodable pre-auth frame"),
            },
            Ok(Some(Frame::Binary(_))) => {
                tracing::debug!(room = %doc.room(), "ignoring binary frame before auth");
            }
            Ok(None) => return Err(AttemptFailure::Recoverable(Some(ErrorCode::ConnectionClosed))),
            Err(_) => return Err(AttemptFailure::Recoverable(Some(ErrorCode::ConnectionClosed))),
        }
    }

    status_tx.send_modify(|s| s.state = SessionState::Syncing);

    // Ask for a full handshake, open with step 1, and re-announce whatever
    // awareness entry we carry.
    send_text(&mut conn, &ClientMessage::SyncRequest {}).await?;
    send_binary(&mut conn, doc.sync_step1()).await?;
    if let Ok(frame) = doc.local_awareness_frame() {
        send_binary(&mut conn, frame).await?;
    }

    loop {
        match conn.recv().await {
            Ok(Some(Frame::Binary(payload))) => match doc.handle_binary_frame(&payload) {
                Ok(responses) => {
                    for response in responses {
                        send_binary(&mut conn, response).await?;
                    }
                }
                Err(error) => {
                    tracing::warn!(room = %doc.room(), %error, "bad y-sync frame during handshake");
                }
            },
            Ok(Some(Frame::Text(raw))) => match messages::decode_server(&raw) {
                Ok(ServerMessage::SyncComplete { snapshot_version }) => {
                    return Ok((conn, snapshot_version));
                }
                Ok(ServerMessage::PermissionRevoked { reason }) => {
                    tracing::warn!(room = %doc.room(), reason, "authorization revoked during handshake");
                    teardown_presence(doc, &mut conn).await;
                    return Err(AttemptFailure::Revoked);
                }
                Ok(ServerMessage::Error { code }) => return Err(failure_for_code(&code)),
                Ok(other) => tracing::debug!(?other, "ignoring handshake message"),
                Err(error) => tracing::debug!(%error, "dropping undecodable handshake frame"),
            },
            Ok(None) => return Err(AttemptFailure::Recoverable(Some(ErrorCode::ConnectionClosed))),
            Err(_) => return Err(AttemptFailure::Recoverable(Some(ErrorCode::ConnectionClosed))),
        }
    }
}

/// Clear the local awareness entry and flush the leave frame before the
/// socket is destroyed, so peers see the cursor vanish instead of linger.
async fn teardown_presence<T: RelayConn>(doc: &LiveDoc, conn: &mut T) {
    if doc.clear_local_presence().is_ok() {
        if let Ok(frame) = doc.local_awareness_frame() {
            let _ = conn.send(Frame::Binary(frame)).await;
        }
    }
    conn.close().await;
}

async fn resync<T: RelayConn>(conn: &mut T, doc: &LiveDoc) -> Result<(), AttemptFailure> {
    send_text(conn, &ClientMessage::SyncRequest {}).await?;
    send_binary(conn, doc.sync_step1()).await
}

async fn send_text<T: RelayConn>(
    conn: &mut T,
    message: &ClientMessage,
) -> Result<(), AttemptFailure> {
    let raw = messages::encode_client(message)
        .map_err(|_| AttemptFailure::Recoverable(Some(ErrorCode::SyncFailed)))?;
    conn.send(Frame::Text(raw))
        .await
        .map_err(|_| AttemptFailure::Recoverable(Some(ErrorCode::ConnectionClosed)))
}

async fn send_binary<T: RelayConn>(conn: &mut T, payload: Vec<u8>) -> Result<(), AttemptFailure> {
    conn.send(Frame::Binary(payload))
        .await
        .map_err(|_| AttemptFailure::Recoverable(Some(ErrorCode::ConnectionClosed)))
}

/// Classify a wire error code string. Unknown codes fail safe to terminal.
fn failure_for_code(raw: &str) -> AttemptFailure {
    let code = ErrorCode::parse(raw);
    match Severity::of_wire_code(raw) {
        Severity::Terminal => {
            AttemptFailure::Fatal(code.unwrap_or(ErrorCode::ServerInternalError))
        }
        Severity::Recoverable => AttemptFailure::Recoverable(code),
    }
}
