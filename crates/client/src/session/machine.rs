// Connection lifecycle bookkeeping, kept pure so the retry/recreation
// arithmetic is testable without a runtime.
//
// Two nested counters drive recovery: failed attempts on the current
// connection, and how many times the connection itself has been torn down
// and recreated. A sync confirmation resets both.

use std::time::Duration;

use cowrite_common::protocol::ErrorCode;

use crate::config::TuningConfig;

/// Lifecycle of one room session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, not yet asked to connect.
    Idle,
    /// Socket dial and auth in flight.
    Connecting,
    /// Socket up, sync handshake not yet confirmed.
    Syncing,
    /// Sync confirmed; live.
    Connected,
    /// Not connected; retries may still be scheduled.
    Offline,
    /// Authorization revoked mid-session. Terminal.
    Revoked,
}

/// Snapshot of session health published on the status watch channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    /// Last network hint from the host application.
    pub network_online: bool,
    /// True only between sync confirmation and the next disconnect.
    pub synced: bool,
    /// True while a connect attempt or handshake is in flight.
    pub loading: bool,
    /// Relay-reported degradation, shown while service_status is unhealthy.
    pub degraded_reason: Option<String>,
    pub last_error: Option<ErrorCode>,
    /// Latest durable snapshot version reported by the relay; 0 until the
    /// first sync completes.
    pub snapshot_version: u64,
}

impl SessionStatus {
    pub fn new(network_online: bool) -> SessionStatus {
        SessionStatus {
            state: SessionState::Idle,
            network_online,
            synced: false,
            loading: false,
            degraded_reason: None,
            last_error: None,
            snapshot_version: 0,
        }
    }
}

/// What to do after a failed connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconnect {
    /// Try again on the current connection after `delay`.
    Retry { delay: Duration },
    /// Tear the connection down and dial a fresh one after `delay`.
    Recreate { delay: Duration },
    /// Recovery budget exhausted; stay offline until told otherwise.
    GiveUp,
}

#[derive(Debug)]
pub struct SessionMachine {
    tuning: TuningConfig,
    socket_attempts: u32,
    recreations: u32,
}

impl SessionMachine {
    pub fn new(tuning: TuningConfig) -> SessionMachine {
        SessionMachine { tuning, socket_attempts: 0, recreations: 0 }
    }

    pub fn socket_attempts(&self) -> u32 {
        self.socket_attempts
    }

    pub fn recreations(&self) -> u32 {
        self.recreations
    }

    /// Record one failed attempt and decide the next step. Attempts on one
    /// connection retry with doubling delays; once the per-connection budget
    /// is spent the connection is recreated, and once the recreation budget
    /// is also spent the machine gives up.
    pub fn on_attempt_failed(&mut self) -> Reconnect {
        self.socket_attempts += 1;
        if self.socket_attempts < self.tuning.max_socket_attempts {
            return Reconnect::Retry { delay: self.tuning.attempt_delay(self.socket_attempts) };
        }

        self.socket_attempts = 0;
        self.recreations += 1;
        if self.recreations > self.tuning.max_recreations {
            return Reconnect::GiveUp;
        }
        Reconnect::Recreate { delay: self.tuning.recreation_delay(self.recreations) }
    }

    /// A sync confirmation arrived; recovery starts from scratch next time.
    pub fn on_sync_confirmed(&mut self) {
        self.socket_attempts = 0;
        self.recreations = 0;
    }

    /// Manual reconnect or the network coming back restores the full budget.
    pub fn reset(&mut self) {
        self.socket_attempts = 0;
        self.recreations = 0;
    }
}
