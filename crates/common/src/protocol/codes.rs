// Error taxonomy for the cowrite sync protocol.
//
// The code -> severity mapping is fixed at design time. Codes arriving on the
// wire as strings are mapped back through `parse`; anything unrecognized is
// treated as terminal by the consumer (fail safe, see `Severity::of_wire_code`).

use std::fmt;

/// How the connection manager reacts to a protocol error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Drives automatic retry/backoff; surfaced only as an offline/degraded flag.
    Recoverable,
    /// Stops all retries; requires user-visible action.
    Terminal,
}

impl Severity {
    /// Severity for a raw wire code. Unknown codes are terminal by default.
    pub fn of_wire_code(code: &str) -> Severity {
        ErrorCode::parse(code).map(ErrorCode::severity).unwrap_or(Severity::Terminal)
    }
}

/// All failure codes the relay and client exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    AuthMissing,
    AuthExpired,
    AuthInvalid,
    AuthForbidden,
    RoomNotFound,
    RoomFull,
    ServerConfigError,
    ServerInternalError,
    SyncConflict,
    SyncFailed,
    ConnectionTimeout,
    ConnectionClosed,
    PersistFailed,
    PersistStaleSnapshot,
    TokenRefreshRequired,
    ServiceUnavailable,
    DegradedMode,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 17] = [
        Self::AuthMissing,
        Self::AuthExpired,
        Self::AuthInvalid,
        Self::AuthForbidden,
        Self::RoomNotFound,
        Self::RoomFull,
        Self::ServerConfigError,
        Self::ServerInternalError,
        Self::SyncConflict,
        Self::SyncFailed,
        Self::ConnectionTimeout,
        Self::ConnectionClosed,
        Self::PersistFailed,
        Self::PersistStaleSnapshot,
        Self::TokenRefreshRequired,
        Self::ServiceUnavailable,
        Self::DegradedMode,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AuthMissing => "AUTH_MISSING",
            Self::AuthExpired => "AUTH_EXPIRED",
            Self::AuthInvalid => "AUTH_INVALID",
            Self::AuthForbidden => "AUTH_FORBIDDEN",
            Self::RoomNotFound => "ROOM_NOT_FOUND",
            Self::RoomFull => "ROOM_FULL",
            Self::ServerConfigError => "SERVER_CONFIG_ERROR",
            Self::ServerInternalError => "SERVER_INTERNAL_ERROR",
            Self::SyncConflict => "SYNC_CONFLICT",
            Self::SyncFailed => "SYNC_FAILED",
            Self::ConnectionTimeout => "CONNECTION_TIMEOUT",
            Self::ConnectionClosed => "CONNECTION_CLOSED",
            Self::PersistFailed => "PERSIST_FAILED",
            Self::PersistStaleSnapshot => "PERSIST_STALE_SNAPSHOT",
            Self::TokenRefreshRequired => "TOKEN_REFRESH_REQUIRED",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Self::DegradedMode => "DEGRADED_MODE",
        }
    }

    pub fn parse(code: &str) -> Option<ErrorCode> {
        match code {
            "AUTH_MISSING" => Some(Self::AuthMissing),
            "AUTH_EXPIRED" => Some(Self::AuthExpired),
            "AUTH_INVALID" => Some(Self::AuthInvalid),
            "AUTH_FORBIDDEN" => Some(Self::AuthForbidden),
            "ROOM_NOT_FOUND" => Some(Self::RoomNotFound),
            "ROOM_FULL" => Some(Self::RoomFull),
            "SERVER_CONFIG_ERROR" => Some(Self::ServerConfigError),
            "SERVER_INTERNAL_ERROR" => Some(Self::ServerInternalError),
            "SYNC_CONFLICT" => Some(Self::SyncConflict),
            "SYNC_FAILED" => Some(Self::SyncFailed),
            "CONNECTION_TIMEOUT" => Some(Self::ConnectionTimeout),
            "CONNECTION_CLOSED" => Some(Self::ConnectionClosed),
            "PERSIST_FAILED" => Some(Self::PersistFailed),
            "PERSIST_STALE_SNAPSHOT" => Some(Self::PersistStaleSnapshot),
            "TOKEN_REFRESH_REQUIRED" => Some(Self::TokenRefreshRequired),
            "SERVICE_UNAVAILABLE" => Some(Self::ServiceUnavailable),
            "DEGRADED_MODE" => Some(Self::DegradedMode),
            _ => None,
        }
    }

    pub const fn severity(self) -> Severity {
        match self {
            Self::AuthMissing
            | Self::AuthExpired
            | Self::AuthInvalid
            | Self::AuthForbidden
            | Self::RoomNotFound
            | Self::RoomFull
            | Self::ServerConfigError
            | Self::ServerInternalError => Severity::Terminal,
            Self::SyncConflict
            | Self::SyncFailed
            | Self::ConnectionTimeout
            | Self::ConnectionClosed
            | Self::PersistFailed
            | Self::PersistStaleSnapshot
            | Self::TokenRefreshRequired
            | Self::ServiceUnavailable
            | Self::DegradedMode => Severity::Recoverable,
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self.severity(), Severity::Terminal)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::{ErrorCode, Severity};

    #[test]
    fn every_code_round_trips_through_its_wire_string() {
        for code in ErrorCode::ALL {
            assert_eq!(ErrorCode::parse(code.as_str()), Some(code));
        }
    }

    #[test]
    fn auth_and_server_codes_are_terminal() {
        assert!(ErrorCode::AuthMissing.is_terminal());
        assert!(ErrorCode::AuthForbidden.is_terminal());
        assert!(ErrorCode::RoomFull.is_terminal());
        assert!(ErrorCode::ServerInternalError.is_terminal());
    }

    #[test]
    fn transport_and_persistence_codes_are_recoverable() {
        assert_eq!(ErrorCode::ConnectionTimeout.severity(), Severity::Recoverable);
        assert_eq!(ErrorCode::ConnectionClosed.severity(), Severity::Recoverable);
        assert_eq!(ErrorCode::PersistStaleSnapshot.severity(), Severity::Recoverable);
        assert_eq!(ErrorCode::TokenRefreshRequired.severity(), Severity::Recoverable);
    }

    #[test]
    fn unknown_wire_code_fails_safe_to_terminal() {
        assert_eq!(ErrorCode::parse("TOTALLY_NEW_CODE"), None);
        assert_eq!(Severity::of_wire_code("TOTALLY_NEW_CODE"), Severity::Terminal);
        assert_eq!(Severity::of_wire_code("CONNECTION_CLOSED"), Severity::Recoverable);
    }
}
