// cowrite-client: per-room realtime sync sessions for Cowrite apps.
//
// The shape of the crate follows the data path. `doc_state` wraps the CRDT
// and its awareness channel; `session` keeps one relay connection alive per
// room; `cache` persists updates locally; `snapshot` covers the cold-start
// read-only path; `pool` ties them together behind reference-counted leases.

pub mod backend;
pub mod cache;
pub mod config;
pub mod doc_state;
pub mod pool;
pub mod presence;
pub mod session;
pub mod snapshot;

pub use backend::{BackendError, HttpBackend, SnapshotSource, TokenProvider};
pub use cache::LocalDocCache;
pub use config::{ClientConfig, TuningConfig};
pub use doc_state::LiveDoc;
pub use pool::{DocLease, DocPool, PoolConfig};
pub use presence::{EmptyPresence, PresenceFeed, PresenceTracker, RemoteUser};
pub use session::{SessionHandle, SessionState, SessionStatus, WsConnector};
pub use snapshot::{ReadOnlyDoc, SnapshotFallback};
