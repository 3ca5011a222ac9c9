// Wire protocol: message catalogue, error taxonomy, room identifiers.

pub mod codes;
pub mod messages;
pub mod room;

pub use codes::{ErrorCode, Severity};
pub use messages::{ClientMessage, PresenceInfo, ServerMessage};
pub use room::{ResourceType, RoomId};
