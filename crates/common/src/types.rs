// Core domain types shared across all Cowrite crates.

use serde::{Deserialize, Serialize};

/// A cursor selection inside a shared document, as offsets into the content
/// sequence. `anchor == head` is a collapsed caret.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CursorRange {
    pub anchor: u32,
    pub head: u32,
}

/// Per-client ephemeral payload carried on a room's awareness channel.
/// Never persisted; peers drop it when the client's entry goes stale.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceState {
    pub name: String,
    /// Display color, hex `#rrggbb`.
    pub color: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorRange>,
}

impl PresenceState {
    pub fn new(name: impl Into<String>, color: impl Into<String>) -> PresenceState {
        PresenceState { name: name.into(), color: color.into(), cursor: None }
    }

    pub fn with_cursor(mut self, anchor: u32, head: u32) -> PresenceState {
        self.cursor = Some(CursorRange { anchor, head });
        self
    }
}
