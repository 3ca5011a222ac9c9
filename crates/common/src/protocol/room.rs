// Room identifiers: "{resourceType}-{resourceId}".
//
// The resource id may itself contain the separator, so parsing splits on the
// first occurrence only.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ROOM_SEPARATOR: char = '-';

/// Kinds of collaborative resources a room can host.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Doc,
    Diagram,
    Task,
    Presence,
    Spreadsheet,
}

impl ResourceType {
    pub const ALL: [ResourceType; 5] =
        [Self::Doc, Self::Diagram, Self::Task, Self::Presence, Self::Spreadsheet];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Doc => "doc",
            Self::Diagram => "diagram",
            Self::Task => "task",
            Self::Presence => "presence",
            Self::Spreadsheet => "spreadsheet",
        }
    }

    pub fn parse(value: &str) -> Option<ResourceType> {
        match value {
            "doc" => Some(Self::Doc),
            "diagram" => Some(Self::Diagram),
            "task" => Some(Self::Task),
            "presence" => Some(Self::Presence),
            "spreadsheet" => Some(Self::Spreadsheet),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RoomIdError {
    #[error("room id has no '{ROOM_SEPARATOR}' separator: {0:?}")]
    MissingSeparator(String),
    #[error("unknown resource type {0:?}")]
    UnknownResourceType(String),
    #[error("room id has an empty resource id")]
    EmptyResourceId,
}

/// A relay room: one resource type plus an opaque resource id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomId {
    resource_type: ResourceType,
    resource_id: String,
}

impl RoomId {
    pub fn new(resource_type: ResourceType, resource_id: impl Into<String>) -> RoomId {
        RoomId { resource_type, resource_id: resource_id.into() }
    }

    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    pub fn is_presence(&self) -> bool {
        self.resource_type == ResourceType::Presence
    }

    /// Parse `"{resourceType}-{resourceId}"`, splitting on the first separator
    /// so ids containing the separator survive a round trip.
    pub fn parse(raw: &str) -> Result<RoomId, RoomIdError> {
        let (type_str, id) = raw
            .split_once(ROOM_SEPARATOR)
            .ok_or_else(|| RoomIdError::MissingSeparator(raw.to_owned()))?;
        let resource_type = ResourceType::parse(type_str)
            .ok_or_else(|| RoomIdError::UnknownResourceType(type_str.to_owned()))?;
        if id.is_empty() {
            return Err(RoomIdError::EmptyResourceId);
        }
        Ok(RoomId { resource_type, resource_id: id.to_owned() })
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{ROOM_SEPARATOR}{}", self.resource_type, self.resource_id)
    }
}

impl FromStr for RoomId {
    type Err = RoomIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RoomId::parse(s)
    }
}

impl Serialize for RoomId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RoomId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        RoomId::parse(&raw).map_err(serde::de::Error::custom)
    }
}
