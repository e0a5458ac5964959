use std::fmt;
use std::hash::Hash;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ChatMessage, LiveLocation, Pin, Place, Vote};

/// Tables that publish row-level change events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Pins,
    Places,
    ChatMessages,
    RadiusVotes,
    UserLocations,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pins => "pins",
            Self::Places => "places",
            Self::ChatMessages => "chat_messages",
            Self::RadiusVotes => "radius_votes",
            Self::UserLocations => "user_locations",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    fn bit(self) -> u8 {
        match self {
            Self::Insert => 0b001,
            Self::Update => 0b010,
            Self::Delete => 0b100,
        }
    }
}

/// Set of change kinds a subscription wants delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventMask(u8);

impl EventMask {
    pub const ALL: EventMask = EventMask(0b111);
    pub const NONE: EventMask = EventMask(0);

    pub fn only(kind: ChangeKind) -> Self {
        EventMask(kind.bit())
    }

    pub fn with(self, kind: ChangeKind) -> Self {
        EventMask(self.0 | kind.bit())
    }

    pub fn contains(&self, kind: ChangeKind) -> bool {
        self.0 & kind.bit() != 0
    }
}

impl Default for EventMask {
    fn default() -> Self {
        Self::ALL
    }
}

/// A full row image carried by a change event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Row {
    Pin(Pin),
    Place(Place),
    Message(ChatMessage),
    Vote(Vote),
    Location(LiveLocation),
}

impl Row {
    pub fn table(&self) -> Table {
        match self {
            Self::Pin(_) => Table::Pins,
            Self::Place(_) => Table::Places,
            Self::Message(_) => Table::ChatMessages,
            Self::Vote(_) => Table::RadiusVotes,
            Self::Location(_) => Table::UserLocations,
        }
    }
}

/// A row-level change as emitted by the backing store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub table: Table,
    pub new_row: Option<Row>,
    pub old_row: Option<Row>,
}

impl ChangeEvent {
    pub fn insert(row: Row) -> Self {
        Self {
            kind: ChangeKind::Insert,
            table: row.table(),
            new_row: Some(row),
            old_row: None,
        }
    }

    pub fn update(old: Option<Row>, new: Row) -> Self {
        Self {
            kind: ChangeKind::Update,
            table: new.table(),
            new_row: Some(new),
            old_row: old,
        }
    }

    pub fn delete(old: Row) -> Self {
        Self {
            kind: ChangeKind::Delete,
            table: old.table(),
            new_row: None,
            old_row: Some(old),
        }
    }
}

/// A value that lives in one change-fed table and can be reconciled by key.
pub trait Entity: Clone + fmt::Debug + Send + 'static {
    type Key: Clone + Eq + Hash + fmt::Debug + Send;

    const TABLE: Table;

    fn key(&self) -> Self::Key;

    /// Extract a typed value from a row image of this entity's table.
    fn from_row(row: Row) -> Option<Self>;
}

impl Entity for Pin {
    type Key = Uuid;
    const TABLE: Table = Table::Pins;

    fn key(&self) -> Uuid {
        self.id
    }

    fn from_row(row: Row) -> Option<Self> {
        match row {
            Row::Pin(pin) => Some(pin),
            _ => None,
        }
    }
}

impl Entity for Place {
    type Key = Uuid;
    const TABLE: Table = Table::Places;

    fn key(&self) -> Uuid {
        self.id
    }

    fn from_row(row: Row) -> Option<Self> {
        match row {
            Row::Place(place) => Some(place),
            _ => None,
        }
    }
}

impl Entity for ChatMessage {
    type Key = Uuid;
    const TABLE: Table = Table::ChatMessages;

    fn key(&self) -> Uuid {
        self.id
    }

    fn from_row(row: Row) -> Option<Self> {
        match row {
            Row::Message(message) => Some(message),
            _ => None,
        }
    }
}

impl Entity for Vote {
    type Key = Uuid;
    const TABLE: Table = Table::RadiusVotes;

    fn key(&self) -> Uuid {
        self.id
    }

    fn from_row(row: Row) -> Option<Self> {
        match row {
            Row::Vote(vote) => Some(vote),
            _ => None,
        }
    }
}

/// Live locations are keyed by user: presence, not a track.
impl Entity for LiveLocation {
    type Key = Uuid;
    const TABLE: Table = Table::UserLocations;

    fn key(&self) -> Uuid {
        self.user_id
    }

    fn from_row(row: Row) -> Option<Self> {
        match row {
            Row::Location(location) => Some(location),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_membership() {
        let mask = EventMask::only(ChangeKind::Insert).with(ChangeKind::Delete);
        assert!(mask.contains(ChangeKind::Insert));
        assert!(mask.contains(ChangeKind::Delete));
        assert!(!mask.contains(ChangeKind::Update));
        assert!(!EventMask::NONE.contains(ChangeKind::Update));
        assert!(EventMask::default().contains(ChangeKind::Update));
    }

    #[test]
    fn event_json_shape() {
        let location = LiveLocation {
            user_id: Uuid::nil(),
            latitude: 52.52,
            longitude: 13.405,
            updated_at: chrono::DateTime::default(),
        };
        let event = ChangeEvent::insert(Row::Location(location));
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["kind"], "INSERT");
        assert_eq!(json["table"], "user_locations");
        assert_eq!(json["new_row"]["type"], "Location");
        assert!(json["old_row"].is_null());
    }
}
