use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub avatar_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A named, shared entity that pins are attached to. Everyone can see every
/// place; only the owner may delete it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Place {
    pub id: Uuid,
    pub name: String,
    pub image_ref: String,
    pub color: String,
    pub owner_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// A geolocated annotation. `radius_meters` is only ever rewritten by the
/// vote consensus, never by a direct user edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pin {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub place_id: Uuid,
    pub owner_id: Uuid,
    pub radius_meters: u32,
    pub created_at: DateTime<Utc>,
    pub camera_image_ref: Option<String>,
    pub place_image_ref: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    PlaceNotification,
    PinNotification,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::PlaceNotification => "place_notification",
            Self::PinNotification => "pin_notification",
        }
    }

    /// Notification messages carry a foreign key and can be voted on.
    pub fn is_notification(&self) -> bool {
        !matches!(self, Self::Text)
    }
}

impl FromStr for MessageKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "place_notification" => Ok(Self::PlaceNotification),
            "pin_notification" => Ok(Self::PinNotification),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub author_id: Uuid,
    pub text: String,
    pub kind: MessageKind,
    pub related_place_id: Option<Uuid>,
    pub related_pin_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// One of the six fixed radius ranges users vote on.
///
/// The declaration order is normative: when two buckets tie on vote count the
/// one declared first wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RadiusBucket {
    UpTo100,
    UpTo300,
    UpTo500,
    UpTo1000,
    UpTo2000,
    UpTo5000,
}

impl RadiusBucket {
    pub const ALL: [RadiusBucket; 6] = [
        Self::UpTo100,
        Self::UpTo300,
        Self::UpTo500,
        Self::UpTo1000,
        Self::UpTo2000,
        Self::UpTo5000,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UpTo100 => "0-100",
            Self::UpTo300 => "100-300",
            Self::UpTo500 => "300-500",
            Self::UpTo1000 => "500-1000",
            Self::UpTo2000 => "1000-2000",
            Self::UpTo5000 => "2000-5000",
        }
    }

    /// Lower and upper bound in meters.
    pub fn bounds(&self) -> (u32, u32) {
        match self {
            Self::UpTo100 => (0, 100),
            Self::UpTo300 => (100, 300),
            Self::UpTo500 => (300, 500),
            Self::UpTo1000 => (500, 1000),
            Self::UpTo2000 => (1000, 2000),
            Self::UpTo5000 => (2000, 5000),
        }
    }

    /// Rounded midpoint of the range, the radius a winning bucket resolves to.
    pub fn midpoint(&self) -> u32 {
        let (min, max) = self.bounds();
        ((f64::from(min) + f64::from(max)) / 2.0).round() as u32
    }
}

impl fmt::Display for RadiusBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RadiusBucket {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|b| b.as_str() == s)
            .ok_or_else(|| UnknownVariant(s.to_string()))
    }
}

impl TryFrom<String> for RadiusBucket {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RadiusBucket> for String {
    fn from(value: RadiusBucket) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub id: Uuid,
    pub voter_id: Uuid,
    pub message_id: Uuid,
    pub bucket: RadiusBucket,
    pub created_at: DateTime<Utc>,
}

/// Presence row: one per user, overwritten on every sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveLocation {
    pub user_id: Uuid,
    pub latitude: f64,
    pub longitude: f64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown variant '{0}'")]
pub struct UnknownVariant(pub String);
