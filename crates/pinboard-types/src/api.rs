use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{MessageKind, RadiusBucket};

// -- Users --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewUser {
    pub id: Uuid,
    pub username: String,
    pub avatar_url: Option<String>,
}

// -- Places --

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewPlace {
    pub name: String,
    pub image_ref: String,
    pub color: String,
    pub owner_id: Uuid,
}

/// Colors offered when creating a place.
pub const PLACE_COLORS: &[&str] = &[
    "#3B82F6", "#EF4444", "#10B981", "#F59E0B", "#8B5CF6", "#EC4899", "#14B8A6", "#F97316",
    "#0EA5E9", "#22C55E", "#EAB308", "#6366F1",
];

pub const DEFAULT_PLACE_COLOR: &str = "#3B82F6";

// -- Pins --

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewPin {
    pub title: String,
    pub description: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub place_id: Uuid,
    pub owner_id: Uuid,
    pub radius_meters: u32,
    pub camera_image_ref: Option<String>,
    pub place_image_ref: Option<String>,
}

// -- Chat --

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewMessage {
    pub author_id: Uuid,
    pub text: String,
    pub kind: MessageKind,
    pub related_place_id: Option<Uuid>,
    pub related_pin_id: Option<Uuid>,
}

impl NewMessage {
    pub fn text(author_id: Uuid, text: impl Into<String>) -> Self {
        Self {
            author_id,
            text: text.into(),
            kind: MessageKind::Text,
            related_place_id: None,
            related_pin_id: None,
        }
    }
}

// -- Votes --

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewVote {
    pub voter_id: Uuid,
    pub message_id: Uuid,
    pub bucket: RadiusBucket,
}

// -- Presence --

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LocationUpdate {
    pub user_id: Uuid,
    pub latitude: f64,
    pub longitude: f64,
}

// -- Geocoding --

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}
