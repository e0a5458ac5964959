//! Database row types. Each maps directly to a SQLite row.
//! Distinct from pinboard-types models to keep the DB layer independent;
//! `into_model` does the parsing at the boundary.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use uuid::Uuid;

use pinboard_types::models::{ChatMessage, LiveLocation, Pin, Place, User, Vote};

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub avatar_url: Option<String>,
    pub created_at: String,
}

pub struct PlaceRow {
    pub id: String,
    pub name: String,
    pub image_ref: String,
    pub color: String,
    pub owner_id: String,
    pub created_at: String,
}

pub struct PinRow {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub place_id: String,
    pub owner_id: String,
    pub radius_meters: i64,
    pub camera_image_ref: Option<String>,
    pub place_image_ref: Option<String>,
    pub created_at: String,
}

pub struct MessageRow {
    pub id: String,
    pub author_id: String,
    pub text: String,
    pub kind: String,
    pub related_place_id: Option<String>,
    pub related_pin_id: Option<String>,
    pub created_at: String,
}

pub struct VoteRow {
    pub id: String,
    pub voter_id: String,
    pub message_id: String,
    pub bucket: String,
    pub created_at: String,
}

pub struct LocationRow {
    pub user_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub updated_at: String,
}

fn uuid(value: &str, column: &str) -> Result<Uuid> {
    value
        .parse()
        .with_context(|| format!("corrupt {} '{}'", column, value))
}

fn opt_uuid(value: Option<&str>, column: &str) -> Result<Option<Uuid>> {
    value.map(|v| uuid(v, column)).transpose()
}

/// Parse a stored timestamp. Rows written by this crate carry RFC 3339;
/// SQLite's `datetime('now')` default is "YYYY-MM-DD HH:MM:SS" without zone.
pub fn timestamp(value: &str) -> Result<DateTime<Utc>> {
    value
        .parse::<DateTime<Utc>>()
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc()))
        .with_context(|| format!("corrupt timestamp '{}'", value))
}

impl UserRow {
    pub fn into_model(self) -> Result<User> {
        Ok(User {
            id: uuid(&self.id, "user id")?,
            username: self.username,
            avatar_url: self.avatar_url,
            created_at: timestamp(&self.created_at)?,
        })
    }
}

impl PlaceRow {
    pub fn into_model(self) -> Result<Place> {
        Ok(Place {
            id: uuid(&self.id, "place id")?,
            name: self.name,
            image_ref: self.image_ref,
            color: self.color,
            owner_id: uuid(&self.owner_id, "place owner_id")?,
            created_at: timestamp(&self.created_at)?,
        })
    }
}

impl PinRow {
    pub fn into_model(self) -> Result<Pin> {
        Ok(Pin {
            id: uuid(&self.id, "pin id")?,
            title: self.title,
            description: self.description,
            latitude: self.latitude,
            longitude: self.longitude,
            place_id: uuid(&self.place_id, "pin place_id")?,
            owner_id: uuid(&self.owner_id, "pin owner_id")?,
            radius_meters: u32::try_from(self.radius_meters)
                .with_context(|| format!("corrupt radius {} on pin '{}'", self.radius_meters, self.id))?,
            created_at: timestamp(&self.created_at)?,
            camera_image_ref: self.camera_image_ref,
            place_image_ref: self.place_image_ref,
        })
    }
}

impl MessageRow {
    pub fn into_model(self) -> Result<ChatMessage> {
        Ok(ChatMessage {
            id: uuid(&self.id, "message id")?,
            author_id: uuid(&self.author_id, "message author_id")?,
            kind: self.kind.parse()?,
            related_place_id: opt_uuid(self.related_place_id.as_deref(), "message related_place_id")?,
            related_pin_id: opt_uuid(self.related_pin_id.as_deref(), "message related_pin_id")?,
            created_at: timestamp(&self.created_at)?,
            text: self.text,
        })
    }
}

impl VoteRow {
    pub fn into_model(self) -> Result<Vote> {
        Ok(Vote {
            id: uuid(&self.id, "vote id")?,
            voter_id: uuid(&self.voter_id, "vote voter_id")?,
            message_id: uuid(&self.message_id, "vote message_id")?,
            bucket: self.bucket.parse()?,
            created_at: timestamp(&self.created_at)?,
        })
    }
}

impl LocationRow {
    pub fn into_model(self) -> Result<LiveLocation> {
        Ok(LiveLocation {
            user_id: uuid(&self.user_id, "location user_id")?,
            latitude: self.latitude,
            longitude: self.longitude,
            updated_at: timestamp(&self.updated_at)?,
        })
    }
}
