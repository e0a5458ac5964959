use anyhow::Result;
use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use pinboard_types::api::{LocationUpdate, NewMessage, NewPin, NewPlace, NewUser, NewVote};

use crate::models::{LocationRow, MessageRow, PinRow, PlaceRow, UserRow, VoteRow};

/// Fixed-width RFC 3339 so that `ORDER BY created_at` sorts chronologically.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

// -- Users --

const USER_COLUMNS: &str = "id, username, avatar_url, created_at";

fn user_row(row: &Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        username: row.get(1)?,
        avatar_url: row.get(2)?,
        created_at: row.get(3)?,
    })
}

pub fn insert_user(conn: &Connection, user: &NewUser) -> Result<UserRow> {
    conn.execute(
        "INSERT INTO users (id, username, avatar_url, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![user.id.to_string(), user.username, user.avatar_url, now_timestamp()],
    )?;
    get_user(conn, &user.id.to_string())?.ok_or_else(|| anyhow::anyhow!("user vanished after insert"))
}

pub fn get_user(conn: &Connection, id: &str) -> Result<Option<UserRow>> {
    let sql = format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS);
    Ok(conn.query_row(&sql, [id], user_row).optional()?)
}

pub fn list_users(conn: &Connection) -> Result<Vec<UserRow>> {
    let sql = format!("SELECT {} FROM users ORDER BY username", USER_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], user_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

// -- Places --

const PLACE_COLUMNS: &str = "id, name, image_ref, color, owner_id, created_at";

fn place_row(row: &Row<'_>) -> rusqlite::Result<PlaceRow> {
    Ok(PlaceRow {
        id: row.get(0)?,
        name: row.get(1)?,
        image_ref: row.get(2)?,
        color: row.get(3)?,
        owner_id: row.get(4)?,
        created_at: row.get(5)?,
    })
}

pub fn insert_place(conn: &Connection, id: &str, place: &NewPlace) -> Result<PlaceRow> {
    conn.execute(
        "INSERT INTO places (id, name, image_ref, color, owner_id, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![id, place.name, place.image_ref, place.color, place.owner_id.to_string(), now_timestamp()],
    )?;
    get_place(conn, id)?.ok_or_else(|| anyhow::anyhow!("place vanished after insert"))
}

pub fn get_place(conn: &Connection, id: &str) -> Result<Option<PlaceRow>> {
    let sql = format!("SELECT {} FROM places WHERE id = ?1", PLACE_COLUMNS);
    Ok(conn.query_row(&sql, [id], place_row).optional()?)
}

/// All places, everyone sees everyone's.
pub fn list_places(conn: &Connection) -> Result<Vec<PlaceRow>> {
    let sql = format!("SELECT {} FROM places ORDER BY name ASC", PLACE_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], place_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn delete_place(conn: &Connection, id: &str) -> Result<bool> {
    Ok(conn.execute("DELETE FROM places WHERE id = ?1", [id])? > 0)
}

// -- Pins --

const PIN_COLUMNS: &str = "id, title, description, latitude, longitude, place_id, owner_id, \
                           radius_meters, camera_image_ref, place_image_ref, created_at";

fn pin_row(row: &Row<'_>) -> rusqlite::Result<PinRow> {
    Ok(PinRow {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        latitude: row.get(3)?,
        longitude: row.get(4)?,
        place_id: row.get(5)?,
        owner_id: row.get(6)?,
        radius_meters: row.get(7)?,
        camera_image_ref: row.get(8)?,
        place_image_ref: row.get(9)?,
        created_at: row.get(10)?,
    })
}

pub fn insert_pin(conn: &Connection, id: &str, pin: &NewPin) -> Result<PinRow> {
    conn.execute(
        "INSERT INTO pins (id, title, description, latitude, longitude, place_id, owner_id,
                           radius_meters, camera_image_ref, place_image_ref, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            id,
            pin.title,
            pin.description,
            pin.latitude,
            pin.longitude,
            pin.place_id.to_string(),
            pin.owner_id.to_string(),
            pin.radius_meters,
            pin.camera_image_ref,
            pin.place_image_ref,
            now_timestamp(),
        ],
    )?;
    get_pin(conn, id)?.ok_or_else(|| anyhow::anyhow!("pin vanished after insert"))
}

pub fn get_pin(conn: &Connection, id: &str) -> Result<Option<PinRow>> {
    let sql = format!("SELECT {} FROM pins WHERE id = ?1", PIN_COLUMNS);
    Ok(conn.query_row(&sql, [id], pin_row).optional()?)
}

/// Newest first.
pub fn list_pins(conn: &Connection) -> Result<Vec<PinRow>> {
    let sql = format!("SELECT {} FROM pins ORDER BY created_at DESC, rowid DESC", PIN_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], pin_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn list_pins_for_place(conn: &Connection, place_id: &str) -> Result<Vec<PinRow>> {
    let sql = format!("SELECT {} FROM pins WHERE place_id = ?1", PIN_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([place_id], pin_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Set a pin's radius. Returns false when the pin is missing or already has
/// this radius, so repeated writes of the same value change nothing.
pub fn update_pin_radius(conn: &Connection, id: &str, radius_meters: u32) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE pins SET radius_meters = ?1 WHERE id = ?2 AND radius_meters != ?1",
        params![radius_meters, id],
    )?;
    Ok(changed > 0)
}

pub fn delete_pin(conn: &Connection, id: &str) -> Result<bool> {
    Ok(conn.execute("DELETE FROM pins WHERE id = ?1", [id])? > 0)
}

// -- Chat messages --

const MESSAGE_COLUMNS: &str = "id, author_id, text, kind, related_place_id, related_pin_id, created_at";

fn message_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        author_id: row.get(1)?,
        text: row.get(2)?,
        kind: row.get(3)?,
        related_place_id: row.get(4)?,
        related_pin_id: row.get(5)?,
        created_at: row.get(6)?,
    })
}

pub fn insert_message(conn: &Connection, id: &str, message: &NewMessage) -> Result<MessageRow> {
    conn.execute(
        "INSERT INTO chat_messages (id, author_id, text, kind, related_place_id, related_pin_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            id,
            message.author_id.to_string(),
            message.text,
            message.kind.as_str(),
            message.related_place_id.map(|u| u.to_string()),
            message.related_pin_id.map(|u| u.to_string()),
            now_timestamp(),
        ],
    )?;
    let sql = format!("SELECT {} FROM chat_messages WHERE id = ?1", MESSAGE_COLUMNS);
    Ok(conn.query_row(&sql, [id], message_row)?)
}

/// The most recent `limit` messages, oldest first.
pub fn list_recent_messages(conn: &Connection, limit: u32) -> Result<Vec<MessageRow>> {
    let sql = format!(
        "SELECT {cols} FROM (
             SELECT {cols}, rowid AS seq FROM chat_messages
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?1
         ) ORDER BY created_at ASC, seq ASC",
        cols = MESSAGE_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([limit], message_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

// -- Radius votes --

const VOTE_COLUMNS: &str = "id, voter_id, message_id, bucket, created_at";

fn vote_row(row: &Row<'_>) -> rusqlite::Result<VoteRow> {
    Ok(VoteRow {
        id: row.get(0)?,
        voter_id: row.get(1)?,
        message_id: row.get(2)?,
        bucket: row.get(3)?,
        created_at: row.get(4)?,
    })
}

/// Insert a vote. A second vote for the same (voter, message) fails on the
/// UNIQUE constraint.
pub fn insert_vote(conn: &Connection, id: &str, vote: &NewVote) -> Result<VoteRow> {
    conn.execute(
        "INSERT INTO radius_votes (id, voter_id, message_id, bucket, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            id,
            vote.voter_id.to_string(),
            vote.message_id.to_string(),
            vote.bucket.as_str(),
            now_timestamp(),
        ],
    )?;
    let sql = format!("SELECT {} FROM radius_votes WHERE id = ?1", VOTE_COLUMNS);
    Ok(conn.query_row(&sql, [id], vote_row)?)
}

pub fn list_votes(conn: &Connection) -> Result<Vec<VoteRow>> {
    let sql = format!("SELECT {} FROM radius_votes ORDER BY created_at ASC, rowid ASC", VOTE_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], vote_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

// -- Live locations --

const LOCATION_COLUMNS: &str = "user_id, latitude, longitude, updated_at";

fn location_row(row: &Row<'_>) -> rusqlite::Result<LocationRow> {
    Ok(LocationRow {
        user_id: row.get(0)?,
        latitude: row.get(1)?,
        longitude: row.get(2)?,
        updated_at: row.get(3)?,
    })
}

pub fn get_location(conn: &Connection, user_id: &str) -> Result<Option<LocationRow>> {
    let sql = format!("SELECT {} FROM user_locations WHERE user_id = ?1", LOCATION_COLUMNS);
    Ok(conn.query_row(&sql, [user_id], location_row).optional()?)
}

/// Overwrite the user's single presence row.
pub fn upsert_location(conn: &Connection, update: &LocationUpdate) -> Result<LocationRow> {
    let user_id = update.user_id.to_string();
    conn.execute(
        "INSERT INTO user_locations (user_id, latitude, longitude, updated_at) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(user_id) DO UPDATE SET
             latitude = excluded.latitude,
             longitude = excluded.longitude,
             updated_at = excluded.updated_at",
        params![user_id, update.latitude, update.longitude, now_timestamp()],
    )?;
    get_location(conn, &user_id)?.ok_or_else(|| anyhow::anyhow!("location vanished after upsert"))
}

pub fn list_locations(conn: &Connection) -> Result<Vec<LocationRow>> {
    let sql = format!("SELECT {} FROM user_locations", LOCATION_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], location_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}
