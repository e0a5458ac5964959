use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          TEXT PRIMARY KEY,
            username    TEXT NOT NULL UNIQUE,
            avatar_url  TEXT,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS places (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL,
            image_ref   TEXT NOT NULL,
            color       TEXT NOT NULL DEFAULT '#3B82F6',
            owner_id    TEXT NOT NULL REFERENCES users(id),
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS pins (
            id                TEXT PRIMARY KEY,
            title             TEXT NOT NULL,
            description       TEXT,
            latitude          REAL NOT NULL,
            longitude         REAL NOT NULL,
            place_id          TEXT NOT NULL REFERENCES places(id),
            owner_id          TEXT NOT NULL REFERENCES users(id),
            radius_meters     INTEGER NOT NULL CHECK (radius_meters >= 0),
            camera_image_ref  TEXT,
            place_image_ref   TEXT,
            created_at        TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_pins_place
            ON pins(place_id);

        -- related ids are not foreign keys: the pin or place may be gone.
        CREATE TABLE IF NOT EXISTS chat_messages (
            id                TEXT PRIMARY KEY,
            author_id         TEXT NOT NULL REFERENCES users(id),
            text              TEXT NOT NULL,
            kind              TEXT NOT NULL CHECK (kind IN ('text', 'place_notification', 'pin_notification')),
            related_place_id  TEXT,
            related_pin_id    TEXT,
            created_at        TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_chat_messages_created
            ON chat_messages(created_at);

        CREATE TABLE IF NOT EXISTS radius_votes (
            id          TEXT PRIMARY KEY,
            voter_id    TEXT NOT NULL REFERENCES users(id),
            message_id  TEXT NOT NULL REFERENCES chat_messages(id),
            bucket      TEXT NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(voter_id, message_id)
        );

        CREATE INDEX IF NOT EXISTS idx_radius_votes_message
            ON radius_votes(message_id);

        CREATE TABLE IF NOT EXISTS user_locations (
            user_id     TEXT PRIMARY KEY REFERENCES users(id),
            latitude    REAL NOT NULL,
            longitude   REAL NOT NULL,
            updated_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
