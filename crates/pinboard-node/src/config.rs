use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use uuid::Uuid;

const DEFAULT_GEOCODER_URL: &str = "https://nominatim.openstreetmap.org";

/// Node settings, read from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub storage_dir: PathBuf,
    pub public_url: String,
    pub user_id: Uuid,
    pub username: String,
    /// `None` disables geocoding.
    pub geocoder_url: Option<String>,
    pub user_agent: String,
    pub watermark_dir: PathBuf,
    pub radius_debounce: Duration,
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.into())
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let user_id = std::env::var("PINBOARD_USER_ID")
            .context("PINBOARD_USER_ID must be set")?
            .parse()
            .context("PINBOARD_USER_ID is not a UUID")?;
        let geocoder_url = var_or("PINBOARD_GEOCODER_URL", DEFAULT_GEOCODER_URL);
        let radius_debounce_ms: u64 = var_or("PINBOARD_RADIUS_DEBOUNCE_MS", "500")
            .parse()
            .context("PINBOARD_RADIUS_DEBOUNCE_MS is not a number")?;

        Ok(Self {
            db_path: var_or("PINBOARD_DB_PATH", "pinboard.db").into(),
            storage_dir: var_or("PINBOARD_STORAGE_DIR", "./storage").into(),
            public_url: var_or("PINBOARD_PUBLIC_URL", "http://localhost:8080/storage"),
            user_id,
            username: var_or("PINBOARD_USERNAME", "anonymous"),
            geocoder_url: Some(geocoder_url).filter(|u| !u.trim().is_empty()),
            user_agent: var_or("PINBOARD_USER_AGENT", concat!("pinboard/", env!("CARGO_PKG_VERSION"))),
            watermark_dir: var_or("PINBOARD_WATERMARK_DIR", "./watermarks").into(),
            radius_debounce: Duration::from_millis(radius_debounce_ms),
        })
    }
}
