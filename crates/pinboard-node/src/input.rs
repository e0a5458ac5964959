use std::path::{Path, PathBuf};

use futures_util::Stream;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use uuid::Uuid;

use pinboard_sync::map::ImageUpload;
use pinboard_sync::presence::{GeoError, GeoSample};
use pinboard_types::models::RadiusBucket;

/// One JSON line on stdin.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Input {
    Position(GeoSample),
    PositionError { reason: String },
    PermissionDenied,
    Open,
    Close,
    Say { text: String },
    Vote { message_id: Uuid, bucket: RadiusBucket },
    Place { name: String, color: Option<String>, image: PathBuf },
    Pin {
        title: String,
        description: Option<String>,
        latitude: f64,
        longitude: f64,
        place_id: Uuid,
        radius_meters: Option<u32>,
        camera_image: Option<PathBuf>,
    },
    DeletePin { pin_id: Uuid },
    DeletePlace { place_id: Uuid },
    Search { query: String },
    Ranking,
    Quit,
}

impl Input {
    /// Geolocation inputs go to the presence broadcaster, not the surfaces.
    pub fn into_sample(self) -> Result<Result<GeoSample, GeoError>, Self> {
        match self {
            Input::Position(sample) => Ok(Ok(sample)),
            Input::PositionError { reason } => Ok(Err(GeoError::Unavailable(reason))),
            Input::PermissionDenied => Ok(Err(GeoError::PermissionDenied)),
            other => Err(other),
        }
    }
}

/// Parsed stdin lines. Malformed lines are logged and skipped.
pub fn stdin_inputs() -> impl Stream<Item = Input> {
    async_stream::stream! {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match serde_json::from_str::<Input>(&line) {
                    Ok(input) => yield input,
                    Err(e) => warn!("Ignoring input line: {}", e),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!("stdin read failed: {}", e);
                    break;
                }
            }
        }
    }
}

pub async fn read_image(path: &Path) -> anyhow::Result<ImageUpload> {
    let bytes = tokio::fs::read(path).await?;
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("jpg")
        .to_lowercase();
    Ok(ImageUpload { bytes, extension })
}
