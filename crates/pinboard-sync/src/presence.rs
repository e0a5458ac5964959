use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use pinboard_db::Store;
use pinboard_types::api::LocationUpdate;

/// One position fix from the device.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct GeoSample {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GeoError {
    #[error("location permission denied")]
    PermissionDenied,
    #[error("position unavailable: {0}")]
    Unavailable(String),
    #[error("timed out waiting for a position")]
    Timeout,
}

#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Minimum time between two upserts. Zero sends every sample.
    pub min_interval: Duration,
    /// Samples older than this are dropped.
    pub maximum_age: Duration,
    /// A warning is logged when no sample arrives for this long.
    pub timeout: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::ZERO,
            maximum_age: Duration::from_secs(5),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Publishes the local user's position to the live-location table.
pub struct PresenceBroadcaster;

impl PresenceBroadcaster {
    /// Start broadcasting samples from `samples` as `user_id`.
    ///
    /// Every accepted sample overwrites the user's single location row.
    /// `PermissionDenied` ends the broadcast without surfacing an error;
    /// other sample errors and failed upserts are logged and skipped.
    pub fn spawn<S>(store: Store, user_id: Uuid, samples: S, config: PresenceConfig) -> PresenceHandle
    where
        S: Stream<Item = Result<GeoSample, GeoError>> + Send + Unpin + 'static,
    {
        let token = CancellationToken::new();
        let task = tokio::spawn(run(store, user_id, samples, config, token.clone()));
        PresenceHandle { token, task: Some(task) }
    }
}

async fn run<S>(store: Store, user_id: Uuid, mut samples: S, config: PresenceConfig, token: CancellationToken)
where
    S: Stream<Item = Result<GeoSample, GeoError>> + Unpin,
{
    let mut last_sent: Option<Instant> = None;
    let mut sent = 0usize;

    loop {
        let next = tokio::select! {
            _ = token.cancelled() => break,
            next = tokio::time::timeout(config.timeout, samples.next()) => next,
        };

        let sample = match next {
            Err(_) => {
                warn!("{}", GeoError::Timeout);
                continue;
            }
            Ok(None) => {
                debug!("Position stream for {} ended", user_id);
                break;
            }
            Ok(Some(Err(GeoError::PermissionDenied))) => {
                info!("Location permission denied for {}, presence stopped", user_id);
                break;
            }
            Ok(Some(Err(e))) => {
                warn!("Skipping position sample: {}", e);
                continue;
            }
            Ok(Some(Ok(sample))) => sample,
        };

        if is_stale(&sample, config.maximum_age) {
            debug!("Dropping stale sample from {}", sample.timestamp);
            continue;
        }
        if last_sent.is_some_and(|at| at.elapsed() < config.min_interval) {
            continue;
        }

        let update = LocationUpdate {
            user_id,
            latitude: sample.latitude,
            longitude: sample.longitude,
        };
        match store.upsert_location(update).await {
            Ok(_) => {
                last_sent = Some(Instant::now());
                sent += 1;
            }
            Err(e) => warn!("Failed to publish location for {}: {:#}", user_id, e),
        }
    }

    debug!("Presence for {} finished after {} updates", user_id, sent);
}

fn is_stale(sample: &GeoSample, maximum_age: Duration) -> bool {
    // a timestamp in the future is not stale
    (Utc::now() - sample.timestamp)
        .to_std()
        .is_ok_and(|age| age > maximum_age)
}

/// Running broadcast. Dropping the handle stops it.
pub struct PresenceHandle {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl PresenceHandle {
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(|t| t.is_finished())
    }

    /// Stop sampling and wait for the task to exit.
    pub async fn stop(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    /// Wait until the sample stream ends or permission is denied.
    pub async fn finished(mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for PresenceHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
