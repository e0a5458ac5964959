pub mod avatar;
pub mod chat;
pub mod consensus;
pub mod debounce;
pub mod error;
pub mod geocode;
pub mod map;
pub mod presence;
pub mod reconciler;
pub mod unread;

use std::time::Duration;

pub use chat::{ChatSurface, ChatUpdate};
pub use consensus::VoteConsensus;
pub use error::Result;
pub use geocode::Geocoder;
pub use map::{MapSurface, MapUpdate};
pub use presence::{PresenceBroadcaster, PresenceConfig, PresenceHandle};
pub use reconciler::{EntryKey, Reconciler};
pub use unread::{FileWatermarks, UnreadTracker};

/// Timings and limits shared by the surfaces.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Quiet period before consensus radii are written back.
    pub radius_debounce: Duration,
    /// Quiet period before the unread count is recomputed.
    pub unread_debounce: Duration,
    /// Number of most recent chat messages kept in the window.
    pub message_window: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            radius_debounce: Duration::from_millis(500),
            unread_debounce: Duration::from_millis(300),
            message_window: 50,
        }
    }
}
