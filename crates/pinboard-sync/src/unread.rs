//! Per-user "last seen message" watermark and the unread count derived from it.
//!
//! The watermark lives only on this client. It is never written to the store.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use pinboard_types::models::ChatMessage;

use crate::debounce::Debouncer;
use crate::reconciler::Reconciler;

/// Number of messages after the watermark. Without a watermark, or with one
/// that is not in the list, every message counts.
pub fn compute_unread(message_ids: &[Uuid], watermark: Option<Uuid>) -> usize {
    let Some(seen) = watermark else {
        return message_ids.len();
    };
    match message_ids.iter().position(|id| *id == seen) {
        Some(pos) => message_ids.len() - pos - 1,
        None => message_ids.len(),
    }
}

pub trait WatermarkStore: Send + Sync {
    fn load(&self, user_id: Uuid) -> Result<Option<Uuid>>;
    fn save(&self, user_id: Uuid, message_id: Uuid) -> Result<()>;
}

#[derive(Serialize, Deserialize)]
struct WatermarkFile {
    user_id: Uuid,
    last_seen_message_id: Uuid,
}

/// One small JSON file per user in a local directory.
pub struct FileWatermarks {
    dir: PathBuf,
}

impl FileWatermarks {
    pub fn new(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path(&self, user_id: Uuid) -> PathBuf {
        self.dir.join(format!("last_seen_{}.json", user_id))
    }
}

impl WatermarkStore for FileWatermarks {
    fn load(&self, user_id: Uuid) -> Result<Option<Uuid>> {
        let path = self.path(user_id);
        match std::fs::read(&path) {
            Ok(bytes) => {
                let file: WatermarkFile = serde_json::from_slice(&bytes)?;
                Ok(Some(file.last_seen_message_id))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, user_id: Uuid, message_id: Uuid) -> Result<()> {
        let file = WatermarkFile {
            user_id,
            last_seen_message_id: message_id,
        };
        let tmp = self.path(user_id).with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec(&file)?)?;
        std::fs::rename(&tmp, self.path(user_id))?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryWatermarks {
    seen: Mutex<HashMap<Uuid, Uuid>>,
}

impl WatermarkStore for MemoryWatermarks {
    fn load(&self, user_id: Uuid) -> Result<Option<Uuid>> {
        let seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(seen.get(&user_id).copied())
    }

    fn save(&self, user_id: Uuid, message_id: Uuid) -> Result<()> {
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        seen.insert(user_id, message_id);
        Ok(())
    }
}

/// Tracks the unread count for one user and publishes it on a watch channel.
pub struct UnreadTracker {
    user_id: Uuid,
    watermarks: Arc<dyn WatermarkStore>,
    watermark: Option<Uuid>,
    recount: Debouncer,
    count: Arc<watch::Sender<usize>>,
}

impl UnreadTracker {
    pub fn new(user_id: Uuid, watermarks: Arc<dyn WatermarkStore>, quiet_period: Duration) -> Self {
        let watermark = watermarks.load(user_id).unwrap_or_else(|e| {
            warn!("Could not read watermark for {}: {:#}", user_id, e);
            None
        });
        let (count, _) = watch::channel(0);
        Self {
            user_id,
            watermarks,
            watermark,
            recount: Debouncer::new(quiet_period),
            count: Arc::new(count),
        }
    }

    pub fn watermark(&self) -> Option<Uuid> {
        self.watermark
    }

    pub fn unread(&self) -> usize {
        *self.count.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.count.subscribe()
    }

    /// Persist `message_id` as the last message this user has seen.
    pub fn mark_seen(&mut self, message_id: Uuid) -> Result<()> {
        self.watermarks.save(self.user_id, message_id)?;
        self.watermark = Some(message_id);
        debug!("{} has seen up to {}", self.user_id, message_id);
        Ok(())
    }

    /// Mark the newest message in the window as seen and reset the count.
    /// A window with no confirmed messages leaves the watermark alone.
    pub fn mark_latest_seen(&mut self, messages: &Reconciler<ChatMessage>) -> Result<()> {
        self.recount.cancel();
        if let Some(last) = messages.confirmed().last() {
            self.mark_seen(last.id)?;
        }
        self.recount_now(messages);
        Ok(())
    }

    pub fn recount_now(&self, messages: &Reconciler<ChatMessage>) {
        let ids = message_ids(messages);
        self.count.send_replace(compute_unread(&ids, self.watermark));
    }

    /// Recount after the quiet period. Bursts of new messages recount once.
    pub fn schedule_recount(&mut self, messages: &Reconciler<ChatMessage>) {
        let ids = message_ids(messages);
        let watermark = self.watermark;
        let count = self.count.clone();
        self.recount.schedule(async move {
            count.send_replace(compute_unread(&ids, watermark));
        });
    }
}

fn message_ids(messages: &Reconciler<ChatMessage>) -> Vec<Uuid> {
    messages.confirmed().map(|m| m.id).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pinboard_types::models::MessageKind;

    fn message(id: Uuid) -> ChatMessage {
        ChatMessage {
            id,
            author_id: Uuid::nil(),
            text: "hi".into(),
            kind: MessageKind::Text,
            related_place_id: None,
            related_pin_id: None,
            created_at: Utc::now(),
        }
    }

    fn window(ids: &[Uuid]) -> Reconciler<ChatMessage> {
        let mut r = Reconciler::new();
        r.load_snapshot(ids.iter().copied().map(message).collect());
        r
    }

    #[test]
    fn counts_after_watermark() {
        let ids: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();

        assert_eq!(compute_unread(&ids, Some(ids[1])), 2);
        assert_eq!(compute_unread(&ids, None), 4);
        assert_eq!(compute_unread(&ids, Some(ids[3])), 0);
        assert_eq!(compute_unread(&[], None), 0);
    }

    #[test]
    fn unknown_watermark_counts_everything() {
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        assert_eq!(compute_unread(&ids, Some(Uuid::new_v4())), 3);
    }

    #[tokio::test]
    async fn mark_latest_seen_zeroes_count() {
        let ids: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
        let messages = window(&ids);
        let mut tracker = UnreadTracker::new(Uuid::new_v4(), Arc::new(MemoryWatermarks::default()), Duration::from_millis(300));

        tracker.recount_now(&messages);
        assert_eq!(tracker.unread(), 4);

        tracker.mark_latest_seen(&messages).unwrap();
        assert_eq!(tracker.watermark(), Some(ids[3]));
        assert_eq!(tracker.unread(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn recount_is_debounced() {
        let mut ids: Vec<Uuid> = (0..2).map(|_| Uuid::new_v4()).collect();
        let mut tracker = UnreadTracker::new(Uuid::new_v4(), Arc::new(MemoryWatermarks::default()), Duration::from_millis(300));
        tracker.mark_seen(ids[1]).unwrap();
        let mut rx = tracker.subscribe();

        for _ in 0..3 {
            ids.push(Uuid::new_v4());
            tracker.schedule_recount(&window(&ids));
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(*rx.borrow_and_update(), 0);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 3);
    }

    #[test]
    fn file_watermark_survives_restart() {
        let dir = std::env::temp_dir().join(format!("pinboard-watermarks-{}", Uuid::new_v4()));
        let user = Uuid::new_v4();
        let seen = Uuid::new_v4();

        let store = FileWatermarks::new(dir.clone()).unwrap();
        assert_eq!(store.load(user).unwrap(), None);
        store.save(user, seen).unwrap();

        let reopened = FileWatermarks::new(dir).unwrap();
        assert_eq!(reopened.load(user).unwrap(), Some(seen));
        assert_eq!(reopened.load(Uuid::new_v4()).unwrap(), None);
    }
}
