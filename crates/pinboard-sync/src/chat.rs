use std::collections::HashSet;
use std::future::pending;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use pinboard_db::Store;
use pinboard_feed::{FeedMessage, Subscription};
use pinboard_types::SyncError;
use pinboard_types::api::NewMessage;
use pinboard_types::events::{ChangeEvent, EventMask, Table};
use pinboard_types::models::{ChatMessage, MessageKind, RadiusBucket, Vote};

use crate::SyncConfig;
use crate::consensus::{self, BucketTally, VoteConsensus};
use crate::error::{Result, from_store};
use crate::reconciler::Reconciler;
use crate::unread::{UnreadTracker, WatermarkStore};

/// What `ChatSurface::next_change` applied.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatUpdate {
    Message(ChangeEvent),
    Vote(ChangeEvent),
    /// The feed reconnected and the table was reloaded from the store.
    Reloaded(Table),
}

/// The shared chat: message window, votes on pin notifications, unread count.
///
/// Messages are followed for as long as the surface exists so the unread
/// count stays current. Votes are only followed while the chat is open.
/// Dropping the surface releases every subscription and pending timer.
pub struct ChatSurface {
    store: Store,
    user_id: Uuid,
    window: u32,
    messages: Reconciler<ChatMessage>,
    votes: Reconciler<Vote>,
    message_sub: Subscription,
    vote_sub: Option<Subscription>,
    /// Tables whose feed reported a gap and that still await a reload.
    stale: HashSet<Table>,
    consensus: VoteConsensus,
    unread: UnreadTracker,
}

impl ChatSurface {
    pub async fn activate(
        store: Store,
        user_id: Uuid,
        watermarks: Arc<dyn WatermarkStore>,
        config: &SyncConfig,
    ) -> Result<Self> {
        // subscribe before the snapshot so nothing committed in between is lost
        let message_sub = store.subscribe(Table::ChatMessages, EventMask::ALL);
        let mut messages = Reconciler::new();
        messages.load_snapshot(store.select_messages(config.message_window).await.map_err(from_store)?);

        let unread = UnreadTracker::new(user_id, watermarks, config.unread_debounce);
        unread.recount_now(&messages);
        debug!("Chat active for {} with {} messages", user_id, messages.len());

        Ok(Self {
            consensus: VoteConsensus::new(store.clone(), config.radius_debounce),
            store,
            user_id,
            window: config.message_window,
            messages,
            votes: Reconciler::new(),
            message_sub,
            vote_sub: None,
            stale: HashSet::new(),
            unread,
        })
    }

    pub fn is_open(&self) -> bool {
        self.vote_sub.is_some()
    }

    /// Open the chat: follow votes, mark everything seen, start radius
    /// write-back.
    pub async fn open(&mut self) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        let vote_sub = self.store.subscribe(Table::RadiusVotes, EventMask::ALL);
        self.reload_votes().await?;
        self.vote_sub = Some(vote_sub);
        if let Err(e) = self.unread.mark_latest_seen(&self.messages) {
            warn!("Could not store watermark for {}: {:#}", self.user_id, e);
        }
        self.consensus.schedule_write_back(&self.messages, &self.votes);
        Ok(())
    }

    /// Stop following votes and drop any pending radius write.
    pub fn close(&mut self) {
        if let Some(mut sub) = self.vote_sub.take() {
            sub.close();
        }
        self.stale.remove(&Table::RadiusVotes);
        self.consensus.cancel_write_back();
        self.unread.recount_now(&self.messages);
    }

    async fn reload_messages(&mut self) -> Result<()> {
        let rows = self.store.select_messages(self.window).await.map_err(from_store)?;
        self.messages.load_snapshot(rows);
        self.stale.remove(&Table::ChatMessages);
        Ok(())
    }

    async fn reload_votes(&mut self) -> Result<()> {
        let rows = self.store.select_votes().await.map_err(from_store)?;
        self.votes.load_snapshot(rows);
        self.stale.remove(&Table::RadiusVotes);
        Ok(())
    }

    async fn resync(&mut self, table: Table) -> Result<ChatUpdate> {
        match table {
            Table::ChatMessages => self.reload_messages().await?,
            _ => self.reload_votes().await?,
        }
        self.after_change(table);
        Ok(ChatUpdate::Reloaded(table))
    }

    /// Wait for the next change on a followed table and apply it. `None`
    /// once the subscriptions are gone.
    ///
    /// Cancel safe: a reload interrupted by dropping the future is picked up
    /// again by the next call.
    pub async fn next_change(&mut self) -> Option<Result<ChatUpdate>> {
        if let Some(&table) = self.stale.iter().next() {
            return Some(self.resync(table).await);
        }

        let (table, item) = tokio::select! {
            item = self.message_sub.next() => (Table::ChatMessages, item),
            item = next_or_pending(&mut self.vote_sub) => (Table::RadiusVotes, item),
        };

        let update = match (table, item?) {
            (Table::ChatMessages, FeedMessage::Change(event)) => {
                self.messages.apply_event(event.clone());
                self.messages.retain_latest(self.window as usize);
                ChatUpdate::Message(event)
            }
            (_, FeedMessage::Change(event)) => {
                self.votes.apply_event(event.clone());
                ChatUpdate::Vote(event)
            }
            (_, FeedMessage::Resync) => {
                self.stale.insert(table);
                return Some(self.resync(table).await);
            }
        };

        self.after_change(table);
        Some(Ok(update))
    }

    fn after_change(&mut self, table: Table) {
        if table == Table::ChatMessages {
            if self.is_open() {
                if let Err(e) = self.unread.mark_latest_seen(&self.messages) {
                    warn!("Could not store watermark for {}: {:#}", self.user_id, e);
                }
            } else {
                self.unread.schedule_recount(&self.messages);
            }
        }
        if self.is_open() {
            self.consensus.schedule_write_back(&self.messages, &self.votes);
        }
    }

    /// Send a text message, shown immediately and replaced by the stored
    /// row once the write succeeds.
    pub async fn send_text(&mut self, text: &str) -> Result<ChatMessage> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SyncError::WriteRejected("message is empty".into()));
        }

        let temp_id = Uuid::new_v4();
        self.messages.apply_optimistic(
            temp_id,
            ChatMessage {
                id: temp_id,
                author_id: self.user_id,
                text: text.to_string(),
                kind: MessageKind::Text,
                related_place_id: None,
                related_pin_id: None,
                created_at: Utc::now(),
            },
        );

        match self.store.insert_message(NewMessage::text(self.user_id, text)).await {
            Ok(message) => {
                self.messages.reconcile_optimistic(temp_id, message.id, message.clone());
                self.messages.retain_latest(self.window as usize);
                info!("{} sent message {}", self.user_id, message.id);
                Ok(message)
            }
            Err(e) => {
                self.messages.rollback_optimistic(temp_id);
                warn!("Sending message failed: {:#}", e);
                Err(from_store(e))
            }
        }
    }

    pub async fn cast_vote(&mut self, message_id: Uuid, bucket: RadiusBucket) -> Result<Vote> {
        if !self.is_open() {
            return Err(SyncError::SurfaceClosed);
        }
        if self
            .messages
            .get(&message_id)
            .is_some_and(|m| m.kind != MessageKind::PinNotification)
        {
            return Err(SyncError::WriteRejected(format!("message {} does not take votes", message_id)));
        }
        let vote = self
            .consensus
            .cast_vote(&mut self.votes, self.user_id, message_id, bucket)
            .await?;
        self.consensus.schedule_write_back(&self.messages, &self.votes);
        Ok(vote)
    }

    pub fn tally(&self, message_id: Uuid) -> Vec<BucketTally> {
        consensus::tally(self.votes.iter(), message_id, self.user_id)
    }

    /// Tallies for every pin notification in the window.
    pub fn tallies(&self) -> Vec<(Uuid, Vec<BucketTally>)> {
        self.messages
            .iter()
            .filter(|m| m.kind == MessageKind::PinNotification)
            .map(|m| (m.id, self.tally(m.id)))
            .collect()
    }

    pub fn messages(&self) -> &Reconciler<ChatMessage> {
        &self.messages
    }

    pub fn votes(&self) -> &Reconciler<Vote> {
        &self.votes
    }

    pub fn unread(&self) -> usize {
        self.unread.unread()
    }

    pub fn unread_updates(&self) -> watch::Receiver<usize> {
        self.unread.subscribe()
    }

    pub fn write_back_pending(&self) -> bool {
        self.consensus.write_back_pending()
    }
}

async fn next_or_pending(sub: &mut Option<Subscription>) -> Option<FeedMessage> {
    match sub {
        Some(sub) => sub.next().await,
        None => pending().await,
    }
}
