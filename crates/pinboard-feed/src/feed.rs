use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, Weak};

use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use pinboard_types::events::{ChangeEvent, EventMask, Table};

/// Item delivered to a subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    Change(ChangeEvent),
    /// The transport reconnected and events may have been missed. The owner
    /// must reload a full snapshot of the table.
    Resync,
}

struct Subscriber {
    table: Table,
    mask: EventMask,
    tx: mpsc::UnboundedSender<FeedMessage>,
}

/// Fans committed row changes out to per-table subscriptions.
#[derive(Clone)]
pub struct ChangeFeed {
    inner: Arc<FeedInner>,
}

struct FeedInner {
    /// subscription_id -> subscriber
    subscribers: RwLock<HashMap<Uuid, Subscriber>>,
}

impl FeedInner {
    fn remove(&self, id: Uuid) -> bool {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }
}

impl ChangeFeed {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FeedInner {
                subscribers: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe to the change kinds in `mask` for one table.
    pub fn subscribe(&self, table: Table, mask: EventMask) -> Subscription {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Subscriber { table, mask, tx });

        debug!("Subscription {} opened on {}", id, table);
        Subscription {
            id,
            table,
            rx,
            feed: Arc::downgrade(&self.inner),
            closed: false,
        }
    }

    /// Release a subscription. Equivalent to dropping the handle.
    pub fn unsubscribe(&self, mut subscription: Subscription) {
        subscription.close();
    }

    /// Deliver an event to every matching subscription, in call order.
    pub fn publish(&self, event: ChangeEvent) {
        let subscribers = self
            .inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        for sub in subscribers.values() {
            if sub.table == event.table && sub.mask.contains(event.kind) {
                let _ = sub.tx.send(FeedMessage::Change(event.clone()));
            }
        }
    }

    /// Tell every subscription that delivery may have had a gap.
    pub fn mark_reconnected(&self) {
        let subscribers = self
            .inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        info!("Change feed reconnected, requesting resync of {} subscriptions", subscribers.len());
        for sub in subscribers.values() {
            let _ = sub.tx.send(FeedMessage::Resync);
        }
    }

    /// Number of live subscriptions, across all tables.
    pub fn subscription_count(&self) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

/// Scoped handle for one table subscription.
///
/// The upstream registration is released by `close()` or on drop, whichever
/// comes first. Once closed, nothing further is yielded, including events
/// that were queued before the close.
pub struct Subscription {
    id: Uuid,
    table: Table,
    rx: mpsc::UnboundedReceiver<FeedMessage>,
    feed: Weak<FeedInner>,
    closed: bool,
}

impl Subscription {
    pub fn table(&self) -> Table {
        self.table
    }

    /// Wait for the next message. Returns `None` once closed.
    pub async fn next(&mut self) -> Option<FeedMessage> {
        if self.closed {
            return None;
        }
        self.rx.recv().await
    }

    /// Take the next queued message without waiting.
    pub fn try_next(&mut self) -> Option<FeedMessage> {
        if self.closed {
            return None;
        }
        self.rx.try_recv().ok()
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.rx.close();
        if let Some(feed) = self.feed.upgrade() {
            if feed.remove(self.id) {
                debug!("Subscription {} on {} released", self.id, self.table);
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pinboard_types::events::{ChangeKind, Row};
    use pinboard_types::models::LiveLocation;

    fn location_event(lat: f64) -> ChangeEvent {
        ChangeEvent::insert(Row::Location(LiveLocation {
            user_id: Uuid::new_v4(),
            latitude: lat,
            longitude: 0.0,
            updated_at: Utc::now(),
        }))
    }

    fn latitude(msg: FeedMessage) -> f64 {
        match msg {
            FeedMessage::Change(ChangeEvent {
                new_row: Some(Row::Location(l)),
                ..
            }) => l.latitude,
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let feed = ChangeFeed::new();
        let mut sub = feed.subscribe(Table::UserLocations, EventMask::ALL);

        for i in 0..5 {
            feed.publish(location_event(i as f64));
        }

        for i in 0..5 {
            assert_eq!(latitude(sub.next().await.unwrap()), i as f64);
        }
    }

    #[tokio::test]
    async fn filters_by_table_and_mask() {
        let feed = ChangeFeed::new();
        let mut pins = feed.subscribe(Table::Pins, EventMask::ALL);
        let mut deletes = feed.subscribe(Table::UserLocations, EventMask::only(ChangeKind::Delete));

        feed.publish(location_event(1.0));

        assert!(pins.try_next().is_none());
        assert!(deletes.try_next().is_none());
    }

    #[tokio::test]
    async fn nothing_delivered_after_close() {
        let feed = ChangeFeed::new();
        let mut sub = feed.subscribe(Table::UserLocations, EventMask::ALL);

        feed.publish(location_event(1.0));
        sub.close();
        feed.publish(location_event(2.0));

        assert!(sub.is_closed());
        assert!(sub.try_next().is_none());
        assert!(sub.next().await.is_none());
        assert_eq!(feed.subscription_count(), 0);
    }

    #[test]
    fn drop_releases_registration() {
        let feed = ChangeFeed::new();
        {
            let _a = feed.subscribe(Table::Pins, EventMask::ALL);
            let b = feed.subscribe(Table::Places, EventMask::ALL);
            assert_eq!(feed.subscription_count(), 2);
            feed.unsubscribe(b);
            assert_eq!(feed.subscription_count(), 1);
        }
        assert_eq!(feed.subscription_count(), 0);
    }

    #[tokio::test]
    async fn reconnect_requests_resync() {
        let feed = ChangeFeed::new();
        let mut sub = feed.subscribe(Table::Pins, EventMask::ALL);

        feed.mark_reconnected();

        assert_eq!(sub.next().await, Some(FeedMessage::Resync));
    }

    #[test]
    fn handle_outliving_feed_closes_cleanly() {
        let feed = ChangeFeed::new();
        let mut sub = feed.subscribe(Table::Pins, EventMask::ALL);
        drop(feed);

        assert!(sub.try_next().is_none());
        sub.close();
        assert!(sub.is_closed());
    }
}
