use std::sync::Arc;

use anyhow::{Result, anyhow};
use tracing::{debug, error, info};
use uuid::Uuid;

use pinboard_feed::{ChangeFeed, Subscription};
use pinboard_types::api::{LocationUpdate, NewMessage, NewPin, NewPlace, NewUser, NewVote};
use pinboard_types::events::{ChangeEvent, EventMask, Row, Table};
use pinboard_types::models::{ChatMessage, LiveLocation, Pin, Place, User, Vote};

use crate::storage::ObjectStorage;
use crate::{Database, queries};

/// Durable row store with a change feed and object storage.
///
/// Every committed write publishes its change event while the connection is
/// still held, so a subscriber sees events for one table in commit order.
/// All methods run the blocking SQLite work off the async runtime.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    db: Database,
    feed: ChangeFeed,
    objects: Option<ObjectStorage>,
}

impl Store {
    pub fn new(db: Database, objects: Option<ObjectStorage>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                db,
                feed: ChangeFeed::new(),
                objects,
            }),
        }
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(Database::open_in_memory()?, None))
    }

    pub fn feed(&self) -> &ChangeFeed {
        &self.inner.feed
    }

    pub fn subscribe(&self, table: Table, mask: EventMask) -> Subscription {
        self.inner.feed.subscribe(table, mask)
    }

    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&StoreInner) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| {
                error!("spawn_blocking join error: {}", e);
                anyhow!("store task failed: {}", e)
            })?
    }

    // -- Users --

    pub async fn insert_user(&self, user: NewUser) -> Result<User> {
        self.blocking(move |s| s.db.with_conn(|conn| queries::insert_user(conn, &user)?.into_model()))
            .await
    }

    /// Insert the user unless a row with this id already exists.
    pub async fn ensure_user(&self, user: NewUser) -> Result<User> {
        self.blocking(move |s| {
            s.db.with_conn(|conn| match queries::get_user(conn, &user.id.to_string())? {
                Some(row) => row.into_model(),
                None => {
                    info!("Registering user {} ({})", user.username, user.id);
                    queries::insert_user(conn, &user)?.into_model()
                }
            })
        })
        .await
    }

    pub async fn select_users(&self) -> Result<Vec<User>> {
        self.blocking(|s| {
            s.db.with_conn(|conn| {
                queries::list_users(conn)?
                    .into_iter()
                    .map(|r| r.into_model())
                    .collect()
            })
        })
        .await
    }

    // -- Places --

    pub async fn insert_place(&self, place: NewPlace) -> Result<Place> {
        self.blocking(move |s| {
            s.db.with_conn(|conn| {
                let created = queries::insert_place(conn, &Uuid::new_v4().to_string(), &place)?.into_model()?;
                s.feed.publish(ChangeEvent::insert(Row::Place(created.clone())));
                Ok(created)
            })
        })
        .await
    }

    pub async fn get_place(&self, id: Uuid) -> Result<Option<Place>> {
        self.blocking(move |s| {
            s.db.with_conn(|conn| queries::get_place(conn, &id.to_string())?.map(|r| r.into_model()).transpose())
        })
        .await
    }

    pub async fn select_places(&self) -> Result<Vec<Place>> {
        self.blocking(|s| {
            s.db.with_conn(|conn| {
                queries::list_places(conn)?
                    .into_iter()
                    .map(|r| r.into_model())
                    .collect()
            })
        })
        .await
    }

    /// Delete a place and the pins attached to it, if `owner_id` owns the
    /// place. Returns false when no such place is owned by `owner_id`.
    pub async fn delete_place(&self, id: Uuid, owner_id: Uuid) -> Result<bool> {
        self.blocking(move |s| {
            s.db.with_conn_mut(|conn| {
                let Some(place) = queries::get_place(conn, &id.to_string())? else {
                    return Ok(false);
                };
                let place = place.into_model()?;
                if place.owner_id != owner_id {
                    return Ok(false);
                }

                let tx = conn.transaction()?;
                let pins = queries::list_pins_for_place(&tx, &id.to_string())?
                    .into_iter()
                    .map(|r| r.into_model())
                    .collect::<Result<Vec<Pin>>>()?;
                for pin in &pins {
                    queries::delete_pin(&tx, &pin.id.to_string())?;
                }
                queries::delete_place(&tx, &id.to_string())?;
                tx.commit()?;

                for pin in pins {
                    s.feed.publish(ChangeEvent::delete(Row::Pin(pin)));
                }
                s.feed.publish(ChangeEvent::delete(Row::Place(place)));
                Ok(true)
            })
        })
        .await
    }

    // -- Pins --

    pub async fn insert_pin(&self, pin: NewPin) -> Result<Pin> {
        self.blocking(move |s| {
            s.db.with_conn(|conn| {
                let created = queries::insert_pin(conn, &Uuid::new_v4().to_string(), &pin)?.into_model()?;
                s.feed.publish(ChangeEvent::insert(Row::Pin(created.clone())));
                Ok(created)
            })
        })
        .await
    }

    pub async fn get_pin(&self, id: Uuid) -> Result<Option<Pin>> {
        self.blocking(move |s| {
            s.db.with_conn(|conn| queries::get_pin(conn, &id.to_string())?.map(|r| r.into_model()).transpose())
        })
        .await
    }

    pub async fn select_pins(&self) -> Result<Vec<Pin>> {
        self.blocking(|s| {
            s.db.with_conn(|conn| {
                queries::list_pins(conn)?
                    .into_iter()
                    .map(|r| r.into_model())
                    .collect()
            })
        })
        .await
    }

    /// Write a consensus radius. Returns true only if the stored value
    /// changed; an unchanged value publishes nothing.
    pub async fn update_pin_radius(&self, id: Uuid, radius_meters: u32) -> Result<bool> {
        self.blocking(move |s| {
            s.db.with_conn(|conn| {
                let key = id.to_string();
                let before = queries::get_pin(conn, &key)?.map(|r| r.into_model()).transpose()?;
                if !queries::update_pin_radius(conn, &key, radius_meters)? {
                    return Ok(false);
                }
                let after = queries::get_pin(conn, &key)?
                    .ok_or_else(|| anyhow!("pin {} vanished during update", id))?
                    .into_model()?;
                debug!("Pin {} radius set to {}m", id, radius_meters);
                s.feed.publish(ChangeEvent::update(before.map(Row::Pin), Row::Pin(after)));
                Ok(true)
            })
        })
        .await
    }

    /// Delete a pin if `owner_id` owns it. Returns false otherwise.
    pub async fn delete_pin(&self, id: Uuid, owner_id: Uuid) -> Result<bool> {
        self.blocking(move |s| {
            s.db.with_conn(|conn| {
                let Some(pin) = queries::get_pin(conn, &id.to_string())? else {
                    return Ok(false);
                };
                let pin = pin.into_model()?;
                if pin.owner_id != owner_id || !queries::delete_pin(conn, &id.to_string())? {
                    return Ok(false);
                }
                s.feed.publish(ChangeEvent::delete(Row::Pin(pin)));
                Ok(true)
            })
        })
        .await
    }

    // -- Chat messages --

    pub async fn insert_message(&self, message: NewMessage) -> Result<ChatMessage> {
        self.blocking(move |s| {
            s.db.with_conn(|conn| {
                let created =
                    queries::insert_message(conn, &Uuid::new_v4().to_string(), &message)?.into_model()?;
                s.feed.publish(ChangeEvent::insert(Row::Message(created.clone())));
                Ok(created)
            })
        })
        .await
    }

    /// The most recent `limit` messages, oldest first.
    pub async fn select_messages(&self, limit: u32) -> Result<Vec<ChatMessage>> {
        self.blocking(move |s| {
            s.db.with_conn(|conn| {
                queries::list_recent_messages(conn, limit)?
                    .into_iter()
                    .map(|r| r.into_model())
                    .collect()
            })
        })
        .await
    }

    // -- Radius votes --

    pub async fn insert_vote(&self, vote: NewVote) -> Result<Vote> {
        self.blocking(move |s| {
            s.db.with_conn(|conn| {
                let created = queries::insert_vote(conn, &Uuid::new_v4().to_string(), &vote)?.into_model()?;
                s.feed.publish(ChangeEvent::insert(Row::Vote(created.clone())));
                Ok(created)
            })
        })
        .await
    }

    pub async fn select_votes(&self) -> Result<Vec<Vote>> {
        self.blocking(|s| {
            s.db.with_conn(|conn| {
                queries::list_votes(conn)?
                    .into_iter()
                    .map(|r| r.into_model())
                    .collect()
            })
        })
        .await
    }

    // -- Live locations --

    /// Overwrite the user's presence row. The first write is an INSERT
    /// event, every later one an UPDATE.
    pub async fn upsert_location(&self, update: LocationUpdate) -> Result<LiveLocation> {
        self.blocking(move |s| {
            s.db.with_conn(|conn| {
                let key = update.user_id.to_string();
                let before = queries::get_location(conn, &key)?.map(|r| r.into_model()).transpose()?;
                let after = queries::upsert_location(conn, &update)?.into_model()?;
                let event = match before {
                    Some(old) => ChangeEvent::update(Some(Row::Location(old)), Row::Location(after.clone())),
                    None => ChangeEvent::insert(Row::Location(after.clone())),
                };
                s.feed.publish(event);
                Ok(after)
            })
        })
        .await
    }

    pub async fn select_locations(&self) -> Result<Vec<LiveLocation>> {
        self.blocking(|s| {
            s.db.with_conn(|conn| {
                queries::list_locations(conn)?
                    .into_iter()
                    .map(|r| r.into_model())
                    .collect()
            })
        })
        .await
    }

    // -- Object storage --

    fn objects(&self) -> Result<&ObjectStorage> {
        self.inner
            .objects
            .as_ref()
            .ok_or_else(|| anyhow!("object storage is not configured"))
    }

    pub async fn upload(&self, bucket: &str, path: &str, blob: &[u8]) -> Result<()> {
        self.objects()?.upload(bucket, path, blob).await
    }

    pub fn public_url(&self, bucket: &str, path: &str) -> Result<String> {
        Ok(self.objects()?.public_url(bucket, path))
    }

    pub async fn remove(&self, bucket: &str, paths: &[String]) -> Result<()> {
        self.objects()?.remove(bucket, paths).await
    }

    /// Object path behind a public URL of this store, if it is one.
    pub fn object_path(&self, bucket: &str, url: &str) -> Option<String> {
        self.inner.objects.as_ref()?.path_from_public_url(bucket, url)
    }
}
