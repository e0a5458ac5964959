use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use pinboard_db::Store;
use pinboard_db::storage::PIN_IMAGES;
use pinboard_feed::{FeedMessage, Subscription};
use pinboard_types::SyncError;
use pinboard_types::api::{Coordinates, DEFAULT_PLACE_COLOR, NewMessage, NewPin, NewPlace};
use pinboard_types::events::{ChangeEvent, ChangeKind, EventMask, Row, Table};
use pinboard_types::models::{LiveLocation, MessageKind, Pin, Place, User};

use crate::avatar::{AvatarCache, user_initials};
use crate::error::{Result, from_store};
use crate::geocode::{Geocoder, UNKNOWN_CITY};
use crate::reconciler::Reconciler;

/// Placeholder for a place that is not loaded or no longer exists.
pub const UNKNOWN_PLACE: &str = "Unknown";

const UNKNOWN_USER: &str = "Unknown";

/// Image bytes picked by the user.
#[derive(Debug, Clone)]
pub struct ImageUpload {
    pub bytes: Vec<u8>,
    /// File extension without the dot, e.g. `jpg`.
    pub extension: String,
}

#[derive(Debug, Clone)]
pub struct PinDraft {
    pub title: String,
    pub description: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub place_id: Uuid,
    pub radius_meters: u32,
    pub camera_image: Option<ImageUpload>,
}

#[derive(Debug, Clone)]
pub struct PlaceDraft {
    pub name: String,
    pub color: Option<String>,
    pub image: ImageUpload,
}

/// One line of the place ranking.
#[derive(Debug, Clone, PartialEq)]
pub struct RankingEntry {
    pub place_id: Uuid,
    pub name: String,
    pub color: String,
    pub image_ref: String,
    pub pin_count: usize,
    pub total_meters: u64,
}

/// Someone currently sharing their position.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveUser {
    pub user_id: Uuid,
    pub username: String,
    pub avatar_url: Option<String>,
    pub initials: String,
    pub latitude: f64,
    pub longitude: f64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MapUpdate {
    Pin(ChangeEvent),
    Place(ChangeEvent),
    Location(ChangeEvent),
    Reloaded(Table),
}

/// The shared map: pins, places and everyone's live position.
pub struct MapSurface {
    store: Store,
    user_id: Uuid,
    geocoder: Option<Geocoder>,
    pins: Reconciler<Pin>,
    places: Reconciler<Place>,
    locations: Reconciler<LiveLocation>,
    users: HashMap<Uuid, User>,
    /// Tables whose feed reported a gap and that still await a reload.
    stale: HashSet<Table>,
    users_stale: bool,
    pin_sub: Subscription,
    place_sub: Subscription,
    location_sub: Subscription,
    avatars: AvatarCache,
}

impl MapSurface {
    pub async fn activate(store: Store, user_id: Uuid, geocoder: Option<Geocoder>) -> Result<Self> {
        let pin_sub = store.subscribe(Table::Pins, EventMask::ALL);
        let place_sub = store.subscribe(Table::Places, EventMask::ALL);
        let location_sub = store.subscribe(Table::UserLocations, EventMask::ALL);

        let mut surface = Self {
            store,
            user_id,
            geocoder,
            pins: Reconciler::new(),
            places: Reconciler::new(),
            locations: Reconciler::new(),
            users: HashMap::new(),
            stale: HashSet::new(),
            users_stale: false,
            pin_sub,
            place_sub,
            location_sub,
            avatars: AvatarCache::new(),
        };
        surface.reload(Table::Pins).await?;
        surface.reload(Table::Places).await?;
        surface.reload(Table::UserLocations).await?;
        debug!(
            "Map active for {}: {} pins, {} places, {} live",
            user_id,
            surface.pins.len(),
            surface.places.len(),
            surface.locations.len()
        );
        Ok(surface)
    }

    async fn reload(&mut self, table: Table) -> Result<()> {
        match table {
            Table::Pins => self.pins.load_snapshot(self.store.select_pins().await.map_err(from_store)?),
            Table::Places => self.places.load_snapshot(self.store.select_places().await.map_err(from_store)?),
            Table::UserLocations => {
                self.locations
                    .load_snapshot(self.store.select_locations().await.map_err(from_store)?);
                self.reload_users().await?;
            }
            other => warn!("Map does not follow {}", other),
        }
        self.stale.remove(&table);
        Ok(())
    }

    async fn reload_users(&mut self) -> Result<()> {
        let users = self.store.select_users().await.map_err(from_store)?;
        self.users = users.into_iter().map(|u| (u.id, u)).collect();
        self.users_stale = false;
        Ok(())
    }

    async fn refresh_users(&mut self) {
        if let Err(e) = self.reload_users().await {
            warn!("Could not refresh users: {}", e);
        }
    }

    /// Wait for the next change on pins, places or locations and apply it.
    ///
    /// Cancel safe: a reload interrupted by dropping the future is picked up
    /// again by the next call.
    pub async fn next_change(&mut self) -> Option<Result<MapUpdate>> {
        if let Some(&table) = self.stale.iter().next() {
            return Some(self.reload(table).await.map(|()| MapUpdate::Reloaded(table)));
        }
        if self.users_stale {
            self.refresh_users().await;
        }

        let (table, item) = tokio::select! {
            item = self.pin_sub.next() => (Table::Pins, item),
            item = self.place_sub.next() => (Table::Places, item),
            item = self.location_sub.next() => (Table::UserLocations, item),
        };

        let event = match item? {
            FeedMessage::Resync => {
                self.stale.insert(table);
                return Some(self.reload(table).await.map(|()| MapUpdate::Reloaded(table)));
            }
            FeedMessage::Change(event) => event,
        };

        let update = match table {
            Table::Pins => {
                self.pins.apply_event(event.clone());
                MapUpdate::Pin(event)
            }
            Table::Places => {
                self.places.apply_event(event.clone());
                MapUpdate::Place(event)
            }
            _ => {
                let unknown_user = match &event.new_row {
                    Some(Row::Location(loc)) => !self.users.contains_key(&loc.user_id),
                    _ => false,
                };
                self.locations.apply_event(event.clone());
                if unknown_user {
                    self.users_stale = true;
                    self.refresh_users().await;
                }
                MapUpdate::Location(event)
            }
        };
        Some(Ok(update))
    }

    async fn upload_image(&self, prefix: &str, image: &ImageUpload) -> Result<(String, String)> {
        let ext = image.extension.trim_start_matches('.');
        let path = format!("{}/{}.{}", prefix, Uuid::new_v4(), ext);
        self.store
            .upload(PIN_IMAGES, &path, &image.bytes)
            .await
            .map_err(from_store)?;
        let url = self.store.public_url(PIN_IMAGES, &path).map_err(from_store)?;
        Ok((path, url))
    }

    async fn discard_upload(&self, path: String) {
        if let Err(e) = self.store.remove(PIN_IMAGES, &[path]).await {
            warn!("Could not remove orphaned upload: {:#}", e);
        }
    }

    async fn find_place(&self, place_id: Uuid) -> Result<Option<Place>> {
        if let Some(place) = self.places.get(&place_id) {
            return Ok(Some(place.clone()));
        }
        self.store.get_place(place_id).await.map_err(from_store)
    }

    /// Create a pin, announce it in the chat, and return the stored row.
    ///
    /// The optional camera image is uploaded first. The announcement names
    /// the place and the city the pin is in. Geocoding or announcement
    /// failures are logged and do not fail the pin.
    pub async fn create_pin(&mut self, draft: PinDraft) -> Result<Pin> {
        let place = self
            .find_place(draft.place_id)
            .await?
            .ok_or(SyncError::NotFound { entity: "place", id: draft.place_id })?;

        let upload = match &draft.camera_image {
            Some(image) => Some(self.upload_image("camera-uploads", image).await?),
            None => None,
        };

        let new_pin = NewPin {
            title: draft.title.trim().to_string(),
            description: draft.description.filter(|d| !d.trim().is_empty()),
            latitude: draft.latitude,
            longitude: draft.longitude,
            place_id: place.id,
            owner_id: self.user_id,
            radius_meters: draft.radius_meters,
            camera_image_ref: upload.as_ref().map(|(_, url)| url.clone()),
            place_image_ref: Some(place.image_ref.clone()),
        };
        let pin = match self.store.insert_pin(new_pin).await {
            Ok(pin) => pin,
            Err(e) => {
                if let Some((path, _)) = upload {
                    self.discard_upload(path).await;
                }
                return Err(from_store(e));
            }
        };
        self.pins.apply_event(ChangeEvent::insert(Row::Pin(pin.clone())));
        info!("{} created pin {} at {}", self.user_id, pin.id, place.name);

        let city = match &self.geocoder {
            Some(geocoder) => geocoder.city_or_placeholder(pin.latitude, pin.longitude).await,
            None => UNKNOWN_CITY.to_string(),
        };
        let announcement = NewMessage {
            author_id: self.user_id,
            text: format!("placed a new pin of {} in {}", place.name, city),
            kind: MessageKind::PinNotification,
            related_place_id: Some(place.id),
            related_pin_id: Some(pin.id),
        };
        if let Err(e) = self.store.insert_message(announcement).await {
            warn!("Pin {} was not announced: {:#}", pin.id, e);
        }

        Ok(pin)
    }

    /// Delete one of the user's own pins and its camera image.
    pub async fn delete_pin(&mut self, pin_id: Uuid) -> Result<()> {
        let pin = match self.pins.get(&pin_id) {
            Some(pin) => pin.clone(),
            None => self
                .store
                .get_pin(pin_id)
                .await
                .map_err(from_store)?
                .ok_or(SyncError::NotFound { entity: "pin", id: pin_id })?,
        };
        if pin.owner_id != self.user_id {
            return Err(SyncError::NotOwner { entity: "pin", id: pin_id });
        }

        if !self.store.delete_pin(pin_id, self.user_id).await.map_err(from_store)? {
            return Err(SyncError::NotFound { entity: "pin", id: pin_id });
        }
        self.pins.apply_event(ChangeEvent::delete(Row::Pin(pin.clone())));

        if let Some(path) = pin
            .camera_image_ref
            .as_deref()
            .and_then(|url| self.store.object_path(PIN_IMAGES, url))
        {
            self.discard_upload(path).await;
        }
        info!("{} deleted pin {}", self.user_id, pin_id);
        Ok(())
    }

    /// Create a place with its image and announce it in the chat.
    pub async fn create_place(&mut self, draft: PlaceDraft) -> Result<Place> {
        let name = draft.name.trim().to_string();
        if name.is_empty() {
            return Err(SyncError::WriteRejected("place name is empty".into()));
        }

        let (path, image_ref) = self
            .upload_image(&format!("places/{}", self.user_id), &draft.image)
            .await?;
        let new_place = NewPlace {
            name,
            image_ref,
            color: draft.color.unwrap_or_else(|| DEFAULT_PLACE_COLOR.to_string()),
            owner_id: self.user_id,
        };
        let place = match self.store.insert_place(new_place).await {
            Ok(place) => place,
            Err(e) => {
                self.discard_upload(path).await;
                return Err(from_store(e));
            }
        };
        self.places.apply_event(ChangeEvent::insert(Row::Place(place.clone())));

        let announcement = NewMessage {
            author_id: self.user_id,
            text: format!("{} was added", place.name),
            kind: MessageKind::PlaceNotification,
            related_place_id: Some(place.id),
            related_pin_id: None,
        };
        if let Err(e) = self.store.insert_message(announcement).await {
            warn!("Place {} was not announced: {:#}", place.id, e);
        }
        Ok(place)
    }

    /// Delete one of the user's own places. Its pins go with it.
    pub async fn delete_place(&mut self, place_id: Uuid) -> Result<()> {
        let place = self
            .find_place(place_id)
            .await?
            .ok_or(SyncError::NotFound { entity: "place", id: place_id })?;
        if place.owner_id != self.user_id {
            return Err(SyncError::NotOwner { entity: "place", id: place_id });
        }
        if !self
            .store
            .delete_place(place_id, self.user_id)
            .await
            .map_err(from_store)?
        {
            return Err(SyncError::NotFound { entity: "place", id: place_id });
        }
        let orphaned: Vec<Pin> = self.pins.iter().filter(|p| p.place_id == place_id).cloned().collect();
        for pin in orphaned {
            self.pins.apply_event(ChangeEvent::delete(Row::Pin(pin)));
        }
        self.places.apply_event(ChangeEvent::delete(Row::Place(place)));
        info!("{} deleted place {}", self.user_id, place_id);
        Ok(())
    }

    /// Coordinates for a typed address.
    pub async fn search_address(&self, query: &str) -> Result<Option<Coordinates>> {
        let geocoder = self
            .geocoder
            .as_ref()
            .ok_or_else(|| SyncError::UpstreamUnavailable("no geocoder configured".into()))?;
        geocoder.search(query.trim()).await
    }

    /// Places by number of pins, most first. Pins of unknown places are
    /// left out.
    pub fn ranking(&self) -> Vec<RankingEntry> {
        let mut entries: Vec<RankingEntry> = Vec::new();
        let mut index: HashMap<Uuid, usize> = HashMap::new();

        for pin in self.pins.iter() {
            let Some(place) = self.places.get(&pin.place_id) else {
                continue;
            };
            let i = *index.entry(place.id).or_insert_with(|| {
                entries.push(RankingEntry {
                    place_id: place.id,
                    name: place.name.clone(),
                    color: place.color.clone(),
                    image_ref: place.image_ref.clone(),
                    pin_count: 0,
                    total_meters: 0,
                });
                entries.len() - 1
            });
            entries[i].pin_count += 1;
            entries[i].total_meters += u64::from(pin.radius_meters);
        }

        // stable: ties keep first-seen order
        entries.sort_by(|a, b| b.pin_count.cmp(&a.pin_count));
        entries
    }

    /// Everyone with a live position, with avatar URLs resolved at `now`.
    pub fn live_users(&mut self, now: DateTime<Utc>) -> Vec<LiveUser> {
        let mut out = Vec::with_capacity(self.locations.len());
        for loc in self.locations.iter() {
            let user = self.users.get(&loc.user_id);
            let username = user.map_or(UNKNOWN_USER, |u| u.username.as_str()).to_string();
            let avatar_url = user
                .and_then(|u| u.avatar_url.as_deref())
                .and_then(|url| self.avatars.get_or_compute(url, now));
            out.push(LiveUser {
                user_id: loc.user_id,
                initials: user_initials(Some(&username), None),
                username,
                avatar_url,
                latitude: loc.latitude,
                longitude: loc.longitude,
                updated_at: loc.updated_at,
            });
        }
        out
    }

    pub fn pins(&self) -> &Reconciler<Pin> {
        &self.pins
    }

    pub fn places(&self) -> &Reconciler<Place> {
        &self.places
    }

    pub fn locations(&self) -> &Reconciler<LiveLocation> {
        &self.locations
    }

    /// Display name of a pin's place, or a placeholder while it is unknown.
    pub fn place_name(&self, place_id: Uuid) -> &str {
        self.places.get(&place_id).map_or(UNKNOWN_PLACE, |p| p.name.as_str())
    }
}

/// Whether `event` removed the row keyed by `id`.
pub fn is_delete_of(event: &ChangeEvent, id: Uuid) -> bool {
    event.kind == ChangeKind::Delete
        && match &event.old_row {
            Some(Row::Pin(p)) => p.id == id,
            Some(Row::Place(p)) => p.id == id,
            _ => false,
        }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use pinboard_db::{Database, ObjectStorage};
    use pinboard_types::api::{LocationUpdate, NewUser};

    use crate::geocode::testing::fake_geocoder;

    async fn store_with_objects() -> Store {
        let dir = std::env::temp_dir().join(format!("pinboard-map-{}", Uuid::new_v4()));
        let objects = ObjectStorage::new(dir, "http://localhost:8080/storage").await.unwrap();
        Store::new(Database::open_in_memory().unwrap(), Some(objects))
    }

    async fn user(store: &Store, name: &str, avatar: Option<&str>) -> Uuid {
        store
            .insert_user(NewUser {
                id: Uuid::new_v4(),
                username: name.into(),
                avatar_url: avatar.map(String::from),
            })
            .await
            .unwrap()
            .id
    }

    fn image() -> ImageUpload {
        ImageUpload { bytes: b"\xFF\xD8\xFF".to_vec(), extension: "jpg".into() }
    }

    fn draft(place_id: Uuid, lat: f64) -> PinDraft {
        PinDraft {
            title: "  spotted ".into(),
            description: Some("  ".into()),
            latitude: lat,
            longitude: 11.4,
            place_id,
            radius_meters: 300,
            camera_image: None,
        }
    }

    async fn next(map: &mut MapSurface) -> MapUpdate {
        tokio::time::timeout(Duration::from_secs(1), map.next_change())
            .await
            .expect("no change arrived")
            .expect("subscriptions closed")
            .unwrap()
    }

    #[tokio::test]
    async fn create_pin_announces_with_city() {
        let store = store_with_objects().await;
        let me = user(&store, "ana", None).await;
        let geocoder = Geocoder::new(&fake_geocoder().await, "pinboard-test/1.0").unwrap();
        let mut map = MapSurface::activate(store.clone(), me, Some(geocoder)).await.unwrap();

        let place = map
            .create_place(PlaceDraft { name: " Lena ".into(), color: None, image: image() })
            .await
            .unwrap();
        assert_eq!(place.color, DEFAULT_PLACE_COLOR);
        assert!(place.image_ref.starts_with(&format!("http://localhost:8080/storage/pin-images/places/{}/", me)));

        let pin = map
            .create_pin(PinDraft { camera_image: Some(image()), ..draft(place.id, 48.2) })
            .await
            .unwrap();
        assert_eq!(pin.title, "spotted");
        assert_eq!(pin.description, None);
        assert_eq!(pin.place_image_ref.as_deref(), Some(place.image_ref.as_str()));
        assert!(pin.camera_image_ref.is_some());

        let messages = store.select_messages(10).await.unwrap();
        let texts: Vec<&str> = messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, ["Lena was added", "placed a new pin of Lena in Dachau"]);
        assert_eq!(messages[1].kind, MessageKind::PinNotification);
        assert_eq!(messages[1].related_pin_id, Some(pin.id));
    }

    #[tokio::test]
    async fn city_falls_back_without_geocoder() {
        let store = store_with_objects().await;
        let me = user(&store, "ana", None).await;
        let mut map = MapSurface::activate(store.clone(), me, None).await.unwrap();
        let place = map
            .create_place(PlaceDraft { name: "Tom".into(), color: Some("#EF4444".into()), image: image() })
            .await
            .unwrap();

        map.create_pin(draft(place.id, 1.0)).await.unwrap();

        let last = store.select_messages(1).await.unwrap().pop().unwrap();
        assert_eq!(last.text, format!("placed a new pin of Tom in {}", UNKNOWN_CITY));
    }

    #[tokio::test]
    async fn pin_for_missing_place_is_not_found() {
        let store = store_with_objects().await;
        let me = user(&store, "ana", None).await;
        let mut map = MapSurface::activate(store, me, None).await.unwrap();

        let err = map.create_pin(draft(Uuid::new_v4(), 1.0)).await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound { entity: "place", .. }));
    }

    #[tokio::test]
    async fn only_owner_deletes_pin() {
        let store = store_with_objects().await;
        let me = user(&store, "ana", None).await;
        let other = user(&store, "ben", None).await;
        let mut mine = MapSurface::activate(store.clone(), me, None).await.unwrap();
        let place = mine
            .create_place(PlaceDraft { name: "Tom".into(), color: None, image: image() })
            .await
            .unwrap();
        let pin = mine
            .create_pin(PinDraft { camera_image: Some(image()), ..draft(place.id, 1.0) })
            .await
            .unwrap();

        let mut theirs = MapSurface::activate(store.clone(), other, None).await.unwrap();
        assert!(matches!(
            theirs.delete_pin(pin.id).await,
            Err(SyncError::NotOwner { entity: "pin", .. })
        ));

        mine.delete_pin(pin.id).await.unwrap();
        assert!(mine.pins().is_empty());
        assert!(matches!(
            mine.delete_pin(pin.id).await,
            Err(SyncError::NotFound { entity: "pin", .. })
        ));

        let camera_path = store
            .object_path(PIN_IMAGES, pin.camera_image_ref.as_deref().unwrap())
            .unwrap();
        assert!(store.upload(PIN_IMAGES, &camera_path, b"x").await.is_ok());
    }

    #[tokio::test]
    async fn deleting_place_drops_its_pins_everywhere() {
        let store = store_with_objects().await;
        let me = user(&store, "ana", None).await;
        let other = user(&store, "ben", None).await;
        let mut mine = MapSurface::activate(store.clone(), me, None).await.unwrap();
        let place = mine
            .create_place(PlaceDraft { name: "Tom".into(), color: None, image: image() })
            .await
            .unwrap();
        let pin = mine.create_pin(draft(place.id, 1.0)).await.unwrap();

        let mut theirs = MapSurface::activate(store.clone(), other, None).await.unwrap();
        assert!(matches!(
            theirs.delete_place(place.id).await,
            Err(SyncError::NotOwner { entity: "place", .. })
        ));

        mine.delete_place(place.id).await.unwrap();
        assert!(mine.places().is_empty() && mine.pins().is_empty());

        // the two tables have no relative order
        for _ in 0..2 {
            match next(&mut theirs).await {
                MapUpdate::Pin(event) => assert!(is_delete_of(&event, pin.id)),
                MapUpdate::Place(event) => assert!(is_delete_of(&event, place.id)),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(theirs.pins().is_empty() && theirs.places().is_empty());
    }

    #[tokio::test]
    async fn ranking_counts_pins_and_meters() {
        let store = store_with_objects().await;
        let me = user(&store, "ana", None).await;
        let mut map = MapSurface::activate(store, me, None).await.unwrap();
        let a = map
            .create_place(PlaceDraft { name: "A".into(), color: None, image: image() })
            .await
            .unwrap();
        let b = map
            .create_place(PlaceDraft { name: "B".into(), color: None, image: image() })
            .await
            .unwrap();
        map.create_pin(draft(a.id, 1.0)).await.unwrap();
        for lat in [2.0, 3.0] {
            map.create_pin(PinDraft { radius_meters: 1000, ..draft(b.id, lat) }).await.unwrap();
        }

        let ranking = map.ranking();
        assert_eq!(ranking.len(), 2);
        assert_eq!((ranking[0].name.as_str(), ranking[0].pin_count, ranking[0].total_meters), ("B", 2, 2000));
        assert_eq!((ranking[1].name.as_str(), ranking[1].pin_count, ranking[1].total_meters), ("A", 1, 300));
    }

    #[tokio::test]
    async fn live_users_follow_location_feed() {
        let store = store_with_objects().await;
        let me = user(&store, "ana", None).await;
        let mut map = MapSurface::activate(store.clone(), me, None).await.unwrap();

        let newcomer = user(&store, "ben", Some("https://cdn/ben.png")).await;
        store
            .upsert_location(LocationUpdate { user_id: newcomer, latitude: 5.0, longitude: 6.0 })
            .await
            .unwrap();
        assert!(matches!(next(&mut map).await, MapUpdate::Location(_)));

        let now = Utc::now();
        let live = map.live_users(now);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].username, "ben");
        assert_eq!(live[0].initials, "B");
        assert_eq!(
            live[0].avatar_url.as_deref(),
            Some(format!("https://cdn/ben.png?t={}", now.timestamp_millis()).as_str())
        );
    }

    #[tokio::test]
    async fn address_search_needs_geocoder() {
        let store = store_with_objects().await;
        let me = user(&store, "ana", None).await;
        let map = MapSurface::activate(store.clone(), me, None).await.unwrap();
        assert!(matches!(
            map.search_address("Marienplatz").await,
            Err(SyncError::UpstreamUnavailable(_))
        ));

        let geocoder = Geocoder::new(&fake_geocoder().await, "pinboard-test/1.0").unwrap();
        let map = MapSurface::activate(store, me, Some(geocoder)).await.unwrap();
        assert!(map.search_address(" Marienplatz ").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn interrupted_resync_is_resumed() {
        let store = store_with_objects().await;
        let me = user(&store, "ana", None).await;
        let place = store
            .insert_place(NewPlace {
                name: "Park".into(),
                image_ref: "https://img/park.png".into(),
                color: DEFAULT_PLACE_COLOR.into(),
                owner_id: me,
            })
            .await
            .unwrap();
        let mut map = MapSurface::activate(store.clone(), me, None).await.unwrap();

        store
            .insert_pin(NewPin {
                title: "bench".into(),
                description: None,
                latitude: 48.2,
                longitude: 11.4,
                place_id: place.id,
                owner_id: me,
                radius_meters: 300,
                camera_image_ref: None,
                place_image_ref: None,
            })
            .await
            .unwrap();
        // the insert is lost in the gap
        assert!(matches!(map.pin_sub.try_next(), Some(FeedMessage::Change(_))));
        store.feed().mark_reconnected();

        // give up on the first call while its reload is in flight
        let first = tokio::select! {
            biased;
            update = map.next_change() => Some(update),
            _ = std::future::ready(()) => None,
        };

        let mut reloaded = HashSet::new();
        if let Some(update) = first {
            if let MapUpdate::Reloaded(table) = update.unwrap().unwrap() {
                reloaded.insert(table);
            }
        }
        while reloaded.len() < 3 {
            match next(&mut map).await {
                MapUpdate::Reloaded(table) => assert!(reloaded.insert(table)),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(map.pins().len(), 1);
    }
}
