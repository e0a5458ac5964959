mod config;
mod input;

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use pinboard_db::{Database, ObjectStorage, Store};
use pinboard_sync::map::{PinDraft, PlaceDraft};
use pinboard_sync::presence::{GeoError, GeoSample};
use pinboard_sync::{
    ChatSurface, FileWatermarks, Geocoder, MapSurface, PresenceBroadcaster, PresenceConfig, SyncConfig,
};
use pinboard_types::SyncError;
use pinboard_types::api::NewUser;

use config::Config;
use input::{Input, read_image, stdin_inputs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pinboard=debug,pinboard_sync=debug".into()),
        )
        .init();

    let config = Config::from_env()?;

    // Backing store
    let db = Database::open(&config.db_path)?;
    let objects = ObjectStorage::new(config.storage_dir.clone(), config.public_url.clone()).await?;
    let store = Store::new(db, Some(objects));
    let me = store
        .ensure_user(NewUser {
            id: config.user_id,
            username: config.username.clone(),
            avatar_url: None,
        })
        .await?;
    info!("Signed in as {} ({})", me.username, me.id);

    let geocoder = match &config.geocoder_url {
        Some(url) => Some(Geocoder::new(url, &config.user_agent)?),
        None => {
            warn!("Geocoding disabled");
            None
        }
    };
    let sync_config = SyncConfig {
        radius_debounce: config.radius_debounce,
        ..SyncConfig::default()
    };
    let watermarks = Arc::new(FileWatermarks::new(config.watermark_dir.clone())?);

    let mut chat = ChatSurface::activate(store.clone(), me.id, watermarks, &sync_config).await?;
    let mut map = MapSurface::activate(store.clone(), me.id, geocoder).await?;
    let mut unread = chat.unread_updates();
    info!(
        "{} pins, {} places, {} unread messages",
        map.pins().len(),
        map.places().len(),
        chat.unread()
    );

    // Positions from stdin feed the presence broadcaster
    let (geo_tx, mut geo_rx) = mpsc::unbounded_channel::<Result<GeoSample, GeoError>>();
    let samples = async_stream::stream! {
        while let Some(sample) = geo_rx.recv().await {
            yield sample;
        }
    };
    let presence = PresenceBroadcaster::spawn(store.clone(), me.id, Box::pin(samples), PresenceConfig::default());

    let inputs = stdin_inputs();
    tokio::pin!(inputs);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            input = inputs.next() => {
                let Some(input) = input else { break };
                let input = match input.into_sample() {
                    Ok(sample) => {
                        if geo_tx.send(sample).is_err() {
                            debug!("Presence already stopped, dropping sample");
                        }
                        continue;
                    }
                    Err(input) => input,
                };
                if matches!(input, Input::Quit) {
                    break;
                }
                if let Err(e) = handle(input, &mut chat, &mut map).await {
                    match e.downcast_ref::<SyncError>() {
                        Some(SyncError::AlreadyVoted { .. }) => debug!("{}", e),
                        Some(err) if err.is_transient() => warn!("{}, try again later", e),
                        _ => error!("{:#}", e),
                    }
                }
            }
            update = chat.next_change() => match update {
                Some(Ok(update)) => debug!("chat: {:?}", update),
                Some(Err(e)) => warn!("chat reload failed: {}", e),
                None => break,
            },
            update = map.next_change() => match update {
                Some(Ok(update)) => debug!("map: {:?}", update),
                Some(Err(e)) => warn!("map reload failed: {}", e),
                None => break,
            },
            Ok(()) = unread.changed() => {
                info!("Unread messages: {}", *unread.borrow_and_update());
            }
        }
    }

    drop(geo_tx);
    presence.stop().await;
    info!("Bye");
    Ok(())
}

async fn handle(input: Input, chat: &mut ChatSurface, map: &mut MapSurface) -> anyhow::Result<()> {
    match input {
        Input::Open => {
            chat.open().await?;
            for (message_id, tally) in chat.tallies() {
                let counts: Vec<String> = tally
                    .iter()
                    .filter(|b| b.count > 0)
                    .map(|b| format!("{}: {}{}", b.bucket, b.count, if b.user_voted { " (you)" } else { "" }))
                    .collect();
                info!("Votes on {}: [{}]", message_id, counts.join(", "));
            }
        }
        Input::Close => chat.close(),
        Input::Say { text } => {
            let message = chat.send_text(&text).await?;
            info!("Sent {}", message.id);
        }
        Input::Vote { message_id, bucket } => {
            chat.cast_vote(message_id, bucket).await?;
        }
        Input::Place { name, color, image } => {
            let image = read_image(&image).await?;
            let place = map.create_place(PlaceDraft { name, color, image }).await?;
            info!("Created place {} ({})", place.name, place.id);
        }
        Input::Pin {
            title,
            description,
            latitude,
            longitude,
            place_id,
            radius_meters,
            camera_image,
        } => {
            let camera_image = match camera_image {
                Some(path) => Some(read_image(&path).await?),
                None => None,
            };
            let pin = map
                .create_pin(PinDraft {
                    title,
                    description,
                    latitude,
                    longitude,
                    place_id,
                    radius_meters: radius_meters.unwrap_or(100),
                    camera_image,
                })
                .await?;
            info!("Created pin {} for {}", pin.id, map.place_name(pin.place_id));
        }
        Input::DeletePin { pin_id } => map.delete_pin(pin_id).await?,
        Input::DeletePlace { place_id } => map.delete_place(place_id).await?,
        Input::Search { query } => match map.search_address(&query).await? {
            Some(c) => info!("{} is at {:.5}, {:.5}", query, c.latitude, c.longitude),
            None => info!("No match for {}", query),
        },
        Input::Ranking => {
            for (i, entry) in map.ranking().iter().enumerate() {
                info!("{}. {}: {} pins, {}m", i + 1, entry.name, entry.pin_count, entry.total_meters);
            }
        }
        Input::Position(_) | Input::PositionError { .. } | Input::PermissionDenied | Input::Quit => {}
    }
    Ok(())
}
