use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use pinboard_types::SyncError;
use pinboard_types::api::Coordinates;

use crate::error::Result;

/// Shown in notifications when the city cannot be resolved.
pub const UNKNOWN_CITY: &str = "unknown place";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Deserialize)]
struct SearchHit {
    lat: String,
    lon: String,
}

#[derive(Deserialize)]
struct ReverseResult {
    #[serde(default)]
    address: Address,
}

#[derive(Deserialize, Default)]
struct Address {
    city: Option<String>,
    town: Option<String>,
    village: Option<String>,
    municipality: Option<String>,
}

impl Address {
    fn locality(self) -> Option<String> {
        self.city.or(self.town).or(self.village).or(self.municipality)
    }
}

/// Client for a Nominatim-compatible geocoding service.
#[derive(Clone)]
pub struct Geocoder {
    client: Client,
    base_url: String,
}

impl Geocoder {
    /// Nominatim rejects requests without a `User-Agent`, so one is required.
    pub fn new(base_url: &str, user_agent: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(user_agent)
            .build()
            .map_err(|e| SyncError::UpstreamUnavailable(format!("geocoder client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let url = format!("{}/{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| SyncError::UpstreamUnavailable(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(SyncError::UpstreamUnavailable(format!("{} returned {}", url, resp.status())));
        }
        resp.json()
            .await
            .map_err(|e| SyncError::UpstreamUnavailable(format!("bad response from {}: {}", url, e)))
    }

    /// Best match for a free-text address, or `None` if nothing matched.
    pub async fn search(&self, query: &str) -> Result<Option<Coordinates>> {
        let hits: Vec<SearchHit> = self
            .get_json(
                "search",
                &[
                    ("format", "json".into()),
                    ("q", query.to_string()),
                    ("limit", "1".into()),
                ],
            )
            .await?;

        let Some(hit) = hits.into_iter().next() else {
            debug!("No geocoding match for '{}'", query);
            return Ok(None);
        };
        match (hit.lat.parse(), hit.lon.parse()) {
            (Ok(latitude), Ok(longitude)) => Ok(Some(Coordinates { latitude, longitude })),
            _ => Err(SyncError::UpstreamUnavailable(format!(
                "unparseable coordinates {}/{}",
                hit.lat, hit.lon
            ))),
        }
    }

    /// City, town, village or municipality at a position.
    pub async fn city_at(&self, latitude: f64, longitude: f64) -> Result<Option<String>> {
        let result: ReverseResult = self
            .get_json(
                "reverse",
                &[
                    ("format", "json".into()),
                    ("lat", latitude.to_string()),
                    ("lon", longitude.to_string()),
                    ("zoom", "10".into()),
                    ("addressdetails", "1".into()),
                ],
            )
            .await?;
        Ok(result.address.locality())
    }

    /// Like `city_at`, but never fails.
    pub async fn city_or_placeholder(&self, latitude: f64, longitude: f64) -> String {
        match self.city_at(latitude, longitude).await {
            Ok(Some(city)) => city,
            Ok(None) => UNKNOWN_CITY.to_string(),
            Err(e) => {
                warn!("Reverse geocoding failed: {}", e);
                UNKNOWN_CITY.to_string()
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;

    use axum::extract::Query;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::{Value, json};

    fn has_agent(headers: &HeaderMap) -> bool {
        headers.get("user-agent").is_some_and(|v| !v.is_empty())
    }

    async fn search(headers: HeaderMap, Query(q): Query<HashMap<String, String>>) -> Result<Json<Value>, StatusCode> {
        if !has_agent(&headers) {
            return Err(StatusCode::FORBIDDEN);
        }
        match q.get("q").map(String::as_str) {
            Some("Marienplatz") => Ok(Json(json!([{ "lat": "48.1374", "lon": "11.5755" }]))),
            _ => Ok(Json(json!([]))),
        }
    }

    async fn reverse(headers: HeaderMap, Query(q): Query<HashMap<String, String>>) -> Result<Json<Value>, StatusCode> {
        if !has_agent(&headers) {
            return Err(StatusCode::FORBIDDEN);
        }
        let lat: f64 = q.get("lat").and_then(|v| v.parse().ok()).unwrap_or_default();
        if lat > 80.0 {
            return Err(StatusCode::SERVICE_UNAVAILABLE);
        }
        if lat > 40.0 {
            Ok(Json(json!({ "address": { "town": "Dachau", "country": "Deutschland" } })))
        } else {
            Ok(Json(json!({ "address": { "country": "Atlantis" } })))
        }
    }

    /// Serve a fake geocoder on a local port; returns its base URL.
    pub async fn fake_geocoder() -> String {
        let app = Router::new()
            .route("/search", get(search))
            .route("/reverse", get(reverse));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::fake_geocoder;
    use super::*;

    #[tokio::test]
    async fn forward_search() {
        let geocoder = Geocoder::new(&fake_geocoder().await, "pinboard-test/1.0").unwrap();

        let hit = geocoder.search("Marienplatz").await.unwrap().unwrap();
        assert!((hit.latitude - 48.1374).abs() < 1e-9);
        assert!(geocoder.search("nowhere at all").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reverse_picks_first_locality() {
        let geocoder = Geocoder::new(&fake_geocoder().await, "pinboard-test/1.0").unwrap();

        assert_eq!(geocoder.city_at(48.2, 11.4).await.unwrap().as_deref(), Some("Dachau"));
        assert_eq!(geocoder.city_or_placeholder(10.0, 0.0).await, UNKNOWN_CITY);
    }

    #[tokio::test]
    async fn upstream_failure_is_not_fatal() {
        let geocoder = Geocoder::new(&fake_geocoder().await, "pinboard-test/1.0").unwrap();

        let err = geocoder.city_at(85.0, 0.0).await.unwrap_err();
        assert!(matches!(err, SyncError::UpstreamUnavailable(_)));
        assert_eq!(geocoder.city_or_placeholder(85.0, 0.0).await, UNKNOWN_CITY);
    }

    #[tokio::test]
    async fn unreachable_service_is_upstream_unavailable() {
        let geocoder = Geocoder::new("http://127.0.0.1:9", "pinboard-test/1.0").unwrap();
        assert!(matches!(
            geocoder.search("Marienplatz").await,
            Err(SyncError::UpstreamUnavailable(_))
        ));
    }
}
