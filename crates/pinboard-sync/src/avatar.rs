use std::collections::HashMap;

use chrono::{DateTime, TimeDelta, Utc};

const AVATAR_TTL: TimeDelta = TimeDelta::minutes(5);

struct Entry {
    url: String,
    expires_at: DateTime<Utc>,
}

/// Cache-busted avatar URLs, kept stable for a few minutes so the image is
/// not refetched on every render. The caller passes the clock.
#[derive(Default)]
pub struct AvatarCache {
    entries: HashMap<String, Entry>,
}

impl AvatarCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` for empty or non-http URLs.
    pub fn get_or_compute(&mut self, url: &str, now: DateTime<Utc>) -> Option<String> {
        if url.is_empty() || !url.starts_with("http") {
            return None;
        }

        if let Some(entry) = self.entries.get(url) {
            if now < entry.expires_at {
                return Some(entry.url.clone());
            }
        }

        let separator = if url.contains('?') { '&' } else { '?' };
        let busted = format!("{}{}t={}", url, separator, now.timestamp_millis());
        self.entries.insert(
            url.to_string(),
            Entry {
                url: busted.clone(),
                expires_at: now + AVATAR_TTL,
            },
        );
        Some(busted)
    }
}

/// Single uppercase letter for an avatar placeholder.
pub fn user_initials(username: Option<&str>, email: Option<&str>) -> String {
    [username, email]
        .into_iter()
        .flatten()
        .find_map(|s| s.trim().chars().next())
        .map(|c| c.to_uppercase().collect())
        .unwrap_or_else(|| "U".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn stable_within_ttl_then_refreshed() {
        let mut cache = AvatarCache::new();
        let first = cache.get_or_compute("https://cdn/a.png", t0()).unwrap();
        assert_eq!(first, format!("https://cdn/a.png?t={}", t0().timestamp_millis()));

        let later = t0() + TimeDelta::minutes(4);
        assert_eq!(cache.get_or_compute("https://cdn/a.png", later).unwrap(), first);

        let expired = t0() + TimeDelta::minutes(5);
        let refreshed = cache.get_or_compute("https://cdn/a.png", expired).unwrap();
        assert_ne!(refreshed, first);
        assert!(refreshed.ends_with(&expired.timestamp_millis().to_string()));
    }

    #[test]
    fn existing_query_uses_ampersand() {
        let mut cache = AvatarCache::new();
        let url = cache.get_or_compute("https://cdn/a.png?size=64", t0()).unwrap();
        assert!(url.starts_with("https://cdn/a.png?size=64&t="));
    }

    #[test]
    fn rejects_non_http() {
        let mut cache = AvatarCache::new();
        assert_eq!(cache.get_or_compute("", t0()), None);
        assert_eq!(cache.get_or_compute("data:image/png;base64,xx", t0()), None);
    }

    #[test]
    fn initials_fallbacks() {
        assert_eq!(user_initials(Some("mara"), Some("x@y.z")), "M");
        assert_eq!(user_initials(Some(""), Some("bob@y.z")), "B");
        assert_eq!(user_initials(None, None), "U");
    }
}
