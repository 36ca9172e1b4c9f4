use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

const EXPIRY_SKEW_SECS: i64 = 60;
pub(crate) const DEFAULT_EXPIRY_SECS: i64 = 3600;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TokenKey {
    pub directory: String,
    pub client_id: String,
    pub scope: String,
}

#[derive(Debug, Clone)]
pub struct AccessToken {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn new(access_token: String, expires_in_secs: Option<i64>) -> Self {
        let expires_in = expires_in_secs.unwrap_or(DEFAULT_EXPIRY_SECS).max(1);
        Self {
            access_token,
            expires_at: Utc::now() + Duration::seconds(expires_in),
        }
    }

    fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - Duration::seconds(EXPIRY_SKEW_SECS) > now
    }
}

/// Short-lived access tokens keyed by credential set.
#[derive(Debug, Default)]
pub struct TokenCache {
    entries: Mutex<HashMap<TokenKey, AccessToken>>,
}

impl TokenCache {
    pub fn get(&self, key: &TokenKey) -> Option<String> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(token) if token.is_valid(Utc::now()) => Some(token.access_token.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: TokenKey, token: AccessToken) {
        self.entries.lock().insert(key, token);
    }

    pub fn invalidate(&self, key: &TokenKey) {
        self.entries.lock().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> TokenKey {
        TokenKey {
            directory: "aad".into(),
            client_id: "client".into(),
            scope: "https://org.crm.dynamics.com/.default".into(),
        }
    }

    #[test]
    fn fresh_token_is_served() {
        let cache = TokenCache::default();
        cache.insert(key(), AccessToken::new("abc".into(), Some(3600)));
        assert_eq!(cache.get(&key()).as_deref(), Some("abc"));
    }

    #[test]
    fn token_inside_skew_window_is_dropped() {
        let cache = TokenCache::default();
        cache.insert(key(), AccessToken::new("abc".into(), Some(30)));
        assert!(cache.get(&key()).is_none());
        assert!(cache.get(&key()).is_none());
    }

    #[test]
    fn invalidate_forgets_token() {
        let cache = TokenCache::default();
        cache.insert(key(), AccessToken::new("abc".into(), None));
        cache.invalidate(&key());
        assert!(cache.get(&key()).is_none());
    }
}
