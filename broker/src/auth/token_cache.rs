use super::types::{CacheKey, CachedToken};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Process-lifetime token cache.
///
/// Cloning is cheap and yields a handle to the same map. Tokens inside the
/// skew margin of their expiry are never returned.
#[derive(Clone)]
pub struct TokenCache {
    cache: Arc<RwLock<HashMap<CacheKey, CachedToken>>>,
    skew: Duration,
}

impl TokenCache {
    pub fn new(skew: Duration) -> Self {
        Self {
            cache: Arc::new(RwLock::new(HashMap::new())),
            skew,
        }
    }

    pub fn skew(&self) -> Duration {
        self.skew
    }

    pub async fn get(&self, key: &CacheKey) -> Option<CachedToken> {
        {
            let cache = self.cache.read().await;
            match cache.get(key) {
                Some(token) if !token.is_expired(self.skew) => return Some(token.clone()),
                Some(_) => {}
                None => return None,
            }
        }

        // Expired: evict unless another writer replaced it meanwhile.
        let mut cache = self.cache.write().await;
        if cache
            .get(key)
            .is_some_and(|token| token.is_expired(self.skew))
        {
            cache.remove(key);
            log::debug!("Evicted expired token for {key}");
        }
        None
    }

    pub async fn set(&self, key: CacheKey, token: CachedToken) {
        let mut cache = self.cache.write().await;
        cache.insert(key, token);
    }

    pub async fn invalidate(&self, key: &CacheKey) {
        let mut cache = self.cache.write().await;
        cache.remove(key);
    }

    pub async fn invalidate_many<'a>(&self, keys: impl IntoIterator<Item = &'a CacheKey>) {
        let mut cache = self.cache.write().await;
        for key in keys {
            cache.remove(key);
        }
    }

    pub async fn invalidate_all(&self) {
        let mut cache = self.cache.write().await;
        cache.clear();
    }

    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.cache.read().await.is_empty()
    }
}

impl Default for TokenCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::types::{AccessToken, AuthMethod};

    fn key(tenant: &str) -> CacheKey {
        CacheKey {
            tenant_id: tenant.to_string(),
            client_id: "client".to_string(),
            auth_method: AuthMethod::DeviceCode,
            scope: "https://contoso.crm.dynamics.com/.default".to_string(),
            username: None,
        }
    }

    fn token(lifetime_secs: u64) -> CachedToken {
        CachedToken::new(
            AccessToken::new("token"),
            "Bearer",
            Duration::from_secs(lifetime_secs),
            "scope",
        )
    }

    #[tokio::test]
    async fn test_get_returns_live_token() {
        let cache = TokenCache::default();
        cache.set(key("a"), token(3600)).await;

        let cached = cache.get(&key("a")).await.expect("token should be cached");
        assert_eq!(cached.access_token.secret(), "token");
        assert!(cache.get(&key("b")).await.is_none());
    }

    #[tokio::test]
    async fn test_token_inside_skew_is_absent_and_evicted() {
        let cache = TokenCache::new(Duration::from_secs(60));
        cache.set(key("a"), token(30)).await;

        assert!(cache.get(&key("a")).await.is_none());
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_invalidate() {
        let cache = TokenCache::default();
        cache.set(key("a"), token(3600)).await;
        cache.set(key("b"), token(3600)).await;
        cache.set(key("c"), token(3600)).await;

        cache.invalidate(&key("a")).await;
        assert!(cache.get(&key("a")).await.is_none());
        assert_eq!(cache.len().await, 2);

        cache.invalidate_many([&key("b")]).await;
        assert_eq!(cache.len().await, 1);

        cache.invalidate_all().await;
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let cache = TokenCache::default();
        let handle = cache.clone();
        handle.set(key("a"), token(3600)).await;
        assert!(cache.get(&key("a")).await.is_some());
    }
}
