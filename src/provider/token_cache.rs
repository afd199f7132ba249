//! Storage for the provider's OAuth access token.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::error::TokenCacheError;
use crate::database::SettingsStore;

/// A token is refreshed once it is this close to expiry.
pub const TOKEN_REFRESH_MARGIN_SECS: i64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedToken {
    pub access_token: String,
    pub expires_at: i64,
}

impl CachedToken {
    pub fn is_fresh(&self, now: i64) -> bool {
        self.expires_at - TOKEN_REFRESH_MARGIN_SECS > now
    }
}

#[async_trait]
pub trait TokenCache: Send + Sync {
    async fn get(&self) -> Result<Option<CachedToken>, TokenCacheError>;
    async fn set(&self, token: &CachedToken) -> Result<(), TokenCacheError>;
    async fn clear(&self) -> Result<(), TokenCacheError>;
}

/// Process-local cache
#[derive(Default)]
pub struct InMemoryTokenCache {
    token: Mutex<Option<CachedToken>>,
}

impl InMemoryTokenCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenCache for InMemoryTokenCache {
    async fn get(&self) -> Result<Option<CachedToken>, TokenCacheError> {
        Ok(self.token.lock().await.clone())
    }

    async fn set(&self, token: &CachedToken) -> Result<(), TokenCacheError> {
        *self.token.lock().await = Some(token.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<(), TokenCacheError> {
        *self.token.lock().await = None;
        Ok(())
    }
}

/// Token persisted as a JSON value in the settings store
pub struct SettingsTokenCache {
    settings: Arc<dyn SettingsStore>,
    key: String,
}

impl SettingsTokenCache {
    pub fn new(settings: Arc<dyn SettingsStore>, provider: &str) -> Self {
        Self {
            settings,
            key: format!("provider_token:{}", provider.to_lowercase()),
        }
    }
}

#[async_trait]
impl TokenCache for SettingsTokenCache {
    async fn get(&self) -> Result<Option<CachedToken>, TokenCacheError> {
        match self.settings.get(&self.key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, token: &CachedToken) -> Result<(), TokenCacheError> {
        self.settings
            .set(&self.key, serde_json::to_value(token)?)
            .await?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), TokenCacheError> {
        self.settings.delete(&self.key).await?;
        Ok(())
    }
}

#[cfg(feature = "cache")]
pub use redis_cache::RedisTokenCache;

#[cfg(feature = "cache")]
mod redis_cache {
    use super::*;
    use crate::cache::{provider_token_key, CacheError, RedisPool};

    /// Token shared by every instance through Redis; the key expires with the token
    pub struct RedisTokenCache {
        pool: RedisPool,
        key: String,
    }

    impl RedisTokenCache {
        pub fn new(pool: RedisPool, provider: &str) -> Self {
            Self {
                pool,
                key: provider_token_key(provider),
            }
        }
    }

    #[async_trait]
    impl TokenCache for RedisTokenCache {
        async fn get(&self) -> Result<Option<CachedToken>, TokenCacheError> {
            let mut conn = self.pool.get().await.map_err(CacheError::from)?;
            let raw: Option<String> = redis::cmd("GET")
                .arg(&self.key)
                .query_async(&mut *conn)
                .await
                .map_err(CacheError::from)?;

            match raw {
                Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
                None => Ok(None),
            }
        }

        async fn set(&self, token: &CachedToken) -> Result<(), TokenCacheError> {
            let payload = serde_json::to_string(token)?;
            let mut conn = self.pool.get().await.map_err(CacheError::from)?;
            let _: () = redis::cmd("SET")
                .arg(&self.key)
                .arg(payload)
                .arg("EXAT")
                .arg(token.expires_at)
                .query_async(&mut *conn)
                .await
                .map_err(CacheError::from)?;
            Ok(())
        }

        async fn clear(&self) -> Result<(), TokenCacheError> {
            let mut conn = self.pool.get().await.map_err(CacheError::from)?;
            let _: () = redis::cmd("DEL")
                .arg(&self.key)
                .query_async(&mut *conn)
                .await
                .map_err(CacheError::from)?;
            Ok(())
        }
    }
}
