//! Municipal ticketing provider integration

pub mod client;
pub mod error;
pub mod token_cache;
pub mod types;

pub use client::{PreflightReport, ProviderClient};
pub use error::{ProviderError, TokenCacheError};
pub use token_cache::{CachedToken, InMemoryTokenCache, SettingsTokenCache, TokenCache};
pub use types::ProviderResponse;

#[cfg(feature = "cache")]
pub use token_cache::RedisTokenCache;
