use thiserror::Error;

/// Failures talking to the municipal provider
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("{provider} client not configured.")]
    NotConfigured { provider: String },

    #[error("Unable to retrieve token: {reason}")]
    TokenUnavailable { reason: String },

    #[error("Authentication failed.")]
    Authentication,

    #[error("network error: {message}")]
    Network { message: String },

    #[error("invalid provider response: {message}")]
    InvalidResponse { message: String },

    #[error("request failed (HTTP {status}): {message}")]
    Request { status: u16, message: String },
}

/// Token cache read or write failure. The client treats these as a cache miss.
#[derive(Debug, Clone, Error)]
pub enum TokenCacheError {
    #[error("token cache storage error: {0}")]
    Storage(String),

    #[error("token cache serialization error: {0}")]
    Serialization(String),
}

impl From<crate::database::error::DatabaseError> for TokenCacheError {
    fn from(err: crate::database::error::DatabaseError) -> Self {
        TokenCacheError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for TokenCacheError {
    fn from(err: serde_json::Error) -> Self {
        TokenCacheError::Serialization(err.to_string())
    }
}

#[cfg(feature = "cache")]
impl From<crate::cache::CacheError> for TokenCacheError {
    fn from(err: crate::cache::CacheError) -> Self {
        TokenCacheError::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authentication_message_is_stable() {
        assert_eq!(ProviderError::Authentication.to_string(), "Authentication failed.");
    }

    #[test]
    fn not_configured_names_the_provider() {
        assert_eq!(
            ProviderError::NotConfigured {
                provider: "DPMK".to_string()
            }
            .to_string(),
            "DPMK client not configured."
        );
    }
}
