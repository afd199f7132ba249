//! Application configuration module
//! Handles environment variable loading, configuration validation, and application settings

use std::env;
use std::time::Duration;

use crate::tickets::TicketType;

/// Main application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
    pub provider: ProviderConfig,
    pub issuance: IssuanceConfig,
    pub sweeper: SweeperConfig,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout: u64,   // seconds
    pub idle_timeout: Option<u64>, // seconds
}

/// Cache configuration. Redis is optional; without it the provider token is
/// cached in the settings store.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub redis_url: Option<String>,
    pub max_connections: u32,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Plain,
}

impl LogFormat {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Plain,
        }
    }
}

/// Municipal provider connection and policy settings
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Label stored on every ticket's sync sub-state
    pub name: String,
    pub base_url: String,
    pub client_id: String,
    pub client_secret: String,
    /// Provider-side ticket id for the 30 minute type (0 = unmapped)
    pub ticket_30m_id: u64,
    /// Provider-side ticket id for the 60 minute type (0 = unmapped)
    pub ticket_60m_id: u64,
    pub test_mode: bool,
    /// Forward the purchaser's device QR payload on buy
    pub device_qr_enabled: bool,
    pub timeout: Duration,
    /// Base delay before retrying a 5xx response, doubled per attempt
    pub retry_backoff: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: "DPMK".to_string(),
            base_url: "https://api.vcl.dpmk.sk".to_string(),
            client_id: String::new(),
            client_secret: String::new(),
            ticket_30m_id: 0,
            ticket_60m_id: 0,
            test_mode: false,
            device_qr_enabled: false,
            timeout: Duration::from_secs(8),
            retry_backoff: Duration::from_millis(250),
        }
    }
}

/// Issuance side channels and public URLs
#[derive(Debug, Clone)]
pub struct IssuanceConfig {
    /// Public site root used to build ticket permalinks
    pub public_base_url: String,
    /// External QR image endpoint; `None` always renders the local placeholder
    pub qr_service_url: Option<String>,
    pub qr_timeout: Duration,
    /// Downstream municipality endpoint notified for stub-synced tickets
    pub municipality_url: Option<String>,
    pub municipality_timeout: Duration,
    /// HTTP mail relay; `None` logs outgoing mail instead of sending it
    pub mail_relay_url: Option<String>,
}

impl Default for IssuanceConfig {
    fn default() -> Self {
        Self {
            public_base_url: "http://127.0.0.1:8000".to_string(),
            qr_service_url: Some("https://api.qrserver.com/v1/create-qr-code/".to_string()),
            qr_timeout: Duration::from_secs(10),
            municipality_url: None,
            municipality_timeout: Duration::from_secs(5),
            mail_relay_url: None,
        }
    }
}

/// Expiration sweeper schedule
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub expire_batch: i64,
    pub retry_batch: i64,
    /// Minimum spacing between two retry passes
    pub retry_gate_secs: i64,
    /// Lifetime provider attempts after which a ticket is no longer retried
    pub max_attempts: i32,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(60),
            expire_batch: 50,
            retry_batch: 10,
            retry_gate_secs: 300,
            max_attempts: 5,
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenv::dotenv().ok();

        Ok(AppConfig {
            server: ServerConfig::from_env()?,
            database: DatabaseConfig::from_env()?,
            cache: CacheConfig::from_env()?,
            logging: LoggingConfig::from_env()?,
            provider: ProviderConfig::from_env()?,
            issuance: IssuanceConfig::from_env()?,
            sweeper: SweeperConfig::from_env()?,
        })
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        self.database.validate()?;
        self.logging.validate()?;
        self.provider.validate()?;
        self.issuance.validate()?;

        Ok(())
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(ServerConfig {
            host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env::var("SERVER_PORT")
                .unwrap_or_else(|_| "8000".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("SERVER_PORT".to_string()))?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidValue(
                "SERVER_PORT cannot be 0".to_string(),
            ));
        }

        if self.host.is_empty() {
            return Err(ConfigError::InvalidValue(
                "SERVER_HOST cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(DatabaseConfig {
            url: env::var("DATABASE_URL").unwrap_or_default(),
            max_connections: parse_var("DB_MAX_CONNECTIONS", 20)?,
            min_connections: parse_var("DB_MIN_CONNECTIONS", 2)?,
            connection_timeout: parse_var("DB_CONNECTION_TIMEOUT", 30)?,
            idle_timeout: env::var("DB_IDLE_TIMEOUT")
                .ok()
                .and_then(|val| val.parse().ok()),
        })
    }

    /// The URL is only required when running against Postgres, so it is checked
    /// at pool initialization rather than here.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue("DB_MAX_CONNECTIONS".to_string()));
        }

        if self.min_connections > self.max_connections {
            return Err(ConfigError::InvalidValue(
                "DB_MIN_CONNECTIONS must be <= DB_MAX_CONNECTIONS".to_string(),
            ));
        }

        Ok(())
    }
}

impl CacheConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(CacheConfig {
            redis_url: non_empty_var("REDIS_URL"),
            max_connections: parse_var("CACHE_MAX_CONNECTIONS", 10)?,
        })
    }
}

impl LoggingConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string()),
            format: LogFormat::parse(&env::var("LOG_FORMAT").unwrap_or_default()),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];
        if !valid_levels.contains(&self.level.to_uppercase().as_str()) {
            return Err(ConfigError::InvalidValue("LOG_LEVEL".to_string()));
        }

        Ok(())
    }
}

impl ProviderConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(ProviderConfig {
            name: env::var("PROVIDER_NAME").unwrap_or(defaults.name),
            base_url: normalize_base_url(
                &env::var("PROVIDER_BASE_URL").unwrap_or(defaults.base_url),
            ),
            client_id: env::var("PROVIDER_CLIENT_ID")
                .unwrap_or_default()
                .trim()
                .to_string(),
            client_secret: env::var("PROVIDER_CLIENT_SECRET")
                .unwrap_or_default()
                .trim()
                .to_string(),
            ticket_30m_id: parse_var("PROVIDER_TICKET_30M_ID", 0)?,
            ticket_60m_id: parse_var("PROVIDER_TICKET_60M_ID", 0)?,
            test_mode: env_flag("PROVIDER_TEST_MODE", false),
            device_qr_enabled: env_flag("PROVIDER_DEVICE_QR_ENABLED", false),
            timeout: Duration::from_secs(parse_var("PROVIDER_TIMEOUT_SECS", 8)?),
            retry_backoff: Duration::from_millis(parse_var("PROVIDER_RETRY_BACKOFF_MS", 250)?),
        })
    }

    /// Provider-side id mapped to a local ticket type, 0 when unmapped
    pub fn ticket_id_for(&self, ticket_type: TicketType) -> u64 {
        match ticket_type {
            TicketType::ThirtyMinutes => self.ticket_30m_id,
            TicketType::SixtyMinutes => self.ticket_60m_id,
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.base_url.is_empty() && !self.client_id.is_empty() && !self.client_secret.is_empty()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.base_url.is_empty()
            && !self.base_url.starts_with("http://")
            && !self.base_url.starts_with("https://")
        {
            return Err(ConfigError::InvalidValue(
                "PROVIDER_BASE_URL must be a valid URL".to_string(),
            ));
        }

        if self.timeout.is_zero() {
            return Err(ConfigError::InvalidValue(
                "PROVIDER_TIMEOUT_SECS".to_string(),
            ));
        }

        Ok(())
    }
}

impl IssuanceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(IssuanceConfig {
            public_base_url: normalize_base_url(
                &env::var("PUBLIC_BASE_URL").unwrap_or(defaults.public_base_url),
            ),
            qr_service_url: match env::var("QR_SERVICE_URL") {
                Ok(value) if value.trim().is_empty() => None,
                Ok(value) => Some(value.trim().to_string()),
                Err(_) => defaults.qr_service_url,
            },
            qr_timeout: defaults.qr_timeout,
            municipality_url: non_empty_var("MUNI_STUB_URL"),
            municipality_timeout: defaults.municipality_timeout,
            mail_relay_url: non_empty_var("MAIL_RELAY_URL"),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.public_base_url.is_empty() {
            return Err(ConfigError::InvalidValue("PUBLIC_BASE_URL".to_string()));
        }

        for (name, url) in [
            ("QR_SERVICE_URL", &self.qr_service_url),
            ("MUNI_STUB_URL", &self.municipality_url),
            ("MAIL_RELAY_URL", &self.mail_relay_url),
        ] {
            if let Some(url) = url {
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    return Err(ConfigError::InvalidValue(format!(
                        "{} must be a valid URL",
                        name
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn ticket_permalink(&self, ticket_id: i64) -> String {
        format!("{}/tickets/{}", self.public_base_url, ticket_id)
    }
}

impl SweeperConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(SweeperConfig {
            enabled: env_flag("SWEEPER_ENABLED", defaults.enabled),
            interval: Duration::from_secs(parse_var(
                "SWEEPER_INTERVAL_SECS",
                defaults.interval.as_secs(),
            )?),
            ..defaults
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(name.to_string())),
        _ => Ok(default),
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_flag(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(raw) => matches!(
            raw.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

fn normalize_base_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),

    #[error("Invalid value for configuration: {0}")]
    InvalidValue(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_validation() {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8000,
        };

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_port_validation() {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn provider_requires_all_credentials() {
        let mut config = ProviderConfig::default();
        assert!(!config.is_configured());

        config.client_id = "id".to_string();
        config.client_secret = "secret".to_string();
        assert!(config.is_configured());

        config.base_url = String::new();
        assert!(!config.is_configured());
    }

    #[test]
    fn ticket_ids_map_by_type() {
        let config = ProviderConfig {
            ticket_30m_id: 11,
            ..Default::default()
        };
        assert_eq!(config.ticket_id_for(TicketType::ThirtyMinutes), 11);
        assert_eq!(config.ticket_id_for(TicketType::SixtyMinutes), 0);
    }

    #[test]
    fn provider_rejects_non_http_base_url() {
        let config = ProviderConfig {
            base_url: "ftp://provider".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn issuance_rejects_bad_side_channel_url() {
        let config = IssuanceConfig {
            municipality_url: Some("muni.local/notify".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn permalink_uses_public_base() {
        let config = IssuanceConfig {
            public_base_url: "https://tickets.example.sk".to_string(),
            ..Default::default()
        };
        assert_eq!(
            config.ticket_permalink(42),
            "https://tickets.example.sk/tickets/42"
        );
    }

    #[test]
    fn base_url_is_trimmed() {
        assert_eq!(normalize_base_url(" https://a.sk/ "), "https://a.sk");
    }

    #[test]
    fn log_format_parsing() {
        assert_eq!(LogFormat::parse("JSON"), LogFormat::Json);
        assert_eq!(LogFormat::parse("pretty"), LogFormat::Plain);
    }
}
