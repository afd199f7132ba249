//! Health check module
//! Provides health status for the application and its dependencies

use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::services::ProviderService;

/// Health status response
#[derive(Debug, Serialize, Clone)]
pub struct HealthStatus {
    pub status: HealthState,
    pub checks: HashMap<String, ComponentHealth>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Overall health state
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Individual component health status
#[derive(Debug, Serialize, Clone)]
pub struct ComponentHealth {
    pub status: ComponentState,
    pub response_time_ms: Option<u128>,
    pub details: Option<String>,
}

/// Component state
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub enum ComponentState {
    Up,
    Down,
    Warning,
}

impl HealthStatus {
    pub fn new() -> Self {
        Self {
            status: HealthState::Healthy,
            checks: HashMap::new(),
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self.status, HealthState::Healthy)
    }
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentHealth {
    pub fn up(response_time_ms: Option<u128>) -> Self {
        Self {
            status: ComponentState::Up,
            response_time_ms,
            details: None,
        }
    }

    pub fn down(details: Option<String>) -> Self {
        Self {
            status: ComponentState::Down,
            response_time_ms: None,
            details,
        }
    }

    pub fn warning(response_time_ms: Option<u128>, details: Option<String>) -> Self {
        Self {
            status: ComponentState::Warning,
            response_time_ms,
            details,
        }
    }
}

/// Health checker for the application.
///
/// Storage outages make the service unhealthy. Provider problems only degrade
/// it: tickets are still issued and synced later by the sweeper.
#[derive(Clone)]
pub struct HealthChecker {
    #[cfg(feature = "database")]
    db_pool: Option<sqlx::PgPool>,
    #[cfg(feature = "cache")]
    cache: Option<crate::cache::RedisPool>,
    provider: Arc<ProviderService>,
}

impl HealthChecker {
    pub fn new(provider: Arc<ProviderService>) -> Self {
        Self {
            #[cfg(feature = "database")]
            db_pool: None,
            #[cfg(feature = "cache")]
            cache: None,
            provider,
        }
    }

    #[cfg(feature = "database")]
    pub fn with_database(mut self, pool: sqlx::PgPool) -> Self {
        self.db_pool = Some(pool);
        self
    }

    #[cfg(feature = "cache")]
    pub fn with_cache(mut self, pool: crate::cache::RedisPool) -> Self {
        self.cache = Some(pool);
        self
    }

    /// Perform comprehensive health check
    pub async fn check_health(&self) -> HealthStatus {
        let mut health_status = HealthStatus::new();
        let mut unhealthy = false;

        #[cfg(feature = "database")]
        if let Some(pool) = &self.db_pool {
            let component = timed("database", Duration::from_secs(5), async {
                crate::database::health_check(pool)
                    .await
                    .map_err(|e| e.to_string())
            })
            .await;
            unhealthy |= component.status == ComponentState::Down;
            health_status
                .checks
                .insert("database".to_string(), component);
        }

        #[cfg(feature = "cache")]
        if let Some(pool) = &self.cache {
            let component = timed("cache", Duration::from_secs(5), async {
                crate::cache::health_check(pool)
                    .await
                    .map_err(|e| e.to_string())
            })
            .await;
            unhealthy |= component.status == ComponentState::Down;
            health_status.checks.insert("cache".to_string(), component);
        }

        let provider = self.check_provider().await;
        let degraded = provider.status != ComponentState::Up;
        health_status.checks.insert("provider".to_string(), provider);

        health_status.status = if unhealthy {
            HealthState::Unhealthy
        } else if degraded {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        };

        health_status
    }

    /// Readiness, then the mapped ticket ids against the provider catalog.
    async fn check_provider(&self) -> ComponentHealth {
        if self.provider.is_test_mode() {
            return ComponentHealth::warning(None, Some("test mode".to_string()));
        }

        let start = Instant::now();
        let readiness = timeout(Duration::from_secs(10), self.provider.ensure_ready()).await;
        match readiness {
            Ok(Ok(())) => {}
            Ok(Err(not_ready)) => {
                warn!(diagnostic = %not_ready.diagnostic, "provider not ready");
                return ComponentHealth::down(Some(not_ready.diagnostic));
            }
            Err(_) => {
                error!("Provider health check timed out");
                return ComponentHealth::down(Some("Timeout".to_string()));
            }
        }

        match timeout(Duration::from_secs(10), self.provider.client().preflight()).await {
            Ok(Ok(report)) if report.is_ok() => {
                let elapsed = start.elapsed().as_millis();
                info!("Provider health check: OK ({}ms)", elapsed);
                ComponentHealth::up(Some(elapsed))
            }
            Ok(Ok(report)) => ComponentHealth::warning(
                Some(start.elapsed().as_millis()),
                Some(format!(
                    "unmapped ticket types: {:?}, unknown to provider: {:?}",
                    report.unmapped, report.missing
                )),
            ),
            Ok(Err(e)) => ComponentHealth::warning(None, Some(e.to_string())),
            Err(_) => ComponentHealth::warning(None, Some("Preflight timeout".to_string())),
        }
    }
}

async fn timed<F>(name: &str, limit: Duration, check: F) -> ComponentHealth
where
    F: Future<Output = Result<(), String>>,
{
    let start = Instant::now();
    match timeout(limit, check).await {
        Ok(Ok(())) => {
            let elapsed = start.elapsed().as_millis();
            info!("{} health check: OK ({}ms)", name, elapsed);
            ComponentHealth::up(Some(elapsed))
        }
        Ok(Err(e)) => {
            error!("{} health check failed: {}", name, e);
            ComponentHealth::down(Some(e))
        }
        Err(_) => {
            error!("{} health check timed out", name);
            ComponentHealth::down(Some("Timeout".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::ProviderConfig;
    use crate::database::memory::{InMemoryOrderStore, InMemoryTicketStore};
    use crate::provider::{InMemoryTokenCache, ProviderClient};

    fn checker(config: ProviderConfig) -> HealthChecker {
        let clock = Arc::new(ManualClock::new(0));
        let client =
            ProviderClient::new(config, Arc::new(InMemoryTokenCache::new()), clock.clone())
                .unwrap();
        HealthChecker::new(Arc::new(ProviderService::new(
            Arc::new(client),
            Arc::new(InMemoryTicketStore::new()),
            Arc::new(InMemoryOrderStore::new()),
            clock,
        )))
    }

    #[tokio::test]
    async fn test_health_status_creation() {
        let health_status = HealthStatus::new();
        assert!(matches!(health_status.status, HealthState::Healthy));
        assert!(health_status.checks.is_empty());
        assert!(health_status.timestamp <= chrono::Utc::now());
    }

    #[test]
    fn test_component_health_states() {
        let up_health = ComponentHealth::up(Some(100));
        assert!(matches!(up_health.status, ComponentState::Up));
        assert_eq!(up_health.response_time_ms, Some(100));

        let down_health = ComponentHealth::down(Some("Test error".to_string()));
        assert!(matches!(down_health.status, ComponentState::Down));
        assert_eq!(down_health.details, Some("Test error".to_string()));
    }

    #[tokio::test]
    async fn unconfigured_provider_degrades_service() {
        let status = checker(ProviderConfig::default()).check_health().await;
        assert_eq!(status.status, HealthState::Degraded);
        let provider = &status.checks["provider"];
        assert_eq!(provider.status, ComponentState::Down);
        assert_eq!(provider.details.as_deref(), Some("DPMK client not configured."));
    }

    #[tokio::test]
    async fn test_mode_is_flagged() {
        let status = checker(ProviderConfig {
            test_mode: true,
            ..Default::default()
        })
        .check_health()
        .await;
        assert_eq!(status.checks["provider"].status, ComponentState::Warning);
    }
}
