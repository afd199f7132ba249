use axum::middleware::from_fn;
use dotenv::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};
use tracing::{error, info, warn};

use transit_tickets::api::{self, AppState};
use transit_tickets::clock::{Clock, SystemClock};
use transit_tickets::config::AppConfig;
use transit_tickets::database::memory::{
    InMemoryOrderStore, InMemorySettingsStore, InMemoryTicketStore,
};
use transit_tickets::database::{OrderStore, SettingsStore, TicketStore};
use transit_tickets::health::HealthChecker;
use transit_tickets::logging::init_tracing_with;
use transit_tickets::middleware::logging::{request_logging_middleware, UuidRequestId};
use transit_tickets::provider::{ProviderClient, SettingsTokenCache, TokenCache};
use transit_tickets::services::{
    HttpMailRelay, IssuanceWorkflow, LogMailer, Mailer, MunicipalityNotifier, ProviderService,
    QrAssetService, RecoveryRegistry, TicketEmailService,
};
use transit_tickets::workers::ExpirationSweeper;

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}

async fn shutdown_signal_with_notify(shutdown_tx: watch::Sender<bool>) {
    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
}

/// Ticket, order and settings storage chosen at startup.
struct Stores {
    tickets: Arc<dyn TicketStore>,
    orders: Arc<dyn OrderStore>,
    settings: Arc<dyn SettingsStore>,
    #[cfg(feature = "database")]
    pool: Option<sqlx::PgPool>,
}

impl Stores {
    fn in_memory() -> Self {
        Self {
            tickets: Arc::new(InMemoryTicketStore::new()),
            orders: Arc::new(InMemoryOrderStore::new()),
            settings: Arc::new(InMemorySettingsStore::new()),
            #[cfg(feature = "database")]
            pool: None,
        }
    }
}

#[cfg(feature = "database")]
async fn init_stores(config: &AppConfig, skip_externals: bool) -> anyhow::Result<Stores> {
    use transit_tickets::database::init_pool_from_config;
    use transit_tickets::database::order_repository::OrderRepository;
    use transit_tickets::database::settings_repository::SettingsRepository;
    use transit_tickets::database::ticket_repository::TicketRepository;

    if skip_externals {
        info!("Skipping database initialization (SKIP_EXTERNALS=true), using in-memory stores");
        return Ok(Stores::in_memory());
    }

    info!("Initializing database connection pool...");
    let pool = init_pool_from_config(&config.database).await.map_err(|e| {
        error!("Failed to initialize database pool: {}", e);
        e
    })?;
    info!(
        max_connections = pool.options().get_max_connections(),
        "Database connection pool initialized"
    );

    Ok(Stores {
        tickets: Arc::new(TicketRepository::new(pool.clone())),
        orders: Arc::new(OrderRepository::new(pool.clone())),
        settings: Arc::new(SettingsRepository::new(pool.clone())),
        pool: Some(pool),
    })
}

#[cfg(not(feature = "database"))]
async fn init_stores(_config: &AppConfig, _skip_externals: bool) -> anyhow::Result<Stores> {
    info!("Built without the database feature, using in-memory stores");
    Ok(Stores::in_memory())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let config = AppConfig::from_env()?;
    init_tracing_with(config.logging.format);
    config.validate()?;

    let skip_externals = std::env::var("SKIP_EXTERNALS")
        .unwrap_or_else(|_| "false".to_string())
        .to_lowercase()
        == "true";

    info!(
        version = env!("CARGO_PKG_VERSION"),
        provider = %config.provider.name,
        test_mode = config.provider.test_mode,
        "Starting transit ticket backend"
    );

    let stores = init_stores(&config, skip_externals).await?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // Provider token cache: Redis when configured, else the settings store.
    #[allow(unused_mut)]
    let mut token_cache: Arc<dyn TokenCache> = Arc::new(SettingsTokenCache::new(
        stores.settings.clone(),
        &config.provider.name,
    ));

    #[cfg(feature = "cache")]
    let redis_pool = match transit_tickets::cache::RedisPoolConfig::from_app(&config.cache) {
        Some(pool_config) if !skip_externals => {
            info!("Initializing Redis cache connection pool...");
            match transit_tickets::cache::init_cache_pool(pool_config).await {
                Ok(pool) => {
                    token_cache = Arc::new(transit_tickets::provider::RedisTokenCache::new(
                        pool.clone(),
                        &config.provider.name,
                    ));
                    info!("Provider tokens cached in Redis");
                    Some(pool)
                }
                Err(e) => {
                    warn!(error = %e, "Redis unavailable, provider tokens cached in settings");
                    None
                }
            }
        }
        _ => None,
    };

    let client = ProviderClient::new(config.provider.clone(), token_cache, clock.clone())?;
    let provider = Arc::new(ProviderService::new(
        Arc::new(client),
        stores.tickets.clone(),
        stores.orders.clone(),
        clock.clone(),
    ));
    if let Err(not_ready) = provider.ensure_ready().await {
        warn!(diagnostic = %not_ready.diagnostic, "Provider not ready at startup");
    }

    let issuance = Arc::new(IssuanceWorkflow::new(
        stores.tickets.clone(),
        stores.orders.clone(),
        provider.clone(),
        Arc::new(QrAssetService::new(&config.issuance)?),
        Arc::new(MunicipalityNotifier::new(&config.issuance)?),
        clock.clone(),
        config.issuance.clone(),
    ));

    let mailer: Arc<dyn Mailer> = match &config.issuance.mail_relay_url {
        Some(url) => Arc::new(HttpMailRelay::new(url.clone(), Duration::from_secs(10))?),
        None => Arc::new(LogMailer),
    };

    #[allow(unused_mut)]
    let mut health = HealthChecker::new(provider.clone());
    #[cfg(feature = "database")]
    if let Some(pool) = stores.pool.clone() {
        health = health.with_database(pool);
    }
    #[cfg(feature = "cache")]
    if let Some(pool) = redis_pool {
        health = health.with_cache(pool);
    }

    let state = AppState {
        tickets: stores.tickets.clone(),
        issuance,
        recovery: Arc::new(RecoveryRegistry::new(
            stores.tickets.clone(),
            clock.clone(),
            config.issuance.clone(),
        )),
        email: Arc::new(TicketEmailService::new(
            stores.tickets.clone(),
            stores.orders.clone(),
            mailer,
            clock.clone(),
            config.issuance.clone(),
        )),
        health,
        clock: clock.clone(),
        config: config.issuance.clone(),
    };

    let (worker_shutdown_tx, worker_shutdown_rx) = watch::channel(false);
    let sweeper_handle = if config.sweeper.enabled {
        let sweeper = ExpirationSweeper::new(
            stores.tickets.clone(),
            stores.settings.clone(),
            provider.clone(),
            clock.clone(),
            config.sweeper.clone(),
        );
        Some(tokio::spawn(sweeper.run_loop(worker_shutdown_rx)))
    } else {
        info!("Expiration sweeper disabled (SWEEPER_ENABLED=false)");
        None
    };

    let app = api::router(state).layer(
        ServiceBuilder::new()
            .layer(SetRequestIdLayer::x_request_id(UuidRequestId))
            .layer(from_fn(request_logging_middleware))
            .layer(PropagateRequestIdLayer::x_request_id()),
    );

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to address {}: {}", addr, e);
        e
    })?;

    info!(address = %addr, "Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_with_notify(worker_shutdown_tx.clone()))
        .await?;

    let _ = worker_shutdown_tx.send(true);
    if let Some(handle) = sweeper_handle {
        if tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .is_err()
        {
            error!("Timed out waiting for expiration sweeper shutdown");
        }
    }

    info!("Server shutdown complete");
    Ok(())
}
