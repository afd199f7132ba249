//! Shared fixtures: in-memory stores, a manual clock and a local stand-in for
//! the provider, QR, municipality and mail endpoints.

#![allow(dead_code)]

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use transit_tickets::api::{self, AppState};
use transit_tickets::clock::ManualClock;
use transit_tickets::config::{IssuanceConfig, ProviderConfig};
use transit_tickets::database::memory::{
    InMemoryOrderStore, InMemorySettingsStore, InMemoryTicketStore,
};
use transit_tickets::health::HealthChecker;
use transit_tickets::orders::Order;
use transit_tickets::provider::{InMemoryTokenCache, ProviderClient};
use transit_tickets::services::{
    IssuanceWorkflow, Mailer, MunicipalityNotifier, ProviderService, QrAssetService,
    RecoveryRegistry, TicketEmailService,
};

pub const NOW: i64 = 1_700_000_000;
pub const PROVIDER_30M_ID: u64 = 101;
pub const PROVIDER_60M_ID: u64 = 102;

// ---------------------------------------------------------------------------
// Mock upstream
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MockState {
    pub token_calls: AtomicUsize,
    pub buy_calls: AtomicUsize,
    pub notify_calls: AtomicUsize,
    pub qr_calls: AtomicUsize,
    /// Responses returned by the next buy calls, in order. Empty means success.
    pub buy_script: Mutex<VecDeque<(u16, Value)>>,
    pub token_status: Mutex<Option<u16>>,
    pub buy_bodies: Mutex<Vec<Value>>,
    pub buy_auth: Mutex<Vec<String>>,
    pub notify_bodies: Mutex<Vec<Value>>,
}

impl MockState {
    pub fn script_buy(&self, status: u16, body: Value) {
        self.buy_script
            .lock()
            .unwrap()
            .push_back((status, body));
    }

    pub fn fail_tokens(&self, status: u16) {
        *self.token_status.lock().unwrap() = Some(status);
    }

    pub fn token_calls(&self) -> usize {
        self.token_calls.load(Ordering::SeqCst)
    }

    pub fn buy_calls(&self) -> usize {
        self.buy_calls.load(Ordering::SeqCst)
    }
}

pub struct MockUpstream {
    pub addr: SocketAddr,
    pub state: Arc<MockState>,
}

impl MockUpstream {
    pub async fn start() -> Self {
        let state = Arc::new(MockState::default());
        let app = Router::new()
            .route("/oauth/token", post(token))
            .route("/api/ticket/buy", post(buy))
            .route("/api/ticket", get(catalog))
            .route("/notify", post(notify))
            .route("/qr", get(qr))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn provider_config(&self) -> ProviderConfig {
        ProviderConfig {
            base_url: self.url(""),
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            ticket_30m_id: PROVIDER_30M_ID,
            ticket_60m_id: PROVIDER_60M_ID,
            timeout: Duration::from_secs(2),
            retry_backoff: Duration::from_millis(1),
            ..Default::default()
        }
    }
}

pub fn purchase_body() -> Value {
    json!({
        "data": [{
            "code": "DPMK-7781",
            "qr_content": "iVBORw0KGgo=",
            "ticket_id": 555,
            "valid_from": "2023-11-14 22:15:00",
            "valid_to": "2023-11-14 22:45:00"
        }]
    })
}

async fn token(State(state): State<Arc<MockState>>) -> Response {
    let n = state.token_calls.fetch_add(1, Ordering::SeqCst) + 1;
    if let Some(status) = *state.token_status.lock().unwrap() {
        let code = StatusCode::from_u16(status).unwrap();
        return (code, Json(json!({"error": "invalid_client"}))).into_response();
    }
    Json(json!({"access_token": format!("tok-{}", n), "expires_in": 3600})).into_response()
}

async fn buy(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    state.buy_calls.fetch_add(1, Ordering::SeqCst);
    state.buy_bodies.lock().unwrap().push(body);
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    state.buy_auth.lock().unwrap().push(auth);

    let scripted = state.buy_script.lock().unwrap().pop_front();
    let (status, body) = scripted.unwrap_or_else(|| (200, purchase_body()));
    (StatusCode::from_u16(status).unwrap(), Json(body)).into_response()
}

async fn catalog() -> Json<Value> {
    Json(json!({"data": [{"id": PROVIDER_30M_ID}, {"id": PROVIDER_60M_ID}]}))
}

async fn notify(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> &'static str {
    state.notify_calls.fetch_add(1, Ordering::SeqCst);
    state.notify_bodies.lock().unwrap().push(body);
    "received"
}

async fn qr(State(state): State<Arc<MockState>>) -> Vec<u8> {
    state.qr_calls.fetch_add(1, Ordering::SeqCst);
    b"\x89PNG-from-service".to_vec()
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub tickets: Arc<InMemoryTicketStore>,
    pub orders: Arc<InMemoryOrderStore>,
    pub settings: Arc<InMemorySettingsStore>,
    pub provider: Arc<ProviderService>,
    pub issuance: Arc<IssuanceWorkflow>,
    pub issuance_config: IssuanceConfig,
}

impl Harness {
    pub fn new(provider_config: ProviderConfig, issuance_config: IssuanceConfig) -> Self {
        let clock = Arc::new(ManualClock::new(NOW));
        let tickets = Arc::new(InMemoryTicketStore::new());
        let orders = Arc::new(InMemoryOrderStore::new());
        let settings = Arc::new(InMemorySettingsStore::new());

        let client = ProviderClient::new(
            provider_config,
            Arc::new(InMemoryTokenCache::new()),
            clock.clone(),
        )
        .unwrap();
        let provider = Arc::new(ProviderService::new(
            Arc::new(client),
            tickets.clone(),
            orders.clone(),
            clock.clone(),
        ));
        let issuance = Arc::new(IssuanceWorkflow::new(
            tickets.clone(),
            orders.clone(),
            provider.clone(),
            Arc::new(QrAssetService::new(&issuance_config).unwrap()),
            Arc::new(MunicipalityNotifier::new(&issuance_config).unwrap()),
            clock.clone(),
            issuance_config.clone(),
        ));

        Self {
            clock,
            tickets,
            orders,
            settings,
            provider,
            issuance,
            issuance_config,
        }
    }

    /// Test-mode provider, no QR service, no municipality endpoint.
    pub fn offline() -> Self {
        Self::new(
            ProviderConfig {
                test_mode: true,
                ..Default::default()
            },
            offline_issuance(),
        )
    }

    pub fn recovery(&self) -> RecoveryRegistry {
        RecoveryRegistry::new(
            self.tickets.clone(),
            self.clock.clone(),
            self.issuance_config.clone(),
        )
    }

    pub fn email_service(&self, mailer: Arc<dyn Mailer>) -> TicketEmailService {
        TicketEmailService::new(
            self.tickets.clone(),
            self.orders.clone(),
            mailer,
            self.clock.clone(),
            self.issuance_config.clone(),
        )
    }

    pub fn router(&self, mailer: Arc<dyn Mailer>) -> Router {
        api::router(AppState {
            tickets: self.tickets.clone(),
            issuance: self.issuance.clone(),
            recovery: Arc::new(self.recovery()),
            email: Arc::new(self.email_service(mailer)),
            health: HealthChecker::new(self.provider.clone()),
            clock: self.clock.clone(),
            config: self.issuance_config.clone(),
        })
    }

    pub async fn add_order(&self, order: Order) {
        self.orders.insert_order(order).await;
    }
}

pub fn offline_issuance() -> IssuanceConfig {
    IssuanceConfig {
        public_base_url: "https://tickets.example.sk".to_string(),
        qr_service_url: None,
        municipality_url: None,
        ..Default::default()
    }
}

pub fn ticket_order(id: i64, tag: &str) -> Order {
    let mut order = Order::new(id, "EUR");
    order.ticket_type_tag = Some(tag.to_string());
    order.billing_email = Some("jane@example.com".to_string());
    order
}
