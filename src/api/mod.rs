//! HTTP surface: order completion hook, ticket pages, recovery and email.

pub mod orders;
pub mod recovery;
pub mod tickets;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;

use crate::clock::Clock;
use crate::config::IssuanceConfig;
use crate::database::TicketStore;
use crate::error::AppError;
use crate::health::{HealthChecker, HealthState};
use crate::middleware::error::get_request_id_from_headers;
use crate::services::{IssuanceWorkflow, RecoveryRegistry, TicketEmailService};

#[derive(Clone)]
pub struct AppState {
    pub tickets: Arc<dyn TicketStore>,
    pub issuance: Arc<IssuanceWorkflow>,
    pub recovery: Arc<RecoveryRegistry>,
    pub email: Arc<TicketEmailService>,
    pub health: HealthChecker,
    pub clock: Arc<dyn Clock>,
    pub config: IssuanceConfig,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/api/orders/{order_id}/completed",
            post(orders::order_completed),
        )
        .route("/api/orders/{order_id}/ticket", get(orders::order_ticket))
        .route("/tickets/{ticket_id}", get(tickets::view_ticket))
        .route("/api/tickets/send-email", post(tickets::send_email))
        .route(
            "/api/customers/{customer_id}/tickets",
            get(tickets::customer_tickets),
        )
        .route("/recover", get(recovery::recover))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Response {
    let status = state.health.check_health().await;
    let code = match status.status {
        HealthState::Healthy | HealthState::Degraded => StatusCode::OK,
        HealthState::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(status)).into_response()
}

/// Tag an error with the request id set by the request-id layer.
pub(crate) fn tagged(headers: &HeaderMap) -> impl Fn(AppError) -> AppError + '_ {
    move |err| match get_request_id_from_headers(headers) {
        Some(id) => err.with_request_id(id),
        None => err,
    }
}
