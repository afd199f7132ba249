//! Order-side hooks: payment completion and the order to ticket redirect.

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::{IntoResponse, Redirect, Response},
    Json,
};
use serde::Serialize;
use tracing::info;

use super::{tagged, AppState};
use crate::error::{AppError, DomainError};
use crate::services::IssuanceOutcome;
use crate::tickets::{OrderId, SyncOutcome, TicketId};

#[derive(Debug, Serialize)]
pub struct CompletionResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticket_id: Option<TicketId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync: Option<SyncOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// POST /api/orders/{order_id}/completed
pub async fn order_completed(
    State(state): State<AppState>,
    Path(order_id): Path<OrderId>,
    headers: HeaderMap,
) -> Result<Json<CompletionResponse>, AppError> {
    let outcome = state
        .issuance
        .on_order_completed(order_id)
        .await
        .map_err(AppError::from)
        .map_err(tagged(&headers))?;

    info!(order_id, outcome = outcome.label(), "order completion handled");

    let (sync, message) = match &outcome {
        IssuanceOutcome::OrderNotFound => {
            return Err(tagged(&headers)(AppError::domain(
                DomainError::OrderNotFound { order_id },
            )))
        }
        IssuanceOutcome::Issued { sync, .. } => (Some(*sync), None),
        IssuanceOutcome::Failed(reason) => (None, Some(reason.clone())),
        IssuanceOutcome::AlreadyIssued(_) | IssuanceOutcome::NotTicketOrder => (None, None),
    };

    Ok(Json(CompletionResponse {
        status: outcome.label(),
        ticket_id: outcome.ticket_id(),
        sync,
        message,
    }))
}

/// GET /api/orders/{order_id}/ticket: 303 to the ticket page.
pub async fn order_ticket(
    State(state): State<AppState>,
    Path(order_id): Path<OrderId>,
    headers: HeaderMap,
) -> Response {
    match state.issuance.ticket_permalink_for_order(order_id).await {
        Ok(Some(permalink)) => Redirect::to(&permalink).into_response(),
        Ok(None) => tagged(&headers)(AppError::domain(DomainError::TicketNotIssued {
            order_id,
        }))
        .into_response(),
        Err(e) => tagged(&headers)(AppError::from(e)).into_response(),
    }
}
