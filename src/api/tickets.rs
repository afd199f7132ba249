//! Ticket page, email delivery and per-customer listing.

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{tagged, AppState};
use crate::error::{AppError, DomainError, ValidationError};
use crate::services::ClientTokenList;
use crate::tickets::{DisplayState, SyncStatus, Ticket, TicketId, TicketStatus, TicketType};

#[derive(Debug, Serialize)]
pub struct TicketView {
    pub ticket_id: TicketId,
    pub code: String,
    pub title: String,
    #[serde(rename = "type")]
    pub ticket_type: TicketType,
    pub status: TicketStatus,
    pub display_state: DisplayState,
    pub valid_from: i64,
    pub valid_to: i64,
    pub qr_ref: Option<String>,
    pub provider_code: Option<String>,
    pub sync_status: SyncStatus,
    pub permalink: String,
}

/// GET /tickets/{ticket_id}
///
/// Also the recovery write path: refreshes the ticket's recovery token and
/// returns the client's token list in `Set-Cookie`.
pub async fn view_ticket(
    State(state): State<AppState>,
    Path(ticket_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let ticket_id = TicketId(ticket_id);
    let ticket = state
        .tickets
        .get(ticket_id)
        .await
        .map_err(AppError::from)
        .map_err(tagged(&headers))?
        .ok_or_else(|| {
            tagged(&headers)(AppError::domain(DomainError::TicketNotFound {
                ticket_id: ticket_id.to_string(),
            }))
        })?;

    let now = state.clock.now();
    let view = TicketView {
        ticket_id: ticket.id,
        display_state: ticket.display_state(now),
        permalink: state.config.ticket_permalink(ticket.id.0),
        code: ticket.code,
        title: ticket.title,
        ticket_type: ticket.ticket_type,
        status: ticket.status,
        valid_from: ticket.valid_from,
        valid_to: ticket.valid_to,
        qr_ref: ticket.qr_ref,
        provider_code: ticket.provider_code,
        sync_status: ticket.sync_status,
    };

    let mut response = Json(view).into_response();

    // A view without a cookie update is still a valid view.
    match state.recovery.touch(ticket_id).await {
        Ok(grant) => {
            let cookie_header = headers
                .get(header::COOKIE)
                .and_then(|v| v.to_str().ok());
            let mut list = ClientTokenList::from_cookie_header(cookie_header);
            list.merge(&grant.token, ticket_id, now);

            if let Ok(value) = HeaderValue::from_str(&list.set_cookie()) {
                response.headers_mut().insert(header::SET_COOKIE, value);
            }
        }
        Err(e) => warn!(ticket_id = %ticket_id, error = %e, "recovery token not refreshed"),
    }

    Ok(response)
}

#[derive(Debug, Deserialize)]
pub struct SendEmailRequest {
    pub ticket_id: Option<i64>,
    pub email: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: &'static str,
}

/// POST /api/tickets/send-email
pub async fn send_email(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SendEmailRequest>,
) -> Result<Json<MessageResponse>, AppError> {
    let ticket_id = request
        .ticket_id
        .filter(|id| *id > 0)
        .map(TicketId)
        .ok_or_else(|| {
            tagged(&headers)(AppError::domain(DomainError::TicketNotFound {
                ticket_id: "0".to_string(),
            }))
        })?;

    let email = request.email.unwrap_or_default();
    if email.trim().is_empty() {
        return Err(tagged(&headers)(AppError::validation(
            ValidationError::InvalidEmail { email },
        )));
    }

    state
        .email
        .send(ticket_id, &email)
        .await
        .map_err(AppError::from)
        .map_err(tagged(&headers))?;

    Ok(Json(MessageResponse {
        message: "Email sent.",
    }))
}

#[derive(Debug, Serialize)]
pub struct TicketListItem {
    pub ticket_id: TicketId,
    pub code: String,
    #[serde(rename = "type")]
    pub ticket_type: TicketType,
    pub status: TicketStatus,
    pub valid_to: i64,
    pub permalink: String,
}

/// GET /api/customers/{customer_id}/tickets, newest first.
pub async fn customer_tickets(
    State(state): State<AppState>,
    Path(customer_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<Vec<TicketListItem>>, AppError> {
    let now = state.clock.now();
    let tickets = state
        .tickets
        .list_by_user(customer_id)
        .await
        .map_err(AppError::from)
        .map_err(tagged(&headers))?;

    Ok(Json(
        tickets
            .into_iter()
            .map(|ticket| list_item(&state, ticket, now))
            .collect(),
    ))
}

fn list_item(state: &AppState, ticket: Ticket, now: i64) -> TicketListItem {
    let status = if ticket.is_expired_at(now) {
        TicketStatus::Expired
    } else {
        TicketStatus::Active
    };

    TicketListItem {
        ticket_id: ticket.id,
        permalink: state.config.ticket_permalink(ticket.id.0),
        code: ticket.code,
        ticket_type: ticket.ticket_type,
        status,
        valid_to: ticket.valid_to,
    }
}
