//! Downstream municipality notification for stub-synced tickets.
//!
//! Best effort: issuance records the outcome as an order note and carries on.

use reqwest::Client;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::IssuanceConfig;
use crate::tickets::{OrderId, Ticket};

pub const MAX_RESPONSE_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotifyError {
    #[error("{0}")]
    Transport(String),
}

#[derive(Debug, Serialize)]
pub struct TicketNotice<'a> {
    pub code: &'a str,
    #[serde(rename = "type")]
    pub ticket_type: &'static str,
    pub valid_from: i64,
    pub valid_to: i64,
    pub order_id: OrderId,
    pub email: &'a str,
}

impl<'a> From<&'a Ticket> for TicketNotice<'a> {
    fn from(ticket: &'a Ticket) -> Self {
        Self {
            code: &ticket.code,
            ticket_type: ticket.ticket_type.as_str(),
            valid_from: ticket.valid_from,
            valid_to: ticket.valid_to,
            order_id: ticket.order_id,
            email: ticket.email.as_deref().unwrap_or(""),
        }
    }
}

/// What the municipality endpoint answered, body cut to 200 characters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoticeReceipt {
    pub status: u16,
    pub body: String,
}

pub struct MunicipalityNotifier {
    http: Client,
    url: Option<String>,
}

impl MunicipalityNotifier {
    pub fn new(config: &IssuanceConfig) -> Result<Self, NotifyError> {
        let http = Client::builder()
            .timeout(config.municipality_timeout)
            .build()
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            url: config.municipality_url.clone().filter(|u| !u.is_empty()),
        })
    }

    /// POST the ticket summary. `Ok(None)` when no endpoint is configured.
    pub async fn notify(&self, ticket: &Ticket) -> Result<Option<NoticeReceipt>, NotifyError> {
        let Some(url) = self.url.as_deref() else {
            return Ok(None);
        };

        let response = self
            .http
            .post(url)
            .json(&TicketNotice::from(ticket))
            .send()
            .await
            .map_err(|e| {
                warn!(ticket_id = %ticket.id, error = %e, "municipality notification failed");
                NotifyError::Transport(e.to_string())
            })?;

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        info!(ticket_id = %ticket.id, status, "municipality notified");

        Ok(Some(NoticeReceipt {
            status,
            body: body.chars().take(MAX_RESPONSE_CHARS).collect(),
        }))
    }
}
