//! Cross-device ticket recovery.
//!
//! Viewing a ticket mints (or refreshes) an opaque recovery token on the ticket
//! and remembers it in a small client-side list carried by the
//! `qr_ticket_tokens` cookie. Any device holding a token can later look the
//! ticket up again without an account.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::IssuanceConfig;
use crate::database::error::DatabaseError;
use crate::database::TicketStore;
use crate::error::{AppError, DomainError, ValidationError};
use crate::tickets::{Ticket, TicketId, TicketStatus, TicketType};

pub const RECOVERY_TTL_SECS: i64 = 7 * 24 * 60 * 60;
pub const TOKEN_COOKIE: &str = "qr_ticket_tokens";
pub const MAX_CLIENT_TOKENS: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("recovery token missing")]
    MissingToken,
    #[error("no ticket for recovery token")]
    NotFound,
    #[error("recovery token expired")]
    Expired,
    #[error("ticket {0} not found")]
    TicketNotFound(TicketId),
    #[error(transparent)]
    Storage(#[from] DatabaseError),
}

impl From<RecoveryError> for AppError {
    fn from(err: RecoveryError) -> Self {
        match err {
            RecoveryError::MissingToken => AppError::validation(ValidationError::MissingField {
                field: "token".to_string(),
            }),
            RecoveryError::NotFound => AppError::domain(DomainError::RecoveryTokenNotFound),
            RecoveryError::Expired => AppError::domain(DomainError::RecoveryTokenExpired),
            RecoveryError::TicketNotFound(id) => AppError::domain(DomainError::TicketNotFound {
                ticket_id: id.to_string(),
            }),
            RecoveryError::Storage(e) => e.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryGrant {
    pub token: String,
    pub expires_at: i64,
}

/// What a recovery lookup reveals about a ticket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TicketSummary {
    pub ticket_id: TicketId,
    pub title: String,
    pub permalink: String,
    pub status: TicketStatus,
    pub valid_to: i64,
    pub token: String,
    pub expires_at: i64,
    #[serde(rename = "type")]
    pub ticket_type: TicketType,
}

pub struct RecoveryRegistry {
    tickets: Arc<dyn TicketStore>,
    clock: Arc<dyn Clock>,
    config: IssuanceConfig,
}

impl RecoveryRegistry {
    pub fn new(tickets: Arc<dyn TicketStore>, clock: Arc<dyn Clock>, config: IssuanceConfig) -> Self {
        Self {
            tickets,
            clock,
            config,
        }
    }

    /// Make sure the ticket carries a live recovery token.
    ///
    /// The token is minted once. Its expiry is pushed out to `now + 7 days` only
    /// after it has lapsed.
    pub async fn touch(&self, ticket_id: TicketId) -> Result<RecoveryGrant, RecoveryError> {
        let ticket = self
            .tickets
            .get(ticket_id)
            .await?
            .ok_or(RecoveryError::TicketNotFound(ticket_id))?;

        let now = self.clock.now();
        let existing = ticket
            .recovery_token
            .clone()
            .filter(|token| !token.is_empty());
        let minted = existing.is_none();
        let token = existing.unwrap_or_else(|| Uuid::new_v4().to_string());

        let expires_at = match ticket.recovery_expires_at {
            Some(expires_at) if !minted && expires_at > now => expires_at,
            _ => now + RECOVERY_TTL_SECS,
        };

        if minted || Some(expires_at) != ticket.recovery_expires_at {
            self.tickets.set_recovery(ticket_id, &token, expires_at).await?;
            info!(ticket_id = %ticket_id, minted, expires_at, "recovery token refreshed");
        }

        Ok(RecoveryGrant { token, expires_at })
    }

    /// Look a ticket up by recovery token.
    pub async fn resolve(&self, token: Option<&str>) -> Result<TicketSummary, RecoveryError> {
        let token = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(RecoveryError::MissingToken)?;

        let ticket = self
            .tickets
            .find_by_recovery_token(token)
            .await?
            .ok_or(RecoveryError::NotFound)?;

        let now = self.clock.now();
        let expires_at = match ticket.recovery_expires_at {
            Some(expires_at) if expires_at > now => expires_at,
            _ => {
                debug!(ticket_id = %ticket.id, "recovery token lapsed");
                return Err(RecoveryError::Expired);
            }
        };

        Ok(self.summary(&ticket, token.to_string(), expires_at))
    }

    /// Reports the stored status; expiry is written by the sweeper.
    fn summary(&self, ticket: &Ticket, token: String, expires_at: i64) -> TicketSummary {
        TicketSummary {
            ticket_id: ticket.id,
            title: ticket.title.clone(),
            permalink: self.config.ticket_permalink(ticket.id.0),
            status: ticket.status,
            valid_to: ticket.valid_to,
            token,
            expires_at,
            ticket_type: ticket.ticket_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientToken {
    pub token: String,
    pub ticket: i64,
    pub updated: i64,
}

/// Recovery tokens remembered by one browser, most recently updated first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientTokenList {
    entries: Vec<ClientToken>,
}

impl ClientTokenList {
    /// Parse from a raw `Cookie` header. Missing or malformed values give an empty list.
    pub fn from_cookie_header(header: Option<&str>) -> Self {
        header
            .into_iter()
            .flat_map(|h| h.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, _)| *name == TOKEN_COOKIE)
            .map(|(_, value)| Self::from_cookie_value(value))
            .unwrap_or_default()
    }

    pub fn from_cookie_value(value: &str) -> Self {
        let decoded = urlencoding::decode(value)
            .map(|v| v.into_owned())
            .unwrap_or_default();
        let entries = serde_json::from_str::<Vec<ClientToken>>(&decoded).unwrap_or_default();
        let mut list = Self { entries };
        list.normalize();
        list
    }

    pub fn entries(&self) -> &[ClientToken] {
        &self.entries
    }

    /// Add or refresh `token`; the oldest entries beyond five are dropped.
    pub fn merge(&mut self, token: &str, ticket_id: TicketId, now: i64) {
        self.entries.retain(|entry| entry.token != token);
        self.entries.push(ClientToken {
            token: token.to_string(),
            ticket: ticket_id.0,
            updated: now,
        });
        self.normalize();
    }

    fn normalize(&mut self) {
        self.entries.retain(|entry| !entry.token.is_empty());
        self.entries.sort_by(|a, b| b.updated.cmp(&a.updated));
        self.entries.truncate(MAX_CLIENT_TOKENS);
    }

    pub fn to_cookie_value(&self) -> String {
        let json = serde_json::to_string(&self.entries).unwrap_or_else(|_| "[]".to_string());
        urlencoding::encode(&json).into_owned()
    }

    /// `Set-Cookie` value carrying the list for the recovery window.
    pub fn set_cookie(&self) -> String {
        format!(
            "{}={}; Path=/; Max-Age={}; SameSite=Lax",
            TOKEN_COOKIE,
            self.to_cookie_value(),
            RECOVERY_TTL_SECS
        )
    }
}
