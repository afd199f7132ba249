use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type OrderId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TicketId(pub i64);

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Product sold: a ticket valid for a fixed number of minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TicketType {
    #[serde(rename = "30m")]
    ThirtyMinutes,
    #[serde(rename = "60m")]
    SixtyMinutes,
}

impl TicketType {
    pub const ALL: [TicketType; 2] = [TicketType::ThirtyMinutes, TicketType::SixtyMinutes];

    pub fn as_str(&self) -> &'static str {
        match self {
            TicketType::ThirtyMinutes => "30m",
            TicketType::SixtyMinutes => "60m",
        }
    }

    pub fn duration_secs(&self) -> i64 {
        match self {
            TicketType::ThirtyMinutes => 30 * 60,
            TicketType::SixtyMinutes => 60 * 60,
        }
    }
}

impl fmt::Display for TicketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TicketType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "30m" => Ok(TicketType::ThirtyMinutes),
            "60m" => Ok(TicketType::SixtyMinutes),
            other => Err(ParseEnumError {
                kind: "ticket type",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketStatus {
    Active,
    Expired,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::Active => "active",
            TicketStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TicketStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(TicketStatus::Active),
            "expired" => Ok(TicketStatus::Expired),
            other => Err(ParseEnumError {
                kind: "ticket status",
                value: other.to_string(),
            }),
        }
    }
}

/// Provider synchronization state of a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Ok,
    Stub,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Ok => "ok",
            SyncStatus::Stub => "stub",
            SyncStatus::Failed => "failed",
        }
    }

    /// Allowed moves: pending -> ok|stub|failed, failed -> ok|failed.
    pub fn can_transition_to(&self, next: SyncStatus) -> bool {
        match (self, next) {
            (SyncStatus::Pending, SyncStatus::Ok)
            | (SyncStatus::Pending, SyncStatus::Stub)
            | (SyncStatus::Pending, SyncStatus::Failed) => true,
            (SyncStatus::Failed, SyncStatus::Ok) | (SyncStatus::Failed, SyncStatus::Failed) => {
                true
            }
            (SyncStatus::Pending, SyncStatus::Pending)
            | (SyncStatus::Failed, SyncStatus::Pending)
            | (SyncStatus::Failed, SyncStatus::Stub)
            | (SyncStatus::Ok, _)
            | (SyncStatus::Stub, _) => false,
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SyncStatus::Pending),
            "ok" => Ok(SyncStatus::Ok),
            "stub" => Ok(SyncStatus::Stub),
            "failed" => Ok(SyncStatus::Failed),
            other => Err(ParseEnumError {
                kind: "sync status",
                value: other.to_string(),
            }),
        }
    }
}

/// Result of one synchronization attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOutcome {
    Ok,
    Stub,
    Failed,
}

/// What a ticket page should show.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayState {
    Active,
    Expired,
    /// Provider sync failed; the ticket cannot be shown as valid yet.
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ticket {
    pub id: TicketId,
    pub code: String,
    pub title: String,
    pub ticket_type: TicketType,
    pub status: TicketStatus,
    pub valid_from: i64,
    pub valid_to: i64,
    pub order_id: OrderId,
    pub user_id: Option<i64>,
    pub email: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub qr_ref: Option<String>,
    pub email_send_count: i32,
    #[serde(skip_serializing)]
    pub recovery_token: Option<String>,
    pub recovery_expires_at: Option<i64>,
    pub provider: Option<String>,
    pub provider_ticket_id: Option<i64>,
    pub provider_code: Option<String>,
    #[serde(skip_serializing)]
    pub provider_qr: Option<String>,
    pub sync_status: SyncStatus,
    pub provider_attempts: i32,
    pub provider_last_error: Option<String>,
    pub created_at: i64,
}

impl Ticket {
    /// Expired either by the sweeper or simply past its window.
    pub fn is_expired_at(&self, now: i64) -> bool {
        matches!(self.status, TicketStatus::Expired) || now > self.valid_to
    }

    pub fn display_state(&self, now: i64) -> DisplayState {
        if self.is_expired_at(now) {
            return DisplayState::Expired;
        }
        match self.sync_status {
            SyncStatus::Failed => DisplayState::Unavailable,
            SyncStatus::Pending | SyncStatus::Ok | SyncStatus::Stub => DisplayState::Active,
        }
    }
}

/// Fields fixed at issuance time.
#[derive(Debug, Clone)]
pub struct NewTicket {
    pub code: String,
    pub ticket_type: TicketType,
    pub valid_from: i64,
    pub order_id: OrderId,
    pub user_id: Option<i64>,
    pub email: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub created_at: i64,
}

impl NewTicket {
    pub fn title(&self) -> String {
        format!("Ticket {}", self.code)
    }

    pub fn valid_to(&self) -> i64 {
        self.valid_from + self.ticket_type.duration_secs()
    }

    /// Materialize the record a store persists for this request.
    pub fn into_ticket(self, id: TicketId) -> Ticket {
        Ticket {
            id,
            title: self.title(),
            valid_to: self.valid_to(),
            code: self.code,
            ticket_type: self.ticket_type,
            status: TicketStatus::Active,
            valid_from: self.valid_from,
            order_id: self.order_id,
            user_id: self.user_id,
            email: self.email,
            amount_cents: self.amount_cents,
            currency: self.currency,
            qr_ref: None,
            email_send_count: 0,
            recovery_token: None,
            recovery_expires_at: None,
            provider: None,
            provider_ticket_id: None,
            provider_code: None,
            provider_qr: None,
            sync_status: SyncStatus::Pending,
            provider_attempts: 0,
            provider_last_error: None,
            created_at: self.created_at,
        }
    }
}

/// Sync sub-state written as one group after a provider attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncRecord {
    pub provider: String,
    pub status: SyncStatus,
    pub attempts: i32,
    /// `None` clears the stored error.
    pub last_error: Option<String>,
    pub provider_ticket_id: Option<i64>,
    pub provider_code: Option<String>,
    pub provider_qr: Option<String>,
    pub qr_ref: Option<String>,
    /// Replacement validity window reported by the provider.
    pub validity: Option<(i64, i64)>,
}

impl SyncRecord {
    pub fn stub(provider: &str) -> Self {
        Self {
            provider: provider.to_string(),
            status: SyncStatus::Stub,
            attempts: 0,
            last_error: None,
            provider_ticket_id: None,
            provider_code: None,
            provider_qr: None,
            qr_ref: None,
            validity: None,
        }
    }

    pub fn failed(provider: &str, attempts: i32, error: String) -> Self {
        Self {
            provider: provider.to_string(),
            status: SyncStatus::Failed,
            attempts,
            last_error: Some(error),
            provider_ticket_id: None,
            provider_code: None,
            provider_qr: None,
            qr_ref: None,
            validity: None,
        }
    }

    /// Apply onto an in-memory ticket.
    pub fn apply_to(&self, ticket: &mut Ticket) {
        ticket.provider = Some(self.provider.clone());
        ticket.sync_status = self.status;
        ticket.provider_attempts = self.attempts;
        ticket.provider_last_error = self.last_error.clone();
        if let Some(id) = self.provider_ticket_id {
            ticket.provider_ticket_id = Some(id);
        }
        if let Some(code) = &self.provider_code {
            ticket.provider_code = Some(code.clone());
        }
        if let Some(qr) = &self.provider_qr {
            ticket.provider_qr = Some(qr.clone());
        }
        if let Some(qr_ref) = &self.qr_ref {
            ticket.qr_ref = Some(qr_ref.clone());
        }
        if let Some((from, to)) = self.validity {
            ticket.valid_from = from;
            ticket.valid_to = to;
        }
    }
}
