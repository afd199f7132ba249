//! Provider synchronization policy.
//!
//! Sits between issuance and [`ProviderClient`]: decides between test-mode stubs
//! and live purchases, maps local ticket types to provider ticket ids and keeps
//! the ticket's sync sub-state (status, attempts, last error) up to date. Every
//! outcome is also written to the order's note log.

use chrono::DateTime;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::clock::Clock;
use crate::database::error::DatabaseError;
use crate::database::{OrderStore, TicketStore};
use crate::error::{AppError, ExternalError};
use crate::orders::Order;
use crate::provider::types::{parse_provider_timestamp, BuyTicketRequest, BuyTicketResponse, PurchasedTicket};
use crate::provider::{ProviderClient, ProviderResponse};
use crate::tickets::{OrderId, SyncOutcome, SyncRecord, SyncStatus, Ticket, TicketId, TicketType};

pub const BUY_PATH: &str = "/api/ticket/buy";
pub const MAX_ERROR_CHARS: usize = 180;

/// The provider cannot take purchases right now.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{diagnostic}")]
pub struct NotReady {
    /// Safe to show to the purchaser
    pub message: String,
    /// Operator-facing cause
    pub diagnostic: String,
}

impl From<NotReady> for AppError {
    fn from(err: NotReady) -> Self {
        AppError::external(ExternalError::ProviderNotReady {
            message: err.message,
        })
        .with_context(err.diagnostic)
    }
}

pub struct ProviderService {
    client: Arc<ProviderClient>,
    tickets: Arc<dyn TicketStore>,
    orders: Arc<dyn OrderStore>,
    clock: Arc<dyn Clock>,
}

impl ProviderService {
    pub fn new(
        client: Arc<ProviderClient>,
        tickets: Arc<dyn TicketStore>,
        orders: Arc<dyn OrderStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            client,
            tickets,
            orders,
            clock,
        }
    }

    pub fn client(&self) -> &ProviderClient {
        &self.client
    }

    pub fn provider_name(&self) -> &str {
        self.client.name()
    }

    pub fn is_test_mode(&self) -> bool {
        self.client.config().test_mode
    }

    /// Provider ticket id for a local type, 0 when unmapped.
    pub fn map_type_to_provider_id(&self, ticket_type: TicketType) -> u64 {
        self.client.config().ticket_id_for(ticket_type)
    }

    /// Fail fast before checkout when live purchases cannot succeed.
    pub async fn ensure_ready(&self) -> Result<(), NotReady> {
        if self.is_test_mode() {
            return Ok(());
        }

        if !self.client.is_configured() {
            return Err(NotReady {
                message: "Municipality provider is not configured. Please contact support."
                    .to_string(),
                diagnostic: format!("{} client not configured.", self.provider_name()),
            });
        }

        self.client.get_token().await.map(|_| ()).map_err(|e| NotReady {
            message: "Municipality provider is currently unavailable. Please try again later."
                .to_string(),
            diagnostic: e.to_string(),
        })
    }

    /// Bring the provider side of `ticket` in line with the local record.
    ///
    /// Tickets already synced (`ok` or `stub`) return their outcome without a
    /// network call. Provider failures are recorded on the ticket and reported as
    /// [`SyncOutcome::Failed`]; only storage failures surface as errors.
    #[instrument(skip(self, ticket, order), fields(ticket_id = %ticket.id, order_id = order.id))]
    pub async fn sync_ticket(
        &self,
        ticket: &Ticket,
        order: &Order,
        ticket_type: TicketType,
    ) -> Result<SyncOutcome, DatabaseError> {
        match ticket.sync_status {
            SyncStatus::Ok => return Ok(SyncOutcome::Ok),
            SyncStatus::Stub => return Ok(SyncOutcome::Stub),
            SyncStatus::Pending | SyncStatus::Failed => {}
        }

        let name = self.provider_name().to_string();

        if self.is_test_mode() {
            if !ticket.sync_status.can_transition_to(SyncStatus::Stub) {
                return Ok(SyncOutcome::Failed);
            }
            self.tickets
                .record_sync(ticket.id, &SyncRecord::stub(&name))
                .await?;
            self.note(order.id, format!("{} test mode: stub response applied.", name))
                .await;
            info!(provider = %name, "test mode, provider sync stubbed");
            return Ok(SyncOutcome::Stub);
        }

        let attempts = ticket.provider_attempts + 1;

        if !self.client.is_configured() {
            return self
                .record_failure(
                    ticket.id,
                    order.id,
                    attempts,
                    format!("{} configuration missing.", name),
                    format!("{} BUY failed: configuration missing.", name),
                )
                .await;
        }

        let provider_ticket_id = self.map_type_to_provider_id(ticket_type);
        if provider_ticket_id == 0 {
            return self
                .record_failure(
                    ticket.id,
                    order.id,
                    attempts,
                    "Ticket ID mapping missing.".to_string(),
                    format!("{} BUY failed: ticket id missing for type {}", name, ticket_type),
                )
                .await;
        }

        let request = BuyTicketRequest {
            ticket_id: provider_ticket_id,
            quantity: 1,
            qrcode: self.device_qr(order),
        };
        let body = match serde_json::to_value(&request) {
            Ok(body) => body,
            Err(e) => {
                return self
                    .record_failure(
                        ticket.id,
                        order.id,
                        attempts,
                        e.to_string(),
                        format!("{} BUY failed: http=0 error={}", name, e),
                    )
                    .await
            }
        };

        let response = self.client.post(BUY_PATH, &body).await;
        match purchased_ticket(&response) {
            Some(purchased) => {
                let record =
                    self.success_record(&name, attempts, provider_ticket_id, ticket_type, purchased);
                self.tickets.record_sync(ticket.id, &record).await?;

                let valid_to = record.validity.map(|(_, to)| to).unwrap_or(ticket.valid_to);
                self.note(
                    order.id,
                    format!(
                        "{} BUY ok: ticket_id={}, code={}, valid_to={}",
                        name,
                        record.provider_ticket_id.unwrap_or_default(),
                        record.provider_code.as_deref().unwrap_or(""),
                        format_minutes(valid_to),
                    ),
                )
                .await;
                info!(provider = %name, attempts, "provider ticket purchased");
                Ok(SyncOutcome::Ok)
            }
            None => {
                let error = if response.ok {
                    "Provider response missing ticket data.".to_string()
                } else if response.error.is_empty() {
                    "unknown".to_string()
                } else {
                    response.error.clone()
                };
                let note = format!(
                    "{} BUY failed: http={} error={}",
                    name, response.status, error
                );
                self.record_failure(ticket.id, order.id, attempts, error, note)
                    .await
            }
        }
    }

    /// Retry entry point for the sweeper. `None` in test mode or when the ticket
    /// or its order is gone.
    pub async fn retry_ticket(
        &self,
        ticket_id: TicketId,
    ) -> Result<Option<SyncOutcome>, DatabaseError> {
        if self.is_test_mode() {
            return Ok(None);
        }

        let Some(ticket) = self.tickets.get(ticket_id).await? else {
            return Ok(None);
        };
        let Some(order) = self.orders.get(ticket.order_id).await? else {
            warn!(ticket_id = %ticket_id, order_id = ticket.order_id, "order missing, skipping provider retry");
            return Ok(None);
        };

        self.sync_ticket(&ticket, &order, ticket.ticket_type)
            .await
            .map(Some)
    }

    fn device_qr(&self, order: &Order) -> Option<String> {
        if !self.client.config().device_qr_enabled {
            return None;
        }
        order
            .device_qr
            .as_deref()
            .map(str::trim)
            .filter(|qr| !qr.is_empty())
            .map(str::to_string)
    }

    fn success_record(
        &self,
        name: &str,
        attempts: i32,
        mapped_id: u64,
        ticket_type: TicketType,
        purchased: PurchasedTicket,
    ) -> SyncRecord {
        let now = self.clock.now();
        let valid_from = purchased
            .valid_from
            .as_ref()
            .and_then(parse_provider_timestamp)
            .unwrap_or(now);
        let valid_to = purchased
            .valid_to
            .as_ref()
            .and_then(parse_provider_timestamp)
            .filter(|to| *to > valid_from)
            .unwrap_or(valid_from + ticket_type.duration_secs());

        let provider_qr = purchased.qr_content.filter(|qr| !qr.trim().is_empty());

        SyncRecord {
            provider: name.to_string(),
            status: SyncStatus::Ok,
            attempts,
            last_error: None,
            provider_ticket_id: purchased
                .ticket_id
                .or_else(|| i64::try_from(mapped_id).ok()),
            provider_code: purchased.code.filter(|c| !c.trim().is_empty()),
            qr_ref: provider_qr.as_deref().map(provider_qr_ref),
            provider_qr,
            validity: Some((valid_from, valid_to)),
        }
    }

    async fn record_failure(
        &self,
        ticket_id: TicketId,
        order_id: OrderId,
        attempts: i32,
        error: String,
        note: String,
    ) -> Result<SyncOutcome, DatabaseError> {
        let error = truncate_error(&error);
        warn!(ticket_id = %ticket_id, attempts, error = %error, "provider sync failed");

        let record = SyncRecord::failed(self.provider_name(), attempts, error);
        self.tickets.record_sync(ticket_id, &record).await?;
        self.note(order_id, note).await;

        Ok(SyncOutcome::Failed)
    }

    async fn note(&self, order_id: OrderId, note: String) {
        if let Err(e) = self.orders.add_note(order_id, &note).await {
            warn!(order_id, error = %e, "failed to write order note");
        }
    }
}

fn purchased_ticket(response: &ProviderResponse) -> Option<PurchasedTicket> {
    if !response.ok {
        return None;
    }
    let body = response.body.clone()?;
    serde_json::from_value::<BuyTicketResponse>(body)
        .ok()?
        .data
        .into_iter()
        .next()
}

/// Image reference for a provider QR payload. Raw base64 gets a PNG data-URL prefix.
pub fn provider_qr_ref(payload: &str) -> String {
    let payload = payload.trim();
    if payload.starts_with("data:") {
        payload.to_string()
    } else {
        format!("data:image/png;base64,{}", payload)
    }
}

fn truncate_error(error: &str) -> String {
    error.chars().take(MAX_ERROR_CHARS).collect()
}

fn format_minutes(ts: i64) -> String {
    DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::ProviderConfig;
    use crate::database::memory::{InMemoryOrderStore, InMemoryTicketStore};
    use crate::provider::InMemoryTokenCache;
    use crate::tickets::NewTicket;

    struct Fixture {
        service: ProviderService,
        tickets: Arc<InMemoryTicketStore>,
        orders: Arc<InMemoryOrderStore>,
    }

    fn fixture(config: ProviderConfig) -> Fixture {
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let client = ProviderClient::new(config, Arc::new(InMemoryTokenCache::new()), clock.clone())
            .unwrap();
        let tickets = Arc::new(InMemoryTicketStore::new());
        let orders = Arc::new(InMemoryOrderStore::new());
        let service = ProviderService::new(
            Arc::new(client),
            tickets.clone(),
            orders.clone(),
            clock,
        );
        Fixture {
            service,
            tickets,
            orders,
        }
    }

    async fn seed(f: &Fixture) -> (Ticket, Order) {
        let order = Order::new(42, "EUR");
        f.orders.insert_order(order.clone()).await;
        let ticket = f
            .tickets
            .insert(NewTicket {
                code: "ABC-DEF-23".to_string(),
                ticket_type: TicketType::ThirtyMinutes,
                valid_from: 1_700_000_000,
                order_id: 42,
                user_id: None,
                email: None,
                amount_cents: 120,
                currency: "EUR".to_string(),
                created_at: 1_700_000_000,
            })
            .await
            .unwrap()
            .unwrap();
        (ticket, order)
    }

    #[tokio::test]
    async fn test_mode_stubs_without_network() {
        let f = fixture(ProviderConfig {
            test_mode: true,
            ..Default::default()
        });
        let (ticket, order) = seed(&f).await;

        let outcome = f
            .service
            .sync_ticket(&ticket, &order, TicketType::ThirtyMinutes)
            .await
            .unwrap();
        assert_eq!(outcome, SyncOutcome::Stub);

        let stored = f.tickets.get(ticket.id).await.unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Stub);
        assert_eq!(stored.provider_attempts, 0);
        assert_eq!(stored.provider.as_deref(), Some("DPMK"));
        assert_eq!(
            f.orders.notes(42).await,
            vec!["DPMK test mode: stub response applied.".to_string()]
        );
        assert!(f.service.ensure_ready().await.is_ok());
        assert_eq!(f.service.retry_ticket(ticket.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn unconfigured_client_records_failure() {
        let f = fixture(ProviderConfig::default());
        let (ticket, order) = seed(&f).await;

        let outcome = f
            .service
            .sync_ticket(&ticket, &order, TicketType::ThirtyMinutes)
            .await
            .unwrap();
        assert_eq!(outcome, SyncOutcome::Failed);

        let stored = f.tickets.get(ticket.id).await.unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Failed);
        assert_eq!(stored.provider_attempts, 1);
        assert_eq!(
            stored.provider_last_error.as_deref(),
            Some("DPMK configuration missing.")
        );
        assert_eq!(
            f.orders.notes(42).await,
            vec!["DPMK BUY failed: configuration missing.".to_string()]
        );

        let err = f.service.ensure_ready().await.unwrap_err();
        assert_eq!(
            err.message,
            "Municipality provider is not configured. Please contact support."
        );
        assert_eq!(AppError::from(err).status_code(), 503);
    }

    #[tokio::test]
    async fn missing_mapping_records_failure_and_counts_attempt() {
        let f = fixture(ProviderConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
            ticket_30m_id: 0,
            ticket_60m_id: 11,
            ..Default::default()
        });
        let (mut ticket, order) = seed(&f).await;
        ticket.sync_status = SyncStatus::Failed;
        ticket.provider_attempts = 2;
        f.tickets.put(ticket.clone()).await;

        let outcome = f
            .service
            .retry_ticket(ticket.id)
            .await
            .unwrap();
        assert_eq!(outcome, Some(SyncOutcome::Failed));

        let stored = f.tickets.get(ticket.id).await.unwrap().unwrap();
        assert_eq!(stored.provider_attempts, 3);
        assert_eq!(
            stored.provider_last_error.as_deref(),
            Some("Ticket ID mapping missing.")
        );
        assert_eq!(
            f.orders.notes(order.id).await,
            vec!["DPMK BUY failed: ticket id missing for type 30m".to_string()]
        );
    }

    #[tokio::test]
    async fn synced_tickets_short_circuit() {
        let f = fixture(ProviderConfig::default());
        let (mut ticket, order) = seed(&f).await;

        ticket.sync_status = SyncStatus::Ok;
        let outcome = f
            .service
            .sync_ticket(&ticket, &order, TicketType::ThirtyMinutes)
            .await
            .unwrap();
        assert_eq!(outcome, SyncOutcome::Ok);

        ticket.sync_status = SyncStatus::Stub;
        let outcome = f
            .service
            .sync_ticket(&ticket, &order, TicketType::ThirtyMinutes)
            .await
            .unwrap();
        assert_eq!(outcome, SyncOutcome::Stub);
        assert!(f.orders.notes(42).await.is_empty());
    }

    #[test]
    fn provider_qr_payloads_become_data_urls() {
        assert_eq!(provider_qr_ref("iVBORw0"), "data:image/png;base64,iVBORw0");
        assert_eq!(
            provider_qr_ref("data:image/svg+xml;base64,PHN2Zz4="),
            "data:image/svg+xml;base64,PHN2Zz4="
        );
    }

    #[test]
    fn errors_are_truncated_by_character() {
        let long = "é".repeat(400);
        assert_eq!(truncate_error(&long).chars().count(), MAX_ERROR_CHARS);
        assert_eq!(truncate_error("short"), "short");
    }

    #[test]
    fn note_timestamps_use_minutes() {
        assert_eq!(format_minutes(1_700_000_000), "2023-11-14 22:13");
    }
}
