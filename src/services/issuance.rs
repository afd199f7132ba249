//! Completed order to exactly one ticket.
//!
//! The check-create-link sequence for an order runs under a per-order async lock,
//! and the ticket store refuses a second ticket for the same order, so duplicate
//! completion events can only ever observe the ticket that won.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, instrument, warn};

use super::email_resolution::{resolve_email, sanitize_email, EmailSource};
use super::notification::MunicipalityNotifier;
use super::provider_sync::ProviderService;
use super::qr_image::QrAssetService;
use crate::clock::Clock;
use crate::config::IssuanceConfig;
use crate::database::error::DatabaseError;
use crate::database::{OrderStore, TicketStore};
use crate::logging::mask_email;
use crate::orders::Order;
use crate::tickets::code::generate_unique_code;
use crate::tickets::{NewTicket, OrderId, SyncOutcome, Ticket, TicketId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssuanceOutcome {
    OrderNotFound,
    /// The order already owns this ticket; nothing was created.
    AlreadyIssued(TicketId),
    /// The order carries no valid ticket type tag.
    NotTicketOrder,
    Issued {
        ticket_id: TicketId,
        sync: SyncOutcome,
    },
    /// Issuance aborted; the reason is also on the order's note log.
    Failed(String),
}

impl IssuanceOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            IssuanceOutcome::OrderNotFound => "order_not_found",
            IssuanceOutcome::AlreadyIssued(_) => "already_issued",
            IssuanceOutcome::NotTicketOrder => "not_ticket_order",
            IssuanceOutcome::Issued { .. } => "issued",
            IssuanceOutcome::Failed(_) => "failed",
        }
    }

    pub fn ticket_id(&self) -> Option<TicketId> {
        match self {
            IssuanceOutcome::AlreadyIssued(id) => Some(*id),
            IssuanceOutcome::Issued { ticket_id, .. } => Some(*ticket_id),
            IssuanceOutcome::OrderNotFound
            | IssuanceOutcome::NotTicketOrder
            | IssuanceOutcome::Failed(_) => None,
        }
    }
}

pub struct IssuanceWorkflow {
    tickets: Arc<dyn TicketStore>,
    orders: Arc<dyn OrderStore>,
    provider: Arc<ProviderService>,
    qr: Arc<QrAssetService>,
    notifier: Arc<MunicipalityNotifier>,
    clock: Arc<dyn Clock>,
    config: IssuanceConfig,
    order_locks: Mutex<HashMap<OrderId, Arc<AsyncMutex<()>>>>,
}

impl IssuanceWorkflow {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tickets: Arc<dyn TicketStore>,
        orders: Arc<dyn OrderStore>,
        provider: Arc<ProviderService>,
        qr: Arc<QrAssetService>,
        notifier: Arc<MunicipalityNotifier>,
        clock: Arc<dyn Clock>,
        config: IssuanceConfig,
    ) -> Self {
        Self {
            tickets,
            orders,
            provider,
            qr,
            notifier,
            clock,
            config,
            order_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Handle a payment-completion event. Safe to call any number of times.
    #[instrument(skip(self))]
    pub async fn on_order_completed(
        &self,
        order_id: OrderId,
    ) -> Result<IssuanceOutcome, DatabaseError> {
        let lock = self.order_lock(order_id);
        let result = {
            let _guard = lock.lock().await;
            self.issue(order_id).await
        };
        self.release_order_lock(order_id, lock);
        result
    }

    pub fn resolve_email(&self, order: &Order) -> (Option<String>, EmailSource) {
        resolve_email(order)
    }

    pub fn ticket_permalink(&self, ticket_id: TicketId) -> String {
        self.config.ticket_permalink(ticket_id.0)
    }

    /// Permalink of the ticket issued for an order, if any.
    pub async fn ticket_permalink_for_order(
        &self,
        order_id: OrderId,
    ) -> Result<Option<String>, DatabaseError> {
        let linked = match self.orders.get(order_id).await? {
            Some(order) => order.ticket_id,
            None => return Ok(None),
        };

        let ticket_id = match linked {
            Some(id) => Some(id),
            None => self
                .tickets
                .find_by_order(order_id)
                .await?
                .map(|t| t.id),
        };

        Ok(ticket_id.map(|id| self.ticket_permalink(id)))
    }

    async fn issue(&self, order_id: OrderId) -> Result<IssuanceOutcome, DatabaseError> {
        let Some(order) = self.orders.get(order_id).await? else {
            warn!(order_id, "completion event for unknown order");
            return Ok(IssuanceOutcome::OrderNotFound);
        };

        if let Some(ticket_id) = order.ticket_id {
            debug!(order_id, ticket_id = %ticket_id, "ticket already issued");
            return Ok(IssuanceOutcome::AlreadyIssued(ticket_id));
        }

        // Ticket stored but the order marker never written: repair the link.
        if let Some(existing) = self.tickets.find_by_order(order_id).await? {
            self.orders.link_ticket(order_id, existing.id).await?;
            return Ok(IssuanceOutcome::AlreadyIssued(existing.id));
        }

        let Some(ticket_type) = order.ticket_type() else {
            debug!(order_id, tag = ?order.ticket_type_tag, "order carries no ticket type");
            return Ok(IssuanceOutcome::NotTicketOrder);
        };

        let email = self.owner_email(&order).await?;

        let Some(code) = generate_unique_code(self.tickets.as_ref()).await? else {
            let reason = "Ticket issuance failed: unique code could not be generated.";
            error!(order_id, "ticket code generation exhausted");
            self.note(order_id, reason).await;
            return Ok(IssuanceOutcome::Failed(reason.to_string()));
        };

        let now = self.clock.now();
        let new_ticket = NewTicket {
            code,
            ticket_type,
            valid_from: now,
            order_id,
            user_id: order.customer_id,
            email,
            amount_cents: order.gross_amount_cents(),
            currency: order.currency.clone(),
            created_at: now,
        };

        let ticket = match self.tickets.insert(new_ticket).await {
            Ok(Some(ticket)) => ticket,
            Ok(None) => {
                // Lost a race against another process issuing for this order.
                return match self.tickets.find_by_order(order_id).await? {
                    Some(existing) => Ok(IssuanceOutcome::AlreadyIssued(existing.id)),
                    None => Ok(IssuanceOutcome::Failed(
                        "Ticket issuance failed: ticket record not created.".to_string(),
                    )),
                };
            }
            Err(e) => {
                let reason = "Ticket issuance failed: ticket record not created.";
                error!(order_id, error = %e, "ticket insert failed");
                self.note(order_id, reason).await;
                return Ok(IssuanceOutcome::Failed(reason.to_string()));
            }
        };

        self.orders.link_ticket(order_id, ticket.id).await?;
        let ticket = self.attach_qr(ticket).await;

        self.note(
            order_id,
            &format!("Ticket issued: #{}, code {}", ticket.id, ticket.code),
        )
        .await;
        info!(
            order_id,
            ticket_id = %ticket.id,
            ticket_type = %ticket_type,
            "ticket issued"
        );

        let sync = self.provider.sync_ticket(&ticket, &order, ticket_type).await?;
        if sync == SyncOutcome::Stub {
            self.notify_municipality(&ticket).await;
        }

        Ok(IssuanceOutcome::Issued {
            ticket_id: ticket.id,
            sync,
        })
    }

    /// Resolve the ticket owner's email, writing back billing and the source note.
    async fn owner_email(&self, order: &Order) -> Result<Option<String>, DatabaseError> {
        let (email, source) = resolve_email(order);

        if let Some(found) = email.as_deref() {
            let billing = order.billing_email.as_deref().map(str::trim);
            if billing != Some(found) {
                if let Err(e) = self.orders.set_billing_email(order.id, found).await {
                    warn!(order_id = order.id, error = %e, "failed to update billing email");
                }
            }
        }
        self.note(order.id, &format!("Email source: {}", source)).await;

        if let Some(found) = email {
            debug!(order_id = order.id, email = %mask_email(&found), %source, "owner email resolved");
            return Ok(Some(found));
        }

        match order.customer_id {
            Some(customer_id) => Ok(self
                .orders
                .customer_email(customer_id)
                .await?
                .as_deref()
                .and_then(sanitize_email)),
            None => Ok(None),
        }
    }

    async fn attach_qr(&self, mut ticket: Ticket) -> Ticket {
        match self.qr.qr_ref_for(&ticket.code).await {
            Ok(qr_ref) => match self.tickets.set_qr_ref(ticket.id, &qr_ref).await {
                Ok(()) => ticket.qr_ref = Some(qr_ref),
                Err(e) => warn!(ticket_id = %ticket.id, error = %e, "failed to store QR reference"),
            },
            Err(e) => warn!(ticket_id = %ticket.id, error = %e, "QR asset unavailable"),
        }
        ticket
    }

    async fn notify_municipality(&self, ticket: &Ticket) {
        match self.notifier.notify(ticket).await {
            Ok(Some(receipt)) => {
                self.note(
                    ticket.order_id,
                    &format!(
                        "Municipality stub response: HTTP {} {}",
                        receipt.status, receipt.body
                    ),
                )
                .await
            }
            Ok(None) => {}
            Err(e) => {
                self.note(ticket.order_id, &format!("Municipality stub error: {}", e))
                    .await
            }
        }
    }

    async fn note(&self, order_id: OrderId, note: &str) {
        if let Err(e) = self.orders.add_note(order_id, note).await {
            warn!(order_id, error = %e, "failed to write order note");
        }
    }

    fn order_lock(&self, order_id: OrderId) -> Arc<AsyncMutex<()>> {
        let mut locks = self
            .order_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(order_id).or_default().clone()
    }

    fn release_order_lock(&self, order_id: OrderId, lock: Arc<AsyncMutex<()>>) {
        let mut locks = self
            .order_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Map entry plus ours: nobody else is waiting on this order.
        if Arc::strong_count(&lock) <= 2 {
            locks.remove(&order_id);
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.order_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::ProviderConfig;
    use crate::database::memory::{InMemoryOrderStore, InMemoryTicketStore};
    use crate::provider::{InMemoryTokenCache, ProviderClient};
    use crate::tickets::TicketType;

    fn workflow(
        tickets: Arc<InMemoryTicketStore>,
        orders: Arc<InMemoryOrderStore>,
    ) -> IssuanceWorkflow {
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let config = IssuanceConfig {
            qr_service_url: None,
            ..Default::default()
        };
        let client = ProviderClient::new(
            ProviderConfig {
                test_mode: true,
                ..Default::default()
            },
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

        IssuanceWorkflow::new(
            tickets,
            orders,
            provider,
            Arc::new(QrAssetService::new(&config).unwrap()),
            Arc::new(MunicipalityNotifier::new(&config).unwrap()),
            clock,
            config,
        )
    }

    #[tokio::test]
    async fn orders_without_ticket_type_are_ignored() {
        let tickets = Arc::new(InMemoryTicketStore::new());
        let orders = Arc::new(InMemoryOrderStore::new());
        orders.insert_order(Order::new(5, "EUR")).await;

        let wf = workflow(tickets.clone(), orders);
        assert_eq!(
            wf.on_order_completed(5).await.unwrap(),
            IssuanceOutcome::NotTicketOrder
        );
        assert_eq!(
            wf.on_order_completed(6).await.unwrap(),
            IssuanceOutcome::OrderNotFound
        );
        assert!(tickets.all().await.is_empty());
        assert_eq!(wf.tracked_locks(), 0);
    }

    #[tokio::test]
    async fn missing_marker_is_repaired_from_stored_ticket() {
        let tickets = Arc::new(InMemoryTicketStore::new());
        let orders = Arc::new(InMemoryOrderStore::new());
        let mut order = Order::new(8, "EUR");
        order.ticket_type_tag = Some("30m".to_string());
        orders.insert_order(order).await;

        let stored = tickets
            .insert(NewTicket {
                code: "ABC-DEF-23".to_string(),
                ticket_type: TicketType::ThirtyMinutes,
                valid_from: 1,
                order_id: 8,
                user_id: None,
                email: None,
                amount_cents: 0,
                currency: "EUR".to_string(),
                created_at: 1,
            })
            .await
            .unwrap()
            .unwrap();

        let wf = workflow(tickets.clone(), orders.clone());
        assert_eq!(
            wf.on_order_completed(8).await.unwrap(),
            IssuanceOutcome::AlreadyIssued(stored.id)
        );
        assert_eq!(
            orders.get(8).await.unwrap().unwrap().ticket_id,
            Some(stored.id)
        );
        assert_eq!(
            wf.ticket_permalink_for_order(8).await.unwrap(),
            Some(format!("http://127.0.0.1:8000/tickets/{}", stored.id))
        );
    }

    #[test]
    fn outcome_labels() {
        let issued = IssuanceOutcome::Issued {
            ticket_id: TicketId(4),
            sync: SyncOutcome::Stub,
        };
        assert_eq!(issued.label(), "issued");
        assert_eq!(issued.ticket_id(), Some(TicketId(4)));
        assert_eq!(IssuanceOutcome::Failed("x".into()).ticket_id(), None);
    }
}
