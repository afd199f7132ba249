//! In-process stores used by tests and `SKIP_EXTERNALS` runs.
//!
//! They enforce the same uniqueness rules as the Postgres schema: one ticket per
//! order, unique codes and unique recovery tokens.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;

use crate::database::error::{DatabaseError, DatabaseErrorKind};
use crate::database::{OrderStore, SettingsStore, TicketStore};
use crate::orders::Order;
use crate::tickets::{
    NewTicket, OrderId, SyncRecord, SyncStatus, Ticket, TicketId, TicketStatus,
};

#[derive(Default)]
struct TicketTable {
    rows: BTreeMap<i64, Ticket>,
    last_id: i64,
}

impl TicketTable {
    fn row_mut(&mut self, id: TicketId) -> Result<&mut Ticket, DatabaseError> {
        self.rows
            .get_mut(&id.0)
            .ok_or_else(|| DatabaseError::not_found(format!("ticket {}", id)))
    }
}

#[derive(Default)]
pub struct InMemoryTicketStore {
    table: Mutex<TicketTable>,
}

impl InMemoryTicketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored ticket, ordered by id.
    pub async fn all(&self) -> Vec<Ticket> {
        self.table.lock().await.rows.values().cloned().collect()
    }

    /// Store a fully-formed ticket as is. Test setup only.
    pub async fn put(&self, ticket: Ticket) {
        let mut table = self.table.lock().await;
        table.last_id = table.last_id.max(ticket.id.0);
        table.rows.insert(ticket.id.0, ticket);
    }
}

#[async_trait]
impl TicketStore for InMemoryTicketStore {
    async fn insert(&self, ticket: NewTicket) -> Result<Option<Ticket>, DatabaseError> {
        let mut table = self.table.lock().await;

        if table.rows.values().any(|t| t.order_id == ticket.order_id) {
            return Ok(None);
        }
        if table.rows.values().any(|t| t.code == ticket.code) {
            return Err(DatabaseError::new(
                DatabaseErrorKind::UniqueViolation,
                format!("ticket code {} already exists", ticket.code),
            ));
        }

        table.last_id += 1;
        let stored = ticket.into_ticket(TicketId(table.last_id));
        table.rows.insert(stored.id.0, stored.clone());
        Ok(Some(stored))
    }

    async fn get(&self, id: TicketId) -> Result<Option<Ticket>, DatabaseError> {
        Ok(self.table.lock().await.rows.get(&id.0).cloned())
    }

    async fn find_by_order(&self, order_id: OrderId) -> Result<Option<Ticket>, DatabaseError> {
        let table = self.table.lock().await;
        Ok(table.rows.values().find(|t| t.order_id == order_id).cloned())
    }

    async fn code_exists(&self, code: &str) -> Result<bool, DatabaseError> {
        let table = self.table.lock().await;
        Ok(table.rows.values().any(|t| t.code == code))
    }

    async fn find_by_recovery_token(&self, token: &str) -> Result<Option<Ticket>, DatabaseError> {
        let table = self.table.lock().await;
        Ok(table
            .rows
            .values()
            .find(|t| t.recovery_token.as_deref() == Some(token))
            .cloned())
    }

    async fn list_by_user(&self, user_id: i64) -> Result<Vec<Ticket>, DatabaseError> {
        let table = self.table.lock().await;
        let mut tickets: Vec<Ticket> = table
            .rows
            .values()
            .filter(|t| t.user_id == Some(user_id))
            .cloned()
            .collect();
        tickets.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(tickets)
    }

    async fn set_qr_ref(&self, id: TicketId, qr_ref: &str) -> Result<(), DatabaseError> {
        let mut table = self.table.lock().await;
        table.row_mut(id)?.qr_ref = Some(qr_ref.to_string());
        Ok(())
    }

    async fn record_sync(&self, id: TicketId, record: &SyncRecord) -> Result<(), DatabaseError> {
        let mut table = self.table.lock().await;
        record.apply_to(table.row_mut(id)?);
        Ok(())
    }

    async fn set_recovery(
        &self,
        id: TicketId,
        token: &str,
        expires_at: i64,
    ) -> Result<(), DatabaseError> {
        let mut table = self.table.lock().await;
        if table
            .rows
            .values()
            .any(|t| t.id != id && t.recovery_token.as_deref() == Some(token))
        {
            return Err(DatabaseError::new(
                DatabaseErrorKind::UniqueViolation,
                "recovery token already in use",
            ));
        }

        let ticket = table.row_mut(id)?;
        ticket.recovery_token = Some(token.to_string());
        ticket.recovery_expires_at = Some(expires_at);
        Ok(())
    }

    async fn expire_overdue(&self, now: i64, limit: i64) -> Result<Vec<TicketId>, DatabaseError> {
        let mut table = self.table.lock().await;
        let mut due: Vec<&mut Ticket> = table
            .rows
            .values_mut()
            .filter(|t| t.status == TicketStatus::Active && t.valid_to < now)
            .collect();
        due.sort_by_key(|t| t.valid_to);

        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(due
            .into_iter()
            .take(limit)
            .map(|t| {
                t.status = TicketStatus::Expired;
                t.id
            })
            .collect())
    }

    async fn find_retryable(
        &self,
        max_attempts: i32,
        limit: i64,
    ) -> Result<Vec<TicketId>, DatabaseError> {
        let table = self.table.lock().await;
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(table
            .rows
            .values()
            .filter(|t| t.sync_status == SyncStatus::Failed && t.provider_attempts < max_attempts)
            .take(limit)
            .map(|t| t.id)
            .collect())
    }

    async fn reserve_email_send(
        &self,
        id: TicketId,
        limit: i32,
    ) -> Result<Option<i32>, DatabaseError> {
        let mut table = self.table.lock().await;
        let ticket = table.row_mut(id)?;
        if ticket.email_send_count >= limit {
            return Ok(None);
        }
        ticket.email_send_count += 1;
        Ok(Some(ticket.email_send_count))
    }

    async fn release_email_send(&self, id: TicketId) -> Result<(), DatabaseError> {
        let mut table = self.table.lock().await;
        let ticket = table.row_mut(id)?;
        ticket.email_send_count = (ticket.email_send_count - 1).max(0);
        Ok(())
    }

    async fn record_email_recipient(&self, id: TicketId, email: &str) -> Result<(), DatabaseError> {
        let mut table = self.table.lock().await;
        let ticket = table.row_mut(id)?;
        if ticket.email.as_deref().map_or(true, str::is_empty) {
            ticket.email = Some(email.to_string());
        }
        Ok(())
    }
}

#[derive(Default)]
struct OrderTable {
    orders: HashMap<OrderId, Order>,
    notes: HashMap<OrderId, Vec<String>>,
    customers: HashMap<i64, String>,
}

#[derive(Default)]
pub struct InMemoryOrderStore {
    table: Mutex<OrderTable>,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_order(&self, order: Order) {
        self.table.lock().await.orders.insert(order.id, order);
    }

    pub async fn insert_customer(&self, customer_id: i64, email: impl Into<String>) {
        self.table
            .lock()
            .await
            .customers
            .insert(customer_id, email.into());
    }

    pub async fn notes(&self, id: OrderId) -> Vec<String> {
        self.table
            .lock()
            .await
            .notes
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn get(&self, id: OrderId) -> Result<Option<Order>, DatabaseError> {
        Ok(self.table.lock().await.orders.get(&id).cloned())
    }

    async fn link_ticket(&self, id: OrderId, ticket_id: TicketId) -> Result<(), DatabaseError> {
        let mut table = self.table.lock().await;
        let order = table
            .orders
            .get_mut(&id)
            .ok_or_else(|| DatabaseError::not_found(format!("order {}", id)))?;

        match order.ticket_id {
            Some(existing) if existing != ticket_id => Err(DatabaseError::new(
                DatabaseErrorKind::UniqueViolation,
                format!("order {} already linked to another ticket", id),
            )),
            _ => {
                order.ticket_id = Some(ticket_id);
                Ok(())
            }
        }
    }

    async fn set_billing_email(&self, id: OrderId, email: &str) -> Result<(), DatabaseError> {
        let mut table = self.table.lock().await;
        if let Some(order) = table.orders.get_mut(&id) {
            order.billing_email = Some(email.to_string());
        }
        Ok(())
    }

    async fn add_note(&self, id: OrderId, note: &str) -> Result<(), DatabaseError> {
        self.table
            .lock()
            .await
            .notes
            .entry(id)
            .or_default()
            .push(note.to_string());
        Ok(())
    }

    async fn customer_email(&self, customer_id: i64) -> Result<Option<String>, DatabaseError> {
        Ok(self.table.lock().await.customers.get(&customer_id).cloned())
    }
}

#[derive(Default)]
pub struct InMemorySettingsStore {
    values: Mutex<HashMap<String, JsonValue>>,
}

impl InMemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettingsStore for InMemorySettingsStore {
    async fn get(&self, key: &str) -> Result<Option<JsonValue>, DatabaseError> {
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: JsonValue) -> Result<(), DatabaseError> {
        self.values.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), DatabaseError> {
        self.values.lock().await.remove(key);
        Ok(())
    }
}
