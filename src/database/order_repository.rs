use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::{FromRow, PgPool};

use crate::database::error::{DatabaseError, DatabaseErrorKind};
use crate::database::OrderStore;
use crate::orders::{LineItem, MetaEntry, Order};
use crate::tickets::{OrderId, TicketId};

#[derive(Debug, Clone, FromRow)]
struct OrderRow {
    id: i64,
    customer_id: Option<i64>,
    billing_email: Option<String>,
    currency: String,
    ticket_type_tag: Option<String>,
    device_qr: Option<String>,
    ticket_id: Option<i64>,
}

#[derive(Debug, Clone, FromRow)]
struct LineItemRow {
    product_id: i64,
    total: Decimal,
    tax: Decimal,
}

#[derive(Debug, Clone, FromRow)]
struct MetaRow {
    meta_key: String,
    meta_value: serde_json::Value,
}

/// Repository over the order read model
pub struct OrderRepository {
    pool: PgPool,
}

impl OrderRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Notes attached to an order, oldest first
    pub async fn notes(&self, id: OrderId) -> Result<Vec<String>, DatabaseError> {
        sqlx::query_scalar::<_, String>(
            "SELECT note FROM order_notes WHERE order_id = $1 ORDER BY id ASC",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }
}

#[async_trait]
impl OrderStore for OrderRepository {
    async fn get(&self, id: OrderId) -> Result<Option<Order>, DatabaseError> {
        let row = sqlx::query_as::<_, OrderRow>(
            "SELECT id, customer_id, billing_email, currency, ticket_type_tag, device_qr, ticket_id
             FROM orders
             WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let line_items = sqlx::query_as::<_, LineItemRow>(
            "SELECT product_id, total, tax
             FROM order_line_items
             WHERE order_id = $1
             ORDER BY position ASC, id ASC",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        let meta = sqlx::query_as::<_, MetaRow>(
            "SELECT meta_key, meta_value FROM order_meta WHERE order_id = $1 ORDER BY id ASC",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(Some(Order {
            id: row.id,
            customer_id: row.customer_id,
            billing_email: row.billing_email,
            currency: row.currency,
            line_items: line_items
                .into_iter()
                .map(|item| LineItem {
                    product_id: item.product_id,
                    total: item.total,
                    tax: item.tax,
                })
                .collect(),
            ticket_type_tag: row.ticket_type_tag,
            device_qr: row.device_qr,
            ticket_id: row.ticket_id.map(TicketId),
            meta: meta
                .into_iter()
                .map(|m| MetaEntry::new(m.meta_key, m.meta_value))
                .collect(),
        }))
    }

    async fn link_ticket(&self, id: OrderId, ticket_id: TicketId) -> Result<(), DatabaseError> {
        let linked = sqlx::query(
            "UPDATE orders SET ticket_id = $2
             WHERE id = $1 AND (ticket_id IS NULL OR ticket_id = $2)",
        )
        .bind(id)
        .bind(ticket_id.0)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?
        .rows_affected();

        if linked > 0 {
            return Ok(());
        }

        let exists = sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM orders WHERE id = $1)")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        if exists {
            Err(DatabaseError::new(
                DatabaseErrorKind::UniqueViolation,
                format!("order {} already linked to another ticket", id),
            ))
        } else {
            Err(DatabaseError::not_found(format!("order {}", id)))
        }
    }

    async fn set_billing_email(&self, id: OrderId, email: &str) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE orders SET billing_email = $2 WHERE id = $1")
            .bind(id)
            .bind(email)
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        Ok(())
    }

    async fn add_note(&self, id: OrderId, note: &str) -> Result<(), DatabaseError> {
        sqlx::query("INSERT INTO order_notes (order_id, note) VALUES ($1, $2)")
            .bind(id)
            .bind(note)
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        Ok(())
    }

    async fn customer_email(&self, customer_id: i64) -> Result<Option<String>, DatabaseError> {
        let email = sqlx::query_scalar::<_, Option<String>>(
            "SELECT email FROM customers WHERE id = $1",
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(email.flatten())
    }
}
