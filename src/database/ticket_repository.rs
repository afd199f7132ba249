use async_trait::async_trait;
use sqlx::{FromRow, PgPool};

use crate::database::error::DatabaseError;
use crate::database::TicketStore;
use crate::tickets::{NewTicket, OrderId, SyncRecord, Ticket, TicketId};

const TICKET_COLUMNS: &str = "id, code, title, ticket_type, status, valid_from, valid_to, \
     order_id, user_id, email, amount_cents, currency, qr_ref, email_send_count, \
     recovery_token, recovery_expires_at, provider, provider_ticket_id, provider_code, \
     provider_qr, sync_status, provider_attempts, provider_last_error, created_at";

/// Ticket row as stored
#[derive(Debug, Clone, FromRow)]
struct TicketRow {
    id: i64,
    code: String,
    title: String,
    ticket_type: String,
    status: String,
    valid_from: i64,
    valid_to: i64,
    order_id: i64,
    user_id: Option<i64>,
    email: Option<String>,
    amount_cents: i64,
    currency: String,
    qr_ref: Option<String>,
    email_send_count: i32,
    recovery_token: Option<String>,
    recovery_expires_at: Option<i64>,
    provider: Option<String>,
    provider_ticket_id: Option<i64>,
    provider_code: Option<String>,
    provider_qr: Option<String>,
    sync_status: String,
    provider_attempts: i32,
    provider_last_error: Option<String>,
    created_at: i64,
}

impl TryFrom<TicketRow> for Ticket {
    type Error = DatabaseError;

    fn try_from(row: TicketRow) -> Result<Self, Self::Error> {
        Ok(Ticket {
            id: TicketId(row.id),
            ticket_type: row
                .ticket_type
                .parse()
                .map_err(|e| DatabaseError::decode(format!("ticket {}: {}", row.id, e)))?,
            status: row
                .status
                .parse()
                .map_err(|e| DatabaseError::decode(format!("ticket {}: {}", row.id, e)))?,
            sync_status: row
                .sync_status
                .parse()
                .map_err(|e| DatabaseError::decode(format!("ticket {}: {}", row.id, e)))?,
            code: row.code,
            title: row.title,
            valid_from: row.valid_from,
            valid_to: row.valid_to,
            order_id: row.order_id,
            user_id: row.user_id,
            email: row.email,
            amount_cents: row.amount_cents,
            currency: row.currency,
            qr_ref: row.qr_ref,
            email_send_count: row.email_send_count,
            recovery_token: row.recovery_token,
            recovery_expires_at: row.recovery_expires_at,
            provider: row.provider,
            provider_ticket_id: row.provider_ticket_id,
            provider_code: row.provider_code,
            provider_qr: row.provider_qr,
            provider_attempts: row.provider_attempts,
            provider_last_error: row.provider_last_error,
            created_at: row.created_at,
        })
    }
}

/// Repository for issued tickets
pub struct TicketRepository {
    pool: PgPool,
}

impl TicketRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_one_where<T>(&self, clause: &str, bind: T) -> Result<Option<Ticket>, DatabaseError>
    where
        T: for<'q> sqlx::Encode<'q, sqlx::Postgres> + sqlx::Type<sqlx::Postgres> + Send + 'static,
    {
        let sql = format!("SELECT {} FROM tickets WHERE {}", TICKET_COLUMNS, clause);
        let row = sqlx::query_as::<_, TicketRow>(&sql)
            .bind(bind)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        row.map(Ticket::try_from).transpose()
    }
}

#[async_trait]
impl TicketStore for TicketRepository {
    async fn insert(&self, ticket: NewTicket) -> Result<Option<Ticket>, DatabaseError> {
        let sql = format!(
            "INSERT INTO tickets
             (code, title, ticket_type, status, valid_from, valid_to, order_id, user_id,
              email, amount_cents, currency, sync_status, created_at)
             VALUES ($1, $2, $3, 'active', $4, $5, $6, $7, $8, $9, $10, 'pending', $11)
             ON CONFLICT (order_id) DO NOTHING
             RETURNING {}",
            TICKET_COLUMNS
        );

        let row = sqlx::query_as::<_, TicketRow>(&sql)
            .bind(&ticket.code)
            .bind(ticket.title())
            .bind(ticket.ticket_type.as_str())
            .bind(ticket.valid_from)
            .bind(ticket.valid_to())
            .bind(ticket.order_id)
            .bind(ticket.user_id)
            .bind(&ticket.email)
            .bind(ticket.amount_cents)
            .bind(&ticket.currency)
            .bind(ticket.created_at)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        row.map(Ticket::try_from).transpose()
    }

    async fn get(&self, id: TicketId) -> Result<Option<Ticket>, DatabaseError> {
        self.fetch_one_where("id = $1", id.0).await
    }

    async fn find_by_order(&self, order_id: OrderId) -> Result<Option<Ticket>, DatabaseError> {
        self.fetch_one_where("order_id = $1", order_id).await
    }

    async fn code_exists(&self, code: &str) -> Result<bool, DatabaseError> {
        sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM tickets WHERE code = $1)")
            .bind(code)
            .fetch_one(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)
    }

    async fn find_by_recovery_token(&self, token: &str) -> Result<Option<Ticket>, DatabaseError> {
        self.fetch_one_where("recovery_token = $1", token.to_string())
            .await
    }

    async fn list_by_user(&self, user_id: i64) -> Result<Vec<Ticket>, DatabaseError> {
        let sql = format!(
            "SELECT {} FROM tickets WHERE user_id = $1 ORDER BY created_at DESC, id DESC",
            TICKET_COLUMNS
        );
        let rows = sqlx::query_as::<_, TicketRow>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        rows.into_iter().map(Ticket::try_from).collect()
    }

    async fn set_qr_ref(&self, id: TicketId, qr_ref: &str) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE tickets SET qr_ref = $2 WHERE id = $1")
            .bind(id.0)
            .bind(qr_ref)
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        Ok(())
    }

    async fn record_sync(&self, id: TicketId, record: &SyncRecord) -> Result<(), DatabaseError> {
        let (valid_from, valid_to) = match record.validity {
            Some((from, to)) => (Some(from), Some(to)),
            None => (None, None),
        };

        let result = sqlx::query(
            "UPDATE tickets
             SET provider = $2,
                 sync_status = $3,
                 provider_attempts = $4,
                 provider_last_error = $5,
                 provider_ticket_id = COALESCE($6, provider_ticket_id),
                 provider_code = COALESCE($7, provider_code),
                 provider_qr = COALESCE($8, provider_qr),
                 qr_ref = COALESCE($9, qr_ref),
                 valid_from = COALESCE($10, valid_from),
                 valid_to = COALESCE($11, valid_to)
             WHERE id = $1",
        )
        .bind(id.0)
        .bind(&record.provider)
        .bind(record.status.as_str())
        .bind(record.attempts)
        .bind(&record.last_error)
        .bind(record.provider_ticket_id)
        .bind(&record.provider_code)
        .bind(&record.provider_qr)
        .bind(&record.qr_ref)
        .bind(valid_from)
        .bind(valid_to)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::not_found(format!("ticket {}", id)));
        }
        Ok(())
    }

    async fn set_recovery(
        &self,
        id: TicketId,
        token: &str,
        expires_at: i64,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE tickets SET recovery_token = $2, recovery_expires_at = $3 WHERE id = $1",
        )
        .bind(id.0)
        .bind(token)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(())
    }

    async fn expire_overdue(&self, now: i64, limit: i64) -> Result<Vec<TicketId>, DatabaseError> {
        let ids = sqlx::query_scalar::<_, i64>(
            "UPDATE tickets SET status = 'expired'
             WHERE id IN (
                 SELECT id FROM tickets
                 WHERE status = 'active' AND valid_to < $1
                 ORDER BY valid_to ASC
                 LIMIT $2
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING id",
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(ids.into_iter().map(TicketId).collect())
    }

    async fn find_retryable(
        &self,
        max_attempts: i32,
        limit: i64,
    ) -> Result<Vec<TicketId>, DatabaseError> {
        let ids = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM tickets
             WHERE sync_status = 'failed' AND provider_attempts < $1
             ORDER BY id ASC
             LIMIT $2",
        )
        .bind(max_attempts)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(ids.into_iter().map(TicketId).collect())
    }

    async fn reserve_email_send(
        &self,
        id: TicketId,
        limit: i32,
    ) -> Result<Option<i32>, DatabaseError> {
        // The guard and the increment share one statement so concurrent
        // senders cannot both take the last slot.
        sqlx::query_scalar::<_, i32>(
            "UPDATE tickets
             SET email_send_count = email_send_count + 1
             WHERE id = $1 AND email_send_count < $2
             RETURNING email_send_count",
        )
        .bind(id.0)
        .bind(limit)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn release_email_send(&self, id: TicketId) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE tickets
             SET email_send_count = email_send_count - 1
             WHERE id = $1 AND email_send_count > 0",
        )
        .bind(id.0)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }

    async fn record_email_recipient(&self, id: TicketId, email: &str) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE tickets SET email = COALESCE(NULLIF(email, ''), $2) WHERE id = $1")
            .bind(id.0)
            .bind(email)
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }
}
