//! Emailing a ticket link to its holder, at most twice per ticket.

use std::sync::Arc;
use tracing::{info, warn};

use super::email_resolution::sanitize_email;
use super::mailer::{MailError, Mailer};
use crate::clock::Clock;
use crate::config::IssuanceConfig;
use crate::database::error::DatabaseError;
use crate::database::{OrderStore, TicketStore};
use crate::error::{AppError, DomainError, ExternalError, ValidationError};
use crate::logging::mask_email;
use crate::tickets::TicketId;

pub const EMAIL_SEND_LIMIT: i32 = 2;
pub const EMAIL_SUBJECT: &str = "Your QR Ticket";

#[derive(Debug, thiserror::Error)]
pub enum TicketEmailError {
    #[error("ticket {0} not found")]
    InvalidTicket(TicketId),
    #[error("invalid email address")]
    InvalidEmail(String),
    #[error("ticket {0} expired")]
    Expired(TicketId),
    #[error("email send limit reached")]
    LimitReached,
    #[error(transparent)]
    Delivery(#[from] MailError),
    #[error(transparent)]
    Storage(#[from] DatabaseError),
}

impl From<TicketEmailError> for AppError {
    fn from(err: TicketEmailError) -> Self {
        match err {
            TicketEmailError::InvalidTicket(id) => AppError::domain(DomainError::TicketNotFound {
                ticket_id: id.to_string(),
            }),
            TicketEmailError::InvalidEmail(email) => {
                AppError::validation(ValidationError::InvalidEmail { email })
            }
            TicketEmailError::Expired(id) => {
                AppError::domain(DomainError::TicketExpired { ticket_id: id.0 })
            }
            TicketEmailError::LimitReached => AppError::domain(DomainError::EmailLimitReached {
                limit: EMAIL_SEND_LIMIT,
            }),
            TicketEmailError::Delivery(e) => AppError::external(ExternalError::Mail {
                message: e.to_string(),
            }),
            TicketEmailError::Storage(e) => e.into(),
        }
    }
}

pub struct TicketEmailService {
    tickets: Arc<dyn TicketStore>,
    orders: Arc<dyn OrderStore>,
    mailer: Arc<dyn Mailer>,
    clock: Arc<dyn Clock>,
    config: IssuanceConfig,
}

impl TicketEmailService {
    pub fn new(
        tickets: Arc<dyn TicketStore>,
        orders: Arc<dyn OrderStore>,
        mailer: Arc<dyn Mailer>,
        clock: Arc<dyn Clock>,
        config: IssuanceConfig,
    ) -> Self {
        Self {
            tickets,
            orders,
            mailer,
            clock,
            config,
        }
    }

    /// Send the ticket permalink to `email`. Returns the new send count.
    pub async fn send(&self, ticket_id: TicketId, email: &str) -> Result<i32, TicketEmailError> {
        let ticket = self
            .tickets
            .get(ticket_id)
            .await?
            .ok_or(TicketEmailError::InvalidTicket(ticket_id))?;

        let email = sanitize_email(email)
            .ok_or_else(|| TicketEmailError::InvalidEmail(email.to_string()))?;

        if ticket.is_expired_at(self.clock.now()) {
            return Err(TicketEmailError::Expired(ticket_id));
        }

        let count = self
            .tickets
            .reserve_email_send(ticket_id, EMAIL_SEND_LIMIT)
            .await?
            .ok_or(TicketEmailError::LimitReached)?;

        let link = self.config.ticket_permalink(ticket_id.0);
        let body = format!(
            "Thank you for your purchase. Your ticket is available here:\n{}",
            link
        );
        if let Err(e) = self.mailer.send(&email, EMAIL_SUBJECT, &body).await {
            self.tickets.release_email_send(ticket_id).await?;
            return Err(e.into());
        }

        self.tickets.record_email_recipient(ticket_id, &email).await?;
        if let Err(e) = self
            .orders
            .add_note(ticket.order_id, &format!("Ticket emailed to {}", email))
            .await
        {
            warn!(order_id = ticket.order_id, error = %e, "failed to write order note");
        }

        info!(ticket_id = %ticket_id, to = %mask_email(&email), count, "ticket emailed");
        Ok(count)
    }
}
