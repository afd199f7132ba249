//! Unified error handling for the ticket backend
//!
//! Every layer keeps its own `thiserror` enum; at the HTTP edge they are lifted
//! into [`AppError`], which carries the status mapping, a machine-readable code
//! and the message shown to the ticket holder.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes for programmatic handling
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Domain errors (4xx)
    TicketNotFound,
    OrderNotFound,
    TicketNotIssued,
    TicketExpired,
    RecoveryTokenNotFound,
    RecoveryTokenExpired,
    EmailLimitReached,

    // Infrastructure errors (5xx)
    DatabaseError,
    CacheError,
    ConfigurationError,

    // External errors (502, 503)
    ProviderNotReady,
    MailDeliveryFailed,

    ValidationError,
}

/// Ticket lifecycle errors
#[derive(Debug, Clone)]
pub enum DomainError {
    TicketNotFound { ticket_id: String },
    OrderNotFound { order_id: i64 },
    /// Order exists but no ticket has been linked to it yet
    TicketNotIssued { order_id: i64 },
    /// Ticket past its validity window or swept to expired
    TicketExpired { ticket_id: i64 },
    RecoveryTokenNotFound,
    /// Token matched a ticket but its recovery window lapsed
    RecoveryTokenExpired,
    EmailLimitReached { limit: i32 },
}

/// Infrastructure-level errors (database, cache, configuration)
#[derive(Debug, Clone)]
pub enum InfrastructureError {
    Database { message: String, is_retryable: bool },
    Cache { message: String },
    Configuration { message: String },
}

/// External service errors (municipal provider, mail relay)
#[derive(Debug, Clone)]
pub enum ExternalError {
    /// Provider unconfigured or unreachable; `message` is safe to show
    ProviderNotReady { message: String },
    Mail { message: String },
}

/// Input validation errors
#[derive(Debug, Clone)]
pub enum ValidationError {
    MissingField { field: String },
    InvalidEmail { email: String },
}

/// Unified application error type
#[derive(Debug, Clone)]
pub struct AppError {
    pub kind: AppErrorKind,
    pub request_id: Option<String>,
    pub context: Option<String>,
}

#[derive(Debug, Clone)]
pub enum AppErrorKind {
    Domain(DomainError),
    Infrastructure(InfrastructureError),
    External(ExternalError),
    Validation(ValidationError),
}

impl AppError {
    pub fn new(kind: AppErrorKind) -> Self {
        Self {
            kind,
            request_id: None,
            context: None,
        }
    }

    pub fn domain(err: DomainError) -> Self {
        Self::new(AppErrorKind::Domain(err))
    }

    pub fn validation(err: ValidationError) -> Self {
        Self::new(AppErrorKind::Validation(err))
    }

    pub fn external(err: ExternalError) -> Self {
        Self::new(AppErrorKind::External(err))
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Map error to HTTP status code
    pub fn status_code(&self) -> u16 {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::TicketNotFound { .. } => 404,
                DomainError::OrderNotFound { .. } => 404,
                DomainError::TicketNotIssued { .. } => 404,
                DomainError::TicketExpired { .. } => 410, // Gone
                DomainError::RecoveryTokenNotFound => 404,
                DomainError::RecoveryTokenExpired => 410,
                DomainError::EmailLimitReached { .. } => 429, // Too Many Requests
            },
            AppErrorKind::Infrastructure(_) => 500,
            AppErrorKind::External(err) => match err {
                ExternalError::ProviderNotReady { .. } => 503,
                ExternalError::Mail { .. } => 502,
            },
            AppErrorKind::Validation(_) => 400,
        }
    }

    /// Get error code for client handling
    pub fn error_code(&self) -> ErrorCode {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::TicketNotFound { .. } => ErrorCode::TicketNotFound,
                DomainError::OrderNotFound { .. } => ErrorCode::OrderNotFound,
                DomainError::TicketNotIssued { .. } => ErrorCode::TicketNotIssued,
                DomainError::TicketExpired { .. } => ErrorCode::TicketExpired,
                DomainError::RecoveryTokenNotFound => ErrorCode::RecoveryTokenNotFound,
                DomainError::RecoveryTokenExpired => ErrorCode::RecoveryTokenExpired,
                DomainError::EmailLimitReached { .. } => ErrorCode::EmailLimitReached,
            },
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { .. } => ErrorCode::DatabaseError,
                InfrastructureError::Cache { .. } => ErrorCode::CacheError,
                InfrastructureError::Configuration { .. } => ErrorCode::ConfigurationError,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::ProviderNotReady { .. } => ErrorCode::ProviderNotReady,
                ExternalError::Mail { .. } => ErrorCode::MailDeliveryFailed,
            },
            AppErrorKind::Validation(_) => ErrorCode::ValidationError,
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::TicketNotFound { .. } => "Invalid ticket.".to_string(),
                DomainError::OrderNotFound { order_id } => {
                    format!("Order {} not found.", order_id)
                }
                DomainError::TicketNotIssued { order_id } => {
                    format!("No ticket has been issued for order {} yet.", order_id)
                }
                DomainError::TicketExpired { .. } => "Ticket expired.".to_string(),
                DomainError::RecoveryTokenNotFound => "Ticket not found.".to_string(),
                DomainError::RecoveryTokenExpired => "Ticket token expired.".to_string(),
                DomainError::EmailLimitReached { .. } => "Email was already sent.".to_string(),
            },
            AppErrorKind::Infrastructure(_) => {
                "Service temporarily unavailable. Please try again later".to_string()
            }
            AppErrorKind::External(err) => match err {
                ExternalError::ProviderNotReady { message } => message.clone(),
                ExternalError::Mail { .. } => "Failed to send email.".to_string(),
            },
            AppErrorKind::Validation(err) => match err {
                ValidationError::MissingField { field } => {
                    if field == "token" {
                        "Token missing.".to_string()
                    } else {
                        format!("Required field '{}' is missing", field)
                    }
                }
                ValidationError::InvalidEmail { .. } => "Invalid email.".to_string(),
            },
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match &self.kind {
            AppErrorKind::Domain(_) => false,
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { is_retryable, .. } => *is_retryable,
                InfrastructureError::Cache { .. } => true,
                InfrastructureError::Configuration { .. } => false,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::ProviderNotReady { .. } => true,
                ExternalError::Mail { .. } => true,
            },
            AppErrorKind::Validation(_) => false,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for AppError {}

// From<DatabaseError> lives in database/error.rs, From<CacheError> in cache/error.rs

impl From<crate::config::ConfigError> for AppError {
    fn from(err: crate::config::ConfigError) -> Self {
        AppError::new(AppErrorKind::Infrastructure(
            InfrastructureError::Configuration {
                message: err.to_string(),
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovery_not_found_and_expired_are_distinct() {
        let missing = AppError::domain(DomainError::RecoveryTokenNotFound);
        let expired = AppError::domain(DomainError::RecoveryTokenExpired);

        assert_eq!(missing.status_code(), 404);
        assert_eq!(expired.status_code(), 410);
        assert_ne!(missing.error_code(), expired.error_code());
        assert_eq!(expired.user_message(), "Ticket token expired.");
    }

    #[test]
    fn email_limit_is_too_many_requests() {
        let error = AppError::domain(DomainError::EmailLimitReached { limit: 2 });

        assert_eq!(error.status_code(), 429);
        assert_eq!(error.error_code(), ErrorCode::EmailLimitReached);
        assert_eq!(error.user_message(), "Email was already sent.");
        assert!(!error.is_retryable());
    }

    #[test]
    fn mail_failure_is_bad_gateway() {
        let error = AppError::external(ExternalError::Mail {
            message: "relay returned 500".to_string(),
        });

        assert_eq!(error.status_code(), 502);
        assert_eq!(error.user_message(), "Failed to send email.");
        assert!(error.is_retryable());
    }

    #[test]
    fn missing_token_has_dedicated_message() {
        let error = AppError::validation(ValidationError::MissingField {
            field: "token".to_string(),
        });

        assert_eq!(error.status_code(), 400);
        assert_eq!(error.error_code(), ErrorCode::ValidationError);
        assert_eq!(error.user_message(), "Token missing.");
    }

    #[test]
    fn provider_not_ready_passes_message_through() {
        let error = AppError::external(ExternalError::ProviderNotReady {
            message: "Municipality provider is not configured. Please contact support."
                .to_string(),
        });

        assert_eq!(error.status_code(), 503);
        assert!(error.user_message().starts_with("Municipality provider"));
    }
}
