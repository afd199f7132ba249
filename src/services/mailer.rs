//! Outgoing mail transport.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

use crate::logging::mask_email;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MailError {
    #[error("mail transport error: {0}")]
    Transport(String),
    #[error("mail relay rejected message (HTTP {0})")]
    Rejected(u16),
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError>;
}

#[derive(Debug, Serialize)]
struct RelayMessage<'a> {
    to: &'a str,
    subject: &'a str,
    body: &'a str,
}

/// Posts `{to, subject, body}` to an HTTP mail relay; any 2xx is a delivery.
pub struct HttpMailRelay {
    http: Client,
    url: String,
}

impl HttpMailRelay {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, MailError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MailError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Mailer for HttpMailRelay {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError> {
        let response = self
            .http
            .post(&self.url)
            .json(&RelayMessage { to, subject, body })
            .send()
            .await
            .map_err(|e| MailError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), to = %mask_email(to), "mail relay rejected message");
            return Err(MailError::Rejected(status.as_u16()));
        }

        info!(to = %mask_email(to), subject, "mail relayed");
        Ok(())
    }
}

/// Logs the message instead of sending it. Used when no relay is configured.
#[derive(Debug, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError> {
        info!(
            to = %mask_email(to),
            subject,
            body_len = body.len(),
            "mail relay not configured, message logged only"
        );
        Ok(())
    }
}
