use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::SweeperConfig;
use crate::database::error::DatabaseError;
use crate::database::{SettingsStore, TicketStore};
use crate::services::ProviderService;
use crate::tickets::{SyncOutcome, TicketId};

/// Settings key holding the unix time of the last retry pass.
pub const RETRY_GATE_KEY: &str = "sweeper_last_retry_at";

// ---------------------------------------------------------------------------
// Custom error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),
}

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: Vec<TicketId>,
    /// `false` when the retry pass was gated off or the provider is in test mode.
    pub retry_pass_ran: bool,
    pub retried: Vec<(TicketId, SyncOutcome)>,
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

pub struct ExpirationSweeper {
    tickets: Arc<dyn TicketStore>,
    settings: Arc<dyn SettingsStore>,
    provider: Arc<ProviderService>,
    clock: Arc<dyn Clock>,
    config: SweeperConfig,
}

impl ExpirationSweeper {
    pub fn new(
        tickets: Arc<dyn TicketStore>,
        settings: Arc<dyn SettingsStore>,
        provider: Arc<ProviderService>,
        clock: Arc<dyn Clock>,
        config: SweeperConfig,
    ) -> Self {
        Self {
            tickets,
            settings,
            provider,
            clock,
            config,
        }
    }

    pub async fn run_loop(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            expire_batch = self.config.expire_batch,
            retry_batch = self.config.retry_batch,
            "expiration sweeper started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("expiration sweeper stopping");
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.interval) => {
                    if let Err(e) = self.run().await {
                        warn!(error = %e, "sweep cycle failed");
                    }
                }
            }
        }

        info!("expiration sweeper stopped");
    }

    /// One sweep: expire overdue tickets, then retry failed provider syncs when
    /// the retry gate allows it.
    pub async fn run(&self) -> Result<SweepReport, SweepError> {
        let now = self.clock.now();

        let expired = self
            .tickets
            .expire_overdue(now, self.config.expire_batch)
            .await?;
        if !expired.is_empty() {
            info!(count = expired.len(), "tickets expired");
        }

        let mut report = SweepReport {
            expired,
            ..Default::default()
        };

        if self.provider.is_test_mode() || !self.open_retry_gate(now).await? {
            return Ok(report);
        }
        report.retry_pass_ran = true;

        let candidates = self
            .tickets
            .find_retryable(self.config.max_attempts, self.config.retry_batch)
            .await?;

        for ticket_id in candidates {
            // One bad ticket must not stop the rest of the batch.
            match self.provider.retry_ticket(ticket_id).await {
                Ok(Some(outcome)) => report.retried.push((ticket_id, outcome)),
                Ok(None) => debug!(ticket_id = %ticket_id, "retry skipped"),
                Err(e) => warn!(ticket_id = %ticket_id, error = %e, "provider retry failed"),
            }
        }

        if !report.retried.is_empty() {
            info!(count = report.retried.len(), "provider syncs retried");
        }

        Ok(report)
    }

    /// Claim the retry pass if the last one ran at least `retry_gate_secs` ago.
    async fn open_retry_gate(&self, now: i64) -> Result<bool, SweepError> {
        let last = self
            .settings
            .get(RETRY_GATE_KEY)
            .await?
            .and_then(|v| v.as_i64());

        if let Some(last) = last {
            if now - last < self.config.retry_gate_secs {
                return Ok(false);
            }
        }

        self.settings.set(RETRY_GATE_KEY, json!(now)).await?;
        Ok(true)
    }
}
