//! HTTP client for the municipal provider.
//!
//! Handles the client-credentials token, bearer auth, one re-authentication on
//! 401 and bounded retries on network failures and 5xx responses.

use reqwest::{header, Client, Method};
use serde_json::Value as JsonValue;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::error::ProviderError;
use super::token_cache::{CachedToken, TokenCache};
use super::types::{ProviderResponse, TicketCatalog, TokenRequest, TokenResponse};
use crate::clock::Clock;
use crate::config::ProviderConfig;
use crate::tickets::TicketType;

pub const GET_ATTEMPTS: u32 = 2;
pub const POST_ATTEMPTS: u32 = 3;

/// Result of checking the mapped provider ticket ids against the provider catalog
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreflightReport {
    /// Types with no provider id configured
    pub unmapped: Vec<TicketType>,
    /// Types whose configured id the provider does not list
    pub missing: Vec<TicketType>,
}

impl PreflightReport {
    pub fn is_ok(&self) -> bool {
        self.unmapped.is_empty() && self.missing.is_empty()
    }
}

pub struct ProviderClient {
    http: Client,
    config: ProviderConfig,
    token_cache: Arc<dyn TokenCache>,
    clock: Arc<dyn Clock>,
}

impl ProviderClient {
    pub fn new(
        config: ProviderConfig,
        token_cache: Arc<dyn TokenCache>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ProviderError> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProviderError::Network {
                message: format!("failed to initialize HTTP client: {}", e),
            })?;

        Ok(Self {
            http,
            config,
            token_cache,
            clock,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn is_configured(&self) -> bool {
        self.config.is_configured()
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url, path.trim_start_matches('/'))
    }

    /// Return a cached access token or fetch a new one.
    pub async fn get_token(&self) -> Result<String, ProviderError> {
        if !self.is_configured() {
            return Err(ProviderError::NotConfigured {
                provider: self.config.name.clone(),
            });
        }

        let now = self.clock.now();
        match self.token_cache.get().await {
            Ok(Some(cached)) if cached.is_fresh(now) => return Ok(cached.access_token),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "provider token cache read failed"),
        }

        let response = self
            .http
            .post(self.url("oauth/token"))
            .timeout(self.config.timeout)
            .json(&TokenRequest {
                grant_type: "client_credentials",
                client_id: &self.config.client_id,
                client_secret: &self.config.client_secret,
            })
            .send()
            .await
            .map_err(|e| ProviderError::TokenUnavailable {
                reason: e.to_string(),
            })?;

        let status = response.status();
        if status.as_u16() != 200 {
            warn!(status = status.as_u16(), provider = %self.config.name, "token request rejected");
            return Err(ProviderError::TokenUnavailable {
                reason: format!("HTTP {}", status.as_u16()),
            });
        }

        let body: TokenResponse =
            response
                .json()
                .await
                .map_err(|e| ProviderError::TokenUnavailable {
                    reason: format!("unreadable token response: {}", e),
                })?;

        let (access_token, expires_in) = match (body.access_token, body.expires_in) {
            (Some(token), Some(expires_in)) if !token.is_empty() && expires_in > 0 => {
                (token, expires_in)
            }
            _ => {
                return Err(ProviderError::TokenUnavailable {
                    reason: "token response missing access_token or expires_in".to_string(),
                })
            }
        };

        let cached = CachedToken {
            access_token,
            expires_at: now + expires_in,
        };
        if let Err(e) = self.token_cache.set(&cached).await {
            warn!(error = %e, "provider token cache write failed");
        }

        info!(provider = %self.config.name, expires_at = cached.expires_at, "provider token refreshed");
        Ok(cached.access_token)
    }

    pub async fn invalidate_token(&self) {
        if let Err(e) = self.token_cache.clear().await {
            warn!(error = %e, "provider token cache clear failed");
        }
    }

    pub async fn get(&self, path: &str) -> ProviderResponse {
        self.request(Method::GET, path, None, None).await
    }

    pub async fn post(&self, path: &str, body: &JsonValue) -> ProviderResponse {
        self.request(Method::POST, path, Some(body), None).await
    }

    /// Perform an authenticated request.
    ///
    /// `attempts` defaults to 2 for GET and 3 for everything else. A 401 triggers
    /// one re-authentication that does not count as an attempt.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&JsonValue>,
        attempts: Option<u32>,
    ) -> ProviderResponse {
        if !self.is_configured() {
            return ProviderResponse::failure(
                0,
                None,
                format!("{} client not configured.", self.config.name),
            );
        }

        let mut token = match self.get_token().await {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "provider token unavailable");
                return ProviderResponse::failure(0, None, "Unable to retrieve token.");
            }
        };

        let default_attempts = if method == Method::GET {
            GET_ATTEMPTS
        } else {
            POST_ATTEMPTS
        };
        let max_attempts = attempts.unwrap_or(default_attempts).max(1);
        let url = self.url(path);

        let mut attempt = 0;
        let mut reauthenticated = false;
        let mut last_status = 0;
        let mut last_body = None;
        let mut last_error = String::new();

        while attempt < max_attempts {
            attempt += 1;

            let mut builder = self
                .http
                .request(method.clone(), &url)
                .timeout(self.config.timeout)
                .bearer_auth(&token)
                .header(header::ACCEPT, "application/json");
            if let Some(payload) = body {
                builder = builder.json(payload);
            }

            let response = match builder.send().await {
                Ok(response) => response,
                Err(e) => {
                    warn!(attempt, error = %e, path, "provider request failed, retrying");
                    last_error = e.to_string();
                    continue;
                }
            };

            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            let decoded: Option<JsonValue> = serde_json::from_str(&text).ok();
            last_status = status;
            last_body = decoded.clone();

            if status == 401 && !reauthenticated {
                reauthenticated = true;
                self.invalidate_token().await;
                match self.get_token().await {
                    Ok(fresh) => {
                        debug!(path, "provider token rejected, re-authenticated");
                        token = fresh;
                        attempt -= 1;
                        continue;
                    }
                    Err(e) => {
                        warn!(error = %e, path, "provider re-authentication failed");
                        last_error = ProviderError::Authentication.to_string();
                        break;
                    }
                }
            }

            if status >= 500 && attempt < max_attempts {
                warn!(status, attempt, path, "provider server error, retrying");
                last_error = format!("Server error {}", status);
                tokio::time::sleep(self.backoff(attempt)).await;
                continue;
            }

            let ok = (200..300).contains(&status);
            let error = if ok {
                String::new()
            } else {
                error_message(decoded.as_ref())
            };

            return ProviderResponse {
                ok,
                status,
                body: decoded,
                error,
            };
        }

        if last_error.is_empty() {
            last_error = "Request failed.".to_string();
        }
        ProviderResponse::failure(last_status, last_body, last_error)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.config.retry_backoff * (1u32 << attempt.saturating_sub(1).min(16))
    }

    /// Check that every mapped provider ticket id appears in `GET /api/ticket`.
    pub async fn preflight(&self) -> Result<PreflightReport, ProviderError> {
        let response = self.get("/api/ticket").await;
        if !response.ok {
            return Err(ProviderError::Request {
                status: response.status,
                message: response.error,
            });
        }

        let catalog: TicketCatalog = serde_json::from_value(response.body.unwrap_or_default())
            .map_err(|e| ProviderError::InvalidResponse {
                message: e.to_string(),
            })?;
        let listed: HashSet<i64> = catalog.data.iter().filter_map(|e| e.ticket_id).collect();

        let mut report = PreflightReport::default();
        for ticket_type in TicketType::ALL {
            let id = self.config.ticket_id_for(ticket_type);
            if id == 0 {
                report.unmapped.push(ticket_type);
            } else if !i64::try_from(id).is_ok_and(|id| listed.contains(&id)) {
                report.missing.push(ticket_type);
            }
        }

        Ok(report)
    }
}

/// Error text from a failed response body: `message`, then `error`.
fn error_message(body: Option<&JsonValue>) -> String {
    body.and_then(|b| {
        ["message", "error"]
            .iter()
            .filter_map(|key| b.get(*key).and_then(JsonValue::as_str))
            .find(|s| !s.is_empty())
            .map(str::to_string)
    })
    .unwrap_or_else(|| "Request failed.".to_string())
}
