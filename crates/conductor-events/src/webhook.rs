use std::sync::Arc;
use std::time::Duration;

use conductor_core::PipelineEvent;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, warn};

use crate::bus::SubscriptionId;
use crate::error::WebhookError;
use crate::log::EventLog;

/// Header carrying `sha256=<hex hmac>` of the request body.
pub const SIGNATURE_HEADER: &str = "x-conductor-signature";
/// Header carrying the event's `event_type`.
pub const EVENT_HEADER: &str = "x-conductor-event";

const DEFAULT_TIMEOUT_MS: u64 = 5_000;

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

/// Where and how to deliver events over HTTP.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    /// HMAC key for the signature header; unsigned when absent.
    #[serde(default)]
    pub secret: Option<String>,
    /// `event_type` allow-list; empty delivers everything.
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl WebhookConfig {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            secret: None,
            events: Vec::new(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

/// Delivers events to a webhook endpoint as signed JSON POSTs.
#[derive(Debug)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    config: WebhookConfig,
}

impl WebhookNotifier {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: WebhookConfig) -> Result<Self, WebhookError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(WebhookError::Client)?;
        Ok(Self { client, config })
    }

    #[must_use]
    pub fn config(&self) -> &WebhookConfig {
        &self.config
    }

    /// Whether `event_type` passes the allow-list.
    #[must_use]
    pub fn accepts(&self, event_type: &str) -> bool {
        self.config.events.is_empty() || self.config.events.iter().any(|e| e == event_type)
    }

    /// Signature header value for `body`, or `None` when no secret is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the secret cannot be used as an HMAC key.
    pub fn signature(&self, body: &[u8]) -> Result<Option<String>, WebhookError> {
        let Some(secret) = &self.config.secret else {
            return Ok(None);
        };
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
            .map_err(|_| WebhookError::InvalidSecret)?;
        mac.update(body);
        Ok(Some(format!(
            "sha256={}",
            hex::encode(mac.finalize().into_bytes())
        )))
    }

    /// POST `event` to the endpoint. Any non-2xx status is a failure.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding, signing or the request fails, or if the
    /// endpoint answers with a non-success status.
    pub async fn deliver(&self, event: &PipelineEvent) -> Result<(), WebhookError> {
        let body = serde_json::to_vec(event).map_err(WebhookError::Encode)?;
        let mut request = self
            .client
            .post(&self.config.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(EVENT_HEADER, &event.event_type);
        if let Some(signature) = self.signature(&body)? {
            request = request.header(SIGNATURE_HEADER, signature);
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|source| WebhookError::Request {
                url: self.config.url.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(WebhookError::Status {
                url: self.config.url.clone(),
                status: status.as_u16(),
            });
        }

        debug!(
            url = %self.config.url,
            event_type = %event.event_type,
            request_id = %event.request_id,
            "delivered webhook"
        );
        Ok(())
    }

    /// Subscribe to `log`, delivering each accepted event on its own Tokio
    /// task. Delivery failures are logged and do not affect publishing.
    pub fn attach(self: &Arc<Self>, log: &EventLog) -> SubscriptionId {
        let notifier = Arc::clone(self);
        log.subscribe(move |event| {
            if !notifier.accepts(&event.event_type) {
                return;
            }
            let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                warn!(
                    event_type = %event.event_type,
                    "no tokio runtime; webhook delivery skipped"
                );
                return;
            };
            let notifier = Arc::clone(&notifier);
            let event = event.clone();
            runtime.spawn(async move {
                if let Err(e) = notifier.deliver(&event).await {
                    warn!(
                        event_type = %event.event_type,
                        request_id = %event.request_id,
                        error = %e,
                        "webhook delivery failed"
                    );
                }
            });
        })
    }
}
