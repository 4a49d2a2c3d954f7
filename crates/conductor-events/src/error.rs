use thiserror::Error;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("failed to build HTTP client")]
    Client(#[source] reqwest::Error),

    #[error("failed to encode event")]
    Encode(#[source] serde_json::Error),

    #[error("webhook secret cannot be used as a signing key")]
    InvalidSecret,

    #[error("request to '{url}' failed")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("'{url}' answered with status {status}")]
    Status { url: String, status: u16 },
}
