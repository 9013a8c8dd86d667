//! Messaging destinations.
//!
//! [`BotApiDestination`] posts pages as documents through an HTTP Bot API
//! (`sendDocument`, multipart). Every failure it reports is a
//! [`DeliveryError`]; the [`crate::publish::Publisher`] decides how often to
//! try again.

use crate::error::RelayError;
use async_trait::async_trait;
use reqwest::multipart;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Default Bot API endpoint.
pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// What the destination reports about a delivered document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredMessage {
    pub message_id: i64,
    /// MIME type as seen by the destination.
    pub file_kind: Option<String>,
    /// Initial view count, when the destination reports one.
    pub views: Option<u64>,
}

/// A failed delivery attempt.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Request failed: {0}")]
    Network(String),

    #[error("Unexpected response: {0}")]
    Response(String),
}

/// Somewhere pages can be sent.
#[async_trait]
pub trait Destination: Send + Sync {
    /// Send `bytes` as a document named `filename` to `destination_id`.
    async fn send_document(
        &self,
        destination_id: i64,
        bytes: &[u8],
        filename: &str,
    ) -> Result<DeliveredMessage, DeliveryError>;
}

// ── Bot API ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    result: Option<ApiMessage>,
}

#[derive(Deserialize)]
struct ApiMessage {
    message_id: i64,
    #[serde(default)]
    document: Option<ApiDocument>,
    #[serde(default)]
    views: Option<u64>,
}

#[derive(Deserialize)]
struct ApiDocument {
    #[serde(default)]
    mime_type: Option<String>,
}

/// `sendDocument` over HTTP with content protection on.
pub struct BotApiDestination {
    client: reqwest::Client,
    base_url: String,
    token: String,
    protect_content: bool,
}

impl BotApiDestination {
    pub fn new(token: impl Into<String>, timeout: Duration) -> Result<Self, RelayError> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(RelayError::InvalidConfig("Bot token is empty".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RelayError::InvalidConfig(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: DEFAULT_API_BASE.to_string(),
            token,
            protect_content: true,
        })
    }

    /// Point at another Bot API server (self-hosted, or a test double).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn protect_content(mut self, on: bool) -> Self {
        self.protect_content = on;
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/bot{}/sendDocument", self.base_url, self.token)
    }
}

fn mime_for(filename: &str) -> &'static str {
    match crate::convert::file_suffix(filename).as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    }
}

#[async_trait]
impl Destination for BotApiDestination {
    async fn send_document(
        &self,
        destination_id: i64,
        bytes: &[u8],
        filename: &str,
    ) -> Result<DeliveredMessage, DeliveryError> {
        let part = multipart::Part::bytes(bytes.to_vec())
            .file_name(filename.to_string())
            .mime_str(mime_for(filename))
            .map_err(|e| DeliveryError::Network(format!("mime: {e}")))?;
        let form = multipart::Form::new()
            .text("chat_id", destination_id.to_string())
            .text("protect_content", self.protect_content.to_string())
            .part("document", part);

        // The endpoint embeds the token; never log it.
        let response = self
            .client
            .post(self.endpoint())
            .multipart(form)
            .send()
            .await
            .map_err(|e| DeliveryError::Network(e.without_url().to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| DeliveryError::Network(e.without_url().to_string()))?;
        if !status.is_success() {
            return Err(DeliveryError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ApiResponse =
            serde_json::from_str(&body).map_err(|e| DeliveryError::Response(e.to_string()))?;
        match (parsed.ok, parsed.result) {
            (true, Some(message)) => {
                debug!(destination_id, message_id = message.message_id, "Document accepted");
                Ok(DeliveredMessage {
                    message_id: message.message_id,
                    file_kind: message.document.and_then(|d| d.mime_type),
                    views: message.views,
                })
            }
            _ => Err(DeliveryError::Response(
                parsed.description.unwrap_or_else(|| "ok=false".into()),
            )),
        }
    }
}
