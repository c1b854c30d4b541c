//! Message transport contract.

use std::time::Duration;

use async_trait::async_trait;
use courier_common::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::credentials::Credential;
use crate::outcome::SendOutcome;

/// Normalized result of one send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendResult {
    /// Outcome code; see [`SendOutcome`].
    pub code: i32,
    /// Human-readable detail.
    #[serde(default)]
    pub message: String,
    /// Unmodified provider response.
    #[serde(default)]
    pub raw: Value,
}

impl SendResult {
    /// Build a result from a code and message.
    #[must_use]
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            raw: Value::Null,
        }
    }

    /// Result standing in for a transport-level failure.
    #[must_use]
    pub fn network_error(err: &TransportError) -> Self {
        Self::new(SendOutcome::NetworkError.code(), err.to_string())
    }

    /// Classified outcome.
    #[must_use]
    pub const fn outcome(&self) -> SendOutcome {
        SendOutcome::from_code(self.code)
    }
}

/// Failure below the outcome taxonomy: the send could not be attempted or
/// its answer could not be read.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Gateway returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("{0}")]
    Other(String),
}

/// Sends one message with one credential.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `message` to `recipient_id` using `credential`.
    async fn send(
        &self,
        recipient_id: &str,
        credential: &Credential,
        message: &str,
        proxy_hint: Option<&str>,
    ) -> Result<SendResult, TransportError>;
}

#[derive(Serialize)]
struct SendRequest<'a> {
    recipient_id: &'a str,
    credential_id: &'a str,
    session: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    proxy: Option<&'a str>,
}

/// Transport that hands every send to an HTTP message gateway.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: url::Url,
}

impl HttpTransport {
    /// Create a transport posting to `endpoint`.
    pub fn new(endpoint: &str, timeout: Duration) -> AppResult<Self> {
        let endpoint = url::Url::parse(endpoint)
            .map_err(|e| AppError::Config(format!("invalid transport endpoint: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("courier/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AppError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        recipient_id: &str,
        credential: &Credential,
        message: &str,
        proxy_hint: Option<&str>,
    ) -> Result<SendResult, TransportError> {
        let request = SendRequest {
            recipient_id,
            credential_id: &credential.id,
            session: &credential.session,
            message,
            proxy: credential.proxy.as_deref().or(proxy_hint),
        };

        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let result: SendResult = response.json().await?;
        debug!(recipient_id, credential_id = %credential.id, code = result.code, "Gateway answered");
        Ok(result)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_result_parses_minimal_body() {
        let result: SendResult = serde_json::from_str(r#"{"code": 10002}"#).unwrap();
        assert_eq!(result.outcome(), SendOutcome::TooFast);
        assert!(result.raw.is_null());
    }

    #[test]
    fn test_transport_error_maps_to_network_code() {
        let err = TransportError::Status {
            status: 502,
            body: "bad gateway".to_string(),
        };
        let result = SendResult::network_error(&err);
        assert_eq!(result.code, -10002);
        assert!(result.message.contains("502"));
    }

    #[test]
    fn test_invalid_endpoint_is_config_error() {
        let err = HttpTransport::new("not a url", Duration::from_secs(1)).err();
        assert!(matches!(err, Some(AppError::Config(_))));
    }
}
