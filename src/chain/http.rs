//! HTTP adapter for the Chain Execution Service
//!
//! Endpoints:
//! - `POST {endpoint}/v1/trades` with a [`TradeCall`](super::TradeCall)
//! - `POST {endpoint}/v1/graduations` with a [`GraduationCall`](super::GraduationCall)
//! - `GET {endpoint}/v1/confirmations/{key}`
//!
//! 4xx responses are rejections and are not retried; transport errors and
//! 5xx responses are transient.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tracing::debug;

use super::payload::ChainPayload;
use super::{ChainConfirmation, ChainExecutor, Submission};
use crate::config::ChainConfig;
use crate::error::{Error, Result};

/// Header carrying the service API key
pub const API_KEY_HEADER: &str = "x-api-key";

/// Error body returned by the service
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: Option<String>,
}

/// reqwest-backed [`ChainExecutor`]
pub struct HttpChainExecutor {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    timeout_ms: u64,
}

impl HttpChainExecutor {
    pub fn new(config: &ChainConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key: Some(config.api_key.clone()).filter(|k| !k.is_empty()),
            timeout_ms: config.timeout_ms,
        })
    }

    fn with_key(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.header(API_KEY_HEADER, key),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        self.with_key(request).send().await.map_err(|e| {
            if e.is_timeout() {
                Error::ChainTimeout(self.timeout_ms)
            } else {
                Error::ChainExecution(format!("HTTP request failed: {}", e))
            }
        })
    }
}

#[async_trait]
impl ChainExecutor for HttpChainExecutor {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn submit(&self, payload: &ChainPayload) -> Result<Submission> {
        let request = match payload {
            ChainPayload::Trade(call) => self
                .client
                .post(format!("{}/v1/trades", self.endpoint))
                .json(call),
            ChainPayload::Graduation(call) => self
                .client
                .post(format!("{}/v1/graduations", self.endpoint))
                .json(call),
        };

        debug!(key = %payload.idempotency_key(), "Submitting payload");
        let response = check_status(self.send(request).await?).await?;

        response
            .json::<Submission>()
            .await
            .map_err(|e| Error::Deserialization(format!("Failed to parse submission: {}", e)))
    }

    async fn confirmation(&self, idempotency_key: &str) -> Result<Option<ChainConfirmation>> {
        let request = self
            .client
            .get(format!("{}/v1/confirmations/{}", self.endpoint, idempotency_key));
        let response = self.send(request).await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(response).await?;

        response
            .json::<ChainConfirmation>()
            .await
            .map(Some)
            .map_err(|e| Error::Deserialization(format!("Failed to parse confirmation: {}", e)))
    }
}

/// Map non-success statuses onto rejection or transient errors
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorResponse>(&body)
        .ok()
        .and_then(|r| r.error)
        .unwrap_or(body);
    let message = format!("{}: {}", status, message);

    if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
        Err(Error::ChainRejected(message))
    } else {
        Err(Error::ChainExecution(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executor_from_config() {
        let config = ChainConfig {
            endpoint: "http://127.0.0.1:8080/".into(),
            api_key: String::new(),
            router_address: "0x0000000000000000000000000000000000000000".into(),
            timeout_ms: 1_000,
            max_retries: 3,
            retry_base_delay_ms: 100,
        };

        let executor = HttpChainExecutor::new(&config).unwrap();
        assert_eq!(executor.endpoint(), "http://127.0.0.1:8080");
        assert!(executor.api_key.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transient() {
        let config = ChainConfig {
            // Reserved port, nothing listens there
            endpoint: "http://127.0.0.1:9".into(),
            api_key: "secret".into(),
            router_address: "0x0000000000000000000000000000000000000000".into(),
            timeout_ms: 500,
            max_retries: 0,
            retry_base_delay_ms: 10,
        };
        let executor = HttpChainExecutor::new(&config).unwrap();

        let err = executor.confirmation("tok:graduation:1").await.unwrap_err();
        assert!(err.is_retryable());
    }
}
