use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

use super::error::RpcError;

/// Raw HTTP exchange with a single endpoint. Implementations report
/// connection-level problems as [`RpcError::Transport`] and never interpret
/// JSON-RPC envelopes.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post_json(&self, url: &str, body: &Value) -> Result<Value, RpcError>;

    async fn get_json(&self, url: &str) -> Result<Value, RpcError>;
}

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> eyre::Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| eyre::eyre!("Failed to build HTTP client: {}", e))?;
        Ok(Self { client })
    }

    async fn read_body(
        url: &str,
        response: reqwest::Response,
    ) -> Result<(reqwest::StatusCode, Value), RpcError> {
        let status = response.status();
        // Rate limiting and server-side failures are worth another endpoint.
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(RpcError::transport(url, format!("HTTP {}", status)));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| RpcError::transport(url, e))?;

        match serde_json::from_slice::<Value>(&bytes) {
            Ok(value) => Ok((status, value)),
            Err(_) if !status.is_success() => {
                Err(RpcError::Malformed(format!("HTTP {} from {}", status, url)))
            }
            Err(e) => Err(RpcError::Malformed(format!("invalid JSON from {}: {}", url, e))),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post_json(&self, url: &str, body: &Value) -> Result<Value, RpcError> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| RpcError::transport(url, e))?;
        // JSON-RPC servers may pair an error envelope with a 4xx status; the
        // client interprets the envelope either way.
        let (_, value) = Self::read_body(url, response).await?;
        Ok(value)
    }

    async fn get_json(&self, url: &str) -> Result<Value, RpcError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| RpcError::transport(url, e))?;
        let (status, value) = Self::read_body(url, response).await?;
        if !status.is_success() {
            let message = value
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| value.to_string());
            return Err(RpcError::Rpc {
                code: i64::from(status.as_u16()),
                message,
            });
        }
        Ok(value)
    }
}
