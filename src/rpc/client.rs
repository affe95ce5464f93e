use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::EndpointConfig;

use super::error::RpcError;
use super::rate_limiter::{limiter_for, normalize_url, TokenBucket};
use super::transport::Transport;

struct Endpoint {
    url: String,
    limiter: Arc<TokenBucket>,
}

/// Multi-endpoint client for one chain and one endpoint kind.
///
/// Calls start at the endpoint that last succeeded and rotate through the
/// rest in priority order when the transport fails.
pub struct RpcClient {
    chain: String,
    endpoints: Vec<Endpoint>,
    preferred: AtomicUsize,
    next_id: AtomicU64,
    transport: Arc<dyn Transport>,
}

impl RpcClient {
    /// `endpoints` are expected in priority order (see `ChainConfig::endpoints_of`).
    pub fn new(chain: &str, endpoints: &[EndpointConfig], transport: Arc<dyn Transport>) -> Self {
        let endpoints = endpoints
            .iter()
            .map(|e| Endpoint {
                url: normalize_url(&e.url).to_string(),
                limiter: limiter_for(&e.url, e.requests_per_second()),
            })
            .collect();

        Self {
            chain: chain.to_string(),
            endpoints,
            preferred: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            transport,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// URL of the endpoint the next call will try first.
    pub fn current_url(&self) -> Option<&str> {
        if self.endpoints.is_empty() {
            return None;
        }
        let index = self.preferred.load(Ordering::Relaxed) % self.endpoints.len();
        Some(&self.endpoints[index].url)
    }

    async fn with_fallback<T, F, Fut>(&self, cost: u32, mut attempt: F) -> Result<T, RpcError>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        let count = self.endpoints.len();
        if count == 0 {
            return Err(RpcError::NoEndpoints);
        }

        let start = self.preferred.load(Ordering::Relaxed) % count;
        let mut last_error = String::new();

        for offset in 0..count {
            let index = (start + offset) % count;
            let endpoint = &self.endpoints[index];
            endpoint.limiter.acquire(cost).await;

            match attempt(endpoint.url.clone()).await {
                Ok(value) => {
                    if index != start {
                        self.preferred.store(index, Ordering::Relaxed);
                        tracing::info!(
                            chain = %self.chain,
                            url = %endpoint.url,
                            "Switched preferred RPC endpoint"
                        );
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transport() => {
                    tracing::warn!(
                        chain = %self.chain,
                        url = %endpoint.url,
                        error = %e,
                        "RPC endpoint failed, trying next"
                    );
                    last_error = e.to_string();
                }
                Err(e) => return Err(e),
            }
        }

        Err(RpcError::AllEndpointsFailed {
            attempted: count,
            last: last_error,
        })
    }

    fn request(&self, method: &str, params: &Value) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
            "method": method,
            "params": params,
        })
    }

    /// Single JSON-RPC call. A `null` result is returned as `Value::Null`.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let body = self.request(method, &params);
        let transport = self.transport.clone();
        self.with_fallback(1, |url| {
            let transport = transport.clone();
            let body = body.clone();
            async move {
                let response = transport.post_json(&url, &body).await?;
                parse_envelope(response)
            }
        })
        .await
    }

    pub async fn call_as<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, RpcError> {
        let value = self.call(method, params).await?;
        serde_json::from_value(value)
            .map_err(|e| RpcError::Malformed(format!("{} result: {}", method, e)))
    }

    /// JSON-RPC batch. Results come back in request order; any per-item
    /// error fails the whole batch.
    pub async fn batch_call(&self, calls: &[(&str, Value)]) -> Result<Vec<Value>, RpcError> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }

        let requests: Vec<Value> = calls
            .iter()
            .map(|(method, params)| self.request(method, params))
            .collect();
        let ids: Vec<u64> = requests
            .iter()
            .filter_map(|r| r["id"].as_u64())
            .collect();
        let body = Value::Array(requests);
        let transport = self.transport.clone();
        let cost = u32::try_from(calls.len()).unwrap_or(u32::MAX);

        self.with_fallback(cost, |url| {
            let transport = transport.clone();
            let body = body.clone();
            let ids = ids.clone();
            async move {
                let response = transport.post_json(&url, &body).await?;
                let items = match response {
                    Value::Array(items) => items,
                    other => {
                        // A whole-batch failure comes back as a single envelope.
                        parse_envelope(other)?;
                        return Err(RpcError::Malformed("batch response is not an array".into()));
                    }
                };

                let mut by_id = std::collections::HashMap::with_capacity(items.len());
                for item in items {
                    let id = item["id"].as_u64().ok_or_else(|| {
                        RpcError::Malformed("batch item without numeric id".into())
                    })?;
                    by_id.insert(id, item);
                }

                let ordered: Result<Vec<Value>, RpcError> = ids
                    .iter()
                    .map(|id| {
                        let item = by_id.remove(id).ok_or_else(|| {
                            RpcError::Malformed(format!("batch response missing id {}", id))
                        })?;
                        parse_envelope(item)
                    })
                    .collect();
                ordered
            }
        })
        .await
    }

    /// REST `GET {endpoint}{path}`.
    pub async fn get(&self, path: &str) -> Result<Value, RpcError> {
        let transport = self.transport.clone();
        self.with_fallback(1, |base| {
            let transport = transport.clone();
            let url = format!("{}{}", base, path);
            async move { transport.get_json(&url).await }
        })
        .await
    }
}

fn parse_envelope(response: Value) -> Result<Value, RpcError> {
    let Value::Object(mut map) = response else {
        return Err(RpcError::Malformed("response is not an object".into()));
    };

    if let Some(error) = map.remove("error") {
        if !error.is_null() {
            return Err(RpcError::Rpc {
                code: error["code"].as_i64().unwrap_or_default(),
                message: error["message"]
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| error.to_string()),
            });
        }
    }

    map.remove("result")
        .ok_or_else(|| RpcError::Malformed("response has neither result nor error".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::testing::{endpoints, ScriptedTransport};

    #[tokio::test]
    async fn test_falls_back_to_second_endpoint() {
        let transport = Arc::new(ScriptedTransport::rpc(|url, method, _| {
            if url.contains("fb-primary") {
                Err(RpcError::transport(url, "connection refused"))
            } else {
                assert_eq!(method, "eth_blockNumber");
                Ok(json!("0x10"))
            }
        }));
        let client = RpcClient::new(
            "test",
            &endpoints(&["http://fb-primary", "http://fb-secondary"]),
            transport.clone(),
        );

        for _ in 0..3 {
            let result = client.call("eth_blockNumber", json!([])).await.unwrap();
            assert_eq!(result, json!("0x10"));
        }

        // The first call hit both; afterwards the secondary is sticky.
        let calls = transport.calls();
        assert_eq!(calls.len(), 4);
        assert!(calls[0].starts_with("http://fb-primary"));
        assert!(calls[1..].iter().all(|c| c.starts_with("http://fb-secondary")));
        assert_eq!(client.current_url(), Some("http://fb-secondary"));
    }

    #[tokio::test]
    async fn test_rpc_error_is_not_retried_across_endpoints() {
        let transport = Arc::new(ScriptedTransport::rpc(|_, _, _| {
            Err(RpcError::Rpc {
                code: -32601,
                message: "the method debug_traceBlockByNumber does not exist".into(),
            })
        }));
        let client = RpcClient::new(
            "test",
            &endpoints(&["http://proto-a", "http://proto-b"]),
            transport.clone(),
        );

        let err = client
            .call("debug_traceBlockByNumber", json!(["0x1"]))
            .await
            .unwrap_err();
        assert!(err.is_unsupported_method());
        assert_eq!(transport.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_all_endpoints_failed() {
        let transport = Arc::new(ScriptedTransport::rpc(|url, _, _| {
            Err(RpcError::transport(url, "timeout"))
        }));
        let client = RpcClient::new(
            "test",
            &endpoints(&["http://down-a", "http://down-b"]),
            transport,
        );

        let err = client.call("eth_blockNumber", json!([])).await.unwrap_err();
        assert!(matches!(err, RpcError::AllEndpointsFailed { attempted: 2, .. }));
    }

    #[tokio::test]
    async fn test_batch_call_preserves_order() {
        let transport = Arc::new(ScriptedTransport::rpc(|_, _, params| Ok(params[0].clone())));
        let client = RpcClient::new("test", &endpoints(&["http://batch-a"]), transport);

        let calls = vec![
            ("eth_getTransactionReceipt", json!(["0xaa"])),
            ("eth_getTransactionReceipt", json!(["0xbb"])),
            ("eth_getTransactionReceipt", json!(["0xcc"])),
        ];
        let results = client.batch_call(&calls).await.unwrap();
        assert_eq!(results, vec![json!("0xaa"), json!("0xbb"), json!("0xcc")]);
    }

    #[tokio::test]
    async fn test_null_result_is_not_malformed() {
        let transport = Arc::new(ScriptedTransport::rpc(|_, _, _| Ok(Value::Null)));
        let client = RpcClient::new("test", &endpoints(&["http://null-a"]), transport);
        assert_eq!(client.call("eth_getBlockByNumber", json!([])).await.unwrap(), Value::Null);
    }

    #[test]
    fn test_parse_envelope_missing_result() {
        let err = parse_envelope(json!({"jsonrpc": "2.0", "id": 1})).unwrap_err();
        assert!(matches!(err, RpcError::Malformed(_)));
    }
}
