//! Scripted transport for unit tests.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Mutex;

use crate::config::{ChainConfig, ChainType, EndpointConfig, EndpointKind};

use super::error::RpcError;
use super::transport::Transport;

type RpcHandler = dyn Fn(&str, &str, &Value) -> Result<Value, RpcError> + Send + Sync;
type RestHandler = dyn Fn(&str) -> Result<Value, RpcError> + Send + Sync;

/// Answers JSON-RPC calls with `(url, method, params) -> result` and REST
/// calls with `(url) -> body`. `Err(Transport)` simulates an outage,
/// `Err(Rpc)` becomes an error envelope.
pub struct ScriptedTransport {
    rpc: Box<RpcHandler>,
    rest: Box<RestHandler>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub fn rpc<F>(handler: F) -> Self
    where
        F: Fn(&str, &str, &Value) -> Result<Value, RpcError> + Send + Sync + 'static,
    {
        Self {
            rpc: Box::new(handler),
            rest: Box::new(|url| Err(RpcError::transport(url, "no REST script"))),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn rest<F>(handler: F) -> Self
    where
        F: Fn(&str) -> Result<Value, RpcError> + Send + Sync + 'static,
    {
        Self {
            rpc: Box::new(|url, _, _| Err(RpcError::transport(url, "no RPC script"))),
            rest: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Recorded `"{url} {method}"` (or `"{url}"` for REST) entries.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn answer(&self, url: &str, request: &Value) -> Result<Value, RpcError> {
        let method = request["method"].as_str().unwrap_or_default();
        self.calls.lock().unwrap().push(format!("{} {}", url, method));
        let id = request["id"].clone();
        match (self.rpc)(url, method, &request["params"]) {
            Ok(result) => Ok(json!({"jsonrpc": "2.0", "id": id, "result": result})),
            Err(RpcError::Rpc { code, message }) => Ok(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": code, "message": message},
            })),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn post_json(&self, url: &str, body: &Value) -> Result<Value, RpcError> {
        match body {
            Value::Array(requests) => requests
                .iter()
                .map(|r| self.answer(url, r))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            request => self.answer(url, request),
        }
    }

    async fn get_json(&self, url: &str) -> Result<Value, RpcError> {
        self.calls.lock().unwrap().push(url.to_string());
        (self.rest)(url)
    }
}

/// JSON-RPC endpoints with a limit high enough to never throttle a test.
pub fn endpoints(urls: &[&str]) -> Vec<EndpointConfig> {
    urls.iter()
        .enumerate()
        .map(|(i, url)| EndpointConfig {
            url: url.to_string(),
            priority: i as u32,
            rate_limit: Some(100_000),
            kind: EndpointKind::JsonRpc,
        })
        .collect()
}

pub fn rest_endpoints(urls: &[&str]) -> Vec<EndpointConfig> {
    endpoints(urls)
        .into_iter()
        .map(|mut e| {
            e.kind = EndpointKind::Rest;
            e
        })
        .collect()
}

pub fn chain_config(
    chain_id: u64,
    chain_type: ChainType,
    endpoints: Vec<EndpointConfig>,
) -> ChainConfig {
    ChainConfig {
        name: format!("test-{}", chain_id),
        chain_id,
        chain_type,
        endpoints,
        start_block: None,
        poll_interval_secs: 1,
        blocks_per_batch: 10,
        catchup_parallel_batches: None,
        traces: true,
        finality_tag: None,
        confirmation_depth: 0,
        autostart: false,
    }
}
