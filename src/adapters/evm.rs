use alloy::primitives::{Address, Bytes, B256, U256, U64};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::chain::{ChainRuntime, TraceMethod, TraceSupport};
use crate::db::Store;
use crate::decoders::{
    address_hex, u256_to_bd, BlockInput, ContractReader, DecodeContext, DecoderRegistry, EvmLog,
    EvmTx, InternalCall, Withdrawal,
};
use crate::indexer::types::{
    bytes_to_hex, BlockBundle, BlockRecord, FetchOptions, LogRecord, TransactionRecord,
};
use crate::rpc::{RpcClient, RpcError};

use super::{block_tag, timestamp_from_secs};

/// Receipts requested per JSON-RPC batch when the node lacks
/// `eth_getBlockReceipts`.
const RECEIPT_BATCH_SIZE: usize = 50;

// ============================================================
// Wire types
// ============================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcHeader {
    number: U64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcBlock {
    number: U64,
    hash: B256,
    parent_hash: B256,
    timestamp: U64,
    miner: Option<Address>,
    gas_used: U64,
    gas_limit: U64,
    size: Option<U64>,
    #[serde(default)]
    transactions: Vec<RpcTransaction>,
    #[serde(default)]
    withdrawals: Vec<RpcWithdrawal>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcTransaction {
    hash: B256,
    from: Address,
    to: Option<Address>,
    value: U256,
    transaction_index: Option<U64>,
    gas_price: Option<U256>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    transaction_hash: B256,
    status: Option<U64>,
    gas_used: U64,
    effective_gas_price: Option<U256>,
    #[serde(default)]
    logs: Vec<RpcLog>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcLog {
    address: Address,
    topics: Vec<B256>,
    data: Bytes,
    log_index: U64,
    transaction_hash: B256,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcWithdrawal {
    address: Address,
    amount: U64,
}

/// `callTracer` frame.
#[derive(Debug, Deserialize)]
struct CallFrame {
    #[serde(rename = "type")]
    call_type: String,
    from: Address,
    to: Option<Address>,
    value: Option<U256>,
    error: Option<String>,
    #[serde(default)]
    calls: Vec<CallFrame>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DebugTraceResult {
    tx_hash: Option<B256>,
    result: Option<CallFrame>,
}

/// One entry of a Parity-style `trace_block` response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FlatTrace {
    #[serde(rename = "type")]
    trace_type: String,
    action: FlatAction,
    transaction_hash: Option<B256>,
    #[serde(default)]
    trace_address: Vec<u64>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FlatAction {
    call_type: Option<String>,
    from: Option<Address>,
    to: Option<Address>,
    value: Option<U256>,
}

fn moves_value(call_type: &str) -> bool {
    !matches!(
        call_type.to_ascii_lowercase().as_str(),
        "delegatecall" | "staticcall"
    )
}

/// Depth-first walk over a transaction's call tree, skipping the root
/// frame. Every nested frame takes the next `trace_index`; reverted
/// subtrees are not descended into.
fn flatten_frames(tx_hash: B256, frame: &CallFrame, next: &mut i32, out: &mut Vec<InternalCall>) {
    for child in &frame.calls {
        let trace_index = *next;
        *next += 1;
        if child.error.is_some() {
            continue;
        }
        if let (Some(to), Some(value)) = (child.to, child.value) {
            if !value.is_zero() && moves_value(&child.call_type) {
                out.push(InternalCall {
                    tx_hash,
                    from: child.from,
                    to,
                    value,
                    trace_index,
                });
            }
        }
        flatten_frames(tx_hash, child, next, out);
    }
}

fn internal_calls_from_debug(results: Vec<DebugTraceResult>, tx_hashes: &[B256]) -> Vec<InternalCall> {
    let mut calls = Vec::new();
    for (position, item) in results.into_iter().enumerate() {
        // Older nodes omit txHash; results follow block transaction order.
        let Some(tx_hash) = item.tx_hash.or_else(|| tx_hashes.get(position).copied()) else {
            continue;
        };
        if let Some(root) = item.result {
            let mut next = 0;
            flatten_frames(tx_hash, &root, &mut next, &mut calls);
        }
    }
    calls
}

fn internal_calls_from_flat(traces: Vec<FlatTrace>) -> Vec<InternalCall> {
    let mut calls = Vec::new();
    let mut counters: HashMap<B256, i32> = HashMap::new();
    for trace in traces {
        let Some(tx_hash) = trace.transaction_hash else {
            continue;
        };
        if trace.trace_address.is_empty() {
            continue;
        }
        let counter = counters.entry(tx_hash).or_insert(0);
        let trace_index = *counter;
        *counter += 1;

        if trace.trace_type != "call" || trace.error.is_some() {
            continue;
        }
        let action = trace.action;
        if !moves_value(action.call_type.as_deref().unwrap_or("call")) {
            continue;
        }
        if let (Some(from), Some(to), Some(value)) = (action.from, action.to, action.value) {
            if !value.is_zero() {
                calls.push(InternalCall {
                    tx_hash,
                    from,
                    to,
                    value,
                    trace_index,
                });
            }
        }
    }
    calls
}

// ============================================================
// Adapter
// ============================================================

pub struct EvmAdapter {
    client: RpcClient,
    registry: Arc<DecoderRegistry>,
}

impl EvmAdapter {
    pub fn new(client: RpcClient, registry: Arc<DecoderRegistry>) -> Self {
        Self { client, registry }
    }

    pub async fn latest_height(&self, chain: &ChainRuntime) -> eyre::Result<u64> {
        if let Some(tag) = &chain.config.finality_tag {
            let header: Option<RpcHeader> = self
                .client
                .call_as("eth_getBlockByNumber", json!([tag, false]))
                .await?;
            let header = header.ok_or_else(|| eyre::eyre!("Node returned no '{}' block", tag))?;
            return Ok(header.number.to::<u64>());
        }

        let head: U64 = self.client.call_as("eth_blockNumber", json!([])).await?;
        Ok(head.to::<u64>().saturating_sub(chain.config.confirmation_depth))
    }

    pub async fn fetch_and_extract(
        &self,
        chain: &ChainRuntime,
        store: &dyn Store,
        number: u64,
        options: FetchOptions,
    ) -> eyre::Result<BlockBundle> {
        let chain_id = chain.chain_id();
        let block: Option<RpcBlock> = self
            .client
            .call_as("eth_getBlockByNumber", json!([block_tag(number), true]))
            .await?;
        let block = block.ok_or_else(|| eyre::eyre!("Block {} not available yet", number))?;

        let mut receipts: HashMap<B256, RpcReceipt> = self
            .fetch_receipts(chain, store, &block)
            .await?
            .into_iter()
            .map(|r| (r.transaction_hash, r))
            .collect();

        let tx_hashes: Vec<B256> = block.transactions.iter().map(|t| t.hash).collect();
        let internal_calls = if options.traces && chain.config.traces {
            self.fetch_internal_calls(chain, store, number, &tx_hashes)
                .await?
        } else {
            Vec::new()
        };

        let timestamp = timestamp_from_secs(block.timestamp.to::<u64>());
        let mut bundle = BlockBundle::new(BlockRecord {
            chain_id,
            number: block.number.to::<u64>() as i64,
            hash: bytes_to_hex(block.hash.as_slice()),
            parent_hash: bytes_to_hex(block.parent_hash.as_slice()),
            timestamp,
            producer: block.miner.map(address_hex),
            gas_used: Some(block.gas_used.to::<u64>() as i64),
            gas_limit: Some(block.gas_limit.to::<u64>() as i64),
            size: block.size.map(|s| s.to::<u64>() as i64),
            tx_count: block.transactions.len() as i32,
        });

        let mut evm_txs = Vec::with_capacity(block.transactions.len());
        let mut evm_logs = Vec::new();

        for (position, tx) in block.transactions.iter().enumerate() {
            let receipt = receipts
                .remove(&tx.hash)
                .ok_or_else(|| eyre::eyre!("Missing receipt for tx {} in block {}", tx.hash, number))?;
            let success = receipt.status.map(|s| s == U64::from(1));
            let gas_price = receipt.effective_gas_price.or(tx.gas_price);
            let fee = gas_price.map(|p| u256_to_bd(p * U256::from(receipt.gas_used.to::<u64>())));

            bundle.transactions.push(TransactionRecord {
                chain_id,
                tx_hash: bytes_to_hex(tx.hash.as_slice()),
                block_number: number as i64,
                tx_index: tx
                    .transaction_index
                    .map(|i| i.to::<u64>() as i32)
                    .unwrap_or(position as i32),
                from_address: Some(address_hex(tx.from)),
                to_address: tx.to.map(address_hex),
                value: u256_to_bd(tx.value),
                fee,
                status: success,
                size: None,
            });

            for log in receipt.logs {
                let log_index = log.log_index.to::<u64>() as i32;
                bundle.logs.push(LogRecord {
                    chain_id,
                    block_number: number as i64,
                    log_index,
                    tx_hash: bytes_to_hex(log.transaction_hash.as_slice()),
                    address: address_hex(log.address),
                    topics: log
                        .topics
                        .iter()
                        .map(|t| bytes_to_hex(t.as_slice()))
                        .collect(),
                    data: bytes_to_hex(&log.data),
                });
                evm_logs.push(EvmLog {
                    address: log.address,
                    topics: log.topics,
                    data: log.data,
                    tx_hash: log.transaction_hash,
                    log_index,
                });
            }

            evm_txs.push(EvmTx {
                hash: tx.hash,
                from: tx.from,
                to: tx.to,
                value: tx.value,
                success,
            });
        }

        let failed: std::collections::HashSet<B256> = evm_txs
            .iter()
            .filter(|t| t.success == Some(false))
            .map(|t| t.hash)
            .collect();
        let internal_calls: Vec<InternalCall> = internal_calls
            .into_iter()
            .filter(|c| !failed.contains(&c.tx_hash))
            .collect();

        let withdrawals: Vec<Withdrawal> = block
            .withdrawals
            .iter()
            .map(|w| Withdrawal {
                address: w.address,
                amount_gwei: w.amount.to::<u64>(),
            })
            .collect();

        let reader: Option<&dyn ContractReader> = if options.enrich {
            Some(&self.client)
        } else {
            None
        };
        let ctx = DecodeContext {
            chain_id,
            block_number: number,
            block_hash: block.hash,
            block_timestamp: timestamp,
            reader,
        };
        let input = BlockInput {
            transactions: &evm_txs,
            logs: &evm_logs,
            withdrawals: &withdrawals,
            internal_calls: &internal_calls,
        };
        let sink = self.registry.decode(&ctx, &input).await;

        bundle.transfers = sink.transfers;
        if options.enrich {
            bundle.token_addresses = sink.tokens;
        }

        tracing::debug!(
            chain = %chain.name(),
            block = number,
            txs = bundle.transactions.len(),
            logs = bundle.logs.len(),
            internal = internal_calls.len(),
            transfers = bundle.transfers.len(),
            "Extracted EVM block"
        );

        Ok(bundle)
    }

    async fn fetch_receipts(
        &self,
        chain: &ChainRuntime,
        store: &dyn Store,
        block: &RpcBlock,
    ) -> eyre::Result<Vec<RpcReceipt>> {
        if block.transactions.is_empty() {
            return Ok(Vec::new());
        }
        let number = block.number.to::<u64>();

        if chain.block_receipts().await != Some(false) {
            let result: Result<Option<Vec<RpcReceipt>>, RpcError> = self
                .client
                .call_as("eth_getBlockReceipts", json!([block_tag(number)]))
                .await;
            match result {
                Ok(Some(receipts)) => {
                    chain.set_block_receipts(true, store).await?;
                    return Ok(receipts);
                }
                Ok(None) => return Err(eyre::eyre!("Receipts for block {} not available yet", number)),
                Err(e) if e.is_unsupported_method() => {
                    tracing::info!(
                        chain = %chain.name(),
                        error = %e,
                        "eth_getBlockReceipts unsupported, falling back to per-transaction receipts"
                    );
                    chain.set_block_receipts(false, store).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        let mut receipts = Vec::with_capacity(block.transactions.len());
        for chunk in block.transactions.chunks(RECEIPT_BATCH_SIZE) {
            let calls: Vec<(&str, Value)> = chunk
                .iter()
                .map(|tx| ("eth_getTransactionReceipt", json!([tx.hash])))
                .collect();
            for value in self.client.batch_call(&calls).await? {
                let receipt: Option<RpcReceipt> = serde_json::from_value(value)?;
                let receipt = receipt.ok_or_else(|| {
                    eyre::eyre!("Receipt missing for a transaction in block {}", number)
                })?;
                receipts.push(receipt);
            }
        }
        Ok(receipts)
    }

    /// Never fails the block on trace errors. Only the capability update can
    /// return an error.
    async fn fetch_internal_calls(
        &self,
        chain: &ChainRuntime,
        store: &dyn Store,
        number: u64,
        tx_hashes: &[B256],
    ) -> eyre::Result<Vec<InternalCall>> {
        if tx_hashes.is_empty() {
            return Ok(Vec::new());
        }

        let methods = match chain.trace_support().await {
            TraceSupport::Unsupported => return Ok(Vec::new()),
            TraceSupport::Supported(method) => vec![method],
            TraceSupport::Unknown => vec![TraceMethod::DebugCallTracer, TraceMethod::TraceBlock],
        };
        let probing = methods.len() > 1;

        for method in methods {
            match self.trace_block(method, number, tx_hashes).await {
                Ok(calls) => {
                    chain
                        .set_trace_support(TraceSupport::Supported(method), store)
                        .await?;
                    return Ok(calls);
                }
                Err(e) if e.is_outage() => {
                    // Not a verdict on the method; try again on a later block.
                    tracing::warn!(
                        chain = %chain.name(),
                        block = number,
                        method = method.as_str(),
                        error = %e,
                        "Trace fetch failed, continuing without internal transfers"
                    );
                    return Ok(Vec::new());
                }
                Err(e) => {
                    tracing::info!(
                        chain = %chain.name(),
                        method = method.as_str(),
                        error = %e,
                        "Trace method rejected"
                    );
                    if !probing {
                        break;
                    }
                }
            }
        }

        chain
            .set_trace_support(TraceSupport::Unsupported, store)
            .await?;
        Ok(Vec::new())
    }

    async fn trace_block(
        &self,
        method: TraceMethod,
        number: u64,
        tx_hashes: &[B256],
    ) -> Result<Vec<InternalCall>, RpcError> {
        match method {
            TraceMethod::DebugCallTracer => {
                let results: Vec<DebugTraceResult> = self
                    .client
                    .call_as(
                        method.as_str(),
                        json!([block_tag(number), {"tracer": "callTracer"}]),
                    )
                    .await?;
                Ok(internal_calls_from_debug(results, tx_hashes))
            }
            TraceMethod::TraceBlock => {
                let traces: Option<Vec<FlatTrace>> = self
                    .client
                    .call_as(method.as_str(), json!([block_tag(number)]))
                    .await?;
                Ok(internal_calls_from_flat(traces.unwrap_or_default()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChainType;
    use crate::db::MemoryStore;
    use crate::indexer::types::TransferType;
    use crate::rpc::testing::{chain_config, endpoints, ScriptedTransport};

    const TX1: &str = "0x1111111111111111111111111111111111111111111111111111111111111111";
    const TX2: &str = "0x2222222222222222222222222222222222222222222222222222222222222222";
    const ALICE: &str = "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const BOB: &str = "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
    const TOKEN: &str = "0xcccccccccccccccccccccccccccccccccccccccc";
    const TRANSFER_TOPIC: &str =
        "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

    fn block_json() -> Value {
        json!({
            "number": "0x64",
            "hash": format!("0x{}", "ab".repeat(32)),
            "parentHash": format!("0x{}", "aa".repeat(32)),
            "timestamp": "0x6553f100",
            "miner": BOB,
            "gasUsed": "0x5208",
            "gasLimit": "0x1c9c380",
            "size": "0x220",
            "transactions": [
                {"hash": TX1, "from": ALICE, "to": BOB, "value": "0xde0b6b3a7640000",
                 "transactionIndex": "0x0", "gasPrice": "0x3b9aca00"},
                {"hash": TX2, "from": ALICE, "to": TOKEN, "value": "0x0",
                 "transactionIndex": "0x1", "gasPrice": "0x3b9aca00"}
            ],
            "withdrawals": [
                {"index": "0x10", "validatorIndex": "0x5", "address": BOB, "amount": "0x3"}
            ]
        })
    }

    fn receipt(tx: &str) -> Value {
        let logs = if tx == TX2 {
            json!([{
                "address": TOKEN,
                "topics": [
                    TRANSFER_TOPIC,
                    format!("0x{:0>64}", &ALICE[2..]),
                    format!("0x{:0>64}", &BOB[2..])
                ],
                "data": format!("0x{:064x}", 100),
                "logIndex": "0x0",
                "transactionHash": TX2
            }])
        } else {
            json!([])
        };
        json!({
            "transactionHash": tx,
            "status": "0x1",
            "gasUsed": "0x5208",
            "effectiveGasPrice": "0x3b9aca00",
            "logs": logs
        })
    }

    fn debug_trace() -> Value {
        json!([
            {"txHash": TX1, "result": {"type": "CALL", "from": ALICE, "to": BOB, "value": "0x1"}},
            {"txHash": TX2, "result": {
                "type": "CALL", "from": ALICE, "to": TOKEN, "value": "0x0",
                "calls": [
                    {"type": "STATICCALL", "from": TOKEN, "to": BOB},
                    {"type": "CALL", "from": TOKEN, "to": BOB, "value": "0x7"}
                ]
            }}
        ])
    }

    struct Setup {
        transport: Arc<ScriptedTransport>,
        adapter: EvmAdapter,
        chain: ChainRuntime,
        store: MemoryStore,
    }

    fn setup(url: &str, transport: ScriptedTransport) -> Setup {
        let transport = Arc::new(transport);
        let config = chain_config(1, ChainType::Evm, endpoints(&[url]));
        let client = RpcClient::new("test", &config.endpoints, transport.clone());
        let registry = Arc::new(DecoderRegistry::standard().unwrap());
        Setup {
            transport,
            adapter: EvmAdapter::new(client, registry),
            chain: ChainRuntime::new(config),
            store: MemoryStore::new(),
        }
    }

    fn full_node(_: &str, method: &str, params: &Value) -> Result<Value, RpcError> {
        match method {
            "eth_getBlockByNumber" => Ok(block_json()),
            "eth_getBlockReceipts" => Ok(json!([receipt(TX1), receipt(TX2)])),
            "eth_getTransactionReceipt" => Ok(receipt(params[0].as_str().unwrap())),
            "debug_traceBlockByNumber" => Ok(debug_trace()),
            "eth_call" => Err(RpcError::Rpc { code: 3, message: "execution reverted".into() }),
            other => Err(RpcError::Rpc { code: -32601, message: format!("{} does not exist", other) }),
        }
    }

    #[tokio::test]
    async fn test_extracts_all_transfer_kinds() {
        let s = setup("http://evm-full", ScriptedTransport::rpc(full_node));
        let bundle = s
            .adapter
            .fetch_and_extract(&s.chain, &s.store, 100, FetchOptions::LIVE)
            .await
            .unwrap();

        assert_eq!(bundle.block.number, 100);
        assert_eq!(bundle.transactions.len(), 2);
        assert_eq!(bundle.logs.len(), 1);

        let kinds: Vec<TransferType> = bundle.transfers.iter().map(|t| t.transfer_type).collect();
        assert!(kinds.contains(&TransferType::Native));
        assert!(kinds.contains(&TransferType::Internal));
        assert!(kinds.contains(&TransferType::Erc20));
        assert!(kinds.contains(&TransferType::Withdrawal));

        let internal = bundle
            .transfers
            .iter()
            .find(|t| t.transfer_type == TransferType::Internal)
            .unwrap();
        // The static call takes index 0.
        assert_eq!(internal.trace_index, 1);
        assert_eq!(internal.tx_hash, TX2);

        assert!(bundle.token_addresses.contains(TOKEN));
        assert_eq!(
            s.chain.trace_support().await,
            TraceSupport::Supported(TraceMethod::DebugCallTracer)
        );
        assert_eq!(s.chain.block_receipts().await, Some(true));
    }

    #[tokio::test]
    async fn test_receipts_fall_back_to_batched_calls() {
        let s = setup(
            "http://evm-no-block-receipts",
            ScriptedTransport::rpc(|url, method, params| match method {
                "eth_getBlockReceipts" => Err(RpcError::Rpc {
                    code: -32601,
                    message: "the method eth_getBlockReceipts does not exist".into(),
                }),
                _ => full_node(url, method, params),
            }),
        );
        let bundle = s
            .adapter
            .fetch_and_extract(&s.chain, &s.store, 100, FetchOptions::CATCH_UP)
            .await
            .unwrap();
        assert_eq!(bundle.transactions.len(), 2);
        assert_eq!(s.chain.block_receipts().await, Some(false));

        // Second block skips the unsupported method entirely.
        s.adapter
            .fetch_and_extract(&s.chain, &s.store, 100, FetchOptions::CATCH_UP)
            .await
            .unwrap();
        let block_receipt_calls = s
            .transport
            .calls()
            .iter()
            .filter(|c| c.ends_with("eth_getBlockReceipts"))
            .count();
        assert_eq!(block_receipt_calls, 1);
        let flags = s.store.load_capabilities(1).await.unwrap();
        assert_eq!(flags.block_receipts_supported, Some(false));
    }

    #[tokio::test]
    async fn test_trace_detection_marks_unsupported() {
        let s = setup(
            "http://evm-no-traces",
            ScriptedTransport::rpc(|url, method, params| match method {
                "debug_traceBlockByNumber" | "trace_block" => Err(RpcError::Rpc {
                    code: -32601,
                    message: "method not found".into(),
                }),
                _ => full_node(url, method, params),
            }),
        );
        let bundle = s
            .adapter
            .fetch_and_extract(&s.chain, &s.store, 100, FetchOptions::LIVE)
            .await
            .unwrap();

        assert!(bundle
            .transfers
            .iter()
            .all(|t| t.transfer_type != TransferType::Internal));
        assert_eq!(s.chain.trace_support().await, TraceSupport::Unsupported);
        assert_eq!(s.store.load_capabilities(1).await.unwrap().trace_supported, Some(false));
    }

    #[tokio::test]
    async fn test_trace_outage_leaves_capability_unknown() {
        let s = setup(
            "http://evm-trace-outage",
            ScriptedTransport::rpc(|url, method, params| match method {
                "debug_traceBlockByNumber" => Err(RpcError::transport(url, "timeout")),
                _ => full_node(url, method, params),
            }),
        );
        s.adapter
            .fetch_and_extract(&s.chain, &s.store, 100, FetchOptions::LIVE)
            .await
            .unwrap();
        assert_eq!(s.chain.trace_support().await, TraceSupport::Unknown);
    }

    #[tokio::test]
    async fn test_catch_up_skips_traces_and_tokens() {
        let s = setup("http://evm-catch-up", ScriptedTransport::rpc(full_node));
        let bundle = s
            .adapter
            .fetch_and_extract(&s.chain, &s.store, 100, FetchOptions::CATCH_UP)
            .await
            .unwrap();
        assert!(bundle.token_addresses.is_empty());
        assert!(!s
            .transport
            .calls()
            .iter()
            .any(|c| c.ends_with("debug_traceBlockByNumber")));
    }

    #[tokio::test]
    async fn test_latest_height_with_confirmations() {
        let mut s = setup(
            "http://evm-head",
            ScriptedTransport::rpc(|_, method, _| match method {
                "eth_blockNumber" => Ok(json!("0x100")),
                "eth_getBlockByNumber" => Ok(json!({"number": "0xf0"})),
                _ => Ok(Value::Null),
            }),
        );
        s.chain.config.confirmation_depth = 6;
        assert_eq!(s.adapter.latest_height(&s.chain).await.unwrap(), 250);

        s.chain.config.finality_tag = Some("finalized".into());
        assert_eq!(s.adapter.latest_height(&s.chain).await.unwrap(), 240);
    }

    #[test]
    fn test_flat_traces_skip_root_and_count_per_tx() {
        let traces: Vec<FlatTrace> = serde_json::from_value(json!([
            {"type": "call", "action": {"callType": "call", "from": ALICE, "to": BOB, "value": "0x5"},
             "transactionHash": TX1, "traceAddress": []},
            {"type": "call", "action": {"callType": "call", "from": BOB, "to": ALICE, "value": "0x2"},
             "transactionHash": TX1, "traceAddress": [0]},
            {"type": "call", "action": {"callType": "delegatecall", "from": BOB, "to": ALICE, "value": "0x2"},
             "transactionHash": TX1, "traceAddress": [1]},
            {"type": "call", "action": {"callType": "call", "from": BOB, "to": ALICE, "value": "0x3"},
             "transactionHash": TX1, "traceAddress": [2]},
            {"type": "reward", "action": {"value": "0x1"}, "traceAddress": []}
        ]))
        .unwrap();

        let calls = internal_calls_from_flat(traces);
        let indices: Vec<i32> = calls.iter().map(|c| c.trace_index).collect();
        assert_eq!(indices, vec![0, 2]);
    }
}
