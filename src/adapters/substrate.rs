use bigdecimal::BigDecimal;
use serde::Deserialize;
use serde_json::{json, Value};
use std::str::FromStr;

use crate::chain::ChainRuntime;
use crate::indexer::types::{
    AssetTransfer, BlockBundle, BlockRecord, EventRecord, ExtrinsicRecord, TransferType,
    NOT_APPLICABLE,
};
use crate::rpc::RpcClient;

use super::timestamp_from_secs;

// ============================================================
// Wire types (sidecar `/blocks/{n}`)
// ============================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBlock {
    number: Value,
    hash: String,
    parent_hash: String,
    author_id: Option<String>,
    #[serde(default)]
    extrinsics: Vec<RawExtrinsic>,
    on_initialize: Option<EventGroup>,
    on_finalize: Option<EventGroup>,
}

#[derive(Debug, Default, Deserialize)]
struct EventGroup {
    #[serde(default)]
    events: Vec<RawEvent>,
}

#[derive(Debug, Deserialize)]
struct RawExtrinsic {
    method: CallName,
    signature: Option<Value>,
    hash: Option<String>,
    #[serde(default)]
    args: Value,
    #[serde(default)]
    events: Vec<RawEvent>,
}

#[derive(Debug, Clone, Deserialize)]
struct CallName {
    pallet: String,
    method: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RawEvent {
    method: CallName,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct RawHeader {
    number: Value,
}

/// Quantities arrive as JSON strings, numbers, or hex strings. Balances
/// are unsigned integers in planck, so anything else is rejected.
fn parse_quantity(value: &Value) -> Option<BigDecimal> {
    let quantity = match value {
        Value::Number(n) => BigDecimal::from_str(&n.to_string()).ok(),
        Value::String(s) => match s.strip_prefix("0x") {
            Some(hex_digits) => u128::from_str_radix(hex_digits, 16).ok().map(BigDecimal::from),
            None => BigDecimal::from_str(s).ok(),
        },
        _ => None,
    }?;
    (quantity.is_integer() && quantity >= BigDecimal::from(0)).then_some(quantity)
}

fn parse_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => match s.strip_prefix("0x") {
            Some(hex_digits) => u64::from_str_radix(hex_digits, 16).ok(),
            None => s.parse().ok(),
        },
        _ => None,
    }
}

/// Account ids are usually plain SS58 strings; some runtimes wrap them.
fn account(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map.get("id").and_then(account),
        _ => None,
    }
}

/// Identifier fields (asset ids, collections, items) kept verbatim.
fn identifier(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

// ============================================================
// Event handlers
// ============================================================

/// A transfer derived from one event, before block context is attached.
#[derive(Debug, PartialEq)]
struct Candidate {
    transfer_type: TransferType,
    token: Option<String>,
    token_id: Option<String>,
    from: Option<String>,
    to: Option<String>,
    amount: BigDecimal,
}

type Handler = fn(&[Value]) -> Option<Candidate>;

fn balances_transfer(data: &[Value]) -> Option<Candidate> {
    Some(Candidate {
        transfer_type: TransferType::Native,
        token: None,
        token_id: None,
        from: Some(account(data.first()?)?),
        to: Some(account(data.get(1)?)?),
        amount: parse_quantity(data.get(2)?)?,
    })
}

fn assets_transferred(data: &[Value]) -> Option<Candidate> {
    Some(Candidate {
        transfer_type: TransferType::Asset,
        token: identifier(data.first()?),
        token_id: None,
        from: Some(account(data.get(1)?)?),
        to: Some(account(data.get(2)?)?),
        amount: parse_quantity(data.get(3)?)?,
    })
}

fn assets_issued(data: &[Value]) -> Option<Candidate> {
    Some(Candidate {
        transfer_type: TransferType::AssetMint,
        token: identifier(data.first()?),
        token_id: None,
        from: None,
        to: Some(account(data.get(1)?)?),
        amount: parse_quantity(data.get(2)?)?,
    })
}

fn assets_burned(data: &[Value]) -> Option<Candidate> {
    Some(Candidate {
        transfer_type: TransferType::AssetBurn,
        token: identifier(data.first()?),
        token_id: None,
        from: Some(account(data.get(1)?)?),
        to: None,
        amount: parse_quantity(data.get(2)?)?,
    })
}

/// The asset is an XCM location object; its JSON text is the token key.
fn foreign_assets_transferred(data: &[Value]) -> Option<Candidate> {
    Some(Candidate {
        transfer_type: TransferType::ForeignAsset,
        token: Some(data.first()?.to_string()),
        token_id: None,
        from: Some(account(data.get(1)?)?),
        to: Some(account(data.get(2)?)?),
        amount: parse_quantity(data.get(3)?)?,
    })
}

fn nft_transferred(data: &[Value]) -> Option<Candidate> {
    Some(Candidate {
        transfer_type: TransferType::Nft,
        token: identifier(data.first()?),
        token_id: identifier(data.get(1)?),
        from: Some(account(data.get(2)?)?),
        to: Some(account(data.get(3)?)?),
        amount: BigDecimal::from(1),
    })
}

fn handler_for(pallet: &str, method: &str) -> Option<Handler> {
    let handler: Handler = match (pallet, method) {
        ("balances", "Transfer") => balances_transfer,
        ("assets", "Transferred") => assets_transferred,
        ("assets", "Issued") => assets_issued,
        ("assets", "Burned") => assets_burned,
        ("foreignAssets", "Transferred") => foreign_assets_transferred,
        ("nfts", "Transferred") | ("uniques", "Transferred") => nft_transferred,
        _ => return None,
    };
    Some(handler)
}

fn event_args(event: &RawEvent) -> Vec<Value> {
    match &event.data {
        Value::Array(items) => items.clone(),
        Value::Null => Vec::new(),
        other => vec![other.clone()],
    }
}

fn is_event(event: &RawEvent, pallet: &str, method: &str) -> bool {
    event.method.pallet == pallet && event.method.method == method
}

/// `balances.Withdraw(who, amount)` charged for the extrinsic, otherwise
/// `transactionPayment.TransactionFeePaid(who, actual_fee, tip)`.
fn extrinsic_fee(events: &[RawEvent]) -> Option<BigDecimal> {
    events
        .iter()
        .find(|e| is_event(e, "balances", "Withdraw"))
        .and_then(|e| event_args(e).get(1).and_then(parse_quantity))
        .or_else(|| {
            events
                .iter()
                .find(|e| is_event(e, "transactionPayment", "TransactionFeePaid"))
                .and_then(|e| event_args(e).get(1).and_then(parse_quantity))
        })
}

fn signer(signature: &Option<Value>) -> Option<String> {
    let signature = signature.as_ref()?;
    signature.get("signer").and_then(account)
}

// ============================================================
// Adapter
// ============================================================

pub struct SubstrateAdapter {
    rest: RpcClient,
    rpc: Option<RpcClient>,
}

impl SubstrateAdapter {
    pub fn new(rest: RpcClient, rpc: Option<RpcClient>) -> Self {
        Self { rest, rpc }
    }

    /// Finalized head, from JSON-RPC when configured, else the REST head.
    pub async fn latest_height(&self, chain: &ChainRuntime) -> eyre::Result<u64> {
        let head = match &self.rpc {
            Some(rpc) => {
                let hash: String = rpc.call_as("chain_getFinalizedHead", json!([])).await?;
                let header: RawHeader = rpc.call_as("chain_getHeader", json!([hash])).await?;
                parse_u64(&header.number)
            }
            None => {
                let header: RawHeader = serde_json::from_value(self.rest.get("/blocks/head").await?)?;
                parse_u64(&header.number)
            }
        }
        .ok_or_else(|| eyre::eyre!("Unparseable head number for chain {}", chain.name()))?;

        Ok(head.saturating_sub(chain.config.confirmation_depth))
    }

    pub async fn fetch_and_extract(&self, chain: &ChainRuntime, number: u64) -> eyre::Result<BlockBundle> {
        let raw = self.rest.get(&format!("/blocks/{}", number)).await?;
        let block: RawBlock = serde_json::from_value(raw)?;
        if parse_u64(&block.number) != Some(number) {
            return Err(eyre::eyre!("REST endpoint returned the wrong block for {}", number));
        }
        Ok(extract(chain.chain_id(), number, block))
    }
}

fn extract(chain_id: i64, number: u64, block: RawBlock) -> BlockBundle {
    let timestamp_ms = block
        .extrinsics
        .iter()
        .find(|x| x.method.pallet == "timestamp" && x.method.method == "set")
        .and_then(|x| x.args.get("now"))
        .and_then(parse_u64);
    if timestamp_ms.is_none() {
        tracing::debug!(chain_id, block = number, "Block has no timestamp.set inherent");
    }
    let timestamp = timestamp_from_secs(timestamp_ms.unwrap_or_default() / 1000);

    let mut bundle = BlockBundle::new(BlockRecord {
        chain_id,
        number: number as i64,
        hash: block.hash.clone(),
        parent_hash: block.parent_hash.clone(),
        timestamp,
        producer: block.author_id.clone(),
        gas_used: None,
        gas_limit: None,
        size: None,
        tx_count: block.extrinsics.len() as i32,
    });

    // One index space across the whole block.
    let mut event_index: i32 = 0;
    let mut record_events = |bundle: &mut BlockBundle,
                             events: &[RawEvent],
                             extrinsic_index: Option<i32>,
                             tx_hash: &str| {
        for event in events {
            let args = event_args(event);
            bundle.events.push(EventRecord {
                chain_id,
                block_number: number as i64,
                event_index,
                extrinsic_index,
                pallet: event.method.pallet.clone(),
                method: event.method.method.clone(),
                data: event.data.clone(),
            });

            let candidate = handler_for(&event.method.pallet, &event.method.method)
                .and_then(|handler| handler(&args));
            if let Some(c) = candidate {
                bundle.transfers.push(AssetTransfer {
                    chain_id,
                    block_number: number as i64,
                    block_timestamp: timestamp,
                    tx_hash: tx_hash.to_string(),
                    transfer_type: c.transfer_type,
                    token_address: c.token,
                    from_address: c.from,
                    to_address: c.to,
                    amount: c.amount,
                    token_id: c.token_id,
                    log_index: event_index,
                    trace_index: NOT_APPLICABLE,
                    confidential: false,
                    privacy_protocol: None,
                });
            }
            event_index += 1;
        }
    };

    let on_initialize = block.on_initialize.unwrap_or_default();
    record_events(&mut bundle, &on_initialize.events, None, &block.hash);

    for (index, extrinsic) in block.extrinsics.iter().enumerate() {
        let index = index as i32;
        let tx_hash = extrinsic.hash.clone().unwrap_or_else(|| block.hash.clone());
        record_events(&mut bundle, &extrinsic.events, Some(index), &tx_hash);

        bundle.extrinsics.push(ExtrinsicRecord {
            chain_id,
            block_number: number as i64,
            extrinsic_index: index,
            hash: extrinsic.hash.clone(),
            pallet: extrinsic.method.pallet.clone(),
            method: extrinsic.method.method.clone(),
            signer: signer(&extrinsic.signature),
            success: extrinsic
                .events
                .iter()
                .any(|e| is_event(e, "system", "ExtrinsicSuccess")),
            fee: extrinsic_fee(&extrinsic.events),
            args: extrinsic.args.clone(),
        });
    }

    let on_finalize = block.on_finalize.unwrap_or_default();
    record_events(&mut bundle, &on_finalize.events, None, &block.hash);

    bundle
}
