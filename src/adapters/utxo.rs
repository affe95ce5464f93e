use bigdecimal::BigDecimal;
use serde::Deserialize;
use serde_json::{json, Number};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use crate::chain::ChainRuntime;
use crate::db::{OutputRef, Store};
use crate::indexer::types::{
    AssetTransfer, BlockBundle, BlockRecord, FetchOptions, SpentOutput, TransactionRecord,
    TransferType, UtxoInput, UtxoOutput, COINBASE_SENDER, NOT_APPLICABLE,
};
use crate::rpc::RpcClient;

use super::timestamp_from_secs;

/// Script type of provably unspendable data carriers.
const NULL_DATA: &str = "nulldata";
const CONFIDENTIAL_PROTOCOL: &str = "confidential_transactions";
const SATS_PER_COIN: i64 = 100_000_000;

// ============================================================
// Wire types (getblock verbosity 2)
// ============================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBlock {
    hash: String,
    height: u64,
    #[serde(rename = "previousblockhash")]
    previous_block_hash: Option<String>,
    time: u64,
    size: Option<i64>,
    tx: Vec<RawTx>,
}

#[derive(Debug, Deserialize)]
struct RawTx {
    txid: String,
    size: Option<i64>,
    #[serde(default)]
    vin: Vec<RawInput>,
    #[serde(default)]
    vout: Vec<RawOutput>,
    fee: Option<Number>,
}

#[derive(Debug, Deserialize)]
struct RawInput {
    coinbase: Option<String>,
    txid: Option<String>,
    vout: Option<u32>,
    prevout: Option<RawPrevout>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPrevout {
    value: Option<Number>,
    script_pub_key: Option<RawScript>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOutput {
    n: u32,
    value: Option<Number>,
    valuecommitment: Option<String>,
    script_pub_key: RawScript,
}

#[derive(Debug, Deserialize)]
struct RawScript {
    #[serde(rename = "type")]
    script_type: Option<String>,
    address: Option<String>,
    #[serde(default)]
    addresses: Vec<String>,
}

impl RawScript {
    fn address(&self) -> Option<String> {
        self.address
            .clone()
            .or_else(|| self.addresses.first().cloned())
    }
}

/// Coin amounts arrive as decimal JSON numbers; stored in base units.
fn to_base_units(value: &Number) -> Option<BigDecimal> {
    let coins = BigDecimal::from_str(&value.to_string()).ok()?;
    Some((coins * BigDecimal::from(SATS_PER_COIN)).with_scale(0))
}

/// What an input needs to know about the output it spends.
#[derive(Debug, Clone)]
struct Resolved {
    address: Option<String>,
    amount: Option<BigDecimal>,
}

// ============================================================
// Adapter
// ============================================================

pub struct UtxoAdapter {
    client: RpcClient,
}

impl UtxoAdapter {
    pub fn new(client: RpcClient) -> Self {
        Self { client }
    }

    pub async fn latest_height(&self, chain: &ChainRuntime) -> eyre::Result<u64> {
        let count: u64 = self.client.call_as("getblockcount", json!([])).await?;
        Ok(count.saturating_sub(chain.config.confirmation_depth))
    }

    pub async fn fetch_and_extract(
        &self,
        chain: &ChainRuntime,
        store: &dyn Store,
        number: u64,
        _options: FetchOptions,
    ) -> eyre::Result<BlockBundle> {
        let chain_id = chain.chain_id();
        let hash: String = self.client.call_as("getblockhash", json!([number])).await?;
        let block: RawBlock = self.client.call_as("getblock", json!([hash, 2])).await?;
        if block.height != number {
            return Err(eyre::eyre!(
                "Node returned height {} for block {}",
                block.height,
                number
            ));
        }

        // Inputs spending outputs from earlier blocks are resolved from the
        // store in one lookup.
        let in_block: HashSet<&str> = block.tx.iter().map(|t| t.txid.as_str()).collect();
        let external: Vec<OutputRef> = block
            .tx
            .iter()
            .flat_map(|t| t.vin.iter())
            .filter_map(|i| Some((i.txid.clone()?, i.vout? as i32)))
            .filter(|(txid, _)| !in_block.contains(txid.as_str()))
            .collect();
        let stored = store.lookup_outputs(chain_id, &external).await?;

        let timestamp = timestamp_from_secs(block.time);
        let mut bundle = BlockBundle::new(BlockRecord {
            chain_id,
            number: number as i64,
            hash: block.hash.clone(),
            parent_hash: block.previous_block_hash.clone().unwrap_or_default(),
            timestamp,
            producer: None,
            gas_used: None,
            gas_limit: None,
            size: block.size,
            tx_count: block.tx.len() as i32,
        });

        // Outputs created earlier in this block, in transaction order.
        let mut accumulator: HashMap<OutputRef, Resolved> = HashMap::new();

        for (tx_index, tx) in block.tx.iter().enumerate() {
            let is_coinbase = tx.vin.iter().any(|i| i.coinbase.is_some());
            let mut sender: Option<String> = None;
            let mut inputs_total = BigDecimal::from(0);
            let mut all_resolved = !is_coinbase;

            for (vin_index, input) in tx.vin.iter().enumerate() {
                let vin_index = vin_index as i32;
                let prev = input
                    .txid
                    .clone()
                    .zip(input.vout.map(|v| v as i32));

                let resolved = prev.as_ref().and_then(|key| {
                    accumulator
                        .get(key)
                        .cloned()
                        .or_else(|| {
                            stored.get(key).map(|o| Resolved {
                                address: o.address.clone(),
                                amount: (!o.is_confidential).then(|| o.amount.clone()),
                            })
                        })
                        .or_else(|| {
                            input.prevout.as_ref().map(|p| Resolved {
                                address: p.script_pub_key.as_ref().and_then(RawScript::address),
                                amount: p.value.as_ref().and_then(to_base_units),
                            })
                        })
                });

                match resolved.as_ref().and_then(|r| r.amount.clone()) {
                    Some(amount) => inputs_total += amount,
                    None => all_resolved = false,
                }
                if sender.is_none() {
                    sender = resolved.as_ref().and_then(|r| r.address.clone());
                }

                if let Some((prev_txid, prev_vout)) = &prev {
                    bundle.spent_outputs.push(SpentOutput {
                        txid: prev_txid.clone(),
                        vout_index: *prev_vout,
                        spent_by_txid: tx.txid.clone(),
                        spent_by_vin: vin_index,
                    });
                }

                bundle.utxo_inputs.push(UtxoInput {
                    chain_id,
                    txid: tx.txid.clone(),
                    vin_index,
                    block_number: number as i64,
                    prev_txid: prev.as_ref().map(|(t, _)| t.clone()),
                    prev_vout: prev.as_ref().map(|(_, v)| *v),
                    address: resolved.as_ref().and_then(|r| r.address.clone()),
                    amount: resolved.and_then(|r| r.amount),
                    is_coinbase: input.coinbase.is_some(),
                });
            }

            if is_coinbase {
                sender = Some(COINBASE_SENDER.to_string());
            }

            let mut outputs_total = BigDecimal::from(0);
            let mut first_recipient: Option<String> = None;

            for output in &tx.vout {
                let vout_index = output.n as i32;
                let script_type = output
                    .script_pub_key
                    .script_type
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string());
                let amount = match (&output.valuecommitment, &output.value) {
                    (None, Some(value)) => to_base_units(value),
                    _ => None,
                };
                let confidential = amount.is_none();
                if confidential {
                    all_resolved = false;
                }
                let address = if confidential {
                    None
                } else {
                    output.script_pub_key.address()
                };
                let amount = amount.unwrap_or_else(|| BigDecimal::from(0));
                outputs_total += amount.clone();
                if first_recipient.is_none() {
                    first_recipient = address.clone();
                }

                accumulator.insert(
                    (tx.txid.clone(), vout_index),
                    Resolved {
                        address: address.clone(),
                        amount: (!confidential).then(|| amount.clone()),
                    },
                );

                bundle.utxo_outputs.push(UtxoOutput {
                    chain_id,
                    txid: tx.txid.clone(),
                    vout_index,
                    block_number: number as i64,
                    amount: amount.clone(),
                    script_type: script_type.clone(),
                    address: address.clone(),
                    spent: false,
                    spent_by_txid: None,
                    spent_by_vin: None,
                    is_confidential: confidential,
                });

                if script_type == NULL_DATA {
                    continue;
                }
                bundle.transfers.push(AssetTransfer {
                    chain_id,
                    block_number: number as i64,
                    block_timestamp: timestamp,
                    tx_hash: tx.txid.clone(),
                    transfer_type: TransferType::Utxo,
                    token_address: None,
                    from_address: sender.clone(),
                    to_address: address,
                    amount,
                    token_id: None,
                    log_index: NOT_APPLICABLE,
                    trace_index: vout_index,
                    confidential,
                    privacy_protocol: confidential.then(|| CONFIDENTIAL_PROTOCOL.to_string()),
                });
            }

            let fee = match &tx.fee {
                Some(fee) => to_base_units(fee),
                None if all_resolved && inputs_total >= outputs_total => {
                    Some(inputs_total - outputs_total.clone())
                }
                None => None,
            };

            bundle.transactions.push(TransactionRecord {
                chain_id,
                tx_hash: tx.txid.clone(),
                block_number: number as i64,
                tx_index: tx_index as i32,
                from_address: sender,
                to_address: first_recipient,
                value: outputs_total,
                fee,
                status: Some(true),
                size: tx.size,
            });
        }

        tracing::debug!(
            chain = %chain.name(),
            block = number,
            txs = bundle.transactions.len(),
            outputs = bundle.utxo_outputs.len(),
            spent = bundle.spent_outputs.len(),
            "Extracted UTXO block"
        );

        Ok(bundle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChainType;
    use crate::db::MemoryStore;
    use crate::rpc::testing::{chain_config, endpoints, ScriptedTransport};
    use crate::rpc::RpcError;
    use serde_json::Value;
    use std::sync::Arc;

    fn block_one() -> Value {
        json!({
            "hash": "h1", "height": 1, "previousblockhash": "h0", "time": 1_700_000_000u64, "size": 500,
            "tx": [
                {"txid": "cb1", "vin": [{"coinbase": "03ab"}], "vout": [
                    {"n": 0, "value": 50.0, "scriptPubKey": {"type": "pubkeyhash", "address": "miner"}}
                ]},
                {"txid": "t1", "vin": [{"txid": "cb1", "vout": 0}], "vout": [
                    {"n": 0, "value": 20.0, "scriptPubKey": {"type": "pubkeyhash", "address": "alice"}},
                    {"n": 1, "value": 29.9999, "scriptPubKey": {"type": "witness_v0_keyhash", "address": "miner"}},
                    {"n": 2, "value": 0.0, "scriptPubKey": {"type": "nulldata"}}
                ]}
            ]
        })
    }

    fn block_two() -> Value {
        json!({
            "hash": "h2", "height": 2, "previousblockhash": "h1", "time": 1_700_000_600u64,
            "tx": [
                {"txid": "cb2", "vin": [{"coinbase": "03ac"}], "vout": [
                    {"n": 0, "value": 50.0, "scriptPubKey": {"type": "pubkeyhash", "address": "miner"}}
                ]},
                {"txid": "t2", "vin": [{"txid": "t1", "vout": 0}], "vout": [
                    {"n": 0, "valuecommitment": "08ab", "scriptPubKey": {"type": "witness_v0_keyhash"}},
                    {"n": 1, "value": 19.5, "scriptPubKey": {"type": "pubkeyhash", "address": "bob"}}
                ]}
            ]
        })
    }

    fn node(_: &str, method: &str, params: &Value) -> Result<Value, RpcError> {
        match (method, params[0].as_u64(), params[0].as_str()) {
            ("getblockcount", ..) => Ok(json!(2)),
            ("getblockhash", Some(n), _) => Ok(json!(format!("h{}", n))),
            ("getblock", _, Some("h1")) => Ok(block_one()),
            ("getblock", _, Some("h2")) => Ok(block_two()),
            _ => Err(RpcError::Rpc { code: -8, message: "Block not found".into() }),
        }
    }

    fn setup(url: &str) -> (UtxoAdapter, ChainRuntime, MemoryStore) {
        let transport = Arc::new(ScriptedTransport::rpc(node));
        let config = chain_config(8332, ChainType::Utxo, endpoints(&[url]));
        let client = RpcClient::new("btc", &config.endpoints, transport);
        (UtxoAdapter::new(client), ChainRuntime::new(config), MemoryStore::new())
    }

    #[tokio::test]
    async fn test_same_block_spend_resolves_without_store() {
        let (adapter, chain, store) = setup("http://utxo-same-block");
        let bundle = adapter
            .fetch_and_extract(&chain, &store, 1, FetchOptions::LIVE)
            .await
            .unwrap();

        let t1: Vec<&AssetTransfer> = bundle.transfers.iter().filter(|t| t.tx_hash == "t1").collect();
        // OP_RETURN output produces no transfer.
        assert_eq!(t1.len(), 2);
        assert!(t1.iter().all(|t| t.from_address.as_deref() == Some("miner")));
        assert_eq!(t1[0].amount, BigDecimal::from(2_000_000_000i64));
        assert_eq!(t1[0].trace_index, 0);
        assert_eq!(t1[0].log_index, -1);

        let coinbase = bundle.transfers.iter().find(|t| t.tx_hash == "cb1").unwrap();
        assert_eq!(coinbase.from_address.as_deref(), Some(COINBASE_SENDER));

        let spend = &bundle.transactions[1];
        assert_eq!(spend.fee, Some(BigDecimal::from(10_000)));
        assert_eq!(bundle.spent_outputs.len(), 1);
        assert_eq!(bundle.spent_outputs[0].txid, "cb1");
    }

    #[tokio::test]
    async fn test_spend_across_blocks_and_confidential_output() {
        let (adapter, chain, store) = setup("http://utxo-cross-block");
        let first = adapter
            .fetch_and_extract(&chain, &store, 1, FetchOptions::CATCH_UP)
            .await
            .unwrap();
        store.persist_block(&first).await.unwrap();
        let second = adapter
            .fetch_and_extract(&chain, &store, 2, FetchOptions::CATCH_UP)
            .await
            .unwrap();
        store.persist_block(&second).await.unwrap();

        let spent = store.utxo_output(8332, "t1", 0).await.unwrap();
        assert!(spent.spent);
        assert_eq!(spent.spent_by_txid.as_deref(), Some("t2"));

        let t2: Vec<&AssetTransfer> = second.transfers.iter().filter(|t| t.tx_hash == "t2").collect();
        assert!(t2.iter().all(|t| t.from_address.as_deref() == Some("alice")));
        let hidden = t2.iter().find(|t| t.trace_index == 0).unwrap();
        assert!(hidden.confidential);
        assert_eq!(hidden.amount, BigDecimal::from(0));
        assert_eq!(hidden.to_address, None);
        assert_eq!(hidden.privacy_protocol.as_deref(), Some(CONFIDENTIAL_PROTOCOL));
        // A confidential output hides the fee.
        assert_eq!(second.transactions[1].fee, None);
    }

    #[tokio::test]
    async fn test_spend_persisted_before_its_output_is_reconciled() {
        let (adapter, chain, store) = setup("http://utxo-reverse-order");
        // Parallel catch-up can finish block 2 before block 1.
        let second = adapter
            .fetch_and_extract(&chain, &store, 2, FetchOptions::CATCH_UP)
            .await
            .unwrap();
        assert!(second
            .transfers
            .iter()
            .filter(|t| t.tx_hash == "t2")
            .all(|t| t.from_address.is_none()));
        store.persist_block(&second).await.unwrap();

        let first = adapter
            .fetch_and_extract(&chain, &store, 1, FetchOptions::CATCH_UP)
            .await
            .unwrap();
        store.persist_block(&first).await.unwrap();

        let spent = store.utxo_output(8332, "t1", 0).await.unwrap();
        assert!(spent.spent);
        assert_eq!(spent.spent_by_txid.as_deref(), Some("t2"));
        assert_eq!(spent.spent_by_vin, Some(0));
        assert!(!store.utxo_output(8332, "t1", 1).await.unwrap().spent);

        let t2: Vec<AssetTransfer> = store
            .transfers(8332)
            .await
            .into_iter()
            .filter(|t| t.tx_hash == "t2")
            .collect();
        assert_eq!(t2.len(), 2);
        assert!(t2.iter().all(|t| t.from_address.as_deref() == Some("alice")));
    }

    #[tokio::test]
    async fn test_reprocessing_is_idempotent() {
        let (adapter, chain, store) = setup("http://utxo-idempotent");
        for _ in 0..2 {
            for n in 1..=2 {
                let bundle = adapter
                    .fetch_and_extract(&chain, &store, n, FetchOptions::CATCH_UP)
                    .await
                    .unwrap();
                store.persist_block(&bundle).await.unwrap();
            }
        }

        let counts = store.counts(8332).await;
        assert_eq!(counts.blocks, 2);
        assert_eq!(counts.transactions, 4);
        assert_eq!(counts.transfers, 6);
        let spent = store.utxo_output(8332, "cb1", 0).await.unwrap();
        assert_eq!(spent.spent_by_txid.as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn test_latest_height_subtracts_confirmations() {
        let (adapter, mut chain, _) = setup("http://utxo-head");
        chain.config.confirmation_depth = 1;
        assert_eq!(adapter.latest_height(&chain).await.unwrap(), 1);
    }
}
