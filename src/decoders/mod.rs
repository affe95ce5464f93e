//! Transfer decoder registry.
//!
//! Log decoders are keyed by topic0; block decoders run on every block.
//! The table is built once at startup and handed to every EVM adapter.

pub mod erc1155;
pub mod swap;
pub mod token;
pub mod value;
pub mod weth;

use alloy::primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use std::sync::Arc;

use crate::indexer::types::{bytes_to_hex, AssetTransfer, TransferType, NOT_APPLICABLE};
use crate::rpc::{RpcClient, RpcError};

// ============================================================
// Decoder inputs
// ============================================================

#[derive(Debug, Clone)]
pub struct EvmLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub tx_hash: B256,
    pub log_index: i32,
}

impl EvmLog {
    pub fn topic0(&self) -> Option<&B256> {
        self.topics.first()
    }
}

#[derive(Debug, Clone)]
pub struct EvmTx {
    pub hash: B256,
    pub from: Address,
    pub to: Option<Address>,
    pub value: U256,
    /// `None` when the receipt was unavailable.
    pub success: Option<bool>,
}

/// A value-carrying call frame below the top level of a transaction.
#[derive(Debug, Clone)]
pub struct InternalCall {
    pub tx_hash: B256,
    pub from: Address,
    pub to: Address,
    pub value: U256,
    /// Position of the frame within the transaction's trace.
    pub trace_index: i32,
}

#[derive(Debug, Clone)]
pub struct Withdrawal {
    pub address: Address,
    pub amount_gwei: u64,
}

/// Everything the block decoders look at.
#[derive(Debug, Clone, Copy)]
pub struct BlockInput<'a> {
    pub transactions: &'a [EvmTx],
    pub logs: &'a [EvmLog],
    pub withdrawals: &'a [Withdrawal],
    pub internal_calls: &'a [InternalCall],
}

/// Reads contract state at a block. Used by decoders that need more than
/// the log itself.
#[async_trait]
pub trait ContractReader: Send + Sync {
    async fn call(&self, to: Address, data: Bytes, block: u64) -> Result<Bytes, RpcError>;
}

#[async_trait]
impl ContractReader for RpcClient {
    async fn call(&self, to: Address, data: Bytes, block: u64) -> Result<Bytes, RpcError> {
        self.call_as(
            "eth_call",
            json!([{"to": to, "data": data}, format!("0x{:x}", block)]),
        )
        .await
    }
}

/// Read-only block context shared by every decoder call.
pub struct DecodeContext<'a> {
    pub chain_id: i64,
    pub block_number: u64,
    pub block_hash: B256,
    pub block_timestamp: DateTime<Utc>,
    /// Absent when auxiliary reads are disabled (catch-up).
    pub reader: Option<&'a dyn ContractReader>,
}

impl DecodeContext<'_> {
    /// A transfer row with every optional field empty and both positions
    /// set to the not-applicable sentinel.
    pub fn transfer(&self, tx_hash: B256, transfer_type: TransferType, amount: U256) -> AssetTransfer {
        AssetTransfer {
            chain_id: self.chain_id,
            block_number: self.block_number as i64,
            block_timestamp: self.block_timestamp,
            tx_hash: bytes_to_hex(tx_hash.as_slice()),
            transfer_type,
            token_address: None,
            from_address: None,
            to_address: None,
            amount: u256_to_bd(amount),
            token_id: None,
            log_index: NOT_APPLICABLE,
            trace_index: NOT_APPLICABLE,
            confidential: false,
            privacy_protocol: None,
        }
    }
}

/// Collects decoder output for one block.
#[derive(Debug, Default)]
pub struct TransferSink {
    pub transfers: Vec<AssetTransfer>,
    pub tokens: BTreeSet<String>,
}

impl TransferSink {
    pub fn push(&mut self, transfer: AssetTransfer) {
        self.transfers.push(transfer);
    }

    pub fn note_token(&mut self, address: Address) {
        self.tokens.insert(address_hex(address));
    }
}

pub fn address_hex(address: Address) -> String {
    bytes_to_hex(address.as_slice())
}

pub fn u256_to_bd(val: U256) -> BigDecimal {
    BigDecimal::from_str(&val.to_string()).unwrap_or_default()
}

// ============================================================
// Decoder traits
// ============================================================

#[async_trait]
pub trait LogDecoder: Send + Sync {
    fn name(&self) -> &'static str;

    /// Topic0 values this decoder handles.
    fn topics(&self) -> Vec<B256>;

    /// Append zero or more transfers. Malformed logs are skipped silently.
    async fn decode(&self, ctx: &DecodeContext<'_>, log: &EvmLog, sink: &mut TransferSink);
}

pub trait BlockDecoder: Send + Sync {
    fn name(&self) -> &'static str;

    fn decode(&self, ctx: &DecodeContext<'_>, input: &BlockInput<'_>, sink: &mut TransferSink);
}

// ============================================================
// Registry
// ============================================================

#[derive(Default)]
pub struct DecoderRegistry {
    log_decoders: HashMap<B256, Arc<dyn LogDecoder>>,
    block_decoders: Vec<Arc<dyn BlockDecoder>>,
}

impl DecoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every decoder this indexer ships with.
    pub fn standard() -> eyre::Result<Self> {
        let mut registry = Self::new();
        registry.register_log(Arc::new(token::TokenTransferDecoder))?;
        registry.register_log(Arc::new(erc1155::Erc1155Decoder))?;
        registry.register_log(Arc::new(weth::WethDecoder))?;
        registry.register_log(Arc::new(swap::SwapDecoder::new()))?;
        registry.register_block(Arc::new(value::NativeValueDecoder));
        registry.register_block(Arc::new(value::InternalValueDecoder));
        registry.register_block(Arc::new(value::WithdrawalDecoder));
        Ok(registry)
    }

    pub fn register_log(&mut self, decoder: Arc<dyn LogDecoder>) -> eyre::Result<()> {
        for topic in decoder.topics() {
            if let Some(existing) = self.log_decoders.get(&topic) {
                return Err(eyre::eyre!(
                    "Topic {} already handled by {}, cannot register {}",
                    topic,
                    existing.name(),
                    decoder.name()
                ));
            }
            self.log_decoders.insert(topic, decoder.clone());
        }
        Ok(())
    }

    pub fn register_block(&mut self, decoder: Arc<dyn BlockDecoder>) {
        self.block_decoders.push(decoder);
    }

    pub fn log_decoder_count(&self) -> usize {
        self.log_decoders.len()
    }

    pub async fn decode(&self, ctx: &DecodeContext<'_>, input: &BlockInput<'_>) -> TransferSink {
        let mut sink = TransferSink::default();

        for decoder in &self.block_decoders {
            decoder.decode(ctx, input, &mut sink);
        }

        for log in input.logs {
            let Some(decoder) = log.topic0().and_then(|t| self.log_decoders.get(t)) else {
                continue;
            };
            decoder.decode(ctx, log, &mut sink).await;
        }

        sink
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn ctx<'a>(reader: Option<&'a dyn ContractReader>) -> DecodeContext<'a> {
        DecodeContext {
            chain_id: 1,
            block_number: 100,
            block_hash: B256::repeat_byte(0xbb),
            block_timestamp: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            reader,
        }
    }

    pub fn word(value: u64) -> [u8; 32] {
        U256::from(value).to_be_bytes::<32>()
    }

    pub fn log(address: Address, topics: Vec<B256>, data: Vec<u8>) -> EvmLog {
        EvmLog {
            address,
            topics,
            data: Bytes::from(data),
            tx_hash: B256::repeat_byte(0x11),
            log_index: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use alloy::sol_types::SolEvent;

    struct Dummy;

    #[async_trait]
    impl LogDecoder for Dummy {
        fn name(&self) -> &'static str {
            "dummy"
        }

        fn topics(&self) -> Vec<B256> {
            vec![token::Transfer::SIGNATURE_HASH]
        }

        async fn decode(&self, _: &DecodeContext<'_>, _: &EvmLog, _: &mut TransferSink) {}
    }

    #[test]
    fn test_duplicate_topic_is_rejected() {
        let mut registry = DecoderRegistry::standard().unwrap();
        assert!(registry.register_log(Arc::new(Dummy)).is_err());
    }

    #[tokio::test]
    async fn test_unknown_topics_are_ignored() {
        let registry = DecoderRegistry::standard().unwrap();
        let logs = vec![log(Address::ZERO, vec![B256::repeat_byte(0x42)], vec![])];
        let input = BlockInput {
            transactions: &[],
            logs: &logs,
            withdrawals: &[],
            internal_calls: &[],
        };
        let sink = registry.decode(&ctx(None), &input).await;
        assert!(sink.transfers.is_empty());
    }
}
