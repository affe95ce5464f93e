use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Sentinel for "no log position" / "no trace position" on a transfer.
pub const NOT_APPLICABLE: i32 = -1;

/// Literal sender recorded for newly minted UTXO coins.
pub const COINBASE_SENDER: &str = "coinbase";

pub fn bytes_to_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferType {
    Native,
    Internal,
    Erc20,
    Erc721,
    Erc1155,
    Wrap,
    Unwrap,
    Withdrawal,
    SwapIn,
    SwapOut,
    Utxo,
    Asset,
    AssetMint,
    AssetBurn,
    ForeignAsset,
    Nft,
}

impl TransferType {
    pub const ALL: [TransferType; 16] = [
        TransferType::Native,
        TransferType::Internal,
        TransferType::Erc20,
        TransferType::Erc721,
        TransferType::Erc1155,
        TransferType::Wrap,
        TransferType::Unwrap,
        TransferType::Withdrawal,
        TransferType::SwapIn,
        TransferType::SwapOut,
        TransferType::Utxo,
        TransferType::Asset,
        TransferType::AssetMint,
        TransferType::AssetBurn,
        TransferType::ForeignAsset,
        TransferType::Nft,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferType::Native => "native",
            TransferType::Internal => "internal",
            TransferType::Erc20 => "erc20",
            TransferType::Erc721 => "erc721",
            TransferType::Erc1155 => "erc1155",
            TransferType::Wrap => "wrap",
            TransferType::Unwrap => "unwrap",
            TransferType::Withdrawal => "withdrawal",
            TransferType::SwapIn => "swap_in",
            TransferType::SwapOut => "swap_out",
            TransferType::Utxo => "utxo",
            TransferType::Asset => "asset",
            TransferType::AssetMint => "asset_mint",
            TransferType::AssetBurn => "asset_burn",
            TransferType::ForeignAsset => "foreign_asset",
            TransferType::Nft => "nft",
        }
    }
}

impl fmt::Display for TransferType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferType {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TransferType::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| eyre::eyre!("Unknown transfer type '{}'", s))
    }
}

/// The canonical value-transfer row shared by every chain type.
///
/// Unique on `(chain_id, tx_hash, transfer_type, log_index, trace_index)`.
/// `amount` is always a non-negative integer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssetTransfer {
    pub chain_id: i64,
    pub block_number: i64,
    pub block_timestamp: DateTime<Utc>,
    pub tx_hash: String,
    pub transfer_type: TransferType,
    pub token_address: Option<String>,
    pub from_address: Option<String>,
    pub to_address: Option<String>,
    pub amount: BigDecimal,
    pub token_id: Option<String>,
    pub log_index: i32,
    pub trace_index: i32,
    pub confidential: bool,
    pub privacy_protocol: Option<String>,
}

impl AssetTransfer {
    pub fn unique_key(&self) -> (i64, String, TransferType, i32, i32) {
        (
            self.chain_id,
            self.tx_hash.clone(),
            self.transfer_type,
            self.log_index,
            self.trace_index,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockRecord {
    pub chain_id: i64,
    pub number: i64,
    pub hash: String,
    pub parent_hash: String,
    pub timestamp: DateTime<Utc>,
    /// Miner, validator or block author.
    pub producer: Option<String>,
    pub gas_used: Option<i64>,
    pub gas_limit: Option<i64>,
    pub size: Option<i64>,
    pub tx_count: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionRecord {
    pub chain_id: i64,
    pub tx_hash: String,
    pub block_number: i64,
    pub tx_index: i32,
    pub from_address: Option<String>,
    pub to_address: Option<String>,
    pub value: BigDecimal,
    pub fee: Option<BigDecimal>,
    pub status: Option<bool>,
    pub size: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    pub chain_id: i64,
    pub block_number: i64,
    pub log_index: i32,
    pub tx_hash: String,
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtrinsicRecord {
    pub chain_id: i64,
    pub block_number: i64,
    pub extrinsic_index: i32,
    pub hash: Option<String>,
    pub pallet: String,
    pub method: String,
    pub signer: Option<String>,
    pub success: bool,
    pub fee: Option<BigDecimal>,
    pub args: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    pub chain_id: i64,
    pub block_number: i64,
    pub event_index: i32,
    pub extrinsic_index: Option<i32>,
    pub pallet: String,
    pub method: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UtxoOutput {
    pub chain_id: i64,
    pub txid: String,
    pub vout_index: i32,
    pub block_number: i64,
    pub amount: BigDecimal,
    pub script_type: String,
    pub address: Option<String>,
    pub spent: bool,
    pub spent_by_txid: Option<String>,
    pub spent_by_vin: Option<i32>,
    pub is_confidential: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UtxoInput {
    pub chain_id: i64,
    pub txid: String,
    pub vin_index: i32,
    pub block_number: i64,
    pub prev_txid: Option<String>,
    pub prev_vout: Option<i32>,
    pub address: Option<String>,
    pub amount: Option<BigDecimal>,
    pub is_coinbase: bool,
}

/// An earlier output consumed by an input of this block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpentOutput {
    pub txid: String,
    pub vout_index: i32,
    pub spent_by_txid: String,
    pub spent_by_vin: i32,
}

/// Output of an adapter for one block; persisted as a single unit.
#[derive(Debug, Clone)]
pub struct BlockBundle {
    pub block: BlockRecord,
    pub transactions: Vec<TransactionRecord>,
    pub logs: Vec<LogRecord>,
    pub extrinsics: Vec<ExtrinsicRecord>,
    pub events: Vec<EventRecord>,
    pub transfers: Vec<AssetTransfer>,
    pub utxo_outputs: Vec<UtxoOutput>,
    pub utxo_inputs: Vec<UtxoInput>,
    pub spent_outputs: Vec<SpentOutput>,
    /// Distinct token contracts seen, handed to metadata enrichment.
    pub token_addresses: BTreeSet<String>,
}

impl BlockBundle {
    pub fn new(block: BlockRecord) -> Self {
        Self {
            block,
            transactions: Vec::new(),
            logs: Vec::new(),
            extrinsics: Vec::new(),
            events: Vec::new(),
            transfers: Vec::new(),
            utxo_outputs: Vec::new(),
            utxo_inputs: Vec::new(),
            spent_outputs: Vec::new(),
            token_addresses: BTreeSet::new(),
        }
    }
}

/// What an adapter is allowed to spend time on for one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOptions {
    pub traces: bool,
    pub enrich: bool,
}

impl FetchOptions {
    pub const LIVE: FetchOptions = FetchOptions {
        traces: true,
        enrich: true,
    };

    /// Catch-up skips optional work; it is backfilled out of band.
    pub const CATCH_UP: FetchOptions = FetchOptions {
        traces: false,
        enrich: false,
    };
}
