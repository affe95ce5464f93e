use serde::{Deserialize, Serialize};

use crate::db::ChainStatus;
use crate::indexer::types::AssetTransfer;
use crate::rpc::rate_limiter::LimiterStats;

// ============================================================
// Query params & bodies
// ============================================================

#[derive(Debug, Deserialize)]
pub struct TransferParams {
    pub chain_id: Option<i64>,
    pub from_block: Option<i64>,
    pub to_block: Option<i64>,
    pub address: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// `{"from_block": 123}` or `{"from_block": "latest"}`. Omitted means the
/// configured start block.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StartRequest {
    pub from_block: Option<FromBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum FromBlock {
    Number(u64),
    Tag(String),
}

// ============================================================
// Responses
// ============================================================

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub chains: Vec<ChainHealth>,
    pub endpoints: Vec<EndpointHealth>,
}

#[derive(Debug, Serialize)]
pub struct ChainHealth {
    pub chain_id: i64,
    pub status: String,
    pub last_indexed_block: i64,
}

#[derive(Debug, Serialize)]
pub struct EndpointHealth {
    pub url: String,
    #[serde(flatten)]
    pub stats: LimiterStats,
}

#[derive(Debug, Serialize)]
pub struct ChainsResponse {
    pub chains: Vec<ChainStatus>,
}

#[derive(Debug, Serialize)]
pub struct ControlResponse {
    pub chain_id: i64,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct TransfersResponse {
    pub transfers: Vec<AssetTransfer>,
    pub limit: i64,
    pub offset: i64,
}
