pub mod memory;
pub mod repository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

use crate::config::ChainConfig;
use crate::indexer::types::{AssetTransfer, BlockBundle, UtxoOutput};

pub use memory::MemoryStore;
pub use repository::PgStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CursorStatus {
    Running,
    Stopped,
    Error,
}

impl CursorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CursorStatus::Running => "running",
            CursorStatus::Stopped => "stopped",
            CursorStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => CursorStatus::Running,
            "error" => CursorStatus::Error,
            _ => CursorStatus::Stopped,
        }
    }
}

/// Which loop a running chain is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerMode {
    CatchingUp,
    Polling,
}

impl SchedulerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerMode::CatchingUp => "catching_up",
            SchedulerMode::Polling => "polling",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "catching_up" => Some(SchedulerMode::CatchingUp),
            "polling" => Some(SchedulerMode::Polling),
            _ => None,
        }
    }
}

impl fmt::Display for SchedulerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cursor {
    pub chain_id: i64,
    pub last_indexed_block: i64,
    pub status: CursorStatus,
    pub mode: Option<SchedulerMode>,
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChainCounts {
    pub blocks: i64,
    pub transactions: i64,
    pub transfers: i64,
}

/// Per-chain status projection served to operators and downstream consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainStatus {
    pub chain_id: i64,
    pub status: CursorStatus,
    pub mode: Option<SchedulerMode>,
    pub last_indexed_block: i64,
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub counts: ChainCounts,
}

#[derive(Debug, Clone, Default)]
pub struct TransferQuery {
    pub chain_id: Option<i64>,
    pub from_block: Option<i64>,
    pub to_block: Option<i64>,
    /// Matches either side of the transfer.
    pub address: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

/// Capability flags discovered at runtime and mirrored to `chain_configs`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilityFlags {
    pub trace_supported: Option<bool>,
    pub trace_method: Option<String>,
    pub block_receipts_supported: Option<bool>,
}

/// Output reference `(txid, vout)`.
pub type OutputRef = (String, i32);

/// Persistence port used by the scheduler, adapters and API.
///
/// Every write is an upsert on the natural unique key, so replaying a block
/// any number of times leaves the same rows behind.
#[async_trait]
pub trait Store: Send + Sync {
    async fn seed_chain(&self, chain: &ChainConfig) -> eyre::Result<()>;

    async fn save_capabilities(&self, chain_id: i64, flags: &CapabilityFlags) -> eyre::Result<()>;

    async fn load_capabilities(&self, chain_id: i64) -> eyre::Result<CapabilityFlags>;

    async fn get_cursor(&self, chain_id: i64) -> eyre::Result<Option<Cursor>>;

    /// Create the cursor row if it does not exist yet. Never moves an
    /// existing cursor.
    async fn init_cursor(&self, chain_id: i64, last_indexed_block: i64) -> eyre::Result<()>;

    async fn set_status(
        &self,
        chain_id: i64,
        status: CursorStatus,
        mode: Option<SchedulerMode>,
        error_message: Option<&str>,
    ) -> eyre::Result<()>;

    /// Reposition an existing cursor, forwards or backwards, for an
    /// operator-requested restart. Clears any recorded error.
    async fn reset_cursor(&self, chain_id: i64, last_indexed_block: i64) -> eyre::Result<()>;

    /// Move `last_indexed_block` forward; lower values are ignored.
    async fn advance_cursor(&self, chain_id: i64, block_number: i64) -> eyre::Result<()>;

    /// Write every record of the bundle in one transaction.
    async fn persist_block(&self, bundle: &BlockBundle) -> eyre::Result<()>;

    async fn lookup_outputs(
        &self,
        chain_id: i64,
        refs: &[OutputRef],
    ) -> eyre::Result<HashMap<OutputRef, UtxoOutput>>;

    async fn chain_status(&self, chain_id: i64) -> eyre::Result<Option<ChainStatus>>;

    async fn list_statuses(&self) -> eyre::Result<Vec<ChainStatus>>;

    async fn list_transfers(&self, query: &TransferQuery) -> eyre::Result<Vec<AssetTransfer>>;
}
