//! Chain-type specific fetch and extract.
//!
//! Each adapter turns one block number into a [`BlockBundle`] that the
//! scheduler persists in a single transaction. Adapters never write.

pub mod evm;
pub mod substrate;
pub mod utxo;

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::chain::ChainRuntime;
use crate::config::{ChainType, EndpointKind};
use crate::db::Store;
use crate::decoders::DecoderRegistry;
use crate::indexer::types::{BlockBundle, FetchOptions};
use crate::rpc::{RpcClient, Transport};

pub use evm::EvmAdapter;
pub use substrate::SubstrateAdapter;
pub use utxo::UtxoAdapter;

/// Selected once per chain from its `chain_type`.
pub enum ChainAdapter {
    Evm(EvmAdapter),
    Utxo(UtxoAdapter),
    Substrate(SubstrateAdapter),
}

impl ChainAdapter {
    pub fn build(
        chain: &ChainRuntime,
        transport: Arc<dyn Transport>,
        registry: Arc<DecoderRegistry>,
    ) -> Self {
        let config = &chain.config;
        let json_rpc = RpcClient::new(
            &config.name,
            &config.endpoints_of(EndpointKind::JsonRpc),
            transport.clone(),
        );

        match config.chain_type {
            ChainType::Evm => ChainAdapter::Evm(EvmAdapter::new(json_rpc, registry)),
            ChainType::Utxo => ChainAdapter::Utxo(UtxoAdapter::new(json_rpc)),
            ChainType::Substrate => {
                let rest = RpcClient::new(
                    &config.name,
                    &config.endpoints_of(EndpointKind::Rest),
                    transport,
                );
                let rpc = (!json_rpc.is_empty()).then_some(json_rpc);
                ChainAdapter::Substrate(SubstrateAdapter::new(rest, rpc))
            }
        }
    }

    /// Highest block the scheduler may index, after finality rules.
    pub async fn latest_height(&self, chain: &ChainRuntime) -> eyre::Result<u64> {
        match self {
            ChainAdapter::Evm(a) => a.latest_height(chain).await,
            ChainAdapter::Utxo(a) => a.latest_height(chain).await,
            ChainAdapter::Substrate(a) => a.latest_height(chain).await,
        }
    }

    pub async fn fetch_and_extract(
        &self,
        chain: &ChainRuntime,
        store: &dyn Store,
        number: u64,
        options: FetchOptions,
    ) -> eyre::Result<BlockBundle> {
        match self {
            ChainAdapter::Evm(a) => a.fetch_and_extract(chain, store, number, options).await,
            ChainAdapter::Utxo(a) => a.fetch_and_extract(chain, store, number, options).await,
            ChainAdapter::Substrate(a) => a.fetch_and_extract(chain, number).await,
        }
    }
}

pub(crate) fn timestamp_from_secs(secs: u64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs as i64, 0).unwrap_or_default()
}

pub(crate) fn block_tag(number: u64) -> String {
    format!("0x{:x}", number)
}
