use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;

use crate::config::ChainConfig;
use crate::indexer::types::{
    AssetTransfer, BlockBundle, BlockRecord, EventRecord, ExtrinsicRecord, LogRecord,
    TransactionRecord, TransferType, UtxoInput, UtxoOutput,
};

use super::{
    CapabilityFlags, ChainCounts, ChainStatus, Cursor, CursorStatus, OutputRef, SchedulerMode,
    Store, TransferQuery,
};

type TransferKey = (i64, String, TransferType, i32, i32);

#[derive(Default)]
struct Tables {
    chains: BTreeMap<i64, String>,
    capabilities: HashMap<i64, CapabilityFlags>,
    cursors: BTreeMap<i64, Cursor>,
    blocks: BTreeMap<(i64, i64), BlockRecord>,
    block_hashes: HashMap<(i64, String), i64>,
    transactions: BTreeMap<(i64, String), TransactionRecord>,
    logs: BTreeMap<(i64, i64, i32), LogRecord>,
    extrinsics: BTreeMap<(i64, i64, i32), ExtrinsicRecord>,
    events: BTreeMap<(i64, i64, i32), EventRecord>,
    transfers: BTreeMap<TransferKey, AssetTransfer>,
    utxo_outputs: BTreeMap<(i64, String, i32), UtxoOutput>,
    utxo_inputs: BTreeMap<(i64, String, i32), UtxoInput>,
    tokens: BTreeMap<(i64, String), i64>,
}

/// In-process [`Store`] with the same conflict semantics as the
/// PostgreSQL schema. Selected by `memory://` database URLs.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn transfers(&self, chain_id: i64) -> Vec<AssetTransfer> {
        let tables = self.tables.lock().await;
        tables
            .transfers
            .values()
            .filter(|t| t.chain_id == chain_id)
            .cloned()
            .collect()
    }

    pub async fn utxo_output(&self, chain_id: i64, txid: &str, vout: i32) -> Option<UtxoOutput> {
        let tables = self.tables.lock().await;
        tables
            .utxo_outputs
            .get(&(chain_id, txid.to_string(), vout))
            .cloned()
    }

    pub async fn token_addresses(&self, chain_id: i64) -> Vec<String> {
        let tables = self.tables.lock().await;
        tables
            .tokens
            .keys()
            .filter(|(c, _)| *c == chain_id)
            .map(|(_, address)| address.clone())
            .collect()
    }

    pub async fn counts(&self, chain_id: i64) -> ChainCounts {
        let tables = self.tables.lock().await;
        counts_for(&tables, chain_id)
    }
}

fn counts_for(tables: &Tables, chain_id: i64) -> ChainCounts {
    let blocks = tables.blocks.keys().filter(|(c, _)| *c == chain_id).count();
    let transactions = tables
        .transactions
        .keys()
        .filter(|(c, _)| *c == chain_id)
        .count()
        + tables
            .extrinsics
            .keys()
            .filter(|(c, _, _)| *c == chain_id)
            .count();
    let transfers = tables
        .transfers
        .keys()
        .filter(|(c, ..)| *c == chain_id)
        .count();

    ChainCounts {
        blocks: blocks as i64,
        transactions: transactions as i64,
        transfers: transfers as i64,
    }
}

/// Apply spends of this block's outputs that were persisted before the
/// outputs themselves existed.
fn reconcile_early_spends(tables: &mut Tables, chain_id: i64, block_number: i64) {
    let outputs: Vec<UtxoOutput> = tables
        .utxo_outputs
        .values()
        .filter(|o| o.chain_id == chain_id && o.block_number == block_number)
        .cloned()
        .collect();
    if outputs.is_empty() {
        return;
    }

    let mut senders: BTreeMap<String, (i32, String)> = BTreeMap::new();
    for input in tables.utxo_inputs.values_mut() {
        if input.chain_id != chain_id {
            continue;
        }
        let Some(output) = outputs
            .iter()
            .find(|o| {
                input.prev_txid.as_deref() == Some(o.txid.as_str())
                    && input.prev_vout == Some(o.vout_index)
            })
        else {
            continue;
        };

        if let Some(stored) = tables
            .utxo_outputs
            .get_mut(&(chain_id, output.txid.clone(), output.vout_index))
        {
            if !stored.spent {
                stored.spent = true;
                stored.spent_by_txid = Some(input.txid.clone());
                stored.spent_by_vin = Some(input.vin_index);
            }
        }

        if input.address.is_none() && input.amount.is_none() {
            input.address = output.address.clone();
            input.amount = (!output.is_confidential).then(|| output.amount.clone());
        }
        if let Some(address) = &input.address {
            let first = senders
                .entry(input.txid.clone())
                .or_insert((input.vin_index, address.clone()));
            if input.vin_index < first.0 {
                *first = (input.vin_index, address.clone());
            }
        }
    }

    for (txid, (_, address)) in senders {
        for transfer in tables.transfers.values_mut().filter(|t| {
            t.chain_id == chain_id
                && t.tx_hash == txid
                && t.transfer_type == TransferType::Utxo
                && t.from_address.is_none()
        }) {
            transfer.from_address = Some(address.clone());
        }
        if let Some(tx) = tables.transactions.get_mut(&(chain_id, txid)) {
            if tx.from_address.is_none() {
                tx.from_address = Some(address);
            }
        }
    }
}

fn status_for(tables: &Tables, cursor: &Cursor) -> ChainStatus {
    ChainStatus {
        chain_id: cursor.chain_id,
        status: cursor.status,
        mode: cursor.mode,
        last_indexed_block: cursor.last_indexed_block,
        error_message: cursor.error_message.clone(),
        updated_at: cursor.updated_at,
        counts: counts_for(tables, cursor.chain_id),
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn seed_chain(&self, chain: &ChainConfig) -> eyre::Result<()> {
        let mut tables = self.tables.lock().await;
        tables
            .chains
            .insert(chain.chain_id as i64, chain.name.clone());
        Ok(())
    }

    async fn save_capabilities(&self, chain_id: i64, flags: &CapabilityFlags) -> eyre::Result<()> {
        let mut tables = self.tables.lock().await;
        tables.capabilities.insert(chain_id, flags.clone());
        Ok(())
    }

    async fn load_capabilities(&self, chain_id: i64) -> eyre::Result<CapabilityFlags> {
        let tables = self.tables.lock().await;
        Ok(tables
            .capabilities
            .get(&chain_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_cursor(&self, chain_id: i64) -> eyre::Result<Option<Cursor>> {
        let tables = self.tables.lock().await;
        Ok(tables.cursors.get(&chain_id).cloned())
    }

    async fn init_cursor(&self, chain_id: i64, last_indexed_block: i64) -> eyre::Result<()> {
        let mut tables = self.tables.lock().await;
        tables.cursors.entry(chain_id).or_insert_with(|| Cursor {
            chain_id,
            last_indexed_block,
            status: CursorStatus::Stopped,
            mode: None,
            error_message: None,
            updated_at: Utc::now(),
        });
        Ok(())
    }

    async fn set_status(
        &self,
        chain_id: i64,
        status: CursorStatus,
        mode: Option<SchedulerMode>,
        error_message: Option<&str>,
    ) -> eyre::Result<()> {
        let mut tables = self.tables.lock().await;
        if let Some(cursor) = tables.cursors.get_mut(&chain_id) {
            cursor.status = status;
            cursor.mode = mode;
            cursor.error_message = error_message.map(str::to_string);
            cursor.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn reset_cursor(&self, chain_id: i64, last_indexed_block: i64) -> eyre::Result<()> {
        let mut tables = self.tables.lock().await;
        if let Some(cursor) = tables.cursors.get_mut(&chain_id) {
            cursor.last_indexed_block = last_indexed_block;
            cursor.error_message = None;
            cursor.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn advance_cursor(&self, chain_id: i64, block_number: i64) -> eyre::Result<()> {
        let mut tables = self.tables.lock().await;
        if let Some(cursor) = tables.cursors.get_mut(&chain_id) {
            cursor.last_indexed_block = cursor.last_indexed_block.max(block_number);
            cursor.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn persist_block(&self, bundle: &BlockBundle) -> eyre::Result<()> {
        let mut tables = self.tables.lock().await;
        let chain_id = bundle.block.chain_id;
        let block = &bundle.block;

        let hash_key = (chain_id, block.hash.clone());
        if !tables.blocks.contains_key(&(chain_id, block.number))
            && !tables.block_hashes.contains_key(&hash_key)
        {
            tables.block_hashes.insert(hash_key, block.number);
            tables.blocks.insert((chain_id, block.number), block.clone());
        }

        for t in &bundle.transactions {
            tables
                .transactions
                .entry((t.chain_id, t.tx_hash.clone()))
                .or_insert_with(|| t.clone());
        }
        for l in &bundle.logs {
            tables
                .logs
                .entry((l.chain_id, l.block_number, l.log_index))
                .or_insert_with(|| l.clone());
        }
        for x in &bundle.extrinsics {
            tables
                .extrinsics
                .entry((x.chain_id, x.block_number, x.extrinsic_index))
                .or_insert_with(|| x.clone());
        }
        for e in &bundle.events {
            tables
                .events
                .entry((e.chain_id, e.block_number, e.event_index))
                .or_insert_with(|| e.clone());
        }
        for o in &bundle.utxo_outputs {
            tables
                .utxo_outputs
                .entry((o.chain_id, o.txid.clone(), o.vout_index))
                .or_insert_with(|| o.clone());
        }
        for i in &bundle.utxo_inputs {
            tables
                .utxo_inputs
                .entry((i.chain_id, i.txid.clone(), i.vin_index))
                .or_insert_with(|| i.clone());
        }
        for s in &bundle.spent_outputs {
            if let Some(output) = tables
                .utxo_outputs
                .get_mut(&(chain_id, s.txid.clone(), s.vout_index))
            {
                if !output.spent {
                    output.spent = true;
                    output.spent_by_txid = Some(s.spent_by_txid.clone());
                    output.spent_by_vin = Some(s.spent_by_vin);
                }
            }
        }
        for t in &bundle.transfers {
            tables
                .transfers
                .entry(t.unique_key())
                .or_insert_with(|| t.clone());
        }
        if !bundle.utxo_outputs.is_empty() {
            reconcile_early_spends(&mut tables, chain_id, block.number);
        }
        for address in &bundle.token_addresses {
            tables
                .tokens
                .entry((chain_id, address.clone()))
                .or_insert(block.number);
        }

        Ok(())
    }

    async fn lookup_outputs(
        &self,
        chain_id: i64,
        refs: &[OutputRef],
    ) -> eyre::Result<HashMap<OutputRef, UtxoOutput>> {
        let tables = self.tables.lock().await;
        Ok(refs
            .iter()
            .filter_map(|(txid, vout)| {
                tables
                    .utxo_outputs
                    .get(&(chain_id, txid.clone(), *vout))
                    .map(|o| ((txid.clone(), *vout), o.clone()))
            })
            .collect())
    }

    async fn chain_status(&self, chain_id: i64) -> eyre::Result<Option<ChainStatus>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .cursors
            .get(&chain_id)
            .map(|cursor| status_for(&tables, cursor)))
    }

    async fn list_statuses(&self) -> eyre::Result<Vec<ChainStatus>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .cursors
            .values()
            .map(|cursor| status_for(&tables, cursor))
            .collect())
    }

    async fn list_transfers(&self, query: &TransferQuery) -> eyre::Result<Vec<AssetTransfer>> {
        let tables = self.tables.lock().await;
        let mut matched: Vec<&AssetTransfer> = tables
            .transfers
            .values()
            .filter(|t| query.chain_id.map_or(true, |c| t.chain_id == c))
            .filter(|t| query.from_block.map_or(true, |b| t.block_number >= b))
            .filter(|t| query.to_block.map_or(true, |b| t.block_number <= b))
            .filter(|t| {
                query.address.as_deref().map_or(true, |a| {
                    t.from_address.as_deref() == Some(a) || t.to_address.as_deref() == Some(a)
                })
            })
            .collect();

        matched.sort_by_key(|t| (t.chain_id, t.block_number, t.log_index, t.trace_index));

        Ok(matched
            .into_iter()
            .skip(query.offset.max(0) as usize)
            .take(query.limit.max(0) as usize)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::types::{SpentOutput, NOT_APPLICABLE};
    use bigdecimal::BigDecimal;
    use chrono::DateTime;

    fn block(number: i64, hash: &str) -> BlockRecord {
        BlockRecord {
            chain_id: 1,
            number,
            hash: hash.to_string(),
            parent_hash: "0x00".to_string(),
            timestamp: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            producer: None,
            gas_used: None,
            gas_limit: None,
            size: None,
            tx_count: 0,
        }
    }

    fn output(txid: &str, vout: i32) -> UtxoOutput {
        UtxoOutput {
            chain_id: 1,
            txid: txid.to_string(),
            vout_index: vout,
            block_number: 1,
            amount: BigDecimal::from(5),
            script_type: "pubkeyhash".to_string(),
            address: Some("addr".to_string()),
            spent: false,
            spent_by_txid: None,
            spent_by_vin: None,
            is_confidential: false,
        }
    }

    #[tokio::test]
    async fn test_advance_is_monotonic_and_reset_repositions() {
        let store = MemoryStore::new();
        store.init_cursor(1, 10).await.unwrap();
        store.advance_cursor(1, 15).await.unwrap();
        store.advance_cursor(1, 12).await.unwrap();
        // A second init leaves the existing row alone.
        store.init_cursor(1, 0).await.unwrap();

        let cursor = store.get_cursor(1).await.unwrap().unwrap();
        assert_eq!(cursor.last_indexed_block, 15);

        store.reset_cursor(1, 4).await.unwrap();
        let cursor = store.get_cursor(1).await.unwrap().unwrap();
        assert_eq!(cursor.last_indexed_block, 4);
    }

    #[tokio::test]
    async fn test_block_hash_conflict_is_absorbed() {
        let store = MemoryStore::new();
        store.persist_block(&BlockBundle::new(block(1, "0xaa"))).await.unwrap();
        store.persist_block(&BlockBundle::new(block(2, "0xaa"))).await.unwrap();

        assert_eq!(store.counts(1).await.blocks, 1);
    }

    #[tokio::test]
    async fn test_output_is_spent_once() {
        let store = MemoryStore::new();
        let mut first = BlockBundle::new(block(1, "0x01"));
        first.utxo_outputs.push(output("a", 0));
        store.persist_block(&first).await.unwrap();

        let mut second = BlockBundle::new(block(2, "0x02"));
        second.spent_outputs.push(SpentOutput {
            txid: "a".into(),
            vout_index: 0,
            spent_by_txid: "b".into(),
            spent_by_vin: 0,
        });
        store.persist_block(&second).await.unwrap();

        let mut third = BlockBundle::new(block(3, "0x03"));
        third.spent_outputs.push(SpentOutput {
            txid: "a".into(),
            vout_index: 0,
            spent_by_txid: "c".into(),
            spent_by_vin: 1,
        });
        store.persist_block(&third).await.unwrap();

        let spent = store.utxo_output(1, "a", 0).await.unwrap();
        assert!(spent.spent);
        assert_eq!(spent.spent_by_txid.as_deref(), Some("b"));
        assert_eq!(spent.spent_by_vin, Some(0));
    }

    #[tokio::test]
    async fn test_list_transfers_filters_by_address() {
        let store = MemoryStore::new();
        let mut bundle = BlockBundle::new(block(7, "0x07"));
        for (i, (from, to)) in [("x", "y"), ("y", "z"), ("p", "q")].iter().enumerate() {
            bundle.transfers.push(AssetTransfer {
                chain_id: 1,
                block_number: 7,
                block_timestamp: bundle.block.timestamp,
                tx_hash: "0xt".into(),
                transfer_type: TransferType::Erc20,
                token_address: None,
                from_address: Some(from.to_string()),
                to_address: Some(to.to_string()),
                amount: BigDecimal::from(1),
                token_id: None,
                log_index: i as i32,
                trace_index: NOT_APPLICABLE,
                confidential: false,
                privacy_protocol: None,
            });
        }
        store.persist_block(&bundle).await.unwrap();

        let query = TransferQuery {
            address: Some("y".into()),
            limit: 10,
            ..Default::default()
        };
        let found = store.list_transfers(&query).await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].log_index, 0);
        assert_eq!(found[1].log_index, 1);
    }
}
