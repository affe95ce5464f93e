use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Row};
use std::collections::HashMap;

use crate::config::{ChainConfig, EndpointKind};
use crate::indexer::types::{
    AssetTransfer, BlockBundle, BlockRecord, EventRecord, ExtrinsicRecord, LogRecord,
    SpentOutput, TransactionRecord, UtxoInput, UtxoOutput,
};

use super::{
    CapabilityFlags, ChainCounts, ChainStatus, Cursor, CursorStatus, OutputRef, SchedulerMode,
    Store, TransferQuery,
};

/// Rows per multi-row INSERT; keeps every statement under the PostgreSQL
/// bind-parameter limit.
const CHUNK_SIZE: usize = 1000;

/// PostgreSQL-backed [`Store`].
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ============================================================
// Fact tables
// ============================================================

async fn insert_block(conn: &mut PgConnection, block: &BlockRecord) -> eyre::Result<()> {
    // No conflict target: absorbs both the (chain_id, number) key and the
    // unique block hash.
    sqlx::query(
        "INSERT INTO blocks (chain_id, number, hash, parent_hash, timestamp, producer, \
         gas_used, gas_limit, size, tx_count)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
         ON CONFLICT DO NOTHING",
    )
    .bind(block.chain_id)
    .bind(block.number)
    .bind(&block.hash)
    .bind(&block.parent_hash)
    .bind(block.timestamp)
    .bind(&block.producer)
    .bind(block.gas_used)
    .bind(block.gas_limit)
    .bind(block.size)
    .bind(block.tx_count)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

async fn insert_transactions_batch(
    conn: &mut PgConnection,
    transactions: &[TransactionRecord],
) -> eyre::Result<()> {
    for chunk in transactions.chunks(CHUNK_SIZE) {
        let mut query_builder: sqlx::QueryBuilder<sqlx::Postgres> = sqlx::QueryBuilder::new(
            "INSERT INTO transactions (chain_id, tx_hash, block_number, tx_index, from_address, \
             to_address, value, fee, status, size) ",
        );

        query_builder.push_values(chunk, |mut b, t| {
            b.push_bind(t.chain_id)
                .push_bind(&t.tx_hash)
                .push_bind(t.block_number)
                .push_bind(t.tx_index)
                .push_bind(&t.from_address)
                .push_bind(&t.to_address)
                .push_bind(&t.value)
                .push_bind(&t.fee)
                .push_bind(t.status)
                .push_bind(t.size);
        });

        query_builder.push(" ON CONFLICT (chain_id, tx_hash) DO NOTHING");
        query_builder.build().execute(&mut *conn).await?;
    }

    Ok(())
}

async fn insert_logs_batch(conn: &mut PgConnection, logs: &[LogRecord]) -> eyre::Result<()> {
    for chunk in logs.chunks(CHUNK_SIZE) {
        let mut query_builder: sqlx::QueryBuilder<sqlx::Postgres> = sqlx::QueryBuilder::new(
            "INSERT INTO logs (chain_id, block_number, log_index, tx_hash, address, topics, data) ",
        );

        query_builder.push_values(chunk, |mut b, l| {
            b.push_bind(l.chain_id)
                .push_bind(l.block_number)
                .push_bind(l.log_index)
                .push_bind(&l.tx_hash)
                .push_bind(&l.address)
                .push_bind(&l.topics)
                .push_bind(&l.data);
        });

        query_builder.push(" ON CONFLICT (chain_id, block_number, log_index) DO NOTHING");
        query_builder.build().execute(&mut *conn).await?;
    }

    Ok(())
}

async fn insert_extrinsics_batch(
    conn: &mut PgConnection,
    extrinsics: &[ExtrinsicRecord],
) -> eyre::Result<()> {
    for chunk in extrinsics.chunks(CHUNK_SIZE) {
        let mut query_builder: sqlx::QueryBuilder<sqlx::Postgres> = sqlx::QueryBuilder::new(
            "INSERT INTO extrinsics (chain_id, block_number, extrinsic_index, hash, pallet, \
             method, signer, success, fee, args) ",
        );

        query_builder.push_values(chunk, |mut b, x| {
            b.push_bind(x.chain_id)
                .push_bind(x.block_number)
                .push_bind(x.extrinsic_index)
                .push_bind(&x.hash)
                .push_bind(&x.pallet)
                .push_bind(&x.method)
                .push_bind(&x.signer)
                .push_bind(x.success)
                .push_bind(&x.fee)
                .push_bind(&x.args);
        });

        query_builder.push(" ON CONFLICT (chain_id, block_number, extrinsic_index) DO NOTHING");
        query_builder.build().execute(&mut *conn).await?;
    }

    Ok(())
}

async fn insert_events_batch(conn: &mut PgConnection, events: &[EventRecord]) -> eyre::Result<()> {
    for chunk in events.chunks(CHUNK_SIZE) {
        let mut query_builder: sqlx::QueryBuilder<sqlx::Postgres> = sqlx::QueryBuilder::new(
            "INSERT INTO events (chain_id, block_number, event_index, extrinsic_index, pallet, \
             method, data) ",
        );

        query_builder.push_values(chunk, |mut b, e| {
            b.push_bind(e.chain_id)
                .push_bind(e.block_number)
                .push_bind(e.event_index)
                .push_bind(e.extrinsic_index)
                .push_bind(&e.pallet)
                .push_bind(&e.method)
                .push_bind(&e.data);
        });

        query_builder.push(" ON CONFLICT (chain_id, block_number, event_index) DO NOTHING");
        query_builder.build().execute(&mut *conn).await?;
    }

    Ok(())
}

/// Insert a batch of transfers using multi-row INSERT with ON CONFLICT DO NOTHING.
async fn insert_transfers_batch(
    conn: &mut PgConnection,
    transfers: &[AssetTransfer],
) -> eyre::Result<()> {
    for chunk in transfers.chunks(CHUNK_SIZE) {
        let mut query_builder: sqlx::QueryBuilder<sqlx::Postgres> = sqlx::QueryBuilder::new(
            "INSERT INTO asset_transfers (chain_id, block_number, block_timestamp, tx_hash, \
             transfer_type, token_address, from_address, to_address, amount, token_id, \
             log_index, trace_index, confidential, privacy_protocol) ",
        );

        query_builder.push_values(chunk, |mut b, t| {
            b.push_bind(t.chain_id)
                .push_bind(t.block_number)
                .push_bind(t.block_timestamp)
                .push_bind(&t.tx_hash)
                .push_bind(t.transfer_type.as_str())
                .push_bind(&t.token_address)
                .push_bind(&t.from_address)
                .push_bind(&t.to_address)
                .push_bind(&t.amount)
                .push_bind(&t.token_id)
                .push_bind(t.log_index)
                .push_bind(t.trace_index)
                .push_bind(t.confidential)
                .push_bind(&t.privacy_protocol);
        });

        query_builder.push(
            " ON CONFLICT (chain_id, tx_hash, transfer_type, log_index, trace_index) DO NOTHING",
        );
        query_builder.build().execute(&mut *conn).await?;
    }

    Ok(())
}

async fn insert_utxo_outputs_batch(
    conn: &mut PgConnection,
    outputs: &[UtxoOutput],
) -> eyre::Result<()> {
    for chunk in outputs.chunks(CHUNK_SIZE) {
        let mut query_builder: sqlx::QueryBuilder<sqlx::Postgres> = sqlx::QueryBuilder::new(
            "INSERT INTO utxo_outputs (chain_id, txid, vout_index, block_number, amount, \
             script_type, address, spent, spent_by_txid, spent_by_vin, is_confidential) ",
        );

        query_builder.push_values(chunk, |mut b, o| {
            b.push_bind(o.chain_id)
                .push_bind(&o.txid)
                .push_bind(o.vout_index)
                .push_bind(o.block_number)
                .push_bind(&o.amount)
                .push_bind(&o.script_type)
                .push_bind(&o.address)
                .push_bind(o.spent)
                .push_bind(&o.spent_by_txid)
                .push_bind(o.spent_by_vin)
                .push_bind(o.is_confidential);
        });

        query_builder.push(" ON CONFLICT (chain_id, txid, vout_index) DO NOTHING");
        query_builder.build().execute(&mut *conn).await?;
    }

    Ok(())
}

async fn insert_utxo_inputs_batch(
    conn: &mut PgConnection,
    inputs: &[UtxoInput],
) -> eyre::Result<()> {
    for chunk in inputs.chunks(CHUNK_SIZE) {
        let mut query_builder: sqlx::QueryBuilder<sqlx::Postgres> = sqlx::QueryBuilder::new(
            "INSERT INTO utxo_inputs (chain_id, txid, vin_index, block_number, prev_txid, \
             prev_vout, address, amount, is_coinbase) ",
        );

        query_builder.push_values(chunk, |mut b, i| {
            b.push_bind(i.chain_id)
                .push_bind(&i.txid)
                .push_bind(i.vin_index)
                .push_bind(i.block_number)
                .push_bind(&i.prev_txid)
                .push_bind(i.prev_vout)
                .push_bind(&i.address)
                .push_bind(&i.amount)
                .push_bind(i.is_coinbase);
        });

        query_builder.push(" ON CONFLICT (chain_id, txid, vin_index) DO NOTHING");
        query_builder.build().execute(&mut *conn).await?;
    }

    Ok(())
}

/// Flip referenced outputs to spent. Runs after the block's own outputs are
/// inserted so same-block spends find their rows. An output is only ever
/// marked once.
async fn mark_outputs_spent(
    conn: &mut PgConnection,
    chain_id: i64,
    spent: &[SpentOutput],
) -> eyre::Result<()> {
    if spent.is_empty() {
        return Ok(());
    }

    let txids: Vec<&str> = spent.iter().map(|s| s.txid.as_str()).collect();
    let vouts: Vec<i32> = spent.iter().map(|s| s.vout_index).collect();
    let spenders: Vec<&str> = spent.iter().map(|s| s.spent_by_txid.as_str()).collect();
    let vins: Vec<i32> = spent.iter().map(|s| s.spent_by_vin).collect();

    sqlx::query(
        "UPDATE utxo_outputs o
         SET spent = TRUE, spent_by_txid = s.spent_by_txid, spent_by_vin = s.spent_by_vin
         FROM UNNEST($2::TEXT[], $3::INT[], $4::TEXT[], $5::INT[])
              AS s(txid, vout_index, spent_by_txid, spent_by_vin)
         WHERE o.chain_id = $1 AND o.txid = s.txid AND o.vout_index = s.vout_index
           AND o.spent = FALSE",
    )
    .bind(chain_id)
    .bind(&txids)
    .bind(&vouts)
    .bind(&spenders)
    .bind(&vins)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Catch-up persists blocks out of order, so a spending input can land
/// before the output it references. Once this block's outputs exist, apply
/// any such earlier-persisted spends: mark the output, resolve the input and
/// fill the sender left empty on the spending transaction.
async fn reconcile_early_spends(
    conn: &mut PgConnection,
    chain_id: i64,
    block_number: i64,
) -> eyre::Result<()> {
    sqlx::query(
        "UPDATE utxo_outputs o
         SET spent = TRUE, spent_by_txid = i.txid, spent_by_vin = i.vin_index
         FROM utxo_inputs i
         WHERE o.chain_id = $1 AND o.block_number = $2 AND o.spent = FALSE
           AND i.chain_id = o.chain_id AND i.prev_txid = o.txid AND i.prev_vout = o.vout_index",
    )
    .bind(chain_id)
    .bind(block_number)
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        "UPDATE utxo_inputs i
         SET address = o.address,
             amount = CASE WHEN o.is_confidential THEN NULL ELSE o.amount END
         FROM utxo_outputs o
         WHERE o.chain_id = $1 AND o.block_number = $2
           AND i.chain_id = o.chain_id AND i.prev_txid = o.txid AND i.prev_vout = o.vout_index
           AND i.address IS NULL AND i.amount IS NULL",
    )
    .bind(chain_id)
    .bind(block_number)
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        "WITH senders AS (
             SELECT DISTINCT ON (i.txid) i.txid, i.address
             FROM utxo_inputs i
             JOIN utxo_outputs o
               ON o.chain_id = i.chain_id AND o.txid = i.prev_txid AND o.vout_index = i.prev_vout
             WHERE o.chain_id = $1 AND o.block_number = $2 AND i.address IS NOT NULL
             ORDER BY i.txid, i.vin_index
         ), filled_transfers AS (
             UPDATE asset_transfers t
             SET from_address = s.address
             FROM senders s
             WHERE t.chain_id = $1 AND t.tx_hash = s.txid AND t.transfer_type = 'utxo'
               AND t.from_address IS NULL
         )
         UPDATE transactions x
         SET from_address = s.address
         FROM senders s
         WHERE x.chain_id = $1 AND x.tx_hash = s.txid AND x.from_address IS NULL",
    )
    .bind(chain_id)
    .bind(block_number)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

async fn enqueue_tokens(
    conn: &mut PgConnection,
    chain_id: i64,
    block_number: i64,
    addresses: &[&String],
) -> eyre::Result<()> {
    for chunk in addresses.chunks(CHUNK_SIZE) {
        let mut query_builder: sqlx::QueryBuilder<sqlx::Postgres> =
            sqlx::QueryBuilder::new("INSERT INTO tokens (chain_id, address, first_seen_block) ");

        query_builder.push_values(chunk, |mut b, address| {
            b.push_bind(chain_id)
                .push_bind(address.as_str())
                .push_bind(block_number);
        });

        query_builder.push(" ON CONFLICT (chain_id, address) DO NOTHING");
        query_builder.build().execute(&mut *conn).await?;
    }

    Ok(())
}

// ============================================================
// Cursor & status
// ============================================================

fn cursor_from_row(row: &sqlx::postgres::PgRow) -> eyre::Result<Cursor> {
    let status: String = row.try_get("status")?;
    let mode: Option<String> = row.try_get("mode")?;
    Ok(Cursor {
        chain_id: row.try_get("chain_id")?,
        last_indexed_block: row.try_get("last_indexed_block")?,
        status: CursorStatus::parse(&status),
        mode: mode.as_deref().and_then(SchedulerMode::parse),
        error_message: row.try_get("error_message")?,
        updated_at: row.try_get("updated_at")?,
    })
}

async fn fetch_counts(pool: &PgPool, chain_id: i64) -> eyre::Result<ChainCounts> {
    let (blocks, transactions, transfers): (i64, i64, i64) = sqlx::query_as(
        "SELECT (SELECT COUNT(*) FROM blocks WHERE chain_id = $1),
                (SELECT COUNT(*) FROM transactions WHERE chain_id = $1)
                  + (SELECT COUNT(*) FROM extrinsics WHERE chain_id = $1),
                (SELECT COUNT(*) FROM asset_transfers WHERE chain_id = $1)",
    )
    .bind(chain_id)
    .fetch_one(pool)
    .await?;

    Ok(ChainCounts {
        blocks,
        transactions,
        transfers,
    })
}

fn transfer_from_row(row: &sqlx::postgres::PgRow) -> eyre::Result<AssetTransfer> {
    let transfer_type: String = row.try_get("transfer_type")?;
    let block_timestamp: DateTime<Utc> = row.try_get("block_timestamp")?;
    let amount: BigDecimal = row.try_get("amount")?;
    Ok(AssetTransfer {
        chain_id: row.try_get("chain_id")?,
        block_number: row.try_get("block_number")?,
        block_timestamp,
        tx_hash: row.try_get("tx_hash")?,
        transfer_type: transfer_type.parse()?,
        token_address: row.try_get("token_address")?,
        from_address: row.try_get("from_address")?,
        to_address: row.try_get("to_address")?,
        amount,
        token_id: row.try_get("token_id")?,
        log_index: row.try_get("log_index")?,
        trace_index: row.try_get("trace_index")?,
        confidential: row.try_get("confidential")?,
        privacy_protocol: row.try_get("privacy_protocol")?,
    })
}

#[async_trait]
impl Store for PgStore {
    /// Seed the chain_configs/chain_endpoints tables from config (idempotent).
    async fn seed_chain(&self, chain: &ChainConfig) -> eyre::Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO chain_configs (chain_id, name, chain_type, poll_interval_secs, \
             blocks_per_batch, catchup_parallel_batches, finality_tag, confirmation_depth, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
             ON CONFLICT (chain_id) DO UPDATE
             SET name = $2, chain_type = $3, poll_interval_secs = $4, blocks_per_batch = $5,
                 catchup_parallel_batches = $6, finality_tag = $7, confirmation_depth = $8,
                 updated_at = NOW()",
        )
        .bind(chain.chain_id as i64)
        .bind(&chain.name)
        .bind(chain.chain_type.as_str())
        .bind(chain.poll_interval_secs as i64)
        .bind(chain.blocks_per_batch as i64)
        .bind(chain.catchup_parallel_batches.map(|n| n as i32))
        .bind(&chain.finality_tag)
        .bind(chain.confirmation_depth as i64)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM chain_endpoints WHERE chain_id = $1")
            .bind(chain.chain_id as i64)
            .execute(&mut *tx)
            .await?;

        for endpoint in &chain.endpoints {
            let kind = match endpoint.kind {
                EndpointKind::JsonRpc => "json_rpc",
                EndpointKind::Rest => "rest",
            };
            sqlx::query(
                "INSERT INTO chain_endpoints (chain_id, url, kind, priority, rate_limit)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (chain_id, url) DO UPDATE
                 SET kind = $3, priority = $4, rate_limit = $5",
            )
            .bind(chain.chain_id as i64)
            .bind(&endpoint.url)
            .bind(kind)
            .bind(endpoint.priority as i32)
            .bind(endpoint.requests_per_second() as i32)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn save_capabilities(&self, chain_id: i64, flags: &CapabilityFlags) -> eyre::Result<()> {
        sqlx::query(
            "UPDATE chain_configs
             SET trace_supported = $2, trace_method = $3, block_receipts_supported = $4,
                 updated_at = NOW()
             WHERE chain_id = $1",
        )
        .bind(chain_id)
        .bind(flags.trace_supported)
        .bind(&flags.trace_method)
        .bind(flags.block_receipts_supported)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_capabilities(&self, chain_id: i64) -> eyre::Result<CapabilityFlags> {
        let row: Option<(Option<bool>, Option<String>, Option<bool>)> = sqlx::query_as(
            "SELECT trace_supported, trace_method, block_receipts_supported
             FROM chain_configs WHERE chain_id = $1",
        )
        .bind(chain_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row
            .map(
                |(trace_supported, trace_method, block_receipts_supported)| CapabilityFlags {
                    trace_supported,
                    trace_method,
                    block_receipts_supported,
                },
            )
            .unwrap_or_default())
    }

    async fn get_cursor(&self, chain_id: i64) -> eyre::Result<Option<Cursor>> {
        let row = sqlx::query(
            "SELECT chain_id, last_indexed_block, status, mode, error_message, updated_at
             FROM indexer_cursors WHERE chain_id = $1",
        )
        .bind(chain_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(cursor_from_row).transpose()
    }

    async fn init_cursor(&self, chain_id: i64, last_indexed_block: i64) -> eyre::Result<()> {
        sqlx::query(
            "INSERT INTO indexer_cursors (chain_id, last_indexed_block, status, updated_at)
             VALUES ($1, $2, 'stopped', NOW())
             ON CONFLICT (chain_id) DO NOTHING",
        )
        .bind(chain_id)
        .bind(last_indexed_block)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn reset_cursor(&self, chain_id: i64, last_indexed_block: i64) -> eyre::Result<()> {
        sqlx::query(
            "UPDATE indexer_cursors
             SET last_indexed_block = $2, error_message = NULL, updated_at = NOW()
             WHERE chain_id = $1",
        )
        .bind(chain_id)
        .bind(last_indexed_block)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_status(
        &self,
        chain_id: i64,
        status: CursorStatus,
        mode: Option<SchedulerMode>,
        error_message: Option<&str>,
    ) -> eyre::Result<()> {
        sqlx::query(
            "UPDATE indexer_cursors
             SET status = $2, mode = $3, error_message = $4, updated_at = NOW()
             WHERE chain_id = $1",
        )
        .bind(chain_id)
        .bind(status.as_str())
        .bind(mode.map(|m| m.as_str()))
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn advance_cursor(&self, chain_id: i64, block_number: i64) -> eyre::Result<()> {
        sqlx::query(
            "UPDATE indexer_cursors
             SET last_indexed_block = GREATEST(last_indexed_block, $2), updated_at = NOW()
             WHERE chain_id = $1",
        )
        .bind(chain_id)
        .bind(block_number)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn persist_block(&self, bundle: &BlockBundle) -> eyre::Result<()> {
        let chain_id = bundle.block.chain_id;
        let mut tx = self.pool.begin().await?;

        insert_block(&mut tx, &bundle.block).await?;
        insert_transactions_batch(&mut tx, &bundle.transactions).await?;
        insert_logs_batch(&mut tx, &bundle.logs).await?;
        insert_extrinsics_batch(&mut tx, &bundle.extrinsics).await?;
        insert_events_batch(&mut tx, &bundle.events).await?;
        insert_utxo_outputs_batch(&mut tx, &bundle.utxo_outputs).await?;
        insert_utxo_inputs_batch(&mut tx, &bundle.utxo_inputs).await?;
        mark_outputs_spent(&mut tx, chain_id, &bundle.spent_outputs).await?;
        insert_transfers_batch(&mut tx, &bundle.transfers).await?;
        if !bundle.utxo_outputs.is_empty() {
            reconcile_early_spends(&mut tx, chain_id, bundle.block.number).await?;
        }

        let tokens: Vec<&String> = bundle.token_addresses.iter().collect();
        enqueue_tokens(&mut tx, chain_id, bundle.block.number, &tokens).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn lookup_outputs(
        &self,
        chain_id: i64,
        refs: &[OutputRef],
    ) -> eyre::Result<HashMap<OutputRef, UtxoOutput>> {
        let mut found = HashMap::with_capacity(refs.len());
        if refs.is_empty() {
            return Ok(found);
        }

        let txids: Vec<&str> = refs.iter().map(|(txid, _)| txid.as_str()).collect();
        let vouts: Vec<i32> = refs.iter().map(|(_, vout)| *vout).collect();

        let rows = sqlx::query(
            "SELECT o.chain_id, o.txid, o.vout_index, o.block_number, o.amount, o.script_type,
                    o.address, o.spent, o.spent_by_txid, o.spent_by_vin, o.is_confidential
             FROM utxo_outputs o
             JOIN UNNEST($2::TEXT[], $3::INT[]) AS r(txid, vout_index)
               ON o.txid = r.txid AND o.vout_index = r.vout_index
             WHERE o.chain_id = $1",
        )
        .bind(chain_id)
        .bind(&txids)
        .bind(&vouts)
        .fetch_all(&self.pool)
        .await?;

        for row in rows {
            let output = UtxoOutput {
                chain_id: row.try_get("chain_id")?,
                txid: row.try_get("txid")?,
                vout_index: row.try_get("vout_index")?,
                block_number: row.try_get("block_number")?,
                amount: row.try_get("amount")?,
                script_type: row.try_get("script_type")?,
                address: row.try_get("address")?,
                spent: row.try_get("spent")?,
                spent_by_txid: row.try_get("spent_by_txid")?,
                spent_by_vin: row.try_get("spent_by_vin")?,
                is_confidential: row.try_get("is_confidential")?,
            };
            found.insert((output.txid.clone(), output.vout_index), output);
        }

        Ok(found)
    }

    async fn chain_status(&self, chain_id: i64) -> eyre::Result<Option<ChainStatus>> {
        let Some(cursor) = self.get_cursor(chain_id).await? else {
            return Ok(None);
        };
        let counts = fetch_counts(&self.pool, chain_id).await?;

        Ok(Some(ChainStatus {
            chain_id,
            status: cursor.status,
            mode: cursor.mode,
            last_indexed_block: cursor.last_indexed_block,
            error_message: cursor.error_message,
            updated_at: cursor.updated_at,
            counts,
        }))
    }

    async fn list_statuses(&self) -> eyre::Result<Vec<ChainStatus>> {
        let chain_ids: Vec<(i64,)> =
            sqlx::query_as("SELECT chain_id FROM indexer_cursors ORDER BY chain_id")
                .fetch_all(&self.pool)
                .await?;

        let mut statuses = Vec::with_capacity(chain_ids.len());
        for (chain_id,) in chain_ids {
            if let Some(status) = self.chain_status(chain_id).await? {
                statuses.push(status);
            }
        }
        Ok(statuses)
    }

    async fn list_transfers(&self, query: &TransferQuery) -> eyre::Result<Vec<AssetTransfer>> {
        let mut qb: sqlx::QueryBuilder<sqlx::Postgres> = sqlx::QueryBuilder::new(
            "SELECT chain_id, block_number, block_timestamp, tx_hash, transfer_type, \
             token_address, from_address, to_address, amount, token_id, log_index, \
             trace_index, confidential, privacy_protocol FROM asset_transfers WHERE TRUE",
        );

        if let Some(chain_id) = query.chain_id {
            qb.push(" AND chain_id = ").push_bind(chain_id);
        }
        if let Some(from_block) = query.from_block {
            qb.push(" AND block_number >= ").push_bind(from_block);
        }
        if let Some(to_block) = query.to_block {
            qb.push(" AND block_number <= ").push_bind(to_block);
        }
        if let Some(address) = &query.address {
            qb.push(" AND (from_address = ")
                .push_bind(address.clone())
                .push(" OR to_address = ")
                .push_bind(address.clone())
                .push(")");
        }

        qb.push(" ORDER BY chain_id, block_number, log_index, trace_index LIMIT ")
            .push_bind(query.limit)
            .push(" OFFSET ")
            .push_bind(query.offset);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(transfer_from_row).collect()
    }
}
