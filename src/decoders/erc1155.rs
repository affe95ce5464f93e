use alloy::primitives::{Address, B256, U256};
use alloy::sol;
use alloy::sol_types::SolEvent;
use async_trait::async_trait;

use crate::indexer::types::TransferType;

use super::{address_hex, DecodeContext, EvmLog, LogDecoder, TransferSink};

sol! {
    event TransferSingle(
        address indexed operator,
        address indexed from,
        address indexed to,
        uint256 id,
        uint256 value
    );

    event TransferBatch(
        address indexed operator,
        address indexed from,
        address indexed to,
        uint256[] ids,
        uint256[] values
    );
}

/// Upper bound on items per `TransferBatch`; larger arrays are treated as
/// malformed.
pub const MAX_BATCH_ITEMS: usize = 1024;

pub struct Erc1155Decoder;

#[async_trait]
impl LogDecoder for Erc1155Decoder {
    fn name(&self) -> &'static str {
        "erc1155"
    }

    fn topics(&self) -> Vec<B256> {
        vec![TransferSingle::SIGNATURE_HASH, TransferBatch::SIGNATURE_HASH]
    }

    async fn decode(&self, ctx: &DecodeContext<'_>, log: &EvmLog, sink: &mut TransferSink) {
        if log.topics.len() != 4 {
            return;
        }
        let data = log.data.as_ref();

        // (token id, amount, trace_index)
        let items: Vec<(U256, U256, i32)> = if log.topics[0] == TransferSingle::SIGNATURE_HASH {
            let (Some(id), Some(value)) = (read_word(data, 0), read_word(data, 32)) else {
                return;
            };
            vec![(id, value, -1)]
        } else {
            let Some((ids, values)) = decode_batch(data) else {
                return;
            };
            ids.into_iter()
                .zip(values)
                .enumerate()
                .map(|(seq, (id, value))| (id, value, seq as i32))
                .collect()
        };

        let from = address_hex(Address::from_word(log.topics[2]));
        let to = address_hex(Address::from_word(log.topics[3]));

        for (id, value, trace_index) in items {
            let mut transfer = ctx.transfer(log.tx_hash, TransferType::Erc1155, value);
            transfer.token_address = Some(address_hex(log.address));
            transfer.from_address = Some(from.clone());
            transfer.to_address = Some(to.clone());
            transfer.token_id = Some(id.to_string());
            transfer.log_index = log.log_index;
            transfer.trace_index = trace_index;
            sink.push(transfer);
        }
        sink.note_token(log.address);
    }
}

fn read_word(data: &[u8], offset: usize) -> Option<U256> {
    let end = offset.checked_add(32)?;
    data.get(offset..end).map(U256::from_be_slice)
}

fn read_usize(data: &[u8], offset: usize) -> Option<usize> {
    usize::try_from(read_word(data, offset)?).ok()
}

/// Decode one length-prefixed `uint256[]` whose head word sits at `head`.
fn read_array(data: &[u8], head: usize) -> Option<Vec<U256>> {
    let offset = read_usize(data, head)?;
    let len = read_usize(data, offset)?;
    if len > MAX_BATCH_ITEMS {
        return None;
    }
    let start = offset.checked_add(32)?;
    let end = start.checked_add(len.checked_mul(32)?)?;
    if end > data.len() {
        return None;
    }
    (0..len).map(|i| read_word(data, start + i * 32)).collect()
}

/// `(ids, values)` of a `TransferBatch` payload. Any bounds violation or a
/// length mismatch rejects the whole payload.
fn decode_batch(data: &[u8]) -> Option<(Vec<U256>, Vec<U256>)> {
    let ids = read_array(data, 0)?;
    let values = read_array(data, 32)?;
    if ids.len() != values.len() {
        return None;
    }
    Some((ids, values))
}
