use alloy::primitives::{Address, B256, U256};
use alloy::sol;
use alloy::sol_types::SolEvent;
use async_trait::async_trait;

use crate::indexer::types::TransferType;

use super::{address_hex, DecodeContext, EvmLog, LogDecoder, TransferSink};

sol! {
    event Deposit(address indexed dst, uint256 wad);
    event Withdrawal(address indexed src, uint256 wad);
}

/// WETH-style wrapping. A deposit mints from the zero address, a
/// withdrawal burns to it.
pub struct WethDecoder;

#[async_trait]
impl LogDecoder for WethDecoder {
    fn name(&self) -> &'static str {
        "weth"
    }

    fn topics(&self) -> Vec<B256> {
        vec![Deposit::SIGNATURE_HASH, Withdrawal::SIGNATURE_HASH]
    }

    async fn decode(&self, ctx: &DecodeContext<'_>, log: &EvmLog, sink: &mut TransferSink) {
        if log.topics.len() != 2 || log.data.len() < 32 {
            return;
        }
        let account = address_hex(Address::from_word(log.topics[1]));
        let zero = address_hex(Address::ZERO);
        let amount = U256::from_be_slice(&log.data[..32]);

        let (transfer_type, from, to) = if log.topics[0] == Deposit::SIGNATURE_HASH {
            (TransferType::Wrap, zero, account)
        } else {
            (TransferType::Unwrap, account, zero)
        };

        let mut transfer = ctx.transfer(log.tx_hash, transfer_type, amount);
        transfer.token_address = Some(address_hex(log.address));
        transfer.from_address = Some(from);
        transfer.to_address = Some(to);
        transfer.log_index = log.log_index;

        sink.note_token(log.address);
        sink.push(transfer);
    }
}
