use alloy::primitives::U256;

use crate::indexer::types::TransferType;

use super::{address_hex, BlockDecoder, BlockInput, DecodeContext, TransferSink};

const GWEI: u64 = 1_000_000_000;

/// Top-level transaction value. Reverted transactions moved nothing.
pub struct NativeValueDecoder;

impl BlockDecoder for NativeValueDecoder {
    fn name(&self) -> &'static str {
        "native"
    }

    fn decode(&self, ctx: &DecodeContext<'_>, input: &BlockInput<'_>, sink: &mut TransferSink) {
        for tx in input.transactions {
            if tx.value.is_zero() || tx.success == Some(false) {
                continue;
            }
            let mut transfer = ctx.transfer(tx.hash, TransferType::Native, tx.value);
            transfer.from_address = Some(address_hex(tx.from));
            transfer.to_address = tx.to.map(address_hex);
            sink.push(transfer);
        }
    }
}

/// Value moved by nested calls, taken from traces.
pub struct InternalValueDecoder;

impl BlockDecoder for InternalValueDecoder {
    fn name(&self) -> &'static str {
        "internal"
    }

    fn decode(&self, ctx: &DecodeContext<'_>, input: &BlockInput<'_>, sink: &mut TransferSink) {
        for call in input.internal_calls {
            if call.value.is_zero() {
                continue;
            }
            let mut transfer = ctx.transfer(call.tx_hash, TransferType::Internal, call.value);
            transfer.from_address = Some(address_hex(call.from));
            transfer.to_address = Some(address_hex(call.to));
            transfer.trace_index = call.trace_index;
            sink.push(transfer);
        }
    }
}

/// Consensus-layer withdrawals. They have no transaction, so rows hang off
/// the block hash and are told apart by their position in the block.
pub struct WithdrawalDecoder;

impl BlockDecoder for WithdrawalDecoder {
    fn name(&self) -> &'static str {
        "withdrawal"
    }

    fn decode(&self, ctx: &DecodeContext<'_>, input: &BlockInput<'_>, sink: &mut TransferSink) {
        for (position, withdrawal) in input.withdrawals.iter().enumerate() {
            if withdrawal.amount_gwei == 0 {
                continue;
            }
            let amount = U256::from(withdrawal.amount_gwei) * U256::from(GWEI);
            let mut transfer = ctx.transfer(ctx.block_hash, TransferType::Withdrawal, amount);
            transfer.to_address = Some(address_hex(withdrawal.address));
            transfer.trace_index = position as i32;
            sink.push(transfer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoders::test_support::ctx;
    use crate::decoders::{EvmTx, InternalCall, Withdrawal};
    use alloy::primitives::{Address, B256};
    use bigdecimal::BigDecimal;
    use std::collections::HashSet;
    use std::str::FromStr;

    fn input<'a>(
        transactions: &'a [EvmTx],
        withdrawals: &'a [Withdrawal],
        internal_calls: &'a [InternalCall],
    ) -> BlockInput<'a> {
        BlockInput {
            transactions,
            logs: &[],
            withdrawals,
            internal_calls,
        }
    }

    #[test]
    fn test_native_skips_failed_and_zero_value() {
        let txs = vec![
            EvmTx {
                hash: B256::repeat_byte(1),
                from: Address::repeat_byte(1),
                to: Some(Address::repeat_byte(2)),
                value: U256::from(10),
                success: Some(true),
            },
            EvmTx {
                hash: B256::repeat_byte(2),
                from: Address::repeat_byte(1),
                to: Some(Address::repeat_byte(2)),
                value: U256::from(10),
                success: Some(false),
            },
            EvmTx {
                hash: B256::repeat_byte(3),
                from: Address::repeat_byte(1),
                to: None,
                value: U256::ZERO,
                success: Some(true),
            },
        ];
        let mut sink = TransferSink::default();
        NativeValueDecoder.decode(&ctx(None), &input(&txs, &[], &[]), &mut sink);

        assert_eq!(sink.transfers.len(), 1);
        assert_eq!(sink.transfers[0].log_index, -1);
        assert_eq!(sink.transfers[0].trace_index, -1);
    }

    #[test]
    fn test_internal_rows_are_unique_per_frame() {
        let tx = B256::repeat_byte(7);
        let calls: Vec<InternalCall> = (0..3)
            .map(|i| InternalCall {
                tx_hash: tx,
                from: Address::repeat_byte(1),
                to: Address::repeat_byte(2),
                value: U256::from(1),
                trace_index: i,
            })
            .collect();
        let mut sink = TransferSink::default();
        InternalValueDecoder.decode(&ctx(None), &input(&[], &[], &calls), &mut sink);

        let keys: HashSet<_> = sink.transfers.iter().map(|t| t.unique_key()).collect();
        assert_eq!(keys.len(), 3);
        assert!(sink.transfers.iter().all(|t| t.log_index == -1));
    }

    #[test]
    fn test_withdrawal_converts_gwei() {
        let withdrawals = vec![Withdrawal {
            address: Address::repeat_byte(9),
            amount_gwei: 32_000_000_000,
        }];
        let mut sink = TransferSink::default();
        WithdrawalDecoder.decode(&ctx(None), &input(&[], &withdrawals, &[]), &mut sink);

        let t = &sink.transfers[0];
        assert_eq!(t.amount, BigDecimal::from_str("32000000000000000000").unwrap());
        assert_eq!(t.tx_hash, format!("0x{}", "bb".repeat(32)));
        assert_eq!(t.trace_index, 0);
        assert_eq!(t.from_address, None);
    }
}
