use alloy::primitives::{Address, Bytes, Log, B256, U256};
use alloy::sol_types::SolEvent;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::indexer::types::TransferType;

use super::{address_hex, ContractReader, DecodeContext, EvmLog, LogDecoder, TransferSink};

// Both protocols name the event `Swap`; the modules keep the generated
// types apart.
mod v2 {
    alloy::sol! {
        event Swap(
            address indexed sender,
            uint256 amount0In,
            uint256 amount1In,
            uint256 amount0Out,
            uint256 amount1Out,
            address indexed to
        );
    }
}

mod v3 {
    alloy::sol! {
        event Swap(
            address indexed sender,
            address indexed recipient,
            int256 amount0,
            int256 amount1,
            uint160 sqrtPriceX96,
            uint128 liquidity,
            int24 tick
        );
    }
}

/// `token0()` selector.
const TOKEN0: [u8; 4] = [0x0d, 0xfe, 0x16, 0x81];
/// `token1()` selector.
const TOKEN1: [u8; 4] = [0xd2, 0x12, 0x20, 0xa7];

/// One side of a swap as seen by the pool.
struct Leg {
    transfer_type: TransferType,
    token: Option<Address>,
    from: Address,
    to: Address,
    amount: U256,
}

/// Uniswap V2/V3 `Swap`, split into a `swap_in` leg (trader to pool) and a
/// `swap_out` leg (pool to recipient).
///
/// Pool tokens come from `token0()`/`token1()` reads, cached per pool. A
/// failed or skipped read leaves the token null but still emits the legs.
pub struct SwapDecoder {
    pools: Mutex<HashMap<Address, (Address, Address)>>,
}

impl SwapDecoder {
    pub fn new() -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, pool: Address) -> Option<(Address, Address)> {
        let pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
        pools.get(&pool).copied()
    }

    async fn pool_tokens(&self, ctx: &DecodeContext<'_>, pool: Address) -> Option<(Address, Address)> {
        if let Some(tokens) = self.cached(pool) {
            return Some(tokens);
        }
        let reader = ctx.reader?;

        let token0 = read_address(reader, pool, TOKEN0, ctx.block_number).await?;
        let token1 = read_address(reader, pool, TOKEN1, ctx.block_number).await?;

        let mut pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
        pools.insert(pool, (token0, token1));
        Some((token0, token1))
    }
}

impl Default for SwapDecoder {
    fn default() -> Self {
        Self::new()
    }
}

async fn read_address(
    reader: &dyn ContractReader,
    pool: Address,
    selector: [u8; 4],
    block: u64,
) -> Option<Address> {
    match reader.call(pool, Bytes::from(selector.to_vec()), block).await {
        Ok(ret) if ret.len() >= 32 => Some(Address::from_slice(&ret[12..32])),
        Ok(_) => None,
        Err(e) => {
            tracing::debug!(pool = %pool, error = %e, "Pool token lookup failed");
            None
        }
    }
}

#[async_trait]
impl LogDecoder for SwapDecoder {
    fn name(&self) -> &'static str {
        "uniswap_swap"
    }

    fn topics(&self) -> Vec<B256> {
        vec![v2::Swap::SIGNATURE_HASH, v3::Swap::SIGNATURE_HASH]
    }

    async fn decode(&self, ctx: &DecodeContext<'_>, log: &EvmLog, sink: &mut TransferSink) {
        let Some(inner) = Log::new(log.address, log.topics.clone(), log.data.clone()) else {
            return;
        };
        let pool = log.address;

        // (trader, recipient, token0 is the input side, amount in, amount out)
        let (sender, recipient, zero_in, amount_in, amount_out) =
            if log.topics[0] == v2::Swap::SIGNATURE_HASH {
                let Ok(decoded) = v2::Swap::decode_log(&inner) else {
                    return;
                };
                if decoded.amount0In > U256::ZERO {
                    (decoded.sender, decoded.to, true, decoded.amount0In, decoded.amount1Out)
                } else {
                    (decoded.sender, decoded.to, false, decoded.amount1In, decoded.amount0Out)
                }
            } else {
                let Ok(decoded) = v3::Swap::decode_log(&inner) else {
                    return;
                };
                // Positive amounts flow into the pool.
                if decoded.amount0.is_positive() {
                    (
                        decoded.sender,
                        decoded.recipient,
                        true,
                        decoded.amount0.unsigned_abs(),
                        decoded.amount1.unsigned_abs(),
                    )
                } else {
                    (
                        decoded.sender,
                        decoded.recipient,
                        false,
                        decoded.amount1.unsigned_abs(),
                        decoded.amount0.unsigned_abs(),
                    )
                }
            };

        let tokens = self.pool_tokens(ctx, pool).await;
        let (token_in, token_out) = match tokens {
            Some((t0, t1)) if zero_in => (Some(t0), Some(t1)),
            Some((t0, t1)) => (Some(t1), Some(t0)),
            None => (None, None),
        };

        let legs = [
            Leg {
                transfer_type: TransferType::SwapIn,
                token: token_in,
                from: sender,
                to: pool,
                amount: amount_in,
            },
            Leg {
                transfer_type: TransferType::SwapOut,
                token: token_out,
                from: pool,
                to: recipient,
                amount: amount_out,
            },
        ];

        for leg in legs {
            let mut transfer = ctx.transfer(log.tx_hash, leg.transfer_type, leg.amount);
            transfer.token_address = leg.token.map(address_hex);
            transfer.from_address = Some(address_hex(leg.from));
            transfer.to_address = Some(address_hex(leg.to));
            transfer.log_index = log.log_index;
            if let Some(token) = leg.token {
                sink.note_token(token);
            }
            sink.push(transfer);
        }
    }
}
