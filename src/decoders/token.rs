use alloy::primitives::{Address, B256, U256};
use alloy::sol;
use alloy::sol_types::SolEvent;
use async_trait::async_trait;

use crate::indexer::types::TransferType;

use super::{address_hex, DecodeContext, EvmLog, LogDecoder, TransferSink};

// ERC-20 and ERC-721 share this signature; ERC-721 indexes the third field.
sol! {
    event Transfer(address indexed from, address indexed to, uint256 value);
}

/// ERC-20 / ERC-721 `Transfer`.
///
/// Three topics means ERC-20 with the amount in data. Four topics means
/// ERC-721 with the token id in topic 3 and an amount of one.
pub struct TokenTransferDecoder;

#[async_trait]
impl LogDecoder for TokenTransferDecoder {
    fn name(&self) -> &'static str {
        "erc20_erc721_transfer"
    }

    fn topics(&self) -> Vec<B256> {
        vec![Transfer::SIGNATURE_HASH]
    }

    async fn decode(&self, ctx: &DecodeContext<'_>, log: &EvmLog, sink: &mut TransferSink) {
        let topics = &log.topics;
        let (transfer_type, amount, token_id) = match topics.len() {
            3 => {
                let data = log.data.as_ref();
                if data.len() < 32 {
                    return;
                }
                (TransferType::Erc20, U256::from_be_slice(&data[..32]), None)
            }
            4 => {
                let token_id = U256::from_be_bytes(topics[3].0);
                (TransferType::Erc721, U256::from(1), Some(token_id.to_string()))
            }
            _ => return,
        };

        let mut transfer = ctx.transfer(log.tx_hash, transfer_type, amount);
        transfer.token_address = Some(address_hex(log.address));
        transfer.from_address = Some(address_hex(Address::from_word(topics[1])));
        transfer.to_address = Some(address_hex(Address::from_word(topics[2])));
        transfer.token_id = token_id;
        transfer.log_index = log.log_index;

        sink.note_token(log.address);
        sink.push(transfer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoders::test_support::{ctx, log, word};
    use bigdecimal::BigDecimal;

    fn transfer_topics() -> Vec<B256> {
        vec![
            Transfer::SIGNATURE_HASH,
            Address::repeat_byte(0x01).into_word(),
            Address::repeat_byte(0x02).into_word(),
        ]
    }

    #[tokio::test]
    async fn test_three_topics_is_erc20() {
        let raw = log(Address::repeat_byte(0xaa), transfer_topics(), word(100).to_vec());
        let mut sink = TransferSink::default();
        TokenTransferDecoder.decode(&ctx(None), &raw, &mut sink).await;

        assert_eq!(sink.transfers.len(), 1);
        let t = &sink.transfers[0];
        assert_eq!(t.transfer_type, TransferType::Erc20);
        assert_eq!(t.amount, BigDecimal::from(100));
        assert_eq!(t.token_id, None);
        assert_eq!(t.log_index, 3);
        assert_eq!(t.trace_index, -1);
        assert_eq!(
            t.from_address.as_deref(),
            Some("0x0101010101010101010101010101010101010101")
        );
        assert!(sink.tokens.contains("0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"));
    }

    #[tokio::test]
    async fn test_four_topics_is_erc721() {
        let mut topics = transfer_topics();
        topics.push(B256::from(word(42)));
        let raw = log(Address::repeat_byte(0xaa), topics, vec![]);
        let mut sink = TransferSink::default();
        TokenTransferDecoder.decode(&ctx(None), &raw, &mut sink).await;

        let t = &sink.transfers[0];
        assert_eq!(t.transfer_type, TransferType::Erc721);
        assert_eq!(t.amount, BigDecimal::from(1));
        assert_eq!(t.token_id.as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn test_short_data_is_skipped() {
        let raw = log(Address::repeat_byte(0xaa), transfer_topics(), vec![0u8; 16]);
        let mut sink = TransferSink::default();
        TokenTransferDecoder.decode(&ctx(None), &raw, &mut sink).await;
        assert!(sink.transfers.is_empty());
        assert!(sink.tokens.is_empty());
    }

    #[tokio::test]
    async fn test_amount_beyond_u64() {
        let mut data = [0u8; 32];
        data[0] = 0x01;
        let raw = log(Address::repeat_byte(0xaa), transfer_topics(), data.to_vec());
        let mut sink = TransferSink::default();
        TokenTransferDecoder.decode(&ctx(None), &raw, &mut sink).await;

        let expected: BigDecimal = (U256::from(1) << 248usize).to_string().parse().unwrap();
        assert_eq!(sink.transfers[0].amount, expected);
    }
}
