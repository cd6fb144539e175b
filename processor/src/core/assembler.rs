//! Packs executed transactions into a signed block.
//!
//! Admission (size, count, deadline) has already happened in the mining
//! loop by the time a block is assembled; this module only concatenates
//! the canonical packed forms in block order and signs the result.

use ledger_common::{
    block::Block,
    crypto::{Hash, PrivateKey},
    time::TimestampMillis,
    transaction::PendingTransaction,
};

/// Build and sign the block `block_id` on top of `previous_block_hash`.
///
/// `transactions` must already be in block order: `position_in_block` of
/// the status rows indexes into exactly this sequence.
pub fn sign_block(
    block_id: i64,
    previous_block_hash: Hash,
    processed_ts: TimestampMillis,
    transactions: &[&PendingTransaction],
    key: &PrivateKey,
    sign_prefix: &[u8],
) -> Block {
    let total: usize = transactions.iter().map(|tx| tx.packed_size()).sum();
    let mut packed = Vec::with_capacity(total);
    for tx in transactions {
        packed.extend_from_slice(&tx.pack());
    }
    Block::sign(
        block_id,
        previous_block_hash,
        processed_ts,
        packed,
        transactions.len() as u16,
        key,
        sign_prefix,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_common::{
        config::TRANSACTION_VERSION,
        crypto::Signature,
        transaction::{EMPTY_TX_LENGTH, TRANSACTION_ID_SIZE},
    };

    const PREFIX: &[u8] = b"testchain";

    fn tx_with_id(key: &PrivateKey, id: u8, payload: &str) -> PendingTransaction {
        let mut tx = PendingTransaction {
            transaction_id: [id; TRANSACTION_ID_SIZE],
            version: TRANSACTION_VERSION,
            contract_hash: Hash::zero(),
            valid_till: 0,
            payload: payload.to_string(),
            public_key: *key.public_key(),
            signature: Signature::from_bytes([0u8; 64]),
            create_ts: id as i64,
        };
        tx.signature = key.sign(&tx.signing_payload(PREFIX));
        tx
    }

    #[test]
    fn test_packed_concatenation() {
        let key = PrivateKey::generate();
        let a = tx_with_id(&key, 1, "{\"a\":1}");
        let b = tx_with_id(&key, 2, "{\"b\":22}");

        let block = sign_block(0, Hash::zero(), 1_000, &[&a, &b], &key, PREFIX);
        assert_eq!(block.transactions_amount, 2);
        assert_eq!(
            block.transactions.len(),
            a.packed_size() + b.packed_size()
        );
        // first packed transaction sits at offset 0
        assert_eq!(&block.transactions[..a.packed_size()], a.pack().as_slice());
        assert_eq!(&block.transactions[a.packed_size()..], b.pack().as_slice());
        assert!(block.verify(key.public_key(), PREFIX));
    }

    #[test]
    fn test_empty_heartbeat_block() {
        let key = PrivateKey::generate();
        let block = sign_block(5, Hash::max(), 2_000, &[], &key, PREFIX);
        assert_eq!(block.transactions_amount, 0);
        assert!(block.transactions.is_empty());
        assert!(block.verify(key.public_key(), PREFIX));
    }

    #[test]
    fn test_order_changes_hash() {
        let key = PrivateKey::generate();
        let a = tx_with_id(&key, 1, "{}");
        let b = tx_with_id(&key, 2, "{}");
        let ab = sign_block(0, Hash::zero(), 1_000, &[&a, &b], &key, PREFIX);
        let ba = sign_block(0, Hash::zero(), 1_000, &[&b, &a], &key, PREFIX);
        assert_ne!(ab.hash(PREFIX), ba.hash(PREFIX));
    }

    #[test]
    fn test_size_accounting_matches_empty_length() {
        let key = PrivateKey::generate();
        let tx = tx_with_id(&key, 3, "{\"n\":5}");
        assert_eq!(tx.packed_size(), EMPTY_TX_LENGTH + tx.payload.len());
        assert_eq!(tx.pack().len(), tx.packed_size());
    }
}
