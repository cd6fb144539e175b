use std::fmt::{self, Display, Formatter};

use crate::{
    crypto::{sha256d, Hash, PrivateKey, PublicKey, Signature, SIGNATURE_SIZE},
    serializer::{Reader, ReaderError, Serializer, Writer},
    time::TimestampMillis,
};

/// A sealed block of the chain.
///
/// `transactions` is the concatenation of the packed transactions in block
/// order; `position_in_block` of each row indexes into that order. The
/// signature covers the canonical signing payload, which binds the chain's
/// sign prefix, so two chains can never share a block.
#[derive(Clone, Debug)]
pub struct Block {
    pub block_id: i64,
    pub version: u8,
    // All-zero for the genesis block
    pub previous_block_hash: Hash,
    pub processed_ts: TimestampMillis,
    pub transactions: Vec<u8>,
    pub transactions_amount: u16,
    pub signature: Signature,
}

impl Block {
    /// Sign a new block over the canonical payload.
    pub fn sign(
        block_id: i64,
        previous_block_hash: Hash,
        processed_ts: TimestampMillis,
        transactions: Vec<u8>,
        transactions_amount: u16,
        key: &PrivateKey,
        sign_prefix: &[u8],
    ) -> Self {
        let mut block = Block {
            block_id,
            version: crate::config::BLOCK_VERSION,
            previous_block_hash,
            processed_ts,
            transactions,
            transactions_amount,
            signature: Signature::from_bytes([0u8; SIGNATURE_SIZE]),
        };
        block.signature = key.sign(&block.signing_payload(sign_prefix));
        block
    }

    /// The bytes covered by the block signature:
    /// `prefix | previous hash | id | ts | packed txs | version | amount`.
    pub fn signing_payload(&self, sign_prefix: &[u8]) -> Vec<u8> {
        let mut writer =
            Writer::with_capacity(sign_prefix.len() + 32 + 8 + 8 + self.transactions.len() + 3);
        writer.write_bytes(sign_prefix);
        writer.write_hash(&self.previous_block_hash);
        writer.write_u64(self.block_id as u64);
        writer.write_u64(self.processed_ts as u64);
        writer.write_bytes(&self.transactions);
        writer.write_u8(self.version);
        writer.write_u16(self.transactions_amount);
        writer.bytes()
    }

    /// Double SHA-256 over the signing payload; the next block's
    /// `previous_block_hash`.
    pub fn hash(&self, sign_prefix: &[u8]) -> Hash {
        sha256d(&self.signing_payload(sign_prefix))
    }

    pub fn verify(&self, key: &PublicKey, sign_prefix: &[u8]) -> bool {
        key.verify(&self.signing_payload(sign_prefix), &self.signature)
    }

    pub fn is_genesis(&self) -> bool {
        self.block_id == 0
    }
}

impl Serializer for Block {
    fn write(&self, writer: &mut Writer) {
        writer.write_u64(self.block_id as u64);
        writer.write_u8(self.version);
        writer.write_hash(&self.previous_block_hash);
        writer.write_u64(self.processed_ts as u64);
        writer.write_u32(self.transactions.len() as u32);
        writer.write_bytes(&self.transactions);
        writer.write_u16(self.transactions_amount);
        writer.write_bytes(self.signature.as_bytes());
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let block_id = reader.read_u64()? as i64;
        let version = reader.read_u8()?;
        let previous_block_hash = reader.read_hash()?;
        let processed_ts = reader.read_u64()? as TimestampMillis;
        let transactions_len = reader.read_u32()? as usize;
        let transactions = reader.read_bytes(transactions_len)?.to_vec();
        let transactions_amount = reader.read_u16()?;
        let signature = Signature::from_slice(reader.read_bytes(SIGNATURE_SIZE)?)
            .map_err(|_| ReaderError::InvalidValue("signature"))?;
        Ok(Block {
            block_id,
            version,
            previous_block_hash,
            processed_ts,
            transactions,
            transactions_amount,
            signature,
        })
    }

    fn size(&self) -> usize {
        8 + 1 + 32 + 8 + 4 + self.transactions.len() + 2 + SIGNATURE_SIZE
    }
}

impl Display for Block {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Block[id: {}, previous: {}, timestamp: {}, txs: {}]",
            self.block_id,
            self.previous_block_hash,
            self.processed_ts,
            self.transactions_amount
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREFIX: &[u8] = b"testchain";

    #[test]
    fn test_sign_and_verify() {
        let key = PrivateKey::generate();
        let block = Block::sign(0, Hash::zero(), 1_000, Vec::new(), 0, &key, PREFIX);
        assert!(block.verify(key.public_key(), PREFIX));
        assert!(!block.verify(key.public_key(), b"otherchain"));
        assert!(!block.verify(PrivateKey::generate().public_key(), PREFIX));
    }

    #[test]
    fn test_hash_chains() {
        let key = PrivateKey::generate();
        let genesis = Block::sign(0, Hash::zero(), 1_000, Vec::new(), 0, &key, PREFIX);
        let next = Block::sign(1, genesis.hash(PREFIX), 1_001, Vec::new(), 0, &key, PREFIX);
        assert_eq!(next.previous_block_hash, genesis.hash(PREFIX));
        assert_ne!(next.hash(PREFIX), genesis.hash(PREFIX));
    }

    #[test]
    fn test_hash_covers_contents() {
        let key = PrivateKey::generate();
        let a = Block::sign(3, Hash::zero(), 1_000, vec![1, 2, 3], 1, &key, PREFIX);
        let b = Block::sign(3, Hash::zero(), 1_000, vec![1, 2, 4], 1, &key, PREFIX);
        assert_ne!(a.hash(PREFIX), b.hash(PREFIX));
    }

    #[test]
    fn test_serializer_roundtrip() {
        let key = PrivateKey::generate();
        let block = Block::sign(7, Hash::max(), 42, vec![9u8; 20], 2, &key, PREFIX);
        let back = Block::from_bytes(&block.to_bytes()).unwrap();
        assert_eq!(back.block_id, block.block_id);
        assert_eq!(back.previous_block_hash, block.previous_block_hash);
        assert_eq!(back.transactions, block.transactions);
        assert_eq!(back.hash(PREFIX), block.hash(PREFIX));
    }
}
