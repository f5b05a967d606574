use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use log::info;
use serde::{Deserialize, Serialize};

use crate::errors::{NodeError, Result};
use crate::hashing::{be64, double_sha256};
use crate::merkle::MerkleTree;
use crate::transaction::Transaction;

/// Number of leading zero bits a block hash must carry. Part of the
/// header preimage, so it cannot be changed without re-mining the chain.
pub const DIFFICULTY: u64 = 12;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Block {
    timestamp: i64,
    transactions: Vec<Transaction>,
    prev_block_hash: Vec<u8>,
    hash: Vec<u8>,
    nonce: u32,
    height: u64,
}

impl Block {
    /// Creates and mines a block. Returns only once the nonce search
    /// found a hash below the target; CPU-bound and uninterruptible.
    pub fn new(transactions: Vec<Transaction>, prev_block_hash: Vec<u8>, height: u64) -> Result<Block> {
        let timestamp = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64;
        let mut block = Block {
            timestamp,
            transactions,
            prev_block_hash,
            hash: Vec::new(),
            nonce: 0,
            height,
        };
        block.run_proof_of_work()?;
        Ok(block)
    }

    /// The genesis block: height zero, no predecessor, a lone coinbase.
    pub fn new_genesis(coinbase: Transaction) -> Result<Block> {
        Block::new(vec![coinbase], Vec::new(), 0)
    }

    pub fn is_genesis(&self) -> bool {
        self.height == 0 && self.prev_block_hash.is_empty()
    }

    fn run_proof_of_work(&mut self) -> Result<()> {
        info!("mining block at height {}", self.height);
        let target = pow_target();
        loop {
            let hash = self.header_hash()?;
            if hash_meets_target(&hash, &target) {
                self.hash = hash;
                info!("found nonce {} for block {}", self.nonce, hex::encode(&self.hash));
                return Ok(());
            }
            self.nonce = self
                .nonce
                .checked_add(1)
                .ok_or_else(|| NodeError::InvalidBlock("nonce space exhausted".to_string()))?;
        }
    }

    /// Header preimage: decimal timestamp, previous hash, Merkle root over
    /// the serialised transactions, then nonce and difficulty big-endian.
    fn header_preimage(&self) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        data.extend_from_slice(self.timestamp.to_string().as_bytes());
        data.extend_from_slice(&self.prev_block_hash);
        data.extend_from_slice(&self.hash_transactions()?);
        data.extend_from_slice(&be64(self.nonce as i64));
        data.extend_from_slice(&be64(DIFFICULTY as i64));
        Ok(data)
    }

    fn header_hash(&self) -> Result<Vec<u8>> {
        Ok(double_sha256(&self.header_preimage()?))
    }

    fn hash_transactions(&self) -> Result<Vec<u8>> {
        let mut leaves = Vec::with_capacity(self.transactions.len());
        for tx in &self.transactions {
            leaves.push(tx.serialize()?);
        }
        Ok(MerkleTree::new(&leaves).root_hash().to_vec())
    }

    /// Re-derives the hash from the header and checks it against both the
    /// stored hash and the difficulty target.
    pub fn validate(&self) -> Result<bool> {
        let hash = self.header_hash()?;
        Ok(hash == self.hash && hash_meets_target(&hash, &pow_target()))
    }

    pub fn get_hash(&self) -> &[u8] {
        &self.hash
    }

    pub fn get_prev_hash(&self) -> &[u8] {
        &self.prev_block_hash
    }

    pub fn get_height(&self) -> u64 {
        self.height
    }

    pub fn get_transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn deserialize(data: &[u8]) -> Result<Block> {
        Ok(bincode::deserialize(data)?)
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Timestamp: {}", self.timestamp)?;
        writeln!(f, "Hash: {}", hex::encode(&self.hash))?;
        writeln!(f, "Prev. hash: {}", hex::encode(&self.prev_block_hash))?;
        writeln!(f, "Nonce: {}", self.nonce)?;
        writeln!(f, "Height: {}", self.height)?;
        for tx in &self.transactions {
            write!(f, "{}", tx)?;
        }
        Ok(())
    }
}

/// Big-endian `1 << (256 - DIFFICULTY)`. A hash is valid iff it is
/// strictly below this value.
pub fn pow_target() -> [u8; 32] {
    let mut target = [0u8; 32];
    let bit = 256 - DIFFICULTY as usize;
    target[31 - bit / 8] = 1 << (bit % 8);
    target
}

fn hash_meets_target(hash: &[u8], target: &[u8; 32]) -> bool {
    // byte-wise lexicographic order equals numeric order for equal-width
    // big-endian integers
    hash < &target[..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::Wallet;

    fn coinbase() -> Transaction {
        let wallet = Wallet::new().unwrap();
        Transaction::new_coinbase(&wallet.get_address(), "test".to_string()).unwrap()
    }

    #[test]
    fn target_has_expected_shape() {
        // difficulty 12 means bit 244, which lives in byte 1 of the
        // big-endian representation
        let target = pow_target();
        assert_eq!(target[0], 0);
        assert_eq!(target[1], 0x10);
        assert!(target[2..].iter().all(|&b| b == 0));
    }

    #[test]
    fn hash_target_comparison() {
        let target = pow_target();
        let mut below = [0u8; 32];
        below[1] = 0x0f;
        let mut above = [0u8; 32];
        above[0] = 0x01;
        assert!(hash_meets_target(&below, &target));
        assert!(!hash_meets_target(&above, &target));
        assert!(!hash_meets_target(&target.clone(), &target));
    }

    #[test]
    fn mined_block_validates() {
        let block = Block::new_genesis(coinbase()).unwrap();
        assert!(block.validate().unwrap());
        assert!(block.is_genesis());
        assert!(hash_meets_target(block.get_hash(), &pow_target()));
    }

    #[test]
    fn tampering_breaks_validation() {
        let mut block = Block::new_genesis(coinbase()).unwrap();
        block.timestamp += 1;
        assert!(!block.validate().unwrap());
    }

    #[test]
    fn serialization_round_trip() {
        let block = Block::new_genesis(coinbase()).unwrap();
        let restored = Block::deserialize(&block.serialize().unwrap()).unwrap();
        assert_eq!(restored, block);
    }

    #[test]
    fn coinbase_position_does_not_matter_for_validity() {
        // the chain appends the coinbase last, the CLI mines it first;
        // both orderings must produce a valid block
        let miner = Wallet::new().unwrap();
        let cb = Transaction::new_coinbase(&miner.get_address(), "a".to_string()).unwrap();
        let other = Transaction::new_coinbase(&miner.get_address(), "b".to_string()).unwrap();
        let first = Block::new(vec![cb.clone(), other.clone()], Vec::new(), 0).unwrap();
        let last = Block::new(vec![other, cb], Vec::new(), 0).unwrap();
        assert!(first.validate().unwrap());
        assert!(last.validate().unwrap());
    }
}
