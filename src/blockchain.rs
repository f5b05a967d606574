use std::collections::HashMap;
use std::path::Path;

use log::{info, warn};
use sled::transaction::TransactionError;

use crate::block::Block;
use crate::errors::{NodeError, Result};
use crate::transaction::Transaction;
use crate::tx::TXOutputs;

/// Key holding the hash of the chain tip. All other keys in the block
/// keyspace are raw 32-byte block hashes.
const TIP_KEY: &[u8] = b"lhentry";

const GENESIS_DATA: &str =
    "The Times 03/Jan/2009: Chancellor on brink of second bailout for banks.";

fn db_path(node_id: &str) -> String {
    format!("./tmp/blocks_{}", node_id)
}

/// The chain store: a sled database mapping block hashes to serialised
/// blocks, plus the tip pointer. Each node id gets its own database.
#[derive(Clone)]
pub struct Blockchain {
    db: sled::Db,
    /// When set, a block whose parent is unknown is rejected instead of
    /// being allowed to capture the tip on height alone.
    strict_parent: bool,
}

pub struct BlockchainIter<'a> {
    current_hash: Vec<u8>,
    bc: &'a Blockchain,
}

impl Blockchain {
    /// Opens the existing chain for `node_id`. Fails with `NotFound` when
    /// no chain has been created yet.
    pub fn open(node_id: &str) -> Result<Blockchain> {
        Blockchain::open_at(&db_path(node_id))
    }

    pub fn open_at(path: &str) -> Result<Blockchain> {
        if !Path::new(path).exists() {
            return Err(NodeError::NotFound(
                "no blockchain found, create one first".to_string(),
            ));
        }
        let db = open_db(path)?;
        if db.get(TIP_KEY)?.is_none() {
            return Err(NodeError::NotFound(
                "no blockchain found, create one first".to_string(),
            ));
        }
        Ok(Blockchain {
            db,
            strict_parent: false,
        })
    }

    /// Creates a fresh chain for `node_id` and mines the genesis block,
    /// paying the reward to `address`.
    pub fn create(address: &str, node_id: &str) -> Result<Blockchain> {
        Blockchain::create_at(&db_path(node_id), address)
    }

    pub fn create_at(path: &str, address: &str) -> Result<Blockchain> {
        if Path::new(path).exists() {
            return Err(NodeError::Storage("blockchain already exists".to_string()));
        }
        let db = open_db(path)?;
        let cbtx = Transaction::new_coinbase(address, GENESIS_DATA.to_string())?;
        let genesis = Block::new_genesis(cbtx)?;
        commit_block(&db, &genesis, true)?;
        info!("genesis block created: {}", hex::encode(genesis.get_hash()));
        Ok(Blockchain {
            db,
            strict_parent: false,
        })
    }

    pub fn with_strict_parent(mut self, strict: bool) -> Blockchain {
        self.strict_parent = strict;
        self
    }

    pub(crate) fn db(&self) -> &sled::Db {
        &self.db
    }

    /// Appends a block received from a peer. A block already present is a
    /// logged no-op; the tip pointer only moves when the new block is
    /// strictly higher than the current tip.
    pub fn add_block(&self, block: Block) -> Result<()> {
        if self.db.get(block.get_hash())?.is_some() {
            info!("block {} already in the chain", hex::encode(block.get_hash()));
            return Ok(());
        }
        if !block.validate()? {
            return Err(NodeError::InvalidBlock(format!(
                "proof of work check failed for {}",
                hex::encode(block.get_hash())
            )));
        }
        if !block.is_genesis() {
            if block.get_prev_hash().is_empty() || block.get_height() == 0 {
                return Err(NodeError::InvalidBlock(
                    "non-genesis block without predecessor".to_string(),
                ));
            }
            if self.strict_parent && self.db.get(block.get_prev_hash())?.is_none() {
                return Err(NodeError::InvalidBlock(format!(
                    "unknown parent {}",
                    hex::encode(block.get_prev_hash())
                )));
            }
        }
        let tip = self.get_last_block()?;
        let move_tip = block.get_height() > tip.get_height();
        commit_block(&self.db, &block, move_tip)?;
        info!("added block {}", hex::encode(block.get_hash()));
        Ok(())
    }

    /// Verifies the given transactions, mines a block on top of the tip
    /// and commits it together with the new tip pointer.
    pub fn mine_block(&self, transactions: Vec<Transaction>) -> Result<Block> {
        for tx in &transactions {
            if !self.verify_transaction(tx)? {
                return Err(NodeError::InvalidTransaction(hex::encode(&tx.id)));
            }
        }
        let last_hash = self.get_last_hash()?;
        let last_height = self.get_best_height()?;
        let block = Block::new(transactions, last_hash, last_height + 1)?;
        commit_block(&self.db, &block, true)?;
        info!("mined new block {}", hex::encode(block.get_hash()));
        Ok(block)
    }

    pub fn get_last_hash(&self) -> Result<Vec<u8>> {
        Ok(self
            .db
            .get(TIP_KEY)?
            .ok_or_else(|| NodeError::NotFound("chain tip".to_string()))?
            .to_vec())
    }

    fn get_last_block(&self) -> Result<Block> {
        let last_hash = self.get_last_hash()?;
        self.get_block(&last_hash)
    }

    pub fn get_best_height(&self) -> Result<u64> {
        Ok(self.get_last_block()?.get_height())
    }

    pub fn get_block(&self, hash: &[u8]) -> Result<Block> {
        let data = self
            .db
            .get(hash)?
            .ok_or_else(|| NodeError::NotFound(format!("block {}", hex::encode(hash))))?;
        Block::deserialize(&data)
    }

    /// All block hashes, tip to genesis.
    pub fn get_block_hashes(&self) -> Result<Vec<Vec<u8>>> {
        let mut hashes = Vec::new();
        for block in self.iter()? {
            hashes.push(block.get_hash().to_vec());
        }
        Ok(hashes)
    }

    pub fn iter(&self) -> Result<BlockchainIter<'_>> {
        Ok(BlockchainIter {
            current_hash: self.get_last_hash()?,
            bc: self,
        })
    }

    /// Full chain scan producing every unspent output, keyed by hex
    /// transaction id. Source of truth for rebuilding the UTXO index.
    pub fn find_utxo(&self) -> Result<HashMap<String, TXOutputs>> {
        let mut utxo: HashMap<String, TXOutputs> = HashMap::new();
        let mut spent: HashMap<String, Vec<i32>> = HashMap::new();
        for block in self.iter()? {
            for tx in block.get_transactions() {
                let txid = hex::encode(&tx.id);
                for (out_idx, out) in tx.vout.iter().enumerate() {
                    if let Some(spent_outs) = spent.get(&txid) {
                        if spent_outs.contains(&(out_idx as i32)) {
                            continue;
                        }
                    }
                    utxo.entry(txid.clone())
                        .or_default()
                        .outputs
                        .push(out.clone());
                }
                if !tx.is_coinbase() {
                    for input in &tx.vin {
                        spent
                            .entry(hex::encode(&input.txid))
                            .or_default()
                            .push(input.vout);
                    }
                }
            }
        }
        Ok(utxo)
    }

    pub fn find_transaction(&self, id: &[u8]) -> Result<Transaction> {
        for block in self.iter()? {
            for tx in block.get_transactions() {
                if tx.id == id {
                    return Ok(tx.clone());
                }
            }
        }
        Err(NodeError::NotFound(format!("transaction {}", hex::encode(id))))
    }

    pub fn sign_transaction(&self, tx: &mut Transaction, secret_key: &[u8]) -> Result<()> {
        let prev_txs = self.get_prev_txs(tx)?;
        tx.sign(secret_key, &prev_txs)
    }

    pub fn verify_transaction(&self, tx: &Transaction) -> Result<bool> {
        if tx.is_coinbase() {
            return Ok(true);
        }
        let prev_txs = self.get_prev_txs(tx)?;
        tx.verify(&prev_txs)
    }

    fn get_prev_txs(&self, tx: &Transaction) -> Result<HashMap<String, Transaction>> {
        let mut prev_txs = HashMap::new();
        for input in &tx.vin {
            let prev_tx = self.find_transaction(&input.txid)?;
            prev_txs.insert(hex::encode(&prev_tx.id), prev_tx);
        }
        Ok(prev_txs)
    }
}

impl<'a> Iterator for BlockchainIter<'a> {
    type Item = Block;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_hash.is_empty() {
            return None;
        }
        match self.bc.get_block(&self.current_hash) {
            Ok(block) => {
                self.current_hash = block.get_prev_hash().to_vec();
                Some(block)
            }
            Err(e) => {
                warn!("chain iteration stopped: {}", e);
                None
            }
        }
    }
}

/// Writes the block, and optionally the tip pointer, in one atomic sled
/// transaction; concurrent readers see either both or neither.
fn commit_block(db: &sled::Db, block: &Block, move_tip: bool) -> Result<()> {
    let payload = block.serialize()?;
    let hash = block.get_hash().to_vec();
    db.transaction::<_, _, ()>(|txn| {
        txn.insert(hash.as_slice(), payload.as_slice())?;
        if move_tip {
            txn.insert(TIP_KEY, hash.as_slice())?;
        }
        Ok(())
    })
    .map_err(|e| match e {
        TransactionError::Storage(err) => NodeError::from(err),
        TransactionError::Abort(()) => NodeError::Storage("write transaction aborted".to_string()),
    })?;
    db.flush()?;
    Ok(())
}

/// sled holds a file lock while the database is open; a failed open gets
/// exactly one retry before the error reaches the caller.
fn open_db(path: &str) -> Result<sled::Db> {
    match sled::open(path) {
        Ok(db) => Ok(db),
        Err(first) => {
            warn!("opening {} failed ({}), retrying once", path, first);
            sled::open(path).map_err(NodeError::from)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::SUBSIDY;
    use crate::wallet::Wallet;

    fn test_chain(dir: &tempfile::TempDir) -> (Blockchain, Wallet) {
        let wallet = Wallet::new().unwrap();
        let path = dir.path().join("blocks");
        let bc = Blockchain::create_at(path.to_str().unwrap(), &wallet.get_address()).unwrap();
        (bc, wallet)
    }

    #[test]
    fn create_writes_genesis_and_tip() {
        let dir = tempfile::tempdir().unwrap();
        let (bc, _wallet) = test_chain(&dir);
        assert_eq!(bc.get_best_height().unwrap(), 0);
        let blocks: Vec<Block> = bc.iter().unwrap().collect();
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].is_genesis());

        let utxo = bc.find_utxo().unwrap();
        let total: i64 = utxo
            .values()
            .flat_map(|outs| outs.outputs.iter())
            .map(|o| o.value)
            .sum();
        assert_eq!(total, SUBSIDY);
    }

    #[test]
    fn create_twice_fails() {
        let dir = tempfile::tempdir().unwrap();
        let wallet = Wallet::new().unwrap();
        let path = dir.path().join("blocks");
        Blockchain::create_at(path.to_str().unwrap(), &wallet.get_address()).unwrap();
        assert!(Blockchain::create_at(path.to_str().unwrap(), &wallet.get_address()).is_err());
    }

    #[test]
    fn open_missing_chain_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nothing-here");
        assert!(matches!(
            Blockchain::open_at(path.to_str().unwrap()),
            Err(NodeError::NotFound(_))
        ));
    }

    #[test]
    fn mine_block_advances_tip() {
        let dir = tempfile::tempdir().unwrap();
        let (bc, wallet) = test_chain(&dir);
        let cbtx = Transaction::new_coinbase(&wallet.get_address(), String::new()).unwrap();
        let block = bc.mine_block(vec![cbtx]).unwrap();
        assert_eq!(block.get_height(), 1);
        assert_eq!(bc.get_best_height().unwrap(), 1);
        assert_eq!(bc.get_last_hash().unwrap(), block.get_hash());
        // iterator runs tip to genesis inclusive
        let heights: Vec<u64> = bc.iter().unwrap().map(|b| b.get_height()).collect();
        assert_eq!(heights, vec![1, 0]);
    }

    #[test]
    fn add_block_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (bc, wallet) = test_chain(&dir);
        let cbtx = Transaction::new_coinbase(&wallet.get_address(), String::new()).unwrap();
        let block = bc.mine_block(vec![cbtx]).unwrap();
        bc.add_block(block.clone()).unwrap();
        bc.add_block(block).unwrap();
        assert_eq!(bc.iter().unwrap().count(), 2);
        assert_eq!(bc.get_best_height().unwrap(), 1);
    }

    #[test]
    fn taller_orphan_wins_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let (bc, wallet) = test_chain(&dir);
        let cbtx = Transaction::new_coinbase(&wallet.get_address(), String::new()).unwrap();
        let orphan = Block::new(vec![cbtx], vec![0xab; 32], 9).unwrap();
        bc.add_block(orphan.clone()).unwrap();
        assert_eq!(bc.get_best_height().unwrap(), 9);
        assert_eq!(bc.get_last_hash().unwrap(), orphan.get_hash());
    }

    #[test]
    fn strict_parent_rejects_orphan() {
        let dir = tempfile::tempdir().unwrap();
        let (bc, wallet) = test_chain(&dir);
        let bc = bc.with_strict_parent(true);
        let cbtx = Transaction::new_coinbase(&wallet.get_address(), String::new()).unwrap();
        let orphan = Block::new(vec![cbtx], vec![0xab; 32], 9).unwrap();
        assert!(matches!(
            bc.add_block(orphan),
            Err(NodeError::InvalidBlock(_))
        ));
        assert_eq!(bc.get_best_height().unwrap(), 0);
    }

    #[test]
    fn add_block_rejects_bad_proof_of_work() {
        let dir = tempfile::tempdir().unwrap();
        let (bc, wallet) = test_chain(&dir);
        let cbtx = Transaction::new_coinbase(&wallet.get_address(), String::new()).unwrap();
        let block = bc.mine_block(vec![cbtx]).unwrap();
        let mut raw = block.serialize().unwrap();
        // flip a byte somewhere in the middle of the payload
        let mid = raw.len() / 2;
        raw[mid] ^= 0xff;
        if let Ok(forged) = Block::deserialize(&raw) {
            assert!(bc.add_block(forged).is_err());
        }
    }

    #[test]
    fn find_transaction_walks_the_chain() {
        let dir = tempfile::tempdir().unwrap();
        let (bc, wallet) = test_chain(&dir);
        let cbtx = Transaction::new_coinbase(&wallet.get_address(), String::new()).unwrap();
        let id = cbtx.id.clone();
        bc.mine_block(vec![cbtx]).unwrap();
        assert_eq!(bc.find_transaction(&id).unwrap().id, id);
        assert!(matches!(
            bc.find_transaction(&[0u8; 32]),
            Err(NodeError::NotFound(_))
        ));
    }

    #[test]
    fn chain_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks");
        let wallet = Wallet::new().unwrap();
        let tip;
        {
            let bc = Blockchain::create_at(path.to_str().unwrap(), &wallet.get_address()).unwrap();
            let cbtx = Transaction::new_coinbase(&wallet.get_address(), String::new()).unwrap();
            tip = bc.mine_block(vec![cbtx]).unwrap().get_hash().to_vec();
        }
        let bc = Blockchain::open_at(path.to_str().unwrap()).unwrap();
        assert_eq!(bc.get_last_hash().unwrap(), tip);
        assert_eq!(bc.get_best_height().unwrap(), 1);
    }
}
