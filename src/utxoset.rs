use std::collections::HashMap;

use log::{debug, info};

use crate::block::Block;
use crate::blockchain::Blockchain;
use crate::errors::{NodeError, Result};
use crate::tx::TXOutputs;

/// Reserved key prefix separating UTXO entries from blocks; sled has no
/// namespaces, so the two keyspaces share one tree.
const UTXO_PREFIX: &[u8] = b"utxo-";

/// Upper bound on keys deleted per write batch during a reindex.
const COLLECT_SIZE: usize = 100_000;

/// Index of unspent transaction outputs, derived entirely from the
/// chain. Any inconsistency is resolved by a full rebuild.
pub struct UTXOSet {
    pub blockchain: Blockchain,
}

fn prefixed_key(txid: &[u8]) -> Vec<u8> {
    let mut key = UTXO_PREFIX.to_vec();
    key.extend_from_slice(txid);
    key
}

impl UTXOSet {
    /// Rebuilds the index from scratch: drop every entry under the
    /// prefix, then persist the result of a full chain scan.
    pub fn reindex(&self) -> Result<()> {
        self.delete_by_prefix(UTXO_PREFIX)?;
        let utxo = self.blockchain.find_utxo()?;
        let db = self.blockchain.db();
        for (txid_hex, outs) in utxo {
            let txid = hex::decode(&txid_hex)?;
            db.insert(prefixed_key(&txid), outs.serialize()?)?;
        }
        db.flush()?;
        info!("utxo index rebuilt");
        Ok(())
    }

    /// Applies one new block incrementally: spent outputs leave the
    /// index, the block's own outputs enter it.
    pub fn update(&self, block: &Block) -> Result<()> {
        let db = self.blockchain.db();
        for tx in block.get_transactions() {
            if !tx.is_coinbase() {
                for input in &tx.vin {
                    let key = prefixed_key(&input.txid);
                    let stored = db.get(&key)?.ok_or_else(|| {
                        NodeError::NotFound(format!(
                            "utxo entry for {}",
                            hex::encode(&input.txid)
                        ))
                    })?;
                    let outs = TXOutputs::deserialize(&stored)?;
                    let remaining: Vec<_> = outs
                        .outputs
                        .into_iter()
                        .enumerate()
                        .filter(|(idx, _)| *idx as i32 != input.vout)
                        .map(|(_, out)| out)
                        .collect();
                    if remaining.is_empty() {
                        db.remove(&key)?;
                    } else {
                        db.insert(key, TXOutputs { outputs: remaining }.serialize()?)?;
                    }
                }
            }
            let outs = TXOutputs {
                outputs: tx.vout.clone(),
            };
            db.insert(prefixed_key(&tx.id), outs.serialize()?)?;
        }
        db.flush()?;
        Ok(())
    }

    /// Accumulates outputs locked to `pub_key_hash` in store iteration
    /// order until the amount is reached. Deliberately not optimal; the
    /// order is stable, which keeps tests reproducible.
    pub fn find_spendable_outputs(
        &self,
        pub_key_hash: &[u8],
        amount: i64,
    ) -> Result<(i64, HashMap<String, Vec<i32>>)> {
        let mut unspent_outputs: HashMap<String, Vec<i32>> = HashMap::new();
        let mut accumulated = 0;
        for entry in self.blockchain.db().scan_prefix(UTXO_PREFIX) {
            let (key, value) = entry?;
            let txid_hex = hex::encode(&key[UTXO_PREFIX.len()..]);
            let outs = TXOutputs::deserialize(&value)?;
            for (out_idx, out) in outs.outputs.iter().enumerate() {
                if out.is_locked_with(pub_key_hash) && accumulated < amount {
                    accumulated += out.value;
                    unspent_outputs
                        .entry(txid_hex.clone())
                        .or_default()
                        .push(out_idx as i32);
                }
            }
        }
        Ok((accumulated, unspent_outputs))
    }

    /// Every unspent output locked to `pub_key_hash`; used for balances.
    pub fn find_utxo(&self, pub_key_hash: &[u8]) -> Result<TXOutputs> {
        let mut utxos = TXOutputs::default();
        for entry in self.blockchain.db().scan_prefix(UTXO_PREFIX) {
            let (_, value) = entry?;
            let outs = TXOutputs::deserialize(&value)?;
            for out in outs.outputs {
                if out.is_locked_with(pub_key_hash) {
                    utxos.outputs.push(out);
                }
            }
        }
        Ok(utxos)
    }

    /// Number of transactions with at least one unspent output.
    pub fn count_transactions(&self) -> Result<usize> {
        let mut counter = 0;
        for entry in self.blockchain.db().scan_prefix(UTXO_PREFIX) {
            entry?;
            counter += 1;
        }
        Ok(counter)
    }

    // Deletes in bounded batches so a huge index cannot blow up a single
    // write transaction.
    fn delete_by_prefix(&self, prefix: &[u8]) -> Result<()> {
        let db = self.blockchain.db();
        let mut keys = Vec::with_capacity(COLLECT_SIZE);
        for entry in db.scan_prefix(prefix) {
            let (key, _) = entry?;
            keys.push(key);
            if keys.len() == COLLECT_SIZE {
                apply_deletes(db, std::mem::take(&mut keys))?;
            }
        }
        if !keys.is_empty() {
            apply_deletes(db, keys)?;
        }
        Ok(())
    }
}

fn apply_deletes(db: &sled::Db, keys: Vec<sled::IVec>) -> Result<()> {
    debug!("deleting {} utxo entries", keys.len());
    let mut batch = sled::Batch::default();
    for key in keys {
        batch.remove(key);
    }
    db.apply_batch(batch)?;
    Ok(())
}
