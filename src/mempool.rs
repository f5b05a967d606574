use std::collections::HashMap;
use std::sync::Mutex;

use crate::transaction::Transaction;

/// Pending transactions, keyed by hex id. Process-lifetime state shared
/// by all connection handlers, so the map lives behind its own lock.
/// Insertion is unconditional; validity is checked at mining time.
#[derive(Default)]
pub struct Mempool {
    pool: Mutex<HashMap<String, Transaction>>,
}

impl Mempool {
    pub fn new() -> Mempool {
        Mempool::default()
    }

    pub fn insert(&self, tx: Transaction) {
        self.pool.lock().unwrap().insert(hex::encode(&tx.id), tx);
    }

    pub fn get(&self, txid_hex: &str) -> Option<Transaction> {
        self.pool.lock().unwrap().get(txid_hex).cloned()
    }

    pub fn contains(&self, txid_hex: &str) -> bool {
        self.pool.lock().unwrap().contains_key(txid_hex)
    }

    pub fn remove(&self, txid_hex: &str) {
        self.pool.lock().unwrap().remove(txid_hex);
    }

    pub fn len(&self) -> usize {
        self.pool.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Atomically removes and returns up to `limit` transactions. The
    /// mining loop works off this snapshot while new arrivals keep
    /// landing in the pool for the next round.
    pub fn take_batch(&self, limit: usize) -> Vec<Transaction> {
        let mut pool = self.pool.lock().unwrap();
        let ids: Vec<String> = pool.keys().take(limit).cloned().collect();
        ids.into_iter()
            .filter_map(|id| pool.remove(&id))
            .collect()
    }
}
