use std::collections::HashMap;
use std::fmt;

use log::info;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::errors::{NodeError, Result};
use crate::hashing::double_sha256;
use crate::tx::{TXInput, TXOutput, COINBASE_OUT_INDEX};
use crate::utxoset::UTXOSet;
use crate::wallet::{self, Wallet};

/// Mining reward, paid by the coinbase transaction of every block.
pub const SUBSIDY: i64 = 20;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub id: Vec<u8>,
    pub vin: Vec<TXInput>,
    pub vout: Vec<TXOutput>,
}

impl Transaction {
    /// A coinbase transaction mints the block reward. Its single input
    /// references nothing and carries `data` (or 24 random bytes as hex)
    /// instead of a public key.
    pub fn new_coinbase(to: &str, data: String) -> Result<Transaction> {
        let data = if data.is_empty() {
            let mut random = [0u8; 24];
            OsRng.fill_bytes(&mut random);
            hex::encode(random)
        } else {
            data
        };
        info!("new coinbase transaction to {}", to);
        let mut tx = Transaction {
            id: Vec::new(),
            vin: vec![TXInput {
                txid: Vec::new(),
                vout: COINBASE_OUT_INDEX,
                signature: Vec::new(),
                pub_key: data.into_bytes(),
            }],
            vout: vec![TXOutput::new(SUBSIDY, to)?],
        };
        tx.id = tx.hash()?;
        Ok(tx)
    }

    /// Builds, ids and signs a regular transaction spending `wallet`'s
    /// outputs. A change output back to the sender is added only when the
    /// selected outputs overshoot the amount.
    pub fn new_utxo(wallet: &Wallet, to: &str, amount: i64, utxo_set: &UTXOSet) -> Result<Transaction> {
        let pub_key_hash = wallet::hash_pub_key(&wallet.public_key);
        let (accumulated, valid_outputs) = utxo_set.find_spendable_outputs(&pub_key_hash, amount)?;
        if accumulated < amount {
            return Err(NodeError::InsufficientFunds {
                have: accumulated,
                need: amount,
            });
        }

        let mut vin = Vec::new();
        for (txid_hex, outs) in valid_outputs {
            let txid = hex::decode(&txid_hex)?;
            for out in outs {
                vin.push(TXInput {
                    txid: txid.clone(),
                    vout: out,
                    signature: Vec::new(),
                    pub_key: wallet.public_key.clone(),
                });
            }
        }

        let from = wallet.get_address();
        let mut vout = vec![TXOutput::new(amount, to)?];
        if accumulated > amount {
            vout.push(TXOutput::new(accumulated - amount, &from)?);
        }

        let mut tx = Transaction {
            id: Vec::new(),
            vin,
            vout,
        };
        tx.id = tx.hash()?;
        utxo_set.blockchain.sign_transaction(&mut tx, &wallet.secret_key)?;
        Ok(tx)
    }

    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].vout == COINBASE_OUT_INDEX
    }

    /// Transaction id: the double SHA-256 of the serialised transaction
    /// with an empty id field. Works on a copy so concurrent hashing of
    /// the same transaction is safe.
    pub fn hash(&self) -> Result<Vec<u8>> {
        let mut stripped = self.clone();
        stripped.id = Vec::new();
        Ok(double_sha256(&bincode::serialize(&stripped)?))
    }

    /// Copy with every input's signature and public key emptied. The id is
    /// kept. This is the canonical shape both signing and verification
    /// operate on.
    fn cleansed(&self) -> Transaction {
        Transaction {
            id: self.id.clone(),
            vin: self
                .vin
                .iter()
                .map(|input| TXInput {
                    txid: input.txid.clone(),
                    vout: input.vout,
                    signature: Vec::new(),
                    pub_key: Vec::new(),
                })
                .collect(),
            vout: self.vout.clone(),
        }
    }

    /// The exact bytes handed to ECDSA: the serialised cleansed
    /// transaction rendered as lowercase hex, terminated by a newline.
    /// Consensus-relevant; any change breaks every existing signature.
    fn signing_message(tx_cleansed: &Transaction) -> Result<Vec<u8>> {
        let mut message = hex::encode(bincode::serialize(tx_cleansed)?).into_bytes();
        message.push(b'\n');
        Ok(message)
    }

    /// Signs every input against the outputs it spends. `prev_txs` must
    /// hold each referenced transaction, keyed by hex id.
    pub fn sign(&mut self, secret_key: &[u8], prev_txs: &HashMap<String, Transaction>) -> Result<()> {
        if self.is_coinbase() {
            return Ok(());
        }
        for input in &self.vin {
            if !prev_txs.contains_key(&hex::encode(&input.txid)) {
                return Err(NodeError::MissingPrevTx(hex::encode(&input.txid)));
            }
        }
        let mut tx_cleansed = self.cleansed();
        for in_id in 0..self.vin.len() {
            let prev_tx = &prev_txs[&hex::encode(&self.vin[in_id].txid)];
            tx_cleansed.vin[in_id].signature.clear();
            tx_cleansed.vin[in_id].pub_key =
                prev_tx.vout[self.vin[in_id].vout as usize].pub_key_hash.clone();
            let message = Transaction::signing_message(&tx_cleansed)?;
            self.vin[in_id].signature = wallet::sign_message(secret_key, &message)?;
            tx_cleansed.vin[in_id].pub_key = Vec::new();
        }
        Ok(())
    }

    /// Checks every input's signature. Coinbase transactions verify
    /// unconditionally; any structural mismatch means false, not an error.
    pub fn verify(&self, prev_txs: &HashMap<String, Transaction>) -> Result<bool> {
        if self.is_coinbase() {
            return Ok(true);
        }
        for input in &self.vin {
            if !prev_txs.contains_key(&hex::encode(&input.txid)) {
                return Err(NodeError::MissingPrevTx(hex::encode(&input.txid)));
            }
        }
        let mut tx_cleansed = self.cleansed();
        for in_id in 0..self.vin.len() {
            let input = &self.vin[in_id];
            let prev_tx = &prev_txs[&hex::encode(&input.txid)];
            let referenced = match prev_tx.vout.get(input.vout as usize) {
                Some(out) => out,
                None => return Ok(false),
            };
            tx_cleansed.vin[in_id].signature.clear();
            tx_cleansed.vin[in_id].pub_key = referenced.pub_key_hash.clone();
            let message = Transaction::signing_message(&tx_cleansed)?;
            if !wallet::verify_signature(&input.pub_key, &message, &input.signature) {
                return Ok(false);
            }
            tx_cleansed.vin[in_id].pub_key = Vec::new();
        }
        Ok(true)
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn deserialize(data: &[u8]) -> Result<Transaction> {
        Ok(bincode::deserialize(data)?)
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- Transaction {}:", hex::encode(&self.id))?;
        for (i, input) in self.vin.iter().enumerate() {
            writeln!(f, "     Input {}:", i)?;
            writeln!(f, "       TXID:      {}", hex::encode(&input.txid))?;
            writeln!(f, "       Out:       {}", input.vout)?;
            writeln!(f, "       Signature: {}", hex::encode(&input.signature))?;
            writeln!(f, "       PubKey:    {}", hex::encode(&input.pub_key))?;
        }
        for (i, output) in self.vout.iter().enumerate() {
            writeln!(f, "     Output {}:", i)?;
            writeln!(f, "       Value:  {}", output.value)?;
            writeln!(f, "       Script: {}", hex::encode(&output.pub_key_hash))?;
        }
        Ok(())
    }
}
