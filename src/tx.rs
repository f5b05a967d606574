use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::wallet;

/// Output index carried by the single input of a coinbase transaction.
pub const COINBASE_OUT_INDEX: i32 = -1;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TXInput {
    /// id of the transaction holding the output being spent
    pub txid: Vec<u8>,
    /// index of that output; -1 for a coinbase input
    pub vout: i32,
    pub signature: Vec<u8>,
    /// spender's public key, or arbitrary payload on a coinbase input
    pub pub_key: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TXOutput {
    pub value: i64,
    /// lock target: only the owner of the matching keypair can spend this
    pub pub_key_hash: Vec<u8>,
}

/// The value type stored in the UTXO index: all still-unspent outputs of
/// one transaction.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct TXOutputs {
    pub outputs: Vec<TXOutput>,
}

impl TXInput {
    /// True if this input was created by the owner of `pub_key_hash`.
    pub fn uses_key(&self, pub_key_hash: &[u8]) -> bool {
        wallet::hash_pub_key(&self.pub_key) == pub_key_hash
    }
}

impl TXOutput {
    pub fn new(value: i64, address: &str) -> Result<TXOutput> {
        let mut txo = TXOutput {
            value,
            pub_key_hash: Vec::new(),
        };
        txo.lock(address)?;
        Ok(txo)
    }

    fn lock(&mut self, address: &str) -> Result<()> {
        self.pub_key_hash = wallet::pub_key_hash_from_address(address)?;
        Ok(())
    }

    pub fn is_locked_with(&self, pub_key_hash: &[u8]) -> bool {
        self.pub_key_hash == pub_key_hash
    }
}

impl TXOutputs {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn deserialize(data: &[u8]) -> Result<TXOutputs> {
        Ok(bincode::deserialize(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::Wallet;

    #[test]
    fn output_locks_to_address_hash() {
        let wallet = Wallet::new().unwrap();
        let address = wallet.get_address();
        let out = TXOutput::new(10, &address).unwrap();
        assert!(out.is_locked_with(&wallet::hash_pub_key(&wallet.public_key)));
        assert!(!out.is_locked_with(&[0u8; 20]));
    }

    #[test]
    fn input_key_check() {
        let wallet = Wallet::new().unwrap();
        let input = TXInput {
            txid: vec![1, 2, 3],
            vout: 0,
            signature: Vec::new(),
            pub_key: wallet.public_key.clone(),
        };
        assert!(input.uses_key(&wallet::hash_pub_key(&wallet.public_key)));
        assert!(!input.uses_key(&[0u8; 20]));
    }

    #[test]
    fn outputs_round_trip() {
        let wallet = Wallet::new().unwrap();
        let outs = TXOutputs {
            outputs: vec![
                TXOutput::new(3, &wallet.get_address()).unwrap(),
                TXOutput::new(17, &wallet.get_address()).unwrap(),
            ],
        };
        let restored = TXOutputs::deserialize(&outs.serialize().unwrap()).unwrap();
        assert_eq!(restored, outs);
    }
}
