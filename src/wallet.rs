use std::collections::HashMap;
use std::fs;
use std::path::Path;

use log::{debug, info};
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::{EncodedPoint, FieldBytes};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::errors::{NodeError, Result};
use crate::hashing::{base58check_decode, base58check_encode, checksum, hash160, CHECKSUM_LENGTH};

/// Version byte of a pay-to-pubkey-hash address.
const VERSION: u8 = 0x00;

fn wallet_file(node_id: &str) -> String {
    format!("./tmp/wallets_{}.data", node_id)
}

/// An ECDSA P-256 keypair. The secret key is the raw 32-byte scalar, the
/// public key is the fixed-width X || Y concatenation of the curve point.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Wallet {
    pub secret_key: Vec<u8>,
    pub public_key: Vec<u8>,
}

impl Wallet {
    pub fn new() -> Result<Wallet> {
        let signing = SigningKey::random(&mut OsRng);
        let point = signing.verifying_key().to_encoded_point(false);
        let (x, y) = match (point.x(), point.y()) {
            (Some(x), Some(y)) => (x, y),
            _ => return Err(NodeError::Crypto("generated key has no coordinates".to_string())),
        };
        let mut public_key = x.to_vec();
        public_key.extend_from_slice(y);
        Ok(Wallet {
            secret_key: signing.to_bytes().to_vec(),
            public_key,
        })
    }

    /// The Base58Check rendering of the public key hash; what end users
    /// exchange with each other.
    pub fn get_address(&self) -> String {
        base58check_encode(VERSION, &hash_pub_key(&self.public_key))
    }
}

/// The network side deals in public key hashes, not raw keys.
pub fn hash_pub_key(pub_key: &[u8]) -> Vec<u8> {
    hash160(pub_key)
}

/// Decodes the address and recomputes the checksum over
/// `version || payload`. Any decode failure counts as invalid.
pub fn validate_address(address: &str) -> bool {
    let payload = match base58check_decode(address) {
        Ok(p) => p,
        Err(_) => return false,
    };
    if payload.len() <= CHECKSUM_LENGTH + 1 {
        return false;
    }
    let (body, actual) = payload.split_at(payload.len() - CHECKSUM_LENGTH);
    checksum(body) == actual
}

/// Strips the version byte and checksum, leaving the 20-byte hash the
/// address stands for.
pub fn pub_key_hash_from_address(address: &str) -> Result<Vec<u8>> {
    let payload = base58check_decode(address)?;
    if payload.len() <= CHECKSUM_LENGTH + 1 {
        return Err(NodeError::InvalidAddress(address.to_string()));
    }
    Ok(payload[1..payload.len() - CHECKSUM_LENGTH].to_vec())
}

/// Signs `message` with the raw P-256 scalar. The signature goes on the
/// wire as r || s, both halves fixed at 32 bytes.
pub fn sign_message(secret_key: &[u8], message: &[u8]) -> Result<Vec<u8>> {
    let key = SigningKey::from_slice(secret_key)
        .map_err(|e| NodeError::Crypto(format!("bad secret key: {}", e)))?;
    let signature: Signature = key.sign(message);
    Ok(signature.to_bytes().to_vec())
}

/// Verifies an r || s signature against an X || Y public key. Malformed
/// keys or signatures simply fail verification.
pub fn verify_signature(pub_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    if pub_key.is_empty() || pub_key.len() % 2 != 0 || signature.is_empty() {
        return false;
    }
    let (x, y) = pub_key.split_at(pub_key.len() / 2);
    let (x, y) = match (left_pad32(x), left_pad32(y)) {
        (Some(x), Some(y)) => (x, y),
        _ => return false,
    };
    let point = EncodedPoint::from_affine_coordinates(&x, &y, false);
    let key = match VerifyingKey::from_encoded_point(&point) {
        Ok(k) => k,
        Err(_) => return false,
    };
    let (r, s) = signature.split_at(signature.len() / 2);
    let (r, s) = match (left_pad32(r), left_pad32(s)) {
        (Some(r), Some(s)) => (r, s),
        _ => return false,
    };
    let signature = match Signature::from_scalars(r, s) {
        Ok(s) => s,
        Err(_) => return false,
    };
    key.verify(message, &signature).is_ok()
}

// Scalar halves come off the wire with leading zeros stripped.
fn left_pad32(bytes: &[u8]) -> Option<FieldBytes> {
    if bytes.len() > 32 {
        return None;
    }
    let mut buf = [0u8; 32];
    buf[32 - bytes.len()..].copy_from_slice(bytes);
    Some(FieldBytes::from(buf))
}

/// The keyring: every wallet this node owns, keyed by address.
pub struct Wallets {
    wallets: HashMap<String, Wallet>,
}

impl Wallets {
    /// Loads the keyring for `node_id`. A missing wallet file is not an
    /// error; it just means no wallet has been created yet.
    pub fn open(node_id: &str) -> Result<Wallets> {
        let path = wallet_file(node_id);
        if !Path::new(&path).exists() {
            debug!("no wallet file at {}, starting empty", path);
            return Ok(Wallets {
                wallets: HashMap::new(),
            });
        }
        Wallets::load_from(&path)
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Wallets> {
        let content = fs::read(&path)?;
        let wallets: HashMap<String, Wallet> = bincode::deserialize(&content)?;
        Ok(Wallets { wallets })
    }

    pub fn save_file(&self, node_id: &str) -> Result<()> {
        fs::create_dir_all("./tmp")?;
        self.save_to(wallet_file(node_id))
    }

    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = bincode::serialize(&self.wallets)?;
        fs::write(&path, content)?;
        Ok(())
    }

    /// Generates a fresh keypair and returns its address.
    pub fn create_wallet(&mut self) -> Result<String> {
        let wallet = Wallet::new()?;
        let address = wallet.get_address();
        info!("created wallet {}", address);
        self.wallets.insert(address.clone(), wallet);
        Ok(address)
    }

    pub fn get_wallet(&self, address: &str) -> Option<&Wallet> {
        self.wallets.get(address)
    }

    pub fn get_all_addresses(&self) -> Vec<String> {
        self.wallets.keys().cloned().collect()
    }
}
