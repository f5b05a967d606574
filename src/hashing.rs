use crypto::digest::Digest;
use crypto::ripemd160::Ripemd160;
use crypto::sha2::Sha256;

use crate::errors::{NodeError, Result};

pub const CHECKSUM_LENGTH: usize = 4;

pub fn sha256(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.input(data);
    let mut out = [0u8; 32];
    hasher.result(&mut out);
    out.to_vec()
}

/// SHA-256 applied twice; the second pass runs over the raw 32-byte digest.
pub fn double_sha256(data: &[u8]) -> Vec<u8> {
    sha256(&sha256(data))
}

/// SHA-256 followed by RIPEMD-160, the classic 20-byte public key hash.
pub fn hash160(data: &[u8]) -> Vec<u8> {
    let inner = sha256(data);
    let mut hasher = Ripemd160::new();
    hasher.input(&inner);
    let mut out = [0u8; 20];
    hasher.result(&mut out);
    out.to_vec()
}

/// First four bytes of the double SHA-256 of `payload`.
pub fn checksum(payload: &[u8]) -> Vec<u8> {
    double_sha256(payload)[..CHECKSUM_LENGTH].to_vec()
}

/// Base58 of `version || payload || checksum(version || payload)`.
pub fn base58check_encode(version: u8, payload: &[u8]) -> String {
    let mut versioned = vec![version];
    versioned.extend_from_slice(payload);
    let check = checksum(&versioned);
    versioned.extend_from_slice(&check);
    bs58::encode(versioned).into_string()
}

/// Raw Base58 decode. The checksum is NOT verified here; that is the
/// caller's job (see wallet::validate_address).
pub fn base58check_decode(address: &str) -> Result<Vec<u8>> {
    bs58::decode(address)
        .into_vec()
        .map_err(|e| NodeError::InvalidAddress(format!("{}: {}", address, e)))
}

/// Fixed-width big-endian encoding used in the block header preimage.
pub fn be64(n: i64) -> [u8; 8] {
    n.to_be_bytes()
}
