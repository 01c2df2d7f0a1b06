use crate::apdu::{ADDR_LENGTH, USER_HASH_LENGTH};
use crate::error::CryptoError;
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use secp256k1::hashes::{sha256, Hash};
use secp256k1::rand::rngs::OsRng;
use secp256k1::rand::RngCore;
use secp256k1::PublicKey;
use sha3::{Digest, Keccak256};
use std::io::{Read, Write};

pub const AES_KEY_LENGTH: usize = 32;
pub const NONCE_LENGTH: usize = 12;
pub const TAG_LENGTH: usize = 16;

/// `n` bytes from the operating system CSRNG.
pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; n];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// AES-256-GCM with a fresh random nonce. Output is `nonce || ciphertext || tag`.
pub fn aes_gcm_seal(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut nonce = [0u8; NONCE_LENGTH];
    OsRng.fill_bytes(&mut nonce);
    aes_gcm_seal_with_nonce(key, &nonce, plaintext)
}

pub fn aes_gcm_seal_with_nonce(
    key: &[u8],
    nonce: &[u8; NONCE_LENGTH],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = cipher(key)?;
    let ciphertext = cipher
        .encrypt(nonce.as_slice().into(), plaintext)
        .map_err(|_| CryptoError::Encrypt)?;
    let mut sealed = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
    sealed.extend_from_slice(nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Inverse of [`aes_gcm_seal`]. Rejects input too short to hold a nonce and tag.
pub fn aes_gcm_open(key: &[u8], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = cipher(key)?;
    if sealed.len() < NONCE_LENGTH + TAG_LENGTH {
        return Err(CryptoError::CiphertextTooShort(sealed.len()));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LENGTH);
    cipher
        .decrypt(nonce.into(), ciphertext)
        .map_err(|_| CryptoError::Decrypt)
}

fn cipher(key: &[u8]) -> Result<Aes256Gcm, CryptoError> {
    if key.len() != AES_KEY_LENGTH {
        return Err(CryptoError::InvalidKeyLength(key.len()));
    }
    Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength(key.len()))
}

pub fn gzip(bytes: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
    encoder
        .write_all(bytes)
        .map_err(|e| CryptoError::Compression(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| CryptoError::Compression(e.to_string()))
}

pub fn gunzip(bytes: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| CryptoError::Decompression(e.to_string()))?;
    Ok(out)
}

/// SHA-256 of the UTF-8 user name, the record key stored on the secure element.
pub fn user_hash(username: &str) -> [u8; USER_HASH_LENGTH] {
    let digest = sha256::Hash::hash(username.as_bytes());
    let mut out = [0u8; USER_HASH_LENGTH];
    out.copy_from_slice(&digest[..]);
    out
}

/// Ethereum address of a compressed secp256k1 public key given as 66 hex characters.
pub fn derive_address(compressed_hex: &str) -> Result<String, CryptoError> {
    let bytes = parse_compressed_pubkey(compressed_hex)?;
    let pubkey = PublicKey::from_slice(&bytes)?;
    Ok(to_checksum_address(&pubkey_address(&pubkey)))
}

fn parse_compressed_pubkey(compressed_hex: &str) -> Result<[u8; 33], CryptoError> {
    let valid = compressed_hex.len() == 66
        && (compressed_hex.starts_with("02") || compressed_hex.starts_with("03"))
        && compressed_hex.bytes().all(|b| b.is_ascii_hexdigit());
    if !valid {
        return Err(CryptoError::InvalidPublicKeyFormat(format!(
            "expected 0[23] followed by 64 hex characters, got {} characters",
            compressed_hex.len()
        )));
    }
    let mut bytes = [0u8; 33];
    hex::decode_to_slice(compressed_hex, &mut bytes)
        .map_err(|e| CryptoError::InvalidPublicKeyFormat(e.to_string()))?;
    Ok(bytes)
}

/// Low 20 bytes of Keccak-256 over the uncompressed `X || Y` coordinates.
pub fn pubkey_address(pubkey: &PublicKey) -> [u8; ADDR_LENGTH] {
    let uncompressed = pubkey.serialize_uncompressed();
    let hash = Keccak256::digest(&uncompressed[1..]);
    let mut addr = [0u8; ADDR_LENGTH];
    addr.copy_from_slice(&hash[12..]);
    addr
}

/// EIP-55 mixed-case encoding with `0x` prefix.
pub fn to_checksum_address(addr: &[u8; ADDR_LENGTH]) -> String {
    let lower = hex::encode(addr);
    let hash = Keccak256::digest(lower.as_bytes());
    let mut out = String::with_capacity(2 + lower.len());
    out.push_str("0x");
    for (i, c) in lower.chars().enumerate() {
        let nibble = (hash[i / 2] >> (if i % 2 == 0 { 4 } else { 0 })) & 0x0f;
        if c.is_ascii_alphabetic() && nibble >= 8 {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Accepts 40 hex characters in any case, with or without `0x`.
pub fn decode_address(address: &str) -> Result<[u8; ADDR_LENGTH], CryptoError> {
    let trimmed = address.trim();
    let stripped = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if stripped.len() != ADDR_LENGTH * 2 {
        return Err(CryptoError::InvalidAddress(format!(
            "expected {} hex characters, got {}",
            ADDR_LENGTH * 2,
            stripped.len()
        )));
    }
    let mut addr = [0u8; ADDR_LENGTH];
    hex::decode_to_slice(stripped, &mut addr)
        .map_err(|e| CryptoError::InvalidAddress(e.to_string()))?;
    Ok(addr)
}
