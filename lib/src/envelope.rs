use crate::apdu::MESSAGE_LENGTH;
use crate::crypto::{aes_gcm_open, aes_gcm_seal, gunzip, gzip, random_bytes};
use crate::error::{CryptoError, EnvelopeError};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use zeroize::Zeroize;

/// Random AES-256 key that encrypts a share envelope. Only the secure element keeps it.
#[derive(Clone, PartialEq, Eq)]
pub struct WrapKey([u8; MESSAGE_LENGTH]);

impl WrapKey {
    pub fn generate() -> Self {
        let mut key = [0u8; MESSAGE_LENGTH];
        let mut bytes = random_bytes(MESSAGE_LENGTH);
        key.copy_from_slice(&bytes);
        bytes.zeroize();
        WrapKey(key)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; MESSAGE_LENGTH] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength(bytes.len()))?;
        Ok(WrapKey(key))
    }

    pub fn as_bytes(&self) -> &[u8; MESSAGE_LENGTH] {
        &self.0
    }
}

impl fmt::Debug for WrapKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WrapKey(<redacted>)")
    }
}

impl Drop for WrapKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Hex encoding of the group element at `y_sum_s.point` in a keygen share.
pub fn extract_pubkey(share_json: &[u8]) -> Result<String, EnvelopeError> {
    let share: Value = serde_json::from_slice(share_json)
        .map_err(|e| EnvelopeError::InvalidShare(format!("not JSON: {e}")))?;
    let point = share
        .get("y_sum_s")
        .ok_or_else(|| EnvelopeError::InvalidShare("missing y_sum_s".to_string()))?
        .get("point")
        .ok_or_else(|| EnvelopeError::InvalidShare("missing y_sum_s.point".to_string()))?
        .as_array()
        .ok_or_else(|| EnvelopeError::InvalidShare("y_sum_s.point is not an array".to_string()))?;

    let bytes = point
        .iter()
        .enumerate()
        .map(|(i, v)| {
            v.as_u64()
                .and_then(|n| u8::try_from(n).ok())
                .ok_or_else(|| {
                    EnvelopeError::InvalidShare(format!(
                        "y_sum_s.point[{i}] is not a byte: {v}"
                    ))
                })
        })
        .collect::<Result<Vec<u8>, _>>()?;
    if bytes.is_empty() {
        return Err(EnvelopeError::InvalidShare(
            "y_sum_s.point is empty".to_string(),
        ));
    }
    Ok(hex::encode(bytes))
}

/// Compress and encrypt a share under a fresh wrap key.
pub fn seal_share(share_json: &[u8]) -> Result<(WrapKey, Vec<u8>), EnvelopeError> {
    let wrap_key = WrapKey::generate();
    let envelope = aes_gcm_seal(wrap_key.as_bytes(), &gzip(share_json)?)?;
    Ok((wrap_key, envelope))
}

pub fn open_share(wrap_key: &WrapKey, envelope: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    let mut compressed = aes_gcm_open(wrap_key.as_bytes(), envelope)?;
    let share = gunzip(&compressed);
    compressed.zeroize();
    Ok(share?)
}

/// Message to sign as passed to the signing executable, without a `0x` prefix.
pub fn normalize_sign_data(data: &str) -> &str {
    let data = data.trim();
    data.strip_prefix("0x")
        .or_else(|| data.strip_prefix("0X"))
        .unwrap_or(data)
}

#[derive(Deserialize)]
struct Scalar {
    curve: String,
    scalar: Vec<u64>,
}

#[derive(Deserialize)]
struct SigningOutput {
    r: Scalar,
    s: Scalar,
    recid: u8,
}

/// Convert the signing executable's output to a `0x` prefixed `r || s || v` signature with
/// `v = recid + 27`. Output that is not the JSON signature form is passed through trimmed,
/// with a `0x` prefix added when absent.
pub fn convert_signature(output: &str) -> Result<String, EnvelopeError> {
    let output = output.trim();
    let parsed: SigningOutput = match serde_json::from_str(output) {
        Ok(parsed) => parsed,
        Err(_) => return passthrough_signature(output),
    };
    let r = scalar_bytes("r", &parsed.r)?;
    let s = scalar_bytes("s", &parsed.s)?;
    let v = parsed
        .recid
        .checked_add(27)
        .ok_or_else(|| EnvelopeError::InvalidSignature(format!("recid {}", parsed.recid)))?;

    let mut sig = Vec::with_capacity(65);
    sig.extend_from_slice(&r);
    sig.extend_from_slice(&s);
    sig.push(v);
    Ok(format!("0x{}", hex::encode(sig)))
}

fn scalar_bytes(name: &str, scalar: &Scalar) -> Result<[u8; 32], EnvelopeError> {
    if scalar.curve != "secp256k1" {
        return Err(EnvelopeError::InvalidSignature(format!(
            "{name} is on curve {}, expected secp256k1",
            scalar.curve
        )));
    }
    let bytes = scalar
        .scalar
        .iter()
        .map(|b| u8::try_from(*b))
        .collect::<Result<Vec<u8>, _>>()
        .map_err(|_| EnvelopeError::InvalidSignature(format!("{name} has a non-byte value")))?;
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    let trimmed = &bytes[first..];
    if trimmed.len() > 32 {
        return Err(EnvelopeError::InvalidSignature(format!(
            "{name} is {} bytes",
            trimmed.len()
        )));
    }
    let mut out = [0u8; 32];
    out[32 - trimmed.len()..].copy_from_slice(trimmed);
    Ok(out)
}

fn passthrough_signature(output: &str) -> Result<String, EnvelopeError> {
    if output.is_empty() {
        return Err(EnvelopeError::InvalidSignature(
            "signing produced no output".to_string(),
        ));
    }
    if output.starts_with("0x") {
        Ok(output.to_string())
    } else {
        Ok(format!("0x{output}"))
    }
}
