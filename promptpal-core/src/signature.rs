//! Wallet signature verification
//!
//! Checks that a hex-encoded 65-byte `personal_sign` signature (r ‖ s ‖ v)
//! over `message` was produced by the key behind `address`. The message is
//! hashed with the EIP-191 prefix and Keccak-256, the public key is recovered
//! on secp256k1, and the derived address is compared case-insensitively.
//!
//! A well-formed signature that belongs to a different key, or whose
//! recovery byte is not one of 0, 1, 27 or 28, is a normal negative answer
//! (`Ok(false)`), not an error.

use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use sha3::{Digest, Keccak256};
use thiserror::Error;

const ADDRESS_LEN: usize = 20;
const SIGNATURE_LEN: usize = 65;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("signature verification failed: {0}")]
    VerificationError(String),
}

/// Stateless verifier; cheap to copy into any task.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignatureVerifier;

impl SignatureVerifier {
    pub fn new() -> Self {
        Self
    }

    pub fn verify(
        &self,
        address: &str,
        message: &str,
        signature: &str,
    ) -> Result<bool, SignatureError> {
        let claimed = parse_address(address)?;
        let raw = parse_signature(signature)?;

        let recovery_id = match raw[64] {
            v @ (0 | 1) => v,
            v @ (27 | 28) => v - 27,
            v => {
                tracing::debug!(v, "unsupported recovery byte, treating as mismatch");
                return Ok(false);
            }
        };
        let recovery_id = RecoveryId::from_byte(recovery_id).ok_or_else(|| {
            SignatureError::VerificationError("invalid recovery id".to_string())
        })?;

        let sig = Signature::from_slice(&raw[..64])
            .map_err(|e| SignatureError::VerificationError(e.to_string()))?;

        let digest = personal_message_hash(message);
        let key = match VerifyingKey::recover_from_prehash(&digest, &sig, recovery_id) {
            Ok(key) => key,
            Err(e) => {
                tracing::debug!(error = %e, "public key recovery failed, treating as mismatch");
                return Ok(false);
            }
        };

        Ok(address_of(&key) == claimed)
    }
}

/// Keccak-256 of the EIP-191 `personal_sign` envelope.
pub fn personal_message_hash(message: &str) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(format!("\x19Ethereum Signed Message:\n{}", message.len()).as_bytes());
    hasher.update(message.as_bytes());
    hasher.finalize().into()
}

/// The 20-byte address of a secp256k1 public key.
pub fn address_of(key: &VerifyingKey) -> [u8; ADDRESS_LEN] {
    let point = key.as_affine().to_encoded_point(false);
    let hash = Keccak256::digest(&point.as_bytes()[1..]);
    let mut out = [0u8; ADDRESS_LEN];
    out.copy_from_slice(&hash[12..]);
    out
}

/// `0x`-prefixed lower-case hex form of an address.
pub fn format_address(address: &[u8; ADDRESS_LEN]) -> String {
    format!("0x{}", hex::encode(address))
}

fn strip_hex_prefix(s: &str) -> &str {
    s.strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s)
}

fn parse_address(address: &str) -> Result<[u8; ADDRESS_LEN], SignatureError> {
    let hex_part = strip_hex_prefix(address.trim());
    if hex_part.len() != ADDRESS_LEN * 2 {
        return Err(SignatureError::MalformedInput(format!(
            "address must be {} hex characters",
            ADDRESS_LEN * 2
        )));
    }
    let mut out = [0u8; ADDRESS_LEN];
    hex::decode_to_slice(hex_part, &mut out)
        .map_err(|e| SignatureError::MalformedInput(format!("address: {}", e)))?;
    Ok(out)
}

fn parse_signature(signature: &str) -> Result<[u8; SIGNATURE_LEN], SignatureError> {
    let hex_part = strip_hex_prefix(signature.trim());
    if hex_part.len() != SIGNATURE_LEN * 2 {
        return Err(SignatureError::MalformedInput(format!(
            "signature must be {} hex characters",
            SIGNATURE_LEN * 2
        )));
    }
    let mut out = [0u8; SIGNATURE_LEN];
    hex::decode_to_slice(hex_part, &mut out)
        .map_err(|e| SignatureError::MalformedInput(format!("signature: {}", e)))?;
    Ok(out)
}
