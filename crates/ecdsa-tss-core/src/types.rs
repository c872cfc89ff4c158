//! Core types shared by the round machines, the driver and the router

use k256::ecdsa::{
    self, RecoveryId, VerifyingKey,
    signature::hazmat::PrehashVerifier,
};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Error, Result};

/// Party index in `[1, n]`, stable for the lifetime of a protocol run
pub type PartyId = u16;

/// 32-byte message hash to be signed
pub type MessageHash = [u8; 32];

/// Interpret `bytes` as a message hash; exactly 32 bytes are required
pub fn message_hash_from_slice(bytes: &[u8]) -> Result<MessageHash> {
    bytes.try_into().map_err(|_| {
        Error::InvalidConfig(format!(
            "message hash must be 32 bytes, got {}",
            bytes.len()
        ))
    })
}

/// Curve name carried in serialized scalars
pub const CURVE_NAME: &str = "secp256k1";

/// A big-endian scalar tagged with its curve
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurveScalar {
    /// Curve name (always `secp256k1`)
    pub curve: String,
    /// Big-endian scalar bytes
    pub scalar: Vec<u8>,
}

impl CurveScalar {
    /// Wrap a secp256k1 scalar
    pub fn secp256k1(bytes: [u8; 32]) -> Self {
        Self {
            curve: CURVE_NAME.to_string(),
            scalar: bytes.to_vec(),
        }
    }

    /// Get the scalar as a fixed 32-byte array
    pub fn to_array(&self) -> Result<[u8; 32]> {
        if self.curve != CURVE_NAME {
            return Err(Error::InvalidSignature(format!(
                "unsupported curve {}",
                self.curve
            )));
        }
        self.scalar
            .as_slice()
            .try_into()
            .map_err(|_| Error::InvalidSignature("scalar must be 32 bytes".into()))
    }
}

/// ECDSA signature with recovery id
///
/// Serialized as `{"r": {..}, "s": {..}, "recid": n}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureRecid {
    /// R component (x-coordinate of the nonce point, reduced)
    pub r: CurveScalar,
    /// S component (low-s normalized)
    pub s: CurveScalar,
    /// Recovery ID (0..=3)
    #[serde(alias = "recoveryId")]
    pub recid: u8,
}

impl SignatureRecid {
    /// Create a signature from raw components
    pub fn new(r: [u8; 32], s: [u8; 32], recid: u8) -> Self {
        Self {
            r: CurveScalar::secp256k1(r),
            s: CurveScalar::secp256k1(s),
            recid,
        }
    }

    /// Convert to a k256 signature
    pub fn to_ecdsa(&self) -> Result<ecdsa::Signature> {
        let r = self.r.to_array()?;
        let s = self.s.to_array()?;
        ecdsa::Signature::from_scalars(
            *k256::FieldBytes::from_slice(&r),
            *k256::FieldBytes::from_slice(&s),
        )
        .map_err(|e| Error::InvalidSignature(e.to_string()))
    }

    /// Convert to bytes (r || s)
    pub fn to_bytes(&self) -> Result<[u8; 64]> {
        let mut bytes = [0u8; 64];
        bytes[..32].copy_from_slice(&self.r.to_array()?);
        bytes[32..].copy_from_slice(&self.s.to_array()?);
        Ok(bytes)
    }

    /// Verify against a compressed or uncompressed SEC1 public key
    pub fn verify(&self, public_key: &[u8], message_hash: &MessageHash) -> Result<()> {
        let key = VerifyingKey::from_sec1_bytes(public_key)
            .map_err(|e| Error::Crypto(e.to_string()))?;
        key.verify_prehash(message_hash, &self.to_ecdsa()?)
            .map_err(|e| Error::InvalidSignature(e.to_string()))
    }

    /// Recover the signing public key (compressed SEC1)
    pub fn recover(&self, message_hash: &MessageHash) -> Result<Vec<u8>> {
        let recid = RecoveryId::from_byte(self.recid)
            .ok_or_else(|| Error::InvalidSignature(format!("bad recovery id {}", self.recid)))?;
        let key = VerifyingKey::recover_from_prehash(message_hash, &self.to_ecdsa()?, recid)
            .map_err(|e| Error::InvalidSignature(e.to_string()))?;
        Ok(key.to_encoded_point(true).as_bytes().to_vec())
    }
}

impl fmt::Display for SignatureRecid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "r={} s={} recid={}",
            hex::encode(&self.r.scalar),
            hex::encode(&self.s.scalar),
            self.recid
        )
    }
}

/// One signer's share of the final signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialSignature {
    /// Signer that produced this partial
    pub party: PartyId,
    /// Additive share of `s`
    pub share: CurveScalar,
}
