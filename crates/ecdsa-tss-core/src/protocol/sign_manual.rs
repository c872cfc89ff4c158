//! Manual signing completion
//!
//! After the offline stage every signer computes `s_i = m·k_i + r·σ_i`
//! locally. The partials are exchanged out of band and any signer holding
//! all of them can sum, normalize and verify the final signature.

use k256::{
    ProjectivePoint, Scalar,
    elliptic_curve::{point::AffineCoordinates, scalar::IsHigh},
};
use std::collections::BTreeMap;
use tracing::debug;

use super::{CompletedOfflineStage, decode_point, reduce_scalar, scalar_bytes};
use crate::{CurveScalar, Error, MessageHash, PartialSignature, PartyId, Result, SignatureRecid};

/// Offline stage output bound to a message hash
#[derive(Debug)]
pub struct SignManual {
    completed: CompletedOfflineStage,
    message_hash: MessageHash,
    r: Scalar,
    recid: u8,
    partial: PartialSignature,
}

impl SignManual {
    /// Bind a completed offline stage to the message to be signed
    pub fn new(completed: CompletedOfflineStage, message_hash: MessageHash) -> Result<Self> {
        let r_point = decode_point(&completed.r_point)?;
        let (r, recid) = nonce_scalar(&r_point)?;

        let m = reduce_scalar(&message_hash);
        let k = reduce_scalar(&completed.k_share);
        let sigma = reduce_scalar(&completed.sigma_share);
        let s_i = m * k + r * sigma;

        let partial = PartialSignature {
            party: completed.i,
            share: CurveScalar::secp256k1(scalar_bytes(&s_i)),
        };

        Ok(Self {
            completed,
            message_hash,
            r,
            recid,
            partial,
        })
    }

    /// This signer's index
    pub fn party(&self) -> PartyId {
        self.completed.i
    }

    /// Signer set, ascending
    pub fn signers(&self) -> &[PartyId] {
        &self.completed.signers
    }

    /// Hash being signed
    pub fn message_hash(&self) -> &MessageHash {
        &self.message_hash
    }

    /// Joint public key (compressed SEC1)
    pub fn public_key(&self) -> &[u8] {
        &self.completed.public_key
    }

    /// Underlying offline stage output
    pub fn completed(&self) -> &CompletedOfflineStage {
        &self.completed
    }

    /// This signer's partial signature, to be sent to the completer
    pub fn partial_signature(&self) -> &PartialSignature {
        &self.partial
    }

    /// Combine the partials of every other signer into the final signature
    ///
    /// Returns `Ok(None)` while partials from some signers are still missing.
    /// Order does not matter; a repeated signer keeps its first partial.
    pub fn complete(&self, partials: &[PartialSignature]) -> Result<Option<SignatureRecid>> {
        let mut shares: BTreeMap<PartyId, Scalar> = BTreeMap::new();

        for partial in partials {
            if partial.party == self.party() {
                return Err(Error::InvalidSigningParties(format!(
                    "party {} passed its own partial signature",
                    partial.party
                )));
            }
            if !self.signers().contains(&partial.party) {
                return Err(Error::InvalidSigningParties(format!(
                    "party {} is not a signer",
                    partial.party
                )));
            }
            let share = reduce_scalar(&partial.share.to_array()?);
            shares.entry(partial.party).or_insert(share);
        }

        let required = self.signers().len() - 1;
        if shares.len() < required {
            debug!(
                party = self.party(),
                have = shares.len(),
                required,
                "waiting for more partial signatures"
            );
            return Ok(None);
        }

        let own = reduce_scalar(&self.partial.share.to_array()?);
        let s = shares.values().fold(own, |acc, share| acc + share);
        if s == Scalar::ZERO {
            return Err(Error::Crypto("signature s is zero".into()));
        }

        // Low-s form negates the nonce, which flips the parity of R.y
        let (s, recid) = if bool::from(s.is_high()) {
            (-s, self.recid ^ 1)
        } else {
            (s, self.recid)
        };

        let signature = SignatureRecid::new(scalar_bytes(&self.r), scalar_bytes(&s), recid);
        signature.verify(self.public_key(), &self.message_hash)?;
        if signature.recover(&self.message_hash)? != self.public_key() {
            return Err(Error::InvalidSignature(
                "recovered key does not match the public key".into(),
            ));
        }

        Ok(Some(signature))
    }
}

/// `r = R.x mod q` and the recovery id of `R`
fn nonce_scalar(r_point: &ProjectivePoint) -> Result<(Scalar, u8)> {
    let affine = r_point.to_affine();
    let mut x = [0u8; 32];
    x.copy_from_slice(&affine.x());
    let r = reduce_scalar(&x);
    if r == Scalar::ZERO {
        return Err(Error::Crypto("nonce point has zero x-coordinate".into()));
    }

    let y_odd = u8::from(bool::from(affine.y_is_odd()));
    let x_reduced = u8::from(scalar_bytes(&r) != x);
    Ok((r, y_odd | (x_reduced << 1)))
}
