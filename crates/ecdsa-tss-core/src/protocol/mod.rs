//! Round-based protocol state machines
//!
//! The driver never looks inside a protocol run. It only talks to a
//! [`ProtocolHandle`]: it asks whether the handle is ready, lets it proceed,
//! drains the envelopes it produced and hands it newly arrived envelopes.
//!
//! Three reference machines live here:
//! - [`Keygen`]: 4-round distributed key generation producing a [`LocalKey`]
//! - [`OfflineStage`]: 6-round signing precomputation producing a [`SignManual`]
//! - [`SignManual`]: one-shot completion from partial signatures
//!
//! The machines run on secp256k1 and yield verifiable ECDSA signatures, but
//! the multiplicative-to-additive exchange of the offline stage is simulated
//! in the clear. They exist to exercise the driver and router, not to protect
//! key material against the other parties.

mod keygen;
mod offline;
mod sign_manual;
mod store;

pub use keygen::{Keygen, KeygenCommit, KeygenDecommit, KeygenPublicShare, KeygenShare, LocalKey};
pub use offline::{
    CompletedOfflineStage, OfflineCommit, OfflineConsistency, OfflineDecommit, OfflineDelta,
    OfflineMtaRequest, OfflineMtaResponse, OfflineStage,
};
pub use sign_manual::SignManual;
pub(crate) use store::RoundStore;

use std::collections::BTreeSet;

use k256::{
    AffinePoint, ProjectivePoint, Scalar,
    elliptic_curve::{
        bigint::U256,
        ops::Reduce,
        sec1::{FromEncodedPoint, ToEncodedPoint},
    },
};
use sha2::{Digest, Sha256};

use crate::{Envelope, Error, PartyId, Receiver, Result};

/// Capability set of one party's protocol run
///
/// A handle is owned by exactly one driver and is released when dropped.
/// Implementations are not required to be thread-safe beyond `Send`: the
/// driver never calls into a handle concurrently.
pub trait ProtocolHandle: Send + 'static {
    /// Value produced when the run finishes
    type Output: Send + 'static;

    /// This party's index
    fn party_index(&self) -> PartyId;

    /// Number of parties taking part in this run
    fn parties(&self) -> u16;

    /// Current internal round (0 before the first step)
    fn current_round(&self) -> u16;

    /// Total number of message rounds, if known
    fn total_rounds(&self) -> Option<u16>;

    /// Check if enough input is buffered to take the next step
    fn wants_to_proceed(&self) -> bool;

    /// Take one step; only valid when [`wants_to_proceed`](Self::wants_to_proceed) is true
    fn proceed(&mut self) -> Result<()>;

    /// Check if outgoing envelopes are waiting to be drained
    fn has_outgoing(&self) -> bool;

    /// Remove the oldest outgoing envelope
    fn drain_one_outgoing(&mut self) -> Option<Envelope>;

    /// Buffer one incoming envelope without advancing
    fn receive_incoming(&mut self, envelope: Envelope) -> Result<()>;

    /// Check if the run has produced its output
    fn is_finished(&self) -> bool;

    /// Take the output; `None` until finished, an error on a second take
    fn take_output(&mut self) -> Option<Result<Self::Output>>;
}

/// Check that a round message arrived with the addressing its round uses
pub(crate) fn check_addressing(envelope: &Envelope, me: PartyId, p2p: bool) -> Result<()> {
    match (envelope.receiver, p2p) {
        (Receiver::Broadcast, false) => Ok(()),
        (Receiver::Unicast(to), true) if to == me => Ok(()),
        (receiver, _) => Err(Error::UnexpectedMessage(format!(
            "{} message from party {} misaddressed to {}",
            envelope.round(),
            envelope.sender,
            receiver
        ))),
    }
}

/// Hash commitment over a blinding factor and a list of encoded values
pub(crate) fn hash_commitment(blind: &[u8; 32], values: &[Vec<u8>]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(blind);
    for value in values {
        hasher.update((value.len() as u32).to_be_bytes());
        hasher.update(value);
    }
    hasher.finalize().into()
}

/// Encode a point as compressed SEC1
pub(crate) fn encode_point(point: &ProjectivePoint) -> Vec<u8> {
    point.to_affine().to_encoded_point(true).as_bytes().to_vec()
}

/// Decode a SEC1 point
pub(crate) fn decode_point(bytes: &[u8]) -> Result<ProjectivePoint> {
    let encoded =
        k256::EncodedPoint::from_bytes(bytes).map_err(|e| Error::VerificationFailed(e.to_string()))?;
    let affine_opt = AffinePoint::from_encoded_point(&encoded);
    let affine: AffinePoint = Option::<AffinePoint>::from(affine_opt)
        .ok_or_else(|| Error::VerificationFailed("Invalid curve point".into()))?;
    Ok(ProjectivePoint::from(affine))
}

/// Encode a scalar as 32 big-endian bytes
pub(crate) fn scalar_bytes(scalar: &Scalar) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&scalar.to_bytes());
    out
}

/// Decode 32 big-endian bytes, reducing modulo the group order
pub(crate) fn reduce_scalar(bytes: &[u8; 32]) -> Scalar {
    <Scalar as Reduce<U256>>::reduce_bytes(&(*bytes).into())
}

/// Decode a variable-length scalar field
pub(crate) fn decode_scalar(bytes: &[u8]) -> Result<Scalar> {
    let array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::VerificationFailed("Invalid scalar length".into()))?;
    Ok(reduce_scalar(&array))
}

/// Party index as a polynomial evaluation point
pub(crate) fn party_scalar(party: PartyId) -> Scalar {
    Scalar::from(u64::from(party))
}

/// Lagrange coefficient at zero for `party` within `set`
pub(crate) fn lagrange_coefficient(party: PartyId, set: &[PartyId]) -> Result<Scalar> {
    let unique: BTreeSet<PartyId> = set.iter().copied().collect();
    if unique.len() != set.len() || !unique.contains(&party) {
        return Err(Error::InvalidSigningParties(format!(
            "invalid Lagrange set {:?} for party {}",
            set, party
        )));
    }

    let xi = party_scalar(party);
    let mut numerator = Scalar::ONE;
    let mut denominator = Scalar::ONE;

    for &other in set {
        if other == party {
            continue;
        }
        let xj = party_scalar(other);
        numerator *= xj;
        denominator *= xj - xi;
    }

    let inverse = Option::<Scalar>::from(denominator.invert())
        .ok_or_else(|| Error::Crypto("Lagrange denominator is zero".into()))?;
    Ok(numerator * inverse)
}
