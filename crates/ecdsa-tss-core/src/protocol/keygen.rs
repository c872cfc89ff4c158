//! Distributed key generation
//!
//! Feldman VSS in four rounds. Each party first broadcasts a hash commitment
//! to its coefficient commitments and only opens it once every peer has
//! committed, so no party can choose its polynomial after seeing the others.
//!
//! 1. `Round1` broadcast: `H(blind, C_0..C_t)`
//! 2. `Round2` broadcast: `blind, C_0..C_t`
//! 3. `Round3` point-to-point: `f_i(j)` for every peer `j`
//! 4. `Round4` broadcast: `x_i·G`, cross-checked by every peer

use k256::{ProjectivePoint, Scalar, elliptic_curve::Field};
use rand::{RngCore, rngs::OsRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use tracing::{debug, info};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::{
    ProtocolHandle, RoundStore, check_addressing, decode_point, decode_scalar, encode_point,
    hash_commitment, lagrange_coefficient, party_scalar, reduce_scalar, scalar_bytes,
};
use crate::{Envelope, Error, PartyId, Result, RoundPayload, RoundTag};

const KEYGEN_ROUNDS: u16 = 4;

/// Round 1 broadcast
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeygenCommit {
    /// SHA-256 over the blinding factor and the coefficient commitments
    pub commitment: Vec<u8>,
}

/// Round 2 broadcast, opening the round 1 commitment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeygenDecommit {
    /// Blinding factor (32 bytes)
    pub blind: Vec<u8>,
    /// Feldman commitments `a_k·G` to each coefficient, lowest degree first
    pub coefficients: Vec<Vec<u8>>,
}

/// Round 3 point-to-point share
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct KeygenShare {
    /// Sender's polynomial evaluated at the receiver's index
    pub share: Vec<u8>,
}

impl fmt::Debug for KeygenShare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeygenShare")
            .field("share", &"[REDACTED]")
            .finish()
    }
}

/// Round 4 broadcast
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeygenPublicShare {
    /// Sender's public share `x_i·G`
    pub public_share: Vec<u8>,
}

/// Keygen output for one party
///
/// Serializable so it can be stored and handed to the offline stage. The
/// secret share is wiped when the key is dropped.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct LocalKey {
    /// This party's index
    #[zeroize(skip)]
    pub i: PartyId,
    /// Threshold (any `t + 1` parties can sign)
    #[zeroize(skip)]
    pub t: u16,
    /// Number of parties
    #[zeroize(skip)]
    pub n: u16,
    /// Secret share `x_i` (big-endian)
    secret_share: [u8; 32],
    /// Joint public key (compressed SEC1)
    #[zeroize(skip)]
    pub public_key: Vec<u8>,
    /// Public shares `x_j·G` for `j = 1..=n` (compressed SEC1)
    #[zeroize(skip)]
    pub public_shares: Vec<Vec<u8>>,
}

impl LocalKey {
    /// Get the joint public key as hex
    pub fn public_key_hex(&self) -> String {
        hex::encode(&self.public_key)
    }

    /// Check internal consistency of a key loaded from storage
    ///
    /// Verifies the index and threshold bounds, that the secret share matches
    /// this party's public share, and that the first `t + 1` public shares
    /// interpolate to the joint public key.
    pub fn validate(&self) -> Result<()> {
        validate_parameters(self.i, self.t, self.n)?;
        if self.public_shares.len() != usize::from(self.n) {
            return Err(Error::InvalidConfig(format!(
                "expected {} public shares, got {}",
                self.n,
                self.public_shares.len()
            )));
        }

        if ProjectivePoint::GENERATOR * self.secret_share() != self.public_share(self.i)? {
            return Err(Error::VerificationFailed(
                "secret share does not match its public share".into(),
            ));
        }

        let set: Vec<PartyId> = (1..=self.t + 1).collect();
        let mut interpolated = ProjectivePoint::IDENTITY;
        for &j in &set {
            interpolated += self.public_share(j)? * lagrange_coefficient(j, &set)?;
        }
        if interpolated != decode_point(&self.public_key)? {
            return Err(Error::VerificationFailed(
                "public shares do not interpolate to the public key".into(),
            ));
        }

        Ok(())
    }

    pub(crate) fn secret_share(&self) -> Scalar {
        reduce_scalar(&self.secret_share)
    }

    pub(crate) fn public_share(&self, party: PartyId) -> Result<ProjectivePoint> {
        let bytes = usize::from(party)
            .checked_sub(1)
            .and_then(|idx| self.public_shares.get(idx))
            .ok_or(Error::InvalidPartyId(party))?;
        decode_point(bytes)
    }
}

impl fmt::Debug for LocalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalKey")
            .field("i", &self.i)
            .field("t", &self.t)
            .field("n", &self.n)
            .field("secret_share", &"[REDACTED]")
            .field("public_key", &hex::encode(&self.public_key))
            .finish()
    }
}

fn validate_parameters(i: PartyId, t: u16, n: u16) -> Result<()> {
    if t == 0 || t >= n {
        return Err(Error::InvalidConfig(format!(
            "threshold {} must satisfy 1 <= t < n = {}",
            t, n
        )));
    }
    if i == 0 || i > n {
        return Err(Error::InvalidPartyId(i));
    }
    Ok(())
}

/// Secret polynomial of degree `t`, wiped on drop
struct Polynomial {
    coefficients: Vec<Scalar>,
}

impl Polynomial {
    fn random(degree: u16) -> Self {
        let coefficients = (0..=degree).map(|_| Scalar::random(&mut OsRng)).collect();
        Self { coefficients }
    }

    /// Evaluate at a party index using Horner's method
    fn evaluate(&self, x: PartyId) -> Scalar {
        let x = party_scalar(x);
        self.coefficients
            .iter()
            .rev()
            .fold(Scalar::ZERO, |acc, coef| acc * x + coef)
    }

    fn commitments(&self) -> Vec<ProjectivePoint> {
        self.coefficients
            .iter()
            .map(|coef| ProjectivePoint::GENERATOR * coef)
            .collect()
    }
}

impl Drop for Polynomial {
    fn drop(&mut self) {
        self.coefficients.zeroize();
    }
}

/// Evaluate Feldman commitments "in the exponent" at a party index
fn evaluate_commitments(commitments: &[ProjectivePoint], x: PartyId) -> ProjectivePoint {
    let x = party_scalar(x);
    commitments
        .iter()
        .rev()
        .fold(ProjectivePoint::IDENTITY, |acc, c| acc * x + c)
}

enum Round {
    Start,
    AwaitCommits {
        secret: Polynomial,
        decommit: KeygenDecommit,
    },
    AwaitDecommits {
        secret: Polynomial,
        own_commitments: Vec<ProjectivePoint>,
        peer_commits: BTreeMap<PartyId, KeygenCommit>,
    },
    AwaitShares {
        secret: Polynomial,
        commitments: BTreeMap<PartyId, Vec<ProjectivePoint>>,
    },
    AwaitPublicShares {
        key: LocalKey,
    },
    Finished(LocalKey),
    OutputTaken,
    Failed,
}

/// Keygen round machine for one party
pub struct Keygen {
    i: PartyId,
    t: u16,
    n: u16,
    round: Round,
    commits: RoundStore<KeygenCommit>,
    decommits: RoundStore<KeygenDecommit>,
    shares: RoundStore<KeygenShare>,
    public_shares: RoundStore<KeygenPublicShare>,
    outgoing: VecDeque<Envelope>,
}

impl Keygen {
    /// Create a keygen run for party `i` of `n` with threshold `t`
    pub fn new(i: PartyId, t: u16, n: u16) -> Result<Self> {
        validate_parameters(i, t, n)?;
        Ok(Self {
            i,
            t,
            n,
            round: Round::Start,
            commits: RoundStore::new(i, 1..=n),
            decommits: RoundStore::new(i, 1..=n),
            shares: RoundStore::new(i, 1..=n),
            public_shares: RoundStore::new(i, 1..=n),
            outgoing: VecDeque::new(),
        })
    }

    /// Threshold of the key being generated
    pub fn threshold(&self) -> u16 {
        self.t
    }

    fn broadcast<T: Serialize>(&mut self, tag: RoundTag, message: &T) -> Result<()> {
        let body = RoundPayload::encode(tag, message)?;
        self.outgoing.push_back(Envelope::broadcast(self.i, body));
        Ok(())
    }

    fn send_to<T: Serialize>(&mut self, to: PartyId, tag: RoundTag, message: &T) -> Result<()> {
        let body = RoundPayload::encode(tag, message)?;
        self.outgoing.push_back(Envelope::p2p(self.i, to, body));
        Ok(())
    }

    fn commit(&mut self) -> Result<Round> {
        let secret = Polynomial::random(self.t);
        let coefficients: Vec<Vec<u8>> = secret.commitments().iter().map(encode_point).collect();

        let mut blind = [0u8; 32];
        OsRng.fill_bytes(&mut blind);
        let commitment = hash_commitment(&blind, &coefficients);

        self.broadcast(
            RoundTag::Round1,
            &KeygenCommit {
                commitment: commitment.to_vec(),
            },
        )?;
        debug!(party = self.i, "keygen round 1: committed to polynomial");

        Ok(Round::AwaitCommits {
            secret,
            decommit: KeygenDecommit {
                blind: blind.to_vec(),
                coefficients,
            },
        })
    }

    fn open_commitment(&mut self, secret: Polynomial, decommit: KeygenDecommit) -> Result<Round> {
        let peer_commits = self.commits.take()?;
        let own_commitments = decommit
            .coefficients
            .iter()
            .map(|c| decode_point(c))
            .collect::<Result<Vec<_>>>()?;

        self.broadcast(RoundTag::Round2, &decommit)?;
        debug!(party = self.i, "keygen round 2: opened commitment");

        Ok(Round::AwaitDecommits {
            secret,
            own_commitments,
            peer_commits,
        })
    }

    fn distribute_shares(
        &mut self,
        secret: Polynomial,
        own_commitments: Vec<ProjectivePoint>,
        peer_commits: BTreeMap<PartyId, KeygenCommit>,
    ) -> Result<Round> {
        let decommits = self.decommits.take()?;
        let mut commitments = BTreeMap::new();

        for (sender, decommit) in decommits {
            let committed = peer_commits.get(&sender).ok_or_else(|| {
                Error::ProtocolState(format!("no commitment recorded for party {}", sender))
            })?;
            let blind: [u8; 32] = decommit.blind.as_slice().try_into().map_err(|_| {
                Error::VerificationFailed(format!("party {} sent a malformed blind", sender))
            })?;
            if hash_commitment(&blind, &decommit.coefficients).as_slice()
                != committed.commitment.as_slice()
            {
                return Err(Error::VerificationFailed(format!(
                    "decommitment from party {} does not match its commitment",
                    sender
                )));
            }
            if decommit.coefficients.len() != usize::from(self.t) + 1 {
                return Err(Error::VerificationFailed(format!(
                    "party {} committed to {} coefficients, expected {}",
                    sender,
                    decommit.coefficients.len(),
                    self.t + 1
                )));
            }

            let points = decommit
                .coefficients
                .iter()
                .map(|c| decode_point(c))
                .collect::<Result<Vec<_>>>()?;
            commitments.insert(sender, points);
        }
        commitments.insert(self.i, own_commitments);

        let me = self.i;
        for j in (1..=self.n).filter(|j| *j != me) {
            let share = KeygenShare {
                share: scalar_bytes(&secret.evaluate(j)).to_vec(),
            };
            self.send_to(j, RoundTag::Round3, &share)?;
        }
        debug!(party = self.i, "keygen round 3: sent shares");

        Ok(Round::AwaitShares {
            secret,
            commitments,
        })
    }

    fn combine_shares(
        &mut self,
        secret: Polynomial,
        commitments: BTreeMap<PartyId, Vec<ProjectivePoint>>,
    ) -> Result<Round> {
        let shares = self.shares.take()?;
        let mut x_i = secret.evaluate(self.i);

        for (sender, message) in &shares {
            let share = decode_scalar(&message.share)?;
            let sender_commitments = commitments.get(sender).ok_or_else(|| {
                Error::ProtocolState(format!("no commitments recorded for party {}", sender))
            })?;

            if ProjectivePoint::GENERATOR * share != evaluate_commitments(sender_commitments, self.i) {
                return Err(Error::VerificationFailed(format!(
                    "share from party {} does not match its commitments",
                    sender
                )));
            }
            x_i += share;
        }

        // The constant terms sum to the joint public key
        let public_key = commitments
            .values()
            .fold(ProjectivePoint::IDENTITY, |acc, c| acc + evaluate_commitments(c, 0));
        let public_shares: Vec<Vec<u8>> = (1..=self.n)
            .map(|j| {
                let point = commitments
                    .values()
                    .fold(ProjectivePoint::IDENTITY, |acc, c| acc + evaluate_commitments(c, j));
                encode_point(&point)
            })
            .collect();

        let own_public = ProjectivePoint::GENERATOR * x_i;
        let key = LocalKey {
            i: self.i,
            t: self.t,
            n: self.n,
            secret_share: scalar_bytes(&x_i),
            public_key: encode_point(&public_key),
            public_shares,
        };
        x_i.zeroize();

        if key.public_share(self.i)? != own_public {
            return Err(Error::VerificationFailed(
                "combined share does not match the public share".into(),
            ));
        }

        self.broadcast(
            RoundTag::Round4,
            &KeygenPublicShare {
                public_share: encode_point(&own_public),
            },
        )?;
        debug!(party = self.i, "keygen round 4: broadcast public share");

        Ok(Round::AwaitPublicShares { key })
    }

    fn confirm_public_shares(&mut self, key: LocalKey) -> Result<Round> {
        let received = self.public_shares.take()?;

        for (sender, message) in &received {
            if decode_point(&message.public_share)? != key.public_share(*sender)? {
                return Err(Error::VerificationFailed(format!(
                    "public share of party {} disagrees with the commitments",
                    sender
                )));
            }
        }

        info!(
            party = self.i,
            public_key = %key.public_key_hex(),
            "Keygen complete"
        );
        Ok(Round::Finished(key))
    }
}

impl ProtocolHandle for Keygen {
    type Output = LocalKey;

    fn party_index(&self) -> PartyId {
        self.i
    }

    fn parties(&self) -> u16 {
        self.n
    }

    fn current_round(&self) -> u16 {
        match self.round {
            Round::Start => 0,
            Round::AwaitCommits { .. } => 1,
            Round::AwaitDecommits { .. } => 2,
            Round::AwaitShares { .. } => 3,
            Round::AwaitPublicShares { .. }
            | Round::Finished(_)
            | Round::OutputTaken
            | Round::Failed => KEYGEN_ROUNDS,
        }
    }

    fn total_rounds(&self) -> Option<u16> {
        Some(KEYGEN_ROUNDS)
    }

    fn wants_to_proceed(&self) -> bool {
        match self.round {
            Round::Start => true,
            Round::AwaitCommits { .. } => !self.commits.wants_more(),
            Round::AwaitDecommits { .. } => !self.decommits.wants_more(),
            Round::AwaitShares { .. } => !self.shares.wants_more(),
            Round::AwaitPublicShares { .. } => !self.public_shares.wants_more(),
            Round::Finished(_) | Round::OutputTaken | Round::Failed => false,
        }
    }

    fn proceed(&mut self) -> Result<()> {
        if !self.wants_to_proceed() {
            return Err(Error::ProtocolState(format!(
                "keygen party {} cannot proceed in round {}",
                self.i,
                self.current_round()
            )));
        }

        self.round = match std::mem::replace(&mut self.round, Round::Failed) {
            Round::Start => self.commit()?,
            Round::AwaitCommits { secret, decommit } => self.open_commitment(secret, decommit)?,
            Round::AwaitDecommits {
                secret,
                own_commitments,
                peer_commits,
            } => self.distribute_shares(secret, own_commitments, peer_commits)?,
            Round::AwaitShares {
                secret,
                commitments,
            } => self.combine_shares(secret, commitments)?,
            Round::AwaitPublicShares { key } => self.confirm_public_shares(key)?,
            other => other,
        };
        Ok(())
    }

    fn has_outgoing(&self) -> bool {
        !self.outgoing.is_empty()
    }

    fn drain_one_outgoing(&mut self) -> Option<Envelope> {
        self.outgoing.pop_front()
    }

    fn receive_incoming(&mut self, envelope: Envelope) -> Result<()> {
        let sender = envelope.sender;
        match envelope.round() {
            RoundTag::Round1 => {
                check_addressing(&envelope, self.i, false)?;
                self.commits.push(sender, envelope.body.decode()?)
            }
            RoundTag::Round2 => {
                check_addressing(&envelope, self.i, false)?;
                self.decommits.push(sender, envelope.body.decode()?)
            }
            RoundTag::Round3 => {
                check_addressing(&envelope, self.i, true)?;
                self.shares.push(sender, envelope.body.decode()?)
            }
            RoundTag::Round4 => {
                check_addressing(&envelope, self.i, false)?;
                self.public_shares.push(sender, envelope.body.decode()?)
            }
            other => Err(Error::UnexpectedMessage(format!(
                "keygen does not accept {} messages",
                other
            ))),
        }
    }

    fn is_finished(&self) -> bool {
        matches!(self.round, Round::Finished(_) | Round::OutputTaken)
    }

    fn take_output(&mut self) -> Option<Result<LocalKey>> {
        match std::mem::replace(&mut self.round, Round::OutputTaken) {
            Round::Finished(key) => Some(Ok(key)),
            Round::OutputTaken => Some(Err(Error::ProtocolState(
                "keygen output already taken".into(),
            ))),
            other => {
                self.round = other;
                None
            }
        }
    }
}
