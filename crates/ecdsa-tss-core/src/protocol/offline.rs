//! Signing precomputation (offline stage)
//!
//! Runs among a signer set `S` of at least `t + 1` keygen parties and leaves
//! each signer with additive shares of `k` and `k·x` plus the joint nonce
//! point `R = k⁻¹·G`. Once the message is known, every signer turns these
//! into a partial signature without further interaction.
//!
//! | Round | Kind | Content |
//! |---|---|---|
//! | M1 | broadcast | commitment to `Γ_i = γ_i·G` |
//! | M2 | p2p | MtA request (`k_i`) |
//! | M3 | p2p | MtA response (`α`, `μ`) |
//! | M4 | broadcast | `δ_i`, a share of `k·γ` |
//! | M5 | broadcast | opening of `Γ_i` |
//! | M6 | broadcast | `k_i·R`, summing to `G` |
//!
//! The multiplicative-to-additive exchange is carried out in the clear, so a
//! peer learns the sender's `k_i`. It produces correct shares but gives no
//! secrecy against the other signers.

use k256::{ProjectivePoint, Scalar, elliptic_curve::Field};
use rand::{RngCore, rngs::OsRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use tracing::{debug, info};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::{
    LocalKey, ProtocolHandle, RoundStore, SignManual, check_addressing, decode_point,
    decode_scalar, encode_point, hash_commitment, lagrange_coefficient, scalar_bytes,
};
use crate::{Envelope, Error, MessageHash, PartyId, Result, RoundPayload, RoundTag};

const OFFLINE_ROUNDS: u16 = 6;

/// M1 broadcast
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineCommit {
    /// SHA-256 over the blinding factor and `Γ_i`
    pub commitment: Vec<u8>,
}

/// M2 point-to-point
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineMtaRequest {
    /// Sender's nonce share `k_i`
    pub k: Vec<u8>,
}

/// M3 point-to-point
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineMtaResponse {
    /// `k_j·γ_i − β`, the receiver's share of `k_j·γ_i`
    pub alpha: Vec<u8>,
    /// `k_j·w_i − ν`, the receiver's share of `k_j·w_i`
    pub mu: Vec<u8>,
}

/// M4 broadcast
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineDelta {
    /// Sender's additive share of `k·γ`
    pub delta: Vec<u8>,
}

/// M5 broadcast, opening the M1 commitment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineDecommit {
    /// Blinding factor (32 bytes)
    pub blind: Vec<u8>,
    /// `Γ_i` (compressed SEC1)
    pub gamma_point: Vec<u8>,
}

/// M6 broadcast
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineConsistency {
    /// `k_i·R` (compressed SEC1)
    pub r_share: Vec<u8>,
}

/// Offline stage output for one signer
///
/// Holds everything needed to produce a partial signature for any message.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct CompletedOfflineStage {
    /// This signer's keygen index
    #[zeroize(skip)]
    pub i: PartyId,
    /// Signer set, ascending
    #[zeroize(skip)]
    pub signers: Vec<PartyId>,
    /// Joint nonce point `R` (compressed SEC1)
    #[zeroize(skip)]
    pub r_point: Vec<u8>,
    /// Additive share of `k`
    pub(crate) k_share: [u8; 32],
    /// Additive share of `k·x`
    pub(crate) sigma_share: [u8; 32],
    /// Joint public key (compressed SEC1)
    #[zeroize(skip)]
    pub public_key: Vec<u8>,
}

impl fmt::Debug for CompletedOfflineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletedOfflineStage")
            .field("i", &self.i)
            .field("signers", &self.signers)
            .field("r_point", &hex::encode(&self.r_point))
            .field("k_share", &"[REDACTED]")
            .field("sigma_share", &"[REDACTED]")
            .finish()
    }
}

/// Per-run secrets, wiped on drop
struct Nonces {
    k: Scalar,
    gamma: Scalar,
    w: Scalar,
    blind: [u8; 32],
}

impl Nonces {
    fn generate(w: Scalar) -> Self {
        let mut blind = [0u8; 32];
        OsRng.fill_bytes(&mut blind);
        Self {
            k: Scalar::random(&mut OsRng),
            gamma: Scalar::random(&mut OsRng),
            w,
            blind,
        }
    }

    fn gamma_point(&self) -> Vec<u8> {
        encode_point(&(ProjectivePoint::GENERATOR * self.gamma))
    }
}

impl Drop for Nonces {
    fn drop(&mut self) {
        self.k.zeroize();
        self.gamma.zeroize();
        self.w.zeroize();
        self.blind.zeroize();
    }
}

enum Round {
    Start,
    AwaitCommits {
        nonces: Nonces,
    },
    AwaitRequests {
        nonces: Nonces,
        commits: BTreeMap<PartyId, OfflineCommit>,
    },
    AwaitResponses {
        nonces: Nonces,
        commits: BTreeMap<PartyId, OfflineCommit>,
        beta: Scalar,
        nu: Scalar,
    },
    AwaitDeltas {
        nonces: Nonces,
        commits: BTreeMap<PartyId, OfflineCommit>,
        delta: Scalar,
        sigma: Scalar,
    },
    AwaitDecommits {
        nonces: Nonces,
        commits: BTreeMap<PartyId, OfflineCommit>,
        delta: Scalar,
        sigma: Scalar,
    },
    AwaitConsistency {
        nonces: Nonces,
        sigma: Scalar,
        r_point: ProjectivePoint,
        own_r_share: ProjectivePoint,
    },
    Finished(SignManual),
    OutputTaken,
    Failed,
}

/// Offline stage round machine for one signer
pub struct OfflineStage {
    i: PartyId,
    signers: Vec<PartyId>,
    key: LocalKey,
    message_hash: MessageHash,
    round: Round,
    commits: RoundStore<OfflineCommit>,
    requests: RoundStore<OfflineMtaRequest>,
    responses: RoundStore<OfflineMtaResponse>,
    deltas: RoundStore<OfflineDelta>,
    decommits: RoundStore<OfflineDecommit>,
    consistency: RoundStore<OfflineConsistency>,
    outgoing: VecDeque<Envelope>,
}

impl OfflineStage {
    /// Create an offline stage run for party `i` within `signers`
    ///
    /// `message_hash` is carried through to the resulting [`SignManual`].
    pub fn new(
        i: PartyId,
        signers: Vec<PartyId>,
        key: LocalKey,
        message_hash: MessageHash,
    ) -> Result<Self> {
        if key.i != i {
            return Err(Error::InvalidConfig(format!(
                "local key belongs to party {}, not {}",
                key.i, i
            )));
        }

        let unique: BTreeSet<PartyId> = signers.iter().copied().collect();
        if unique.len() != signers.len() {
            return Err(Error::InvalidSigningParties(format!(
                "duplicate signer in {:?}",
                signers
            )));
        }
        if let Some(bad) = unique.iter().find(|p| **p == 0 || **p > key.n) {
            return Err(Error::InvalidPartyId(*bad));
        }
        if unique.len() < usize::from(key.t) + 1 {
            return Err(Error::ThresholdNotMet {
                required: usize::from(key.t) + 1,
                actual: unique.len(),
            });
        }
        if !unique.contains(&i) {
            return Err(Error::InvalidSigningParties(format!(
                "party {} is not among the signers {:?}",
                i, signers
            )));
        }

        let signers: Vec<PartyId> = unique.into_iter().collect();
        Ok(Self {
            i,
            commits: RoundStore::new(i, signers.iter().copied()),
            requests: RoundStore::new(i, signers.iter().copied()),
            responses: RoundStore::new(i, signers.iter().copied()),
            deltas: RoundStore::new(i, signers.iter().copied()),
            decommits: RoundStore::new(i, signers.iter().copied()),
            consistency: RoundStore::new(i, signers.iter().copied()),
            signers,
            key,
            message_hash,
            round: Round::Start,
            outgoing: VecDeque::new(),
        })
    }

    /// Signer set, ascending
    pub fn signers(&self) -> &[PartyId] {
        &self.signers
    }

    fn peers(&self) -> Vec<PartyId> {
        self.signers
            .iter()
            .copied()
            .filter(|p| *p != self.i)
            .collect()
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

    fn commit_gamma(&mut self) -> Result<Round> {
        let w = lagrange_coefficient(self.i, &self.signers)? * self.key.secret_share();
        let nonces = Nonces::generate(w);
        let commitment = hash_commitment(&nonces.blind, &[nonces.gamma_point()]);

        self.broadcast(
            RoundTag::M1,
            &OfflineCommit {
                commitment: commitment.to_vec(),
            },
        )?;
        debug!(party = self.i, "offline M1: committed to gamma");

        Ok(Round::AwaitCommits { nonces })
    }

    fn request_mta(&mut self, nonces: Nonces) -> Result<Round> {
        let commits = self.commits.take()?;

        let request = OfflineMtaRequest {
            k: scalar_bytes(&nonces.k).to_vec(),
        };
        for j in self.peers() {
            self.send_to(j, RoundTag::M2, &request)?;
        }
        debug!(party = self.i, "offline M2: sent MtA requests");

        Ok(Round::AwaitRequests { nonces, commits })
    }

    fn respond_mta(
        &mut self,
        nonces: Nonces,
        commits: BTreeMap<PartyId, OfflineCommit>,
    ) -> Result<Round> {
        let requests = self.requests.take()?;
        let mut beta = Scalar::ZERO;
        let mut nu = Scalar::ZERO;

        for (sender, request) in &requests {
            let k_j = decode_scalar(&request.k)?;
            let beta_ij = Scalar::random(&mut OsRng);
            let nu_ij = Scalar::random(&mut OsRng);

            let response = OfflineMtaResponse {
                alpha: scalar_bytes(&(k_j * nonces.gamma - beta_ij)).to_vec(),
                mu: scalar_bytes(&(k_j * nonces.w - nu_ij)).to_vec(),
            };
            self.send_to(*sender, RoundTag::M3, &response)?;

            beta += beta_ij;
            nu += nu_ij;
        }
        debug!(party = self.i, "offline M3: answered MtA requests");

        Ok(Round::AwaitResponses {
            nonces,
            commits,
            beta,
            nu,
        })
    }

    fn share_delta(
        &mut self,
        nonces: Nonces,
        commits: BTreeMap<PartyId, OfflineCommit>,
        beta: Scalar,
        nu: Scalar,
    ) -> Result<Round> {
        let responses = self.responses.take()?;

        let mut delta = nonces.k * nonces.gamma + beta;
        let mut sigma = nonces.k * nonces.w + nu;
        for response in responses.values() {
            delta += decode_scalar(&response.alpha)?;
            sigma += decode_scalar(&response.mu)?;
        }

        self.broadcast(
            RoundTag::M4,
            &OfflineDelta {
                delta: scalar_bytes(&delta).to_vec(),
            },
        )?;
        debug!(party = self.i, "offline M4: broadcast delta share");

        Ok(Round::AwaitDeltas {
            nonces,
            commits,
            delta,
            sigma,
        })
    }

    fn open_gamma(
        &mut self,
        nonces: Nonces,
        commits: BTreeMap<PartyId, OfflineCommit>,
        delta: Scalar,
        sigma: Scalar,
    ) -> Result<Round> {
        let deltas = self.deltas.take()?;

        let mut delta_sum = delta;
        for message in deltas.values() {
            delta_sum += decode_scalar(&message.delta)?;
        }

        self.broadcast(
            RoundTag::M5,
            &OfflineDecommit {
                blind: nonces.blind.to_vec(),
                gamma_point: nonces.gamma_point(),
            },
        )?;
        debug!(party = self.i, "offline M5: opened gamma commitment");

        Ok(Round::AwaitDecommits {
            nonces,
            commits,
            delta: delta_sum,
            sigma,
        })
    }

    fn compute_r(
        &mut self,
        nonces: Nonces,
        commits: BTreeMap<PartyId, OfflineCommit>,
        delta: Scalar,
        sigma: Scalar,
    ) -> Result<Round> {
        let decommits = self.decommits.take()?;

        let mut gamma_sum = ProjectivePoint::GENERATOR * nonces.gamma;
        for (sender, decommit) in &decommits {
            let committed = commits.get(sender).ok_or_else(|| {
                Error::ProtocolState(format!("no commitment recorded for party {}", sender))
            })?;
            let blind: [u8; 32] = decommit.blind.as_slice().try_into().map_err(|_| {
                Error::VerificationFailed(format!("party {} sent a malformed blind", sender))
            })?;
            let opened = hash_commitment(&blind, std::slice::from_ref(&decommit.gamma_point));
            if opened.as_slice() != committed.commitment.as_slice() {
                return Err(Error::VerificationFailed(format!(
                    "gamma decommitment from party {} does not match its commitment",
                    sender
                )));
            }
            gamma_sum += decode_point(&decommit.gamma_point)?;
        }

        let delta_inv = Option::<Scalar>::from(delta.invert())
            .ok_or_else(|| Error::Crypto("delta is zero".into()))?;
        let r_point = gamma_sum * delta_inv;
        let own_r_share = r_point * nonces.k;

        self.broadcast(
            RoundTag::M6,
            &OfflineConsistency {
                r_share: encode_point(&own_r_share),
            },
        )?;
        debug!(party = self.i, "offline M6: broadcast R share");

        Ok(Round::AwaitConsistency {
            nonces,
            sigma,
            r_point,
            own_r_share,
        })
    }

    fn finish(
        &mut self,
        nonces: Nonces,
        mut sigma: Scalar,
        r_point: ProjectivePoint,
        own_r_share: ProjectivePoint,
    ) -> Result<Round> {
        let shares = self.consistency.take()?;

        let mut sum = own_r_share;
        for message in shares.values() {
            sum += decode_point(&message.r_share)?;
        }
        if sum != ProjectivePoint::GENERATOR {
            return Err(Error::VerificationFailed(
                "R shares do not sum to the generator".into(),
            ));
        }

        let completed = CompletedOfflineStage {
            i: self.i,
            signers: self.signers.clone(),
            r_point: encode_point(&r_point),
            k_share: scalar_bytes(&nonces.k),
            sigma_share: scalar_bytes(&sigma),
            public_key: self.key.public_key.clone(),
        };
        sigma.zeroize();

        let sign = SignManual::new(completed, self.message_hash)?;
        info!(
            party = self.i,
            signers = ?self.signers,
            "Offline stage complete"
        );
        Ok(Round::Finished(sign))
    }
}

impl ProtocolHandle for OfflineStage {
    type Output = SignManual;

    fn party_index(&self) -> PartyId {
        self.i
    }

    fn parties(&self) -> u16 {
        self.signers.len() as u16
    }

    fn current_round(&self) -> u16 {
        match self.round {
            Round::Start => 0,
            Round::AwaitCommits { .. } => 1,
            Round::AwaitRequests { .. } => 2,
            Round::AwaitResponses { .. } => 3,
            Round::AwaitDeltas { .. } => 4,
            Round::AwaitDecommits { .. } => 5,
            Round::AwaitConsistency { .. }
            | Round::Finished(_)
            | Round::OutputTaken
            | Round::Failed => OFFLINE_ROUNDS,
        }
    }

    fn total_rounds(&self) -> Option<u16> {
        Some(OFFLINE_ROUNDS)
    }

    fn wants_to_proceed(&self) -> bool {
        match self.round {
            Round::Start => true,
            Round::AwaitCommits { .. } => !self.commits.wants_more(),
            Round::AwaitRequests { .. } => !self.requests.wants_more(),
            Round::AwaitResponses { .. } => !self.responses.wants_more(),
            Round::AwaitDeltas { .. } => !self.deltas.wants_more(),
            Round::AwaitDecommits { .. } => !self.decommits.wants_more(),
            Round::AwaitConsistency { .. } => !self.consistency.wants_more(),
            Round::Finished(_) | Round::OutputTaken | Round::Failed => false,
        }
    }

    fn proceed(&mut self) -> Result<()> {
        if !self.wants_to_proceed() {
            return Err(Error::ProtocolState(format!(
                "offline party {} cannot proceed in round {}",
                self.i,
                self.current_round()
            )));
        }

        self.round = match std::mem::replace(&mut self.round, Round::Failed) {
            Round::Start => self.commit_gamma()?,
            Round::AwaitCommits { nonces } => self.request_mta(nonces)?,
            Round::AwaitRequests { nonces, commits } => self.respond_mta(nonces, commits)?,
            Round::AwaitResponses {
                nonces,
                commits,
                beta,
                nu,
            } => self.share_delta(nonces, commits, beta, nu)?,
            Round::AwaitDeltas {
                nonces,
                commits,
                delta,
                sigma,
            } => self.open_gamma(nonces, commits, delta, sigma)?,
            Round::AwaitDecommits {
                nonces,
                commits,
                delta,
                sigma,
            } => self.compute_r(nonces, commits, delta, sigma)?,
            Round::AwaitConsistency {
                nonces,
                sigma,
                r_point,
                own_r_share,
            } => self.finish(nonces, sigma, r_point, own_r_share)?,
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
            RoundTag::M1 => {
                check_addressing(&envelope, self.i, false)?;
                self.commits.push(sender, envelope.body.decode()?)
            }
            RoundTag::M2 => {
                check_addressing(&envelope, self.i, true)?;
                self.requests.push(sender, envelope.body.decode()?)
            }
            RoundTag::M3 => {
                check_addressing(&envelope, self.i, true)?;
                self.responses.push(sender, envelope.body.decode()?)
            }
            RoundTag::M4 => {
                check_addressing(&envelope, self.i, false)?;
                self.deltas.push(sender, envelope.body.decode()?)
            }
            RoundTag::M5 => {
                check_addressing(&envelope, self.i, false)?;
                self.decommits.push(sender, envelope.body.decode()?)
            }
            RoundTag::M6 => {
                check_addressing(&envelope, self.i, false)?;
                self.consistency.push(sender, envelope.body.decode()?)
            }
            other => Err(Error::UnexpectedMessage(format!(
                "offline stage does not accept {} messages",
                other
            ))),
        }
    }

    fn is_finished(&self) -> bool {
        matches!(self.round, Round::Finished(_) | Round::OutputTaken)
    }

    fn take_output(&mut self) -> Option<Result<SignManual>> {
        match std::mem::replace(&mut self.round, Round::OutputTaken) {
            Round::Finished(sign) => Some(Ok(sign)),
            Round::OutputTaken => Some(Err(Error::ProtocolState(
                "offline stage output already taken".into(),
            ))),
            other => {
                self.round = other;
                None
            }
        }
    }
}
