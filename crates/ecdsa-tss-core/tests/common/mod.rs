//! Shared test fixtures
//!
//! [`ScriptedHandle`] is a protocol handle with a fixed number of broadcast
//! rounds and no cryptography. It records the order in which envelopes
//! arrived so tests can check what the driver and router did.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use ecdsa_tss_core::{
    Envelope, Error, PartyId, ProtocolHandle, Result, RoundPayload, RoundTag, SimulationConfig,
    config::{DriverConfig, NetworkConfig},
};
use serde::{Deserialize, Serialize};

/// Keygen tags reused as generic round tags
pub const ROUND_TAGS: [RoundTag; 4] = [
    RoundTag::Round1,
    RoundTag::Round2,
    RoundTag::Round3,
    RoundTag::Round4,
];

/// Payload sent by the scripted handle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptedMessage {
    pub round: u16,
    pub seq: u16,
}

/// Output of a scripted run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedOutput {
    pub party: PartyId,
    /// Arrival order as `(sender, round, seq)`
    pub arrivals: Vec<(PartyId, u16, u16)>,
}

/// Round machine that broadcasts `burst` messages per round
pub struct ScriptedHandle {
    party: PartyId,
    peers: Vec<PartyId>,
    rounds: u16,
    burst: u16,
    fail_at: Option<u16>,
    round: u16,
    /// Distinct seqs per round and sender
    received: BTreeMap<u16, BTreeMap<PartyId, BTreeSet<u16>>>,
    arrivals: Vec<(PartyId, u16, u16)>,
    outgoing: VecDeque<Envelope>,
    finished: bool,
    taken: bool,
}

impl ScriptedHandle {
    pub fn new(party: PartyId, parties: &[PartyId], rounds: u16) -> Self {
        assert!((1..=4).contains(&rounds));
        Self {
            party,
            peers: parties.iter().copied().filter(|p| *p != party).collect(),
            rounds,
            burst: 1,
            fail_at: None,
            round: 0,
            received: BTreeMap::new(),
            arrivals: Vec::new(),
            outgoing: VecDeque::new(),
            finished: false,
            taken: false,
        }
    }

    /// Broadcast `burst` messages per round instead of one
    pub fn with_burst(mut self, burst: u16) -> Self {
        self.burst = burst;
        self
    }

    /// Fail when proceeding out of `round`
    pub fn failing_at(mut self, round: u16) -> Self {
        self.fail_at = Some(round);
        self
    }

    fn round_complete(&self, round: u16) -> bool {
        self.received
            .get(&round)
            .is_some_and(|from| {
                self.peers.iter().all(|p| {
                    from.get(p)
                        .is_some_and(|seqs| seqs.len() >= usize::from(self.burst))
                })
            })
    }
}

impl ProtocolHandle for ScriptedHandle {
    type Output = ScriptedOutput;

    fn party_index(&self) -> PartyId {
        self.party
    }

    fn parties(&self) -> u16 {
        self.peers.len() as u16 + 1
    }

    fn current_round(&self) -> u16 {
        self.round
    }

    fn total_rounds(&self) -> Option<u16> {
        Some(self.rounds)
    }

    fn wants_to_proceed(&self) -> bool {
        !self.finished && (self.round == 0 || self.round_complete(self.round))
    }

    fn proceed(&mut self) -> Result<()> {
        if self.fail_at == Some(self.round) {
            return Err(Error::Crypto(format!("scripted failure in round {}", self.round)));
        }
        if self.round == self.rounds {
            self.finished = true;
            return Ok(());
        }

        self.round += 1;
        let tag = ROUND_TAGS[usize::from(self.round) - 1];
        for seq in 0..self.burst {
            let message = ScriptedMessage {
                round: self.round,
                seq,
            };
            self.outgoing.push_back(Envelope::broadcast(
                self.party,
                RoundPayload::encode(tag, &message)?,
            ));
        }
        Ok(())
    }

    fn has_outgoing(&self) -> bool {
        !self.outgoing.is_empty()
    }

    fn drain_one_outgoing(&mut self) -> Option<Envelope> {
        self.outgoing.pop_front()
    }

    fn receive_incoming(&mut self, envelope: Envelope) -> Result<()> {
        if !self.peers.contains(&envelope.sender) {
            return Err(Error::UnexpectedMessage(format!(
                "party {} is not a peer",
                envelope.sender
            )));
        }
        let message: ScriptedMessage = envelope.body.decode()?;
        if message.round == 0 || message.round > self.rounds {
            return Err(Error::UnexpectedMessage(format!("round {}", message.round)));
        }

        self.arrivals
            .push((envelope.sender, message.round, message.seq));
        self.received
            .entry(message.round)
            .or_default()
            .entry(envelope.sender)
            .or_default()
            .insert(message.seq);
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn take_output(&mut self) -> Option<Result<Self::Output>> {
        if !self.finished {
            return None;
        }
        if self.taken {
            return Some(Err(Error::ProtocolState("output already taken".into())));
        }
        self.taken = true;
        Some(Ok(ScriptedOutput {
            party: self.party,
            arrivals: self.arrivals.clone(),
        }))
    }
}

/// Scripted handles for every party in `parties`
pub fn scripted(parties: &[PartyId], rounds: u16) -> Vec<ScriptedHandle> {
    parties
        .iter()
        .map(|&p| ScriptedHandle::new(p, parties, rounds))
        .collect()
}

/// Broadcast envelope carrying a scripted message
pub fn scripted_envelope(sender: PartyId, round: u16, seq: u16) -> Envelope {
    let tag = ROUND_TAGS[usize::from(round) - 1];
    Envelope::broadcast(
        sender,
        RoundPayload::encode(tag, &ScriptedMessage { round, seq }).unwrap(),
    )
}

/// Millisecond-scale timings so full runs finish quickly
pub fn fast_config() -> SimulationConfig {
    SimulationConfig::default()
        .with_driver(DriverConfig::default().with_flush_interval(5))
        .with_network(
            NetworkConfig::default()
                .with_dispatch_interval(1)
                .with_max_dispatch_per_tick(8),
        )
        .with_stage_timeout(120_000)
}
