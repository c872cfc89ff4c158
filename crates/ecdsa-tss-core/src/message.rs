//! Protocol message envelope and round classification
//!
//! Every message exchanged between parties travels in an [`Envelope`] that
//! names its sender, its receiver and exactly one round-tagged payload. The
//! payload itself is opaque JSON to the driver and the router; only the round
//! machines interpret it.
//!
//! Wire format:
//!
//! ```text
//! {"sender": 1, "receiver": null, "body": {"Round1": { ... }}}
//! {"sender": 2, "receiver": 3,    "body": {"M3": { ... }}}
//! ```

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt;

use crate::{Error, PartyId, Result};

/// Serialized envelope as carried by the transport
pub type WireMessage = Vec<u8>;

/// Largest wire message accepted or produced by the codec (1 MiB)
pub const MAX_MESSAGE_SIZE: usize = 1_048_576;

/// Message destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Option<PartyId>", into = "Option<PartyId>")]
pub enum Receiver {
    /// Every party except the sender
    Broadcast,
    /// A single party
    Unicast(PartyId),
}

impl Receiver {
    /// Check if this receiver addresses `party`
    pub fn includes(&self, party: PartyId, sender: PartyId) -> bool {
        match self {
            Receiver::Broadcast => party != sender,
            Receiver::Unicast(to) => *to == party,
        }
    }
}

impl From<Option<PartyId>> for Receiver {
    fn from(value: Option<PartyId>) -> Self {
        match value {
            Some(party) => Receiver::Unicast(party),
            None => Receiver::Broadcast,
        }
    }
}

impl From<Receiver> for Option<PartyId> {
    fn from(value: Receiver) -> Self {
        match value {
            Receiver::Broadcast => None,
            Receiver::Unicast(party) => Some(party),
        }
    }
}

impl fmt::Display for Receiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Receiver::Broadcast => write!(f, "broadcast"),
            Receiver::Unicast(party) => write!(f, "{}", party),
        }
    }
}

/// Round tag of a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RoundTag {
    Round1,
    Round2,
    Round3,
    Round4,
    M1,
    M2,
    M3,
    M4,
    M5,
    M6,
}

impl RoundTag {
    /// All tags in delivery-priority order
    pub const ALL: [RoundTag; 10] = [
        RoundTag::Round1,
        RoundTag::Round2,
        RoundTag::Round3,
        RoundTag::Round4,
        RoundTag::M1,
        RoundTag::M2,
        RoundTag::M3,
        RoundTag::M4,
        RoundTag::M5,
        RoundTag::M6,
    ];

    /// Delivery priority (lower is delivered first)
    pub fn priority(self) -> RoundPriority {
        let value = match self {
            RoundTag::Round1 => 1,
            RoundTag::Round2 => 2,
            RoundTag::Round3 => 3,
            RoundTag::Round4 => 4,
            RoundTag::M1 => 11,
            RoundTag::M2 => 12,
            RoundTag::M3 => 13,
            RoundTag::M4 => 14,
            RoundTag::M5 => 15,
            RoundTag::M6 => 16,
        };
        RoundPriority(value)
    }

    /// Round number within its own stage (1-based)
    pub fn stage_round(self) -> u16 {
        match self {
            RoundTag::Round1 | RoundTag::M1 => 1,
            RoundTag::Round2 | RoundTag::M2 => 2,
            RoundTag::Round3 | RoundTag::M3 => 3,
            RoundTag::Round4 | RoundTag::M4 => 4,
            RoundTag::M5 => 5,
            RoundTag::M6 => 6,
        }
    }
}

impl fmt::Display for RoundTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Ordering key used by the router; has no bearing on protocol validity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoundPriority(pub u8);

/// Round-tagged payload; exactly one round per envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RoundPayload {
    Round1(serde_json::Value),
    Round2(serde_json::Value),
    Round3(serde_json::Value),
    Round4(serde_json::Value),
    M1(serde_json::Value),
    M2(serde_json::Value),
    M3(serde_json::Value),
    M4(serde_json::Value),
    M5(serde_json::Value),
    M6(serde_json::Value),
}

impl RoundPayload {
    /// Build a payload for `tag` from a typed round message
    pub fn encode<T: Serialize>(tag: RoundTag, message: &T) -> Result<Self> {
        let value = serde_json::to_value(message)?;
        Ok(match tag {
            RoundTag::Round1 => RoundPayload::Round1(value),
            RoundTag::Round2 => RoundPayload::Round2(value),
            RoundTag::Round3 => RoundPayload::Round3(value),
            RoundTag::Round4 => RoundPayload::Round4(value),
            RoundTag::M1 => RoundPayload::M1(value),
            RoundTag::M2 => RoundPayload::M2(value),
            RoundTag::M3 => RoundPayload::M3(value),
            RoundTag::M4 => RoundPayload::M4(value),
            RoundTag::M5 => RoundPayload::M5(value),
            RoundTag::M6 => RoundPayload::M6(value),
        })
    }

    /// Get the round tag
    pub fn tag(&self) -> RoundTag {
        match self {
            RoundPayload::Round1(_) => RoundTag::Round1,
            RoundPayload::Round2(_) => RoundTag::Round2,
            RoundPayload::Round3(_) => RoundTag::Round3,
            RoundPayload::Round4(_) => RoundTag::Round4,
            RoundPayload::M1(_) => RoundTag::M1,
            RoundPayload::M2(_) => RoundTag::M2,
            RoundPayload::M3(_) => RoundTag::M3,
            RoundPayload::M4(_) => RoundTag::M4,
            RoundPayload::M5(_) => RoundTag::M5,
            RoundPayload::M6(_) => RoundTag::M6,
        }
    }

    /// Borrow the opaque payload data
    pub fn data(&self) -> &serde_json::Value {
        match self {
            RoundPayload::Round1(v)
            | RoundPayload::Round2(v)
            | RoundPayload::Round3(v)
            | RoundPayload::Round4(v)
            | RoundPayload::M1(v)
            | RoundPayload::M2(v)
            | RoundPayload::M3(v)
            | RoundPayload::M4(v)
            | RoundPayload::M5(v)
            | RoundPayload::M6(v) => v,
        }
    }

    /// Decode the payload data into a typed round message
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        T::deserialize(self.data()).map_err(|e| {
            Error::UnexpectedMessage(format!("invalid {} payload: {}", self.tag(), e))
        })
    }
}

/// Protocol message envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sending party
    pub sender: PartyId,
    /// Destination
    pub receiver: Receiver,
    /// Round-tagged payload
    pub body: RoundPayload,
}

impl Envelope {
    /// Create a broadcast envelope
    pub fn broadcast(sender: PartyId, body: RoundPayload) -> Self {
        Self {
            sender,
            receiver: Receiver::Broadcast,
            body,
        }
    }

    /// Create a point-to-point envelope
    pub fn p2p(sender: PartyId, to: PartyId, body: RoundPayload) -> Self {
        Self {
            sender,
            receiver: Receiver::Unicast(to),
            body,
        }
    }

    /// Get the round tag
    pub fn round(&self) -> RoundTag {
        self.body.tag()
    }

    /// Check if this is a broadcast envelope
    pub fn is_broadcast(&self) -> bool {
        self.receiver == Receiver::Broadcast
    }

    /// Encode for the wire
    pub fn to_bytes(&self) -> Result<WireMessage> {
        let bytes = serde_json::to_vec(self)?;
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(Error::MessageTooLarge {
                size: bytes.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        Ok(bytes)
    }

    /// Decode from the wire
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(Error::MessageTooLarge {
                size: bytes.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        serde_json::from_slice(bytes).map_err(|e| Error::MalformedMessage(e.to_string()))
    }
}

/// Delivery priority of an envelope
pub fn classify(envelope: &Envelope) -> RoundPriority {
    envelope.round().priority()
}
