//! # ECDSA TSS Core
//!
//! Party driver and simulated network for round-based threshold ECDSA.
//!
//! ## Architecture
//!
//! This crate provides:
//! - **Protocol handles**: the [`ProtocolHandle`] contract plus reference round
//!   machines for keygen, the signing offline stage and manual completion
//! - **Party driver**: a per-party loop that advances its handle, queues what
//!   it produces and flushes the queue on a periodic tick
//! - **Simulated network**: collects every party's messages into one buffer
//!   and delivers them lowest round first, broadcast or point-to-point
//! - **Completion**: combines partial signatures into a recoverable ECDSA
//!   signature
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ecdsa_tss_core::{SimulationConfig, network::Shutdown, simulation};
//!
//! let config = SimulationConfig::default();
//! let outcome = simulation::sign_message(1, 3, &[1, 2], [b'a'; 32], &config, Shutdown::never()).await?;
//!
//! outcome.signature.verify(outcome.public_key(), &[b'a'; 32])?;
//! ```
//!
//! ## Message flow
//!
//! Every message is an [`Envelope`] carrying exactly one round-tagged payload.
//! The router orders envelopes by [`classify`], so keygen rounds are always
//! delivered before offline-stage rounds and earlier rounds before later ones.
//! The ordering only shapes delivery; the round machines accept messages for
//! any of their rounds at any time.

pub mod completion;
pub mod config;
pub mod error;
pub mod message;
pub mod protocol;
pub mod types;

// Runtime-dependent modules (require tokio)
#[cfg(feature = "runtime")]
pub mod driver;
#[cfg(feature = "runtime")]
pub mod network;
#[cfg(feature = "runtime")]
pub mod simulation;

pub use completion::{PartialSignatureCollector, collect_partial_signatures, complete_signature};
pub use config::{DriverConfig, NetworkConfig, SimulationConfig};
pub use error::{Error, Result};
pub use message::{
    Envelope, MAX_MESSAGE_SIZE, Receiver, RoundPayload, RoundPriority, RoundTag, WireMessage,
    classify,
};
pub use protocol::{Keygen, LocalKey, OfflineStage, ProtocolHandle, SignManual};
pub use types::{
    CURVE_NAME, CurveScalar, MessageHash, PartialSignature, PartyId, SignatureRecid,
    message_hash_from_slice,
};

#[cfg(feature = "runtime")]
pub use driver::{HandleOutcome, PartyDriver};
#[cfg(feature = "runtime")]
pub use network::{Inbox, Network, Outbox, Shutdown, ShutdownTrigger, shutdown_channel};
