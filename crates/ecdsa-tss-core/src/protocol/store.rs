//! Per-round message collection

use std::collections::{BTreeMap, BTreeSet};

use crate::{Error, PartyId, Result};

/// Collects one message from each expected peer for a single round
#[derive(Debug)]
pub(crate) struct RoundStore<T> {
    expected: BTreeSet<PartyId>,
    received: BTreeMap<PartyId, T>,
    closed: bool,
}

impl<T> RoundStore<T> {
    /// Expect one message from every party in `parties` except `me`
    pub(crate) fn new(me: PartyId, parties: impl IntoIterator<Item = PartyId>) -> Self {
        Self {
            expected: parties.into_iter().filter(|p| *p != me).collect(),
            received: BTreeMap::new(),
            closed: false,
        }
    }

    /// Store a message, rejecting unknown and repeated senders
    pub(crate) fn push(&mut self, sender: PartyId, message: T) -> Result<()> {
        if self.closed {
            return Err(Error::UnexpectedMessage(format!(
                "late message from party {} for a completed round",
                sender
            )));
        }
        if !self.expected.contains(&sender) {
            return Err(Error::UnexpectedMessage(format!(
                "party {} is not expected in this round",
                sender
            )));
        }
        if self.received.contains_key(&sender) {
            return Err(Error::UnexpectedMessage(format!(
                "duplicate message from party {}",
                sender
            )));
        }
        self.received.insert(sender, message);
        Ok(())
    }

    /// Check if messages are still missing
    pub(crate) fn wants_more(&self) -> bool {
        !self.closed && self.received.len() < self.expected.len()
    }

    /// Take all received messages, keyed by sender
    pub(crate) fn take(&mut self) -> Result<BTreeMap<PartyId, T>> {
        if self.closed {
            return Err(Error::ProtocolState("round already taken".into()));
        }
        if self.wants_more() {
            return Err(Error::ProtocolState(format!(
                "round incomplete: {} of {} messages",
                self.received.len(),
                self.expected.len()
            )));
        }
        self.closed = true;
        Ok(std::mem::take(&mut self.received))
    }
}
