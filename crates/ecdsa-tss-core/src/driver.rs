//! Party driver
//!
//! Wraps one [`ProtocolHandle`] and moves it forward: advance while ready,
//! drain what it produced, feed it what arrives. Outgoing messages are
//! queued and flushed in FIFO order on a periodic tick, and the loop exits
//! on the first flush after the output appeared.

use std::collections::VecDeque;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::DriverConfig;
use crate::network::{Inbox, Outbox, Shutdown};
use crate::protocol::ProtocolHandle;
use crate::{Envelope, Error, PartyId, Result, WireMessage};

/// Result of handling one incoming message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandleOutcome {
    /// Messages produced in response, in the order the handle emitted them
    pub outgoing: Vec<WireMessage>,
    /// Whether the driver now holds the protocol output
    pub finished: bool,
}

/// Drives a single party's protocol handle
pub struct PartyDriver<H: ProtocolHandle> {
    handle: H,
    party: PartyId,
    config: DriverConfig,
    pending: VecDeque<WireMessage>,
    output: Option<H::Output>,
    initialized: bool,
}

impl<H: ProtocolHandle> PartyDriver<H> {
    /// Wrap a handle with the default configuration
    pub fn new(handle: H) -> Self {
        let party = handle.party_index();
        Self {
            handle,
            party,
            config: DriverConfig::default(),
            pending: VecDeque::new(),
            output: None,
            initialized: false,
        }
    }

    /// Wrap a handle with a custom configuration
    pub fn with_config(handle: H, config: DriverConfig) -> Result<Self> {
        config.validate()?;
        let mut driver = Self::new(handle);
        driver.config = config;
        Ok(driver)
    }

    /// Party this driver runs
    pub fn party(&self) -> PartyId {
        self.party
    }

    /// Borrow the wrapped handle
    pub fn protocol(&self) -> &H {
        &self.handle
    }

    /// Messages waiting for the next flush, oldest first
    pub fn pending(&self) -> &VecDeque<WireMessage> {
        &self.pending
    }

    /// Check if [`initialize`](Self::initialize) has run
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Take the first steps and queue whatever they produce
    ///
    /// Must be called exactly once before any message is handled.
    pub fn initialize(&mut self) -> Result<()> {
        if self.initialized {
            return Err(Error::ProtocolState(format!(
                "driver for party {} is already initialized",
                self.party
            )));
        }
        self.initialized = true;

        let batch = self.advance()?;
        debug!(party = self.party, queued = batch.len(), "Driver initialized");
        self.pending.extend(batch);
        Ok(())
    }

    /// Deliver one incoming wire message and advance as far as possible
    ///
    /// Newly produced messages are appended to the pending queue and also
    /// returned. Decode failures and envelopes the handle rejects are
    /// returned as transport errors and leave the driver usable.
    pub fn handle(&mut self, bytes: &[u8]) -> Result<HandleOutcome> {
        if !self.initialized {
            return Err(Error::ProtocolState(format!(
                "driver for party {} is not initialized",
                self.party
            )));
        }

        let envelope = Envelope::from_bytes(bytes)?;
        let (sender, tag) = (envelope.sender, envelope.round());
        let received = self.handle.receive_incoming(envelope);
        trace!(
            party = self.party,
            round = self.handle.current_round(),
            sender,
            tag = %tag,
            ok = received.is_ok(),
            "receive_incoming"
        );
        received?;

        let outgoing = self.advance()?;
        self.pending.extend(outgoing.iter().cloned());
        Ok(HandleOutcome {
            outgoing,
            finished: self.output.is_some(),
        })
    }

    /// Protocol output, once available
    pub fn output(&self) -> Option<&H::Output> {
        self.output.as_ref()
    }

    /// Consume the driver, returning the output if available
    pub fn into_output(self) -> Option<H::Output> {
        self.output
    }

    /// Send every pending message in FIFO order, returning how many were sent
    ///
    /// If the outbox is closed the remaining batch is dropped.
    pub async fn flush<O: Outbox>(&mut self, outbox: &mut O) -> usize {
        let mut sent = 0;
        while let Some(bytes) = self.pending.pop_front() {
            if let Err(e) = outbox.send(bytes).await {
                let dropped = self.pending.len() + 1;
                self.pending.clear();
                warn!(party = self.party, error = %e, dropped, "Outbox closed, dropping batch");
                return sent;
            }
            sent += 1;
        }
        if sent > 0 {
            debug!(party = self.party, sent, "Flushed outgoing messages");
        }
        sent
    }

    /// Run the process loop until the output has been produced and flushed
    ///
    /// Suspends on the next incoming message, the flush tick and `shutdown`.
    /// Transport errors are logged and the offending message is dropped; any
    /// other error ends the loop.
    #[instrument(skip_all, fields(party = self.party))]
    pub async fn run<I: Inbox, O: Outbox>(
        mut self,
        mut inbox: I,
        mut outbox: O,
        mut shutdown: Shutdown,
    ) -> Result<H::Output> {
        if !self.initialized {
            self.initialize()?;
        }

        let period = self.config.flush_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut inbox_open = true;

        info!(party = self.party, "Party driver started");
        loop {
            tokio::select! {
                _ = shutdown.wait() => {
                    info!(party = self.party, "Shutdown requested");
                    return Err(Error::Cancelled);
                }
                received = inbox.recv(), if inbox_open => match received {
                    Some(bytes) => match self.handle(&bytes) {
                        Ok(_) => {}
                        Err(e) if e.is_transport() => {
                            warn!(party = self.party, error = %e, "Dropping incoming message");
                        }
                        Err(e) => {
                            error!(party = self.party, error = %e, "Protocol run failed");
                            return Err(e);
                        }
                    },
                    None => {
                        warn!(party = self.party, "Inbox closed");
                        inbox_open = false;
                    }
                },
                _ = ticker.tick() => {
                    let done = self.output.is_some();
                    tokio::select! {
                        _ = shutdown.wait() => return Err(Error::Cancelled),
                        _ = self.flush(&mut outbox) => {}
                    }
                    if done {
                        break;
                    }
                }
            }
        }

        info!(party = self.party, "Party driver finished");
        self.output
            .take()
            .ok_or_else(|| Error::Internal("output vanished before exit".into()))
    }

    fn advance(&mut self) -> Result<Vec<WireMessage>> {
        while self.handle.wants_to_proceed() {
            let round = self.handle.current_round();
            let result = self.handle.proceed();
            trace!(party = self.party, round, ok = result.is_ok(), "proceed");
            result.map_err(|e| Error::ProceedFailed {
                party: self.party,
                round,
                source: Box::new(e),
            })?;
        }

        let mut batch = Vec::new();
        while let Some(envelope) = self.handle.drain_one_outgoing() {
            let bytes = envelope.to_bytes().map_err(|e| {
                Error::Internal(format!(
                    "cannot encode outgoing {} envelope: {}",
                    envelope.round(),
                    e
                ))
            })?;
            batch.push(bytes);
        }
        trace!(
            party = self.party,
            round = self.handle.current_round(),
            drained = batch.len(),
            "drain_one_outgoing"
        );

        self.store_output()?;
        Ok(batch)
    }

    fn store_output(&mut self) -> Result<()> {
        if self.output.is_some() || !self.handle.is_finished() {
            return Ok(());
        }

        match self.handle.take_output() {
            Some(Ok(output)) => {
                info!(
                    party = self.party,
                    rounds = ?self.handle.total_rounds(),
                    "Protocol output ready"
                );
                self.output = Some(output);
                Ok(())
            }
            Some(Err(e)) => Err(e),
            None => Err(Error::ProtocolState(format!(
                "party {} reports finished without output",
                self.party
            ))),
        }
    }
}
