//! Simulated network: collector and dispatcher tasks

use futures_util::stream::{self, StreamExt};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::{DeliveryBuffer, PopResult, Shutdown, ShutdownTrigger, shutdown_channel};
use crate::config::NetworkConfig;
use crate::{Envelope, Error, PartyId, Receiver, Result, WireMessage};

/// One party's side of the simulated network
#[derive(Debug)]
pub struct PartyEndpoint {
    /// Party this endpoint belongs to
    pub party: PartyId,
    /// Messages delivered to the party
    pub inbox: mpsc::Receiver<WireMessage>,
    /// Messages sent by the party
    pub outbox: mpsc::Sender<WireMessage>,
}

/// Router for a fixed set of parties, not yet running
#[derive(Debug)]
pub struct Network {
    config: NetworkConfig,
    buffer: DeliveryBuffer,
    outbound: Vec<(PartyId, mpsc::Receiver<WireMessage>)>,
    inbound: BTreeMap<PartyId, mpsc::Sender<WireMessage>>,
}

impl Network {
    /// Create a network for `parties` and one endpoint per party
    pub fn new(parties: &[PartyId], config: NetworkConfig) -> Result<(Self, Vec<PartyEndpoint>)> {
        config.validate()?;
        if parties.is_empty() {
            return Err(Error::InvalidConfig("network needs at least one party".into()));
        }
        let unique: BTreeSet<PartyId> = parties.iter().copied().collect();
        if unique.len() != parties.len() {
            return Err(Error::InvalidConfig(format!(
                "duplicate party in {:?}",
                parties
            )));
        }
        if unique.contains(&0) {
            return Err(Error::InvalidPartyId(0));
        }

        let capacity = config.capacity_for(parties.len());
        let mut outbound = Vec::with_capacity(parties.len());
        let mut inbound = BTreeMap::new();
        let mut endpoints = Vec::with_capacity(parties.len());

        for &party in parties {
            let (in_tx, in_rx) = mpsc::channel(capacity);
            let (out_tx, out_rx) = mpsc::channel(capacity);
            inbound.insert(party, in_tx);
            outbound.push((party, out_rx));
            endpoints.push(PartyEndpoint {
                party,
                inbox: in_rx,
                outbox: out_tx,
            });
        }

        let network = Self {
            config,
            buffer: DeliveryBuffer::new(),
            outbound,
            inbound,
        };
        Ok((network, endpoints))
    }

    /// Shared delivery buffer
    pub fn buffer(&self) -> DeliveryBuffer {
        self.buffer.clone()
    }

    /// Start the collector and dispatcher tasks
    ///
    /// Both stop when `shutdown` fires or when [`NetworkHandle::shutdown`]
    /// is called.
    pub fn spawn(self, shutdown: Shutdown) -> NetworkHandle {
        let (trigger, stop) = shutdown_channel();
        info!(
            parties = self.inbound.len(),
            dispatch_interval_ms = self.config.dispatch_interval_ms,
            max_dispatch_per_tick = self.config.max_dispatch_per_tick,
            "Starting network router"
        );

        let collector = tokio::spawn(collect(
            self.outbound,
            self.buffer.clone(),
            stop.clone(),
            shutdown.clone(),
        ));
        let dispatcher = tokio::spawn(dispatch(
            self.inbound,
            self.buffer.clone(),
            self.config,
            stop,
            shutdown,
        ));

        NetworkHandle {
            trigger,
            buffer: self.buffer,
            collector,
            dispatcher,
        }
    }
}

/// Running router
#[derive(Debug)]
pub struct NetworkHandle {
    trigger: ShutdownTrigger,
    buffer: DeliveryBuffer,
    collector: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

impl NetworkHandle {
    /// Shared delivery buffer
    pub fn buffer(&self) -> &DeliveryBuffer {
        &self.buffer
    }

    /// Stop both tasks and wait for them to exit
    pub async fn shutdown(self) -> Result<()> {
        self.trigger.trigger();
        self.collector
            .await
            .map_err(|e| Error::Internal(format!("collector task failed: {}", e)))?;
        self.dispatcher
            .await
            .map_err(|e| Error::Internal(format!("dispatcher task failed: {}", e)))?;

        let undelivered = self.buffer.len();
        if undelivered > 0 {
            debug!(undelivered, "Router stopped with envelopes still buffered");
        }
        Ok(())
    }
}

/// Move every party's outgoing messages into the shared buffer
async fn collect(
    outbound: Vec<(PartyId, mpsc::Receiver<WireMessage>)>,
    buffer: DeliveryBuffer,
    mut stop: Shutdown,
    mut shutdown: Shutdown,
) {
    let streams = outbound.into_iter().map(|(owner, rx)| {
        Box::pin(stream::unfold(rx, move |mut rx| async move {
            rx.recv().await.map(|bytes| ((owner, bytes), rx))
        }))
    });
    let mut merged = stream::select_all(streams);

    loop {
        tokio::select! {
            _ = stop.wait() => break,
            _ = shutdown.wait() => break,
            next = merged.next() => match next {
                Some((owner, bytes)) => accept(owner, &bytes, &buffer),
                None => {
                    debug!("All outbound channels closed");
                    break;
                }
            },
        }
    }
    trace!("Collector stopped");
}

fn accept(owner: PartyId, bytes: &[u8], buffer: &DeliveryBuffer) {
    match Envelope::from_bytes(bytes) {
        Ok(envelope) if envelope.sender == owner => {
            trace!(
                sender = envelope.sender,
                receiver = %envelope.receiver,
                round = %envelope.round(),
                "Buffered envelope"
            );
            buffer.push(envelope);
        }
        Ok(envelope) => {
            warn!(
                owner,
                claimed = envelope.sender,
                "Envelope sender does not match its channel, dropping"
            );
        }
        Err(e) => {
            warn!(owner, error = %e, "Dropping undecodable envelope");
        }
    }
}

/// Deliver buffered envelopes, lowest round first, on every tick
async fn dispatch(
    inbound: BTreeMap<PartyId, mpsc::Sender<WireMessage>>,
    buffer: DeliveryBuffer,
    config: NetworkConfig,
    mut stop: Shutdown,
    mut shutdown: Shutdown,
) {
    let period = config.dispatch_interval();
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.wait() => break,
            _ = shutdown.wait() => break,
            _ = ticker.tick() => {
                let ticked = dispatch_tick(
                    &inbound,
                    &buffer,
                    config.max_dispatch_per_tick,
                    &mut stop,
                    &mut shutdown,
                )
                .await;
                if !ticked {
                    break;
                }
            }
        }
    }
    trace!("Dispatcher stopped");
}

/// Deliver up to `max` envelopes; `false` once shutdown interrupted a delivery
async fn dispatch_tick(
    inbound: &BTreeMap<PartyId, mpsc::Sender<WireMessage>>,
    buffer: &DeliveryBuffer,
    max: usize,
    stop: &mut Shutdown,
    shutdown: &mut Shutdown,
) -> bool {
    for _ in 0..max {
        match buffer.try_pop() {
            PopResult::Envelope(envelope) => {
                if !deliver(inbound, &envelope, stop, shutdown).await {
                    return false;
                }
            }
            PopResult::Empty => return true,
            PopResult::Contended => {
                trace!("Delivery buffer busy, skipping tick");
                return true;
            }
        }
    }
    true
}

async fn deliver(
    inbound: &BTreeMap<PartyId, mpsc::Sender<WireMessage>>,
    envelope: &Envelope,
    stop: &mut Shutdown,
    shutdown: &mut Shutdown,
) -> bool {
    let bytes = match envelope.to_bytes() {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(sender = envelope.sender, error = %e, "Cannot re-encode envelope, dropping");
            return true;
        }
    };

    debug!(
        sender = envelope.sender,
        receiver = %envelope.receiver,
        round = %envelope.round(),
        "Delivering envelope"
    );

    match envelope.receiver {
        Receiver::Unicast(to) => match inbound.get(&to) {
            Some(tx) => send_to(to, tx, bytes, stop, shutdown).await,
            None => {
                warn!(
                    sender = envelope.sender,
                    receiver = to,
                    "Dropping envelope for unknown receiver"
                );
                true
            }
        },
        Receiver::Broadcast => {
            for (&party, tx) in inbound.iter().filter(|(p, _)| **p != envelope.sender) {
                if !send_to(party, tx, bytes.clone(), stop, shutdown).await {
                    return false;
                }
            }
            true
        }
    }
}

/// Wait for inbox capacity unless shutdown fires first
async fn send_to(
    party: PartyId,
    tx: &mpsc::Sender<WireMessage>,
    bytes: WireMessage,
    stop: &mut Shutdown,
    shutdown: &mut Shutdown,
) -> bool {
    tokio::select! {
        _ = stop.wait() => false,
        _ = shutdown.wait() => false,
        sent = tx.send(bytes) => {
            if sent.is_err() {
                debug!(party, "Inbox closed, skipping delivery");
            }
            true
        }
    }
}
