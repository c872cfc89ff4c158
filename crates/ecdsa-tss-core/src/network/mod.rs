//! Transport abstractions and the simulated network
//!
//! A driver only sees an [`Inbox`] and an [`Outbox`] of serialized envelopes.
//! The [`Network`] simulator hands every party one of each, collects
//! everything the parties send into a shared [`DeliveryBuffer`] and delivers
//! the lowest-round envelope on every dispatch tick.

use tokio::sync::{mpsc, watch};

use crate::{Error, Result, WireMessage};

pub use async_trait::async_trait;

mod buffer;
mod router;

pub use buffer::{DeliveryBuffer, PopResult};
pub use router::{Network, NetworkHandle, PartyEndpoint};

/// Source of incoming wire messages for one party
#[async_trait]
pub trait Inbox: Send {
    /// Wait for the next message; `None` once the transport is closed
    async fn recv(&mut self) -> Option<WireMessage>;
}

/// Sink for outgoing wire messages of one party
#[async_trait]
pub trait Outbox: Send {
    /// Send one message, waiting for capacity if needed
    async fn send(&mut self, message: WireMessage) -> Result<()>;
}

#[async_trait]
impl Inbox for mpsc::Receiver<WireMessage> {
    async fn recv(&mut self) -> Option<WireMessage> {
        mpsc::Receiver::recv(self).await
    }
}

#[async_trait]
impl Outbox for mpsc::Sender<WireMessage> {
    async fn send(&mut self, message: WireMessage) -> Result<()> {
        mpsc::Sender::send(self, message)
            .await
            .map_err(|_| Error::ChannelClosed("outbound channel".into()))
    }
}

/// Create a linked shutdown trigger and signal
pub fn shutdown_channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

/// Fires the shutdown signal for every subscribed [`Shutdown`]
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    /// Request shutdown
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Create another signal observing this trigger
    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: self.tx.subscribe(),
        }
    }
}

/// Cooperative shutdown signal, observed at every suspension point
///
/// If the trigger is dropped without firing, the signal never fires.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// A signal that never fires
    pub fn never() -> Self {
        let (_, rx) = watch::channel(false);
        Self { rx }
    }

    /// Check if shutdown was requested
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until shutdown is requested
    pub async fn wait(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
