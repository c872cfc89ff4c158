//! Shared delivery buffer

use parking_lot::Mutex;
use std::sync::Arc;

use crate::{Envelope, classify};

/// Outcome of a non-blocking pop
#[derive(Debug, Clone, PartialEq)]
pub enum PopResult {
    /// Lowest-priority envelope, removed from the buffer
    Envelope(Envelope),
    /// Nothing buffered
    Empty,
    /// Another task holds the lock
    Contended,
}

/// Envelopes waiting for delivery, shared by the collector and the dispatcher
///
/// Appends take the lock and may wait; pops never wait. Envelopes leave in
/// round-priority order, and envelopes of equal priority in arrival order.
#[derive(Debug, Clone, Default)]
pub struct DeliveryBuffer {
    inner: Arc<Mutex<Vec<Envelope>>>,
}

impl DeliveryBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an envelope
    pub fn push(&self, envelope: Envelope) {
        self.inner.lock().push(envelope);
    }

    /// Number of buffered envelopes
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Check if the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Remove the lowest-priority envelope without waiting for the lock
    pub fn try_pop(&self) -> PopResult {
        let Some(mut envelopes) = self.inner.try_lock() else {
            return PopResult::Contended;
        };
        if envelopes.is_empty() {
            return PopResult::Empty;
        }

        // Stable, so equal priorities keep arrival order
        envelopes.sort_by_key(classify);
        PopResult::Envelope(envelopes.remove(0))
    }
}
