//! Fuzz tests for the delivery buffer
//!
//! Whatever the arrival order, envelopes leave lowest round first and
//! envelopes of the same round leave in arrival order.

use ecdsa_tss_core::{
    Envelope, RoundPayload, RoundTag, classify,
    network::{DeliveryBuffer, PopResult},
};
use proptest::prelude::*;

fn arrivals_strategy() -> impl Strategy<Value = Vec<RoundTag>> {
    prop::collection::vec(prop::sample::select(RoundTag::ALL.to_vec()), 0..40)
}

fn drain(buffer: &DeliveryBuffer) -> Vec<Envelope> {
    let mut out = Vec::new();
    loop {
        match buffer.try_pop() {
            PopResult::Envelope(envelope) => out.push(envelope),
            PopResult::Empty => return out,
            PopResult::Contended => panic!("single-threaded buffer reported contention"),
        }
    }
}

proptest! {
    #[test]
    fn buffer_pops_in_stable_priority_order(tags in arrivals_strategy()) {
        let buffer = DeliveryBuffer::new();
        for (seq, tag) in tags.iter().enumerate() {
            buffer.push(Envelope::broadcast(1, RoundPayload::encode(*tag, &seq).unwrap()));
        }
        prop_assert_eq!(buffer.len(), tags.len());

        let popped: Vec<(RoundTag, usize)> = drain(&buffer)
            .iter()
            .map(|e| (e.round(), e.body.decode::<usize>().unwrap()))
            .collect();

        let mut expected: Vec<(RoundTag, usize)> = tags.iter().copied().zip(0..).collect();
        expected.sort_by_key(|(tag, _)| tag.priority());

        prop_assert_eq!(popped, expected);
        prop_assert!(buffer.is_empty());
    }

    /// Pushes between pops never let a later round overtake a buffered earlier one
    #[test]
    fn interleaved_pushes_respect_priority(
        first in arrivals_strategy(),
        second in arrivals_strategy(),
    ) {
        let buffer = DeliveryBuffer::new();
        for tag in &first {
            buffer.push(Envelope::broadcast(1, RoundPayload::encode(*tag, &0u8).unwrap()));
        }

        let mut popped = Vec::new();
        if let PopResult::Envelope(envelope) = buffer.try_pop() {
            let lowest = first.iter().map(|t| t.priority()).min();
            prop_assert_eq!(Some(classify(&envelope)), lowest);
            popped.push(envelope);
        }

        for tag in &second {
            buffer.push(Envelope::broadcast(2, RoundPayload::encode(*tag, &0u8).unwrap()));
        }
        let rest = drain(&buffer);
        prop_assert_eq!(popped.len() + rest.len(), first.len() + second.len());
        prop_assert!(rest.windows(2).all(|w| classify(&w[0]) <= classify(&w[1])));
    }
}
