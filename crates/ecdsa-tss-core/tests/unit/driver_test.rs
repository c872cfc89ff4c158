//! Unit tests for the party driver

use std::time::Duration;

use crate::common::{ScriptedHandle, scripted_envelope};
use ecdsa_tss_core::{
    Envelope, Error, PartyDriver, ProtocolHandle, WireMessage,
    network::{Shutdown, shutdown_channel},
};
use tokio::sync::mpsc;

fn channel() -> (mpsc::Sender<WireMessage>, mpsc::Receiver<WireMessage>) {
    mpsc::channel(16)
}

// ============================================================================
// Queueing and flushing
// ============================================================================

#[tokio::test]
async fn test_flush_preserves_emission_order() {
    let handle = ScriptedHandle::new(1, &[1, 2], 1).with_burst(4);
    let mut driver = PartyDriver::new(handle);
    driver.initialize().unwrap();
    assert_eq!(driver.pending().len(), 4);

    let (mut tx, mut rx) = channel();
    assert_eq!(driver.flush(&mut tx).await, 4);
    assert!(driver.pending().is_empty());

    for expected in 0..4u64 {
        let envelope = Envelope::from_bytes(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(envelope.body.data()["seq"], expected);
    }
}

#[tokio::test]
async fn test_flush_appends_responses_after_earlier_batch() {
    let handle = ScriptedHandle::new(1, &[1, 2], 2).with_burst(2);
    let mut driver = PartyDriver::new(handle);
    driver.initialize().unwrap();

    // Round 2 output is queued behind the unflushed round 1 batch
    let bytes = scripted_envelope(2, 1, 0).to_bytes().unwrap();
    let outcome = driver.handle(&bytes).unwrap();
    assert_eq!(outcome.outgoing.len(), 2);
    assert_eq!(driver.pending().len(), 4);

    let (mut tx, mut rx) = channel();
    assert_eq!(driver.flush(&mut tx).await, 4);

    let mut rounds = Vec::new();
    while let Ok(bytes) = rx.try_recv() {
        rounds.push(Envelope::from_bytes(&bytes).unwrap().body.data()["round"].clone());
    }
    assert_eq!(rounds, vec![1, 1, 2, 2]);
}

#[tokio::test]
async fn test_flush_to_closed_outbox_drops_batch() {
    let handle = ScriptedHandle::new(1, &[1, 2], 1).with_burst(3);
    let mut driver = PartyDriver::new(handle);
    driver.initialize().unwrap();

    let (mut tx, rx) = channel();
    drop(rx);
    assert_eq!(driver.flush(&mut tx).await, 0);
    assert!(driver.pending().is_empty());
}

// ============================================================================
// Handling incoming messages
// ============================================================================

#[test]
fn test_output_is_stable_once_finished() {
    let mut driver = PartyDriver::new(ScriptedHandle::new(1, &[1, 2], 1));
    driver.initialize().unwrap();
    assert!(driver.output().is_none());

    let bytes = scripted_envelope(2, 1, 0).to_bytes().unwrap();
    let outcome = driver.handle(&bytes).unwrap();
    assert!(outcome.finished);

    let first = driver.output().cloned().unwrap();
    let second = driver.output().cloned().unwrap();
    assert_eq!(first, second);
    assert_eq!(first.arrivals, vec![(2, 1, 0)]);
    assert_eq!(driver.into_output(), Some(first));
}

#[test]
fn test_round_waits_for_every_burst_message() {
    let handle = ScriptedHandle::new(1, &[1, 2], 2).with_burst(2);
    let mut driver = PartyDriver::new(handle);
    driver.initialize().unwrap();

    // A repeated seq does not count twice
    let first = scripted_envelope(2, 1, 0).to_bytes().unwrap();
    assert!(driver.handle(&first).unwrap().outgoing.is_empty());
    assert!(driver.handle(&first).unwrap().outgoing.is_empty());
    assert_eq!(driver.protocol().current_round(), 1);

    let second = scripted_envelope(2, 1, 1).to_bytes().unwrap();
    assert_eq!(driver.handle(&second).unwrap().outgoing.len(), 2);
    assert_eq!(driver.protocol().current_round(), 2);
}

#[test]
fn test_foreign_sender_is_transport_error() {
    let mut driver = PartyDriver::new(ScriptedHandle::new(1, &[1, 2], 1));
    driver.initialize().unwrap();

    let bytes = scripted_envelope(9, 1, 0).to_bytes().unwrap();
    let err = driver.handle(&bytes).unwrap_err();
    assert!(err.is_transport());
    assert!(driver.output().is_none());
}

#[test]
fn test_proceed_failure_is_fatal() {
    let handle = ScriptedHandle::new(1, &[1, 2], 2).failing_at(1);
    let mut driver = PartyDriver::new(handle);
    driver.initialize().unwrap();

    let bytes = scripted_envelope(2, 1, 0).to_bytes().unwrap();
    let err = driver.handle(&bytes).unwrap_err();
    assert!(!err.is_transport());
    assert!(matches!(err, Error::ProceedFailed { party: 1, round: 1, .. }));
}

#[test]
fn test_initialize_failure_is_reported() {
    let handle = ScriptedHandle::new(1, &[1, 2], 1).failing_at(0);
    let mut driver = PartyDriver::new(handle);
    assert!(matches!(
        driver.initialize(),
        Err(Error::ProceedFailed { party: 1, round: 0, .. })
    ));
}

// ============================================================================
// Process loop
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_run_drops_invalid_messages_and_finishes() {
    let driver = PartyDriver::new(ScriptedHandle::new(1, &[1, 2], 1));
    let (in_tx, in_rx) = channel();
    let (out_tx, mut out_rx) = channel();

    let task = tokio::spawn(driver.run(in_rx, out_tx, Shutdown::never()));

    in_tx.send(b"garbage".to_vec()).await.unwrap();
    in_tx
        .send(scripted_envelope(2, 1, 0).to_bytes().unwrap())
        .await
        .unwrap();

    let output = task.await.unwrap().unwrap();
    assert_eq!(output.party, 1);
    assert_eq!(output.arrivals, vec![(2, 1, 0)]);

    // The own round message was flushed before the loop exited
    let sent = Envelope::from_bytes(&out_rx.recv().await.unwrap()).unwrap();
    assert_eq!(sent.sender, 1);
    assert!(sent.is_broadcast());
}

#[tokio::test(start_paused = true)]
async fn test_run_sends_only_on_flush_tick() {
    let driver = PartyDriver::new(ScriptedHandle::new(1, &[1, 2], 2));
    let (in_tx, in_rx) = channel();
    let (out_tx, mut out_rx) = channel();

    let task = tokio::spawn(driver.run(in_rx, out_tx, Shutdown::never()));
    in_tx
        .send(scripted_envelope(2, 1, 0).to_bytes().unwrap())
        .await
        .unwrap();

    // Round 1 and the round 2 response stay queued until the first tick
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(out_rx.try_recv().is_err());

    tokio::time::sleep(Duration::from_millis(600)).await;
    let mut rounds = Vec::new();
    while let Ok(bytes) = out_rx.try_recv() {
        rounds.push(Envelope::from_bytes(&bytes).unwrap().body.data()["round"].clone());
    }
    assert_eq!(rounds, vec![1, 2]);

    task.abort();
}

#[tokio::test(start_paused = true)]
async fn test_run_stops_on_proceed_failure() {
    let handle = ScriptedHandle::new(1, &[1, 2], 2).failing_at(1);
    let driver = PartyDriver::new(handle);
    let (in_tx, in_rx) = channel();
    let (out_tx, _out_rx) = channel();

    let task = tokio::spawn(driver.run(in_rx, out_tx, Shutdown::never()));
    in_tx
        .send(scripted_envelope(2, 1, 0).to_bytes().unwrap())
        .await
        .unwrap();

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::ProceedFailed { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_run_honours_shutdown() {
    let driver = PartyDriver::new(ScriptedHandle::new(1, &[1, 2], 1));
    let (_in_tx, in_rx) = channel();
    let (out_tx, _out_rx) = channel();
    let (trigger, shutdown) = shutdown_channel();

    let task = tokio::spawn(driver.run(in_rx, out_tx, shutdown));
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(!task.is_finished());

    trigger.trigger();
    assert!(matches!(task.await.unwrap(), Err(Error::Cancelled)));
}
