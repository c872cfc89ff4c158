//! Unit tests for the simulated network router

use std::time::Duration;

use crate::common::scripted_envelope;
use ecdsa_tss_core::{
    Envelope, NetworkConfig, RoundPayload, RoundTag,
    network::{Network, PartyEndpoint, shutdown_channel},
};
use serde_json::json;

fn drain(endpoint: &mut PartyEndpoint) -> Vec<Envelope> {
    let mut received = Vec::new();
    while let Ok(bytes) = endpoint.inbox.try_recv() {
        received.push(Envelope::from_bytes(&bytes).unwrap());
    }
    received
}

// ============================================================================
// Delivery order
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_lowest_round_is_delivered_first() {
    let config = NetworkConfig::default()
        .with_dispatch_interval(10)
        .with_channel_capacity(8);
    let (network, mut endpoints) = Network::new(&[1, 2], config).unwrap();

    let offline = Envelope::broadcast(1, RoundPayload::encode(RoundTag::M1, &json!(0)).unwrap());
    network.buffer().push(offline);
    network.buffer().push(scripted_envelope(1, 3, 0));
    network.buffer().push(scripted_envelope(1, 1, 0));
    network.buffer().push(scripted_envelope(1, 1, 1));

    let (_trigger, shutdown) = shutdown_channel();
    let handle = network.spawn(shutdown);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let tags: Vec<_> = drain(&mut endpoints[1])
        .iter()
        .map(|e| (e.round(), e.body.data()["seq"].as_u64()))
        .collect();
    assert_eq!(
        tags,
        vec![
            (RoundTag::Round1, Some(0)),
            (RoundTag::Round1, Some(1)),
            (RoundTag::Round3, Some(0)),
            (RoundTag::M1, None),
        ]
    );
    assert!(drain(&mut endpoints[0]).is_empty());

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_dispatch_is_paced_per_tick() {
    let config = NetworkConfig::default()
        .with_dispatch_interval(1000)
        .with_max_dispatch_per_tick(1);
    let (network, mut endpoints) = Network::new(&[1, 2], config).unwrap();
    for seq in 0..3 {
        network.buffer().push(scripted_envelope(1, 1, seq));
    }

    let (_trigger, shutdown) = shutdown_channel();
    let handle = network.spawn(shutdown);

    // No delivery before the first full period
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(drain(&mut endpoints[1]).is_empty());

    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(drain(&mut endpoints[1]).len(), 1);

    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(drain(&mut endpoints[1]).len(), 1);
    assert_eq!(handle.buffer().len(), 1);

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_completes_with_full_inbox() {
    let config = NetworkConfig::default()
        .with_dispatch_interval(10)
        .with_channel_capacity(1);
    let (network, mut endpoints) = Network::new(&[1, 2], config).unwrap();
    for seq in 0..3 {
        network.buffer().push(scripted_envelope(1, 1, seq));
    }

    let (_trigger, shutdown) = shutdown_channel();
    let handle = network.spawn(shutdown);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // One envelope fills the inbox, the dispatcher waits on the next
    assert_eq!(handle.buffer().len(), 1);
    tokio::time::timeout(Duration::from_secs(30), handle.shutdown())
        .await
        .expect("router hung on a full inbox")
        .unwrap();

    assert_eq!(drain(&mut endpoints[1]).len(), 1);
}

// ============================================================================
// Addressing
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_closed_inbox_does_not_block_others() {
    let config = NetworkConfig::default().with_dispatch_interval(10);
    let (network, mut endpoints) = Network::new(&[1, 2, 3], config).unwrap();
    let (_trigger, shutdown) = shutdown_channel();
    let handle = network.spawn(shutdown);

    let PartyEndpoint { inbox, .. } = endpoints.remove(1);
    drop(inbox);

    endpoints[0]
        .outbox
        .send(scripted_envelope(1, 1, 0).to_bytes().unwrap())
        .await
        .unwrap();
    endpoints[0]
        .outbox
        .send(scripted_envelope(1, 2, 0).to_bytes().unwrap())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let rounds: Vec<_> = drain(&mut endpoints[1]).iter().map(Envelope::round).collect();
    assert_eq!(rounds, vec![RoundTag::Round1, RoundTag::Round2]);

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unicast_reaches_only_its_receiver() {
    let config = NetworkConfig::default().with_dispatch_interval(10);
    let (network, mut endpoints) = Network::new(&[1, 2, 3], config).unwrap();
    let (_trigger, shutdown) = shutdown_channel();
    let handle = network.spawn(shutdown);

    let direct = Envelope::p2p(3, 1, RoundPayload::encode(RoundTag::M2, &json!("k")).unwrap());
    endpoints[2].outbox.send(direct.to_bytes().unwrap()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(drain(&mut endpoints[0]), vec![direct]);
    assert!(drain(&mut endpoints[1]).is_empty());
    assert!(drain(&mut endpoints[2]).is_empty());

    handle.shutdown().await.unwrap();
}
