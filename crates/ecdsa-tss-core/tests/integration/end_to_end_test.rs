//! Integration tests for the full keygen and signing flow
//!
//! These tests verify end-to-end functionality over the simulated network:
//! - Keygen among three parties with threshold one
//! - Offline stage and completion with different signer subsets
//! - Signature verification and public key recovery

use crate::common::fast_config;
use ecdsa_tss_core::{
    Error, LocalKey, MessageHash, SimulationConfig, complete_signature,
    network::Shutdown,
    simulation::{run_keygen, run_offline_stage, sign_message, sign_with_keys},
};

const HASH: MessageHash = [b'a'; 32];

/// Helper to run keygen for three parties with threshold one
async fn setup_keys(config: &SimulationConfig) -> Vec<LocalKey> {
    run_keygen(1, 3, config, Shutdown::never()).await.unwrap()
}

// ============================================================================
// Keygen
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_keygen_three_parties() {
    let keys = setup_keys(&fast_config()).await;

    assert_eq!(keys.len(), 3);
    for (index, key) in keys.iter().enumerate() {
        assert_eq!(usize::from(key.i), index + 1);
        assert_eq!(key.t, 1);
        assert_eq!(key.n, 3);
        assert_eq!(key.public_key, keys[0].public_key);
        assert_eq!(key.public_shares, keys[0].public_shares);
        key.validate().unwrap();
    }
}

// ============================================================================
// Signing
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_sign_message_end_to_end() {
    let config = fast_config();
    let outcome = sign_message(1, 3, &[1, 2], HASH, &config, Shutdown::never())
        .await
        .unwrap();

    assert_eq!(outcome.signers, vec![1, 2]);
    outcome
        .signature
        .verify(outcome.public_key(), &HASH)
        .unwrap();
    assert_eq!(outcome.signature.recover(&HASH).unwrap(), outcome.public_key());

    let json = serde_json::to_value(&outcome.signature).unwrap();
    assert_eq!(json["r"]["curve"], "secp256k1");
    assert_eq!(json["s"]["curve"], "secp256k1");
    assert!(json["recid"].as_u64().unwrap() <= 3);
}

#[tokio::test(start_paused = true)]
async fn test_any_qualified_subset_signs() {
    let config = fast_config();
    let keys = setup_keys(&config).await;

    for signers in [vec![1, 2], vec![2, 3], vec![3, 1], vec![1, 2, 3]] {
        let signature = sign_with_keys(&keys, &signers, HASH, &config, Shutdown::never())
            .await
            .unwrap();
        signature.verify(&keys[0].public_key, &HASH).unwrap();
        assert_eq!(signature.recover(&HASH).unwrap(), keys[0].public_key);
    }
}

#[tokio::test(start_paused = true)]
async fn test_every_signer_can_complete() {
    let config = fast_config();
    let keys = setup_keys(&config).await;

    let mut outputs = run_offline_stage(&keys, &[1, 3], HASH, &config, Shutdown::never())
        .await
        .unwrap();
    assert!(outputs.iter().all(|o| o.message_hash() == &HASH));

    let first = complete_signature(&outputs).unwrap();
    outputs.reverse();
    let second = complete_signature(&outputs).unwrap();
    assert_eq!(first, second);
}

#[tokio::test(start_paused = true)]
async fn test_signer_set_below_threshold_is_rejected() {
    let config = fast_config();
    let keys = setup_keys(&config).await;

    let result = sign_with_keys(&keys, &[2], HASH, &config, Shutdown::never()).await;
    assert!(matches!(result, Err(Error::ThresholdNotMet { .. })));

    let result = sign_with_keys(&keys, &[1, 4], HASH, &config, Shutdown::never()).await;
    assert!(result.is_err());
}
