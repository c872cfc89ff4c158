//! Integration tests for stage orchestration
//!
//! Scripted handles run through real drivers and a real router, so these
//! tests cover the process loop, the collector and the dispatcher together.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::common::{ScriptedHandle, fast_config, scripted};
use ecdsa_tss_core::{
    Error,
    network::{Shutdown, shutdown_channel},
    simulation::run_stage,
};

#[tokio::test(start_paused = true)]
async fn test_every_party_hears_every_round_from_every_peer() {
    let parties = [1, 2, 3, 4];
    let handles: Vec<_> = scripted(&parties, 3)
        .into_iter()
        .map(|h| h.with_burst(2))
        .collect();

    let outputs = run_stage(handles, &fast_config(), Shutdown::never())
        .await
        .unwrap();

    assert_eq!(outputs.len(), 4);
    for (output, party) in outputs.iter().zip(parties) {
        assert_eq!(output.party, party);
        // 3 peers x 3 rounds x 2 messages
        assert_eq!(output.arrivals.len(), 18);
        assert!(output.arrivals.iter().all(|(sender, _, _)| *sender != party));

        // Each sender's messages arrive round by round, bursts in order
        let mut by_sender: BTreeMap<u16, Vec<(u16, u16)>> = BTreeMap::new();
        for (sender, round, seq) in &output.arrivals {
            by_sender.entry(*sender).or_default().push((*round, *seq));
        }
        for received in by_sender.values() {
            assert_eq!(
                received,
                &vec![(1, 0), (1, 1), (2, 0), (2, 1), (3, 0), (3, 1)]
            );
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_missing_peer_times_out() {
    // Both parties wait for party 3, which is not on the network
    let handles = vec![
        ScriptedHandle::new(1, &[1, 2, 3], 1),
        ScriptedHandle::new(2, &[1, 2, 3], 1),
    ];
    let config = fast_config().with_stage_timeout(500);

    let result = run_stage(handles, &config, Shutdown::never()).await;
    assert!(matches!(result, Err(Error::Timeout(_))));
}

#[tokio::test(start_paused = true)]
async fn test_external_shutdown_cancels_stage() {
    let handles = vec![
        ScriptedHandle::new(1, &[1, 2, 3], 1),
        ScriptedHandle::new(2, &[1, 2, 3], 1),
    ];
    let (trigger, shutdown) = shutdown_channel();

    let stage = tokio::spawn(async move {
        let config = fast_config();
        run_stage(handles, &config, shutdown).await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    trigger.trigger();

    assert!(matches!(stage.await.unwrap(), Err(Error::Cancelled)));
}

#[tokio::test(start_paused = true)]
async fn test_failing_party_ends_stage() {
    let parties = [1, 2, 3];
    let mut handles = scripted(&parties, 2);
    handles[1] = ScriptedHandle::new(2, &parties, 2).failing_at(1);

    let result = run_stage(handles, &fast_config(), Shutdown::never()).await;
    assert!(matches!(
        result,
        Err(Error::ProceedFailed {
            party: 2,
            round: 1,
            ..
        })
    ));
}

#[tokio::test]
async fn test_duplicate_parties_are_rejected() {
    let handles = vec![
        ScriptedHandle::new(1, &[1, 2], 1),
        ScriptedHandle::new(1, &[1, 2], 1),
    ];
    let result = run_stage(handles, &fast_config(), Shutdown::never()).await;
    assert!(result.is_err());
}
