//! End-to-end stage orchestration over the simulated network
//!
//! Each stage gets its own [`Network`] containing exactly the stage's
//! participants, one driver task per party and the router tasks. Keygen
//! feeds the offline stage, whose outputs are combined by the completer.

use futures_util::future::try_join_all;
use tracing::{info, instrument, warn};

use crate::completion::complete_signature;
use crate::config::SimulationConfig;
use crate::driver::PartyDriver;
use crate::network::{Network, Shutdown, shutdown_channel};
use crate::protocol::{Keygen, LocalKey, OfflineStage, ProtocolHandle, SignManual};
use crate::{Error, MessageHash, PartyId, Result, SignatureRecid};

/// Result of a full keygen + signing simulation
#[derive(Debug, Clone)]
pub struct SigningOutcome {
    /// Keygen outputs of every party
    pub keys: Vec<LocalKey>,
    /// Signer set that produced the signature
    pub signers: Vec<PartyId>,
    /// Final signature
    pub signature: SignatureRecid,
}

impl SigningOutcome {
    /// Joint public key (compressed SEC1)
    pub fn public_key(&self) -> &[u8] {
        self.keys
            .first()
            .map(|key| key.public_key.as_slice())
            .unwrap_or_default()
    }
}

/// Run one protocol stage to completion, one driver per handle
///
/// Outputs are returned in the order of `handles`. The first driver error
/// ends the stage and stops the remaining drivers.
#[instrument(skip_all, fields(parties = handles.len()))]
pub async fn run_stage<H: ProtocolHandle>(
    handles: Vec<H>,
    config: &SimulationConfig,
    mut shutdown: Shutdown,
) -> Result<Vec<H::Output>> {
    config.validate()?;
    let parties: Vec<PartyId> = handles.iter().map(|h| h.party_index()).collect();
    let (network, endpoints) = Network::new(&parties, config.network.clone())?;

    let (stage_trigger, stage_shutdown) = shutdown_channel();
    let router = network.spawn(stage_shutdown.clone());

    let mut tasks = Vec::with_capacity(handles.len());
    for (handle, endpoint) in handles.into_iter().zip(endpoints) {
        let driver = PartyDriver::with_config(handle, config.driver.clone())?;
        tasks.push(tokio::spawn(driver.run(
            endpoint.inbox,
            endpoint.outbox,
            stage_shutdown.clone(),
        )));
    }
    info!(parties = ?parties, "Stage started");

    let drivers = try_join_all(tasks.into_iter().map(|task| async move {
        task.await
            .map_err(|e| Error::Internal(format!("driver task failed: {}", e)))?
    }));
    let deadline = async {
        match config.stage_timeout() {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => std::future::pending().await,
        }
    };

    let outcome = tokio::select! {
        outputs = drivers => outputs,
        _ = deadline => Err(Error::Timeout(format!("stage of parties {:?}", parties))),
        _ = shutdown.wait() => Err(Error::Cancelled),
    };

    // Stops drivers still waiting after a failure, then the router
    stage_trigger.trigger();
    router.shutdown().await?;

    match &outcome {
        Ok(_) => info!(parties = ?parties, "Stage complete"),
        Err(e) => warn!(parties = ?parties, error = %e, "Stage failed"),
    }
    outcome
}

/// Run keygen for parties `1..=n` with threshold `t`
#[instrument(skip(config, shutdown))]
pub async fn run_keygen(
    t: u16,
    n: u16,
    config: &SimulationConfig,
    shutdown: Shutdown,
) -> Result<Vec<LocalKey>> {
    let handles = (1..=n)
        .map(|i| Keygen::new(i, t, n))
        .collect::<Result<Vec<_>>>()?;
    run_stage(handles, config, shutdown).await
}

/// Run the offline stage for `signers`, using their keys from `keys`
#[instrument(skip(keys, message_hash, config, shutdown), fields(hash = %hex::encode(message_hash)))]
pub async fn run_offline_stage(
    keys: &[LocalKey],
    signers: &[PartyId],
    message_hash: MessageHash,
    config: &SimulationConfig,
    shutdown: Shutdown,
) -> Result<Vec<SignManual>> {
    let handles = signers
        .iter()
        .map(|&i| {
            let key = keys
                .iter()
                .find(|key| key.i == i)
                .ok_or(Error::InvalidPartyId(i))?;
            OfflineStage::new(i, signers.to_vec(), key.clone(), message_hash)
        })
        .collect::<Result<Vec<_>>>()?;
    run_stage(handles, config, shutdown).await
}

/// Run the offline stage and complete the signature with existing keys
pub async fn sign_with_keys(
    keys: &[LocalKey],
    signers: &[PartyId],
    message_hash: MessageHash,
    config: &SimulationConfig,
    shutdown: Shutdown,
) -> Result<SignatureRecid> {
    let outputs = run_offline_stage(keys, signers, message_hash, config, shutdown).await?;
    let signature = complete_signature(&outputs)?;
    info!(signature = %signature, "Message signed");
    Ok(signature)
}

/// Generate a fresh key among `n` parties and sign `message_hash` with `signers`
pub async fn sign_message(
    t: u16,
    n: u16,
    signers: &[PartyId],
    message_hash: MessageHash,
    config: &SimulationConfig,
    shutdown: Shutdown,
) -> Result<SigningOutcome> {
    let keys = run_keygen(t, n, config, shutdown.clone()).await?;
    let signature = sign_with_keys(&keys, signers, message_hash, config, shutdown).await?;

    let mut signers = signers.to_vec();
    signers.sort_unstable();
    Ok(SigningOutcome {
        keys,
        signers,
        signature,
    })
}
