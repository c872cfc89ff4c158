//! ECDSA TSS CLI
//!
//! Command-line tool running threshold ECDSA keygen and signing over the
//! simulated network.

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use ecdsa_tss_core::{
    CURVE_NAME, MessageHash, PartyId, SimulationConfig, message_hash_from_slice,
    network::{Shutdown, ShutdownTrigger, shutdown_channel},
    simulation,
};
use std::future::Future;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Message signed when none is given
const DEFAULT_MESSAGE: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

#[derive(Parser)]
#[command(name = "ecdsa-tss")]
#[command(about = "Threshold ECDSA simulation CLI", version)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(flatten)]
    timing: TimingArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct TimingArgs {
    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Driver flush interval in milliseconds
    #[arg(long, global = true)]
    flush_interval_ms: Option<u64>,

    /// Router dispatch interval in milliseconds
    #[arg(long, global = true)]
    dispatch_interval_ms: Option<u64>,

    /// Envelopes the router delivers per dispatch tick
    #[arg(long, global = true)]
    max_dispatch_per_tick: Option<usize>,

    /// Abort a stage that runs longer than this many milliseconds
    #[arg(long, global = true)]
    stage_timeout_ms: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate key shares for n parties (local simulation)
    Keygen {
        /// Threshold; any t+1 parties can sign
        #[arg(short, long, default_value_t = 1)]
        threshold: u16,

        /// Number of parties
        #[arg(short, long, default_value_t = 3)]
        parties: u16,
    },

    /// Generate a key and sign a message hash with a signer subset
    Sign {
        /// Threshold; any t+1 parties can sign
        #[arg(short, long, default_value_t = 1)]
        threshold: u16,

        /// Number of parties
        #[arg(short, long, default_value_t = 3)]
        parties: u16,

        /// Signing parties, comma separated
        #[arg(short, long, value_delimiter = ',', default_value = "1,2")]
        signers: Vec<PartyId>,

        /// 32-byte message hash, as 64 hex characters or 32 characters of text
        #[arg(short, long, default_value = DEFAULT_MESSAGE)]
        message: String,
    },

    /// Show the effective configuration
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json);

    let config = load_config(&cli.timing)?;
    let (trigger, shutdown) = shutdown_channel();
    spawn_ctrl_c(trigger);

    match cli.command {
        Commands::Keygen { threshold, parties } => {
            run_keygen(threshold, parties, &config, shutdown).await?;
        }
        Commands::Sign {
            threshold,
            parties,
            signers,
            message,
        } => {
            let hash = parse_message_hash(&message)?;
            run_sign(threshold, parties, &signers, hash, &config, shutdown).await?;
        }
        Commands::Info => {
            show_info(&config)?;
        }
    }

    Ok(())
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(timing: &TimingArgs) -> Result<SimulationConfig> {
    let mut config = match &timing.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            SimulationConfig::from_json(&raw)
                .with_context(|| format!("parsing config {}", path.display()))?
        }
        None => SimulationConfig::default(),
    };

    if let Some(ms) = timing.flush_interval_ms {
        config.driver = config.driver.with_flush_interval(ms);
    }
    if let Some(ms) = timing.dispatch_interval_ms {
        config.network = config.network.with_dispatch_interval(ms);
    }
    if let Some(max) = timing.max_dispatch_per_tick {
        config.network = config.network.with_max_dispatch_per_tick(max);
    }
    if let Some(ms) = timing.stage_timeout_ms {
        config = config.with_stage_timeout(ms);
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn spawn_ctrl_c(trigger: ShutdownTrigger) {
    tokio::spawn(forward_interrupt(tokio::signal::ctrl_c(), trigger));
}

/// Fire `trigger` once `signal` resolves
///
/// A failed listener drops the trigger, which leaves the shutdown pending.
async fn forward_interrupt(
    signal: impl Future<Output = std::io::Result<()>>,
    trigger: ShutdownTrigger,
) {
    match signal.await {
        Ok(()) => {
            warn!("Interrupted, shutting down");
            trigger.trigger();
        }
        Err(e) => warn!(error = %e, "Cannot listen for Ctrl+C"),
    }
}

fn parse_message_hash(message: &str) -> Result<MessageHash> {
    if message.len() == 64 {
        if let Ok(bytes) = hex::decode(message) {
            return Ok(message_hash_from_slice(&bytes)?);
        }
    }
    if message.len() != 32 {
        bail!(
            "message hash must be 64 hex characters or 32 bytes of text, got {} bytes",
            message.len()
        );
    }
    Ok(message_hash_from_slice(message.as_bytes())?)
}

async fn run_keygen(
    threshold: u16,
    parties: u16,
    config: &SimulationConfig,
    shutdown: Shutdown,
) -> Result<()> {
    info!(threshold, parties, "Running keygen simulation");
    let keys = simulation::run_keygen(threshold, parties, config, shutdown).await?;

    let public_key = keys
        .first()
        .map(|key| key.public_key_hex())
        .context("keygen produced no keys")?;
    let shares: Vec<_> = keys
        .iter()
        .map(|key| {
            serde_json::json!({
                "party": key.i,
                "public_share": key
                    .public_shares
                    .get(usize::from(key.i) - 1)
                    .map(hex::encode),
            })
        })
        .collect();

    let output = serde_json::json!({
        "curve": CURVE_NAME,
        "threshold": threshold,
        "parties": parties,
        "public_key": public_key,
        "shares": shares,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run_sign(
    threshold: u16,
    parties: u16,
    signers: &[PartyId],
    hash: MessageHash,
    config: &SimulationConfig,
    shutdown: Shutdown,
) -> Result<()> {
    info!(threshold, parties, ?signers, "Running signing simulation");
    let outcome =
        simulation::sign_message(threshold, parties, signers, hash, config, shutdown).await?;

    outcome
        .signature
        .verify(outcome.public_key(), &hash)
        .context("signature does not verify")?;

    let output = serde_json::json!({
        "public_key": hex::encode(outcome.public_key()),
        "signers": outcome.signers,
        "message_hash": hex::encode(hash),
        "signature": outcome.signature,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn show_info(config: &SimulationConfig) -> Result<()> {
    println!("ECDSA TSS Simulation");
    println!("====================\n");
    println!("Curve: {}", CURVE_NAME);
    println!("Keygen: 4 rounds (Round1..Round4)");
    println!("Offline stage: 6 rounds (M1..M6)");
    println!("\nDelivery order: keygen rounds first, then offline rounds, lowest round first");
    println!("\nEffective configuration:");
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
