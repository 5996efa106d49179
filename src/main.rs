use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use stam::{
    Authenticator, Broadcaster, ControllerId, Coordinator, Driver, Envelope, MetricsSample,
    MetricsSource, PeerListener, SendOutcome, StamConfig, Transport, TrustChannels,
};

/// Envelopes buffered per loopback peer before senders see it as unreachable.
const LOOPBACK_QUEUE_DEPTH: usize = 64;

#[derive(Parser, Debug)]
#[command(name = "stam")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML deployment file; a two-controller demo deployment is used if omitted.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(long)]
    load_threshold: Option<f64>,

    #[arg(long)]
    delay_threshold: Option<f64>,

    #[arg(short, long)]
    tick_interval_ms: Option<u64>,

    #[arg(long)]
    improvement_tolerance: Option<f64>,
}

impl Args {
    fn resolve_config(&self) -> Result<StamConfig> {
        let mut config = match &self.config {
            Some(path) => StamConfig::load(path)?,
            None => StamConfig::demo(),
        };
        let coordinator = &mut config.coordinator;
        if let Some(v) = self.load_threshold {
            coordinator.load_threshold = v;
        }
        if let Some(v) = self.delay_threshold {
            coordinator.delay_threshold = v;
        }
        if let Some(v) = self.tick_interval_ms {
            coordinator.tick_interval_ms = v;
        }
        if let Some(v) = self.improvement_tolerance {
            coordinator.improvement_tolerance = v;
        }
        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

/// Random samples in the ranges a lightly loaded data plane produces.
struct SyntheticMetrics {
    rng: StdRng,
}

impl SyntheticMetrics {
    fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[async_trait]
impl MetricsSource for SyntheticMetrics {
    async fn next_sample(&mut self) -> Result<MetricsSample> {
        let traffic = round2(self.rng.gen_range(0.4..=1.2));
        let delay = round2(self.rng.gen_range(0.1..=0.35));
        let alert = self.rng.gen_bool(0.25);
        Ok(MetricsSample::new(traffic, delay, alert)?)
    }
}

/// In-process transport: one bounded queue per remote controller.
struct LoopbackTransport {
    inboxes: HashMap<ControllerId, mpsc::Sender<Envelope>>,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&self, destination: &ControllerId, envelope: Envelope) -> SendOutcome {
        let Some(inbox) = self.inboxes.get(destination) else {
            return SendOutcome::Unreachable;
        };
        match inbox.try_send(envelope) {
            Ok(()) => SendOutcome::Ok,
            Err(e) => {
                warn!(%destination, error = %e, "loopback delivery failed");
                SendOutcome::Unreachable
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let config = args.resolve_config()?;
    let local = config.local_controller()?;
    let directory = config.key_directory()?;
    info!(controller = %local, known = directory.len(), "key directory loaded");

    let mut authenticator = Authenticator::new(directory);
    authenticator.authenticate_all(config.claims());
    let (directory, trusted) = authenticator.finish();
    if !trusted.contains(&local) {
        warn!(controller = %local, "local controller is not in the trusted set");
    }

    let channels = Arc::new(TrustChannels::establish(directory, trusted.clone()));

    let mut inboxes = HashMap::new();
    let mut listeners = JoinSet::new();
    for peer in trusted.iter().filter(|p| **p != local) {
        let (tx, rx) = mpsc::channel(LOOPBACK_QUEUE_DEPTH);
        inboxes.insert(peer.clone(), tx);
        listeners.spawn(PeerListener::new(peer.clone(), channels.clone()).run(rx));
    }
    info!(peers = inboxes.len(), "loopback listeners started");

    let broadcaster = Broadcaster::new(channels, Arc::new(LoopbackTransport { inboxes }));
    let coordinator = Coordinator::new(
        local,
        trusted,
        &config.coordinator,
        SyntheticMetrics::new(),
        broadcaster,
    );
    let driver = Driver::new(coordinator, config.coordinator.tick_interval());

    let stats = driver
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("Received shutdown signal, exiting gracefully");
        })
        .await;

    // Dropping the driver closes every loopback inbox.
    drop(driver);
    let mut accepted = 0;
    while let Some(joined) = listeners.join_next().await {
        match joined {
            Ok(n) => accepted += n,
            Err(e) => warn!(error = %e, "listener task failed"),
        }
    }

    info!(
        ticks = stats.ticks,
        cycles = stats.cycles_completed,
        failed = stats.cycles_failed,
        skipped = stats.ticks_skipped,
        accepted,
        "shutdown complete"
    );
    Ok(())
}
