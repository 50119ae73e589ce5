//! Simulation driver for the SGC protocol.
//!
//! Runs one coordinator and a fleet of members over an in-memory broadcast
//! medium that drops each delivery independently, then prints a JSON report.

mod network;
mod report;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tracing::info;

use sgc_crypto::{BulletinBoard, PublicParameterStore};
use sgc_protocol::{Coordinator, ManualClock, Member, SgcConfig, SgcContext};
use sgc_types::Timestamp;

use network::{LinkModel, Simulation};
use report::SimReport;

#[derive(Parser)]
#[command(name = "sgc-sim")]
#[command(about = "Simulate SGC group key agreement over a lossy broadcast medium")]
struct Cli {
    /// Number of members
    #[arg(short, long, default_value = "3")]
    members: u32,

    /// Simulated time to run, in milliseconds
    #[arg(short, long, default_value = "20000")]
    duration_ms: u64,

    /// Probability that a single delivery is lost
    #[arg(short, long, default_value = "0.0")]
    loss: f64,

    /// One-way delivery latency, in milliseconds
    #[arg(long, default_value = "5")]
    latency_ms: u64,

    /// Seed for every random choice; fresh entropy if omitted
    #[arg(long)]
    seed: Option<u64>,

    /// JSON configuration file; missing fields take their defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured group size
    #[arg(long)]
    group_size: Option<usize>,

    /// Write the report here instead of stdout
    #[arg(short, long)]
    report: Option<PathBuf>,
}

fn load_config(cli: &Cli) -> Result<SgcConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?
        }
        None => SgcConfig::default(),
    };
    if let Some(group_size) = cli.group_size {
        config.group_size = group_size;
    }
    Ok(config)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("sgc_sim=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    ensure!(
        (0.0..=1.0).contains(&cli.loss),
        "loss must be between 0 and 1, got {}",
        cli.loss
    );
    let config = load_config(&cli)?;

    let mut rng = match cli.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let mut store = PublicParameterStore::new();
    let params = store.setup(
        config.security_level,
        config.max_group_size,
        config.size_step,
        &mut rng,
    )?;
    let pseudo_keys = store
        .pseudo_slot_keys()
        .context("setup produced no pseudo slot keys")?;
    info!(
        tiers = params.tier_count(),
        max_group_size = config.max_group_size,
        "Public parameters ready"
    );

    let clock = ManualClock::starting_at(Timestamp::ZERO);
    let ctx = SgcContext::new(
        params,
        Arc::new(BulletinBoard::new()),
        Arc::new(clock.clone()),
        config.clone(),
    );

    let coordinator = Coordinator::with_rng(
        ctx.clone(),
        0,
        pseudo_keys,
        StdRng::seed_from_u64(rng.next_u64()),
    )?;
    let members = (1..=cli.members)
        .map(|pid| Member::with_rng(ctx.clone(), pid, StdRng::seed_from_u64(rng.next_u64())))
        .collect::<Result<Vec<_>, _>>()?;

    let link = LinkModel {
        loss: cli.loss,
        latency: Duration::from_millis(cli.latency_ms),
    };
    let mut sim = Simulation::new(coordinator, members, clock, config, link, rng);
    sim.arm_timers();

    info!(members = cli.members, duration_ms = cli.duration_ms, loss = cli.loss, "Simulation started");
    sim.run_until(Timestamp::from_millis(cli.duration_ms))?;

    let report = SimReport::collect(&sim, cli.duration_ms, cli.loss);
    info!(
        joined = report.members_joined,
        in_sync = report.members_in_sync,
        frames = report.frames_sent,
        "Simulation finished"
    );

    let json = serde_json::to_string_pretty(&report)?;
    match &cli.report {
        Some(path) => std::fs::write(path, json)
            .with_context(|| format!("writing report {}", path.display()))?,
        None => println!("{json}"),
    }
    Ok(())
}
