//! # Loopback - command line front end
//!
//! Runs one loopback measurement cycle against the audio hardware (or a
//! simulated cable) and prints the results, or analyzes a recorded WAV file.

mod cli;
mod report;

use anyhow::Context;
use clap::Parser;
use cli::{Cli, Command, Simulation};
use loopback_core::{LoopbackConfig, LoopbackController, SimulatedLoopback, SpectralAnalyzer};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = LoopbackConfig::load(cli.config.as_deref()).context("loading configuration")?;

    // stdout carries the results, logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::default().add_directive(configured_level(&config.log_level).into())
        }))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Run {
            frequency,
            simulate,
            capture_dir,
        } => run(config, frequency, simulate, capture_dir, cli.json),
        Command::Analyze { wav } => analyze(&wav, cli.json),
    }
}

/// Level from the config file. Logging is not up yet, so a bad value is
/// reported on stderr directly.
fn configured_level(level: &str) -> LevelFilter {
    level.trim().parse().unwrap_or_else(|_| {
        eprintln!("Unknown log_level '{level}', using info");
        LevelFilter::INFO
    })
}

fn run(
    mut config: LoopbackConfig,
    frequency: Option<String>,
    simulate: Option<Simulation>,
    capture_dir: Option<PathBuf>,
    json: bool,
) -> anyhow::Result<()> {
    if capture_dir.is_some() {
        config.capture_dir = capture_dir;
    }

    let controller = match simulate {
        None => LoopbackController::with_hardware(config)?,
        Some(simulation) => {
            tracing::info!(?simulation, "Using simulated loopback");
            LoopbackController::new(config, Box::new(simulated(simulation)))?
        }
    };
    if let Some(text) = frequency {
        controller.set_frequency_str(&text);
    }

    controller.run_test().context("loopback test failed")?;
    let state = controller
        .latest()
        .context("test finished without publishing results")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&*state)?);
    } else {
        println!("{}", report::test_state_text(&state));
    }
    Ok(())
}

fn analyze(path: &Path, json: bool) -> anyhow::Result<()> {
    let buffer = loopback_core::capture::read_wav(path)
        .with_context(|| format!("reading {}", path.display()))?;
    tracing::debug!(samples = buffer.len(), sample_rate = buffer.sample_rate(), "Loaded WAV");

    let result = SpectralAnalyzer::new().analyze(&buffer);
    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("{}", report::analysis_text(&result));
    }
    Ok(())
}

fn simulated(simulation: Simulation) -> SimulatedLoopback {
    match simulation {
        Simulation::Echo => SimulatedLoopback::echo(),
        Simulation::Distorted => SimulatedLoopback::echo()
            .with_gain(0.8)
            .with_latency(240)
            .with_distortion(0.02, 0.1),
    }
}
