use anyhow::{Context, Result};
use clap::Parser;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use mr80211_abstract::{ArfConfig, RateAdaptation, SimConfig, StationSpec};
use mr80211_simulator::{SimulationReport, Simulator, scenario_runner};

#[derive(Parser, Debug)]
#[command(author, version, about = "802.11 DCF MAC simulator")]
struct Args {
    /// Load a scenario from disk. Without one a two-station demo runs.
    #[arg(long)]
    scenario: Option<PathBuf>,

    /// Write a JSON trace of the finished simulation.
    #[arg(long)]
    trace_out: Option<PathBuf>,

    /// Log every counter of every station, including the per-family ones.
    #[arg(long, default_value_t = false)]
    verbose_counters: bool,

    /// Run ARF rate adaptation in the demo. Scenarios pick it in `[config.rate_adaptation]`.
    #[arg(long, default_value_t = false)]
    arf: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt::init();
    info!("mr80211-sim-cli starting…");

    let sim = if let Some(path) = &args.scenario {
        scenario_runner::run_scenario(path)?
    } else {
        run_default_sim(args.verbose_counters, args.arf)?
    };

    log_counters(&sim, args.verbose_counters);
    let report = sim.export_report();
    info!(
        "Simulation finished at {:.6} s | deliveries: {} | give-ups: {}",
        report.duration,
        report.total_delivered(),
        report.tx_failures.len()
    );

    if let Some(trace_path) = &args.trace_out {
        write_trace(trace_path, &report)?;
    }

    Ok(())
}

/// Station 0 streams 1000-byte packets to station 1 while station 2 sends
/// it a few broadcasts.
fn run_default_sim(verbose_counters: bool, arf: bool) -> Result<Simulator> {
    let mut config = SimConfig {
        seed: 42,
        duration: 1.0,
        ..Default::default()
    };
    config.mac.mac.verbose_counters = verbose_counters;
    if arf {
        config.rate_adaptation = RateAdaptation::Arf(ArfConfig::default());
    }
    let stations = [
        StationSpec { x: 0.0, y: 0.0, ap: false },
        StationSpec { x: 30.0, y: 0.0, ap: false },
        StationSpec { x: 15.0, y: 20.0, ap: false },
    ];
    let mut sim = Simulator::new(config, &stations, None)?;
    for i in 0..20 {
        sim.schedule_send(0.01 * f64::from(i), 0, Some(1), 1000)?;
    }
    for i in 0..5 {
        sim.schedule_send(0.005 + 0.04 * f64::from(i), 2, None, 200)?;
    }

    info!("Starting default headless simulation…");
    sim.run()?;
    info!("Simulation complete.");
    Ok(sim)
}

fn log_counters(sim: &Simulator, verbose: bool) {
    if verbose {
        for (i, station) in sim.stations.iter().enumerate() {
            info!("station {}: {}", i, station.mac.mac_counters(true));
        }
    } else {
        sim.print_counters();
    }
    for line in sim.peer_stats_dump() {
        info!("{}", line);
    }
}

fn write_trace(path: &Path, report: &SimulationReport) -> Result<()> {
    let data = serde_json::to_vec_pretty(report).context("Failed to serialize simulation trace")?;
    fs::write(path, &data)
        .with_context(|| format!("Failed to write trace file {}", path.display()))?;
    Ok(())
}
