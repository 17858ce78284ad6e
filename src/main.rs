//! CLI Entry Point for pulsed-odmr
//!
//! Provides command-line access to:
//! - Sweep planning against the configured device limits
//! - Pulse-pattern compilation (sample counts, timing, π compensation)
//! - A full scan against the simulated bench
//!
//! # Usage
//!
//! ```bash
//! pulsed-odmr plan --start 2.82e9 --stop 2.92e9 --step 1e6
//! pulsed-odmr compile --pi 55e-9
//! pulsed-odmr --config config/odmr.toml scan --lines 10 --save nv1
//! ```

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use pulsed_odmr::experiment::planner::plan;
use pulsed_odmr::experiment::pulses::{DigitalChannel, PulseBuilder, PulseMode};
use pulsed_odmr::experiment::state::RunState;
use pulsed_odmr::hardware::mock::SimulatedBench;
use pulsed_odmr::hardware::LaserEnable;
use pulsed_odmr::{logging, OdmrConfig, OdmrModule};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "pulsed-odmr")]
#[command(about = "Pulsed ODMR acquisition core", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = pulsed_odmr::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Clamp a sweep to the device limits and print the frequency list
    Plan {
        #[arg(long)]
        start: Option<f64>,
        #[arg(long)]
        stop: Option<f64>,
        #[arg(long)]
        step: Option<f64>,
        /// dBm
        #[arg(long)]
        power: Option<f64>,
    },

    /// Compile the pulse pattern and print its layout
    Compile {
        /// π pulse length in seconds
        #[arg(long)]
        pi: Option<f64>,
        #[arg(long)]
        rep: Option<usize>,
        /// Continuous-wave pattern (microwave gate always open)
        #[arg(long)]
        cw: bool,
    },

    /// Run a scan on the simulated bench
    Scan {
        /// Lines to acquire before stopping
        #[arg(long, default_value = "5")]
        lines: u64,
        /// Single sweep time in seconds
        #[arg(long)]
        sweep_time: Option<f64>,
        /// Save the result under this tag
        #[arg(long)]
        save: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = OdmrConfig::load_from(&cli.config)?;
    config.validate()?;
    logging::init(&config.logging())?;

    match cli.command {
        Commands::Plan {
            start,
            stop,
            step,
            power,
        } => plan_sweep(&config, start, stop, step, power),
        Commands::Compile { pi, rep, cw } => compile_pattern(&config, pi, rep, cw),
        Commands::Scan {
            lines,
            sweep_time,
            save,
        } => scan(config, lines, sweep_time, save).await,
    }
}

fn plan_sweep(
    config: &OdmrConfig,
    start: Option<f64>,
    stop: Option<f64>,
    step: Option<f64>,
    power: Option<f64>,
) -> Result<()> {
    let mut sweep = config.sweep;
    sweep.start = start.unwrap_or(sweep.start);
    sweep.stop = stop.unwrap_or(sweep.stop);
    sweep.step = step.unwrap_or(sweep.step);
    sweep.power = power.unwrap_or(sweep.power);

    let planned = plan(
        &sweep.request(),
        &config.microwave.limits,
        config.microwave.trigger_polarity,
    )?;
    for adj in &planned.adjustments {
        println!(
            "adjusted {:?}: {} -> {} ({})",
            adj.field, adj.requested, adj.applied, adj.reason
        );
    }
    let plan = &planned.plan;
    println!(
        "{} points at {} dBm, trigger {:?}",
        plan.len(),
        plan.power(),
        plan.polarity()
    );
    for f in plan.frequencies() {
        println!("{f:.1}");
    }
    Ok(())
}

fn compile_pattern(config: &OdmrConfig, pi: Option<f64>, rep: Option<usize>, cw: bool) -> Result<()> {
    let mut pulses = config.pulses;
    pulses.pi_pulse_length = pi.unwrap_or(pulses.pi_pulse_length);
    pulses.rep_per_freq = rep.unwrap_or(pulses.rep_per_freq);
    if cw {
        pulses.mode = PulseMode::Cw;
    }

    let settings = config.coordinator_settings();
    let waveform = PulseBuilder::new(settings.timing).compile(&pulses.params(settings.sample_rate))?;

    println!("mode:               {:?}", pulses.mode);
    println!("sample rate:        {} Hz", waveform.sample_rate());
    println!("samples per sweep:  {}", waveform.samples_per_sweep());
    println!(
        "total pulse length: {:.3} us",
        waveform.total_pulse_length_seconds() * 1e6
    );
    match waveform.effective_pi_pulse_length() {
        Some(pi) => println!("effective pi:       {:.1} ns", pi * 1e9),
        None => println!("effective pi:       n/a"),
    }
    for channel in DigitalChannel::ALL {
        println!(
            "{:<19} {} high intervals",
            format!("{channel:?}:"),
            waveform.high_intervals(channel).len()
        );
    }
    Ok(())
}

async fn scan(
    config: OdmrConfig,
    lines: u64,
    sweep_time: Option<f64>,
    save: Option<String>,
) -> Result<()> {
    let bench = SimulatedBench::new();
    bench.set_memory_granularity(config.pulser.memory_granularity);
    let odmr = OdmrModule::spawn(&config, bench.instruments(), LaserEnable::new())?;

    if let Some(single_sweep_time) = sweep_time {
        let mut sweep = config.sweep;
        sweep.single_sweep_time = single_sweep_time;
        odmr.set_sweep(sweep).await?;
    }

    odmr.start().await?;
    let params = odmr.parameters().await?;
    println!(
        "scanning {:.4} - {:.4} GHz, {} averages per line",
        params.sweep.start / 1e9,
        params.sweep.stop / 1e9,
        params.average_factor.unwrap_or(0)
    );

    let mut ticker = tokio::time::interval(odmr.query_interval());
    loop {
        ticker.tick().await;
        let status = odmr.current_status();
        let snapshot = odmr.snapshot();
        if snapshot.elapsed_lines >= lines {
            break;
        }
        match status.state {
            RunState::Idle | RunState::Error => {
                odmr.shutdown().await?;
                bail!(
                    "run ended early in {}: {}",
                    status.state,
                    status.reason.unwrap_or_default()
                );
            }
            _ => {}
        }
        print!(
            "\rline {:>4}  {:>7.1} s  {}",
            snapshot.elapsed_lines, snapshot.elapsed_time, status.state
        );
        std::io::stdout().flush()?;
    }
    println!();

    odmr.stop().await?;
    odmr.wait_for_state(RunState::Idle, Duration::from_secs(30))
        .await?;

    let fit = odmr.fit("lorentzian", None).await?;
    if let (Some(center), Some(fwhm)) = (fit.params.get("center"), fit.params.get("fwhm")) {
        println!(
            "dip at {:.4} GHz, FWHM {:.2} MHz",
            center / 1e9,
            fwhm / 1e6
        );
    }

    if let Some(tag) = save {
        let path = odmr.save(tag).await?;
        println!("saved {}", path.display());
    }

    odmr.shutdown().await?;
    Ok(())
}
