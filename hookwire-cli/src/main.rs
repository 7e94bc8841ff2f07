//! hookwire CLI
//!
//! Host simulator for the hookwire-core library. It plays the embedding
//! application's part from a TOML scenario:
//! - Simulated clock with native repeating timers
//! - Scripted host calls, timer control and bus posts
//! - Owner destruction to exercise stale-callback handling
//! - Report generation (TXT/JSON)

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::fs;
use std::path::{Path, PathBuf};

mod config;
mod host;
mod report;
mod scenario;

/// hookwire - Drive the event-routing core from a scripted host
#[derive(Parser, Debug)]
#[command(name = "hookwire")]
#[command(about = "Run callback/timer/bus scenarios against hookwire-core", long_about = None)]
#[command(version)]
struct Args {
    /// Path to scenario file (scenario.toml)
    #[arg(short, long, value_name = "FILE")]
    scenario: Option<PathBuf>,

    /// Report format
    #[arg(short, long, value_enum, default_value_t = ReportFormat::Txt)]
    format: ReportFormat,

    /// Output file for the report (default: stdout)
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Verbosity level (can be repeated: -v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ReportFormat {
    Txt,
    Json,
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(args.verbose, args.quiet);

    log::info!("hookwire CLI v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Using core library v{}", hookwire_core::VERSION);

    match &args.scenario {
        Some(path) => run_scenario(path, &args)?,
        None => {
            // No arguments - show help
            println!("hookwire - No scenario specified");
            println!("\nQuick Start:");
            println!("  hookwire --scenario hookwire-cli/scenarios/demo.toml");
            println!("  hookwire --scenario demo.toml --format json --output report.json");
            println!("\nUse --help for more options");
        }
    }

    Ok(())
}

/// Load the scenario, play it, and write the report
fn run_scenario(path: &Path, args: &Args) -> Result<()> {
    log::info!("Loading scenario from: {:?}", path);
    let config = config::load_config(path)?;
    log::debug!(
        "Scenario loaded: {} handler(s), {} timer(s), {} subscription(s), {} step(s)",
        config.handlers.len(),
        config.timers.len(),
        config.subscriptions.len(),
        config.steps.len()
    );

    let mut runner = scenario::ScenarioRunner::new(config)
        .with_context(|| format!("Failed to set up scenario: {:?}", path))?;
    runner
        .run()
        .with_context(|| format!("Scenario aborted: {:?}", path))?;

    let report = report::Report::from_runner(&runner);
    runner.shutdown();

    let rendered = match args.format {
        ReportFormat::Txt => report.render_txt(),
        ReportFormat::Json => report.to_json().context("Failed to serialize report")?,
    };

    match &args.output {
        Some(output) => {
            fs::write(output, rendered)
                .with_context(|| format!("Failed to write report: {:?}", output))?;
            log::info!("Report written to {:?}", output);
        }
        None => print!("{}", rendered),
    }

    if report.errors > 0 {
        log::warn!("{} handler error(s) during the run", report.errors);
    }

    Ok(())
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}
