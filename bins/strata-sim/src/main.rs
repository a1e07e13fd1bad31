//! strata-sim: replay a lending pool scenario.
//!
//! Loads a pool configuration, runs the steps of a JSON scenario against an
//! in-process pool, then prints the recorded events as JSON lines followed by
//! the liquidity node table. With `--state` the pool is resumed from and saved
//! back to a snapshot file, so scenarios can be chained.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use strata_core::constants::UNIT;
use strata_pool::PoolConfig;
use tracing::info;

mod runner;
mod scenario;

use runner::Runner;
use scenario::Scenario;

#[derive(Parser, Debug)]
#[command(name = "strata-sim", version, about = "Replay a lending pool scenario")]
struct Args {
    /// Scenario file (JSON)
    #[arg(long)]
    scenario: PathBuf,

    /// Pool configuration file (TOML). Defaults to <config dir>/strata/pool.toml
    /// when present; STRATA_* environment variables override either.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Snapshot file to resume from and save to
    #[arg(long)]
    state: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Log output format ("text" or "json")
    #[arg(long, default_value = "text")]
    log_format: String,
}

impl Args {
    fn config_path(&self) -> Option<PathBuf> {
        self.config.clone().or_else(|| {
            dirs::config_dir()
                .map(|d| d.join("strata").join("pool.toml"))
                .filter(|p| p.exists())
        })
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level, &args.log_format);

    let config_path = args.config_path();
    let config = PoolConfig::load(config_path.as_deref()).context("Failed to load pool configuration")?;
    let scenario = Scenario::load(&args.scenario)?;
    info!(
        config = ?config_path,
        scenario = %args.scenario.display(),
        steps = scenario.steps.len(),
        "strata-sim v{}",
        env!("CARGO_PKG_VERSION")
    );

    let mut runner = Runner::new(config, &scenario)?;
    if let Some(state) = &args.state {
        runner.resume(state)?;
    }

    let result = runner.run(&scenario.steps);

    for event in runner.take_events() {
        println!("{}", serde_json::to_string(&event)?);
    }
    println!();
    print!("{}", runner.node_table());
    let pool = runner.pool();
    println!();
    println!("clock:      {}", runner.now());
    println!("cash:       {:.8}", pool.cash() as f64 / UNIT as f64);
    println!("admin fees: {:.8}", pool.admin_fee_balance() as f64 / UNIT as f64);
    println!("seized:     {}", runner.seized());

    // A failed run leaves the previous snapshot in place.
    result?;
    if let Some(state) = &args.state {
        runner.save(state)?;
    }
    Ok(())
}

/// Initialize tracing subscriber with the given log level and output format.
///
/// Pass `format = "json"` for structured JSON output. Any other value
/// defaults to human-readable text. `RUST_LOG` takes precedence over `level`.
fn init_logging(level: &str, format: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_level(true).with_writer(std::io::stderr))
            .init();
    }
}
