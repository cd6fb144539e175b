use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use log::info;

use ledger_processor::{config::ProcessorConfig, logger, supervisor, worker};

/// Single-writer block processor for the permissioned ledger.
///
/// Runs as the supervisor by default; the supervisor validates the
/// configuration once, spawns one worker process (`--worker`) that owns
/// the database connection and mines, and hands it the validated config
/// over stdin.
#[derive(Parser, Debug)]
#[command(name = "ledger_processor", version, about)]
struct Cli {
    /// Run as the mining worker (spawned by the supervisor)
    #[arg(long, hide = true)]
    worker: bool,

    /// Optional path to a JSON configuration file; env vars take precedence
    config: Option<PathBuf>,
}

fn init(cli: &Cli) -> anyhow::Result<ProcessorConfig> {
    let config =
        ProcessorConfig::load(cli.config.as_deref()).context("invalid configuration")?;
    logger::init(&config).context("cannot initialise logging")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let code = if cli.worker {
        // the worker receives the already-validated config on stdin and
        // sets up its own logging once it arrives
        worker::run().await
    } else {
        let config = match init(&cli) {
            Ok(config) => config,
            Err(err) => {
                // logging may not be up yet; plain stderr is all we have
                eprintln!("{err:#}");
                return ExitCode::FAILURE;
            }
        };
        info!("Starting processor supervisor");
        supervisor::run(config).await
    };
    ExitCode::from(code.clamp(0, u8::MAX as i32) as u8)
}
