//! The mining worker process.
//!
//! Spawned by the supervisor with `--worker`. The first stdin line is the
//! configuration the supervisor already validated; the worker never
//! re-reads the config sources. It then runs the mining loop on a
//! one-second tick, writes `WorkerMessage`s to stdout, listens for the
//! shutdown message on the rest of stdin and for SIGINT/SIGTERM, and
//! exits with the code the supervisor should act on.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use log::{error, info, warn};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin},
    signal::unix::{signal, SignalKind},
    sync::mpsc,
};

use crate::{
    config::{ProcessorConfig, EXIT_CLEAN, EXIT_FAILURE, TICK_INTERVAL_MILLIS},
    core::{miner::Miner, store::PgStore},
    ipc::{SupervisorMessage, WorkerMessage},
};

/// Run the worker until shutdown; returns the process exit code.
pub async fn run() -> i32 {
    let mut stdin_lines = BufReader::new(tokio::io::stdin()).lines();

    // the supervisor validated the config and hands it over as the first
    // message; logging cannot start before it arrives
    let config = match receive_config(&mut stdin_lines).await {
        Ok(config) => config,
        Err(reason) => {
            eprintln!("Worker received no configuration: {reason}");
            return EXIT_FAILURE;
        }
    };
    if let Err(err) = crate::logger::init(&config) {
        eprintln!("Cannot initialise logging: {err}");
        return EXIT_FAILURE;
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let (reports, mut report_rx) = mpsc::unbounded_channel::<WorkerMessage>();

    // stdout writer: one JSON message per line
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(message) = report_rx.recv().await {
            let Ok(mut line) = serde_json::to_string(&message) else {
                continue;
            };
            line.push('\n');
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    // stdin listener: the supervisor's shutdown request
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            while let Ok(Some(line)) = stdin_lines.next_line().await {
                match serde_json::from_str::<SupervisorMessage>(&line) {
                    Ok(SupervisorMessage::Shutdown) => {
                        info!("Shutdown requested by the supervisor");
                        shutdown.store(true, Ordering::SeqCst);
                    }
                    Ok(SupervisorMessage::Config { .. }) => {
                        warn!("Ignoring repeated configuration message");
                    }
                    Err(_) => warn!("Ignoring malformed supervisor message"),
                }
            }
        });
    }

    // the first ticks may replay a long recovery; tell the supervisor to
    // pause the liveness counter
    let _ = reports.send(WorkerMessage::Init { init: true });

    let store = PgStore::new(&config);
    let mut miner = match Miner::new(store, config, shutdown.clone(), reports) {
        Ok(miner) => miner,
        Err(err) => {
            error!("Cannot start the mining loop: {err}");
            return EXIT_FAILURE;
        }
    };

    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(sig) => sig,
        Err(err) => {
            error!("Cannot install SIGINT handler: {err}");
            return EXIT_FAILURE;
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(err) => {
            error!("Cannot install SIGTERM handler: {err}");
            return EXIT_FAILURE;
        }
    };

    let tick_interval = Duration::from_millis(TICK_INTERVAL_MILLIS);
    let mut interval = tokio::time::interval(tick_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let exit_code = loop {
        tokio::select! {
            _ = interval.tick() => {
                let started = Instant::now();
                if let Err(stay_down) = miner.tick().await {
                    error!("{}", stay_down);
                    break stay_down.code;
                }
                if started.elapsed() > tick_interval {
                    warn!("Mining tick overran its interval ({:?})", started.elapsed());
                }
                if shutdown.load(Ordering::SeqCst) {
                    info!("Drained the running tick, exiting");
                    break EXIT_CLEAN;
                }
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down after the current tick");
                shutdown.store(true, Ordering::SeqCst);
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down after the current tick");
                shutdown.store(true, Ordering::SeqCst);
            }
        }
    };

    writer.abort();
    exit_code
}

async fn receive_config(
    lines: &mut Lines<BufReader<Stdin>>,
) -> Result<ProcessorConfig, String> {
    let line = lines
        .next_line()
        .await
        .map_err(|err| err.to_string())?
        .ok_or_else(|| "stdin closed before the configuration arrived".to_string())?;
    match serde_json::from_str::<SupervisorMessage>(&line) {
        Ok(SupervisorMessage::Config { config }) => Ok(config),
        Ok(SupervisorMessage::Shutdown) => Err("expected a configuration message".to_string()),
        Err(err) => Err(err.to_string()),
    }
}
