//! Process-level watchdog.
//!
//! Owns one worker at a time: spawns it, watches its report stream, kills
//! it on memory overrun or missed-report streaks, restarts it according to
//! the exit-code policy, and coordinates graceful shutdown on signals.
//! The supervisor is the sole authority on process exit.

use std::{future::pending, io, process::Stdio, time::Duration};

use log::{error, info, warn};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, Command},
    signal::unix::{signal, SignalKind},
    time::Instant,
};

use crate::{
    config::{
        is_stay_down, ProcessorConfig, EXIT_CLEAN, EXIT_FAILURE, HARD_KILL_TIMEOUT_SECONDS,
        MISSED_REPORTS_BEFORE_KILL, RESTART_DELAY_SECONDS, SPAWN_BACKOFF_CAP_SECONDS,
    },
    ipc::{SupervisorMessage, WorkerMessage},
};

/// Run the supervisor until shutdown or a stay-down condition; returns the
/// process exit code.
pub async fn run(config: ProcessorConfig) -> i32 {
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

    let liveness_period = Duration::from_secs(config.block_interval as u64 * 2);
    let mut shutting_down = false;
    let mut spawn_failures: u32 = 0;

    loop {
        let mut child = match spawn_worker() {
            Ok(child) => {
                spawn_failures = 0;
                child
            }
            Err(err) => {
                error!("Cannot spawn the worker: {err}");
                if shutting_down {
                    return EXIT_FAILURE;
                }
                spawn_failures += 1;
                let delay = backoff_seconds(spawn_failures);
                warn!("Retrying the worker spawn in {delay} seconds");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(delay)) => {}
                    _ = sigint.recv() => return EXIT_CLEAN,
                    _ = sigterm.recv() => return EXIT_CLEAN,
                }
                continue;
            }
        };
        info!("Worker started");

        let mut stdin = child.stdin.take();
        // config was validated before the first spawn; the worker gets the
        // result instead of re-reading the sources
        send_message(
            &mut stdin,
            &SupervisorMessage::Config {
                config: config.clone(),
            },
        )
        .await;
        let mut lines = match child.stdout.take() {
            Some(stdout) => BufReader::new(stdout).lines(),
            None => {
                error!("Worker has no stdout, killing it");
                let _ = child.start_kill();
                return EXIT_FAILURE;
            }
        };

        let mut liveness =
            tokio::time::interval_at(Instant::now() + liveness_period, liveness_period);
        let mut missed: u32 = 0;
        let mut reported_since_check = false;
        let mut init_running = false;
        let mut hard_kill_at: Option<Instant> = None;
        let mut stdout_open = true;

        // child actions happen after the select so its wait future never
        // holds the borrow across a kill
        let status = loop {
            let mut kill_child = false;
            tokio::select! {
                status = child.wait() => break status,

                line = lines.next_line(), if stdout_open => {
                    if let Ok(Some(line)) = line {
                        match serde_json::from_str::<WorkerMessage>(&line) {
                            Ok(WorkerMessage::Init { .. }) => {
                                // a long initialisation is exempt from the
                                // liveness timeout
                                init_running = true;
                                missed = 0;
                            }
                            Ok(WorkerMessage::Report { memory_mb }) => {
                                init_running = false;
                                missed = 0;
                                reported_since_check = true;
                                if memory_mb > config.max_memory {
                                    warn!(
                                        "Worker uses {memory_mb} MiB (limit {}), restarting it",
                                        config.max_memory
                                    );
                                    kill_child = true;
                                }
                            }
                            Err(_) => warn!("Ignoring malformed worker message"),
                        }
                    } else {
                        // EOF or broken pipe: child.wait() fires next
                        stdout_open = false;
                    }
                }

                _ = liveness.tick() => {
                    if !reported_since_check && !init_running {
                        missed += 1;
                        if missed >= MISSED_REPORTS_BEFORE_KILL {
                            error!(
                                "Worker missed {missed} consecutive report checks, killing it"
                            );
                            kill_child = true;
                        }
                    }
                    reported_since_check = false;
                }

                _ = sigint.recv() => {
                    info!("Received SIGINT, asking the worker to shut down");
                    shutting_down = true;
                    send_message(&mut stdin, &SupervisorMessage::Shutdown).await;
                }

                _ = sigterm.recv() => {
                    info!("Received SIGTERM, asking the worker to shut down");
                    shutting_down = true;
                    send_message(&mut stdin, &SupervisorMessage::Shutdown).await;
                    hard_kill_at = Some(
                        Instant::now() + Duration::from_secs(HARD_KILL_TIMEOUT_SECONDS),
                    );
                }

                _ = maybe_sleep_until(hard_kill_at) => {
                    warn!("Worker did not shut down in time, killing it");
                    kill_child = true;
                    hard_kill_at = None;
                }
            }
            if kill_child {
                let _ = child.start_kill();
            }
        };

        // killed by a signal yields no code; treat it as a plain failure
        let code = match status {
            Ok(status) => status.code().unwrap_or(EXIT_FAILURE),
            Err(err) => {
                error!("Cannot await the worker: {err}");
                EXIT_FAILURE
            }
        };

        if is_stay_down(code) {
            error!("Worker exited with stay-down code {code}, not restarting");
            return code;
        }
        if shutting_down {
            return if code == EXIT_CLEAN {
                EXIT_CLEAN
            } else {
                EXIT_FAILURE
            };
        }
        if code == EXIT_CLEAN {
            info!("Worker exited cleanly, restarting");
        } else {
            error!("Worker exited with code {code}, restarting");
        }

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(RESTART_DELAY_SECONDS)) => {}
            _ = sigint.recv() => return EXIT_CLEAN,
            _ = sigterm.recv() => return EXIT_CLEAN,
        }
    }
}

fn spawn_worker() -> io::Result<Child> {
    let exe = std::env::current_exe()?;
    let mut command = Command::new(exe);
    command
        .arg("--worker")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        // worker logs go straight to our stderr
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    command.spawn()
}

async fn send_message(stdin: &mut Option<ChildStdin>, message: &SupervisorMessage) {
    let Some(stdin) = stdin.as_mut() else {
        return;
    };
    let Ok(mut line) = serde_json::to_string(message) else {
        return;
    };
    line.push('\n');
    let _ = stdin.write_all(line.as_bytes()).await;
    let _ = stdin.flush().await;
}

async fn maybe_sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => pending().await,
    }
}

fn backoff_seconds(failures: u32) -> u64 {
    let exp = failures.min(16);
    (1u64 << exp).min(SPAWN_BACKOFF_CAP_SECONDS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_caps_at_five_minutes() {
        assert_eq!(backoff_seconds(1), 2);
        assert_eq!(backoff_seconds(2), 4);
        assert_eq!(backoff_seconds(8), 256);
        assert_eq!(backoff_seconds(9), SPAWN_BACKOFF_CAP_SECONDS);
        assert_eq!(backoff_seconds(40), SPAWN_BACKOFF_CAP_SECONDS);
    }
}
