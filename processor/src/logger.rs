//! Logging pipeline: fern dispatcher, LOG_FORMAT template, secret
//! redaction and the panic hook.
//!
//! Every formatted record passes through the redactor before it reaches a
//! sink, so the private key, database password and telemetry URL can never
//! leak through an error path. Panics are logged through the same pipeline
//! and terminate the process with exit code 1.

use std::sync::OnceLock;

use fern::colors::{Color, ColoredLevelConfig};
use log::LevelFilter;

use crate::config::{ProcessorConfig, EXIT_FAILURE};

static REDACTOR: OnceLock<Redactor> = OnceLock::new();

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";
const COLOR_RESET: &str = "\x1B[0m";

struct Redactor {
    secrets: Vec<String>,
}

impl Redactor {
    fn scrub(&self, text: &str) -> String {
        let mut scrubbed = text.to_string();
        for secret in &self.secrets {
            if scrubbed.contains(secret.as_str()) {
                scrubbed = scrubbed.replace(secret.as_str(), "[redacted]");
            }
        }
        scrubbed
    }
}

/// Scrub configured secrets out of a message. Identity until `init` ran.
pub fn redact(text: &str) -> String {
    match REDACTOR.get() {
        Some(redactor) => redactor.scrub(text),
        None => text.to_string(),
    }
}

fn level_filter(level: u8) -> LevelFilter {
    match level {
        0 => LevelFilter::Debug,
        1 => LevelFilter::Info,
        2 => LevelFilter::Warn,
        3 | 4 => LevelFilter::Error,
        _ => LevelFilter::Off,
    }
}

fn render_template(
    template: &str,
    colors: &ColoredLevelConfig,
    record: &log::Record,
    message: &str,
) -> String {
    let mut line = template.to_string();
    let has_color = line.contains("$color");
    line = line.replace(
        "$color",
        &format!("\x1B[{}m", colors.get_color(&record.level()).to_fg_str()),
    );
    line = line.replace(
        "$timestamp",
        &chrono::Local::now().format(TIMESTAMP_FORMAT).to_string(),
    );
    line = line.replace("$severity", record.level().as_str());
    line = line.replace("$message", message);
    // separate template slot in the original format; errors arrive inside
    // the message here
    line = line.replace("$error", "");
    if has_color {
        line.push_str(COLOR_RESET);
    }
    line
}

/// Install the fern dispatcher and the redacting panic hook.
pub fn init(config: &ProcessorConfig) -> Result<(), fern::InitError> {
    let _ = REDACTOR.set(Redactor {
        secrets: config.secrets(),
    });

    let colors = ColoredLevelConfig::new()
        .debug(Color::BrightBlack)
        .info(Color::Green)
        .warn(Color::Yellow)
        .error(Color::Red);
    let template = config.log_format.clone();

    fern::Dispatch::new()
        .format(move |out, message, record| {
            let message = message.to_string();
            let line = if template.is_empty() {
                format!(
                    "{} {:<5} {}",
                    chrono::Local::now().format(TIMESTAMP_FORMAT),
                    colors.color(record.level()),
                    message
                )
            } else {
                render_template(&template, &colors, record, &message)
            };
            out.finish(format_args!("{}", redact(&line)))
        })
        .level(level_filter(config.log_level))
        // stdout carries the supervisor/worker message channel
        .chain(std::io::stderr())
        .apply()?;

    install_panic_hook();
    Ok(())
}

// Log the panic through the normal (redacting) pipeline, then exit 1:
// the supervisor treats that as a restartable failure.
fn install_panic_hook() {
    log_panics::Config::new()
        .backtrace_mode(log_panics::BacktraceMode::Resolved)
        .install_panic_hook();
    let logging_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        logging_hook(info);
        std::process::exit(EXIT_FAILURE);
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scrub_replaces_every_occurrence() {
        let redactor = Redactor {
            secrets: vec!["hunter2".to_string(), "KxWIF".to_string()],
        };
        let scrubbed = redactor.scrub("password=hunter2 key=KxWIF again hunter2");
        assert_eq!(scrubbed, "password=[redacted] key=[redacted] again [redacted]");
    }

    #[test]
    fn test_scrub_without_match_is_identity() {
        let redactor = Redactor {
            secrets: vec!["hunter2".to_string()],
        };
        assert_eq!(redactor.scrub("nothing to hide"), "nothing to hide");
    }

    #[test]
    fn test_level_mapping() {
        assert_eq!(level_filter(0), LevelFilter::Debug);
        assert_eq!(level_filter(1), LevelFilter::Info);
        assert_eq!(level_filter(2), LevelFilter::Warn);
        assert_eq!(level_filter(3), LevelFilter::Error);
        assert_eq!(level_filter(4), LevelFilter::Error);
        assert_eq!(level_filter(5), LevelFilter::Off);
    }

    #[test]
    fn test_template_substitution() {
        let colors = ColoredLevelConfig::new();
        // one statement: the record borrows the format_args temporary
        let line = render_template(
            "$severity: $message$error",
            &colors,
            &log::Record::builder()
                .level(log::Level::Warn)
                .args(format_args!("ignored"))
                .build(),
            "hello",
        );
        assert_eq!(line, "WARN: hello");
    }
}
