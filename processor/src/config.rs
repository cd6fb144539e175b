use std::{env, fmt, fs, path::Path, str::FromStr};

use ledger_common::{
    config::{MAX_SIGN_PREFIX_LENGTH, MILLIS_PER_SECOND},
    crypto::PrivateKey,
    time::TimestampMillis,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// The worker attempts one tick per second; the pacing gate decides whether
// the tick actually mines.
pub const TICK_INTERVAL_MILLIS: u64 = 1000;

// Oldest server we can run against: SET LOCAL ROLE + savepoint semantics
// are only reliable from 9.5 on.
pub const MIN_POSTGRES_VERSION: u32 = 90500;

// Older servers still work but miss the json planner fixes we lean on
pub const RECOMMENDED_POSTGRES_VERSION: u32 = 100000;

// Restart policy of the supervisor
pub const RESTART_DELAY_SECONDS: u64 = 1;
pub const SPAWN_BACKOFF_CAP_SECONDS: u64 = 300;
pub const MISSED_REPORTS_BEFORE_KILL: u32 = 4;
pub const HARD_KILL_TIMEOUT_SECONDS: u64 = 10;

// Exit codes. Anything in [STAY_DOWN_MIN, STAY_DOWN_MAX] means automatic
// restart would be harmful and the supervisor must stay down too.
pub const EXIT_CLEAN: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const STAY_DOWN_MIN: i32 = 50;
pub const STAY_DOWN_MAX: i32 = 59;
pub const EXIT_UNSUPPORTED_POSTGRES: i32 = 52;

pub fn is_stay_down(code: i32) -> bool {
    (STAY_DOWN_MIN..=STAY_DOWN_MAX).contains(&code)
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Cannot parse config file {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("Missing required key {0}")]
    Missing(&'static str),
}

// Raw view of a JSON config file; env vars overlay these.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct RawConfig {
    #[serde(rename = "DBUSER")]
    db_user: Option<String>,
    #[serde(rename = "DBNAME")]
    db_name: Option<String>,
    #[serde(rename = "DBHOST")]
    db_host: Option<String>,
    #[serde(rename = "DBPORT")]
    db_port: Option<u16>,
    #[serde(rename = "DBPASSWORD")]
    db_password: Option<String>,
    #[serde(rename = "PRIVATE_KEY")]
    private_key: Option<String>,
    #[serde(rename = "SIGN_PREFIX")]
    sign_prefix: Option<String>,
    #[serde(rename = "LOG_LEVEL")]
    log_level: Option<u8>,
    #[serde(rename = "LOG_FORMAT")]
    log_format: Option<String>,
    #[serde(rename = "BLOCK_INTERVAL")]
    block_interval: Option<u32>,
    #[serde(rename = "MIN_BLOCK_INTERVAL")]
    min_block_interval: Option<u32>,
    #[serde(rename = "TRANSACTIONS_PER_BLOCK")]
    transactions_per_block: Option<u16>,
    #[serde(rename = "MAX_BLOCK_SIZE")]
    max_block_size: Option<u32>,
    #[serde(rename = "MAX_MEMORY")]
    max_memory: Option<u64>,
    #[serde(rename = "EXCLUDE_REJECTED")]
    exclude_rejected: Option<bool>,
    #[serde(rename = "SENTRY_URL")]
    sentry_url: Option<String>,
}

/// Validated process-wide configuration.
///
/// Loaded and validated once, in the supervisor, before the first worker
/// spawn; each worker receives the validated result as the first message
/// on its stdin instead of re-reading the config sources.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    pub db_user: String,
    pub db_name: String,
    pub db_host: String,
    pub db_port: u16,
    pub db_password: String,
    // WIF, kept as text so the redactor can scrub it from any log line
    pub private_key: String,
    pub sign_prefix: String,
    pub log_level: u8,
    pub log_format: String,
    // seconds
    pub block_interval: u32,
    // seconds, floor between blocks
    pub min_block_interval: u32,
    pub transactions_per_block: u16,
    // bytes
    pub max_block_size: u32,
    // MiB, supervisor restart trigger
    pub max_memory: u64,
    pub exclude_rejected: bool,
    pub sentry_url: String,
}

impl ProcessorConfig {
    /// Load from an optional JSON file, overlay env vars, validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut raw = match path {
            Some(path) => {
                let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.display().to_string(),
                    source,
                })?;
                serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
                    path: path.display().to_string(),
                    source,
                })?
            }
            None => RawConfig::default(),
        };
        overlay_env(&mut raw)?;

        let config = ProcessorConfig {
            db_user: raw.db_user.unwrap_or_else(|| "processor".to_string()),
            db_name: raw.db_name.unwrap_or_else(|| "blockchain".to_string()),
            db_host: raw.db_host.unwrap_or_else(|| "localhost".to_string()),
            db_port: raw.db_port.unwrap_or(5432),
            db_password: raw.db_password.ok_or(ConfigError::Missing("DBPASSWORD"))?,
            private_key: raw.private_key.ok_or(ConfigError::Missing("PRIVATE_KEY"))?,
            sign_prefix: raw.sign_prefix.ok_or(ConfigError::Missing("SIGN_PREFIX"))?,
            log_level: raw.log_level.unwrap_or(0),
            log_format: raw.log_format.unwrap_or_default(),
            block_interval: raw.block_interval.unwrap_or(60),
            min_block_interval: raw.min_block_interval.unwrap_or(5),
            transactions_per_block: raw.transactions_per_block.unwrap_or(500),
            max_block_size: raw.max_block_size.unwrap_or(1_000_000),
            max_memory: raw.max_memory.unwrap_or(1024),
            exclude_rejected: raw.exclude_rejected.unwrap_or(false),
            sentry_url: raw.sentry_url.unwrap_or_default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.db_port == 0 {
            return Err(invalid("DBPORT", "must be in 1..=65535"));
        }
        PrivateKey::from_wif(&self.private_key)
            .map_err(|e| invalid("PRIVATE_KEY", format!("not a valid WIF key ({e})")))?;
        if self.sign_prefix.is_empty() || self.sign_prefix.len() > MAX_SIGN_PREFIX_LENGTH {
            return Err(invalid(
                "SIGN_PREFIX",
                format!("must be 1..={MAX_SIGN_PREFIX_LENGTH} UTF-8 bytes"),
            ));
        }
        if self.log_level > 5 {
            return Err(invalid("LOG_LEVEL", "must be in 0..=5"));
        }
        if self.block_interval == 0 {
            return Err(invalid("BLOCK_INTERVAL", "must be at least 1 second"));
        }
        if self.min_block_interval == 0 || self.min_block_interval > self.block_interval {
            return Err(invalid(
                "MIN_BLOCK_INTERVAL",
                "must be at least 1 and at most BLOCK_INTERVAL",
            ));
        }
        if self.transactions_per_block == 0 {
            return Err(invalid("TRANSACTIONS_PER_BLOCK", "must be at least 1"));
        }
        if self.max_block_size < 110_000 {
            return Err(invalid("MAX_BLOCK_SIZE", "must be at least 110000 bytes"));
        }
        if self.max_memory < 128 {
            return Err(invalid("MAX_MEMORY", "must be at least 128 MiB"));
        }
        Ok(())
    }

    /// Parse the WIF signing key. `validate` already proved it parses.
    pub fn signing_key(&self) -> Result<PrivateKey, ConfigError> {
        PrivateKey::from_wif(&self.private_key)
            .map_err(|e| invalid("PRIVATE_KEY", format!("not a valid WIF key ({e})")))
    }

    pub fn block_interval_millis(&self) -> TimestampMillis {
        self.block_interval as TimestampMillis * MILLIS_PER_SECOND
    }

    pub fn min_block_interval_millis(&self) -> TimestampMillis {
        self.min_block_interval as TimestampMillis * MILLIS_PER_SECOND
    }

    /// Values that must never appear in a log line.
    pub fn secrets(&self) -> Vec<String> {
        [&self.private_key, &self.db_password, &self.sentry_url]
            .into_iter()
            .filter(|s| !s.is_empty())
            .cloned()
            .collect()
    }
}

// Secrets stay out of Debug output
impl fmt::Debug for ProcessorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorConfig")
            .field("db_user", &self.db_user)
            .field("db_name", &self.db_name)
            .field("db_host", &self.db_host)
            .field("db_port", &self.db_port)
            .field("db_password", &"[REDACTED]")
            .field("private_key", &"[REDACTED]")
            .field("sign_prefix", &self.sign_prefix)
            .field("log_level", &self.log_level)
            .field("block_interval", &self.block_interval)
            .field("min_block_interval", &self.min_block_interval)
            .field("transactions_per_block", &self.transactions_per_block)
            .field("max_block_size", &self.max_block_size)
            .field("max_memory", &self.max_memory)
            .field("exclude_rejected", &self.exclude_rejected)
            .finish()
    }
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.into(),
    }
}

fn env_string(key: &'static str, slot: &mut Option<String>) {
    if let Ok(value) = env::var(key) {
        *slot = Some(value);
    }
}

fn env_parse<T: FromStr>(key: &'static str, slot: &mut Option<T>) -> Result<(), ConfigError> {
    match env::var(key) {
        Ok(value) => {
            let parsed = value
                .parse()
                .map_err(|_| invalid(key, format!("cannot parse {value:?}")))?;
            *slot = Some(parsed);
            Ok(())
        }
        Err(_) => Ok(()),
    }
}

fn env_bool(key: &'static str, slot: &mut Option<bool>) -> Result<(), ConfigError> {
    match env::var(key) {
        Ok(value) => match value.as_str() {
            "1" | "true" | "TRUE" | "True" => {
                *slot = Some(true);
                Ok(())
            }
            "0" | "false" | "FALSE" | "False" => {
                *slot = Some(false);
                Ok(())
            }
            other => Err(invalid(key, format!("cannot parse {other:?} as a bool"))),
        },
        Err(_) => Ok(()),
    }
}

fn overlay_env(raw: &mut RawConfig) -> Result<(), ConfigError> {
    env_string("DBUSER", &mut raw.db_user);
    env_string("DBNAME", &mut raw.db_name);
    env_string("DBHOST", &mut raw.db_host);
    env_parse("DBPORT", &mut raw.db_port)?;
    env_string("DBPASSWORD", &mut raw.db_password);
    env_string("PRIVATE_KEY", &mut raw.private_key);
    env_string("SIGN_PREFIX", &mut raw.sign_prefix);
    env_parse("LOG_LEVEL", &mut raw.log_level)?;
    env_string("LOG_FORMAT", &mut raw.log_format);
    env_parse("BLOCK_INTERVAL", &mut raw.block_interval)?;
    env_parse("MIN_BLOCK_INTERVAL", &mut raw.min_block_interval)?;
    env_parse("TRANSACTIONS_PER_BLOCK", &mut raw.transactions_per_block)?;
    env_parse("MAX_BLOCK_SIZE", &mut raw.max_block_size)?;
    env_parse("MAX_MEMORY", &mut raw.max_memory)?;
    env_bool("EXCLUDE_REJECTED", &mut raw.exclude_rejected)?;
    env_string("SENTRY_URL", &mut raw.sentry_url);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> ProcessorConfig {
        ProcessorConfig {
            db_user: "processor".to_string(),
            db_name: "blockchain".to_string(),
            db_host: "localhost".to_string(),
            db_port: 5432,
            db_password: "secret".to_string(),
            private_key: PrivateKey::generate().to_wif(),
            sign_prefix: "test".to_string(),
            log_level: 0,
            log_format: String::new(),
            block_interval: 60,
            min_block_interval: 5,
            transactions_per_block: 500,
            max_block_size: 1_000_000,
            max_memory: 1024,
            exclude_rejected: false,
            sentry_url: String::new(),
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_bad_wif() {
        let mut config = base_config();
        config.private_key = "garbage".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { key: "PRIVATE_KEY", .. })
        ));
    }

    #[test]
    fn test_interval_bounds() {
        let mut config = base_config();
        config.min_block_interval = 61;
        assert!(config.validate().is_err());
        config.min_block_interval = 0;
        assert!(config.validate().is_err());
        config.min_block_interval = 60;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_size_floor() {
        let mut config = base_config();
        config.max_block_size = 109_999;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { key: "MAX_BLOCK_SIZE", .. })
        ));
    }

    #[test]
    fn test_sign_prefix_length() {
        let mut config = base_config();
        config.sign_prefix = "x".repeat(256);
        assert!(config.validate().is_err());
        config.sign_prefix = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_secrets_skip_empty() {
        let config = base_config();
        let secrets = config.secrets();
        assert_eq!(secrets.len(), 2);
        assert!(secrets.contains(&config.private_key));
        assert!(secrets.contains(&config.db_password));
    }

    #[test]
    fn test_stay_down_range() {
        assert!(is_stay_down(50));
        assert!(is_stay_down(EXIT_UNSUPPORTED_POSTGRES));
        assert!(is_stay_down(59));
        assert!(!is_stay_down(60));
        assert!(!is_stay_down(EXIT_FAILURE));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = base_config();
        let debug = format!("{config:?}");
        assert!(!debug.contains(&config.private_key));
        assert!(!debug.contains("secret"));
        assert!(debug.contains("[REDACTED]"));
    }
}
