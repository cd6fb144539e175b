//! Messages exchanged between the supervisor and the worker process.
//!
//! Line-delimited JSON: the worker writes to stdout, the supervisor writes
//! to the worker's stdin. The first message on stdin is always the
//! validated configuration, so the worker never re-reads the config
//! sources itself. Worker logging goes to stderr so the message channel
//! stays clean.

use serde::{Deserialize, Serialize};

use crate::config::ProcessorConfig;

/// Worker to supervisor.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkerMessage {
    /// A long initialisation is running; pauses the liveness counter.
    Init { init: bool },
    /// A tick finished; carries the worker's resident set size.
    Report { memory_mb: u64 },
}

/// Supervisor to worker.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SupervisorMessage {
    /// The configuration, validated once in the supervisor and sent right
    /// after spawn.
    Config { config: ProcessorConfig },
    /// Drain the running tick, then exit 0.
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        let report = serde_json::to_string(&WorkerMessage::Report { memory_mb: 42 }).unwrap();
        assert_eq!(report, r#"{"type":"report","memory_mb":42}"#);

        let init: WorkerMessage = serde_json::from_str(r#"{"type":"init","init":true}"#).unwrap();
        assert_eq!(init, WorkerMessage::Init { init: true });

        let shutdown = serde_json::to_string(&SupervisorMessage::Shutdown).unwrap();
        assert_eq!(shutdown, r#"{"type":"shutdown"}"#);
    }

    #[test]
    fn test_config_roundtrip() {
        let key = ledger_common::crypto::PrivateKey::generate();
        let config = ProcessorConfig {
            db_user: "processor".to_string(),
            db_name: "blockchain".to_string(),
            db_host: "localhost".to_string(),
            db_port: 5432,
            db_password: "password".to_string(),
            private_key: key.to_wif(),
            sign_prefix: "test".to_string(),
            log_level: 1,
            log_format: String::new(),
            block_interval: 60,
            min_block_interval: 5,
            transactions_per_block: 500,
            max_block_size: 1_000_000,
            max_memory: 1024,
            exclude_rejected: true,
            sentry_url: String::new(),
        };

        let line = serde_json::to_string(&SupervisorMessage::Config {
            config: config.clone(),
        })
        .unwrap();
        let parsed: SupervisorMessage = serde_json::from_str(&line).unwrap();
        match parsed {
            SupervisorMessage::Config { config: received } => {
                assert_eq!(received.private_key, config.private_key);
                assert_eq!(received.sign_prefix, config.sign_prefix);
                assert_eq!(received.block_interval, config.block_interval);
                assert!(received.exclude_rejected);
            }
            SupervisorMessage::Shutdown => panic!("wrong message kind"),
        }
    }
}
