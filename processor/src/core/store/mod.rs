use serde::Serialize;
use thiserror::Error;

use ledger_common::{
    block::Block,
    crypto::Hash,
    time::TimestampMillis,
    transaction::{PendingTransaction, TxStatus},
};

mod pg;
pub use pg::PgStore;

/// NOTIFY channel announcing finished ticks and new blocks.
pub const BLOCKS_CHANNEL: &str = "blocks";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Not connected to the database")]
    NotConnected,

    #[error("Database error: {message}")]
    Db {
        message: String,
        code: Option<String>,
        connection_lost: bool,
    },

    #[error("Corrupt row: {0}")]
    CorruptRow(String),
}

impl StoreError {
    pub fn db(message: impl Into<String>, code: Option<String>, connection_lost: bool) -> Self {
        StoreError::Db {
            message: message.into(),
            code,
            connection_lost,
        }
    }

    /// True when the session is gone and the server has rolled back for us.
    pub fn connection_lost(&self) -> bool {
        matches!(
            self,
            StoreError::NotConnected
                | StoreError::Db {
                    connection_lost: true,
                    ..
                }
        )
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            StoreError::Db { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

/// Failure of contract SQL, already classified for the runtime adapter.
#[derive(Debug, Error)]
pub enum ContractSqlError {
    /// A user-raised exception (SQLSTATE P0001); carries the raw message.
    #[error("{0}")]
    Raised(String),

    /// The statement hit `statement_timeout` (57014).
    #[error("Statement timeout")]
    Timeout,

    /// The session is gone; nothing about the transaction is decided.
    #[error("Connection lost")]
    ConnectionLost,

    /// Deadlock or serialization failure (class 40); safe to retry.
    #[error("Transient database failure")]
    Transient,

    /// Any other SQL error: the contract misbehaved against the store.
    #[error("{message}")]
    Other {
        code: Option<String>,
        message: String,
    },
}

/// Deterministic inputs exposed to contract SQL through
/// `current_setting('contract.*')`.
#[derive(Debug, Clone)]
pub struct ContractBinds {
    // JSON text of the (template-validated) payload
    pub payload: String,
    pub sender: String,
    pub transaction_id: String,
    pub contract_hash: String,
    pub block_id: i64,
    pub block_ts: TimestampMillis,
    pub processor: String,
    pub previous_block_ts: TimestampMillis,
    pub previous_block_hash: String,
}

/// A row of `basics.contracts`.
#[derive(Debug, Clone)]
pub struct ContractRow {
    pub contract_hash: Hash,
    pub contract_type: String,
    pub contract_version: String,
    pub description: String,
    pub creator: String,
    // JSON text of the payload template
    pub template: String,
    pub code: Vec<u8>,
}

/// One terminalised transaction for the bulk status update.
///
/// Serialised as JSON and applied through a single
/// `UPDATE .. FROM json_to_recordset(..)` statement.
#[derive(Debug, Clone, Serialize)]
pub struct StatusUpdate {
    // hex encoded, decoded inside the update statement
    pub transaction_id: String,
    pub status: TxStatus,
    pub message: Option<String>,
    pub contract_type: String,
    pub sender: String,
    pub receiver: Option<String>,
    pub block_id: Option<i64>,
    pub position_in_block: Option<i32>,
    pub processed_ts: TimestampMillis,
}

/// Typed access to the relational store.
///
/// One implementation speaks to Postgres over the single `processor`
/// connection; the in-memory implementation backs the mining-loop tests.
/// The gateway never retries and never hides an error: retry policy lives
/// in the mining loop.
pub trait ChainStore: Send {
    /// Establish the connection if there is none. Returns true on a fresh
    /// connect so the caller can re-run its startup checks.
    async fn connect(&mut self) -> Result<bool, StoreError>;

    /// `server_version_num` of the connected server.
    async fn server_version(&mut self) -> Result<u32, StoreError>;

    /// Bound every statement, chiefly contract SQL, to this many millis.
    async fn set_statement_timeout(&mut self, millis: i64) -> Result<(), StoreError>;

    /// Pending transactions in `(create_ts ASC, transaction_id ASC)` order.
    async fn fetch_pending(&mut self, limit: u16)
        -> Result<Vec<PendingTransaction>, StoreError>;

    /// The newest block, for tip recovery. None on an empty chain.
    async fn latest_block(&mut self) -> Result<Option<Block>, StoreError>;

    /// `BEGIN; SET LOCAL ROLE smartcontract; SAVEPOINT tx;`
    async fn begin_block(&mut self) -> Result<(), StoreError>;

    /// `ROLLBACK TO SAVEPOINT tx;`
    async fn savepoint_rollback(&mut self) -> Result<(), StoreError>;

    /// `RELEASE SAVEPOINT tx; SAVEPOINT tx;`
    async fn savepoint_advance(&mut self) -> Result<(), StoreError>;

    /// `RESET ROLE;`
    async fn reset_role(&mut self) -> Result<(), StoreError>;

    /// Execute contract code under the sandbox role and return the message
    /// of its final statement, if any.
    async fn run_contract_sql(
        &mut self,
        code: &str,
        binds: &ContractBinds,
    ) -> Result<Option<String>, ContractSqlError>;

    /// All deployed contracts, for the registry.
    async fn load_contracts(&mut self) -> Result<Vec<ContractRow>, StoreError>;

    /// Insert a contract row under the `smartcontractmanager` role.
    async fn insert_contract(&mut self, row: &ContractRow) -> Result<(), StoreError>;

    /// Delete a contract row under the `smartcontractmanager` role.
    async fn delete_contract(&mut self, hash: &Hash) -> Result<(), StoreError>;

    /// Apply every terminal status in one statement.
    async fn bulk_update_statuses(&mut self, updates: &[StatusUpdate]) -> Result<(), StoreError>;

    async fn insert_block(&mut self, block: &Block) -> Result<(), StoreError>;

    /// `SET LOCAL synchronous_commit TO ON; COMMIT;` — the only durable
    /// commit path, used when a block is written.
    async fn commit_durable(&mut self) -> Result<(), StoreError>;

    /// Plain `COMMIT;` for status-only ticks; the session keeps
    /// `synchronous_commit` off.
    async fn commit_fast(&mut self) -> Result<(), StoreError>;

    /// Session-level `ROLLBACK;`, used during recovery.
    async fn rollback_all(&mut self) -> Result<(), StoreError>;

    /// Best-effort `pg_notify`; failures are logged by the caller, never
    /// fatal.
    async fn notify(&mut self, channel: &str, payload: &str) -> Result<(), StoreError>;
}
