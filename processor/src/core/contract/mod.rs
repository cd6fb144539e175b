//! Contract runtime adapter.
//!
//! Holds the content-addressed map of deployed contracts, interprets the
//! two distinguished hashes (create and delete), drives user contract code
//! through the store under the sandbox, and classifies every outcome into
//! an [`ExecutionResult`]. Database errors never leave this module
//! unclassified.

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use log::{debug, warn};
use serde_json::{Map, Value};

use ledger_common::{
    config::{CREATE_CONTRACT_HASH, DELETE_CONTRACT_HASH},
    crypto::{sha256, Address, Hash},
    time::TimestampMillis,
    transaction::{sanitize_message, PendingTransaction, TxStatus},
};

use super::store::{ChainStore, ContractBinds, ContractRow, ContractSqlError, StoreError};

pub mod sandbox;
mod template;

type JsonMap = Map<String, Value>;

pub const CREATE_CONTRACT_TYPE: &str = "Create Contract";
pub const DELETE_CONTRACT_TYPE: &str = "Delete Contract";
pub const UNKNOWN_CONTRACT_TYPE: &str = "Unknown";

// Message prefixes a contract raises to signal a non-error outcome
const REJECT_PREFIX: &str = "reject:";
const RETRY_PREFIX: &str = "retry:";

// Create-contract payload limits
const MAX_TYPE_LENGTH: usize = 64;
const MAX_VERSION_LENGTH: usize = 32;
const MAX_DESCRIPTION_LENGTH: usize = 256;

/// Outcome of executing one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    /// Side effects are kept (savepoint advances).
    Accepted { message: Option<String> },
    /// Business-rule refusal; side effects rolled back.
    Rejected { message: String },
    /// Legacy ABI: the contract returned a rejection message as its value.
    /// Side effects are kept to preserve historical semantics.
    V1Rejected { message: String },
    /// Structural or contract failure; rolled back, still terminal.
    Invalid { message: String },
    /// Environmental failure; rolled back, the row stays `new`.
    Retry,
}

impl ExecutionResult {
    pub fn keeps_side_effects(&self) -> bool {
        matches!(
            self,
            ExecutionResult::Accepted { .. } | ExecutionResult::V1Rejected { .. }
        )
    }

    /// The terminal status this outcome maps to; None for Retry.
    pub fn status(&self) -> Option<TxStatus> {
        match self {
            ExecutionResult::Accepted { .. } => Some(TxStatus::Accepted),
            ExecutionResult::Rejected { .. } | ExecutionResult::V1Rejected { .. } => {
                Some(TxStatus::Rejected)
            }
            ExecutionResult::Invalid { .. } => Some(TxStatus::Invalid),
            ExecutionResult::Retry => None,
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            ExecutionResult::Accepted { message } => message.as_deref(),
            ExecutionResult::Rejected { message }
            | ExecutionResult::V1Rejected { message }
            | ExecutionResult::Invalid { message } => Some(message),
            ExecutionResult::Retry => None,
        }
    }
}

/// A deployed contract as held in memory.
#[derive(Debug, Clone)]
pub struct ContractInfo {
    pub contract_type: String,
    pub version: String,
    pub template: JsonMap,
    pub code: String,
    // Legacy ABI: a returned message is a rejection
    pub v1: bool,
}

/// Chain state a contract is allowed to observe.
#[derive(Debug, Clone)]
pub struct ExecutionContext<'a> {
    pub block_id: i64,
    pub block_ts: TimestampMillis,
    pub previous_block_ts: TimestampMillis,
    pub previous_block_hash: &'a Hash,
    pub processor: &'a Address,
    pub strict: bool,
}

/// The content-addressed contract map plus the execution entry point.
pub struct ContractRegistry {
    contracts: HashMap<Hash, ContractInfo>,
}

impl ContractRegistry {
    pub fn new() -> Self {
        ContractRegistry {
            contracts: HashMap::new(),
        }
    }

    /// (Re)load the map from the store. Called at startup and after any
    /// rollback that could have crossed a create or delete transaction.
    pub async fn load<S: ChainStore + ?Sized>(
        &mut self,
        store: &mut S,
    ) -> Result<(), StoreError> {
        let rows = store.load_contracts().await?;
        let mut contracts = HashMap::with_capacity(rows.len());
        for row in rows {
            match contract_info_of(&row) {
                Ok(info) => {
                    contracts.insert(row.contract_hash, info);
                }
                Err(reason) => {
                    // an undecodable contract resolves as unknown from here on
                    warn!(
                        "Skipping contract {}: {}",
                        row.contract_hash, reason
                    );
                }
            }
        }
        debug!("Loaded {} contracts", contracts.len());
        self.contracts = contracts;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.contracts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }

    /// Human-readable contract type for the status row.
    pub fn contract_type_of(&self, hash: &Hash) -> String {
        if *hash == CREATE_CONTRACT_HASH {
            return CREATE_CONTRACT_TYPE.to_string();
        }
        if *hash == DELETE_CONTRACT_HASH {
            return DELETE_CONTRACT_TYPE.to_string();
        }
        self.contracts
            .get(hash)
            .map(|info| info.contract_type.clone())
            .unwrap_or_else(|| UNKNOWN_CONTRACT_TYPE.to_string())
    }

    /// Execute one structurally valid transaction. The caller owns the
    /// savepoint discipline; this decides what the savepoint should do.
    pub async fn execute<S: ChainStore + ?Sized>(
        &mut self,
        store: &mut S,
        tx: &PendingTransaction,
        payload: &JsonMap,
        ctx: &ExecutionContext<'_>,
    ) -> ExecutionResult {
        if tx.contract_hash == CREATE_CONTRACT_HASH {
            return self.create_contract(store, tx, payload, ctx.processor).await;
        }
        if tx.contract_hash == DELETE_CONTRACT_HASH {
            return self.delete_contract(store, tx, payload, ctx.processor).await;
        }

        let info = match self.contracts.get(&tx.contract_hash) {
            Some(info) => info,
            None if ctx.strict => {
                return ExecutionResult::Invalid {
                    message: "Unknown contract".to_string(),
                }
            }
            None => {
                return ExecutionResult::Rejected {
                    message: "Unknown contract".to_string(),
                }
            }
        };

        if let Err(reason) = template::validate_payload(&info.template, payload) {
            return ExecutionResult::Invalid {
                message: sanitize_message(&format!("Payload mismatch: {reason}")),
            };
        }

        let binds = ContractBinds {
            payload: Value::Object(payload.clone()).to_string(),
            sender: tx.sender().into_string(),
            transaction_id: tx.id_hex(),
            contract_hash: tx.contract_hash.to_hex(),
            block_id: ctx.block_id,
            block_ts: ctx.block_ts,
            processor: ctx.processor.to_string(),
            previous_block_ts: ctx.previous_block_ts,
            previous_block_hash: ctx.previous_block_hash.to_hex(),
        };

        let _guard = sandbox::enter();
        let outcome = store.run_contract_sql(&info.code, &binds).await;
        match outcome {
            Ok(None) => ExecutionResult::Accepted { message: None },
            Ok(Some(message)) => {
                let message = sanitize_message(&message);
                if info.v1 {
                    ExecutionResult::V1Rejected { message }
                } else {
                    ExecutionResult::Accepted {
                        message: Some(message),
                    }
                }
            }
            Err(ContractSqlError::Raised(raw)) => {
                if let Some(message) = raw.strip_prefix(REJECT_PREFIX) {
                    ExecutionResult::Rejected {
                        message: sanitize_message(message.trim_start()),
                    }
                } else if raw.strip_prefix(RETRY_PREFIX).is_some() {
                    ExecutionResult::Retry
                } else {
                    ExecutionResult::Invalid {
                        message: sanitize_message(&raw),
                    }
                }
            }
            Err(
                err @ (ContractSqlError::Timeout
                | ContractSqlError::ConnectionLost
                | ContractSqlError::Transient),
            ) => {
                // logged with the sandbox lifted: the logger is host state
                sandbox::suspended(|| {
                    warn!("Contract {} hit {}, will retry", tx.contract_hash, err)
                });
                ExecutionResult::Retry
            }
            Err(ContractSqlError::Other { code, message }) => {
                sandbox::suspended(|| {
                    debug!(
                        "Contract {} failed (sqlstate {:?}): {}",
                        tx.contract_hash, code, message
                    )
                });
                ExecutionResult::Invalid {
                    message: sanitize_message(&message),
                }
            }
        }
    }

    async fn create_contract<S: ChainStore + ?Sized>(
        &mut self,
        store: &mut S,
        tx: &PendingTransaction,
        payload: &JsonMap,
        processor: &Address,
    ) -> ExecutionResult {
        if let Some(result) = check_manager(tx, processor) {
            return result;
        }
        let contract = match NewContract::parse(payload) {
            Ok(contract) => contract,
            Err(message) => return ExecutionResult::Invalid { message },
        };

        // content address over the canonical code bytes
        let contract_hash = sha256(contract.code.as_bytes());
        if self.contracts.contains_key(&contract_hash) {
            return ExecutionResult::Rejected {
                message: "Contract already exists".to_string(),
            };
        }
        // type names identify contracts to readers; one hash per type
        if self
            .contracts
            .values()
            .any(|info| info.contract_type == contract.contract_type)
        {
            return ExecutionResult::Rejected {
                message: "Contract type already exists".to_string(),
            };
        }

        let row = ContractRow {
            contract_hash: contract_hash.clone(),
            contract_type: contract.contract_type.clone(),
            contract_version: contract.version.clone(),
            description: contract.description.clone(),
            creator: tx.sender().into_string(),
            template: Value::Object(contract.template.clone()).to_string(),
            code: contract.code.clone().into_bytes(),
        };
        if let Err(err) = store.insert_contract(&row).await {
            return store_failure(err);
        }

        let v1 = contract.version.starts_with("1.");
        self.contracts.insert(
            contract_hash,
            ContractInfo {
                contract_type: contract.contract_type,
                version: contract.version,
                template: contract.template,
                code: contract.code,
                v1,
            },
        );
        ExecutionResult::Accepted { message: None }
    }

    async fn delete_contract<S: ChainStore + ?Sized>(
        &mut self,
        store: &mut S,
        tx: &PendingTransaction,
        payload: &JsonMap,
        processor: &Address,
    ) -> ExecutionResult {
        if let Some(result) = check_manager(tx, processor) {
            return result;
        }
        let hash = match payload.get("hash").and_then(Value::as_str) {
            Some(hex) => match hex.parse::<Hash>() {
                Ok(hash) => hash,
                Err(_) => {
                    return ExecutionResult::Invalid {
                        message: "Invalid contract hash".to_string(),
                    }
                }
            },
            None => {
                return ExecutionResult::Invalid {
                    message: "Missing contract hash".to_string(),
                }
            }
        };
        if !self.contracts.contains_key(&hash) {
            return ExecutionResult::Rejected {
                message: "Unknown contract".to_string(),
            };
        }
        if let Err(err) = store.delete_contract(&hash).await {
            return store_failure(err);
        }
        self.contracts.remove(&hash);
        ExecutionResult::Accepted { message: None }
    }
}

impl Default for ContractRegistry {
    fn default() -> Self {
        ContractRegistry::new()
    }
}

// Create and delete run against the manager role; only transactions signed
// with the processor's own key may use them.
fn check_manager(tx: &PendingTransaction, processor: &Address) -> Option<ExecutionResult> {
    if tx.sender() != *processor {
        return Some(ExecutionResult::Rejected {
            message: "Only the processor may manage contracts".to_string(),
        });
    }
    None
}

fn store_failure(err: StoreError) -> ExecutionResult {
    if err.connection_lost() {
        return ExecutionResult::Retry;
    }
    ExecutionResult::Invalid {
        message: sanitize_message(&err.to_string()),
    }
}

fn contract_info_of(row: &ContractRow) -> Result<ContractInfo, String> {
    let code = String::from_utf8(row.code.clone()).map_err(|_| "code is not UTF-8")?;
    let template = match serde_json::from_str::<Value>(&row.template) {
        Ok(Value::Object(map)) => map,
        _ => return Err("template is not a JSON object".to_string()),
    };
    Ok(ContractInfo {
        contract_type: row.contract_type.clone(),
        version: row.contract_version.clone(),
        template,
        code,
        v1: row.contract_version.starts_with("1."),
    })
}

struct NewContract {
    contract_type: String,
    version: String,
    description: String,
    template: JsonMap,
    code: String,
}

impl NewContract {
    fn parse(payload: &JsonMap) -> Result<Self, String> {
        let text = |field: &str, max: usize| -> Result<String, String> {
            let value = payload
                .get(field)
                .and_then(Value::as_str)
                .ok_or_else(|| format!("Missing field {field}"))?;
            if value.is_empty() || value.len() > max {
                return Err(format!("Field {field} must be 1..={max} bytes"));
            }
            Ok(value.to_string())
        };

        let contract_type = text("type", MAX_TYPE_LENGTH)?;
        let version = text("version", MAX_VERSION_LENGTH)?;
        let description = match payload.get("description") {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) if s.len() <= MAX_DESCRIPTION_LENGTH => s.clone(),
            _ => return Err("Invalid description".to_string()),
        };
        let template = match payload.get("template") {
            Some(Value::Object(map)) => map.clone(),
            _ => return Err("Missing template object".to_string()),
        };
        template::validate_template(&template).map_err(|e| format!("Bad template: {e}"))?;

        let code = payload
            .get("code")
            .and_then(Value::as_str)
            .ok_or("Missing field code")?;
        let code = BASE64
            .decode(code)
            .map_err(|_| "Code is not valid base64".to_string())?;
        if code.is_empty() {
            return Err("Code is empty".to_string());
        }
        let code =
            String::from_utf8(code).map_err(|_| "Code is not valid UTF-8".to_string())?;

        Ok(NewContract {
            contract_type,
            version,
            description,
            template,
            code,
        })
    }
}
