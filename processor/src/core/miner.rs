//! The mining loop.
//!
//! One tick: pull pending transactions, drive each through the contract
//! runtime under a per-transaction savepoint, terminalise the outcomes in
//! one bulk update, and close a block when something was accepted or the
//! heartbeat interval elapsed. The loop owns the in-memory tip and every
//! mutable flag; the store owns all durable state.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use log::{debug, error, info, warn};
use metrics::{counter, gauge};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

use ledger_common::{
    config::{ADMISSION_SLACK_MILLIS, PACING_SLACK_MILLIS},
    crypto::{Address, Hash, PrivateKey},
    time::{current_time_millis, TimestampMillis},
    transaction::{receiver_of, sanitize_message, PendingTransaction, TxStatus},
};

use super::{
    assembler,
    contract::{ContractRegistry, ExecutionContext, ExecutionResult},
    store::{ChainStore, StatusUpdate, StoreError, BLOCKS_CHANNEL},
};
use crate::{
    config::{
        ProcessorConfig, EXIT_UNSUPPORTED_POSTGRES, MIN_POSTGRES_VERSION,
        RECOMMENDED_POSTGRES_VERSION,
    },
    ipc::WorkerMessage,
};

type JsonMap = Map<String, Value>;

/// The in-memory chain tip, rebuilt from the store on every (re)connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTip {
    pub previous_hash: Hash,
    pub previous_ts: TimestampMillis,
    pub next_id: i64,
}

impl ChainTip {
    pub fn genesis() -> Self {
        ChainTip {
            previous_hash: Hash::zero(),
            previous_ts: 0,
            next_id: 0,
        }
    }
}

/// A fatal condition where an automatic restart would be harmful; the
/// worker exits with `code` and the supervisor stays down.
#[derive(Debug, Error)]
#[error("{reason}")]
pub struct StayDown {
    pub code: i32,
    pub reason: String,
}

enum MineError {
    StayDown(StayDown),
    Abort {
        err: StoreError,
        in_transaction: bool,
    },
}

// failure outside the block transaction
fn early(err: StoreError) -> MineError {
    MineError::Abort {
        err,
        in_transaction: false,
    }
}

// failure inside the open block transaction: recovery must ROLLBACK
fn in_tx(err: StoreError) -> MineError {
    MineError::Abort {
        err,
        in_transaction: true,
    }
}

type Clock = fn() -> TimestampMillis;

pub struct Miner<S: ChainStore> {
    store: S,
    contracts: ContractRegistry,
    config: ProcessorConfig,
    key: PrivateKey,
    address: Address,
    shutdown: Arc<AtomicBool>,
    reports: UnboundedSender<WorkerMessage>,
    clock: Clock,

    tip: ChainTip,
    // reentrancy guard: a tick firing into a running tick is skipped
    is_mining: bool,
    // an error happened inside an open transaction; cleared by ROLLBACK
    should_rollback: bool,
    // forces tip refresh and version/timeout setup on the next tick
    just_connected: bool,
    failures: u32,
    // edge-triggered so clock regression is reported once per episode
    time_warning: bool,
    mined_first: bool,
    warned_pg_version: bool,
}

impl<S: ChainStore> Miner<S> {
    pub fn new(
        store: S,
        config: ProcessorConfig,
        shutdown: Arc<AtomicBool>,
        reports: UnboundedSender<WorkerMessage>,
    ) -> Result<Self, crate::config::ConfigError> {
        let key = config.signing_key()?;
        let address = key.address();
        Ok(Miner {
            store,
            contracts: ContractRegistry::new(),
            config,
            key,
            address,
            shutdown,
            reports,
            clock: current_time_millis,
            tip: ChainTip::genesis(),
            is_mining: false,
            should_rollback: false,
            just_connected: false,
            failures: 0,
            time_warning: false,
            mined_first: false,
            warned_pg_version: false,
        })
    }

    pub fn tip(&self) -> &ChainTip {
        &self.tip
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    #[cfg(test)]
    pub(crate) fn set_clock(&mut self, clock: Clock) {
        self.clock = clock;
    }

    #[cfg(test)]
    pub(crate) fn time_warning(&self) -> bool {
        self.time_warning
    }

    /// One timer tick. `Err` is a stay-down condition; every other failure
    /// is absorbed into the loop flags and retried next tick.
    pub async fn tick(&mut self) -> Result<(), StayDown> {
        let now = (self.clock)();

        // pacing gate: skip silently to avoid bunching after a catch-up
        if self.tip.previous_ts + self.config.min_block_interval_millis()
            > now + PACING_SLACK_MILLIS
        {
            return Ok(());
        }

        // reentry gate: the long-running tick still owns the flag
        if self.is_mining {
            warn!("Processor under heavy load, skipping mining tick");
            return Ok(());
        }
        self.is_mining = true;

        match self.mine().await {
            Ok(()) => {
                self.failures = 0;
                self.just_connected = false;
                self.is_mining = false;
                self.report();
                Ok(())
            }
            Err(MineError::StayDown(stay_down)) => {
                self.is_mining = false;
                Err(stay_down)
            }
            Err(MineError::Abort {
                err,
                in_transaction,
            }) => {
                self.abort_mining(err, in_transaction);
                Ok(())
            }
        }
    }

    async fn mine(&mut self) -> Result<(), MineError> {
        // connection
        if self.store.connect().await.map_err(early)? {
            info!("Connected to the database");
            self.just_connected = true;
        }

        // recovery: roll the session back and reload the contract map,
        // which a rolled-back create or delete may have invalidated
        if self.should_rollback || self.just_connected {
            self.store.rollback_all().await.map_err(in_tx)?;
            self.contracts.load(&mut self.store).await.map_err(early)?;
            self.should_rollback = false;
        }

        // startup checks, on every fresh connection
        if self.just_connected {
            self.startup_checks().await?;
        }

        // pending fetch, in (create_ts, transaction_id) order
        let pending = self
            .store
            .fetch_pending(self.config.transactions_per_block)
            .await
            .map_err(early)?;

        self.store.begin_block().await.map_err(in_tx)?;

        // block timestamp: re-read the clock and keep the chain strictly
        // increasing even when it jumped backwards since the pacing gate
        let now = (self.clock)();
        let block_ts = if self.tip.previous_ts + 1 > now {
            if !self.time_warning {
                warn!(
                    "Clock is behind the chain tip, bumping block timestamp to {}",
                    self.tip.previous_ts + 1
                );
                self.time_warning = true;
            }
            self.tip.previous_ts + 1
        } else {
            if self.time_warning {
                self.time_warning = false;
            }
            now
        };

        // per-transaction loop, preserving the fetch order
        let deadline = self.tip.previous_ts
            + self.config.min_block_interval_millis()
            + self.config.block_interval_millis();
        let mut block_txs: Vec<usize> = Vec::new();
        let mut updates: Vec<StatusUpdate> = Vec::new();
        let mut block_size: usize = 0;

        for (index, tx) in pending.iter().enumerate() {
            if block_size + tx.packed_size() > self.config.max_block_size as usize {
                debug!("Block size limit reached at {} transactions", block_txs.len());
                break;
            }

            let (result, payload) = self.process_transaction(tx, block_ts).await?;
            let contract_type = self.contracts.contract_type_of(&tx.contract_hash);

            if let Some(status) = result.status() {
                let in_block = result.keeps_side_effects()
                    || (matches!(result, ExecutionResult::Rejected { .. })
                        && !self.config.exclude_rejected);
                let (block_id, position_in_block) = if in_block {
                    let position = block_txs.len() as i32;
                    block_txs.push(index);
                    block_size += tx.packed_size();
                    (Some(self.tip.next_id), Some(position))
                } else {
                    (None, None)
                };
                updates.push(StatusUpdate {
                    transaction_id: tx.id_hex(),
                    status,
                    message: result.message().map(str::to_string),
                    contract_type,
                    sender: tx.sender().into_string(),
                    receiver: payload.as_ref().and_then(receiver_of),
                    block_id,
                    position_in_block,
                    processed_ts: block_ts,
                });
            }
            // Retry leaves the row untouched, status stays new

            // the block must close in time to be signed and committed
            if (self.clock)() - ADMISSION_SLACK_MILLIS > deadline {
                debug!("Block deadline reached, closing at {} transactions", block_txs.len());
                break;
            }
        }

        self.store.reset_role().await.map_err(in_tx)?;

        if !updates.is_empty() {
            self.store
                .bulk_update_statuses(&updates)
                .await
                .map_err(in_tx)?;
        }

        // block-or-no-block: something accepted, genesis forced, or the
        // heartbeat interval elapsed
        let emit = !block_txs.is_empty()
            || self.tip.previous_ts == 0
            || self.tip.previous_ts
                + self.config.min_block_interval_millis()
                + self.config.block_interval_millis()
                <= now + PACING_SLACK_MILLIS;

        if !emit {
            if self.shutdown.load(Ordering::SeqCst) {
                info!("Shutting down, leaving the tick uncommitted");
                return Ok(());
            }
            self.store.commit_fast().await.map_err(in_tx)?;
            if !updates.is_empty() {
                self.notify_listeners(json!({
                    "ts": block_ts,
                    "other": updates.len(),
                }))
                .await;
            }
            counter!("processor_transactions_processed_total")
                .increment(updates.len() as u64);
            return Ok(());
        }

        // sign, insert, durable commit: the only path that must survive a
        // crash
        let transactions: Vec<&PendingTransaction> =
            block_txs.iter().map(|&index| &pending[index]).collect();
        let block = assembler::sign_block(
            self.tip.next_id,
            self.tip.previous_hash.clone(),
            block_ts,
            &transactions,
            &self.key,
            self.config.sign_prefix.as_bytes(),
        );
        self.store.insert_block(&block).await.map_err(in_tx)?;

        if self.shutdown.load(Ordering::SeqCst) {
            info!("Shutting down, leaving the tick uncommitted");
            return Ok(());
        }
        self.store.commit_durable().await.map_err(in_tx)?;

        let block_hash = block.hash(self.config.sign_prefix.as_bytes());
        if !self.mined_first {
            self.mined_first = true;
            info!("Processor is up and mining");
        }
        info!(
            "Mined block {} with {} transactions",
            block.block_id, block.transactions_amount
        );
        counter!("processor_blocks_mined_total").increment(1);
        counter!("processor_transactions_processed_total").increment(updates.len() as u64);
        gauge!("processor_block_id").set(block.block_id as f64);

        self.tip = ChainTip {
            previous_hash: block_hash,
            previous_ts: block_ts,
            next_id: block.block_id + 1,
        };

        self.notify_listeners(json!({
            "block": block.block_id,
            "ts": block_ts,
            "txs": block.transactions_amount,
            "other": updates.len() - block_txs.len(),
        }))
        .await;
        Ok(())
    }

    async fn startup_checks(&mut self) -> Result<(), MineError> {
        let version = self.store.server_version().await.map_err(early)?;
        if version < MIN_POSTGRES_VERSION {
            return Err(MineError::StayDown(StayDown {
                code: EXIT_UNSUPPORTED_POSTGRES,
                reason: format!(
                    "Postgres server version {version} is not supported, need at least {MIN_POSTGRES_VERSION}"
                ),
            }));
        }
        if version < RECOMMENDED_POSTGRES_VERSION && !self.warned_pg_version {
            warn!("Postgres server version {version} is old, consider upgrading");
            self.warned_pg_version = true;
        }

        self.tip = match self.store.latest_block().await.map_err(early)? {
            Some(block) => ChainTip {
                previous_hash: block.hash(self.config.sign_prefix.as_bytes()),
                previous_ts: block.processed_ts,
                next_id: block.block_id + 1,
            },
            None => ChainTip::genesis(),
        };
        info!("Chain tip is at block {}", self.tip.next_id);

        // bounds contract SQL to one block interval
        self.store
            .set_statement_timeout(self.config.block_interval_millis())
            .await
            .map_err(early)?;
        Ok(())
    }

    /// Validate structure, execute, and settle the savepoint. Structural
    /// failures terminalise as invalid without ever reaching the contract.
    async fn process_transaction(
        &mut self,
        tx: &PendingTransaction,
        block_ts: TimestampMillis,
    ) -> Result<(ExecutionResult, Option<JsonMap>), MineError> {
        let (result, payload) =
            match tx.validate(block_ts, self.config.sign_prefix.as_bytes()) {
                Err(reason) => (
                    ExecutionResult::Invalid {
                        message: sanitize_message(&reason.to_string()),
                    },
                    None,
                ),
                Ok(payload) => {
                    let ctx = ExecutionContext {
                        block_id: self.tip.next_id,
                        block_ts,
                        previous_block_ts: self.tip.previous_ts,
                        previous_block_hash: &self.tip.previous_hash,
                        processor: &self.address,
                        strict: true,
                    };
                    let result = self
                        .contracts
                        .execute(&mut self.store, tx, &payload, &ctx)
                        .await;
                    (result, Some(payload))
                }
            };

        if result.keeps_side_effects() {
            self.store.savepoint_advance().await.map_err(in_tx)?;
        } else {
            self.store.savepoint_rollback().await.map_err(in_tx)?;
        }
        Ok((result, payload))
    }

    fn abort_mining(&mut self, err: StoreError, in_transaction: bool) {
        self.failures += 1;
        error!("Failed to process transactions or mine a block: {err}");
        if in_transaction {
            self.should_rollback = true;
        }
        self.is_mining = false;
        if self.failures > 3 {
            warn!("Mining failed {} times in a row", self.failures);
        }
    }

    async fn notify_listeners(&mut self, payload: Value) {
        if let Err(err) = self
            .store
            .notify(BLOCKS_CHANNEL, &payload.to_string())
            .await
        {
            // fan-out is best effort, listeners poll anyway
            warn!("Failed to notify listeners: {err}");
        }
    }

    fn report(&mut self) {
        let message = WorkerMessage::Report {
            memory_mb: current_memory_mb(),
        };
        if self.reports.send(message).is_err() {
            debug!("Report channel closed");
        }
    }
}

fn current_memory_mb() -> u64 {
    let pid = match sysinfo::get_current_pid() {
        Ok(pid) => pid,
        Err(_) => return 0,
    };
    let mut system = sysinfo::System::new();
    system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
    system
        .process(pid)
        .map(|process| process.memory() / (1024 * 1024))
        .unwrap_or(0)
}
