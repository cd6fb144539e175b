//! Mining-loop scenarios against the in-memory store.

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde_json::json;
use tokio::sync::mpsc;

use ledger_common::{
    block::Block,
    config::{CREATE_CONTRACT_HASH, TRANSACTION_VERSION},
    crypto::{sha256, Hash, PrivateKey, Signature},
    time::TimestampMillis,
    transaction::{PendingTransaction, TxStatus, TRANSACTION_ID_SIZE},
};

use super::{MockOutcome, MockStore};
use crate::{
    config::{ProcessorConfig, EXIT_UNSUPPORTED_POSTGRES},
    core::{miner::Miner, store::ContractRow},
    ipc::WorkerMessage,
};

const PREFIX: &[u8] = b"test";

thread_local! {
    static CLOCK_QUEUE: RefCell<VecDeque<TimestampMillis>> = RefCell::new(VecDeque::new());
    static CLOCK_NOW: Cell<TimestampMillis> = const { Cell::new(0) };
}

// Pops queued values first, then repeats the last one.
fn mock_clock() -> TimestampMillis {
    CLOCK_QUEUE.with(|queue| match queue.borrow_mut().pop_front() {
        Some(value) => {
            CLOCK_NOW.with(|now| now.set(value));
            value
        }
        None => CLOCK_NOW.with(Cell::get),
    })
}

fn set_now(value: TimestampMillis) {
    CLOCK_QUEUE.with(|queue| queue.borrow_mut().clear());
    CLOCK_NOW.with(|now| now.set(value));
}

fn queue_clock(values: &[TimestampMillis]) {
    CLOCK_QUEUE.with(|queue| queue.borrow_mut().extend(values.iter().copied()));
}

fn test_config(key: &PrivateKey) -> ProcessorConfig {
    ProcessorConfig {
        db_user: "processor".to_string(),
        db_name: "blockchain".to_string(),
        db_host: "localhost".to_string(),
        db_port: 5432,
        db_password: "password".to_string(),
        private_key: key.to_wif(),
        sign_prefix: "test".to_string(),
        log_level: 5,
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

fn make_miner(
    store: MockStore,
    key: &PrivateKey,
    tweak: impl FnOnce(&mut ProcessorConfig),
) -> (
    Miner<MockStore>,
    mpsc::UnboundedReceiver<WorkerMessage>,
    Arc<AtomicBool>,
) {
    let mut config = test_config(key);
    tweak(&mut config);
    let shutdown = Arc::new(AtomicBool::new(false));
    let (reports, rx) = mpsc::unbounded_channel();
    let mut miner = Miner::new(store, config, shutdown.clone(), reports).unwrap();
    miner.set_clock(mock_clock);
    (miner, rx, shutdown)
}

fn sign_tx(
    key: &PrivateKey,
    id: u8,
    contract_hash: Hash,
    payload: &str,
    create_ts: TimestampMillis,
) -> PendingTransaction {
    let mut tx = PendingTransaction {
        transaction_id: [id; TRANSACTION_ID_SIZE],
        version: TRANSACTION_VERSION,
        contract_hash,
        valid_till: 0,
        payload: payload.to_string(),
        public_key: *key.public_key(),
        signature: Signature::from_bytes([0u8; 64]),
        create_ts,
    };
    tx.signature = key.sign(&tx.signing_payload(PREFIX));
    tx
}

fn create_contract_payload(type_name: &str, code: &str) -> String {
    json!({
        "type": type_name,
        "version": "2.0",
        "description": "test contract",
        "template": {},
        "code": BASE64.encode(code),
    })
    .to_string()
}

fn contract_row(code: &str, type_name: &str, version: &str, template: &str) -> ContractRow {
    ContractRow {
        contract_hash: sha256(code.as_bytes()),
        contract_type: type_name.to_string(),
        contract_version: version.to_string(),
        description: String::new(),
        creator: String::new(),
        template: template.to_string(),
        code: code.as_bytes().to_vec(),
    }
}

fn assert_chain(blocks: &[Block]) {
    for (index, block) in blocks.iter().enumerate() {
        assert_eq!(block.block_id, index as i64, "block ids must be dense");
        if index == 0 {
            assert_eq!(block.previous_block_hash, Hash::zero());
        } else {
            let previous = &blocks[index - 1];
            assert_eq!(block.previous_block_hash, previous.hash(PREFIX));
            assert!(block.processed_ts > previous.processed_ts);
        }
    }
}

#[tokio::test]
async fn test_accepted_pair() {
    let processor_key = PrivateKey::generate();
    let user_key = PrivateKey::generate();
    let code = "INSERT INTO widgets DEFAULT VALUES";

    let mut store = MockStore::new();
    let create = sign_tx(
        &processor_key,
        1,
        CREATE_CONTRACT_HASH,
        &create_contract_payload("Widget", code),
        1,
    );
    let call = sign_tx(&user_key, 2, sha256(code.as_bytes()), "{}", 2);
    store.pending = vec![create.clone(), call.clone()];

    let (mut miner, mut reports, _) = make_miner(store, &processor_key, |_| {});
    set_now(100_000);
    miner.tick().await.unwrap();

    let store = miner.store();
    assert_eq!(store.blocks.len(), 1);
    let block = &store.blocks[0];
    assert_eq!(block.transactions_amount, 2);
    assert!(block.verify(processor_key.public_key(), PREFIX));
    assert_chain(&store.blocks);

    assert_eq!(store.statuses.len(), 2);
    let first = store.status_of(&create).unwrap();
    assert_eq!(first.status, TxStatus::Accepted);
    assert_eq!(first.contract_type, "Create Contract");
    assert_eq!(first.block_id, Some(0));
    assert_eq!(first.position_in_block, Some(0));
    let second = store.status_of(&call).unwrap();
    assert_eq!(second.status, TxStatus::Accepted);
    assert_eq!(second.contract_type, "Widget");
    assert_eq!(second.position_in_block, Some(1));
    assert_eq!(second.sender, user_key.address().into_string());

    // the contract row was created and the side effects of the call kept
    assert_eq!(store.contracts.len(), 1);
    assert_eq!(store.contracts[0].contract_type, "Widget");
    assert_eq!(store.committed_effects, vec![code.to_string()]);
    assert_eq!(store.durable_commits, 1);

    // the tip advanced and the supervisor got a report
    assert_eq!(miner.tip().next_id, 1);
    assert!(matches!(
        reports.try_recv(),
        Ok(WorkerMessage::Report { .. })
    ));

    // and listeners heard about the block
    let (channel, payload) = miner.store().notifications.last().unwrap();
    assert_eq!(channel, "blocks");
    let payload: serde_json::Value = serde_json::from_str(payload).unwrap();
    assert_eq!(payload["block"], json!(0));
    assert_eq!(payload["txs"], json!(2));
}

#[tokio::test]
async fn test_block_splits_on_size() {
    let processor_key = PrivateKey::generate();
    let user_key = PrivateKey::generate();
    let code = "INSERT INTO records (data) VALUES (current_setting('contract.payload'))";

    let mut store = MockStore::new();
    store
        .contracts
        .push(contract_row(code, "Record", "2.0", r#"{"data":{"type":"str"}}"#));
    let hash = sha256(code.as_bytes());
    let big = "x".repeat(60_000);
    let tx1 = sign_tx(&user_key, 1, hash.clone(), &json!({ "data": big }).to_string(), 1);
    let tx2 = sign_tx(&user_key, 2, hash, &json!({ "data": big }).to_string(), 2);
    store.pending = vec![tx1.clone(), tx2.clone()];

    let (mut miner, _, _) = make_miner(store, &processor_key, |config| {
        config.max_block_size = 110_000;
    });

    set_now(100_000);
    miner.tick().await.unwrap();
    assert_eq!(miner.store().blocks.len(), 1);
    assert_eq!(miner.store().blocks[0].transactions_amount, 1);
    assert!(miner.store().status_of(&tx2).is_none());

    set_now(106_000);
    miner.tick().await.unwrap();
    let store = miner.store();
    assert_eq!(store.blocks.len(), 2);
    assert_eq!(store.blocks[1].transactions_amount, 1);
    assert_eq!(store.status_of(&tx2).unwrap().block_id, Some(1));
    assert_chain(&store.blocks);

    // pending drained
    assert_eq!(store.statuses.len(), 2);
}

#[tokio::test]
async fn test_invalid_in_the_middle_preserves_order() {
    let processor_key = PrivateKey::generate();
    let user_key = PrivateKey::generate();
    let good_code = "UPDATE counters SET n = n + 1";
    let bad_code = "UPDTAE counters SET n = n + 1";

    let mut store = MockStore::new();
    store
        .contracts
        .push(contract_row(good_code, "Counter", "2.0", "{}"));
    store
        .contracts
        .push(contract_row(bad_code, "Broken", "2.0", "{}"));
    store.script(
        bad_code,
        MockOutcome::Other("syntax error at or near \"UPDTAE\"".to_string()),
    );

    let tx1 = sign_tx(&user_key, 1, sha256(good_code.as_bytes()), "{}", 1);
    let tx2 = sign_tx(&user_key, 2, sha256(bad_code.as_bytes()), "{}", 2);
    let tx3 = sign_tx(&user_key, 3, sha256(good_code.as_bytes()), "{}", 3);
    store.pending = vec![tx1.clone(), tx2.clone(), tx3.clone()];

    let (mut miner, _, _) = make_miner(store, &processor_key, |_| {});
    set_now(100_000);
    miner.tick().await.unwrap();

    let store = miner.store();
    assert_eq!(store.statuses.len(), 3);

    let first = store.status_of(&tx1).unwrap();
    let middle = store.status_of(&tx2).unwrap();
    let last = store.status_of(&tx3).unwrap();

    assert_eq!(first.status, TxStatus::Accepted);
    assert_eq!(last.status, TxStatus::Accepted);
    assert_ne!(first.contract_type, "Unknown");
    assert_ne!(last.contract_type, "Unknown");
    // consecutive positions despite the invalid one between them
    assert_eq!(first.position_in_block, Some(0));
    assert_eq!(last.position_in_block, Some(1));

    assert_eq!(middle.status, TxStatus::Invalid);
    assert_eq!(middle.block_id, None);
    assert_eq!(middle.position_in_block, None);
    assert!(middle.message.as_deref().unwrap().contains("syntax error"));

    assert_eq!(store.blocks[0].transactions_amount, 2);
    // only the two accepted executions survived
    assert_eq!(store.committed_effects.len(), 2);
}

#[tokio::test]
async fn test_retry_does_not_consume() {
    let processor_key = PrivateKey::generate();
    let user_key = PrivateKey::generate();
    let code = "UPDATE hot_row SET n = n + 1";

    let mut store = MockStore::new();
    store.contracts.push(contract_row(code, "Hot", "2.0", "{}"));
    // every transient class leaves the row untouched
    store.script(code, MockOutcome::Raised("retry: row is locked".to_string()));
    store.script(code, MockOutcome::Timeout);
    store.script(code, MockOutcome::Transient);

    let (mut miner, _, _) = make_miner(store, &processor_key, |_| {});

    // genesis heartbeat first
    set_now(100_000);
    miner.tick().await.unwrap();
    assert_eq!(miner.store().blocks.len(), 1);

    let tx = sign_tx(&user_key, 1, sha256(code.as_bytes()), "{}", 1);
    miner.store_mut().pending.push(tx.clone());

    // three scripted failures: the row stays new every time
    for now in [106_000, 112_000, 118_000] {
        set_now(now);
        miner.tick().await.unwrap();
        assert!(miner.store().status_of(&tx).is_none());
        assert_eq!(miner.store().blocks.len(), 1);
    }

    // next tick succeeds and consumes it
    set_now(124_000);
    miner.tick().await.unwrap();
    let store = miner.store();
    assert_eq!(store.status_of(&tx).unwrap().status, TxStatus::Accepted);
    assert_eq!(store.blocks.len(), 2);
    assert_eq!(store.blocks[1].transactions_amount, 1);
}

#[tokio::test]
async fn test_stay_down_on_wrong_postgres_version() {
    let processor_key = PrivateKey::generate();
    let mut store = MockStore::new();
    store.server_version = 90400;

    let (mut miner, _, _) = make_miner(store, &processor_key, |_| {});
    set_now(100_000);
    let err = miner.tick().await.unwrap_err();
    assert_eq!(err.code, EXIT_UNSUPPORTED_POSTGRES);
    assert!(miner.store().blocks.is_empty());
}

#[tokio::test]
async fn test_clock_regression_bumps_timestamp_once() {
    let processor_key = PrivateKey::generate();
    let user_key = PrivateKey::generate();
    let code = "UPDATE counters SET n = n + 1";

    let mut store = MockStore::new();
    store.contracts.push(contract_row(code, "Counter", "2.0", "{}"));
    // a previous run left the chain tip in the future
    store
        .blocks
        .push(Block::sign(0, Hash::zero(), 100_000, Vec::new(), 0, &processor_key, PREFIX));
    store
        .pending
        .push(sign_tx(&user_key, 1, sha256(code.as_bytes()), "{}", 1));

    let (mut miner, _, _) = make_miner(store, &processor_key, |_| {});

    // the clock regresses below the tip between the gate and the timestamp
    queue_clock(&[106_000, 99_000]);
    miner.tick().await.unwrap();
    let first_ts = miner.store().blocks[1].processed_ts;
    assert_eq!(first_ts, 100_001);
    assert!(miner.time_warning());

    miner
        .store_mut()
        .pending
        .push(sign_tx(&user_key, 2, sha256(code.as_bytes()), "{}", 2));
    queue_clock(&[106_000, 99_500]);
    miner.tick().await.unwrap();
    let second_ts = miner.store().blocks[2].processed_ts;
    assert_eq!(second_ts, first_ts + 1);
    // still the same episode, no second warning
    assert!(miner.time_warning());

    // the clock catches up and the episode ends
    set_now(120_000);
    miner.tick().await.unwrap();
    assert!(!miner.time_warning());
    assert_chain(&miner.store().blocks);
}

#[tokio::test]
async fn test_heartbeat_block_when_interval_elapsed() {
    let processor_key = PrivateKey::generate();
    let (mut miner, _, _) = make_miner(MockStore::new(), &processor_key, |_| {});

    // genesis is forced even with nothing pending
    set_now(100_000);
    miner.tick().await.unwrap();
    assert_eq!(miner.store().blocks.len(), 1);

    // idle before min + block has elapsed: no block
    set_now(164_000);
    miner.tick().await.unwrap();
    assert_eq!(miner.store().blocks.len(), 1);

    // interval elapsed: exactly one heartbeat
    set_now(164_600);
    miner.tick().await.unwrap();
    let store = miner.store();
    assert_eq!(store.blocks.len(), 2);
    assert_eq!(store.blocks[1].transactions_amount, 0);
    assert_chain(&store.blocks);
}

#[tokio::test]
async fn test_rejected_stays_in_block_unless_excluded() {
    let processor_key = PrivateKey::generate();
    let user_key = PrivateKey::generate();
    let code = "SELECT check_funds()";

    for exclude in [false, true] {
        let mut store = MockStore::new();
        store.contracts.push(contract_row(code, "Pay", "2.0", "{}"));
        store.script(code, MockOutcome::Raised("reject: no funds".to_string()));
        let tx = sign_tx(&user_key, 1, sha256(code.as_bytes()), "{}", 1);
        store.pending.push(tx.clone());

        let (mut miner, _, _) = make_miner(store, &processor_key, |config| {
            config.exclude_rejected = exclude;
        });
        set_now(100_000);
        miner.tick().await.unwrap();

        let store = miner.store();
        let status = store.status_of(&tx).unwrap();
        assert_eq!(status.status, TxStatus::Rejected);
        assert_eq!(status.message.as_deref(), Some("no funds"));
        if exclude {
            assert_eq!(status.block_id, None);
            assert_eq!(store.blocks[0].transactions_amount, 0);
        } else {
            assert_eq!(status.block_id, Some(0));
            assert_eq!(store.blocks[0].transactions_amount, 1);
        }
        // a rejection never keeps side effects
        assert!(store.committed_effects.is_empty());
    }
}

#[tokio::test]
async fn test_v1_rejection_keeps_side_effects() {
    let processor_key = PrivateKey::generate();
    let user_key = PrivateKey::generate();
    let code = "UPDATE balances SET n = n - 1; SELECT 'insufficient balance'";

    let mut store = MockStore::new();
    store.contracts.push(contract_row(code, "Legacy", "1.2", "{}"));
    store.script(
        code,
        MockOutcome::Message(Some("insufficient balance".to_string())),
    );
    let tx = sign_tx(&user_key, 1, sha256(code.as_bytes()), "{}", 1);
    store.pending.push(tx.clone());

    let (mut miner, _, _) = make_miner(store, &processor_key, |_| {});
    set_now(100_000);
    miner.tick().await.unwrap();

    let store = miner.store();
    let status = store.status_of(&tx).unwrap();
    assert_eq!(status.status, TxStatus::Rejected);
    assert_eq!(status.message.as_deref(), Some("insufficient balance"));
    // legacy ABI: the rejection is in the block and its writes survive
    assert_eq!(status.block_id, Some(0));
    assert_eq!(store.committed_effects, vec![code.to_string()]);
}

#[tokio::test]
async fn test_unknown_contract_and_expiry_are_invalid() {
    let processor_key = PrivateKey::generate();
    let user_key = PrivateKey::generate();

    let mut store = MockStore::new();
    let unknown = sign_tx(&user_key, 1, sha256(b"no such contract"), "{}", 1);
    let mut expired = sign_tx(&user_key, 2, sha256(b"no such contract"), "{}", 2);
    expired.valid_till = 50_000;
    expired.signature = user_key.sign(&expired.signing_payload(PREFIX));
    store.pending = vec![unknown.clone(), expired.clone()];

    let (mut miner, _, _) = make_miner(store, &processor_key, |_| {});
    set_now(100_000);
    miner.tick().await.unwrap();

    let store = miner.store();
    let unknown_status = store.status_of(&unknown).unwrap();
    assert_eq!(unknown_status.status, TxStatus::Invalid);
    assert_eq!(unknown_status.message.as_deref(), Some("Unknown contract"));
    assert_eq!(unknown_status.contract_type, "Unknown");
    assert_eq!(unknown_status.block_id, None);

    let expired_status = store.status_of(&expired).unwrap();
    assert_eq!(expired_status.status, TxStatus::Invalid);
    assert_eq!(expired_status.message.as_deref(), Some("Transaction expired"));

    // genesis heartbeat still closes, empty
    assert_eq!(store.blocks[0].transactions_amount, 0);
}

#[tokio::test]
async fn test_contract_management_requires_processor_key() {
    let processor_key = PrivateKey::generate();
    let intruder_key = PrivateKey::generate();

    let mut store = MockStore::new();
    let tx = sign_tx(
        &intruder_key,
        1,
        CREATE_CONTRACT_HASH,
        &create_contract_payload("Evil", "DROP TABLE everything"),
        1,
    );
    store.pending.push(tx.clone());

    let (mut miner, _, _) = make_miner(store, &processor_key, |_| {});
    set_now(100_000);
    miner.tick().await.unwrap();

    let store = miner.store();
    assert_eq!(store.status_of(&tx).unwrap().status, TxStatus::Rejected);
    assert!(store.contracts.is_empty());
}

#[tokio::test]
async fn test_duplicate_contract_rejected() {
    let processor_key = PrivateKey::generate();
    let code = "UPDATE counters SET n = n + 1";

    let mut store = MockStore::new();
    store.contracts.push(contract_row(code, "Counter", "2.0", "{}"));
    // same type under different code, and same code under a new type
    let same_type = sign_tx(
        &processor_key,
        1,
        CREATE_CONTRACT_HASH,
        &create_contract_payload("Counter", "UPDATE counters SET n = n + 2"),
        1,
    );
    let same_code = sign_tx(
        &processor_key,
        2,
        CREATE_CONTRACT_HASH,
        &create_contract_payload("Counter2", code),
        2,
    );
    store.pending = vec![same_type.clone(), same_code.clone()];

    let (mut miner, _, _) = make_miner(store, &processor_key, |_| {});
    set_now(100_000);
    miner.tick().await.unwrap();

    let store = miner.store();
    let by_type = store.status_of(&same_type).unwrap();
    assert_eq!(by_type.status, TxStatus::Rejected);
    assert_eq!(
        by_type.message.as_deref(),
        Some("Contract type already exists")
    );
    let by_hash = store.status_of(&same_code).unwrap();
    assert_eq!(by_hash.status, TxStatus::Rejected);
    assert_eq!(by_hash.message.as_deref(), Some("Contract already exists"));

    // only the original deployment remains
    assert_eq!(store.contracts.len(), 1);
    assert_eq!(store.contracts[0].contract_type, "Counter");
}

#[tokio::test]
async fn test_shutdown_skips_the_final_commit() {
    let processor_key = PrivateKey::generate();
    let user_key = PrivateKey::generate();
    let code = "UPDATE counters SET n = n + 1";

    let mut store = MockStore::new();
    store.contracts.push(contract_row(code, "Counter", "2.0", "{}"));
    store
        .pending
        .push(sign_tx(&user_key, 1, sha256(code.as_bytes()), "{}", 1));

    let (mut miner, _, shutdown) = make_miner(store, &processor_key, |_| {});
    shutdown.store(true, Ordering::SeqCst);
    set_now(100_000);
    miner.tick().await.unwrap();

    // everything stayed uncommitted: the tick never happened
    let store = miner.store();
    assert!(store.blocks.is_empty());
    assert!(store.statuses.is_empty());
    assert_eq!(store.durable_commits, 0);
}
