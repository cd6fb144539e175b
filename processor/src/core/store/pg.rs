use futures::TryStreamExt;
use sqlx::{
    postgres::{PgConnectOptions, PgConnection, PgRow},
    ConnectOptions, Either, Executor, Row,
};

use ledger_common::{
    block::Block,
    crypto::{Hash, PublicKey, Signature},
    transaction::{PendingTransaction, TRANSACTION_ID_SIZE},
};

use super::{
    ChainStore, ContractBinds, ContractRow, ContractSqlError, StatusUpdate, StoreError,
};
use crate::config::ProcessorConfig;

const FETCH_PENDING_SQL: &str = "\
    SELECT transaction_id, version, contract_hash, valid_till, payload, \
           public_key, signature, create_ts \
    FROM basics.transactions \
    WHERE status = 'new' \
    ORDER BY create_ts ASC, transaction_id ASC \
    LIMIT $1";

const LATEST_BLOCK_SQL: &str = "\
    SELECT block_id, version, previous_block_hash, processed_ts, \
           transactions, transactions_amount, signature \
    FROM basics.blocks ORDER BY block_id DESC LIMIT 1";

const LOAD_CONTRACTS_SQL: &str = "\
    SELECT contract_hash, contract_type, contract_version, description, \
           creator, contract_template::text AS template, code \
    FROM basics.contracts";

const INSERT_BLOCK_SQL: &str = "\
    INSERT INTO basics.blocks \
        (block_id, version, previous_block_hash, processed_ts, \
         transactions, transactions_amount, signature) \
    VALUES ($1, $2, $3, $4, $5, $6, $7)";

const INSERT_CONTRACT_SQL: &str = "\
    INSERT INTO basics.contracts \
        (contract_hash, contract_type, contract_version, description, \
         creator, contract_template, code) \
    VALUES ($1, $2, $3, $4, $5, $6::json, $7)";

// Ids travel as hex so the update batch stays one json parameter.
const BULK_UPDATE_SQL: &str = "\
    UPDATE basics.transactions AS t SET \
        status = r.status, \
        message = r.message, \
        contract_type = r.contract_type, \
        sender = r.sender, \
        receiver = r.receiver, \
        block_id = r.block_id, \
        position_in_block = r.position_in_block, \
        processed_ts = r.processed_ts \
    FROM json_to_recordset($1::json) AS r( \
        transaction_id text, status text, message text, contract_type text, \
        sender text, receiver text, block_id bigint, position_in_block int, \
        processed_ts bigint) \
    WHERE t.transaction_id = decode(r.transaction_id, 'hex')";

// Deterministic inputs for contract code, transaction-scoped so a savepoint
// rollback also discards them.
const SET_BINDS_SQL: &str = "\
    SELECT set_config('contract.payload', $1, true), \
           set_config('contract.sender', $2, true), \
           set_config('contract.transaction_id', $3, true), \
           set_config('contract.contract_hash', $4, true), \
           set_config('contract.block_id', $5, true), \
           set_config('contract.block_ts', $6, true), \
           set_config('contract.processor', $7, true), \
           set_config('contract.previous_block_ts', $8, true), \
           set_config('contract.previous_block_hash', $9, true)";

/// The Postgres gateway: one connection, raw SQL, no retries.
pub struct PgStore {
    options: PgConnectOptions,
    conn: Option<PgConnection>,
}

impl PgStore {
    pub fn new(config: &ProcessorConfig) -> Self {
        let options = PgConnectOptions::new()
            .host(&config.db_host)
            .port(config.db_port)
            .username(&config.db_user)
            .password(&config.db_password)
            .database(&config.db_name);
        PgStore {
            options,
            conn: None,
        }
    }

    fn conn(&mut self) -> Result<&mut PgConnection, StoreError> {
        self.conn.as_mut().ok_or(StoreError::NotConnected)
    }

    // Classify and, when the session is gone, drop the dead connection so
    // the next tick reconnects.
    fn note(&mut self, err: sqlx::Error) -> StoreError {
        let err = classify(err);
        if err.connection_lost() {
            self.conn = None;
        }
        err
    }

    async fn simple(&mut self, sql: &str) -> Result<(), StoreError> {
        let result = sqlx::raw_sql(sql).execute(self.conn()?).await;
        result.map(|_| ()).map_err(|e| self.note(e))
    }
}

fn classify(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.to_string());
            // class 08 = connection exception, 57P0x = server shutdown
            let lost = code
                .as_deref()
                .map(|c| c.starts_with("08") || c.starts_with("57P0"))
                .unwrap_or(false);
            StoreError::db(db.message(), code, lost)
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::db(err.to_string(), None, true),
        _ => StoreError::db(err.to_string(), None, false),
    }
}

fn classify_contract(err: sqlx::Error) -> ContractSqlError {
    match &err {
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some("P0001") => ContractSqlError::Raised(db.message().to_string()),
            Some("57014") => ContractSqlError::Timeout,
            Some(code) if code.starts_with("40") => ContractSqlError::Transient,
            Some(code) if code.starts_with("08") || code.starts_with("57P0") => {
                ContractSqlError::ConnectionLost
            }
            code => ContractSqlError::Other {
                code: code.map(|c| c.to_string()),
                message: db.message().to_string(),
            },
        },
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => ContractSqlError::ConnectionLost,
        _ => ContractSqlError::Other {
            code: None,
            message: err.to_string(),
        },
    }
}

fn pending_from_row(row: &PgRow) -> Result<PendingTransaction, StoreError> {
    let corrupt = |what: &str| StoreError::CorruptRow(what.to_string());

    let id_bytes: Vec<u8> = row.try_get("transaction_id").map_err(classify)?;
    let transaction_id: [u8; TRANSACTION_ID_SIZE] = id_bytes
        .as_slice()
        .try_into()
        .map_err(|_| corrupt("transaction_id length"))?;
    let version: i16 = row.try_get("version").map_err(classify)?;
    let hash_bytes: Vec<u8> = row.try_get("contract_hash").map_err(classify)?;
    let contract_hash = Hash::new(
        hash_bytes
            .as_slice()
            .try_into()
            .map_err(|_| corrupt("contract_hash length"))?,
    );
    let key_bytes: Vec<u8> = row.try_get("public_key").map_err(classify)?;
    let public_key =
        PublicKey::from_slice(&key_bytes).map_err(|_| corrupt("public_key length"))?;
    let sig_bytes: Vec<u8> = row.try_get("signature").map_err(classify)?;
    let signature =
        Signature::from_slice(&sig_bytes).map_err(|_| corrupt("signature length"))?;

    Ok(PendingTransaction {
        transaction_id,
        version: version as u8,
        contract_hash,
        valid_till: row.try_get("valid_till").map_err(classify)?,
        payload: row.try_get("payload").map_err(classify)?,
        public_key,
        signature,
        create_ts: row.try_get("create_ts").map_err(classify)?,
    })
}

fn block_from_row(row: &PgRow) -> Result<Block, StoreError> {
    let corrupt = |what: &str| StoreError::CorruptRow(what.to_string());

    let version: i16 = row.try_get("version").map_err(classify)?;
    let amount: i32 = row.try_get("transactions_amount").map_err(classify)?;
    let hash_bytes: Vec<u8> = row.try_get("previous_block_hash").map_err(classify)?;
    let previous_block_hash = Hash::new(
        hash_bytes
            .as_slice()
            .try_into()
            .map_err(|_| corrupt("previous_block_hash length"))?,
    );
    let sig_bytes: Vec<u8> = row.try_get("signature").map_err(classify)?;
    let signature =
        Signature::from_slice(&sig_bytes).map_err(|_| corrupt("signature length"))?;

    Ok(Block {
        block_id: row.try_get("block_id").map_err(classify)?,
        version: version as u8,
        previous_block_hash,
        processed_ts: row.try_get("processed_ts").map_err(classify)?,
        transactions: row.try_get("transactions").map_err(classify)?,
        transactions_amount: amount as u16,
        signature,
    })
}

impl ChainStore for PgStore {
    async fn connect(&mut self) -> Result<bool, StoreError> {
        if self.conn.is_some() {
            return Ok(false);
        }
        let mut conn = self.options.connect().await.map_err(classify)?;
        // status-only commits may lose the race with a crash; block commits
        // upgrade to synchronous per-transaction
        sqlx::raw_sql("SET synchronous_commit TO off")
            .execute(&mut conn)
            .await
            .map_err(classify)?;
        self.conn = Some(conn);
        Ok(true)
    }

    async fn server_version(&mut self) -> Result<u32, StoreError> {
        let result = sqlx::query("SHOW server_version_num")
            .fetch_one(self.conn()?)
            .await;
        let row = result.map_err(|e| self.note(e))?;
        let text: String = row.try_get(0).map_err(classify)?;
        text.parse()
            .map_err(|_| StoreError::CorruptRow(format!("server_version_num {text:?}")))
    }

    async fn set_statement_timeout(&mut self, millis: i64) -> Result<(), StoreError> {
        // SET takes no bind parameters
        self.simple(&format!("SET statement_timeout = {millis}")).await
    }

    async fn fetch_pending(
        &mut self,
        limit: u16,
    ) -> Result<Vec<PendingTransaction>, StoreError> {
        let result = sqlx::query(FETCH_PENDING_SQL)
            .bind(limit as i64)
            .fetch_all(self.conn()?)
            .await;
        let rows = result.map_err(|e| self.note(e))?;
        rows.iter().map(pending_from_row).collect()
    }

    async fn latest_block(&mut self) -> Result<Option<Block>, StoreError> {
        let result = sqlx::query(LATEST_BLOCK_SQL)
            .fetch_optional(self.conn()?)
            .await;
        let row = result.map_err(|e| self.note(e))?;
        row.as_ref().map(block_from_row).transpose()
    }

    async fn begin_block(&mut self) -> Result<(), StoreError> {
        self.simple("BEGIN; SET LOCAL ROLE smartcontract; SAVEPOINT tx;")
            .await
    }

    async fn savepoint_rollback(&mut self) -> Result<(), StoreError> {
        self.simple("ROLLBACK TO SAVEPOINT tx;").await
    }

    async fn savepoint_advance(&mut self) -> Result<(), StoreError> {
        self.simple("RELEASE SAVEPOINT tx; SAVEPOINT tx;").await
    }

    async fn reset_role(&mut self) -> Result<(), StoreError> {
        self.simple("RESET ROLE;").await
    }

    async fn run_contract_sql(
        &mut self,
        code: &str,
        binds: &ContractBinds,
    ) -> Result<Option<String>, ContractSqlError> {
        let outcome = {
            let conn = match self.conn.as_mut() {
                Some(conn) => conn,
                None => return Err(ContractSqlError::ConnectionLost),
            };
            let bound = sqlx::query(SET_BINDS_SQL)
                .bind(&binds.payload)
                .bind(&binds.sender)
                .bind(&binds.transaction_id)
                .bind(&binds.contract_hash)
                .bind(binds.block_id.to_string())
                .bind(binds.block_ts.to_string())
                .bind(&binds.processor)
                .bind(binds.previous_block_ts.to_string())
                .bind(&binds.previous_block_hash)
                .execute(&mut *conn)
                .await;
            match bound {
                Ok(_) => {
                    // the message is the first column of the last row the
                    // contract produced
                    let mut stream = conn.fetch_many(sqlx::raw_sql(code));
                    let mut message: Option<String> = None;
                    loop {
                        match stream.try_next().await {
                            Ok(Some(Either::Right(row))) => {
                                message =
                                    row.try_get::<Option<String>, _>(0).ok().flatten();
                            }
                            Ok(Some(Either::Left(_))) => {}
                            Ok(None) => break Ok(message),
                            Err(err) => break Err(err),
                        }
                    }
                }
                Err(err) => Err(err),
            }
        };
        outcome.map_err(|err| {
            let classified = classify_contract(err);
            if matches!(classified, ContractSqlError::ConnectionLost) {
                self.conn = None;
            }
            classified
        })
    }

    async fn load_contracts(&mut self) -> Result<Vec<ContractRow>, StoreError> {
        let result = sqlx::query(LOAD_CONTRACTS_SQL)
            .fetch_all(self.conn()?)
            .await;
        let rows = result.map_err(|e| self.note(e))?;
        rows.iter()
            .map(|row| {
                let hash_bytes: Vec<u8> = row.try_get("contract_hash").map_err(classify)?;
                let contract_hash = Hash::new(hash_bytes.as_slice().try_into().map_err(
                    |_| StoreError::CorruptRow("contract_hash length".to_string()),
                )?);
                Ok(ContractRow {
                    contract_hash,
                    contract_type: row.try_get("contract_type").map_err(classify)?,
                    contract_version: row.try_get("contract_version").map_err(classify)?,
                    description: row.try_get("description").map_err(classify)?,
                    creator: row.try_get("creator").map_err(classify)?,
                    template: row.try_get("template").map_err(classify)?,
                    code: row.try_get("code").map_err(classify)?,
                })
            })
            .collect()
    }

    async fn insert_contract(&mut self, row: &ContractRow) -> Result<(), StoreError> {
        self.simple("SET LOCAL ROLE smartcontractmanager;").await?;
        let result = sqlx::query(INSERT_CONTRACT_SQL)
            .bind(row.contract_hash.as_bytes().as_slice())
            .bind(&row.contract_type)
            .bind(&row.contract_version)
            .bind(&row.description)
            .bind(&row.creator)
            .bind(&row.template)
            .bind(&row.code)
            .execute(self.conn()?)
            .await;
        result.map(|_| ()).map_err(|e| self.note(e))?;
        self.simple("SET LOCAL ROLE smartcontract;").await
    }

    async fn delete_contract(&mut self, hash: &Hash) -> Result<(), StoreError> {
        self.simple("SET LOCAL ROLE smartcontractmanager;").await?;
        let result = sqlx::query("DELETE FROM basics.contracts WHERE contract_hash = $1")
            .bind(hash.as_bytes().as_slice())
            .execute(self.conn()?)
            .await;
        result.map(|_| ()).map_err(|e| self.note(e))?;
        self.simple("SET LOCAL ROLE smartcontract;").await
    }

    async fn bulk_update_statuses(
        &mut self,
        updates: &[StatusUpdate],
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(updates)
            .map_err(|e| StoreError::CorruptRow(format!("status updates: {e}")))?;
        let result = sqlx::query(BULK_UPDATE_SQL)
            .bind(json)
            .execute(self.conn()?)
            .await;
        result.map(|_| ()).map_err(|e| self.note(e))
    }

    async fn insert_block(&mut self, block: &Block) -> Result<(), StoreError> {
        let result = sqlx::query(INSERT_BLOCK_SQL)
            .bind(block.block_id)
            .bind(block.version as i16)
            .bind(block.previous_block_hash.as_bytes().as_slice())
            .bind(block.processed_ts)
            .bind(&block.transactions)
            .bind(block.transactions_amount as i32)
            .bind(block.signature.as_bytes().as_slice())
            .execute(self.conn()?)
            .await;
        result.map(|_| ()).map_err(|e| self.note(e))
    }

    async fn commit_durable(&mut self) -> Result<(), StoreError> {
        self.simple("SET LOCAL synchronous_commit TO ON; COMMIT;").await
    }

    async fn commit_fast(&mut self) -> Result<(), StoreError> {
        self.simple("COMMIT;").await
    }

    async fn rollback_all(&mut self) -> Result<(), StoreError> {
        // no session means the server already rolled back on disconnect
        if self.conn.is_none() {
            return Ok(());
        }
        self.simple("ROLLBACK;").await
    }

    async fn notify(&mut self, channel: &str, payload: &str) -> Result<(), StoreError> {
        let result = sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(payload)
            .execute(self.conn()?)
            .await;
        result.map(|_| ()).map_err(|e| self.note(e))
    }
}
