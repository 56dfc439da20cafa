//! PostgreSQL pending transaction store

use super::{PendingTransaction, PendingTxStore};
use crate::config::DatabaseConfig;
use crate::error::{SenderError, SenderResult};
use crate::types::{SenderMeta, SenderType, TxStatus, TxType};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::{Address, Bytes, H256};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::{debug, error, info};

/// Pending transaction store backed by PostgreSQL
pub struct PgPendingTxStore {
    pool: PgPool,
}

impl PgPendingTxStore {
    /// Connect to the database
    pub async fn new(config: &DatabaseConfig) -> SenderResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> SenderResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pending_transaction (
                id BIGSERIAL PRIMARY KEY,
                context_id VARCHAR NOT NULL,
                hash VARCHAR(66) NOT NULL UNIQUE,
                chain_id BIGINT NOT NULL,
                tx_type SMALLINT NOT NULL,
                gas_tip_cap BIGINT NOT NULL,
                gas_fee_cap BIGINT NOT NULL,
                gas_limit BIGINT NOT NULL,
                nonce BIGINT NOT NULL,
                submit_block_number BIGINT NOT NULL,
                status SMALLINT NOT NULL,
                rlp_encoding BYTEA NOT NULL,
                sender_name VARCHAR NOT NULL,
                sender_service VARCHAR NOT NULL,
                sender_address VARCHAR(42) NOT NULL,
                sender_type SMALLINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_pending_transaction_sender_type_status
            ON pending_transaction (sender_type, status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_pending_transaction_sender_address_nonce
            ON pending_transaction (sender_address, nonce)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_pending_transaction_context_id
            ON pending_transaction (context_id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    async fn insert_in(
        db: &mut Transaction<'_, Postgres>,
        tx: &PendingTransaction,
    ) -> SenderResult<()> {
        sqlx::query(
            r#"
            INSERT INTO pending_transaction
                (context_id, hash, chain_id, tx_type, gas_tip_cap, gas_fee_cap, gas_limit,
                 nonce, submit_block_number, status, rlp_encoding,
                 sender_name, sender_service, sender_address, sender_type, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(&tx.context_id)
        .bind(format!("{:?}", tx.hash))
        .bind(tx.chain_id as i64)
        .bind(tx.tx_type.as_u8() as i16)
        .bind(tx.gas_tip_cap as i64)
        .bind(tx.gas_fee_cap as i64)
        .bind(tx.gas_limit as i64)
        .bind(tx.nonce as i64)
        .bind(tx.submit_block_number as i64)
        .bind(tx.status.as_i16())
        .bind(tx.raw.to_vec())
        .bind(&tx.sender.name)
        .bind(&tx.sender.service)
        .bind(format!("{:?}", tx.sender.address))
        .bind(tx.sender.sender_type.as_i16())
        .bind(tx.created_at)
        .execute(&mut **db)
        .await?;

        Ok(())
    }

    async fn update_status_in(
        db: &mut Transaction<'_, Postgres>,
        hash: H256,
        status: TxStatus,
    ) -> SenderResult<()> {
        sqlx::query(
            r#"
            UPDATE pending_transaction
            SET status = $1, updated_at = NOW()
            WHERE hash = $2
            "#,
        )
        .bind(status.as_i16())
        .bind(format!("{:?}", hash))
        .execute(&mut **db)
        .await?;

        Ok(())
    }

    async fn fail_siblings_in(
        db: &mut Transaction<'_, Postgres>,
        sender_address: Address,
        nonce: u64,
        exclude_hash: H256,
    ) -> SenderResult<()> {
        sqlx::query(
            r#"
            UPDATE pending_transaction
            SET status = $1, updated_at = NOW()
            WHERE sender_address = $2 AND nonce = $3 AND hash <> $4
            "#,
        )
        .bind(TxStatus::ConfirmedFailed.as_i16())
        .bind(format!("{:?}", sender_address))
        .bind(nonce as i64)
        .bind(format!("{:?}", exclude_hash))
        .execute(&mut **db)
        .await?;

        Ok(())
    }
}

/// Column values of one `pending_transaction` row, before validation
#[derive(Debug, Clone)]
struct PendingRow {
    context_id: String,
    hash: String,
    chain_id: i64,
    tx_type: i16,
    gas_tip_cap: i64,
    gas_fee_cap: i64,
    gas_limit: i64,
    nonce: i64,
    submit_block_number: i64,
    status: i16,
    rlp_encoding: Vec<u8>,
    sender_name: String,
    sender_service: String,
    sender_address: String,
    sender_type: i16,
    created_at: DateTime<Utc>,
}

impl PendingRow {
    fn from_pg(row: &PgRow) -> Self {
        Self {
            context_id: row.get("context_id"),
            hash: row.get("hash"),
            chain_id: row.get("chain_id"),
            tx_type: row.get("tx_type"),
            gas_tip_cap: row.get("gas_tip_cap"),
            gas_fee_cap: row.get("gas_fee_cap"),
            gas_limit: row.get("gas_limit"),
            nonce: row.get("nonce"),
            submit_block_number: row.get("submit_block_number"),
            status: row.get("status"),
            rlp_encoding: row.get("rlp_encoding"),
            sender_name: row.get("sender_name"),
            sender_service: row.get("sender_service"),
            sender_address: row.get("sender_address"),
            sender_type: row.get("sender_type"),
            created_at: row.get("created_at"),
        }
    }

    fn into_record(self) -> SenderResult<PendingTransaction> {
        let tx_type = u8::try_from(self.tx_type)
            .map_err(|_| SenderError::Decode(format!("invalid tx type {}", self.tx_type)))
            .and_then(TxType::try_from)?;

        Ok(PendingTransaction {
            hash: self.hash.parse::<H256>().map_err(|e| {
                SenderError::Decode(format!("invalid hash {}: {}", self.hash, e))
            })?,
            chain_id: self.chain_id as u64,
            tx_type,
            gas_tip_cap: self.gas_tip_cap as u64,
            gas_fee_cap: self.gas_fee_cap as u64,
            gas_limit: self.gas_limit as u64,
            nonce: self.nonce as u64,
            submit_block_number: self.submit_block_number as u64,
            status: TxStatus::try_from(self.status)?,
            raw: Bytes::from(self.rlp_encoding),
            sender: SenderMeta {
                name: self.sender_name,
                service: self.sender_service,
                address: self.sender_address.parse::<Address>().map_err(|e| {
                    SenderError::Decode(format!(
                        "invalid sender address {}: {}",
                        self.sender_address, e
                    ))
                })?,
                sender_type: SenderType::try_from(self.sender_type)?,
            },
            created_at: self.created_at,
            context_id: self.context_id,
        })
    }
}

/// Validate rows one by one; a malformed row is logged and left out.
fn decode_rows(rows: Vec<PendingRow>) -> Vec<PendingTransaction> {
    rows.into_iter()
        .filter_map(|row| {
            let context_id = row.context_id.clone();
            let hash = row.hash.clone();
            match row.into_record() {
                Ok(record) => Some(record),
                Err(e) => {
                    error!(
                        context_id = %context_id,
                        hash = %hash,
                        error = %e,
                        "Skipping malformed pending transaction row"
                    );
                    None
                }
            }
        })
        .collect()
}

#[async_trait]
impl PendingTxStore for PgPendingTxStore {
    async fn insert_pending_transaction(&self, tx: &PendingTransaction) -> SenderResult<()> {
        let mut db = self.pool.begin().await?;
        Self::insert_in(&mut db, tx).await?;
        db.commit().await?;

        debug!(
            context_id = %tx.context_id,
            hash = ?tx.hash,
            nonce = tx.nonce,
            "Stored pending transaction"
        );
        Ok(())
    }

    async fn replace_pending_transaction(
        &self,
        old_hash: H256,
        successor: &PendingTransaction,
    ) -> SenderResult<()> {
        let mut db = self.pool.begin().await?;
        Self::update_status_in(&mut db, old_hash, TxStatus::Replaced).await?;
        Self::insert_in(&mut db, successor).await?;
        db.commit().await?;

        debug!(
            context_id = %successor.context_id,
            old_hash = ?old_hash,
            new_hash = ?successor.hash,
            "Stored replacement transaction"
        );
        Ok(())
    }

    async fn confirm_transaction(
        &self,
        hash: H256,
        status: TxStatus,
        sender_address: Address,
        nonce: u64,
    ) -> SenderResult<()> {
        let mut db = self.pool.begin().await?;
        Self::update_status_in(&mut db, hash, status).await?;
        Self::fail_siblings_in(&mut db, sender_address, nonce, hash).await?;
        db.commit().await?;
        Ok(())
    }

    async fn update_status_by_hash(&self, hash: H256, status: TxStatus) -> SenderResult<()> {
        let mut db = self.pool.begin().await?;
        Self::update_status_in(&mut db, hash, status).await?;
        db.commit().await?;
        Ok(())
    }

    async fn update_other_transactions_as_failed_by_nonce(
        &self,
        sender_address: Address,
        nonce: u64,
        exclude_hash: H256,
    ) -> SenderResult<()> {
        let mut db = self.pool.begin().await?;
        Self::fail_siblings_in(&mut db, sender_address, nonce, exclude_hash).await?;
        db.commit().await?;
        Ok(())
    }

    async fn pending_or_replaced_by_sender_type(
        &self,
        sender_type: SenderType,
        limit: usize,
    ) -> SenderResult<Vec<PendingTransaction>> {
        let rows = sqlx::query(
            r#"
            SELECT context_id, hash, chain_id, tx_type, gas_tip_cap, gas_fee_cap, gas_limit,
                   nonce, submit_block_number, status, rlp_encoding,
                   sender_name, sender_service, sender_address, sender_type, created_at
            FROM pending_transaction
            WHERE sender_type = $1 AND (status = $2 OR status = $3)
            ORDER BY nonce ASC, gas_fee_cap ASC
            LIMIT $4
            "#,
        )
        .bind(sender_type.as_i16())
        .bind(TxStatus::Pending.as_i16())
        .bind(TxStatus::Replaced.as_i16())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(decode_rows(rows.iter().map(PendingRow::from_pg).collect()))
    }

    async fn count_pending_by_sender_type(&self, sender_type: SenderType) -> SenderResult<u64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS pending
            FROM pending_transaction
            WHERE sender_type = $1 AND status = $2
            "#,
        )
        .bind(sender_type.as_i16())
        .bind(TxStatus::Pending.as_i16())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get::<i64, _>("pending") as u64)
    }

    async fn status_by_hash(&self, hash: H256) -> SenderResult<Option<TxStatus>> {
        let row = sqlx::query("SELECT status FROM pending_transaction WHERE hash = $1")
            .bind(format!("{:?}", hash))
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| TxStatus::try_from(r.get::<i16, _>("status")))
            .transpose()
    }
}
