// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Durable contract storage behind a transactional trait seam.
//!
//! Two backends: PostgreSQL for production and an in-memory store for tests
//! and local development. Both provide transaction-scoped advisory locks
//! with a bounded wait, upserts keyed by the contract natural key, and an
//! atomic live-to-historical move.

mod memory;
mod postgres;

pub use memory::MemoryContractStore;
pub use postgres::PostgresContractStore;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use core_types::types::{ContractRecord, HistoricalContractRecord, StoredContract};
use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("lock contention: {0}")]
    LockContention(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("query failed: {0}")]
    Query(String),
    #[error("schema bootstrap failed: {0}")]
    Schema(String),
    #[error("transaction already closed")]
    TxClosed,
}

impl StoreError {
    /// Retryable failures: the storage engine reported a lock-ordering
    /// conflict or a bounded lock wait expired.
    pub fn is_lock_contention(&self) -> bool {
        matches!(self, StoreError::LockContention(_))
    }
}

/// Persisted scheduler guard state, one row per maintenance job.
#[derive(Debug, Clone, PartialEq)]
pub struct MaintenanceRow {
    pub job_name: String,
    pub last_run_at: DateTime<Utc>,
    pub period_key: Option<String>,
}

/// Row count and distinct symbol count of the live table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveSummary {
    pub rows: u64,
    pub distinct_symbols: u64,
}

/// One open transaction. Advisory locks taken through `acquire_lock` are
/// scoped to the transaction and released when it ends; there is no explicit
/// unlock. Dropping the transaction without committing rolls it back.
#[async_trait]
pub trait StoreTx: Send {
    /// Block until the advisory token is held or the configured lock wait
    /// expires (`StoreError::LockContention`). Re-acquiring a token already
    /// held by this transaction is a no-op.
    async fn acquire_lock(&mut self, lock_id: i32) -> StoreResult<()>;

    /// Insert-or-update by natural key. Only the mutable fields and
    /// `updated_at` change for existing keys. Returns rows written.
    async fn upsert_batch(&mut self, rows: &[ContractRecord]) -> StoreResult<u64>;

    /// Live rows with `expiration_date < cutoff`, ordered by id.
    async fn select_expired(&mut self, cutoff: NaiveDate) -> StoreResult<Vec<StoredContract>>;

    /// Copy the rows into the historical table and delete them from the live
    /// table. Both happen inside this transaction, so the move is atomic.
    async fn archive_rows(
        &mut self,
        rows: &[StoredContract],
        archived_at: DateTime<Utc>,
    ) -> StoreResult<u64>;

    /// Delete not-yet-expired live rows whose `updated_at` predates
    /// `stale_cutoff`. The predicate is evaluated at delete time, so a row
    /// refreshed while maintenance runs survives.
    async fn purge_stale(
        &mut self,
        expired_cutoff: NaiveDate,
        stale_cutoff: DateTime<Utc>,
    ) -> StoreResult<u64>;

    async fn maintenance_row(&mut self, job_name: &str) -> StoreResult<Option<MaintenanceRow>>;

    async fn record_maintenance(
        &mut self,
        job_name: &str,
        ran_at: DateTime<Utc>,
        period_key: Option<&str>,
    ) -> StoreResult<()>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;

    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}

/// Storage backend seam. Non-transactional reads observe committed state.
#[async_trait]
pub trait ContractStore: Send + Sync {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>>;

    async fn live_contracts(
        &self,
        symbol: &str,
        expiration: Option<NaiveDate>,
    ) -> StoreResult<Vec<StoredContract>>;

    async fn clear_live(&self, symbol: &str) -> StoreResult<u64>;

    async fn historical_contracts(
        &self,
        symbol: &str,
    ) -> StoreResult<Vec<HistoricalContractRecord>>;

    async fn live_summary(&self) -> StoreResult<LiveSummary>;
}
