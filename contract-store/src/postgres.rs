// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! PostgreSQL backend. Advisory locks are taken with
//! `pg_advisory_xact_lock` under a `SET LOCAL lock_timeout`, so every lock is
//! released when its transaction ends and no wait is unbounded. Deadlocks,
//! lock timeouts, and serialization failures classify as retryable
//! contention.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use core_types::types::{
    ContractRecord, HistoricalContractRecord, OptionType, StoredContract,
};
use log::info;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row, Transaction};

use crate::{ContractStore, LiveSummary, MaintenanceRow, StoreError, StoreResult, StoreTx};

/// Schema applied on connect (idempotent).
const SCHEMA: &str = include_str!("schema.sql");

const LIVE_COLUMNS: &str = "symbol, expiration_date, strike, option_type, bid, ask, last, \
     volume, open_interest, implied_volatility, delta, gamma, theta, vega, updated_at";

pub struct PostgresContractStore {
    pool: PgPool,
    lock_wait_ms: u64,
}

impl PostgresContractStore {
    pub async fn connect(
        url: &str,
        max_connections: u32,
        lock_wait_ms: u64,
    ) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        let store = Self { pool, lock_wait_ms };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> StoreResult<()> {
        for statement in schema_statements(SCHEMA) {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|err| StoreError::Schema(err.to_string()))?;
        }
        info!("contract store schema ensured");
        Ok(())
    }
}

fn schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                return None;
            }
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

fn classify(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if let Some(code) = db.code() {
            // deadlock_detected, lock_not_available, serialization_failure
            if matches!(code.as_ref(), "40P01" | "55P03" | "40001") {
                return StoreError::LockContention(db.message().to_string());
            }
        }
    }
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Unavailable(err.to_string())
        }
        other => StoreError::Query(other.to_string()),
    }
}

fn record_from_row(row: &PgRow) -> Result<ContractRecord, sqlx::Error> {
    let option_type: String = row.try_get("option_type")?;
    let option_type = option_type
        .parse::<OptionType>()
        .map_err(|err| sqlx::Error::Decode(Box::new(err)))?;
    Ok(ContractRecord {
        symbol: row.try_get("symbol")?,
        expiration_date: row.try_get("expiration_date")?,
        strike: row.try_get("strike")?,
        option_type,
        bid: row.try_get("bid")?,
        ask: row.try_get("ask")?,
        last: row.try_get("last")?,
        volume: row.try_get("volume")?,
        open_interest: row.try_get("open_interest")?,
        implied_volatility: row.try_get("implied_volatility")?,
        delta: row.try_get("delta")?,
        gamma: row.try_get("gamma")?,
        theta: row.try_get("theta")?,
        vega: row.try_get("vega")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn stored_from_row(row: &PgRow) -> Result<StoredContract, sqlx::Error> {
    Ok(StoredContract {
        id: row.try_get("id")?,
        record: record_from_row(row)?,
    })
}

fn push_record_binds(
    builder: &mut sqlx::query_builder::Separated<'_, '_, Postgres, &'static str>,
    record: &ContractRecord,
) {
    builder
        .push_bind(record.symbol.clone())
        .push_bind(record.expiration_date)
        .push_bind(record.strike)
        .push_bind(record.option_type.as_str())
        .push_bind(record.bid)
        .push_bind(record.ask)
        .push_bind(record.last)
        .push_bind(record.volume)
        .push_bind(record.open_interest)
        .push_bind(record.implied_volatility)
        .push_bind(record.delta)
        .push_bind(record.gamma)
        .push_bind(record.theta)
        .push_bind(record.vega)
        .push_bind(record.updated_at);
}

#[async_trait]
impl ContractStore for PostgresContractStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>> {
        let tx = self.pool.begin().await.map_err(classify)?;
        Ok(Box::new(PgTx {
            tx: Some(tx),
            lock_wait_ms: self.lock_wait_ms,
        }))
    }

    async fn live_contracts(
        &self,
        symbol: &str,
        expiration: Option<NaiveDate>,
    ) -> StoreResult<Vec<StoredContract>> {
        let rows = match expiration {
            Some(expiration) => {
                sqlx::query(&format!(
                    "SELECT id, {LIVE_COLUMNS} FROM live_contracts \
                     WHERE symbol = $1 AND expiration_date = $2 \
                     ORDER BY expiration_date, strike, option_type"
                ))
                .bind(symbol)
                .bind(expiration)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(&format!(
                    "SELECT id, {LIVE_COLUMNS} FROM live_contracts \
                     WHERE symbol = $1 \
                     ORDER BY expiration_date, strike, option_type"
                ))
                .bind(symbol)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(classify)?;
        rows.iter()
            .map(|row| stored_from_row(row).map_err(classify))
            .collect()
    }

    async fn clear_live(&self, symbol: &str) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM live_contracts WHERE symbol = $1")
            .bind(symbol)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(result.rows_affected())
    }

    async fn historical_contracts(
        &self,
        symbol: &str,
    ) -> StoreResult<Vec<HistoricalContractRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT original_id, archived_at, {LIVE_COLUMNS} \
             FROM historical_contracts WHERE symbol = $1 ORDER BY archived_at, original_id"
        ))
        .bind(symbol)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;
        rows.iter()
            .map(|row| {
                Ok(HistoricalContractRecord {
                    original_id: row.try_get("original_id").map_err(classify)?,
                    archived_at: row.try_get("archived_at").map_err(classify)?,
                    record: record_from_row(row).map_err(classify)?,
                })
            })
            .collect()
    }

    async fn live_summary(&self) -> StoreResult<LiveSummary> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS row_count, COUNT(DISTINCT symbol) AS symbol_count \
             FROM live_contracts",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(classify)?;
        let rows: i64 = row.try_get("row_count").map_err(classify)?;
        let distinct_symbols: i64 = row.try_get("symbol_count").map_err(classify)?;
        Ok(LiveSummary {
            rows: rows as u64,
            distinct_symbols: distinct_symbols as u64,
        })
    }
}

struct PgTx {
    tx: Option<Transaction<'static, Postgres>>,
    lock_wait_ms: u64,
}

impl PgTx {
    fn conn(&mut self) -> StoreResult<&mut Transaction<'static, Postgres>> {
        self.tx.as_mut().ok_or(StoreError::TxClosed)
    }
}

#[async_trait]
impl StoreTx for PgTx {
    async fn acquire_lock(&mut self, lock_id: i32) -> StoreResult<()> {
        let lock_wait_ms = self.lock_wait_ms;
        let tx = self.conn()?;
        // SET does not take bind parameters; the value is a formatted integer.
        sqlx::query(&format!("SET LOCAL lock_timeout = '{}ms'", lock_wait_ms))
            .execute(&mut **tx)
            .await
            .map_err(classify)?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(i64::from(lock_id))
            .execute(&mut **tx)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn upsert_batch(&mut self, rows: &[ContractRecord]) -> StoreResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let tx = self.conn()?;
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("INSERT INTO live_contracts ({LIVE_COLUMNS}) "));
        builder.push_values(rows, |mut b, record| {
            push_record_binds(&mut b, record);
        });
        builder.push(
            " ON CONFLICT (symbol, expiration_date, strike, option_type) DO UPDATE SET \
             bid = EXCLUDED.bid, ask = EXCLUDED.ask, last = EXCLUDED.last, \
             volume = EXCLUDED.volume, open_interest = EXCLUDED.open_interest, \
             implied_volatility = EXCLUDED.implied_volatility, delta = EXCLUDED.delta, \
             gamma = EXCLUDED.gamma, theta = EXCLUDED.theta, vega = EXCLUDED.vega, \
             updated_at = EXCLUDED.updated_at",
        );
        let result = builder
            .build()
            .execute(&mut **tx)
            .await
            .map_err(classify)?;
        Ok(result.rows_affected())
    }

    async fn select_expired(&mut self, cutoff: NaiveDate) -> StoreResult<Vec<StoredContract>> {
        let tx = self.conn()?;
        let rows = sqlx::query(&format!(
            "SELECT id, {LIVE_COLUMNS} FROM live_contracts \
             WHERE expiration_date < $1 ORDER BY id"
        ))
        .bind(cutoff)
        .fetch_all(&mut **tx)
        .await
        .map_err(classify)?;
        rows.iter()
            .map(|row| stored_from_row(row).map_err(classify))
            .collect()
    }

    async fn archive_rows(
        &mut self,
        rows: &[StoredContract],
        archived_at: DateTime<Utc>,
    ) -> StoreResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let tx = self.conn()?;
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "INSERT INTO historical_contracts (original_id, archived_at, {LIVE_COLUMNS}) "
        ));
        builder.push_values(rows, |mut b, stored| {
            b.push_bind(stored.id).push_bind(archived_at);
            push_record_binds(&mut b, &stored.record);
        });
        builder
            .build()
            .execute(&mut **tx)
            .await
            .map_err(classify)?;

        let ids: Vec<i64> = rows.iter().map(|stored| stored.id).collect();
        let result = sqlx::query("DELETE FROM live_contracts WHERE id = ANY($1)")
            .bind(&ids)
            .execute(&mut **tx)
            .await
            .map_err(classify)?;
        Ok(result.rows_affected())
    }

    async fn purge_stale(
        &mut self,
        expired_cutoff: NaiveDate,
        stale_cutoff: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let tx = self.conn()?;
        let result = sqlx::query(
            "DELETE FROM live_contracts \
             WHERE expiration_date >= $1 AND updated_at < $2",
        )
        .bind(expired_cutoff)
        .bind(stale_cutoff)
        .execute(&mut **tx)
        .await
        .map_err(classify)?;
        Ok(result.rows_affected())
    }

    async fn maintenance_row(&mut self, job_name: &str) -> StoreResult<Option<MaintenanceRow>> {
        let tx = self.conn()?;
        let row = sqlx::query(
            "SELECT job_name, last_run_at, period_key FROM maintenance_runs WHERE job_name = $1",
        )
        .bind(job_name)
        .fetch_optional(&mut **tx)
        .await
        .map_err(classify)?;
        row.map(|row| {
            Ok(MaintenanceRow {
                job_name: row.try_get("job_name").map_err(classify)?,
                last_run_at: row.try_get("last_run_at").map_err(classify)?,
                period_key: row.try_get("period_key").map_err(classify)?,
            })
        })
        .transpose()
    }

    async fn record_maintenance(
        &mut self,
        job_name: &str,
        ran_at: DateTime<Utc>,
        period_key: Option<&str>,
    ) -> StoreResult<()> {
        let tx = self.conn()?;
        sqlx::query(
            "INSERT INTO maintenance_runs (job_name, last_run_at, period_key) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (job_name) DO UPDATE SET \
             last_run_at = EXCLUDED.last_run_at, period_key = EXCLUDED.period_key",
        )
        .bind(job_name)
        .bind(ran_at)
        .bind(period_key)
        .execute(&mut **tx)
        .await
        .map_err(classify)?;
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> StoreResult<()> {
        let tx = self.tx.take().ok_or(StoreError::TxClosed)?;
        tx.commit().await.map_err(classify)
    }

    async fn rollback(mut self: Box<Self>) -> StoreResult<()> {
        let tx = self.tx.take().ok_or(StoreError::TxClosed)?;
        tx.rollback().await.map_err(classify)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_splits_into_nonempty_statements() {
        let statements = schema_statements(SCHEMA);
        assert!(statements.len() >= 6);
        assert!(statements
            .iter()
            .all(|statement| !statement.trim().is_empty()));
        assert!(statements[0].contains("live_contracts"));
    }

    #[test]
    fn contention_sqlstates_classify_as_retryable() {
        // Classification falls through to Query for non-database errors.
        let err = classify(sqlx::Error::RowNotFound);
        assert!(!err.is_lock_contention());
        assert!(matches!(err, StoreError::Query(_)));
    }
}
