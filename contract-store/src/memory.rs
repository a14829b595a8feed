// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! In-memory backend: per-token advisory locks with a bounded wait and
//! transaction-staged mutations applied atomically at commit. Used by tests
//! and local development; semantics mirror the PostgreSQL backend.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use core_types::types::{ContractKey, ContractRecord, HistoricalContractRecord, StoredContract};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::{ContractStore, LiveSummary, MaintenanceRow, StoreError, StoreResult, StoreTx};

const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Tables {
    live: BTreeMap<ContractKey, StoredContract>,
    historical: Vec<HistoricalContractRecord>,
    maintenance: HashMap<String, MaintenanceRow>,
    next_id: i64,
}

type LockTable = Mutex<HashMap<i32, Arc<AsyncMutex<()>>>>;

pub struct MemoryContractStore {
    tables: Arc<RwLock<Tables>>,
    locks: Arc<LockTable>,
    lock_wait: Duration,
}

impl MemoryContractStore {
    pub fn new() -> Self {
        Self::with_lock_wait(DEFAULT_LOCK_WAIT)
    }

    pub fn with_lock_wait(lock_wait: Duration) -> Self {
        Self {
            tables: Arc::new(RwLock::new(Tables::default())),
            locks: Arc::new(Mutex::new(HashMap::new())),
            lock_wait,
        }
    }
}

impl Default for MemoryContractStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContractStore for MemoryContractStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>> {
        Ok(Box::new(MemoryTx {
            tables: Arc::clone(&self.tables),
            locks: Arc::clone(&self.locks),
            lock_wait: self.lock_wait,
            held: Vec::new(),
            staged: Vec::new(),
        }))
    }

    async fn live_contracts(
        &self,
        symbol: &str,
        expiration: Option<NaiveDate>,
    ) -> StoreResult<Vec<StoredContract>> {
        let tables = self.tables.read();
        Ok(tables
            .live
            .values()
            .filter(|stored| stored.record.symbol == symbol)
            .filter(|stored| {
                expiration
                    .map(|exp| stored.record.expiration_date == exp)
                    .unwrap_or(true)
            })
            .cloned()
            .collect())
    }

    async fn clear_live(&self, symbol: &str) -> StoreResult<u64> {
        let mut tables = self.tables.write();
        let before = tables.live.len();
        tables.live.retain(|_, stored| stored.record.symbol != symbol);
        Ok((before - tables.live.len()) as u64)
    }

    async fn historical_contracts(
        &self,
        symbol: &str,
    ) -> StoreResult<Vec<HistoricalContractRecord>> {
        let tables = self.tables.read();
        Ok(tables
            .historical
            .iter()
            .filter(|row| row.record.symbol == symbol)
            .cloned()
            .collect())
    }

    async fn live_summary(&self) -> StoreResult<LiveSummary> {
        let tables = self.tables.read();
        let distinct: std::collections::BTreeSet<&str> = tables
            .live
            .values()
            .map(|stored| stored.record.symbol.as_str())
            .collect();
        Ok(LiveSummary {
            rows: tables.live.len() as u64,
            distinct_symbols: distinct.len() as u64,
        })
    }
}

enum StagedOp {
    Upsert(Vec<ContractRecord>),
    Archive(Vec<HistoricalContractRecord>),
    PurgeStale {
        expired_cutoff: NaiveDate,
        stale_cutoff: DateTime<Utc>,
    },
    Maintenance(MaintenanceRow),
}

struct MemoryTx {
    tables: Arc<RwLock<Tables>>,
    locks: Arc<LockTable>,
    lock_wait: Duration,
    held: Vec<(i32, OwnedMutexGuard<()>)>,
    staged: Vec<StagedOp>,
}

impl MemoryTx {
    fn apply(tables: &mut Tables, op: StagedOp) {
        match op {
            StagedOp::Upsert(rows) => {
                for row in rows {
                    let key = row.key();
                    match tables.live.get_mut(&key) {
                        Some(existing) => existing.record.apply_update(&row),
                        None => {
                            tables.next_id += 1;
                            let id = tables.next_id;
                            tables.live.insert(key, StoredContract { id, record: row });
                        }
                    }
                }
            }
            StagedOp::Archive(rows) => {
                for hist in rows {
                    let key = hist.record.key();
                    let still_present = tables
                        .live
                        .get(&key)
                        .map(|stored| stored.id == hist.original_id)
                        .unwrap_or(false);
                    if still_present {
                        tables.live.remove(&key);
                    }
                    tables.historical.push(hist);
                }
            }
            StagedOp::PurgeStale {
                expired_cutoff,
                stale_cutoff,
            } => {
                // Predicate re-evaluated here, at delete time.
                tables.live.retain(|_, stored| {
                    !(stored.record.expiration_date >= expired_cutoff
                        && stored.record.updated_at < stale_cutoff)
                });
            }
            StagedOp::Maintenance(row) => {
                tables.maintenance.insert(row.job_name.clone(), row);
            }
        }
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn acquire_lock(&mut self, lock_id: i32) -> StoreResult<()> {
        if self.held.iter().any(|(id, _)| *id == lock_id) {
            return Ok(());
        }
        let handle = {
            let mut locks = self.locks.lock();
            Arc::clone(
                locks
                    .entry(lock_id)
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };
        match tokio::time::timeout(self.lock_wait, handle.lock_owned()).await {
            Ok(guard) => {
                self.held.push((lock_id, guard));
                Ok(())
            }
            Err(_) => Err(StoreError::LockContention(format!(
                "token {} wait exceeded {:?}",
                lock_id, self.lock_wait
            ))),
        }
    }

    async fn upsert_batch(&mut self, rows: &[ContractRecord]) -> StoreResult<u64> {
        self.staged.push(StagedOp::Upsert(rows.to_vec()));
        Ok(rows.len() as u64)
    }

    async fn select_expired(&mut self, cutoff: NaiveDate) -> StoreResult<Vec<StoredContract>> {
        let tables = self.tables.read();
        let mut rows: Vec<StoredContract> = tables
            .live
            .values()
            .filter(|stored| stored.record.expiration_date < cutoff)
            .cloned()
            .collect();
        rows.sort_by_key(|stored| stored.id);
        Ok(rows)
    }

    async fn archive_rows(
        &mut self,
        rows: &[StoredContract],
        archived_at: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let historical: Vec<HistoricalContractRecord> = rows
            .iter()
            .map(|stored| HistoricalContractRecord::from_stored(stored, archived_at))
            .collect();
        let count = historical.len() as u64;
        self.staged.push(StagedOp::Archive(historical));
        Ok(count)
    }

    async fn purge_stale(
        &mut self,
        expired_cutoff: NaiveDate,
        stale_cutoff: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let candidates = {
            let tables = self.tables.read();
            tables
                .live
                .values()
                .filter(|stored| {
                    stored.record.expiration_date >= expired_cutoff
                        && stored.record.updated_at < stale_cutoff
                })
                .count() as u64
        };
        self.staged.push(StagedOp::PurgeStale {
            expired_cutoff,
            stale_cutoff,
        });
        Ok(candidates)
    }

    async fn maintenance_row(&mut self, job_name: &str) -> StoreResult<Option<MaintenanceRow>> {
        let tables = self.tables.read();
        Ok(tables.maintenance.get(job_name).cloned())
    }

    async fn record_maintenance(
        &mut self,
        job_name: &str,
        ran_at: DateTime<Utc>,
        period_key: Option<&str>,
    ) -> StoreResult<()> {
        self.staged.push(StagedOp::Maintenance(MaintenanceRow {
            job_name: job_name.to_string(),
            last_run_at: ran_at,
            period_key: period_key.map(|key| key.to_string()),
        }));
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> StoreResult<()> {
        let staged = std::mem::take(&mut self.staged);
        let mut tables = self.tables.write();
        for op in staged {
            Self::apply(&mut tables, op);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }
}
