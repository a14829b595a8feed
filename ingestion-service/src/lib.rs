// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Snapshot ingestion: serializes all writes for one (symbol, expiration)
//! pair inside one transaction holding that pair's advisory lock, retries
//! lock races with bounded jittered backoff, and reports per-group outcomes.

mod batch;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use contract_store::{ContractStore, StoreError};
use core_types::lock::{derive_lock_id, group_lock_key};
use core_types::retry::RetryPolicy;
use core_types::status::{OverallStatus, ServiceStatusHandle, StatusGauge};
use core_types::types::{ContractKey, ContractRecord, StoredContract};
use log::{error, info};
use thiserror::Error;

use batch::write_batches;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(
        "retries exhausted after {attempts} attempts for {symbol} {expiration}: {source}"
    )]
    RetriesExhausted {
        attempts: usize,
        symbol: String,
        expiration: NaiveDate,
        source: StoreError,
    },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Outcome of one (symbol, expiration) group transaction.
#[derive(Debug)]
pub struct GroupOutcome {
    pub expiration: NaiveDate,
    pub result: Result<u64, IngestError>,
}

/// Per-group results for one `ingest` call. A failed group never rolls back
/// groups that already committed, and never prevents later groups from
/// running; callers inspect the report (or collapse it with `into_result`).
#[derive(Debug)]
pub struct IngestReport {
    pub symbol: String,
    pub groups: Vec<GroupOutcome>,
}

impl IngestReport {
    fn empty(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            groups: Vec::new(),
        }
    }

    pub fn rows_written(&self) -> u64 {
        self.groups
            .iter()
            .filter_map(|group| group.result.as_ref().ok())
            .sum()
    }

    pub fn is_complete(&self) -> bool {
        self.groups.iter().all(|group| group.result.is_ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = (NaiveDate, &IngestError)> {
        self.groups
            .iter()
            .filter_map(|group| group.result.as_ref().err().map(|err| (group.expiration, err)))
    }

    /// First-error view for callers that want fail-fast semantics.
    pub fn into_result(self) -> Result<u64, IngestError> {
        let mut written = 0u64;
        for group in self.groups {
            written += group.result?;
        }
        Ok(written)
    }
}

pub struct IngestionService {
    store: Arc<dyn ContractStore>,
    retry: RetryPolicy,
    status: ServiceStatusHandle,
}

impl IngestionService {
    pub fn new(store: Arc<dyn ContractStore>, retry: RetryPolicy) -> Self {
        let status = ServiceStatusHandle::new("snapshot_ingestion");
        status.push_warning("no snapshots ingested yet");
        Self {
            store,
            retry,
            status,
        }
    }

    pub fn status_handle(&self) -> ServiceStatusHandle {
        self.status.clone()
    }

    /// Upsert a snapshot for one underlying. Contracts are grouped by
    /// expiration date; each group is written sequentially in its own
    /// transaction under the pair's advisory lock.
    pub async fn ingest(&self, symbol: &str, contracts: Vec<ContractRecord>) -> IngestReport {
        if contracts.is_empty() {
            return IngestReport::empty(symbol);
        }
        let now = Utc::now();
        let groups = group_by_expiration(contracts, now);
        let mut outcomes = Vec::with_capacity(groups.len());
        for (expiration, rows) in groups {
            let result = self.write_group_with_retry(symbol, expiration, &rows).await;
            match &result {
                Ok(written) => {
                    info!("ingested {} rows for {} {}", written, symbol, expiration);
                }
                Err(err) => {
                    error!("ingestion failed for {} {}: {}", symbol, expiration, err);
                }
            }
            outcomes.push(GroupOutcome { expiration, result });
        }
        let report = IngestReport {
            symbol: symbol.to_string(),
            groups: outcomes,
        };
        self.publish_status(&report);
        report
    }

    pub async fn live_contracts(
        &self,
        symbol: &str,
        expiration: Option<NaiveDate>,
    ) -> Result<Vec<StoredContract>, IngestError> {
        Ok(self.store.live_contracts(symbol, expiration).await?)
    }

    pub async fn clear_live(&self, symbol: &str) -> Result<u64, IngestError> {
        Ok(self.store.clear_live(symbol).await?)
    }

    async fn write_group_with_retry(
        &self,
        symbol: &str,
        expiration: NaiveDate,
        rows: &[ContractRecord],
    ) -> Result<u64, IngestError> {
        let lock_id = derive_lock_id(&group_lock_key(symbol, expiration));
        self.retry
            .retry_if(
                |attempt| {
                    if attempt > 0 {
                        info!(
                            "retrying {} {} after lock contention (attempt {})",
                            symbol,
                            expiration,
                            attempt + 1
                        );
                    }
                    self.write_group(lock_id, rows)
                },
                StoreError::is_lock_contention,
            )
            .await
            .map_err(|err| {
                if err.is_lock_contention() {
                    IngestError::RetriesExhausted {
                        attempts: self.retry.max_attempts,
                        symbol: symbol.to_string(),
                        expiration,
                        source: err,
                    }
                } else {
                    IngestError::Store(err)
                }
            })
    }

    /// One unit of work: a retry re-runs all of it, re-acquiring the lock.
    /// Dropping the transaction on an error path rolls it back.
    async fn write_group(&self, lock_id: i32, rows: &[ContractRecord]) -> Result<u64, StoreError> {
        let mut tx = self.store.begin().await?;
        tx.acquire_lock(lock_id).await?;
        let written = write_batches(tx.as_mut(), rows).await?;
        tx.commit().await?;
        Ok(written)
    }

    fn publish_status(&self, report: &IngestReport) {
        self.status
            .clear_warnings_matching(|msg| msg.contains("no snapshots"));
        self.status.clear_errors_matching(|_| true);
        if report.is_complete() {
            self.status.set_overall(OverallStatus::Ok);
        } else {
            self.status.set_overall(OverallStatus::Warn);
            for (expiration, err) in report.failures() {
                self.status
                    .push_error(format!("{} {}: {}", report.symbol, expiration, err));
            }
        }
        self.status.set_gauges(vec![StatusGauge {
            label: "last_rows_written".to_string(),
            value: report.rows_written() as f64,
            max: None,
            unit: Some("rows".to_string()),
            details: Some(format!(
                "{} expiration groups for {}",
                report.groups.len(),
                report.symbol
            )),
        }]);
    }
}

/// Group by expiration in ascending order, de-duplicating within each group
/// by natural key (last occurrence wins; one upsert statement cannot touch
/// the same row twice).
fn group_by_expiration(
    contracts: Vec<ContractRecord>,
    now: DateTime<Utc>,
) -> BTreeMap<NaiveDate, Vec<ContractRecord>> {
    let mut deduped: BTreeMap<NaiveDate, BTreeMap<ContractKey, ContractRecord>> = BTreeMap::new();
    for mut contract in contracts {
        contract.updated_at = now;
        deduped
            .entry(contract.expiration_date)
            .or_default()
            .insert(contract.key(), contract);
    }
    deduped
        .into_iter()
        .map(|(expiration, group)| (expiration, group.into_values().collect()))
        .collect()
}
