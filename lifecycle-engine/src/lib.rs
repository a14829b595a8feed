// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Contract lifecycle maintenance: moves expired contracts into the
//! historical archive and purges stale quotes, all inside one transaction
//! holding the global cleanup lock.

mod scheduler;

pub use scheduler::MaintenanceScheduler;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use contract_store::{ContractStore, StoreError, StoreTx};
use core_types::config::LifecycleConfig;
use core_types::lock::{derive_lock_id, GLOBAL_CLEANUP_LOCK, SATURDAY_ARCHIVAL_LOCK};
use core_types::status::{ServiceStatusHandle, StatusGauge};
use log::info;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Maintenance jobs with a persisted period guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceJob {
    DailyCleanup,
    WeeklyArchival,
}

impl MaintenanceJob {
    pub fn job_name(&self) -> &'static str {
        match self {
            MaintenanceJob::DailyCleanup => "stale_cleanup",
            MaintenanceJob::WeeklyArchival => "saturday_archival",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupStats {
    pub archived: u64,
    pub purged: u64,
    pub remaining_rows: u64,
    pub distinct_symbols: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The persisted guard shows a run inside the rolling 24-hour window.
    RanWithinWindow,
    /// The persisted guard already covers this period key.
    PeriodAlreadyCovered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceOutcome {
    Completed(CleanupStats),
    Skipped(SkipReason),
}

pub struct LifecycleEngine {
    store: Arc<dyn ContractStore>,
    expired_after_days: i64,
    stale_after_days: i64,
    status: ServiceStatusHandle,
}

impl LifecycleEngine {
    pub fn new(store: Arc<dyn ContractStore>, config: &LifecycleConfig) -> Self {
        Self {
            store,
            expired_after_days: config.expired_after_days,
            stale_after_days: config.stale_after_days,
            status: ServiceStatusHandle::new("contract_lifecycle"),
        }
    }

    pub fn status_handle(&self) -> ServiceStatusHandle {
        self.status.clone()
    }

    /// Archive expired contracts and purge stale quotes, unguarded. Direct
    /// invocations still serialize on the global cleanup lock.
    pub async fn archive_expired_and_cleanup(&self) -> Result<CleanupStats, LifecycleError> {
        self.archive_expired_and_cleanup_at(Utc::now()).await
    }

    pub async fn archive_expired_and_cleanup_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<CleanupStats, LifecycleError> {
        let mut tx = self.store.begin().await?;
        tx.acquire_lock(derive_lock_id(GLOBAL_CLEANUP_LOCK)).await?;
        let (archived, purged) = self.cleanup_in_tx(tx.as_mut(), now).await?;
        tx.commit().await?;
        self.finish(archived, purged).await
    }

    /// Guarded run used by the scheduler: reads the persisted "last run" row
    /// for the job inside the locked transaction, skips when the period is
    /// already covered, and records the run in the same transaction so the
    /// guard survives restarts and coordinates concurrent instances.
    pub async fn run_guarded(
        &self,
        job: MaintenanceJob,
        now: DateTime<Utc>,
        period_key: Option<&str>,
    ) -> Result<MaintenanceOutcome, LifecycleError> {
        let mut tx = self.store.begin().await?;
        if job == MaintenanceJob::WeeklyArchival {
            tx.acquire_lock(derive_lock_id(SATURDAY_ARCHIVAL_LOCK))
                .await?;
        }
        tx.acquire_lock(derive_lock_id(GLOBAL_CLEANUP_LOCK)).await?;

        if let Some(row) = tx.maintenance_row(job.job_name()).await? {
            let skip = match job {
                MaintenanceJob::DailyCleanup => {
                    (now - row.last_run_at < Duration::hours(24)).then_some(SkipReason::RanWithinWindow)
                }
                MaintenanceJob::WeeklyArchival => (period_key.is_some()
                    && row.period_key.as_deref() == period_key)
                    .then_some(SkipReason::PeriodAlreadyCovered),
            };
            if let Some(reason) = skip {
                tx.rollback().await?;
                return Ok(MaintenanceOutcome::Skipped(reason));
            }
        }

        let (archived, purged) = self.cleanup_in_tx(tx.as_mut(), now).await?;
        tx.record_maintenance(job.job_name(), now, period_key)
            .await?;
        tx.commit().await?;
        let stats = self.finish(archived, purged).await?;
        Ok(MaintenanceOutcome::Completed(stats))
    }

    async fn cleanup_in_tx(
        &self,
        tx: &mut dyn StoreTx,
        now: DateTime<Utc>,
    ) -> Result<(u64, u64), StoreError> {
        let today = now.date_naive();
        let expired_cutoff = today - Duration::days(self.expired_after_days);
        let expired = tx.select_expired(expired_cutoff).await?;
        let archived = if expired.is_empty() {
            0
        } else {
            tx.archive_rows(&expired, now).await?
        };
        let stale_cutoff = now - Duration::days(self.stale_after_days);
        let purged = tx.purge_stale(expired_cutoff, stale_cutoff).await?;
        Ok((archived, purged))
    }

    async fn finish(&self, archived: u64, purged: u64) -> Result<CleanupStats, LifecycleError> {
        let summary = self.store.live_summary().await?;
        let stats = CleanupStats {
            archived,
            purged,
            remaining_rows: summary.rows,
            distinct_symbols: summary.distinct_symbols,
        };
        info!(
            "lifecycle pass complete: archived={} purged={} remaining_rows={} distinct_symbols={}",
            stats.archived, stats.purged, stats.remaining_rows, stats.distinct_symbols
        );
        self.status.set_gauges(vec![
            StatusGauge {
                label: "live_rows".to_string(),
                value: stats.remaining_rows as f64,
                max: None,
                unit: Some("rows".to_string()),
                details: None,
            },
            StatusGauge {
                label: "distinct_symbols".to_string(),
                value: stats.distinct_symbols as f64,
                max: None,
                unit: Some("symbols".to_string()),
                details: None,
            },
        ]);
        Ok(stats)
    }
}
