// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Maintenance triggers. Each trigger is idempotent per period: a cheap
//! process-local pre-filter in front of the engine's persisted guard. Every
//! lifecycle error is caught and logged here; maintenance must never crash
//! request-serving code.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Datelike, Duration, Local, NaiveDate, Timelike, Utc, Weekday};
use core_types::status::{OverallStatus, ServiceStatusHandle};
use log::{error, info};
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::{LifecycleEngine, MaintenanceJob, MaintenanceOutcome};

/// Period key for the Saturday archival window: ISO year + ISO week + month.
pub fn week_key(date: NaiveDate) -> String {
    let iso = date.iso_week();
    format!("{}-W{:02}-{:02}", iso.year(), iso.week(), date.month())
}

pub struct MaintenanceScheduler {
    engine: Arc<LifecycleEngine>,
    last_stale_cleanup_at: RwLock<Option<DateTime<Utc>>>,
    last_archival_week_key: RwLock<Option<String>>,
    status: ServiceStatusHandle,
}

impl MaintenanceScheduler {
    pub fn new(engine: Arc<LifecycleEngine>) -> Self {
        let status = ServiceStatusHandle::new("maintenance_scheduler");
        status.set_overall(OverallStatus::Ok);
        Self {
            engine,
            last_stale_cleanup_at: RwLock::new(None),
            last_archival_week_key: RwLock::new(None),
            status,
        }
    }

    pub fn status_handle(&self) -> ServiceStatusHandle {
        self.status.clone()
    }

    /// Run the stale cleanup at most once per rolling 24-hour window.
    pub async fn run_daily_cleanup_if_due(&self) {
        self.daily_tick(Utc::now()).await;
    }

    /// Run the archival pass only inside the Saturday 08:00-08:59 local
    /// window, at most once per week key.
    pub async fn run_weekly_archival_if_due(&self) {
        self.weekly_tick(Local::now()).await;
    }

    pub async fn daily_tick(&self, now: DateTime<Utc>) -> Option<MaintenanceOutcome> {
        if let Some(last) = *self.last_stale_cleanup_at.read() {
            if now - last < Duration::hours(24) {
                return None;
            }
        }
        match self
            .engine
            .run_guarded(MaintenanceJob::DailyCleanup, now, None)
            .await
        {
            Ok(outcome) => {
                if let MaintenanceOutcome::Completed(stats) = outcome {
                    *self.last_stale_cleanup_at.write() = Some(now);
                    info!(
                        "daily cleanup done: archived={} purged={}",
                        stats.archived, stats.purged
                    );
                }
                self.note_success();
                Some(outcome)
            }
            Err(err) => {
                self.note_failure("daily cleanup", &err.to_string());
                None
            }
        }
    }

    pub async fn weekly_tick(&self, now_local: DateTime<Local>) -> Option<MaintenanceOutcome> {
        if now_local.weekday() != Weekday::Sat || now_local.hour() != 8 {
            return None;
        }
        let key = week_key(now_local.date_naive());
        if self.last_archival_week_key.read().as_deref() == Some(key.as_str()) {
            return None;
        }
        match self
            .engine
            .run_guarded(
                MaintenanceJob::WeeklyArchival,
                now_local.with_timezone(&Utc),
                Some(&key),
            )
            .await
        {
            Ok(outcome) => {
                // Completed or skipped, this key is covered now.
                *self.last_archival_week_key.write() = Some(key);
                if let MaintenanceOutcome::Completed(stats) = outcome {
                    info!(
                        "saturday archival done: archived={} purged={}",
                        stats.archived, stats.purged
                    );
                }
                self.note_success();
                Some(outcome)
            }
            Err(err) => {
                self.note_failure("saturday archival", &err.to_string());
                None
            }
        }
    }

    /// Drive both triggers from one recurring timer.
    pub fn spawn(self: Arc<Self>, tick: StdDuration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                self.run_daily_cleanup_if_due().await;
                self.run_weekly_archival_if_due().await;
            }
        })
    }

    fn note_success(&self) {
        self.status.clear_errors_matching(|_| true);
        self.status.set_overall(OverallStatus::Ok);
    }

    fn note_failure(&self, job: &str, detail: &str) {
        error!("{} failed: {}", job, detail);
        self.status.set_overall(OverallStatus::Warn);
        self.status.clear_errors_matching(|_| true);
        self.status.push_error(format!("{} failed: {}", job, detail));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SkipReason;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use contract_store::{
        ContractStore, LiveSummary, MemoryContractStore, StoreError, StoreResult, StoreTx,
    };
    use core_types::config::LifecycleConfig;
    use core_types::types::{
        ContractRecord, HistoricalContractRecord, OptionType, StoredContract,
    };
    use rust_decimal::Decimal;

    fn expired_contract(now: DateTime<Utc>) -> ContractRecord {
        ContractRecord {
            symbol: "SPY".to_string(),
            expiration_date: (now - Duration::days(8)).date_naive(),
            strike: Decimal::new(450_00, 2),
            option_type: OptionType::Call,
            bid: Decimal::new(1_40, 2),
            ask: Decimal::new(1_60, 2),
            last: Decimal::new(1_50, 2),
            volume: 100,
            open_interest: 1_000,
            implied_volatility: None,
            delta: None,
            gamma: None,
            theta: None,
            vega: None,
            updated_at: now,
        }
    }

    async fn seed_expired(store: &MemoryContractStore, now: DateTime<Utc>) {
        let mut tx = store.begin().await.unwrap();
        tx.upsert_batch(&[expired_contract(now)]).await.unwrap();
        tx.commit().await.unwrap();
    }

    fn scheduler_over(store: Arc<MemoryContractStore>) -> MaintenanceScheduler {
        let engine = Arc::new(LifecycleEngine::new(store, &LifecycleConfig::default()));
        MaintenanceScheduler::new(engine)
    }

    fn local(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Local> {
        Local
            .from_local_datetime(
                &NaiveDate::from_ymd_opt(y, m, d)
                    .unwrap()
                    .and_hms_opt(h, min, 0)
                    .unwrap(),
            )
            .single()
            .unwrap()
    }

    #[test]
    fn week_key_is_stable_and_distinct_across_weeks() {
        // 2025-06-07 is a Saturday in ISO week 23.
        let saturday = NaiveDate::from_ymd_opt(2025, 6, 7).unwrap();
        assert_eq!(saturday.weekday(), Weekday::Sat);
        assert_eq!(week_key(saturday), "2025-W23-06");
        let next_saturday = saturday + Duration::days(7);
        assert_ne!(week_key(saturday), week_key(next_saturday));
    }

    #[tokio::test]
    async fn daily_trigger_runs_once_per_rolling_window() {
        let store = Arc::new(MemoryContractStore::new());
        let now = Utc::now();
        seed_expired(&store, now).await;
        let scheduler = scheduler_over(store.clone());

        let first = scheduler.daily_tick(now).await;
        assert!(matches!(first, Some(MaintenanceOutcome::Completed(_))));
        assert_eq!(store.historical_contracts("SPY").await.unwrap().len(), 1);

        // Second call inside the window is pre-filtered locally.
        let second = scheduler.daily_tick(now + Duration::hours(23)).await;
        assert!(second.is_none());

        let third = scheduler.daily_tick(now + Duration::hours(25)).await;
        assert!(matches!(third, Some(MaintenanceOutcome::Completed(_))));
    }

    #[tokio::test]
    async fn weekly_trigger_ignores_times_outside_the_window() {
        let store = Arc::new(MemoryContractStore::new());
        let scheduler = scheduler_over(store.clone());

        // Saturday at 09:30: wrong hour.
        assert!(scheduler.weekly_tick(local(2025, 6, 7, 9, 30)).await.is_none());
        // Tuesday at 08:30: wrong day.
        assert!(scheduler.weekly_tick(local(2025, 6, 3, 8, 30)).await.is_none());

        let mut tx = store.begin().await.unwrap();
        assert!(tx.maintenance_row("saturday_archival").await.unwrap().is_none());
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn weekly_trigger_runs_once_per_week_key() {
        let store = Arc::new(MemoryContractStore::new());
        let scheduler = scheduler_over(store.clone());

        let first = scheduler.weekly_tick(local(2025, 6, 7, 8, 15)).await;
        assert!(matches!(first, Some(MaintenanceOutcome::Completed(_))));

        // Same Saturday 08:xx window, same key: local guard short-circuits.
        let second = scheduler.weekly_tick(local(2025, 6, 7, 8, 45)).await;
        assert!(second.is_none());

        // A restarted scheduler has no local state; the persisted guard
        // still covers the key.
        let restarted = scheduler_over(store.clone());
        let third = restarted.weekly_tick(local(2025, 6, 7, 8, 50)).await;
        assert_eq!(
            third,
            Some(MaintenanceOutcome::Skipped(SkipReason::PeriodAlreadyCovered))
        );

        let next_week = restarted.weekly_tick(local(2025, 6, 14, 8, 10)).await;
        assert!(matches!(next_week, Some(MaintenanceOutcome::Completed(_))));
    }

    struct FailingStore;

    #[async_trait]
    impl ContractStore for FailingStore {
        async fn begin(&self) -> StoreResult<Box<dyn StoreTx>> {
            Err(StoreError::Unavailable("database down".to_string()))
        }

        async fn live_contracts(
            &self,
            _symbol: &str,
            _expiration: Option<NaiveDate>,
        ) -> StoreResult<Vec<StoredContract>> {
            Err(StoreError::Unavailable("database down".to_string()))
        }

        async fn clear_live(&self, _symbol: &str) -> StoreResult<u64> {
            Err(StoreError::Unavailable("database down".to_string()))
        }

        async fn historical_contracts(
            &self,
            _symbol: &str,
        ) -> StoreResult<Vec<HistoricalContractRecord>> {
            Err(StoreError::Unavailable("database down".to_string()))
        }

        async fn live_summary(&self) -> StoreResult<LiveSummary> {
            Err(StoreError::Unavailable("database down".to_string()))
        }
    }

    #[tokio::test]
    async fn lifecycle_failures_are_swallowed_and_logged() {
        let engine = Arc::new(LifecycleEngine::new(
            Arc::new(FailingStore),
            &LifecycleConfig::default(),
        ));
        let scheduler = MaintenanceScheduler::new(engine);

        let outcome = scheduler.daily_tick(Utc::now()).await;
        assert!(outcome.is_none());
        assert_eq!(scheduler.status_handle().overall(), OverallStatus::Warn);

        let outcome = scheduler.weekly_tick(local(2025, 6, 7, 8, 5)).await;
        assert!(outcome.is_none());
    }
}
