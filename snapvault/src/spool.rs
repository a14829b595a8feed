// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! File-drop ingestion: snapshot arrays land in a spool directory as
//! `<symbol>.json` and are replayed into the store. Files that fail to parse
//! are quarantined; files whose ingestion fails stay in place so the next
//! pass retries them.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use core_types::types::OptionSnapshot;
use ingestion_service::IngestionService;
use log::{error, info, warn};
use tokio::task::JoinHandle;
use tokio::time::sleep;

pub struct SnapshotSpool {
    dir: PathBuf,
    poll_interval: Duration,
    ingestion: Arc<IngestionService>,
}

impl SnapshotSpool {
    pub fn new(
        dir: impl Into<PathBuf>,
        poll_interval: Duration,
        ingestion: Arc<IngestionService>,
    ) -> Self {
        let dir = dir.into();
        if let Err(err) = fs::create_dir_all(&dir) {
            error!("failed to create spool directory {:?}: {}", dir, err);
        }
        Self {
            dir,
            poll_interval,
            ingestion,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                self.process_pending().await;
                sleep(self.poll_interval).await;
            }
        })
    }

    /// Scan the spool once. Returns the number of files ingested.
    pub async fn process_pending(&self) -> usize {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) => {
                error!("failed to read spool directory {:?}: {}", self.dir, err);
                return 0;
            }
        };
        let mut processed = 0usize;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if self.process_file(&path).await {
                processed += 1;
            }
        }
        processed
    }

    async fn process_file(&self, path: &Path) -> bool {
        let Some(symbol) = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .map(|stem| stem.to_ascii_uppercase())
        else {
            warn!("spool file {:?} has no usable name", path);
            return false;
        };
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) => {
                error!("failed to read spool file {:?}: {}", path, err);
                return false;
            }
        };
        let now = Utc::now();
        let records = serde_json::from_str::<Vec<OptionSnapshot>>(&contents)
            .map_err(|err| err.to_string())
            .and_then(|snapshots| {
                snapshots
                    .into_iter()
                    .map(|snapshot| snapshot.into_record(now).map_err(|err| err.to_string()))
                    .collect::<Result<Vec<_>, _>>()
            });
        let records = match records {
            Ok(records) => records,
            Err(err) => {
                warn!("quarantining malformed spool file {:?}: {}", path, err);
                quarantine(path);
                return false;
            }
        };

        let report = self.ingestion.ingest(&symbol, records).await;
        if report.is_complete() {
            info!(
                "spool ingested {:?}: {} rows across {} expirations",
                path,
                report.rows_written(),
                report.groups.len()
            );
            if let Err(err) = fs::remove_file(path) {
                error!("failed to remove ingested spool file {:?}: {}", path, err);
            }
            true
        } else {
            // Leave the file in place; the next pass retries naturally.
            warn!(
                "spool ingestion incomplete for {:?} ({} of {} groups failed)",
                path,
                report.failures().count(),
                report.groups.len()
            );
            false
        }
    }
}

fn quarantine(path: &Path) {
    let mut target = path.as_os_str().to_owned();
    target.push(".failed");
    if let Err(err) = fs::rename(path, &target) {
        error!("failed to quarantine spool file {:?}: {}", path, err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contract_store::{ContractStore, MemoryContractStore};
    use core_types::retry::RetryPolicy;
    use tempfile::tempdir;

    fn spool_over(
        dir: &Path,
        store: Arc<MemoryContractStore>,
    ) -> (SnapshotSpool, Arc<IngestionService>) {
        let ingestion = Arc::new(IngestionService::new(store, RetryPolicy::default_ingest()));
        (
            SnapshotSpool::new(dir, Duration::from_secs(5), ingestion.clone()),
            ingestion,
        )
    }

    const SNAPSHOT_JSON: &str = r#"[
        {
            "ticker": "SPY",
            "strike": "450.00",
            "expiration_date": "2026-09-18",
            "contract_type": "call",
            "bid": "1.40",
            "ask": "1.60",
            "last": "1.50",
            "volume": 1200,
            "open_interest": 5400,
            "implied_volatility": 0.22,
            "delta": 0.45
        }
    ]"#;

    #[tokio::test]
    async fn ingests_and_removes_spooled_snapshots() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryContractStore::new());
        let (spool, _ingestion) = spool_over(dir.path(), store.clone());

        let path = dir.path().join("spy.json");
        fs::write(&path, SNAPSHOT_JSON).unwrap();

        assert_eq!(spool.process_pending().await, 1);
        assert!(!path.exists());
        assert_eq!(store.live_contracts("SPY", None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn quarantines_malformed_files() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryContractStore::new());
        let (spool, _ingestion) = spool_over(dir.path(), store.clone());

        let path = dir.path().join("spy.json");
        fs::write(&path, "{ not json ]").unwrap();

        assert_eq!(spool.process_pending().await, 0);
        assert!(!path.exists());
        assert!(dir.path().join("spy.json.failed").exists());
        assert!(store.live_contracts("SPY", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ignores_non_json_files() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryContractStore::new());
        let (spool, _ingestion) = spool_over(dir.path(), store.clone());

        fs::write(dir.path().join("notes.txt"), "nothing to see").unwrap();
        assert_eq!(spool.process_pending().await, 0);
        assert!(dir.path().join("notes.txt").exists());
    }
}
