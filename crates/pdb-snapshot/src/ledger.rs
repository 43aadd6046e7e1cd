// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Run bookkeeping and aggregate tables.
//!
//! [`SledLedger`] keeps three trees:
//! - `runs`: `YYYY-MM-DD` -> JSON encoded [`SnapshotRun`]
//! - `network_types`: `YYYY-MM-DD/<info_type>` -> big-endian `u64`
//! - `origin_countries`: `YYYY-MM-DD/<country>` -> big-endian `u64`

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sled::{Batch, Config as SledConfig, Db, Tree};
use thiserror::Error;
use tracing::debug;

const TREE_RUNS: &str = "runs";
const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Db(#[from] sled::Error),
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt count stored under {0:?}")]
    CorruptCount(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Complete,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Complete => "complete",
            RunStatus::Error => "error",
        }
    }
}

/// One row per snapshot date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRun {
    pub snapshot_date: NaiveDate,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub net_count: Option<u64>,
    pub org_count: Option<u64>,
    pub blob_prefix: Option<String>,
}

impl SnapshotRun {
    pub fn running(snapshot_date: NaiveDate, started_at: DateTime<Utc>) -> Self {
        Self {
            snapshot_date,
            status: RunStatus::Running,
            started_at,
            completed_at: None,
            net_count: None,
            org_count: None,
            blob_prefix: None,
        }
    }

    pub fn complete(
        self,
        completed_at: DateTime<Utc>,
        net_count: u64,
        org_count: u64,
        blob_prefix: String,
    ) -> Self {
        Self {
            status: RunStatus::Complete,
            completed_at: Some(completed_at),
            net_count: Some(net_count),
            org_count: Some(org_count),
            blob_prefix: Some(blob_prefix),
            ..self
        }
    }

    pub fn failed(self, completed_at: DateTime<Utc>) -> Self {
        Self {
            status: RunStatus::Error,
            completed_at: Some(completed_at),
            net_count: None,
            org_count: None,
            blob_prefix: None,
            ..self
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AggregateTable {
    NetworkTypes,
    OriginCountries,
}

impl AggregateTable {
    pub const ALL: [AggregateTable; 2] =
        [AggregateTable::NetworkTypes, AggregateTable::OriginCountries];

    pub fn tree_name(&self) -> &'static str {
        match self {
            AggregateTable::NetworkTypes => "network_types",
            AggregateTable::OriginCountries => "origin_countries",
        }
    }
}

#[async_trait]
pub trait RunLedger: Send + Sync {
    async fn get_run(&self, date: NaiveDate) -> Result<Option<SnapshotRun>, LedgerError>;

    /// Inserts or replaces the row for `run.snapshot_date`.
    async fn upsert_run(&self, run: &SnapshotRun) -> Result<(), LedgerError>;

    /// Removes every aggregate row of `date` from both tables.
    async fn clear_aggregates(&self, date: NaiveDate) -> Result<(), LedgerError>;

    async fn insert_counts(
        &self,
        table: AggregateTable,
        date: NaiveDate,
        counts: &BTreeMap<String, u64>,
    ) -> Result<(), LedgerError>;

    async fn counts(
        &self,
        table: AggregateTable,
        date: NaiveDate,
    ) -> Result<BTreeMap<String, u64>, LedgerError>;
}

/// sled-backed [`RunLedger`].
#[derive(Debug, Clone)]
pub struct SledLedger {
    db: Db,
    path: PathBuf,
}

impl SledLedger {
    /// Opens (or creates) the ledger database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let db = SledConfig::new()
            .path(&path)
            .cache_capacity(16 * 1024 * 1024)
            .open()?;
        debug!("ledger: opened sled database at {}", path.display());
        Ok(Self { db, path })
    }

    /// In-memory ledger, discarded on drop.
    pub fn temporary() -> Result<Self, LedgerError> {
        let db = SledConfig::new().temporary(true).open()?;
        Ok(Self {
            db,
            path: PathBuf::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn runs(&self) -> Result<Tree, LedgerError> {
        Ok(self.db.open_tree(TREE_RUNS)?)
    }

    fn aggregates(&self, table: AggregateTable) -> Result<Tree, LedgerError> {
        Ok(self.db.open_tree(table.tree_name())?)
    }
}

#[async_trait]
impl RunLedger for SledLedger {
    async fn get_run(&self, date: NaiveDate) -> Result<Option<SnapshotRun>, LedgerError> {
        let Some(bytes) = self.runs()?.get(date_key(date))? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    async fn upsert_run(&self, run: &SnapshotRun) -> Result<(), LedgerError> {
        let bytes = serde_json::to_vec(run)?;
        self.runs()?.insert(date_key(run.snapshot_date), bytes)?;
        self.db.flush()?;
        Ok(())
    }

    async fn clear_aggregates(&self, date: NaiveDate) -> Result<(), LedgerError> {
        let prefix = category_prefix(date);
        for table in AggregateTable::ALL {
            let tree = self.aggregates(table)?;
            let mut batch = Batch::default();
            for entry in tree.scan_prefix(prefix.as_bytes()) {
                let (key, _) = entry?;
                batch.remove(key);
            }
            tree.apply_batch(batch)?;
        }
        self.db.flush()?;
        Ok(())
    }

    async fn insert_counts(
        &self,
        table: AggregateTable,
        date: NaiveDate,
        counts: &BTreeMap<String, u64>,
    ) -> Result<(), LedgerError> {
        let prefix = category_prefix(date);
        let mut batch = Batch::default();
        for (category, count) in counts {
            let key = format!("{prefix}{category}");
            batch.insert(key.as_bytes(), count.to_be_bytes().as_slice());
        }
        self.aggregates(table)?.apply_batch(batch)?;
        self.db.flush()?;
        Ok(())
    }

    async fn counts(
        &self,
        table: AggregateTable,
        date: NaiveDate,
    ) -> Result<BTreeMap<String, u64>, LedgerError> {
        let prefix = category_prefix(date);
        let mut counts = BTreeMap::new();
        for entry in self.aggregates(table)?.scan_prefix(prefix.as_bytes()) {
            let (key, value) = entry?;
            let key = String::from_utf8_lossy(&key).into_owned();
            let bytes: [u8; 8] = value[..]
                .try_into()
                .map_err(|_| LedgerError::CorruptCount(key.clone()))?;
            let category = key[prefix.len()..].to_string();
            counts.insert(category, u64::from_be_bytes(bytes));
        }
        Ok(counts)
    }
}

fn date_key(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

fn category_prefix(date: NaiveDate) -> String {
    format!("{}/", date_key(date))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    fn counts(pairs: &[(&str, u64)]) -> BTreeMap<String, u64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[tokio::test]
    async fn test_run_upsert_replaces_row() {
        let ledger = SledLedger::temporary().unwrap();
        let started = Utc.with_ymd_and_hms(2024, 1, 31, 1, 0, 0).unwrap();
        assert!(ledger.get_run(date(31)).await.unwrap().is_none());

        let running = SnapshotRun::running(date(31), started);
        ledger.upsert_run(&running).await.unwrap();
        assert_eq!(ledger.get_run(date(31)).await.unwrap(), Some(running.clone()));

        let done = running.complete(started, 3, 2, "snapshots/2024-01-31".into());
        ledger.upsert_run(&done).await.unwrap();
        let stored = ledger.get_run(date(31)).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Complete);
        assert_eq!(stored.net_count, Some(3));
        assert!(ledger.get_run(date(30)).await.unwrap().is_none());
    }

    #[test]
    fn test_failed_row_drops_results() {
        let started = Utc.with_ymd_and_hms(2024, 1, 31, 1, 0, 0).unwrap();
        let finished = Utc.with_ymd_and_hms(2024, 1, 31, 2, 0, 0).unwrap();
        let run = SnapshotRun::running(date(31), started)
            .complete(started, 1, 1, "p".into())
            .failed(finished);
        assert_eq!(run.status, RunStatus::Error);
        assert_eq!(run.started_at, started);
        assert_eq!(run.completed_at, Some(finished));
        assert_eq!((run.net_count, run.org_count, run.blob_prefix), (None, None, None));
    }

    #[test]
    fn test_run_serializes_camel_case() {
        let started = Utc.with_ymd_and_hms(2024, 1, 31, 1, 0, 0).unwrap();
        let value = serde_json::to_value(SnapshotRun::running(date(31), started)).unwrap();
        assert_eq!(value["snapshotDate"], "2024-01-31");
        assert_eq!(value["status"], "running");
        assert!(value["completedAt"].is_null());
    }

    #[tokio::test]
    async fn test_clear_only_touches_one_date() {
        let ledger = SledLedger::temporary().unwrap();
        for day in [30, 31] {
            ledger
                .insert_counts(AggregateTable::NetworkTypes, date(day), &counts(&[("NSP", 4)]))
                .await
                .unwrap();
            ledger
                .insert_counts(AggregateTable::OriginCountries, date(day), &counts(&[("SG", 1)]))
                .await
                .unwrap();
        }

        ledger.clear_aggregates(date(31)).await.unwrap();

        for table in AggregateTable::ALL {
            assert!(ledger.counts(table, date(31)).await.unwrap().is_empty());
            assert_eq!(ledger.counts(table, date(30)).await.unwrap().len(), 1);
        }
    }

    #[tokio::test]
    async fn test_insert_upserts_categories() {
        let ledger = SledLedger::temporary().unwrap();
        let table = AggregateTable::NetworkTypes;
        ledger
            .insert_counts(table, date(31), &counts(&[("NSP", 1), ("Content", 2)]))
            .await
            .unwrap();
        ledger
            .insert_counts(table, date(31), &counts(&[("NSP", 9)]))
            .await
            .unwrap();
        assert_eq!(
            ledger.counts(table, date(31)).await.unwrap(),
            counts(&[("Content", 2), ("NSP", 9)])
        );
    }

    #[tokio::test]
    async fn test_categories_with_separator_round_trip() {
        let ledger = SledLedger::temporary().unwrap();
        let table = AggregateTable::NetworkTypes;
        ledger
            .insert_counts(table, date(31), &counts(&[("Cable/DSL/ISP", 7)]))
            .await
            .unwrap();
        assert_eq!(
            ledger.counts(table, date(31)).await.unwrap(),
            counts(&[("Cable/DSL/ISP", 7)])
        );
    }

    #[tokio::test]
    async fn test_corrupt_count_is_reported() {
        let ledger = SledLedger::temporary().unwrap();
        ledger
            .aggregates(AggregateTable::OriginCountries)
            .unwrap()
            .insert("2024-01-31/SG", b"x".as_slice())
            .unwrap();
        let err = ledger
            .counts(AggregateTable::OriginCountries, date(31))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::CorruptCount(key) if key == "2024-01-31/SG"));
    }

    #[tokio::test]
    async fn test_open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ledger");
        let started = Utc.with_ymd_and_hms(2024, 1, 31, 1, 0, 0).unwrap();

        let ledger = SledLedger::open(&path).unwrap();
        assert_eq!(ledger.path(), path.as_path());
        ledger
            .upsert_run(&SnapshotRun::running(date(31), started))
            .await
            .unwrap();
        assert!(path.exists());
        let run = ledger.get_run(date(31)).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Running);
    }
}
