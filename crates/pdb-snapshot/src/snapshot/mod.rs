// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Monthly snapshot orchestration.
//!
//! A run moves `NOT_STARTED -> RUNNING -> {COMPLETE, ERROR}`. Both skip
//! guards (last day of month, existing ledger row) are read-only; nothing is
//! written before the run enters RUNNING. Once RUNNING, any failure marks
//! the ledger row `error` on a best-effort basis and the original failure is
//! returned to the caller.
//!
//! Two invocations for the same date racing past the existing-row guard will
//! both harvest. Triggers are operator-controlled and rare, so this check
//! then act window is accepted rather than locked.

use std::fs::File;
use std::io::BufWriter;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info};

use crate::aggregator::{count_network_type, count_org_country, Aggregator, OrgNetworkCounts};
use crate::archive::{ScratchDir, StreamingArchiveWriter};
use crate::blob::{sink_from_config, BlobBody, BlobSink};
use crate::config::SnapshotConfig;
use crate::error::{SetupError, SnapshotError};
use crate::ledger::{AggregateTable, RunLedger, SledLedger, SnapshotRun};
use crate::pagination::{PageCursor, PageHandler, PaginatedFetcher};
use crate::source::{PageSource, PeeringDbClient};


pub const NET_OBJECT: &str = "net";
pub const ORG_OBJECT: &str = "org";

const GZIP_CONTENT_TYPE: &str = "application/gzip";
const JSON_CONTENT_TYPE: &str = "application/json";

/// Calendar date of `now` in `tz`; the key of a snapshot run.
pub fn snapshot_date(now: DateTime<Utc>, tz: Tz) -> NaiveDate {
    now.with_timezone(&tz).date_naive()
}

/// True when `now + 24h` falls in another month of `tz`.
pub fn is_last_day_of_month(now: DateTime<Utc>, tz: Tz) -> bool {
    let today = snapshot_date(now, tz);
    let tomorrow = snapshot_date(now + chrono::Duration::hours(24), tz);
    (today.year(), today.month()) != (tomorrow.year(), tomorrow.month())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    #[serde(rename = "Not last day of month")]
    NotLastDayOfMonth,
    #[serde(rename = "Snapshot already exists")]
    AlreadyExists,
}

/// Result reported to the job runner and the trigger endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotOutcome {
    pub ok: bool,
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<SkipReason>,
    pub snapshot_date: NaiveDate,
    pub timezone: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub net_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub org_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blob_prefix: Option<String>,
}

impl SnapshotOutcome {
    fn skipped(snapshot_date: NaiveDate, tz: Tz, reason: SkipReason) -> Self {
        Self {
            ok: true,
            skipped: true,
            reason: Some(reason),
            snapshot_date,
            timezone: tz.name().to_string(),
            net_count: None,
            org_count: None,
            blob_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ManifestFiles {
    pub net: String,
    pub org: String,
}

/// `manifest.json` published next to the archives.
#[derive(Debug, Clone, Serialize)]
pub struct Manifest {
    pub snapshot_date: NaiveDate,
    pub generated_at: DateTime<Utc>,
    pub timezone: String,
    pub net_count: u64,
    pub org_count: u64,
    pub files: ManifestFiles,
}

/// Counts produced by one successful harvest.
struct Harvest {
    net_count: u64,
    org_count: u64,
    blob_prefix: String,
}

type FileArchive = StreamingArchiveWriter<BufWriter<File>>;

/// Network pass: archives every record, tallies `info_type` and builds the
/// per-organization network counts used by the organization pass.
struct NetworkPass {
    archive: FileArchive,
    types: Aggregator,
    orgs: OrgNetworkCounts,
}

#[async_trait]
impl PageHandler for NetworkPass {
    async fn handle_page(
        &mut self,
        rows: Vec<Value>,
        _cursor: PageCursor,
    ) -> Result<(), SnapshotError> {
        for row in &rows {
            self.archive
                .write(row)
                .map_err(SnapshotError::archive(NET_OBJECT, "write"))?;
            count_network_type(&mut self.types, row);
            self.orgs.record_network(row);
        }
        Ok(())
    }
}

struct OrganizationPass {
    archive: FileArchive,
    countries: Aggregator,
    orgs: OrgNetworkCounts,
}

#[async_trait]
impl PageHandler for OrganizationPass {
    async fn handle_page(
        &mut self,
        rows: Vec<Value>,
        _cursor: PageCursor,
    ) -> Result<(), SnapshotError> {
        for row in &rows {
            self.archive
                .write(row)
                .map_err(SnapshotError::archive(ORG_OBJECT, "write"))?;
            count_org_country(&mut self.countries, &self.orgs, row);
        }
        Ok(())
    }
}

pub struct SnapshotOrchestrator {
    config: Arc<SnapshotConfig>,
    fetcher: PaginatedFetcher,
    ledger: Arc<dyn RunLedger>,
    blobs: Arc<dyn BlobSink>,
}

impl SnapshotOrchestrator {
    pub fn new(
        config: Arc<SnapshotConfig>,
        source: Arc<dyn PageSource>,
        ledger: Arc<dyn RunLedger>,
        blobs: Arc<dyn BlobSink>,
    ) -> Self {
        let fetcher = PaginatedFetcher::new(source, config.pagination);
        Self {
            config,
            fetcher,
            ledger,
            blobs,
        }
    }

    /// Wires the PeeringDB client, the sled ledger at `config.ledger_path`
    /// and the configured blob sink.
    pub fn from_config(config: SnapshotConfig) -> Result<Self, SetupError> {
        let source = PeeringDbClient::from_config(&config)?;
        let ledger = SledLedger::open(&config.ledger_path)?;
        let blobs: Arc<dyn BlobSink> = Arc::from(sink_from_config(&config)?);
        Ok(Self::new(
            Arc::new(config),
            Arc::new(source),
            Arc::new(ledger),
            blobs,
        ))
    }

    /// Runs (or skips) the snapshot for the date of `now`.
    pub async fn run(
        &self,
        force: bool,
        now: DateTime<Utc>,
    ) -> Result<SnapshotOutcome, SnapshotError> {
        let tz = self.config.timezone;
        let date = snapshot_date(now, tz);

        if !force && !is_last_day_of_month(now, tz) {
            info!(
                "snapshot {date}: skipped, not the last day of the month in {}",
                tz.name()
            );
            return Ok(SnapshotOutcome::skipped(date, tz, SkipReason::NotLastDayOfMonth));
        }

        let existing = self
            .ledger
            .get_run(date)
            .await
            .map_err(SnapshotError::ledger("get_run"))?;
        if let Some(existing) = existing {
            if !force {
                info!(
                    "snapshot {date}: skipped, run already recorded with status {}",
                    existing.status.as_str()
                );
                return Ok(SnapshotOutcome::skipped(date, tz, SkipReason::AlreadyExists));
            }
            info!(
                "snapshot {date}: forced re-run over status {}",
                existing.status.as_str()
            );
        }

        let running = SnapshotRun::running(date, now);
        self.ledger
            .upsert_run(&running)
            .await
            .map_err(SnapshotError::ledger("upsert_run"))?;
        info!("snapshot {date}: running");

        let result = match self.config.run_timeout {
            Some(limit) => tokio::time::timeout(limit, self.harvest(&running, now))
                .await
                .unwrap_or_else(|_| Err(SnapshotError::TimedOut(limit))),
            None => self.harvest(&running, now).await,
        };

        match result {
            Ok(harvest) => {
                info!(
                    "snapshot {date}: complete with {} networks and {} organizations under {}",
                    harvest.net_count, harvest.org_count, harvest.blob_prefix
                );
                Ok(SnapshotOutcome {
                    ok: true,
                    skipped: false,
                    reason: None,
                    snapshot_date: date,
                    timezone: tz.name().to_string(),
                    net_count: Some(harvest.net_count),
                    org_count: Some(harvest.org_count),
                    blob_prefix: Some(harvest.blob_prefix),
                })
            }
            Err(err) => {
                error!("snapshot {date}: failed: {err}");
                let failed = running.failed(Utc::now());
                if let Err(bookkeeping) = self.ledger.upsert_run(&failed).await {
                    error!("snapshot {date}: could not record error status: {bookkeeping}");
                }
                Err(err)
            }
        }
    }

    /// Everything between entering RUNNING and the `complete` row.
    async fn harvest(
        &self,
        running: &SnapshotRun,
        now: DateTime<Utc>,
    ) -> Result<Harvest, SnapshotError> {
        let date = running.snapshot_date;
        self.ledger
            .clear_aggregates(date)
            .await
            .map_err(SnapshotError::ledger("clear_aggregates"))?;

        let scratch = ScratchDir::new_in(&self.config.work_dir)
            .map_err(SnapshotError::archive(NET_OBJECT, "create scratch dir"))?;
        let net_path = scratch.file("net.jsonl.gz");
        let org_path = scratch.file("org.jsonl.gz");

        let mut network_pass = NetworkPass {
            archive: StreamingArchiveWriter::create(&net_path)
                .map_err(SnapshotError::archive(NET_OBJECT, "create"))?,
            types: Aggregator::new(),
            orgs: OrgNetworkCounts::default(),
        };
        let fetched = self
            .fetcher
            .fetch_all(NET_OBJECT, &[], &mut network_pass)
            .await?;
        let NetworkPass {
            archive,
            types,
            orgs,
        } = network_pass;
        let (_, net_count) = archive
            .close()
            .map_err(SnapshotError::archive(NET_OBJECT, "close"))?;
        info!(
            "snapshot {date}: fetched {net_count} networks in {} pages, {} organizations referenced",
            fetched.pages,
            orgs.len()
        );

        let mut organization_pass = OrganizationPass {
            archive: StreamingArchiveWriter::create(&org_path)
                .map_err(SnapshotError::archive(ORG_OBJECT, "create"))?,
            countries: Aggregator::new(),
            orgs,
        };
        let fetched = self
            .fetcher
            .fetch_all(ORG_OBJECT, &[], &mut organization_pass)
            .await?;
        let OrganizationPass {
            archive, countries, ..
        } = organization_pass;
        let (_, org_count) = archive
            .close()
            .map_err(SnapshotError::archive(ORG_OBJECT, "close"))?;
        info!(
            "snapshot {date}: fetched {org_count} organizations in {} pages",
            fetched.pages
        );

        let blob_prefix = blob_prefix(&self.config.blob_prefix, date);
        let net_url = self
            .upload(
                format!("{blob_prefix}/net.jsonl.gz"),
                BlobBody::File(net_path),
                GZIP_CONTENT_TYPE,
            )
            .await?;
        let org_url = self
            .upload(
                format!("{blob_prefix}/org.jsonl.gz"),
                BlobBody::File(org_path),
                GZIP_CONTENT_TYPE,
            )
            .await?;

        let manifest = Manifest {
            snapshot_date: date,
            generated_at: now,
            timezone: self.config.timezone.name().to_string(),
            net_count,
            org_count,
            files: ManifestFiles {
                net: net_url,
                org: org_url,
            },
        };
        let manifest = Bytes::from(serde_json::to_vec_pretty(&manifest)?);
        self.upload(
            format!("{blob_prefix}/manifest.json"),
            BlobBody::Bytes(manifest),
            JSON_CONTENT_TYPE,
        )
        .await?;
        drop(scratch);

        self.ledger
            .insert_counts(AggregateTable::NetworkTypes, date, &types.snapshot())
            .await
            .map_err(SnapshotError::ledger("insert_counts"))?;
        self.ledger
            .insert_counts(AggregateTable::OriginCountries, date, &countries.snapshot())
            .await
            .map_err(SnapshotError::ledger("insert_counts"))?;

        let complete = running
            .clone()
            .complete(Utc::now(), net_count, org_count, blob_prefix.clone());
        self.ledger
            .upsert_run(&complete)
            .await
            .map_err(SnapshotError::ledger("upsert_run"))?;

        Ok(Harvest {
            net_count,
            org_count,
            blob_prefix,
        })
    }

    async fn upload(
        &self,
        path: String,
        body: BlobBody,
        content_type: &str,
    ) -> Result<String, SnapshotError> {
        match self.blobs.put(&path, body, content_type).await {
            Ok(url) => Ok(url),
            Err(source) => Err(SnapshotError::Blob { path, source }),
        }
    }
}

fn blob_prefix(root: &str, date: NaiveDate) -> String {
    let date = date.format("%Y-%m-%d");
    if root.is_empty() {
        date.to_string()
    } else {
        format!("{root}/{date}")
    }
}
