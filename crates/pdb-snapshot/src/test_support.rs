// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fakes shared by the unit tests of this crate.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::NaiveDate;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde_json::{json, Value};

use crate::blob::{BlobBody, BlobError, BlobSink};
use crate::error::SnapshotError;
use crate::http::{HttpError, HttpResponse};
use crate::ledger::{AggregateTable, LedgerError, RunLedger, RunStatus, SledLedger, SnapshotRun};
use crate::pagination::{PageCursor, PageHandler};
use crate::source::{PageSource, QueryParams};

/// `n` minimal records with sequential ids.
pub(crate) fn rows(n: usize) -> Vec<Value> {
    (0..n).map(|id| json!({ "id": id })).collect()
}

pub(crate) fn response(status: u16, body: &str) -> HttpResponse {
    HttpResponse {
        status: StatusCode::from_u16(status).unwrap(),
        headers: HeaderMap::new(),
        body: Bytes::from(body.to_string()),
    }
}

enum Scripted {
    Response(HttpResponse),
    TransportError,
}

/// Page source answering from per-object queues. An exhausted queue answers
/// with an empty page.
#[derive(Default)]
pub(crate) struct ScriptedSource {
    queues: Mutex<HashMap<String, VecDeque<Scripted>>>,
    requests: Mutex<Vec<(String, QueryParams)>>,
    delay: Option<Duration>,
}

impl ScriptedSource {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    fn push(&self, object: &str, item: Scripted) {
        self.queues
            .lock()
            .unwrap()
            .entry(object.to_string())
            .or_default()
            .push_back(item);
    }

    pub(crate) fn push_rows(&self, object: &str, rows: Vec<Value>) {
        let body = json!({ "data": rows }).to_string();
        self.push(object, Scripted::Response(response(200, &body)));
    }

    /// One page per entry, each holding that many records.
    pub(crate) fn push_pages(&self, object: &str, sizes: &[usize]) {
        for size in sizes {
            self.push_rows(object, rows(*size));
        }
    }

    pub(crate) fn push_json(&self, object: &str, status: u16, body: &str) {
        self.push(object, Scripted::Response(response(status, body)));
    }

    pub(crate) fn push_transport_error(&self, object: &str) {
        self.push(object, Scripted::TransportError);
    }

    pub(crate) fn requests(&self, object: &str) -> Vec<QueryParams> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == object)
            .map(|(_, params)| params.clone())
            .collect()
    }

    pub(crate) fn total_requests(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl PageSource for ScriptedSource {
    async fn get(
        &self,
        object: &str,
        params: &[(String, String)],
    ) -> Result<HttpResponse, HttpError> {
        self.requests
            .lock()
            .unwrap()
            .push((object.to_string(), params.to_vec()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self
            .queues
            .lock()
            .unwrap()
            .get_mut(object)
            .and_then(VecDeque::pop_front);
        match next {
            Some(Scripted::Response(response)) => Ok(response),
            Some(Scripted::TransportError) => Err(HttpError::BudgetExhausted(Duration::ZERO)),
            None => Ok(response(200, r#"{"data":[]}"#)),
        }
    }
}

/// Records page sizes and cursors. With `observed_requests` set it also
/// records how many requests the source had seen when each page arrived.
#[derive(Default)]
pub(crate) struct RecordingHandler {
    pub(crate) pages: Vec<(usize, PageCursor)>,
    pub(crate) observed_requests: Option<Arc<ScriptedSource>>,
    pub(crate) requests_seen: Vec<usize>,
}

#[async_trait]
impl PageHandler for RecordingHandler {
    async fn handle_page(
        &mut self,
        rows: Vec<Value>,
        cursor: PageCursor,
    ) -> Result<(), SnapshotError> {
        if let Some(source) = &self.observed_requests {
            self.requests_seen.push(source.total_requests());
        }
        tokio::task::yield_now().await;
        self.pages.push((rows.len(), cursor));
        Ok(())
    }
}

fn injected(what: &str) -> LedgerError {
    LedgerError::Io(io::Error::new(io::ErrorKind::Other, format!("injected {what} failure")))
}

/// Temporary sled ledger that logs every call and can fail on demand.
pub(crate) struct RecordingLedger {
    inner: SledLedger,
    calls: Mutex<Vec<String>>,
    fail_upsert: Mutex<Option<RunStatus>>,
    fail_insert: Mutex<bool>,
}

impl RecordingLedger {
    pub(crate) fn new() -> Self {
        Self {
            inner: SledLedger::temporary().unwrap(),
            calls: Mutex::new(Vec::new()),
            fail_upsert: Mutex::new(None),
            fail_insert: Mutex::new(false),
        }
    }

    /// Makes `upsert_run` fail for rows in `status`.
    pub(crate) fn fail_upsert_of(&self, status: RunStatus) {
        *self.fail_upsert.lock().unwrap() = Some(status);
    }

    pub(crate) fn fail_inserts(&self) {
        *self.fail_insert.lock().unwrap() = true;
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl RunLedger for RecordingLedger {
    async fn get_run(&self, date: NaiveDate) -> Result<Option<SnapshotRun>, LedgerError> {
        self.record("get_run".to_string());
        self.inner.get_run(date).await
    }

    async fn upsert_run(&self, run: &SnapshotRun) -> Result<(), LedgerError> {
        self.record(format!("upsert_run:{}", run.status.as_str()));
        if *self.fail_upsert.lock().unwrap() == Some(run.status) {
            return Err(injected("upsert"));
        }
        self.inner.upsert_run(run).await
    }

    async fn clear_aggregates(&self, date: NaiveDate) -> Result<(), LedgerError> {
        self.record("clear_aggregates".to_string());
        self.inner.clear_aggregates(date).await
    }

    async fn insert_counts(
        &self,
        table: AggregateTable,
        date: NaiveDate,
        counts: &BTreeMap<String, u64>,
    ) -> Result<(), LedgerError> {
        self.record(format!("insert_counts:{}", table.tree_name()));
        if *self.fail_insert.lock().unwrap() {
            return Err(injected("insert"));
        }
        self.inner.insert_counts(table, date, counts).await
    }

    async fn counts(
        &self,
        table: AggregateTable,
        date: NaiveDate,
    ) -> Result<BTreeMap<String, u64>, LedgerError> {
        self.inner.counts(table, date).await
    }
}

/// Keeps uploads in memory. Paths ending in `fail_suffix` are rejected.
#[derive(Default)]
pub(crate) struct MemoryBlobSink {
    objects: Mutex<BTreeMap<String, (Bytes, String)>>,
    fail_suffix: Option<String>,
}

impl MemoryBlobSink {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn failing_on(suffix: &str) -> Self {
        Self {
            fail_suffix: Some(suffix.to_string()),
            ..Self::default()
        }
    }

    pub(crate) fn paths(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub(crate) fn get(&self, path: &str) -> Option<(Bytes, String)> {
        self.objects.lock().unwrap().get(path).cloned()
    }
}

#[async_trait]
impl BlobSink for MemoryBlobSink {
    async fn put(
        &self,
        path: &str,
        body: BlobBody,
        content_type: &str,
    ) -> Result<String, BlobError> {
        if let Some(suffix) = &self.fail_suffix {
            if path.ends_with(suffix.as_str()) {
                return Err(BlobError::Rejected {
                    status: 503,
                    body: "injected upload failure".to_string(),
                });
            }
        }
        let bytes = match body {
            BlobBody::File(file) => Bytes::from(tokio::fs::read(file).await?),
            BlobBody::Bytes(bytes) => bytes,
        };
        self.objects
            .lock()
            .unwrap()
            .insert(path.to_string(), (bytes, content_type.to_string()));
        Ok(format!("memory://{path}"))
    }
}
