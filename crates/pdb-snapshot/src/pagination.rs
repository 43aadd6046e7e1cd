// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `limit`/`skip` pagination over a [`PageSource`].
//!
//! The upstream never reports a total, so a page shorter than `limit` is the
//! only end-of-data signal. A page of exactly `limit` rows always leads to
//! another request, even if the following page turns out to be empty.
//!
//! Each page is handed to the [`PageHandler`] and its future is awaited
//! before the next page is requested; at most one page is held at a time.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::config::PaginationConfig;
use crate::error::SnapshotError;
use crate::source::PageSource;

/// Position of one page inside a single `fetch_all` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCursor {
    pub skip: usize,
    pub limit: usize,
    pub page: usize,
}

#[async_trait]
pub trait PageHandler: Send {
    async fn handle_page(&mut self, rows: Vec<Value>, cursor: PageCursor)
        -> Result<(), SnapshotError>;
}

/// Totals of one completed `fetch_all` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchSummary {
    pub pages: usize,
    pub rows: usize,
}

#[derive(Clone)]
pub struct PaginatedFetcher {
    source: Arc<dyn PageSource>,
    config: PaginationConfig,
}

impl PaginatedFetcher {
    pub fn new(source: Arc<dyn PageSource>, config: PaginationConfig) -> Self {
        Self { source, config }
    }

    /// Walks every page of `object`, passing `fixed_params` plus `limit` and
    /// `skip` on each request.
    pub async fn fetch_all<H>(
        &self,
        object: &str,
        fixed_params: &[(String, String)],
        handler: &mut H,
    ) -> Result<FetchSummary, SnapshotError>
    where
        H: PageHandler + ?Sized,
    {
        let limit = self.config.limit.max(1);
        let mut cursor = PageCursor {
            skip: 0,
            limit,
            page: 0,
        };
        let mut summary = FetchSummary::default();

        loop {
            let params = page_params(fixed_params, &cursor);
            let response = self
                .source
                .get(object, &params)
                .await
                .map_err(|source| SnapshotError::Transport {
                    object: object.to_string(),
                    source,
                })?;

            if !response.is_success() {
                return Err(SnapshotError::UpstreamStatus {
                    object: object.to_string(),
                    status: response.status.as_u16(),
                    message: response
                        .error_message()
                        .unwrap_or_else(|| format!("HTTP {}", response.status.as_u16())),
                });
            }

            let rows = extract_rows(object, response.json())?;
            let row_count = rows.len();
            debug!(
                "{object}: page {} returned {row_count} rows (skip={})",
                cursor.page, cursor.skip
            );

            handler.handle_page(rows, cursor).await?;
            summary.pages += 1;
            summary.rows += row_count;

            if row_count < limit {
                return Ok(summary);
            }

            cursor.page += 1;
            if cursor.page >= self.config.max_pages {
                return Err(SnapshotError::PaginationExhausted {
                    object: object.to_string(),
                    max_pages: self.config.max_pages,
                });
            }
            cursor.skip += limit;

            if !self.config.page_delay.is_zero() {
                tokio::time::sleep(self.config.page_delay).await;
            }
        }
    }
}

fn page_params(fixed_params: &[(String, String)], cursor: &PageCursor) -> Vec<(String, String)> {
    let mut params: Vec<(String, String)> = fixed_params
        .iter()
        .filter(|(name, _)| name != "limit" && name != "skip")
        .cloned()
        .collect();
    params.push(("limit".to_string(), cursor.limit.to_string()));
    params.push(("skip".to_string(), cursor.skip.to_string()));
    params
}

fn extract_rows(object: &str, body: Option<Value>) -> Result<Vec<Value>, SnapshotError> {
    let invalid = |reason: &str| SnapshotError::InvalidResponse {
        object: object.to_string(),
        reason: reason.to_string(),
    };
    let Some(Value::Object(mut body)) = body else {
        return Err(invalid("body is not a JSON object"));
    };
    match body.remove("data") {
        Some(Value::Array(rows)) => Ok(rows),
        Some(_) => Err(invalid("`data` is not an array")),
        None => Err(invalid("missing `data` field")),
    }
}
