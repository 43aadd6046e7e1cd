// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Monthly PeeringDB snapshot harvest.
//!
//! The crate pulls every `net` and `org` record through a rate-limit aware
//! client, streams them into gzip JSON Lines archives, publishes the archives
//! with a manifest to blob storage and records run status plus aggregate
//! counts in a small ledger.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod aggregator;
pub mod archive;
pub mod blob;
pub mod config;
pub mod error;
pub mod http;
pub mod ledger;
pub mod pagination;
pub mod snapshot;
pub mod source;
pub mod trigger;

#[cfg(test)]
pub(crate) mod test_support;

pub use aggregator::{Aggregator, OrgNetworkCounts};
pub use archive::{ScratchDir, StreamingArchiveWriter};
pub use blob::{sink_from_config, BlobBody, BlobError, BlobSink, HttpBlobSink, LocalFsBlobSink};
pub use config::{BlobTarget, ConfigError, PaginationConfig, RetryConfig, SnapshotConfig};
pub use error::{SetupError, SnapshotError};
pub use http::{HttpError, HttpResponse, RetryPolicy, RetryingHttpClient};
pub use ledger::{AggregateTable, LedgerError, RunLedger, RunStatus, SledLedger, SnapshotRun};
pub use pagination::{FetchSummary, PageCursor, PageHandler, PaginatedFetcher};
pub use snapshot::{
    is_last_day_of_month, snapshot_date, Manifest, SkipReason, SnapshotOrchestrator,
    SnapshotOutcome,
};
pub use source::{PageSource, PeeringDbClient};
pub use trigger::{router, serve, TriggerState};
