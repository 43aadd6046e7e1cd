// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use crate::blob::BlobError;
use crate::config::ConfigError;
use crate::http::HttpError;
use crate::ledger::LedgerError;

/// Failures while wiring the harvest components together at startup.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("http client setup failed: {0}")]
    Http(#[from] HttpError),
    #[error("ledger setup failed: {0}")]
    Ledger(#[from] LedgerError),
    #[error("blob sink setup failed: {0}")]
    Blob(#[from] BlobError),
}

/// Failures that end a harvest. Every variant names the object or operation
/// it happened in.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("{object} fetch failed: {source}")]
    Transport {
        object: String,
        #[source]
        source: HttpError,
    },

    #[error("{object} fetch failed with status {status}: {message}")]
    UpstreamStatus {
        object: String,
        status: u16,
        message: String,
    },

    #[error("{object} invalid response: {reason}")]
    InvalidResponse { object: String, reason: String },

    #[error("{object} pagination exceeded max_pages={max_pages}")]
    PaginationExhausted { object: String, max_pages: usize },

    #[error("{object} archive {operation} failed: {source}")]
    Archive {
        object: String,
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("blob upload of {path} failed: {source}")]
    Blob {
        path: String,
        #[source]
        source: BlobError,
    },

    #[error("ledger {operation} failed: {source}")]
    Ledger {
        operation: &'static str,
        #[source]
        source: LedgerError,
    },

    #[error("manifest serialization failed: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("snapshot run exceeded {0:?}")]
    TimedOut(Duration),
}

impl SnapshotError {
    pub(crate) fn ledger(operation: &'static str) -> impl FnOnce(LedgerError) -> Self {
        move |source| SnapshotError::Ledger { operation, source }
    }

    pub(crate) fn archive(
        object: &str,
        operation: &'static str,
    ) -> impl FnOnce(std::io::Error) -> Self {
        let object = object.to_string();
        move |source| SnapshotError::Archive {
            object,
            operation,
            source,
        }
    }
}
