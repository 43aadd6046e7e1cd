// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Blob storage for finished archives and manifests.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Body, Client, Url};
use thiserror::Error;
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::config::{BlobTarget, SnapshotConfig};

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("blob store rejected upload with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("invalid blob path {0:?}")]
    InvalidPath(String),
}

/// Payload of one upload: a file on disk (streamed) or an in-memory buffer.
#[derive(Debug, Clone)]
pub enum BlobBody {
    File(PathBuf),
    Bytes(Bytes),
}

#[async_trait]
pub trait BlobSink: Send + Sync {
    /// Stores `body` under `path`, replacing any previous object, and returns
    /// the URL it can be read from.
    async fn put(&self, path: &str, body: BlobBody, content_type: &str)
        -> Result<String, BlobError>;
}

/// Builds the sink selected by `config.blob_target`.
pub fn sink_from_config(config: &SnapshotConfig) -> Result<Box<dyn BlobSink>, BlobError> {
    Ok(match &config.blob_target {
        BlobTarget::Directory(root) => Box::new(LocalFsBlobSink::new(root.clone())),
        BlobTarget::Http { base_url, token } => Box::new(HttpBlobSink::new(
            base_url.clone(),
            token.clone(),
            config.retry.request_timeout,
        )?),
    })
}

/// Relative blob paths only; no `..`, roots or empty paths.
fn validate_path(path: &str) -> Result<(), BlobError> {
    let relative = Path::new(path);
    let valid = !path.is_empty()
        && relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    if valid {
        Ok(())
    } else {
        Err(BlobError::InvalidPath(path.to_string()))
    }
}

/// Writes blobs below a local directory.
#[derive(Debug, Clone)]
pub struct LocalFsBlobSink {
    root: PathBuf,
}

impl LocalFsBlobSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl BlobSink for LocalFsBlobSink {
    async fn put(
        &self,
        path: &str,
        body: BlobBody,
        _content_type: &str,
    ) -> Result<String, BlobError> {
        validate_path(path)?;
        let target = self.root.join(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match body {
            BlobBody::File(source) => {
                tokio::fs::copy(&source, &target).await?;
            }
            BlobBody::Bytes(bytes) => tokio::fs::write(&target, &bytes).await?,
        }

        let absolute = tokio::fs::canonicalize(&target).await?;
        let url = Url::from_file_path(&absolute)
            .map_err(|_| BlobError::InvalidPath(absolute.display().to_string()))?;
        debug!("blob: wrote {}", absolute.display());
        Ok(url.to_string())
    }
}

/// Uploads blobs with `PUT {base}/{path}` and a bearer token.
#[derive(Debug, Clone)]
pub struct HttpBlobSink {
    client: Client,
    base_url: String,
    token: String,
}

impl HttpBlobSink {
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, BlobError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url, token))
    }

    pub fn with_client(
        client: Client,
        base_url: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn object_url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }
}

#[async_trait]
impl BlobSink for HttpBlobSink {
    async fn put(
        &self,
        path: &str,
        body: BlobBody,
        content_type: &str,
    ) -> Result<String, BlobError> {
        validate_path(path)?;
        let url = self.object_url(path);
        let body = match body {
            BlobBody::File(source) => {
                let file = tokio::fs::File::open(&source).await?;
                Body::wrap_stream(ReaderStream::new(file))
            }
            BlobBody::Bytes(bytes) => Body::from(bytes),
        };

        let response = self
            .client
            .put(&url)
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .header(CONTENT_TYPE, content_type)
            .header("x-add-random-suffix", "0")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(BlobError::Rejected {
                status: status.as_u16(),
                body: text,
            });
        }

        let stored_url = serde_json::from_str::<serde_json::Value>(&text)
            .ok()
            .and_then(|value| value.get("url").and_then(|url| url.as_str()).map(str::to_string))
            .unwrap_or(url);
        debug!("blob: uploaded {path} to {stored_url}");
        Ok(stored_url)
    }
}
