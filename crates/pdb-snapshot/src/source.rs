// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Upstream page source. [`PeeringDbClient`] is the production source; the
//! fetcher only depends on the [`PageSource`] trait.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION};
use reqwest::Url;
use tracing::debug;

use crate::config::SnapshotConfig;
use crate::http::{header_map, redact_headers, HttpError, HttpResponse, RetryingHttpClient};

/// Query parameters as ordered name/value pairs. Repeated names are allowed.
pub type QueryParams = Vec<(String, String)>;

#[async_trait]
pub trait PageSource: Send + Sync {
    /// Issues one GET for `object` with the given query and returns the
    /// upstream answer, successful or not.
    async fn get(&self, object: &str, params: &[(String, String)])
        -> Result<HttpResponse, HttpError>;
}

/// PeeringDB REST client: `GET {base}/{object}?{params}` with a static API key.
#[derive(Debug, Clone)]
pub struct PeeringDbClient {
    http: RetryingHttpClient,
    base_url: String,
    headers: HeaderMap,
}

impl PeeringDbClient {
    pub fn new(
        http: RetryingHttpClient,
        base_url: impl Into<String>,
        api_key: &str,
    ) -> Result<Self, HttpError> {
        let base_url = base_url.into();
        Url::parse(&base_url).map_err(|_| HttpError::InvalidUrl(base_url.clone()))?;

        let authorization = format!("Api-Key {api_key}");
        let mut pairs = vec![(ACCEPT.as_str(), "application/json")];
        if !api_key.is_empty() {
            pairs.push((AUTHORIZATION.as_str(), authorization.as_str()));
        }
        let headers = header_map(pairs)?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            headers,
        })
    }

    pub fn from_config(config: &SnapshotConfig) -> Result<Self, HttpError> {
        let http = RetryingHttpClient::new(config.retry)?;
        Self::new(http, config.base_url.clone(), &config.api_key)
    }

    /// `{base}/{object}?{params}` with the object name percent-encoded.
    pub fn build_url(&self, object: &str, params: &[(String, String)]) -> Result<Url, HttpError> {
        let mut url =
            Url::parse(&self.base_url).map_err(|_| HttpError::InvalidUrl(self.base_url.clone()))?;
        url.path_segments_mut()
            .map_err(|_| HttpError::InvalidUrl(self.base_url.clone()))?
            .pop_if_empty()
            .push(object);
        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params);
        }
        Ok(url)
    }
}

#[async_trait]
impl PageSource for PeeringDbClient {
    async fn get(
        &self,
        object: &str,
        params: &[(String, String)],
    ) -> Result<HttpResponse, HttpError> {
        let url = self.build_url(object, params)?;
        debug!(
            url = %url,
            headers = ?redact_headers(&self.headers),
            "peeringdb request"
        );
        self.http.request(url.as_str(), &self.headers).await
    }
}
