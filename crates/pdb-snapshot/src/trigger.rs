// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP trigger for scheduled or manual snapshot runs.
//!
//! `GET|POST /api/snapshots/run[?force=1][&secret=...]`. When a cron secret
//! is configured the caller must send `Authorization: Bearer <secret>` or the
//! `secret` query parameter. Concurrent triggers are not serialised.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header::AUTHORIZATION, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use crate::error::SnapshotError;
use crate::snapshot::{SnapshotOrchestrator, SnapshotOutcome};

pub const RUN_PATH: &str = "/api/snapshots/run";

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Clone)]
pub struct TriggerState {
    orchestrator: Arc<SnapshotOrchestrator>,
    cron_secret: Option<String>,
    clock: Clock,
}

impl TriggerState {
    pub fn new(orchestrator: Arc<SnapshotOrchestrator>, cron_secret: Option<String>) -> Self {
        Self {
            orchestrator,
            cron_secret,
            clock: Arc::new(Utc::now),
        }
    }

    /// Replaces the wall clock used to pick the snapshot date.
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    fn authorized(&self, headers: &HeaderMap, query: &TriggerQuery) -> bool {
        let Some(secret) = &self.cron_secret else {
            return true;
        };
        let bearer = headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "));
        let presented = match bearer {
            Some(token) => Some(token),
            None => query.secret.as_deref(),
        };
        presented == Some(secret.as_str())
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct TriggerQuery {
    force: Option<String>,
    secret: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("Unauthorized")]
    Unauthorized,
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

impl IntoResponse for TriggerError {
    fn into_response(self) -> Response {
        let status = match self {
            TriggerError::Unauthorized => StatusCode::UNAUTHORIZED,
            TriggerError::Snapshot(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub fn router(state: TriggerState) -> Router {
    Router::new()
        .route(RUN_PATH, get(run_snapshot).post(run_snapshot))
        .with_state(state)
}

async fn run_snapshot(
    State(state): State<TriggerState>,
    headers: HeaderMap,
    Query(query): Query<TriggerQuery>,
) -> Result<Json<SnapshotOutcome>, TriggerError> {
    if !state.authorized(&headers, &query) {
        return Err(TriggerError::Unauthorized);
    }
    let force = matches!(query.force.as_deref(), Some("1" | "true"));
    let now = (state.clock)();
    info!("trigger: snapshot requested (force={force})");

    match state.orchestrator.run(force, now).await {
        Ok(outcome) => Ok(Json(outcome)),
        Err(err) => {
            error!("trigger: snapshot run failed: {err}");
            Err(err.into())
        }
    }
}

/// Serves the trigger router on `addr` until `shutdown` resolves.
pub async fn serve(
    state: TriggerState,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("trigger: listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
