// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io::{BufRead, BufReader};
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, TimeZone, Utc};
use flate2::read::GzDecoder;
use mockito::{Matcher, Mock, Server, ServerGuard};
use serde_json::{json, Value};

use pdb_snapshot::{
    AggregateTable, LocalFsBlobSink, PeeringDbClient, RetryConfig, RetryingHttpClient, RunLedger,
    RunStatus, SkipReason, SledLedger, SnapshotConfig, SnapshotOrchestrator,
};

async fn page(server: &mut ServerGuard, object: &str, skip: &str, rows: Value) -> Mock {
    server
        .mock("GET", format!("/api/{object}").as_str())
        .match_header("authorization", "Api-Key integration-key")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("limit".into(), "2".into()),
            Matcher::UrlEncoded("skip".into(), skip.into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({ "meta": {}, "data": rows }).to_string())
        .expect(1)
        .create_async()
        .await
}

fn read_archive(path: &std::path::Path) -> Vec<Value> {
    let file = std::fs::File::open(path).unwrap();
    BufReader::new(GzDecoder::new(file))
        .lines()
        .map(|line| serde_json::from_str(&line.unwrap()).unwrap())
        .collect()
}

#[tokio::test]
async fn test_monthly_harvest_end_to_end() {
    let mut server = Server::new_async().await;
    let mocks = vec![
        page(
            &mut server,
            "net",
            "0",
            json!([
                {"id": 1, "org_id": 10, "info_type": "NSP", "name": "Net One"},
                {"id": 2, "org_id": 10, "info_type": "Content", "name": "Net Two"},
            ]),
        )
        .await,
        page(
            &mut server,
            "net",
            "2",
            json!([{"id": 3, "org_id": 20, "info_type": "", "name": "Net Three"}]),
        )
        .await,
        page(
            &mut server,
            "org",
            "0",
            json!([
                {"id": 10, "country": "SG", "name": "Org Ten"},
                {"id": 20, "country": "US", "name": "Org Twenty"},
            ]),
        )
        .await,
        page(&mut server, "org", "2", json!([])).await,
    ];

    let work_dir = tempfile::tempdir().unwrap();
    let blob_root = tempfile::tempdir().unwrap();
    let ledger_dir = tempfile::tempdir().unwrap();

    let mut config = SnapshotConfig::new("integration-key");
    config.base_url = format!("{}/api", server.url());
    config.work_dir = work_dir.path().to_path_buf();
    config.pagination.limit = 2;
    config.pagination.page_delay = Duration::ZERO;
    config.retry = RetryConfig {
        max_retries: 1,
        jitter: Duration::ZERO,
        ..RetryConfig::default()
    };

    let http = RetryingHttpClient::new(config.retry).unwrap();
    let source = PeeringDbClient::new(http, config.base_url.clone(), &config.api_key).unwrap();
    let ledger = Arc::new(SledLedger::open(ledger_dir.path().join("ledger")).unwrap());
    let orchestrator = SnapshotOrchestrator::new(
        Arc::new(config),
        Arc::new(source),
        ledger.clone(),
        Arc::new(LocalFsBlobSink::new(blob_root.path())),
    );

    let now = Utc.with_ymd_and_hms(2024, 1, 31, 2, 0, 0).unwrap();
    let outcome = orchestrator.run(false, now).await.unwrap();

    assert!(!outcome.skipped);
    assert_eq!(outcome.net_count, Some(3));
    assert_eq!(outcome.org_count, Some(2));
    assert_eq!(outcome.blob_prefix.as_deref(), Some("snapshots/2024-01-31"));
    for mock in &mocks {
        mock.assert_async().await;
    }

    let snapshot_dir = blob_root.path().join("snapshots/2024-01-31");
    let nets = read_archive(&snapshot_dir.join("net.jsonl.gz"));
    assert_eq!(nets.len(), 3);
    assert_eq!(nets[2]["name"], "Net Three");
    assert_eq!(read_archive(&snapshot_dir.join("org.jsonl.gz")).len(), 2);

    let manifest: Value =
        serde_json::from_slice(&std::fs::read(snapshot_dir.join("manifest.json")).unwrap())
            .unwrap();
    assert_eq!(manifest["net_count"], 3);
    assert_eq!(manifest["org_count"], 2);
    let net_url = manifest["files"]["net"].as_str().unwrap();
    assert!(net_url.starts_with("file://"));
    assert!(net_url.ends_with("snapshots/2024-01-31/net.jsonl.gz"));

    let day = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
    let run = ledger.get_run(day).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Complete);
    assert_eq!(run.org_count, Some(2));

    let types = ledger.counts(AggregateTable::NetworkTypes, day).await.unwrap();
    assert_eq!(types.get("NSP"), Some(&1));
    assert_eq!(types.get("Content"), Some(&1));
    assert_eq!(types.get("unknown"), Some(&1));
    let countries = ledger
        .counts(AggregateTable::OriginCountries, day)
        .await
        .unwrap();
    assert_eq!(countries.get("SG"), Some(&2));
    assert_eq!(countries.get("US"), Some(&1));

    // The second trigger of the day is a no-op.
    let again = orchestrator.run(false, now).await.unwrap();
    assert!(again.skipped);
    assert_eq!(again.reason, Some(SkipReason::AlreadyExists));
    assert_eq!(std::fs::read_dir(work_dir.path()).unwrap().count(), 0);
}
