mod common;

use std::time::Duration;

use axum::http::StatusCode;
use common::{StreamSpec, TestServer, expected_output, job_config};
use hlsgrab_engine::config::DEFAULT_USER_AGENT;
use hlsgrab_engine::{BatchConfig, BatchManifest, BatchOrchestrator, BatchReport, JobStatus};
use tokio_util::sync::CancellationToken;

fn batch_config(output_dir: &std::path::Path, job_concurrency: usize) -> BatchConfig {
    BatchConfig {
        job_concurrency,
        output_dir: output_dir.to_path_buf(),
        job: job_config(),
    }
}

fn manifest_json(links: &[serde_json::Value]) -> String {
    serde_json::json!({
        "timestamp": "2025-03-09T07:05:01Z",
        "count": links.len(),
        "links": links,
    })
    .to_string()
}

#[tokio::test]
async fn failed_entry_does_not_affect_siblings() {
    let server = TestServer::start().await;
    let a = server.add_stream("a", StreamSpec::plain(5));
    let b = server.add_stream(
        "b",
        StreamSpec {
            manifest_status: Some(StatusCode::NOT_FOUND),
            ..StreamSpec::plain(5)
        },
    );
    let c = server.add_stream("c", StreamSpec::plain(7));
    let out = tempfile::tempdir().unwrap();

    let manifest = BatchManifest::from_json_str(
        &manifest_json(&[
            serde_json::json!({ "url": a }),
            serde_json::json!({ "url": b }),
            serde_json::json!({ "url": c }),
        ]),
        "test",
    )
    .unwrap();
    let orchestrator = BatchOrchestrator::new(batch_config(out.path(), 2)).unwrap();
    let report = orchestrator.run(manifest).await;

    assert_eq!(report.total, 3);
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.failed, 1);
    assert!(!report.all_succeeded());

    let failed = &report.results[1];
    assert_eq!(failed.status, JobStatus::Failed);
    let error = failed.error.as_deref().unwrap();
    assert!(error.contains("failed to fetch manifest"), "{error}");
    assert!(error.contains("404"), "{error}");

    for (result, (name, segments)) in [&report.results[0], &report.results[2]]
        .into_iter()
        .zip([("a", 5), ("c", 7)])
    {
        assert_eq!(result.status, JobStatus::Completed);
        assert_eq!(result.segments_total, Some(segments));
        assert!(result.missing_segments.is_empty());
        let output = result.output_file.as_ref().unwrap();
        assert_eq!(
            tokio::fs::read(output).await.unwrap(),
            expected_output(name, segments)
        );
        assert!(result.duration.is_some());
    }
}

#[tokio::test]
async fn results_follow_manifest_order() {
    let server = TestServer::start().await;
    let urls: Vec<String> = [300u64, 150, 0]
        .into_iter()
        .enumerate()
        .map(|(i, delay)| {
            server.add_stream(
                &format!("order{i}"),
                StreamSpec {
                    manifest_delay: Duration::from_millis(delay),
                    ..StreamSpec::plain(2)
                },
            )
        })
        .collect();
    let out = tempfile::tempdir().unwrap();

    let manifest = BatchManifest::from(
        urls.iter()
            .map(hlsgrab_engine::ManifestEntry::from_url)
            .collect::<Vec<_>>(),
    );
    let report = BatchOrchestrator::new(batch_config(out.path(), 3))
        .unwrap()
        .run(manifest)
        .await;

    let reported: Vec<&str> = report.results.iter().map(|r| r.url.as_str()).collect();
    assert_eq!(reported, urls.iter().map(String::as_str).collect::<Vec<_>>());
    for (i, result) in report.results.iter().enumerate() {
        assert_eq!(result.index, i);
        assert_eq!(result.status, JobStatus::Completed);
    }
}

#[tokio::test]
async fn captured_identity_is_replayed_on_every_request() {
    let server = TestServer::start().await;
    let captured = server.add_stream("captured", StreamSpec::encrypted(3, [7; 16]));
    let bare = server.add_stream("bare", StreamSpec::plain(2));
    let out = tempfile::tempdir().unwrap();

    let manifest = BatchManifest::from_json_str(
        &manifest_json(&[
            serde_json::json!({
                "url": captured,
                "domain": "video.example.com",
                "pageTitle": "Episode 1",
                "headers": {
                    "userAgent": "CaptureAgent/1.0",
                    "referer": "https://video.example.com/watch/1",
                    "origin": "https://video.example.com",
                    "cookie": "sid=abc; theme=dark"
                },
                "securityHeaders": {
                    "secFetchSite": "cross-site",
                    "secFetchMode": "no-cors",
                    "secFetchDest": "video"
                }
            }),
            serde_json::json!({ "url": bare }),
        ]),
        "test",
    )
    .unwrap();
    let report = BatchOrchestrator::new(batch_config(out.path(), 2))
        .unwrap()
        .run(manifest)
        .await;
    assert!(report.all_succeeded(), "{:?}", report.results);
    assert_eq!(report.results[0].domain, "video.example.com");
    assert_eq!(report.results[0].page_title.as_deref(), Some("Episode 1"));

    for path in ["/captured/index.m3u8", "/captured/key.bin", "/captured/seg2.ts"] {
        let headers = server.last_headers(path).unwrap();
        assert_eq!(headers["user-agent"], "CaptureAgent/1.0", "{path}");
        assert_eq!(headers["referer"], "https://video.example.com/watch/1", "{path}");
        assert_eq!(headers["origin"], "https://video.example.com", "{path}");
        assert_eq!(headers["cookie"], "sid=abc; theme=dark", "{path}");
        assert_eq!(headers["sec-fetch-site"], "cross-site", "{path}");
        assert_eq!(headers["sec-fetch-dest"], "video", "{path}");
    }
    assert_eq!(server.count("/captured/key.bin"), 1);

    let headers = server.last_headers("/bare/seg0.ts").unwrap();
    assert_eq!(headers["user-agent"], DEFAULT_USER_AGENT);
    assert_eq!(headers["sec-fetch-mode"], "cors");
    assert!(headers.get("cookie").is_none());
    let bare_dir = bare.trim_end_matches("index.m3u8");
    assert_eq!(headers["referer"], bare_dir);
    assert!(bare_dir.ends_with("/bare/"));
}

#[tokio::test]
async fn configured_identity_fills_gaps_in_capture() {
    let server = TestServer::start().await;
    let url = server.add_stream("configured", StreamSpec::plain(2));
    let out = tempfile::tempdir().unwrap();

    let mut config = batch_config(out.path(), 1);
    config.job.headers.user_agent = "Configured/3.0".to_string();
    config.job.headers.referer = Some("https://portal.example.com/".to_string());
    let report = BatchOrchestrator::new(config).unwrap().run_single(&url).await;
    assert!(report.all_succeeded(), "{:?}", report.results);

    for path in ["/configured/index.m3u8", "/configured/seg1.ts"] {
        let headers = server.last_headers(path).unwrap();
        assert_eq!(headers["user-agent"], "Configured/3.0", "{path}");
        assert_eq!(headers["referer"], "https://portal.example.com/", "{path}");
    }
}

#[tokio::test]
async fn duplicate_urls_run_one_after_another() {
    let server = TestServer::start().await;
    let url = server.add_stream(
        "dup",
        StreamSpec {
            segment_delay: Duration::from_millis(20),
            ..StreamSpec::plain(6)
        },
    );
    let out = tempfile::tempdir().unwrap();

    let manifest = BatchManifest::from(vec![
        hlsgrab_engine::ManifestEntry::from_url(&url),
        hlsgrab_engine::ManifestEntry::from_url(&url),
    ]);
    let report = BatchOrchestrator::new(batch_config(out.path(), 2))
        .unwrap()
        .run(manifest)
        .await;

    assert!(report.all_succeeded(), "{:?}", report.results);
    let (first, second) = (&report.results[0], &report.results[1]);
    assert_eq!(first.output_dir, second.output_dir);
    let (a_start, a_end) = (first.start_time.unwrap(), first.end_time.unwrap());
    let (b_start, b_end) = (second.start_time.unwrap(), second.end_time.unwrap());
    assert!(a_end <= b_start || b_end <= a_start, "jobs overlapped");
    for result in &report.results {
        let output = result.output_file.as_ref().unwrap();
        assert_eq!(tokio::fs::read(output).await.unwrap(), expected_output("dup", 6));
    }
    // the first job cleans up, so the second downloads everything again
    for index in 0..6 {
        assert_eq!(server.segment_count("dup", index), 2, "segment {index}");
    }
}

#[tokio::test]
async fn report_is_written_next_to_downloads() {
    let server = TestServer::start().await;
    let url = server.add_stream("report", StreamSpec::plain(2));
    let out = tempfile::tempdir().unwrap();

    let config = batch_config(out.path(), 1);
    let orchestrator = BatchOrchestrator::new(config.clone()).unwrap();
    let report = orchestrator.run_single(&url).await;
    let path = report.write_to(&config.output_dir).await.unwrap();

    let loaded: BatchReport =
        serde_json::from_slice(&tokio::fs::read(&path).await.unwrap()).unwrap();
    assert_eq!(loaded.total, 1);
    assert_eq!(loaded.succeeded, 1);
    assert_eq!(loaded.settings.max_concurrent_videos, 1);
    assert_eq!(loaded.settings.max_workers_per_video, 4);
    assert_eq!(loaded.results[0].url, url);
    assert_eq!(loaded.results[0].status, JobStatus::Completed);
}

#[tokio::test]
async fn cancellation_fails_running_jobs() {
    let server = TestServer::start().await;
    let url = server.add_stream(
        "slow",
        StreamSpec {
            segment_delay: Duration::from_secs(30),
            ..StreamSpec::plain(4)
        },
    );
    let out = tempfile::tempdir().unwrap();

    let token = CancellationToken::new();
    let orchestrator = BatchOrchestrator::new(batch_config(out.path(), 1))
        .unwrap()
        .with_cancellation(token.clone());

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        token.cancel();
    });
    let report = tokio::time::timeout(Duration::from_secs(10), orchestrator.run_single(&url))
        .await
        .unwrap();
    canceller.await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(report.results[0].error.as_deref(), Some("operation cancelled"));
}
