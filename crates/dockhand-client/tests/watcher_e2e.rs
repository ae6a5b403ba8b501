use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use dockhand_client::{
    ClientError, JobWatcher, OrchestratorClient, ReconnectPolicy, WatchEvent, WatchPhase,
};
use dockhand_types::JobStatus;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

fn fast_policy() -> ReconnectPolicy {
    ReconnectPolicy {
        initial: Duration::from_millis(10),
        max: Duration::from_millis(50),
        max_attempts: 3,
    }
}

async fn spawn_router(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await;
    });
    format!("http://{addr}")
}

fn drain(mut rx: mpsc::UnboundedReceiver<WatchEvent>) -> Vec<WatchEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seen.push(event);
    }
    seen
}

fn lines(events: &[WatchEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            WatchEvent::Line(line) => Some(line.clone()),
            _ => None,
        })
        .collect()
}

fn sse_body(payloads: &[serde_json::Value]) -> String {
    payloads
        .iter()
        .map(|payload| format!("data: {payload}\n\n"))
        .collect()
}

/// Serves a first event stream that drops before completion and a second
/// that replays everything and completes.
fn flaky_stream_router(connections: Arc<AtomicUsize>) -> Router {
    async fn meta(Path(id): Path<String>, State(connections): State<Arc<AtomicUsize>>) -> impl IntoResponse {
        Json(json!({
            "jobId": id,
            "runId": "run-1",
            "requestId": format!("req-{}", connections.load(Ordering::SeqCst)),
            "jobStatus": "running",
            "expiresAtMs": 0
        }))
    }

    async fn events(State(connections): State<Arc<AtomicUsize>>) -> impl IntoResponse {
        let attempt = connections.fetch_add(1, Ordering::SeqCst);
        let connected = json!({ "type": "connected", "jobStatus": "running" });
        let body = if attempt == 0 {
            sse_body(&[connected, json!({ "line": "Pulling grafana" })])
        } else {
            sse_body(&[
                connected,
                json!({ "line": "Pulling grafana" }),
                json!({ "line": "Container grafana Started" }),
                json!({
                    "type": "complete",
                    "message": "stream complete: job succeeded",
                    "jobStatus": "succeeded",
                    "exitCode": 0
                }),
            ])
        };
        ([(header::CONTENT_TYPE, "text/event-stream")], body)
    }

    Router::new()
        .route("/v1/jobs/{id}/events/meta", get(meta))
        .route("/v1/jobs/{id}/events", get(events))
        .with_state(connections)
}

#[tokio::test]
async fn dropped_stream_reconnects_and_resets_before_replay() {
    let connections = Arc::new(AtomicUsize::new(0));
    let base = spawn_router(flaky_stream_router(connections.clone())).await;
    let client = OrchestratorClient::new(base, None).expect("client");
    let mut watcher = JobWatcher::new(client).with_policy(fast_policy());
    watcher.guard().set_active_run("run-1".to_string(), None).await;
    let (tx, rx) = mpsc::unbounded_channel();

    let outcome = watcher.watch("job-1", "run-1", &tx).await.expect("outcome");
    drop(tx);

    assert_eq!(outcome.phase, WatchPhase::Terminal);
    assert_eq!(outcome.status, Some(JobStatus::Succeeded));
    assert_eq!(outcome.exit_code, Some(0));
    assert_eq!(outcome.reconnects, 1);
    assert_eq!(connections.load(Ordering::SeqCst), 2);

    let events = drain(rx);
    let reset_at = events
        .iter()
        .position(|event| *event == WatchEvent::StreamReset)
        .expect("stream reset");
    assert_eq!(lines(&events[..reset_at]), vec!["Pulling grafana"]);
    assert_eq!(
        lines(&events[reset_at..]),
        vec!["Pulling grafana", "Container grafana Started"]
    );
    assert!(events.contains(&WatchEvent::Phase(WatchPhase::Reconnecting)));
    assert_eq!(events.last(), Some(&WatchEvent::Phase(WatchPhase::Terminal)));
}

#[tokio::test]
async fn stale_meta_ends_the_loop_without_subscribing() {
    let subscribed = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route(
            "/v1/jobs/{id}/events/meta",
            get(|| async {
                (
                    StatusCode::CONFLICT,
                    Json(json!({
                        "error": "stale run 'run-1' (active: run-2)",
                        "code": "STALE_RUN",
                        "activeRunId": "run-2"
                    })),
                )
            }),
        )
        .route(
            "/v1/jobs/{id}/events",
            get(|State(subscribed): State<Arc<AtomicUsize>>| async move {
                subscribed.fetch_add(1, Ordering::SeqCst);
                StatusCode::OK
            }),
        )
        .with_state(subscribed.clone());
    let base = spawn_router(app).await;
    let client = OrchestratorClient::new(base, None).expect("client");
    let mut watcher = JobWatcher::new(client).with_policy(fast_policy());
    watcher.guard().set_active_run("run-1".to_string(), None).await;
    let (tx, _rx) = mpsc::unbounded_channel();

    let outcome = watcher.watch("job-1", "run-1", &tx).await.expect("outcome");
    assert_eq!(outcome.phase, WatchPhase::Superseded);
    assert_eq!(outcome.reconnects, 0);
    assert_eq!(subscribed.load(Ordering::SeqCst), 0);
}

#[cfg(unix)]
mod live_server {
    use std::os::unix::fs::PermissionsExt;

    use dockhand_core::OrchestratorConfig;
    use dockhand_server::{app_router, AppState};

    use super::*;

    fn stand_in_docker(dir: &std::path::Path, body: &str) -> std::path::PathBuf {
        let path = dir.join("docker");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
        let mut perms = std::fs::metadata(&path).expect("meta").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).expect("chmod");
        path
    }

    async fn live_server(dir: &std::path::Path, script: &str, api_key: Option<&str>) -> String {
        let config = OrchestratorConfig {
            workspace_root: dir.to_path_buf(),
            program_override: Some(stand_in_docker(dir, script)),
            api_key: api_key.map(str::to_string),
            rate_limit_per_minute: 0,
            ..OrchestratorConfig::default()
        };
        spawn_router(app_router(AppState::new(config))).await
    }

    #[tokio::test]
    async fn run_follows_a_real_job_to_completion() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = live_server(
            dir.path(),
            "echo Started\necho \"Container grafana Running\"\nexit 0",
            Some("secret"),
        )
        .await;
        let client = OrchestratorClient::new(base, Some("secret")).expect("client");
        let mut watcher = JobWatcher::new(client.clone()).with_policy(fast_policy());
        let (tx, rx) = mpsc::unbounded_channel();

        let outcome = watcher
            .run("docker compose up -d grafana", &tx)
            .await
            .expect("outcome");
        drop(tx);

        assert_eq!(outcome.phase, WatchPhase::Terminal);
        assert_eq!(outcome.status, Some(JobStatus::Succeeded));
        assert_eq!(outcome.exit_code, Some(0));

        let events = drain(rx);
        let output = lines(&events);
        assert!(output.iter().any(|line| line == "Started"));
        assert!(output.iter().any(|line| line == "Container grafana Running"));
        assert!(output
            .iter()
            .any(|line| line.contains("exited with code 0")));
        assert_eq!(
            events.first(),
            Some(&WatchEvent::Phase(WatchPhase::Submitted))
        );

        let active = client.active_run().await.expect("active").expect("some run");
        assert_eq!(active.run_id, outcome.run_id);
        let snapshot = client.job_status(&outcome.job_id).await.expect("status");
        assert_eq!(snapshot.status, JobStatus::Succeeded);
        let health = client.health().await.expect("health");
        assert!(health.auth_required);
    }

    #[tokio::test]
    async fn missing_token_and_rejected_commands_are_final() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = live_server(dir.path(), "exit 0", Some("secret")).await;

        let anonymous = OrchestratorClient::new(base.clone(), None).expect("client");
        let err = anonymous
            .submit("docker compose ps", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Unauthorized(_)));
        assert!(!err.is_retryable());

        let client = OrchestratorClient::new(base, Some("secret")).expect("client");
        let err = client.submit("rm -rf /", None).await.unwrap_err();
        match err {
            ClientError::Rejected(reason) => assert!(reason.contains("docker compose")),
            other => panic!("unexpected error {other:?}"),
        }
        let err = client.job_status("no-such-job").await.unwrap_err();
        assert!(matches!(err, ClientError::NotFound));
    }

    #[tokio::test]
    async fn local_supersede_stops_an_attached_watcher() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = live_server(dir.path(), "echo Started\nsleep 5\necho late", None).await;
        let client = OrchestratorClient::new(base, None).expect("client");
        let mut watcher = JobWatcher::new(client).with_policy(fast_policy());
        let guard = watcher.guard();
        let (tx, _rx) = mpsc::unbounded_channel();

        let accepted = watcher
            .submit("docker compose logs -f", &tx)
            .await
            .expect("submit");
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            guard.set_active_run("newer-intent".to_string(), None).await;
        });

        let outcome = tokio::time::timeout(
            Duration::from_secs(3),
            watcher.watch(&accepted.job_id, &accepted.run_id, &tx),
        )
        .await
        .expect("watcher stopped before the job finished")
        .expect("outcome");
        assert_eq!(outcome.phase, WatchPhase::Superseded);
        assert_eq!(outcome.status, None);
    }

    #[tokio::test]
    async fn meta_request_ids_are_single_use() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = live_server(dir.path(), "echo Started", None).await;
        let client = OrchestratorClient::new(base, None).expect("client");
        let accepted = client
            .submit("docker compose ps", Some("run-a"))
            .await
            .expect("submit");

        let meta = client
            .events_meta(&accepted.job_id, Some("run-a"))
            .await
            .expect("meta");
        assert_eq!(meta.run_id.as_deref(), Some("run-a"));
        let first = client
            .subscribe_events(&accepted.job_id, Some("run-a"), Some(meta.request_id.as_str()))
            .await;
        assert!(first.is_ok());
        let second = client
            .subscribe_events(&accepted.job_id, Some("run-a"), Some(meta.request_id.as_str()))
            .await;
        assert!(matches!(second.err(), Some(ClientError::StaleRequest)));

        let stale = client
            .events_meta(&accepted.job_id, Some("run-old"))
            .await
            .unwrap_err();
        match stale {
            ClientError::StaleRun { requested, active } => {
                assert_eq!(requested, "run-old");
                assert_eq!(active.as_deref(), Some("run-a"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
