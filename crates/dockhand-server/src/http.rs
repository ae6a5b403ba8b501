use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, Path, Query, Request, State};
use axum::http::header::{self, HeaderName, HeaderValue};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use dockhand_core::{CommandRejection, RingMessage, RingSubscription, StaleRun, UnknownRequest};
use dockhand_observability::{emit_event, ObservabilityEvent, ProcessKind};
use dockhand_runtime::JobStore;
use dockhand_types::{
    codes, ActiveRunEnvelope, ErrorEnvelope, EventsMetaResponse, HealthResponse, JobStatus,
    JobStreamEvent, SubmitJobRequest, SubmitJobResponse,
};
use futures::Stream;
use serde::Deserialize;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::Level;

use crate::AppState;

const TOKEN_HEADER: &str = "x-dockhand-token";
const RUN_ID_HEADER: &str = "x-dockhand-run-id";
const MAX_RUN_ID_LEN: usize = 128;
const SSE_KEEPALIVE: Duration = Duration::from_secs(15);

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorEnvelope,
}

impl ApiError {
    fn new(status: StatusCode, error: impl Into<String>, code: &str) -> Self {
        Self {
            status,
            body: ErrorEnvelope::new(error, code),
        }
    }

    fn bad_request(error: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, error, codes::INVALID_REQUEST)
    }

    fn job_not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "Not found", codes::JOB_NOT_FOUND)
    }

    fn unauthorized() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "Unauthorized: missing or invalid API token",
            codes::AUTH_REQUIRED,
        )
    }

    fn rate_limited(retry_after_ms: u64) -> Self {
        let mut err = Self::new(
            StatusCode::TOO_MANY_REQUESTS,
            "Too many requests",
            codes::RATE_LIMITED,
        );
        err.body.retry_after_ms = Some(retry_after_ms);
        err
    }
}

impl From<CommandRejection> for ApiError {
    fn from(rejection: CommandRejection) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            rejection.to_string(),
            codes::COMMAND_REJECTED,
        )
    }
}

impl From<StaleRun> for ApiError {
    fn from(stale: StaleRun) -> Self {
        let mut err = Self::new(StatusCode::CONFLICT, stale.to_string(), codes::STALE_RUN);
        err.body.active_run_id = stale.active;
        err
    }
}

impl From<UnknownRequest> for ApiError {
    fn from(unknown: UnknownRequest) -> Self {
        Self::new(StatusCode::CONFLICT, unknown.to_string(), codes::STALE_REQUEST)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let supervisor = state.supervisor.clone();
    let app = app_router(state);
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "dockhand server listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
        }
    })
    .await?;
    supervisor.shutdown();
    Ok(())
}

pub fn app_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.cors_origin);

    Router::new()
        .route("/health", get(health))
        .route("/v1/run", post(submit_run))
        .route("/v1/run/active", get(active_run))
        .route("/v1/jobs/{id}", get(job_status))
        .route("/v1/jobs/{id}/events", get(job_events))
        .route("/v1/jobs/{id}/events/meta", get(job_events_meta))
        .layer(middleware::from_fn_with_state(state.clone(), auth_gate))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit_gate))
        .layer(cors)
        .with_state(state)
}

fn cors_layer(origin: &str) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static(TOKEN_HEADER),
        ])
        .expose_headers([HeaderName::from_static(RUN_ID_HEADER)]);
    if origin.trim() == "*" {
        return layer.allow_origin(Any);
    }
    match HeaderValue::from_str(origin.trim()) {
        Ok(value) => layer.allow_origin(AllowOrigin::exact(value)),
        Err(_) => {
            tracing::warn!(origin, "CORS_ORIGIN is not a valid header value; cross-origin requests will be refused");
            layer
        }
    }
}

fn is_exempt(request: &Request) -> bool {
    request.method() == Method::OPTIONS || request.uri().path() == "/health"
}

async fn auth_gate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if is_exempt(&request) {
        return next.run(request).await;
    }
    let Some(expected) = state.api_token() else {
        return next.run(request).await;
    };
    if extract_request_token(request.headers()).as_deref() == Some(expected) {
        return next.run(request).await;
    }
    emit_event(
        Level::WARN,
        ProcessKind::Engine,
        ObservabilityEvent::new("http", "auth.rejected")
            .error_code(codes::AUTH_REQUIRED)
            .detail(request.uri().path()),
    );
    ApiError::unauthorized().into_response()
}

async fn rate_limit_gate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if is_exempt(&request) {
        return next.run(request).await;
    }
    let key = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "local".to_string());
    match state.rate_limiter.check(&key) {
        Ok(()) => next.run(request).await,
        Err(retry_after_ms) => {
            tracing::warn!(client = %key, retry_after_ms, "rate limit exceeded");
            ApiError::rate_limited(retry_after_ms).into_response()
        }
    }
}

fn extract_request_token(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = headers
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return Some(token.to_string());
    }

    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())?;
    let trimmed = auth.trim();
    let bearer = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?;
    Some(bearer.trim().to_string()).filter(|token| !token.is_empty())
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let supervisor = state.supervisor.health();
    Json(HealthResponse {
        ok: true,
        hostname: hostname(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        queue_depth: supervisor.queue_depth,
        running_jobs: supervisor.running_jobs,
        workers: supervisor.workers,
        succeeded_total: supervisor.succeeded_total,
        failed_total: supervisor.failed_total,
        rejected_total: supervisor.rejected_total,
        retained_jobs: state.supervisor.store().counts().await,
        active_run_id: state.runs.active_run_id().await,
        auth_required: state.api_token().is_some(),
        uptime_ms: crate::now_ms().saturating_sub(state.started_at_ms),
    })
}

async fn submit_run(
    State(state): State<AppState>,
    payload: Result<Json<SubmitJobRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(input) = payload.map_err(|err| ApiError::bad_request(err.body_text()))?;
    let requested_run_id = input
        .run_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty());
    if let Some(run_id) = requested_run_id.as_deref() {
        if run_id.len() > MAX_RUN_ID_LEN || run_id.chars().any(char::is_control) {
            return Err(ApiError::bad_request("runId is malformed"));
        }
    }

    let (job, run_id, superseded) = {
        let _submissions = state.lock_submissions().await;
        let job = state.supervisor.submit(&input.command).await?;
        let run_id = requested_run_id.unwrap_or_else(|| job.id.clone());
        let superseded = state
            .runs
            .set_active_run(run_id.clone(), Some(job.id.clone()))
            .await;
        (job, run_id, superseded)
    };
    emit_event(
        Level::INFO,
        ProcessKind::Engine,
        ObservabilityEvent::new("http", "run.activated")
            .job(&job.id)
            .run(Some(run_id.as_str()))
            .detail(
                superseded
                    .as_ref()
                    .map(|run| run.run_id.as_str())
                    .unwrap_or(""),
            ),
    );

    let body = SubmitJobResponse {
        status_url: format!("/v1/jobs/{}", job.id),
        events_url: format!("/v1/jobs/{}/events", job.id),
        events_meta_url: format!("/v1/jobs/{}/events/meta", job.id),
        job_id: job.id,
        run_id: run_id.clone(),
    };
    let mut response = (StatusCode::ACCEPTED, Json(body)).into_response();
    if let Ok(value) = HeaderValue::from_str(&run_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(RUN_ID_HEADER), value);
    }
    Ok(response)
}

async fn active_run(State(state): State<AppState>) -> Json<ActiveRunEnvelope> {
    Json(ActiveRunEnvelope {
        active: state.runs.active_run().await,
    })
}

async fn job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let snapshot = state
        .store()
        .snapshot(&id, state.config.status_tail_lines)
        .await
        .ok_or_else(ApiError::job_not_found)?;
    Ok(Json(snapshot).into_response())
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventsQuery {
    run_id: Option<String>,
    request_id: Option<String>,
}

async fn job_events_meta(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<EventsMetaResponse>, ApiError> {
    let record = state
        .store()
        .get(&id)
        .await
        .ok_or_else(ApiError::job_not_found)?;
    state.runs.check(query.run_id.as_deref()).await?;
    let issued = state.runs.issue_request(&id).await;
    Ok(Json(EventsMetaResponse {
        job_id: id,
        run_id: state.runs.active_run_id().await,
        request_id: issued.request_id,
        job_status: record.status,
        expires_at_ms: issued.expires_at_ms,
    }))
}

async fn job_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Response, ApiError> {
    let ring = state
        .store()
        .ring(&id)
        .await
        .ok_or_else(ApiError::job_not_found)?;
    if let Err(stale) = state.runs.check(query.run_id.as_deref()).await {
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent::new("http", "events.stale_run")
                .job(&id)
                .run(query.run_id.as_deref())
                .request(query.request_id.as_deref())
                .error_code(codes::STALE_RUN),
        );
        return Err(stale.into());
    }
    if let Some(request_id) = query.request_id.as_deref() {
        state.runs.redeem_request(request_id, &id).await?;
    }

    let subscription = ring.subscribe();
    let status = state
        .store()
        .get(&id)
        .await
        .map(|record| record.status)
        .unwrap_or(JobStatus::Failed);
    tracing::debug!(
        job_id = %id,
        subscriber = subscription.id(),
        backlog = subscription.backlog.len(),
        "events subscriber attached"
    );
    let stream = job_event_stream(
        state.store().clone(),
        id,
        query.request_id,
        status,
        subscription,
    );
    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(SSE_KEEPALIVE))
        .into_response())
}

fn sse_event(event: &JobStreamEvent) -> Event {
    Event::default().data(serde_json::to_string(event).unwrap_or_default())
}

/// Connected marker, buffered history, live lines, then the completion
/// marker. The subscription lives inside the stream, so a client
/// disconnect unregisters it.
fn job_event_stream(
    store: JobStore,
    job_id: String,
    request_id: Option<String>,
    status: JobStatus,
    mut subscription: RingSubscription,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        yield Ok(sse_event(&JobStreamEvent::connected(request_id.clone(), status)));
        for line in std::mem::take(&mut subscription.backlog) {
            yield Ok(sse_event(&JobStreamEvent::line(line)));
        }

        let mut terminal = subscription.closed;
        while terminal.is_none() {
            match subscription.recv().await {
                Some(RingMessage::Line(line)) => {
                    yield Ok(sse_event(&JobStreamEvent::line(line)));
                }
                Some(RingMessage::Closed(done)) => terminal = Some(done),
                None => break,
            }
        }
        drop(subscription);

        let final_state = match terminal {
            Some(done) => Some((done.status, done.exit_code)),
            None => store
                .get(&job_id)
                .await
                .filter(|record| record.is_terminal())
                .map(|record| (record.status, record.exit_code)),
        };
        if let Some((status, exit_code)) = final_state {
            yield Ok(sse_event(&JobStreamEvent::complete(request_id.clone(), status, exit_code)));
        }
    }
}
