use std::time::Duration;

use dockhand_types::{
    codes, ActiveRun, ActiveRunEnvelope, ErrorEnvelope, EventsMetaResponse, HealthResponse,
    JobSnapshot, JobStreamEvent, SubmitJobRequest, SubmitJobResponse,
};
use futures::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;

use crate::error::{ClientError, Result};
use crate::sse::parse_sse_frame;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Thin typed wrapper over the orchestrator HTTP API.
#[derive(Clone)]
pub struct OrchestratorClient {
    base_url: String,
    client: Client,
    stream_client: Client,
}

fn auth_headers(api_key: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Some(key) = api_key {
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {key}")) {
            headers.insert(AUTHORIZATION, value);
        }
    }
    headers
}

impl OrchestratorClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<&str>) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let client = Client::builder()
            .default_headers(auth_headers(api_key))
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        // No overall timeout: event streams stay open for the whole job.
        let stream_client = Client::builder()
            .default_headers(auth_headers(api_key))
            .http1_only()
            .tcp_keepalive(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            base_url,
            client,
            stream_client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn health(&self) -> Result<HealthResponse> {
        let resp = self.client.get(self.url("/health")).send().await?;
        decode(resp, None).await
    }

    pub async fn submit(&self, command: &str, run_id: Option<&str>) -> Result<SubmitJobResponse> {
        let body = SubmitJobRequest {
            command: command.to_string(),
            run_id: run_id.map(str::to_string),
        };
        let resp = self
            .client
            .post(self.url("/v1/run"))
            .json(&body)
            .send()
            .await?;
        decode(resp, run_id).await
    }

    pub async fn job_status(&self, job_id: &str) -> Result<JobSnapshot> {
        let resp = self
            .client
            .get(self.url(&format!("/v1/jobs/{job_id}")))
            .send()
            .await?;
        decode(resp, None).await
    }

    pub async fn events_meta(&self, job_id: &str, run_id: Option<&str>) -> Result<EventsMetaResponse> {
        let mut req = self
            .client
            .get(self.url(&format!("/v1/jobs/{job_id}/events/meta")));
        if let Some(run_id) = run_id {
            req = req.query(&[("runId", run_id)]);
        }
        decode(req.send().await?, run_id).await
    }

    pub async fn active_run(&self) -> Result<Option<ActiveRun>> {
        let resp = self.client.get(self.url("/v1/run/active")).send().await?;
        let envelope: ActiveRunEnvelope = decode(resp, None).await?;
        Ok(envelope.active)
    }

    /// Opens the job's event stream. Keep-alive frames are skipped; a frame
    /// that does not decode ends the stream with an error.
    pub async fn subscribe_events(
        &self,
        job_id: &str,
        run_id: Option<&str>,
        request_id: Option<&str>,
    ) -> Result<impl Stream<Item = Result<JobStreamEvent>>> {
        let mut query: Vec<(&str, &str)> = Vec::new();
        if let Some(run_id) = run_id {
            query.push(("runId", run_id));
        }
        if let Some(request_id) = request_id {
            query.push(("requestId", request_id));
        }
        let resp = self
            .stream_client
            .get(self.url(&format!("/v1/jobs/{job_id}/events")))
            .header(ACCEPT, "text/event-stream")
            .query(&query)
            .send()
            .await?;
        let resp = check_status(resp, run_id).await?;
        let bytes = resp.bytes_stream();

        Ok(async_stream::stream! {
            let mut buffer = String::new();
            let mut pending: Vec<u8> = Vec::new();
            futures::pin_mut!(bytes);
            while let Some(chunk) = bytes.next().await {
                match chunk {
                    Ok(chunk) => {
                        pending.extend_from_slice(&chunk);
                        // Keep a multi-byte character split across chunks for the next read.
                        let valid = match std::str::from_utf8(&pending) {
                            Ok(_) => pending.len(),
                            Err(err) if err.error_len().is_none() => err.valid_up_to(),
                            Err(_) => pending.len(),
                        };
                        buffer.push_str(&String::from_utf8_lossy(&pending[..valid]));
                        pending.drain(..valid);
                        while let Some(frame) = parse_sse_frame(&mut buffer) {
                            let Some(data) = frame.data else { continue };
                            match serde_json::from_str::<JobStreamEvent>(&data) {
                                Ok(event) => yield Ok(event),
                                Err(err) => {
                                    yield Err(ClientError::Stream(format!("bad event payload: {err}")));
                                    return;
                                }
                            }
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "job event stream interrupted");
                        yield Err(ClientError::Stream(err.to_string()));
                        return;
                    }
                }
            }
        })
    }
}

async fn decode<T: DeserializeOwned>(resp: Response, run_id: Option<&str>) -> Result<T> {
    let resp = check_status(resp, run_id).await?;
    let bytes = resp.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Maps error statuses and their envelope codes onto `ClientError`.
async fn check_status(resp: Response, run_id: Option<&str>) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let text = resp.text().await.unwrap_or_default();
    let envelope: Option<ErrorEnvelope> = serde_json::from_str(&text).ok();
    let message = envelope
        .as_ref()
        .map(|e| e.error.clone())
        .unwrap_or_else(|| text.clone());
    let code = envelope.as_ref().and_then(|e| e.code.as_deref());

    Err(match (status, code) {
        (StatusCode::CONFLICT, Some(codes::STALE_RUN)) => ClientError::StaleRun {
            requested: run_id.unwrap_or_default().to_string(),
            active: envelope.and_then(|e| e.active_run_id),
        },
        (StatusCode::CONFLICT, Some(codes::STALE_REQUEST)) => ClientError::StaleRequest,
        (StatusCode::NOT_FOUND, _) => ClientError::NotFound,
        (StatusCode::UNAUTHORIZED, _) => ClientError::Unauthorized(message),
        (StatusCode::BAD_REQUEST, Some(codes::COMMAND_REJECTED)) => ClientError::Rejected(message),
        (StatusCode::TOO_MANY_REQUESTS, _) => ClientError::RateLimited {
            retry_after_ms: envelope.and_then(|e| e.retry_after_ms).unwrap_or(1_000),
        },
        _ => ClientError::Status {
            status: status.as_u16(),
            message,
        },
    })
}
