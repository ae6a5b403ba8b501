//! Single-slot record of the run a client currently cares about.
//!
//! Every submission supersedes the slot. Subscribers tagged with any other
//! run id are refused, so a reconnecting observer can never attach to a
//! stream that belongs to an older intent. The guard also hands out the
//! short-lived request ids that link an events-meta lookup to the stream
//! opened right after it.

use std::collections::HashMap;
use std::sync::Arc;

use dockhand_types::ActiveRun;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{StaleRun, UnknownRequest};
use crate::now_ms;

pub const REQUEST_ID_TTL_MS: u64 = 60_000;

#[derive(Debug, Clone)]
struct PendingRequest {
    job_id: String,
    expires_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedRequest {
    pub request_id: String,
    pub expires_at_ms: u64,
}

#[derive(Debug, Default)]
struct GuardState {
    active: Option<ActiveRun>,
    requests: HashMap<String, PendingRequest>,
}

#[derive(Debug, Clone, Default)]
pub struct RunCorrelationGuard {
    state: Arc<RwLock<GuardState>>,
}

impl RunCorrelationGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `run_id` authoritative and returns the run it replaced.
    /// Outstanding request ids belong to the replaced intent and are dropped.
    pub async fn set_active_run(&self, run_id: String, job_id: Option<String>) -> Option<ActiveRun> {
        let mut state = self.state.write().await;
        state.requests.clear();
        state.active.replace(ActiveRun {
            run_id,
            job_id,
            activated_at_ms: now_ms(),
        })
    }

    pub async fn active_run(&self) -> Option<ActiveRun> {
        self.state.read().await.active.clone()
    }

    pub async fn active_run_id(&self) -> Option<String> {
        self.state.read().await.active.as_ref().map(|run| run.run_id.clone())
    }

    pub async fn is_current(&self, run_id: &str) -> bool {
        self.state
            .read()
            .await
            .active
            .as_ref()
            .is_some_and(|run| run.run_id == run_id)
    }

    /// An absent candidate is always accepted; a present one must match the
    /// active run exactly.
    pub async fn check(&self, candidate: Option<&str>) -> Result<(), StaleRun> {
        let Some(requested) = candidate else {
            return Ok(());
        };
        let state = self.state.read().await;
        match state.active.as_ref() {
            Some(run) if run.run_id == requested => Ok(()),
            other => Err(StaleRun {
                requested: requested.to_string(),
                active: other.map(|run| run.run_id.clone()),
            }),
        }
    }

    pub async fn clear_if_match(&self, run_id: &str) -> Option<ActiveRun> {
        let mut state = self.state.write().await;
        if state.active.as_ref().is_some_and(|run| run.run_id == run_id) {
            state.requests.clear();
            return state.active.take();
        }
        None
    }

    pub async fn issue_request(&self, job_id: &str) -> IssuedRequest {
        let now = now_ms();
        let expires_at_ms = now + REQUEST_ID_TTL_MS;
        let request_id = Uuid::new_v4().to_string();
        let mut state = self.state.write().await;
        state.requests.retain(|_, pending| pending.expires_at_ms > now);
        state.requests.insert(
            request_id.clone(),
            PendingRequest {
                job_id: job_id.to_string(),
                expires_at_ms,
            },
        );
        IssuedRequest {
            request_id,
            expires_at_ms,
        }
    }

    /// Consumes a request id issued for `job_id`. Each id opens one stream.
    pub async fn redeem_request(&self, request_id: &str, job_id: &str) -> Result<(), UnknownRequest> {
        let mut state = self.state.write().await;
        match state.requests.remove(request_id) {
            Some(pending) if pending.job_id == job_id && pending.expires_at_ms > now_ms() => Ok(()),
            _ => Err(UnknownRequest(request_id.to_string())),
        }
    }
}
