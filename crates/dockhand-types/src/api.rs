use serde::{Deserialize, Serialize};

use crate::job::JobCounts;

/// Body of every non-2xx API response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Present on `STALE_RUN` so the caller can tell what superseded it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ErrorEnvelope {
    pub fn new(error: impl Into<String>, code: &str) -> Self {
        Self {
            error: error.into(),
            code: Some(code.to_string()),
            active_run_id: None,
            retry_after_ms: None,
        }
    }
}

pub mod codes {
    pub const AUTH_REQUIRED: &str = "AUTH_REQUIRED";
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    pub const COMMAND_REJECTED: &str = "COMMAND_REJECTED";
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const JOB_NOT_FOUND: &str = "JOB_NOT_FOUND";
    pub const STALE_RUN: &str = "STALE_RUN";
    pub const STALE_REQUEST: &str = "STALE_REQUEST";
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub ok: bool,
    pub hostname: String,
    pub version: String,
    pub queue_depth: usize,
    pub running_jobs: usize,
    pub workers: usize,
    pub succeeded_total: u64,
    pub failed_total: u64,
    pub rejected_total: u64,
    /// Jobs still retained in memory; pruned jobs are not counted.
    #[serde(default)]
    pub retained_jobs: JobCounts,
    #[serde(default)]
    pub active_run_id: Option<String>,
    pub auth_required: bool,
    pub uptime_ms: u64,
}
