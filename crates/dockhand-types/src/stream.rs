use serde::{Deserialize, Serialize};

use crate::JobStatus;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamControlKind {
    Connected,
    Complete,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StreamControl {
    #[serde(rename = "type")]
    pub kind: StreamControlKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_status: Option<JobStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// One SSE `data:` payload on a job event stream: either a raw output line
/// (`{"line": ...}`) or a structured control message (`{"type": ...}`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum JobStreamEvent {
    Line { line: String },
    Control(StreamControl),
}

impl JobStreamEvent {
    pub fn line(line: impl Into<String>) -> Self {
        JobStreamEvent::Line { line: line.into() }
    }

    pub fn connected(request_id: Option<String>, job_status: JobStatus) -> Self {
        JobStreamEvent::Control(StreamControl {
            kind: StreamControlKind::Connected,
            message: None,
            job_status: Some(job_status),
            exit_code: None,
            request_id,
        })
    }

    pub fn complete(
        request_id: Option<String>,
        job_status: JobStatus,
        exit_code: Option<i32>,
    ) -> Self {
        JobStreamEvent::Control(StreamControl {
            kind: StreamControlKind::Complete,
            message: Some(format!("stream complete: job {job_status}")),
            job_status: Some(job_status),
            exit_code,
            request_id,
        })
    }

    pub fn is_complete(&self) -> bool {
        matches!(
            self,
            JobStreamEvent::Control(StreamControl {
                kind: StreamControlKind::Complete,
                ..
            })
        )
    }
}
