use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dockhand_core::{OutputRing, RingTerminal};
use dockhand_types::{JobCounts, JobSnapshot, JobStatus};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobStoreError {
    #[error("job {0} not found")]
    NotFound(String),
    #[error("job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("job {id} already has {field} set")]
    AlreadySet { id: String, field: &'static str },
}

/// Lifecycle record of one accepted command. Every timestamp, the exit code
/// and the resolved argv are write-once.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: String,
    pub status: JobStatus,
    pub command: String,
    pub resolved_args: Option<Vec<String>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    #[serde(skip)]
    finish_seq: Option<u64>,
}

impl JobRecord {
    fn new(command: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            status: JobStatus::Queued,
            command,
            resolved_args: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            exit_code: None,
            finish_seq: None,
        }
    }

    pub fn transition_to(&mut self, next: JobStatus) -> Result<(), JobStoreError> {
        if !self.status.can_transition_to(next) {
            return Err(JobStoreError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        let now = Utc::now();
        if next == JobStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        self.status = next;
        Ok(())
    }

    pub fn set_exit_code(&mut self, code: i32) -> Result<(), JobStoreError> {
        if self.exit_code.is_some() {
            return Err(JobStoreError::AlreadySet {
                id: self.id.clone(),
                field: "exitCode",
            });
        }
        self.exit_code = Some(code);
        Ok(())
    }

    pub fn set_resolved_args(&mut self, argv: Vec<String>) -> Result<(), JobStoreError> {
        if self.resolved_args.is_some() {
            return Err(JobStoreError::AlreadySet {
                id: self.id.clone(),
                field: "resolvedArgs",
            });
        }
        self.resolved_args = Some(argv);
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

struct JobEntry {
    record: JobRecord,
    ring: OutputRing,
}

/// In-memory job table. Each job owns its output ring; terminal jobs beyond
/// the retention limit are pruned oldest-finished first.
#[derive(Clone)]
pub struct JobStore {
    jobs: Arc<RwLock<HashMap<String, JobEntry>>>,
    ring_capacity: usize,
    retention: usize,
    finish_counter: Arc<std::sync::atomic::AtomicU64>,
}

impl JobStore {
    pub fn new(ring_capacity: usize, retention: usize) -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            ring_capacity,
            retention,
            finish_counter: Arc::new(std::sync::atomic::AtomicU64::new(0)),
        }
    }

    pub async fn create(&self, command: String) -> JobRecord {
        let record = JobRecord::new(command);
        let ring = OutputRing::new(self.ring_capacity);
        self.jobs.write().await.insert(
            record.id.clone(),
            JobEntry {
                record: record.clone(),
                ring,
            },
        );
        record
    }

    pub async fn get(&self, id: &str) -> Option<JobRecord> {
        self.jobs.read().await.get(id).map(|entry| entry.record.clone())
    }

    pub async fn ring(&self, id: &str) -> Option<OutputRing> {
        self.jobs.read().await.get(id).map(|entry| entry.ring.clone())
    }

    pub async fn snapshot(&self, id: &str, tail_lines: usize) -> Option<JobSnapshot> {
        let jobs = self.jobs.read().await;
        let entry = jobs.get(id)?;
        let record = &entry.record;
        Some(JobSnapshot {
            id: record.id.clone(),
            status: record.status,
            command: record.command.clone(),
            resolved_args: record.resolved_args.clone(),
            created_at: record.created_at,
            started_at: record.started_at,
            finished_at: record.finished_at,
            exit_code: record.exit_code,
            last_lines: entry.ring.tail(tail_lines),
        })
    }

    /// Applies `mutate` to the stored record under the write lock.
    pub async fn update<F, T>(&self, id: &str, mutate: F) -> Result<T, JobStoreError>
    where
        F: FnOnce(&mut JobRecord) -> Result<T, JobStoreError>,
    {
        let mut jobs = self.jobs.write().await;
        let entry = jobs
            .get_mut(id)
            .ok_or_else(|| JobStoreError::NotFound(id.to_string()))?;
        mutate(&mut entry.record)
    }

    pub async fn mark_running(&self, id: &str) -> Result<JobRecord, JobStoreError> {
        self.update(id, |record| {
            record.transition_to(JobStatus::Running)?;
            Ok(record.clone())
        })
        .await
    }

    pub async fn set_resolved_args(&self, id: &str, argv: Vec<String>) -> Result<(), JobStoreError> {
        self.update(id, |record| record.set_resolved_args(argv)).await
    }

    /// Moves the job to a terminal state, records the exit code if one was
    /// observed, then closes the ring so subscribers see the terminal marker
    /// after the status is already visible.
    pub async fn finish(
        &self,
        id: &str,
        status: JobStatus,
        exit_code: Option<i32>,
    ) -> Result<JobRecord, JobStoreError> {
        let seq = self
            .finish_counter
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let (record, ring) = {
            let mut jobs = self.jobs.write().await;
            let entry = jobs
                .get_mut(id)
                .ok_or_else(|| JobStoreError::NotFound(id.to_string()))?;
            entry.record.transition_to(status)?;
            if let Some(code) = exit_code {
                entry.record.set_exit_code(code)?;
            }
            entry.record.finish_seq = Some(seq);
            (entry.record.clone(), entry.ring.clone())
        };
        ring.close(RingTerminal {
            status: record.status,
            exit_code: record.exit_code,
        });
        self.prune().await;
        Ok(record)
    }

    /// Drops the oldest terminal jobs beyond the retention limit. Returns the
    /// pruned ids.
    pub async fn prune(&self) -> Vec<String> {
        let mut jobs = self.jobs.write().await;
        let mut finished: Vec<(u64, String)> = jobs
            .values()
            .filter_map(|entry| entry.record.finish_seq.map(|seq| (seq, entry.record.id.clone())))
            .collect();
        if finished.len() <= self.retention {
            return Vec::new();
        }
        finished.sort_unstable();
        let excess = finished.len() - self.retention;
        finished
            .into_iter()
            .take(excess)
            .filter_map(|(_, id)| jobs.remove(&id).map(|_| id))
            .collect()
    }

    pub async fn counts(&self) -> JobCounts {
        let jobs = self.jobs.read().await;
        let mut counts = JobCounts::default();
        for entry in jobs.values() {
            match entry.record.status {
                JobStatus::Queued => counts.queued += 1,
                JobStatus::Running => counts.running += 1,
                JobStatus::Succeeded => counts.succeeded += 1,
                JobStatus::Failed => counts.failed += 1,
                JobStatus::Canceled => counts.canceled += 1,
            }
        }
        counts
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
