//! Client-side reconnect loop for a job's event stream.
//!
//! The watcher owns a [`RunCorrelationGuard`] describing the run this client
//! currently intends to follow. Before every subscription it consults that
//! guard and then the server's events-meta endpoint; a stale answer from
//! either ends the loop as `Superseded` rather than retrying. Transport
//! failures back off exponentially and resubscribe, announcing
//! [`WatchEvent::StreamReset`] first because the server replays the whole
//! retained backlog on every connection.

use std::time::Duration;

use dockhand_core::RunCorrelationGuard;
use dockhand_types::{JobStatus, JobStreamEvent, StreamControlKind, SubmitJobResponse};
use futures::StreamExt;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::client::OrchestratorClient;
use crate::error::{ClientError, Result};

const GUARD_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchPhase {
    Idle,
    Submitted,
    Streaming,
    Reconnecting,
    Terminal,
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Phase(WatchPhase),
    Line(String),
    /// Lines received so far should be discarded; a full replay follows.
    StreamReset,
    Completed {
        status: Option<JobStatus>,
        exit_code: Option<i32>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchOutcome {
    pub job_id: String,
    pub run_id: String,
    pub phase: WatchPhase,
    pub status: Option<JobStatus>,
    pub exit_code: Option<i32>,
    pub reconnects: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(5),
            max_attempts: 8,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given 1-based attempt: `initial` doubled per
    /// attempt, capped at `max`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial
            .saturating_mul(1u32 << shift)
            .min(self.max)
    }
}

enum StreamEnd {
    Completed {
        status: Option<JobStatus>,
        exit_code: Option<i32>,
    },
    Superseded,
    Interrupted(ClientError),
}

pub struct JobWatcher {
    client: OrchestratorClient,
    guard: RunCorrelationGuard,
    policy: ReconnectPolicy,
    phase: WatchPhase,
}

impl JobWatcher {
    pub fn new(client: OrchestratorClient) -> Self {
        Self {
            client,
            guard: RunCorrelationGuard::new(),
            policy: ReconnectPolicy::default(),
            phase: WatchPhase::Idle,
        }
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Shares the guard; setting another active run on the clone supersedes
    /// whatever this watcher is following.
    pub fn guard(&self) -> RunCorrelationGuard {
        self.guard.clone()
    }

    pub fn phase(&self) -> WatchPhase {
        self.phase
    }

    fn set_phase(&mut self, phase: WatchPhase, events: &mpsc::UnboundedSender<WatchEvent>) {
        if self.phase != phase {
            tracing::debug!(from = ?self.phase, to = ?phase, "watcher phase change");
            self.phase = phase;
            let _ = events.send(WatchEvent::Phase(phase));
        }
    }

    /// Submits `command` under a fresh run id, which becomes this client's
    /// active run before the request is sent.
    pub async fn submit(
        &mut self,
        command: &str,
        events: &mpsc::UnboundedSender<WatchEvent>,
    ) -> Result<SubmitJobResponse> {
        let run_id = Uuid::new_v4().to_string();
        self.guard.set_active_run(run_id.clone(), None).await;
        let accepted = match self.client.submit(command, Some(run_id.as_str())).await {
            Ok(accepted) => accepted,
            Err(err) => {
                self.guard.clear_if_match(&run_id).await;
                return Err(err);
            }
        };
        if self.guard.is_current(&run_id).await {
            self.guard
                .set_active_run(run_id, Some(accepted.job_id.clone()))
                .await;
        }
        self.set_phase(WatchPhase::Submitted, events);
        Ok(accepted)
    }

    /// Follows the job's stream until it completes, is superseded, or the
    /// reconnect budget runs out.
    pub async fn watch(
        &mut self,
        job_id: &str,
        run_id: &str,
        events: &mpsc::UnboundedSender<WatchEvent>,
    ) -> Result<WatchOutcome> {
        let client = self.client.clone();
        let mut outcome = WatchOutcome {
            job_id: job_id.to_string(),
            run_id: run_id.to_string(),
            phase: self.phase,
            status: None,
            exit_code: None,
            reconnects: 0,
        };
        let mut attempts = 0u32;
        let mut connected_once = false;

        loop {
            if self.guard.check(Some(run_id)).await.is_err() {
                return Ok(self.superseded(outcome, events));
            }

            let failure = match client.events_meta(job_id, Some(run_id)).await {
                Err(ClientError::StaleRun { .. }) => {
                    return Ok(self.superseded(outcome, events));
                }
                Err(err) => err,
                Ok(meta) => match client
                    .subscribe_events(job_id, Some(run_id), Some(meta.request_id.as_str()))
                    .await
                {
                    Err(ClientError::StaleRun { .. }) => {
                        return Ok(self.superseded(outcome, events));
                    }
                    Err(err) => err,
                    Ok(stream) => {
                        if connected_once {
                            outcome.reconnects += 1;
                            let _ = events.send(WatchEvent::StreamReset);
                        }
                        connected_once = true;
                        self.set_phase(WatchPhase::Streaming, events);
                        match self.follow(stream, run_id, events, &mut attempts).await {
                            StreamEnd::Completed { status, exit_code } => {
                                let _ = events.send(WatchEvent::Completed { status, exit_code });
                                self.set_phase(WatchPhase::Terminal, events);
                                outcome.phase = WatchPhase::Terminal;
                                outcome.status = status;
                                outcome.exit_code = exit_code;
                                return Ok(outcome);
                            }
                            StreamEnd::Superseded => {
                                return Ok(self.superseded(outcome, events));
                            }
                            StreamEnd::Interrupted(err) => err,
                        }
                    }
                },
            };

            if !failure.is_retryable() {
                return Err(failure);
            }
            attempts += 1;
            if attempts > self.policy.max_attempts {
                return Err(ClientError::RetriesExhausted {
                    attempts: attempts - 1,
                    last: failure.to_string(),
                });
            }
            let mut delay = self.policy.backoff_for(attempts);
            if let ClientError::RateLimited { retry_after_ms } = &failure {
                delay = delay.max(Duration::from_millis(*retry_after_ms));
            }
            tracing::warn!(
                job_id,
                run_id,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "job stream lost; reconnecting"
            );
            self.set_phase(WatchPhase::Reconnecting, events);
            tokio::time::sleep(delay).await;
        }
    }

    /// Submits and then watches the new job.
    pub async fn run(
        &mut self,
        command: &str,
        events: &mpsc::UnboundedSender<WatchEvent>,
    ) -> Result<WatchOutcome> {
        let accepted = self.submit(command, events).await?;
        self.watch(&accepted.job_id, &accepted.run_id, events).await
    }

    async fn follow<S>(
        &mut self,
        stream: S,
        run_id: &str,
        events: &mpsc::UnboundedSender<WatchEvent>,
        attempts: &mut u32,
    ) -> StreamEnd
    where
        S: futures::Stream<Item = Result<JobStreamEvent>>,
    {
        futures::pin_mut!(stream);
        let mut tick = tokio::time::interval(GUARD_POLL_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if !self.guard.is_current(run_id).await {
                        return StreamEnd::Superseded;
                    }
                }
                maybe = stream.next() => {
                    let Some(next) = maybe else {
                        return StreamEnd::Interrupted(ClientError::Stream(
                            "stream ended before completion".to_string(),
                        ));
                    };
                    match next {
                        Ok(JobStreamEvent::Line { line }) => {
                            *attempts = 0;
                            let _ = events.send(WatchEvent::Line(line));
                        }
                        Ok(JobStreamEvent::Control(control)) => match control.kind {
                            StreamControlKind::Connected => *attempts = 0,
                            StreamControlKind::Complete => {
                                return StreamEnd::Completed {
                                    status: control.job_status,
                                    exit_code: control.exit_code,
                                };
                            }
                        },
                        Err(err) => return StreamEnd::Interrupted(err),
                    }
                }
            }
        }
    }

    fn superseded(
        &mut self,
        mut outcome: WatchOutcome,
        events: &mpsc::UnboundedSender<WatchEvent>,
    ) -> WatchOutcome {
        self.set_phase(WatchPhase::Superseded, events);
        outcome.phase = WatchPhase::Superseded;
        outcome
    }
}
