use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dockhand_core::{CommandPolicy, CommandRejection, OrchestratorConfig, OutputRing};
use dockhand_observability::{emit_event, ObservabilityEvent, ProcessKind};
use dockhand_types::{JobSnapshot, JobStatus};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::Level;

use crate::job_store::JobStore;

/// Exit code recorded when the process could not be started at all.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = -1;
const EXIT_CODE_SIGNAL_BASE: i32 = 128;
/// Upper bound on waiting for output readers after the process exits.
/// Grandchildren that inherited the pipes can otherwise hold them open.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const LOG_PREFIX: &str = "[orchestrator]";
const MAX_LINE_BYTES: usize = 16 * 1024;

#[derive(Debug, Default)]
struct SupervisorCounters {
    queued: AtomicUsize,
    running: AtomicUsize,
    succeeded: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorHealth {
    pub workers: usize,
    pub queue_depth: usize,
    pub running_jobs: usize,
    pub succeeded_total: u64,
    pub failed_total: u64,
    /// Submissions refused before a job was created.
    pub rejected_total: u64,
}

struct SupervisorInner {
    config: OrchestratorConfig,
    policy: CommandPolicy,
    store: JobStore,
    queue: mpsc::UnboundedSender<String>,
    counters: SupervisorCounters,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// Owns the job queue and the worker pool that executes it.
#[derive(Clone)]
pub struct JobSupervisor {
    inner: Arc<SupervisorInner>,
}

impl JobSupervisor {
    /// Spawns `queue_concurrency` workers (at least one) sharing a single FIFO
    /// queue. Must be called inside a tokio runtime.
    pub fn start(config: OrchestratorConfig, store: JobStore) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let worker_count = config.queue_concurrency.max(1);
        let inner = Arc::new(SupervisorInner {
            policy: CommandPolicy::from_config(&config),
            config,
            store,
            queue: tx,
            counters: SupervisorCounters::default(),
            workers: std::sync::Mutex::new(Vec::new()),
        });

        let rx = Arc::new(Mutex::new(rx));
        let handles = (0..worker_count)
            .map(|worker| tokio::spawn(worker_loop(worker, inner.clone(), rx.clone())))
            .collect::<Vec<_>>();
        if let Ok(mut workers) = inner.workers.lock() {
            *workers = handles;
        }

        tracing::info!(
            workers = worker_count,
            workspace = %inner.config.workspace_root.display(),
            timeout_secs = inner.config.command_timeout.as_secs(),
            "job supervisor started"
        );
        Self { inner }
    }

    pub fn store(&self) -> &JobStore {
        &self.inner.store
    }

    /// Validates and enqueues. A rejected command creates no job.
    pub async fn submit(&self, command: &str) -> Result<JobSnapshot, CommandRejection> {
        if let Err(rejection) = self.inner.policy.validate(command) {
            self.inner.counters.rejected.fetch_add(1, Ordering::Relaxed);
            let reason = rejection.to_string();
            emit_event(
                Level::WARN,
                ProcessKind::Engine,
                ObservabilityEvent::new("supervisor", "job.rejected")
                    .error_code("COMMAND_REJECTED")
                    .detail(&reason),
            );
            return Err(rejection);
        }
        Ok(self.enqueue(command.trim().to_string()).await)
    }

    /// Creates and queues a job without validating it first. Workers still
    /// validate at dequeue.
    pub(crate) async fn enqueue(&self, command: String) -> JobSnapshot {
        let record = self.inner.store.create(command).await;
        self.inner.counters.queued.fetch_add(1, Ordering::Relaxed);
        if self.inner.queue.send(record.id.clone()).is_err() {
            self.inner.counters.queued.fetch_sub(1, Ordering::Relaxed);
            fail_job(
                &self.inner,
                &record.id,
                &format!("{LOG_PREFIX} internal error: job queue is closed"),
            )
            .await;
        } else {
            emit_event(
                Level::INFO,
                ProcessKind::Engine,
                ObservabilityEvent::new("supervisor", "job.queued")
                    .job(&record.id)
                    .status("queued"),
            );
        }
        self.inner
            .store
            .snapshot(&record.id, self.inner.config.status_tail_lines)
            .await
            .unwrap_or_else(|| JobSnapshot {
                id: record.id.clone(),
                status: record.status,
                command: record.command.clone(),
                resolved_args: None,
                created_at: record.created_at,
                started_at: None,
                finished_at: None,
                exit_code: None,
                last_lines: Vec::new(),
            })
    }

    pub fn health(&self) -> SupervisorHealth {
        let counters = &self.inner.counters;
        SupervisorHealth {
            workers: self.inner.config.queue_concurrency.max(1),
            queue_depth: counters.queued.load(Ordering::Relaxed),
            running_jobs: counters.running.load(Ordering::Relaxed),
            succeeded_total: counters.succeeded.load(Ordering::Relaxed),
            failed_total: counters.failed.load(Ordering::Relaxed),
            rejected_total: counters.rejected.load(Ordering::Relaxed),
        }
    }

    /// Aborts the workers. Running children are killed when their handles drop.
    pub fn shutdown(&self) {
        if let Ok(mut workers) = self.inner.workers.lock() {
            for handle in workers.drain(..) {
                handle.abort();
            }
        }
    }
}

async fn worker_loop(
    worker: usize,
    inner: Arc<SupervisorInner>,
    queue: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
) {
    loop {
        let next = { queue.lock().await.recv().await };
        let Some(job_id) = next else {
            break;
        };
        inner.counters.queued.fetch_sub(1, Ordering::Relaxed);
        tracing::debug!(worker, job_id = %job_id, "worker picked up job");
        run_guarded(&inner, job_id).await;
    }
    tracing::debug!(worker, "worker stopped");
}

/// Runs one job on its own task so a panic is contained to that job.
async fn run_guarded(inner: &Arc<SupervisorInner>, job_id: String) {
    let task = tokio::spawn(execute(inner.clone(), job_id.clone()));
    let failure = match task.await {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(format!("{err:#}")),
        Err(join_err) if join_err.is_panic() => Some("job task panicked".to_string()),
        Err(join_err) => Some(join_err.to_string()),
    };
    if let Some(message) = failure {
        tracing::error!(job_id = %job_id, error = %message, "job failed internally");
        fail_job(
            inner,
            &job_id,
            &format!("{LOG_PREFIX} internal error: {message}"),
        )
        .await;
    }
}

/// Marks a non-terminal job failed with `line` as its explanation.
async fn fail_job(inner: &SupervisorInner, job_id: &str, line: &str) {
    let Some(record) = inner.store.get(job_id).await else {
        return;
    };
    if record.is_terminal() {
        return;
    }
    if let Some(ring) = inner.store.ring(job_id).await {
        ring.append(line);
    }
    if inner
        .store
        .finish(job_id, JobStatus::Failed, None)
        .await
        .is_ok()
    {
        inner.counters.failed.fetch_add(1, Ordering::Relaxed);
    }
}

struct RunningSlot<'a>(&'a AtomicUsize);

impl<'a> RunningSlot<'a> {
    fn acquire(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for RunningSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

async fn execute(inner: Arc<SupervisorInner>, job_id: String) -> anyhow::Result<()> {
    let store = &inner.store;
    let ring = store
        .ring(&job_id)
        .await
        .with_context(|| format!("job {job_id} disappeared before start"))?;
    let record = store.mark_running(&job_id).await?;
    let _slot = RunningSlot::acquire(&inner.counters.running);
    emit_event(
        Level::INFO,
        ProcessKind::Engine,
        ObservabilityEvent::new("supervisor", "job.started")
            .job(&job_id)
            .status("running"),
    );

    let validated = match inner.policy.validate(&record.command) {
        Ok(validated) => validated,
        Err(rejection) => {
            ring.append(format!("{LOG_PREFIX} rejected: {rejection}"));
            return finish(&inner, &job_id, JobStatus::Failed, None).await;
        }
    };
    store.set_resolved_args(&job_id, validated.argv()).await?;
    ring.append(format!("{LOG_PREFIX} running: {}", validated.display()));
    ring.append(format!(
        "{LOG_PREFIX} cwd: {}",
        validated.working_directory.display()
    ));

    let program = inner
        .config
        .program_override
        .clone()
        .unwrap_or_else(|| PathBuf::from(&validated.program));
    let mut command = Command::new(&program);
    command
        .args(&validated.args)
        .current_dir(&validated.working_directory)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in [("DOCKER_BUILDKIT", "1"), ("COMPOSE_DOCKER_CLI_BUILD", "1")] {
        if std::env::var_os(key).is_none() {
            command.env(key, value);
        }
    }
    #[cfg(unix)]
    command.process_group(0);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            ring.append(format!("{LOG_PREFIX} spawn error: {err}"));
            return finish(
                &inner,
                &job_id,
                JobStatus::Failed,
                Some(SPAWN_FAILURE_EXIT_CODE),
            )
            .await;
        }
    };

    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(pump_lines(ring.clone(), stdout)));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(pump_lines(ring.clone(), stderr)));
    }

    let (status, timed_out) = wait_with_timeout(
        &mut child,
        &ring,
        inner.config.command_timeout,
        inner.config.kill_grace,
    )
    .await?;

    let deadline = tokio::time::Instant::now() + READER_DRAIN_TIMEOUT;
    for mut reader in readers {
        if tokio::time::timeout_at(deadline, &mut reader).await.is_err() {
            tracing::warn!(job_id = %job_id, "output reader did not drain in time");
            reader.abort();
        }
    }

    let code = exit_code_of(status);
    let suffix = if timed_out { " after timeout" } else { "" };
    ring.append(format!("{LOG_PREFIX} exited with code {code}{suffix}"));
    let outcome = if code == 0 {
        JobStatus::Succeeded
    } else {
        JobStatus::Failed
    };
    finish(&inner, &job_id, outcome, Some(code)).await
}

async fn finish(
    inner: &SupervisorInner,
    job_id: &str,
    status: JobStatus,
    exit_code: Option<i32>,
) -> anyhow::Result<()> {
    inner.store.finish(job_id, status, exit_code).await?;
    let counter = match status {
        JobStatus::Succeeded => &inner.counters.succeeded,
        _ => &inner.counters.failed,
    };
    counter.fetch_add(1, Ordering::Relaxed);
    let level = if status == JobStatus::Succeeded {
        Level::INFO
    } else {
        Level::WARN
    };
    let detail = exit_code.map(|code| format!("exit code {code}"));
    let mut event = ObservabilityEvent::new("supervisor", "job.finished")
        .job(job_id)
        .status(status.as_str());
    if let Some(detail) = detail.as_deref() {
        event = event.detail(detail);
    }
    emit_event(level, ProcessKind::Engine, event);
    Ok(())
}

/// Waits for exit, escalating SIGTERM then SIGKILL once the timeout fires.
/// Returns the exit status and whether the timeout was reached.
async fn wait_with_timeout(
    child: &mut Child,
    ring: &OutputRing,
    timeout: Duration,
    grace: Duration,
) -> anyhow::Result<(ExitStatus, bool)> {
    if let Ok(status) = tokio::time::timeout(timeout, child.wait()).await {
        return Ok((status?, false));
    }

    ring.append(format!(
        "{LOG_PREFIX} timeout after {}ms, sending SIGTERM...",
        timeout.as_millis()
    ));
    terminate(child);
    if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
        return Ok((status?, true));
    }

    ring.append(format!(
        "{LOG_PREFIX} still running after {}ms, sending SIGKILL...",
        grace.as_millis()
    ));
    force_kill(child);
    let status = child.wait().await?;
    Ok((status, true))
}

#[cfg(unix)]
fn terminate(child: &mut Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    match child.id() {
        Some(pid) => {
            if let Err(err) = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                tracing::warn!(pid, error = %err, "SIGTERM failed, killing instead");
                let _ = child.start_kill();
            }
        }
        None => {
            let _ = child.start_kill();
        }
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    let _ = child.start_kill();
}

#[cfg(unix)]
fn force_kill(child: &mut Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
    }
    let _ = child.start_kill();
}

#[cfg(not(unix))]
fn force_kill(child: &mut Child) {
    let _ = child.start_kill();
}

fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return EXIT_CODE_SIGNAL_BASE + signal;
        }
    }
    EXIT_CODE_SIGNAL_BASE
}

/// Appends each line of `stream` to the ring. Both `\n` and `\r` end a line,
/// so progress redraws arrive as separate lines; a line longer than
/// `MAX_LINE_BYTES` is cut into pieces. Invalid UTF-8 is replaced and blank
/// lines skipped.
async fn pump_lines(ring: OutputRing, stream: impl AsyncRead + Unpin) {
    let mut reader = BufReader::new(stream);
    let mut line = Vec::with_capacity(256);
    loop {
        let chunk = match reader.fill_buf().await {
            Ok([]) => break,
            Ok(chunk) => chunk,
            Err(err) => {
                tracing::debug!(error = %err, "output stream closed with error");
                break;
            }
        };
        let len = chunk.len();
        for &byte in chunk {
            if byte == b'\n' || byte == b'\r' {
                flush_line(&ring, &mut line);
                continue;
            }
            line.push(byte);
            if line.len() >= MAX_LINE_BYTES {
                flush_line(&ring, &mut line);
            }
        }
        reader.consume(len);
    }
    flush_line(&ring, &mut line);
}

fn flush_line(ring: &OutputRing, line: &mut Vec<u8>) {
    if !line.is_empty() {
        ring.append(String::from_utf8_lossy(line));
        line.clear();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    use dockhand_core::RingMessage;

    use super::*;

    fn stand_in_docker(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("docker");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
        let mut perms = std::fs::metadata(&path).expect("meta").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).expect("chmod");
        path
    }

    fn test_config(workspace: &Path, program: PathBuf) -> OrchestratorConfig {
        OrchestratorConfig {
            workspace_root: workspace.to_path_buf(),
            program_override: Some(program),
            command_timeout: Duration::from_secs(30),
            kill_grace: Duration::from_secs(2),
            ..OrchestratorConfig::default()
        }
    }

    fn start(config: OrchestratorConfig) -> JobSupervisor {
        let store = JobStore::new(config.max_output_lines, config.job_retention);
        JobSupervisor::start(config, store)
    }

    async fn wait_terminal(supervisor: &JobSupervisor, id: &str) -> JobSnapshot {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
        loop {
            let snapshot = supervisor.store().snapshot(id, 200).await.expect("job");
            if snapshot.status.is_terminal() {
                return snapshot;
            }
            assert!(tokio::time::Instant::now() < deadline, "job {id} never finished");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn grafana_up_streams_output_and_succeeds() {
        let dir = tempfile::tempdir().expect("tempdir");
        let docker = stand_in_docker(
            dir.path(),
            "echo \"Started\"\necho \"Container grafana Running\" >&2\nexit 0",
        );
        let supervisor = start(test_config(dir.path(), docker));

        let queued = supervisor
            .submit("docker compose up -d grafana")
            .await
            .expect("accepted");
        assert_eq!(queued.status, JobStatus::Queued);

        let ring = supervisor.store().ring(&queued.id).await.expect("ring");
        let mut sub = ring.subscribe();
        let mut lines = sub.backlog.clone();
        let mut terminal = sub.closed;
        while terminal.is_none() {
            match sub.recv().await {
                Some(RingMessage::Line(line)) => lines.push(line),
                Some(RingMessage::Closed(t)) => terminal = Some(t),
                None => break,
            }
        }

        let done = wait_terminal(&supervisor, &queued.id).await;
        assert_eq!(done.status, JobStatus::Succeeded);
        assert_eq!(done.exit_code, Some(0));
        assert_eq!(terminal.map(|t| t.status), Some(JobStatus::Succeeded));
        assert_eq!(
            done.resolved_args.as_deref().map(|a| a.join(" ")),
            Some("docker compose --project-directory compose up -d grafana".to_string())
        );
        assert!(lines[0].starts_with("[orchestrator] running: docker compose"));
        assert!(lines[1].starts_with("[orchestrator] cwd: "));
        assert!(lines.iter().any(|l| l == "Started"));
        assert!(lines.iter().any(|l| l == "Container grafana Running"));
        assert_eq!(
            lines.last().map(String::as_str),
            Some("[orchestrator] exited with code 0")
        );
        assert!(done.started_at.is_some() && done.finished_at >= done.started_at);
    }

    #[tokio::test]
    async fn nonzero_exit_fails_the_job() {
        let dir = tempfile::tempdir().expect("tempdir");
        let docker = stand_in_docker(dir.path(), "echo boom >&2\nexit 3");
        let supervisor = start(test_config(dir.path(), docker));
        let job = supervisor.submit("docker compose pull").await.expect("accepted");
        let done = wait_terminal(&supervisor, &job.id).await;
        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.exit_code, Some(3));
        assert!(done.last_lines.iter().any(|l| l == "boom"));
        assert_eq!(supervisor.health().failed_total, 1);
    }

    #[tokio::test]
    async fn rejected_submission_creates_no_job() {
        let dir = tempfile::tempdir().expect("tempdir");
        let docker = stand_in_docker(dir.path(), "exit 0");
        let supervisor = start(test_config(dir.path(), docker));
        let err = supervisor.submit("rm -rf /").await.unwrap_err();
        assert_eq!(err, CommandRejection::PrefixNotAllowed);
        assert!(supervisor.store().is_empty().await);
        assert_eq!(supervisor.health().rejected_total, 1);
    }

    #[tokio::test]
    async fn worker_revalidates_and_fails_without_spawning() {
        let dir = tempfile::tempdir().expect("tempdir");
        let marker = dir.path().join("spawned");
        let docker = stand_in_docker(dir.path(), &format!("touch {}", marker.display()));
        let supervisor = start(test_config(dir.path(), docker));

        let job = supervisor.enqueue("docker compose exec web sh".to_string()).await;
        let done = wait_terminal(&supervisor, &job.id).await;

        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.exit_code, None);
        assert_eq!(done.last_lines.len(), 1);
        assert!(done.last_lines[0].starts_with("[orchestrator] rejected: compose subcommand 'exec'"));
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn internal_error_fails_the_job_and_the_worker_moves_on() {
        let dir = tempfile::tempdir().expect("tempdir");
        let docker = stand_in_docker(dir.path(), "sleep 0.5\necho done");
        let supervisor = start(test_config(dir.path(), docker));

        let first = supervisor.submit("docker compose up a").await.expect("accepted");
        let broken = supervisor.submit("docker compose up b").await.expect("accepted");
        let after = supervisor.submit("docker compose up c").await.expect("accepted");
        // The worker is still busy with `a`; claiming the write-once argv
        // makes the worker's own write fail once it reaches `b`.
        supervisor
            .store()
            .set_resolved_args(&broken.id, vec!["preset".to_string()])
            .await
            .expect("argv unset while queued");

        assert_eq!(
            wait_terminal(&supervisor, &first.id).await.status,
            JobStatus::Succeeded
        );
        let failed = wait_terminal(&supervisor, &broken.id).await;
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.exit_code, None);
        assert!(failed.finished_at.is_some());
        assert!(failed
            .last_lines
            .iter()
            .any(|l| l.starts_with("[orchestrator] internal error:") && l.contains("resolvedArgs")));

        let next = wait_terminal(&supervisor, &after.id).await;
        assert_eq!(next.status, JobStatus::Succeeded);
        assert!(next.last_lines.iter().any(|l| l == "done"));
        assert_eq!(supervisor.health().failed_total, 1);
    }

    #[tokio::test]
    async fn carriage_returns_split_lines_and_long_lines_are_cut() {
        let ring = OutputRing::new(100);
        let mut output = b"Pulling 10%\rPulling 55%\rPulling 100%\r\nDone\r\n".to_vec();
        output.extend(std::iter::repeat(b'x').take(MAX_LINE_BYTES * 2 + 10));
        pump_lines(ring.clone(), output.as_slice()).await;

        let lines = ring.subscribe().backlog.clone();
        assert_eq!(
            &lines[..4],
            ["Pulling 10%", "Pulling 55%", "Pulling 100%", "Done"]
        );
        let cut: Vec<usize> = lines[4..].iter().map(String::len).collect();
        assert_eq!(cut, vec![MAX_LINE_BYTES, MAX_LINE_BYTES, 10]);
    }

    #[tokio::test]
    async fn spawn_failure_records_sentinel_exit_code() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("no-such-docker");
        let supervisor = start(test_config(dir.path(), missing));
        let job = supervisor.submit("docker compose ps").await.expect("accepted");
        let done = wait_terminal(&supervisor, &job.id).await;
        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.exit_code, Some(SPAWN_FAILURE_EXIT_CODE));
        assert!(done
            .last_lines
            .iter()
            .any(|l| l.starts_with("[orchestrator] spawn error:")));
    }

    #[tokio::test]
    async fn single_worker_runs_jobs_in_submission_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = dir.path().join("order.log");
        let docker = stand_in_docker(
            dir.path(),
            &format!(
                "echo \"start $5\" >> {log}\nsleep 0.2\necho \"end $5\" >> {log}",
                log = log.display()
            ),
        );
        let supervisor = start(test_config(dir.path(), docker));

        let mut ids = Vec::new();
        for name in ["a", "b", "c"] {
            let job = supervisor
                .submit(&format!("docker compose up {name}"))
                .await
                .expect("accepted");
            ids.push(job.id);
        }
        assert!(supervisor.health().running_jobs <= 1);
        for id in &ids {
            let done = wait_terminal(&supervisor, id).await;
            assert_eq!(done.status, JobStatus::Succeeded);
        }

        let order = std::fs::read_to_string(&log).expect("order log");
        let lines: Vec<&str> = order.lines().collect();
        assert_eq!(
            lines,
            vec!["start a", "end a", "start b", "end b", "start c", "end c"]
        );
    }

    #[tokio::test]
    async fn timeout_escalates_from_sigterm_to_sigkill() {
        let dir = tempfile::tempdir().expect("tempdir");
        let docker = stand_in_docker(dir.path(), "trap '' TERM\necho waiting\nsleep 30");
        let config = OrchestratorConfig {
            command_timeout: Duration::from_secs(1),
            kill_grace: Duration::from_secs(1),
            ..test_config(dir.path(), docker)
        };
        let supervisor = start(config);

        let started = std::time::Instant::now();
        let job = supervisor.submit("docker compose up").await.expect("accepted");
        let done = wait_terminal(&supervisor, &job.id).await;
        let elapsed = started.elapsed();

        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.exit_code, Some(128 + 9));
        assert!(elapsed < Duration::from_secs(5), "took {elapsed:?}");
        let sigterm = done
            .last_lines
            .iter()
            .position(|l| l == "[orchestrator] timeout after 1000ms, sending SIGTERM...")
            .expect("sigterm line");
        let sigkill = done
            .last_lines
            .iter()
            .position(|l| l == "[orchestrator] still running after 1000ms, sending SIGKILL...")
            .expect("sigkill line");
        assert!(sigterm < sigkill);
        assert_eq!(
            done.last_lines.last().map(String::as_str),
            Some("[orchestrator] exited with code 137 after timeout")
        );
    }
}
