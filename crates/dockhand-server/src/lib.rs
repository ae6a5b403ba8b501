use std::sync::Arc;

use dockhand_core::{OrchestratorConfig, RunCorrelationGuard};
use dockhand_runtime::{JobStore, JobSupervisor};

pub mod http;
mod rate_limit;

pub use dockhand_core::now_ms;
pub use http::{app_router, serve};
pub use rate_limit::RateLimiter;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<OrchestratorConfig>,
    pub supervisor: JobSupervisor,
    pub runs: RunCorrelationGuard,
    pub rate_limiter: RateLimiter,
    pub started_at_ms: u64,
    /// Held across job creation and run activation so the active run always
    /// names the most recently created job.
    submit_lock: Arc<tokio::sync::Mutex<()>>,
}

impl AppState {
    /// Builds the store and starts the worker pool, so this must run inside
    /// a tokio runtime.
    pub fn new(config: OrchestratorConfig) -> Self {
        let store = JobStore::new(config.max_output_lines, config.job_retention);
        let rate_limiter = RateLimiter::new(config.rate_limit_per_minute);
        let supervisor = JobSupervisor::start(config.clone(), store);
        Self {
            config: Arc::new(config),
            supervisor,
            runs: RunCorrelationGuard::new(),
            rate_limiter,
            started_at_ms: now_ms(),
            submit_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn api_token(&self) -> Option<&str> {
        self.config.api_key.as_deref()
    }

    pub(crate) async fn lock_submissions(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.submit_lock.lock().await
    }

    pub fn store(&self) -> &JobStore {
        self.supervisor.store()
    }
}
