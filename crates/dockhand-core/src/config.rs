//! Orchestrator configuration.
//!
//! Everything is read from the process environment once at startup by
//! `OrchestratorConfig::from_env()`. Unset variables fall back to the
//! defaults below; a variable that is set but does not parse is an error
//! naming the variable, never a silent fallback.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context};

pub const DEFAULT_WORKSPACE: &str = "/workspace";
pub const DEFAULT_PROJECT_DIR: &str = "compose";
pub const DEFAULT_MAX_OUTPUT_LINES: usize = 20_000;
pub const DEFAULT_COMMAND_TIMEOUT_SECONDS: u64 = 1_800;
pub const DEFAULT_KILL_GRACE_SECONDS: u64 = 10;
pub const DEFAULT_QUEUE_CONCURRENCY: usize = 1;
pub const DEFAULT_CORS_ORIGIN: &str = "http://localhost:3001";
pub const DEFAULT_RATE_LIMIT_PER_MINUTE: u32 = 60;
pub const DEFAULT_STATUS_TAIL_LINES: usize = 200;
pub const DEFAULT_JOB_RETENTION: usize = 500;
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 4000;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Static bearer token. `None` leaves the API open.
    pub api_key: Option<String>,
    /// Root every spawned command runs in and every path flag must stay inside.
    pub workspace_root: PathBuf,
    /// Injected as `--project-directory` when the caller gives none.
    pub default_project_dir: String,
    pub max_output_lines: usize,
    pub command_timeout: Duration,
    pub kill_grace: Duration,
    pub queue_concurrency: usize,
    /// `*` allows any origin.
    pub cors_origin: String,
    /// Requests per client per minute. `0` disables the limiter.
    pub rate_limit_per_minute: u32,
    pub status_tail_lines: usize,
    /// Terminal jobs kept in memory before the oldest are pruned.
    pub job_retention: usize,
    pub host: String,
    pub port: u16,
    /// Append `--progress plain` to `build` when no progress mode is given.
    pub inject_build_progress: bool,
    /// Executable spawned in place of `docker`. Used by tests and the `check`
    /// command; the policy still requires the literal `docker compose` prefix.
    pub program_override: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            workspace_root: PathBuf::from(DEFAULT_WORKSPACE),
            default_project_dir: DEFAULT_PROJECT_DIR.to_string(),
            max_output_lines: DEFAULT_MAX_OUTPUT_LINES,
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECONDS),
            kill_grace: Duration::from_secs(DEFAULT_KILL_GRACE_SECONDS),
            queue_concurrency: DEFAULT_QUEUE_CONCURRENCY,
            cors_origin: DEFAULT_CORS_ORIGIN.to_string(),
            rate_limit_per_minute: DEFAULT_RATE_LIMIT_PER_MINUTE,
            status_tail_lines: DEFAULT_STATUS_TAIL_LINES,
            job_retention: DEFAULT_JOB_RETENTION,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            inject_build_progress: true,
            program_override: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary variable source. `from_env` is this
    /// over the process environment.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let text = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let config = Self {
            api_key: text("ORCH_API_KEY"),
            workspace_root: match text("WORKSPACE").map(PathBuf::from) {
                Some(root) if root.is_relative() => std::env::current_dir()
                    .context("cannot anchor relative WORKSPACE")?
                    .join(root),
                Some(root) => root,
                None => defaults.workspace_root,
            },
            default_project_dir: text("DEFAULT_PROJECT_DIR")
                .unwrap_or(defaults.default_project_dir),
            max_output_lines: parse_var(&lookup, "MAX_OUTPUT_LINES", defaults.max_output_lines)?,
            command_timeout: Duration::from_secs(parse_var(
                &lookup,
                "COMMAND_TIMEOUT_SECONDS",
                DEFAULT_COMMAND_TIMEOUT_SECONDS,
            )?),
            kill_grace: Duration::from_secs(parse_var(
                &lookup,
                "KILL_GRACE_SECONDS",
                DEFAULT_KILL_GRACE_SECONDS,
            )?),
            queue_concurrency: parse_var(&lookup, "QUEUE_CONCURRENCY", defaults.queue_concurrency)?,
            cors_origin: text("CORS_ORIGIN").unwrap_or(defaults.cors_origin),
            rate_limit_per_minute: parse_var(
                &lookup,
                "RATE_LIMIT_PER_MINUTE",
                defaults.rate_limit_per_minute,
            )?,
            status_tail_lines: parse_var(&lookup, "STATUS_TAIL_LINES", defaults.status_tail_lines)?,
            job_retention: parse_var(&lookup, "JOB_RETENTION", defaults.job_retention)?,
            host: text("HOST").unwrap_or(defaults.host),
            port: parse_var(&lookup, "PORT", defaults.port)?,
            inject_build_progress: defaults.inject_build_progress,
            program_override: None,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.workspace_root.as_os_str().is_empty() {
            bail!("WORKSPACE must not be empty");
        }
        if self.max_output_lines == 0 {
            bail!("MAX_OUTPUT_LINES must be at least 1");
        }
        if self.queue_concurrency == 0 {
            bail!("QUEUE_CONCURRENCY must be at least 1");
        }
        if self.command_timeout.is_zero() {
            bail!("COMMAND_TIMEOUT_SECONDS must be at least 1");
        }
        if self.default_project_dir.trim().is_empty() {
            bail!("DEFAULT_PROJECT_DIR must not be empty");
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn auth_enabled(&self) -> bool {
        self.api_key.is_some()
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> anyhow::Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|err| anyhow::anyhow!("{err}"))
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
    }
}
