use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use dockhand_client::{JobWatcher, OrchestratorClient, WatchEvent, WatchOutcome, WatchPhase};
use dockhand_core::{CommandPolicy, OrchestratorConfig};
use dockhand_observability::{
    emit_event, init_process_logging, logs_dir_from_env, redact_text, ObservabilityEvent,
    ProcessKind, DEFAULT_LOG_RETENTION_DAYS,
};
use dockhand_server::{serve, AppState};
use dockhand_types::JobStatus;
use tokio::sync::mpsc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "dockhand-engine")]
#[command(about = "Queue, run and stream constrained docker compose commands")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP API and the worker pool.
    Serve(ServeArgs),
    /// Validate a command offline and print the argv that would run.
    Check {
        command: String,
        #[arg(long, env = "WORKSPACE")]
        workspace: Option<PathBuf>,
    },
    /// Submit a command to a running server and follow its output.
    Run {
        command: String,
        #[arg(long, env = "DOCKHAND_URL", default_value = "http://127.0.0.1:4000")]
        server: String,
        #[arg(long, env = "ORCH_API_KEY", hide_env_values = true)]
        token: Option<String>,
        /// Reconnect attempts before giving up on a dropped stream.
        #[arg(long, default_value_t = 8)]
        max_reconnects: u32,
    },
}

/// Flags override the environment-derived configuration.
#[derive(Args, Debug, Default)]
struct ServeArgs {
    #[arg(long, alias = "hostname")]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    workspace: Option<PathBuf>,
    #[arg(long)]
    api_key: Option<String>,
    #[arg(long)]
    concurrency: Option<usize>,
    #[arg(long)]
    timeout_seconds: Option<u64>,
    #[arg(long)]
    cors_origin: Option<String>,
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve(args) => {
            let logs_dir = args.log_dir.clone().unwrap_or_else(logs_dir_from_env);
            let (_log_guard, log_info) =
                init_process_logging(ProcessKind::Engine, &logs_dir, DEFAULT_LOG_RETENTION_DAYS)?;
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Engine,
                ObservabilityEvent::new("engine.main", "logging.initialized")
                    .status("ok")
                    .detail("engine jsonl logging initialized"),
            );
            info!("engine logging initialized: {:?}", log_info);

            let config = apply_serve_overrides(OrchestratorConfig::from_env()?, args);
            config.validate()?;
            let addr: SocketAddr = config
                .bind_addr()
                .parse()
                .context("invalid host or port")?;
            log_startup(&config, &addr);
            serve(addr, AppState::new(config)).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Check { command, workspace } => {
            let mut config = OrchestratorConfig::from_env()?;
            if let Some(workspace) = workspace {
                config.workspace_root = workspace;
            }
            match check_command(&config, &command) {
                Ok(argv) => {
                    println!("{argv}");
                    Ok(ExitCode::SUCCESS)
                }
                Err(reason) => {
                    eprintln!("rejected: {reason}");
                    Ok(ExitCode::from(2))
                }
            }
        }
        Command::Run {
            command,
            server,
            token,
            max_reconnects,
        } => {
            let (_log_guard, _) = init_process_logging(
                ProcessKind::Cli,
                &logs_dir_from_env(),
                DEFAULT_LOG_RETENTION_DAYS,
            )?;
            let client = OrchestratorClient::new(server, token.as_deref())?;
            let policy = dockhand_client::ReconnectPolicy {
                max_attempts: max_reconnects,
                ..Default::default()
            };
            let mut watcher = JobWatcher::new(client).with_policy(policy);
            let (tx, rx) = mpsc::unbounded_channel();
            let printer = tokio::spawn(print_events(rx));
            let result = watcher.run(&command, &tx).await;
            drop(tx);
            let _ = printer.await;
            let outcome = result?;
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Cli,
                ObservabilityEvent::new("engine.run", "run.finished")
                    .job(&outcome.job_id)
                    .run(Some(outcome.run_id.as_str()))
                    .status(outcome.status.map(JobStatus::as_str).unwrap_or("none")),
            );
            Ok(ExitCode::from(exit_status_for(&outcome)))
        }
    }
}

fn apply_serve_overrides(mut config: OrchestratorConfig, args: ServeArgs) -> OrchestratorConfig {
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(workspace) = args.workspace {
        config.workspace_root = workspace;
    }
    if let Some(api_key) = args.api_key.filter(|key| !key.trim().is_empty()) {
        config.api_key = Some(api_key);
    }
    if let Some(concurrency) = args.concurrency {
        config.queue_concurrency = concurrency;
    }
    if let Some(seconds) = args.timeout_seconds {
        config.command_timeout = Duration::from_secs(seconds);
    }
    if let Some(origin) = args.cors_origin {
        config.cors_origin = origin;
    }
    config
}

fn check_command(config: &OrchestratorConfig, command: &str) -> Result<String, String> {
    CommandPolicy::from_config(config)
        .validate(command)
        .map(|validated| validated.display())
        .map_err(|rejection| rejection.to_string())
}

fn log_startup(config: &OrchestratorConfig, addr: &SocketAddr) {
    let key = config
        .api_key
        .as_deref()
        .map(redact_text)
        .unwrap_or_else(|| "none".to_string());
    info!(
        %addr,
        workspace = %config.workspace_root.display(),
        workers = config.queue_concurrency,
        timeout_s = config.command_timeout.as_secs(),
        api_key = %key,
        "dockhand engine starting"
    );
    if config.api_key.is_none() {
        tracing::warn!("ORCH_API_KEY is not set; the API accepts unauthenticated calls");
    }
}

async fn print_events(mut rx: mpsc::UnboundedReceiver<WatchEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            WatchEvent::Line(line) => println!("{line}"),
            WatchEvent::StreamReset => eprintln!("-- reconnected, replaying output --"),
            WatchEvent::Phase(WatchPhase::Reconnecting) => eprintln!("-- connection lost --"),
            WatchEvent::Phase(_) => {}
            WatchEvent::Completed { status, exit_code } => {
                let status = status.map(JobStatus::as_str).unwrap_or("unknown");
                match exit_code {
                    Some(code) => eprintln!("-- job {status} (exit {code}) --"),
                    None => eprintln!("-- job {status} --"),
                }
            }
        }
    }
}

/// Mirrors the job's exit code when it has one. Superseded runs exit 3.
fn exit_status_for(outcome: &WatchOutcome) -> u8 {
    match (outcome.phase, outcome.status, outcome.exit_code) {
        (WatchPhase::Superseded, _, _) => 3,
        (_, Some(JobStatus::Succeeded), _) => 0,
        (_, _, Some(code)) if (1..=255).contains(&code) => code as u8,
        _ => 1,
    }
}
