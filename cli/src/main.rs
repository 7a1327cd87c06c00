//! tether - run one supervised language server session from the terminal.
//!
//! ```text
//! tether run src/query.sql          # open files, run until Ctrl-C
//! tether exec genji.run '"select 1"'
//! tether check
//! ```
//!
//! Diagnostics go to `~/.tether/logs/tether.log`; user-facing errors and
//! revealed session output go to stderr.

mod host;

use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use tether_config::TetherConfig;
use tether_lsp::{ProcessFactory, SessionConfig, SessionState, Supervisor};

use crate::host::TerminalHost;

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Run a supervised language server session")]
struct Cli {
    /// Configuration file (default: ~/.tether/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Server id from the configuration (default: the first one)
    #[arg(long, global = true)]
    server: Option<String>,

    /// Answer error messages by printing the offered log
    #[arg(long, global = true)]
    reveal_on_error: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the session, open FILES, and run until Ctrl-C
    Run { files: Vec<PathBuf> },
    /// Execute one workspace command and print its JSON result
    Exec {
        command: String,
        /// Arguments as JSON; anything that does not parse is sent as a string
        args: Vec<String>,
    },
    /// Validate the configuration and list the configured servers
    Check,
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (log_file, init_warnings) = open_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
    for warning in init_warnings {
        tracing::warn!("{warning}");
    }
}

fn open_log_file() -> (Option<(PathBuf, fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&candidate)
        {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!(
                    "Failed to open log file {}: {e}",
                    candidate.display()
                ));
            }
        }
    }

    (None, warnings)
}

fn log_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    // Primary: ~/.tether/logs/tether.log
    if let Some(config_path) = TetherConfig::default_path()
        && let Some(config_dir) = config_path.parent()
    {
        candidates.push(config_dir.join("logs").join("tether.log"));
    }

    candidates.push(PathBuf::from(".tether").join("logs").join("tether.log"));

    candidates
}

fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn supervisor(reveal_on_error: bool) -> Supervisor {
    Supervisor::new(
        Arc::new(TerminalHost::new(reveal_on_error)),
        Arc::new(ProcessFactory),
    )
}

async fn run(config: SessionConfig, files: Vec<PathBuf>, reveal_on_error: bool) -> Result<()> {
    let language = config.default_language().unwrap_or("plaintext").to_string();
    let supervisor = supervisor(reveal_on_error);
    supervisor
        .start(config)
        .await
        .context("failed to start language server")?;

    for file in &files {
        let path = std::path::absolute(file)
            .with_context(|| format!("resolving {}", file.display()))?;
        let text = fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        supervisor.did_open(&path, &language, &text).await;
    }

    let mut status = supervisor.subscribe();
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("listening for Ctrl-C")?;
            tracing::info!("Interrupted, stopping session");
        }
        _ = status.wait_for(|s| s.state == SessionState::Stopped) => {
            tracing::info!("Session stopped on its own");
        }
    }

    supervisor.stop().await;
    Ok(())
}

async fn exec(
    config: SessionConfig,
    command: &str,
    args: &[String],
    reveal_on_error: bool,
) -> Result<()> {
    let supervisor = supervisor(reveal_on_error);
    supervisor
        .start(config)
        .await
        .context("failed to start language server")?;

    let result = supervisor
        .execute_command(command, args.iter().map(|a| parse_arg(a)).collect())
        .await;
    supervisor.stop().await;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn check(config: &TetherConfig) {
    for (id, server) in config.servers() {
        println!(
            "{id}: {} (budget {}, timeout {}s)",
            server.launch.program(),
            server.crash_budget,
            server.request_timeout().as_secs()
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let path = match cli.config {
        Some(path) => path,
        None => TetherConfig::default_path()
            .context("cannot determine the home directory; pass --config")?,
    };
    let config = TetherConfig::load(&path)?;

    if let Commands::Check = cli.command {
        check(&config);
        println!("{} server(s) configured in {}", config.servers().len(), path.display());
        return Ok(());
    }

    let session = config.server(cli.server.as_deref())?.clone();
    match cli.command {
        Commands::Run { files } => run(session, files, cli.reveal_on_error).await,
        Commands::Exec { command, args } => {
            exec(session, &command, &args, cli.reveal_on_error).await
        }
        Commands::Check => Ok(()),
    }
}
