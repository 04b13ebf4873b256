//! Tether CLI: drive a language server from the command line.
//!
//! ```text
//! tether check src/main.rs        # print diagnostics, exit 1 on errors
//! tether hover src/main.rs 12 8   # hover at 1-based line/column
//! tether servers                  # list configured servers
//! ```

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use tether_config::TetherConfig;
use tether_lsp::{
    DiagnosticsSink, DiagnosticsStore, DiagnosticsUpdate, FeatureResponse, LspManager, Session,
    TokioSpawner, path_to_file_uri,
};

/// Once diagnostics arrive, wait this long for a follow-up publish.
const DIAGNOSTICS_QUIET_PERIOD: Duration = Duration::from_millis(750);

#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (default: ~/.tether/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Workspace root handed to the server (default: current directory)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Echo what the language server writes to stderr
    #[arg(long, global = true)]
    server_stderr: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the diagnostics a language server reports for a file
    Check {
        file: PathBuf,
        /// Seconds to wait for the first diagnostics
        #[arg(long, default_value_t = 30)]
        wait: u64,
    },
    /// Print hover information at a 1-based line and column
    Hover { file: PathBuf, line: u32, column: u32 },
    /// List configured language servers
    Servers,
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
    if let Some(config_path) = TetherConfig::path()
        && let Some(config_dir) = config_path.parent()
    {
        candidates.push(config_dir.join("logs").join("tether.log"));
    }

    // Fallback: ./.tether/logs/tether.log
    candidates.push(PathBuf::from(".tether").join("logs").join("tether.log"));

    candidates
}

/// Applies updates to the store and reports which URI changed.
struct NotifyingStore {
    store: Arc<DiagnosticsStore>,
    updated: mpsc::UnboundedSender<String>,
}

impl DiagnosticsSink for NotifyingStore {
    fn publish(&self, update: DiagnosticsUpdate) {
        let uri = update.uri.clone();
        self.store.apply(update);
        let _ = self.updated.send(uri);
    }
}

struct Workspace {
    manager: LspManager,
    store: Arc<DiagnosticsStore>,
    updated: mpsc::UnboundedReceiver<String>,
    server_stderr: bool,
}

impl Workspace {
    fn new(config: TetherConfig, root: &Path, server_stderr: bool) -> Self {
        let store = Arc::new(DiagnosticsStore::new());
        let (updated_tx, updated) = mpsc::unbounded_channel();
        let sink = Arc::new(NotifyingStore {
            store: store.clone(),
            updated: updated_tx,
        });
        let manager = LspManager::new(config.lsp, root, Arc::new(TokioSpawner), sink);
        Self {
            manager,
            store,
            updated,
            server_stderr,
        }
    }

    /// Open `file` in its server. Returns the session and the file's URI.
    async fn open(&self, file: &Path) -> Result<(Session, String)> {
        let language = self
            .manager
            .language_for_path(file)
            .with_context(|| format!("no language server configured for {}", file.display()))?
            .to_string();
        let text = fs::read_to_string(file)
            .with_context(|| format!("reading {}", file.display()))?;
        let uri = path_to_file_uri(file)?.to_string();

        if self.server_stderr
            && let Some(session) = self.manager.get_session(&language)
        {
            let mut lines = session.subscribe_stderr();
            let language = language.clone();
            tokio::spawn(async move {
                loop {
                    match lines.recv().await {
                        Ok(line) => eprintln!("[{language}] {line}"),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            eprintln!("[{language}] ({skipped} lines skipped)");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
        }

        if !self.manager.document_opened(&language, &uri, &text).await {
            let state = self
                .manager
                .get_session(&language)
                .map(|session| session.state().to_string())
                .unwrap_or_else(|| "not configured".to_string());
            bail!("language server for '{language}' is not available ({state})");
        }
        let session = self
            .manager
            .get_session(&language)
            .with_context(|| format!("session for '{language}' disappeared"))?;
        Ok((session, uri))
    }

    /// Wait for the first diagnostics for `uri`, then until the server goes
    /// quiet. Gives up at `deadline`.
    async fn settle_diagnostics(&mut self, uri: &str, wait: Duration) {
        let deadline = Instant::now() + wait;
        let mut seen = false;
        loop {
            let until = if seen {
                (Instant::now() + DIAGNOSTICS_QUIET_PERIOD).min(deadline)
            } else {
                deadline
            };
            match tokio::time::timeout_at(until, self.updated.recv()).await {
                Ok(Some(updated)) => seen |= updated == uri,
                Ok(None) | Err(_) => break,
            }
        }
        if !seen {
            tracing::warn!(uri, "no diagnostics received before the deadline");
        }
    }
}

async fn check(mut workspace: Workspace, file: &Path, wait: Duration) -> Result<ExitCode> {
    let (_session, uri) = workspace.open(file).await?;
    workspace.settle_diagnostics(&uri, wait).await;

    let display = file.display().to_string();
    let diagnostics = workspace.store.for_uri(&uri);
    for diagnostic in &diagnostics {
        println!("{}", diagnostic.display_with_path(&display));
    }

    let snapshot = workspace.store.snapshot();
    eprintln!(
        "{} error(s), {} warning(s), {} info, {} hint(s)",
        snapshot.error_count(),
        snapshot.warning_count(),
        snapshot.info_count(),
        snapshot.hint_count()
    );

    workspace.manager.shutdown_all().await;
    let has_errors = diagnostics.iter().any(|d| d.severity().is_error());
    Ok(if has_errors {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

async fn hover(workspace: Workspace, file: &Path, line: u32, column: u32) -> Result<ExitCode> {
    let (session, uri) = workspace.open(file).await?;
    let response = session
        .hover(&uri, line.saturating_sub(1), column.saturating_sub(1))
        .await;
    workspace.manager.shutdown_all().await;

    match response? {
        FeatureResponse::Unsupported => {
            eprintln!("{} does not support hover", session.language());
            Ok(ExitCode::FAILURE)
        }
        FeatureResponse::Answered(serde_json::Value::Null) => {
            eprintln!("no hover information");
            Ok(ExitCode::SUCCESS)
        }
        FeatureResponse::Answered(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn servers(config: &TetherConfig) -> ExitCode {
    if !config.lsp.enabled {
        println!("LSP is disabled");
        return ExitCode::SUCCESS;
    }
    let mut languages: Vec<&String> = config.lsp.servers.keys().collect();
    languages.sort();
    for language in languages {
        let server = &config.lsp.servers[language];
        let mut command = server.command.clone();
        for arg in &server.args {
            command.push(' ');
            command.push_str(arg);
        }
        println!(
            "{language:<12} {command:<40} {}",
            server.file_extensions.join(", ")
        );
    }
    ExitCode::SUCCESS
}

fn absolute(path: &Path) -> Result<PathBuf> {
    fs::canonicalize(path).with_context(|| format!("resolving {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing();

    let config = match &cli.config {
        Some(path) => TetherConfig::load_from(path)?,
        None => TetherConfig::load(),
    };

    let root = match &cli.root {
        Some(root) => absolute(root)?,
        None => std::env::current_dir().context("reading current directory")?,
    };

    match cli.command {
        Command::Check { file, wait } => {
            let file = absolute(&file)?;
            check(
                Workspace::new(config, &root, cli.server_stderr),
                &file,
                Duration::from_secs(wait),
            )
            .await
        }
        Command::Hover { file, line, column } => {
            let file = absolute(&file)?;
            hover(Workspace::new(config, &root, cli.server_stderr), &file, line, column).await
        }
        Command::Servers => Ok(servers(&config)),
    }
}
