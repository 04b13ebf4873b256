//! Process collaborator: spawning a language server and talking to its stdio.
//!
//! Sessions only see the [`ProcessSpawner`] and [`ServerProcess`] traits.
//! [`TokioSpawner`] is the real implementation; tests substitute in-memory
//! fakes.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::codec::FrameReader;
use crate::error::ProcessError;
use crate::rpc::{SendFut, lock};

/// Boxed future returned by process collaborator methods.
pub type ProcessFut<'a, T> = Pin<Box<dyn Future<Output = Result<T, ProcessError>> + Send + 'a>>;

const EVENT_CHANNEL_CAPACITY: usize = 256;

const WRITER_CHANNEL_CAPACITY: usize = 64;

/// How long `Exit` waits for stdout to drain after the child is reaped.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Environment variables stripped before spawning a server.
pub const ENV_SECRET_DENYLIST: [&str; 10] = [
    "*_KEY",
    "*_TOKEN",
    "*_SECRET",
    "*_PASSWORD",
    "*_CREDENTIAL*",
    "*_API_*",
    "AWS_*",
    "AZURE_*",
    "GH_*",
    "GITHUB_*",
];

/// Runtimes tried, in order, when a container names none.
const CONTAINER_RUNTIMES: [&str; 2] = ["podman", "docker"];

/// What to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnSpec {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

impl SpawnSpec {
    /// Run this command inside `container` with `<runtime> exec -i`.
    ///
    /// The server then sees the container's filesystem and environment; the
    /// workspace root must be mounted at the same path for URIs to resolve.
    #[must_use]
    pub fn in_container(self, runtime: &str, container: &str) -> Self {
        let mut args = vec![
            "exec".to_string(),
            "-i".to_string(),
            container.to_string(),
            self.command,
        ];
        args.extend(self.args);
        Self {
            command: runtime.to_string(),
            args,
            cwd: self.cwd,
        }
    }
}

/// First container runtime found on `PATH`.
#[must_use]
pub fn detect_container_runtime() -> Option<&'static str> {
    CONTAINER_RUNTIMES
        .into_iter()
        .find(|runtime| which::which(runtime).is_ok())
}

/// Output of a running server, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// One complete JSON-RPC body, already unframed.
    Message(String),
    /// One line the server wrote to stderr.
    Stderr(String),
    /// The process exited. Always the last event.
    Exit { code: Option<i32> },
}

/// A spawned server: its control handle and its event stream.
pub struct SpawnedProcess {
    pub handle: Arc<dyn ServerProcess>,
    pub events: mpsc::Receiver<ProcessEvent>,
}

/// Write/kill side of a running server process.
pub trait ServerProcess: Send + Sync {
    /// Write one framed message. Resolves after the bytes are flushed.
    fn send(&self, frame: String) -> SendFut;

    /// Terminate the process. Calling it again is harmless.
    fn kill(&self) -> ProcessFut<'static, ()>;
}

/// Starts server processes.
pub trait ProcessSpawner: Send + Sync {
    fn spawn<'a>(&'a self, spec: &'a SpawnSpec) -> ProcessFut<'a, SpawnedProcess>;
}

/// Spawns servers as tokio child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSpawner;

impl ProcessSpawner for TokioSpawner {
    fn spawn<'a>(&'a self, spec: &'a SpawnSpec) -> ProcessFut<'a, SpawnedProcess> {
        Box::pin(spawn_child(spec))
    }
}

struct WriteCommand {
    frame: String,
    ack: oneshot::Sender<Result<(), ProcessError>>,
}

/// Carries a kill request to the exit watcher, which answers on it.
type KillRequest = oneshot::Sender<Result<(), ProcessError>>;

struct TokioProcess {
    writer_tx: mpsc::Sender<WriteCommand>,
    kill_tx: Mutex<Option<oneshot::Sender<KillRequest>>>,
}

impl ServerProcess for TokioProcess {
    fn send(&self, frame: String) -> SendFut {
        let writer_tx = self.writer_tx.clone();
        Box::pin(async move {
            let (ack, written) = oneshot::channel();
            writer_tx
                .send(WriteCommand { frame, ack })
                .await
                .map_err(|_| ProcessError::Closed)?;
            written.await.map_err(|_| ProcessError::Closed)?
        })
    }

    fn kill(&self) -> ProcessFut<'static, ()> {
        let kill_tx = lock(&self.kill_tx).take();
        Box::pin(async move {
            let Some(tx) = kill_tx else {
                return Ok(());
            };
            let (request, killed) = oneshot::channel();
            if tx.send(request).is_err() {
                // The process already exited and was reaped.
                return Ok(());
            }
            killed.await.unwrap_or(Ok(()))
        })
    }
}

/// Denylist patterns carry `*` only at their ends: `*_KEY`, `AWS_*`,
/// `*_API_*`. `key` must already be uppercase.
fn denylisted(pattern: &str, key: &str) -> bool {
    let (open_start, rest) = match pattern.strip_prefix('*') {
        Some(rest) => (true, rest),
        None => (false, pattern),
    };
    let (open_end, needle) = match rest.strip_suffix('*') {
        Some(needle) => (true, needle),
        None => (false, rest),
    };
    match (open_start, open_end) {
        (true, true) => key.contains(needle),
        (true, false) => key.ends_with(needle),
        (false, true) => key.starts_with(needle),
        (false, false) => key == needle,
    }
}

fn is_secret_env(key: &str) -> bool {
    let key = key.to_ascii_uppercase();
    ENV_SECRET_DENYLIST
        .iter()
        .any(|pattern| denylisted(pattern, &key))
}

async fn spawn_child(spec: &SpawnSpec) -> Result<SpawnedProcess, ProcessError> {
    let resolved = which::which(&spec.command).map_err(|_| ProcessError::NotFound {
        command: spec.command.clone(),
    })?;

    let mut cmd = Command::new(&resolved);
    cmd.args(&spec.args)
        .current_dir(&spec.cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    for (key, _) in std::env::vars_os() {
        if key.to_str().is_some_and(is_secret_env) {
            cmd.env_remove(&key);
        }
    }

    let spawn_failed = |reason: String| ProcessError::Spawn {
        command: spec.command.clone(),
        reason,
    };
    let mut child = cmd.spawn().map_err(|e| spawn_failed(e.to_string()))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| spawn_failed("no stdin from child".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| spawn_failed("no stdout from child".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| spawn_failed("no stderr from child".to_string()))?;

    tracing::info!(server = %spec.command, pid = child.id(), "language server spawned");

    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (writer_tx, writer_rx) = mpsc::channel(WRITER_CHANNEL_CAPACITY);
    let (kill_tx, kill_rx) = oneshot::channel();

    tokio::spawn(write_loop(stdin, writer_rx, spec.command.clone()));
    let stderr = tokio::spawn(forward_stderr(stderr, events_tx.clone(), spec.command.clone()));
    let reader = tokio::spawn(read_loop(stdout, events_tx.clone(), spec.command.clone()));
    tokio::spawn(watch_exit(
        child,
        kill_rx,
        [reader, stderr],
        events_tx,
        spec.command.clone(),
    ));

    Ok(SpawnedProcess {
        handle: Arc::new(TokioProcess {
            writer_tx,
            kill_tx: Mutex::new(Some(kill_tx)),
        }),
        events: events_rx,
    })
}

async fn write_loop(mut stdin: ChildStdin, mut rx: mpsc::Receiver<WriteCommand>, server: String) {
    while let Some(WriteCommand { frame, ack }) = rx.recv().await {
        let written = async {
            stdin.write_all(frame.as_bytes()).await?;
            stdin.flush().await
        }
        .await
        .map_err(|e| ProcessError::Write(e.to_string()));

        let failed = written.is_err();
        if let Err(e) = &written {
            tracing::warn!(server = %server, "LSP write error: {e}");
        }
        let _ = ack.send(written);
        if failed {
            break;
        }
    }
}

async fn read_loop(stdout: ChildStdout, events: mpsc::Sender<ProcessEvent>, server: String) {
    let mut reader = FrameReader::new(stdout);
    loop {
        match reader.read_frame().await {
            Ok(Some(body)) => {
                if events.send(ProcessEvent::Message(body)).await.is_err() {
                    break;
                }
            }
            Ok(None) => {
                tracing::info!(server = %server, "language server closed stdout");
                break;
            }
            Err(e) => {
                tracing::warn!(server = %server, "LSP reader error: {e:#}");
                break;
            }
        }
    }
}

/// Language servers log to stderr. Lines reach the session as events,
/// never the protocol stream.
async fn forward_stderr(
    stderr: ChildStderr,
    events: mpsc::Sender<ProcessEvent>,
    server: String,
) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(server = %server, "stderr: {line}");
        if events.send(ProcessEvent::Stderr(line)).await.is_err() {
            break;
        }
    }
}

async fn watch_exit(
    mut child: Child,
    kill_rx: oneshot::Receiver<KillRequest>,
    readers: [JoinHandle<()>; 2],
    events: mpsc::Sender<ProcessEvent>,
    server: String,
) {
    // A dropped handle (kill_tx gone) also ends the process. Reaping wins
    // ties so a process that already exited is never killed.
    let status = tokio::select! {
        biased;
        status = child.wait() => status,
        request = kill_rx => {
            let killed = child
                .kill()
                .await
                .map_err(|e| ProcessError::Kill(e.to_string()));
            if let Err(e) = &killed {
                tracing::warn!(server = %server, "{e}");
            }
            let status = child.wait().await;
            if let Ok(request) = request {
                let _ = request.send(killed);
            }
            status
        }
    };
    let code = status.ok().and_then(|s| s.code());

    let drained = async {
        for reader in readers {
            let _ = reader.await;
        }
    };
    if tokio::time::timeout(READER_DRAIN_TIMEOUT, drained)
        .await
        .is_err()
    {
        tracing::debug!(server = %server, "output still open after exit; not waiting");
    }

    tracing::info!(server = %server, code, "language server exited");
    let _ = events.send(ProcessEvent::Exit { code }).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_denylist_strips_credentials() {
        for key in [
            "OPENAI_API_KEY",
            "NPM_TOKEN",
            "github_token",
            "GH_HOST",
            "AWS_PROFILE",
            "AZURE_TENANT_ID",
            "DB_PASSWORD",
            "GOOGLE_CREDENTIALS_FILE",
            "STRIPE_API_BASE",
        ] {
            assert!(is_secret_env(key), "{key} should be stripped");
        }
    }

    #[test]
    fn test_denylist_keeps_toolchain_env() {
        for key in [
            "PATH",
            "HOME",
            "CARGO_HOME",
            "RUSTUP_TOOLCHAIN",
            "GOPATH",
            "KEYRING",
            "MY_AWS",
            "CREDENTIAL",
        ] {
            assert!(!is_secret_env(key), "{key} should be passed through");
        }
    }

    #[test]
    fn test_denylisted_exact_pattern() {
        assert!(denylisted("NODE_AUTH", "NODE_AUTH"));
        assert!(!denylisted("NODE_AUTH", "NODE_AUTH_X"));
    }

    #[test]
    fn test_in_container_wraps_command() {
        let spec = SpawnSpec {
            command: "pyright-langserver".to_string(),
            args: vec!["--stdio".to_string()],
            cwd: PathBuf::from("/work"),
        }
        .in_container("podman", "dev-box");
        assert_eq!(spec.command, "podman");
        assert_eq!(
            spec.args,
            vec!["exec", "-i", "dev-box", "pyright-langserver", "--stdio"]
        );
        assert_eq!(spec.cwd, PathBuf::from("/work"));
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_is_not_found() {
        let spec = SpawnSpec {
            command: "tether-definitely-not-a-real-language-server".to_string(),
            args: Vec::new(),
            cwd: std::env::temp_dir(),
        };
        match TokioSpawner.spawn(&spec).await {
            Err(ProcessError::NotFound { command }) => assert_eq!(command, spec.command),
            Err(other) => panic!("expected NotFound, got {other}"),
            Ok(_) => panic!("spawn of a missing binary succeeded"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cat_echoes_frames_and_reports_exit() {
        let spec = SpawnSpec {
            command: "cat".to_string(),
            args: Vec::new(),
            cwd: std::env::temp_dir(),
        };
        let Ok(mut spawned) = TokioSpawner.spawn(&spec).await else {
            // No `cat` on this machine; nothing to exercise.
            return;
        };

        let body = r#"{"jsonrpc":"2.0","method":"ping"}"#;
        spawned
            .handle
            .send(crate::codec::encode(body))
            .await
            .unwrap();
        assert_eq!(
            spawned.events.recv().await,
            Some(ProcessEvent::Message(body.to_string()))
        );

        spawned.handle.kill().await.unwrap();
        spawned.handle.kill().await.unwrap();
        loop {
            match spawned.events.recv().await {
                Some(ProcessEvent::Exit { .. }) | None => break,
                Some(_) => {}
            }
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stderr_lines_arrive_as_events() {
        let spec = SpawnSpec {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), "echo 'indexing crate graph' >&2".to_string()],
            cwd: std::env::temp_dir(),
        };
        let Ok(mut spawned) = TokioSpawner.spawn(&spec).await else {
            return;
        };

        assert_eq!(
            spawned.events.recv().await,
            Some(ProcessEvent::Stderr("indexing crate graph".to_string()))
        );
        assert!(matches!(
            spawned.events.recv().await,
            Some(ProcessEvent::Exit { code: Some(0) })
        ));
    }
}
