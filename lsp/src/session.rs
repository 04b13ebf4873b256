//! One language server session: spawn, `initialize` handshake, capability
//! gating and teardown.

use std::path::Path;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc, watch};

use crate::diagnostics::{self, DiagnosticsSink};
use crate::error::{RpcError, display_code};
use crate::process::{
    ProcessEvent, ProcessSpawner, ServerProcess, SpawnSpec, SpawnedProcess,
    detect_container_runtime,
};
use crate::protocol::{self, PathToUriError};
use crate::rpc::{RpcClient, SendFut, lock};
use crate::types::{Capabilities, FeatureResponse, ServerConfig, SessionState};

/// Upper bound on the graceful `shutdown` request.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

const PUBLISH_DIAGNOSTICS: &str = "textDocument/publishDiagnostics";

/// Stderr lines buffered per subscriber; slower subscribers skip ahead.
const STDERR_CAPACITY: usize = 256;

/// Everything a session needs to know about its server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Language classification; also the owner label on diagnostics.
    pub language: String,
    /// `languageId` sent in `didOpen`.
    pub language_id: String,
    pub spawn: SpawnSpec,
    pub root_uri: String,
    pub request_timeout: Duration,
}

impl SessionConfig {
    /// Build from a configured server. `root` must be absolute.
    ///
    /// A server with a `container` runs through `<runtime> exec -i`. Without
    /// an explicit runtime, the first of podman and docker on `PATH` is
    /// used, and podman is assumed when neither is found.
    pub fn new(
        language: &str,
        server: &ServerConfig,
        root: &Path,
        request_timeout: Duration,
    ) -> Result<Self, PathToUriError> {
        let root_uri = protocol::path_to_file_uri(root)?.to_string();
        let mut spawn = SpawnSpec {
            command: server.command.clone(),
            args: server.args.clone(),
            cwd: root.to_path_buf(),
        };
        if let Some(container) = &server.container {
            let runtime = match container.runtime.as_deref() {
                Some(runtime) => runtime,
                None => detect_container_runtime().unwrap_or("podman"),
            };
            spawn = spawn.in_container(runtime, &container.name);
        }
        Ok(Self {
            language: language.to_string(),
            language_id: server
                .language_id
                .clone()
                .unwrap_or_else(|| language.to_string()),
            spawn,
            root_uri,
            request_timeout,
        })
    }
}

#[derive(Default)]
struct Runtime {
    disposed: bool,
    process: Option<Arc<dyn ServerProcess>>,
    rpc: Option<RpcClient>,
    capabilities: Option<Capabilities>,
}

struct SessionInner {
    config: SessionConfig,
    spawner: Arc<dyn ProcessSpawner>,
    sink: Arc<dyn DiagnosticsSink>,
    state: watch::Sender<SessionState>,
    stderr: broadcast::Sender<String>,
    runtime: Mutex<Runtime>,
}

/// Handle to a language server session. Clones share the session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    #[must_use]
    pub fn new(
        config: SessionConfig,
        spawner: Arc<dyn ProcessSpawner>,
        sink: Arc<dyn DiagnosticsSink>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        let (stderr, _) = broadcast::channel(STDERR_CAPACITY);
        Self {
            inner: Arc::new(SessionInner {
                config,
                spawner,
                sink,
                state,
                stderr,
                runtime: Mutex::new(Runtime::default()),
            }),
        }
    }

    #[must_use]
    pub fn language(&self) -> &str {
        &self.inner.config.language
    }

    #[must_use]
    pub fn language_id(&self) -> &str {
        &self.inner.config.language_id
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.state.borrow().clone()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        *self.inner.state.borrow() == SessionState::Ready
    }

    /// Capabilities negotiated during `initialize`. `None` until then.
    #[must_use]
    pub fn capabilities(&self) -> Option<Capabilities> {
        lock(&self.inner.runtime).capabilities
    }

    /// Observe state transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Lines the server writes to stderr from now on. Servers report crashes
    /// and configuration problems there.
    #[must_use]
    pub fn subscribe_stderr(&self) -> broadcast::Receiver<String> {
        self.inner.stderr.subscribe()
    }

    /// Wait until the session leaves the startup states. Returns whether it
    /// became ready.
    ///
    /// Never resolves for a session that is never started.
    pub async fn wait_ready(&self) -> bool {
        let mut rx = self.inner.state.subscribe();
        rx.wait_for(SessionState::is_settled)
            .await
            .is_ok_and(|state| *state == SessionState::Ready)
    }

    /// Returns `true` if the state was changed.
    fn transition(&self, next: impl FnOnce(&SessionState) -> Option<SessionState>) -> bool {
        self.inner.state.send_if_modified(|state| match next(state) {
            Some(next) => {
                *state = next;
                true
            }
            None => false,
        })
    }

    /// Spawn the server and run the `initialize` handshake.
    ///
    /// Runs at most once; later calls and calls after [`dispose`](Self::dispose)
    /// return immediately.
    pub async fn start(&self) {
        if !self.transition(|state| (*state == SessionState::Idle).then_some(SessionState::Spawning))
        {
            return;
        }

        let config = &self.inner.config;
        tracing::info!(
            language = %config.language,
            server = %config.spawn.command,
            "starting language server"
        );

        let SpawnedProcess { handle, events } = match self.inner.spawner.spawn(&config.spawn).await
        {
            Ok(spawned) => spawned,
            Err(e) => {
                tracing::warn!(language = %config.language, "language server spawn failed: {e}");
                self.transition(|state| {
                    (*state == SessionState::Spawning).then(|| SessionState::Failed(e.to_string()))
                });
                return;
            }
        };

        let rpc = RpcClient::new(
            {
                let writer = handle.clone();
                move |frame: String| -> SendFut { writer.send(frame) }
            },
            config.request_timeout,
        );

        // Before `initialize`: some servers publish during the handshake.
        rpc.on_notification(PUBLISH_DIAGNOSTICS, {
            let owner = config.language.clone();
            let sink = self.inner.sink.clone();
            move |params| {
                let Some(params) = params else {
                    tracing::debug!(language = %owner, "publishDiagnostics without params");
                    return;
                };
                match diagnostics::translate(&owner, params) {
                    Ok(update) => sink.publish(update),
                    Err(e) => {
                        tracing::debug!(language = %owner, "dropping malformed publishDiagnostics: {e}");
                    }
                }
            }
        });

        let disposed = {
            let mut runtime = lock(&self.inner.runtime);
            if !runtime.disposed {
                runtime.process = Some(handle.clone());
                runtime.rpc = Some(rpc.clone());
            }
            runtime.disposed
        };
        if disposed {
            tracing::debug!(language = %config.language, "spawn finished after dispose; killing");
            if let Err(e) = handle.kill().await {
                tracing::warn!(language = %config.language, "kill failed: {e}");
            }
            return;
        }

        if !self.transition(|state| {
            (*state == SessionState::Spawning).then_some(SessionState::Initializing)
        }) {
            return;
        }
        tokio::spawn(pump(
            Arc::downgrade(&self.inner),
            rpc.clone(),
            events,
            self.inner.stderr.clone(),
        ));

        let root_uri = &config.root_uri;
        match rpc
            .request("initialize", Some(protocol::initialize_params(root_uri)))
            .await
        {
            Ok(result) => self.finish_initialize(&rpc, &result).await,
            Err(e) => {
                tracing::warn!(language = %config.language, "initialize failed: {e}");
                let failed = self.transition(|state| {
                    (*state == SessionState::Initializing)
                        .then(|| SessionState::Failed(format!("initialize failed: {e}")))
                });
                if failed {
                    self.kill_process().await;
                }
            }
        }
    }

    async fn finish_initialize(&self, rpc: &RpcClient, result: &Value) {
        let capabilities = Capabilities::from_initialize_result(result);
        {
            let mut runtime = lock(&self.inner.runtime);
            if runtime.disposed {
                return;
            }
            runtime.capabilities = Some(capabilities);
        }

        if let Err(e) = rpc.notify("initialized", Some(json!({}))).await {
            tracing::warn!(language = %self.language(), "sending initialized failed: {e}");
        }

        if self.transition(|state| {
            (*state == SessionState::Initializing).then_some(SessionState::Ready)
        }) {
            tracing::info!(language = %self.language(), ?capabilities, "language server ready");
        }
    }

    fn on_exit(&self, code: Option<i32>) {
        let changed = self.transition(|state| match state {
            SessionState::Ready => Some(SessionState::Stopped),
            SessionState::Spawning | SessionState::Initializing => Some(SessionState::Failed(
                format!(
                    "language server exited during initialization (code {})",
                    display_code(&code)
                ),
            )),
            _ => None,
        });
        if changed {
            tracing::info!(language = %self.language(), code, state = %self.state(), "language server exited");
        }
    }

    async fn kill_process(&self) {
        let process = lock(&self.inner.runtime).process.take();
        if let Some(process) = process
            && let Err(e) = process.kill().await
        {
            tracing::warn!(language = %self.language(), "kill failed: {e}");
        }
    }

    /// Tear the session down: reject pending requests and kill the server.
    /// Idempotent.
    pub async fn dispose(&self) {
        let (process, rpc) = {
            let mut runtime = lock(&self.inner.runtime);
            if runtime.disposed {
                return;
            }
            runtime.disposed = true;
            (runtime.process.take(), runtime.rpc.take())
        };
        self.inner.state.send_replace(SessionState::Disposed);
        tracing::info!(language = %self.language(), "disposing session");

        if let Some(rpc) = rpc {
            rpc.dispose();
        }
        if let Some(process) = process
            && let Err(e) = process.kill().await
        {
            tracing::warn!(language = %self.language(), "kill failed: {e}");
        }
    }

    /// Graceful teardown: `shutdown` + `exit` when ready, then
    /// [`dispose`](Self::dispose).
    pub async fn shutdown(&self) {
        if let Some(rpc) = self.ready_rpc(|_| true) {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, rpc.request("shutdown", None)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::debug!(language = %self.language(), "shutdown request failed: {e}"),
                Err(_) => tracing::debug!(language = %self.language(), "shutdown request timed out"),
            }
            if let Err(e) = rpc.notify("exit", None).await {
                tracing::debug!(language = %self.language(), "exit notification failed: {e}");
            }
        }
        self.dispose().await;
    }

    fn ready_rpc(&self, supported: impl FnOnce(&Capabilities) -> bool) -> Option<RpcClient> {
        if !self.is_ready() {
            return None;
        }
        let runtime = lock(&self.inner.runtime);
        let capabilities = runtime.capabilities?;
        if !supported(&capabilities) {
            return None;
        }
        runtime.rpc.clone()
    }

    async fn feature(
        &self,
        method: &str,
        supported: fn(&Capabilities) -> bool,
        params: Value,
    ) -> Result<FeatureResponse, RpcError> {
        let Some(rpc) = self.ready_rpc(supported) else {
            tracing::trace!(language = %self.language(), method, "feature unsupported");
            return Ok(FeatureResponse::Unsupported);
        };
        rpc.request(method, Some(params))
            .await
            .map(FeatureResponse::Answered)
    }

    pub async fn completion(
        &self,
        uri: &str,
        line: u32,
        character: u32,
    ) -> Result<FeatureResponse, RpcError> {
        self.feature(
            "textDocument/completion",
            |c| c.completion,
            protocol::text_document_position(uri, line, character),
        )
        .await
    }

    pub async fn hover(
        &self,
        uri: &str,
        line: u32,
        character: u32,
    ) -> Result<FeatureResponse, RpcError> {
        self.feature(
            "textDocument/hover",
            |c| c.hover,
            protocol::text_document_position(uri, line, character),
        )
        .await
    }

    pub async fn definition(
        &self,
        uri: &str,
        line: u32,
        character: u32,
    ) -> Result<FeatureResponse, RpcError> {
        self.feature(
            "textDocument/definition",
            |c| c.definition,
            protocol::text_document_position(uri, line, character),
        )
        .await
    }

    pub async fn signature_help(
        &self,
        uri: &str,
        line: u32,
        character: u32,
    ) -> Result<FeatureResponse, RpcError> {
        self.feature(
            "textDocument/signatureHelp",
            |c| c.signature_help,
            protocol::text_document_position(uri, line, character),
        )
        .await
    }

    /// Find references, declaration included.
    pub async fn references(
        &self,
        uri: &str,
        line: u32,
        character: u32,
    ) -> Result<FeatureResponse, RpcError> {
        self.feature(
            "textDocument/references",
            |c| c.references,
            protocol::reference_params(uri, line, character),
        )
        .await
    }

    pub async fn formatting(
        &self,
        uri: &str,
        tab_size: u32,
        insert_spaces: bool,
    ) -> Result<FeatureResponse, RpcError> {
        self.feature(
            "textDocument/formatting",
            |c| c.document_formatting,
            protocol::formatting_params(uri, tab_size, insert_spaces),
        )
        .await
    }

    async fn notify_ready(&self, method: &str, params: Value) {
        let Some(rpc) = self.ready_rpc(|_| true) else {
            tracing::trace!(language = %self.language(), method, "session not ready; dropping notification");
            return;
        };
        if let Err(e) = rpc.notify(method, Some(params)).await {
            tracing::warn!(language = %self.language(), method, "notification failed: {e}");
        }
    }

    pub async fn did_open(&self, uri: &str, version: i32, text: &str) {
        let params = protocol::did_open_params(uri, self.language_id(), version, text);
        self.notify_ready("textDocument/didOpen", params).await;
    }

    /// Full-document sync.
    pub async fn did_change(&self, uri: &str, version: i32, text: &str) {
        self.notify_ready(
            "textDocument/didChange",
            protocol::did_change_params(uri, version, text),
        )
        .await;
    }

    pub async fn did_close(&self, uri: &str) {
        self.notify_ready("textDocument/didClose", protocol::did_close_params(uri))
            .await;
    }

    pub async fn did_save(&self, uri: &str, text: Option<&str>) {
        self.notify_ready("textDocument/didSave", protocol::did_save_params(uri, text))
            .await;
    }
}

/// Deliver process events to the correlator in arrival order.
async fn pump(
    session: Weak<SessionInner>,
    rpc: RpcClient,
    mut events: mpsc::Receiver<ProcessEvent>,
    stderr: broadcast::Sender<String>,
) {
    let mut exit_code = None;
    while let Some(event) = events.recv().await {
        match event {
            ProcessEvent::Message(body) => rpc.handle_message(&body),
            ProcessEvent::Stderr(line) => {
                // No subscribers is fine.
                let _ = stderr.send(line);
            }
            ProcessEvent::Exit { code } => {
                exit_code = code;
                break;
            }
        }
    }

    rpc.server_exited(exit_code);
    if let Some(inner) = session.upgrade() {
        Session { inner }.on_exit(exit_code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::error::ProcessError;
    use crate::process::ProcessFut;
    use crate::types::DiagnosticsUpdate;

    /// Spawner that always fails, counting attempts.
    #[derive(Default)]
    struct FailingSpawner {
        attempts: AtomicUsize,
    }

    impl ProcessSpawner for FailingSpawner {
        fn spawn<'a>(&'a self, spec: &'a SpawnSpec) -> ProcessFut<'a, SpawnedProcess> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                Err(ProcessError::NotFound {
                    command: spec.command.clone(),
                })
            })
        }
    }

    fn root() -> PathBuf {
        std::env::temp_dir()
    }

    fn config() -> SessionConfig {
        let server = ServerConfig {
            command: "missing-ls".to_string(),
            args: vec!["--stdio".to_string()],
            language_id: None,
            file_extensions: vec!["ts".to_string()],
            container: None,
        };
        SessionConfig::new("typescript", &server, &root(), Duration::from_secs(30)).unwrap()
    }

    fn session(spawner: Arc<FailingSpawner>) -> Session {
        let sink: Arc<dyn DiagnosticsSink> = Arc::new(|_: DiagnosticsUpdate| {});
        Session::new(config(), spawner, sink)
    }

    #[test]
    fn test_config_defaults_language_id_to_classification() {
        let config = config();
        assert_eq!(config.language, "typescript");
        assert_eq!(config.language_id, "typescript");
        assert_eq!(config.spawn.command, "missing-ls");
        assert_eq!(config.spawn.args, vec!["--stdio"]);
        assert_eq!(config.spawn.cwd, root());
        assert!(config.root_uri.starts_with("file://"));
    }

    #[test]
    fn test_config_explicit_language_id() {
        let server = ServerConfig {
            command: "clangd".to_string(),
            args: Vec::new(),
            language_id: Some("cpp".to_string()),
            file_extensions: Vec::new(),
            container: None,
        };
        let config = SessionConfig::new("c-family", &server, &root(), Duration::from_secs(1))
            .unwrap();
        assert_eq!(config.language_id, "cpp");
    }

    #[test]
    fn test_config_runs_server_in_container() {
        let server = ServerConfig {
            command: "gopls".to_string(),
            args: vec!["serve".to_string()],
            language_id: None,
            file_extensions: Vec::new(),
            container: Some(crate::types::ContainerConfig {
                name: "go-dev".to_string(),
                runtime: Some("docker".to_string()),
            }),
        };
        let config = SessionConfig::new("go", &server, &root(), Duration::from_secs(1)).unwrap();
        assert_eq!(config.spawn.command, "docker");
        assert_eq!(config.spawn.args, vec!["exec", "-i", "go-dev", "gopls", "serve"]);
        assert_eq!(config.spawn.cwd, root());
    }

    #[test]
    fn test_config_rejects_relative_root() {
        let server = ServerConfig {
            command: "gopls".to_string(),
            args: Vec::new(),
            language_id: None,
            file_extensions: Vec::new(),
            container: None,
        };
        assert!(
            SessionConfig::new("go", &server, Path::new("relative/dir"), Duration::from_secs(1))
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_spawn_failure_settles_failed() {
        let spawner = Arc::new(FailingSpawner::default());
        let session = session(spawner.clone());
        assert_eq!(session.state(), SessionState::Idle);

        session.start().await;
        match session.state() {
            SessionState::Failed(reason) => assert!(reason.contains("missing-ls")),
            other => panic!("expected failed, got {other}"),
        }
        assert!(!session.wait_ready().await);
        assert!(session.capabilities().is_none());
        assert!(
            session
                .hover("file:///a.ts", 0, 0)
                .await
                .unwrap()
                .is_unsupported()
        );
    }

    #[tokio::test]
    async fn test_start_runs_once() {
        let spawner = Arc::new(FailingSpawner::default());
        let session = session(spawner.clone());
        session.start().await;
        session.start().await;
        assert_eq!(spawner.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_start_after_dispose_is_noop() {
        let spawner = Arc::new(FailingSpawner::default());
        let session = session(spawner.clone());

        session.dispose().await;
        session.dispose().await;
        session.start().await;

        assert_eq!(spawner.attempts.load(Ordering::SeqCst), 0);
        assert_eq!(session.state(), SessionState::Disposed);
        assert!(!session.wait_ready().await);
    }

    #[tokio::test]
    async fn test_notifications_before_ready_are_noops() {
        let session = session(Arc::new(FailingSpawner::default()));
        session.did_open("file:///a.ts", 1, "let x = 1;").await;
        session.did_change("file:///a.ts", 2, "let x = 2;").await;
        session.did_save("file:///a.ts", None).await;
        session.did_close("file:///a.ts").await;
        assert_eq!(session.state(), SessionState::Idle);
    }
}
