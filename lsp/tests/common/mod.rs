//! In-memory language server for integration tests.
//!
//! [`FakeSpawner`] hands out [`FakeServer`]s: the test side of a process
//! whose stdin is a channel of frames and whose stdout is a channel of
//! [`ProcessEvent`]s.

#![allow(dead_code)]

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{Notify, OwnedMutexGuard, mpsc};

use tether_lsp::{
    DiagnosticsStore, ProcessError, ProcessEvent, ProcessFut, ProcessSpawner, SendFut,
    ServerProcess, Session, SessionConfig, SpawnSpec, SpawnedProcess,
};

const FRAME_WAIT: Duration = Duration::from_secs(5);

/// Writes wait on this while the test holds it.
type WriteGate = Arc<tokio::sync::Mutex<()>>;

struct FakeProcess {
    frames: mpsc::UnboundedSender<String>,
    events: mpsc::Sender<ProcessEvent>,
    kills: Arc<AtomicUsize>,
    writes: WriteGate,
}

impl ServerProcess for FakeProcess {
    fn send(&self, frame: String) -> SendFut {
        let frames = self.frames.clone();
        let writes = self.writes.clone();
        Box::pin(async move {
            let _open = writes.lock().await;
            frames.send(frame).map_err(|_| ProcessError::Closed)
        })
    }

    fn kill(&self) -> ProcessFut<'static, ()> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        let _ = self.events.try_send(ProcessEvent::Exit { code: None });
        Box::pin(async { Ok(()) })
    }
}

/// Test side of a fake server process.
pub struct FakeServer {
    frames: mpsc::UnboundedReceiver<String>,
    events: mpsc::Sender<ProcessEvent>,
    kills: Arc<AtomicUsize>,
    writes: WriteGate,
}

fn parse_frame(frame: &str) -> Value {
    let (header, body) = frame
        .split_once("\r\n\r\n")
        .expect("frame has a header separator");
    assert_eq!(header, format!("Content-Length: {}", body.len()));
    serde_json::from_str(body).expect("frame body is JSON")
}

impl FakeServer {
    /// Next message the client wrote.
    pub async fn next_message(&mut self) -> Value {
        let frame = tokio::time::timeout(FRAME_WAIT, self.frames.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("client side closed");
        parse_frame(&frame)
    }

    /// A message the client already wrote, if any.
    pub fn try_next_message(&mut self) -> Option<Value> {
        self.frames.try_recv().ok().map(|frame| parse_frame(&frame))
    }

    pub async fn expect_request(&mut self, method: &str) -> (u64, Value) {
        let message = self.next_message().await;
        assert_eq!(message["method"], method, "unexpected message: {message}");
        let id = message["id"].as_u64().expect("request has a numeric id");
        (id, message["params"].clone())
    }

    pub async fn expect_notification(&mut self, method: &str) -> Value {
        let message = self.next_message().await;
        assert_eq!(message["method"], method, "unexpected message: {message}");
        assert!(message.get("id").is_none(), "notification carries an id");
        message["params"].clone()
    }

    pub async fn send_raw(&self, body: String) {
        // The session may already have gone away.
        let _ = self.events.send(ProcessEvent::Message(body)).await;
    }

    pub async fn reply(&self, id: u64, result: Value) {
        self.send_raw(json!({"jsonrpc": "2.0", "id": id, "result": result}).to_string())
            .await;
    }

    pub async fn reply_error(&self, id: u64, code: i64, message: &str) {
        self.send_raw(
            json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
                .to_string(),
        )
        .await;
    }

    pub async fn notify(&self, method: &str, params: Value) {
        self.send_raw(json!({"jsonrpc": "2.0", "method": method, "params": params}).to_string())
            .await;
    }

    pub async fn stderr(&self, line: &str) {
        let _ = self.events.send(ProcessEvent::Stderr(line.to_string())).await;
    }

    /// Client writes stall until the returned guard is dropped.
    pub async fn hold_writes(&self) -> OwnedMutexGuard<()> {
        self.writes.clone().lock_owned().await
    }

    pub async fn exit(&self, code: Option<i32>) {
        let _ = self.events.send(ProcessEvent::Exit { code }).await;
    }

    pub fn kill_count(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    /// Answer `initialize` with `capabilities` and consume `initialized`.
    pub async fn handshake(&mut self, capabilities: Value) -> Value {
        let (id, params) = self.expect_request("initialize").await;
        self.reply(id, json!({ "capabilities": capabilities })).await;
        self.expect_notification("initialized").await;
        params
    }
}

/// Servers handed out by a [`FakeSpawner`], in spawn order.
pub type Servers = mpsc::UnboundedReceiver<FakeServer>;

/// Spawner producing [`FakeServer`]s.
pub struct FakeSpawner {
    servers: mpsc::UnboundedSender<FakeServer>,
    specs: Mutex<Vec<SpawnSpec>>,
    fail: bool,
    gate: Option<Arc<Notify>>,
}

impl FakeSpawner {
    fn build(fail: bool, gate: Option<Arc<Notify>>) -> (Arc<Self>, Servers) {
        let (servers, rx) = mpsc::unbounded_channel();
        let spawner = Arc::new(Self {
            servers,
            specs: Mutex::new(Vec::new()),
            fail,
            gate,
        });
        (spawner, rx)
    }

    pub fn new() -> (Arc<Self>, Servers) {
        Self::build(false, None)
    }

    /// Every spawn fails with `NotFound`.
    pub fn failing() -> Arc<Self> {
        Self::build(true, None).0
    }

    /// Spawns block until the returned gate is notified.
    pub fn gated() -> (Arc<Self>, Servers, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let (spawner, rx) = Self::build(false, Some(gate.clone()));
        (spawner, rx, gate)
    }

    pub fn specs(&self) -> Vec<SpawnSpec> {
        self.specs.lock().unwrap().clone()
    }
}

impl ProcessSpawner for FakeSpawner {
    fn spawn<'a>(&'a self, spec: &'a SpawnSpec) -> ProcessFut<'a, SpawnedProcess> {
        Box::pin(async move {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.specs.lock().unwrap().push(spec.clone());
            if self.fail {
                return Err(ProcessError::NotFound {
                    command: spec.command.clone(),
                });
            }

            let (frames_tx, frames_rx) = mpsc::unbounded_channel();
            let (events_tx, events_rx) = mpsc::channel(64);
            let kills = Arc::new(AtomicUsize::new(0));
            let writes = WriteGate::default();
            let _ = self.servers.send(FakeServer {
                frames: frames_rx,
                events: events_tx.clone(),
                kills: kills.clone(),
                writes: writes.clone(),
            });
            Ok(SpawnedProcess {
                handle: Arc::new(FakeProcess {
                    frames: frames_tx,
                    events: events_tx,
                    kills,
                    writes,
                }),
                events: events_rx,
            })
        })
    }
}

pub fn root() -> PathBuf {
    std::env::temp_dir()
}

pub fn session_config(language: &str) -> SessionConfig {
    let server = tether_lsp::ServerConfig {
        command: format!("{language}-ls"),
        args: vec!["--stdio".to_string()],
        language_id: None,
        file_extensions: Vec::new(),
        container: None,
    };
    SessionConfig::new(language, &server, &root(), Duration::from_secs(30)).unwrap()
}

pub struct Harness {
    pub session: Session,
    pub server: FakeServer,
    pub store: Arc<DiagnosticsStore>,
    pub initialize_params: Value,
}

/// A `rust` session that completed its handshake with `capabilities`.
pub async fn ready_session(capabilities: Value) -> Harness {
    let (spawner, mut servers) = FakeSpawner::new();
    let store = Arc::new(DiagnosticsStore::new());
    let session = Session::new(session_config("rust"), spawner, store.clone());
    tokio::spawn({
        let session = session.clone();
        async move { session.start().await }
    });

    let mut server = servers.recv().await.expect("session spawned a server");
    let initialize_params = server.handshake(capabilities).await;
    assert!(session.wait_ready().await);
    Harness {
        session,
        server,
        store,
        initialize_params,
    }
}

/// Poll `condition` until it holds, yielding to other tasks in between.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition never became true");
}

/// Await `fut`, failing the test if it takes longer than the frame wait.
pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(FRAME_WAIT, fut)
        .await
        .expect("operation timed out")
}
