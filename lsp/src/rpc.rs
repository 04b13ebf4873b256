//! JSON-RPC request/response correlation.
//!
//! [`RpcClient`] allocates request ids, keeps a map of pending requests keyed
//! by id (servers may answer out of order), enforces a per-request timeout and
//! routes inbound notifications to at most one handler per method.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::codec;
use crate::error::{ProcessError, RpcError};
use crate::protocol::{self, Incoming, Notification, Request};

/// Future returned by a [`FrameSink`].
pub type SendFut = Pin<Box<dyn Future<Output = Result<(), ProcessError>> + Send + 'static>>;

/// Where framed outbound messages go.
///
/// Implemented for any `Fn(String) -> SendFut` closure.
pub trait FrameSink: Send + Sync + 'static {
    fn send(&self, frame: String) -> SendFut;
}

impl<F> FrameSink for F
where
    F: Fn(String) -> SendFut + Send + Sync + 'static,
{
    fn send(&self, frame: String) -> SendFut {
        self(frame)
    }
}

type NotificationHandler = Arc<dyn Fn(Option<Value>) + Send + Sync>;

struct PendingRequest {
    method: String,
    tx: oneshot::Sender<Result<Value, RpcError>>,
}

struct Shared {
    sink: Box<dyn FrameSink>,
    timeout: Duration,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    handlers: Mutex<HashMap<String, NotificationHandler>>,
    closed: AtomicBool,
}

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes a pending entry when the awaiting `request` future finishes or is
/// dropped. Ids are never reused, so removing an already-retired id is a no-op.
struct RetireOnDrop<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for RetireOnDrop<'_> {
    fn drop(&mut self) {
        lock(&self.shared.pending).remove(&self.id);
    }
}

/// Per-session JSON-RPC correlator. Cloning yields another handle to the
/// same correlator.
#[derive(Clone)]
pub struct RpcClient {
    shared: Arc<Shared>,
}

impl RpcClient {
    pub fn new(sink: impl FrameSink, timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                sink: Box::new(sink),
                timeout,
                next_id: AtomicU64::new(1),
                pending: Mutex::new(HashMap::new()),
                handlers: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Send a request and wait for its response.
    ///
    /// The timeout window covers both the write and the wait for the reply.
    /// No `$/cancelRequest` is sent on timeout; a late reply is discarded.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let body = serde_json::to_string(&Request::new(id, method, params))
            .map_err(|e| RpcError::Serialize(e.to_string()))?;

        let deadline = Instant::now() + self.shared.timeout;
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock(&self.shared.pending);
            if self.is_closed() {
                return Err(RpcError::Disposed {
                    method: method.to_string(),
                });
            }
            pending.insert(
                id,
                PendingRequest {
                    method: method.to_string(),
                    tx,
                },
            );
        }
        let _retire = RetireOnDrop {
            shared: &self.shared,
            id,
        };

        tracing::trace!(id, method, "sending request");
        let exchange = async {
            self.shared.sink.send(codec::encode(&body)).await?;
            match rx.await {
                Ok(outcome) => outcome,
                Err(_) => Err(RpcError::Disposed {
                    method: method.to_string(),
                }),
            }
        };

        match tokio::time::timeout_at(deadline, exchange).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(id, method, "request timed out");
                Err(RpcError::Timeout {
                    method: method.to_string(),
                    timeout: self.shared.timeout,
                })
            }
        }
    }

    /// Send a notification. No id, nothing pending.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(RpcError::Disposed {
                method: method.to_string(),
            });
        }
        let body = serde_json::to_string(&Notification::new(method, params))
            .map_err(|e| RpcError::Serialize(e.to_string()))?;
        tracing::trace!(method, "sending notification");
        self.shared.sink.send(codec::encode(&body)).await?;
        Ok(())
    }

    /// Register the handler for a notification method.
    ///
    /// Dispatch is single-handler: registering again for the same method
    /// replaces the previous handler. Handlers run synchronously inside
    /// [`handle_message`](Self::handle_message).
    pub fn on_notification<F>(&self, method: &str, handler: F)
    where
        F: Fn(Option<Value>) + Send + Sync + 'static,
    {
        let previous = lock(&self.shared.handlers).insert(method.to_string(), Arc::new(handler));
        if previous.is_some() {
            tracing::debug!(method, "replacing notification handler");
        }
    }

    /// Route one inbound JSON-RPC body.
    ///
    /// Never fails: malformed JSON, unknown ids and unhandled notifications
    /// are logged and dropped.
    pub fn handle_message(&self, json: &str) {
        if self.is_closed() {
            return;
        }

        let message: Value = match serde_json::from_str(json) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!("dropping malformed JSON-RPC message: {e}");
                return;
            }
        };

        let Some(incoming) = Incoming::classify(message) else {
            tracing::trace!("ignoring unroutable JSON-RPC message");
            return;
        };

        match incoming {
            Incoming::Response { id, body } => self.resolve(id, &body),
            Incoming::ServerRequest { id, method } => self.reject_server_request(&id, &method),
            Incoming::Notification { method, params } => {
                let handler = lock(&self.shared.handlers).get(&method).cloned();
                match handler {
                    Some(handler) => handler(params),
                    None => tracing::trace!(method = %method, "no handler for notification"),
                }
            }
        }
    }

    fn resolve(&self, id: u64, body: &Value) {
        let Some(pending) = lock(&self.shared.pending).remove(&id) else {
            tracing::debug!(id, "response for unknown or retired request id");
            return;
        };

        let outcome = match body.get("error").filter(|e| !e.is_null()) {
            Some(error) => Err(RpcError::Server {
                code: error.get("code").and_then(Value::as_i64),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            }),
            None => Ok(body.get("result").cloned().unwrap_or(Value::Null)),
        };

        if pending.tx.send(outcome).is_err() {
            tracing::trace!(id, method = %pending.method, "requester went away before response");
        }
    }

    /// Servers block on some requests (`workspace/configuration`,
    /// `client/registerCapability`); answer them with "method not found".
    fn reject_server_request(&self, id: &Value, method: &str) {
        tracing::debug!(method, "server sent request; replying method not found");
        let reply = protocol::method_not_found(id, method).to_string();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let send = self.shared.sink.send(codec::encode(&reply));
        runtime.spawn(async move {
            if let Err(e) = send.await {
                tracing::debug!("failed to answer server request: {e}");
            }
        });
    }

    /// Reject every pending request with [`RpcError::Disposed`] and drop all
    /// notification handlers. Idempotent.
    pub fn dispose(&self) {
        self.close(|method| RpcError::Disposed { method });
    }

    /// Like [`dispose`](Self::dispose), but pending requests learn that the
    /// server process exited.
    pub fn server_exited(&self, code: Option<i32>) {
        self.close(move |method| RpcError::ServerExited { method, code });
    }

    fn close(&self, reason: impl Fn(String) -> RpcError) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let drained: Vec<PendingRequest> = lock(&self.shared.pending)
            .drain()
            .map(|(_, pending)| pending)
            .collect();
        lock(&self.shared.handlers).clear();

        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "rejecting pending requests");
        }
        for pending in drained {
            let _ = pending.tx.send(Err(reason(pending.method)));
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        lock(&self.shared.pending).len()
    }
}
