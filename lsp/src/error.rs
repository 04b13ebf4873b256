//! Error types surfaced by the LSP client.
//!
//! Protocol-level garbage (malformed frames, unknown ids, unknown
//! notifications) never becomes an error value; it is logged and dropped at
//! the correlator. Everything here reaches a specific caller.

use std::time::Duration;

/// Failures of the process collaborator (spawn, write, kill).
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProcessError {
    #[error("{command} not found in PATH")]
    NotFound { command: String },

    #[error("spawning {command}: {reason}")]
    Spawn { command: String, reason: String },

    #[error("writing to language server: {0}")]
    Write(String),

    #[error("language server stdin is closed")]
    Closed,

    #[error("killing language server: {0}")]
    Kill(String),
}

/// Failures of a single JSON-RPC request.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RpcError {
    /// The server answered with an `error` object.
    #[error("{message}")]
    Server { code: Option<i64>, message: String },

    /// No response arrived within the request window.
    #[error("request '{method}' timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    /// The correlator was disposed while the request was pending.
    #[error("request '{method}' cancelled: client disposed")]
    Disposed { method: String },

    /// The server process exited while the request was pending.
    #[error("request '{method}' failed: language server exited (code {})", display_code(.code))]
    ServerExited { method: String, code: Option<i32> },

    /// Writing the request to the server failed.
    #[error("transport error: {0}")]
    Transport(#[from] ProcessError),

    #[error("serializing request: {0}")]
    Serialize(String),
}

impl RpcError {
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

pub(crate) fn display_code(code: &Option<i32>) -> String {
    code.map_or_else(|| String::from("none"), |c| c.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_error_displays_server_message() {
        let err = RpcError::Server {
            code: Some(-32602),
            message: "invalid params".to_string(),
        };
        assert_eq!(err.to_string(), "invalid params");
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_timeout_distinguishable_by_message() {
        let err = RpcError::Timeout {
            method: "textDocument/hover".to_string(),
            timeout: Duration::from_secs(30),
        };
        assert!(err.is_timeout());
        assert!(err.to_string().contains("timed out"));
        assert!(err.to_string().contains("textDocument/hover"));
    }

    #[test]
    fn test_server_exited_without_code() {
        let err = RpcError::ServerExited {
            method: "initialize".to_string(),
            code: None,
        };
        assert_eq!(
            err.to_string(),
            "request 'initialize' failed: language server exited (code none)"
        );
    }

    #[test]
    fn test_transport_from_process_error() {
        let err: RpcError = ProcessError::Closed.into();
        assert!(matches!(err, RpcError::Transport(ProcessError::Closed)));
        assert_eq!(
            err.to_string(),
            "transport error: language server stdin is closed"
        );
    }
}
