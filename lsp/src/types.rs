//! Public types consumed by the host editor surface.
//!
//! The host constructs [`LspConfig`], receives [`DiagnosticsUpdate`]s through
//! its sink, and reads [`Capabilities`] and [`SessionState`] off sessions.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

/// Default request timeout (30 s).
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Default `didChange` debounce window (100 ms).
pub const DEFAULT_DEBOUNCE_MS: u64 = 100;

fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

fn default_debounce_ms() -> u64 {
    DEFAULT_DEBOUNCE_MS
}

/// Configuration for the LSP client subsystem.
#[derive(Debug, Clone, Deserialize)]
pub struct LspConfig {
    /// Whether the LSP client is enabled. Default: true.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Per-classification server configurations, keyed by language
    /// classification (e.g. "typescript").
    #[serde(default)]
    pub servers: HashMap<String, ServerConfig>,
}

fn default_enabled() -> bool {
    true
}

impl Default for LspConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            servers: HashMap::new(),
        }
    }
}

impl LspConfig {
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[must_use]
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Resolve the server for a language classification.
    #[must_use]
    pub fn server_for(&self, language: &str) -> Option<&ServerConfig> {
        if !self.enabled {
            return None;
        }
        self.servers.get(language)
    }
}

/// Configuration for a single language server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerConfig {
    /// Executable command (e.g. "rust-analyzer").
    pub command: String,
    /// Arguments to pass to the command.
    #[serde(default)]
    pub args: Vec<String>,
    /// LSP language identifier sent in `didOpen`. Defaults to the
    /// classification name.
    #[serde(default)]
    pub language_id: Option<String>,
    /// File extensions this server handles (e.g. `["rs"]`).
    #[serde(default)]
    pub file_extensions: Vec<String>,
    /// Run the server inside a running container instead of on the host.
    #[serde(default)]
    pub container: Option<ContainerConfig>,
}

/// Where to `exec` a containerized server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ContainerConfig {
    /// Name or id of a running container.
    pub name: String,
    /// Container runtime binary. Defaults to podman, then docker, whichever
    /// is on `PATH`.
    #[serde(default)]
    pub runtime: Option<String>,
}

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DiagnosticSeverity {
    Error = 1,
    Warning = 2,
    Information = 3,
    Hint = 4,
}

impl DiagnosticSeverity {
    /// Convert from LSP numeric severity (1=Error, 2=Warning, 3=Info, 4=Hint).
    ///
    /// Unknown or missing codes map to `Information`.
    #[must_use]
    pub fn from_lsp(value: Option<u64>) -> Self {
        match value {
            Some(1) => Self::Error,
            Some(2) => Self::Warning,
            Some(4) => Self::Hint,
            _ => Self::Information,
        }
    }

    #[must_use]
    pub fn is_error(self) -> bool {
        self == Self::Error
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Information => "info",
            Self::Hint => "hint",
        }
    }
}

/// A single diagnostic, positioned for host consumption.
///
/// Lines and columns are 1-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    severity: DiagnosticSeverity,
    message: String,
    start_line: u32,
    start_column: u32,
    end_line: u32,
    end_column: u32,
    source: Option<String>,
}

impl Diagnostic {
    #[must_use]
    pub fn new(
        severity: DiagnosticSeverity,
        message: String,
        start: (u32, u32),
        end: (u32, u32),
        source: Option<String>,
    ) -> Self {
        Self {
            severity,
            message,
            start_line: start.0,
            start_column: start.1,
            end_line: end.0,
            end_column: end.1,
            source,
        }
    }

    #[must_use]
    pub fn severity(&self) -> DiagnosticSeverity {
        self.severity
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn start_line(&self) -> u32 {
        self.start_line
    }

    #[must_use]
    pub fn start_column(&self) -> u32 {
        self.start_column
    }

    #[must_use]
    pub fn end_line(&self) -> u32 {
        self.end_line
    }

    #[must_use]
    pub fn end_column(&self) -> u32 {
        self.end_column
    }

    /// Source of the diagnostic (e.g. "ts", "rustc"), if the server sent one.
    #[must_use]
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Format as `path:line:col: severity: [source] message`.
    #[must_use]
    pub fn display_with_path(&self, path: &str) -> String {
        let mut out = format!(
            "{path}:{}:{}: {}: ",
            self.start_line,
            self.start_column,
            self.severity.label()
        );
        if let Some(source) = &self.source {
            out.push_str(&format!("[{source}] "));
        }
        out.push_str(&self.message);
        out
    }
}

/// The full diagnostic set for one URI from one session.
///
/// Each update replaces whatever the same owner previously published for
/// that URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticsUpdate {
    /// Language classification of the session that produced the set.
    pub owner: String,
    pub uri: String,
    pub diagnostics: Vec<Diagnostic>,
}

/// Features a server advertised in its `initialize` response.
///
/// Frozen at the `ready` transition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub completion: bool,
    pub hover: bool,
    pub definition: bool,
    pub signature_help: bool,
    pub references: bool,
    pub document_formatting: bool,
}

impl Capabilities {
    /// Read capability flags out of an `initialize` result.
    ///
    /// A provider counts as advertised when present and neither `false` nor
    /// `null`; options objects count as `true`.
    #[must_use]
    pub fn from_initialize_result(result: &Value) -> Self {
        let caps = result.get("capabilities");
        let advertised = |key: &str| {
            caps.and_then(|c| c.get(key))
                .is_some_and(|v| !matches!(v, Value::Null | Value::Bool(false)))
        };
        Self {
            completion: advertised("completionProvider"),
            hover: advertised("hoverProvider"),
            definition: advertised("definitionProvider"),
            signature_help: advertised("signatureHelpProvider"),
            references: advertised("referencesProvider"),
            document_formatting: advertised("documentFormattingProvider"),
        }
    }
}

/// Lifecycle state of a [`Session`](crate::Session).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Constructed, `start()` not yet called.
    Idle,
    Spawning,
    Initializing,
    Ready,
    /// Spawn or `initialize` failed.
    Failed(String),
    /// The server process exited after becoming ready.
    Stopped,
    /// Terminal.
    Disposed,
}

impl SessionState {
    /// Whether the state can no longer progress towards `Ready`.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        !matches!(self, Self::Idle | Self::Spawning | Self::Initializing)
    }

    /// Whether the session is over and will never serve requests again.
    #[must_use]
    pub fn has_ended(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Stopped | Self::Disposed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Spawning => f.write_str("spawning"),
            Self::Initializing => f.write_str("initializing"),
            Self::Ready => f.write_str("ready"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
            Self::Stopped => f.write_str("stopped"),
            Self::Disposed => f.write_str("disposed"),
        }
    }
}

/// Outcome of a capability-gated feature request.
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureResponse {
    /// The server did not advertise the capability, or the session is not
    /// ready. Nothing was sent.
    Unsupported,
    /// The server's `result` (may be `null`).
    Answered(Value),
}

impl FeatureResponse {
    #[must_use]
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported)
    }

    #[must_use]
    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Unsupported => None,
            Self::Answered(value) => Some(value),
        }
    }
}

/// Immutable snapshot of all diagnostics, suitable for UI rendering.
///
/// Counts are computed from `files`, never cached.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticsSnapshot {
    /// Per-URI diagnostics, sorted with error-containing files first.
    files: Vec<(String, Vec<Diagnostic>)>,
}

impl DiagnosticsSnapshot {
    pub(crate) fn new(files: Vec<(String, Vec<Diagnostic>)>) -> Self {
        Self { files }
    }

    #[must_use]
    pub fn files(&self) -> &[(String, Vec<Diagnostic>)] {
        &self.files
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn count_by_severity(&self, severity: DiagnosticSeverity) -> usize {
        self.files
            .iter()
            .flat_map(|(_, items)| items)
            .filter(|d| d.severity() == severity)
            .count()
    }

    #[must_use]
    pub fn error_count(&self) -> usize {
        self.count_by_severity(DiagnosticSeverity::Error)
    }

    #[must_use]
    pub fn warning_count(&self) -> usize {
        self.count_by_severity(DiagnosticSeverity::Warning)
    }

    #[must_use]
    pub fn info_count(&self) -> usize {
        self.count_by_severity(DiagnosticSeverity::Information)
    }

    #[must_use]
    pub fn hint_count(&self) -> usize {
        self.count_by_severity(DiagnosticSeverity::Hint)
    }

    #[must_use]
    pub fn total_count(&self) -> usize {
        self.files.iter().map(|(_, items)| items.len()).sum()
    }

    /// Format a compact status string like "E:3 W:5".
    #[must_use]
    pub fn status_string(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        format!("E:{} W:{}", self.error_count(), self.warning_count())
    }
}
