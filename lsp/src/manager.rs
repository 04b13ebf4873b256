//! LspManager: the host-facing registry of sessions.
//!
//! One session per language classification, created on first demand.
//! Documents are routed to sessions by classification (open) and by URI
//! (change, save, close).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::diagnostics::DiagnosticsSink;
use crate::process::ProcessSpawner;
use crate::rpc::lock;
use crate::session::{Session, SessionConfig};
use crate::sync::DocumentSync;
use crate::types::LspConfig;

/// Build extension → classification map from config.
fn build_extension_map(config: &LspConfig) -> HashMap<String, String> {
    let mut extension_map = HashMap::new();
    let mut languages: Vec<&String> = config.servers.keys().collect();
    languages.sort();
    for language in languages {
        for ext in &config.servers[language].file_extensions {
            if let Some(existing) = extension_map.get(ext) {
                tracing::warn!(
                    "Multiple LSP servers configured for extension '{ext}': '{existing}' and '{language}'. Using '{existing}'."
                );
                continue;
            }
            extension_map.insert(ext.clone(), language.clone());
        }
    }
    extension_map
}

/// Host-facing entry point to the LSP client subsystem.
///
/// Sessions are torn down explicitly with [`dispose_all`](Self::dispose_all)
/// or [`shutdown_all`](Self::shutdown_all); dropping the manager does not
/// wait for servers to exit.
pub struct LspManager {
    config: LspConfig,
    root: PathBuf,
    spawner: Arc<dyn ProcessSpawner>,
    sink: Arc<dyn DiagnosticsSink>,
    sessions: Mutex<HashMap<String, Session>>,
    documents: DocumentSync,
    /// Maps file extension (e.g. "rs") → classification (e.g. "rust").
    extension_map: HashMap<String, String>,
}

impl LspManager {
    /// `root` is the workspace root handed to every server; it must be
    /// absolute.
    pub fn new(
        config: LspConfig,
        root: &Path,
        spawner: Arc<dyn ProcessSpawner>,
        sink: Arc<dyn DiagnosticsSink>,
    ) -> Self {
        let extension_map = build_extension_map(&config);
        let documents = DocumentSync::new(config.debounce());
        Self {
            config,
            root: root.to_path_buf(),
            spawner,
            sink,
            sessions: Mutex::new(HashMap::new()),
            documents,
            extension_map,
        }
    }

    /// Classification for a file, by extension.
    #[must_use]
    pub fn language_for_path(&self, path: &Path) -> Option<&str> {
        let ext = path.extension()?.to_str()?;
        self.extension_map.get(ext).map(String::as_str)
    }

    /// The session for `language`, creating and starting it on first use.
    ///
    /// `None` when no server is configured for the classification or LSP is
    /// disabled. Must be called from within a tokio runtime.
    pub fn get_session(&self, language: &str) -> Option<Session> {
        let server = self.config.server_for(language)?;

        let mut sessions = lock(&self.sessions);
        if let Some(session) = sessions.get(language) {
            return Some(session.clone());
        }

        let config = match SessionConfig::new(
            language,
            server,
            &self.root,
            self.config.request_timeout(),
        ) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(language, "cannot start language server: {e}");
                return None;
            }
        };

        let session = Session::new(config, self.spawner.clone(), self.sink.clone());
        sessions.insert(language.to_string(), session.clone());
        drop(sessions);

        tokio::spawn({
            let session = session.clone();
            async move { session.start().await }
        });
        Some(session)
    }

    #[must_use]
    pub fn has_session(&self, language: &str) -> bool {
        lock(&self.sessions).contains_key(language)
    }

    /// Classifications with a live session entry, sorted.
    #[must_use]
    pub fn languages(&self) -> Vec<String> {
        let mut languages: Vec<String> = lock(&self.sessions).keys().cloned().collect();
        languages.sort();
        languages
    }

    /// A buffer was opened. Returns whether the document is now tracked.
    ///
    /// Documents for classifications without a server are skipped.
    pub async fn document_opened(&self, language: &str, uri: &str, text: &str) -> bool {
        let Some(session) = self.get_session(language) else {
            tracing::trace!(language, uri, "no language server; skipping document");
            return false;
        };
        self.documents.open(&session, uri, text).await
    }

    pub fn document_changed(&self, uri: &str, text: String) {
        self.documents.change(uri, text);
    }

    pub async fn document_saved(&self, uri: &str) {
        self.documents.save(uri).await;
    }

    pub async fn document_closed(&self, uri: &str) {
        self.documents.close(uri).await;
    }

    /// Document version last sent to the server, if tracked.
    #[must_use]
    pub fn document_version(&self, uri: &str) -> Option<i32> {
        self.documents.version(uri)
    }

    /// Remove and dispose one session. A later `get_session` starts a fresh one.
    pub async fn dispose_session(&self, language: &str) {
        let session = lock(&self.sessions).remove(language);
        if let Some(session) = session {
            self.documents.forget_session(language);
            session.dispose().await;
        }
    }

    /// Dispose every session.
    pub async fn dispose_all(&self) {
        for session in self.drain_sessions() {
            session.dispose().await;
        }
    }

    /// Gracefully shut down every session.
    pub async fn shutdown_all(&self) {
        for session in self.drain_sessions() {
            tracing::info!(language = %session.language(), "shutting down language server");
            session.shutdown().await;
        }
    }

    fn drain_sessions(&self) -> Vec<Session> {
        let sessions: Vec<Session> = lock(&self.sessions).drain().map(|(_, s)| s).collect();
        for session in &sessions {
            self.documents.forget_session(session.language());
        }
        sessions
    }
}
