//! Diagnostics translation and the in-memory diagnostics store.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;

use crate::protocol::PublishDiagnosticsParams;
use crate::rpc::lock;
use crate::types::{Diagnostic, DiagnosticSeverity, DiagnosticsSnapshot, DiagnosticsUpdate};

/// Receives translated diagnostic sets. Supplied by the host at session
/// construction.
pub trait DiagnosticsSink: Send + Sync + 'static {
    fn publish(&self, update: DiagnosticsUpdate);
}

impl<F> DiagnosticsSink for F
where
    F: Fn(DiagnosticsUpdate) + Send + Sync + 'static,
{
    fn publish(&self, update: DiagnosticsUpdate) {
        self(update);
    }
}

/// Convert `textDocument/publishDiagnostics` params into a host update.
///
/// LSP positions are 0-based; the result is 1-based.
pub fn translate(owner: &str, params: Value) -> Result<DiagnosticsUpdate, serde_json::Error> {
    let params: PublishDiagnosticsParams = serde_json::from_value(params)?;
    let diagnostics = params
        .diagnostics
        .into_iter()
        .map(|d| {
            Diagnostic::new(
                DiagnosticSeverity::from_lsp(d.severity),
                d.message,
                (
                    d.range.start.line.saturating_add(1),
                    d.range.start.character.saturating_add(1),
                ),
                (
                    d.range.end.line.saturating_add(1),
                    d.range.end.character.saturating_add(1),
                ),
                d.source,
            )
        })
        .collect();

    Ok(DiagnosticsUpdate {
        owner: owner.to_string(),
        uri: params.uri,
        diagnostics,
    })
}

type Key = (String, String);

/// Accumulates the latest diagnostic set per (URI, owner).
///
/// Hand it to sessions as an `Arc<dyn DiagnosticsSink>` and keep another
/// `Arc` for reading.
#[derive(Debug, Default)]
pub struct DiagnosticsStore {
    data: Mutex<HashMap<Key, Vec<Diagnostic>>>,
}

impl DiagnosticsStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the set for `(update.uri, update.owner)`. An empty set clears it.
    pub fn apply(&self, update: DiagnosticsUpdate) {
        let key = (update.uri, update.owner);
        let mut data = lock(&self.data);
        if update.diagnostics.is_empty() {
            data.remove(&key);
        } else {
            data.insert(key, update.diagnostics);
        }
    }

    /// All diagnostics for one URI, across owners.
    #[must_use]
    pub fn for_uri(&self, uri: &str) -> Vec<Diagnostic> {
        let data = lock(&self.data);
        let mut owners: Vec<(&String, &Vec<Diagnostic>)> = data
            .iter()
            .filter(|((u, _), _)| u == uri)
            .map(|((_, owner), items)| (owner, items))
            .collect();
        owners.sort_by(|a, b| a.0.cmp(b.0));
        owners
            .into_iter()
            .flat_map(|(_, items)| items.iter().cloned())
            .collect()
    }

    #[must_use]
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        let mut merged: HashMap<String, Vec<Diagnostic>> = HashMap::new();
        {
            let data = lock(&self.data);
            let mut entries: Vec<(&Key, &Vec<Diagnostic>)> = data.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            for ((uri, _), items) in entries {
                merged
                    .entry(uri.clone())
                    .or_default()
                    .extend(items.iter().cloned());
            }
        }

        let mut files: Vec<(String, Vec<Diagnostic>)> = merged.into_iter().collect();
        // Files with errors first, then by URI.
        files.sort_by(|a, b| {
            let a_has_errors = a.1.iter().any(|d| d.severity().is_error());
            let b_has_errors = b.1.iter().any(|d| d.severity().is_error());
            b_has_errors.cmp(&a_has_errors).then_with(|| a.0.cmp(&b.0))
        });

        DiagnosticsSnapshot::new(files)
    }
}

impl DiagnosticsSink for DiagnosticsStore {
    fn publish(&self, update: DiagnosticsUpdate) {
        self.apply(update);
    }
}
