//! Internal LSP message serde types for JSON-RPC communication.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// JSON-RPC "method not found".
pub(crate) const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, thiserror::Error)]
#[error("cannot convert path to file URI: {}", path.display())]
pub struct PathToUriError {
    path: PathBuf,
}

#[derive(Debug, Serialize)]
pub(crate) struct Request<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl<'a> Request<'a> {
    pub fn new(id: u64, method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Notification<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl<'a> Notification<'a> {
    pub fn new(method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
        }
    }
}

/// Reply to a server-initiated request we do not implement.
pub(crate) fn method_not_found(id: &Value, method: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": METHOD_NOT_FOUND,
            "message": format!("Method not found: {method}")
        }
    })
}

/// An inbound JSON-RPC message, classified by shape.
#[derive(Debug)]
pub(crate) enum Incoming {
    /// Has an `id` and no `method`.
    Response { id: u64, body: Value },
    /// Has both an `id` and a `method`.
    ServerRequest { id: Value, method: String },
    /// Has a `method` and no `id`.
    Notification {
        method: String,
        params: Option<Value>,
    },
}

impl Incoming {
    /// Classify a parsed message. Returns `None` for shapes we cannot route
    /// (non-numeric response ids, objects with neither `id` nor `method`).
    pub fn classify(message: Value) -> Option<Self> {
        let method = message
            .get("method")
            .and_then(Value::as_str)
            .map(String::from);

        match (message.get("id"), method) {
            (Some(id), Some(method)) => Some(Self::ServerRequest {
                id: id.clone(),
                method,
            }),
            (Some(id), None) => Some(Self::Response {
                id: id.as_u64()?,
                body: message,
            }),
            (None, Some(method)) => Some(Self::Notification {
                method,
                params: message.get("params").cloned(),
            }),
            (None, None) => None,
        }
    }
}

/// `initialize` parameters with a fixed, minimal client capability set.
///
/// No dynamic registration anywhere, no snippet support.
pub(crate) fn initialize_params(root_uri: &str) -> Value {
    json!({
        "processId": std::process::id(),
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION")
        },
        "rootUri": root_uri,
        "capabilities": {
            "textDocument": {
                "synchronization": {
                    "dynamicRegistration": false,
                    "willSave": false,
                    "willSaveWaitUntil": false,
                    "didSave": true
                },
                "completion": {
                    "dynamicRegistration": false,
                    "completionItem": {
                        "snippetSupport": false,
                        "documentationFormat": ["markdown", "plaintext"]
                    }
                },
                "hover": {
                    "dynamicRegistration": false,
                    "contentFormat": ["markdown", "plaintext"]
                },
                "signatureHelp": {
                    "dynamicRegistration": false,
                    "signatureInformation": {
                        "documentationFormat": ["markdown", "plaintext"]
                    }
                },
                "definition": {
                    "dynamicRegistration": false
                },
                "references": {
                    "dynamicRegistration": false
                },
                "formatting": {
                    "dynamicRegistration": false
                },
                "publishDiagnostics": {
                    "relatedInformation": false
                }
            }
        },
        "workspaceFolders": [{
            "uri": root_uri,
            "name": "workspace"
        }]
    })
}

pub(crate) fn text_document_position(uri: &str, line: u32, character: u32) -> Value {
    json!({
        "textDocument": { "uri": uri },
        "position": { "line": line, "character": character }
    })
}

pub(crate) fn reference_params(uri: &str, line: u32, character: u32) -> Value {
    let mut params = text_document_position(uri, line, character);
    params["context"] = json!({ "includeDeclaration": true });
    params
}

pub(crate) fn formatting_params(uri: &str, tab_size: u32, insert_spaces: bool) -> Value {
    json!({
        "textDocument": { "uri": uri },
        "options": {
            "tabSize": tab_size,
            "insertSpaces": insert_spaces
        }
    })
}

pub(crate) fn did_open_params(uri: &str, language_id: &str, version: i32, text: &str) -> Value {
    json!({
        "textDocument": {
            "uri": uri,
            "languageId": language_id,
            "version": version,
            "text": text
        }
    })
}

/// Whole-document sync: a single content change carrying the full text.
pub(crate) fn did_change_params(uri: &str, version: i32, text: &str) -> Value {
    json!({
        "textDocument": {
            "uri": uri,
            "version": version
        },
        "contentChanges": [{
            "text": text
        }]
    })
}

pub(crate) fn did_close_params(uri: &str) -> Value {
    json!({
        "textDocument": { "uri": uri }
    })
}

pub(crate) fn did_save_params(uri: &str, text: Option<&str>) -> Value {
    let mut params = json!({
        "textDocument": { "uri": uri }
    });
    if let Some(text) = text {
        params["text"] = Value::String(text.to_string());
    }
    params
}

#[derive(Debug, Deserialize)]
pub(crate) struct PublishDiagnosticsParams {
    pub uri: String,
    pub diagnostics: Vec<LspDiagnostic>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LspDiagnostic {
    pub range: LspRange,
    pub severity: Option<u64>,
    pub source: Option<String>,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LspRange {
    pub start: LspPosition,
    pub end: LspPosition,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LspPosition {
    pub line: u32,
    pub character: u32,
}

pub fn path_to_file_uri(path: &Path) -> Result<url::Url, PathToUriError> {
    url::Url::from_file_path(path).map_err(|()| PathToUriError {
        path: path.to_path_buf(),
    })
}

#[must_use]
pub fn file_uri_to_path(uri: &str) -> Option<PathBuf> {
    url::Url::parse(uri)
        .ok()
        .and_then(|u| u.to_file_path().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_params_has_required_fields() {
        let params = initialize_params("file:///workspace");
        assert!(params["processId"].is_number());
        assert_eq!(params["rootUri"], "file:///workspace");
        assert_eq!(params["workspaceFolders"][0]["uri"], "file:///workspace");
        assert!(params["capabilities"]["textDocument"]["publishDiagnostics"].is_object());
    }

    #[test]
    fn test_initialize_params_declares_no_dynamic_registration_or_snippets() {
        let params = initialize_params("file:///workspace");
        let text_document = params["capabilities"]["textDocument"].as_object().unwrap();
        for (name, capability) in text_document {
            if let Some(dynamic) = capability.get("dynamicRegistration") {
                assert_eq!(dynamic, false, "{name} must not request dynamic registration");
            }
        }
        assert_eq!(
            params["capabilities"]["textDocument"]["completion"]["completionItem"]["snippetSupport"],
            false
        );
        assert_eq!(
            params["capabilities"]["textDocument"]["hover"]["contentFormat"][0],
            "markdown"
        );
    }

    #[test]
    fn test_did_open_params() {
        let params = did_open_params("file:///test.rs", "rust", 1, "fn main() {}");
        assert_eq!(params["textDocument"]["uri"], "file:///test.rs");
        assert_eq!(params["textDocument"]["languageId"], "rust");
        assert_eq!(params["textDocument"]["version"], 1);
        assert_eq!(params["textDocument"]["text"], "fn main() {}");
    }

    #[test]
    fn test_did_change_params_sends_full_text() {
        let params = did_change_params("file:///test.rs", 2, "fn main() { 42 }");
        assert_eq!(params["textDocument"]["version"], 2);
        assert_eq!(params["contentChanges"].as_array().unwrap().len(), 1);
        assert_eq!(params["contentChanges"][0]["text"], "fn main() { 42 }");
        assert!(params["contentChanges"][0].get("range").is_none());
    }

    #[test]
    fn test_did_save_params_optional_text() {
        let without = did_save_params("file:///a.ts", None);
        assert!(without.get("text").is_none());

        let with = did_save_params("file:///a.ts", Some("let x = 1;"));
        assert_eq!(with["text"], "let x = 1;");
    }

    #[test]
    fn test_reference_params_include_declaration() {
        let params = reference_params("file:///a.ts", 3, 7);
        assert_eq!(params["position"]["line"], 3);
        assert_eq!(params["position"]["character"], 7);
        assert_eq!(params["context"]["includeDeclaration"], true);
    }

    #[test]
    fn test_classify_response() {
        let msg = json!({"jsonrpc": "2.0", "id": 4, "result": null});
        assert!(matches!(
            Incoming::classify(msg),
            Some(Incoming::Response { id: 4, .. })
        ));
    }

    #[test]
    fn test_classify_server_request() {
        let msg = json!({"jsonrpc": "2.0", "id": "cfg-1", "method": "workspace/configuration"});
        match Incoming::classify(msg) {
            Some(Incoming::ServerRequest { id, method }) => {
                assert_eq!(id, "cfg-1");
                assert_eq!(method, "workspace/configuration");
            }
            other => panic!("expected ServerRequest, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_notification_and_garbage() {
        let msg = json!({"jsonrpc": "2.0", "method": "window/logMessage", "params": {"type": 3}});
        assert!(matches!(
            Incoming::classify(msg),
            Some(Incoming::Notification { .. })
        ));
        assert!(Incoming::classify(json!({"jsonrpc": "2.0"})).is_none());
        assert!(Incoming::classify(json!({"id": "str", "result": 1})).is_none());
    }

    #[test]
    fn test_method_not_found_reply() {
        let reply = method_not_found(&json!(7), "client/registerCapability");
        assert_eq!(reply["id"], 7);
        assert_eq!(reply["error"]["code"], METHOD_NOT_FOUND);
        assert!(
            reply["error"]["message"]
                .as_str()
                .unwrap()
                .contains("client/registerCapability")
        );
    }

    #[test]
    fn test_publish_diagnostics_deserialization() {
        let json = json!({
            "uri": "file:///test.rs",
            "diagnostics": [{
                "range": { "start": { "line": 0, "character": 0 }, "end": { "line": 0, "character": 5 } },
                "severity": 1,
                "source": "rustc",
                "message": "cannot find value `x`"
            }]
        });

        let params: PublishDiagnosticsParams = serde_json::from_value(json).unwrap();
        assert_eq!(params.uri, "file:///test.rs");
        assert_eq!(params.diagnostics.len(), 1);
        assert_eq!(params.diagnostics[0].range.end.character, 5);
        assert_eq!(params.diagnostics[0].message, "cannot find value `x`");
    }

    #[test]
    fn test_path_to_file_uri_and_back() {
        #[cfg(windows)]
        let path = PathBuf::from(r"C:\Users\test\src\main.rs");
        #[cfg(not(windows))]
        let path = PathBuf::from("/home/test/src/main.rs");

        let uri = path_to_file_uri(&path).expect("should create URI");
        let roundtrip = file_uri_to_path(uri.as_str()).expect("should parse back to path");
        assert_eq!(roundtrip, path);
    }

    #[test]
    fn test_file_uri_to_path_rejects_non_file() {
        assert!(file_uri_to_path("not-a-uri").is_none());
        assert!(file_uri_to_path("https://example.com/test.rs").is_none());
    }

    #[test]
    fn test_request_serialization_without_params() {
        let req = Request::new(1, "shutdown", None);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["jsonrpc"], "2.0");
        assert_eq!(json["id"], 1);
        assert_eq!(json["method"], "shutdown");
        assert!(
            json.get("params").is_none(),
            "params must be omitted, not null"
        );
    }

    #[test]
    fn test_notification_has_no_id() {
        let notif = Notification::new("initialized", Some(json!({})));
        let json = serde_json::to_value(&notif).unwrap();
        assert_eq!(json["jsonrpc"], "2.0");
        assert_eq!(json["method"], "initialized");
        assert!(json.get("id").is_none());
        assert!(json.get("params").is_some());
    }
}
