//! LSP client: spawns language servers, correlates JSON-RPC traffic, keeps
//! open documents in sync and translates published diagnostics.

pub mod codec;
pub mod diagnostics;
pub mod error;
pub mod process;
pub mod types;

pub(crate) mod protocol;
pub(crate) mod rpc;

mod manager;
mod session;
mod sync;

pub use diagnostics::{DiagnosticsSink, DiagnosticsStore};
pub use error::{ProcessError, RpcError};
pub use manager::LspManager;
pub use process::{
    ProcessEvent, ProcessFut, ProcessSpawner, ServerProcess, SpawnSpec, SpawnedProcess,
    TokioSpawner, detect_container_runtime,
};
pub use protocol::{PathToUriError, file_uri_to_path, path_to_file_uri};
pub use rpc::{FrameSink, RpcClient, SendFut};
pub use session::{Session, SessionConfig};
pub use sync::DocumentSync;
pub use types::{
    Capabilities, ContainerConfig, Diagnostic, DiagnosticSeverity, DiagnosticsSnapshot,
    DiagnosticsUpdate, FeatureResponse, LspConfig, ServerConfig, SessionState,
};
