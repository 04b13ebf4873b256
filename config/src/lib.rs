//! Configuration loading for Tether.
//!
//! Reads `~/.tether/config.toml`. Only the `[lsp]` table is recognised:
//!
//! ```toml
//! [lsp]
//! request_timeout_ms = 30000
//! debounce_ms = 100
//!
//! [lsp.servers.rust]
//! command = "rust-analyzer"
//! file_extensions = ["rs"]
//! ```
//!
//! When no servers are configured the built-in table from
//! [`default_servers`] is used.

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tether_lsp::{LspConfig, ServerConfig};

#[derive(Debug, Clone, Deserialize)]
pub struct TetherConfig {
    #[serde(default)]
    pub lsp: LspConfig,
}

impl Default for TetherConfig {
    fn default() -> Self {
        Self {
            lsp: LspConfig {
                servers: default_servers(),
                ..LspConfig::default()
            },
        }
    }
}

impl TetherConfig {
    /// Load from the default location.
    ///
    /// A missing file yields the defaults. An unreadable or invalid file is
    /// logged and also yields the defaults.
    #[must_use]
    pub fn load() -> Self {
        let Some(path) = Self::path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        match Self::load_from(&path) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!("Failed to load config at {}: {err:#}", path.display());
                Self::default()
            }
        }
    }

    /// Load from an explicit path. Errors are returned, not swallowed.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(content)?;
        config.finish();
        Ok(config)
    }

    /// `~/.tether/config.toml`
    #[must_use]
    pub fn path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".tether").join("config.toml"))
    }

    fn finish(&mut self) {
        if self.lsp.servers.is_empty() {
            self.lsp.servers = default_servers();
        }
        for server in self.lsp.servers.values_mut() {
            server.command = expand_env_vars(&server.command);
            for arg in &mut server.args {
                *arg = expand_env_vars(arg);
            }
        }
    }
}

fn server(command: &str, args: &[&str], language_id: Option<&str>, exts: &[&str]) -> ServerConfig {
    ServerConfig {
        command: command.to_string(),
        args: args.iter().map(ToString::to_string).collect(),
        language_id: language_id.map(str::to_string),
        file_extensions: exts.iter().map(ToString::to_string).collect(),
        container: None,
    }
}

/// Servers used when the config file names none.
#[must_use]
pub fn default_servers() -> HashMap<String, ServerConfig> {
    HashMap::from([
        (
            "rust".to_string(),
            server("rust-analyzer", &[], None, &["rs"]),
        ),
        (
            "typescript".to_string(),
            server(
                "typescript-language-server",
                &["--stdio"],
                None,
                &["ts", "tsx", "mts", "cts"],
            ),
        ),
        (
            "python".to_string(),
            server("pyright-langserver", &["--stdio"], None, &["py", "pyi"]),
        ),
        ("go".to_string(), server("gopls", &[], None, &["go"])),
        (
            "cpp".to_string(),
            server(
                "clangd",
                &[],
                None,
                &["c", "h", "cc", "cpp", "cxx", "hpp", "hh"],
            ),
        ),
    ])
}

/// Expand `${VAR}` references from the process environment. Unset variables
/// expand to the empty string; an unterminated `${` is kept as written.
#[must_use]
pub fn expand_env_vars(value: &str) -> String {
    expand_vars(value, |name| env::var(name).ok())
}

fn expand_vars(value: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let var = &after[..end];
        if !var.is_empty() {
            out.push_str(&lookup(var).unwrap_or_default());
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}
