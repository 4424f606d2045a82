//! Fleet configuration: one JSON document describing the MCP servers to
//! supervise, plus the per-child env meta-keys the supervisor interprets.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file name, looked up next to the running binary.
pub const DEFAULT_CONFIG_FILE: &str = "mcp_servers.json";

const DEFAULT_READINESS_ATTEMPTS: u32 = 3;
const DEFAULT_READINESS_DELAY_MS: u64 = 2000;

/// Transport used to reach one MCP server.
///
/// Explicit via the `transport` (or legacy `type`) key; otherwise inferred:
/// presence of `url` means `http`, else `stdio`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Spawn a child process communicating over stdio (JSON-RPC on stdin/stdout).
    Stdio,
    /// Connect to a remote MCP server via Streamable HTTP.
    Http,
}

impl Transport {
    /// Short human-readable label for the transport type.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::Http => "http",
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// One fleet entry from `mcp_servers.json`, immutable once loaded.
///
/// # JSON format
///
/// ```json
/// { "mcpServers": {
///     "local-fs": { "command": "uvx mcp-server-filesystem", "args": ["/data"],
///                   "env": { "STARTUP_DELAY": "500" } },
///     "remote-x": { "url": "https://example/mcp" }
/// } }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChildConfig {
    pub name: String,
    pub transport: Transport,
    /// Shell-split before spawning; stdio transport only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Overlaid on the parent environment; meta-keys stay visible to the child.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    /// Base endpoint for streamable-HTTP MCP; http transport only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl ChildConfig {
    /// `STARTUP_DELAY` env meta-key: pause before the first spawn.
    pub fn startup_delay(&self) -> Option<Duration> {
        let ms: u64 = self.env.get("STARTUP_DELAY")?.parse().ok()?;
        (ms > 0).then(|| Duration::from_millis(ms))
    }

    /// `RETRY_COUNT` env meta-key: post-spawn tool-list attempts (default 3).
    pub fn readiness_attempts(&self) -> u32 {
        self.env
            .get("RETRY_COUNT")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_READINESS_ATTEMPTS)
    }

    /// `RETRY_DELAY` env meta-key: pause between attempts (default 2000 ms).
    pub fn readiness_delay(&self) -> Duration {
        let ms = self
            .env
            .get("RETRY_DELAY")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_READINESS_DELAY_MS);
        Duration::from_millis(ms)
    }

    fn from_entry(name: String, raw: RawChild) -> Result<Self> {
        let transport = match raw.transport.as_deref() {
            Some("stdio") => Transport::Stdio,
            Some("http") => Transport::Http,
            Some(other) => anyhow::bail!(
                "server '{name}': unknown transport '{other}' (expected: stdio, http)"
            ),
            None if raw.url.is_some() => Transport::Http,
            None => Transport::Stdio,
        };

        match transport {
            Transport::Stdio if raw.command.is_none() => {
                anyhow::bail!("server '{name}': stdio transport requires 'command'")
            }
            Transport::Http if raw.url.is_none() => {
                anyhow::bail!("server '{name}': http transport requires 'url'")
            }
            _ => {}
        }

        Ok(Self {
            name,
            transport,
            command: raw.command,
            args: raw.args,
            env: raw.env,
            url: raw.url,
        })
    }
}

#[derive(Deserialize)]
struct RawChild {
    /// `transport` is canonical; `type` is the legacy spelling.
    #[serde(alias = "type")]
    transport: Option<String>,
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    url: Option<String>,
}

/// The full fleet, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FleetConfig {
    pub servers: Vec<ChildConfig>,
}

impl FleetConfig {
    /// Parse a `{"mcpServers": {...}}` document.
    pub fn parse(raw: &str) -> Result<Self> {
        let doc: RawDocument =
            serde_json::from_str(raw).context("invalid fleet config JSON")?;
        let mut servers = Vec::with_capacity(doc.mcp_servers.len());
        for (name, entry) in doc.mcp_servers {
            let raw_child: RawChild = serde_json::from_value(entry)
                .with_context(|| format!("invalid config for server '{name}'"))?;
            servers.push(ChildConfig::from_entry(name, raw_child)?);
        }
        Ok(Self { servers })
    }

    /// Load from an explicit path.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read fleet config: {}", path.display()))?;
        Self::parse(&raw)
            .with_context(|| format!("failed to parse fleet config: {}", path.display()))
    }

    /// Load, degrading to an empty fleet on a missing, empty, or malformed
    /// file so the control plane still comes up.
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            tracing::warn!(
                path = %path.display(),
                "fleet config not found, starting with an empty fleet"
            );
            return Self::default();
        }
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(error) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %format!("{error:#}"),
                    "fleet config unreadable, starting with an empty fleet"
                );
                Self::default()
            }
        }
    }

    /// Default location: `mcp_servers.json` beside the binary, falling back
    /// to the working directory when the executable path is unavailable.
    pub fn default_path() -> PathBuf {
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."))
            .join(DEFAULT_CONFIG_FILE)
    }
}

/// Serde keeps object order (`preserve_order`), so fleet declaration order
/// survives the round trip through the map.
#[derive(Deserialize)]
struct RawDocument {
    #[serde(rename = "mcpServers", default)]
    mcp_servers: serde_json::Map<String, serde_json::Value>,
}
