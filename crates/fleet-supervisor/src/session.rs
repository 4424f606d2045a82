//! Transport-agnostic MCP session layer.
//!
//! A session is an initialized connection to one child endpoint, reused for
//! RPCs until it ages out. Stdio sessions own the process they speak to;
//! HTTP sessions hold only the streamable-HTTP client.

use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use rmcp::RoleClient;
use rmcp::model::{CallToolRequestParam, CallToolResult, Tool};
use rmcp::service::{RunningService, ServiceExt};
use serde_json::Value;
use tokio::process::Command;

use fleet_config::{ChildConfig, Transport};

/// Hard per-call bound for `list_tools` / `call_tool`.
pub(crate) const RPC_TIMEOUT: Duration = Duration::from_secs(30);
/// Tighter bound used by the health loop's probe.
pub(crate) const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
/// Sessions older than this are closed and reopened before the next RPC.
pub(crate) const SESSION_TTL: Duration = Duration::from_secs(3600);

const SESSION_SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// An initialized MCP connection to one child endpoint.
///
/// `ServiceExt::serve` performs the mandatory initialize handshake before
/// returning, so a constructed session is always ready for RPCs.
pub(crate) struct McpSession {
    backend: Backend,
    opened_at: Instant,
}

enum Backend {
    /// Child process speaking MCP framing over its stdin/stdout pair.
    Stdio {
        service: RunningService<RoleClient, ()>,
        child: Box<tokio::process::Child>,
    },
    /// Remote MCP server via Streamable HTTP transport.
    Http {
        service: RunningService<RoleClient, ()>,
    },
}

impl McpSession {
    pub(crate) async fn open(config: &ChildConfig) -> Result<Self> {
        let backend = match config.transport {
            Transport::Stdio => Self::open_stdio(config).await?,
            Transport::Http => Self::open_http(config).await?,
        };
        Ok(Self {
            backend,
            opened_at: Instant::now(),
        })
    }

    async fn open_stdio(config: &ChildConfig) -> Result<Backend> {
        let mut cmd = build_command(config)?;
        cmd.stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn MCP session for '{}'", config.name))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("failed to capture stdout for '{}'", config.name))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("failed to capture stdin for '{}'", config.name))?;
        if let Some(mut stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut sink = tokio::io::sink();
                let _ = tokio::io::copy(&mut stderr, &mut sink).await;
            });
        }

        let service = ()
            .serve((stdout, stdin))
            .await
            .with_context(|| format!("MCP handshake failed for '{}'", config.name))?;

        Ok(Backend::Stdio {
            service,
            child: Box::new(child),
        })
    }

    async fn open_http(config: &ChildConfig) -> Result<Backend> {
        use rmcp::transport::StreamableHttpClientTransport;

        let url = config
            .url
            .as_deref()
            .ok_or_else(|| anyhow!("server '{}' has no url", config.name))?;
        let transport = StreamableHttpClientTransport::from_uri(url);
        let service = ().serve(transport).await.with_context(|| {
            format!("MCP handshake failed for '{}' at {url}", config.name)
        })?;

        Ok(Backend::Http { service })
    }

    fn service(&self) -> &RunningService<RoleClient, ()> {
        match &self.backend {
            Backend::Stdio { service, .. } => service,
            Backend::Http { service } => service,
        }
    }

    pub(crate) fn is_expired(&self) -> bool {
        self.opened_at.elapsed() >= SESSION_TTL
    }

    pub(crate) async fn list_tools(&self, bound: Duration) -> Result<Vec<Tool>> {
        let response = tokio::time::timeout(bound, self.service().list_tools(None))
            .await
            .map_err(|_| anyhow!("list_tools timed out after {}s", bound.as_secs()))??;
        Ok(response.tools)
    }

    pub(crate) async fn call_tool(
        &self,
        tool: &str,
        arguments: Option<serde_json::Map<String, Value>>,
    ) -> Result<CallToolResult> {
        let mut request = CallToolRequestParam::new(tool.to_string());
        if let Some(arguments) = arguments {
            request = request.with_arguments(arguments);
        }
        let response = tokio::time::timeout(RPC_TIMEOUT, self.service().call_tool(request))
            .await
            .map_err(|_| {
                anyhow!("call_tool '{tool}' timed out after {}s", RPC_TIMEOUT.as_secs())
            })??;
        Ok(response)
    }

    /// Idempotent teardown; errors from a connection that is already gone are
    /// suppressed.
    pub(crate) async fn close(self) {
        match self.backend {
            Backend::Stdio {
                service,
                mut child,
            } => {
                let _ = service.cancel().await;
                match tokio::time::timeout(SESSION_SHUTDOWN_GRACE, child.wait()).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(error)) => {
                        tracing::debug!(error = %error, "failed to wait MCP session child");
                    }
                    Err(_) => {
                        let _ = child.kill().await;
                    }
                }
            }
            Backend::Http { service } => {
                let _ = service.cancel().await;
            }
        }
    }
}

/// Shell-split `command`, append `args`, overlay `env` on the inherited
/// environment. Shared with the supervised-process spawn path.
pub(crate) fn build_command(config: &ChildConfig) -> Result<Command> {
    let command = config
        .command
        .as_deref()
        .ok_or_else(|| anyhow!("server '{}' has no command", config.name))?;
    let parts = shell_words::split(command)
        .with_context(|| format!("server '{}': unparsable command", config.name))?;
    let Some((program, base_args)) = parts.split_first() else {
        anyhow::bail!("server '{}': empty command", config.name);
    };

    let mut cmd = Command::new(program);
    cmd.args(base_args).args(&config.args);
    for (key, value) in &config.env {
        cmd.env(key, value);
    }
    Ok(cmd)
}

/// Serialize an adapter-native tool descriptor to a plain JSON value, with a
/// string fallback for anything the encoder cannot represent.
pub(crate) fn tool_to_value(tool: &Tool) -> Value {
    serde_json::to_value(tool).unwrap_or_else(|_| Value::String(format!("{tool:?}")))
}

#[cfg(test)]
mod tests {
    use super::build_command;
    use fleet_config::{ChildConfig, Transport};
    use std::collections::HashMap;

    fn stdio_config(command: &str, args: &[&str]) -> ChildConfig {
        ChildConfig {
            name: "test".to_string(),
            transport: Transport::Stdio,
            command: Some(command.to_string()),
            args: args.iter().map(ToString::to_string).collect(),
            env: HashMap::new(),
            url: None,
        }
    }

    #[test]
    fn command_is_shell_split_before_args_are_appended() {
        let cmd = build_command(&stdio_config("uvx mcp-server-filesystem", &["/data"])).unwrap();
        let std_cmd = cmd.as_std();
        assert_eq!(std_cmd.get_program(), "uvx");
        let args: Vec<_> = std_cmd.get_args().collect();
        assert_eq!(args, ["mcp-server-filesystem", "/data"]);
    }

    #[test]
    fn quoted_segments_stay_together() {
        let cmd = build_command(&stdio_config(r#"run "my tool""#, &[])).unwrap();
        let args: Vec<_> = cmd.as_std().get_args().collect();
        assert_eq!(args, ["my tool"]);
    }

    #[test]
    fn empty_command_is_rejected() {
        let err = build_command(&stdio_config("", &[])).unwrap_err();
        assert!(err.to_string().contains("empty command"));
    }
}
