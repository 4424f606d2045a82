//! Fleet supervisor: owns all child supervisors, fans out lifecycle commands,
//! aggregates status, and routes tool calls to whichever child owns the name.

use std::sync::Arc;

use rmcp::model::CallToolResult;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use fleet_config::FleetConfig;

use crate::child::{ChildHandle, ChildInfo, ChildState, ToolsInfo};
use crate::session::tool_to_value;
use crate::tokens::{Cl100kCounter, SchemaTokenCounter};

/// Target accepted by `start`/`stop` to fan out over every child.
pub const TARGET_ALL: &str = "all";

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("unknown child: {0}")]
    UnknownChild(String),
    #[error("tool '{0}' not found")]
    ToolNotFound(String),
    #[error(transparent)]
    Rpc(#[from] anyhow::Error),
}

/// One `/status` entry: lifecycle snapshot plus live tool inventory.
#[derive(Debug, Clone, Serialize)]
pub struct StatusEntry {
    #[serde(flatten)]
    pub info: ChildInfo,
    #[serde(flatten)]
    pub tools: ToolsInfo,
}

/// One `/tools` entry: the tool list, or a per-child error with an empty list.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ToolsEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub tools: Vec<Value>,
}

/// The full set of supervised children. The map is immutable after
/// construction; lifecycle changes flow through the children's queues.
pub struct Fleet {
    children: Vec<Arc<ChildHandle>>,
    counter: Option<Box<dyn SchemaTokenCounter>>,
}

impl Fleet {
    /// Construct every child in declaration order, all `stopped`.
    pub fn new(config: FleetConfig) -> Self {
        let children = config
            .servers
            .into_iter()
            .map(|child| Arc::new(ChildHandle::spawn(child)))
            .collect();
        let counter = match Cl100kCounter::new() {
            Ok(counter) => Some(Box::new(counter) as Box<dyn SchemaTokenCounter>),
            Err(error) => {
                tracing::warn!(error = %error, "schema token counter unavailable");
                None
            }
        };
        Self { children, counter }
    }

    /// Swap in a different schema tokenizer.
    pub fn with_counter(mut self, counter: Box<dyn SchemaTokenCounter>) -> Self {
        self.counter = Some(counter);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn child(&self, name: &str) -> Option<&Arc<ChildHandle>> {
        self.children.iter().find(|child| child.name() == name)
    }

    /// Enqueue start for one child or every child. Fan-out only enqueues, so
    /// the control plane stays reachable while children stabilize or fail.
    pub async fn start(&self, target: &str) -> Result<(), FleetError> {
        if target == TARGET_ALL {
            for child in &self.children {
                child.start().await;
            }
            return Ok(());
        }
        let child = self
            .child(target)
            .ok_or_else(|| FleetError::UnknownChild(target.to_string()))?;
        child.start().await;
        Ok(())
    }

    /// Enqueue graceful stop for one child or every child.
    pub async fn stop(&self, target: &str) -> Result<(), FleetError> {
        if target == TARGET_ALL {
            for child in &self.children {
                child.stop().await;
            }
            return Ok(());
        }
        let child = self
            .child(target)
            .ok_or_else(|| FleetError::UnknownChild(target.to_string()))?;
        child.stop().await;
        Ok(())
    }

    /// Per-child snapshot merged with its live tool inventory. Per-child
    /// failures surface inside the entry without failing the whole call.
    pub async fn status(&self) -> Map<String, Value> {
        let mut out = Map::new();
        for child in &self.children {
            let entry = StatusEntry {
                info: child.info(),
                tools: child.tools_info(self.counter.as_deref()).await,
            };
            out.insert(
                child.name().to_string(),
                serde_json::to_value(&entry).unwrap_or(Value::Null),
            );
        }
        out
    }

    /// Per-child tool lists. Errored children short-circuit with their state
    /// as the error; everyone else is asked live.
    pub async fn tools(&self) -> Map<String, Value> {
        let mut out = Map::new();
        for child in &self.children {
            let entry = if child.state() == ChildState::Errored {
                ToolsEntry {
                    error: Some(format!("MCP state is {}", child.state())),
                    ..ToolsEntry::default()
                }
            } else {
                match child.list_tools().await {
                    Ok(tools) => ToolsEntry {
                        error: None,
                        tools: tools.iter().map(tool_to_value).collect(),
                    },
                    Err(error) => {
                        tracing::warn!(
                            child = %child.name(),
                            error = %format!("{error:#}"),
                            "listing tools failed"
                        );
                        ToolsEntry {
                            error: Some(format!("{error:#}")),
                            ..ToolsEntry::default()
                        }
                    }
                }
            };
            out.insert(
                child.name().to_string(),
                serde_json::to_value(&entry).unwrap_or(Value::Null),
            );
        }
        out
    }

    /// Route a call to the first child (declaration order) exposing the named
    /// tool. Errored children are skipped; lookup failures on one child do not
    /// stop the scan; the owning child's RPC errors are surfaced.
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<CallToolResult, FleetError> {
        for child in &self.children {
            if child.state() == ChildState::Errored {
                continue;
            }
            let tools = match child.list_tools().await {
                Ok(tools) => tools,
                Err(error) => {
                    tracing::debug!(
                        child = %child.name(),
                        error = %format!("{error:#}"),
                        "skipping child during tool lookup"
                    );
                    continue;
                }
            };
            if tools.iter().any(|t| t.name.as_ref() == tool) {
                return child
                    .call_tool(tool, arguments.clone())
                    .await
                    .map_err(FleetError::Rpc);
            }
        }
        Err(FleetError::ToolNotFound(tool.to_string()))
    }

    /// Stop every child and join its worker; only used at process shutdown.
    pub async fn shutdown(&self) {
        for child in &self.children {
            child.shutdown().await;
        }
    }
}

#[cfg(test)]
#[path = "fleet_tests.rs"]
mod tests;
