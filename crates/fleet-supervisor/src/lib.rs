//! Supervisor and multiplexing gateway for MCP tool servers.
//!
//! One [`Fleet`] owns a set of per-child supervisor actors ([`ChildHandle`]),
//! each driving a spawn → handshake → health-loop → retry/teardown lifecycle
//! over its own command queue. The fleet aggregates status and tool
//! inventories and routes tool calls by name; [`serve`] exposes it all over a
//! local HTTP control plane.

mod capture;
pub mod child;
pub mod fleet;
pub mod serve;
mod session;
pub mod tokens;

pub use capture::OutputLine;
pub use child::{ChildHandle, ChildInfo, ChildState, ToolsInfo};
pub use fleet::{Fleet, FleetError, StatusEntry, TARGET_ALL, ToolsEntry};
pub use tokens::{Cl100kCounter, SchemaTokenCounter};
