//! Switchboard Core Library
//!
//! This crate provides the core functionality for the Switchboard router:
//! the server registry, transport layer, lifecycle management, the call
//! proxy with hooks, and the operation router that fronts all of it.

pub mod client;
pub mod config;
pub mod discover;
pub mod error;
pub mod hooks;
pub mod index;
pub mod lifecycle;
pub mod protocol;
pub mod proxy;
pub mod reaper;
pub mod router;
pub mod transport;
pub mod usage;

// Re-export commonly used types
pub use client::ServerConnection;
pub use config::{HooksConfig, RetryRule, ServerConfig, ServerRegistry, TransportKind};
pub use error::{SwitchboardError, SwitchboardResult};
pub use hooks::{HookEngine, HookInvocation};
pub use index::{ToolCache, ToolDescriptor, ToolIndex};
pub use lifecycle::{Lifecycle, RunningServer};
pub use protocol::{ToolCallResult, ToolContent, ToolDefinition};
pub use proxy::CallProxy;
pub use reaper::IdleReaper;
pub use router::{Operation, OperationOutcome, Router};
pub use transport::{
    DefaultTransportFactory, Diagnostics, HttpTransport, StdioTransport, Transport,
    TransportFactory,
};
pub use usage::UsageLog;
