//! Configuration loading
//!
//! Two declarative inputs: the server registry (`servers.yaml`) and the
//! hook declarations (`hooks.yaml`).

pub mod hooks;
pub mod registry;

pub use hooks::{FieldSpec, HookDefaults, HookRule, HooksConfig};
pub use registry::{
    expand_placeholders, RegistryDefaults, RetryRule, ServerConfig, ServerRegistry, TransportKind,
};
