//! Core abstractions for the weir workflow engine
//!
//! This crate provides the dataflow substrate that the runtime builds on:
//! information packets (handles to on-disk artifacts), the file and
//! parameter ports that connect processes, the `{kind:name}` placeholder
//! language for command templates, and the `Process` contract.

mod config;
mod error;
mod ip;
mod port;
mod process;
mod template;

pub use config::{EngineConfig, DEFAULT_BUF_SIZE};
pub use error::{IpError, PortError, TaskError, WeirError, WorkflowError};
pub use ip::{AuditInfo, Ip};
pub use port::{FilePort, ParamPort, PortId};
pub use process::Process;
pub use template::{
    expand_params, format_command, parse_placeholders, Placeholder, PlaceholderKind,
};

/// Result type for weir operations
pub type Result<T> = std::result::Result<T, WeirError>;
