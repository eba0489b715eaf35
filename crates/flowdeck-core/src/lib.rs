//! Shared data model and error taxonomy for the Flowdeck workflow engine.
//!
//! This crate defines:
//!
//! - **Error taxonomy**: every failure in the system is an [`error::EngineError`]
//!   carrying an [`error::ErrorKind`] that downstream layers (the reliability
//!   wrapper, the engine's retry policy) use to decide whether to retry.
//! - **Workflow model**: the parsed, immutable workflow document — steps,
//!   policies, tool configs, event-source definitions — via [`workflow`].
//! - **Variable scope**: the mutable mapping expression resolution reads and
//!   step outputs write into, via [`scope::VariableScope`].
//! - **Tool client seam**: the single dispatch trait every connector
//!   implements and the reliability layer decorates, via
//!   [`client::ToolClient`].

pub mod client;
pub mod error;
pub mod scope;
pub mod workflow;

pub use client::ToolClient;
pub use error::{EngineError, ErrorKind, Result};
pub use scope::VariableScope;
pub use workflow::{
    Branch, ErrorPolicy, EventSourceConfig, EventSourceKind, RetryPolicy, Step, StepKind,
    StepResult, StepStatus, ToolConfig, WaitPolicy, Workflow, WorkflowMetadata, WorkflowMode,
    WorkflowStatus,
};
