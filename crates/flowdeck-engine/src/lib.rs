//! Workflow execution engine for Flowdeck.
//!
//! The [`engine::WorkflowEngine`] drives a parsed
//! [`flowdeck_core::Workflow`] against initial inputs: it walks the step
//! list, resolves `{{ … }}` templates through the variable scope,
//! dispatches actions through the SDK registry, and records a
//! [`result::WorkflowResult`] with per-step statuses and the final scope.
//!
//! Sequential steps run one at a time; `parallel` steps and `for-each`
//! steps with `concurrency > 1` run cooperatively concurrent tasks over
//! isolated child scopes.  The `workflow.*` and `parallel.*` action
//! prefixes are intercepted here rather than dispatched to the registry.

pub mod context;
pub mod engine;
pub mod result;

pub use context::ExecutionContext;
pub use engine::{EngineConfig, WorkflowEngine};
pub use result::WorkflowResult;
