//! Tool registry for Flowdeck.
//!
//! The [`registry::SdkRegistry`] is the catalog of every tool a workflow
//! may call.  Tools are registered from workflow `tools:` configs and
//! resolved lazily: the first dispatch to `<tool>.<path…>` resolves secret
//! references in the tool's auth map, builds the client through its
//! registered [`initializer::Initializer`] (or the MCP connector), wraps
//! it in the reliability layer, and caches it until the registry clears.
//!
//! Built-in SDKs (`core`, `event`, `script`) are always registered with
//! no-op configs.  The `workflow.*` and `parallel.*` prefixes are reserved
//! for the engine, which intercepts them before dispatch reaches here.

pub mod builtin;
pub mod discovery;
pub mod http;
pub mod initializer;
pub mod mcp;
pub mod registry;

pub use builtin::event::EventBridge;
pub use initializer::{Initializer, ResolvedToolConfig};
pub use registry::{RegistryStats, SdkRegistry};
