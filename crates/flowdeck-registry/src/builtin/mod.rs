//! Built-in SDKs.
//!
//! Registered under reserved prefixes with no-op configs: `core` (data
//! shaping, crypto, logging, waiting), `event` (event-source bridge), and
//! `script` (expression-script execution).  The `workflow.*` and
//! `parallel.*` prefixes are also reserved but intercepted by the engine
//! before dispatch reaches the registry.

pub mod core;
pub mod event;
pub mod script;

/// Action prefixes reserved for built-ins and engine interception.
pub const RESERVED_PREFIXES: [&str; 5] = ["core", "workflow", "parallel", "event", "script"];
