//! Secret reference resolution for Flowdeck.
//!
//! Tool `auth` maps may contain *secret references* instead of literal
//! values:
//!
//! ```text
//! ${secret:env://SLACK_TOKEN}
//! ${secret:env://SERVICE_CREDS#api_key}
//! secret:env://SLACK_TOKEN
//! ```
//!
//! A reference names a provider, a path, and an optional key selector.
//! Resolution dispatches to a registered [`provider::SecretProvider`];
//! resolved values are cached with a TTL so repeated tool loads do not
//! re-fetch.  Anything that does not match the reference syntax is treated
//! as a literal and passed through untouched.

pub mod manager;
pub mod provider;
pub mod reference;

pub use manager::{SecretManager, SecretManagerConfig};
pub use provider::{EnvProvider, SecretProvider};
pub use reference::SecretReference;
