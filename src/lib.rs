//! MountProxy - A path-mounted HTTP reverse proxy
//!
//! Provides:
//! - Prefix routing over a JSON rule store (first match wins)
//! - Forward path and header translation to the configured origin
//! - Best-effort HTML link rewriting back to the mount prefix
//! - Health check endpoint

pub mod client_ip;
pub mod error;
pub mod forward;
pub mod proxy;
pub mod rewrite;
pub mod router;
pub mod rules;
pub mod upstream;

pub use error::ProxyError;
pub use proxy::{ProxyConfig, ProxyServer};
pub use router::{match_route, RouteMatch};
pub use rules::{ProxyRule, RuleStore, RuleUpdate};
