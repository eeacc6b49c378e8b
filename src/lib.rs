//! gateway-proxy: HTTP reverse proxy gateway with dynamic backend membership
//!
//! Features:
//! - Pluggable load balancing (round robin, smooth weighted round robin, consistent hash, random)
//! - Membership pushed from a static list, a coordination-service registry, or health checks
//! - Registry client with session expiry handling, ephemeral registration and watch loops
//! - Request counters exposed on `/gateway/stats`

pub mod backends;
pub mod config;
pub mod membership;
pub mod proxy;
pub mod registry;
pub mod stats;

pub use backends::{build_balancer, BalanceKind, LoadBalancer};
pub use config::AppConfig;
pub use membership::{bind, build_source, MembershipSource};
pub use proxy::run_server;
pub use registry::{build_client, RegistryClient};
