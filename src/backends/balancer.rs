//! Load balancer trait

use std::sync::Arc;

use super::BalanceError;
use crate::membership::MembershipSource;

/// Trait for load balancing strategies across a dynamic pool of backend addresses
pub trait LoadBalancer: Send + Sync {
    /// Append a backend to the pool. `params` is `[address]` or `[address, weight]`
    /// depending on the strategy.
    fn add(&self, params: &[&str]) -> Result<(), BalanceError>;

    /// Select a backend for `key`. Only key-aware strategies look at the key.
    fn get(&self, key: &str) -> Result<String, BalanceError>;

    /// Attach the membership source that `update` rebuilds from
    fn set_conf(&self, conf: Arc<dyn MembershipSource>);

    /// Rebuild the pool from the attached source's current snapshot
    fn update(&self);

    /// Signal that forwarding to `addr` failed. Only weighted strategies react.
    fn report_failure(&self, _addr: &str) {}

    /// Return the strategy name (for logging)
    fn strategy_name(&self) -> &'static str;

    /// Return all addresses in the pool (for logging/CLI display)
    fn all_nodes(&self) -> Vec<String>;
}
