//! Round-robin load balancing strategy

use parking_lot::RwLock;
use std::sync::Arc;

use super::balancer::LoadBalancer;
use super::node::{address_param, split_entry};
use super::{log_rebuild, BalanceError, BalancerOptions, ConfSlot};
use crate::membership::MembershipSource;

#[derive(Debug, Default)]
struct RoundRobinPool {
    addrs: Vec<String>,
    /// Index of the last served address
    cursor: usize,
}

/// Round-robin load balancer, cycles through addresses in order
#[derive(Default)]
pub struct RoundRobinBalance {
    pool: RwLock<RoundRobinPool>,
    conf: ConfSlot,
    verbose: bool,
}

impl RoundRobinBalance {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: BalancerOptions) -> Self {
        Self {
            verbose: options.verbose,
            ..Self::default()
        }
    }

    /// Advance the cursor and return the address under it.
    ///
    /// The cursor starts at 0 and is incremented before reading, so a fresh pool of
    /// more than one address serves index 1 first.
    pub fn next(&self) -> Option<String> {
        // The cursor mutates on every pick, so even lookups take the write lock
        let mut pool = self.pool.write();
        if pool.addrs.is_empty() {
            return None;
        }
        pool.cursor = (pool.cursor + 1) % pool.addrs.len();
        Some(pool.addrs[pool.cursor].clone())
    }

    /// Index of the last served address
    pub fn cursor(&self) -> usize {
        self.pool.read().cursor
    }
}

impl LoadBalancer for RoundRobinBalance {
    fn add(&self, params: &[&str]) -> Result<(), BalanceError> {
        let addr = address_param(params)?;
        self.pool.write().addrs.push(addr.to_string());
        Ok(())
    }

    fn get(&self, _key: &str) -> Result<String, BalanceError> {
        self.next().ok_or(BalanceError::PoolEmpty)
    }

    fn set_conf(&self, conf: Arc<dyn MembershipSource>) {
        self.conf.set(conf);
    }

    fn update(&self) {
        let Some(entries) = self.conf.snapshot() else {
            return;
        };
        log_rebuild(self.verbose, self.strategy_name(), &entries);

        let addrs: Vec<String> = entries
            .iter()
            .filter_map(|entry| split_entry(entry).first().map(|addr| addr.to_string()))
            .collect();

        let mut pool = self.pool.write();
        pool.addrs = addrs;
        pool.cursor = 0;
    }

    fn strategy_name(&self) -> &'static str {
        "round_robin"
    }

    fn all_nodes(&self) -> Vec<String> {
        self.pool.read().addrs.clone()
    }
}
