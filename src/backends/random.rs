//! Random load balancing strategy

use parking_lot::{Mutex, RwLock};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::sync::Arc;

use super::balancer::LoadBalancer;
use super::node::{address_param, split_entry};
use super::{log_rebuild, BalanceError, BalancerOptions, ConfSlot};
use crate::membership::MembershipSource;

/// Picks a uniformly random address per request
pub struct RandomBalance {
    addrs: RwLock<Vec<String>>,
    rng: Mutex<SmallRng>,
    conf: ConfSlot,
    verbose: bool,
}

impl RandomBalance {
    pub fn new() -> Self {
        Self::with_rng(SmallRng::from_entropy())
    }

    /// Deterministic sequence, for reproducible runs
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(SmallRng::seed_from_u64(seed))
    }

    pub fn with_options(options: BalancerOptions) -> Self {
        Self {
            verbose: options.verbose,
            ..Self::new()
        }
    }

    fn with_rng(rng: SmallRng) -> Self {
        Self {
            addrs: RwLock::new(Vec::new()),
            rng: Mutex::new(rng),
            conf: ConfSlot::default(),
            verbose: false,
        }
    }
}

impl Default for RandomBalance {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for RandomBalance {
    fn add(&self, params: &[&str]) -> Result<(), BalanceError> {
        let addr = address_param(params)?;
        self.addrs.write().push(addr.to_string());
        Ok(())
    }

    fn get(&self, _key: &str) -> Result<String, BalanceError> {
        let addrs = self.addrs.read();
        if addrs.is_empty() {
            return Err(BalanceError::PoolEmpty);
        }
        let idx = self.rng.lock().gen_range(0..addrs.len());
        Ok(addrs[idx].clone())
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
        *self.addrs.write() = addrs;
    }

    fn strategy_name(&self) -> &'static str {
        "random"
    }

    fn all_nodes(&self) -> Vec<String> {
        self.addrs.read().clone()
    }
}
