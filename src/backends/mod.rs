//! Load balancing strategies over a dynamic backend pool

mod balancer;
mod consistent_hash;
mod node;
mod random;
mod round_robin;
mod weight_round_robin;

pub use balancer::LoadBalancer;
pub use consistent_hash::{ConsistentHashBalance, HashFn};
pub use node::{split_entry, WeightNode};
pub use random::RandomBalance;
pub use round_robin::RoundRobinBalance;
pub use weight_round_robin::WeightRoundRobinBalance;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

use crate::config::BalancerConfig;
use crate::membership::MembershipSource;

/// Errors returned by balancing strategies
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BalanceError {
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Invalid weight '{0}': not an integer")]
    InvalidWeight(String),

    #[error("No backend available: pool is empty")]
    PoolEmpty,

    #[error("Unknown load balancer strategy: '{0}'. Supported: round_robin, weight_round_robin, consistent_hash, random")]
    UnknownStrategy(String),
}

/// The closed set of balancing strategies
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BalanceKind {
    #[default]
    RoundRobin,
    WeightRoundRobin,
    ConsistentHash,
    Random,
}

impl BalanceKind {
    pub const ALL: [BalanceKind; 4] = [
        BalanceKind::RoundRobin,
        BalanceKind::WeightRoundRobin,
        BalanceKind::ConsistentHash,
        BalanceKind::Random,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BalanceKind::RoundRobin => "round_robin",
            BalanceKind::WeightRoundRobin => "weight_round_robin",
            BalanceKind::ConsistentHash => "consistent_hash",
            BalanceKind::Random => "random",
        }
    }

    /// Short description for CLI listings
    pub fn description(&self) -> &'static str {
        match self {
            BalanceKind::RoundRobin => "Rotates through backends in order",
            BalanceKind::WeightRoundRobin => "Smooth weighted round robin; entries are 'address,weight'",
            BalanceKind::ConsistentHash => "CRC-32 hash ring keyed by client address or hash header",
            BalanceKind::Random => "Uniform random pick per request",
        }
    }

    /// Returns true if pool entries must carry a weight
    pub fn requires_weight(&self) -> bool {
        matches!(self, BalanceKind::WeightRoundRobin)
    }
}

impl std::fmt::Display for BalanceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BalanceKind {
    type Err = BalanceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BalanceKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| BalanceError::UnknownStrategy(s.to_string()))
    }
}

/// Construction parameters shared by all strategies
#[derive(Debug, Clone, Copy)]
pub struct BalancerOptions {
    /// Virtual nodes per address on the consistent hash ring
    pub replicas: usize,
    /// Log every membership rebuild at info level
    pub verbose: bool,
}

impl Default for BalancerOptions {
    fn default() -> Self {
        Self {
            replicas: 10,
            verbose: false,
        }
    }
}

impl From<&BalancerConfig> for BalancerOptions {
    fn from(config: &BalancerConfig) -> Self {
        Self {
            replicas: config.replicas,
            verbose: config.verbose,
        }
    }
}

/// Build an empty, ready-to-use load balancer for a strategy
pub fn build_balancer(kind: BalanceKind, options: BalancerOptions) -> Arc<dyn LoadBalancer> {
    match kind {
        BalanceKind::RoundRobin => Arc::new(RoundRobinBalance::with_options(options)),
        BalanceKind::WeightRoundRobin => Arc::new(WeightRoundRobinBalance::with_options(options)),
        BalanceKind::ConsistentHash => Arc::new(ConsistentHashBalance::with_options(options)),
        BalanceKind::Random => Arc::new(RandomBalance::with_options(options)),
    }
}

/// Holder for a strategy's attached membership source
#[derive(Default)]
pub(crate) struct ConfSlot {
    conf: RwLock<Option<Arc<dyn MembershipSource>>>,
}

impl ConfSlot {
    pub(crate) fn set(&self, conf: Arc<dyn MembershipSource>) {
        *self.conf.write() = Some(conf);
    }

    /// Current snapshot of the attached source, or `None` when nothing is attached
    pub(crate) fn snapshot(&self) -> Option<Vec<String>> {
        let conf = self.conf.read().clone()?;
        Some(conf.get_conf())
    }
}

pub(crate) fn log_rebuild(verbose: bool, strategy: &str, entries: &[String]) {
    if verbose {
        tracing::info!(strategy, entries = ?entries, "Rebuilding backend pool");
    } else {
        tracing::debug!(strategy, count = entries.len(), "Rebuilding backend pool");
    }
}
