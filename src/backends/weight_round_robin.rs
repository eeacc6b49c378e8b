//! Smooth weighted round-robin load balancing strategy
//!
//! Each pick adds every node's effective weight to its current weight, serves the node
//! with the highest current weight and subtracts the round total from it. Weights
//! 4:3:2:1 produce an interleaved sequence such as `a b c a b d a c b a` rather than
//! `a a a a b b b c c d`.

use parking_lot::RwLock;
use std::sync::Arc;

use super::balancer::LoadBalancer;
use super::node::{split_entry, WeightNode};
use super::{log_rebuild, BalanceError, BalancerOptions, ConfSlot};
use crate::membership::MembershipSource;

/// Weighted round-robin load balancer
#[derive(Default)]
pub struct WeightRoundRobinBalance {
    nodes: RwLock<Vec<WeightNode>>,
    conf: ConfSlot,
    verbose: bool,
}

impl WeightRoundRobinBalance {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: BalancerOptions) -> Self {
        Self {
            verbose: options.verbose,
            ..Self::default()
        }
    }

    /// Select the next address
    pub fn next(&self) -> Option<String> {
        let mut nodes = self.nodes.write();

        let mut total = 0i64;
        let mut best: Option<(usize, i64)> = None;
        for (idx, node) in nodes.iter_mut().enumerate() {
            total += node.effective_weight;
            node.current_weight += node.effective_weight;
            if node.effective_weight < node.weight {
                node.effective_weight += 1;
            }
            // Strictly greater, so the first node wins ties
            if best.map_or(true, |(_, current)| node.current_weight > current) {
                best = Some((idx, node.current_weight));
            }
        }

        let (best, _) = best?;
        let node = &mut nodes[best];
        node.current_weight -= total;
        Some(node.addr.clone())
    }

    /// Lower the effective weight of `addr` by `delta`, never below zero.
    ///
    /// Returns false when the address is not in the pool.
    pub fn degrade(&self, addr: &str, delta: i64) -> bool {
        let mut nodes = self.nodes.write();
        match nodes.iter_mut().find(|node| node.addr == addr) {
            Some(node) => {
                node.effective_weight = (node.effective_weight - delta).max(0);
                true
            }
            None => false,
        }
    }

    /// Copy of the node states, in pool order
    pub fn nodes(&self) -> Vec<WeightNode> {
        self.nodes.read().clone()
    }
}

impl LoadBalancer for WeightRoundRobinBalance {
    fn add(&self, params: &[&str]) -> Result<(), BalanceError> {
        let node = WeightNode::from_params(params)?;
        self.nodes.write().push(node);
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

        let mut rebuilt = Vec::with_capacity(entries.len());
        for entry in &entries {
            match WeightNode::from_params(&split_entry(entry)) {
                Ok(node) => rebuilt.push(node),
                Err(e) => {
                    tracing::warn!(entry = %entry, error = %e, "Skipping malformed weighted entry");
                }
            }
        }

        *self.nodes.write() = rebuilt;
    }

    fn report_failure(&self, addr: &str) {
        if self.degrade(addr, 1) {
            tracing::debug!(backend = %addr, "Lowered effective weight after failure");
        }
    }

    fn strategy_name(&self) -> &'static str {
        "weight_round_robin"
    }

    fn all_nodes(&self) -> Vec<String> {
        self.nodes.read().iter().map(|node| node.addr.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::StaticListSource;
    use std::collections::HashMap;

    fn make_balancer(nodes: &[(&str, &str)]) -> WeightRoundRobinBalance {
        let balancer = WeightRoundRobinBalance::new();
        for (addr, weight) in nodes {
            balancer.add(&[*addr, *weight]).unwrap();
        }
        balancer
    }

    fn four_three_two_one() -> WeightRoundRobinBalance {
        make_balancer(&[("a", "4"), ("b", "3"), ("c", "2"), ("d", "1")])
    }

    #[test]
    fn test_smooth_sequence() {
        let balancer = four_three_two_one();
        let picks: Vec<String> = (0..10).map(|_| balancer.next().unwrap()).collect();

        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "d", "a", "c", "b", "a"]);
    }

    #[test]
    fn test_weighted_fairness_every_window() {
        let balancer = four_three_two_one();
        let picks: Vec<String> = (0..100).map(|_| balancer.next().unwrap()).collect();

        for window in picks.chunks(10) {
            let mut counts: HashMap<&str, usize> = HashMap::new();
            for pick in window {
                *counts.entry(pick.as_str()).or_default() += 1;
            }
            assert_eq!(counts["a"], 4);
            assert_eq!(counts["b"], 3);
            assert_eq!(counts["c"], 2);
            assert_eq!(counts["d"], 1);
        }

        assert_eq!(picks[0], "a");
        assert_ne!(&picks[..4], &["a", "a", "a", "a"]);
    }

    #[test]
    fn test_current_weights_return_to_zero_after_cycle() {
        let balancer = four_three_two_one();
        for _ in 0..10 {
            balancer.next();
        }
        assert!(balancer.nodes().iter().all(|node| node.current_weight == 0));
    }

    #[test]
    fn test_equal_weights_first_wins_ties() {
        let balancer = make_balancer(&[("x", "1"), ("y", "1")]);
        assert_eq!(balancer.next().unwrap(), "x");
        assert_eq!(balancer.next().unwrap(), "y");
        assert_eq!(balancer.next().unwrap(), "x");
    }

    #[test]
    fn test_add_validation() {
        let balancer = WeightRoundRobinBalance::new();
        assert!(matches!(
            balancer.add(&["127.0.0.1:2003"]),
            Err(BalanceError::InvalidParameters(_))
        ));
        assert_eq!(
            balancer.add(&["127.0.0.1:2003", "ten"]),
            Err(BalanceError::InvalidWeight("ten".to_string()))
        );
        assert!(balancer.all_nodes().is_empty());
        assert_eq!(balancer.get(""), Err(BalanceError::PoolEmpty));
    }

    #[test]
    fn test_degrade_and_recover() {
        let balancer = make_balancer(&[("a", "4"), ("b", "1")]);
        assert!(balancer.degrade("a", 4));
        assert!(!balancer.degrade("missing", 1));

        // 'a' starts at effective weight 0 and climbs back one step per pick
        assert_eq!(balancer.next().unwrap(), "b");
        let a = balancer.nodes().into_iter().find(|n| n.addr == "a").unwrap();
        assert_eq!(a.effective_weight, 1);

        for _ in 0..3 {
            balancer.next();
        }
        let a = balancer.nodes().into_iter().find(|n| n.addr == "a").unwrap();
        assert_eq!(a.effective_weight, a.weight);
    }

    #[test]
    fn test_report_failure_floors_at_zero() {
        let balancer = make_balancer(&[("a", "1")]);
        balancer.report_failure("a");
        balancer.report_failure("a");
        assert_eq!(balancer.nodes()[0].effective_weight, 0);
    }

    #[test]
    fn test_update_rebuilds_and_skips_malformed() {
        let balancer = four_three_two_one();
        balancer.next();

        let source = Arc::new(StaticListSource::new(vec![
            "127.0.0.1:2003,10".to_string(),
            "127.0.0.1:2004".to_string(),
            "127.0.0.1:2005,20".to_string(),
        ]));
        balancer.set_conf(source);
        balancer.update();

        let nodes = balancer.nodes();
        assert_eq!(nodes.len(), 2);
        assert!(nodes.iter().all(|node| node.current_weight == 0));
        assert_eq!(balancer.all_nodes(), vec!["127.0.0.1:2003", "127.0.0.1:2005"]);

        // Weights 10:20 => first pick goes to the heavier node
        assert_eq!(balancer.next().unwrap(), "127.0.0.1:2005");
    }

    #[test]
    fn test_strategy_name() {
        assert_eq!(WeightRoundRobinBalance::new().strategy_name(), "weight_round_robin");
    }
}
