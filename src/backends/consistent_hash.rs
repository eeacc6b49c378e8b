//! Consistent hash load balancing strategy
//!
//! Every address is placed on a 32-bit ring `replicas` times, at
//! `hash(replica_index ++ address)`. A key is served by the first ring position at or
//! after `hash(key)`, wrapping to the smallest position when it falls past the end.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use super::balancer::LoadBalancer;
use super::node::{address_param, split_entry};
use super::{log_rebuild, BalanceError, BalancerOptions, ConfSlot};
use crate::membership::MembershipSource;

/// Ring hash function
pub type HashFn = fn(&[u8]) -> u32;

#[derive(Debug, Default)]
struct Ring {
    /// Ring positions, ascending
    keys: Vec<u32>,
    owners: HashMap<u32, String>,
    /// Distinct addresses in insertion order
    addrs: Vec<String>,
}

impl Ring {
    fn insert(&mut self, addr: &str, replicas: usize, hash: HashFn) {
        if self.addrs.iter().any(|existing| existing == addr) {
            return;
        }
        self.keys.reserve(replicas);
        for i in 0..replicas {
            let position = hash(format!("{}{}", i, addr).as_bytes());
            // A colliding position keeps its first owner
            if let std::collections::hash_map::Entry::Vacant(slot) = self.owners.entry(position) {
                slot.insert(addr.to_string());
                self.keys.push(position);
            }
        }
        self.keys.sort_unstable();
        self.addrs.push(addr.to_string());
    }

    fn lookup(&self, position: u32) -> Option<&str> {
        let idx = self.keys.partition_point(|&key| key < position);
        let key = self.keys.get(idx).or_else(|| self.keys.first())?;
        self.owners.get(key).map(String::as_str)
    }
}

/// Consistent hash load balancer
pub struct ConsistentHashBalance {
    ring: RwLock<Ring>,
    replicas: usize,
    hash: HashFn,
    conf: ConfSlot,
    verbose: bool,
}

impl ConsistentHashBalance {
    /// Create a ring with `replicas` virtual nodes per address. `hash` defaults to CRC-32 (IEEE).
    pub fn new(replicas: usize, hash: Option<HashFn>) -> Self {
        Self {
            ring: RwLock::new(Ring::default()),
            replicas,
            hash: hash.unwrap_or(crc32fast::hash),
            conf: ConfSlot::default(),
            verbose: false,
        }
    }

    pub fn with_options(options: BalancerOptions) -> Self {
        Self {
            verbose: options.verbose,
            ..Self::new(options.replicas, None)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ring.read().keys.is_empty()
    }

    /// Number of positions on the ring
    pub fn ring_len(&self) -> usize {
        self.ring.read().keys.len()
    }

    pub fn replicas(&self) -> usize {
        self.replicas
    }
}

impl LoadBalancer for ConsistentHashBalance {
    fn add(&self, params: &[&str]) -> Result<(), BalanceError> {
        let addr = address_param(params)?;
        self.ring.write().insert(addr, self.replicas, self.hash);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<String, BalanceError> {
        let position = (self.hash)(key.as_bytes());
        // Lookups never mutate the ring, so a shared lock is enough
        let ring = self.ring.read();
        ring.lookup(position)
            .map(str::to_string)
            .ok_or(BalanceError::PoolEmpty)
    }

    fn set_conf(&self, conf: Arc<dyn MembershipSource>) {
        self.conf.set(conf);
    }

    fn update(&self) {
        let Some(entries) = self.conf.snapshot() else {
            return;
        };
        log_rebuild(self.verbose, self.strategy_name(), &entries);

        let mut rebuilt = Ring::default();
        for entry in &entries {
            if let Some(addr) = split_entry(entry).first() {
                rebuilt.insert(addr, self.replicas, self.hash);
            }
        }

        *self.ring.write() = rebuilt;
    }

    fn strategy_name(&self) -> &'static str {
        "consistent_hash"
    }

    fn all_nodes(&self) -> Vec<String> {
        self.ring.read().addrs.clone()
    }
}
