//! Membership config sources
//!
//! A source is an observable list of `address[,weight]` entries. Strategies read the
//! list with [`MembershipSource::get_conf`] when their [`Observer::update`] fires.
//! Sources:
//! - [`StaticListSource`]: fixed list from configuration
//! - [`RegistryWatchSource`]: children of a registry group node, pushed by a watch
//! - [`HealthCheckSource`]: candidates filtered by periodic liveness checks

mod health_check;
mod registry_watch;
mod static_list;

pub use health_check::{HealthCheckSource, HealthChecker, HttpHealthChecker, TcpHealthChecker};
pub use registry_watch::RegistryWatchSource;
pub use static_list::StaticListSource;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};

use crate::backends::LoadBalancer;
use crate::config::AppConfig;
use crate::registry::{RegistryClient, RegistryError};

/// Something that reacts to membership changes
pub trait Observer: Send + Sync {
    fn update(&self);
}

/// Observable provider of the current backend list
#[async_trait]
pub trait MembershipSource: Send + Sync {
    /// Current entries, each `address` or `address,weight`
    fn get_conf(&self) -> Vec<String>;

    /// Register an observer to be notified on every change
    fn attach(&self, observer: Arc<dyn Observer>);

    /// Run the source's change loop. Static sources return immediately; live sources run
    /// for the lifetime of the process.
    async fn watch_conf(&self) -> Result<(), MembershipError>;

    /// Replace the entries and notify observers
    fn update_conf(&self, conf: Vec<String>);

    /// Source name (for logging)
    fn name(&self) -> &'static str;
}

#[derive(Debug, thiserror::Error)]
pub enum MembershipError {
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Membership source '{0}' requires a registry client")]
    NoRegistry(&'static str),

    #[error("No candidate servers configured for {0}")]
    NoCandidates(&'static str),
}

/// Which source feeds the balancer
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    #[default]
    Static,
    Registry,
    HealthCheck,
}

/// Entry storage plus observer fan-out shared by every source.
///
/// Notifications are serialized, so an observer's `update` never runs concurrently with
/// itself for the same subject.
#[derive(Default)]
pub struct Subject {
    entries: RwLock<Vec<String>>,
    observers: RwLock<Vec<Arc<dyn Observer>>>,
    notify_lock: Mutex<()>,
}

impl Subject {
    pub fn new(entries: Vec<String>) -> Self {
        Self {
            entries: RwLock::new(entries),
            ..Self::default()
        }
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.read().clone()
    }

    pub fn attach(&self, observer: Arc<dyn Observer>) {
        self.observers.write().push(observer);
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }

    /// Replace the entries, then notify observers in attachment order
    pub fn publish(&self, entries: Vec<String>) {
        let _serial = self.notify_lock.lock();
        *self.entries.write() = entries;
        self.notify_locked();
    }

    /// Notify observers without changing the entries
    pub fn notify(&self) {
        let _serial = self.notify_lock.lock();
        self.notify_locked();
    }

    fn notify_locked(&self) {
        let observers = self.observers.read().clone();
        for observer in observers {
            observer.update();
        }
    }
}

/// Observer that forwards to a balancer without keeping it alive
pub struct BalancerObserver {
    balancer: Weak<dyn LoadBalancer>,
}

impl BalancerObserver {
    pub fn new(balancer: &Arc<dyn LoadBalancer>) -> Self {
        Self {
            balancer: Arc::downgrade(balancer),
        }
    }
}

impl Observer for BalancerObserver {
    fn update(&self) {
        if let Some(balancer) = self.balancer.upgrade() {
            balancer.update();
        }
    }
}

/// Wire a balancer to a source: attach both directions and load the initial snapshot
pub fn bind(balancer: &Arc<dyn LoadBalancer>, source: Arc<dyn MembershipSource>) {
    balancer.set_conf(source.clone());
    source.attach(Arc::new(BalancerObserver::new(balancer)));
    balancer.update();

    tracing::info!(
        strategy = balancer.strategy_name(),
        source = source.name(),
        backends = ?balancer.all_nodes(),
        "Balancer bound to membership source"
    );
}

/// Build the membership source selected in configuration
pub fn build_source(
    config: &AppConfig,
    registry: Option<RegistryClient>,
) -> Result<Arc<dyn MembershipSource>, MembershipError> {
    let membership = &config.membership;
    match membership.source {
        SourceKind::Static => Ok(Arc::new(StaticListSource::new(membership.servers.clone()))),
        SourceKind::Registry => {
            let client = registry.ok_or(MembershipError::NoRegistry("registry"))?;
            Ok(Arc::new(RegistryWatchSource::new(
                client,
                config.registry.group_path(),
                std::time::Duration::from_millis(config.registry.resubscribe_delay_ms),
            )))
        }
        SourceKind::HealthCheck => {
            if membership.servers.is_empty() {
                return Err(MembershipError::NoCandidates("health_check"));
            }
            Ok(Arc::new(HealthCheckSource::from_config(
                membership.servers.clone(),
                &membership.health_check,
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{build_balancer, BalanceKind, BalancerOptions};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingObserver {
        calls: AtomicUsize,
    }

    impl Observer for CountingObserver {
        fn update(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_subject_publish_notifies_all_observers() {
        let subject = Subject::new(vec!["a:1".to_string()]);
        let first = Arc::new(CountingObserver { calls: AtomicUsize::new(0) });
        let second = Arc::new(CountingObserver { calls: AtomicUsize::new(0) });
        subject.attach(first.clone());
        subject.attach(second.clone());

        subject.publish(vec!["b:2".to_string()]);
        subject.notify();

        assert_eq!(subject.entries(), vec!["b:2"]);
        assert_eq!(subject.observer_count(), 2);
        assert_eq!(first.calls.load(Ordering::SeqCst), 2);
        assert_eq!(second.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_bind_loads_initial_snapshot() {
        let balancer = build_balancer(BalanceKind::RoundRobin, BalancerOptions::default());
        let source = Arc::new(StaticListSource::new(vec![
            "127.0.0.1:2003".to_string(),
            "127.0.0.1:2004".to_string(),
        ]));

        bind(&balancer, source.clone());
        assert_eq!(balancer.all_nodes(), vec!["127.0.0.1:2003", "127.0.0.1:2004"]);

        source.update_conf(vec!["127.0.0.1:2005".to_string()]);
        assert_eq!(balancer.all_nodes(), vec!["127.0.0.1:2005"]);
    }

    #[test]
    fn test_one_source_many_balancers() {
        let source = Arc::new(StaticListSource::new(vec!["a:1,1".to_string()]));
        let rr = build_balancer(BalanceKind::RoundRobin, BalancerOptions::default());
        let ch = build_balancer(BalanceKind::ConsistentHash, BalancerOptions::default());
        bind(&rr, source.clone());
        bind(&ch, source.clone());

        source.update_conf(vec!["b:2,1".to_string(), "c:3,1".to_string()]);
        assert_eq!(rr.all_nodes(), vec!["b:2", "c:3"]);
        assert_eq!(ch.all_nodes(), vec!["b:2", "c:3"]);
    }

    #[test]
    fn test_dropped_balancer_is_not_kept_alive() {
        let source = Arc::new(StaticListSource::new(vec!["a:1".to_string()]));
        let balancer = build_balancer(BalanceKind::Random, BalancerOptions::default());
        bind(&balancer, source.clone());

        let weak = Arc::downgrade(&balancer);
        drop(balancer);
        // The balancer holds the source, not the other way round
        assert!(weak.upgrade().is_none());
        source.update_conf(vec!["b:2".to_string()]);
    }

    #[test]
    fn test_build_source_registry_needs_client() {
        let mut config = crate::config::AppConfig::default();
        config.membership.source = SourceKind::Registry;
        assert!(matches!(
            build_source(&config, None),
            Err(MembershipError::NoRegistry(_))
        ));
    }

    #[test]
    fn test_build_source_health_check_needs_candidates() {
        let mut config = crate::config::AppConfig::default();
        config.membership.source = SourceKind::HealthCheck;
        config.membership.servers.clear();
        assert!(matches!(
            build_source(&config, None),
            Err(MembershipError::NoCandidates(_))
        ));
    }

    #[test]
    fn test_source_kind_serde() {
        let kind: SourceKind = serde_yaml::from_str("health_check").unwrap();
        assert_eq!(kind, SourceKind::HealthCheck);
        assert_eq!(SourceKind::default(), SourceKind::Static);
    }
}
