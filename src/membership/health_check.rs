//! Health-check poll source
//!
//! Checks every candidate each interval. A candidate leaves the published list after
//! `failure_threshold` consecutive failed checks and comes back on its first success.
//! Observers hear about the first check round and after that only about changes.

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

use super::{MembershipError, MembershipSource, Observer, Subject};
use crate::backends::split_entry;
use crate::config::{HealthCheckConfig, HealthCheckMode};

/// Shortest accepted check interval
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Liveness check for one backend address
#[async_trait]
pub trait HealthChecker: Send + Sync {
    async fn check(&self, addr: &str) -> bool;
}

/// `host:port` to dial for an address that may carry a scheme
fn socket_target(addr: &str) -> String {
    if addr.contains("://") {
        if let Ok(url) = url::Url::parse(addr) {
            if let (Some(host), Some(port)) = (url.host_str(), url.port_or_known_default()) {
                return format!("{}:{}", host, port);
            }
        }
    }
    addr.to_string()
}

/// Healthy when a TCP connection can be opened within the timeout
pub struct TcpHealthChecker {
    timeout: Duration,
}

impl TcpHealthChecker {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl HealthChecker for TcpHealthChecker {
    async fn check(&self, addr: &str) -> bool {
        let target = socket_target(addr);
        match tokio::time::timeout(self.timeout, TcpStream::connect(&target)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                tracing::debug!(backend = %target, error = %e, "TCP check failed");
                false
            }
            Err(_) => {
                tracing::debug!(backend = %target, "TCP check timed out");
                false
            }
        }
    }
}

/// Healthy when `GET <addr><path>` answers 2xx
pub struct HttpHealthChecker {
    client: reqwest::Client,
    path: String,
}

impl HttpHealthChecker {
    pub fn new(path: String, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Falling back to default health-check HTTP client");
                reqwest::Client::new()
            });
        Self { client, path }
    }

    fn url_for(&self, addr: &str) -> String {
        let base = if addr.contains("://") {
            addr.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", addr.trim_end_matches('/'))
        };
        format!("{}{}", base, self.path)
    }
}

#[async_trait]
impl HealthChecker for HttpHealthChecker {
    async fn check(&self, addr: &str) -> bool {
        let url = self.url_for(addr);
        match self.client.get(&url).send().await {
            Ok(response) => {
                let healthy = response.status().is_success();
                if !healthy {
                    tracing::debug!(endpoint = %url, status = %response.status(), "Health check failed");
                }
                healthy
            }
            Err(e) => {
                tracing::debug!(endpoint = %url, error = %e, "Health check error");
                false
            }
        }
    }
}

pub struct HealthCheckSource {
    candidates: RwLock<Vec<String>>,
    checker: Arc<dyn HealthChecker>,
    interval: Duration,
    failure_threshold: u32,
    /// Consecutive failures per candidate entry
    failures: Mutex<HashMap<String, u32>>,
    published: AtomicBool,
    subject: Subject,
}

impl HealthCheckSource {
    pub fn new(
        candidates: Vec<String>,
        checker: Arc<dyn HealthChecker>,
        interval: Duration,
        failure_threshold: u32,
    ) -> Self {
        Self {
            subject: Subject::new(candidates.clone()),
            candidates: RwLock::new(candidates),
            checker,
            // tokio intervals panic on a zero period
            interval: interval.max(MIN_INTERVAL),
            failure_threshold: failure_threshold.max(1),
            failures: Mutex::new(HashMap::new()),
            published: AtomicBool::new(false),
        }
    }

    pub fn from_config(candidates: Vec<String>, config: &HealthCheckConfig) -> Self {
        let timeout = Duration::from_secs(config.timeout_seconds);
        let checker: Arc<dyn HealthChecker> = match config.mode {
            HealthCheckMode::Tcp => Arc::new(TcpHealthChecker::new(timeout)),
            HealthCheckMode::Http => Arc::new(HttpHealthChecker::new(config.path.clone(), timeout)),
        };
        Self::new(
            candidates,
            checker,
            Duration::from_secs(config.interval_seconds),
            config.failure_threshold,
        )
    }

    /// Check every candidate once and return the entries still considered alive
    pub async fn check_once(&self) -> Vec<String> {
        let candidates = self.candidates.read().clone();
        let checks = candidates.iter().map(|entry| async move {
            let healthy = match split_entry(entry).first() {
                Some(addr) => self.checker.check(addr).await,
                None => false,
            };
            (entry.clone(), healthy)
        });
        let results = join_all(checks).await;

        let mut failures = self.failures.lock();
        results
            .into_iter()
            .filter_map(|(entry, healthy)| {
                let count = failures.entry(entry.clone()).or_insert(0);
                if healthy {
                    if *count >= self.failure_threshold {
                        tracing::info!(backend = %entry, "Backend recovered");
                    }
                    *count = 0;
                } else {
                    *count += 1;
                    if *count == self.failure_threshold {
                        tracing::warn!(backend = %entry, failures = *count, "Backend marked down");
                    }
                }
                (*count < self.failure_threshold).then_some(entry)
            })
            .collect()
    }

    /// Run one check round, publishing when the alive set changed. Returns whether
    /// observers were notified.
    pub async fn check_round(&self) -> bool {
        let alive = self.check_once().await;
        let first = !self.published.swap(true, Ordering::SeqCst);
        if first || alive != self.subject.entries() {
            tracing::debug!(alive = ?alive, "Health-checked membership published");
            self.subject.publish(alive);
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl MembershipSource for HealthCheckSource {
    fn get_conf(&self) -> Vec<String> {
        self.subject.entries()
    }

    fn attach(&self, observer: Arc<dyn Observer>) {
        self.subject.attach(observer);
    }

    async fn watch_conf(&self) -> Result<(), MembershipError> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.check_round().await;
        }
    }

    /// Replace the candidate list; new candidates start out alive
    fn update_conf(&self, conf: Vec<String>) {
        *self.candidates.write() = conf.clone();
        self.failures.lock().retain(|entry, _| conf.contains(entry));
        self.subject.publish(conf);
    }

    fn name(&self) -> &'static str {
        "health_check"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct FakeChecker {
        down: Mutex<HashSet<String>>,
    }

    impl FakeChecker {
        fn set_down(&self, addr: &str, down: bool) {
            let mut set = self.down.lock();
            if down {
                set.insert(addr.to_string());
            } else {
                set.remove(addr);
            }
        }
    }

    #[async_trait]
    impl HealthChecker for FakeChecker {
        async fn check(&self, addr: &str) -> bool {
            !self.down.lock().contains(addr)
        }
    }

    struct CountingObserver(AtomicUsize);

    impl Observer for CountingObserver {
        fn update(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn source(checker: Arc<FakeChecker>, threshold: u32) -> HealthCheckSource {
        HealthCheckSource::new(
            vec!["a:1,4".to_string(), "b:2,1".to_string()],
            checker,
            Duration::from_millis(10),
            threshold,
        )
    }

    #[tokio::test]
    async fn test_removed_after_threshold_and_readmitted() {
        let checker = Arc::new(FakeChecker::default());
        let source = source(checker.clone(), 2);
        let observer = Arc::new(CountingObserver(AtomicUsize::new(0)));
        source.attach(observer.clone());

        assert!(source.check_round().await);
        assert_eq!(observer.0.load(Ordering::SeqCst), 1);

        checker.set_down("b:2", true);
        // One failure is tolerated
        assert!(!source.check_round().await);
        assert_eq!(source.get_conf(), vec!["a:1,4", "b:2,1"]);

        assert!(source.check_round().await);
        assert_eq!(source.get_conf(), vec!["a:1,4"]);
        assert!(!source.check_round().await);

        checker.set_down("b:2", false);
        assert!(source.check_round().await);
        assert_eq!(source.get_conf(), vec!["a:1,4", "b:2,1"]);
        assert_eq!(observer.0.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_watch_conf_polls() {
        let checker = Arc::new(FakeChecker::default());
        checker.set_down("a:1", true);
        let source = Arc::new(source(checker, 1));

        let poller = tokio::spawn({
            let source = source.clone();
            async move { source.watch_conf().await }
        });
        tokio::time::timeout(Duration::from_secs(2), async {
            while source.get_conf() != vec!["b:2,1"] {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        poller.abort();
    }

    #[tokio::test]
    async fn test_zero_interval_still_polls() {
        let checker = Arc::new(FakeChecker::default());
        checker.set_down("b:2", true);
        let source = Arc::new(HealthCheckSource::new(
            vec!["a:1,4".to_string(), "b:2,1".to_string()],
            checker,
            Duration::ZERO,
            0,
        ));

        let poller = tokio::spawn({
            let source = source.clone();
            async move { source.watch_conf().await }
        });
        tokio::time::timeout(Duration::from_secs(2), async {
            while source.get_conf() != vec!["a:1,4"] {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(!poller.is_finished());
        poller.abort();
    }

    #[tokio::test]
    async fn test_update_conf_replaces_candidates() {
        let checker = Arc::new(FakeChecker::default());
        let source = source(checker, 1);
        source.update_conf(vec!["c:3".to_string()]);
        assert_eq!(source.get_conf(), vec!["c:3"]);
        assert_eq!(source.check_once().await, vec!["c:3"]);
    }

    #[tokio::test]
    async fn test_tcp_checker() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().to_string();

        let closed = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };

        let checker = TcpHealthChecker::new(Duration::from_millis(500));
        assert!(checker.check(&open).await);
        assert!(checker.check(&format!("http://{}", open)).await);
        assert!(!checker.check(&closed).await);
    }

    #[tokio::test]
    async fn test_http_checker() {
        use axum::{http::StatusCode, routing::get, Router};

        let app = Router::new()
            .route("/health", get(|| async { "OK" }))
            .route("/sick", get(|| async { StatusCode::SERVICE_UNAVAILABLE }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let healthy = HttpHealthChecker::new("/health".to_string(), Duration::from_secs(1));
        let sick = HttpHealthChecker::new("/sick".to_string(), Duration::from_secs(1));
        assert!(healthy.check(&addr).await);
        assert!(!sick.check(&addr).await);
    }

    #[test]
    fn test_check_targets() {
        assert_eq!(socket_target("10.0.0.1:8080"), "10.0.0.1:8080");
        assert_eq!(socket_target("http://backend.local"), "backend.local:80");
        assert_eq!(socket_target("https://backend.local:9443/v1"), "backend.local:9443");

        let checker = HttpHealthChecker::new("/health".to_string(), Duration::from_secs(1));
        assert_eq!(checker.url_for("10.0.0.1:8080"), "http://10.0.0.1:8080/health");
        assert_eq!(checker.url_for("https://api.local/"), "https://api.local/health");
    }
}
