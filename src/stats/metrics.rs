//! Atomic request counters and response-time statistics

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Response-time samples kept for the rolling average
const MAX_SAMPLES: usize = 1000;

#[derive(Debug, Default)]
struct ResponseTimes {
    samples: VecDeque<Duration>,
    min: Option<Duration>,
    max: Duration,
}

/// Counters shared by every request handler
#[derive(Debug)]
pub struct GatewayMetrics {
    started: Instant,
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    balancer_errors: AtomicU64,
    fallbacks: AtomicU64,
    selections: Mutex<HashMap<String, u64>>,
    response_times: Mutex<ResponseTimes>,
}

/// Point-in-time copy of [`GatewayMetrics`]
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub balancer_errors: u64,
    pub fallbacks: u64,
    /// Requests routed to each backend
    pub selections: BTreeMap<String, u64>,
    pub avg_response_ms: f64,
    pub min_response_ms: f64,
    pub max_response_ms: f64,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            balancer_errors: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
            selections: Mutex::new(HashMap::new()),
            response_times: Mutex::new(ResponseTimes::default()),
        }
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self, elapsed: Duration) {
        self.successful_requests.fetch_add(1, Ordering::Relaxed);
        self.record_response_time(elapsed);
    }

    pub fn record_failure(&self, elapsed: Duration) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
        self.record_response_time(elapsed);
    }

    pub fn record_balancer_error(&self) {
        self.balancer_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback(&self) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_selection(&self, backend: &str) {
        *self.selections.lock().entry(backend.to_string()).or_insert(0) += 1;
    }

    fn record_response_time(&self, elapsed: Duration) {
        let mut times = self.response_times.lock();
        if times.samples.len() == MAX_SAMPLES {
            times.samples.pop_front();
        }
        times.samples.push_back(elapsed);
        times.min = Some(times.min.map_or(elapsed, |min| min.min(elapsed)));
        times.max = times.max.max(elapsed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let (avg, min, max) = {
            let times = self.response_times.lock();
            let avg = if times.samples.is_empty() {
                Duration::ZERO
            } else {
                times.samples.iter().sum::<Duration>() / times.samples.len() as u32
            };
            (avg, times.min.unwrap_or_default(), times.max)
        };

        MetricsSnapshot {
            timestamp: Utc::now(),
            uptime_seconds: self.started.elapsed().as_secs(),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            balancer_errors: self.balancer_errors.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            selections: self
                .selections
                .lock()
                .iter()
                .map(|(backend, count)| (backend.clone(), *count))
                .collect(),
            avg_response_ms: avg.as_secs_f64() * 1000.0,
            min_response_ms: min.as_secs_f64() * 1000.0,
            max_response_ms: max.as_secs_f64() * 1000.0,
        }
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = GatewayMetrics::new();
        metrics.record_request();
        metrics.record_request();
        metrics.record_success(Duration::from_millis(10));
        metrics.record_failure(Duration::from_millis(30));
        metrics.record_balancer_error();
        metrics.record_fallback();
        metrics.record_selection("a:1");
        metrics.record_selection("a:1");
        metrics.record_selection("b:2");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_requests, 2);
        assert_eq!(snapshot.successful_requests, 1);
        assert_eq!(snapshot.failed_requests, 1);
        assert_eq!(snapshot.balancer_errors, 1);
        assert_eq!(snapshot.fallbacks, 1);
        assert_eq!(snapshot.selections["a:1"], 2);
        assert_eq!(snapshot.selections["b:2"], 1);
        assert!((snapshot.avg_response_ms - 20.0).abs() < 0.001);
        assert!((snapshot.min_response_ms - 10.0).abs() < 0.001);
        assert!((snapshot.max_response_ms - 30.0).abs() < 0.001);
    }

    #[test]
    fn test_empty_snapshot() {
        let snapshot = GatewayMetrics::new().snapshot();
        assert_eq!(snapshot.total_requests, 0);
        assert_eq!(snapshot.avg_response_ms, 0.0);
        assert!(snapshot.selections.is_empty());
    }

    #[test]
    fn test_samples_are_bounded() {
        let metrics = GatewayMetrics::new();
        for _ in 0..MAX_SAMPLES {
            metrics.record_success(Duration::from_millis(100));
        }
        for _ in 0..MAX_SAMPLES {
            metrics.record_success(Duration::from_millis(2));
        }
        let snapshot = metrics.snapshot();
        // Old samples rolled out of the average, min and max are all-time
        assert!((snapshot.avg_response_ms - 2.0).abs() < 0.001);
        assert!((snapshot.max_response_ms - 100.0).abs() < 0.001);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = GatewayMetrics::new();
        metrics.record_selection("http://127.0.0.1:2003/base");
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["selections"]["http://127.0.0.1:2003/base"], 1);
        assert!(json["timestamp"].is_string());
    }
}
