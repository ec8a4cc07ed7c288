//! Per-service usage counters fed by the metrics hook.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use specgate_core::ServiceStats;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Default, Clone)]
struct Counters {
    requests: u64,
    errors: u64,
    total_latency: Duration,
    last_request: Option<DateTime<Utc>>,
}

/// Records request counts, error counts, and a rolling average latency per
/// service.
#[derive(Debug, Default)]
pub struct StatsRecorder {
    counters: Mutex<HashMap<String, Counters>>,
}

impl StatsRecorder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, service_name: &str, latency: Duration, is_error: bool) {
        let mut counters = self.counters.lock();
        let entry = counters.entry(service_name.to_string()).or_default();
        entry.requests += 1;
        if is_error {
            entry.errors += 1;
        }
        entry.total_latency += latency;
        entry.last_request = Some(Utc::now());
    }

    #[must_use]
    pub fn service(&self, service_name: &str) -> Option<ServiceStats> {
        let counters = self.counters.lock();
        counters.get(service_name).map(|c| to_stats(service_name, c))
    }

    #[must_use]
    pub fn all(&self) -> Vec<ServiceStats> {
        let counters = self.counters.lock();
        let mut stats: Vec<ServiceStats> =
            counters.iter().map(|(name, c)| to_stats(name, c)).collect();
        stats.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        stats
    }
}

fn to_stats(service_name: &str, counters: &Counters) -> ServiceStats {
    let average_latency_ms = if counters.requests == 0 {
        0.0
    } else {
        counters.total_latency.as_secs_f64() * 1000.0 / counters.requests as f64
    };
    ServiceStats {
        service_name: service_name.to_string(),
        request_count: counters.requests,
        error_count: counters.errors,
        average_latency_ms,
        last_request: counters.last_request,
        spec_fetched_at: None,
        spec_url: String::new(),
        route_count: 0,
    }
}
