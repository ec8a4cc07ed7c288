//! Concurrent in-memory catalog of registered OpenAPI specifications.
//!
//! Entries are immutable; replacement swaps the stored `Arc` atomically, so
//! concurrent readers never observe a torn entry. Change events are emitted
//! from inside the write critical section but delivered through a bounded
//! queue with a non-blocking send.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use specgate_core::{SpecEntry, SpecEvent, SpecEventKind};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Event bus capacity. Overflow drops the event with a warning.
pub const EVENT_BUS_CAPACITY: usize = 100;

/// Registry summary returned by [`SpecRegistry::stats`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub total_specs: usize,
    pub expired_specs: usize,
    pub services: Vec<String>,
    pub dropped_events: u64,
}

/// Concurrent catalog keyed by service name.
pub struct SpecRegistry {
    specs: RwLock<HashMap<String, Arc<SpecEntry>>>,
    events_tx: mpsc::Sender<SpecEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<SpecEvent>>>,
    dropped_events: AtomicU64,
}

impl SpecRegistry {
    #[must_use]
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUS_CAPACITY);
        Self {
            specs: RwLock::new(HashMap::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            dropped_events: AtomicU64::new(0),
        }
    }

    /// Insert or replace the entry for its service name. Returns `true` when
    /// an existing entry was replaced; the emitted event kind distinguishes
    /// addition from update.
    pub fn add(&self, entry: SpecEntry) -> bool {
        let entry = Arc::new(entry);
        let snapshot = entry.snapshot();
        let service_name = entry.service_name.clone();

        let mut specs = self.specs.write();
        let previous = specs.insert(service_name.clone(), entry);

        let kind = if previous.is_some() { SpecEventKind::Updated } else { SpecEventKind::Added };
        match &previous {
            Some(old) => tracing::info!(
                service = %service_name,
                url = %snapshot.url,
                previous_fetch = %old.fetched_at,
                "updated spec"
            ),
            None => tracing::info!(service = %service_name, url = %snapshot.url, "added spec"),
        }

        self.emit(SpecEvent::new(kind, service_name).with_snapshot(snapshot));
        previous.is_some()
    }

    /// Look up an entry and its freshness. An entry past its TTL is still
    /// returned, flagged stale; the caller decides whether to refresh.
    #[must_use]
    pub fn get(&self, service_name: &str) -> Option<(Arc<SpecEntry>, bool)> {
        let specs = self.specs.read();
        let entry = specs.get(service_name)?;
        let fresh = !entry.expired();
        if !fresh {
            tracing::debug!(
                service = service_name,
                fetched_at = %entry.fetched_at,
                ttl_secs = entry.ttl.as_secs(),
                "spec expired"
            );
        }
        Some((Arc::clone(entry), fresh))
    }

    /// Remove an entry. Returns whether anything was removed.
    pub fn remove(&self, service_name: &str) -> bool {
        let mut specs = self.specs.write();
        if specs.remove(service_name).is_none() {
            return false;
        }
        tracing::info!(service = service_name, "removed spec");
        self.emit(SpecEvent::new(SpecEventKind::Removed, service_name));
        true
    }

    #[must_use]
    pub fn list(&self) -> Vec<Arc<SpecEntry>> {
        self.specs.read().values().cloned().collect()
    }

    /// Entries whose TTL has elapsed.
    #[must_use]
    pub fn expired(&self) -> Vec<Arc<SpecEntry>> {
        self.specs.read().values().filter(|e| e.expired()).cloned().collect()
    }

    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let specs = self.specs.read();
        let mut services: Vec<String> = specs.keys().cloned().collect();
        services.sort();
        RegistryStats {
            total_specs: specs.len(),
            expired_specs: specs.values().filter(|e| e.expired()).count(),
            services,
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
        }
    }

    /// Take the event stream. There is a single consumer; subsequent calls
    /// return `None`.
    #[must_use]
    pub fn take_events(&self) -> Option<mpsc::Receiver<SpecEvent>> {
        self.events_rx.lock().take()
    }

    /// Publish a `spec.error` event, e.g. for a failed refresh.
    pub fn emit_error(&self, service_name: &str, error: impl Into<String>) {
        self.emit(SpecEvent::new(SpecEventKind::Error, service_name).with_error(error));
    }

    /// Number of events dropped because the bus was full.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    fn emit(&self, event: SpecEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.events_tx.try_send(event) {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                kind = event.kind.as_str(),
                service = %event.service_name,
                "event bus full, dropping event"
            );
        }
    }

    /// Spawn the cleanup janitor. It walks the catalog every `interval` and
    /// deletes entries that have been expired for longer than one extra TTL
    /// period, which protects against flapping refreshes.
    pub fn spawn_janitor(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately; skip it so a fresh janitor
            // never races an add in progress.
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => registry.cleanup_expired(),
                }
            }
        })
    }

    /// Remove entries expired for more than their TTL (the double-TTL rule).
    pub fn cleanup_expired(&self) {
        let mut specs = self.specs.write();
        let doomed: Vec<Arc<SpecEntry>> = specs
            .values()
            .filter(|entry| entry.expired_for().is_some_and(|d| d > entry.ttl))
            .cloned()
            .collect();

        for entry in doomed {
            specs.remove(&entry.service_name);
            tracing::info!(
                service = %entry.service_name,
                expired_for_secs = entry.expired_for().unwrap_or_default().as_secs(),
                "cleaned up expired spec"
            );
            self.emit(SpecEvent::new(SpecEventKind::Removed, entry.service_name.clone()));
        }
    }
}

impl Default for SpecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, Utc};
    use specgate_core::SpecSource;

    fn entry(service: &str, ttl: Duration, age: Duration) -> SpecEntry {
        let spec: openapiv3::OpenAPI = serde_yaml::from_str(
            "openapi: 3.0.0\ninfo:\n  title: t\n  version: 1.0.0\npaths: {}\n",
        )
        .unwrap();
        SpecEntry {
            id: format!("{service}:http://example.com/openapi.json"),
            service_name: service.to_string(),
            source: SpecSource::parse("http://example.com/openapi.json"),
            spec: Arc::new(spec),
            fetched_at: Utc::now() - TimeDelta::from_std(age).unwrap(),
            ttl,
            headers: HashMap::new(),
            auth_policy: None,
        }
    }

    #[tokio::test]
    async fn add_get_remove_round_trip() {
        let registry = SpecRegistry::new();
        assert!(!registry.add(entry("users", Duration::from_secs(60), Duration::ZERO)));

        let (found, fresh) = registry.get("users").unwrap();
        assert_eq!(found.service_name, "users");
        assert!(fresh);

        assert!(registry.remove("users"));
        assert!(registry.get("users").is_none());
        assert!(!registry.remove("users"));
    }

    #[tokio::test]
    async fn replace_emits_updated_event() {
        let registry = SpecRegistry::new();
        let mut events = registry.take_events().unwrap();

        registry.add(entry("users", Duration::from_secs(60), Duration::ZERO));
        assert!(registry.add(entry("users", Duration::from_secs(60), Duration::ZERO)));

        assert_eq!(events.recv().await.unwrap().kind, SpecEventKind::Added);
        let updated = events.recv().await.unwrap();
        assert_eq!(updated.kind, SpecEventKind::Updated);
        assert!(updated.spec.is_some());
    }

    #[tokio::test]
    async fn stale_entries_are_returned_but_flagged() {
        let registry = SpecRegistry::new();
        registry.add(entry("users", Duration::from_secs(60), Duration::from_secs(120)));

        let (found, fresh) = registry.get("users").unwrap();
        assert_eq!(found.service_name, "users");
        assert!(!fresh);
        assert_eq!(registry.expired().len(), 1);
    }

    #[tokio::test]
    async fn event_bus_overflow_drops_without_blocking() {
        let registry = SpecRegistry::new();
        // Nothing drains the receiver, so the bus fills after capacity sends.
        let _events = registry.take_events();

        for i in 0..EVENT_BUS_CAPACITY + 5 {
            registry.add(entry(&format!("svc{i}"), Duration::from_secs(60), Duration::ZERO));
        }

        assert_eq!(registry.dropped_events(), 5);
        assert_eq!(registry.stats().total_specs, EVENT_BUS_CAPACITY + 5);
    }

    #[tokio::test]
    async fn janitor_respects_double_ttl() {
        let registry = SpecRegistry::new();
        let ttl = Duration::from_secs(60);
        // Expired, but not for a full extra TTL: must survive.
        registry.add(entry("recent", ttl, Duration::from_secs(100)));
        // Expired for more than one extra TTL: must be removed.
        registry.add(entry("ancient", ttl, Duration::from_secs(200)));
        // Zero TTL never expires.
        registry.add(entry("pinned", Duration::ZERO, Duration::from_secs(500)));

        registry.cleanup_expired();

        assert!(registry.get("recent").is_some());
        assert!(registry.get("ancient").is_none());
        assert!(registry.get("pinned").is_some());
    }

    #[tokio::test]
    async fn janitor_task_is_cancellable() {
        let registry = Arc::new(SpecRegistry::new());
        let cancel = CancellationToken::new();
        let handle = registry.spawn_janitor(Duration::from_millis(10), cancel.clone());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
