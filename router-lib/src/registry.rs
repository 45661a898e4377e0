use crate::{endpoint::Endpoint, metrics::RegistryReporter, time_util::epoch_millis, trace::*};
use std::{
  sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
  },
  time::{Duration, Instant},
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// DashMap type alias, uses ahash::RandomState as hashbuilder
type DashMap<K, V> = dashmap::DashMap<K, V, ahash::RandomState>;

/* ---------------------------------------------------------- */
/// Action carried by a route advertisement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteAction {
  Register,
  Unregister,
}

/// One message from the route-update source. The transport is abstract; the
/// registry only requires per-host arrival order to be preserved.
#[derive(Debug, Clone)]
pub struct RouteUpdate {
  pub host: String,
  pub endpoint: Endpoint,
  pub action: RouteAction,
}

/* ---------------------------------------------------------- */
#[derive(Debug)]
struct TrackedEndpoint {
  endpoint: Endpoint,
  updated_at: Instant,
}

/// Endpoints currently advertised for one host, plus the round-robin cursor
/// used by endpoint selection.
#[derive(Debug, Default)]
struct RouteEntry {
  endpoints: Vec<TrackedEndpoint>,
  cursor: AtomicUsize,
}

/* ---------------------------------------------------------- */
/// Live mapping from external hostnames to backend endpoint sets. All
/// mutation goes through `register`/`unregister`/`prune_stale`; per-host
/// exclusivity is provided by the map's entry locking, so a registration
/// racing a pruning pass is never lost. Lookups see an atomic per-host
/// snapshot.
pub struct RouteRegistry {
  table: DashMap<String, RouteEntry>,
  reporter: Arc<dyn RegistryReporter>,
  stale_ttl: Duration,
  prune_interval: Duration,
  /// Epoch millis of the most recently applied mutation, 0 before the first
  last_update_ms: AtomicU64,
}

impl std::fmt::Debug for RouteRegistry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RouteRegistry")
      .field("routes", &self.table.len())
      .field("stale_ttl", &self.stale_ttl)
      .field("prune_interval", &self.prune_interval)
      .finish()
  }
}

fn normalize_host(host: &str) -> String {
  host.trim().to_ascii_lowercase()
}

impl RouteRegistry {
  pub fn new(reporter: Arc<dyn RegistryReporter>) -> Self {
    Self::with_timing(
      crate::constants::ROUTE_STALE_TTL,
      crate::constants::PRUNE_INTERVAL,
      reporter,
    )
  }

  pub fn with_timing(stale_ttl: Duration, prune_interval: Duration, reporter: Arc<dyn RegistryReporter>) -> Self {
    Self {
      table: DashMap::default(),
      reporter,
      stale_ttl,
      prune_interval,
      last_update_ms: AtomicU64::new(0),
    }
  }

  /// Idempotent upsert. A duplicate address refreshes metadata and
  /// staleness, never endpoint identity.
  pub fn register(&self, host: &str, endpoint: Endpoint) {
    let key = normalize_host(host);
    let mut entry = self.table.entry(key).or_default();
    let now = Instant::now();
    match entry.endpoints.iter_mut().find(|t| t.endpoint.address() == endpoint.address()) {
      Some(tracked) => {
        tracked.endpoint = endpoint;
        tracked.updated_at = now;
      }
      None => entry.endpoints.push(TrackedEndpoint {
        endpoint,
        updated_at: now,
      }),
    }
    drop(entry);
    self.touch();
  }

  /// Removes the endpoint with the same address from the host's entry; a
  /// no-op when absent. An entry left empty disappears entirely.
  pub fn unregister(&self, host: &str, endpoint: &Endpoint) {
    let key = normalize_host(host);
    if let Some(mut entry) = self.table.get_mut(&key) {
      entry.endpoints.retain(|t| t.endpoint.address() != endpoint.address());
      let emptied = entry.endpoints.is_empty();
      drop(entry);
      if emptied {
        self.table.remove_if(&key, |_, e| e.endpoints.is_empty());
      }
    }
    self.touch();
  }

  /// Consistent snapshot of the host's endpoint set, or `None` for an
  /// unknown host.
  pub fn lookup(&self, host: &str) -> Option<Vec<Endpoint>> {
    self
      .table
      .get(&normalize_host(host))
      .map(|entry| entry.endpoints.iter().map(|t| t.endpoint.clone()).collect())
  }

  /// Round-robin endpoint selection with a per-host cursor. Deterministic
  /// for a fixed endpoint set; a single-endpoint host always returns that
  /// endpoint.
  pub fn next_endpoint(&self, host: &str) -> Option<Endpoint> {
    let entry = self.table.get(&normalize_host(host))?;
    if entry.endpoints.is_empty() {
      return None;
    }
    let idx = entry.cursor.fetch_add(1, Ordering::Relaxed) % entry.endpoints.len();
    Some(entry.endpoints[idx].endpoint.clone())
  }

  /// Removes endpoints whose last advertisement is older than `ttl` as of
  /// `now`, then hosts left with no endpoints.
  pub fn prune_stale(&self, now: Instant, ttl: Duration) {
    self.table.retain(|host, entry| {
      entry
        .endpoints
        .retain(|t| now.saturating_duration_since(t.updated_at) <= ttl);
      if entry.endpoints.is_empty() {
        debug!("Pruned all endpoints for {host}");
        false
      } else {
        true
      }
    });
  }

  pub fn route_count(&self) -> usize {
    self.table.len()
  }

  pub fn ms_since_last_update(&self) -> u64 {
    let last = self.last_update_ms.load(Ordering::Relaxed);
    if last == 0 {
      return 0;
    }
    epoch_millis().saturating_sub(last)
  }

  fn touch(&self) {
    self.last_update_ms.store(epoch_millis(), Ordering::Relaxed);
  }

  /// Report aggregate route stats to the metrics collaborator. A side
  /// effect, not part of registry correctness.
  pub fn report_stats(&self) {
    self
      .reporter
      .capture_route_stats(self.route_count(), self.ms_since_last_update());
  }

  pub fn apply(&self, update: RouteUpdate) {
    match update.action {
      RouteAction::Register => self.register(&update.host, update.endpoint),
      RouteAction::Unregister => self.unregister(&update.host, &update.endpoint),
    }
  }

  /// Consume route advertisements and tick the pruning timer until
  /// cancelled. Updates are applied in delivery order, which preserves the
  /// per-host register/unregister ordering contract.
  pub async fn start(&self, mut updates: mpsc::Receiver<RouteUpdate>, cancel_token: CancellationToken) {
    let mut prune_tick = tokio::time::interval(self.prune_interval);
    prune_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut updates_closed = false;
    loop {
      tokio::select! {
        maybe_update = updates.recv(), if !updates_closed => {
          match maybe_update {
            Some(update) => {
              debug!("Applying route update for {}", update.host);
              self.apply(update);
              self.report_stats();
            }
            None => {
              warn!("Route update source closed");
              updates_closed = true;
            }
          }
        }
        _ = prune_tick.tick() => {
          self.prune_stale(Instant::now(), self.stale_ttl);
          self.report_stats();
        }
        _ = cancel_token.cancelled() => {
          debug!("Route registry task cancelled");
          break;
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::metrics::NullReporter;
  use std::net::SocketAddr;
  use std::sync::Mutex;

  fn registry() -> RouteRegistry {
    RouteRegistry::new(NullReporter::registry())
  }

  fn ep(addr: &str) -> Endpoint {
    Endpoint::from(addr.parse::<SocketAddr>().unwrap())
  }

  #[test]
  fn test_register_then_lookup() {
    let r = registry();
    assert!(r.lookup("app.example.com").is_none());

    r.register("app.example.com", ep("10.0.0.1:8080"));
    let endpoints = r.lookup("app.example.com").unwrap();
    assert_eq!(endpoints.len(), 1);
    assert_eq!(endpoints[0].address(), "10.0.0.1:8080".parse::<SocketAddr>().unwrap());
  }

  #[test]
  fn test_lookup_is_case_insensitive() {
    let r = registry();
    r.register("App.Example.COM", ep("10.0.0.1:8080"));
    assert!(r.lookup("app.example.com").is_some());
  }

  #[test]
  fn test_register_is_idempotent() {
    let r = registry();
    r.register("app.example.com", ep("10.0.0.1:8080"));
    r.register("app.example.com", ep("10.0.0.1:8080"));
    assert_eq!(r.lookup("app.example.com").unwrap().len(), 1);
  }

  #[test]
  fn test_reregistration_refreshes_metadata() {
    let r = registry();
    let addr: SocketAddr = "10.0.0.1:8080".parse().unwrap();
    r.register(
      "app.example.com",
      crate::endpoint::EndpointBuilder::default()
        .address(addr)
        .app_id("old")
        .build()
        .unwrap(),
    );
    r.register(
      "app.example.com",
      crate::endpoint::EndpointBuilder::default()
        .address(addr)
        .app_id("new")
        .build()
        .unwrap(),
    );

    let endpoints = r.lookup("app.example.com").unwrap();
    assert_eq!(endpoints.len(), 1);
    assert_eq!(endpoints[0].app_id(), Some("new"));
  }

  #[test]
  fn test_unregister_removes_endpoint_and_empty_host() {
    let r = registry();
    r.register("app.example.com", ep("10.0.0.1:8080"));
    r.register("app.example.com", ep("10.0.0.2:8080"));

    r.unregister("app.example.com", &ep("10.0.0.1:8080"));
    assert_eq!(r.lookup("app.example.com").unwrap().len(), 1);

    r.unregister("app.example.com", &ep("10.0.0.2:8080"));
    assert!(r.lookup("app.example.com").is_none());
    assert_eq!(r.route_count(), 0);
  }

  #[test]
  fn test_unregister_unknown_is_noop() {
    let r = registry();
    r.register("app.example.com", ep("10.0.0.1:8080"));
    r.unregister("app.example.com", &ep("10.9.9.9:8080"));
    r.unregister("other.example.com", &ep("10.0.0.1:8080"));
    assert_eq!(r.lookup("app.example.com").unwrap().len(), 1);
  }

  #[test]
  fn test_replay_sequence_last_write_wins() {
    let r = registry();
    let updates = [
      (RouteAction::Register, "10.0.0.1:8080"),
      (RouteAction::Register, "10.0.0.2:8080"),
      (RouteAction::Unregister, "10.0.0.1:8080"),
      (RouteAction::Register, "10.0.0.3:8080"),
      (RouteAction::Register, "10.0.0.1:8080"),
      (RouteAction::Unregister, "10.0.0.3:8080"),
    ];
    for (action, addr) in updates {
      r.apply(RouteUpdate {
        host: "app.example.com".to_string(),
        endpoint: ep(addr),
        action,
      });
    }

    let mut addrs: Vec<String> = r
      .lookup("app.example.com")
      .unwrap()
      .iter()
      .map(|e| e.address().to_string())
      .collect();
    addrs.sort();
    assert_eq!(addrs, ["10.0.0.1:8080", "10.0.0.2:8080"]);
  }

  #[test]
  fn test_round_robin_selection_cycles_deterministically() {
    let r = registry();
    for addr in ["10.0.0.1:8080", "10.0.0.2:8080", "10.0.0.3:8080"] {
      r.register("app.example.com", ep(addr));
    }

    let picks: Vec<String> = (0..6)
      .map(|_| r.next_endpoint("app.example.com").unwrap().address().to_string())
      .collect();
    assert_eq!(
      picks,
      [
        "10.0.0.1:8080",
        "10.0.0.2:8080",
        "10.0.0.3:8080",
        "10.0.0.1:8080",
        "10.0.0.2:8080",
        "10.0.0.3:8080",
      ]
    );
  }

  #[test]
  fn test_single_endpoint_host_always_selected() {
    let r = registry();
    r.register("app.example.com", ep("10.0.0.1:8080"));
    for _ in 0..5 {
      assert_eq!(
        r.next_endpoint("app.example.com").unwrap().address().to_string(),
        "10.0.0.1:8080"
      );
    }
    assert!(r.next_endpoint("unknown.example.com").is_none());
  }

  #[test]
  fn test_prune_removes_exactly_the_stale_endpoints() {
    let r = registry();
    r.register("app.example.com", ep("10.0.0.1:8080"));
    std::thread::sleep(Duration::from_millis(60));
    r.register("app.example.com", ep("10.0.0.2:8080"));

    r.prune_stale(Instant::now(), Duration::from_millis(30));

    let endpoints = r.lookup("app.example.com").unwrap();
    assert_eq!(endpoints.len(), 1);
    assert_eq!(endpoints[0].address().to_string(), "10.0.0.2:8080");
  }

  #[test]
  fn test_prune_drops_emptied_hosts() {
    let r = registry();
    r.register("app.example.com", ep("10.0.0.1:8080"));
    std::thread::sleep(Duration::from_millis(40));

    r.prune_stale(Instant::now(), Duration::from_millis(10));
    assert!(r.lookup("app.example.com").is_none());
    assert_eq!(r.route_count(), 0);
  }

  #[test]
  fn test_prune_keeps_fresh_endpoints() {
    let r = registry();
    r.register("app.example.com", ep("10.0.0.1:8080"));
    r.prune_stale(Instant::now(), Duration::from_secs(60));
    assert!(r.lookup("app.example.com").is_some());
  }

  #[derive(Default)]
  struct RecordingRegistryReporter {
    stats: Mutex<Vec<(usize, u64)>>,
  }

  impl RegistryReporter for RecordingRegistryReporter {
    fn capture_route_stats(&self, total_routes: usize, ms_since_last_update: u64) {
      self.stats.lock().unwrap().push((total_routes, ms_since_last_update));
    }
  }

  #[test]
  fn test_report_stats_counts_routes() {
    let reporter = Arc::new(RecordingRegistryReporter::default());
    let r = RouteRegistry::new(reporter.clone());
    r.register("a.example.com", ep("10.0.0.1:8080"));
    r.register("b.example.com", ep("10.0.0.2:8080"));

    r.report_stats();

    let stats = reporter.stats.lock().unwrap();
    assert_eq!(stats.last().unwrap().0, 2);
  }

  #[tokio::test]
  async fn test_start_applies_updates_and_prunes() {
    let r = Arc::new(RouteRegistry::with_timing(
      Duration::from_millis(60),
      Duration::from_millis(20),
      NullReporter::registry(),
    ));
    let (tx, rx) = mpsc::channel(8);
    let cancel = CancellationToken::new();
    let task = tokio::spawn({
      let r = r.clone();
      let cancel = cancel.clone();
      async move { r.start(rx, cancel).await }
    });

    tx.send(RouteUpdate {
      host: "app.example.com".to_string(),
      endpoint: ep("10.0.0.1:8080"),
      action: RouteAction::Register,
    })
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(r.lookup("app.example.com").is_some());

    // No refresh: the background pruning pass retires the endpoint.
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(r.lookup("app.example.com").is_none());

    cancel.cancel();
    task.await.unwrap();
  }
}
