use crate::endpoint::Endpoint;
use std::{sync::Arc, time::Duration};

/// Per-request metrics events emitted by the reverse proxy. Exactly one
/// outcome event is emitted per request, after its outcome is final.
pub trait ProxyReporter: Send + Sync {
  /// Malformed request or routing miss
  fn capture_bad_request(&self);
  /// Backend connect failure, response timeout, or signing failure
  fn capture_bad_gateway(&self);
  /// A request was dispatched to the given endpoint
  fn capture_routing_request(&self, endpoint: &Endpoint);
  /// The backend answered; `duration` spans request start to response head
  /// for plain requests and the full splice for upgraded connections
  fn capture_routing_response(&self, endpoint: &Endpoint, status: u16, duration: Duration);
}

/// Aggregate route table statistics, reported by the registry after each
/// applied update batch and each pruning pass.
pub trait RegistryReporter: Send + Sync {
  fn capture_route_stats(&self, total_routes: usize, ms_since_last_update: u64);
}

/// Reporter that discards every event, for disabled metrics configurations.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullReporter;

impl NullReporter {
  pub fn proxy() -> Arc<dyn ProxyReporter> {
    Arc::new(NullReporter)
  }

  pub fn registry() -> Arc<dyn RegistryReporter> {
    Arc::new(NullReporter)
  }
}

impl ProxyReporter for NullReporter {
  fn capture_bad_request(&self) {}
  fn capture_bad_gateway(&self) {}
  fn capture_routing_request(&self, _endpoint: &Endpoint) {}
  fn capture_routing_response(&self, _endpoint: &Endpoint, _status: u16, _duration: Duration) {}
}

impl RegistryReporter for NullReporter {
  fn capture_route_stats(&self, _total_routes: usize, _ms_since_last_update: u64) {}
}
