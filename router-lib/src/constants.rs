use std::time::Duration;

/// TCP backlog size
pub const TCP_BACKLOG: u32 = 1024;

/// Max concurrent connections accepted by a single router listener
pub const MAX_CONCURRENT_CONNECTIONS: usize = 1024;

/// Deadline applied to backend connection establishment and to waiting for the
/// response head. Streaming bodies are not bounded by this value.
pub const ENDPOINT_TIMEOUT: Duration = Duration::from_secs(60);

/// Endpoint-selection attempts on connection-establishment failure before the
/// request is surfaced as a bad gateway
pub const CONNECT_ATTEMPTS: usize = 3;

/// Maximum age of an endpoint's last route advertisement before it is
/// eligible for pruning
pub const ROUTE_STALE_TTL: Duration = Duration::from_secs(120);

/// Interval of the registry's background pruning pass
pub const PRUNE_INTERVAL: Duration = Duration::from_secs(30);

/// Default deadline for draining in-flight requests on shutdown
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Accepted clock skew window around a route service signature timestamp
pub const SIGNATURE_REPLAY_WINDOW: Duration = Duration::from_secs(60);

/// Header names used on requests forwarded by the router
pub mod headers {
  /// Scheme the client used on the outermost hop, first value wins
  pub const FORWARDED_PROTO: &str = "x-forwarded-proto";
  /// Chain of client addresses, appended per hop
  pub const FORWARDED_FOR: &str = "x-forwarded-for";
  /// Sealed signature proving the request passed through the router
  pub const ROUTE_SERVICE_SIGNATURE: &str = "x-router-signature";
  /// Reconstructed URL the route service should forward the request back to
  pub const ROUTE_SERVICE_FORWARDED_URL: &str = "x-router-forwarded-url";
  /// Identifier of the key that sealed the signature
  pub const ROUTE_SERVICE_KEY_ID: &str = "x-router-signature-key";
}

/// Named tracing events
pub mod log_event_names {
  /// One event per completed or failed request
  pub const ACCESS_LOG: &str = "access_log";
}
