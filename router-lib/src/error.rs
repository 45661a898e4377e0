/// Errors that happen while proxying a single request. These stay contained
/// within the request's handling task and map onto a 4xx/5xx response.
#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
  /* --------------------------------------- */
  #[error("IO error: {0}")]
  IoError(#[from] std::io::Error),

  /* --------------------------------------- */
  /// Host resolved in the registry but every connect attempt failed
  #[error("No reachable endpoint for the requested host")]
  NoEndpointAvailable,

  #[error("Timed out connecting to backend")]
  ConnectTimeout,

  #[error("Timed out waiting for the backend response head")]
  ResponseTimeout,

  #[error("Backend HTTP error: {0}")]
  UpstreamHttp(#[from] hyper::Error),

  /* --------------------------------------- */
  #[error("Invalid route service url: {0}")]
  InvalidRouteServiceUrl(String),

  /// A route requires a route service but no signer was configured
  #[error("Route service signing is not configured")]
  RouteServiceUnavailable,

  #[error("Route service signature error: {0}")]
  Signature(#[from] SignatureError),

  /* --------------------------------------- */
  #[error("DNS resolution error: {0}")]
  DnsResolutionError(String),
}

/// Route service signature seal/open failures
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
  #[error("Malformed signature encoding")]
  Encoding,

  #[error("Signature rejected by all configured keys")]
  Rejected,

  #[error("Signature timestamp outside the replay window")]
  Expired,

  #[error("Failed to seal the signature payload")]
  Seal,
}

/// Errors that happen while building router components. These are fatal
/// configuration conditions and must prevent the router from starting.
#[derive(thiserror::Error, Debug)]
pub enum RouterBuildError {
  /// Route service signing key material is missing or unusable
  #[error("Route service key material error: {0}")]
  KeyMaterial(String),

  #[error("Reverse proxy builder error: {0}")]
  ProxyBuilderError(#[from] crate::proxy::ReverseProxyBuilderError),

  #[error("Router builder error: {0}")]
  RouterBuilderError(#[from] crate::router::RouterBuilderError),
}

/// Distinguished result of a drain that hit its deadline with requests still
/// in flight. In-flight work is not forcibly killed; the caller decides.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainError {
  #[error("Drain timed out with requests still in flight")]
  Timeout,
}

/// Errors surfaced by the router orchestrator's run loop
#[derive(thiserror::Error, Debug)]
pub enum RouterError {
  #[error("IO error: {0}")]
  IoError(#[from] std::io::Error),

  #[error(transparent)]
  Drain(#[from] DrainError),

  /// An asynchronous error arrived on the error channel; existing
  /// connections were drained before this was returned
  #[error("Async error after drain: {0}")]
  Async(anyhow::Error),
}
