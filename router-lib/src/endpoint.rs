use std::{collections::HashMap, net::SocketAddr};

/* ---------------------------------------------------------- */
/// One backend instance behind a route. Identity within a route entry is the
/// socket address; everything else is metadata refreshed on re-registration.
/// Requests hold clones, never references into the live route table.
#[derive(Debug, Clone, PartialEq, Eq, derive_builder::Builder)]
pub struct Endpoint {
  /// Backend socket address
  address: SocketAddr,

  /// Application identity advertised with the route
  #[builder(setter(into, strip_option), default)]
  app_id: Option<String>,

  /// Free-form tags carried along in access logs and metrics
  #[builder(default)]
  tags: HashMap<String, String>,

  /// Whether the backend expects a TLS connection
  #[builder(default)]
  tls_required: bool,

  /// When set, requests for this endpoint detour through the route service
  /// at this URL, carrying a signed provenance header
  #[builder(setter(into, strip_option), default)]
  route_service_url: Option<String>,
}

impl From<SocketAddr> for Endpoint {
  fn from(address: SocketAddr) -> Self {
    Self {
      address,
      app_id: None,
      tags: HashMap::new(),
      tls_required: false,
      route_service_url: None,
    }
  }
}

impl Endpoint {
  pub fn address(&self) -> SocketAddr {
    self.address
  }

  pub fn app_id(&self) -> Option<&str> {
    self.app_id.as_deref()
  }

  pub fn tags(&self) -> &HashMap<String, String> {
    &self.tags
  }

  pub fn tls_required(&self) -> bool {
    self.tls_required
  }

  pub fn route_service_url(&self) -> Option<&str> {
    self.route_service_url.as_deref()
  }
}

impl std::fmt::Display for Endpoint {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match &self.app_id {
      Some(app_id) => write!(f, "{} ({})", self.address, app_id),
      None => write!(f, "{}", self.address),
    }
  }
}
