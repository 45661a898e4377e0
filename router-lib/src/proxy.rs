use crate::{
  access_log::{AccessLogRecord, AccessLogger, NullAccessLogger},
  constants::headers as hdr,
  drain::DrainCoordinator,
  endpoint::Endpoint,
  error::ProxyError,
  metrics::{NullReporter, ProxyReporter},
  registry::RouteRegistry,
  route_service::{RouteServiceSigner, SignedHeader},
  time_util::epoch_secs,
  trace::*,
};
use bytes::Bytes;
use http_body_util::{BodyExt, Full, combinators::UnsyncBoxBody};
use hyper::{
  Method, Request, Response, StatusCode, Uri,
  body::Incoming,
  header::{self, HeaderMap, HeaderName, HeaderValue},
};
use hyper_util::rt::TokioIo;
use std::{
  net::SocketAddr,
  sync::Arc,
  time::{Duration, Instant, SystemTime},
};
use tokio::{net::TcpStream, time::timeout};

/* ---------------------------------------------------------- */
/// Unified response body: synthesized error pages and streamed backend
/// bodies behind one type.
pub type ProxyBody = UnsyncBoxBody<Bytes, std::io::Error>;

fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
  Full::new(bytes.into()).map_err(|never| match never {}).boxed_unsync()
}

fn incoming_body(body: Incoming) -> ProxyBody {
  body.map_err(std::io::Error::other).boxed_unsync()
}

fn status_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
  Response::builder()
    .status(status)
    .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
    .body(full_body(format!("{message}\n")))
    .unwrap()
}

/* ---------------------------------------------------------- */
fn request_authority<B>(req: &Request<B>) -> Option<String> {
  if let Some(authority) = req.uri().authority() {
    return Some(authority.to_string());
  }
  req
    .headers()
    .get(header::HOST)
    .and_then(|v| v.to_str().ok())
    .map(|s| s.trim().to_string())
    .filter(|s| !s.is_empty())
}

/// Strip an explicit port from an authority. IPv6 literals keep their
/// brackets so they stay parseable.
fn host_without_port(authority: &str) -> &str {
  if let Some(end) = authority.rfind(']') {
    return &authority[..=end];
  }
  match authority.rsplit_once(':') {
    Some((host, port)) if !host.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => host,
    _ => authority,
  }
}

fn is_upgrade_request(headers_map: &HeaderMap) -> bool {
  let connection_upgrade = headers_map
    .get(header::CONNECTION)
    .and_then(|v| v.to_str().ok())
    .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade")))
    .unwrap_or(false);
  connection_upgrade && headers_map.contains_key(header::UPGRADE)
}

/// Append this hop to X-Forwarded-For and default X-Forwarded-Proto for the
/// backend's benefit.
fn append_forwarded_headers(headers_map: &mut HeaderMap, client_addr: SocketAddr) {
  let client_ip = client_addr.ip().to_string();
  let forwarded_for = HeaderName::from_static(hdr::FORWARDED_FOR);
  let value = match headers_map.get(&forwarded_for).and_then(|v| v.to_str().ok()) {
    Some(existing) => format!("{existing}, {client_ip}"),
    None => client_ip,
  };
  if let Ok(value) = HeaderValue::from_str(&value) {
    headers_map.insert(forwarded_for, value);
  }
  let forwarded_proto = HeaderName::from_static(hdr::FORWARDED_PROTO);
  if !headers_map.contains_key(&forwarded_proto) {
    headers_map.insert(forwarded_proto, HeaderValue::from_static("http"));
  }
}

/* ---------------------------------------------------------- */
/// Dial coordinates of a route service URL.
#[derive(Debug, Clone)]
struct RouteServiceTarget {
  authority: String,
  dial: String,
  path_and_query: String,
}

impl RouteServiceTarget {
  fn parse(url: &str) -> Result<Self, ProxyError> {
    let (scheme, rest) = url
      .split_once("://")
      .ok_or_else(|| ProxyError::InvalidRouteServiceUrl(url.to_string()))?;
    let (authority, path_and_query) = match rest.find('/') {
      Some(i) => (&rest[..i], &rest[i..]),
      None => (rest, "/"),
    };
    if authority.is_empty() {
      return Err(ProxyError::InvalidRouteServiceUrl(url.to_string()));
    }
    let default_port = if scheme.eq_ignore_ascii_case("https") { 443 } else { 80 };
    let dial = if host_without_port(authority).len() == authority.len() {
      format!("{authority}:{default_port}")
    } else {
      authority.to_string()
    };
    Ok(Self {
      authority: authority.to_string(),
      dial,
      path_and_query: path_and_query.to_string(),
    })
  }

  async fn resolve(&self) -> Result<SocketAddr, ProxyError> {
    tokio::net::lookup_host(self.dial.as_str())
      .await
      .map_err(|e| ProxyError::DnsResolutionError(format!("{}: {e}", self.dial)))?
      .next()
      .ok_or_else(|| ProxyError::DnsResolutionError(format!("no addresses for {}", self.dial)))
  }
}

/* ---------------------------------------------------------- */
/// Fields shared by every terminal outcome of one request.
#[derive(Debug, Clone)]
struct RequestScope {
  host: String,
  method: Method,
  path: String,
  client_addr: SocketAddr,
  started_at: SystemTime,
  started: Instant,
}

impl RequestScope {
  fn record(&self, status: StatusCode, endpoint: Option<&Endpoint>) -> AccessLogRecord {
    AccessLogRecord {
      host: self.host.clone(),
      method: self.method.to_string(),
      path: self.path.clone(),
      status: Some(status.as_u16()),
      endpoint: endpoint.map(|e| e.address()),
      client_addr: self.client_addr,
      started_at: self.started_at,
      finished_at: Some(SystemTime::now()),
      duration: Some(self.started.elapsed()),
    }
  }
}

/* ---------------------------------------------------------- */
#[derive(Clone, derive_builder::Builder)]
/// Per-request proxy pipeline: parse the destination host, consult the route
/// registry, optionally detour through a signed route service, forward the
/// request, and stream or splice the response back. Each request runs
/// independently; the registry and the drain coordinator are the only shared
/// state.
pub struct ReverseProxy {
  /// Live host routing table, read on every request
  registry: Arc<RouteRegistry>,

  /// Every request registers here for its full lifetime, splices included
  drain: DrainCoordinator,

  #[builder(default = "NullReporter::proxy()")]
  reporter: Arc<dyn ProxyReporter>,

  #[builder(default = "NullAccessLogger::shared()")]
  access_logger: Arc<dyn AccessLogger>,

  /// Required only when routes carry a route service URL
  #[builder(setter(strip_option), default)]
  signer: Option<Arc<RouteServiceSigner>>,

  #[builder(default = "crate::constants::ENDPOINT_TIMEOUT")]
  /// Deadline for backend connect and response head
  endpoint_timeout: Duration,

  #[builder(default = "crate::constants::CONNECT_ATTEMPTS")]
  /// Endpoint-selection attempts on connect failure
  connect_attempts: usize,
}

impl ReverseProxy {
  pub async fn handle(&self, mut req: Request<Incoming>, client_addr: SocketAddr) -> Response<ProxyBody> {
    let guard = self.drain.begin();

    let authority = request_authority(&req);
    let scope = RequestScope {
      host: authority
        .as_deref()
        .map(|a| host_without_port(a).to_ascii_lowercase())
        .unwrap_or_default(),
      method: req.method().clone(),
      path: req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string()),
      client_addr,
      started_at: SystemTime::now(),
      started: Instant::now(),
    };

    if scope.host.is_empty() {
      debug!("Rejecting request without a host from {client_addr}");
      return self.fail(&scope, StatusCode::BAD_REQUEST, None, "Request host is missing or malformed");
    }

    let Some(snapshot) = self.registry.lookup(&scope.host) else {
      debug!("No route for {}", scope.host);
      return self.fail(
        &scope,
        StatusCode::NOT_FOUND,
        None,
        &format!("Requested route ('{}') does not exist", scope.host),
      );
    };
    debug!("Routing {} across {} endpoint(s)", scope.host, snapshot.len());

    // Computed from the request as the client sent it, before any rewrite.
    let forwarded_url = RouteServiceSigner::forwarded_url(&req);
    // Present when the request already passed through a route service and
    // came back for final delivery.
    let incoming_signature = req
      .headers()
      .get(HeaderName::from_static(hdr::ROUTE_SERVICE_SIGNATURE))
      .and_then(|v| v.to_str().ok())
      .map(str::to_owned);

    let mut selected = None;
    for attempt in 1..=self.connect_attempts.max(1) {
      let Some(endpoint) = self.registry.next_endpoint(&scope.host) else {
        break;
      };

      let (addr, rewrite) = match endpoint.route_service_url() {
        Some(url) => {
          let Some(signer) = &self.signer else {
            error!("Route for {} requires a route service but no signer is configured", scope.host);
            return self.fail(
              &scope,
              StatusCode::BAD_GATEWAY,
              Some(&endpoint),
              "Route service signing unavailable",
            );
          };
          if let Some(sealed) = &incoming_signature {
            // The request came back from the route service. Either the
            // current or the previous key may have sealed it, so a key
            // rotation never bounces in-flight detours.
            match signer.verify(sealed, epoch_secs()) {
              Ok(_) => {
                debug!("Verified route service provenance for {}", scope.host);
                (endpoint.address(), None)
              }
              Err(e) => {
                warn!("Rejecting route service signature for {}: {e}", scope.host);
                return self.fail(
                  &scope,
                  StatusCode::BAD_REQUEST,
                  Some(&endpoint),
                  "Route service signature rejected",
                );
              }
            }
          } else {
            match self.route_service_rewrite(signer, url, &forwarded_url, &scope, &endpoint).await {
              Ok(Some(pair)) => pair,
              Ok(None) => continue,
              Err(resp) => return resp,
            }
          }
        }
        None => (endpoint.address(), None),
      };

      match timeout(self.endpoint_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
          selected = Some((endpoint, stream, rewrite));
          break;
        }
        Ok(Err(e)) => warn!("Failed to connect to {addr} (attempt {attempt}): {e}"),
        Err(_) => warn!("Timed out connecting to {addr} (attempt {attempt})"),
      }
    }

    let Some((endpoint, stream, rewrite)) = selected else {
      return self.fail(&scope, StatusCode::BAD_GATEWAY, None, "No backend could be reached");
    };

    // Detach the client upgrade before the request is consumed; hyper hands
    // over the client stream only after the 101 response is written.
    let client_upgrade = is_upgrade_request(req.headers()).then(|| hyper::upgrade::on(&mut req));

    let (mut parts, body) = req.into_parts();
    append_forwarded_headers(&mut parts.headers, client_addr);
    if client_upgrade.is_none() {
      parts.headers.remove(header::CONNECTION);
    }
    match &rewrite {
      Some((signed, target)) => {
        if let Err(e) = signed.apply(&mut parts.headers) {
          error!("Failed to attach route service headers: {e}");
          return self.fail(
            &scope,
            StatusCode::BAD_GATEWAY,
            Some(&endpoint),
            "Route service signing failed",
          );
        }
        if let Ok(host_value) = HeaderValue::from_str(&target.authority) {
          parts.headers.insert(header::HOST, host_value);
        }
        parts.uri = target
          .path_and_query
          .parse()
          .unwrap_or_else(|_| Uri::from_static("/"));
      }
      None => {
        // Provenance headers never travel past the router.
        for name in [hdr::ROUTE_SERVICE_SIGNATURE, hdr::ROUTE_SERVICE_KEY_ID, hdr::ROUTE_SERVICE_FORWARDED_URL] {
          parts.headers.remove(HeaderName::from_static(name));
        }
        // Backends receive origin-form targets regardless of what the
        // client sent.
        parts.uri = scope.path.parse().unwrap_or_else(|_| Uri::from_static("/"));
      }
    }
    let outbound = Request::from_parts(parts, body);

    let (mut sender, conn) = match timeout(self.endpoint_timeout, hyper::client::conn::http1::handshake(TokioIo::new(stream))).await
    {
      Ok(Ok(pair)) => pair,
      Ok(Err(e)) => {
        warn!("Backend handshake with {endpoint} failed: {e}");
        return self.fail(&scope, StatusCode::BAD_GATEWAY, Some(&endpoint), "Backend connection failed");
      }
      Err(_) => {
        warn!("Timed out establishing backend session with {endpoint}");
        return self.fail(&scope, StatusCode::GATEWAY_TIMEOUT, Some(&endpoint), "Backend timed out");
      }
    };
    tokio::spawn(async move {
      if let Err(e) = conn.with_upgrades().await {
        debug!("Backend connection task ended: {e}");
      }
    });

    self.reporter.capture_routing_request(&endpoint);

    let mut resp = match timeout(self.endpoint_timeout, sender.send_request(outbound)).await {
      Ok(Ok(resp)) => resp,
      Ok(Err(e)) => {
        warn!("Backend request to {endpoint} failed: {e}");
        return self.fail(&scope, StatusCode::BAD_GATEWAY, Some(&endpoint), "Backend request failed");
      }
      Err(_) => {
        warn!("Backend response from {endpoint} timed out");
        return self.fail(&scope, StatusCode::GATEWAY_TIMEOUT, Some(&endpoint), "Backend timed out");
      }
    };

    if resp.status() == StatusCode::SWITCHING_PROTOCOLS {
      if let Some(on_client) = client_upgrade {
        let on_backend = hyper::upgrade::on(&mut resp);
        let reporter = self.reporter.clone();
        let access_logger = self.access_logger.clone();
        let scope = scope.clone();
        let endpoint = endpoint.clone();
        tokio::spawn(async move {
          // The guard spans the whole splice; duration is recorded at close.
          let _guard = guard;
          match tokio::try_join!(on_client, on_backend) {
            Ok((client_io, backend_io)) => {
              let mut client_io = TokioIo::new(client_io);
              let mut backend_io = TokioIo::new(backend_io);
              match tokio::io::copy_bidirectional(&mut client_io, &mut backend_io).await {
                Ok((to_backend, to_client)) => {
                  debug!("Upgraded connection closed ({to_backend}B out, {to_client}B in)")
                }
                Err(e) => debug!("Upgraded connection closed with error: {e}"),
              }
            }
            Err(e) => warn!("Connection upgrade with {endpoint} failed: {e}"),
          }
          reporter.capture_routing_response(
            &endpoint,
            StatusCode::SWITCHING_PROTOCOLS.as_u16(),
            scope.started.elapsed(),
          );
          access_logger.log(&scope.record(StatusCode::SWITCHING_PROTOCOLS, Some(&endpoint)));
        });
        return resp.map(incoming_body);
      }
      warn!("Backend {endpoint} answered 101 to a non-upgrade request");
      return self.fail(&scope, StatusCode::BAD_GATEWAY, Some(&endpoint), "Unexpected protocol switch");
    }

    let status = resp.status();
    self.reporter.capture_routing_response(&endpoint, status.as_u16(), scope.started.elapsed());
    self.access_logger.log(&scope.record(status, Some(&endpoint)));
    resp.map(incoming_body)
  }

  /// Sign the forwarded URL and resolve the route service's dial address.
  /// `Ok(None)` means this attempt failed resolution and the caller may try
  /// the next endpoint; `Err` carries the finished failure response.
  async fn route_service_rewrite(
    &self,
    signer: &RouteServiceSigner,
    url: &str,
    forwarded_url: &str,
    scope: &RequestScope,
    endpoint: &Endpoint,
  ) -> Result<Option<(SocketAddr, Option<(SignedHeader, RouteServiceTarget)>)>, Response<ProxyBody>> {
    let signed = match signer.sign(forwarded_url, epoch_secs()) {
      Ok(signed) => signed,
      Err(e) => {
        error!("Route service signing failed: {e}");
        return Err(self.fail(scope, StatusCode::BAD_GATEWAY, Some(endpoint), "Route service signing failed"));
      }
    };
    let target = match RouteServiceTarget::parse(url) {
      Ok(target) => target,
      Err(e) => {
        error!("Rejecting route service for {}: {e}", scope.host);
        return Err(self.fail(scope, StatusCode::BAD_GATEWAY, Some(endpoint), "Invalid route service url"));
      }
    };
    match target.resolve().await {
      Ok(addr) => Ok(Some((addr, Some((signed, target))))),
      Err(e) => {
        warn!("Route service resolution failed: {e}");
        Ok(None)
      }
    }
  }

  /// Terminal failure: one metric by error class, one access-log record, one
  /// synthesized response.
  fn fail(
    &self,
    scope: &RequestScope,
    status: StatusCode,
    endpoint: Option<&Endpoint>,
    message: &str,
  ) -> Response<ProxyBody> {
    if status.is_client_error() {
      self.reporter.capture_bad_request();
    } else {
      self.reporter.capture_bad_gateway();
    }
    self.access_logger.log(&scope.record(status, endpoint));
    status_response(status, message)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_host_without_port() {
    assert_eq!(host_without_port("app.example.com"), "app.example.com");
    assert_eq!(host_without_port("app.example.com:8080"), "app.example.com");
    assert_eq!(host_without_port("[::1]:8080"), "[::1]");
    assert_eq!(host_without_port("[::1]"), "[::1]");
    assert_eq!(host_without_port("localhost:notaport"), "localhost:notaport");
  }

  #[test]
  fn test_upgrade_detection() {
    let mut headers_map = HeaderMap::new();
    assert!(!is_upgrade_request(&headers_map));

    headers_map.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    assert!(!is_upgrade_request(&headers_map));

    headers_map.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
    assert!(is_upgrade_request(&headers_map));

    headers_map.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    assert!(!is_upgrade_request(&headers_map));
  }

  #[test]
  fn test_forwarded_headers_appended() {
    let client: SocketAddr = "192.0.2.9:40000".parse().unwrap();

    let mut headers_map = HeaderMap::new();
    append_forwarded_headers(&mut headers_map, client);
    assert_eq!(headers_map.get(hdr::FORWARDED_FOR).unwrap(), "192.0.2.9");
    assert_eq!(headers_map.get(hdr::FORWARDED_PROTO).unwrap(), "http");

    let mut headers_map = HeaderMap::new();
    headers_map.insert(
      HeaderName::from_static(hdr::FORWARDED_FOR),
      HeaderValue::from_static("198.51.100.1"),
    );
    headers_map.insert(HeaderName::from_static(hdr::FORWARDED_PROTO), HeaderValue::from_static("https"));
    append_forwarded_headers(&mut headers_map, client);
    assert_eq!(headers_map.get(hdr::FORWARDED_FOR).unwrap(), "198.51.100.1, 192.0.2.9");
    assert_eq!(headers_map.get(hdr::FORWARDED_PROTO).unwrap(), "https");
  }

  #[test]
  fn test_route_service_target_parsing() {
    let target = RouteServiceTarget::parse("https://rs.example.com/inspect?x=1").unwrap();
    assert_eq!(target.authority, "rs.example.com");
    assert_eq!(target.dial, "rs.example.com:443");
    assert_eq!(target.path_and_query, "/inspect?x=1");

    let target = RouteServiceTarget::parse("http://rs.example.com:9000").unwrap();
    assert_eq!(target.dial, "rs.example.com:9000");
    assert_eq!(target.path_and_query, "/");

    assert!(RouteServiceTarget::parse("not a url").is_err());
    assert!(RouteServiceTarget::parse("http://").is_err());
  }
}
