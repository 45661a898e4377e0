use crate::log::warn;
use anyhow::anyhow;
use hostrouter_lib::{Endpoint, EndpointBuilder};
use serde::Deserialize;
use std::{collections::HashSet, fs, net::SocketAddr};

#[derive(Deserialize, Debug, Default, PartialEq, Eq, Clone)]
pub struct ConfigToml {
  pub listen_port: Option<u16>,
  pub listen_ipv6: Option<bool>,
  pub backlog: Option<u32>,
  pub max_connections: Option<usize>,
  // reverse proxy pipeline
  pub endpoint_timeout_secs: Option<u64>,
  pub connect_attempts: Option<usize>,
  // drain
  pub drain_timeout_secs: Option<u64>,
  // route registry
  pub route_ttl_secs: Option<u64>,
  pub prune_interval_secs: Option<u64>,
  // access log file, stdout-only tracing when unset
  pub access_log: Option<String>,
  // route service signing
  pub route_service: Option<RouteServiceToml>,
  // statically configured routes, refreshed like live advertisements
  pub routes: Option<Vec<RouteToml>>,
}

#[derive(Deserialize, Debug, Default, PartialEq, Eq, Clone)]
pub struct RouteServiceToml {
  /// Shared secret the signing key is derived from
  pub secret: String,
  /// Previous secret kept verifiable across a key rotation
  pub previous_secret: Option<String>,
  pub replay_window_secs: Option<u64>,
}

#[derive(Deserialize, Debug, Default, PartialEq, Eq, Clone)]
pub struct RouteToml {
  /// External hostname
  pub host: String,
  /// Backend addresses as ip:port
  pub endpoints: Vec<String>,
  pub app_id: Option<String>,
  pub tls: Option<bool>,
  pub route_service_url: Option<String>,
}

impl ConfigToml {
  pub fn new(config_file: &str) -> Result<Self, anyhow::Error> {
    let config_str = fs::read_to_string(config_file)?;

    // Check unused fields during deserialization
    let t = toml::de::Deserializer::new(&config_str);
    let mut unused = HashSet::new();

    let res = serde_ignored::deserialize(t, |path| {
      unused.insert(path.to_string());
    })
    .map_err(|e| anyhow::anyhow!(e));

    if !unused.is_empty() {
      let str = unused.iter().fold(String::new(), |acc, x| acc + x + "\n");
      warn!("Configuration file contains unsupported fields. Check typos:\n{}", str);
    }

    res
  }

  /// Expand the `[[routes]]` tables into `(host, endpoint)` pairs.
  pub fn static_routes(&self) -> Result<Vec<(String, Endpoint)>, anyhow::Error> {
    let mut routes = Vec::new();
    for route in self.routes.iter().flatten() {
      for addr in &route.endpoints {
        let address: SocketAddr = addr
          .parse()
          .map_err(|e| anyhow!("Invalid endpoint '{addr}' for {}: {e}", route.host))?;
        let mut builder = EndpointBuilder::default();
        builder.address(address);
        if let Some(app_id) = &route.app_id {
          builder.app_id(app_id.clone());
        }
        if let Some(tls) = route.tls {
          builder.tls_required(tls);
        }
        if let Some(url) = &route.route_service_url {
          builder.route_service_url(url.clone());
        }
        let endpoint = builder
          .build()
          .map_err(|e| anyhow!("Invalid route for {}: {e}", route.host))?;
        routes.push((route.host.clone(), endpoint));
      }
    }
    Ok(routes)
  }
}
