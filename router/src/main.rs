#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod config;
mod log;

use crate::{
  config::{ConfigToml, parse_opts},
  log::*,
};
use hostrouter_lib::*;
use std::{sync::Arc, time::Duration};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

fn main() {
  let mut runtime_builder = tokio::runtime::Builder::new_multi_thread();
  runtime_builder.enable_all();
  runtime_builder.thread_name("hostrouter");
  let runtime = runtime_builder.build().expect("Failed to build tokio runtime");

  runtime.block_on(async {
    if let Err(e) = router_service().await {
      error!("hostrouter exited with error: {e}");
      std::process::exit(1);
    }
  });
}

async fn router_service() -> Result<(), anyhow::Error> {
  let opts = parse_opts()?;
  init_logger(opts.log_dir_path.as_deref());
  info!("Starting hostrouter");

  let config = ConfigToml::new(&opts.config_file_path)?;
  let Some(listen_port) = config.listen_port else {
    anyhow::bail!("listen_port is required");
  };
  let listen_on: std::net::SocketAddr = if config.listen_ipv6.unwrap_or(false) {
    format!("[::]:{listen_port}").parse()?
  } else {
    format!("0.0.0.0:{listen_port}").parse()?
  };

  /* ----------------------------------------------- */
  // Collaborators: metrics stay disabled until an external reporter is
  // wired in; the access log is file-backed when configured.
  let access_logger = create_running_access_logger(config.access_log.as_deref()).await?;

  /* ----------------------------------------------- */
  // Route registry fed by the update channel. Routes from the config file
  // enter through the same channel a live advertisement source would use,
  // re-advertised at half the TTL so the pruner never retires them.
  let route_ttl = config
    .route_ttl_secs
    .map(Duration::from_secs)
    .unwrap_or(constants::ROUTE_STALE_TTL);
  let prune_interval = config
    .prune_interval_secs
    .map(Duration::from_secs)
    .unwrap_or(constants::PRUNE_INTERVAL);
  let registry = Arc::new(RouteRegistry::with_timing(route_ttl, prune_interval, NullReporter::registry()));

  let (update_tx, update_rx) = mpsc::channel::<RouteUpdate>(256);
  let cancel_token = CancellationToken::new();
  tokio::spawn({
    let registry = registry.clone();
    let cancel_token = cancel_token.child_token();
    async move { registry.start(update_rx, cancel_token).await }
  });

  let static_routes = config.static_routes()?;
  if !static_routes.is_empty() {
    info!("Advertising {} static route(s)", static_routes.len());
    let refresh = (route_ttl / 2).max(Duration::from_secs(1));
    tokio::spawn(async move {
      let mut tick = tokio::time::interval(refresh);
      loop {
        tick.tick().await;
        for (host, endpoint) in &static_routes {
          let update = RouteUpdate {
            host: host.clone(),
            endpoint: endpoint.clone(),
            action: RouteAction::Register,
          };
          if update_tx.send(update).await.is_err() {
            return;
          }
        }
      }
    });
  }

  /* ----------------------------------------------- */
  // Key-material problems abort startup here, before the listener binds.
  let signer = match &config.route_service {
    Some(rs) => {
      let replay_window = rs
        .replay_window_secs
        .map(Duration::from_secs)
        .unwrap_or(constants::SIGNATURE_REPLAY_WINDOW);
      Some(Arc::new(RouteServiceSigner::try_new(
        &rs.secret,
        rs.previous_secret.as_deref(),
        replay_window,
      )?))
    }
    None => None,
  };

  /* ----------------------------------------------- */
  let drain = DrainCoordinator::new();

  let mut proxy_builder = ReverseProxyBuilder::default();
  proxy_builder
    .registry(registry.clone())
    .drain(drain.clone())
    .access_logger(access_logger);
  if let Some(signer) = signer {
    proxy_builder.signer(signer);
  }
  if let Some(secs) = config.endpoint_timeout_secs {
    proxy_builder.endpoint_timeout(Duration::from_secs(secs));
  }
  if let Some(attempts) = config.connect_attempts {
    proxy_builder.connect_attempts(attempts);
  }
  let proxy = proxy_builder.build()?;

  let mut router_builder = RouterBuilder::default();
  router_builder
    .listen_on(listen_on)
    .proxy(proxy)
    .drain(drain.clone())
    .runtime_handle(tokio::runtime::Handle::current());
  if let Some(secs) = config.drain_timeout_secs {
    router_builder.drain_timeout(Duration::from_secs(secs));
  }
  if let Some(backlog) = config.backlog {
    router_builder.backlog(backlog);
  }
  if let Some(max_connections) = config.max_connections {
    router_builder.max_connections(max_connections);
  }
  let router = router_builder.build()?;

  /* ----------------------------------------------- */
  let (cmd_tx, cmd_rx) = mpsc::channel(4);
  // Held open for external collaborators (e.g. the route-update source) to
  // report fatal conditions; an error drains before the router returns.
  let (_err_tx, err_rx) = mpsc::channel::<anyhow::Error>(4);
  spawn_signal_listener(cmd_tx);

  let (ready_tx, ready_rx) = oneshot::channel();
  tokio::spawn(async move {
    if let Ok(addr) = ready_rx.await {
      info!("hostrouter ready on {addr}");
    }
  });

  let result = router.run(cmd_rx, err_rx, ready_tx).await;
  cancel_token.cancel();
  match result {
    Ok(()) => {
      info!("hostrouter stopped");
      Ok(())
    }
    Err(RouterError::Drain(e)) => {
      warn!("hostrouter stopped with in-flight requests: {e}");
      Ok(())
    }
    Err(e) => Err(e.into()),
  }
}

#[cfg(unix)]
fn spawn_signal_listener(cmd_tx: mpsc::Sender<RouterCommand>) {
  tokio::spawn(async move {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = match signal(SignalKind::terminate()) {
      Ok(s) => s,
      Err(e) => {
        error!("Failed to install SIGTERM handler: {e}");
        return;
      }
    };
    let mut sigusr1 = match signal(SignalKind::user_defined1()) {
      Ok(s) => s,
      Err(e) => {
        error!("Failed to install SIGUSR1 handler: {e}");
        return;
      }
    };
    loop {
      tokio::select! {
        _ = tokio::signal::ctrl_c() => {
          info!("Received interrupt, stopping immediately");
          let _ = cmd_tx.send(RouterCommand::Stop).await;
        }
        _ = sigterm.recv() => {
          info!("Received SIGTERM, stopping immediately");
          let _ = cmd_tx.send(RouterCommand::Stop).await;
        }
        _ = sigusr1.recv() => {
          info!("Received SIGUSR1, draining before stop");
          let _ = cmd_tx.send(RouterCommand::Drain).await;
        }
      }
    }
  });
}

#[cfg(not(unix))]
fn spawn_signal_listener(cmd_tx: mpsc::Sender<RouterCommand>) {
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      info!("Received interrupt, stopping immediately");
      let _ = cmd_tx.send(RouterCommand::Stop).await;
    }
  });
}
