use crate::{count::ConnectionCount, drain::DrainCoordinator, error::RouterError, proxy::ReverseProxy, trace::*};
use hyper::service::service_fn;
use hyper_util::{
  rt::{TokioExecutor, TokioIo},
  server::conn::auto,
};
use std::{net::SocketAddr, time::Duration};
use tokio::{
  net::{TcpSocket, TcpStream},
  sync::{mpsc, oneshot},
};

/* ---------------------------------------------------------- */
/// Orchestration commands, typically mapped from OS signals by the binary:
/// interrupt/terminate become `Stop`, the dedicated drain signal becomes
/// `Drain`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterCommand {
  /// Stop immediately without waiting for in-flight work
  Stop,
  /// Stop admitting new connections, wait for in-flight work, then stop
  Drain,
}

/// Bind with SO_REUSEADDR and SO_REUSEPORT so a replacement instance can
/// take over the address while this one drains.
fn bind_tcp_socket(listen_on: &SocketAddr) -> Result<TcpSocket, std::io::Error> {
  let tcp_socket = if listen_on.is_ipv6() {
    TcpSocket::new_v6()
  } else {
    TcpSocket::new_v4()
  }?;
  tcp_socket.set_reuseaddr(true)?;

  #[cfg(not(target_os = "windows"))]
  tcp_socket.set_reuseport(true)?;

  tcp_socket.bind(*listen_on)?;
  Ok(tcp_socket)
}

/* ---------------------------------------------------------- */
#[derive(Clone, derive_builder::Builder)]
/// Top-level orchestrator: owns the listener, serves every accepted
/// connection through the reverse proxy, and reacts to commands and
/// asynchronous errors by stopping or draining.
pub struct Router {
  /// Bound socket address to listen on, exposed to clients
  listen_on: SocketAddr,

  /// Per-request pipeline shared by all connections
  proxy: ReverseProxy,

  /// Coordinates admission stop and the wait for in-flight work
  drain: DrainCoordinator,

  #[builder(default = "crate::constants::DRAIN_TIMEOUT")]
  drain_timeout: Duration,

  #[builder(default = "crate::constants::TCP_BACKLOG")]
  backlog: u32,

  #[builder(default = "ConnectionCount::default()")]
  /// Connection counter, share one across routers for a process-wide cap
  connection_count: ConnectionCount,

  #[builder(default = "crate::constants::MAX_CONCURRENT_CONNECTIONS")]
  max_connections: usize,

  /// Tokio runtime handle
  runtime_handle: tokio::runtime::Handle,
}

impl Router {
  /// Bind, report the bound address on `ready`, then accept until told
  /// otherwise.
  ///
  /// `Stop` returns immediately; `Drain` waits for in-flight work up to the
  /// drain timeout and surfaces `DrainError::Timeout` distinctly. An error
  /// arriving on `errors` drains existing connections without killing them,
  /// then hands the error back to the caller, who decides whether the
  /// process stops or keeps going.
  pub async fn run(
    &self,
    mut commands: mpsc::Receiver<RouterCommand>,
    mut errors: mpsc::Receiver<anyhow::Error>,
    ready: oneshot::Sender<SocketAddr>,
  ) -> Result<(), RouterError> {
    let socket = bind_tcp_socket(&self.listen_on)?;
    let listener = socket.listen(self.backlog)?;
    let local_addr = listener.local_addr()?;
    info!("Starting HTTP router on {local_addr}");
    let _ = ready.send(local_addr);

    let admissions = self.drain.admission_token();
    let mut errors_closed = false;

    loop {
      tokio::select! {
        accepted = listener.accept() => {
          let (stream, client_addr) = match accepted {
            Err(e) => {
              error!("Error accepting connection: {e}");
              continue;
            }
            Ok(pair) => pair,
          };
          if self.connection_count.current() >= self.max_connections {
            warn!("Connection limit reached: {}", self.max_connections);
            continue;
          }
          self.connection_count.increment();
          debug!(
            "Accepted connection from {client_addr} (total: {})",
            self.connection_count.current()
          );
          self.serve_connection(stream, client_addr);
        }
        _ = admissions.cancelled() => {
          // A drain started through some other caller; stop admitting.
          info!("Listener on {local_addr} stopped admitting connections");
          return Ok(());
        }
        maybe_cmd = commands.recv() => {
          match maybe_cmd {
            None | Some(RouterCommand::Stop) => {
              info!("Stopping router on {local_addr}");
              return Ok(());
            }
            Some(RouterCommand::Drain) => {
              info!("Drain requested on {local_addr}");
              self.drain.drain(self.drain_timeout).await?;
              return Ok(());
            }
          }
        }
        maybe_err = errors.recv(), if !errors_closed => {
          match maybe_err {
            Some(e) => {
              warn!("Async error received, draining existing connections: {e}");
              if let Err(drain_err) = self.drain.drain(self.drain_timeout).await {
                warn!("Drain after async error: {drain_err}");
              }
              return Err(RouterError::Async(e));
            }
            None => errors_closed = true,
          }
        }
      }
    }
  }

  fn serve_connection(&self, stream: TcpStream, client_addr: SocketAddr) {
    self.runtime_handle.spawn({
      let proxy = self.proxy.clone();
      let connection_count = self.connection_count.clone();
      async move {
        let service = service_fn(move |req| {
          let proxy = proxy.clone();
          async move { Ok::<_, std::convert::Infallible>(proxy.handle(req, client_addr).await) }
        });
        if let Err(e) = auto::Builder::new(TokioExecutor::new())
          .serve_connection_with_upgrades(TokioIo::new(stream), service)
          .await
        {
          debug!("Connection from {client_addr} closed: {e}");
        }
        connection_count.decrement();
      }
    });
  }
}
