mod access_log;
pub mod constants;
mod count;
mod drain;
mod endpoint;
mod error;
mod metrics;
mod proxy;
mod registry;
mod route_service;
mod router;
mod time_util;
mod trace;

pub use access_log::{
  AccessLogRecord, AccessLogger, FileAccessLogger, NullAccessLogger, TracingAccessLogger, create_running_access_logger,
};
pub use count::ConnectionCount;
pub use drain::{DrainCoordinator, DrainState, InflightGuard};
pub use endpoint::{Endpoint, EndpointBuilder, EndpointBuilderError};
pub use error::{DrainError, ProxyError, RouterBuildError, RouterError, SignatureError};
pub use metrics::{NullReporter, ProxyReporter, RegistryReporter};
pub use proxy::{ProxyBody, ReverseProxy, ReverseProxyBuilder, ReverseProxyBuilderError};
pub use registry::{RouteAction, RouteRegistry, RouteUpdate};
pub use route_service::{RouteServiceSigner, SignedHeader, Signature};
pub use router::{Router, RouterBuilder, RouterBuilderError, RouterCommand};
