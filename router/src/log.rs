#![allow(unused)]
pub use tracing::{debug, error, info, warn};

use std::str::FromStr;
use tracing_subscriber::{fmt, prelude::*};

pub fn init_logger(log_dir_path: Option<&str>) {
  let level_string = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
  let level = tracing::Level::from_str(level_string.as_str()).unwrap_or(tracing::Level::INFO);

  let passed_pkg_names = [env!("CARGO_PKG_NAME").replace('-', "_"), "hostrouter_lib".to_string()];

  // This limits the logger to emit any level only for this workspace's crates; for included crates it emits only INFO or above.
  let filter = tracing_subscriber::filter::filter_fn(move |metadata| {
    (passed_pkg_names
      .iter()
      .any(|pkg_name| metadata.target().starts_with(pkg_name))
      && metadata.level() <= &level)
      || metadata.level() <= &tracing::Level::INFO.min(level)
  });

  match log_dir_path {
    Some(log_dir_path) => {
      let log_path = std::path::Path::new(log_dir_path).join("hostrouter.log");
      let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .unwrap_or_else(|e| panic!("Failed to open log file {}: {e}", log_path.display()));
      let file_layer = fmt::layer()
        .with_ansi(false)
        .with_thread_names(true)
        .with_target(true)
        .with_level(true)
        .compact()
        .with_writer(std::sync::Arc::new(file))
        .with_filter(filter);
      tracing_subscriber::registry().with(file_layer).init();
    }
    None => {
      let stdio_layer = fmt::layer()
        .with_line_number(true)
        .with_thread_ids(false)
        .with_thread_names(true)
        .with_target(true)
        .with_level(true)
        .compact()
        .with_filter(filter);
      tracing_subscriber::registry().with(stdio_layer).init();
    }
  }
}
