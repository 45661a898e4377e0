use crate::trace::*;
use std::{
  net::SocketAddr,
  sync::Arc,
  time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::{io::AsyncWriteExt, sync::mpsc};

/* ---------------------------------------------------------- */
/// One record per completed or failed request. `finished_at` is set once the
/// outcome is final; for upgraded connections that is when the splice closes.
#[derive(Debug, Clone)]
pub struct AccessLogRecord {
  pub host: String,
  pub method: String,
  pub path: String,
  pub status: Option<u16>,
  pub endpoint: Option<SocketAddr>,
  pub client_addr: SocketAddr,
  pub started_at: SystemTime,
  pub finished_at: Option<SystemTime>,
  pub duration: Option<Duration>,
}

fn epoch_ms(t: SystemTime) -> u128 {
  t.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis()
}

impl std::fmt::Display for AccessLogRecord {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(
      f,
      "{} - [{}] \"{} {}\" status:{} endpoint:{} response_time:{}ms client:{}",
      self.host,
      epoch_ms(self.started_at),
      self.method,
      self.path,
      self.status.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string()),
      self
        .endpoint
        .map(|e| e.to_string())
        .unwrap_or_else(|| "-".to_string()),
      self.duration.unwrap_or_default().as_millis(),
      self.client_addr,
    )
  }
}

/* ---------------------------------------------------------- */
/// Consumer of per-request records. Implementations must be cheap enough to
/// call from the request path; anything slow belongs behind a channel.
pub trait AccessLogger: Send + Sync {
  fn log(&self, record: &AccessLogRecord);
}

/// Discards all records, for disabled access logging.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullAccessLogger;

impl NullAccessLogger {
  pub fn shared() -> Arc<dyn AccessLogger> {
    Arc::new(NullAccessLogger)
  }
}

impl AccessLogger for NullAccessLogger {
  fn log(&self, _record: &AccessLogRecord) {}
}

/// Emits each record as a named tracing event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAccessLogger;

impl TracingAccessLogger {
  pub fn shared() -> Arc<dyn AccessLogger> {
    Arc::new(TracingAccessLogger)
  }
}

impl AccessLogger for TracingAccessLogger {
  fn log(&self, record: &AccessLogRecord) {
    info!(name: crate::constants::log_event_names::ACCESS_LOG, "{}", record);
  }
}

/* ---------------------------------------------------------- */
/// Appends one line per record to a file. Records are handed to a background
/// writer task over an unbounded channel so the request path never blocks on
/// disk IO.
#[derive(Debug, Clone)]
pub struct FileAccessLogger {
  tx: mpsc::UnboundedSender<String>,
}

impl FileAccessLogger {
  /// Open `path` for append and spawn the writer task. Must be called from
  /// within a tokio runtime.
  pub async fn create(path: &str) -> Result<Self, std::io::Error> {
    let mut file = tokio::fs::OpenOptions::new()
      .create(true)
      .append(true)
      .open(path)
      .await?;
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
      while let Some(line) = rx.recv().await {
        if let Err(e) = file.write_all(line.as_bytes()).await {
          error!("Failed to write access log line: {e}");
          break;
        }
        if let Err(e) = file.flush().await {
          error!("Failed to flush access log: {e}");
          break;
        }
      }
    });
    Ok(Self { tx })
  }
}

impl AccessLogger for FileAccessLogger {
  fn log(&self, record: &AccessLogRecord) {
    // Send fails only after the writer task died; the line is dropped then.
    let _ = self.tx.send(format!("{record}\n"));
  }
}

/// Build the access logger the router should run with: file-backed when a
/// path is configured, otherwise the null logger.
pub async fn create_running_access_logger(path: Option<&str>) -> Result<Arc<dyn AccessLogger>, std::io::Error> {
  match path {
    Some(path) if !path.is_empty() => {
      let logger = FileAccessLogger::create(path).await?;
      Ok(Arc::new(logger))
    }
    _ => Ok(NullAccessLogger::shared()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn sample_record() -> AccessLogRecord {
    AccessLogRecord {
      host: "app.example.com".to_string(),
      method: "GET".to_string(),
      path: "/v2/items?page=1".to_string(),
      status: Some(200),
      endpoint: Some("10.0.0.1:8080".parse().unwrap()),
      client_addr: "192.0.2.7:51000".parse().unwrap(),
      started_at: UNIX_EPOCH + Duration::from_millis(1_500),
      finished_at: Some(UNIX_EPOCH + Duration::from_millis(1_742)),
      duration: Some(Duration::from_millis(242)),
    }
  }

  #[test]
  fn test_record_line_format() {
    let line = sample_record().to_string();
    assert_eq!(
      line,
      "app.example.com - [1500] \"GET /v2/items?page=1\" status:200 endpoint:10.0.0.1:8080 response_time:242ms client:192.0.2.7:51000"
    );
  }

  #[test]
  fn test_record_line_without_outcome() {
    let mut record = sample_record();
    record.status = None;
    record.endpoint = None;
    record.duration = None;
    let line = record.to_string();
    assert!(line.contains("status:- endpoint:-"));
  }

  fn temp_log_path() -> String {
    static SEQ: AtomicUsize = AtomicUsize::new(0);
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir()
      .join(format!("hostrouter-access-{}-{seq}.log", std::process::id()))
      .to_string_lossy()
      .into_owned()
  }

  #[tokio::test]
  async fn test_file_logger_appends_lines() {
    let path = temp_log_path();
    let logger = FileAccessLogger::create(&path).await.unwrap();

    logger.log(&sample_record());
    logger.log(&sample_record());

    // Give the writer task a chance to drain the channel.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let contents = tokio::fs::read_to_string(&path).await.unwrap();
    assert_eq!(contents.lines().count(), 2);
    assert!(contents.lines().all(|l| l.contains("app.example.com")));

    let _ = tokio::fs::remove_file(&path).await;
  }

  #[tokio::test]
  async fn test_factory_returns_null_logger_when_disabled() {
    // Null logger silently accepts records.
    let logger = create_running_access_logger(None).await.unwrap();
    logger.log(&sample_record());

    let logger = create_running_access_logger(Some("")).await.unwrap();
    logger.log(&sample_record());
  }
}
