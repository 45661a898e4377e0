use std::time::{SystemTime, UNIX_EPOCH};

/// Get the current time since the epoch in seconds.
#[inline]
pub(crate) fn epoch_secs() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .expect("System clock is set before the unix epoch")
    .as_secs()
}

/// Get the current time since the epoch in milliseconds.
#[inline]
pub(crate) fn epoch_millis() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .expect("System clock is set before the unix epoch")
    .as_millis() as u64
}
