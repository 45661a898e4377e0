use std::sync::{
  Arc,
  atomic::{AtomicUsize, Ordering},
};

#[derive(Debug, Clone, Default)]
/// Counter for units of work currently being served. Decrement saturates at
/// zero so a double release can never wrap the counter.
pub struct ConnectionCount(Arc<AtomicUsize>);

impl ConnectionCount {
  pub fn current(&self) -> usize {
    self.0.load(Ordering::Relaxed)
  }

  pub(crate) fn increment(&self) -> usize {
    self.0.fetch_add(1, Ordering::Relaxed)
  }

  /// Returns the value observed before decrementing.
  pub(crate) fn decrement(&self) -> usize {
    self
      .0
      .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |count| count.checked_sub(1))
      .unwrap_or_else(|zero| zero)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_connection_count_basic() {
    let count = ConnectionCount::default();

    assert_eq!(count.current(), 0);

    count.increment();
    assert_eq!(count.current(), 1);

    count.increment();
    assert_eq!(count.current(), 2);

    count.decrement();
    assert_eq!(count.current(), 1);
  }

  #[test]
  fn test_connection_count_saturates_at_zero() {
    let count = ConnectionCount::default();

    assert_eq!(count.decrement(), 0);
    assert_eq!(count.current(), 0);

    for _ in 0..5 {
      count.increment();
      count.decrement();
    }

    assert_eq!(count.current(), 0);
  }

  #[test]
  fn test_decrement_reports_previous_value() {
    let count = ConnectionCount::default();
    count.increment();
    count.increment();

    assert_eq!(count.decrement(), 2);
    assert_eq!(count.decrement(), 1);
    assert_eq!(count.decrement(), 0);
  }
}
