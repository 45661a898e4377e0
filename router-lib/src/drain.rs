use crate::{count::ConnectionCount, error::DrainError, trace::*};
use std::{
  sync::{Arc, Mutex},
  time::Duration,
};
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;

/* ---------------------------------------------------------- */
/// Observable lifecycle of the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainState {
  Running,
  Draining,
  Drained,
  TimedOut,
}

type DrainOutcome = Result<(), DrainError>;

#[derive(Debug)]
enum WaitSlot {
  Running,
  /// A drain is underway or finished; joiners watch for the single outcome.
  Draining(watch::Receiver<Option<DrainOutcome>>),
}

#[derive(Debug)]
struct DrainInner {
  inflight: ConnectionCount,
  quiescent: Notify,
  /// Cancelled the moment a drain starts; listeners stop admitting.
  admissions: CancellationToken,
  wait: Mutex<WaitSlot>,
}

/* ---------------------------------------------------------- */
/// Tracks in-flight requests and coordinates graceful shutdown: stop new
/// admissions, wait for the in-flight count to reach zero, report timeout
/// distinctly. In-flight work is never forcibly killed here; after a timeout
/// the remaining tasks keep running and still release their guards.
#[derive(Debug, Clone, Default)]
pub struct DrainCoordinator {
  inner: Arc<DrainInner>,
}

impl Default for DrainInner {
  fn default() -> Self {
    Self {
      inflight: ConnectionCount::default(),
      quiescent: Notify::new(),
      admissions: CancellationToken::new(),
      wait: Mutex::new(WaitSlot::Running),
    }
  }
}

impl DrainCoordinator {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register one unit of in-flight work. The returned guard must live for
  /// the whole unit, including upgraded-connection splices.
  pub fn begin(&self) -> InflightGuard {
    self.inner.inflight.increment();
    InflightGuard {
      inner: self.inner.clone(),
    }
  }

  pub fn inflight(&self) -> usize {
    self.inner.inflight.current()
  }

  /// Token listeners watch to stop accepting once a drain starts.
  pub fn admission_token(&self) -> CancellationToken {
    self.inner.admissions.clone()
  }

  pub fn state(&self) -> DrainState {
    let slot = self.inner.wait.lock().unwrap_or_else(|e| e.into_inner());
    match &*slot {
      WaitSlot::Running => DrainState::Running,
      WaitSlot::Draining(rx) => match *rx.borrow() {
        None => DrainState::Draining,
        Some(Ok(())) => DrainState::Drained,
        Some(Err(_)) => DrainState::TimedOut,
      },
    }
  }

  /// Stop admissions and wait until in-flight work finishes or `timeout`
  /// elapses. The first caller runs the countdown; concurrent and later
  /// callers join the same wait and observe the same single outcome.
  pub async fn drain(&self, timeout: Duration) -> DrainOutcome {
    let run_countdown = {
      let mut slot = self.inner.wait.lock().unwrap_or_else(|e| e.into_inner());
      match &*slot {
        WaitSlot::Draining(rx) => Err(rx.clone()),
        WaitSlot::Running => {
          let (tx, rx) = watch::channel(None);
          *slot = WaitSlot::Draining(rx);
          Ok(tx)
        }
      }
    };

    self.inner.admissions.cancel();

    match run_countdown {
      Ok(tx) => {
        info!("Draining, {} request(s) in flight", self.inner.inflight.current());
        let outcome = self.wait_for_quiescence(timeout).await;
        match outcome {
          Ok(()) => info!("Drain complete"),
          Err(DrainError::Timeout) => {
            warn!(
              "Drain timed out, {} request(s) still in flight",
              self.inner.inflight.current()
            )
          }
        }
        let _ = tx.send(Some(outcome));
        outcome
      }
      Err(mut rx) => loop {
        if let Some(outcome) = *rx.borrow() {
          return outcome;
        }
        if rx.changed().await.is_err() {
          // Countdown task vanished without publishing; report by count.
          return if self.inner.inflight.current() == 0 {
            Ok(())
          } else {
            Err(DrainError::Timeout)
          };
        }
      },
    }
  }

  async fn wait_for_quiescence(&self, timeout: Duration) -> DrainOutcome {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
      // Arm the notification before the count check to avoid a lost wakeup.
      let notified = self.inner.quiescent.notified();
      if self.inner.inflight.current() == 0 {
        return Ok(());
      }
      match tokio::time::timeout_at(deadline, notified).await {
        Ok(()) => continue,
        Err(_) => {
          return if self.inner.inflight.current() == 0 {
            Ok(())
          } else {
            Err(DrainError::Timeout)
          };
        }
      }
    }
  }
}

/* ---------------------------------------------------------- */
/// Scoped registration of one in-flight unit of work. Dropping the guard on
/// any exit path, panic unwinding included, releases the slot and wakes the
/// drain wait once the count reaches zero.
#[derive(Debug)]
pub struct InflightGuard {
  inner: Arc<DrainInner>,
}

impl Drop for InflightGuard {
  fn drop(&mut self) {
    if self.inner.inflight.decrement() <= 1 {
      self.inner.quiescent.notify_waiters();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_drain_with_nothing_in_flight_succeeds() {
    let drain = DrainCoordinator::new();
    assert_eq!(drain.state(), DrainState::Running);

    assert_eq!(drain.drain(Duration::from_millis(100)).await, Ok(()));
    assert_eq!(drain.state(), DrainState::Drained);
    assert!(drain.admission_token().is_cancelled());
  }

  #[tokio::test]
  async fn test_drain_waits_for_guard_release() {
    let drain = DrainCoordinator::new();
    let guard = drain.begin();
    assert_eq!(drain.inflight(), 1);

    let release = tokio::spawn({
      async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(guard);
      }
    });

    let started = tokio::time::Instant::now();
    assert_eq!(drain.drain(Duration::from_secs(5)).await, Ok(()));
    assert!(started.elapsed() >= Duration::from_millis(40));
    assert_eq!(drain.inflight(), 0);
    release.await.unwrap();
  }

  #[tokio::test]
  async fn test_drain_times_out_with_work_still_in_flight() {
    let drain = DrainCoordinator::new();
    let _guard = drain.begin();

    assert_eq!(drain.drain(Duration::from_millis(30)).await, Err(DrainError::Timeout));
    assert_eq!(drain.state(), DrainState::TimedOut);
    // The guard is still live; the counter reflects it.
    assert_eq!(drain.inflight(), 1);
  }

  #[tokio::test]
  async fn test_concurrent_drains_share_one_outcome() {
    let drain = DrainCoordinator::new();
    let _guard = drain.begin();

    let (a, b, c) = tokio::join!(
      drain.drain(Duration::from_millis(40)),
      drain.drain(Duration::from_millis(40)),
      drain.drain(Duration::from_millis(40)),
    );
    assert_eq!(a, Err(DrainError::Timeout));
    assert_eq!(b, Err(DrainError::Timeout));
    assert_eq!(c, Err(DrainError::Timeout));
  }

  #[tokio::test]
  async fn test_late_drain_call_joins_finished_outcome() {
    let drain = DrainCoordinator::new();
    assert_eq!(drain.drain(Duration::from_millis(20)).await, Ok(()));

    // A second call does not start a new countdown; it sees the result.
    assert_eq!(drain.drain(Duration::from_secs(5)).await, Ok(()));
    assert_eq!(drain.state(), DrainState::Drained);
  }

  #[tokio::test]
  async fn test_guards_release_after_timeout() {
    let drain = DrainCoordinator::new();
    let guard = drain.begin();

    assert_eq!(drain.drain(Duration::from_millis(20)).await, Err(DrainError::Timeout));
    drop(guard);
    assert_eq!(drain.inflight(), 0);
  }

  #[tokio::test]
  async fn test_guard_covers_panicking_task() {
    let drain = DrainCoordinator::new();
    let guard = drain.begin();

    let task = tokio::spawn(async move {
      let _guard = guard;
      panic!("handler blew up");
    });
    assert!(task.await.is_err());
    assert_eq!(drain.inflight(), 0);
  }
}
