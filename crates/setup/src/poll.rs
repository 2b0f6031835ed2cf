//! Bounded retry and polling loops.
//!
//! The pipeline waits on three asynchronous transitions in the guest and the
//! hypervisor: the SSH server coming up, the guest going down for reboot and
//! QEMU resuming after `savevm`. All of them go through [`retry`] or
//! [`poll_until`], which honour an attempt limit, an optional deadline and a
//! [`CancelToken`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Granularity at which a sleeping [`SystemClock`] notices cancellation.
const CANCEL_CHECK_INTERVAL: Duration = Duration::from_millis(200);

/// Shared flag flipped by the Ctrl-C handler.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Source of time for the polling loops.
pub trait Clock {
    fn now(&self) -> Instant;

    /// Sleep for `duration`, returning `false` if cancelled part way.
    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> bool;
}

/// Wall clock backed by `std::thread::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> bool {
        let end = Instant::now() + duration;
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= end {
                return true;
            }
            std::thread::sleep(CANCEL_CHECK_INTERVAL.min(end - now));
        }
    }
}

/// How often and for how long to retry or poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Delay between attempts.
    pub interval: Duration,
    /// Upper bound on attempts, `None` for no bound.
    pub max_attempts: Option<u32>,
    /// Upper bound on total elapsed time, `None` for no bound.
    pub deadline: Option<Duration>,
}

impl PollPolicy {
    pub const fn every(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
            deadline: None,
        }
    }

    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub const fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }
}

/// Why a retry or poll loop gave up.
#[derive(Debug, PartialEq, Eq)]
pub enum PollError<E> {
    /// Every allowed attempt failed; carries the last failure.
    Exhausted { attempts: u32, last: E },
    /// The deadline elapsed before the condition held.
    DeadlineExceeded(Duration),
    /// The probe itself failed in a way that should not be retried.
    Probe(E),
    Cancelled,
}

/// Run `op` until it succeeds, sleeping `policy.interval` *before* every
/// attempt.
///
/// `op` receives the 1-based attempt number.
pub fn retry<T, E>(
    policy: &PollPolicy,
    clock: &dyn Clock,
    cancel: &CancelToken,
    mut op: impl FnMut(u32) -> Result<T, E>,
) -> Result<T, PollError<E>> {
    let start = clock.now();
    let mut attempt = 0;
    loop {
        attempt += 1;
        if !clock.sleep(policy.interval, cancel) {
            return Err(PollError::Cancelled);
        }
        match op(attempt) {
            Ok(v) => return Ok(v),
            Err(e) => {
                if policy.max_attempts.is_some_and(|max| attempt >= max) {
                    return Err(PollError::Exhausted { attempts: attempt, last: e });
                }
                if let Some(deadline) = policy.deadline {
                    if clock.now().duration_since(start) >= deadline {
                        return Err(PollError::DeadlineExceeded(deadline));
                    }
                }
            }
        }
    }
}

/// Call `probe` until it reports `true`, sleeping `policy.interval` *after*
/// every negative answer.
///
/// An `Err` from `probe` aborts the loop immediately as [`PollError::Probe`].
/// Only the deadline bounds this loop; `max_attempts` is ignored.
pub fn poll_until<E>(
    policy: &PollPolicy,
    clock: &dyn Clock,
    cancel: &CancelToken,
    mut probe: impl FnMut(u32) -> Result<bool, E>,
) -> Result<u32, PollError<E>> {
    let start = clock.now();
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(PollError::Cancelled);
        }
        attempt += 1;
        if probe(attempt).map_err(PollError::Probe)? {
            return Ok(attempt);
        }
        if let Some(deadline) = policy.deadline {
            if clock.now().duration_since(start) >= deadline {
                return Err(PollError::DeadlineExceeded(deadline));
            }
        }
        if !clock.sleep(policy.interval, cancel) {
            return Err(PollError::Cancelled);
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::cell::RefCell;

    use super::*;

    /// A clock that only advances when slept on, recording every sleep.
    #[derive(Debug)]
    pub(crate) struct FakeClock {
        base: Instant,
        pub(crate) sleeps: RefCell<Vec<Duration>>,
    }

    impl FakeClock {
        pub(crate) fn new() -> Self {
            Self {
                base: Instant::now(),
                sleeps: RefCell::new(Vec::new()),
            }
        }

        pub(crate) fn elapsed(&self) -> Duration {
            self.sleeps.borrow().iter().sum()
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> Instant {
            self.base + self.elapsed()
        }

        fn sleep(&self, duration: Duration, cancel: &CancelToken) -> bool {
            if cancel.is_cancelled() {
                return false;
            }
            self.sleeps.borrow_mut().push(duration);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::FakeClock;
    use super::*;

    #[test]
    fn test_retry_sleeps_before_each_attempt_and_gives_up() {
        let clock = FakeClock::new();
        let policy = PollPolicy::every(Duration::from_secs(10)).with_max_attempts(10);
        let mut calls = 0;
        let r: Result<(), _> = retry(&policy, &clock, &CancelToken::new(), |n| {
            calls += 1;
            Err(format!("refused {n}"))
        });
        assert_eq!(
            r,
            Err(PollError::Exhausted {
                attempts: 10,
                last: "refused 10".to_string()
            })
        );
        assert_eq!(calls, 10);
        assert_eq!(*clock.sleeps.borrow(), vec![Duration::from_secs(10); 10]);
    }

    #[test]
    fn test_retry_returns_first_success() {
        let clock = FakeClock::new();
        let policy = PollPolicy::every(Duration::from_secs(1)).with_max_attempts(5);
        let r = retry(&policy, &clock, &CancelToken::new(), |n| {
            if n == 3 {
                Ok(n)
            } else {
                Err(())
            }
        });
        assert_eq!(r, Ok(3));
        assert_eq!(clock.sleeps.borrow().len(), 3);
    }

    #[test]
    fn test_poll_until_respects_deadline() {
        let clock = FakeClock::new();
        let policy = PollPolicy::every(Duration::from_secs(5))
            .with_deadline(Some(Duration::from_secs(20)));
        let r = poll_until::<()>(&policy, &clock, &CancelToken::new(), |_| Ok(false));
        assert_eq!(r, Err(PollError::DeadlineExceeded(Duration::from_secs(20))));
        assert_eq!(clock.elapsed(), Duration::from_secs(20));
    }

    #[test]
    fn test_poll_until_probe_error_aborts() {
        let clock = FakeClock::new();
        let policy = PollPolicy::every(Duration::from_secs(5));
        let r = poll_until(&policy, &clock, &CancelToken::new(), |n| {
            if n < 3 {
                Ok(false)
            } else {
                Err("reset")
            }
        });
        assert_eq!(r, Err(PollError::Probe("reset")));
        assert_eq!(clock.sleeps.borrow().len(), 2);
    }

    #[test]
    fn test_cancelled_token_stops_loops() {
        let clock = FakeClock::new();
        let cancel = CancelToken::new();
        cancel.cancel();
        let policy = PollPolicy::every(Duration::from_secs(1));
        assert_eq!(
            poll_until::<()>(&policy, &clock, &cancel, |_| Ok(false)),
            Err(PollError::Cancelled)
        );
        assert_eq!(
            retry::<(), ()>(&policy, &clock, &cancel, |_| Err(())),
            Err(PollError::Cancelled)
        );
    }
}
