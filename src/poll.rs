//! Retry-until-condition-or-deadline loop used at every wait point
//!
//! A check is run, and if it is not yet satisfied the caller sleeps for the
//! configured interval and tries again. Checks report their own status as a
//! [`Check`], so "not there yet" and "give up now" are never guessed from the
//! error type.
//!
//! Boundary policy: the deadline is inclusive. A check always runs at
//! `elapsed == deadline` before the loop reports [`PollOutcome::TimedOut`],
//! and the last sleep is shortened so elapsed time never overshoots the
//! deadline because of the sleep itself. A slow check can still push the
//! loop past the deadline by the duration of that one call.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::{Error, Result};

/// Source of time for polling loops
pub trait Clock: Send + Sync {
    /// Time since an arbitrary, fixed origin
    fn now(&self) -> Duration;

    fn sleep(&self, duration: Duration);
}

/// Wall clock backed by [`Instant`] and [`std::thread::sleep`]
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Clock that only moves when something sleeps on it or calls [`advance`].
///
/// Lets hour-long waits run instantly while still accounting elapsed time.
///
/// [`advance`]: SimulatedClock::advance
#[derive(Debug, Default)]
pub struct SimulatedClock {
    now: Mutex<Duration>,
    naps: Mutex<Vec<Duration>>,
}

impl SimulatedClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward without recording a sleep (a slow remote call)
    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }

    /// Every sleep requested so far, in order
    pub fn naps(&self) -> Vec<Duration> {
        self.naps.lock().clone()
    }

    pub fn total_slept(&self) -> Duration {
        self.naps.lock().iter().sum()
    }
}

impl Clock for SimulatedClock {
    fn now(&self) -> Duration {
        *self.now.lock()
    }

    fn sleep(&self, duration: Duration) {
        self.naps.lock().push(duration);
        *self.now.lock() += duration;
    }
}

/// Interval and deadline for one wait phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    pub deadline: Duration,
}

impl PollConfig {
    pub const fn new(interval: Duration, deadline: Duration) -> Self {
        Self { interval, deadline }
    }

    pub const fn secs(interval: u64, deadline: u64) -> Self {
        Self::new(Duration::from_secs(interval), Duration::from_secs(deadline))
    }
}

/// Status reported by one invocation of a polling check
#[derive(Debug)]
pub enum Check<T> {
    /// Condition satisfied, stop polling
    Ready(T),
    /// Condition not satisfied yet
    NotYet,
    /// The check failed in a way that is expected while the target settles
    Transient(Error),
    /// The check failed in a way that waiting cannot fix
    Fatal(Error),
}

/// Terminal state of a polling loop
#[derive(Debug)]
pub enum PollOutcome<T> {
    Ready {
        value: T,
        elapsed: Duration,
        attempts: u32,
    },
    TimedOut {
        elapsed: Duration,
        attempts: u32,
        last_error: Option<String>,
    },
}

impl<T> PollOutcome<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, PollOutcome::Ready { .. })
    }

    pub fn elapsed(&self) -> Duration {
        match self {
            PollOutcome::Ready { elapsed, .. } | PollOutcome::TimedOut { elapsed, .. } => *elapsed,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            PollOutcome::Ready { attempts, .. } | PollOutcome::TimedOut { attempts, .. } => {
                *attempts
            }
        }
    }

    /// Turn a timeout into [`Error::Timeout`] for phases where it is fatal
    pub fn into_result(self, phase: &str) -> Result<T> {
        match self {
            PollOutcome::Ready { value, .. } => Ok(value),
            PollOutcome::TimedOut { elapsed, .. } => Err(Error::timeout(phase, elapsed)),
        }
    }
}

/// Runs polling loops against a [`Clock`]
#[derive(Clone, Copy)]
pub struct Poller<'a> {
    clock: &'a dyn Clock,
}

impl<'a> Poller<'a> {
    pub fn new(clock: &'a dyn Clock) -> Self {
        Self { clock }
    }

    pub fn clock(&self) -> &'a dyn Clock {
        self.clock
    }

    /// Run `check` until it reports ready, fails fatally, or the deadline passes.
    pub fn poll_until<T, F>(
        &self,
        phase: &str,
        config: PollConfig,
        mut check: F,
    ) -> Result<PollOutcome<T>>
    where
        F: FnMut() -> Check<T>,
    {
        if config.interval.is_zero() {
            return Err(Error::Config(format!("{phase}: poll interval must be non-zero")));
        }

        let start = self.clock.now();
        let mut attempts = 0u32;
        let mut last_error: Option<String> = None;

        loop {
            attempts += 1;
            match check() {
                Check::Ready(value) => {
                    let elapsed = self.clock.now().saturating_sub(start);
                    let elapsed_secs = elapsed.as_secs();
                    tracing::debug!(phase, attempts, elapsed_secs, "Condition met");
                    return Ok(PollOutcome::Ready {
                        value,
                        elapsed,
                        attempts,
                    });
                }
                Check::NotYet => {}
                Check::Transient(e) => {
                    tracing::debug!(phase, attempts, error = %e, "Not ready yet");
                    last_error = Some(e.to_string());
                }
                Check::Fatal(e) => {
                    tracing::error!(phase, attempts, error = %e, "Aborted");
                    return Err(e);
                }
            }

            let elapsed = self.clock.now().saturating_sub(start);
            if elapsed >= config.deadline {
                tracing::warn!(
                    phase,
                    attempts,
                    deadline_secs = config.deadline.as_secs(),
                    "Exceeded {} seconds timeout",
                    config.deadline.as_secs()
                );
                return Ok(PollOutcome::TimedOut {
                    elapsed,
                    attempts,
                    last_error,
                });
            }

            let nap = config.interval.min(config.deadline - elapsed);
            self.clock.sleep(nap);
            let elapsed = self.clock.now().saturating_sub(start);
            let elapsed_secs = elapsed.as_secs();
            tracing::info!(phase, elapsed_secs, "Elapsed {} seconds ...", elapsed_secs);
        }
    }

    /// Sleep for `total`, reporting progress every `step`.
    pub fn pause(&self, phase: &str, total: Duration, step: Duration) {
        let step = if step.is_zero() { total } else { step };
        let mut slept = Duration::ZERO;
        while slept < total {
            let nap = step.min(total - slept);
            self.clock.sleep(nap);
            slept += nap;
            let elapsed_secs = slept.as_secs();
            tracing::info!(phase, elapsed_secs, "Elapsed {} seconds ...", elapsed_secs);
        }
    }
}
