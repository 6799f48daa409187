//! Adaptive flow control for calls to an unreliable downstream.
//!
//! A [`Nozzle`] sits between a caller and a dependency and continuously
//! adjusts the percentage of calls let through, instead of snapping fully
//! open or fully closed the way a circuit breaker does. Once per interval
//! its control loop compares the observed failure rate against the
//! configured ceiling and widens or narrows the flow, doubling the step
//! while the trend holds so that a persistently unhealthy downstream is
//! shed quickly and a recovered one is re-engaged just as fast.
//!
//! A nozzle starts fully open and is safe to share across tasks. Admission
//! is a cheap synchronous decision; the control loop runs on its own tokio
//! task and is torn down by [`Nozzle::close`].

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::perf)]
#![deny(clippy::suspicious)]
#![deny(clippy::complexity)]
#![deny(clippy::unnecessary_to_owned)]
#![deny(clippy::float_cmp)]
#![deny(clippy::large_futures)]
#![deny(clippy::redundant_allocation)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![allow(clippy::multiple_crate_versions)]

use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub mod builder;
mod valve;

use valve::{Tick, Valve};

/// Observer invoked on state changes. The token is cancelled when the
/// nozzle shuts down.
pub(crate) type StateChangeFn =
    Box<dyn Fn(&CancellationToken, StateSnapshot) + Send + Sync + 'static>;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(deny_unknown_fields)]
/// Configuration of a [`Nozzle`].
pub struct Config {
    /// Tick period of the control loop and the window over which the
    /// per-interval statistics accumulate. Must be at least one
    /// microsecond.
    pub interval: Duration,
    /// Highest failure percent tolerated over an interval. Above it the
    /// nozzle narrows on the next tick instead of widening.
    pub allowed_failure_percent: u8,
}

/// Errors produced by [`Nozzle`] construction.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The configured interval was zero or below timer resolution.
    #[error("interval must be at least one microsecond")]
    InvalidInterval,
    /// The configured failure ceiling was above one hundred percent.
    #[error("allowed_failure_percent must be at most 100, got {0}")]
    InvalidFailurePercent(u8),
}

/// Errors produced by the [`Nozzle::run`] family of wrappers.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunError<E> {
    /// The call was denied by the current flow rate. A fallback may be
    /// appropriate; the downstream was never contacted.
    #[error("call denied by the current flow rate")]
    Blocked,
    /// The nozzle has shut down and admits nothing.
    #[error("nozzle has shut down")]
    Closed,
    /// The caller's cancellation token fired before or during the call.
    #[error("call cancelled")]
    Cancelled,
    /// The call was admitted and the downstream failed; the failure has
    /// been reported to the nozzle.
    #[error("admitted call failed downstream")]
    Upstream(E),
}

impl<E> RunError<E> {
    /// The downstream error, when the call was admitted and failed.
    pub fn into_upstream(self) -> Option<E> {
        match self {
            Self::Upstream(err) => Some(err),
            Self::Blocked | Self::Closed | Self::Cancelled => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
/// Direction of the most recent flow-rate adjustment.
///
/// A nozzle is always moving. Fully open and healthy it keeps choosing
/// [`State::Opening`] as a no-op; fully closed it reopens a step at a time
/// as soon as an interval passes without failures, so it continually probes
/// for recovery. On the edge of the ceiling it will be seen toggling
/// between the two as it explores whether more flow is tolerable.
pub enum State {
    /// The flow rate is increasing.
    Opening,
    /// The flow rate is decreasing.
    Closing,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Opening => write!(f, "opening"),
            State::Closing => write!(f, "closing"),
        }
    }
}

/// Outcome of a single admission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Decision {
    /// The call may proceed. The caller must follow with exactly one
    /// [`Nozzle::report`].
    Admit,
    /// The call is throttled by the current flow rate.
    Throttled,
    /// The nozzle has shut down; nothing is admitted anymore.
    Closed,
}

/// An immutable, by-value observation of a nozzle directly after a tick
/// adjusted it, handed to the observer configured through
/// [`builder::Builder::on_state_change`].
///
/// All fields describe the same instant: the rates and counters belong to
/// the just-finished interval, the flow rate and state are the
/// post-adjustment values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateSnapshot {
    /// Percent of calls admitted after the adjustment.
    pub flow_rate: u8,
    /// Direction of the adjustment.
    pub state: State,
    /// Failure percent observed over the just-finished interval.
    pub failure_rate: u8,
    /// Success percent observed over the just-finished interval.
    pub success_rate: u8,
    /// Admission decisions that let a call through during the interval.
    pub allowed: u64,
    /// Admission decisions that denied a call during the interval.
    pub denied: u64,
    /// Wall-clock moment of the adjustment.
    pub timestamp: SystemTime,
}

#[async_trait]
/// Time source for a nozzle's control loop.
///
/// One tick is one microsecond. The default [`RealClock`] measures real
/// elapsed time; substituting a clock through
/// [`builder::Builder::with_clock`] lets tests drive the loop
/// deterministically.
pub trait Clock {
    /// Ticks elapsed since the clock was created.
    fn ticks_elapsed(&self) -> u64;
    /// Wait for `ticks` worth of time.
    async fn wait(&self, ticks: u64);
}

#[derive(Debug, Clone, Copy)]
/// A clock that operates with respect to real time.
pub struct RealClock {
    start: Instant,
}

impl Default for RealClock {
    fn default() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

#[async_trait]
impl Clock for RealClock {
    /// Return the number of ticks since this clock was created.
    ///
    /// # Panics
    ///
    /// Panics if more microseconds elapsed than fit in a `u64`, several
    /// hundred thousand years after construction.
    #[allow(clippy::cast_possible_truncation)]
    fn ticks_elapsed(&self) -> u64 {
        let ticks_since: u128 = self.start.elapsed().as_micros();
        assert!(
            ticks_since <= u128::from(u64::MAX),
            "clock elapsed beyond u64 microseconds"
        );
        ticks_since as u64
    }

    async fn wait(&self, ticks: u64) {
        time::sleep(Duration::from_micros(ticks)).await;
    }
}

/// The adaptive flow-control primitive.
///
/// A nozzle starts fully open with no recorded errors and is safe for use
/// from many tasks at once. Admission ([`Nozzle::admit`]) and outcome
/// reporting ([`Nozzle::report`]) take the internal lock briefly and never
/// suspend; the [`Nozzle::run`] wrappers combine the two around an async
/// call.
///
/// Dropping a nozzle closes it, so the control-loop task cannot outlive the
/// last handle. An application that installs an observer must not reach the
/// nozzle back through that observer; see
/// [`builder::Builder::on_state_change`].
pub struct Nozzle {
    inner: Arc<Inner>,
    /// Consumed by the first shutdown; later calls find the slot empty.
    shutdown: Mutex<Option<nozzle_signal::Broadcaster>>,
}

/// State shared between the handle and the control-loop task.
struct Inner {
    valve: RwLock<Valve>,
    /// Woken after each completed tick; see [`Nozzle::wait`].
    tick_done: Notify,
    on_state_change: Option<StateChangeFn>,
    /// Cancelled at shutdown; handed to the observer on each invocation.
    cancel: CancellationToken,
}

impl Nozzle {
    /// Create a nozzle with `config`, no observer and the real clock, and
    /// start its control loop.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInterval`] if the interval is shorter than
    /// one microsecond and [`Error::InvalidFailurePercent`] if the ceiling
    /// exceeds 100. No background task is started when validation fails.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn new(config: Config) -> Result<Self, Error> {
        Self::builder(config).build()
    }

    /// Begin building a nozzle, to attach an observer or substitute the
    /// clock.
    pub fn builder(config: Config) -> builder::Builder {
        builder::Builder::new(config)
    }

    pub(crate) fn start<C>(
        config: Config,
        interval_ticks: u64,
        on_state_change: Option<StateChangeFn>,
        clock: C,
    ) -> Self
    where
        C: Clock + Send + Sync + 'static,
    {
        let inner = Arc::new(Inner {
            valve: RwLock::new(Valve::new(interval_ticks, config.allowed_failure_percent)),
            tick_done: Notify::new(),
            on_state_change,
            cancel: CancellationToken::new(),
        });

        let (watcher, broadcaster) = nozzle_signal::pair();
        tokio::spawn(run_control_loop(
            Arc::clone(&inner),
            clock,
            interval_ticks,
            watcher,
        ));

        Self {
            inner,
            shutdown: Mutex::new(Some(broadcaster)),
        }
    }

    /// Decide whether a single call may proceed.
    ///
    /// The rule is deterministic, not probabilistic: within an interval
    /// calls are admitted until the admitted share of decisions reaches the
    /// flow rate, so the first call of a fresh interval is admitted
    /// whenever the flow rate is nonzero. [`Decision::Admit`] must be
    /// followed by exactly one [`Nozzle::report`] for the statistics to
    /// mean anything.
    pub fn admit(&self) -> Decision {
        self.write_valve().admit()
    }

    /// Record the outcome of a previously admitted call. Must only be
    /// called for calls that [`Nozzle::admit`] let through.
    pub fn report(&self, success: bool) {
        self.write_valve().report(success);
    }

    /// Run `call` under flow control.
    ///
    /// Admission and outcome reporting are paired automatically: a denied
    /// call returns [`RunError::Blocked`] or [`RunError::Closed`] without
    /// touching the downstream, an admitted call is awaited and its result
    /// reported.
    ///
    /// # Errors
    ///
    /// [`RunError::Blocked`], [`RunError::Closed`], or
    /// [`RunError::Upstream`] carrying the call's own error.
    pub async fn run<F, Fut, T, E>(&self, call: F) -> Result<T, RunError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match self.admit() {
            Decision::Closed => Err(RunError::Closed),
            Decision::Throttled => Err(RunError::Blocked),
            Decision::Admit => match call().await {
                Ok(value) => {
                    self.report(true);
                    Ok(value)
                }
                Err(err) => {
                    self.report(false);
                    Err(RunError::Upstream(err))
                }
            },
        }
    }

    /// Run `call` under flow control, honoring a caller cancellation token.
    ///
    /// A token that has already fired denies the call before admission and
    /// leaves the counters untouched. A token that fires while the admitted
    /// call is in flight abandons it, reports the call as a failure and
    /// surfaces [`RunError::Cancelled`].
    ///
    /// # Errors
    ///
    /// As [`Nozzle::run`], plus [`RunError::Cancelled`].
    pub async fn run_with_token<F, Fut, T, E>(
        &self,
        token: &CancellationToken,
        call: F,
    ) -> Result<T, RunError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if token.is_cancelled() {
            return Err(RunError::Cancelled);
        }

        match self.admit() {
            Decision::Closed => Err(RunError::Closed),
            Decision::Throttled => Err(RunError::Blocked),
            Decision::Admit => {
                tokio::select! {
                    biased;
                    result = call() => match result {
                        Ok(value) => {
                            self.report(true);
                            Ok(value)
                        }
                        Err(err) => {
                            self.report(false);
                            Err(RunError::Upstream(err))
                        }
                    },
                    () = token.cancelled() => {
                        self.report(false);
                        Err(RunError::Cancelled)
                    }
                }
            }
        }
    }

    /// Current flow rate in percent.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn flow_rate(&self) -> u8 {
        self.read_valve().flow_rate() as u8
    }

    /// Failure percent of the interval so far. Zero while fully closed or
    /// while no outcomes have been reported.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn failure_rate(&self) -> u8 {
        self.read_valve().observed_failure_rate() as u8
    }

    /// Success percent of the interval so far. Zero while fully closed, one
    /// hundred while no outcomes have been reported.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn success_rate(&self) -> u8 {
        self.read_valve().observed_success_rate() as u8
    }

    /// Direction of the most recent adjustment.
    #[must_use]
    pub fn state(&self) -> State {
        self.read_valve().state()
    }

    /// Shut the nozzle down.
    ///
    /// Idempotent and safe from concurrent callers. After this returns,
    /// [`Nozzle::admit`] yields [`Decision::Closed`], the observer token is
    /// cancelled and no further observer invocation happens; the control
    /// loop exits on its own shortly after. Use [`Nozzle::close_and_wait`]
    /// to block until it has.
    pub fn close(&self) {
        self.begin_close();
        if let Some(broadcaster) = self.take_broadcaster() {
            broadcaster.signal();
        }
    }

    /// Shut the nozzle down and wait for the control-loop task to drain.
    ///
    /// The first caller performs the wait; concurrent or repeated callers
    /// return immediately. An observer invocation already in flight is
    /// allowed to finish, it is never interrupted mid-call.
    pub async fn close_and_wait(&self) {
        self.begin_close();
        if let Some(broadcaster) = self.take_broadcaster() {
            broadcaster.signal_and_wait().await;
        }
    }

    /// Block until the next control-loop tick has completed its
    /// adjustment.
    ///
    /// A synchronization hook for tests, not production code. The signal is
    /// delivered to waiters present at the tick and dropped otherwise; with
    /// several simultaneous waiters at least one wakes per tick. After
    /// shutdown no further ticks complete and this never returns.
    pub async fn wait(&self) {
        self.inner.tick_done.notified().await;
    }

    fn begin_close(&self) {
        self.write_valve().mark_closed();
        self.inner.cancel.cancel();
    }

    fn take_broadcaster(&self) -> Option<nozzle_signal::Broadcaster> {
        self.shutdown
            .lock()
            .expect("shutdown slot lock poisoned")
            .take()
    }

    fn read_valve(&self) -> RwLockReadGuard<'_, Valve> {
        self.inner.valve.read().expect("nozzle state lock poisoned")
    }

    fn write_valve(&self) -> RwLockWriteGuard<'_, Valve> {
        self.inner
            .valve
            .write()
            .expect("nozzle state lock poisoned")
    }
}

impl fmt::Debug for Nozzle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Nozzle").finish_non_exhaustive()
    }
}

impl Drop for Nozzle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Tick until told to shut down.
async fn run_control_loop<C>(
    inner: Arc<Inner>,
    clock: C,
    interval_ticks: u64,
    shutdown: nozzle_signal::Watcher,
) where
    C: Clock + Send + Sync,
{
    let shutdown_wait = shutdown.recv();
    tokio::pin!(shutdown_wait);
    loop {
        tokio::select! {
            () = clock.wait(interval_ticks) => {
                inner.advance(clock.ticks_elapsed());
            }
            () = &mut shutdown_wait => {
                debug!("shutdown signal received");
                return;
            }
        }
    }
}

impl Inner {
    /// Process one tick: adjust the valve, deliver a snapshot when
    /// something changed, wake any waiter.
    fn advance(&self, ticks_elapsed: u64) {
        let outcome = {
            let mut valve = self.valve.write().expect("nozzle state lock poisoned");
            if valve.is_closed() {
                // Shutdown raced this tick; the loop exits on its next
                // select. Nothing may be adjusted or observed past close.
                return;
            }

            let outcome = valve.tick(ticks_elapsed);
            if let Tick::Changed(change) = outcome {
                debug!(
                    flow_rate = change.flow_rate,
                    state = %change.state,
                    "flow rate adjusted"
                );
                self.notify(&change);
            }
            outcome
        };

        if outcome != Tick::Premature {
            self.tick_done.notify_waiters();
        }
    }

    /// Build the snapshot and invoke the observer, still under the write
    /// lock. Observer panics are isolated here so a faulty observer cannot
    /// take the control loop down with it.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn notify(&self, change: &valve::Change) {
        let Some(callback) = &self.on_state_change else {
            return;
        };

        let snapshot = StateSnapshot {
            flow_rate: change.flow_rate as u8,
            state: change.state,
            failure_rate: change.failure_rate as u8,
            success_rate: change.success_rate as u8,
            allowed: change.allowed,
            denied: change.denied,
            timestamp: SystemTime::now(),
        };

        if panic::catch_unwind(AssertUnwindSafe(|| callback(&self.cancel, snapshot))).is_err() {
            warn!("state change observer panicked; fault isolated");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, State};
    use std::time::Duration;

    #[test]
    fn state_displays_lowercase() {
        assert_eq!(State::Opening.to_string(), "opening");
        assert_eq!(State::Closing.to_string(), "closing");
    }

    #[test]
    fn config_round_trips_through_serde() {
        let config = Config {
            interval: Duration::from_millis(250),
            allowed_failure_percent: 25,
        };

        let encoded = serde_json::to_string(&config).expect("config serializes");
        let decoded: Config = serde_json::from_str(&encoded).expect("config deserializes");
        assert_eq!(decoded, config);
    }
}
