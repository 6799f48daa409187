//! The synchronous interior of a nozzle.
//!
//! Every piece of state the admission gate and the control loop mutate
//! lives here, in plain synchronous code about which we can make proof
//! claims. The async shell in the crate root owns the lock and the clock;
//! the valve only ever sees the tick counts its caller hands it.

use crate::{Decision, State};

/// Largest magnitude `change_by` may reach. The step doubles on every
/// consecutive same-direction tick and must stay far from `i64` overflow no
/// matter how long a nozzle runs; one billion is reached after roughly
/// thirty doublings and is already vastly larger than the 0..=100 rate it
/// adjusts.
pub(crate) const MAX_STEP: i64 = 1_000_000_000;

/// Clamp a flow rate into the valid percent range.
pub(crate) fn clamp_rate(rate: i64) -> i64 {
    rate.clamp(0, 100)
}

/// Double an adjustment step, saturating at the `i64` extremes and capping
/// the magnitude at [`MAX_STEP`].
pub(crate) fn double_step(step: i64) -> i64 {
    step.saturating_mul(2).clamp(-MAX_STEP, MAX_STEP)
}

/// Outcome of a single control-loop tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tick {
    /// The interval had not fully elapsed; nothing was touched.
    Premature,
    /// The interval elapsed and the counters were reset, but neither the
    /// flow rate nor the direction moved.
    Unchanged,
    /// The flow rate or the direction moved.
    Changed(Change),
}

/// Post-adjustment values for the just-finished interval, captured before
/// the per-interval counters reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Change {
    pub(crate) flow_rate: i64,
    pub(crate) state: State,
    pub(crate) failure_rate: i64,
    pub(crate) success_rate: i64,
    pub(crate) allowed: u64,
    pub(crate) denied: u64,
}

#[derive(Debug)]
pub(crate) struct Valve {
    /// Percent of calls admitted, always in `[0, 100]`.
    flow_rate: i64,
    /// Signed step applied on the next adjustment. Negative while closing,
    /// positive while opening, doubling while the direction holds.
    change_by: i64,
    /// Direction of the most recent adjustment.
    state: State,
    /// Ticks per interval.
    interval_ticks: u64,
    /// Failure percent above which the valve narrows instead of widening.
    allowed_failure_percent: i64,
    /// Tick count at which the current interval began.
    interval_start: u64,
    /// Admissions granted this interval.
    allowed: u64,
    /// Admissions denied this interval.
    denied: u64,
    /// Successful outcomes reported this interval.
    successes: u64,
    /// Failed outcomes reported this interval.
    failures: u64,
    /// Set once the nozzle shuts down; admission fails closed from then on.
    closed: bool,
}

impl Valve {
    pub(crate) fn new(interval_ticks: u64, allowed_failure_percent: u8) -> Self {
        Self {
            flow_rate: 100,
            change_by: 0,
            state: State::Opening,
            interval_ticks,
            allowed_failure_percent: i64::from(allowed_failure_percent),
            interval_start: 0,
            allowed: 0,
            denied: 0,
            successes: 0,
            failures: 0,
            closed: false,
        }
    }

    /// Decide whether one call may proceed, recording the decision.
    ///
    /// Deterministic: calls are admitted until the admitted share of this
    /// interval's decisions reaches the flow rate. The first decision of an
    /// interval sees a zero ratio, so any nonzero flow rate admits it.
    pub(crate) fn admit(&mut self) -> Decision {
        if self.closed {
            return Decision::Closed;
        }

        let allow = match self.flow_rate {
            100 => true,
            0 => false,
            rate => self.admit_ratio() < rate,
        };

        if allow {
            self.allowed += 1;
            Decision::Admit
        } else {
            self.denied += 1;
            Decision::Throttled
        }
    }

    /// Record the outcome of a previously admitted call.
    pub(crate) fn report(&mut self, success: bool) {
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
    }

    /// Advance the control loop by one tick at `ticks_elapsed`.
    ///
    /// Compares the interval's failure rate against the ceiling, moves the
    /// flow rate, resets the per-interval counters and rolls the interval
    /// forward. Ticks that arrive before a full interval has elapsed are
    /// ignored.
    pub(crate) fn tick(&mut self, ticks_elapsed: u64) -> Tick {
        if ticks_elapsed.saturating_sub(self.interval_start) < self.interval_ticks {
            return Tick::Premature;
        }

        let prior_rate = self.flow_rate;
        let prior_state = self.state;

        if self.failure_rate() > self.allowed_failure_percent {
            self.close();
            self.state = State::Closing;
        } else {
            self.open();
            self.state = State::Opening;
        }

        let tick = if self.flow_rate == prior_rate && self.state == prior_state {
            Tick::Unchanged
        } else {
            Tick::Changed(Change {
                flow_rate: self.flow_rate,
                state: self.state,
                failure_rate: self.failure_rate(),
                success_rate: self.success_rate(),
                allowed: self.allowed,
                denied: self.denied,
            })
        };

        self.allowed = 0;
        self.denied = 0;
        self.successes = 0;
        self.failures = 0;
        self.interval_start = ticks_elapsed;

        tick
    }

    /// Narrow admission. At the closed boundary the valve idles: neither
    /// the rate nor the step moves, so the step cannot grow while
    /// saturated.
    fn close(&mut self) {
        if self.flow_rate == 0 {
            return;
        }

        let step = self.change_by.min(-1);
        self.flow_rate = clamp_rate(self.flow_rate + step);
        self.change_by = double_step(step);
    }

    /// Widen admission. Symmetric with [`Valve::close`]: idles at the open
    /// boundary, otherwise forces at least a unit opening step, which also
    /// resets the acceleration on a direction reversal.
    fn open(&mut self) {
        if self.flow_rate == 100 {
            return;
        }

        let step = self.change_by.max(1);
        self.flow_rate = clamp_rate(self.flow_rate + step);
        self.change_by = double_step(step);
    }

    /// Share of this interval's decisions that were admissions, in percent.
    #[allow(clippy::cast_possible_wrap)]
    fn admit_ratio(&self) -> i64 {
        if self.allowed == 0 {
            return 0;
        }

        ((self.allowed * 100) / (self.allowed + self.denied)) as i64
    }

    /// Failure percent of this interval's outcomes, zero when none exist.
    #[allow(clippy::cast_possible_wrap)]
    fn failure_rate(&self) -> i64 {
        if self.failures == 0 && self.successes == 0 {
            return 0;
        }

        ((self.failures * 100) / (self.failures + self.successes)) as i64
    }

    /// Success percent as observers see it: a fully closed valve reports
    /// zero, an interval without outcomes reports one hundred.
    fn success_rate(&self) -> i64 {
        if self.flow_rate == 0 {
            return 0;
        }

        if self.failures == 0 && self.successes == 0 {
            return 100;
        }

        100 - self.failure_rate()
    }

    /// Failure percent as external readers see it: zero while fully closed.
    pub(crate) fn observed_failure_rate(&self) -> i64 {
        if self.flow_rate == 0 {
            return 0;
        }

        self.failure_rate()
    }

    /// Success percent as external readers see it.
    pub(crate) fn observed_success_rate(&self) -> i64 {
        self.success_rate()
    }

    pub(crate) fn flow_rate(&self) -> i64 {
        self.flow_rate
    }

    pub(crate) fn state(&self) -> State {
        self.state
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn mark_closed(&mut self) {
        self.closed = true;
    }
}


#[cfg(kani)]
mod verification {
    use super::{MAX_STEP, Valve, double_step};
    use crate::{Decision, State};

    /// A valve in any state reachable by honest use of the public surface.
    fn any_valve() -> Valve {
        let allowed: u64 = kani::any_where(|a: &u64| *a < 1_000_000);
        let denied: u64 = kani::any_where(|d: &u64| *d < 1_000_000);
        let successes: u64 = kani::any_where(|s: &u64| *s <= allowed);
        let failures: u64 = kani::any_where(|f: &u64| *f <= allowed - successes);

        Valve {
            flow_rate: kani::any_where(|r: &i64| (0..=100).contains(r)),
            change_by: kani::any_where(|c: &i64| *c >= -MAX_STEP && *c <= MAX_STEP),
            state: if kani::any() {
                State::Opening
            } else {
                State::Closing
            },
            interval_ticks: kani::any_where(|t: &u64| *t > 0),
            allowed_failure_percent: kani::any_where(|p: &i64| (0..=100).contains(p)),
            interval_start: 0,
            allowed,
            denied,
            successes,
            failures,
            closed: false,
        }
    }

    /// The flow rate stays within 0..=100 across any single tick.
    #[kani::proof]
    fn tick_preserves_flow_rate_bounds() {
        let mut valve = any_valve();
        let _ = valve.tick(kani::any());
        kani::assert(
            valve.flow_rate >= 0 && valve.flow_rate <= 100,
            "flow rate must stay within 0..=100",
        );
    }

    /// The step magnitude stays within MAX_STEP across any single tick.
    #[kani::proof]
    fn tick_preserves_step_bound() {
        let mut valve = any_valve();
        let _ = valve.tick(kani::any());
        kani::assert(
            valve.change_by >= -MAX_STEP && valve.change_by <= MAX_STEP,
            "step magnitude must stay within MAX_STEP",
        );
    }

    /// Admission followed by a report keeps outcomes bounded by admissions.
    #[kani::proof]
    fn outcome_accounting_preserved() {
        let mut valve = any_valve();
        if valve.admit() == Decision::Admit {
            valve.report(kani::any());
        }
        kani::assert(
            valve.successes + valve.failures <= valve.allowed,
            "only admitted calls may contribute outcomes",
        );
    }

    /// A closed valve denies without touching any counter.
    #[kani::proof]
    fn closed_valve_never_admits() {
        let mut valve = any_valve();
        valve.closed = true;
        let allowed = valve.allowed;
        let denied = valve.denied;

        let decision = valve.admit();

        kani::assert(decision == Decision::Closed, "closed valves fail closed");
        kani::assert(
            valve.allowed == allowed && valve.denied == denied,
            "closed admission must not count",
        );
    }

    /// Boundary idling: at the extremes neither direction moves the step.
    #[kani::proof]
    fn boundaries_idle_the_step() {
        let mut valve = any_valve();
        let step = valve.change_by;

        valve.flow_rate = 0;
        valve.close();
        kani::assert(
            valve.change_by == step && valve.flow_rate == 0,
            "close must idle at the closed boundary",
        );

        valve.flow_rate = 100;
        valve.open();
        kani::assert(
            valve.change_by == step && valve.flow_rate == 100,
            "open must idle at the open boundary",
        );
    }

    /// The doubling helper never exceeds the cap for any input.
    #[kani::proof]
    fn double_step_magnitude_bounded() {
        let step: i64 = kani::any();
        let doubled = double_step(step);
        kani::assert(
            doubled >= -MAX_STEP && doubled <= MAX_STEP,
            "doubled step must stay within MAX_STEP",
        );
    }
}
