//! Construction and validation for [`Nozzle`] instances.
//!
//! [`Nozzle::new`] covers the common case; the builder exists to attach the
//! optional state-change observer or to substitute the clock the control
//! loop runs on.

use std::fmt;

use tokio_util::sync::CancellationToken;

use crate::{Clock, Config, Error, Nozzle, RealClock, StateChangeFn, StateSnapshot};

/// Builder for a [`Nozzle`].
pub struct Builder {
    config: Config,
    on_state_change: Option<StateChangeFn>,
}

impl Builder {
    pub(crate) fn new(config: Config) -> Self {
        Self {
            config,
            on_state_change: None,
        }
    }

    /// Attach an observer invoked with a by-value snapshot whenever a tick
    /// changes the flow rate or the direction.
    ///
    /// The observer runs synchronously on the control loop while the
    /// nozzle's lock is held: it must return quickly and must not call back
    /// into the same nozzle. The token it receives is cancelled when the
    /// nozzle shuts down. Panics raised by the observer are caught and
    /// discarded.
    #[must_use]
    pub fn on_state_change<F>(mut self, callback: F) -> Self
    where
        F: Fn(&CancellationToken, StateSnapshot) + Send + Sync + 'static,
    {
        self.on_state_change = Some(Box::new(callback));
        self
    }

    /// Build the nozzle on the real clock and start its control loop.
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
    pub fn build(self) -> Result<Nozzle, Error> {
        self.with_clock(RealClock::default())
    }

    /// Build the nozzle on a caller-supplied [`Clock`].
    ///
    /// # Errors
    ///
    /// See [`Builder::build`].
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn with_clock<C>(self, clock: C) -> Result<Nozzle, Error>
    where
        C: Clock + Send + Sync + 'static,
    {
        let interval_ticks = u64::try_from(self.config.interval.as_micros())
            .map_err(|_| Error::InvalidInterval)?;
        if interval_ticks == 0 {
            return Err(Error::InvalidInterval);
        }
        if self.config.allowed_failure_percent > 100 {
            return Err(Error::InvalidFailurePercent(
                self.config.allowed_failure_percent,
            ));
        }

        Ok(Nozzle::start(
            self.config,
            interval_ticks,
            self.on_state_change,
            clock,
        ))
    }
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("config", &self.config)
            .field("on_state_change", &self.on_state_change.is_some())
            .finish()
    }
}
