//! Shutdown coordination for a nozzle's control loop.
//!
//! A nozzle spawns exactly one background task -- its control loop -- and
//! must be able to tear it down from the foreground handle, possibly from
//! several callers at once. [`pair`] returns the two ends of that
//! relationship: the handle keeps the [`Broadcaster`], the loop task takes
//! the [`Watcher`].
//!
//! Nothing is ever sent through either channel; both halves work through
//! channel closure. Announcing shutdown drops the signal sender, and the
//! watcher acknowledges by letting go of its ack sender, which happens even
//! when the loop task is torn down without ever polling the signal. That
//! makes [`Broadcaster::signal_and_wait`] safe against a watcher that exits
//! early, with no bookkeeping to get wrong.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::perf)]
#![deny(clippy::suspicious)]
#![deny(clippy::complexity)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![allow(clippy::multiple_crate_versions)]

use tokio::sync::oneshot;
use tracing::debug;

/// Construct a connected [`Watcher`] and [`Broadcaster`] pair.
#[must_use]
pub fn pair() -> (Watcher, Broadcaster) {
    let (signal_tx, signal_rx) = oneshot::channel();
    let (ack_tx, ack_rx) = oneshot::channel();

    let watcher = Watcher {
        signal_rx,
        ack_tx: Some(ack_tx),
        signal_received: false,
    };
    let broadcaster = Broadcaster { signal_tx, ack_rx };

    (watcher, broadcaster)
}

#[derive(Debug)]
/// Announces shutdown to the [`Watcher`] half of a pair.
pub struct Broadcaster {
    /// Dropping this sender is the announcement itself.
    signal_tx: oneshot::Sender<()>,
    /// Resolves once the watcher has acknowledged or is gone.
    ack_rx: oneshot::Receiver<()>,
}

impl Broadcaster {
    /// Announce shutdown without waiting on the watcher.
    pub fn signal(self) {
        drop(self.signal_tx);
    }

    /// Announce shutdown and wait until the watcher is gone.
    ///
    /// Resolves on the watcher's acknowledgement or on its drop, whichever
    /// comes first, so a loop task that never reads the signal cannot wedge
    /// this call.
    pub async fn signal_and_wait(self) {
        drop(self.signal_tx);

        debug!("waiting for watcher acknowledgement");
        // Err means the ack sender was dropped unacknowledged, which is an
        // acknowledgement all the same.
        let _ = self.ack_rx.await;
    }
}

/// Errors for [`Watcher::try_recv`].
#[derive(thiserror::Error, Debug, Clone, Copy)]
pub enum TryRecvError {
    /// An earlier call already consumed the shutdown announcement.
    #[error("shutdown announcement was already consumed")]
    SignalReceived,
}

#[derive(Debug)]
/// Waits on the shutdown announcement from the [`Broadcaster`] half.
pub struct Watcher {
    /// Resolves when the broadcaster announces shutdown.
    signal_rx: oneshot::Receiver<()>,
    /// Held until the announcement is observed; releasing it is the
    /// acknowledgement.
    ack_tx: Option<oneshot::Sender<()>>,
    /// Set once the announcement has been observed.
    signal_received: bool,
}

impl Watcher {
    /// Wait for the shutdown announcement, consuming the watcher.
    ///
    /// Returns immediately if the announcement was already observed through
    /// [`Watcher::try_recv`]. Acknowledges before returning.
    pub async fn recv(mut self) {
        if self.signal_received {
            return;
        }

        // Ok carries the payload that is never sent, Err means the
        // broadcaster dropped its sender: either way the announcement
        // stands.
        let _ = (&mut self.signal_rx).await;
        drop(self.ack_tx.take());
    }

    /// Check for the shutdown announcement without blocking.
    ///
    /// Returns `Ok(false)` while nothing has been announced and `Ok(true)`
    /// the first time the announcement is observed, acknowledging it in the
    /// same step.
    ///
    /// # Errors
    ///
    /// Returns [`TryRecvError::SignalReceived`] on every call after the
    /// announcement has been observed.
    pub fn try_recv(&mut self) -> Result<bool, TryRecvError> {
        if self.signal_received {
            return Err(TryRecvError::SignalReceived);
        }

        match self.signal_rx.try_recv() {
            Ok(()) | Err(oneshot::error::TryRecvError::Closed) => {
                self.signal_received = true;
                self.ack_tx = None;
                Ok(true)
            }
            Err(oneshot::error::TryRecvError::Empty) => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::{TryRecvError, pair};

    #[tokio::test]
    async fn recv_returns_after_signal() {
        let (watcher, broadcaster) = pair();

        broadcaster.signal();
        watcher.recv().await;
    }

    #[tokio::test]
    async fn signal_and_wait_drains_a_listening_watcher() {
        let (watcher, broadcaster) = pair();

        let handle = tokio::spawn(watcher.recv());

        broadcaster.signal_and_wait().await;
        handle.await.expect("watcher task failed");
    }

    #[tokio::test]
    async fn dropped_watcher_unblocks_wait() {
        let (watcher, broadcaster) = pair();

        // The watcher exits without ever reading the signal. The
        // broadcaster must not hang on it.
        drop(watcher);

        tokio::time::timeout(Duration::from_secs(5), broadcaster.signal_and_wait())
            .await
            .expect("signal_and_wait hung on a dropped watcher");
    }

    #[tokio::test]
    async fn try_recv_observes_the_announcement_once() {
        let (mut watcher, broadcaster) = pair();

        assert!(!watcher.try_recv().expect("no announcement yet"));

        broadcaster.signal();

        assert!(watcher.try_recv().expect("announcement pending"));
        assert!(matches!(
            watcher.try_recv(),
            Err(TryRecvError::SignalReceived)
        ));
    }

    #[tokio::test]
    async fn try_recv_acknowledges_for_signal_and_wait() {
        let (mut watcher, broadcaster) = pair();

        let wait = tokio::spawn(broadcaster.signal_and_wait());

        // Poll until the announcement lands, then hold the watcher alive:
        // the try_recv acknowledgement alone must unblock the broadcaster.
        while !watcher.try_recv().expect("announcement pending") {
            tokio::task::yield_now().await;
        }

        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("acknowledgement did not unblock signal_and_wait")
            .expect("wait task failed");

        drop(watcher);
    }

    #[tokio::test]
    async fn recv_after_try_recv_returns_immediately() {
        let (mut watcher, broadcaster) = pair();

        broadcaster.signal();
        assert!(watcher.try_recv().expect("announcement pending"));

        watcher.recv().await;
    }
}
