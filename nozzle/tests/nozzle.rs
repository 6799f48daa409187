//! End-to-end behavior of the nozzle public surface.
//!
//! Timing-sensitive tests run under tokio's paused clock so every interval
//! is deterministic; `Nozzle::wait` synchronizes each assertion with the
//! tick that produced it.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicU32, Ordering},
};
use std::time::Duration;

use nozzle::{Config, Decision, Nozzle, RunError, State};
use tokio_util::sync::CancellationToken;

fn config(interval: Duration, allowed_failure_percent: u8) -> Config {
    Config {
        interval,
        allowed_failure_percent,
    }
}

/// One interval of traffic: `attempts` calls, every admitted one reported
/// with `outcome`, then wait for the tick that consumes them.
async fn drive_interval(nozzle: &Nozzle, attempts: u32, outcome: bool) {
    for _ in 0..attempts {
        if nozzle.admit() == Decision::Admit {
            nozzle.report(outcome);
        }
    }
    nozzle.wait().await;
}

#[tokio::test]
async fn starts_fully_open() {
    let nozzle = Nozzle::new(config(Duration::from_secs(1), 50)).expect("valid config");

    assert_eq!(nozzle.flow_rate(), 100);
    assert_eq!(nozzle.success_rate(), 100);
    assert_eq!(nozzle.failure_rate(), 0);
    assert_eq!(nozzle.state(), State::Opening);

    nozzle.close();
}

#[tokio::test(start_paused = true)]
async fn sustained_failure_narrows_then_recovers() {
    let nozzle = Nozzle::new(config(Duration::from_millis(50), 10)).expect("valid config");

    for want in [99, 97, 93, 85, 69, 37, 0] {
        drive_interval(&nozzle, 10, false).await;
        assert_eq!(nozzle.flow_rate(), want);
        assert_eq!(nozzle.state(), State::Closing);
    }

    // Fully closed, nothing is admitted, so intervals pass without
    // failures and the nozzle probes its way back open.
    for want in [1, 3, 7, 15, 31, 63, 100] {
        drive_interval(&nozzle, 10, true).await;
        assert_eq!(nozzle.flow_rate(), want);
        assert_eq!(nozzle.state(), State::Opening);
    }

    nozzle.close();
}

#[tokio::test(start_paused = true)]
async fn fresh_interval_admits_first_call_at_partial_flow() {
    let nozzle = Nozzle::new(config(Duration::from_millis(50), 10)).expect("valid config");

    drive_interval(&nozzle, 10, false).await;
    assert_eq!(nozzle.flow_rate(), 99);

    assert_eq!(nozzle.admit(), Decision::Admit);
    nozzle.report(true);

    nozzle.close();
}

#[tokio::test]
async fn close_is_idempotent_and_fails_closed() {
    let nozzle = Nozzle::new(config(Duration::from_millis(10), 50)).expect("valid config");

    for _ in 0..5 {
        nozzle.close();
    }

    for _ in 0..100 {
        assert_eq!(nozzle.admit(), Decision::Closed);
    }
}

#[tokio::test]
async fn concurrent_close_is_safe() {
    let nozzle = Arc::new(Nozzle::new(config(Duration::from_millis(10), 50)).expect("valid config"));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let nozzle = Arc::clone(&nozzle);
        handles.push(tokio::spawn(async move {
            nozzle.close();
        }));
    }
    for handle in handles {
        handle.await.expect("close task failed");
    }

    assert_eq!(nozzle.admit(), Decision::Closed);
}

#[tokio::test]
async fn shutdown_drains_all_control_loops() {
    let mut nozzles = Vec::new();
    for _ in 0..10 {
        nozzles.push(Nozzle::new(config(Duration::from_millis(5), 50)).expect("valid config"));
    }

    // Let every loop do some work before tearing it down.
    for nozzle in &nozzles {
        nozzle.wait().await;
    }

    for nozzle in &nozzles {
        tokio::time::timeout(Duration::from_secs(5), nozzle.close_and_wait())
            .await
            .expect("control loop failed to drain");
    }
}

#[tokio::test(start_paused = true)]
async fn wait_returns_once_per_tick() {
    let nozzle = Nozzle::new(config(Duration::from_millis(20), 50)).expect("valid config");

    for _ in 0..3 {
        nozzle.wait().await;
    }

    nozzle.close();
}

#[tokio::test(start_paused = true)]
async fn observer_receives_post_adjustment_snapshots() {
    let snapshots = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&snapshots);

    let nozzle = Nozzle::builder(config(Duration::from_millis(50), 10))
        .on_state_change(move |_token, snapshot| {
            sink.lock().expect("snapshot lock").push(snapshot);
        })
        .build()
        .expect("valid config");

    drive_interval(&nozzle, 10, false).await;
    {
        let snapshots = snapshots.lock().expect("snapshot lock");
        assert_eq!(snapshots.len(), 1);
        let first = snapshots[0];
        assert_eq!(first.flow_rate, 99);
        assert_eq!(first.state, State::Closing);
        assert_eq!(first.failure_rate, 100);
        assert_eq!(first.success_rate, 0);
        assert_eq!(first.allowed, 10);
        assert_eq!(first.denied, 0);
    }

    drive_interval(&nozzle, 10, false).await;
    {
        let snapshots = snapshots.lock().expect("snapshot lock");
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[1].flow_rate, 97);
        assert!(snapshots[1].timestamp >= snapshots[0].timestamp);
    }

    nozzle.close();
}

#[tokio::test(start_paused = true)]
async fn healthy_full_open_nozzle_emits_nothing() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);

    let nozzle = Nozzle::builder(config(Duration::from_millis(50), 50))
        .on_state_change(move |_token, _snapshot| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .expect("valid config");

    for _ in 0..5 {
        drive_interval(&nozzle, 10, true).await;
    }

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(nozzle.flow_rate(), 100);
    assert_eq!(nozzle.state(), State::Opening);

    nozzle.close();
}

#[tokio::test(start_paused = true)]
async fn observer_panic_is_isolated() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);

    let nozzle = Nozzle::builder(config(Duration::from_millis(50), 10))
        .on_state_change(move |_token, _snapshot| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("observer fault");
            }
        })
        .build()
        .expect("valid config");

    drive_interval(&nozzle, 10, false).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(nozzle.flow_rate(), 99);

    // The loop survived the panic: it keeps adjusting and keeps calling
    // the observer.
    drive_interval(&nozzle, 10, false).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(nozzle.flow_rate(), 97);

    nozzle.close();
}

#[tokio::test(start_paused = true)]
async fn no_observer_invocation_after_close() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);

    let nozzle = Nozzle::builder(config(Duration::from_millis(50), 10))
        .on_state_change(move |_token, _snapshot| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .expect("valid config");

    drive_interval(&nozzle, 10, false).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Failures are pending in the current interval when close lands; any
    // racing tick must observe the closed flag and stay silent.
    for _ in 0..10 {
        if nozzle.admit() == Decision::Admit {
            nozzle.report(false);
        }
    }
    nozzle.close_and_wait().await;

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn observer_token_is_cancelled_on_close() {
    let tokens = Arc::new(Mutex::new(Vec::<CancellationToken>::new()));
    let sink = Arc::clone(&tokens);

    let nozzle = Nozzle::builder(config(Duration::from_millis(50), 10))
        .on_state_change(move |token, _snapshot| {
            sink.lock().expect("token lock").push(token.clone());
        })
        .build()
        .expect("valid config");

    drive_interval(&nozzle, 10, false).await;
    let token = tokens
        .lock()
        .expect("token lock")
        .first()
        .cloned()
        .expect("observer ran");
    assert!(!token.is_cancelled());

    nozzle.close();
    assert!(token.is_cancelled());
}

#[tokio::test]
async fn run_reports_success_and_failure() {
    // An interval far longer than the test keeps the counters readable.
    let nozzle = Nozzle::new(config(Duration::from_secs(60), 50)).expect("valid config");

    let value = nozzle
        .run(|| async { Ok::<_, std::io::Error>(7) })
        .await
        .expect("admitted call succeeds");
    assert_eq!(value, 7);
    assert_eq!(nozzle.success_rate(), 100);
    assert_eq!(nozzle.failure_rate(), 0);

    let err = nozzle
        .run(|| async { Err::<u32, _>(std::io::Error::other("downstream down")) })
        .await
        .unwrap_err();
    assert!(matches!(err, RunError::Upstream(_)));
    assert!(err.into_upstream().is_some());
    assert_eq!(nozzle.failure_rate(), 50);

    nozzle.close();
}

#[tokio::test]
async fn run_surfaces_closed_distinctly() {
    let nozzle = Nozzle::new(config(Duration::from_secs(60), 50)).expect("valid config");
    nozzle.close();

    let called = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&called);
    let result = nozzle
        .run(|| async move {
            flag.store(true, Ordering::SeqCst);
            Ok::<_, std::io::Error>(1)
        })
        .await;

    assert!(matches!(result, Err(RunError::Closed)));
    assert!(!called.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn run_surfaces_throttling_distinctly() {
    let nozzle = Nozzle::new(config(Duration::from_millis(50), 10)).expect("valid config");

    for _ in 0..7 {
        drive_interval(&nozzle, 10, false).await;
    }
    assert_eq!(nozzle.flow_rate(), 0);

    let called = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&called);
    let result = nozzle
        .run(|| async move {
            flag.store(true, Ordering::SeqCst);
            Ok::<_, std::io::Error>(1)
        })
        .await;

    assert!(matches!(result, Err(RunError::Blocked)));
    assert!(!called.load(Ordering::SeqCst));

    nozzle.close();
}

#[tokio::test]
async fn pre_cancelled_token_skips_admission() {
    let nozzle = Nozzle::new(config(Duration::from_secs(60), 50)).expect("valid config");
    let token = CancellationToken::new();
    token.cancel();

    let called = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&called);
    let result = nozzle
        .run_with_token(&token, || async move {
            flag.store(true, Ordering::SeqCst);
            Ok::<_, std::io::Error>(1)
        })
        .await;

    assert!(matches!(result, Err(RunError::Cancelled)));
    assert!(!called.load(Ordering::SeqCst));
    // The denial consumed no admission slot: the interval still reads as
    // pristine.
    assert_eq!(nozzle.success_rate(), 100);
    assert_eq!(nozzle.failure_rate(), 0);

    nozzle.close();
}

#[tokio::test]
async fn cancellation_mid_call_reports_failure() {
    let nozzle = Nozzle::new(config(Duration::from_secs(60), 50)).expect("valid config");
    let token = CancellationToken::new();

    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
    });

    let result = nozzle
        .run_with_token(&token, || async {
            std::future::pending::<Result<u32, std::io::Error>>().await
        })
        .await;

    assert!(matches!(result, Err(RunError::Cancelled)));
    assert_eq!(nozzle.failure_rate(), 100);

    nozzle.close();
}
