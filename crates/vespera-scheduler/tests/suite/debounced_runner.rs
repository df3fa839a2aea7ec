use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use vespera_scheduler::{Cancelled, RunnerState, TaskError};

use super::{harness, wait_until, DELAY, RECV_TIMEOUT};

#[test]
fn burst_of_runs_executes_only_the_last() {
    let h = harness();
    let executed = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = crossbeam_channel::unbounded();

    let start = Instant::now();
    for value in 1..=3_u32 {
        let executed = Arc::clone(&executed);
        let tx = tx.clone();
        h.runner.run(
            move |_token| {
                executed.fetch_add(1, Ordering::SeqCst);
                Ok(value)
            },
            move |result| {
                let _ = tx.send(result);
            },
        );
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(h.runner.state(), RunnerState::Pending);

    let delivered = rx.recv_timeout(RECV_TIMEOUT).expect("last run should deliver");
    assert_eq!(delivered, Ok(3));
    // The delay restarts with the last call of the burst.
    assert!(start.elapsed() >= DELAY + Duration::from_millis(40));

    assert!(rx.recv_timeout(DELAY * 2).is_err());
    assert_eq!(executed.load(Ordering::SeqCst), 1);
    assert!(wait_until(RECV_TIMEOUT, || h.runner.state() == RunnerState::Idle));
}

#[test]
fn runs_separated_by_more_than_the_delay_both_deliver_in_order() {
    let h = harness();
    let (tx, rx) = crossbeam_channel::unbounded();

    for value in ["first", "second"] {
        let tx = tx.clone();
        h.runner.run(
            move |_token| Ok(value),
            move |result| {
                let _ = tx.send(result);
            },
        );
        let delivered = rx.recv_timeout(RECV_TIMEOUT).expect("run should deliver");
        assert_eq!(delivered, Ok(value));
    }

    assert!(rx.recv_timeout(DELAY * 2).is_err());
}

#[test]
fn dispose_before_delay_skips_background_work() {
    let h = harness();
    let executed = Arc::new(AtomicBool::new(false));
    let delivered = Arc::new(AtomicBool::new(false));

    let executed_for_task = Arc::clone(&executed);
    let delivered_for_callback = Arc::clone(&delivered);
    let handle = h.runner.run(
        move |_token| {
            executed_for_task.store(true, Ordering::SeqCst);
            Ok(())
        },
        move |_| delivered_for_callback.store(true, Ordering::SeqCst),
    );

    assert!(h.runner.dispose());
    assert!(handle.is_cancelled());
    assert_eq!(h.runner.state(), RunnerState::Disposed);

    std::thread::sleep(DELAY * 3);
    assert!(!executed.load(Ordering::SeqCst));
    assert!(!delivered.load(Ordering::SeqCst));
}

#[test]
fn dispose_while_background_runs_suppresses_delivery() {
    let h = harness();
    let (started_tx, started_rx) = crossbeam_channel::bounded(1);
    let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(1);
    let (finished_tx, finished_rx) = crossbeam_channel::bounded(1);
    let (delivered_tx, delivered_rx) = crossbeam_channel::unbounded();

    h.runner.run(
        move |token| {
            let _ = started_tx.send(());
            let _ = release_rx.recv_timeout(RECV_TIMEOUT);
            let _ = finished_tx.send(token.is_cancelled());
            Ok(7)
        },
        move |result| {
            let _ = delivered_tx.send(result);
        },
    );

    started_rx
        .recv_timeout(RECV_TIMEOUT)
        .expect("background task should start");
    assert!(h.runner.dispose());
    release_tx.send(()).unwrap();

    // In-flight work is not interrupted, only told about the cancellation.
    let saw_cancel = finished_rx
        .recv_timeout(RECV_TIMEOUT)
        .expect("background task should finish");
    assert!(saw_cancel);
    assert!(delivered_rx.recv_timeout(DELAY * 2).is_err());
}

#[test]
fn dispose_waits_for_delivery_in_progress() {
    let h = harness();
    let (entered_tx, entered_rx) = crossbeam_channel::bounded(1);
    let callback_done = Arc::new(AtomicBool::new(false));
    let (late_tx, late_rx) = crossbeam_channel::unbounded();

    let done_for_callback = Arc::clone(&callback_done);
    h.runner.run(
        |_token| Ok(()),
        move |_| {
            let _ = entered_tx.send(());
            std::thread::sleep(Duration::from_millis(300));
            done_for_callback.store(true, Ordering::SeqCst);
        },
    );

    entered_rx
        .recv_timeout(RECV_TIMEOUT)
        .expect("callback should start");
    let start = Instant::now();
    assert!(h.runner.dispose());
    assert!(callback_done.load(Ordering::SeqCst));
    assert!(start.elapsed() >= Duration::from_millis(100));

    // Nothing is delivered once `dispose()` has returned.
    h.runner.run(
        |_token| Ok(()),
        move |result| {
            let _ = late_tx.send(result);
        },
    );
    assert!(late_rx.recv_timeout(DELAY * 2).is_err());
}

#[test]
fn superseded_in_flight_result_is_dropped() {
    let h = harness();
    let (started_tx, started_rx) = crossbeam_channel::bounded(1);
    let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(1);
    let (finished_tx, finished_rx) = crossbeam_channel::bounded(1);
    let (delivered_tx, delivered_rx) = crossbeam_channel::unbounded();

    let first_tx = delivered_tx.clone();
    h.runner.run(
        move |_token| {
            let _ = started_tx.send(());
            let _ = release_rx.recv_timeout(RECV_TIMEOUT);
            let _ = finished_tx.send(());
            Ok("stale")
        },
        move |result| {
            let _ = first_tx.send(result);
        },
    );
    started_rx
        .recv_timeout(RECV_TIMEOUT)
        .expect("first task should start");

    h.runner.run(
        |_token| Ok("fresh"),
        move |result| {
            let _ = delivered_tx.send(result);
        },
    );

    assert_eq!(delivered_rx.recv_timeout(RECV_TIMEOUT), Ok(Ok("fresh")));

    release_tx.send(()).unwrap();
    finished_rx
        .recv_timeout(RECV_TIMEOUT)
        .expect("first task should finish");
    assert!(delivered_rx.recv_timeout(DELAY * 2).is_err());
}

#[test]
fn dispose_is_idempotent() {
    let h = harness();
    assert!(h.runner.dispose());
    assert!(!h.runner.dispose());
    assert!(!h.runner.dispose());
    assert!(h.runner.is_disposed());

    // Disposing the owning scope afterwards is harmless as well.
    assert!(h.scope.dispose());
    assert!(!h.scope.dispose());
    assert_eq!(h.runner.state(), RunnerState::Disposed);
}

#[test]
fn deliveries_run_on_the_foreground_thread_without_overlap() {
    let h = harness();
    let in_callback = Arc::new(AtomicBool::new(false));
    let (tx, rx) = crossbeam_channel::unbounded();

    for value in 0..3_u32 {
        let in_callback = Arc::clone(&in_callback);
        let foreground = h.foreground.clone();
        let tx = tx.clone();
        h.runner.run(
            move |_token| Ok(value),
            move |result| {
                let overlapped = in_callback.swap(true, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(30));
                in_callback.store(false, Ordering::SeqCst);
                let _ = tx.send((result, overlapped, foreground.is_foreground_thread()));
            },
        );
        let (result, overlapped, on_foreground) =
            rx.recv_timeout(RECV_TIMEOUT).expect("run should deliver");
        assert_eq!(result, Ok(value));
        assert!(!overlapped);
        assert!(on_foreground);
    }
}

#[test]
fn background_panic_is_delivered_as_failure() {
    let h = harness();
    let (tx, rx) = crossbeam_channel::bounded(1);

    h.runner.run(
        |_token| -> Result<u32, Cancelled> { panic!("toolchain probe crashed") },
        move |result| {
            let _ = tx.send(result);
        },
    );

    let delivered = rx.recv_timeout(RECV_TIMEOUT).expect("failure should deliver");
    assert_eq!(
        delivered,
        Err(TaskError::Panicked("toolchain probe crashed".to_string()))
    );
}

#[test]
fn background_reporting_cancelled_without_cancellation_is_delivered() {
    let h = harness();
    let (tx, rx) = crossbeam_channel::bounded(1);

    h.runner.run(
        |_token| -> Result<(), Cancelled> { Err(Cancelled) },
        move |result| {
            let _ = tx.send(result);
        },
    );

    assert_eq!(rx.recv_timeout(RECV_TIMEOUT), Ok(Err(TaskError::Cancelled)));
}

#[test]
fn cancelling_a_cycle_returns_the_runner_to_idle() {
    let h = harness();
    let executed = Arc::new(AtomicBool::new(false));

    let executed_for_task = Arc::clone(&executed);
    let handle = h.runner.run(
        move |_token| {
            executed_for_task.store(true, Ordering::SeqCst);
            Ok(())
        },
        |_| {},
    );
    handle.cancel();

    assert!(wait_until(RECV_TIMEOUT, || h.runner.state() == RunnerState::Idle));
    std::thread::sleep(DELAY * 2);
    assert!(!executed.load(Ordering::SeqCst));

    // The runner is still usable afterwards.
    let (tx, rx) = crossbeam_channel::bounded(1);
    h.runner.run(
        |_token| Ok(1),
        move |result| {
            let _ = tx.send(result);
        },
    );
    assert_eq!(rx.recv_timeout(RECV_TIMEOUT), Ok(Ok(1)));
}

#[test]
fn runner_cancel_drops_pending_cycle() {
    let h = harness();
    let (tx, rx) = crossbeam_channel::bounded(1);

    h.runner.run(
        |_token| Ok(()),
        move |result| {
            let _ = tx.send(result);
        },
    );
    assert!(h.runner.cancel());
    assert!(!h.runner.cancel());
    assert_eq!(h.runner.state(), RunnerState::Idle);
    assert!(rx.recv_timeout(DELAY * 3).is_err());
}

#[test]
fn callback_can_reschedule_and_dispose_without_deadlock() {
    let h = harness();
    let (tx, rx) = crossbeam_channel::unbounded();

    let runner = h.runner.clone();
    let tx_outer = tx.clone();
    h.runner.run(
        |_token| Ok("outer"),
        move |result| {
            let _ = tx_outer.send(result);
            let inner_runner = runner.clone();
            runner.run(
                |_token| Ok("inner"),
                move |result| {
                    let _ = tx.send(result);
                    inner_runner.dispose();
                },
            );
        },
    );

    assert_eq!(rx.recv_timeout(RECV_TIMEOUT), Ok(Ok("outer")));
    assert_eq!(rx.recv_timeout(RECV_TIMEOUT), Ok(Ok("inner")));
    assert!(wait_until(RECV_TIMEOUT, || h.runner.is_disposed()));
}

#[test]
fn shut_down_foreground_drops_results() {
    let h = harness();
    let executed = Arc::new(AtomicBool::new(false));
    let (tx, rx) = crossbeam_channel::bounded(1);

    h.foreground.shutdown();
    let executed_for_task = Arc::clone(&executed);
    h.runner.run(
        move |_token| {
            executed_for_task.store(true, Ordering::SeqCst);
            Ok(())
        },
        move |result| {
            let _ = tx.send(result);
        },
    );

    assert!(wait_until(RECV_TIMEOUT, || executed.load(Ordering::SeqCst)));
    assert!(wait_until(RECV_TIMEOUT, || h.runner.state() == RunnerState::Idle));
    assert!(rx.recv_timeout(DELAY).is_err());
}
