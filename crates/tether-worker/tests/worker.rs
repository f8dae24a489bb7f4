//! The worker transport driven end to end through the executor.

use anyhow::Result;
use serde_json::json;
use tether::{Error, ExecOptions, Executor, Progress, SessionState};
use tether_minivm::MiniVm;
use tether_native::NativeBindings;
use tether_worker::Worker;

#[tokio::test]
async fn run_round_trips_through_the_worker_thread() -> Result<()> {
    let worker = Worker::spawn::<MiniVm>()?;
    let mut exec = Executor::new(worker.bindings());

    let done = exec.run("2 * 21", &ExecOptions::default()).await?;
    assert_eq!(done.value, json!(42));
    assert!(done.usage.allocations > 0);

    worker.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn hostcall_pause_and_resume_across_the_channel() -> Result<()> {
    let worker = Worker::spawn::<MiniVm>()?;
    let mut exec = Executor::new(worker.bindings());

    let opts = ExecOptions::default().external_function("fetch");
    let progress = exec.start("r = fetch('u')\nr", &opts).await?;
    let Progress::Pending(call) = progress else {
        panic!("expected a pending call, got {progress:?}");
    };
    assert_eq!(call.function, "fetch");
    assert_eq!(exec.session_state(), SessionState::Active);

    let progress = exec.resume(&json!("body")).await?;
    let Progress::Complete(done) = progress else {
        panic!("expected completion");
    };
    assert_eq!(done.value, json!("body"));

    worker.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn script_errors_keep_their_type_and_traceback() -> Result<()> {
    let worker = Worker::spawn::<MiniVm>()?;
    let mut exec = Executor::new(worker.bindings());

    let err = exec.run("1 / 0", &ExecOptions::default()).await.unwrap_err();
    let script = err.script().expect("script error");
    assert_eq!(script.exc_type, "ZeroDivisionError");
    assert!(!script.traceback.is_empty());

    worker.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn sessions_on_one_worker_are_independent() -> Result<()> {
    let worker = Worker::spawn::<MiniVm>()?;
    let mut first = Executor::new(worker.bindings());
    let mut second = Executor::new(worker.bindings());

    let opts = ExecOptions::default().external_function("fetch");
    first.start("r = fetch('u')\nr", &opts).await?;
    assert_eq!(first.session_state(), SessionState::Active);

    // A paused session does not block the other one.
    let done = second.run("1 + 1", &ExecOptions::default()).await?;
    assert_eq!(done.value, json!(2));

    let progress = first.resume(&json!(7)).await?;
    let Progress::Complete(done) = progress else {
        panic!("expected completion");
    };
    assert_eq!(done.value, json!(7));

    worker.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn snapshot_restores_into_a_worker_session() -> Result<()> {
    // Snapshots are portable between transports of the same build: take
    // one in process, restore it behind the worker.
    let mut native = Executor::new(NativeBindings::<MiniVm>::new());
    native.bindings_mut().prepare("x = 6\nx * 7", Vec::new(), None)?;
    let bytes = native.snapshot().await?;

    let worker = Worker::spawn::<MiniVm>()?;
    let mut exec = Executor::new(worker.bindings());
    exec.restore(&bytes).await?;

    // A restored session can re-export the same program.
    let again = exec.snapshot().await?;
    assert_eq!(again, bytes);

    let done = exec.run("", &ExecOptions::default()).await?;
    assert_eq!(done.value, json!(42));

    worker.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn futures_resolve_across_the_channel() -> Result<()> {
    let worker = Worker::spawn::<MiniVm>()?;
    let mut exec = Executor::new(worker.bindings());

    let opts = ExecOptions::default().external_function("fetch");
    exec.start("a = fetch('x')\nb = fetch('y')\na + b", &opts).await?;
    exec.resume_as_future().await?;
    let progress = exec.resume_as_future().await?;
    let Progress::ResolveFutures(pending) = progress else {
        panic!("expected a block, got {progress:?}");
    };
    assert_eq!(pending.call_ids.len(), 2);

    let progress = exec
        .resolve_futures(
            &[
                (pending.call_ids[0], json!(40)),
                (pending.call_ids[1], json!(2)),
            ],
            &[],
        )
        .await?;
    let Progress::Complete(done) = progress else {
        panic!("expected completion");
    };
    assert_eq!(done.value, json!(42));

    worker.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn calls_after_shutdown_fail_with_a_transport_error() -> Result<()> {
    let worker = Worker::spawn::<MiniVm>()?;
    let mut exec = Executor::new(worker.bindings());
    exec.run("1", &ExecOptions::default()).await?;

    worker.shutdown().await;
    let err = exec.run("2", &ExecOptions::default()).await.unwrap_err();
    assert!(matches!(err, Error::Transport(_)));
    Ok(())
}

#[tokio::test]
async fn shutdown_fails_queued_requests_from_every_session() -> Result<()> {
    let worker = Worker::spawn::<MiniVm>()?;
    let mut first = Executor::new(worker.bindings());
    let mut second = Executor::new(worker.bindings());
    first.run("1", &ExecOptions::default()).await?;
    second.run("1", &ExecOptions::default()).await?;

    // Requests queued behind the shutdown message resolve with transport
    // errors rather than hanging.
    worker.shutdown().await;
    let opts = ExecOptions::default();
    let (a, b) = tokio::join!(first.run("2", &opts), second.run("3", &opts));
    assert!(matches!(a.unwrap_err(), Error::Transport(_)));
    assert!(matches!(b.unwrap_err(), Error::Transport(_)));
    Ok(())
}

#[tokio::test]
async fn dropped_bindings_release_their_session() -> Result<()> {
    let worker = Worker::spawn::<MiniVm>()?;

    // Leave a session paused mid-call and drop its handle without an
    // explicit dispose.
    let mut exec = Executor::new(worker.bindings());
    let opts = ExecOptions::default().external_function("fetch");
    exec.start("r = fetch('u')\nr", &opts).await?;
    drop(exec);

    // The worker keeps serving; the abandoned session does not wedge it.
    let mut other = Executor::new(worker.bindings());
    let done = other.run("5", &ExecOptions::default()).await?;
    assert_eq!(done.value, json!(5));

    worker.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn dispose_releases_the_worker_session() -> Result<()> {
    let worker = Worker::spawn::<MiniVm>()?;
    let mut exec = Executor::new(worker.bindings());
    exec.run("1", &ExecOptions::default()).await?;

    exec.dispose().await;
    exec.dispose().await;
    assert_eq!(exec.session_state(), SessionState::Disposed);

    // The worker itself keeps serving other sessions.
    let mut other = Executor::new(worker.bindings());
    let done = other.run("3", &ExecOptions::default()).await?;
    assert_eq!(done.value, json!(3));

    worker.shutdown().await;
    Ok(())
}
