use std::sync::Arc;
use std::time::Duration;

use crate::support::{
    helpers::{fast_queue_options, init_tracing, test_config, wait_until},
    recording_queue::RecordingQueue,
};
use anyhow::{Context, Result};
use protoqueue::{job_fn, Message, Runner};
use tokio::time::timeout;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn runner_stops_when_token_is_cancelled() -> Result<()> {
    init_tracing();
    let queue = Arc::new(RecordingQueue::new(fast_queue_options()));
    for idx in 0..4 {
        queue.send(&format!("payload-{idx}"));
    }
    let job = job_fn(|_message: Message| async move { Ok(()) });

    let mut runner = Runner::new(test_config(4, Duration::from_secs(5)), queue.clone(), job);
    let token = runner.cancellation_token();
    let watched = queue.clone();
    tokio::spawn(async move {
        let _ = wait_until("queue to drain", Duration::from_secs(5), || {
            watched.queue().is_empty()
        })
        .await;
        token.cancel();
    });

    timeout(Duration::from_secs(10), runner.run_until_signal())
        .await
        .context("runner should stop after cancellation")??;

    assert!(queue.queue().is_empty());
    assert!(!runner.consumer().is_running());
    assert!(
        !runner.cancellation_token().is_cancelled(),
        "a fresh token is installed after stop"
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn runner_can_restart_after_stop() -> Result<()> {
    init_tracing();
    let queue = Arc::new(RecordingQueue::new(fast_queue_options()));
    let job = job_fn(|_message: Message| async move { Ok(()) });
    let mut runner = Runner::new(test_config(1, Duration::from_secs(5)), queue.clone(), job);

    runner.start().await?;
    runner.stop().await?;

    queue.send("after restart");
    runner.start().await?;
    wait_until("message after restart to be deleted", Duration::from_secs(5), || {
        queue.queue().is_empty()
    })
    .await?;
    runner.stop().await?;
    assert_eq!(queue.deleted_ids().len(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn runner_exits_on_fetch_failure() -> Result<()> {
    init_tracing();
    let queue = Arc::new(RecordingQueue::new(fast_queue_options()));
    queue.fail_fetches();
    let job = job_fn(|_message: Message| async move { Ok(()) });

    let mut runner = Runner::new(test_config(2, Duration::from_secs(5)), queue.clone(), job);
    let outcome = timeout(Duration::from_secs(5), runner.run_until_signal())
        .await
        .context("runner should stop after fetch failure")?;

    let err = outcome.expect_err("fetch failure should abort runner");
    let message = format!("{err:#}");
    assert!(
        message.contains("queue consumer pipeline aborted"),
        "runner did not propagate fetch failure, got {message}"
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn runner_restarts_after_fetch_failure() -> Result<()> {
    init_tracing();
    let queue = Arc::new(RecordingQueue::new(fast_queue_options()));
    queue.fail_fetches();
    let job = job_fn(|_message: Message| async move { Ok(()) });
    let mut runner = Runner::new(test_config(1, Duration::from_secs(5)), queue.clone(), job);

    let first = timeout(Duration::from_secs(5), runner.run_until_signal())
        .await
        .context("runner should stop after fetch failure")?;
    assert!(first.is_err());
    assert!(!runner.cancellation_token().is_cancelled());

    queue.restore_fetches();
    queue.send("after outage");
    runner.start().await?;
    assert!(runner.consumer().is_running());
    wait_until("message after outage to be deleted", Duration::from_secs(5), || {
        queue.queue().is_empty()
    })
    .await?;
    runner.stop().await?;
    Ok(())
}
