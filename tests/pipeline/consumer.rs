use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::support::{
    helpers::{fast_queue_options, init_tracing, test_config, wait_until},
    recording_queue::RecordingQueue,
};
use anyhow::{bail, Result};
use protoqueue::{job_fn, Consumer, MemoryQueueOptions, Message};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lanes_follow_concurrency() -> Result<()> {
    init_tracing();
    let queue = Arc::new(RecordingQueue::new(MemoryQueueOptions {
        wait_time: Duration::from_millis(100),
        ..MemoryQueueOptions::default()
    }));
    let job = job_fn(|_message: Message| async move { Ok(()) });
    let config = test_config(10, Duration::from_secs(5));
    assert_eq!(config.batches(), 2);

    let mut consumer = Consumer::new(config, queue.clone(), job);
    consumer.start().await?;
    wait_until("six fetches", Duration::from_secs(5), || queue.fetch_calls() >= 6).await?;
    consumer.stop().await?;

    assert_eq!(queue.peak_concurrent_fetches(), 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_message_is_not_deleted() -> Result<()> {
    init_tracing();
    let queue = Arc::new(RecordingQueue::new(fast_queue_options()));
    let ids: Vec<String> = (1..=5).map(|idx| queue.send(&idx.to_string())).collect();
    let job = job_fn(|message: Message| async move {
        if message.body() == "3" {
            bail!("message 3 is rejected");
        }
        Ok(())
    });

    let mut consumer = Consumer::new(test_config(10, Duration::from_secs(5)), queue.clone(), job);
    consumer.start().await?;
    wait_until("four deletions", Duration::from_secs(5), || {
        queue.deleted_ids().len() >= 4
    })
    .await?;
    consumer.stop().await?;

    let deleted: HashSet<String> = queue.deleted_ids().into_iter().collect();
    let expected: HashSet<String> = ids
        .iter()
        .enumerate()
        .filter(|(idx, _)| *idx != 2)
        .map(|(_, id)| id.clone())
        .collect();
    assert_eq!(deleted, expected);
    assert!(
        queue
            .delete_calls()
            .iter()
            .any(|call| call.iter().cloned().collect::<HashSet<_>>() == expected),
        "the four successes should be deleted together"
    );
    assert_eq!(queue.queue().len(), 1, "failed message must stay on the queue");

    let snapshot = consumer.telemetry().snapshot();
    assert_eq!(snapshot.jobs_failed, 1);
    assert_eq!(snapshot.deleted_messages, 4);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn batch_timeout_deletes_nothing_from_the_batch() -> Result<()> {
    init_tracing();
    let queue = Arc::new(RecordingQueue::new(fast_queue_options()));
    queue.send("fast");
    queue.send("slow");
    let job = job_fn(|message: Message| async move {
        if message.body() == "slow" {
            sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    });

    let mut consumer = Consumer::new(
        test_config(10, Duration::from_millis(1)),
        queue.clone(),
        job,
    );
    let telemetry = consumer.telemetry();
    consumer.start().await?;
    wait_until("a batch timeout", Duration::from_secs(5), || {
        telemetry.snapshot().batch_timeouts >= 1
    })
    .await?;
    wait_until("the lane to fetch again", Duration::from_secs(5), || {
        queue.fetch_calls() >= 3
    })
    .await?;
    consumer.stop().await?;

    assert!(
        queue.deleted_ids().is_empty(),
        "timed out batch must not be deleted, got {:?}",
        queue.deleted_ids()
    );
    assert_eq!(queue.queue().len(), 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn empty_fetches_keep_the_lane_cycling() -> Result<()> {
    init_tracing();
    let queue = Arc::new(RecordingQueue::new(fast_queue_options()));
    let job = job_fn(|_message: Message| async move { Ok(()) });

    let mut consumer = Consumer::new(test_config(1, Duration::from_secs(5)), queue.clone(), job);
    consumer.start().await?;
    wait_until("three fetches", Duration::from_secs(5), || queue.fetch_calls() >= 3).await?;
    wait_until("two delete calls", Duration::from_secs(5), || {
        queue.delete_calls().len() >= 2
    })
    .await?;
    consumer.stop().await?;

    assert!(queue.delete_calls().iter().all(Vec::is_empty));
    assert!(consumer.telemetry().snapshot().empty_fetches >= 3);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn no_fetch_after_stop() -> Result<()> {
    init_tracing();
    let queue = Arc::new(RecordingQueue::new(fast_queue_options()));
    let job = job_fn(|_message: Message| async move { Ok(()) });

    let mut consumer = Consumer::new(test_config(20, Duration::from_secs(5)), queue.clone(), job);
    consumer.start().await?;
    wait_until("a few fetches", Duration::from_secs(5), || queue.fetch_calls() >= 3).await?;
    consumer.stop().await?;

    let after_stop = queue.fetch_calls();
    sleep(Duration::from_millis(150)).await;
    assert_eq!(queue.fetch_calls(), after_stop);
    assert!(!consumer.is_running());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_finishes_in_flight_batches() -> Result<()> {
    init_tracing();
    let queue = Arc::new(RecordingQueue::new(fast_queue_options()));
    for idx in 0..3 {
        queue.send(&format!("job-{idx}"));
    }
    let started = Arc::new(Mutex::new(0usize));
    let job = {
        let started = started.clone();
        job_fn(move |_message: Message| {
            let started = started.clone();
            async move {
                *started.lock().await += 1;
                sleep(Duration::from_millis(150)).await;
                Ok(())
            }
        })
    };

    let mut consumer = Consumer::new(test_config(3, Duration::from_secs(5)), queue.clone(), job);
    consumer.start().await?;
    wait_until("jobs to start", Duration::from_secs(5), || {
        started.try_lock().map(|count| *count == 3).unwrap_or(false)
    })
    .await?;
    consumer.stop().await?;

    assert!(
        queue.queue().is_empty(),
        "messages of the in-flight batch should be deleted before stop returns"
    );
    assert_eq!(queue.deleted_ids().len(), 3);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_message_is_redelivered_and_retried() -> Result<()> {
    init_tracing();
    let queue = Arc::new(RecordingQueue::new(MemoryQueueOptions {
        visibility_timeout: Duration::from_millis(100),
        wait_time: Duration::from_millis(20),
        ..MemoryQueueOptions::default()
    }));
    let id = queue.send("flaky");
    let job = job_fn(|message: Message| async move {
        if message.receive_count() < 2 {
            bail!("first delivery fails");
        }
        Ok(())
    });

    let mut consumer = Consumer::new(test_config(1, Duration::from_secs(5)), queue.clone(), job);
    consumer.start().await?;
    wait_until("redelivered message to be deleted", Duration::from_secs(5), || {
        queue.queue().is_empty()
    })
    .await?;
    consumer.stop().await?;

    assert_eq!(queue.deleted_ids(), vec![id]);
    let snapshot = consumer.telemetry().snapshot();
    assert_eq!(snapshot.jobs_failed, 1);
    assert_eq!(snapshot.jobs_succeeded, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn panicking_job_leaves_message_on_queue() -> Result<()> {
    init_tracing();
    let queue = Arc::new(RecordingQueue::new(fast_queue_options()));
    queue.send("ok");
    queue.send("panic");
    let job = job_fn(|message: Message| async move {
        if message.body() == "panic" {
            panic!("job blew up");
        }
        Ok(())
    });

    let mut consumer = Consumer::new(test_config(2, Duration::from_secs(5)), queue.clone(), job);
    consumer.start().await?;
    wait_until("one deletion", Duration::from_secs(5), || {
        queue.deleted_ids().len() == 1
    })
    .await?;
    consumer.stop().await?;

    assert_eq!(queue.queue().len(), 1);
    assert_eq!(consumer.telemetry().snapshot().jobs_failed, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fetch_failure_aborts_pipeline() -> Result<()> {
    init_tracing();
    let queue = Arc::new(RecordingQueue::new(fast_queue_options()));
    queue.fail_fetches();
    let job = job_fn(|_message: Message| async move { Ok(()) });
    let root = CancellationToken::new();

    let mut consumer = Consumer::with_cancellation_token(
        test_config(1, Duration::from_secs(5)),
        queue.clone(),
        job,
        root.clone(),
    );
    consumer.start().await?;
    tokio::time::timeout(Duration::from_secs(5), root.cancelled())
        .await
        .expect("fetch failure should cancel the root token");

    let err = consumer
        .stop()
        .await
        .expect_err("fetch failure should surface from stop");
    let message = format!("{err:#}");
    assert!(
        message.contains("queue consumer pipeline aborted"),
        "unexpected error: {message}"
    );
    assert!(message.contains("simulated queue outage"), "unexpected error: {message}");
    assert_eq!(queue.fetch_calls(), 1, "a failed lane must not fetch again");
    Ok(())
}
