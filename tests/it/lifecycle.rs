//! Start/stop semantics: idempotence, poll cancellation and drain
//! deadlines.

use std::time::Duration;

use queuepump::{service::InMemoryService, Event, QueueError, StopMode};

use crate::{collect_messages, consumer_on, next_matching};

/// Two `start` calls run one loop.
#[tokio::test(start_paused = true)]
async fn start_is_idempotent() {
    let (service, queue_url) = InMemoryService::with_queue("q");
    service.seed(&queue_url, ["solo"]);

    let consumer = consumer_on(&service, &queue_url, |_| {}).await;
    let mut events = consumer.events();
    consumer.start().await.unwrap();
    consumer.start().await.unwrap();

    collect_messages(&mut events, 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(service.received_batches(), vec![1]);
}

/// A hard stop with nothing in flight cancels the poll on the wire and
/// resolves drained immediately.
#[tokio::test(start_paused = true)]
async fn hard_stop_cancels_the_active_poll() {
    let (service, queue_url) = InMemoryService::with_queue("q");

    let consumer = consumer_on(&service, &queue_url, |cfg| {
        cfg.receive_wait_time = Duration::from_secs(5);
    })
    .await;
    let mut events = consumer.events();
    consumer.start().await.unwrap();

    // Give the long poll time to get on the wire.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let start = tokio::time::Instant::now();
    assert!(
        consumer
            .stop(StopMode::hard().drain_deadline(Duration::from_secs(1)))
            .await
    );
    assert!(start.elapsed() < Duration::from_secs(1));
    next_matching(&mut events, |e| matches!(e, Event::PollAborted)).await;
}

/// A stop with one message in flight drains once that message is deleted
/// before the deadline.
#[tokio::test(start_paused = true)]
async fn stop_drains_when_messages_are_acknowledged_in_time() {
    let (service, queue_url) = InMemoryService::with_queue("q");
    service.seed(&queue_url, ["pending"]);

    let consumer = consumer_on(&service, &queue_url, |_| {}).await;
    let mut events = consumer.events();
    consumer.start().await.unwrap();
    let messages = collect_messages(&mut events, 1).await;

    let stopper = tokio::spawn({
        let consumer = consumer.clone();
        async move {
            consumer
                .stop(StopMode::hard().drain_deadline(Duration::from_millis(500)))
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let _ = consumer.delete_message(&messages[0]);
    assert!(stopper.await.unwrap());
    next_matching(&mut events, |e| matches!(e, Event::Drained)).await;
}

/// A drain that misses its deadline resolves `false`, and a late
/// acknowledgement does not upgrade the verdict.
#[tokio::test(start_paused = true)]
async fn missed_drain_deadline_resolves_false_once() {
    let (service, queue_url) = InMemoryService::with_queue("q");
    service.seed(&queue_url, ["stuck"]);

    let consumer = consumer_on(&service, &queue_url, |_| {}).await;
    let mut events = consumer.events();
    consumer.start().await.unwrap();
    let messages = collect_messages(&mut events, 1).await;

    let start = tokio::time::Instant::now();
    let drained = consumer
        .stop(StopMode::hard().drain_deadline(Duration::from_millis(200)))
        .await;
    assert!(!drained);
    assert!(start.elapsed() >= Duration::from_millis(200));

    // The late acknowledgement drains the engine, which a fresh stop call
    // confirms, but the first verdict stands.
    let _ = consumer.delete_message(&messages[0]);
    next_matching(&mut events, |e| matches!(e, Event::Drained)).await;
    assert!(consumer.stop(StopMode::hard()).await);
}

/// Stopping twice cancels at most one poll.
#[tokio::test(start_paused = true)]
async fn stop_is_idempotent() {
    let (service, queue_url) = InMemoryService::with_queue("q");

    let consumer = consumer_on(&service, &queue_url, |cfg| {
        cfg.receive_wait_time = Duration::from_secs(5);
    })
    .await;
    let mut events = consumer.events();
    consumer.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(consumer.stop(StopMode::hard()).await);
    assert!(consumer.stop(StopMode::hard()).await);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut aborts = 0;
    while let Some(event) = events.try_next() {
        if matches!(event, Event::PollAborted) {
            aborts += 1;
        }
    }
    assert_eq!(aborts, 1);
}

/// A stopped consumer refuses to start again.
#[tokio::test(start_paused = true)]
async fn start_after_stop_is_refused() {
    let (service, queue_url) = InMemoryService::with_queue("q");

    let consumer = consumer_on(&service, &queue_url, |_| {}).await;
    consumer.start().await.unwrap();
    assert!(consumer.stop(StopMode::hard()).await);

    assert!(matches!(consumer.start().await, Err(QueueError::Stopped)));
}

/// Stopping a consumer that never started reports a clean drain.
#[tokio::test(start_paused = true)]
async fn stop_before_start_resolves_immediately() {
    let (service, queue_url) = InMemoryService::with_queue("q");
    let consumer = consumer_on(&service, &queue_url, |_| {}).await;
    assert!(consumer.stop(StopMode::soft()).await);
}

/// A failing queue-name lookup rejects the first start but leaves the
/// consumer startable once the queue exists.
#[tokio::test(start_paused = true)]
async fn failed_resolution_rejects_start() {
    let service = InMemoryService::new();

    let mut cfg = queuepump::Config {
        queue_name: Some("not-yet".to_owned()),
        receive_wait_time: Duration::from_millis(50),
        ..queuepump::Config::default()
    };
    cfg.idle_poll_interval = Duration::from_millis(10);
    let consumer = queuepump::Consumer::builder(cfg)
        .service(service.clone())
        .build()
        .await
        .unwrap();

    assert!(consumer.start().await.is_err());

    let queue_url = service.add_queue("not-yet", Duration::from_secs(30));
    service.seed(&queue_url, ["finally"]);
    let mut events = consumer.events();
    consumer.start().await.unwrap();
    let messages = collect_messages(&mut events, 1).await;
    assert_eq!(messages[0].body(), "finally");
}

/// Releasing a message frees its slot and puts it straight back on the
/// queue.
#[tokio::test(start_paused = true)]
async fn released_messages_redeliver_immediately() {
    let (service, queue_url) = InMemoryService::with_queue("q");
    service.seed(&queue_url, ["bounce"]);

    let consumer = consumer_on(&service, &queue_url, |_| {}).await;
    let mut events = consumer.events();
    consumer.start().await.unwrap();

    let first = collect_messages(&mut events, 1).await;
    assert_eq!(first[0].receive_count(), 1);
    consumer.release_message(&first[0]).await.unwrap();

    let again = collect_messages(&mut events, 1).await;
    assert_eq!(again[0].body(), "bounce");
    assert_eq!(again[0].receive_count(), 2);
}
