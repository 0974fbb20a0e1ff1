//! Delete batching: thresholds, per-entry failures and trailing flushes.

use std::time::Duration;

use futures_util::future::join_all;
use queuepump::{service::InMemoryService, Event, QueueError, StopMode};

use crate::{collect_messages, consumer_on, next_matching};

/// Fifteen acknowledgements with a batch size of ten produce exactly two
/// service calls: one full batch on the size threshold, one partial on the
/// time threshold.
#[tokio::test(start_paused = true)]
async fn deletes_flush_on_size_then_time() {
    let (service, queue_url) = InMemoryService::with_queue("q");
    service.seed(&queue_url, (0..15).map(|i| format!("m{i}")));

    let consumer = consumer_on(&service, &queue_url, |cfg| {
        cfg.max_in_flight = 0;
        cfg.delete_batch_size = 10;
        cfg.delete_wait_time = Duration::from_millis(10);
    })
    .await;
    let mut events = consumer.events();
    consumer.start().await.unwrap();

    let messages = collect_messages(&mut events, 15).await;
    let outcomes = join_all(messages.iter().map(|m| consumer.delete_message(m))).await;
    assert!(outcomes.iter().all(Result::is_ok));

    assert_eq!(service.delete_batches(), vec![10, 5]);
    assert_eq!(service.message_count(&queue_url), 0);
}

/// A batch size of one degenerates into one service call per
/// acknowledgement.
#[tokio::test(start_paused = true)]
async fn unit_batches_flush_immediately() {
    let (service, queue_url) = InMemoryService::with_queue("q");
    service.seed(&queue_url, (0..5).map(|i| format!("m{i}")));

    let consumer = consumer_on(&service, &queue_url, |cfg| {
        cfg.delete_batch_size = 1;
    })
    .await;
    let mut events = consumer.events();
    consumer.start().await.unwrap();

    let messages = collect_messages(&mut events, 5).await;
    for msg in &messages {
        consumer.delete_message(msg).await.unwrap();
    }

    assert_eq!(service.delete_batches(), vec![1, 1, 1, 1, 1]);
}

/// A rejected batch entry fails only its own acknowledgement and is
/// reported as a `DeleteError`.
#[tokio::test(start_paused = true)]
async fn per_entry_failures_stay_isolated() {
    let (service, queue_url) = InMemoryService::with_queue("q");
    service.seed(&queue_url, ["ok", queuepump::service::in_memory::FAIL_DELETE_BODY]);

    let consumer = consumer_on(&service, &queue_url, |cfg| {
        cfg.delete_batch_size = 2;
    })
    .await;
    let mut events = consumer.events();
    consumer.start().await.unwrap();

    let messages = collect_messages(&mut events, 2).await;
    let ok = messages.iter().find(|m| m.body() == "ok").unwrap();
    let doomed = messages.iter().find(|m| m.body() != "ok").unwrap();

    let (ok_result, doomed_result) =
        tokio::join!(consumer.delete_message(ok), consumer.delete_message(doomed));

    ok_result.unwrap();
    match doomed_result {
        Err(QueueError::EntryFailed(failure)) => assert_eq!(failure.code, "InternalError"),
        other => panic!("expected a per-entry failure, got {other:?}"),
    }

    next_matching(&mut events, |e| matches!(e, Event::Deleted(_))).await;
    let delete_error = next_matching(&mut events, |e| matches!(e, Event::DeleteError(_))).await;
    let Event::DeleteError(failure) = delete_error else {
        unreachable!()
    };
    assert!(!failure.sender_fault);
}

/// Each acknowledged message walks through handled → queued → deleted.
#[tokio::test(start_paused = true)]
async fn delete_emits_lifecycle_events_in_order() {
    let (service, queue_url) = InMemoryService::with_queue("q");
    service.seed(&queue_url, ["only"]);

    let consumer = consumer_on(&service, &queue_url, |cfg| {
        cfg.delete_batch_size = 1;
    })
    .await;
    let mut events = consumer.events();
    consumer.start().await.unwrap();

    let messages = collect_messages(&mut events, 1).await;
    consumer.delete_message(&messages[0]).await.unwrap();

    let mut order = Vec::new();
    while let Some(event) = events.try_next() {
        match event {
            Event::Handled(_) => order.push("handled"),
            Event::DeleteQueued(_) => order.push("queued"),
            Event::Deleted(_) => order.push("deleted"),
            _ => {}
        }
    }
    assert_eq!(order, ["handled", "queued", "deleted"]);
}

/// Acknowledging the same delivery twice frees its slot exactly once; the
/// duplicate is refused.
#[tokio::test(start_paused = true)]
async fn second_terminal_operation_is_refused() {
    let (service, queue_url) = InMemoryService::with_queue("q");
    service.seed(&queue_url, ["once"]);

    let consumer = consumer_on(&service, &queue_url, |cfg| {
        cfg.delete_batch_size = 1;
    })
    .await;
    let mut events = consumer.events();
    consumer.start().await.unwrap();

    let messages = collect_messages(&mut events, 1).await;
    consumer.delete_message(&messages[0]).await.unwrap();
    assert!(consumer.delete_message(&messages[0]).await.is_err());

    assert_eq!(service.delete_batches(), vec![1]);
}

/// An acknowledgement arriving after stop still flushes on the time
/// threshold.
#[tokio::test(start_paused = true)]
async fn trailing_delete_after_stop_flushes() {
    let (service, queue_url) = InMemoryService::with_queue("q");
    service.seed(&queue_url, ["straggler"]);

    let consumer = consumer_on(&service, &queue_url, |cfg| {
        cfg.delete_wait_time = Duration::from_millis(20);
    })
    .await;
    let mut events = consumer.events();
    consumer.start().await.unwrap();

    let messages = collect_messages(&mut events, 1).await;

    // Stop first; the drain completes only once the message below is
    // acknowledged.
    let stopper = tokio::spawn({
        let consumer = consumer.clone();
        async move { consumer.stop(StopMode::soft()).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    consumer.delete_message(&messages[0]).await.unwrap();
    assert!(stopper.await.unwrap());
    assert_eq!(service.delete_batches(), vec![1]);
    assert_eq!(service.message_count(&queue_url), 0);
}
