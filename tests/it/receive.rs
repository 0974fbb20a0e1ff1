//! Receive-loop behavior: batch sizing, backpressure and empty-queue
//! signalling.

use std::time::Duration;

use queuepump::{service::InMemoryService, Event};

use crate::{collect_messages, consumer_on, next_matching};

/// A full first batch hits the in-flight cap and pauses polling; handling
/// every message resumes the loop and drains the queue, with one
/// `QueueEmpty` at the end.
#[tokio::test(start_paused = true)]
async fn cap_pauses_polling_until_messages_are_handled() {
    let (service, queue_url) = InMemoryService::with_queue("q");
    service.seed(&queue_url, (0..15).map(|i| format!("m{i}")));

    let consumer = consumer_on(&service, &queue_url, |cfg| {
        cfg.max_in_flight = 10;
    })
    .await;
    let mut events = consumer.events();
    consumer.start().await.unwrap();

    let first = collect_messages(&mut events, 10).await;
    next_matching(&mut events, |e| matches!(e, Event::MaxInFlight)).await;

    // The paused loop delivers nothing new while the cap holds.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(service.received_batches(), vec![10]);

    for msg in &first {
        consumer.handled_message(msg).unwrap();
    }

    let rest = collect_messages(&mut events, 5).await;
    for msg in &rest {
        consumer.handled_message(msg).unwrap();
    }
    next_matching(&mut events, |e| matches!(e, Event::QueueEmpty)).await;

    let batches = service.received_batches();
    assert_eq!(batches[0], 10);
    assert_eq!(batches.iter().sum::<usize>(), 15);
}

/// With free slots below the preferred batch size, the poll shrinks to fit;
/// `QueueEmpty` stays silent while anything is in flight.
#[tokio::test(start_paused = true)]
async fn poll_size_tracks_free_slots() {
    let (service, queue_url) = InMemoryService::with_queue("q");
    service.seed(&queue_url, (0..16).map(|i| format!("m{i}")));

    let consumer = consumer_on(&service, &queue_url, |cfg| {
        cfg.max_in_flight = 15;
    })
    .await;
    let mut events = consumer.events();
    consumer.start().await.unwrap();

    let first_fifteen = collect_messages(&mut events, 15).await;
    next_matching(&mut events, |e| matches!(e, Event::MaxInFlight)).await;
    assert_eq!(service.received_batches(), vec![10, 5]);

    // Acknowledge five of the first batch; the loop resumes and fetches the
    // one message left.
    for msg in &first_fifteen[..5] {
        let _ = consumer.delete_message(msg);
    }
    collect_messages(&mut events, 1).await;
    assert_eq!(service.received_batches(), vec![10, 5, 1]);

    for msg in &first_fifteen[5..10] {
        let _ = consumer.delete_message(msg);
    }

    // 11 messages were never acknowledged, so the empty polls that follow
    // must not announce an empty queue.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let mut saw_queue_empty = false;
    while let Some(event) = events.try_next() {
        saw_queue_empty |= matches!(event, Event::QueueEmpty);
    }
    assert!(!saw_queue_empty);
}

/// Polling stays suppressed until at least `min_receive_batch_size` slots
/// are free.
#[tokio::test(start_paused = true)]
async fn min_batch_size_defers_small_polls() {
    let (service, queue_url) = InMemoryService::with_queue("q");
    service.seed(&queue_url, (0..20).map(|i| format!("m{i}")));

    let consumer = consumer_on(&service, &queue_url, |cfg| {
        cfg.max_in_flight = 10;
        cfg.min_receive_batch_size = 5;
    })
    .await;
    let mut events = consumer.events();
    consumer.start().await.unwrap();

    let first = collect_messages(&mut events, 10).await;

    // Three free slots is below the minimum; no poll may happen.
    for msg in &first[..3] {
        consumer.handled_message(msg).unwrap();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(service.received_batches(), vec![10]);

    // Two more handled messages clear the threshold.
    for msg in &first[3..5] {
        consumer.handled_message(msg).unwrap();
    }
    collect_messages(&mut events, 5).await;
    assert_eq!(service.received_batches(), vec![10, 5]);
}

/// A transport failure is reported, backed off from and recovered from
/// without dropping the loop.
#[tokio::test(start_paused = true)]
async fn receive_errors_back_off_and_recover() {
    let (service, queue_url) = InMemoryService::with_queue("q");
    service.fail_next_receives(1);
    service.seed(&queue_url, ["after-the-error"]);

    let consumer = consumer_on(&service, &queue_url, |cfg| {
        cfg.poll_retry_interval = Duration::from_millis(50);
    })
    .await;
    let mut events = consumer.events();
    consumer.start().await.unwrap();

    next_matching(&mut events, |e| matches!(e, Event::Error(_))).await;
    let batch = next_matching(&mut events, |e| matches!(e, Event::ReceivedBatch(_))).await;
    assert!(matches!(batch, Event::ReceivedBatch(1)));

    let msgs = collect_messages(&mut events, 1).await;
    assert_eq!(msgs[0].body(), "after-the-error");
}

/// Unbounded consumers poll at the preferred batch size and deliver
/// everything.
#[tokio::test(start_paused = true)]
async fn unbounded_consumer_uses_preferred_batch_size() {
    let (service, queue_url) = InMemoryService::with_queue("q");
    service.seed(&queue_url, (0..25).map(|i| format!("m{i}")));

    let consumer = consumer_on(&service, &queue_url, |cfg| {
        cfg.max_in_flight = 0;
    })
    .await;
    let mut events = consumer.events();
    consumer.start().await.unwrap();

    collect_messages(&mut events, 25).await;
    assert_eq!(service.received_batches(), vec![10, 10, 5]);
}

/// `ReceivedBatch(n)` precedes its `n` message events.
#[tokio::test(start_paused = true)]
async fn batch_event_precedes_its_messages() {
    let (service, queue_url) = InMemoryService::with_queue("q");
    service.seed(&queue_url, ["a", "b", "c"]);

    let consumer = consumer_on(&service, &queue_url, |cfg| {
        cfg.max_in_flight = 5;
    })
    .await;
    let mut events = consumer.events();
    consumer.start().await.unwrap();

    let batch = next_matching(&mut events, |e| {
        matches!(e, Event::ReceivedBatch(_) | Event::Message(_))
    })
    .await;
    let Event::ReceivedBatch(n) = batch else {
        panic!("messages arrived before their batch announcement");
    };
    assert_eq!(n, 3);
    collect_messages(&mut events, 3).await;
}
