//! Automatic visibility extension.

use std::time::Duration;

use queuepump::{service::InMemoryService, Event};

use crate::{collect_messages, consumer_on, next_matching};

/// While a handler holds a message, renewals keep it invisible well past
/// its original visibility timeout.
#[tokio::test(start_paused = true)]
async fn extension_prevents_redelivery_during_long_handling() {
    let (service, queue_url) = InMemoryService::with_queue("q");
    service.seed(&queue_url, ["slow-job"]);

    let consumer = consumer_on(&service, &queue_url, |cfg| {
        cfg.auto_extend_timeout = true;
        cfg.visibility_timeout = Some(Duration::from_millis(300));
        cfg.extend_call_advance = Duration::from_millis(50);
    })
    .await;
    let mut events = consumer.events();
    consumer.start().await.unwrap();

    let messages = collect_messages(&mut events, 1).await;

    // Hold the message for several visibility windows; a redelivery would
    // surface as a second Message event.
    let redelivered = tokio::time::timeout(Duration::from_millis(1_000), async {
        loop {
            if let Some(Event::Message(_)) = events.next().await {
                return;
            }
        }
    })
    .await;
    assert!(redelivered.is_err(), "message redelivered despite extension");

    consumer.delete_message(&messages[0]).await.unwrap();
    assert_eq!(service.message_count(&queue_url), 0);
}

/// Once a message has been in flight past the ceiling, extension stops,
/// the consumer says so, and the message eventually redelivers.
#[tokio::test(start_paused = true)]
async fn extension_stops_at_the_ceiling() {
    let (service, queue_url) = InMemoryService::with_queue("q");
    service.seed(&queue_url, ["runaway"]);

    let consumer = consumer_on(&service, &queue_url, |cfg| {
        cfg.auto_extend_timeout = true;
        cfg.visibility_timeout = Some(Duration::from_millis(150));
        cfg.extend_call_advance = Duration::from_millis(50);
        cfg.max_extension_window = Duration::from_millis(300);
    })
    .await;
    let mut events = consumer.events();
    consumer.start().await.unwrap();

    let first = collect_messages(&mut events, 1).await;
    assert_eq!(first[0].receive_count(), 1);

    next_matching(&mut events, |e| matches!(e, Event::TimeoutReached(_))).await;

    // With no further renewals the last deadline lapses and the service
    // hands the message out again.
    let again = collect_messages(&mut events, 1).await;
    assert_eq!(again[0].body(), "runaway");
    assert_eq!(again[0].receive_count(), 2);
}

/// Acknowledging a message stops its renewals; the delete wins before the
/// extension ceiling is anywhere near.
#[tokio::test(start_paused = true)]
async fn handled_messages_stop_renewing() {
    let (service, queue_url) = InMemoryService::with_queue("q");
    service.seed(&queue_url, ["quick"]);

    let consumer = consumer_on(&service, &queue_url, |cfg| {
        cfg.auto_extend_timeout = true;
        cfg.visibility_timeout = Some(Duration::from_millis(200));
        cfg.extend_call_advance = Duration::from_millis(50);
        cfg.delete_batch_size = 1;
    })
    .await;
    let mut events = consumer.events();
    consumer.start().await.unwrap();

    let messages = collect_messages(&mut events, 1).await;
    consumer.delete_message(&messages[0]).await.unwrap();

    // Nothing left to extend or redeliver.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let mut redelivered = false;
    let mut timeout_reached = false;
    while let Some(event) = events.try_next() {
        redelivered |= matches!(event, Event::Message(_));
        timeout_reached |= matches!(event, Event::TimeoutReached(_));
    }
    assert!(!redelivered);
    assert!(!timeout_reached);
    assert_eq!(service.message_count(&queue_url), 0);
}

/// When no per-receive visibility override is configured, the extender
/// renews by the queue's own visibility timeout, discovered at start.
#[tokio::test(start_paused = true)]
async fn renewal_amount_is_discovered_from_the_queue() {
    let service = InMemoryService::new();
    let queue_url = service.add_queue("q", Duration::from_secs(2));
    service.seed(&queue_url, ["job"]);

    let consumer = consumer_on(&service, &queue_url, |cfg| {
        cfg.auto_extend_timeout = true;
        cfg.extend_call_advance = Duration::from_millis(100);
    })
    .await;
    assert_eq!(
        consumer.queue_visibility_timeout().await.unwrap(),
        Duration::from_secs(2)
    );

    let mut events = consumer.events();
    consumer.start().await.unwrap();
    let messages = collect_messages(&mut events, 1).await;

    // Held across two discovered visibility windows without redelivery.
    let redelivered = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(Event::Message(_)) = events.next().await {
                return;
            }
        }
    })
    .await;
    assert!(redelivered.is_err());

    consumer.delete_message(&messages[0]).await.unwrap();
}
