//! The consumer's observable surface.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::{message::Message, service::EntryFailure, QueueError};

const CHANNEL_CAPACITY: usize = 1024;

/// Everything a running consumer reports.
///
/// Events are fire-and-forget: the engine never waits for subscribers, and
/// a subscriber that falls more than the channel capacity behind loses the
/// oldest events rather than exerting backpressure.
#[derive(Clone, Debug)]
pub enum Event {
    /// One delivered message. Always preceded by the
    /// [`ReceivedBatch`][Self::ReceivedBatch] event that announced its poll.
    Message(Message),
    /// A poll returned this many messages (≥ 1).
    ReceivedBatch(usize),
    /// A poll returned nothing while nothing was in flight.
    QueueEmpty,
    /// The in-flight cap was reached and polling paused.
    MaxInFlight,
    /// Stop cancelled the poll that was on the wire.
    PollAborted,
    /// In-flight count reached zero after a stop request.
    Drained,
    /// A transport failure from the poll loop, a batcher, the extender or
    /// the resolver. Never fatal to the loop.
    Error(Arc<QueueError>),
    /// The service rejected one entry of a delete batch.
    DeleteError(EntryFailure),
    /// A message entered the delete batcher.
    DeleteQueued(Message),
    /// A delete batch confirmed this message gone.
    Deleted(Message),
    /// A message's in-flight slot was freed.
    Handled(Message),
    /// A message hit the extension ceiling; its visibility will lapse.
    TimeoutReached(Message),
}

/// Subscription to a consumer's [`Event`]s.
///
/// Obtained from [`Consumer::events`][crate::Consumer::events]; each stream
/// sees every event emitted after it was created.
pub struct EventStream {
    rx: broadcast::Receiver<Event>,
}

impl EventStream {
    /// The next event, or `None` once the consumer is gone.
    pub async fn next(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event subscriber lagged; events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Like [`next`][Self::next], but never waits.
    pub fn try_next(&mut self) -> Option<Event> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

#[derive(Clone)]
pub(crate) struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub(crate) fn subscribe(&self) -> EventStream {
        EventStream {
            rx: self.tx.subscribe(),
        }
    }

    /// Emits without caring whether anyone listens.
    pub(crate) fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    pub(crate) fn emit_error(&self, error: QueueError) {
        self.emit(Event::Error(Arc::new(error)));
    }
}
