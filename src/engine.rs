//! The consumer engine.
//!
//! One task owns every piece of mutable consumer state: the receive loop,
//! the in-flight counter, the delete batcher and the visibility extender.
//! The facade and [`Message`] handles reach it only through the command
//! channel, so all state transitions are serialized without locks. At most
//! one receive call is on the wire at a time; cancelling it is done by
//! dropping its future.

use std::{collections::HashSet, future::Future, pin::Pin, sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc, oneshot},
    time::{sleep_until, Instant},
};

use crate::{
    batching::{DeleteBatcher, PendingDelete},
    config::Config,
    events::{Event, EventBus},
    extender::{ExtenderAction, TimeoutExtender},
    inflight::{InflightCounter, InflightEdge},
    message::Message,
    service::{DeleteEntry, IncomingMessage, QueueService, ReceiveRequest, SharedService},
    QueueError, Result,
};

/// Work marshalled into the engine task.
pub(crate) enum Command {
    Delete {
        message: Message,
        done: Option<oneshot::Sender<Result<()>>>,
    },
    Release {
        message: Message,
        done: Option<oneshot::Sender<Result<()>>>,
    },
    Handled {
        message: Message,
    },
    ChangeVisibility {
        receipt_handle: String,
        timeout: Duration,
        done: Option<oneshot::Sender<Result<()>>>,
    },
    Stop {
        soft: bool,
        drain_deadline: Option<Duration>,
        done: oneshot::Sender<bool>,
    },
}

struct StopWaiter {
    done: oneshot::Sender<bool>,
    deadline: Option<Instant>,
}

type PollFuture = Pin<Box<dyn Future<Output = Result<Vec<IncomingMessage>>> + Send>>;

pub(crate) struct Engine {
    service: SharedService,
    events: EventBus,
    config: Config,
    queue_url: String,
    /// Handed to every constructed [`Message`] as its consumer back-reference.
    commands: mpsc::UnboundedSender<Command>,

    inflight: InflightCounter,
    /// Receipt handles currently occupying an in-flight slot. Guards each
    /// delivery against more than one terminal transition.
    inflight_handles: HashSet<String>,
    deletes: DeleteBatcher,
    extender: Option<TimeoutExtender>,

    stopping: bool,
    /// Earliest instant the next poll may start; `None` means immediately.
    next_poll_at: Option<Instant>,
    stop_waiters: Vec<StopWaiter>,
}

impl Engine {
    pub(crate) fn new(
        service: SharedService,
        events: EventBus,
        config: Config,
        queue_url: String,
        commands: mpsc::UnboundedSender<Command>,
        extender: Option<TimeoutExtender>,
    ) -> Self {
        let inflight = InflightCounter::new(config.max_in_flight);
        let deletes = DeleteBatcher::new(config.delete_batch_size, config.delete_wait_time);
        Self {
            service,
            events,
            config,
            queue_url,
            commands,
            inflight,
            inflight_handles: HashSet::new(),
            deletes,
            extender,
            stopping: false,
            next_poll_at: None,
            stop_waiters: Vec::new(),
        }
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut poll: Option<PollFuture> = None;

        'engine: loop {
            // Drain whatever the facade queued up before committing to a
            // poll size, so a burst of acknowledgements frees its slots in
            // one go.
            let mut abort_poll = false;
            while let Ok(cmd) = commands.try_recv() {
                abort_poll |= self.handle_command(cmd).await;
            }
            if abort_poll && poll.take().is_some() {
                self.events.emit(Event::PollAborted);
            }

            let now = Instant::now();
            self.run_due_work(now).await;

            if poll.is_none() && self.may_poll(now) {
                if let Some(max) = self.effective_batch() {
                    poll = Some(self.start_poll(max));
                }
            }

            let wake = self.next_wake(poll.is_some());
            let mut abort_poll = false;
            tokio::select! {
                biased;
                cmd = commands.recv() => {
                    match cmd {
                        Some(cmd) => abort_poll = self.handle_command(cmd).await,
                        None => break 'engine,
                    }
                }
                res = async { poll.as_mut().expect("poll future").await }, if poll.is_some() => {
                    poll = None;
                    self.on_poll_result(res);
                }
                _ = sleep_until(wake.unwrap_or(now)), if wake.is_some() => {}
            }
            if abort_poll && poll.take().is_some() {
                self.events.emit(Event::PollAborted);
            }
        }

        // Every command sender is gone; acknowledgements queued behind a
        // stop still belong on the wire.
        while !self.deletes.is_empty() {
            let batch = self.deletes.take_batch();
            self.flush_batch(batch).await;
        }
        tracing::debug!(queue_url = %self.queue_url, "consumer engine finished");
    }

    /// Flushes, renews and expires everything whose deadline has passed.
    async fn run_due_work(&mut self, now: Instant) {
        if self.deletes.deadline().is_some_and(|t| t <= now) {
            self.flush_deletes().await;
        }

        let actions = match &mut self.extender {
            Some(ext) if ext.next_fire().is_some_and(|t| t <= now) => ext.due(now),
            _ => Vec::new(),
        };
        for action in actions {
            match action {
                ExtenderAction::Expire(message) => {
                    tracing::debug!(
                        id = message.id(),
                        "visibility extension ceiling reached, releasing message to expiry"
                    );
                    self.events.emit(Event::TimeoutReached(message));
                }
                ExtenderAction::Renew(message) => self.renew_visibility(message).await,
            }
        }

        let mut i = 0;
        while i < self.stop_waiters.len() {
            if self.stop_waiters[i].deadline.is_some_and(|d| d <= now) {
                let waiter = self.stop_waiters.swap_remove(i);
                let _ = waiter.done.send(false);
            } else {
                i += 1;
            }
        }
    }

    /// The current transport; reread per call so a reseated client takes
    /// effect immediately.
    fn current_service(&self) -> Arc<dyn QueueService> {
        self.service.read().expect("service lock poisoned").clone()
    }

    async fn renew_visibility(&mut self, message: Message) {
        let Some(extend_by) = self.extender.as_ref().map(|e| e.extend_by()) else {
            return;
        };
        let outcome = self
            .current_service()
            .change_message_visibility(&self.queue_url, message.receipt_handle(), extend_by)
            .await;
        let now = Instant::now();
        let Some(ext) = &mut self.extender else { return };
        match outcome {
            Ok(()) => ext.renewed(message.receipt_handle(), now),
            Err(e) => {
                tracing::warn!(id = message.id(), error = %e, "visibility renewal failed");
                ext.renewal_failed(message.receipt_handle(), now);
                self.events.emit_error(e);
            }
        }
    }

    fn may_poll(&self, now: Instant) -> bool {
        !self.stopping && self.next_poll_at.map_or(true, |t| t <= now)
    }

    /// Poll size for the free capacity, or `None` while enough slots are
    /// not available.
    fn effective_batch(&self) -> Option<usize> {
        match self.inflight.available() {
            None => Some(self.config.receive_batch_size),
            Some(slots) if slots < self.config.min_receive_batch_size => None,
            Some(slots) => Some(slots.min(self.config.receive_batch_size)),
        }
    }

    fn start_poll(&mut self, max_messages: usize) -> PollFuture {
        self.next_poll_at = None;
        let service = self.current_service();
        let req = ReceiveRequest {
            queue_url: self.queue_url.clone(),
            max_messages,
            wait_time: self.config.receive_wait_time,
            visibility_timeout: self.config.visibility_timeout,
            attribute_names: self.config.receive_system_attributes.clone(),
            message_attribute_names: self.config.receive_attributes.clone(),
        };
        Box::pin(async move { service.receive_message(req).await })
    }

    fn on_poll_result(&mut self, result: Result<Vec<IncomingMessage>>) {
        let now = Instant::now();
        match result {
            Ok(batch) if !batch.is_empty() => {
                self.events.emit(Event::ReceivedBatch(batch.len()));
                let mut crossed_cap = false;
                for raw in batch {
                    crossed_cap |= self.inflight.increment() == InflightEdge::CapReached;
                    self.inflight_handles.insert(raw.receipt_handle.clone());
                    let message = Message::new(raw, self.commands.clone());
                    if let Some(ext) = &mut self.extender {
                        ext.track(message.clone(), now);
                    }
                    self.events.emit(Event::Message(message));
                }
                if self.inflight.at_cap() {
                    // Paused: effective_batch() stays `None` until an
                    // acknowledgement frees a slot, which restarts polling.
                    if crossed_cap {
                        tracing::debug!(in_flight = self.inflight.value(), "in-flight cap reached");
                        self.events.emit(Event::MaxInFlight);
                    }
                    self.next_poll_at = None;
                } else {
                    self.next_poll_at = Some(now + self.config.active_poll_interval);
                }
            }
            Ok(_) => {
                if self.inflight.value() == 0 {
                    self.events.emit(Event::QueueEmpty);
                }
                self.next_poll_at = Some(now + self.config.idle_poll_interval);
            }
            Err(e) => {
                tracing::warn!(error = %e, "receive failed, backing off");
                self.events.emit_error(e);
                self.next_poll_at = Some(now + self.config.poll_retry_interval);
            }
        }
    }

    /// Returns `true` when the in-flight poll must be cancelled.
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Handled { message } => {
                self.mark_handled(&message);
            }
            Command::Delete { message, done } => {
                if !self.mark_handled(&message) {
                    if let Some(done) = done {
                        let _ = done.send(Err(QueueError::Generic(
                            "message was already acknowledged or released".into(),
                        )));
                    }
                    return false;
                }
                self.events.emit(Event::DeleteQueued(message.clone()));
                if self.deletes.enqueue(PendingDelete { message, done }) {
                    self.flush_deletes().await;
                }
            }
            Command::Release { message, done } => {
                if !self.mark_handled(&message) {
                    if let Some(done) = done {
                        let _ = done.send(Err(QueueError::Generic(
                            "message was already acknowledged or released".into(),
                        )));
                    }
                    return false;
                }
                let outcome = self
                    .current_service()
                    .change_message_visibility(&self.queue_url, message.receipt_handle(), Duration::ZERO)
                    .await;
                self.reply(done, outcome);
            }
            Command::ChangeVisibility {
                receipt_handle,
                timeout,
                done,
            } => {
                let outcome = self
                    .current_service()
                    .change_message_visibility(&self.queue_url, &receipt_handle, timeout)
                    .await;
                self.reply(done, outcome);
            }
            Command::Stop {
                soft,
                drain_deadline,
                done,
            } => {
                self.stopping = true;
                if self.inflight.value() == 0 {
                    let _ = done.send(true);
                } else {
                    self.stop_waiters.push(StopWaiter {
                        done,
                        deadline: drain_deadline.map(|d| Instant::now() + d),
                    });
                }
                return !soft;
            }
        }
        false
    }

    fn reply(&self, done: Option<oneshot::Sender<Result<()>>>, outcome: Result<()>) {
        match done {
            Some(done) => {
                let _ = done.send(outcome);
            }
            None => {
                if let Err(e) = outcome {
                    self.events.emit_error(e);
                }
            }
        }
    }

    /// Frees the delivery's in-flight slot. Returns `false` when the
    /// message already went through a terminal transition.
    fn mark_handled(&mut self, message: &Message) -> bool {
        if !self.inflight_handles.remove(message.receipt_handle()) {
            return false;
        }
        if let Some(ext) = &mut self.extender {
            ext.untrack(message.receipt_handle());
        }
        let edge = self.inflight.decrement();
        self.events.emit(Event::Handled(message.clone()));
        if edge == InflightEdge::Drained && self.stopping {
            self.events.emit(Event::Drained);
            for waiter in self.stop_waiters.drain(..) {
                let _ = waiter.done.send(true);
            }
        }
        true
    }

    async fn flush_deletes(&mut self) {
        loop {
            let batch = self.deletes.take_batch();
            if batch.is_empty() {
                return;
            }
            self.flush_batch(batch).await;
            if !self.deletes.after_flush() {
                return;
            }
        }
    }

    async fn flush_batch(&mut self, mut batch: Vec<PendingDelete>) {
        let entries = batch
            .iter()
            .enumerate()
            .map(|(i, pending)| DeleteEntry {
                id: i.to_string(),
                receipt_handle: pending.message.receipt_handle().to_owned(),
            })
            .collect();

        let service = self.current_service();
        match service.delete_message_batch(&self.queue_url, entries).await {
            Ok(result) => {
                for id in result.successful {
                    let Some(pending) = id.parse::<usize>().ok().and_then(|i| batch.get_mut(i))
                    else {
                        continue;
                    };
                    self.events.emit(Event::Deleted(pending.message.clone()));
                    if let Some(done) = pending.done.take() {
                        let _ = done.send(Ok(()));
                    }
                }
                for failure in result.failed {
                    let Some(pending) = failure
                        .id
                        .parse::<usize>()
                        .ok()
                        .and_then(|i| batch.get_mut(i))
                    else {
                        continue;
                    };
                    tracing::warn!(
                        id = pending.message.id(),
                        code = %failure.code,
                        "delete entry rejected"
                    );
                    self.events.emit(Event::DeleteError(failure.clone()));
                    if let Some(done) = pending.done.take() {
                        let _ = done.send(Err(QueueError::EntryFailed(failure)));
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "delete batch failed");
                for pending in &mut batch {
                    if let Some(done) = pending.done.take() {
                        let _ = done.send(Err(QueueError::Generic(e.to_string().into())));
                    }
                }
                self.events.emit_error(e);
            }
        }
    }

    fn next_wake(&self, polling: bool) -> Option<Instant> {
        let mut wake = min_opt(
            self.deletes.deadline(),
            self.extender.as_ref().and_then(|e| e.next_fire()),
        );
        wake = min_opt(wake, self.stop_waiters.iter().filter_map(|w| w.deadline).min());
        if !polling && !self.stopping && self.effective_batch().is_some() {
            wake = min_opt(wake, self.next_poll_at);
        }
        wake
    }
}

fn min_opt(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}
