//! The application-facing consumer object.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, OnceCell};

use crate::{
    batching::{chunk_send_entries, merge_batch_results},
    config::Config,
    engine::{Command, Engine},
    events::{EventBus, EventStream},
    extender::TimeoutExtender,
    message::Message,
    resolver::QueueResolver,
    service::{
        BatchResult, CreateQueueRequest, QueueService, SendOptions, SendReceipt, SharedService,
    },
    ConsumerBuilder, QueueError, Result,
};

/// Fallback when the queue does not report a visibility timeout.
const DEFAULT_VISIBILITY: Duration = Duration::from_secs(30);

/// How [`Consumer::stop`] treats the in-flight poll and outstanding
/// messages.
#[derive(Clone, Copy, Debug, Default)]
pub struct StopMode {
    soft: bool,
    drain_deadline: Option<Duration>,
}

impl StopMode {
    /// Cancel the poll that is on the wire. The default.
    pub fn hard() -> Self {
        Self::default()
    }

    /// Let the in-flight poll run to completion.
    pub fn soft() -> Self {
        Self {
            soft: true,
            drain_deadline: None,
        }
    }

    /// Wait up to `deadline` for in-flight messages to be acknowledged;
    /// [`Consumer::stop`] reports whether the drain finished in time.
    pub fn drain_deadline(mut self, deadline: Duration) -> Self {
        self.drain_deadline = Some(deadline);
        self
    }
}

enum Lifecycle {
    Idle(mpsc::UnboundedReceiver<Command>),
    Running,
    Stopped,
}

struct ConsumerInner {
    config: Config,
    service: SharedService,
    events: EventBus,
    commands: mpsc::UnboundedSender<Command>,
    lifecycle: Mutex<Lifecycle>,
    resolver: QueueResolver,
    visibility_cache: OnceCell<Duration>,
}

/// A managed queue consumer.
///
/// Cloning is cheap and every clone drives the same engine. See the crate
/// docs for the lifecycle; in short: [`builder`][Consumer::builder] →
/// [`start`][Consumer::start] → consume [`events`][Consumer::events] →
/// [`stop`][Consumer::stop].
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

impl Consumer {
    /// Starts building a consumer for the given configuration.
    pub fn builder(config: Config) -> ConsumerBuilder {
        ConsumerBuilder::new(config)
    }

    pub(crate) fn new(config: Config, service: Arc<dyn QueueService>) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let resolver = QueueResolver::new(
            config.queue_url.clone(),
            config.queue_name.clone(),
            config.account_number.clone(),
            config.correct_queue_url,
        );
        Self {
            inner: Arc::new(ConsumerInner {
                config,
                service: Arc::new(RwLock::new(service)),
                events: EventBus::new(),
                commands,
                lifecycle: Mutex::new(Lifecycle::Idle(rx)),
                resolver,
                visibility_cache: OnceCell::new(),
            }),
        }
    }

    /// Subscribes to the consumer's [`Event`][crate::Event]s. Each stream
    /// sees everything emitted after this call.
    pub fn events(&self) -> EventStream {
        self.inner.events.subscribe()
    }

    /// Starts the receive loop.
    ///
    /// Resolves the queue URL (and, when automatic extension is on, the
    /// queue's visibility timeout) before the first poll; a resolution
    /// failure makes this first call fail and leaves the consumer startable
    /// again. Calling `start` on a running consumer is a no-op.
    pub async fn start(&self) -> Result<()> {
        let rx = {
            let mut lifecycle = self.inner.lifecycle.lock().unwrap();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Running) {
                Lifecycle::Idle(rx) => rx,
                Lifecycle::Running => return Ok(()),
                Lifecycle::Stopped => {
                    *lifecycle = Lifecycle::Stopped;
                    return Err(QueueError::Stopped);
                }
            }
        };

        match self.prepare_engine().await {
            Ok(engine) => {
                tokio::spawn(engine.run(rx));
                Ok(())
            }
            Err(e) => {
                let mut lifecycle = self.inner.lifecycle.lock().unwrap();
                // A stop that raced the failed start wins; otherwise the
                // consumer stays startable.
                if matches!(*lifecycle, Lifecycle::Running) {
                    *lifecycle = Lifecycle::Idle(rx);
                }
                drop(lifecycle);
                self.inner
                    .events
                    .emit_error(QueueError::Generic(e.to_string().into()));
                Err(e)
            }
        }
    }

    async fn prepare_engine(&self) -> Result<Engine> {
        let queue_url = self.queue_url().await?;

        let extender = if self.inner.config.auto_extend_timeout {
            let extend_by = match self.inner.config.visibility_timeout {
                Some(d) => d,
                None => self.queue_visibility_timeout().await?,
            };
            Some(TimeoutExtender::new(
                extend_by,
                self.inner.config.extend_call_advance,
                self.inner.config.max_extension_window,
            ))
        } else {
            None
        };

        Ok(Engine::new(
            self.inner.service.clone(),
            self.inner.events.clone(),
            self.inner.config.clone(),
            queue_url,
            self.inner.commands.clone(),
            extender,
        ))
    }

    /// Stops the consumer and reports whether it drained.
    ///
    /// No new poll is started after this returns control to the engine; a
    /// hard stop also cancels the poll on the wire. The returned future
    /// resolves `true` once no messages are in flight, or `false` when the
    /// configured drain deadline passes first — and is never resolved a
    /// second time by a drain that finishes late. Stopping is idempotent.
    pub async fn stop(&self, mode: StopMode) -> bool {
        {
            let mut lifecycle = self.inner.lifecycle.lock().unwrap();
            if let Lifecycle::Idle(_) = &*lifecycle {
                *lifecycle = Lifecycle::Stopped;
                return true;
            }
            *lifecycle = Lifecycle::Stopped;
        }

        let (tx, rx) = oneshot::channel();
        if self
            .inner
            .commands
            .send(Command::Stop {
                soft: mode.soft,
                drain_deadline: mode.drain_deadline,
                done: tx,
            })
            .is_err()
        {
            return true;
        }
        rx.await.unwrap_or(true)
    }

    /// Sends one message.
    pub async fn send_message(&self, body: &str, opts: SendOptions) -> Result<SendReceipt> {
        let queue_url = self.queue_url().await?;
        self.service().send_message(&queue_url, body, opts).await
    }

    /// Serializes `body` to JSON and sends it.
    pub async fn send_json<T: Serialize + ?Sized>(
        &self,
        body: &T,
        opts: SendOptions,
    ) -> Result<SendReceipt> {
        let body = serde_json::to_string(body)?;
        self.send_message(&body, opts).await
    }

    /// Sends a set of messages, batching them into service-sized chunks
    /// dispatched in parallel.
    ///
    /// The merged result covers every input: entry IDs are `"0".."N-1"` in
    /// input order, and each input lands in exactly one of `successful` or
    /// `failed`. A transport failure of any chunk fails the whole call.
    pub async fn send_messages<I, S>(
        &self,
        bodies: I,
        opts: SendOptions,
    ) -> Result<BatchResult<SendReceipt>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let bodies: Vec<String> = bodies.into_iter().map(Into::into).collect();
        if bodies.is_empty() {
            return Ok(BatchResult::default());
        }
        let queue_url = self.queue_url().await?;
        let service = self.service();

        let chunks = chunk_send_entries(bodies, &opts);
        let calls = chunks
            .into_iter()
            .map(|chunk| service.send_message_batch(&queue_url, chunk));
        let results = join_all(calls)
            .await
            .into_iter()
            .collect::<Result<Vec<_>>>()?;
        Ok(merge_batch_results(results))
    }

    /// Acknowledges a message. The delete joins the next batch; the
    /// returned future resolves with that batch entry's outcome, but the
    /// delete is queued whether or not the future is awaited.
    pub fn delete_message(&self, message: &Message) -> impl Future<Output = Result<()>> + Send {
        let (tx, rx) = oneshot::channel();
        let queued = self.send_command(Command::Delete {
            message: message.clone(),
            done: Some(tx),
        });
        async move {
            queued?;
            rx.await.map_err(|_| QueueError::Stopped)?
        }
    }

    /// Returns a message to the queue for immediate redelivery.
    pub fn release_message(&self, message: &Message) -> impl Future<Output = Result<()>> + Send {
        let (tx, rx) = oneshot::channel();
        let queued = self.send_command(Command::Release {
            message: message.clone(),
            done: Some(tx),
        });
        async move {
            queued?;
            rx.await.map_err(|_| QueueError::Stopped)?
        }
    }

    /// Frees a message's in-flight slot without deleting it; the message
    /// redelivers once its visibility timeout lapses.
    pub fn handled_message(&self, message: &Message) -> Result<()> {
        self.send_command(Command::Handled {
            message: message.clone(),
        })
    }

    /// Changes the visibility timeout of a received message.
    pub fn change_message_visibility(
        &self,
        message: &Message,
        timeout: Duration,
    ) -> impl Future<Output = Result<()>> + Send {
        self.change_visibility_by_handle(message.receipt_handle().to_owned(), timeout)
    }

    /// Like [`change_message_visibility`][Self::change_message_visibility],
    /// for a bare receipt handle.
    pub fn change_visibility_by_handle(
        &self,
        receipt_handle: String,
        timeout: Duration,
    ) -> impl Future<Output = Result<()>> + Send {
        let (tx, rx) = oneshot::channel();
        let queued = self.send_command(Command::ChangeVisibility {
            receipt_handle,
            timeout,
            done: Some(tx),
        });
        async move {
            queued?;
            rx.await.map_err(|_| QueueError::Stopped)?
        }
    }

    /// Creates the configured queue. Requires `queue_name`.
    pub async fn create_queue(&self) -> Result<String> {
        let queue_name = self
            .inner
            .config
            .queue_name
            .clone()
            .ok_or(QueueError::MissingQueueName)?;

        let mut attributes = HashMap::from([
            (
                "ReceiveMessageWaitTimeSeconds".to_owned(),
                self.inner.config.receive_wait_time.as_secs().to_string(),
            ),
            ("DelaySeconds".to_owned(), "0".to_owned()),
            ("MaximumMessageSize".to_owned(), "262144".to_owned()),
            ("MessageRetentionPeriod".to_owned(), "345600".to_owned()),
        ]);
        if let Some(visibility) = self.inner.config.visibility_timeout {
            attributes.insert(
                "VisibilityTimeout".to_owned(),
                visibility.as_secs().to_string(),
            );
        }
        if let Some(policy) = &self.inner.config.queue_policy {
            attributes.insert("Policy".to_owned(), policy.clone());
        }

        self.service()
            .create_queue(CreateQueueRequest {
                queue_name,
                attributes,
            })
            .await
    }

    pub async fn delete_queue(&self) -> Result<()> {
        let queue_url = self.queue_url().await?;
        self.service().delete_queue(&queue_url).await
    }

    pub async fn purge_queue(&self) -> Result<()> {
        let queue_url = self.queue_url().await?;
        self.service().purge_queue(&queue_url).await
    }

    /// The consumer's queue URL, resolving and caching it if needed.
    pub async fn queue_url(&self) -> Result<String> {
        self.inner.resolver.resolve(&*self.service()).await
    }

    /// The queue's visibility timeout, fetched once and cached.
    pub async fn queue_visibility_timeout(&self) -> Result<Duration> {
        self.inner
            .visibility_cache
            .get_or_try_init(|| async {
                let queue_url = self.queue_url().await?;
                let attrs = self
                    .service()
                    .get_queue_attributes(&queue_url, &["VisibilityTimeout"])
                    .await?;
                Ok(attrs
                    .get("VisibilityTimeout")
                    .and_then(|v| v.parse().ok())
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_VISIBILITY))
            })
            .await
            .copied()
    }

    /// Swaps the transport client. Subsequent calls — including the
    /// engine's own polls and flushes — go through the replacement.
    pub fn replace_service(&self, service: Arc<dyn QueueService>) {
        *self.inner.service.write().expect("service lock poisoned") = service;
    }

    fn service(&self) -> Arc<dyn QueueService> {
        self.inner.service.read().expect("service lock poisoned").clone()
    }

    fn send_command(&self, cmd: Command) -> Result<()> {
        self.inner
            .commands
            .send(cmd)
            .map_err(|_| QueueError::Stopped)
    }
}
