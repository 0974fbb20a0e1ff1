//! A deterministic in-memory queue service.
//!
//! Implements the full [`QueueService`] contract — long-poll waits,
//! visibility timeouts, receipt handles, per-entry batch failures — without
//! any network. The test suite runs on it, and it is handy for local
//! development before pointing a consumer at a real queue.
//!
//! Two sentinels inject failures the way a real service would report them:
//! a sent body of `"FAIL"` is rejected per-entry by `send_message_batch`,
//! and a message whose body is `"FAIL-DELETE"` is rejected per-entry by
//! `delete_message_batch` (and stays in flight).

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    sync::Notify,
    time::{timeout_at, Instant},
};
use url::Url;

use super::{
    BatchResult, CreateQueueRequest, DeleteEntry, EntryFailure, IncomingMessage, QueueService,
    ReceiveRequest, SendEntry, SendOptions, SendReceipt,
};
use crate::{QueueError, Result};

const HOST: &str = "http://in-memory.localhost:9324";
const DEFAULT_VISIBILITY: Duration = Duration::from_secs(30);

/// Sent bodies rejected per-entry by the batch send call.
pub const FAIL_SEND_BODY: &str = "FAIL";
/// Stored bodies whose deletion is rejected per-entry.
pub const FAIL_DELETE_BODY: &str = "FAIL-DELETE";

struct StoredMessage {
    id: String,
    body: String,
    receipt_handle: Option<String>,
    visible_at: Instant,
    receive_count: u32,
}

struct Queue {
    messages: Vec<StoredMessage>,
    visibility: Duration,
    attributes: HashMap<String, String>,
}

#[derive(Default)]
struct Calls {
    /// Sizes of non-empty receive responses, in order.
    received_batches: Vec<usize>,
    /// Sizes of delete batch calls, in order.
    delete_batches: Vec<usize>,
    /// Sizes of send batch calls, in order.
    send_batches: Vec<usize>,
}

struct State {
    queues: HashMap<String, Queue>,
    calls: Calls,
    fail_receives: u32,
}

/// In-memory [`QueueService`]. Cloning shares the underlying queues.
#[derive(Clone)]
pub struct InMemoryService {
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
    next_id: Arc<AtomicU64>,
}

impl Default for InMemoryService {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryService {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                queues: HashMap::new(),
                calls: Calls::default(),
                fail_receives: 0,
            })),
            notify: Arc::new(Notify::new()),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Creates the service with one existing queue and returns both.
    pub fn with_queue(name: &str) -> (Self, String) {
        let service = Self::new();
        let url = service.add_queue(name, DEFAULT_VISIBILITY);
        (service, url)
    }

    /// Adds a queue with the given default visibility timeout.
    pub fn add_queue(&self, name: &str, visibility: Duration) -> String {
        let url = Self::url_for(name);
        let mut state = self.state.lock().unwrap();
        state.queues.insert(
            url.clone(),
            Queue {
                messages: Vec::new(),
                visibility,
                attributes: HashMap::new(),
            },
        );
        url
    }

    fn url_for(name: &str) -> String {
        format!("{HOST}/queue/{name}")
    }

    /// Seeds messages directly into a queue, bypassing the send path.
    pub fn seed<I, S>(&self, queue_url: &str, bodies: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.state.lock().unwrap();
        for body in bodies {
            let id = self.fresh_id("im");
            let queue = state.queues.get_mut(queue_url).expect("unknown queue");
            queue.messages.push(StoredMessage {
                id,
                body: body.into(),
                receipt_handle: None,
                visible_at: Instant::now(),
                receive_count: 0,
            });
        }
        drop(state);
        self.notify.notify_waiters();
    }

    /// Makes the next `n` receive calls fail with a transport error.
    pub fn fail_next_receives(&self, n: u32) {
        self.state.lock().unwrap().fail_receives = n;
        self.notify.notify_waiters();
    }

    /// Sizes of non-empty receive responses, in order.
    pub fn received_batches(&self) -> Vec<usize> {
        self.state.lock().unwrap().calls.received_batches.clone()
    }

    /// Sizes of delete batch calls, in order.
    pub fn delete_batches(&self) -> Vec<usize> {
        self.state.lock().unwrap().calls.delete_batches.clone()
    }

    /// Sizes of send batch calls, in order.
    pub fn send_batches(&self) -> Vec<usize> {
        self.state.lock().unwrap().calls.send_batches.clone()
    }

    /// Total messages held by a queue, visible or not.
    pub fn message_count(&self, queue_url: &str) -> usize {
        self.state.lock().unwrap().queues[queue_url].messages.len()
    }

    fn fresh_id(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn queue<'a>(state: &'a mut State, queue_url: &str) -> Result<&'a mut Queue> {
        state
            .queues
            .get_mut(queue_url)
            .ok_or_else(|| QueueError::Generic(format!("no such queue: {queue_url}").into()))
    }

    fn take_visible(
        &self,
        queue: &mut Queue,
        max: usize,
        visibility: Duration,
        now: Instant,
    ) -> Vec<IncomingMessage> {
        let mut out = Vec::new();
        for msg in queue.messages.iter_mut() {
            if out.len() >= max {
                break;
            }
            if msg.visible_at > now {
                continue;
            }
            msg.receive_count += 1;
            msg.visible_at = now + visibility;
            let receipt = self.fresh_id(&format!("{}#rcpt", msg.id));
            msg.receipt_handle = Some(receipt.clone());
            out.push(IncomingMessage {
                id: msg.id.clone(),
                receipt_handle: receipt,
                body: msg.body.clone(),
                attributes: HashMap::new(),
                system_attributes: HashMap::from([(
                    "ApproximateReceiveCount".to_owned(),
                    msg.receive_count.to_string(),
                )]),
            });
        }
        out
    }
}

#[async_trait]
impl QueueService for InMemoryService {
    async fn receive_message(&self, req: ReceiveRequest) -> Result<Vec<IncomingMessage>> {
        let deadline = Instant::now() + req.wait_time;
        loop {
            let next_visible;
            {
                let mut state = self.state.lock().unwrap();
                if state.fail_receives > 0 {
                    state.fail_receives -= 1;
                    return Err(QueueError::Generic("injected receive failure".into()));
                }
                let now = Instant::now();
                let (batch, next) = {
                    let queue = Self::queue(&mut state, &req.queue_url)?;
                    let visibility = req.visibility_timeout.unwrap_or(queue.visibility);
                    let batch = self.take_visible(queue, req.max_messages, visibility, now);
                    let next = queue
                        .messages
                        .iter()
                        .map(|m| m.visible_at)
                        .min()
                        .filter(|t| *t < deadline);
                    (batch, next)
                };
                if !batch.is_empty() {
                    state.calls.received_batches.push(batch.len());
                    return Ok(batch);
                }
                if now >= deadline {
                    return Ok(Vec::new());
                }
                next_visible = next;
            }
            let notified = self.notify.notified();
            let _ = timeout_at(next_visible.unwrap_or(deadline), notified).await;
        }
    }

    async fn delete_message_batch(
        &self,
        queue_url: &str,
        entries: Vec<DeleteEntry>,
    ) -> Result<BatchResult<String>> {
        let mut state = self.state.lock().unwrap();
        state.calls.delete_batches.push(entries.len());
        let queue = Self::queue(&mut state, queue_url)?;

        let mut result = BatchResult::default();
        for entry in entries {
            let Some(pos) = queue
                .messages
                .iter()
                .position(|m| m.receipt_handle.as_deref() == Some(&entry.receipt_handle))
            else {
                result.failed.push(EntryFailure {
                    id: entry.id,
                    code: "ReceiptHandleIsInvalid".to_owned(),
                    message: "no in-flight message for this receipt handle".to_owned(),
                    sender_fault: true,
                });
                continue;
            };
            if queue.messages[pos].body == FAIL_DELETE_BODY {
                result.failed.push(EntryFailure {
                    id: entry.id,
                    code: "InternalError".to_owned(),
                    message: "injected delete failure".to_owned(),
                    sender_fault: false,
                });
                continue;
            }
            queue.messages.remove(pos);
            result.successful.push(entry.id);
        }
        Ok(result)
    }

    async fn send_message(
        &self,
        queue_url: &str,
        body: &str,
        opts: SendOptions,
    ) -> Result<SendReceipt> {
        let id = self.fresh_id("im");
        let delay = opts.delay.unwrap_or(Duration::ZERO);
        let mut state = self.state.lock().unwrap();
        let queue = Self::queue(&mut state, queue_url)?;
        queue.messages.push(StoredMessage {
            id: id.clone(),
            body: body.to_owned(),
            receipt_handle: None,
            visible_at: Instant::now() + delay,
            receive_count: 0,
        });
        drop(state);
        self.notify.notify_waiters();
        Ok(SendReceipt {
            id: String::new(),
            message_id: id,
        })
    }

    async fn send_message_batch(
        &self,
        queue_url: &str,
        entries: Vec<SendEntry>,
    ) -> Result<BatchResult<SendReceipt>> {
        let mut result = BatchResult::default();
        let mut state = self.state.lock().unwrap();
        state.calls.send_batches.push(entries.len());
        let queue = Self::queue(&mut state, queue_url)?;
        for entry in entries {
            if entry.body == FAIL_SEND_BODY {
                result.failed.push(EntryFailure {
                    id: entry.id,
                    code: "InvalidMessageContents".to_owned(),
                    message: "injected send failure".to_owned(),
                    sender_fault: true,
                });
                continue;
            }
            let id = self.fresh_id("im");
            let delay = entry.delay.unwrap_or(Duration::ZERO);
            queue.messages.push(StoredMessage {
                id: id.clone(),
                body: entry.body,
                receipt_handle: None,
                visible_at: Instant::now() + delay,
                receive_count: 0,
            });
            result.successful.push(SendReceipt {
                id: entry.id,
                message_id: id,
            });
        }
        drop(state);
        self.notify.notify_waiters();
        Ok(result)
    }

    async fn change_message_visibility(
        &self,
        queue_url: &str,
        receipt_handle: &str,
        timeout: Duration,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let queue = Self::queue(&mut state, queue_url)?;
        let msg = queue
            .messages
            .iter_mut()
            .find(|m| m.receipt_handle.as_deref() == Some(receipt_handle))
            .ok_or_else(|| {
                QueueError::Generic("no in-flight message for this receipt handle".into())
            })?;
        msg.visible_at = Instant::now() + timeout;
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn create_queue(&self, req: CreateQueueRequest) -> Result<String> {
        let visibility = req
            .attributes
            .get("VisibilityTimeout")
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_VISIBILITY);
        let url = self.add_queue(&req.queue_name, visibility);
        self.state
            .lock()
            .unwrap()
            .queues
            .get_mut(&url)
            .expect("queue just added")
            .attributes = req.attributes;
        Ok(url)
    }

    async fn delete_queue(&self, queue_url: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .queues
            .remove(queue_url)
            .map(|_| ())
            .ok_or_else(|| QueueError::Generic(format!("no such queue: {queue_url}").into()))
    }

    async fn purge_queue(&self, queue_url: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::queue(&mut state, queue_url)?.messages.clear();
        Ok(())
    }

    async fn get_queue_url(
        &self,
        queue_name: &str,
        _account_number: Option<&str>,
    ) -> Result<String> {
        let url = Self::url_for(queue_name);
        if self.state.lock().unwrap().queues.contains_key(&url) {
            Ok(url)
        } else {
            Err(QueueError::Generic(
                format!("no such queue: {queue_name}").into(),
            ))
        }
    }

    async fn get_queue_attributes(
        &self,
        queue_url: &str,
        attribute_names: &[&str],
    ) -> Result<HashMap<String, String>> {
        let mut state = self.state.lock().unwrap();
        let queue = Self::queue(&mut state, queue_url)?;
        let all = attribute_names.contains(&"All");
        let mut out: HashMap<String, String> = queue
            .attributes
            .iter()
            .filter(|(name, _)| all || attribute_names.contains(&name.as_str()))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        if all || attribute_names.contains(&"VisibilityTimeout") {
            out.insert(
                "VisibilityTimeout".to_owned(),
                queue.visibility.as_secs().to_string(),
            );
        }
        Ok(out)
    }

    fn endpoint(&self) -> Option<Url> {
        Url::parse(HOST).ok()
    }
}
