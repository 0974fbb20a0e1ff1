//! The transport seam between the consumer and a concrete queue service.
//!
//! [`QueueService`] is the abstract client the engine talks to. Cancellation
//! of an in-flight receive call is done by dropping the returned future, so
//! implementations must not hold work past that point.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use url::Url;

use crate::{message::AttributeValue, Result};

/// The transport is a reseatable collaborator: the facade can swap the
/// client under a running consumer, and every subsequent call goes through
/// the replacement.
pub(crate) type SharedService = Arc<RwLock<Arc<dyn QueueService>>>;

#[cfg(feature = "in_memory")]
pub mod in_memory;
#[cfg(feature = "sqs")]
pub mod sqs;

#[cfg(feature = "in_memory")]
pub use in_memory::InMemoryService;
#[cfg(feature = "sqs")]
pub use sqs::SqsService;

/// A long-poll receive call.
#[derive(Clone, Debug)]
pub struct ReceiveRequest {
    pub queue_url: String,
    /// In `1..=10`.
    pub max_messages: usize,
    pub wait_time: Duration,
    pub visibility_timeout: Option<Duration>,
    /// System-attribute names to return, e.g. `["All"]`.
    pub attribute_names: Vec<String>,
    /// Message-attribute names to return, e.g. `["All"]`.
    pub message_attribute_names: Vec<String>,
}

/// A raw message as returned by the service, before it becomes a
/// [`Message`][crate::Message].
#[derive(Clone, Debug)]
pub struct IncomingMessage {
    pub id: String,
    pub receipt_handle: String,
    pub body: String,
    pub attributes: HashMap<String, AttributeValue>,
    pub system_attributes: HashMap<String, String>,
}

/// One acknowledgement in a delete batch. `id` correlates the entry with
/// its per-entry result and must be unique within the batch.
#[derive(Clone, Debug)]
pub struct DeleteEntry {
    pub id: String,
    pub receipt_handle: String,
}

/// One message in a send batch.
#[derive(Clone, Debug, Default)]
pub struct SendEntry {
    pub id: String,
    pub body: String,
    pub delay: Option<Duration>,
    pub attributes: HashMap<String, AttributeValue>,
    /// FIFO queues only.
    pub message_group_id: Option<String>,
    /// FIFO queues only.
    pub deduplication_id: Option<String>,
}

/// Caller-facing knobs for a send, applied to every entry of a batch.
#[derive(Clone, Debug, Default)]
pub struct SendOptions {
    pub delay: Option<Duration>,
    pub attributes: HashMap<String, AttributeValue>,
    pub message_group_id: Option<String>,
    pub deduplication_id: Option<String>,
}

/// Service acknowledgement of a successfully sent message.
#[derive(Clone, Debug, Default)]
pub struct SendReceipt {
    /// The batch-entry id (position in the caller's input) for batched
    /// sends; empty for single sends.
    pub id: String,
    pub message_id: String,
}

/// A batch entry the service rejected.
#[derive(Clone, Debug)]
pub struct EntryFailure {
    pub id: String,
    pub code: String,
    pub message: String,
    /// True when the entry itself was at fault rather than the service.
    pub sender_fault: bool,
}

/// Merged outcome of one or more batch calls.
#[derive(Clone, Debug, Default)]
pub struct BatchResult<T> {
    pub successful: Vec<T>,
    pub failed: Vec<EntryFailure>,
}

impl<T> BatchResult<T> {
    pub fn len(&self) -> usize {
        self.successful.len() + self.failed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.successful.is_empty() && self.failed.is_empty()
    }
}

/// A queue-creation call. Attribute defaults are filled by the consumer.
#[derive(Clone, Debug)]
pub struct CreateQueueRequest {
    pub queue_name: String,
    pub attributes: HashMap<String, String>,
}

/// The operations the consumer needs from a queue service.
///
/// Implementations must be safe for concurrent use; the engine shares one
/// instance between the receive loop, the batchers and caller-initiated
/// sends.
#[async_trait]
pub trait QueueService: Send + Sync + 'static {
    async fn receive_message(&self, req: ReceiveRequest) -> Result<Vec<IncomingMessage>>;

    /// Deletes up to 10 messages. Per-entry failures are reported in the
    /// result, not as an `Err`.
    async fn delete_message_batch(
        &self,
        queue_url: &str,
        entries: Vec<DeleteEntry>,
    ) -> Result<BatchResult<String>>;

    async fn send_message(
        &self,
        queue_url: &str,
        body: &str,
        opts: SendOptions,
    ) -> Result<SendReceipt>;

    /// Sends up to 10 messages. Per-entry failures are reported in the
    /// result, not as an `Err`.
    async fn send_message_batch(
        &self,
        queue_url: &str,
        entries: Vec<SendEntry>,
    ) -> Result<BatchResult<SendReceipt>>;

    async fn change_message_visibility(
        &self,
        queue_url: &str,
        receipt_handle: &str,
        timeout: Duration,
    ) -> Result<()>;

    /// Returns the URL of the created (or pre-existing) queue.
    async fn create_queue(&self, req: CreateQueueRequest) -> Result<String>;

    async fn delete_queue(&self, queue_url: &str) -> Result<()>;

    async fn purge_queue(&self, queue_url: &str) -> Result<()>;

    async fn get_queue_url(&self, queue_name: &str, account_number: Option<&str>)
        -> Result<String>;

    async fn get_queue_attributes(
        &self,
        queue_url: &str,
        attribute_names: &[&str],
    ) -> Result<HashMap<String, String>>;

    /// The endpoint this client talks to, when known. Used to rewrite
    /// resolved queue URLs that point at a different host.
    fn endpoint(&self) -> Option<Url> {
        None
    }
}
