//! Received messages and attribute values.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot};

use crate::{engine::Command, service::IncomingMessage, QueueError, Result};

/// A typed message-attribute value.
///
/// The wire format tags each value with a data type; unset values are
/// serialized as an empty `String`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttributeValue {
    String(String),
    /// Decimal number carried as text, the way the wire carries it.
    Number(String),
    Binary(Vec<u8>),
}

impl AttributeValue {
    /// The encoding of an unset value.
    pub fn empty() -> Self {
        Self::String(String::new())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) | Self::Number(s) => Some(s),
            Self::Binary(_) => None,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        Self::Number(v.to_string())
    }
}

impl From<u64> for AttributeValue {
    fn from(v: u64) -> Self {
        Self::Number(v.to_string())
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        Self::Number(v.to_string())
    }
}

impl From<Vec<u8>> for AttributeValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Binary(v)
    }
}

impl From<&[u8]> for AttributeValue {
    fn from(v: &[u8]) -> Self {
        Self::Binary(v.to_owned())
    }
}

struct MessageInner {
    id: String,
    receipt_handle: String,
    body: String,
    attributes: HashMap<String, AttributeValue>,
    system_attributes: HashMap<String, String>,
    receive_count: u32,
    // Back-reference to the owning consumer's engine. Cloning a Message
    // clones this sender, never the consumer itself.
    commands: mpsc::UnboundedSender<Command>,
}

/// A message received from the queue.
///
/// Cloning is cheap; all clones refer to the same delivery. Exactly one
/// terminal call ([`delete`][Self::delete], [`release`][Self::release] or
/// [`keep`][Self::keep]) frees the in-flight slot the delivery occupies.
#[derive(Clone)]
pub struct Message {
    inner: Arc<MessageInner>,
}

impl Message {
    pub(crate) fn new(raw: IncomingMessage, commands: mpsc::UnboundedSender<Command>) -> Self {
        let receive_count = raw
            .system_attributes
            .get("ApproximateReceiveCount")
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);
        Self {
            inner: Arc::new(MessageInner {
                id: raw.id,
                receipt_handle: raw.receipt_handle,
                body: raw.body,
                attributes: raw.attributes,
                system_attributes: raw.system_attributes,
                receive_count,
                commands,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn receipt_handle(&self) -> &str {
        &self.inner.receipt_handle
    }

    pub fn body(&self) -> &str {
        &self.inner.body
    }

    /// Deserializes the body as JSON.
    pub fn body_json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.inner.body).map_err(Into::into)
    }

    pub fn attributes(&self) -> &HashMap<String, AttributeValue> {
        &self.inner.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.inner.attributes.get(name)
    }

    pub fn system_attributes(&self) -> &HashMap<String, String> {
        &self.inner.system_attributes
    }

    /// How many times the service has handed this message out.
    pub fn receive_count(&self) -> u32 {
        self.inner.receive_count
    }

    /// Acknowledges the message. The delete is queued into the next batch;
    /// the returned future resolves with that batch entry's outcome.
    pub async fn delete(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Delete {
            message: self.clone(),
            done: Some(tx),
        })?;
        rx.await.map_err(|_| QueueError::Stopped)?
    }

    /// Returns the message to the queue by zeroing its visibility timeout.
    pub async fn release(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Release {
            message: self.clone(),
            done: Some(tx),
        })?;
        rx.await.map_err(|_| QueueError::Stopped)?
    }

    /// Marks the message handled without deleting it. It stays invisible
    /// until its visibility timeout lapses, then redelivers.
    pub fn keep(&self) -> Result<()> {
        self.send(Command::Handled {
            message: self.clone(),
        })
    }

    /// Changes this message's visibility timeout.
    pub async fn change_visibility(&self, timeout: Duration) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::ChangeVisibility {
            receipt_handle: self.inner.receipt_handle.clone(),
            timeout,
            done: Some(tx),
        })?;
        rx.await.map_err(|_| QueueError::Stopped)?
    }

    fn send(&self, cmd: Command) -> Result<()> {
        self.inner.commands.send(cmd).map_err(|_| QueueError::Stopped)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.inner.id)
            .field("receipt_handle", &self.inner.receipt_handle)
            .field("receive_count", &self.inner.receive_count)
            .finish()
    }
}
