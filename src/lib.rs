//! # Queuepump
//!
//! Queuepump is a managed consumer for message-queue services with SQS
//! semantics: long-poll receive, per-message receipt handles, visibility
//! timeouts and batched delete/send calls.
//!
//! A [`Consumer`] owns the polling loop. It long-polls the configured queue,
//! fans received messages out over a typed event stream, caps the number of
//! messages handed to the application but not yet acknowledged, batches
//! acknowledgements into `DeleteMessageBatch` calls, and can keep extending
//! message visibility while a handler is still working.
//!
//! ## How to use Queuepump
//!
//! ```no_run
//! use queuepump::{Config, Consumer, Event};
//!
//! # async {
//! let cfg = Config {
//!     queue_name: Some("jobs".to_owned()),
//!     max_in_flight: 50,
//!     ..Config::default()
//! };
//!
//! let consumer = Consumer::builder(cfg).build().await?;
//! let mut events = consumer.events();
//!
//! consumer.start().await?;
//! while let Some(event) = events.next().await {
//!     if let Event::Message(msg) = event {
//!         // ... do the work ...
//!         msg.delete().await?;
//!     }
//! }
//! # anyhow::Ok(())
//! # };
//! ```
//!
//! Stopping is cooperative: [`Consumer::stop`] cancels the in-flight poll
//! (or lets it finish, in soft mode) and optionally waits for every
//! outstanding message to be acknowledged before a deadline:
//!
//! ```no_run
//! # use queuepump::{Consumer, StopMode};
//! # use std::time::Duration;
//! # async {
//! # let consumer: Consumer = todo!();
//! let drained = consumer
//!     .stop(StopMode::soft().drain_deadline(Duration::from_secs(30)))
//!     .await;
//! # };
//! ```
//!
//! ## Backends
//!
//! The transport is the [`service::QueueService`] trait. Two implementations
//! ship with the crate, each behind a cargo feature (both on by default):
//!
//! * `sqs` — [`service::sqs::SqsService`], backed by `aws-sdk-sqs`.
//! * `in_memory` — [`service::in_memory::InMemoryService`], a deterministic
//!   queue used by the test suite and handy for local development.
#![warn(unreachable_pub)]

use thiserror::Error;

mod batching;
pub mod builder;
pub mod config;
mod consumer;
mod engine;
mod events;
mod extender;
mod inflight;
mod message;
mod resolver;
pub mod service;

pub use self::{
    builder::ConsumerBuilder,
    config::Config,
    consumer::{Consumer, StopMode},
    events::{Event, EventStream},
    message::{AttributeValue, Message},
    service::{BatchResult, EntryFailure, SendOptions, SendReceipt},
};

/// Errors surfaced by the consumer, its batchers and the transport.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("either queue_url or queue_name must be configured")]
    MissingQueueIdentity,

    #[error("this operation requires queue_name to be configured")]
    MissingQueueName,

    #[error("the consumer has been stopped")]
    Stopped,

    #[error("batch entry {} failed: {}: {}", .0.id, .0.code, .0.message)]
    EntryFailed(EntryFailure),

    #[error("(de)serialization error")]
    Serde(#[from] serde_json::Error),

    #[error("{0}")]
    Generic(Box<dyn std::error::Error + Send + Sync>),
}

impl QueueError {
    pub fn generic<E: 'static + std::error::Error + Send + Sync>(e: E) -> Self {
        Self::Generic(Box::new(e))
    }

    /// Whether this error came from the service/transport layer, as opposed
    /// to local validation.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Generic(_))
    }
}

pub type Result<T, E = QueueError> = std::result::Result<T, E>;
