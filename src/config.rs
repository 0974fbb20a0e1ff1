//! Consumer configuration.

use std::time::Duration;

use crate::{QueueError, Result};

/// The service-side ceiling on entries per receive/delete/send batch call.
pub(crate) const MAX_BATCH: usize = 10;

/// Options recognized by [`Consumer`][crate::Consumer].
///
/// Identify the target queue with either `queue_url` (no lookup performed)
/// or `queue_name` plus optionally `account_number` (resolved once through
/// the service and cached). Everything else has a usable default:
///
/// ```
/// use queuepump::Config;
///
/// let cfg = Config {
///     queue_name: Some("jobs".to_owned()),
///     ..Config::default()
/// };
/// assert_eq!(cfg.max_in_flight, 100);
/// ```
#[derive(Clone, Debug)]
pub struct Config {
    /// Full URL of the queue. Takes precedence over `queue_name`.
    pub queue_url: Option<String>,
    /// Name of the queue, resolved via `GetQueueUrl` on first use.
    pub queue_name: Option<String>,
    /// Owning account, passed along when resolving `queue_name`.
    pub account_number: Option<String>,
    /// Rewrite the resolved queue URL's scheme/host/port to those of the
    /// service endpoint. Useful behind proxies and local stacks that return
    /// their internal hostname from `GetQueueUrl`.
    pub correct_queue_url: bool,

    /// Cap on messages handed out but not yet acknowledged. `0` is
    /// unbounded.
    pub max_in_flight: usize,
    /// Preferred number of messages per receive call, capped at 10.
    pub receive_batch_size: usize,
    /// Suppress polling until at least this many in-flight slots are free.
    pub min_receive_batch_size: usize,
    /// Long-poll wait passed to the service on each receive call.
    pub receive_wait_time: Duration,
    /// Per-receive visibility timeout override; also used when creating the
    /// queue and as the renewal amount for automatic extension.
    pub visibility_timeout: Option<Duration>,

    /// Delay between polls while the queue is producing messages.
    pub active_poll_interval: Duration,
    /// Delay before the next poll after an empty receive.
    pub idle_poll_interval: Duration,
    /// Delay before retrying after a transport error.
    pub poll_retry_interval: Duration,

    /// Queue this many acknowledgements before flushing a delete batch,
    /// capped at 10.
    pub delete_batch_size: usize,
    /// Flush a partial delete batch after this long.
    pub delete_wait_time: Duration,

    /// Keep extending the visibility timeout of in-flight messages.
    pub auto_extend_timeout: bool,
    /// Stop extending a message's visibility once it has been in flight
    /// this long.
    pub max_extension_window: Duration,
    /// How far ahead of the visibility deadline each renewal call is made.
    pub extend_call_advance: Duration,

    /// Message-attribute names requested on receive.
    pub receive_attributes: Vec<String>,
    /// System-attribute names requested on receive.
    pub receive_system_attributes: Vec<String>,

    /// Access policy attached when this consumer creates its queue.
    pub queue_policy: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue_url: None,
            queue_name: None,
            account_number: None,
            correct_queue_url: false,
            max_in_flight: 100,
            receive_batch_size: MAX_BATCH,
            min_receive_batch_size: 1,
            receive_wait_time: Duration::from_secs(20),
            visibility_timeout: None,
            active_poll_interval: Duration::ZERO,
            idle_poll_interval: Duration::ZERO,
            poll_retry_interval: Duration::from_secs(10),
            delete_batch_size: MAX_BATCH,
            delete_wait_time: Duration::from_millis(2_000),
            auto_extend_timeout: false,
            max_extension_window: Duration::from_secs(43_200),
            extend_call_advance: Duration::from_millis(5_000),
            receive_attributes: vec!["All".to_owned()],
            receive_system_attributes: vec!["All".to_owned()],
            queue_policy: None,
        }
    }
}

impl Config {
    /// Checks that the queue is identified and clamps batch sizes into the
    /// range the service accepts.
    pub fn validate(mut self) -> Result<Self> {
        if self.queue_url.is_none() && self.queue_name.is_none() {
            return Err(QueueError::MissingQueueIdentity);
        }
        self.receive_batch_size = self.receive_batch_size.clamp(1, MAX_BATCH);
        self.min_receive_batch_size = self.min_receive_batch_size.clamp(1, self.receive_batch_size);
        self.delete_batch_size = self.delete_batch_size.clamp(1, MAX_BATCH);
        Ok(self)
    }
}
