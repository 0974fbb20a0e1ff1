//! Automatic visibility-timeout extension.
//!
//! Bookkeeping only: the engine owns the clock and the service calls, this
//! module decides *when* each tracked message needs a renewal and what to do
//! when one fires or fails.

use std::{collections::HashMap, time::Duration};

use tokio::time::Instant;

use crate::message::Message;

const INITIAL_RETRY: Duration = Duration::from_secs(1);

struct TrackedMessage {
    message: Message,
    received_at: Instant,
    /// When the service will make the message visible again.
    deadline: Instant,
    next_fire: Instant,
    retry_delay: Duration,
}

/// What the engine should do for a message whose timer fired.
pub(crate) enum ExtenderAction {
    /// Renew visibility for this message.
    Renew(Message),
    /// The message has been in flight past the extension ceiling; it was
    /// untracked and its visibility will be allowed to lapse.
    Expire(Message),
}

/// Tracks in-flight messages and schedules visibility renewals
/// `advance` ahead of each deadline, up to a wall-clock ceiling.
pub(crate) struct TimeoutExtender {
    tracked: HashMap<String, TrackedMessage>,
    /// How much visibility each successful renewal buys.
    extend_by: Duration,
    /// Lead time between a renewal call and the deadline it protects.
    advance: Duration,
    /// Total in-flight time after which extension stops.
    ceiling: Duration,
}

impl TimeoutExtender {
    pub(crate) fn new(extend_by: Duration, advance: Duration, ceiling: Duration) -> Self {
        Self {
            tracked: HashMap::new(),
            extend_by,
            advance,
            ceiling,
        }
    }

    pub(crate) fn track(&mut self, message: Message, now: Instant) {
        let deadline = now + self.extend_by;
        self.tracked.insert(
            message.receipt_handle().to_owned(),
            TrackedMessage {
                message,
                received_at: now,
                deadline,
                next_fire: Self::fire_at(deadline, self.advance),
                retry_delay: INITIAL_RETRY,
            },
        );
    }

    pub(crate) fn untrack(&mut self, receipt_handle: &str) {
        self.tracked.remove(receipt_handle);
    }

    /// The visibility each renewal call asks for.
    pub(crate) fn extend_by(&self) -> Duration {
        self.extend_by
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tracked.is_empty()
    }

    /// The earliest instant any tracked message needs attention.
    pub(crate) fn next_fire(&self) -> Option<Instant> {
        self.tracked.values().map(|t| t.next_fire).min()
    }

    /// Collects every message whose timer has fired. Expired messages are
    /// untracked here; renewals stay tracked pending
    /// [`renewed`][Self::renewed] / [`renewal_failed`][Self::renewal_failed].
    pub(crate) fn due(&mut self, now: Instant) -> Vec<ExtenderAction> {
        let mut actions = Vec::new();
        let mut expired = Vec::new();
        for (receipt, entry) in &self.tracked {
            if entry.next_fire > now {
                continue;
            }
            if now.duration_since(entry.received_at) >= self.ceiling {
                expired.push(receipt.clone());
            } else {
                actions.push(ExtenderAction::Renew(entry.message.clone()));
            }
        }
        for receipt in expired {
            let entry = self.tracked.remove(&receipt).expect("tracked");
            actions.push(ExtenderAction::Expire(entry.message));
        }
        actions
    }

    /// A renewal call succeeded: push the deadline out and re-arm.
    pub(crate) fn renewed(&mut self, receipt_handle: &str, now: Instant) {
        if let Some(entry) = self.tracked.get_mut(receipt_handle) {
            entry.deadline = now + self.extend_by;
            entry.next_fire = Self::fire_at(entry.deadline, self.advance);
            entry.retry_delay = INITIAL_RETRY;
        }
    }

    /// A renewal call failed: retry with exponential back-off, capped by
    /// the time still left before the current deadline. Once the deadline
    /// itself has passed the message is redelivered by the service anyway,
    /// so tracking stops.
    pub(crate) fn renewal_failed(&mut self, receipt_handle: &str, now: Instant) {
        let Some(entry) = self.tracked.get_mut(receipt_handle) else {
            return;
        };
        let Some(remaining) = entry.deadline.checked_duration_since(now) else {
            self.tracked.remove(receipt_handle);
            return;
        };
        entry.next_fire = now + entry.retry_delay.min(remaining);
        entry.retry_delay = entry.retry_delay.saturating_mul(2);
    }

    fn fire_at(deadline: Instant, advance: Duration) -> Instant {
        deadline.checked_sub(advance).unwrap_or(deadline)
    }
}
