//! Batch assembly for deletes and sends.
//!
//! Deletes are demand-driven: acknowledgements trickle in from handlers and
//! are held until either the batch fills or a time threshold lapses, so a
//! slow trickle still gets acknowledged promptly. Sends are caller-driven:
//! the caller already has the whole set, so it is chunked to the service cap
//! and dispatched in parallel.

use std::{collections::VecDeque, time::Duration};

use tokio::{sync::oneshot, time::Instant};

use crate::{
    config::MAX_BATCH,
    message::Message,
    service::{BatchResult, SendEntry, SendOptions, SendReceipt},
    Result,
};

/// An acknowledgement waiting for the next delete batch.
pub(crate) struct PendingDelete {
    pub(crate) message: Message,
    /// Resolved with this entry's outcome when its batch lands.
    pub(crate) done: Option<oneshot::Sender<Result<()>>>,
}

/// Accumulates delete entries and decides when to flush.
///
/// The owner (the engine) calls [`enqueue`][Self::enqueue] and flushes when
/// it returns `true` or when [`deadline`][Self::deadline] passes. The timer
/// is cleared by [`take_batch`][Self::take_batch] so a flush never leaves a
/// ghost deadline behind, and [`after_flush`][Self::after_flush] re-arms it
/// while entries remain.
pub(crate) struct DeleteBatcher {
    pending: VecDeque<PendingDelete>,
    deadline: Option<Instant>,
    batch_size: usize,
    max_wait: Duration,
}

impl DeleteBatcher {
    pub(crate) fn new(batch_size: usize, max_wait: Duration) -> Self {
        Self {
            pending: VecDeque::new(),
            deadline: None,
            batch_size: batch_size.clamp(1, MAX_BATCH),
            max_wait,
        }
    }

    /// Queues one acknowledgement. Returns `true` when the size threshold
    /// is met and the caller should flush immediately.
    pub(crate) fn enqueue(&mut self, entry: PendingDelete) -> bool {
        self.pending.push_back(entry);
        if self.pending.len() >= self.batch_size {
            self.deadline = None;
            true
        } else {
            if self.deadline.is_none() {
                self.deadline = Some(Instant::now() + self.max_wait);
            }
            false
        }
    }

    /// The instant at which a partial batch must be flushed anyway.
    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Takes up to one service call's worth of entries and clears the
    /// timer.
    pub(crate) fn take_batch(&mut self) -> Vec<PendingDelete> {
        self.deadline = None;
        let n = self.pending.len().min(MAX_BATCH);
        self.pending.drain(..n).collect()
    }

    /// Called once a flush has landed. Returns `true` when enough entries
    /// accumulated during the flush to warrant another one right away;
    /// otherwise re-arms the timer for any stragglers.
    pub(crate) fn after_flush(&mut self) -> bool {
        if self.pending.len() >= self.batch_size {
            true
        } else {
            if !self.pending.is_empty() && self.deadline.is_none() {
                self.deadline = Some(Instant::now() + self.max_wait);
            }
            false
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}

/// Splits caller-supplied bodies into service-sized send batches, assigning
/// the stable entry IDs `"0".."N-1"` that the merged result is ordered by.
pub(crate) fn chunk_send_entries(bodies: Vec<String>, opts: &SendOptions) -> Vec<Vec<SendEntry>> {
    let entries: Vec<SendEntry> = bodies
        .into_iter()
        .enumerate()
        .map(|(i, body)| SendEntry {
            id: i.to_string(),
            body,
            delay: opts.delay,
            attributes: opts.attributes.clone(),
            message_group_id: opts.message_group_id.clone(),
            deduplication_id: opts.deduplication_id.clone(),
        })
        .collect();

    let mut chunks = Vec::with_capacity(entries.len().div_ceil(MAX_BATCH));
    let mut entries = entries.into_iter().peekable();
    while entries.peek().is_some() {
        chunks.push(entries.by_ref().take(MAX_BATCH).collect());
    }
    chunks
}

/// Merges per-chunk results back into one, ordered by entry ID so the
/// output lines up with the caller's input.
pub(crate) fn merge_batch_results(
    results: Vec<BatchResult<SendReceipt>>,
) -> BatchResult<SendReceipt> {
    let mut merged = BatchResult::default();
    for result in results {
        merged.successful.extend(result.successful);
        merged.failed.extend(result.failed);
    }
    let by_id = |id: &str| id.parse::<usize>().unwrap_or(usize::MAX);
    merged.successful.sort_by_key(|r| by_id(&r.id));
    merged.failed.sort_by_key(|f| by_id(&f.id));
    merged
}
