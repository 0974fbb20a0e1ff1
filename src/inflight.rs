//! In-flight message accounting.

/// Edge produced by a counter transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum InflightEdge {
    None,
    /// The count just climbed to the cap.
    CapReached,
    /// The count just fell to zero.
    Drained,
}

/// Counts messages handed to the application but not yet released, deleted
/// or declared handled.
///
/// Owned and mutated only by the engine task, so transitions are naturally
/// serialized; edges are reported as return values for the engine to turn
/// into events.
#[derive(Debug)]
pub(crate) struct InflightCounter {
    count: usize,
    /// `0` means unbounded.
    cap: usize,
}

impl InflightCounter {
    pub(crate) fn new(cap: usize) -> Self {
        Self { count: 0, cap }
    }

    pub(crate) fn value(&self) -> usize {
        self.count
    }

    pub(crate) fn at_cap(&self) -> bool {
        self.cap > 0 && self.count >= self.cap
    }

    /// Free slots under the cap, or `None` when unbounded.
    pub(crate) fn available(&self) -> Option<usize> {
        if self.cap == 0 {
            None
        } else {
            Some(self.cap.saturating_sub(self.count))
        }
    }

    pub(crate) fn increment(&mut self) -> InflightEdge {
        self.count += 1;
        if self.cap > 0 && self.count == self.cap {
            InflightEdge::CapReached
        } else {
            InflightEdge::None
        }
    }

    pub(crate) fn decrement(&mut self) -> InflightEdge {
        debug_assert!(self.count > 0, "decrement below zero");
        self.count = self.count.saturating_sub(1);
        if self.count == 0 {
            InflightEdge::Drained
        } else {
            InflightEdge::None
        }
    }
}
