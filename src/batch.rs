//! Time-windowed batching
//!
//! Samples trickle in at the radio's whim. Consumers that care about rate (plots,
//! sockets) would rather see one batch every window, so we buffer and release on a
//! timer. The caller supplies `now`, which keeps the batcher deterministic under test.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Shortest window a batcher will run with
pub const MIN_WINDOW: Duration = Duration::from_millis(1);

/// How the next push deadline is derived after a flush
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchAnchor {
    /// `flush instant + window`. Under load the cadence stretches instead of bursting.
    #[default]
    FromFlush,
    /// Stay on the initial `start + k * window` grid, skipping slots already missed
    Schedule,
}

#[derive(Debug)]
pub struct Batcher<T> {
    window: Duration,
    anchor: BatchAnchor,
    next_push: Instant,
    buffer: Vec<T>,
}

impl<T> Batcher<T> {
    /// `window` is clamped to at least [`MIN_WINDOW`]
    pub fn new(window: Duration, anchor: BatchAnchor, now: Instant) -> Self {
        let window = window.max(MIN_WINDOW);
        Self {
            window,
            anchor,
            next_push: now + window,
            buffer: Vec::new(),
        }
    }

    pub fn extend(&mut self, items: impl IntoIterator<Item = T>) {
        self.buffer.extend(items);
    }

    /// Release the buffer if the deadline has passed. Empty windows produce no batch
    /// but still move the deadline.
    pub fn poll(&mut self, now: Instant) -> Option<Vec<T>> {
        if now < self.next_push {
            return None;
        }
        self.next_push = match self.anchor {
            BatchAnchor::FromFlush => now + self.window,
            BatchAnchor::Schedule => {
                let mut next = self.next_push;
                while next <= now {
                    next += self.window;
                }
                next
            }
        };
        self.flush()
    }

    /// Append and poll in one step
    pub fn push(&mut self, items: impl IntoIterator<Item = T>, now: Instant) -> Option<Vec<T>> {
        self.extend(items);
        self.poll(now)
    }

    /// Unconditionally release whatever is buffered
    pub fn flush(&mut self) -> Option<Vec<T>> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }

    /// Time left before the next deadline, zero if it already passed
    pub fn time_to_push(&self, now: Instant) -> Duration {
        self.next_push.saturating_duration_since(now)
    }

    pub fn next_push(&self) -> Instant {
        self.next_push
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}
