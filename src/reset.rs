// src/reset.rs - Reset request latch shared between the command handler and the emit loop

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Single-flag rendezvous between the `reset` command and the emit loop.
///
/// Any number of [`request`](Self::request) calls before the next
/// [`consume_if_set`](Self::consume_if_set) collapse into one reset. Clones
/// share the same flag.
///
/// ```rust
/// use tempsim::ResetLatch;
///
/// let latch = ResetLatch::new();
/// latch.request();
/// latch.request();
/// assert!(latch.consume_if_set());
/// assert!(!latch.consume_if_set());
/// ```
#[derive(Debug, Clone, Default)]
pub struct ResetLatch {
    pending: Arc<AtomicBool>,
}

impl ResetLatch {
    /// Latch with no reset pending
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask for a reset on the next tick. Idempotent.
    pub fn request(&self) {
        self.pending.store(true, Ordering::Release);
    }

    /// Atomically test and clear the flag
    pub fn consume_if_set(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }

    /// Peek at the flag without clearing it
    ///
    /// ```rust
    /// # use tempsim::ResetLatch;
    /// let latch = ResetLatch::new();
    /// latch.request();
    /// assert!(latch.is_pending());
    /// assert!(latch.is_pending());
    /// assert!(latch.consume_if_set());
    /// assert!(!latch.is_pending());
    /// ```
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }
}
