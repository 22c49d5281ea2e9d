//! Accepted-connection counter shared between the accept loop and the reporter.

use std::sync::atomic::{AtomicU64, Ordering};

/// Running total of accepted connections.
///
/// The accept loop is the only writer. Readers take snapshots; nothing ever
/// decrements the value.
#[derive(Debug, Default)]
pub struct ConnectionCounter {
    accepted: AtomicU64,
}

impl ConnectionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one accepted connection, returning the new total.
    pub fn increment(&self) -> u64 {
        self.accepted.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Current total since process start.
    pub fn snapshot(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }
}
