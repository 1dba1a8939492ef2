//! PendingForward queue - forwards waiting for the balance to catch up.
//!
//! Lives inside the ledger lock. The balance worker is the only consumer, and
//! an entry is removed before its retry runs, so a forward cannot fire twice
//! no matter how often the balance crosses its threshold.

use bitcoin::Address;
use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingForward {
    pub destination: Address,
    pub amount_sat: u64,
    pub attempts: u32,
    pub last_failure: String,
    /// Available balance (sat) at which a retry makes sense.
    pub threshold: u64,
}

impl PendingForward {
    pub fn new(destination: Address, amount_sat: u64, threshold: u64, reason: impl Into<String>) -> Self {
        Self { destination, amount_sat, attempts: 1, last_failure: reason.into(), threshold: threshold.max(amount_sat) }
    }

    /// Record another failed attempt.
    pub fn retried(mut self, threshold: u64, reason: impl Into<String>) -> Self {
        self.attempts += 1;
        self.threshold = threshold.max(self.amount_sat);
        self.last_failure = reason.into();
        self
    }
}

#[derive(Debug, Default)]
pub struct PendingQueue {
    items: VecDeque<PendingForward>,
}

impl PendingQueue {
    pub fn push(&mut self, pending: PendingForward) {
        self.items.push_back(pending);
    }

    /// Remove and return, in FIFO order, every entry whose threshold is met.
    pub fn take_ready(&mut self, available: u64) -> Vec<PendingForward> {
        let (ready, waiting): (Vec<_>, Vec<_>) = self.items.drain(..).partition(|p| p.threshold <= available);
        self.items = waiting.into();
        ready
    }

    pub fn len(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }
    pub fn iter(&self) -> impl Iterator<Item = &PendingForward> { self.items.iter() }
}
