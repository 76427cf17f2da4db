// src/kernel/scheduler/mod.rs
//! Round-robin scheduler
//!
//! A ring of runnable processes and a cursor. Every scheduling decision
//! advances the cursor to the next slot. Ties break FIFO; queue
//! operations are O(n).

use crate::kernel::process::Pid;
use lazy_static::lazy_static;
use spin::Mutex;

/// Simple round-robin scheduler
pub struct RoundRobinScheduler {
    queue: alloc::vec::Vec<Pid>,
    cursor: usize,
}

impl RoundRobinScheduler {
    /// Create an empty scheduler
    #[must_use]
    pub const fn new() -> Self {
        Self {
            queue: alloc::vec::Vec::new(),
            cursor: 0,
        }
    }

    /// Append a process to the ring (duplicates are ignored)
    pub fn add(&mut self, pid: Pid) {
        if !self.queue.contains(&pid) {
            self.queue.push(pid);
        }
    }

    /// Drop a process from the ring
    pub fn remove(&mut self, pid: Pid) {
        if let Some(index) = self.queue.iter().position(|&p| p == pid) {
            self.queue.remove(index);
            if index < self.cursor {
                self.cursor -= 1;
            }
            if self.cursor >= self.queue.len() {
                self.cursor = 0;
            }
        }
    }

    /// Advance the cursor one slot and return the candidate
    pub fn rotate(&mut self) -> Option<Pid> {
        if self.queue.is_empty() {
            return None;
        }
        self.cursor = (self.cursor + 1) % self.queue.len();
        Some(self.queue[self.cursor])
    }

    /// Number of processes on the ring
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Empty the ring (test setup)
    pub fn clear(&mut self) {
        self.queue.clear();
        self.cursor = 0;
    }
}

impl Default for RoundRobinScheduler {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static! {
    /// Global scheduler
    pub static ref SCHEDULER: Mutex<RoundRobinScheduler> =
        Mutex::new(RoundRobinScheduler::new());
}
