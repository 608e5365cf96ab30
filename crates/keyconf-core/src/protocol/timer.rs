//! Owned single-shot deadlines
//!
//! Timers are plain values owned by the state machine that arms them. Nothing
//! fires on its own: the owner asks [`Deadline::fire`] when it is polled.

use std::time::{Duration, Instant};

/// Single-shot deadline, idle until started
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    /// A deadline that is not armed
    pub const fn idle() -> Self {
        Self { at: None }
    }

    /// Arm (or re-arm) the deadline `after` from `now`
    pub fn start(&mut self, now: Instant, after: Duration) {
        self.at = Some(now + after);
    }

    /// Disarm
    pub fn cancel(&mut self) {
        self.at = None;
    }

    /// Whether the deadline is armed
    pub fn is_active(&self) -> bool {
        self.at.is_some()
    }

    /// Expiry instant, if armed
    pub fn at(&self) -> Option<Instant> {
        self.at
    }

    /// Disarm and return true if the deadline has passed
    pub fn fire(&mut self, now: Instant) -> bool {
        match self.at {
            Some(at) if now >= at => {
                self.at = None;
                true
            }
            _ => false,
        }
    }
}

/// Earliest of a set of optional instants
pub fn earliest<I: IntoIterator<Item = Option<Instant>>>(deadlines: I) -> Option<Instant> {
    deadlines.into_iter().flatten().min()
}
