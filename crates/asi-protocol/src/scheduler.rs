//! Periodic logging scheduler.
//!
//! Two states, idle and active. While active, the first tick after
//! activation fires immediately and fixes the epoch; later ticks fire once the
//! elapsed time since the epoch reaches the next due offset, which then grows
//! by exactly one interval. Due times therefore stay on the
//! `epoch + k * interval` grid no matter how irregular the ticks are.

use crate::constants::*;

/// Scheduler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingState {
    Idle,
    Active,
}

/// Decides when a periodic data telegram is due.
#[derive(Debug, Clone)]
pub struct LoggingScheduler {
    state: LoggingState,
    interval_ms: u64,
    first_fire_pending: bool,
    epoch_ms: u64,
    next_due_ms: u64,
}

impl Default for LoggingScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl LoggingScheduler {
    /// Idle scheduler with the default interval.
    pub fn new() -> Self {
        LoggingScheduler {
            state: LoggingState::Idle,
            interval_ms: LOGGING_DEFAULT_INTERVAL_MS,
            first_fire_pending: false,
            epoch_ms: 0,
            next_due_ms: LOGGING_DEFAULT_INTERVAL_MS,
        }
    }

    /// Activate with an interval in milliseconds; zero selects the floor.
    pub fn activate(&mut self, interval_ms: u64) {
        let interval_ms = if interval_ms == 0 {
            LOGGING_MIN_INTERVAL_MS
        } else {
            interval_ms
        };
        self.interval_ms = interval_ms;
        self.next_due_ms = interval_ms;
        self.first_fire_pending = true;
        self.state = LoggingState::Active;
    }

    /// Activate with an interval in seconds, as carried by `LOGGING_ACTIVATE`.
    pub fn activate_seconds(&mut self, interval_s: u32) {
        let interval_s = interval_s.min(LOGGING_MAX_INTERVAL_S) as u64;
        self.activate(interval_s * LOGGING_UNIT_MS);
    }

    /// Stop firing. The interval is kept.
    pub fn deactivate(&mut self) {
        self.state = LoggingState::Idle;
    }

    /// Current state.
    pub fn state(&self) -> LoggingState {
        self.state
    }

    /// Whether periodic telegrams are enabled.
    pub fn is_active(&self) -> bool {
        self.state == LoggingState::Active
    }

    /// Effective interval in milliseconds.
    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    /// Absolute time of the next firing, if active and past the first tick.
    pub fn next_due_at(&self) -> Option<u64> {
        (self.is_active() && !self.first_fire_pending)
            .then(|| self.epoch_ms.wrapping_add(self.next_due_ms))
    }

    /// Advance the scheduler to `now_ms`. Returns `true` if a telegram is due.
    pub fn tick(&mut self, now_ms: u64) -> bool {
        if self.state != LoggingState::Active {
            return false;
        }

        if self.first_fire_pending {
            self.first_fire_pending = false;
            self.epoch_ms = now_ms;
            return true;
        }

        let elapsed = now_ms.wrapping_sub(self.epoch_ms);
        if elapsed >= self.next_due_ms {
            self.next_due_ms += self.interval_ms;
            return true;
        }
        false
    }
}
