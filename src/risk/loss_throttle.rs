use serde::{Deserialize, Serialize};

use crate::models::Direction;

/// Consecutive stop-loss counters per direction
///
/// A profit exit clears the counter for its direction, a stop-loss exit bumps
/// it. A signal in the opposite direction clears the opposing counter. At the
/// cap, entries in that direction are refused.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LossThrottle {
    pub max_consecutive_losses: u32,
    long_losses: u32,
    short_losses: u32,
}

impl Default for LossThrottle {
    fn default() -> Self {
        Self::new(2)
    }
}

impl LossThrottle {
    pub fn new(max_consecutive_losses: u32) -> Self {
        Self {
            max_consecutive_losses,
            long_losses: 0,
            short_losses: 0,
        }
    }

    pub fn consecutive_losses(&self, direction: Direction) -> u32 {
        match direction {
            Direction::Long => self.long_losses,
            Direction::Short => self.short_losses,
        }
    }

    fn counter_mut(&mut self, direction: Direction) -> &mut u32 {
        match direction {
            Direction::Long => &mut self.long_losses,
            Direction::Short => &mut self.short_losses,
        }
    }

    /// True while `direction` is below the loss cap
    pub fn allows(&self, direction: Direction) -> bool {
        self.consecutive_losses(direction) < self.max_consecutive_losses
    }

    pub fn record_stop_loss(&mut self, direction: Direction) -> u32 {
        let counter = self.counter_mut(direction);
        *counter += 1;
        *counter
    }

    pub fn record_profit(&mut self, direction: Direction) {
        *self.counter_mut(direction) = 0;
    }

    /// A signal fired in `direction`; clears the opposing streak
    ///
    /// Returns true if the opposing counter was non-zero.
    pub fn record_signal(&mut self, direction: Direction) -> bool {
        let opposing = self.counter_mut(direction.opposite());
        let was_set = *opposing > 0;
        *opposing = 0;
        was_set
    }
}
