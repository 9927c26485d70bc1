use serde::{Deserialize, Serialize};

/// Minimum spacing, in samples, between closing a trade and opening the next
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CooldownClock {
    pub cooldown_length: u64,
    last_trade_close_sample_index: Option<u64>,
}

impl CooldownClock {
    pub fn new(cooldown_length: u64) -> Self {
        Self {
            cooldown_length,
            last_trade_close_sample_index: None,
        }
    }

    pub fn record_close(&mut self, sample_index: u64) {
        self.last_trade_close_sample_index = Some(sample_index);
    }

    pub fn last_close(&self) -> Option<u64> {
        self.last_trade_close_sample_index
    }

    /// Samples left before entries are allowed again (0 = elapsed)
    pub fn remaining(&self, current_sample_index: u64) -> u64 {
        match self.last_trade_close_sample_index {
            None => 0,
            Some(closed_at) => {
                let elapsed = current_sample_index.saturating_sub(closed_at);
                self.cooldown_length.saturating_sub(elapsed)
            }
        }
    }

    pub fn is_elapsed(&self, current_sample_index: u64) -> bool {
        self.remaining(current_sample_index) == 0
    }
}
