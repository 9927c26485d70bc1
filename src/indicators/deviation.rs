use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::moving_average::deviation_pct;
use crate::models::PriceSample;

/// When the rolling mean is recomputed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RefreshMode {
    /// Recompute the mean on every observed price
    #[default]
    PerSample,
    /// Recompute only when `refresh` is called (driven by a wall-clock timer)
    Periodic,
}

/// Rolling-window moving average and deviation signal
///
/// Keeps at most `window_length` prices with a running sum, so each
/// observation is O(1). The mean is only defined once the window is full.
///
/// In `Periodic` mode every price is still buffered, but both the mean and
/// the deviation only move when `refresh` runs; `observe` hands back the
/// deviation computed at the last refresh.
#[derive(Debug, Clone)]
pub struct DeviationIndicator {
    window_length: usize,
    mode: RefreshMode,
    samples: VecDeque<PriceSample>,
    running_sum: Decimal,
    current_mean: Option<Decimal>,
    last_deviation: Option<Decimal>,
}

impl DeviationIndicator {
    pub fn new(window_length: usize, mode: RefreshMode) -> Self {
        Self {
            window_length,
            mode,
            samples: VecDeque::with_capacity(window_length + 1),
            running_sum: Decimal::ZERO,
            current_mean: None,
            last_deviation: None,
        }
    }

    /// Buffer `price` and return its deviation from the mean, in percent
    ///
    /// Returns None while the window is warming up (or, in periodic mode,
    /// until the first successful refresh).
    pub fn observe(&mut self, price: Decimal) -> Option<Decimal> {
        self.observe_at(price, Utc::now())
    }

    /// Same as `observe`, stamped with the event's receive time
    pub fn observe_at(&mut self, price: Decimal, received_at: DateTime<Utc>) -> Option<Decimal> {
        self.push(PriceSample { price, received_at });

        if self.mode == RefreshMode::PerSample {
            self.recompute();
        }
        self.last_deviation
    }

    /// Recompute the mean and the deviation of the latest buffered price
    ///
    /// Returns the new mean, or None if the window is not full yet.
    pub fn refresh(&mut self) -> Option<Decimal> {
        self.recompute();
        self.current_mean
    }

    pub fn current_mean(&self) -> Option<Decimal> {
        self.current_mean
    }

    pub fn last_deviation(&self) -> Option<Decimal> {
        self.last_deviation
    }

    pub fn is_warm(&self) -> bool {
        self.samples.len() >= self.window_length
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn window_length(&self) -> usize {
        self.window_length
    }

    fn push(&mut self, sample: PriceSample) {
        self.running_sum += sample.price;
        self.samples.push_back(sample);

        while self.samples.len() > self.window_length {
            if let Some(evicted) = self.samples.pop_front() {
                self.running_sum -= evicted.price;
            }
        }
    }

    fn recompute(&mut self) {
        self.current_mean = self.window_mean();
        self.last_deviation = match (self.current_mean, self.samples.back()) {
            (Some(mean), Some(latest)) => deviation_pct(latest.price, mean),
            _ => None,
        };
    }

    fn window_mean(&self) -> Option<Decimal> {
        if self.window_length == 0 || !self.is_warm() {
            return None;
        }
        Some(self.running_sum / Decimal::from(self.window_length))
    }
}
