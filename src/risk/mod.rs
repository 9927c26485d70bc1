// Risk management module
pub mod cooldown;
pub mod loss_throttle;

pub use cooldown::CooldownClock;
pub use loss_throttle::LossThrottle;

use crate::models::Direction;

/// Why an entry signal was not acted on
#[derive(Debug, Clone, PartialEq)]
pub enum EntryBlock {
    /// A position is open or an order is in flight
    PositionBusy,
    /// An earlier exit left unresolved exposure
    Halted,
    Cooldown { remaining: u64 },
    LossStreak { direction: Direction, losses: u32 },
}

impl std::fmt::Display for EntryBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PositionBusy => write!(f, "position busy"),
            Self::Halted => write!(f, "trading halted until exposure is cleared"),
            Self::Cooldown { remaining } => write!(f, "cooldown ({} samples left)", remaining),
            Self::LossStreak { direction, losses } => {
                write!(f, "{} consecutive {} stop losses", losses, direction)
            }
        }
    }
}
