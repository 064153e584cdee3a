//! Scan / detect / capture control loop

mod latency;
mod machine;
mod timer;

pub use latency::{LatencyStats, Stage};
pub use machine::{SensingConfig, SensingStateMachine};
pub use timer::SystemClock;

#[cfg(test)]
pub use timer::ManualClock;
