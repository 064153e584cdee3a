//! Threshold-based channel occupancy detection

use super::profile::{ChannelPowerProfile, NUM_CHANNELS};

/// Occupancy thresholds in dB
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    /// Channels between the guard channels and the edge channel
    pub interior_db: f32,
    /// Edge channel 14; its estimate comes from the spectrum tail
    pub edge_db: f32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            interior_db: -70.0,
            edge_db: -60.0,
        }
    }
}

/// Outcome of one detection pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DetectionResult {
    NoDetection,
    Detected { channel: u8, power_db: f32 },
}

/// Picks the strongest occupied channel
#[derive(Debug, Clone)]
pub struct ChannelDetector {
    channel_offset: usize,
    thresholds: Thresholds,
}

impl ChannelDetector {
    pub fn new(channel_offset: usize, thresholds: Thresholds) -> Self {
        Self {
            channel_offset,
            thresholds,
        }
    }

    /// Strongest eligible channel strictly above its threshold.
    ///
    /// Equal powers keep the lower channel.
    pub fn detect(&self, profile: &ChannelPowerProfile) -> DetectionResult {
        let mut best: Option<(usize, f32)> = None;

        for channel in self.channel_offset..NUM_CHANNELS {
            let Some(power) = profile.power(channel) else {
                continue;
            };
            if power <= self.threshold(channel) {
                continue;
            }
            match best {
                Some((_, best_power)) if power <= best_power => {}
                _ => best = Some((channel, power)),
            }
        }

        match best {
            Some((channel, power_db)) => DetectionResult::Detected {
                channel: channel as u8,
                power_db,
            },
            None => DetectionResult::NoDetection,
        }
    }

    fn threshold(&self, channel: usize) -> f32 {
        if channel == NUM_CHANNELS - 1 {
            self.thresholds.edge_db
        } else {
            self.thresholds.interior_db
        }
    }
}
