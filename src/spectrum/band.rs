//! Channel frequency plan

/// Maps channel indices to RF centre frequencies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandPlan {
    /// Lower edge of channel 0 in Hz
    pub base_freq_hz: u64,
    /// Channel width in Hz
    pub channel_width_hz: u64,
    /// Frequency the receiver parks on while scanning
    pub home_freq_hz: u64,
}

impl BandPlan {
    /// Centre frequency of `channel`: base + channel * width + width / 2
    pub fn center_freq(&self, channel: u8) -> u64 {
        self.base_freq_hz + channel as u64 * self.channel_width_hz + self.channel_width_hz / 2
    }
}

impl Default for BandPlan {
    fn default() -> Self {
        Self {
            base_freq_hz: 3_550_000_000,
            channel_width_hz: 10_000_000,
            home_freq_hz: 3_650_000_000,
        }
    }
}
