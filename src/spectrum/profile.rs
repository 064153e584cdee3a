//! Spectrum and per-channel power types

/// Number of channels in the monitored band (3550-3700 MHz, 10 MHz each)
pub const NUM_CHANNELS: usize = 15;

/// Ordered log-power bins with DC at the centre index
///
/// Always odd length. Built once per sample block and never modified.
#[derive(Debug, Clone, PartialEq)]
pub struct PowerSpectrum {
    bins: Vec<f32>,
}

impl PowerSpectrum {
    /// Wrap bins that are already in DC-centred order
    pub fn new(bins: Vec<f32>) -> Self {
        Self { bins }
    }

    /// Re-order raw FFT output so DC lands in the middle.
    ///
    /// An even-length input drops its last bin to make the result odd.
    pub fn from_fft_order(raw: &[f32]) -> Self {
        if raw.is_empty() {
            return Self { bins: Vec::new() };
        }
        let len = raw.len() - 1 + raw.len() % 2;
        let shift = (len + 1) / 2;
        let bins = (0..len).map(|n| raw[(n + shift) % len]).collect();
        Self { bins }
    }

    pub fn bins(&self) -> &[f32] {
        &self.bins
    }

    pub fn len(&self) -> usize {
        self.bins.len()
    }

}

/// Average power of one channel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelEntry {
    pub channel_index: u8,
    /// `None` for guard channels, which have no bin span
    pub average_power_db: Option<f32>,
}

/// Per-channel average powers for the whole band
///
/// There is one live profile per sensing loop. It is only written by a
/// complete aggregation pass, so readers never see a half-updated profile.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelPowerProfile {
    entries: [ChannelEntry; NUM_CHANNELS],
}

impl ChannelPowerProfile {
    pub fn new() -> Self {
        let mut entries = [ChannelEntry {
            channel_index: 0,
            average_power_db: None,
        }; NUM_CHANNELS];
        for (i, entry) in entries.iter_mut().enumerate() {
            entry.channel_index = i as u8;
        }
        Self { entries }
    }

    pub fn entries(&self) -> &[ChannelEntry; NUM_CHANNELS] {
        &self.entries
    }

    /// Power of a channel, `None` for guard channels or out-of-range indices
    pub fn power(&self, channel: usize) -> Option<f32> {
        self.entries.get(channel).and_then(|e| e.average_power_db)
    }

    pub(crate) fn set_power(&mut self, channel: usize, power_db: Option<f32>) {
        self.entries[channel].average_power_db = power_db;
    }
}

impl Default for ChannelPowerProfile {
    fn default() -> Self {
        Self::new()
    }
}
