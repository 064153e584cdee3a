//! Channel power aggregation
//!
//! Maps contiguous bin spans of a DC-centred spectrum onto the 15 band
//! channels and averages them. The first `channel_offset` channels are guard
//! channels: they have no span and are never eligible for detection.
//!
//! Interior channel `i` (offset <= i < 14) spans
//! `[(i - offset + 1) * step + start_trim, (i - offset + 2) * step + start_trim)`.
//! The edge channel 14 is taken from the trailing `step` bins, `end_trim` bins
//! in from the end of the spectrum.

use std::ops::Range;

use thiserror::Error;

use super::profile::{ChannelPowerProfile, PowerSpectrum, NUM_CHANNELS};

/// Index of the edge channel, computed from the tail of the spectrum
const EDGE_CHANNEL: usize = NUM_CHANNELS - 1;

/// Spectrum does not cover the channel layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("spectrum too short: {len} bins, layout needs at least {required}")]
pub struct SpectrumTooShortError {
    pub len: usize,
    pub required: usize,
}

/// Fixed bin layout of the band channels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelLayout {
    /// Bins per channel
    pub step: usize,
    /// Number of leading guard channels
    pub channel_offset: usize,
    /// Bins skipped before the first interior span
    pub start_trim: usize,
    /// Bins skipped after the edge channel span
    pub end_trim: usize,
}

impl ChannelLayout {
    /// Minimum spectrum length that keeps every span in range and
    /// non-overlapping.
    pub fn required_len(&self) -> usize {
        let interior_end = if self.channel_offset < EDGE_CHANNEL {
            (EDGE_CHANNEL - self.channel_offset + 1) * self.step + self.start_trim
        } else {
            0
        };
        interior_end + self.step + self.end_trim
    }

    /// Bin span of `channel` in a spectrum of `len` bins.
    ///
    /// Guard channels and out-of-range indices have no span. The edge
    /// channel has none if the spectrum is shorter than `step + end_trim`.
    pub fn span(&self, channel: usize, len: usize) -> Option<Range<usize>> {
        if channel >= NUM_CHANNELS || channel < self.channel_offset {
            return None;
        }
        if channel == EDGE_CHANNEL {
            let end = len.checked_sub(self.end_trim)?;
            let start = end.checked_sub(self.step)?;
            return Some(start..end);
        }
        let k = channel - self.channel_offset;
        let start = (k + 1) * self.step + self.start_trim;
        Some(start..start + self.step)
    }
}

impl Default for ChannelLayout {
    fn default() -> Self {
        // 512-point FFT -> 511 DC-centred bins, 34 bins per 10 MHz channel
        Self {
            step: 34,
            channel_offset: 5,
            start_trim: 1,
            end_trim: 1,
        }
    }
}

/// Reduces a power spectrum to per-channel averages
#[derive(Debug, Clone)]
pub struct SpectrumAggregator {
    layout: ChannelLayout,
}

impl SpectrumAggregator {
    pub fn new(layout: ChannelLayout) -> Self {
        Self { layout }
    }

    /// Average every channel span of `spectrum` into `profile`.
    ///
    /// The length check happens before any entry is written, so on error
    /// the profile still holds the previous complete pass.
    pub fn aggregate(
        &self,
        spectrum: &PowerSpectrum,
        profile: &mut ChannelPowerProfile,
    ) -> Result<(), SpectrumTooShortError> {
        let len = spectrum.len();
        let required = self.layout.required_len();
        if len < required {
            return Err(SpectrumTooShortError { len, required });
        }

        let bins = spectrum.bins();
        for channel in 0..NUM_CHANNELS {
            let power = self
                .layout
                .span(channel, len)
                .and_then(|span| mean(&bins[span]));
            profile.set_power(channel, power);
        }
        Ok(())
    }
}

fn mean(bins: &[f32]) -> Option<f32> {
    if bins.is_empty() {
        return None;
    }
    let sum: f64 = bins.iter().map(|&b| b as f64).sum();
    Some((sum / bins.len() as f64) as f32)
}
