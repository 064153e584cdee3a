//! Spectral power aggregation and occupancy detection
//!
//! The pipeline for one scan tick:
//! 1. Log-power spectrum (DC-centred, odd length) from the spectral transform
//! 2. Average contiguous bin spans into 15 channel powers
//! 3. Pick the strongest channel above its occupancy threshold

mod aggregate;
mod band;
mod detect;
mod profile;

pub use aggregate::{ChannelLayout, SpectrumAggregator, SpectrumTooShortError};
pub use band::BandPlan;
pub use detect::{ChannelDetector, DetectionResult, Thresholds};
pub use profile::{ChannelPowerProfile, PowerSpectrum, NUM_CHANNELS};
