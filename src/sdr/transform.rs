//! Log-power DFT of complex sample blocks
//!
//! Produces the DC-centred spectrum the channel aggregator expects:
//! `10 * log10(|X[k]|^2 / N^2)` per bin, re-ordered so DC sits in the middle.

use std::sync::Arc;

use rustfft::num_complex::Complex32;
use rustfft::{Fft, FftPlanner};

use crate::spectrum::PowerSpectrum;

/// Floor for empty bins so log10 stays finite (-200 dB)
const POWER_FLOOR: f32 = 1e-20;

/// Converts a block of complex samples into a power spectrum
pub trait SpectralTransform: Send {
    fn transform(&mut self, block: &[Complex32]) -> PowerSpectrum;
}

/// FFT-based log-power transform with a cached plan
pub struct LogPowerFft {
    size: usize,
    fft: Arc<dyn Fft<f32>>,
    buffer: Vec<Complex32>,
    scratch: Vec<Complex32>,
    raw: Vec<f32>,
}

impl LogPowerFft {
    pub fn new(size: usize) -> Self {
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(size);
        let scratch = vec![Complex32::new(0.0, 0.0); fft.get_inplace_scratch_len()];

        Self {
            size,
            fft,
            buffer: vec![Complex32::new(0.0, 0.0); size],
            scratch,
            raw: vec![0.0; size],
        }
    }
}

impl SpectralTransform for LogPowerFft {
    /// Blocks shorter than the FFT size are zero padded, longer ones truncated
    fn transform(&mut self, block: &[Complex32]) -> PowerSpectrum {
        let n = block.len().min(self.size);
        self.buffer[..n].copy_from_slice(&block[..n]);
        for s in &mut self.buffer[n..] {
            *s = Complex32::new(0.0, 0.0);
        }

        self.fft
            .process_with_scratch(&mut self.buffer, &mut self.scratch);

        let norm = (self.size as f32) * (self.size as f32);
        for (out, x) in self.raw.iter_mut().zip(self.buffer.iter()) {
            *out = 10.0 * (x.norm_sqr() / norm).max(POWER_FLOOR).log10();
        }

        PowerSpectrum::from_fft_order(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    #[test]
    fn test_tone_lands_in_expected_bin() {
        let size = 512;
        let mut fft = LogPowerFft::new(size);

        // Tone exactly on bin +32
        let block: Vec<Complex32> = (0..size)
            .map(|n| {
                let phase = 2.0 * PI * 32.0 * n as f32 / size as f32;
                Complex32::new(phase.cos(), phase.sin())
            })
            .collect();

        let spectrum = fft.transform(&block);
        assert_eq!(spectrum.len(), 511);

        let (peak, peak_db) = spectrum
            .bins()
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::MIN), |best, (i, p)| if p > best.1 { (i, p) } else { best });
        assert_eq!(peak, spectrum.len() / 2 + 32);
        // Unit amplitude tone -> 0 dB after 1/N^2 normalisation
        assert!(peak_db.abs() < 0.1, "peak {} dB", peak_db);
    }

    #[test]
    fn test_silence_hits_floor() {
        let mut fft = LogPowerFft::new(64);
        let spectrum = fft.transform(&[Complex32::new(0.0, 0.0); 64]);
        assert!(spectrum.bins().iter().all(|&p| (p + 200.0).abs() < 1e-3));
    }
}
