//! Synthetic front-end for dry runs without hardware
//!
//! Produces complex Gaussian-ish noise plus an optional carrier at a fixed
//! RF frequency, so the scan/detect/capture cycle can run end to end.

use std::f64::consts::PI;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustfft::num_complex::Complex32;

use super::frontend::{
    AppliedConfig, FrontEndSettings, HardwareError, RadioFrontEnd, RxMetadata, StreamMode,
};

/// A continuous-wave signal in the simulated band
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Carrier {
    pub freq_hz: u64,
    pub amplitude: f32,
}

pub struct SimulatedFrontEnd {
    settings: Option<FrontEndSettings>,
    mode: Option<StreamMode>,
    /// Samples left in a finite stream
    remaining: usize,
    noise_amplitude: f32,
    carrier: Option<Carrier>,
    phase: f64,
    rng: StdRng,
}

impl SimulatedFrontEnd {
    pub fn new(noise_amplitude: f32, carrier: Option<Carrier>, seed: u64) -> Self {
        Self {
            settings: None,
            mode: None,
            remaining: 0,
            noise_amplitude,
            carrier,
            phase: 0.0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Carrier offset from the current centre in cycles per sample, if it is
    /// inside the sampled bandwidth
    fn carrier_step(&self, settings: &FrontEndSettings) -> Option<(f64, f32)> {
        let carrier = self.carrier?;
        let offset = carrier.freq_hz as f64 - settings.center_freq_hz as f64;
        if offset.abs() >= settings.sample_rate_hz / 2.0 {
            return None;
        }
        Some((offset / settings.sample_rate_hz, carrier.amplitude))
    }

    fn noise(&mut self) -> f32 {
        // Sum of uniforms, close enough to Gaussian for a noise floor
        let s: f32 = (0..4).map(|_| self.rng.gen::<f32>() - 0.5).sum();
        s * self.noise_amplitude
    }
}

impl RadioFrontEnd for SimulatedFrontEnd {
    fn configure(&mut self, settings: &FrontEndSettings) -> Result<AppliedConfig, HardwareError> {
        if settings.sample_rate_hz <= 0.0 {
            return Err(HardwareError::Configure(format!(
                "invalid sample rate {}",
                settings.sample_rate_hz
            )));
        }
        self.settings = Some(settings.clone());
        Ok(AppliedConfig {
            sample_rate_hz: settings.sample_rate_hz,
            center_freq_hz: settings.center_freq_hz,
            gain_db: settings.gain_db,
            bandwidth_hz: settings.bandwidth_hz.or(Some(settings.sample_rate_hz)),
        })
    }

    fn start_streaming(&mut self, mode: StreamMode) -> Result<(), HardwareError> {
        if self.settings.is_none() {
            return Err(HardwareError::StreamStart("front-end not configured".to_string()));
        }
        if let StreamMode::NumSamples(n) = mode {
            self.remaining = n;
        }
        self.mode = Some(mode);
        Ok(())
    }

    fn stop_streaming(&mut self) {
        self.mode = None;
        self.remaining = 0;
    }

    fn receive(&mut self, buf: &mut [Complex32]) -> Result<(usize, RxMetadata), HardwareError> {
        let mode = self.mode.ok_or(HardwareError::NotStreaming)?;
        let settings = self.settings.clone().ok_or(HardwareError::NotStreaming)?;

        let n = match mode {
            StreamMode::Continuous => buf.len(),
            StreamMode::NumSamples(_) => {
                let n = buf.len().min(self.remaining);
                self.remaining -= n;
                n
            }
        };

        let carrier = self.carrier_step(&settings);
        for sample in &mut buf[..n] {
            let mut s = Complex32::new(self.noise(), self.noise());
            if let Some((step, amplitude)) = carrier {
                let (sin, cos) = (2.0 * PI * self.phase).sin_cos();
                s += Complex32::new(cos as f32, sin as f32) * amplitude;
                self.phase = (self.phase + step).rem_euclid(1.0);
            }
            *sample = s;
        }

        Ok((n, RxMetadata { received_at: Instant::now() }))
    }

    fn retune(&mut self, center_freq_hz: u64) -> Result<(), HardwareError> {
        let settings = self.settings.as_mut().ok_or_else(|| HardwareError::Retune {
            freq_hz: center_freq_hz,
            reason: "front-end not configured".to_string(),
        })?;
        settings.center_freq_hz = center_freq_hz;
        Ok(())
    }

    fn set_sample_rate(&mut self, rate_hz: f64) -> Result<(), HardwareError> {
        if rate_hz <= 0.0 {
            return Err(HardwareError::SampleRate {
                rate_hz,
                reason: "rate must be positive".to_string(),
            });
        }
        let settings = self.settings.as_mut().ok_or_else(|| HardwareError::SampleRate {
            rate_hz,
            reason: "front-end not configured".to_string(),
        })?;
        settings.sample_rate_hz = rate_hz;
        Ok(())
    }

    fn lock_status(&self, sensor: &str) -> Option<bool> {
        match sensor {
            "lo_locked" => Some(self.settings.is_some()),
            _ => None,
        }
    }
}
