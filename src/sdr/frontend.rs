//! Radio front-end abstraction
//!
//! The sensing loop only talks to hardware through [`RadioFrontEnd`]:
//! configure once, arm a stream, pull blocks of complex samples, and retune
//! or re-rate between scans and captures.

use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use rustfft::num_complex::Complex32;
use thiserror::Error;
use tracing::info;

/// Front-end configuration and streaming failures
#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("front-end configuration failed: {0}")]
    Configure(String),

    #[error("failed to start sample stream: {0}")]
    StreamStart(String),

    #[error("sample stream is not running")]
    NotStreaming,

    #[error("sample stream closed")]
    StreamClosed,

    #[error("retune to {freq_hz} Hz failed: {reason}")]
    Retune { freq_hz: u64, reason: String },

    #[error("sample rate change to {rate_hz} sps failed: {reason}")]
    SampleRate { rate_hz: f64, reason: String },

    #[error("capture stalled after {received}/{requested} samples ({zero_reads} empty reads)")]
    CaptureStalled {
        received: usize,
        requested: usize,
        zero_reads: u32,
    },

    #[error("sensor {0} reports unlocked")]
    Unlocked(String),
}

/// Requested receiver settings
#[derive(Debug, Clone, PartialEq)]
pub struct FrontEndSettings {
    pub sample_rate_hz: f64,
    pub center_freq_hz: u64,
    pub gain_db: f64,
    /// Analog filter bandwidth, device default when unset
    pub bandwidth_hz: Option<f64>,
    pub antenna: Option<String>,
}

/// Settings the device actually applied
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedConfig {
    pub sample_rate_hz: f64,
    pub center_freq_hz: u64,
    pub gain_db: f64,
    pub bandwidth_hz: Option<f64>,
}

/// How many samples a stream should deliver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    Continuous,
    NumSamples(usize),
}

/// Per-receive metadata
#[derive(Debug, Clone, Copy)]
pub struct RxMetadata {
    pub received_at: Instant,
}

/// Clock reference selection, decides which lock sensors are checked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceSource {
    Internal,
    External,
    Mimo,
}

impl FromStr for ReferenceSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "internal" => Ok(Self::Internal),
            "external" => Ok(Self::External),
            "mimo" => Ok(Self::Mimo),
            other => Err(format!("unknown reference source '{}'", other)),
        }
    }
}

impl fmt::Display for ReferenceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Internal => write!(f, "internal"),
            Self::External => write!(f, "external"),
            Self::Mimo => write!(f, "mimo"),
        }
    }
}

/// Receiver capability consumed by the sensing loop
pub trait RadioFrontEnd: Send {
    /// Apply the full receiver configuration
    fn configure(&mut self, settings: &FrontEndSettings) -> Result<AppliedConfig, HardwareError>;

    /// Arm the sample stream without waiting for data
    fn start_streaming(&mut self, mode: StreamMode) -> Result<(), HardwareError>;

    fn stop_streaming(&mut self);

    /// Block until some samples arrive. May fill less than `buf`, or
    /// nothing at all if the receive timed out.
    fn receive(&mut self, buf: &mut [Complex32]) -> Result<(usize, RxMetadata), HardwareError>;

    /// Drop samples queued ahead of the caller, so the next receive starts
    /// at the live edge of a continuous stream.
    fn discard_backlog(&mut self) {}

    fn retune(&mut self, center_freq_hz: u64) -> Result<(), HardwareError>;

    fn set_sample_rate(&mut self, rate_hz: f64) -> Result<(), HardwareError>;

    /// `None` when the device has no sensor by that name
    fn lock_status(&self, sensor: &str) -> Option<bool>;
}

/// Fill `buf` completely, accumulating partial reads.
///
/// Returns the metadata of the read that completed the block.
/// `max_zero_reads` consecutive empty reads abort with
/// [`HardwareError::CaptureStalled`].
pub fn receive_exact<F: RadioFrontEnd + ?Sized>(
    front_end: &mut F,
    buf: &mut [Complex32],
    max_zero_reads: u32,
) -> Result<RxMetadata, HardwareError> {
    let requested = buf.len();
    let mut received = 0usize;
    let mut zero_reads = 0u32;
    let mut last = RxMetadata { received_at: Instant::now() };

    while received < requested {
        let (n, md) = front_end.receive(&mut buf[received..])?;
        if n == 0 {
            zero_reads += 1;
            if zero_reads >= max_zero_reads {
                return Err(HardwareError::CaptureStalled {
                    received,
                    requested,
                    zero_reads,
                });
            }
            continue;
        }
        zero_reads = 0;
        received += n.min(requested - received);
        last = md;
    }
    Ok(last)
}

/// Check the lock sensors relevant to `reference`.
///
/// Sensors the device does not expose are skipped.
pub fn verify_locks<F: RadioFrontEnd + ?Sized>(
    front_end: &F,
    reference: ReferenceSource,
) -> Result<(), HardwareError> {
    let mut sensors = vec!["lo_locked"];
    match reference {
        ReferenceSource::External => sensors.push("ref_locked"),
        ReferenceSource::Mimo => sensors.push("mimo_locked"),
        ReferenceSource::Internal => {}
    }

    for sensor in sensors {
        match front_end.lock_status(sensor) {
            Some(true) => info!("Checking RX: {} ... locked", sensor),
            Some(false) => return Err(HardwareError::Unlocked(sensor.to_string())),
            None => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Returns a scripted number of samples per receive call
    struct ScriptedReads {
        reads: VecDeque<usize>,
        calls: usize,
        locks: Vec<(&'static str, bool)>,
    }

    impl ScriptedReads {
        fn new(reads: &[usize]) -> Self {
            Self {
                reads: reads.iter().copied().collect(),
                calls: 0,
                locks: Vec::new(),
            }
        }
    }

    impl RadioFrontEnd for ScriptedReads {
        fn configure(&mut self, s: &FrontEndSettings) -> Result<AppliedConfig, HardwareError> {
            Ok(AppliedConfig {
                sample_rate_hz: s.sample_rate_hz,
                center_freq_hz: s.center_freq_hz,
                gain_db: s.gain_db,
                bandwidth_hz: s.bandwidth_hz,
            })
        }
        fn start_streaming(&mut self, _mode: StreamMode) -> Result<(), HardwareError> {
            Ok(())
        }
        fn stop_streaming(&mut self) {}
        fn receive(&mut self, buf: &mut [Complex32]) -> Result<(usize, RxMetadata), HardwareError> {
            self.calls += 1;
            let n = self.reads.pop_front().unwrap_or(0).min(buf.len());
            for s in &mut buf[..n] {
                *s = Complex32::new(1.0, -1.0);
            }
            Ok((n, RxMetadata { received_at: Instant::now() }))
        }
        fn retune(&mut self, _f: u64) -> Result<(), HardwareError> {
            Ok(())
        }
        fn set_sample_rate(&mut self, _r: f64) -> Result<(), HardwareError> {
            Ok(())
        }
        fn lock_status(&self, sensor: &str) -> Option<bool> {
            self.locks.iter().find(|(s, _)| *s == sensor).map(|(_, v)| *v)
        }
    }

    #[test]
    fn test_receive_exact_accumulates_partial_reads() {
        let mut fe = ScriptedReads::new(&[300, 0, 500, 224]);
        let mut buf = vec![Complex32::new(0.0, 0.0); 1024];
        receive_exact(&mut fe, &mut buf, 3).unwrap();
        assert_eq!(fe.calls, 4);
        assert!(buf.iter().all(|s| *s == Complex32::new(1.0, -1.0)));
    }

    #[test]
    fn test_receive_exact_fails_after_three_empty_reads() {
        let mut fe = ScriptedReads::new(&[100, 0, 0, 0, 900]);
        let mut buf = vec![Complex32::new(0.0, 0.0); 1000];
        let err = receive_exact(&mut fe, &mut buf, 3).unwrap_err();
        match err {
            HardwareError::CaptureStalled { received, requested, zero_reads } => {
                assert_eq!(received, 100);
                assert_eq!(requested, 1000);
                assert_eq!(zero_reads, 3);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(fe.calls, 4);
    }

    #[test]
    fn test_verify_locks_skips_missing_sensors() {
        let fe = ScriptedReads::new(&[]);
        assert!(verify_locks(&fe, ReferenceSource::External).is_ok());
    }

    #[test]
    fn test_verify_locks_rejects_unlocked_reference() {
        let mut fe = ScriptedReads::new(&[]);
        fe.locks = vec![("lo_locked", true), ("ref_locked", false)];
        assert!(verify_locks(&fe, ReferenceSource::Internal).is_ok());
        assert!(matches!(
            verify_locks(&fe, ReferenceSource::External),
            Err(HardwareError::Unlocked(s)) if s == "ref_locked"
        ));
    }

    #[test]
    fn test_reference_source_parse() {
        assert_eq!("External".parse::<ReferenceSource>(), Ok(ReferenceSource::External));
        assert!("gps".parse::<ReferenceSource>().is_err());
    }
}
