//! Sensing state machine
//!
//! One tick of the loop runs one state:
//!
//! ```text
//! Scanning -> Retuning -> Capturing -> IdleCooldown -> Scanning
//! ```
//!
//! Scanning pulls a wideband block, aggregates it into channel powers and
//! either reports them or hands the strongest occupied channel to Retuning.
//! Retuning moves the front-end onto that channel at the narrow rate,
//! Capturing pulls a fixed IQ block and reports it, then the front-end goes
//! back to the wideband home configuration. A failure anywhere in that
//! sequence still attempts the wideband restore before scanning resumes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustfft::num_complex::Complex32;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::latency::{LatencyStats, Stage};
use super::timer::{Clock, Cooldown, FrameTimer};
use crate::sdr::{
    receive_exact, verify_locks, AppliedConfig, FrontEndSettings, HardwareError, RadioFrontEnd,
    ReferenceSource, RxMetadata, SpectralTransform, StreamMode,
};
use crate::spectrum::{
    BandPlan, ChannelDetector, ChannelPowerProfile, DetectionResult, SpectrumAggregator,
    SpectrumTooShortError,
};
use crate::telemetry::{ReportSink, SensorIdentity, TelemetryPayload};

/// Why a sensing cycle was abandoned
#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Hardware(#[from] HardwareError),

    #[error(transparent)]
    Spectrum(#[from] SpectrumTooShortError),
}

/// Loop parameters
#[derive(Debug, Clone)]
pub struct SensingConfig {
    /// Samples per wideband scan block (the FFT size)
    pub scan_block_samples: usize,
    /// Samples per narrowband IQ capture
    pub capture_samples: usize,
    pub wide_rate_hz: f64,
    pub detection_rate_hz: f64,
    pub max_zero_reads: u32,
    /// Target scan ticks per second
    pub frame_rate: f64,
    pub power_report_interval: Duration,
    pub detection_cooldown: Duration,
    pub band: BandPlan,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SensingState {
    Scanning,
    Retuning { channel: u8, power_db: f32 },
    Capturing { channel: u8, power_db: f32 },
    IdleCooldown,
}

/// Drives one radio front-end through scan and capture cycles.
///
/// Runs on a dedicated thread; reports leave through the [`ReportSink`]
/// without blocking.
pub struct SensingStateMachine<F, T, S> {
    front_end: F,
    transform: T,
    sink: S,
    aggregator: SpectrumAggregator,
    detector: ChannelDetector,
    identity: SensorIdentity,
    config: SensingConfig,
    clock: Arc<dyn Clock>,
    latency: Arc<LatencyStats>,

    state: SensingState,
    profile: ChannelPowerProfile,
    scan_block: Vec<Complex32>,
    frame_timer: FrameTimer,
    power_cooldown: Cooldown,
    detection_cooldown: Cooldown,
    /// Wideband restore failed and must be retried before the next scan
    restore_pending: bool,
}

impl<F, T, S> SensingStateMachine<F, T, S>
where
    F: RadioFrontEnd,
    T: SpectralTransform,
    S: ReportSink,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        front_end: F,
        transform: T,
        sink: S,
        aggregator: SpectrumAggregator,
        detector: ChannelDetector,
        identity: SensorIdentity,
        config: SensingConfig,
        clock: Arc<dyn Clock>,
        latency: Arc<LatencyStats>,
    ) -> Self {
        Self {
            scan_block: vec![Complex32::new(0.0, 0.0); config.scan_block_samples],
            frame_timer: FrameTimer::new(config.frame_rate),
            power_cooldown: Cooldown::new(config.power_report_interval),
            detection_cooldown: Cooldown::new(config.detection_cooldown),
            front_end,
            transform,
            sink,
            aggregator,
            detector,
            identity,
            config,
            clock,
            latency,
            state: SensingState::Scanning,
            profile: ChannelPowerProfile::new(),
            restore_pending: false,
        }
    }

    pub fn state(&self) -> SensingState {
        self.state
    }

    /// Configure the front-end, check its locks and start wideband streaming
    pub fn start(
        &mut self,
        settings: &FrontEndSettings,
        reference: ReferenceSource,
    ) -> Result<AppliedConfig, HardwareError> {
        let applied = self.front_end.configure(settings)?;
        info!(
            "Actual RX Rate: {:.3} Msps, Freq: {:.3} MHz, Gain: {:.1} dB",
            applied.sample_rate_hz / 1e6,
            applied.center_freq_hz as f64 / 1e6,
            applied.gain_db
        );
        if let Some(bw) = applied.bandwidth_hz {
            info!("Actual RX Bandwidth: {:.3} MHz", bw / 1e6);
        }

        verify_locks(&self.front_end, reference)?;
        self.front_end.start_streaming(StreamMode::Continuous)?;
        self.state = SensingState::Scanning;
        Ok(applied)
    }

    /// Run one state and advance.
    ///
    /// On error the machine is back in Scanning, with the wideband restore
    /// already attempted.
    pub fn step(&mut self) -> Result<(), CycleError> {
        let state = std::mem::replace(&mut self.state, SensingState::Scanning);
        let next = match state {
            SensingState::Scanning => self.scan()?,
            SensingState::Retuning { channel, power_db } => {
                self.enter_capture(channel)?;
                SensingState::Capturing { channel, power_db }
            }
            SensingState::Capturing { channel, power_db } => {
                self.capture_and_report(channel, power_db)?;
                SensingState::IdleCooldown
            }
            SensingState::IdleCooldown => SensingState::Scanning,
        };

        if next != state {
            debug!("Sensing state {:?} -> {:?}", state, next);
        }
        self.state = next;
        Ok(())
    }

    /// Step until `running` clears, then stop the stream
    pub fn run(&mut self, running: &AtomicBool) {
        info!(
            "Sensing loop started ({:?} per frame, {} samples per scan)",
            self.frame_timer.period(),
            self.config.scan_block_samples
        );

        let mut aborted = 0u64;
        while running.load(Ordering::SeqCst) {
            if self.state() == SensingState::Scanning {
                self.frame_timer.wait_for_tick(self.clock.as_ref());
            }
            if let Err(e) = self.step() {
                aborted += 1;
                warn!("Sensing cycle aborted: {}", e);
            }
        }

        self.front_end.stop_streaming();
        info!("Sensing loop stopped ({} cycles aborted)", aborted);
    }

    fn scan(&mut self) -> Result<SensingState, CycleError> {
        if self.restore_pending {
            self.restore_wideband()?;
        }

        // Each tick analyses the newest samples, never a queued backlog
        self.front_end.discard_backlog();
        if let Err(e) = receive_exact(
            &mut self.front_end,
            &mut self.scan_block,
            self.config.max_zero_reads,
        ) {
            // Restarting the wideband stream is the only recovery
            self.restore_pending = true;
            return Err(e.into());
        }

        let started = Instant::now();
        let spectrum = self.transform.transform(&self.scan_block);
        self.latency.record(Stage::Fft, started.elapsed());

        self.aggregator.aggregate(&spectrum, &mut self.profile)?;

        let now = self.clock.now();
        match self.detector.detect(&self.profile) {
            DetectionResult::Detected { channel, power_db } if self.detection_cooldown.is_ready(now) => {
                info!(
                    "Channel {} occupied at {:.1} dB, capturing at {:.1} MHz",
                    channel,
                    power_db,
                    self.config.band.center_freq(channel) as f64 / 1e6
                );
                self.detection_cooldown.arm(now);
                return Ok(SensingState::Retuning { channel, power_db });
            }
            DetectionResult::Detected { channel, power_db } => {
                debug!("Channel {} at {:.1} dB within detection cooldown", channel, power_db);
            }
            DetectionResult::NoDetection => {}
        }

        if self.power_cooldown.is_ready(now) {
            self.submit_power_report();
            self.power_cooldown.arm(now);
        }
        Ok(SensingState::Scanning)
    }

    fn enter_capture(&mut self, channel: u8) -> Result<(), CycleError> {
        if let Err(e) = self.tune_for_capture(channel) {
            self.restore_after_failure();
            return Err(e.into());
        }
        Ok(())
    }

    fn tune_for_capture(&mut self, channel: u8) -> Result<(), HardwareError> {
        let started = Instant::now();
        self.front_end.retune(self.config.band.center_freq(channel))?;
        self.latency.record(Stage::FreqShift, started.elapsed());

        let started = Instant::now();
        self.front_end.set_sample_rate(self.config.detection_rate_hz)?;
        self.latency.record(Stage::SrateChange, started.elapsed());

        self.front_end
            .start_streaming(StreamMode::NumSamples(self.config.capture_samples))
    }

    fn capture_and_report(&mut self, channel: u8, power_db: f32) -> Result<(), CycleError> {
        let mut capture = vec![Complex32::new(0.0, 0.0); self.config.capture_samples];

        let started = Instant::now();
        let last: RxMetadata =
            match receive_exact(&mut self.front_end, &mut capture, self.config.max_zero_reads) {
                Ok(md) => md,
                Err(e) => {
                    self.restore_after_failure();
                    return Err(e.into());
                }
            };
        self.latency.record(
            Stage::SamplesRecv,
            last.received_at.saturating_duration_since(started),
        );
        info!(
            "Captured {} IQ samples on channel {} (detected at {:.1} dB)",
            capture.len(),
            channel,
            power_db
        );

        self.submit_power_report();
        self.sink.submit(TelemetryPayload::IqReport {
            identity: self.identity.clone(),
            channel,
            samples: capture,
        });

        let restored = self.restore_wideband();
        let now = self.clock.now();
        self.detection_cooldown.arm(now);
        self.power_cooldown.arm(now);
        restored?;
        Ok(())
    }

    fn submit_power_report(&mut self) {
        self.sink.submit(TelemetryPayload::PowerReport {
            identity: self.identity.clone(),
            profile: self.profile.clone(),
        });
    }

    fn restore_after_failure(&mut self) {
        if let Err(e) = self.restore_wideband() {
            warn!("Wideband restore failed, retrying before next scan: {}", e);
        }
    }

    /// Back to the wide rate on the home frequency, continuous streaming
    fn restore_wideband(&mut self) -> Result<(), HardwareError> {
        self.restore_pending = true;

        let started = Instant::now();
        self.front_end.set_sample_rate(self.config.wide_rate_hz)?;
        self.latency.record(Stage::SrateChange, started.elapsed());

        let started = Instant::now();
        self.front_end.retune(self.config.band.home_freq_hz)?;
        self.latency.record(Stage::FreqReturn, started.elapsed());

        self.front_end.start_streaming(StreamMode::Continuous)?;
        self.restore_pending = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensing::ManualClock;
    use crate::spectrum::{ChannelLayout, PowerSpectrum, Thresholds};
    use std::sync::Mutex;

    const WIDE: f64 = 122.88e6;
    const NARROW: f64 = 10.24e6;
    const CAPTURE: usize = 4096;

    #[derive(Debug, Clone, PartialEq)]
    enum Cmd {
        Configure,
        Start(StreamMode),
        Stop,
        Retune(u64),
        Rate(f64),
    }

    #[derive(Default)]
    struct MockRadio {
        cmds: Vec<Cmd>,
        mode: Option<StreamMode>,
        stall_capture: bool,
        fail_rate: Option<f64>,
        discards: usize,
    }

    /// Front-end that logs every command
    #[derive(Clone, Default)]
    struct MockFrontEnd(Arc<Mutex<MockRadio>>);

    impl MockFrontEnd {
        fn cmds(&self) -> Vec<Cmd> {
            self.0.lock().unwrap().cmds.clone()
        }
    }

    impl RadioFrontEnd for MockFrontEnd {
        fn configure(&mut self, s: &FrontEndSettings) -> Result<AppliedConfig, HardwareError> {
            self.0.lock().unwrap().cmds.push(Cmd::Configure);
            Ok(AppliedConfig {
                sample_rate_hz: s.sample_rate_hz,
                center_freq_hz: s.center_freq_hz,
                gain_db: s.gain_db,
                bandwidth_hz: s.bandwidth_hz,
            })
        }

        fn start_streaming(&mut self, mode: StreamMode) -> Result<(), HardwareError> {
            let mut radio = self.0.lock().unwrap();
            radio.cmds.push(Cmd::Start(mode));
            radio.mode = Some(mode);
            Ok(())
        }

        fn stop_streaming(&mut self) {
            let mut radio = self.0.lock().unwrap();
            radio.cmds.push(Cmd::Stop);
            radio.mode = None;
        }

        fn receive(&mut self, buf: &mut [Complex32]) -> Result<(usize, RxMetadata), HardwareError> {
            let radio = self.0.lock().unwrap();
            let n = match radio.mode {
                None => return Err(HardwareError::NotStreaming),
                Some(StreamMode::NumSamples(_)) if radio.stall_capture => 0,
                Some(_) => buf.len(),
            };
            for s in &mut buf[..n] {
                *s = Complex32::new(0.5, -0.5);
            }
            Ok((n, RxMetadata { received_at: Instant::now() }))
        }

        fn discard_backlog(&mut self) {
            self.0.lock().unwrap().discards += 1;
        }

        fn retune(&mut self, freq: u64) -> Result<(), HardwareError> {
            self.0.lock().unwrap().cmds.push(Cmd::Retune(freq));
            Ok(())
        }

        fn set_sample_rate(&mut self, rate_hz: f64) -> Result<(), HardwareError> {
            let mut radio = self.0.lock().unwrap();
            if radio.fail_rate == Some(rate_hz) {
                return Err(HardwareError::SampleRate {
                    rate_hz,
                    reason: "rejected".to_string(),
                });
            }
            radio.cmds.push(Cmd::Rate(rate_hz));
            Ok(())
        }

        fn lock_status(&self, sensor: &str) -> Option<bool> {
            (sensor == "lo_locked").then_some(true)
        }
    }

    /// Returns whatever spectrum the test put in
    struct FixedTransform(Arc<Mutex<PowerSpectrum>>);

    impl SpectralTransform for FixedTransform {
        fn transform(&mut self, _block: &[Complex32]) -> PowerSpectrum {
            self.0.lock().unwrap().clone()
        }
    }

    #[derive(Clone, Default)]
    struct RecordingSink(Arc<Mutex<Vec<TelemetryPayload>>>);

    impl ReportSink for RecordingSink {
        fn submit(&mut self, payload: TelemetryPayload) {
            self.0.lock().unwrap().push(payload);
        }
    }

    fn layout() -> ChannelLayout {
        ChannelLayout {
            step: 41,
            channel_offset: 5,
            start_trim: 0,
            end_trim: 0,
        }
    }

    fn quiet() -> PowerSpectrum {
        PowerSpectrum::new(vec![-100.0; 615])
    }

    fn hot(channel: usize) -> PowerSpectrum {
        let mut bins = vec![-100.0; 615];
        if let Some(span) = layout().span(channel, bins.len()) {
            for b in &mut bins[span] {
                *b = -50.0;
            }
        }
        PowerSpectrum::new(bins)
    }

    struct Harness {
        radio: MockFrontEnd,
        spectrum: Arc<Mutex<PowerSpectrum>>,
        reports: RecordingSink,
        clock: Arc<ManualClock>,
        machine: SensingStateMachine<MockFrontEnd, FixedTransform, RecordingSink>,
    }

    fn harness(spectrum: PowerSpectrum) -> Harness {
        let radio = MockFrontEnd::default();
        let spectrum = Arc::new(Mutex::new(spectrum));
        let reports = RecordingSink::default();
        let clock = Arc::new(ManualClock::new());

        let mut machine = SensingStateMachine::new(
            radio.clone(),
            FixedTransform(spectrum.clone()),
            reports.clone(),
            SpectrumAggregator::new(layout()),
            ChannelDetector::new(5, Thresholds::default()),
            SensorIdentity {
                sensor_id: "sensor-test".to_string(),
                latitude: 38.9,
                longitude: -77.1,
            },
            SensingConfig {
                scan_block_samples: 64,
                capture_samples: CAPTURE,
                wide_rate_hz: WIDE,
                detection_rate_hz: NARROW,
                max_zero_reads: 3,
                frame_rate: 1000.0,
                power_report_interval: Duration::from_millis(500),
                detection_cooldown: Duration::from_secs(10),
                band: BandPlan::default(),
            },
            clock.clone(),
            Arc::new(LatencyStats::new()),
        );

        let settings = FrontEndSettings {
            sample_rate_hz: WIDE,
            center_freq_hz: 3_650_000_000,
            gain_db: 40.0,
            bandwidth_hz: None,
            antenna: None,
        };
        machine.start(&settings, ReferenceSource::Internal).unwrap();

        Harness {
            radio,
            spectrum,
            reports,
            clock,
            machine,
        }
    }

    fn is_retune_to(cmd: &Cmd, freq: u64) -> bool {
        *cmd == Cmd::Retune(freq)
    }

    #[test]
    fn test_start_configures_then_streams() {
        let h = harness(quiet());
        assert_eq!(
            h.radio.cmds(),
            vec![Cmd::Configure, Cmd::Start(StreamMode::Continuous)]
        );
        assert_eq!(h.machine.state(), SensingState::Scanning);
    }

    #[test]
    fn test_quiet_band_reports_power_on_interval() {
        let mut h = harness(quiet());

        for _ in 0..6 {
            h.machine.step().unwrap();
            assert_eq!(h.machine.state(), SensingState::Scanning);
            h.clock.advance(Duration::from_millis(100));
        }

        // Only the initial stream start, never a retune
        assert_eq!(h.radio.cmds().len(), 2);
        assert_eq!(h.radio.0.lock().unwrap().discards, 6);
        let reports = h.reports.0.lock().unwrap();
        assert_eq!(reports.len(), 2);
        for report in reports.iter() {
            match report {
                TelemetryPayload::PowerReport { profile, .. } => {
                    assert_eq!(profile.power(0), None);
                    assert_eq!(profile.power(7), Some(-100.0));
                }
                other => panic!("expected power report, got {:?}", other.resource()),
            }
        }
    }

    #[test]
    fn test_detection_runs_full_capture_cycle() {
        let mut h = harness(hot(7));

        h.machine.step().unwrap();
        assert_eq!(
            h.machine.state(),
            SensingState::Retuning { channel: 7, power_db: -50.0 }
        );
        // Detection tick does not also emit a power report
        assert!(h.reports.0.lock().unwrap().is_empty());

        h.machine.step().unwrap();
        assert!(matches!(h.machine.state(), SensingState::Capturing { channel: 7, .. }));
        assert_eq!(
            h.radio.cmds()[2..],
            [
                Cmd::Retune(3_625_000_000),
                Cmd::Rate(NARROW),
                Cmd::Start(StreamMode::NumSamples(CAPTURE)),
            ]
        );

        h.machine.step().unwrap();
        assert_eq!(h.machine.state(), SensingState::IdleCooldown);
        assert_eq!(
            h.radio.cmds()[5..],
            [
                Cmd::Rate(WIDE),
                Cmd::Retune(3_650_000_000),
                Cmd::Start(StreamMode::Continuous),
            ]
        );

        {
            let reports = h.reports.0.lock().unwrap();
            assert_eq!(reports.len(), 2);
            assert!(matches!(reports[0], TelemetryPayload::PowerReport { .. }));
            match &reports[1] {
                TelemetryPayload::IqReport { channel, samples, .. } => {
                    assert_eq!(*channel, 7);
                    assert_eq!(samples.len(), CAPTURE);
                }
                other => panic!("expected IQ report, got {:?}", other.resource()),
            }
        }

        h.machine.step().unwrap();
        assert_eq!(h.machine.state(), SensingState::Scanning);
    }

    #[test]
    fn test_detection_acted_on_once_per_cooldown() {
        let mut h = harness(hot(7));
        let ch7 = 3_625_000_000;

        for _ in 0..90 {
            h.machine.step().unwrap();
            h.clock.advance(Duration::from_millis(100));
        }
        let retunes = h.radio.cmds().iter().filter(|c| is_retune_to(c, ch7)).count();
        assert_eq!(retunes, 1);

        h.clock.advance(Duration::from_secs(11));
        h.machine.step().unwrap();
        h.machine.step().unwrap();
        let retunes = h.radio.cmds().iter().filter(|c| is_retune_to(c, ch7)).count();
        assert_eq!(retunes, 2);
    }

    #[test]
    fn test_capture_stall_restores_wideband() {
        let mut h = harness(hot(7));
        h.radio.0.lock().unwrap().stall_capture = true;

        h.machine.step().unwrap();
        h.machine.step().unwrap();
        let err = h.machine.step().unwrap_err();
        assert!(matches!(
            err,
            CycleError::Hardware(HardwareError::CaptureStalled { received: 0, zero_reads: 3, .. })
        ));
        assert_eq!(h.machine.state(), SensingState::Scanning);

        let cmds = h.radio.cmds();
        assert_eq!(
            cmds[cmds.len() - 3..],
            [
                Cmd::Rate(WIDE),
                Cmd::Retune(3_650_000_000),
                Cmd::Start(StreamMode::Continuous),
            ]
        );
        assert!(h.reports.0.lock().unwrap().is_empty());
    }

    #[test]
    fn test_failed_rate_change_still_restores() {
        let mut h = harness(hot(9));
        h.radio.0.lock().unwrap().fail_rate = Some(NARROW);

        h.machine.step().unwrap();
        let err = h.machine.step().unwrap_err();
        assert!(matches!(err, CycleError::Hardware(HardwareError::SampleRate { .. })));
        assert_eq!(h.machine.state(), SensingState::Scanning);
        assert_eq!(
            h.radio.cmds()[2..],
            [
                Cmd::Retune(3_645_000_000),
                Cmd::Rate(WIDE),
                Cmd::Retune(3_650_000_000),
                Cmd::Start(StreamMode::Continuous),
            ]
        );
    }

    #[test]
    fn test_failed_restore_is_retried_before_next_scan() {
        let mut h = harness(hot(7));
        {
            let mut radio = h.radio.0.lock().unwrap();
            radio.stall_capture = true;
            radio.fail_rate = Some(WIDE);
        }

        h.machine.step().unwrap();
        h.machine.step().unwrap();
        assert!(h.machine.step().is_err());

        // Still on the narrow config, so the scan cannot proceed
        assert!(h.machine.step().is_err());

        h.radio.0.lock().unwrap().fail_rate = None;
        *h.spectrum.lock().unwrap() = quiet();
        h.machine.step().unwrap();
        let cmds = h.radio.cmds();
        assert_eq!(
            cmds[cmds.len() - 3..],
            [
                Cmd::Rate(WIDE),
                Cmd::Retune(3_650_000_000),
                Cmd::Start(StreamMode::Continuous),
            ]
        );
    }

    #[test]
    fn test_short_spectrum_aborts_cycle() {
        let mut h = harness(PowerSpectrum::new(vec![-100.0; 100]));
        let err = h.machine.step().unwrap_err();
        assert!(matches!(
            err,
            CycleError::Spectrum(SpectrumTooShortError { len: 100, .. })
        ));
        assert!(h.reports.0.lock().unwrap().is_empty());
        assert_eq!(h.machine.state(), SensingState::Scanning);
    }

    #[test]
    fn test_run_stops_streaming_on_shutdown() {
        let mut h = harness(quiet());
        let running = AtomicBool::new(false);
        h.machine.run(&running);
        assert_eq!(h.radio.cmds().last(), Some(&Cmd::Stop));
    }
}
