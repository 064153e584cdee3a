//! Front-end backed by a UHD streaming tool child process
//!
//! Spawns `rx_samples_to_file`-style tooling that writes interleaved
//! little-endian `fc32` IQ samples to stdout. Retuning or changing the sample
//! rate while streaming marks the stream stale; the process is restarted with
//! the new settings on the next receive, or by the next `start_streaming`.
//!
//! A continuous stream never back-pressures the tool: when the sensing loop
//! falls behind, the reader drops chunks instead of queueing them.

use std::io::{BufRead, Read};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use rustfft::num_complex::Complex32;
use tracing::{debug, error, info, warn};

use super::frontend::{
    AppliedConfig, FrontEndSettings, HardwareError, RadioFrontEnd, RxMetadata, StreamMode,
};

/// Bytes per complex fc32 sample (I and Q as f32)
const BYTES_PER_SAMPLE: usize = 8;

/// Read chunk from the tool's stdout (8K samples)
const READ_CHUNK_BYTES: usize = 8 * 1024 * BYTES_PER_SAMPLE;

/// Sample chunks buffered between the reader thread and the sensing loop
const CHUNK_QUEUE_DEPTH: usize = 64;

/// Device identity reported by the probe tool
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub product: Option<String>,
    pub serial: Option<String>,
}

/// Sanitize a string to only contain printable ASCII characters
fn sanitize_string(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_ascii_graphic() || *c == ' ')
        .collect::<String>()
        .trim()
        .to_string()
}

/// Extract product and serial from `uhd_find_devices` output.
///
/// Only the first device block is used.
fn parse_device_listing(lines: impl Iterator<Item = String>) -> DeviceInfo {
    let mut info = DeviceInfo::default();
    let mut devices_seen = 0;

    for line in lines {
        let trimmed = line.trim();
        if trimmed.starts_with("-- UHD Device") {
            devices_seen += 1;
            if devices_seen > 1 {
                break;
            }
            continue;
        }
        if let Some((key, value)) = trimmed.split_once(':') {
            let value = sanitize_string(value);
            if value.is_empty() {
                continue;
            }
            match key.trim() {
                "product" if info.product.is_none() => info.product = Some(value),
                "serial" if info.serial.is_none() => info.serial = Some(value),
                _ => {}
            }
        }
    }
    info
}

/// Query product and serial of the first device matching `device_args`
pub fn query_device_info(probe_path: &str, device_args: &str) -> DeviceInfo {
    let mut cmd = Command::new(probe_path);
    if !device_args.is_empty() {
        cmd.arg("--args").arg(device_args);
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::null());

    let child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            warn!("Failed to query device info: {}", e);
            return DeviceInfo::default();
        }
    };

    let stdout = match child.stdout {
        Some(s) => s,
        None => return DeviceInfo::default(),
    };

    let reader = std::io::BufReader::new(stdout);
    parse_device_listing(reader.lines().map_while(Result::ok))
}

/// Process front-end settings
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Streaming tool, e.g. `rx_samples_to_file`
    pub tool_path: String,
    /// UHD device address args
    pub device_args: String,
    /// How long one `receive` waits before returning zero samples
    pub receive_timeout: Duration,
}

/// A running tool instance and its sample queue
struct Stream {
    child: Child,
    rx: Receiver<Vec<Complex32>>,
    mode: StreamMode,
}

/// Radio front-end driven through an external streaming tool
pub struct ProcessFrontEnd {
    config: ProcessConfig,
    settings: Option<FrontEndSettings>,
    stream: Option<Stream>,
    /// Settings changed since the running stream was spawned
    stale: bool,
    pending: Vec<Complex32>,
    pending_pos: usize,
}

impl ProcessFrontEnd {
    pub fn new(config: ProcessConfig) -> Self {
        Self {
            config,
            settings: None,
            stream: None,
            stale: false,
            pending: Vec::new(),
            pending_pos: 0,
        }
    }

    fn build_command(&self, settings: &FrontEndSettings, mode: StreamMode) -> Command {
        let nsamps = match mode {
            StreamMode::Continuous => 0,
            StreamMode::NumSamples(n) => n,
        };

        let mut cmd = Command::new(&self.config.tool_path);
        if !self.config.device_args.is_empty() {
            cmd.arg("--args").arg(&self.config.device_args);
        }
        cmd.arg("--rate").arg(settings.sample_rate_hz.to_string())
           .arg("--freq").arg(settings.center_freq_hz.to_string())
           .arg("--gain").arg(settings.gain_db.to_string());
        if let Some(bw) = settings.bandwidth_hz {
            cmd.arg("--bw").arg(bw.to_string());
        }
        if let Some(ant) = &settings.antenna {
            cmd.arg("--ant").arg(ant);
        }
        cmd.arg("--type").arg("float")
           .arg("--nsamps").arg(nsamps.to_string())
           .arg("--file").arg("/dev/stdout");

        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd
    }

    fn spawn(&mut self, mode: StreamMode) -> Result<(), HardwareError> {
        let settings = self
            .settings
            .clone()
            .ok_or_else(|| HardwareError::StreamStart("front-end not configured".to_string()))?;

        let mut cmd = self.build_command(&settings, mode);
        debug!("Executing: {:?}", cmd);

        let mut child = cmd
            .spawn()
            .map_err(|e| HardwareError::StreamStart(format!("{}: {}", self.config.tool_path, e)))?;

        let stdout = match child.stdout.take() {
            Some(s) => s,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(HardwareError::StreamStart("failed to capture tool stdout".to_string()));
            }
        };

        // Spawn stderr reader for logging
        if let Some(stderr) = child.stderr.take() {
            thread::spawn(move || {
                let reader = std::io::BufReader::new(stderr);
                for line in reader.lines().map_while(Result::ok) {
                    if !line.trim().is_empty() {
                        debug!("[uhd] {}", line.trim());
                    }
                }
            });
        }

        // Finite captures must arrive whole, so only they may block the tool
        let lossy = mode == StreamMode::Continuous;
        let (tx, rx) = bounded::<Vec<Complex32>>(CHUNK_QUEUE_DEPTH);
        thread::Builder::new()
            .name("sdr-reader".to_string())
            .spawn(move || read_samples(stdout, tx, lossy))
            .map_err(|e| HardwareError::StreamStart(format!("failed to spawn reader thread: {}", e)))?;

        self.pending.clear();
        self.pending_pos = 0;
        self.stale = false;
        self.stream = Some(Stream { child, rx, mode });
        Ok(())
    }

    /// Respawn a stale stream so new settings take effect
    fn refresh_stream(&mut self) -> Result<(), HardwareError> {
        if !self.stale {
            return Ok(());
        }
        if let Some(mode) = self.stream.as_ref().map(|s| s.mode) {
            self.stop_streaming();
            self.spawn(mode)?;
        }
        self.stale = false;
        Ok(())
    }
}

impl RadioFrontEnd for ProcessFrontEnd {
    fn configure(&mut self, settings: &FrontEndSettings) -> Result<AppliedConfig, HardwareError> {
        if settings.sample_rate_hz <= 0.0 {
            return Err(HardwareError::Configure(format!(
                "invalid sample rate {}",
                settings.sample_rate_hz
            )));
        }
        self.settings = Some(settings.clone());
        self.stale = true;

        // The tool gives no readback, so applied == requested
        Ok(AppliedConfig {
            sample_rate_hz: settings.sample_rate_hz,
            center_freq_hz: settings.center_freq_hz,
            gain_db: settings.gain_db,
            bandwidth_hz: settings.bandwidth_hz,
        })
    }

    fn start_streaming(&mut self, mode: StreamMode) -> Result<(), HardwareError> {
        self.stop_streaming();
        self.spawn(mode)
    }

    fn stop_streaming(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.child.kill();
            let _ = stream.child.wait();
        }
        self.pending.clear();
        self.pending_pos = 0;
    }

    fn receive(&mut self, buf: &mut [Complex32]) -> Result<(usize, RxMetadata), HardwareError> {
        self.refresh_stream()?;

        if self.pending_pos < self.pending.len() {
            let n = (self.pending.len() - self.pending_pos).min(buf.len());
            buf[..n].copy_from_slice(&self.pending[self.pending_pos..self.pending_pos + n]);
            self.pending_pos += n;
            return Ok((n, RxMetadata { received_at: Instant::now() }));
        }

        let stream = self.stream.as_ref().ok_or(HardwareError::NotStreaming)?;
        match stream.rx.recv_timeout(self.config.receive_timeout) {
            Ok(chunk) => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                if n < chunk.len() {
                    self.pending = chunk;
                    self.pending_pos = n;
                }
                Ok((n, RxMetadata { received_at: Instant::now() }))
            }
            Err(RecvTimeoutError::Timeout) => Ok((0, RxMetadata { received_at: Instant::now() })),
            Err(RecvTimeoutError::Disconnected) => Err(HardwareError::StreamClosed),
        }
    }

    fn discard_backlog(&mut self) {
        let stream = match &self.stream {
            Some(stream) if stream.mode == StreamMode::Continuous => stream,
            _ => return,
        };
        let dropped = stream.rx.try_iter().count();
        if dropped > 0 {
            debug!("Discarded {} queued sample chunks", dropped);
        }
        self.pending.clear();
        self.pending_pos = 0;
    }

    fn retune(&mut self, center_freq_hz: u64) -> Result<(), HardwareError> {
        let settings = self.settings.as_mut().ok_or_else(|| HardwareError::Retune {
            freq_hz: center_freq_hz,
            reason: "front-end not configured".to_string(),
        })?;
        settings.center_freq_hz = center_freq_hz;
        self.stale = true;
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
        self.stale = true;
        Ok(())
    }

    /// The streaming tool exposes no sensors
    fn lock_status(&self, _sensor: &str) -> Option<bool> {
        None
    }
}

impl Drop for ProcessFrontEnd {
    fn drop(&mut self) {
        self.stop_streaming();
    }
}

/// Reader loop (runs in dedicated thread until EOF or the queue is dropped).
///
/// With `lossy` set a full queue drops the chunk rather than blocking.
fn read_samples(mut stdout: impl Read, tx: Sender<Vec<Complex32>>, lossy: bool) {
    let mut buffer = vec![0u8; READ_CHUNK_BYTES];
    let mut carry = 0usize;
    let mut first_data = true;
    let mut dropped = 0u64;

    loop {
        let n_read = match stdout.read(&mut buffer[carry..]) {
            Ok(0) => {
                debug!("Streaming tool stdout closed (EOF)");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                error!("Error reading from streaming tool: {}", e);
                break;
            }
        };

        if first_data {
            info!("First IQ data received ({} bytes)", n_read);
            first_data = false;
        }

        let available = carry + n_read;
        let whole = available / BYTES_PER_SAMPLE * BYTES_PER_SAMPLE;
        let chunk = decode_fc32(&buffer[..whole]);

        // Keep a trailing partial sample for the next read
        buffer.copy_within(whole..available, 0);
        carry = available - whole;

        if chunk.is_empty() {
            continue;
        }
        let sent = if lossy {
            match tx.try_send(chunk) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    dropped += 1;
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            }
        } else {
            tx.send(chunk).is_ok()
        };
        if !sent {
            // Front-end stopped this stream
            break;
        }
    }

    if dropped > 0 {
        debug!("Reader dropped {} chunks behind a full queue", dropped);
    }
}

/// Decode interleaved little-endian f32 I/Q pairs
fn decode_fc32(bytes: &[u8]) -> Vec<Complex32> {
    bytes
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|c| {
            let i = f32::from_le_bytes([c[0], c[1], c[2], c[3]]);
            let q = f32::from_le_bytes([c[4], c[5], c[6], c[7]]);
            Complex32::new(i, q)
        })
        .collect()
}
