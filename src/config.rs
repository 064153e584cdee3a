//! Configuration loaded from environment variables

use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::sdr::{Carrier, FrontEndSettings, ProcessConfig, ReferenceSource};
use crate::sensing::SensingConfig;
use crate::spectrum::{BandPlan, ChannelLayout, Thresholds, NUM_CHANNELS};
use crate::telemetry::{CollectorEndpoint, SensorIdentity};

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{key}={value}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0}")]
    OutOfRange(String),
}

/// Which radio front-end drives the sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrontEndKind {
    /// UHD streaming tool child process
    Process,
    /// Synthetic samples, no hardware
    Simulated,
}

impl FromStr for FrontEndKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "process" | "uhd" => Ok(Self::Process),
            "simulated" | "sim" => Ok(Self::Simulated),
            other => Err(format!("unknown front-end '{}'", other)),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub frontend: FrontEndKind,

    /// UHD device address args, e.g. `type=b200`
    pub device_args: String,

    /// Path to the streaming tool (`rx_samples_to_file`)
    pub stream_tool_path: String,

    /// Path to the device probe (`uhd_find_devices`)
    pub probe_tool_path: String,

    /// Wideband scan rate in samples/s
    pub sample_rate_hz: f64,

    /// Narrowband capture rate in samples/s
    pub detection_sample_rate_hz: f64,

    /// Initial tuning frequency
    pub center_freq_hz: u64,

    /// Frequency the receiver returns to after each capture
    pub home_freq_hz: u64,

    pub gain_db: f64,
    pub bandwidth_hz: Option<f64>,
    pub antenna: Option<String>,
    pub reference_source: ReferenceSource,

    /// FFT size, also the scan block length
    pub num_bins: usize,

    /// Target scan ticks per second
    pub frame_rate: f64,

    pub channel_step: usize,
    pub channel_offset: usize,
    pub start_trim: usize,
    pub end_trim: usize,
    pub base_freq_hz: u64,
    pub channel_width_hz: u64,
    pub interior_threshold_db: f32,
    pub edge_threshold_db: f32,

    pub capture_samples: usize,
    pub max_zero_reads: u32,
    pub receive_timeout_ms: u64,
    pub power_report_interval_ms: u64,
    pub detection_cooldown_ms: u64,

    pub sensor_id: String,
    pub sensor_lat: f64,
    pub sensor_lon: f64,

    pub collector_host: String,
    pub collector_port: u16,
    /// Name checked against the collector certificate, defaults to the host
    pub collector_server_name: String,
    pub collector_base_path: String,
    pub client_cert_path: PathBuf,
    pub client_key_path: PathBuf,
    pub ca_cert_path: PathBuf,
    pub connect_timeout_ms: u64,
    pub io_timeout_ms: u64,
    pub max_response_bytes: usize,

    /// Reports buffered between the sensing loop and the reporter
    pub report_queue_depth: usize,

    /// Latency summary period, 0 disables the periodic summary
    pub latency_report_interval_secs: u64,

    pub sim_noise_amplitude: f32,
    pub sim_carrier_freq_hz: Option<u64>,
    pub sim_carrier_amplitude: f32,
}

/// Typed reads over a key lookup
struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    /// Unset and blank both count as missing
    fn raw(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.raw(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        Ok(self.parse_optional(key)?.unwrap_or(default))
    }

    fn parse_optional<T>(&self, key: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.raw(key) {
            None => Ok(None),
            Some(value) => value.parse().map(Some).map_err(|e: T::Err| ConfigError::Invalid {
                key,
                reason: e.to_string(),
                value,
            }),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env { lookup };

        let collector_host = env.string("COLLECTOR_HOST", "10.147.20.60");
        let config = Self {
            frontend: env.parse("FRONTEND", FrontEndKind::Process)?,
            device_args: env.string("DEVICE_ARGS", ""),
            stream_tool_path: env.string("STREAM_TOOL_PATH", "rx_samples_to_file"),
            probe_tool_path: env.string("PROBE_TOOL_PATH", "uhd_find_devices"),

            sample_rate_hz: env.parse("SAMPLE_RATE", 122.88e6)?,
            detection_sample_rate_hz: env.parse("DETECTION_SAMPLE_RATE", 10.24e6)?,
            center_freq_hz: env.parse("CENTER_FREQ", 3_650_000_000)?,
            home_freq_hz: env.parse("HOME_FREQ", 3_650_000_000)?,
            gain_db: env.parse("GAIN_DB", 40.0)?,
            bandwidth_hz: env.parse_optional("BANDWIDTH")?,
            antenna: env.raw("ANTENNA"),
            reference_source: env.parse("REFERENCE_SOURCE", ReferenceSource::Internal)?,

            num_bins: env.parse("NUM_BINS", 512)?,
            frame_rate: env.parse("FRAME_RATE", 1000.0)?,

            channel_step: env.parse("CHANNEL_STEP", 34)?,
            channel_offset: env.parse("CHANNEL_OFFSET", 5)?,
            start_trim: env.parse("START_TRIM", 1)?,
            end_trim: env.parse("END_TRIM", 1)?,
            base_freq_hz: env.parse("BASE_FREQ", 3_550_000_000)?,
            channel_width_hz: env.parse("CHANNEL_WIDTH", 10_000_000)?,
            interior_threshold_db: env.parse("INTERIOR_THRESHOLD_DB", -70.0)?,
            edge_threshold_db: env.parse("EDGE_THRESHOLD_DB", -60.0)?,

            capture_samples: env.parse("CAPTURE_SAMPLES", 102_400)?,
            max_zero_reads: env.parse("MAX_ZERO_READS", 3)?,
            receive_timeout_ms: env.parse("RECEIVE_TIMEOUT_MS", 100)?,
            power_report_interval_ms: env.parse("POWER_REPORT_INTERVAL_MS", 500)?,
            detection_cooldown_ms: env.parse("DETECTION_COOLDOWN_MS", 10_000)?,

            sensor_id: env.string("SENSOR_ID", "CCI-xG-Sensor-01"),
            sensor_lat: env.parse("SENSOR_LAT", 38.88095833926984)?,
            sensor_lon: env.parse("SENSOR_LON", -77.11573962785668)?,

            collector_port: env.parse("COLLECTOR_PORT", 1443)?,
            collector_server_name: env.string("COLLECTOR_SERVER_NAME", &collector_host),
            collector_host,
            collector_base_path: env.string("COLLECTOR_BASE_PATH", "/sas-api"),
            client_cert_path: PathBuf::from(env.string("CLIENT_CERT_PATH", "certs/client.crt")),
            client_key_path: PathBuf::from(env.string("CLIENT_KEY_PATH", "certs/client.key")),
            ca_cert_path: PathBuf::from(env.string("CA_CERT_PATH", "certs/ca.crt")),
            connect_timeout_ms: env.parse("CONNECT_TIMEOUT_MS", 3_000)?,
            io_timeout_ms: env.parse("COLLECTOR_IO_TIMEOUT_MS", 10_000)?,
            max_response_bytes: env.parse("MAX_RESPONSE_BYTES", 4096)?,

            report_queue_depth: env.parse("REPORT_QUEUE_DEPTH", 32)?,
            latency_report_interval_secs: env.parse("LATENCY_REPORT_INTERVAL_SECS", 60)?,

            sim_noise_amplitude: env.parse("SIM_NOISE_AMPLITUDE", 1e-4)?,
            sim_carrier_freq_hz: env.parse_optional("SIM_CARRIER_FREQ")?,
            sim_carrier_amplitude: env.parse("SIM_CARRIER_AMPLITUDE", 0.05)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Range checks, and that the spectrum covers the channel layout
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("SAMPLE_RATE", self.sample_rate_hz),
            ("DETECTION_SAMPLE_RATE", self.detection_sample_rate_hz),
            ("FRAME_RATE", self.frame_rate),
        ];
        for (key, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::OutOfRange(format!("{} must be positive, got {}", key, value)));
            }
        }
        if Duration::try_from_secs_f64(1.0 / self.frame_rate).is_err() {
            return Err(ConfigError::OutOfRange(format!(
                "FRAME_RATE={} gives a frame period too long to schedule",
                self.frame_rate
            )));
        }

        if self.channel_step == 0 {
            return Err(ConfigError::OutOfRange("CHANNEL_STEP must be at least 1".to_string()));
        }
        if self.channel_offset >= NUM_CHANNELS {
            return Err(ConfigError::OutOfRange(format!(
                "CHANNEL_OFFSET must be below {}, got {}",
                NUM_CHANNELS, self.channel_offset
            )));
        }
        if self.capture_samples == 0 {
            return Err(ConfigError::OutOfRange("CAPTURE_SAMPLES must be at least 1".to_string()));
        }
        if self.max_zero_reads == 0 {
            return Err(ConfigError::OutOfRange("MAX_ZERO_READS must be at least 1".to_string()));
        }
        if !(-90.0..=90.0).contains(&self.sensor_lat) || !(-180.0..=180.0).contains(&self.sensor_lon) {
            return Err(ConfigError::OutOfRange(format!(
                "sensor position ({}, {}) is not a valid coordinate",
                self.sensor_lat, self.sensor_lon
            )));
        }

        let spectrum_len = self.spectrum_len();
        let required = self.channel_layout().required_len();
        if spectrum_len < required {
            return Err(ConfigError::OutOfRange(format!(
                "NUM_BINS={} gives {} spectrum bins, channel layout needs {}",
                self.num_bins, spectrum_len, required
            )));
        }
        Ok(())
    }

    /// Bins left after the transform drops the unpaired bin of even sizes
    pub fn spectrum_len(&self) -> usize {
        self.num_bins.saturating_sub(1 - self.num_bins % 2)
    }

    pub fn frontend_settings(&self) -> FrontEndSettings {
        FrontEndSettings {
            sample_rate_hz: self.sample_rate_hz,
            center_freq_hz: self.center_freq_hz,
            gain_db: self.gain_db,
            bandwidth_hz: self.bandwidth_hz,
            antenna: self.antenna.clone(),
        }
    }

    pub fn process_config(&self) -> ProcessConfig {
        ProcessConfig {
            tool_path: self.stream_tool_path.clone(),
            device_args: self.device_args.clone(),
            receive_timeout: Duration::from_millis(self.receive_timeout_ms),
        }
    }

    pub fn sim_carrier(&self) -> Option<Carrier> {
        self.sim_carrier_freq_hz.map(|freq_hz| Carrier {
            freq_hz,
            amplitude: self.sim_carrier_amplitude,
        })
    }

    pub fn channel_layout(&self) -> ChannelLayout {
        ChannelLayout {
            step: self.channel_step,
            channel_offset: self.channel_offset,
            start_trim: self.start_trim,
            end_trim: self.end_trim,
        }
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            interior_db: self.interior_threshold_db,
            edge_db: self.edge_threshold_db,
        }
    }

    pub fn sensing_config(&self) -> SensingConfig {
        SensingConfig {
            scan_block_samples: self.num_bins,
            capture_samples: self.capture_samples,
            wide_rate_hz: self.sample_rate_hz,
            detection_rate_hz: self.detection_sample_rate_hz,
            max_zero_reads: self.max_zero_reads,
            frame_rate: self.frame_rate,
            power_report_interval: Duration::from_millis(self.power_report_interval_ms),
            detection_cooldown: Duration::from_millis(self.detection_cooldown_ms),
            band: BandPlan {
                base_freq_hz: self.base_freq_hz,
                channel_width_hz: self.channel_width_hz,
                home_freq_hz: self.home_freq_hz,
            },
        }
    }

    pub fn sensor_identity(&self) -> SensorIdentity {
        SensorIdentity {
            sensor_id: self.sensor_id.clone(),
            latitude: self.sensor_lat,
            longitude: self.sensor_lon,
        }
    }

    pub fn collector_endpoint(&self) -> CollectorEndpoint {
        CollectorEndpoint {
            host: self.collector_host.clone(),
            port: self.collector_port,
            server_name: self.collector_server_name.clone(),
            base_path: self.collector_base_path.clone(),
            client_cert_path: self.client_cert_path.clone(),
            client_key_path: self.client_key_path.clone(),
            ca_cert_path: self.ca_cert_path.clone(),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            io_timeout: Duration::from_millis(self.io_timeout_ms),
            max_response_bytes: self.max_response_bytes,
        }
    }
}
