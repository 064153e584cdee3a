//! Spectrum Sensor - CBRS band occupancy monitor
//!
//! Scans 3550-3700 MHz with a wideband FFT, captures narrowband IQ on the
//! strongest occupied channel, and posts power and IQ reports to the
//! collector over mutual TLS.

mod config;
mod sdr;
mod sensing;
mod spectrum;
mod telemetry;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::{Config, FrontEndKind};
use sdr::{query_device_info, LogPowerFft, ProcessFrontEnd, RadioFrontEnd, SimulatedFrontEnd};
use sensing::{LatencyStats, SensingStateMachine, SystemClock};
use spectrum::{ChannelDetector, SpectrumAggregator};
use telemetry::{load_client_config, report_queue, QueueSink, TelemetryReporter, TlsTransport};

/// Seed for the simulated front-end noise
const SIM_SEED: u64 = 0x5EED_CB25;

/// How long shutdown waits for queued reports to go out
const DRAIN_TIMEOUT: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("spectrum_sensor=info")),
        )
        .with_target(false)
        .init();

    info!("===========================================");
    info!("   Spectrum Sensor - CBRS occupancy");
    info!("   wideband scan / narrowband capture");
    info!("===========================================");

    let config = Config::from_env().context("invalid configuration")?;
    log_config(&config);

    // Credentials are reloaded on every send; check them once up front
    if let Err(e) = load_client_config(&config.collector_endpoint()) {
        warn!("Client credentials not usable yet: {}", e);
    }

    let latency = Arc::new(LatencyStats::new());

    // Reporter worker: drains the queue until the sensing loop drops its end
    let (sink, report_rx) = report_queue(config.report_queue_depth);
    let reporter = TelemetryReporter::new(
        TlsTransport::new(config.collector_endpoint()),
        latency.clone(),
    );
    let reporter_stats = reporter.stats().clone();
    let reporter_handle = tokio::spawn(reporter.run(report_rx));

    let running = Arc::new(AtomicBool::new(true));
    let sensing_handle = match config.frontend {
        FrontEndKind::Process => {
            info!("Querying UHD device info...");
            let device = query_device_info(&config.probe_tool_path, &config.device_args);
            match (&device.product, &device.serial) {
                (Some(product), Some(serial)) => info!("  Device: {} (serial {})", product, serial),
                (Some(product), None) => info!("  Device: {}", product),
                _ => info!("  Could not query device info"),
            }
            info!("Stream tool: {}", config.stream_tool_path);

            let front_end = ProcessFrontEnd::new(config.process_config());
            spawn_sensing(&config, front_end, sink, latency.clone(), running.clone())
        }
        FrontEndKind::Simulated => {
            info!("Using simulated front-end (carrier: {:?})", config.sim_carrier());
            let front_end =
                SimulatedFrontEnd::new(config.sim_noise_amplitude, config.sim_carrier(), SIM_SEED);
            spawn_sensing(&config, front_end, sink, latency.clone(), running.clone())
        }
    };
    let sensing_handle = match sensing_handle {
        Ok(handle) => handle,
        Err(e) => {
            error!("Failed to start sensing: {:#}", e);
            error!("Make sure the radio is connected and the UHD tools are installed.");
            return Err(e);
        }
    };

    // Periodic latency summary
    let summary_handle = (config.latency_report_interval_secs > 0).then(|| {
        let latency = latency.clone();
        let period = Duration::from_secs(config.latency_report_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                latency.log_summary();
            }
        })
    });

    info!("===========================================");
    info!("  Sensing started.");
    info!("  Press Ctrl+C to stop.");
    info!("===========================================");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;
    info!("Shutdown requested, stopping sensing loop...");
    running.store(false, Ordering::SeqCst);

    match tokio::task::spawn_blocking(move || sensing_handle.join()).await {
        Ok(Ok(())) => {}
        _ => error!("Sensing thread panicked"),
    }

    // The sensing loop owned the only queue sender, so the worker now drains
    if tokio::time::timeout(DRAIN_TIMEOUT, reporter_handle).await.is_err() {
        warn!("Reporter did not drain within {:?}", DRAIN_TIMEOUT);
    }
    if let Some(handle) = summary_handle {
        handle.abort();
    }

    latency.log_summary();
    info!(
        "Shutdown complete. Reports sent: {}, failed: {}",
        reporter_stats.sent.load(Ordering::Relaxed),
        reporter_stats.failed.load(Ordering::Relaxed)
    );
    Ok(())
}

fn log_config(config: &Config) {
    info!("Configuration:");
    info!("  Front-end: {:?} ({})", config.frontend, config.device_args);
    info!(
        "  Scan: {:.2} Msps @ {:.1} MHz, {} bins, {:.0} fps",
        config.sample_rate_hz / 1e6,
        config.center_freq_hz as f64 / 1e6,
        config.num_bins,
        config.frame_rate
    );
    info!(
        "  Capture: {} samples @ {:.2} Msps",
        config.capture_samples,
        config.detection_sample_rate_hz / 1e6
    );
    info!("  Gain: {} dB, reference: {}", config.gain_db, config.reference_source);
    info!(
        "  Thresholds: interior {} dB, edge {} dB",
        config.interior_threshold_db, config.edge_threshold_db
    );
    info!(
        "  Sensor: {} ({}, {})",
        config.sensor_id, config.sensor_lat, config.sensor_lon
    );
    info!(
        "  Collector: https://{}:{}{}",
        config.collector_host, config.collector_port, config.collector_base_path
    );
}

/// Build the state machine, bring up the radio and start the sensing thread
fn spawn_sensing<F: RadioFrontEnd + 'static>(
    config: &Config,
    front_end: F,
    sink: QueueSink,
    latency: Arc<LatencyStats>,
    running: Arc<AtomicBool>,
) -> Result<thread::JoinHandle<()>> {
    let mut machine = SensingStateMachine::new(
        front_end,
        LogPowerFft::new(config.num_bins),
        sink,
        SpectrumAggregator::new(config.channel_layout()),
        ChannelDetector::new(config.channel_offset, config.thresholds()),
        config.sensor_identity(),
        config.sensing_config(),
        Arc::new(SystemClock),
        latency,
    );

    machine
        .start(&config.frontend_settings(), config.reference_source)
        .context("failed to start radio front-end")?;

    thread::Builder::new()
        .name("sensing-loop".to_string())
        .spawn(move || machine.run(&running))
        .context("failed to spawn sensing thread")
}
