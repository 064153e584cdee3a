//! Telemetry reporter and its outbound queue
//!
//! The sensing thread hands payloads to a bounded queue without blocking;
//! a single async worker drains it in order and posts each payload over the
//! transport. Send failures are logged and dropped: there is no retry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::payload::TelemetryPayload;
use super::transport::{Transport, TransportError};
use crate::sensing::{LatencyStats, Stage};

/// Destination for reports produced by the sensing loop
pub trait ReportSink {
    /// Hand off a payload; must not block the sensing loop
    fn submit(&mut self, payload: TelemetryPayload);
}

/// Sending half of the bounded report queue
pub struct QueueSink {
    tx: mpsc::Sender<TelemetryPayload>,
    dropped: u64,
}

impl ReportSink for QueueSink {
    fn submit(&mut self, payload: TelemetryPayload) {
        match self.tx.try_send(payload) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(p)) => {
                self.dropped += 1;
                warn!(
                    "Report queue full, dropping {} report ({} dropped so far)",
                    p.resource().path_segment(),
                    self.dropped
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Report queue closed, dropping report");
            }
        }
    }
}

/// Create the bounded queue between the sensing loop and the worker
pub fn report_queue(depth: usize) -> (QueueSink, mpsc::Receiver<TelemetryPayload>) {
    let (tx, rx) = mpsc::channel(depth.max(1));
    (QueueSink { tx, dropped: 0 }, rx)
}

/// Counters for delivered and failed reports
#[derive(Debug, Default)]
pub struct ReporterStats {
    pub sent: AtomicU64,
    pub failed: AtomicU64,
}

/// Serializes payloads and publishes them through a transport
pub struct TelemetryReporter<T: Transport> {
    transport: T,
    latency: Arc<LatencyStats>,
    stats: Arc<ReporterStats>,
}

impl<T: Transport> TelemetryReporter<T> {
    pub fn new(transport: T, latency: Arc<LatencyStats>) -> Self {
        Self {
            transport,
            latency,
            stats: Arc::new(ReporterStats::default()),
        }
    }

    pub fn stats(&self) -> &Arc<ReporterStats> {
        &self.stats
    }

    /// Publish one payload to its collector resource
    pub async fn send(&self, payload: &TelemetryPayload) -> Result<(), TransportError> {
        let resource = payload.resource();
        let body = payload
            .to_json()
            .map_err(|e| TransportError::WriteFailed(format!("serialize: {}", e)))?;

        let started = Instant::now();
        let result = self.transport.post(resource, &body).await;
        self.latency.record(Stage::HttpsRequest, started.elapsed());

        match result {
            Ok(response) => {
                self.stats.sent.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Posted {} ({} bytes) -> status {:?}, {} response bytes",
                    resource.path_segment(),
                    body.len(),
                    response.status,
                    response.bytes
                );
                Ok(())
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Drain the queue until every sender is gone
    pub async fn run(self, mut rx: mpsc::Receiver<TelemetryPayload>) {
        info!("Telemetry reporter started");
        while let Some(payload) = rx.recv().await {
            if let Err(e) = self.send(&payload).await {
                warn!("[{}] Report not delivered: {}", payload.resource().path_segment(), e);
            }
        }
        info!(
            "Telemetry reporter stopped. Sent: {}, Failed: {}",
            self.stats.sent.load(Ordering::Relaxed),
            self.stats.failed.load(Ordering::Relaxed)
        );
    }
}
