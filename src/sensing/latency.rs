//! Per-stage latency counters
//!
//! Shared between the sensing thread and the reporter worker. Every sample is
//! logged at debug as `"<stage> time: <n> us"` and folded into running sums
//! for the periodic summary.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug, info};

/// Timed stages of the sensing cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    FreqShift,
    FreqReturn,
    SrateChange,
    SamplesRecv,
    HttpsRequest,
    Fft,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::FreqShift,
        Stage::FreqReturn,
        Stage::SrateChange,
        Stage::SamplesRecv,
        Stage::HttpsRequest,
        Stage::Fft,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Stage::FreqShift => "Freq shift",
            Stage::FreqReturn => "Freq return",
            Stage::SrateChange => "Srate change",
            Stage::SamplesRecv => "Samples recv",
            Stage::HttpsRequest => "Https req",
            Stage::Fft => "FFT",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Default)]
struct StageCounters {
    count: AtomicU64,
    sum_us: AtomicU64,
    sum_sq_us: AtomicU64,
}

/// Summary of one stage
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageSummary {
    pub stage: Stage,
    pub count: u64,
    pub mean_us: f64,
    pub std_dev_us: f64,
}

impl fmt::Display for StageSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.count == 0 {
            return write!(f, "{}: no data", self.stage.label());
        }
        write!(
            f,
            "{}: n={} avg={:.2} us sd={:.2} us",
            self.stage.label(),
            self.count,
            self.mean_us,
            self.std_dev_us
        )
    }
}

/// Statistics for all stages (atomic for thread-safe access)
#[derive(Debug, Default)]
pub struct LatencyStats {
    stages: [StageCounters; 6],
}

impl LatencyStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, stage: Stage, elapsed: Duration) {
        let us = elapsed.as_micros().min(u64::MAX as u128) as u64;
        debug!("{} time: {} us", stage.label(), us);

        let counters = &self.stages[stage.index()];
        counters.count.fetch_add(1, Ordering::Relaxed);
        counters.sum_us.fetch_add(us, Ordering::Relaxed);
        counters
            .sum_sq_us
            .fetch_add(us.saturating_mul(us), Ordering::Relaxed);
    }

    pub fn summary(&self, stage: Stage) -> StageSummary {
        let counters = &self.stages[stage.index()];
        let count = counters.count.load(Ordering::Relaxed);
        if count == 0 {
            return StageSummary {
                stage,
                count,
                mean_us: 0.0,
                std_dev_us: 0.0,
            };
        }
        let n = count as f64;
        let mean = counters.sum_us.load(Ordering::Relaxed) as f64 / n;
        let mean_sq = counters.sum_sq_us.load(Ordering::Relaxed) as f64 / n;
        StageSummary {
            stage,
            count,
            mean_us: mean,
            std_dev_us: (mean_sq - mean * mean).max(0.0).sqrt(),
        }
    }

    pub fn log_summary(&self) {
        for stage in Stage::ALL {
            info!("[Latency] {}", self.summary(stage));
        }
    }
}
