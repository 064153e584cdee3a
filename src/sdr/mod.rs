//! Radio front-end and spectral transform
//!
//! This module provides the hardware side of the sensor:
//! 1. The `RadioFrontEnd` capability (configure, stream, retune, re-rate)
//! 2. A UHD streaming-tool backend and a synthetic backend
//! 3. The log-power DFT that feeds channel aggregation

mod frontend;
mod process;
mod simulated;
mod transform;

pub use frontend::{
    receive_exact, verify_locks, AppliedConfig, FrontEndSettings, HardwareError, RadioFrontEnd,
    ReferenceSource, RxMetadata, StreamMode,
};
pub use process::{query_device_info, ProcessConfig, ProcessFrontEnd};
pub use simulated::{Carrier, SimulatedFrontEnd};
pub use transform::{LogPowerFft, SpectralTransform};
