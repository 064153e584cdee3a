//! Telemetry to the remote collector
//!
//! Power reports go to `<base>/measurements`, IQ captures to `<base>/samples`,
//! each over its own mutually-authenticated TLS connection.

mod payload;
mod reporter;
mod transport;

pub use payload::{SensorIdentity, TelemetryPayload};
pub use reporter::{report_queue, QueueSink, ReportSink, TelemetryReporter};
pub use transport::{load_client_config, CollectorEndpoint, TlsTransport};
