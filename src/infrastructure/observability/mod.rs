//! Push-based observability for finsight
//!
//! Metrics leave the process as outbound data only: a Prometheus registry
//! rendered in text format, and periodic JSON lines on stdout. No HTTP
//! server, no incoming requests.

pub mod metrics;
pub mod reporter;

pub use metrics::Metrics;
pub use reporter::MetricsReporter;
