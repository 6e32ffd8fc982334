//! Observability: structured logging and relay counters

pub mod logging;
pub mod metrics;

pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{metrics, MetricsSnapshot, RelayMetrics};

pub use logging::{mqtt_span, relay_span};
