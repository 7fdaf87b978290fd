//! Observability: structured logging and per-transport metrics

pub mod logging;
pub mod metrics;

pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{DeviceStats, MetricsSnapshot, TransportMetrics};

// Span macros for structured logging
pub use logging::{connection_span, device_span};
