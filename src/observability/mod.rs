//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events)
//!     → metrics.rs (MetricEvent → counters, gauges)
//!
//! Consumers:
//!     → stdout (pretty or JSON)
//!     → GET /metrics (JSON snapshot)
//!     → Prometheus scrape (optional exporter)
//! ```
//!
//! # Design Decisions
//! - Structured logging for machine parsing
//! - Request ID flows through all subsystems
//! - Metrics are cheap (atomic increments)

pub mod logging;
pub mod metrics;

pub use metrics::{MetricEvent, MetricsCollector, MetricsSnapshot};
