//! Observability for the voice transport: Prometheus counters and the
//! `tracing` subscriber used by the CLI.

mod metrics;
mod tracing;

pub use metrics::{MetricsContext, MetricsServerConfig};
pub use tracing::init_tracing;
