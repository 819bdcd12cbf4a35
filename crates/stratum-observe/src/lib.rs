//! # Stratum Observe
//!
//! Logging and metrics setup for the stratum datastore: `tracing`-based
//! structured logging and metric family descriptions for the `metrics`
//! facade. The embedding process installs whatever exporter it wants; this
//! crate only describes and initializes.

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use metrics::describe_metrics;
