pub mod metrics_collector;
pub mod telemetry_setup;

pub use metrics_collector::{
    AttemptSpan, WorkerInstruments, WorkerStats, WorkerTag, WorkerTelemetry, SPAN_NAME,
};
pub use telemetry_setup::init_logging;
