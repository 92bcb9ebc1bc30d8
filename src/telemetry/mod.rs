//! Traffic telemetry: the local Prometheus registry and the shared,
//! time-windowed counters every gateway instance writes to the store.

mod recorder;
mod registry;
mod snapshot;

pub use recorder::{minute_window, second_window, MetricsRecorder, RequestSample, WindowKeys};
pub use registry::Metrics;
pub use snapshot::{RealtimeSnapshot, RouteShare};
