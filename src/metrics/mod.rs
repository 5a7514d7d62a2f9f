//! Metrics and observability.
//!
//! - `events`: internal events and the `InternalEvent` trait, exported
//!   through the `metrics` facade
//! - `collector`: in-process windowed statistics behind run snapshots
//! - `histogram`: the streaming latency histogram used by the collector
//! - `server`: Prometheus HTTP server and health endpoint

pub mod collector;
pub mod events;
pub mod histogram;
pub mod server;

pub use collector::{ErrorKind, LatencySummary, MetricSample, MetricsCollector, MetricsSnapshot};
pub use server::init;

/// Emit an internal event.
///
/// This macro calls the `InternalEvent::emit()` method on the given event,
/// which records the corresponding Prometheus metric.
///
/// # Example
///
/// ```ignore
/// use flurry::metrics::events::RecordsPolled;
///
/// emit!(RecordsPolled { count: 100, bytes: 4096 });
/// ```
#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::metrics::events::InternalEvent::emit($event)
    };
}
