// Engine metrics.
//
// The alerting/audit shell consuming these records lives outside this crate;
// only the registry and the structured snapshot format are provided here.

pub mod metrics;

pub use metrics::{metrics, MetricKind, MetricRecord, MetricsRegistry};

use crate::error::DbError;

/// Bump the typed counter for an error kind. Call sites at the engine
/// boundary route every surfaced error through here.
pub fn record_error(err: &DbError) {
    metrics().incr(&format!("errors.{}", err.kind()));
}
