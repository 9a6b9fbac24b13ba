use std::time::Duration;

use metrics::{counter, histogram};

/// Metric names reported by the initializer.
///
/// No exporter is installed here; the numbers go to whatever recorder the
/// embedding application has set, or nowhere.
pub struct MetricsCollector {
    pub collections_total: &'static str,
    pub indexes_total: &'static str,
    pub errors_total: &'static str,
    pub run_duration: &'static str,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self {
            collections_total: "errol_schema_collections_total",
            indexes_total: "errol_schema_indexes_total",
            errors_total: "errol_schema_errors_total",
            run_duration: "errol_schema_run_duration_seconds",
        }
    }
}

impl MetricsCollector {
    /// Count one collection outcome (`created`, `unchanged`, `updated`)
    pub fn record_collection(&self, outcome: &'static str) {
        counter!(self.collections_total, "outcome" => outcome).increment(1);
    }

    /// Count one index outcome (`created`, `unchanged`)
    pub fn record_index(&self, outcome: &'static str) {
        counter!(self.indexes_total, "outcome" => outcome).increment(1);
    }

    /// Count a failed operation by error kind
    pub fn record_error(&self, kind: &'static str) {
        counter!(self.errors_total, "kind" => kind).increment(1);
    }

    /// Record how long a full run took
    pub fn record_run(&self, duration: Duration) {
        histogram!(self.run_duration).record(duration.as_secs_f64());
    }
}
