use metrics::gauge;

use procq_domain::ports::StatisticsSink;

/// Publishes statistics through the process-wide metrics recorder.
pub struct MetricsStatisticsSink;

impl StatisticsSink for MetricsStatisticsSink {
    fn emit(&self, key: &str, _timestamp_ms: i64, value: f64) {
        gauge!(key.to_string()).set(value);
    }
}
