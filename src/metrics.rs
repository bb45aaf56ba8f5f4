use prometheus::{Encoder, TextEncoder};

use crate::result::ResultCode;

/// Custom metrics for protocol-level tracking
pub mod custom {
    use once_cell::sync::Lazy;
    use prometheus::{
        register_counter, register_counter_vec, register_histogram_vec, register_int_gauge,
        Counter, CounterVec, HistogramVec, IntGauge,
    };

    /// Accepted LDAP connections
    pub static SESSIONS_TOTAL: Lazy<Counter> = Lazy::new(|| {
        register_counter!(
            "ldap_sessions_total",
            "Total number of accepted LDAP connections"
        )
        .expect("Failed to register sessions_total counter")
    });

    /// Currently open LDAP connections
    pub static SESSIONS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
        register_int_gauge!(
            "ldap_sessions_active",
            "Number of LDAP connections currently open"
        )
        .expect("Failed to register sessions_active gauge")
    });

    /// Completed operations by kind and result code name
    pub static OPERATIONS: Lazy<CounterVec> = Lazy::new(|| {
        register_counter_vec!(
            "ldap_operations_total",
            "Total number of LDAP operations",
            &["operation", "result"]
        )
        .expect("Failed to register operations counter")
    });

    pub static OPERATION_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
        register_histogram_vec!(
            "ldap_operation_duration_seconds",
            "Duration of LDAP operations in seconds",
            &["operation"],
            vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0]
        )
        .expect("Failed to register operation_duration histogram")
    });

    pub static SEARCH_ENTRIES: Lazy<Counter> = Lazy::new(|| {
        register_counter!(
            "ldap_search_entries_total",
            "Total number of search result entries sent"
        )
        .expect("Failed to register search_entries counter")
    });

    /// Messages rejected by the codec, split into fatal and operation-level
    pub static DECODE_ERRORS: Lazy<CounterVec> = Lazy::new(|| {
        register_counter_vec!(
            "ldap_decode_errors_total",
            "Total number of LDAP messages that failed to decode",
            &["kind"]
        )
        .expect("Failed to register decode_errors counter")
    });
}

/// Helper function to record a newly opened session
pub fn record_session_opened() {
    custom::SESSIONS_TOTAL.inc();
    custom::SESSIONS_ACTIVE.inc();
}

pub fn record_session_closed() {
    custom::SESSIONS_ACTIVE.dec();
}

pub fn active_sessions() -> i64 {
    custom::SESSIONS_ACTIVE.get()
}

/// Helper function to record a finished operation
pub fn record_operation(operation: &str, result: ResultCode, seconds: f64) {
    custom::OPERATIONS
        .with_label_values(&[operation, result.name()])
        .inc();
    custom::OPERATION_DURATION
        .with_label_values(&[operation])
        .observe(seconds);
}

pub fn record_search_entry() {
    custom::SEARCH_ENTRIES.inc();
}

/// `fatal` is true for malformed frames that close the connection
pub fn record_decode_error(fatal: bool) {
    let kind = if fatal { "malformed" } else { "unsupported" };
    custom::DECODE_ERRORS.with_label_values(&[kind]).inc();
}

/// Renders every registered metric in the Prometheus text format
pub fn render() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operations_are_rendered() {
        record_operation("compare", ResultCode::CompareTrue, 0.002);
        record_decode_error(true);

        let body = render();
        assert!(body.contains("# TYPE ldap_operations_total counter"));
        assert!(body.contains(r#"operation="compare",result="compareTrue""#));
        assert!(body.contains(r#"ldap_decode_errors_total{kind="malformed"}"#));
    }
}
