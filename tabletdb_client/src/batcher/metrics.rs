//! Request counters shared by the batchers of a session.

use metric::U64Counter;

/// Counts the tablet server requests of every batcher built with it.
///
/// Cloning shares the underlying counters.
#[derive(Debug, Clone)]
pub struct BatcherMetrics {
    requests_sent: U64Counter,
    requests_failed: U64Counter,
    rows_errored: U64Counter,
}

impl BatcherMetrics {
    pub fn new(registry: &metric::Registry) -> Self {
        let requests_sent = registry
            .register_metric::<U64Counter>(
                "tabletdb_batcher_requests_sent",
                "cumulative count of requests sent to tablet servers",
            )
            .recorder(&[]);
        let requests_failed = registry
            .register_metric::<U64Counter>(
                "tabletdb_batcher_requests_failed",
                "cumulative count of requests that failed as a whole",
            )
            .recorder(&[]);
        let rows_errored = registry
            .register_metric::<U64Counter>(
                "tabletdb_batcher_row_errors",
                "cumulative count of operations rejected by a tablet server",
            )
            .recorder(&[]);

        Self {
            requests_sent,
            requests_failed,
            rows_errored,
        }
    }

    pub fn requests_sent(&self) -> u64 {
        self.requests_sent.fetch()
    }

    pub fn requests_failed(&self) -> u64 {
        self.requests_failed.fetch()
    }

    pub fn rows_errored(&self) -> u64 {
        self.rows_errored.fetch()
    }

    pub(super) fn record_sent(&self) {
        self.requests_sent.inc(1);
    }

    pub(super) fn record_failed(&self) {
        self.requests_failed.inc(1);
    }

    pub(super) fn record_row_errors(&self, n: usize) {
        if n > 0 {
            self.rows_errored.inc(n as u64);
        }
    }
}

#[cfg(test)]
mod tests {
    use metric::{Attributes, Metric};

    use super::*;

    #[track_caller]
    fn assert_counter_value(metrics: &metric::Registry, name: &'static str, value: u64) {
        let count = metrics
            .get_instrument::<Metric<U64Counter>>(name)
            .expect("failed to read counter")
            .get_observer(&Attributes::from(&[]))
            .expect("failed to get observer")
            .fetch();
        assert_eq!(count, value, "{name}");
    }

    #[test]
    fn clones_share_counters() {
        let registry = metric::Registry::default();
        let a = BatcherMetrics::new(&registry);
        let b = a.clone();

        a.record_sent();
        b.record_sent();
        b.record_failed();
        a.record_row_errors(0);
        b.record_row_errors(3);

        assert_counter_value(&registry, "tabletdb_batcher_requests_sent", 2);
        assert_counter_value(&registry, "tabletdb_batcher_requests_failed", 1);
        assert_counter_value(&registry, "tabletdb_batcher_row_errors", 3);
        assert_eq!(a.requests_sent(), 2);
        assert_eq!(a.requests_failed(), 1);
        assert_eq!(a.rows_errored(), 3);
    }

    #[test]
    fn registering_twice_shares_counters() {
        let registry = metric::Registry::default();
        BatcherMetrics::new(&registry).record_sent();
        BatcherMetrics::new(&registry).record_sent();

        assert_counter_value(&registry, "tabletdb_batcher_requests_sent", 2);
    }
}
