use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::Serialize;

/// Performance snapshot of the most recent completed request.
///
/// Durations are milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkMetrics {
    pub time_to_first_token: Option<f64>,
    pub tokens_per_second: Option<f64>,
    pub total_tokens: Option<u64>,
    pub request_duration: Option<f64>,
}

impl NetworkMetrics {
    /// Builds a full snapshot from one request's timing.
    ///
    /// Returns `None` for degenerate requests (no tokens or zero elapsed time) so
    /// throughput is never computed from a zero denominator.
    pub fn from_request(
        request_duration: Duration,
        total_tokens: u64,
        throughput_tokens: u64,
        time_to_first_token: Duration,
    ) -> Option<Self> {
        let duration_ms = duration_millis(request_duration);
        if throughput_tokens == 0 || duration_ms <= 0.0 {
            return None;
        }

        Some(Self {
            time_to_first_token: Some(duration_millis(time_to_first_token)),
            tokens_per_second: Some(throughput_tokens as f64 / duration_ms * 1000.0),
            total_tokens: Some(total_tokens),
            request_duration: Some(duration_ms),
        })
    }

    /// Shallow merge: every field present in `updates` replaces the current one.
    pub fn merged_with(self, updates: NetworkMetrics) -> Self {
        Self {
            time_to_first_token: updates.time_to_first_token.or(self.time_to_first_token),
            tokens_per_second: updates.tokens_per_second.or(self.tokens_per_second),
            total_tokens: updates.total_tokens.or(self.total_tokens),
            request_duration: updates.request_duration.or(self.request_duration),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub(crate) fn duration_millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// Latest metrics snapshot shared between the client and its readers.
#[derive(Default)]
pub struct MetricsAccumulator {
    snapshot: ArcSwap<NetworkMetrics>,
}

impl MetricsAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the current snapshot.
    pub fn snapshot(&self) -> NetworkMetrics {
        **self.snapshot.load()
    }

    pub fn merge(&self, updates: NetworkMetrics) {
        self.snapshot
            .rcu(|current| Arc::new(current.merged_with(updates)));
    }

    pub fn reset(&self) {
        self.snapshot.store(Arc::new(NetworkMetrics::default()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degenerate_requests_produce_no_snapshot() {
        assert!(
            NetworkMetrics::from_request(Duration::from_millis(250), 0, 0, Duration::ZERO)
                .is_none()
        );
        assert!(NetworkMetrics::from_request(Duration::ZERO, 12, 12, Duration::ZERO).is_none());
    }

    #[test]
    fn throughput_is_tokens_per_second() {
        let metrics = NetworkMetrics::from_request(
            Duration::from_millis(500),
            10,
            10,
            Duration::from_millis(100),
        )
        .expect("non-degenerate request");

        assert_eq!(metrics.total_tokens, Some(10));
        assert_eq!(metrics.request_duration, Some(500.0));
        assert_eq!(metrics.time_to_first_token, Some(100.0));
        let tokens_per_second = metrics.tokens_per_second.expect("throughput set");
        assert!((tokens_per_second - 20.0).abs() < 1e-9);
    }

    #[test]
    fn full_snapshots_overwrite_previous_values() {
        let accumulator = MetricsAccumulator::new();
        let first =
            NetworkMetrics::from_request(Duration::from_secs(2), 40, 40, Duration::from_millis(300))
                .expect("first request");
        let second =
            NetworkMetrics::from_request(Duration::from_secs(1), 5, 5, Duration::from_millis(50))
                .expect("second request");

        accumulator.merge(first);
        accumulator.merge(second);

        assert_eq!(accumulator.snapshot(), second);
    }

    #[test]
    fn partial_updates_keep_untouched_fields() {
        let accumulator = MetricsAccumulator::new();
        accumulator.merge(NetworkMetrics {
            total_tokens: Some(7),
            request_duration: Some(90.0),
            ..NetworkMetrics::default()
        });
        accumulator.merge(NetworkMetrics {
            request_duration: Some(120.0),
            ..NetworkMetrics::default()
        });

        let snapshot = accumulator.snapshot();
        assert_eq!(snapshot.total_tokens, Some(7));
        assert_eq!(snapshot.request_duration, Some(120.0));

        accumulator.reset();
        assert!(accumulator.snapshot().is_empty());
    }
}
