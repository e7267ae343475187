//! Observability metrics for the scheduler engine.
//!
//! Metrics are exported through the `metrics` crate facade; install a
//! recorder (e.g. `metrics-exporter-prometheus`) at process startup to
//! publish them.
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `almanac_transitions_total` | Counter | `state` | State transitions by target state |
//! | `almanac_handler_failures_total` | Counter | `handler` | Output handler failures |
//! | `almanac_queued_events` | Gauge | - | Events waiting on state-manager shards |
//! | `almanac_active_states` | Gauge | `state` | Active instances by state |
//! | `almanac_tick_seconds` | Histogram | `ticker` | Tick duration by ticker |
//! | `almanac_triggers_total` | Counter | `source` | Triggers by source (natural, backfill) |
//! | `almanac_timeouts_total` | Counter | `state` | Timeout events by timed-out state |
//! | `almanac_submissions_total` | Counter | `result` | Runner submissions by outcome |

use std::time::{Duration, Instant};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: state transitions by target state.
    pub const TRANSITIONS_TOTAL: &str = "almanac_transitions_total";
    /// Counter: output handler failures by handler.
    pub const HANDLER_FAILURES_TOTAL: &str = "almanac_handler_failures_total";
    /// Gauge: events waiting on state-manager shards.
    pub const QUEUED_EVENTS: &str = "almanac_queued_events";
    /// Gauge: active instances by state.
    pub const ACTIVE_STATES: &str = "almanac_active_states";
    /// Histogram: tick duration by ticker.
    pub const TICK_SECONDS: &str = "almanac_tick_seconds";
    /// Counter: triggers by source.
    pub const TRIGGERS_TOTAL: &str = "almanac_triggers_total";
    /// Counter: timeout events by timed-out state.
    pub const TIMEOUTS_TOTAL: &str = "almanac_timeouts_total";
    /// Counter: runner submissions by outcome.
    pub const SUBMISSIONS_TOTAL: &str = "almanac_submissions_total";
}

/// Label keys used across metrics.
pub mod labels {
    /// Run state label.
    pub const STATE: &str = "state";
    /// Output handler name.
    pub const HANDLER: &str = "handler";
    /// Ticker name (scheduler, trigger, backfill, runtime-config).
    pub const TICKER: &str = "ticker";
    /// Trigger source (natural, backfill).
    pub const SOURCE: &str = "source";
    /// Submission outcome (submitted, failed).
    pub const RESULT: &str = "result";
}

/// RAII guard for timing operations; records the elapsed duration on drop.
pub struct TimingGuard<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> TimingGuard<F>
where
    F: FnOnce(Duration),
{
    /// Creates a guard that calls `on_drop` with the elapsed duration.
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }
}

impl<F> Drop for TimingGuard<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}

/// Creates a timing guard recording into the tick-duration histogram.
#[must_use]
pub fn time_tick(ticker: &'static str) -> TimingGuard<impl FnOnce(Duration)> {
    TimingGuard::new(move |duration| {
        metrics::histogram!(names::TICK_SECONDS, labels::TICKER => ticker)
            .record(duration.as_secs_f64());
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timing_guard_records_on_drop() {
        let mut recorded = None;
        {
            let _guard = TimingGuard::new(|d| recorded = Some(d));
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(recorded.is_some_and(|d| d >= Duration::from_millis(5)));
    }

    #[test]
    fn recording_without_a_recorder_does_not_panic() {
        metrics::counter!(names::TRANSITIONS_TOTAL, labels::STATE => "queued").increment(1);
        metrics::gauge!(names::QUEUED_EVENTS).set(0.0);
        let _guard = time_tick("scheduler");
    }
}
