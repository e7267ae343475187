//! The scheduler tick: timeouts, dequeueing, and retry firing.
//!
//! Every tick scans the active run states and:
//!
//! - posts `timeout` for states older than their configured TTL
//! - posts `dequeue` for queued instances
//! - posts `retry` for waiting instances whose backoff elapsed
//!
//! Ticks never overlap; if the previous tick is still running the new one is
//! skipped with a warning. Failures inside a tick are logged and never
//! propagate to the ticker task.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{info, warn};

use almanac_core::{Event, RunState, State};

use crate::error::{Error, Result};
use crate::metrics::{labels, names, time_tick};
use crate::state_manager::{EventSink, StateManager};

/// Default TTL applied to states without an explicit entry.
fn default_ttl() -> Duration {
    Duration::hours(24)
}

/// Per-state time-to-live configuration.
///
/// Parsed from a `state label → ISO-8601 duration` mapping with a `default`
/// key, e.g. `{"submitted": "PT10M", "running": "PT24H", "default": "PT5M"}`.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    ttls: HashMap<State, Duration>,
    default_ttl: Duration,
}

impl TimeoutConfig {
    /// Builds the configuration from raw label/duration strings.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for unknown state labels or malformed
    /// durations.
    pub fn from_map(raw: &HashMap<String, String>) -> Result<Self> {
        let mut ttls = HashMap::new();
        let mut default_ttl = default_ttl();

        for (label, value) in raw {
            let ttl = parse_iso8601_duration(value)?;
            if label.eq_ignore_ascii_case("default") {
                default_ttl = ttl;
                continue;
            }
            let state = State::all()
                .into_iter()
                .find(|state| state.as_label().eq_ignore_ascii_case(label))
                .ok_or_else(|| {
                    Error::configuration(format!("unknown state in stale-state-ttls: {label}"))
                })?;
            ttls.insert(state, ttl);
        }

        Ok(Self { ttls, default_ttl })
    }

    /// Returns the TTL for a state.
    #[must_use]
    pub fn ttl(&self, state: State) -> Duration {
        self.ttls.get(&state).copied().unwrap_or(self.default_ttl)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            ttls: HashMap::new(),
            default_ttl: default_ttl(),
        }
    }
}

/// The periodic scheduler over active run states.
pub struct Scheduler {
    state_manager: Arc<StateManager>,
    ttls: TimeoutConfig,
    ticking: Mutex<()>,
}

impl Scheduler {
    /// Creates a scheduler.
    #[must_use]
    pub fn new(state_manager: Arc<StateManager>, ttls: TimeoutConfig) -> Self {
        Self {
            state_manager,
            ttls,
            ticking: Mutex::new(()),
        }
    }

    /// Runs one tick. Skips (with a warning) if the previous tick is still
    /// running.
    pub async fn tick(&self) {
        let Ok(_guard) = self.ticking.try_lock() else {
            warn!("previous scheduler tick still running, skipping");
            return;
        };
        let _timing = time_tick("scheduler");

        let now = Utc::now();
        for (instance, state) in self.state_manager.active_states().await {
            let event = Self::next_action(&state, &self.ttls, now);
            let Some(event) = event else { continue };

            if matches!(event, Event::Timeout) {
                info!(instance = %instance, state = %state.state, "state exceeded its ttl");
                metrics::counter!(
                    names::TIMEOUTS_TOTAL,
                    labels::STATE => state.state.as_label()
                )
                .increment(1);
            }

            if let Err(error) = self.state_manager.receive(&instance, event).await {
                // The instance may have moved concurrently; the next tick
                // will see the fresh state.
                warn!(instance = %instance, error = %error, "scheduler event rejected");
            }
        }
    }

    fn next_action(state: &RunState, ttls: &TimeoutConfig, now: DateTime<Utc>) -> Option<Event> {
        if now - state.timestamp >= ttls.ttl(state.state) {
            return Some(Event::Timeout);
        }
        match state.state {
            State::Queued => Some(Event::Dequeue),
            State::AwaitingRetry if retry_due(state, now) => Some(Event::Retry),
            _ => None,
        }
    }
}

fn retry_due(state: &RunState, now: DateTime<Utc>) -> bool {
    state
        .data
        .retry_delay_millis
        .is_none_or(|millis| state.timestamp + Duration::milliseconds(millis) <= now)
}

/// Parses an ISO-8601 duration of the form `PnW` / `PnDTnHnMnS`.
///
/// Calendar-relative fields (years, months) are rejected: TTLs must be exact
/// durations.
///
/// # Errors
///
/// Returns a configuration error for anything that is not a valid duration.
pub fn parse_iso8601_duration(value: &str) -> Result<Duration> {
    let input = value.trim().to_ascii_uppercase();
    let invalid = |message: &str| {
        Error::configuration(format!("invalid ISO-8601 duration {value:?}: {message}"))
    };

    let Some(body) = input.strip_prefix('P') else {
        return Err(invalid("must start with 'P'"));
    };
    if body.is_empty() {
        return Err(invalid("empty duration"));
    }

    let mut seconds: i64 = 0;
    let mut number = String::new();
    let mut in_time_part = false;
    let mut saw_field = false;

    for c in body.chars() {
        match c {
            'T' if !in_time_part => in_time_part = true,
            '0'..='9' => number.push(c),
            'W' | 'D' | 'H' | 'M' | 'S' => {
                let quantity: i64 = number
                    .parse()
                    .map_err(|_| invalid("missing number before unit"))?;
                number.clear();
                saw_field = true;
                let unit_seconds = match c {
                    'W' => 7 * 24 * 3600,
                    'D' => 24 * 3600,
                    'H' if in_time_part => 3600,
                    'M' if in_time_part => 60,
                    'S' if in_time_part => 1,
                    'M' => return Err(invalid("calendar months are not supported")),
                    _ => return Err(invalid("time unit outside the time part")),
                };
                seconds = quantity
                    .checked_mul(unit_seconds)
                    .and_then(|s| seconds.checked_add(s))
                    .ok_or_else(|| invalid("duration overflow"))?;
            }
            'Y' => return Err(invalid("calendar years are not supported")),
            _ => return Err(invalid("unexpected character")),
        }
    }

    if !number.is_empty() {
        return Err(invalid("trailing number without unit"));
    }
    if !saw_field {
        return Err(invalid("no fields"));
    }
    Ok(Duration::seconds(seconds))
}
