//! Observability infrastructure.
//!
//! Structured logging plus the span vocabulary of the scheduler: work on a
//! workflow instance is always tagged with the same three fields
//! (`component`, `workflow`, `parameter`) so one instance's trail can be
//! followed across the state manager, the handlers and the HTTP surface.

use tracing::Span;
use tracing_subscriber::EnvFilter;

use crate::id::WorkflowInstance;

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl LogFormat {
    /// Reads the format from `ALMANAC_LOG_FORMAT` (`json` or `pretty`,
    /// default pretty).
    #[must_use]
    pub fn from_env() -> Self {
        match std::env::var("ALMANAC_LOG_FORMAT") {
            Ok(value) if value.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Pretty,
        }
    }
}

/// Initializes the logging subsystem.
///
/// Call once at process startup; a second call is a no-op (the first
/// subscriber wins). Log levels are controlled with `RUST_LOG`.
pub fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    // try_init only fails when a subscriber is already installed, which is
    // exactly the repeated-call case.
    let _ = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    };
}

/// Creates a span for work on one workflow instance.
///
/// Every subsystem that touches an instance enters (or instruments with)
/// this span so its log lines carry the same correlation fields.
#[must_use]
pub fn instance_span(operation: &'static str, instance: &WorkflowInstance) -> Span {
    tracing::info_span!(
        "instance",
        op = operation,
        component = %instance.workflow_id.component,
        workflow = %instance.workflow_id.name,
        parameter = %instance.parameter,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::WorkflowId;

    #[test]
    fn log_format_defaults_to_pretty() {
        assert!(matches!(LogFormat::default(), LogFormat::Pretty));
    }

    #[test]
    fn instance_span_is_constructible_without_a_subscriber() {
        let instance = WorkflowInstance::new(WorkflowId::new("styx", "daily"), "2020-01-01");
        let span = instance_span("test", &instance);
        let _guard = span.enter();
    }
}
