//! Span helpers for engine lifecycles and ticks.

use opentelemetry::KeyValue;
use tracing::Span;

use crate::model::EngineState;

/// Start a span covering one periodic work invocation.
///
/// `tick.duration_ms` is declared empty and filled in once the work returns.
pub fn start_tick_span(engine: &str, execution: u64) -> Span {
    tracing::info_span!(
        "engine.tick",
        "engine.name" = engine,
        "tick.execution" = execution,
        "tick.duration_ms" = tracing::field::Empty,
    )
}

/// Log a state transition and count it.
pub fn record_state_transition(engine: &str, from: EngineState, to: EngineState) {
    tracing::info!(engine, from = %from, state = %to, "{engine}: {to}");
    super::metrics::state_transitions().add(
        1,
        &[
            KeyValue::new("engine", engine.to_string()),
            KeyValue::new("state", to.as_str()),
        ],
    );
}
