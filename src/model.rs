//! Core data model.
//!
//! An engine is always in exactly one [`EngineState`]. The only way out of a
//! state is a transition driven by the engine itself.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of an engine.
///
/// `Stopped → Starting → Started → Stopping → Stopped`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    #[default]
    Stopped,
    Starting,
    Started,
    Stopping,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "Stopped",
            Self::Starting => "Starting",
            Self::Started => "Started",
            Self::Stopping => "Stopping",
        }
    }

    /// Starting and Stopping. An engine stuck here had a hook fail.
    pub fn is_transitional(&self) -> bool {
        matches!(self, Self::Starting | Self::Stopping)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time diagnostics for a periodic engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodicStats {
    pub name: String,
    pub state: EngineState,

    /// Work invocations attempted since the last start.
    pub execution_count: u64,

    /// Invocations since the last start whose work returned an error.
    pub failure_count: u64,

    /// Duration of the most recent invocation, as reported by the work or measured.
    pub last_processing_duration_ms: u64,

    pub work_in_flight: bool,
    pub last_completed_at: Option<DateTime<Utc>>,
}
