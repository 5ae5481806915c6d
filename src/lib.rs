//! # engines-rs
//!
//! Long-running, in-process background engines with a guarded
//! start/stop/restart lifecycle, and a periodic engine that runs a unit of
//! work on an interval, never overlapping itself, and drains in-flight work
//! on shutdown.

pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod telemetry;

pub use config::PeriodicConfig;
pub use engine::{Engine, EngineContext, Lifecycle, PeriodicEngine, PeriodicWork, TickContext};
pub use error::{AggregateError, Error, Result};
pub use model::{EngineState, PeriodicStats};
