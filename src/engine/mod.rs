//! Engines: the lifecycle state machine, the periodic engine built on it,
//! and the ticker that drives periodic work.

pub mod lifecycle;
pub mod periodic;
pub mod ticker;

pub use lifecycle::{Engine, EngineContext, Lifecycle, Service};
pub use periodic::{Periodic, PeriodicEngine, PeriodicWork, TickContext};
pub use ticker::Ticker;
