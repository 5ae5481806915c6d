//! Start/stop/restart state machine shared by every engine.
//!
//! [`Engine`] owns the state and the transitions. What an engine actually does
//! when it starts or stops lives behind the [`Lifecycle`] trait. The check and
//! the flip of each transition happen atomically on the state channel, so two
//! racing `start` calls can never both get past `Stopped`.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{error, info};

use crate::error::{Error, Result};
use crate::model::EngineState;
use crate::telemetry::engine::record_state_transition;

/// The work an engine does when it starts and stops.
///
/// Both hooks run to completion before the surrounding transition finishes.
/// An error from either is handed back to the caller of `start`/`stop` and
/// the engine stays in `Starting`/`Stopping`.
#[async_trait]
pub trait Lifecycle: Send + Sync + 'static {
    async fn on_startup(&self, ctx: &EngineContext) -> anyhow::Result<()>;

    async fn on_shutdown(&self, ctx: &EngineContext) -> anyhow::Result<()>;
}

/// Read-only view of an engine, handed to hooks.
#[derive(Debug, Clone)]
pub struct EngineContext {
    name: Arc<str>,
    state: watch::Receiver<EngineState>,
}

impl EngineContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Live engine state, not a snapshot from when the hook was called.
    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    pub fn is_stopping(&self) -> bool {
        self.state() == EngineState::Stopping
    }
}

/// An engine with a guarded start/stop lifecycle.
pub struct Engine<L> {
    name: Arc<str>,
    state: watch::Sender<EngineState>,
    hooks: L,
}

impl<L: Lifecycle> Engine<L> {
    /// Create an engine in the `Stopped` state.
    pub fn new(name: impl Into<String>, hooks: L) -> Self {
        let (state, _) = watch::channel(EngineState::Stopped);
        Self {
            name: Arc::from(name.into()),
            state,
            hooks,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    /// Watch state changes. Only the latest state is retained, so a slow
    /// observer may skip intermediate states.
    pub fn subscribe(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    pub fn hooks(&self) -> &L {
        &self.hooks
    }

    fn context(&self) -> EngineContext {
        EngineContext {
            name: Arc::clone(&self.name),
            state: self.state.subscribe(),
        }
    }

    /// Flip `from` to `to` if and only if the engine is in `from`.
    /// Returns the state that was observed on failure.
    fn compare_and_transition(
        &self,
        from: EngineState,
        to: EngineState,
    ) -> std::result::Result<(), EngineState> {
        let mut observed = from;
        let changed = self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                observed = *state;
                false
            }
        });
        if changed {
            record_state_transition(&self.name, from, to);
            Ok(())
        } else {
            Err(observed)
        }
    }

    fn transition(&self, to: EngineState) {
        let from = self.state.send_replace(to);
        record_state_transition(&self.name, from, to);
    }

    fn invalid_state(&self, state: EngineState, operation: &'static str) -> Error {
        Error::InvalidState {
            name: self.name.to_string(),
            state,
            operation,
        }
    }

    /// Start the engine. Only valid from `Stopped`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] without any side effect if the engine is not
    /// stopped; the hook's error if `on_startup` fails, in which case the
    /// engine is left in `Starting`.
    pub async fn start(&self) -> Result<()> {
        self.compare_and_transition(EngineState::Stopped, EngineState::Starting)
            .map_err(|state| self.invalid_state(state, "start"))?;

        let ctx = self.context();
        self.hooks
            .on_startup(&ctx)
            .await
            .map_err(|e| Error::hook(&self.name, "on_startup", e))?;

        self.transition(EngineState::Started);
        Ok(())
    }

    /// Stop the engine. Only valid from `Started`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] if the engine is not started; the hook's error
    /// if `on_shutdown` fails, in which case the engine is left in `Stopping`.
    pub async fn stop(&self) -> Result<()> {
        if let Err(state) =
            self.compare_and_transition(EngineState::Started, EngineState::Stopping)
        {
            let err = self.invalid_state(state, "stop");
            error!(engine = %self.name, state = %state, "{err}");
            return Err(err);
        }

        let ctx = self.context();
        self.hooks
            .on_shutdown(&ctx)
            .await
            .map_err(|e| Error::hook(&self.name, "on_shutdown", e))?;

        self.transition(EngineState::Stopped);
        Ok(())
    }

    /// Stop then start, propagating the first failure.
    pub async fn restart(&self) -> Result<()> {
        info!(engine = %self.name, "{}: Restarting", self.name);
        self.stop().await?;
        self.start().await?;
        info!(engine = %self.name, "{}: Restart complete", self.name);
        Ok(())
    }
}

/// Object-safe handle over any engine, for holding heterogeneous engines
/// behind one type.
#[async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &str;

    fn state(&self) -> EngineState;

    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    async fn restart(&self) -> Result<()>;
}

#[async_trait]
impl<L: Lifecycle> Service for Engine<L> {
    fn name(&self) -> &str {
        Engine::name(self)
    }

    fn state(&self) -> EngineState {
        Engine::state(self)
    }

    async fn start(&self) -> Result<()> {
        Engine::start(self).await
    }

    async fn stop(&self) -> Result<()> {
        Engine::stop(self).await
    }

    async fn restart(&self) -> Result<()> {
        Engine::restart(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl Lifecycle for Noop {
        async fn on_startup(&self, _ctx: &EngineContext) -> anyhow::Result<()> {
            Ok(())
        }

        async fn on_shutdown(&self, _ctx: &EngineContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn new_engine_is_stopped() {
        let engine = Engine::new("noop", Noop);
        assert_eq!(engine.state(), EngineState::Stopped);
        assert_eq!(engine.name(), "noop");
    }

    #[test]
    fn compare_and_transition_reports_observed_state() {
        let engine = Engine::new("noop", Noop);
        let observed = engine
            .compare_and_transition(EngineState::Started, EngineState::Stopping)
            .unwrap_err();
        assert_eq!(observed, EngineState::Stopped);
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn subscriber_sees_final_state() {
        let engine = Engine::new("noop", Noop);
        let rx = engine.subscribe();
        engine.start().await.unwrap();
        assert_eq!(*rx.borrow(), EngineState::Started);
    }
}
