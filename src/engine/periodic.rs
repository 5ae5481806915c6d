//! Periodic engine: runs a unit of work over and over, one invocation at a time.
//!
//! The ticker fires once, the tick runs the work, and only when the work has
//! returned is the next fire armed. Slow work therefore stretches the cadence
//! instead of piling up. Shutdown stops the ticker and then waits for any
//! invocation already running before `post_shutdown` is called.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt as _;
use opentelemetry::KeyValue;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};

use super::lifecycle::{Engine, EngineContext, Lifecycle};
use super::ticker::{Ticker, callback};
use crate::config::PeriodicConfig;
use crate::error::{Error, Result, flatten};
use crate::model::PeriodicStats;
use crate::telemetry::engine::start_tick_span;
use crate::telemetry::metrics;

/// The work a periodic engine runs.
///
/// `execute` is never called concurrently with itself for the same engine.
/// Its errors are logged and swallowed; the next tick still happens.
#[async_trait]
pub trait PeriodicWork: Send + Sync + 'static {
    /// Runs before the ticker is started. An error aborts the start.
    async fn pre_startup(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs after the ticker is stopped and in-flight work has drained.
    async fn post_shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn execute(&self, tick: &TickContext) -> anyhow::Result<()>;
}

/// Per-invocation handle passed to [`PeriodicWork::execute`].
pub struct TickContext {
    name: Arc<str>,
    execution: u64,
    cancel: CancellationToken,
    duration: Arc<DurationCell>,
}

impl TickContext {
    pub fn engine_name(&self) -> &str {
        &self.name
    }

    /// 1-based number of this invocation since the engine last started.
    pub fn execution(&self) -> u64 {
        self.execution
    }

    /// Cancelled when the engine's ticker is released (the engine is dropped).
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Report the processing time of this invocation. Overrides the
    /// wall-clock measurement the engine would otherwise record.
    pub fn report_duration_ms(&self, ms: u64) {
        self.duration.report(ms);
    }
}

#[derive(Debug, Default)]
struct DurationCell {
    ms: AtomicU64,
    reported: AtomicBool,
}

impl DurationCell {
    fn reset(&self) {
        self.reported.store(false, Ordering::Release);
        self.ms.store(0, Ordering::Release);
    }

    fn report(&self, ms: u64) {
        self.ms.store(ms, Ordering::Release);
        self.reported.store(true, Ordering::Release);
    }

    /// Settle on the reported value, or the measured one if none was reported.
    fn settle(&self, measured_ms: u64) -> u64 {
        if self.reported.load(Ordering::Acquire) {
            self.ms.load(Ordering::Acquire)
        } else {
            self.ms.store(measured_ms, Ordering::Release);
            measured_ms
        }
    }

    fn get(&self) -> u64 {
        self.ms.load(Ordering::Acquire)
    }
}

/// [`Lifecycle`] implementation that drives a [`PeriodicWork`] on a ticker.
pub struct Periodic<W> {
    shared: Arc<Shared<W>>,
}

/// A periodic engine.
pub type PeriodicEngine<W> = Engine<Periodic<W>>;

struct Shared<W> {
    name: Arc<str>,
    work: W,
    config: PeriodicConfig,
    ticker: Ticker,
    in_flight: AtomicBool,
    idle: Notify,
    execution_count: AtomicU64,
    failure_count: AtomicU64,
    duration: Arc<DurationCell>,
    last_completed_at: Mutex<Option<DateTime<Utc>>>,
    context: Mutex<Option<EngineContext>>,
}

impl<W: PeriodicWork> Periodic<W> {
    fn new(name: &str, work: W, config: PeriodicConfig) -> Self {
        let name: Arc<str> = Arc::from(name);
        let shared = Arc::new_cyclic(|weak: &Weak<Shared<W>>| {
            let weak = weak.clone();
            let on_tick = callback(move |cancel| {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(shared) => shared.tick(cancel).await,
                        None => Ok(()),
                    }
                }
            });
            let ticker = Ticker::new(
                Arc::clone(&name),
                config.first_delay,
                config.interval,
                on_tick,
            );
            Shared {
                name,
                ticker,
                work,
                config,
                in_flight: AtomicBool::new(false),
                idle: Notify::new(),
                execution_count: AtomicU64::new(0),
                failure_count: AtomicU64::new(0),
                duration: Arc::new(DurationCell::default()),
                last_completed_at: Mutex::new(None),
                context: Mutex::new(None),
            }
        });
        Self { shared }
    }

    pub fn work(&self) -> &W {
        &self.shared.work
    }

    pub fn config(&self) -> &PeriodicConfig {
        &self.shared.config
    }
}

impl<W: PeriodicWork> Shared<W> {
    /// One fire of the ticker.
    async fn tick(self: &Arc<Self>, cancel: CancellationToken) -> Result<()> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::AlreadyExecuting {
                name: self.name.to_string(),
            });
        }

        let execution = self.execution_count.fetch_add(1, Ordering::AcqRel) + 1;
        self.duration.reset();

        let span = start_tick_span(&self.name, execution);
        let tick = TickContext {
            name: Arc::clone(&self.name),
            execution,
            cancel,
            duration: Arc::clone(&self.duration),
        };

        let started = tokio::time::Instant::now();
        let outcome = AssertUnwindSafe(self.work.execute(&tick))
            .catch_unwind()
            .instrument(span.clone())
            .await;
        let measured_ms = started.elapsed().as_millis() as u64;
        let duration_ms = self.duration.settle(measured_ms);
        span.record("tick.duration_ms", duration_ms);

        let result = match outcome {
            Ok(result) => result,
            Err(panic) => Err(anyhow::anyhow!("work panicked: {}", panic_message(&*panic))),
        };
        self.record_outcome(execution, duration_ms, result, &span);

        self.in_flight.store(false, Ordering::Release);
        self.idle.notify_waiters();

        if !self.is_stopping() {
            self.ticker.rearm();
        }
        Ok(())
    }

    fn record_outcome(
        &self,
        execution: u64,
        duration_ms: u64,
        result: anyhow::Result<()>,
        span: &tracing::Span,
    ) {
        let engine = KeyValue::new("engine", self.name.to_string());
        metrics::tick_duration_ms().record(duration_ms as f64, &[engine.clone()]);

        match result {
            Ok(()) => {
                debug!(parent: span, engine = %self.name, execution, duration_ms, "tick completed");
                metrics::tick_executions().add(1, &[engine, KeyValue::new("result", "ok")]);
            }
            Err(e) => {
                self.failure_count.fetch_add(1, Ordering::AcqRel);
                metrics::tick_executions()
                    .add(1, &[engine.clone(), KeyValue::new("result", "error")]);
                let causes = flatten(e);
                let aggregate = causes.len() > 1;
                for cause in causes {
                    metrics::tick_failures().add(1, &[engine.clone()]);
                    if aggregate {
                        warn!(parent: span, engine = %self.name, execution,
                            "{}: error (from aggregate) thrown in timer method: {cause:#}", self.name);
                    } else {
                        warn!(parent: span, engine = %self.name, execution,
                            "{}: error thrown in timer method: {cause:#}", self.name);
                    }
                }
            }
        }

        *lock(&self.last_completed_at) = Some(Utc::now());
    }

    fn is_stopping(&self) -> bool {
        lock(&self.context)
            .as_ref()
            .is_some_and(EngineContext::is_stopping)
    }

    /// Wait until no invocation is in flight, including a fire the ticker
    /// committed to just before it was stopped.
    async fn drain(&self) {
        self.ticker.wait_idle().await;
        loop {
            let idle = self.idle.notified();
            tokio::pin!(idle);
            // Register before checking so a clear between the check and the
            // await is not missed.
            idle.as_mut().enable();
            if !self.in_flight.load(Ordering::Acquire) {
                return;
            }
            idle.await;
        }
    }
}

#[async_trait]
impl<W: PeriodicWork> Lifecycle for Periodic<W> {
    async fn on_startup(&self, ctx: &EngineContext) -> anyhow::Result<()> {
        let shared = &self.shared;
        shared
            .work
            .pre_startup()
            .await
            .map_err(|e| Error::hook(ctx.name(), "pre_startup", e))?;

        shared.execution_count.store(0, Ordering::Release);
        shared.failure_count.store(0, Ordering::Release);
        *lock(&shared.context) = Some(ctx.clone());
        shared.ticker.start();
        info!(
            engine = %ctx.name(),
            first_delay_ms = shared.config.first_delay.as_millis() as u64,
            interval_ms = shared.config.interval.as_millis() as u64,
            "ticker started"
        );
        Ok(())
    }

    async fn on_shutdown(&self, ctx: &EngineContext) -> anyhow::Result<()> {
        let shared = &self.shared;
        shared.ticker.stop().await;

        if shared.in_flight.load(Ordering::Acquire) || shared.ticker.is_firing() {
            info!(engine = %ctx.name(), "waiting for in-flight work to finish");
        }
        match shared.config.drain_timeout {
            None => shared.drain().await,
            Some(timeout) => {
                if tokio::time::timeout(timeout, shared.drain()).await.is_err() {
                    return Err(Error::DrainTimeout {
                        name: ctx.name().to_string(),
                        timeout,
                    }
                    .into());
                }
            }
        }

        shared
            .work
            .post_shutdown()
            .await
            .map_err(|e| Error::hook(ctx.name(), "post_shutdown", e))?;
        Ok(())
    }
}

impl<W: PeriodicWork> Engine<Periodic<W>> {
    /// Create a stopped periodic engine. The ticker is created here and lives
    /// as long as the engine.
    pub fn periodic(name: impl Into<String>, work: W, config: PeriodicConfig) -> Self {
        let name = name.into();
        let hooks = Periodic::new(&name, work, config);
        Engine::new(name, hooks)
    }

    pub fn work(&self) -> &W {
        self.hooks().work()
    }

    pub fn interval(&self) -> Duration {
        self.hooks().config().interval
    }

    /// Invocations attempted since the last start, failed ones included.
    pub fn execution_count(&self) -> u64 {
        self.hooks().shared.execution_count.load(Ordering::Acquire)
    }

    pub fn failure_count(&self) -> u64 {
        self.hooks().shared.failure_count.load(Ordering::Acquire)
    }

    pub fn last_processing_duration_ms(&self) -> u64 {
        self.hooks().shared.duration.get()
    }

    pub fn is_work_in_flight(&self) -> bool {
        self.hooks().shared.in_flight.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PeriodicStats {
        let shared = &self.hooks().shared;
        PeriodicStats {
            name: self.name().to_string(),
            state: self.state(),
            execution_count: self.execution_count(),
            failure_count: self.failure_count(),
            last_processing_duration_ms: self.last_processing_duration_ms(),
            work_in_flight: self.is_work_in_flight(),
            last_completed_at: *lock(&shared.last_completed_at),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
