//! One-shot, re-armable timer that drives periodic engines.
//!
//! A ticker holds at most one pending fire. `start` arms it after the first
//! delay; the callback is expected to call `rearm` when it is done, which arms
//! the next fire after the interval. The interval is therefore measured from
//! the end of one callback to the next fire, not from fire to fire.
//!
//! `stop` guarantees no new fire. It does not interrupt a callback that is
//! already running; `wait_idle` waits for that one to return.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::Result;

/// Callback invoked on every fire. Receives the ticker's cancellation token,
/// which is cancelled when the ticker is released.
pub type TickCallback =
    Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Box an async closure into a [`TickCallback`].
pub fn callback<F, Fut>(f: F) -> TickCallback
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |cancel| -> BoxFuture<'static, Result<()>> { Box::pin(f(cancel)) })
}

pub struct Ticker {
    inner: Arc<Inner>,
}

struct Inner {
    name: Arc<str>,
    first_delay: Duration,
    interval: Duration,
    callback: TickCallback,
    cancel: CancellationToken,
    slot: Mutex<Slot>,
    /// Signalled whenever a running callback returns.
    idle: Notify,
}

#[derive(Default)]
struct Slot {
    enabled: bool,
    released: bool,
    /// Bumped on every arm and stop. A sleeping fire only proceeds if its
    /// generation is still current.
    generation: u64,
    pending: Option<(u64, JoinHandle<()>)>,
    /// Generation of the fire whose callback is running, if any.
    firing: Option<u64>,
}

impl Slot {
    /// Take the pending task for aborting, unless it is the one currently
    /// running the callback.
    fn take_abortable(&mut self) -> Option<JoinHandle<()>> {
        match self.pending.take() {
            Some((generation, _)) if self.firing == Some(generation) => None,
            Some((_, handle)) => Some(handle),
            None => None,
        }
    }
}

impl Ticker {
    /// `name` tags the ticker's diagnostics with the engine it drives.
    pub fn new(
        name: impl Into<Arc<str>>,
        first_delay: Duration,
        interval: Duration,
        callback: TickCallback,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                first_delay,
                interval,
                callback,
                cancel: CancellationToken::new(),
                slot: Mutex::new(Slot::default()),
                idle: Notify::new(),
            }),
        }
    }

    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    pub fn first_delay(&self) -> Duration {
        self.inner.first_delay
    }

    /// Enable the ticker and arm the first fire. No-op if already enabled.
    pub fn start(&self) {
        let mut slot = self.inner.lock();
        if slot.released || slot.enabled {
            return;
        }
        slot.enabled = true;
        Inner::arm(&self.inner, &mut slot, self.inner.first_delay);
    }

    /// Arm the next fire after the interval. Ignored once stopped, so a
    /// callback finishing during shutdown cannot reschedule itself.
    pub fn rearm(&self) {
        let mut slot = self.inner.lock();
        if !slot.enabled || slot.released {
            return;
        }
        Inner::arm(&self.inner, &mut slot, self.inner.interval);
    }

    /// Disable the ticker. Once this returns no new fire will happen. A
    /// callback already in progress runs to completion; see [`Ticker::wait_idle`].
    pub async fn stop(&self) {
        let pending = {
            let mut slot = self.inner.lock();
            slot.enabled = false;
            slot.generation += 1;
            slot.take_abortable()
        };
        if let Some(handle) = pending {
            handle.abort();
            let _ = handle.await;
        }
        debug!(engine = %self.inner.name, "ticker stopped");
    }

    /// Wait until no callback is running.
    ///
    /// A fire that won the race against `stop` is already committed to
    /// running its callback; this is how a caller waits it out.
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.inner.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.inner.lock().firing.is_none() {
                return;
            }
            idle.await;
        }
    }

    pub fn is_firing(&self) -> bool {
        self.inner.lock().firing.is_some()
    }

    /// Mark a fire as committed without running a callback, as if one had
    /// passed its generation check just before `stop`.
    #[cfg(test)]
    pub(crate) fn begin_fire_for_test(&self) {
        self.inner.lock().firing = Some(u64::MAX);
    }

    #[cfg(test)]
    pub(crate) fn end_fire_for_test(&self) {
        self.inner.lock().firing = None;
        self.inner.idle.notify_waiters();
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().enabled
    }

    /// Stop for good and cancel the token handed to callbacks. Idempotent.
    pub fn release(&self) {
        let pending = {
            let mut slot = self.inner.lock();
            if slot.released {
                return;
            }
            slot.released = true;
            slot.enabled = false;
            slot.generation += 1;
            slot.take_abortable()
        };
        if let Some(handle) = pending {
            handle.abort();
        }
        self.inner.cancel.cancel();
        debug!(engine = %self.inner.name, "ticker released");
    }

    pub fn is_released(&self) -> bool {
        self.inner.lock().released
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.release();
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Slot> {
        // Flags stay consistent even if a holder panicked.
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn arm(this: &Arc<Self>, slot: &mut Slot, delay: Duration) {
        slot.generation += 1;
        let generation = slot.generation;
        if let Some(previous) = slot.take_abortable() {
            previous.abort();
        }

        let inner = Arc::clone(this);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut slot = inner.lock();
                if !slot.enabled || slot.generation != generation {
                    return;
                }
                slot.firing = Some(generation);
            }

            let result = (inner.callback)(inner.cancel.clone()).await;

            {
                let mut slot = inner.lock();
                if slot.firing == Some(generation) {
                    slot.firing = None;
                }
            }
            inner.idle.notify_waiters();
            if let Err(e) = result {
                error!(engine = %inner.name, "tick callback failed: {e}");
            }
        });
        slot.pending = Some((generation, handle));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_ticker(rearm: bool) -> (Arc<Ticker>, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let ticker = Arc::new_cyclic(|weak: &std::sync::Weak<Ticker>| {
            let weak = weak.clone();
            let fired = Arc::clone(&fired);
            let on_tick = callback(move |_cancel| {
                let weak = weak.clone();
                let fired = Arc::clone(&fired);
                async move {
                    fired.fetch_add(1, Ordering::SeqCst);
                    if rearm {
                        if let Some(ticker) = weak.upgrade() {
                            ticker.rearm();
                        }
                    }
                    Ok::<(), crate::error::Error>(())
                }
            });
            Ticker::new("counting", Duration::from_millis(50), Duration::from_millis(10), on_tick)
        });
        (ticker, fired)
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_without_rearm() {
        let (ticker, fired) = counting_ticker(false);
        ticker.start();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn first_delay_then_interval() {
        let (ticker, fired) = counting_ticker(true);
        ticker.start();
        tokio::time::sleep(Duration::from_millis(45)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        // fires at 50, 60, 70, 80
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_prevents_further_fires_and_rearm() {
        let (ticker, fired) = counting_ticker(true);
        ticker.start();
        tokio::time::sleep(Duration::from_millis(55)).await;
        ticker.stop().await;
        let seen = fired.load(Ordering::SeqCst);

        ticker.rearm();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), seen);
        assert!(!ticker.is_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_after_stop_uses_first_delay_again() {
        let (ticker, fired) = counting_ticker(false);
        ticker.start();
        ticker.stop().await;
        ticker.start();
        tokio::time::sleep(Duration::from_millis(49)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn release_is_idempotent_and_cancels_token() {
        let token = Arc::new(Mutex::new(None::<CancellationToken>));
        let seen = Arc::clone(&token);
        let on_tick = callback(move |cancel| {
            *seen.lock().unwrap() = Some(cancel);
            async { Ok::<(), crate::error::Error>(()) }
        });
        let ticker = Ticker::new("token", Duration::from_millis(1), Duration::from_millis(1), on_tick);
        ticker.start();
        tokio::time::sleep(Duration::from_millis(5)).await;

        ticker.release();
        ticker.release();
        assert!(ticker.is_released());
        let cancel = token.lock().unwrap().clone().expect("callback ran");
        assert!(cancel.is_cancelled());

        ticker.start();
        assert!(!ticker.is_enabled());
    }

    /// A fire that has already committed to its callback when `stop` lands
    /// is not aborted; `wait_idle` must hold until that callback returns.
    #[tokio::test(start_paused = true)]
    async fn wait_idle_covers_fire_that_raced_stop() {
        let (entered_tx, entered_rx) = tokio::sync::oneshot::channel::<()>();
        let entered_tx = Arc::new(Mutex::new(Some(entered_tx)));
        let gate = Arc::new(Notify::new());
        let done = Arc::new(AtomicUsize::new(0));

        let on_tick = {
            let gate = Arc::clone(&gate);
            let done = Arc::clone(&done);
            callback(move |_cancel| {
                let entered_tx = entered_tx.lock().unwrap().take();
                let gate = Arc::clone(&gate);
                let done = Arc::clone(&done);
                async move {
                    if let Some(tx) = entered_tx {
                        let _ = tx.send(());
                    }
                    gate.notified().await;
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), crate::error::Error>(())
                }
            })
        };
        let ticker = Arc::new(Ticker::new(
            "gated",
            Duration::from_millis(10),
            Duration::from_millis(10),
            on_tick,
        ));
        ticker.start();
        entered_rx.await.unwrap();

        ticker.stop().await;
        assert!(ticker.is_firing());

        let waiter = {
            let ticker = Arc::clone(&ticker);
            tokio::spawn(async move { ticker.wait_idle().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        assert_eq!(done.load(Ordering::SeqCst), 0);

        gate.notify_one();
        waiter.await.unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert!(!ticker.is_firing());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_idle_returns_when_nothing_fires() {
        let (ticker, _) = counting_ticker(false);
        tokio::time::timeout(Duration::from_millis(1), ticker.wait_idle())
            .await
            .expect("idle ticker should not block");
    }

    /// Records the `engine` field of every error-level event.
    #[derive(Clone, Default)]
    struct ErrorEngines(Arc<Mutex<Vec<String>>>);

    struct EngineField(Option<String>);

    impl tracing::field::Visit for EngineField {
        fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
            if field.name() == "engine" {
                self.0 = Some(format!("{value:?}"));
            }
        }
    }

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for ErrorEngines {
        fn on_event(
            &self,
            event: &tracing::Event<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            if *event.metadata().level() != tracing::Level::ERROR {
                return;
            }
            let mut field = EngineField(None);
            event.record(&mut field);
            if let Some(engine) = field.0 {
                self.0.lock().unwrap().push(engine);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn callback_errors_are_logged_with_engine_name() {
        use tracing_subscriber::layer::SubscriberExt as _;

        let errors = ErrorEngines::default();
        let _guard =
            tracing::subscriber::set_default(tracing_subscriber::registry().with(errors.clone()));

        let on_tick = callback(|_cancel| async {
            Err(crate::error::Error::Other("boom".to_string()))
        });
        let ticker = Ticker::new(
            "failing",
            Duration::from_millis(1),
            Duration::from_millis(1),
            on_tick,
        );
        ticker.start();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(*errors.0.lock().unwrap(), vec!["failing".to_string()]);
    }
}
