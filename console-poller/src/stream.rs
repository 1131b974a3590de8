//! Per-resource polling streams
//!
//! A [`PollerStream`] repeatedly fetches one resource and hands each payload to
//! its success callback. It runs in one of two modes:
//!
//! - **self-paced** (`waiting`): a one-shot timer is armed, and the next one is
//!   armed only after the fetch it triggered has completed. The time between
//!   consecutive arms is sampled; when the rounded average exceeds the
//!   configured interval the stream adopts it and switches to metronome mode.
//! - **metronome**: a repeating timer fires at a fixed rate regardless of how
//!   long individual fetches take.
//!
//! ```text
//!            start()                    waitForResponse(false)
//!  Stopped ──────────▶ Scheduled(SelfPaced) ─────────────────▶ Scheduled(Metronome)
//!     ▲                      │   ▲   fetch done: re-arm              │
//!     └──────── stop() ──────┴───┘◀──────────── stop() ──────────────┘
//! ```
//!
//! Failures are absorbed into a bounded error history. When the last
//! `give_up_threshold` attempts all failed (or a permanent failure occurs) the
//! stream stops itself and stays stopped until it is started again.

use chrono::Utc;
use parking_lot::{Mutex, ReentrantMutex};
use serde::Serialize;
use std::any::Any;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::Instant;

use crate::config::PollerConfig;
use crate::error::FailureKind;
use crate::fetch::Fetcher;
use crate::history::{ErrorHistory, ErrorRecord, LatencySampler};
use crate::timer::Timer;

/// Callback receiving each successfully fetched payload
pub type SuccessCallback<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Scheduling mode of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PollMode {
    /// Next fetch is scheduled when the previous one completes
    SelfPaced,
    /// Fetches fire at a fixed rate
    Metronome,
}

/// Point-in-time view of a stream
#[derive(Debug, Clone, Serialize)]
pub struct StreamStats {
    pub key: String,
    pub interval: Duration,
    pub mode: PollMode,
    pub started: bool,
    pub fired: u64,
    pub error_count: usize,
    pub last_error: Option<ErrorRecord>,
    pub timer_id: Option<u64>,
}

/// Mutable state of a stream, guarded by a single lock
#[derive(Debug)]
struct StreamState {
    interval: Duration,
    mode: PollMode,
    timer: Option<Timer>,
    /// Bumped on every stop so in-flight fetches can tell they are stale
    epoch: u64,
    fired: u64,
    errors: ErrorHistory,
    latency: LatencySampler,
    last_polled: Option<Instant>,
    /// Set once the stream has been removed from its registry
    retired: bool,
}

struct StreamInner<T> {
    key: String,
    fetcher: Arc<dyn Fetcher<T>>,
    on_success: SuccessCallback<T>,
    give_up_threshold: u64,
    stop_on_permanent_error: bool,
    runtime: Handle,
    state: Mutex<StreamState>,
    /// Held while a payload is delivered; retiring waits for it
    delivery: ReentrantMutex<()>,
}

/// Polling loop for a single resource key
///
/// Cloning is cheap; clones share the same state and timer.
pub struct PollerStream<T> {
    inner: Arc<StreamInner<T>>,
}

impl<T> Clone for PollerStream<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for PollerStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("PollerStream")
            .field("key", &self.inner.key)
            .field("interval", &state.interval)
            .field("mode", &state.mode)
            .field("started", &state.timer.is_some())
            .field("fired", &state.fired)
            .finish()
    }
}

impl<T: Send + 'static> PollerStream<T> {
    /// Create a stopped stream in self-paced mode at the configured default interval.
    pub fn new(
        key: impl Into<String>,
        fetcher: Arc<dyn Fetcher<T>>,
        on_success: SuccessCallback<T>,
        config: &PollerConfig,
        runtime: Handle,
    ) -> Self {
        let state = StreamState {
            interval: config.default_interval,
            mode: PollMode::SelfPaced,
            timer: None,
            epoch: 0,
            fired: 0,
            errors: ErrorHistory::new(config.error_history_capacity),
            latency: LatencySampler::new(config.latency_sample_size),
            last_polled: None,
            retired: false,
        };

        Self {
            inner: Arc::new(StreamInner {
                key: key.into(),
                fetcher,
                on_success,
                give_up_threshold: config.give_up_threshold,
                stop_on_permanent_error: config.stop_on_permanent_error,
                runtime,
                state: Mutex::new(state),
                delivery: ReentrantMutex::new(()),
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Whether a timer is currently held
    pub fn started(&self) -> bool {
        self.inner.state.lock().timer.is_some()
    }

    /// True in self-paced mode
    pub fn is_waiting(&self) -> bool {
        self.mode() == PollMode::SelfPaced
    }

    pub fn mode(&self) -> PollMode {
        self.inner.state.lock().mode
    }

    pub fn interval(&self) -> Duration {
        self.inner.state.lock().interval
    }

    /// Number of fetch attempts so far
    pub fn fired(&self) -> u64 {
        self.inner.state.lock().fired
    }

    pub fn error_history(&self) -> Vec<ErrorRecord> {
        self.inner.state.lock().errors.records()
    }

    pub fn last_error(&self) -> Option<ErrorRecord> {
        self.inner.state.lock().errors.last().cloned()
    }

    /// Identifier of the held timer, if any
    pub fn timer_id(&self) -> Option<u64> {
        self.inner.state.lock().timer.as_ref().map(Timer::id)
    }

    /// Whether both handles refer to the same stream
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn stats(&self) -> StreamStats {
        let state = self.inner.state.lock();
        StreamStats {
            key: self.inner.key.clone(),
            interval: state.interval,
            mode: state.mode,
            started: state.timer.is_some(),
            fired: state.fired,
            error_count: state.errors.len(),
            last_error: state.errors.last().cloned(),
            timer_id: state.timer.as_ref().map(Timer::id),
        }
    }

    /// Arm the timer for the current mode.
    pub fn start(&self) {
        let mut state = self.inner.state.lock();
        self.inner.start_locked(&mut state);
    }

    /// Cancel the timer and fall back to self-paced mode. Idempotent.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock();
        self.inner.stop_locked(&mut state);
    }

    pub fn restart(&self) {
        let mut state = self.inner.state.lock();
        self.inner.stop_locked(&mut state);
        self.inner.start_locked(&mut state);
    }

    /// Change the interval; with `restart` it applies immediately, otherwise
    /// on the next natural reschedule.
    pub fn set_interval(&self, interval: Duration, restart: bool) {
        let mut state = self.inner.state.lock();
        self.inner.set_interval_locked(&mut state, interval, restart);
    }

    /// Switch between self-paced (`true`) and metronome (`false`) mode.
    pub fn wait_for_response(&self, enable: bool) {
        let mut state = self.inner.state.lock();
        self.inner.wait_for_response_locked(&mut state, enable);
    }

    /// Fetch once without rescheduling.
    pub async fn run(&self) {
        self.fire(true).await;
    }

    /// Spawn one fetch cycle on the runtime, bypassing the timer.
    pub fn trigger(&self) {
        StreamInner::spawn_cycle(&self.inner);
    }

    /// One fetch cycle.
    ///
    /// Unless `run_once` is set (or the stream gives up), a self-paced stream
    /// is re-armed afterwards, provided it was not stopped or restarted while
    /// the fetch was in flight.
    pub async fn fire(&self, run_once: bool) {
        let inner = &self.inner;
        let (epoch, fired) = {
            let mut state = inner.state.lock();
            if state.retired {
                return;
            }
            state.fired += 1;
            (state.epoch, state.fired)
        };

        let result = inner.fetcher.fetch(&inner.key).await;
        let mut run_once = run_once;

        match result {
            Ok(payload) => {
                let _delivery = inner.delivery.lock();
                if inner.state.lock().retired {
                    tracing::debug!(key = %inner.key, "Dropping payload for removed poller");
                    return;
                }
                (inner.on_success)(payload);
            }
            Err(err) => {
                let mut state = inner.state.lock();
                if state.retired {
                    return;
                }

                let kind = err.kind();
                state.errors.push(ErrorRecord {
                    time: Utc::now(),
                    fired,
                    kind,
                    message: err.to_string(),
                });
                let retries = state
                    .errors
                    .failures_in_window(fired, inner.give_up_threshold);

                tracing::info!(
                    key = %inner.key,
                    fired,
                    retries,
                    error = %err,
                    "Encountered fetch failure"
                );

                let permanent = kind == FailureKind::Permanent && inner.stop_on_permanent_error;
                if retries >= inner.give_up_threshold || permanent {
                    tracing::warn!(
                        key = %inner.key,
                        fired,
                        permanent,
                        "Max retries reached, stopping poller"
                    );
                    run_once = true;
                    inner.stop_locked(&mut state);
                }
            }
        }

        if run_once {
            return;
        }

        let mut state = inner.state.lock();
        if !state.retired && state.epoch == epoch && state.mode == PollMode::SelfPaced {
            inner.start_locked(&mut state);
        }
    }

    /// Stop for good; later fetch completions are discarded.
    ///
    /// Returns once no success callback of this stream is running on another
    /// thread. A callback may retire its own stream.
    pub(crate) fn retire(&self) {
        {
            let mut state = self.inner.state.lock();
            self.inner.stop_locked(&mut state);
            state.retired = true;
        }
        drop(self.inner.delivery.lock());
    }
}

impl<T: Send + 'static> StreamInner<T> {
    fn spawn_cycle(self: &Arc<Self>) {
        let stream = PollerStream {
            inner: Arc::clone(self),
        };
        self.runtime.spawn(async move {
            stream.fire(false).await;
        });
    }

    fn start_locked(self: &Arc<Self>, state: &mut StreamState) {
        if state.retired {
            return;
        }

        match state.mode {
            PollMode::Metronome => {
                if state.timer.is_some() {
                    return;
                }
                let weak = Arc::downgrade(self);
                state.timer = Some(Timer::every(&self.runtime, state.interval, move || {
                    Self::on_tick(&weak)
                }));
            }
            PollMode::SelfPaced => {
                let now = Instant::now();
                if let Some(last_polled) = state.last_polled {
                    let average = state.latency.push(now.duration_since(last_polled));
                    if let Some(average) = average.filter(|avg| *avg > state.interval) {
                        tracing::info!(
                            key = %self.key,
                            ?average,
                            interval = ?state.interval,
                            "Time between fetches exceeds the interval"
                        );
                        self.set_interval_locked(state, average, false);
                        self.wait_for_response_locked(state, false);
                        return;
                    }
                }

                let weak = Arc::downgrade(self);
                // Replacing a held timer cancels it
                state.timer = Some(Timer::once(&self.runtime, state.interval, move || {
                    Self::on_tick(&weak)
                }));
                state.last_polled = Some(now);
            }
        }

        tracing::debug!(
            key = %self.key,
            mode = ?state.mode,
            interval = ?state.interval,
            "Poller scheduled"
        );
    }

    fn stop_locked(&self, state: &mut StreamState) {
        // A fetch may be in flight without any timer held
        state.epoch += 1;

        let Some(timer) = state.timer.take() else {
            return;
        };

        timer.cancel();
        state.latency.reset();
        state.mode = PollMode::SelfPaced;

        tracing::debug!(key = %self.key, "Poller stopped");
    }

    fn set_interval_locked(self: &Arc<Self>, state: &mut StreamState, interval: Duration, restart: bool) {
        tracing::info!(key = %self.key, ?interval, restart, "Interval changed");
        state.interval = interval;
        if restart {
            self.stop_locked(state);
            self.start_locked(state);
        }
    }

    fn wait_for_response_locked(self: &Arc<Self>, state: &mut StreamState, enable: bool) {
        self.stop_locked(state);
        state.last_polled = None;

        let mode = if enable {
            PollMode::SelfPaced
        } else {
            PollMode::Metronome
        };
        if state.mode != mode {
            tracing::info!(key = %self.key, wait_for_response = enable, "Poll mode changed");
        }
        state.mode = mode;

        self.start_locked(state);
    }

    fn on_tick(weak: &Weak<Self>) {
        if let Some(inner) = weak.upgrade() {
            Self::spawn_cycle(&inner);
        }
    }
}

pub(crate) mod sealed {
    /// Registry-only lifecycle hook
    pub trait Retire {
        fn retire(&self);
    }
}

/// Type-erased control surface of a stream
///
/// Lets a registry hold streams with different payload types and drive them
/// uniformly. Use [`StreamControl::as_any`] or
/// [`PollerRegistry::get`](crate::PollerRegistry::get) to recover the typed
/// stream.
pub trait StreamControl: sealed::Retire + Send + Sync {
    fn key(&self) -> &str;
    fn started(&self) -> bool;
    fn start(&self);
    fn stop(&self);
    fn restart(&self);
    /// Fire one cycle now, bypassing the timer
    fn trigger(&self);
    fn set_interval(&self, interval: Duration, restart: bool);
    fn wait_for_response(&self, enable: bool);
    fn stats(&self) -> StreamStats;
    fn as_any(&self) -> &dyn Any;
}

impl<T: Send + 'static> sealed::Retire for PollerStream<T> {
    fn retire(&self) {
        PollerStream::retire(self);
    }
}

impl<T: Send + 'static> StreamControl for PollerStream<T> {
    fn key(&self) -> &str {
        PollerStream::key(self)
    }

    fn started(&self) -> bool {
        PollerStream::started(self)
    }

    fn start(&self) {
        PollerStream::start(self);
    }

    fn stop(&self) {
        PollerStream::stop(self);
    }

    fn restart(&self) {
        PollerStream::restart(self);
    }

    fn trigger(&self) {
        PollerStream::trigger(self);
    }

    fn set_interval(&self, interval: Duration, restart: bool) {
        PollerStream::set_interval(self, interval, restart);
    }

    fn wait_for_response(&self, enable: bool) {
        PollerStream::wait_for_response(self, enable);
    }

    fn stats(&self) -> StreamStats {
        PollerStream::stats(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use crate::fetch::fetch_fn;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::time::sleep;

    fn config() -> PollerConfig {
        PollerConfig::new().with_intervals(Duration::from_secs(5), Duration::from_secs(60))
    }

    /// Stream whose fetch outcome is decided by `fail(attempt)`
    fn scripted(
        fail: impl Fn(usize) -> bool + Send + Sync + 'static,
    ) -> (PollerStream<usize>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let attempts = Arc::new(AtomicUsize::new(0));
        let delivered = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&attempts);
        let fail = Arc::new(fail);
        let fetcher = fetch_fn(move |_key: String| {
            let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
            let fail = Arc::clone(&fail);
            async move {
                if fail(attempt) {
                    Err(FetchError::Transport(format!("attempt {attempt} failed")))
                } else {
                    Ok(attempt)
                }
            }
        });

        let sink = Arc::clone(&delivered);
        let stream = PollerStream::new(
            "adapters",
            Arc::new(fetcher),
            Arc::new(move |_payload: usize| {
                sink.fetch_add(1, Ordering::SeqCst);
            }),
            &config(),
            Handle::current(),
        );
        (stream, attempts, delivered)
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_stream_is_stopped_and_self_paced() {
        let (stream, attempts, _) = scripted(|_| false);

        assert!(!stream.started());
        assert!(stream.is_waiting());
        assert_eq!(stream.interval(), Duration::from_secs(5));
        assert_eq!(stream.fired(), 0);

        sleep(Duration::from_secs(30)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_self_paced_polls_each_interval() {
        let (stream, attempts, delivered) = scripted(|_| false);
        stream.start();
        assert!(stream.started());

        sleep(Duration::from_millis(5100)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(delivered.load(Ordering::SeqCst), 1);

        sleep(Duration::from_secs(10)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(stream.started());
        assert!(stream.is_waiting());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_does_not_reschedule() {
        let (stream, attempts, delivered) = scripted(|_| false);

        stream.run().await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        assert!(!stream.started());

        sleep(Duration::from_secs(30)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fire_on_stopped_stream_starts_it() {
        let (stream, _, _) = scripted(|_| false);

        stream.fire(false).await;
        assert!(stream.started());
        assert!(stream.timer_id().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_consecutive_failures_give_up() {
        let (stream, _, delivered) = scripted(|_| true);
        stream.start();

        stream.fire(true).await;
        stream.fire(true).await;
        assert!(stream.started());

        stream.fire(true).await;
        assert!(!stream.started());
        assert_eq!(stream.fired(), 3);
        assert_eq!(delivered.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interleaved_failures_do_not_give_up() {
        // attempts 1, 3 and 5 fail
        let (stream, _, delivered) = scripted(|attempt| attempt % 2 == 1);
        stream.start();

        for _ in 0..5 {
            stream.fire(true).await;
        }

        assert!(stream.started());
        assert_eq!(delivered.load(Ordering::SeqCst), 2);
        let failed: Vec<u64> = stream.error_history().iter().map(|r| r.fired).collect();
        assert_eq!(failed, vec![1, 3, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_self_paced_loop_gives_up_and_stays_stopped() {
        let (stream, attempts, _) = scripted(|_| true);
        stream.fire(false).await;

        sleep(Duration::from_secs(12)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(!stream.started());

        sleep(Duration::from_secs(60)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_history_keeps_ten_most_recent() {
        let (stream, _, _) = scripted(|_| true);

        for _ in 0..15 {
            stream.fire(true).await;
        }

        let fired: Vec<u64> = stream.error_history().iter().map(|r| r.fired).collect();
        assert_eq!(fired, (6..=15).collect::<Vec<_>>());
        assert_eq!(stream.last_error().map(|r| r.fired), Some(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_stops_immediately() {
        let fetcher = fetch_fn(|key: String| async move {
            Err::<(), _>(FetchError::Status {
                status: 403,
                url: key,
            })
        });
        let stream = PollerStream::new(
            "server/configurations",
            Arc::new(fetcher),
            Arc::new(|_: ()| {}),
            &config(),
            Handle::current(),
        );
        stream.start();

        stream.fire(false).await;
        assert!(!stream.started());
        assert_eq!(
            stream.last_error().map(|r| r.kind),
            Some(FailureKind::Permanent)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_retried_when_disabled() {
        let fetcher = fetch_fn(|key: String| async move {
            Err::<(), _>(FetchError::Status {
                status: 401,
                url: key,
            })
        });
        let stream = PollerStream::new(
            "server/configurations",
            Arc::new(fetcher),
            Arc::new(|_: ()| {}),
            &config().with_stop_on_permanent_error(false),
            Handle::current(),
        );
        stream.start();

        stream.fire(true).await;
        stream.fire(true).await;
        assert!(stream.started());
        stream.fire(true).await;
        assert!(!stream.started());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_interval_with_restart_replaces_timer() {
        let (stream, _, _) = scripted(|_| false);
        stream.start();
        let before = stream.timer_id();

        stream.set_interval(Duration::from_secs(8), true);
        assert!(stream.started());
        assert_ne!(stream.timer_id(), before);
        assert_eq!(stream.interval(), Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_interval_without_restart_keeps_timer() {
        let (stream, attempts, _) = scripted(|_| false);
        stream.start();
        let before = stream.timer_id();

        stream.set_interval(Duration::from_secs(20), false);
        assert_eq!(stream.timer_id(), before);

        // The pending 5s timer still fires; the next one uses 20s
        sleep(Duration::from_millis(5100)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        sleep(Duration::from_secs(10)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        sleep(Duration::from_secs(11)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_response_round_trip() {
        let (stream, attempts, _) = scripted(|_| false);

        stream.wait_for_response(true);
        assert!(stream.is_waiting());
        assert!(stream.started());

        stream.wait_for_response(false);
        assert!(!stream.is_waiting());
        assert_eq!(stream.mode(), PollMode::Metronome);
        assert!(stream.started());

        sleep(Duration::from_millis(15100)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_noop_in_running_metronome() {
        let (stream, _, _) = scripted(|_| false);
        stream.wait_for_response(false);
        let before = stream.timer_id();

        stream.start();
        assert_eq!(stream.timer_id(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let (stream, attempts, _) = scripted(|_| false);
        stream.wait_for_response(false);

        stream.stop();
        let once = stream.stats();
        stream.stop();
        let twice = stream.stats();

        assert!(!twice.started);
        assert_eq!(once.mode, twice.mode);
        assert_eq!(twice.mode, PollMode::SelfPaced);
        assert_eq!(once.timer_id, twice.timer_id);

        sleep(Duration::from_secs(30)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_responses_switch_to_metronome() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let fetcher = fetch_fn(move |_key: String| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                sleep(Duration::from_secs(2)).await;
                Ok::<_, FetchError>(())
            }
        });
        let stream = PollerStream::new(
            "adapters?expanded=all",
            Arc::new(fetcher),
            Arc::new(|_: ()| {}),
            &config(),
            Handle::current(),
        );

        stream.start();
        // Each cycle takes 5s of waiting plus 2s of fetching; five samples are
        // collected on the sixth re-arm.
        sleep(Duration::from_secs(7 * 5 + 1)).await;

        assert_eq!(stream.mode(), PollMode::Metronome);
        assert_eq!(stream.interval(), Duration::from_secs(7));
        assert!(stream.started());
        assert_eq!(attempts.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_mid_flight_prevents_reschedule() {
        let fetcher = fetch_fn(|_key: String| async move {
            sleep(Duration::from_secs(1)).await;
            Ok::<_, FetchError>(())
        });
        let stream = PollerStream::new(
            "server/health",
            Arc::new(fetcher),
            Arc::new(|_: ()| {}),
            &config(),
            Handle::current(),
        );
        stream.start();

        // Timer fires at 5s, fetch completes at 6s
        sleep(Duration::from_millis(5500)).await;
        stream.stop();
        sleep(Duration::from_secs(30)).await;

        assert!(!stream.started());
        assert_eq!(stream.fired(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_triggered_fetch_prevents_reschedule() {
        let fetcher = fetch_fn(|_key: String| async move {
            sleep(Duration::from_secs(1)).await;
            Ok::<_, FetchError>(())
        });
        let stream = PollerStream::new(
            "adapters",
            Arc::new(fetcher),
            Arc::new(|_: ()| {}),
            &config(),
            Handle::current(),
        );

        // No timer is held while the triggered fetch is in flight
        stream.trigger();
        sleep(Duration::from_millis(500)).await;
        assert!(!stream.started());
        stream.stop();

        sleep(Duration::from_secs(60)).await;
        assert!(!stream.started());
        assert_eq!(stream.fired(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_retire_waits_for_running_callback() {
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let entered_tx = std::sync::Mutex::new(entered_tx);
        let finished = Arc::new(AtomicBool::new(false));

        let done = Arc::clone(&finished);
        let stream = PollerStream::new(
            "server/health",
            Arc::new(fetch_fn(|_key: String| async move { Ok::<_, FetchError>(()) })),
            Arc::new(move |_: ()| {
                let _ = entered_tx.lock().unwrap().send(());
                std::thread::sleep(std::time::Duration::from_millis(200));
                done.store(true, Ordering::SeqCst);
            }),
            &config(),
            Handle::current(),
        );

        stream.trigger();
        tokio::task::spawn_blocking(move || entered_rx.recv())
            .await
            .unwrap()
            .unwrap();

        stream.retire();
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_callback_may_retire_its_own_stream() {
        let slot: Arc<Mutex<Option<PollerStream<()>>>> = Arc::new(Mutex::new(None));

        let own = Arc::clone(&slot);
        let stream = PollerStream::new(
            "server/warnings",
            Arc::new(fetch_fn(|_key: String| async move { Ok::<_, FetchError>(()) })),
            Arc::new(move |_: ()| {
                if let Some(stream) = own.lock().take() {
                    stream.retire();
                }
            }),
            &config(),
            Handle::current(),
        );
        *slot.lock() = Some(stream.clone());

        stream.run().await;
        assert!(slot.lock().is_none());
        assert!(!stream.started());

        stream.start();
        assert!(!stream.started());
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_carry_key_field() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let (stream, _, _) = scripted(|_| true);
        stream.set_interval(Duration::from_secs(8), false);
        stream.run().await;

        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("Interval changed"));
        assert!(output.contains("Encountered fetch failure"));
        assert_eq!(
            output.lines().filter(|l| l.contains("key=adapters")).count(),
            2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_as_any_recovers_typed_stream() {
        let (stream, _, _) = scripted(|_| false);
        let control: Arc<dyn StreamControl> = Arc::new(stream.clone());

        let typed = control.as_any().downcast_ref::<PollerStream<usize>>();
        assert!(typed.is_some_and(|s| s.ptr_eq(&stream)));
        assert!(control.as_any().downcast_ref::<PollerStream<String>>().is_none());
    }
}
