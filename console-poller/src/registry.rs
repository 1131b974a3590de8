//! Registry of polling streams keyed by resource
//!
//! The registry is the only surface views use: they add a stream when they
//! mount, remove it when they unmount, and use the bulk controls returned by
//! [`PollerRegistry::get_all`] for application-wide changes such as idle mode
//! or logout. Every operation is infallible; unknown keys are ignored.

use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

use crate::config::PollerConfig;
use crate::error::{PollerError, Result};
use crate::fetch::Fetcher;
use crate::stream::sealed::Retire;
use crate::stream::{PollerStream, StreamControl, StreamStats};

type StreamMap = IndexMap<String, Arc<dyn StreamControl>>;

struct RegistryInner {
    config: PollerConfig,
    runtime: Handle,
    streams: Mutex<StreamMap>,
    idle: AtomicBool,
}

/// Owns every active [`PollerStream`], keyed by resource
///
/// Construct one at application start and pass clones to whatever needs it;
/// clones share the same streams.
#[derive(Clone)]
pub struct PollerRegistry {
    inner: Arc<RegistryInner>,
}

impl PollerRegistry {
    /// Create a registry that spawns its timers on the current tokio runtime.
    pub fn new(config: PollerConfig) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| PollerError::NoRuntime(e.to_string()))?;
        Self::with_runtime(config, runtime)
    }

    /// Create a registry bound to an explicit runtime handle.
    pub fn with_runtime(config: PollerConfig, runtime: Handle) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            inner: Arc::new(RegistryInner {
                config,
                runtime,
                streams: Mutex::new(IndexMap::new()),
                idle: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &PollerConfig {
        &self.inner.config
    }

    /// Register a stream for `key`.
    ///
    /// Returns `None` without touching anything when `key` is already
    /// registered. Otherwise the new stream is stored; `interval` is applied
    /// only when it exceeds the configured minimum, and `auto_start` fires one
    /// fetch immediately, after which the stream keeps polling on its own.
    pub fn add<T, F, C>(
        &self,
        key: impl Into<String>,
        fetcher: F,
        on_success: C,
        auto_start: bool,
        interval: Option<Duration>,
    ) -> Option<PollerStream<T>>
    where
        T: Send + 'static,
        F: Fetcher<T> + 'static,
        C: Fn(T) + Send + Sync + 'static,
    {
        let key = key.into();
        tracing::debug!(key = %key, auto_start, ?interval, "Adding new poller");

        let stream = {
            let mut streams = self.inner.streams.lock();
            if streams.contains_key(&key) {
                tracing::debug!(key = %key, "Poller already registered");
                return None;
            }

            let stream = PollerStream::new(
                key.clone(),
                Arc::new(fetcher),
                Arc::new(on_success),
                &self.inner.config,
                self.inner.runtime.clone(),
            );
            streams.insert(key, Arc::new(stream.clone()));
            stream
        };

        if let Some(interval) = interval.filter(|i| *i > self.inner.config.min_interval) {
            stream.set_interval(interval, false);
        }
        if auto_start {
            stream.trigger();
        }

        Some(stream)
    }

    /// Stop and forget the stream for `key`.
    pub fn remove(&self, key: &str) {
        let removed = self.inner.streams.lock().shift_remove(key);
        if let Some(stream) = removed {
            stream.retire();
            tracing::debug!(key, "Removed poller");
        }
    }

    /// Typed access to a stream; `None` if absent or of another payload type.
    pub fn get<T: Send + 'static>(&self, key: &str) -> Option<PollerStream<T>> {
        let streams = self.inner.streams.lock();
        streams
            .get(key)?
            .as_any()
            .downcast_ref::<PollerStream<T>>()
            .cloned()
    }

    /// Untyped access to a stream
    pub fn control(&self, key: &str) -> Option<Arc<dyn StreamControl>> {
        self.inner.streams.lock().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.streams.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.streams.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bulk controls over every registered stream.
    pub fn get_all(&self) -> AllStreams<'_> {
        AllStreams { registry: self }
    }

    /// Visit every stream in registration order, then return the bulk controls.
    pub fn get_all_with<V>(&self, mut visitor: V) -> AllStreams<'_>
    where
        V: FnMut(&dyn StreamControl),
    {
        for stream in self.snapshot() {
            visitor(stream.as_ref());
        }
        self.get_all()
    }

    /// Put one stream back in self-paced mode with a new interval, effective
    /// on its next reschedule.
    pub fn change_interval(&self, key: &str, interval: Duration) {
        if let Some(stream) = self.control(key) {
            stream.wait_for_response(true);
            stream.set_interval(interval, false);
        }
    }

    /// Slow every stream down to the idle interval.
    pub fn enter_idle(&self) {
        self.inner.idle.store(true, Ordering::Relaxed);
        tracing::info!(interval = ?self.inner.config.idle_interval, "Console idle");
        self.get_all()
            .change_interval(Some(self.inner.config.idle_interval));
    }

    /// Restore the default interval on every stream.
    pub fn leave_idle(&self) {
        self.inner.idle.store(false, Ordering::Relaxed);
        tracing::info!(interval = ?self.inner.config.default_interval, "Console active");
        self.get_all().change_interval(None);
    }

    pub fn is_idle(&self) -> bool {
        self.inner.idle.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> RegistryStats {
        let streams: Vec<StreamStats> = self.snapshot().iter().map(|s| s.stats()).collect();

        RegistryStats {
            total_streams: streams.len(),
            started_streams: streams.iter().filter(|s| s.started).count(),
            default_interval: self.inner.config.default_interval,
            idle: self.is_idle(),
            streams,
        }
    }

    /// Clone the current streams so the lock is not held while driving them.
    fn snapshot(&self) -> Vec<Arc<dyn StreamControl>> {
        self.inner.streams.lock().values().cloned().collect()
    }
}

impl std::fmt::Debug for PollerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollerRegistry")
            .field("streams", &self.get_all().list())
            .field("idle", &self.is_idle())
            .finish()
    }
}

/// Bulk operations over every stream in a registry
pub struct AllStreams<'a> {
    registry: &'a PollerRegistry,
}

impl AllStreams<'_> {
    /// Apply `interval` (or the configured default) to every stream without
    /// restarting it.
    pub fn change_interval(&self, interval: Option<Duration>) {
        let interval = interval.unwrap_or(self.registry.inner.config.default_interval);
        for stream in self.registry.snapshot() {
            stream.set_interval(interval, false);
        }
    }

    /// Fetch every stream once, now.
    pub fn start(&self) {
        tracing::info!("Starting all pollers");
        for stream in self.registry.snapshot() {
            stream.trigger();
        }
    }

    pub fn stop(&self) {
        tracing::info!("Stopping all pollers");
        for stream in self.registry.snapshot() {
            stream.stop();
        }
    }

    /// Stop and remove every stream, leaving the registry empty.
    pub fn remove(&self) {
        tracing::info!("Removing all pollers");
        let drained: StreamMap = std::mem::take(&mut *self.registry.inner.streams.lock());
        for stream in drained.values() {
            stream.retire();
        }
    }

    /// Registered keys in registration order
    pub fn list(&self) -> Vec<String> {
        self.registry.inner.streams.lock().keys().cloned().collect()
    }
}

/// Statistics for the registry
#[derive(Debug)]
pub struct RegistryStats {
    pub total_streams: usize,
    pub started_streams: usize,
    pub default_interval: Duration,
    pub idle: bool,
    pub streams: Vec<StreamStats>,
}

impl std::fmt::Display for RegistryStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Poller Registry Stats:")?;
        writeln!(
            f,
            "  Streams: {} ({} started)",
            self.total_streams, self.started_streams
        )?;
        writeln!(f, "  Default interval: {:?}", self.default_interval)?;
        writeln!(f, "  Idle: {}", self.idle)?;

        if !self.streams.is_empty() {
            writeln!(f, "  Stream details:")?;
            for stat in &self.streams {
                writeln!(
                    f,
                    "    {}: {:?} (interval: {:?}, started: {}, polls: {}, errors: {})",
                    stat.key,
                    stat.mode,
                    stat.interval,
                    stat.started,
                    stat.fired,
                    stat.error_count
                )?;
            }
        }

        Ok(())
    }
}
