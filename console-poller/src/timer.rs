//! Cancellable timers backed by tokio tasks
//!
//! A [`Timer`] is the single scheduling primitive used by streams. It either
//! fires once after a delay or keeps firing at a fixed period. The tick
//! callback only dispatches work; anything long-running must be spawned by the
//! callback itself so that cancelling the timer never interrupts it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

/// Which kind of schedule a timer follows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Fires once, then is spent
    Once,
    /// Fires every period until cancelled
    Repeating,
}

/// A scheduled tick, aborted when cancelled or dropped
#[derive(Debug)]
pub struct Timer {
    id: u64,
    kind: TimerKind,
    period: Duration,
    task: JoinHandle<()>,
}

impl Timer {
    /// Fire `tick` once after `delay`.
    pub fn once<F>(handle: &Handle, delay: Duration, tick: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let task = handle.spawn(async move {
            sleep(delay).await;
            tick();
        });
        Self::new(TimerKind::Once, delay, task)
    }

    /// Fire `tick` every `period`, the first time one period from now.
    pub fn every<F>(handle: &Handle, period: Duration, tick: F) -> Self
    where
        F: Fn() + Send + 'static,
    {
        let task = handle.spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                tick();
            }
        });
        Self::new(TimerKind::Repeating, period, task)
    }

    fn new(kind: TimerKind, period: Duration, task: JoinHandle<()>) -> Self {
        Self {
            id: NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            period,
            task,
        }
    }

    /// Process-unique identifier of this timer
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> TimerKind {
        self.kind
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Whether the timer can still fire
    pub fn is_pending(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop the timer. Safe to call on a timer that already fired.
    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
