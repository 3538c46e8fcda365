//! One-shot and periodic timers backed by tokio tasks.
//!
//! Timer callbacks run on their own task, never inside a session task, so
//! callers only use them to post a command back to whoever owns the state.
//!
//! # Example
//!
//! ```ignore
//! let tx = commands.clone();
//! let clock = timer::every(Duration::from_secs(31), move || {
//!     let _ = tx.send(SessionCommand::Tick { session, timer: TimerKind::Inactivity });
//! });
//! ```
//!
//! Both [`Timeout`] and [`Clock`] abort their task when dropped.

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

// ============================================================================
// Timeout
// ============================================================================

/// Handle to a pending one-shot callback.
#[derive(Debug)]
pub struct Timeout {
    handle: Option<JoinHandle<()>>,
}

impl Timeout {
    /// Cancels the callback if it has not run yet.
    ///
    /// Returns `true` if the callback was still pending.
    pub fn cancel(&mut self) -> bool {
        match self.handle.take() {
            Some(handle) => {
                let pending = !handle.is_finished();
                handle.abort();
                pending
            }
            None => false,
        }
    }

    /// Returns `true` if the callback has neither run nor been cancelled.
    #[inline]
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for Timeout {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Runs `callback` once after `delay`.
///
/// Must be called from within a tokio runtime.
pub fn after<F>(delay: Duration, callback: F) -> Timeout
where
    F: FnOnce() + Send + 'static,
{
    let handle = tokio::spawn(async move {
        time::sleep(delay).await;
        callback();
    });

    Timeout {
        handle: Some(handle),
    }
}

// ============================================================================
// Clock
// ============================================================================

/// Handle to a periodic callback.
#[derive(Debug)]
pub struct Clock {
    period: Duration,
    handle: Option<JoinHandle<()>>,
}

impl Clock {
    /// Tick period, fixed at creation.
    #[inline]
    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Stops the clock. Idempotent.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Returns `true` until the clock is stopped.
    #[inline]
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for Clock {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Runs `callback` every `period`, first one `period` from now.
///
/// Late ticks are delayed rather than bunched up. Must be called from within
/// a tokio runtime.
pub fn every<F>(period: Duration, mut callback: F) -> Clock
where
    F: FnMut() + Send + 'static,
{
    let handle = tokio::spawn(async move {
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            callback();
        }
    });

    Clock {
        period,
        handle: Some(handle),
    }
}

// ============================================================================
// Tests
// ============================================================================
