//! Timer scheduling
//!
//! Components never sleep or spawn timers themselves. They ask a [`Scheduler`]
//! for a [`TimerToken`] and are later handed that token back by whoever drives
//! them. A token that was cancelled or superseded is simply not recognised.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::debug;

/// Handle identifying one scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerToken(pub u64);

/// One-shot timer source
pub trait Scheduler: Send + Sync {
    /// Arrange for `token` to be delivered after `delay`
    fn after(&self, delay: Duration) -> TimerToken;

    /// Cancel a pending timer (no-op if it already fired)
    fn cancel(&self, token: TimerToken);
}

/// Scheduler backed by tokio timers
///
/// Fired tokens are delivered on the receiver returned by [`TokioScheduler::new`].
pub struct TokioScheduler {
    next_id: AtomicU64,
    pending: Arc<Mutex<HashMap<TimerToken, AbortHandle>>>,
    fired_tx: mpsc::UnboundedSender<TimerToken>,
}

impl TokioScheduler {
    /// Must be called within a tokio runtime
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimerToken>) {
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            next_id: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
            fired_tx,
        };
        (scheduler, fired_rx)
    }

    /// Number of timers that have neither fired nor been cancelled
    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Scheduler for TokioScheduler {
    fn after(&self, delay: Duration) -> TimerToken {
        let token = TimerToken(self.next_id.fetch_add(1, Ordering::Relaxed));
        let tx = self.fired_tx.clone();
        let pending = Arc::clone(&self.pending);

        // Hold the lock across spawn so a zero delay cannot fire before registration
        let mut guard = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&token);
            let _ = tx.send(token);
        });
        guard.insert(token, handle.abort_handle());
        token
    }

    fn cancel(&self, token: TimerToken) {
        let handle = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&token);
        if let Some(handle) = handle {
            handle.abort();
            debug!(token = token.0, "Timer cancelled");
        }
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        let pending = std::mem::take(
            &mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for handle in pending.into_values() {
            handle.abort();
        }
    }
}

#[derive(Debug, Default)]
struct ManualState {
    now: Duration,
    next_id: u64,
    queue: BTreeMap<(Duration, u64), TimerToken>,
}

/// Virtual-clock scheduler for deterministic tests and simulations
#[derive(Debug, Default)]
pub struct ManualScheduler {
    state: Mutex<ManualState>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current virtual time
    pub fn now(&self) -> Duration {
        self.lock().now
    }

    /// Number of timers still queued
    pub fn pending_count(&self) -> usize {
        self.lock().queue.len()
    }

    /// Pop the earliest timer due at or before `deadline`, moving the clock to it
    pub fn pop_due(&self, deadline: Duration) -> Option<TimerToken> {
        let mut state = self.lock();
        let (&(due, seq), _) = state.queue.iter().next()?;
        if due > deadline {
            return None;
        }
        let token = state.queue.remove(&(due, seq))?;
        state.now = state.now.max(due);
        Some(token)
    }

    /// Advance the clock by `by`, handing every due token to `on_fire` in order
    ///
    /// Timers scheduled from inside `on_fire` are honoured if they fall within
    /// the window.
    pub fn advance(&self, by: Duration, mut on_fire: impl FnMut(TimerToken)) {
        let deadline = self.now() + by;
        while let Some(token) = self.pop_due(deadline) {
            on_fire(token);
        }
        let mut state = self.lock();
        state.now = state.now.max(deadline);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Scheduler for ManualScheduler {
    fn after(&self, delay: Duration) -> TimerToken {
        let mut state = self.lock();
        state.next_id += 1;
        let token = TimerToken(state.next_id);
        let due = state.now + delay;
        state.queue.insert((due, token.0), token);
        token
    }

    fn cancel(&self, token: TimerToken) {
        self.lock().queue.retain(|_, queued| *queued != token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_scheduler_fires_in_order() {
        let scheduler = ManualScheduler::new();
        let late = scheduler.after(Duration::from_millis(300));
        let early = scheduler.after(Duration::from_millis(100));
        let cancelled = scheduler.after(Duration::from_millis(200));
        scheduler.cancel(cancelled);

        let mut fired = Vec::new();
        scheduler.advance(Duration::from_millis(250), |t| fired.push(t));
        assert_eq!(fired, vec![early]);
        assert_eq!(scheduler.now(), Duration::from_millis(250));

        scheduler.advance(Duration::from_millis(100), |t| fired.push(t));
        assert_eq!(fired, vec![early, late]);
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[test]
    fn test_manual_scheduler_rearm_within_window() {
        let scheduler = ManualScheduler::new();
        scheduler.after(Duration::from_secs(1));

        let mut count = 0;
        scheduler.advance(Duration::from_millis(3500), |_| {
            count += 1;
            scheduler.after(Duration::from_secs(1));
        });
        assert_eq!(count, 3);
        assert_eq!(scheduler.pending_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_scheduler_delivers_and_cancels() {
        let (scheduler, mut fired) = TokioScheduler::new();
        let kept = scheduler.after(Duration::from_millis(50));
        let dropped = scheduler.after(Duration::from_millis(10));
        scheduler.cancel(dropped);

        let token = fired.recv().await.unwrap();
        assert_eq!(token, kept);
        assert_eq!(scheduler.pending_count(), 0);
    }
}
