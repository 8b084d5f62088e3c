//! # Timer
//!
//! A single background thread that fires callbacks at deadlines. Used by
//! `sleep`, which suspends a fiber without occupying a worker thread.
//!
//! Timers are cancellable: an interrupted `sleep` removes its callback so
//! the fiber is not resumed later.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::error;

use crate::effect::{self, AsyncRegistration, Data, Effect};

type Callback = Box<dyn FnOnce() + Send>;

/// Cancelled deadlines tolerated before the heap is rebuilt.
const STALE_DEADLINES: usize = 64;

/// Handle to a scheduled callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerKey(u64);

#[derive(Default)]
struct TimerState {
    next_key: u64,
    deadlines: BinaryHeap<Reverse<(Instant, u64)>>,
    callbacks: HashMap<u64, Callback>,
}

/// Deadline-ordered callback queue served by one thread.
pub struct Timer {
    state: Mutex<TimerState>,
    changed: Condvar,
}

impl Timer {
    /// The process-wide timer. Its thread starts on first use.
    pub fn global() -> &'static Arc<Timer> {
        static GLOBAL: OnceLock<Arc<Timer>> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            let timer = Arc::new(Timer::new());
            let worker = timer.clone();
            if let Err(err) = thread::Builder::new()
                .name("strand-timer".to_string())
                .spawn(move || worker.run())
            {
                error!(error = %err, "failed to start the timer thread");
            }
            timer
        })
    }

    fn new() -> Self {
        Timer {
            state: Mutex::new(TimerState::default()),
            changed: Condvar::new(),
        }
    }

    /// Run `callback` once `delay` has elapsed.
    pub fn schedule(&self, delay: Duration, callback: impl FnOnce() + Send + 'static) -> TimerKey {
        let deadline = Instant::now() + delay;
        let mut state = self.state.lock();
        let key = state.next_key;
        state.next_key += 1;
        state.deadlines.push(Reverse((deadline, key)));
        state.callbacks.insert(key, Box::new(callback));
        self.changed.notify_one();
        TimerKey(key)
    }

    /// Cancel a pending callback. Returns `false` if it already fired or
    /// was cancelled.
    pub fn cancel(&self, key: TimerKey) -> bool {
        let mut state = self.state.lock();
        let removed = state.callbacks.remove(&key.0).is_some();
        if state.deadlines.len() > 2 * state.callbacks.len() + STALE_DEADLINES {
            let TimerState {
                deadlines, callbacks, ..
            } = &mut *state;
            deadlines.retain(|Reverse((_, key))| callbacks.contains_key(key));
        }
        removed
    }

    /// Number of callbacks still pending.
    pub fn pending(&self) -> usize {
        self.state.lock().callbacks.len()
    }

    fn run(&self) {
        loop {
            let due = {
                let mut state = self.state.lock();
                loop {
                    let now = Instant::now();
                    let mut due = Vec::new();
                    while let Some(Reverse((deadline, key))) = state.deadlines.peek().copied() {
                        if deadline > now {
                            break;
                        }
                        state.deadlines.pop();
                        if let Some(callback) = state.callbacks.remove(&key) {
                            due.push(callback);
                        }
                    }
                    if !due.is_empty() {
                        break due;
                    }
                    match state.deadlines.peek().copied() {
                        Some(Reverse((deadline, _))) => {
                            self.changed.wait_until(&mut state, deadline);
                        }
                        None => self.changed.wait(&mut state),
                    }
                }
            };
            for callback in due {
                if std::panic::catch_unwind(std::panic::AssertUnwindSafe(callback)).is_err() {
                    error!("timer callback panicked");
                }
            }
        }
    }
}

/// Suspend the calling fiber for `duration` without blocking a worker
/// thread. Interruptible; interruption cancels the underlying timer.
pub fn sleep<R: Data, E: Data>(duration: Duration) -> Effect<R, E, ()> {
    effect::effect_async_interrupt(move |callback| {
        let timer = Timer::global();
        let key = timer.schedule(duration, move || {
            callback.succeed(());
        });
        AsyncRegistration::Pending(effect::total(move || {
            timer.cancel(key);
        }))
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[test]
    fn test_callbacks_fire_in_deadline_order() {
        let (tx, rx) = bounded(2);
        let timer = Timer::global();
        let late = tx.clone();
        timer.schedule(Duration::from_millis(40), move || {
            let _ = late.send("late");
        });
        timer.schedule(Duration::from_millis(5), move || {
            let _ = tx.send("early");
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "early");
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "late");
    }

    #[test]
    fn test_cancelled_callback_does_not_fire() {
        let (tx, rx) = bounded::<()>(1);
        let timer = Timer::global();
        let key = timer.schedule(Duration::from_millis(20), move || {
            let _ = tx.send(());
        });
        assert!(timer.cancel(key));
        assert!(!timer.cancel(key));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_cancelled_deadlines_are_pruned() {
        let timer = Timer::new();
        let keep = timer.schedule(Duration::from_secs(3600), || {});
        for _ in 0..1_000 {
            let key = timer.schedule(Duration::from_secs(3600), || {});
            assert!(timer.cancel(key));
        }
        assert_eq!(timer.pending(), 1);
        assert!(timer.state.lock().deadlines.len() <= 2 + STALE_DEADLINES);
        assert!(timer.cancel(keep));
    }
}
