//! # Host Futures
//!
//! Bridges between effects and `std::future::Future`.
//!
//! - [`Pending`] is what the runners hand back: a future resolving to a
//!   fiber's outcome, which can also be waited on from blocking code.
//! - [`from_future`] and [`promise_interrupt`] turn a host future into an
//!   effect. The future is polled on whichever thread wakes it; it never
//!   blocks a worker.
//!
//! ```text
//!   IDLE ──wake──▶ POLLING ──Pending──▶ IDLE
//!                    │  ▲
//!               wake │  │ re-poll
//!                    ▼  │
//!                  NOTIFIED
//!   POLLING ──Ready / cancel──▶ DONE
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use thiserror::Error;

use crate::cause::Defect;
use crate::effect::{self, AsyncRegistration, Callback, Data, Effect};
use crate::executor::guard_call;

/// Error returned while waiting on a [`Pending`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PendingError {
    /// The result can never arrive; the runtime dropped the fiber.
    #[error("the result was abandoned before completion")]
    Abandoned,
    /// The wait timed out.
    #[error("timed out waiting for the result")]
    Timeout,
}

/// A value that becomes available once a fiber finishes.
///
/// Await it from async code or call [`Pending::wait`] from a plain thread.
pub struct Pending<T> {
    receiver: Receiver<T>,
    waker: Arc<Mutex<Option<Waker>>>,
}

/// The sending half of a [`Pending`].
pub(crate) struct Completer<T> {
    sender: Option<Sender<T>>,
    waker: Arc<Mutex<Option<Waker>>>,
}

/// A connected completer/pending pair.
pub(crate) fn pending<T>() -> (Completer<T>, Pending<T>) {
    let (sender, receiver) = bounded(1);
    let waker = Arc::new(Mutex::new(None));
    (
        Completer {
            sender: Some(sender),
            waker: waker.clone(),
        },
        Pending { receiver, waker },
    )
}

impl<T> Completer<T> {
    pub(crate) fn complete(mut self, value: T) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(value);
        }
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        self.sender.take();
        let waker = self.waker.lock().take();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

impl<T> Pending<T> {
    /// Block the calling thread until the value arrives.
    pub fn wait(self) -> Result<T, PendingError> {
        self.receiver.recv().map_err(|_| PendingError::Abandoned)
    }

    /// Block for at most `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<T, PendingError> {
        self.receiver.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => PendingError::Timeout,
            RecvTimeoutError::Disconnected => PendingError::Abandoned,
        })
    }

    /// The value, if it already arrived.
    pub fn try_get(&self) -> Option<Result<T, PendingError>> {
        match self.receiver.try_recv() {
            Ok(value) => Some(Ok(value)),
            Err(TryRecvError::Disconnected) => Some(Err(PendingError::Abandoned)),
            Err(TryRecvError::Empty) => None,
        }
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T, PendingError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(result) = self.try_get() {
            return Poll::Ready(result);
        }
        *self.waker.lock() = Some(cx.waker().clone());
        // The completer may have fired between the check and the store.
        match self.try_get() {
            Some(result) => Poll::Ready(result),
            None => Poll::Pending,
        }
    }
}

impl<T> std::fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pending")
            .field("ready", &!self.receiver.is_empty())
            .finish()
    }
}

// ============================================================================
// Polling host futures
// ============================================================================

const IDLE: u8 = 0;
const POLLING: u8 = 1;
const NOTIFIED: u8 = 2;
const DONE: u8 = 3;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type OnReady<T> = Box<dyn FnOnce(Result<T, Defect>) + Send>;

struct FutureTask<T> {
    state: AtomicU8,
    future: Mutex<Option<BoxFuture<T>>>,
    on_ready: Mutex<Option<OnReady<T>>>,
}

impl<T: Send + 'static> FutureTask<T> {
    /// Poll `future` right away, then again on every wake-up until it is
    /// ready. A panicking poll counts as ready with a defect.
    fn spawn(future: BoxFuture<T>, on_ready: OnReady<T>) -> Arc<Self> {
        let task = Arc::new(Self {
            state: AtomicU8::new(POLLING),
            future: Mutex::new(Some(future)),
            on_ready: Mutex::new(Some(on_ready)),
        });
        task.clone().run();
        task
    }

    fn run(self: Arc<Self>) {
        let waker = Waker::from(self.clone());
        let mut cx = Context::from_waker(&waker);
        loop {
            let polled = {
                let mut slot = self.future.lock();
                match slot.as_mut() {
                    Some(future) => guard_call(|| future.as_mut().poll(&mut cx)),
                    None => return,
                }
            };
            let outcome = match polled {
                Ok(Poll::Pending) => {
                    match self
                        .state
                        .compare_exchange(POLLING, IDLE, Ordering::AcqRel, Ordering::Acquire)
                    {
                        Ok(_) | Err(DONE) => return,
                        Err(_) => {
                            if self
                                .state
                                .compare_exchange(NOTIFIED, POLLING, Ordering::AcqRel, Ordering::Acquire)
                                .is_err()
                            {
                                return;
                            }
                            continue;
                        }
                    }
                }
                Ok(Poll::Ready(value)) => Ok(value),
                Err(defect) => Err(defect),
            };
            self.state.store(DONE, Ordering::Release);
            self.future.lock().take();
            let on_ready = self.on_ready.lock().take();
            if let Some(on_ready) = on_ready {
                on_ready(outcome);
            }
            return;
        }
    }

    /// Drop the future without waiting for it.
    fn cancel(&self) {
        self.state.store(DONE, Ordering::Release);
        self.on_ready.lock().take();
        self.future.lock().take();
    }
}

impl<T: Send + 'static> Wake for FutureTask<T> {
    fn wake(self: Arc<Self>) {
        loop {
            match self.state.load(Ordering::Acquire) {
                IDLE => {
                    if self
                        .state
                        .compare_exchange(IDLE, POLLING, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        self.run();
                        return;
                    }
                }
                POLLING => {
                    if self
                        .state
                        .compare_exchange(POLLING, NOTIFIED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return;
                    }
                }
                _ => return,
            }
        }
    }
}

fn deliver<R: Data, E: Data, A: Data>(callback: &Callback<R, E, A>, outcome: Result<Result<A, E>, Defect>) {
    match outcome {
        Ok(Ok(value)) => callback.succeed(value),
        Ok(Err(error)) => callback.fail(error),
        Err(defect) => callback.die(defect),
    };
}

/// Run the future built by `factory` and continue with its result. A new
/// future is built each time the effect runs. Interrupting the fiber stops
/// the wait but the future is still driven to completion.
pub fn from_future<R, E, A, F>(factory: impl Fn() -> F + Send + Sync + 'static) -> Effect<R, E, A>
where
    R: Data,
    E: Data,
    A: Data,
    F: Future<Output = Result<A, E>> + Send + 'static,
{
    effect::effect_async(move |callback: Callback<R, E, A>| {
        FutureTask::<Result<A, E>>::spawn(
            Box::pin(factory()),
            Box::new(move |outcome| deliver(&callback, outcome)),
        );
    })
}

/// Alias of [`from_future`].
pub fn promise<R, E, A, F>(factory: impl Fn() -> F + Send + Sync + 'static) -> Effect<R, E, A>
where
    R: Data,
    E: Data,
    A: Data,
    F: Future<Output = Result<A, E>> + Send + 'static,
{
    from_future(factory)
}

/// Like [`from_future`], but interrupting the fiber drops the future.
pub fn promise_interrupt<R, E, A, F>(factory: impl Fn() -> F + Send + Sync + 'static) -> Effect<R, E, A>
where
    R: Data,
    E: Data,
    A: Data,
    F: Future<Output = Result<A, E>> + Send + 'static,
{
    effect::effect_async_interrupt(move |callback: Callback<R, E, A>| {
        let task = FutureTask::<Result<A, E>>::spawn(
            Box::pin(factory()),
            Box::new(move |outcome| deliver(&callback, outcome)),
        );
        AsyncRegistration::Pending(effect::total(move || task.cancel()))
    })
}

// ============================================================================
// Tests
// ============================================================================
