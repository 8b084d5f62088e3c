//! # Fibers
//!
//! Identity, status and handles of fibers.
//!
//! A fiber is a lightweight logical thread that interprets one effect. It
//! runs in slices on the scheduler's worker threads, suspends on
//! asynchronous waits without blocking a thread, and finishes with an
//! [`Exit`].
//!
//! ## Handles
//!
//! - [`Fiber<E, A>`]: typed handle returned by `fork`; joining yields the
//!   child's typed result.
//! - [`RuntimeFiber`]: type-erased handle, used by supervisors and the
//!   runtime root registry.

use std::collections::BTreeSet;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::effect::{self, descriptor, Data, Effect, UIO};
use crate::executor::{self, FiberInner};
use crate::exit::Exit;
use crate::instruction::{erase, unerase, Instr, Value};
use crate::scope::Scope;

// ============================================================================
// Fiber identity
// ============================================================================

/// Unique identifier for a fiber.
///
/// Ordered by creation sequence. The start time is informational.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId {
    seq: u64,
    started_at_ms: u64,
}

impl FiberId {
    /// The identifier used when no fiber is responsible (e.g. the process
    /// signal handler).
    pub const fn none() -> Self {
        Self {
            seq: 0,
            started_at_ms: 0,
        }
    }

    /// Sequence number of the fiber.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Wall-clock start time in milliseconds since the Unix epoch.
    pub fn started_at_ms(&self) -> u64 {
        self.started_at_ms
    }

    /// Whether this is [`FiberId::none`].
    pub fn is_none(&self) -> bool {
        self.seq == 0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.seq)
    }
}

/// Global fiber ID counter.
static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a new unique fiber ID.
pub fn next_fiber_id() -> FiberId {
    let started_at_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0);
    FiberId {
        seq: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
        started_at_ms,
    }
}

// ============================================================================
// Status
// ============================================================================

/// Whether the current region may be interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum InterruptStatus {
    /// Interruption is delivered at the next instruction boundary.
    #[default]
    Interruptible,
    /// Interruption is recorded and delivered when the region ends.
    Uninterruptible,
}

impl InterruptStatus {
    /// Whether this is `Interruptible`.
    pub fn is_interruptible(&self) -> bool {
        matches!(self, InterruptStatus::Interruptible)
    }

    /// Build from a boolean flag.
    pub fn from_bool(interruptible: bool) -> Self {
        if interruptible {
            InterruptStatus::Interruptible
        } else {
            InterruptStatus::Uninterruptible
        }
    }
}

/// Execution status of a fiber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FiberStatus {
    /// Interpreting instructions or queued to do so.
    Running,
    /// Waiting for an asynchronous callback.
    Suspended {
        /// Whether an interruption would wake the fiber.
        interruptible: bool,
        /// Fibers this one is waiting on, for diagnostics.
        blocking_on: Vec<FiberId>,
    },
    /// Finished with an exit value.
    Done,
}

impl FiberStatus {
    /// Whether the fiber has finished.
    pub fn is_done(&self) -> bool {
        matches!(self, FiberStatus::Done)
    }
}

/// Snapshot of the running fiber, as seen from inside it.
#[derive(Debug, Clone)]
pub struct Descriptor {
    /// The fiber's identifier.
    pub id: FiberId,
    /// Current status.
    pub status: FiberStatus,
    /// Fibers that requested interruption so far.
    pub interruptors: BTreeSet<FiberId>,
    /// Interrupt status of the current region.
    pub interrupt_status: InterruptStatus,
    /// Scope that forked children are attached to.
    pub scope: Scope,
}

// ============================================================================
// RuntimeFiber
// ============================================================================

/// Type-erased handle to a fiber.
#[derive(Clone)]
pub struct RuntimeFiber {
    inner: Arc<FiberInner>,
}

impl RuntimeFiber {
    pub(crate) fn new(inner: Arc<FiberInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<FiberInner> {
        &self.inner
    }

    /// The fiber's identifier.
    pub fn id(&self) -> FiberId {
        self.inner.id
    }

    /// Current status snapshot.
    pub fn status(&self) -> FiberStatus {
        self.inner.status()
    }

    /// Whether the fiber has finished.
    pub fn is_done(&self) -> bool {
        self.inner.status().is_done()
    }

    /// Wait for the fiber to finish, ignoring its exit value.
    pub fn await_done(&self) -> UIO<()> {
        Effect::<(), effect::Never, Exit<Value, Value>>::from_ir(executor::await_ir(&self.inner))
            .as_unit()
    }

    /// Interrupt the fiber on behalf of `by` and wait for it to finish.
    pub fn interrupt_as(&self, by: FiberId) -> UIO<()> {
        let inner = self.inner.clone();
        Effect::from_ir(Arc::new(Instr::Suspend(Arc::new(move || {
            inner.signal_interrupt(by);
            executor::await_ir(&inner)
        }))))
        .map(|_: Exit<Value, Value>| ())
    }

    pub(crate) fn await_erased(&self) -> UIO<Exit<Value, Value>> {
        Effect::from_ir(executor::await_ir(&self.inner))
    }
}

impl fmt::Debug for RuntimeFiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeFiber")
            .field("id", &self.inner.id)
            .field("status", &self.inner.status())
            .finish()
    }
}

impl PartialEq for RuntimeFiber {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for RuntimeFiber {}

/// Signal every fiber in `fibers` on behalf of `by`, then wait for all of
/// them to finish.
pub fn interrupt_all_as(fibers: Vec<RuntimeFiber>, by: FiberId) -> UIO<()> {
    let signalled = fibers.clone();
    let signal_all = effect::total(move || {
        for fiber in &signalled {
            fiber.inner.signal_interrupt(by);
        }
    });
    fibers
        .into_iter()
        .fold(signal_all, |acc, fiber| acc.zip_right(fiber.await_done()))
}

// ============================================================================
// Typed Fiber
// ============================================================================

/// Typed handle to a forked fiber whose effect fails with `E` or succeeds
/// with `A`.
pub struct Fiber<E, A> {
    raw: RuntimeFiber,
    _marker: PhantomData<fn() -> (E, A)>,
}

impl<E, A> Clone for Fiber<E, A> {
    fn clone(&self) -> Self {
        Self {
            raw: self.raw.clone(),
            _marker: PhantomData,
        }
    }
}

impl<E, A> fmt::Debug for Fiber<E, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Fiber").field(&self.raw.id()).finish()
    }
}

pub(crate) fn typed_exit<E: Data, A: Data>(exit: Exit<Value, Value>) -> Exit<E, A> {
    match exit {
        Exit::Success(value) => Exit::Success(unerase(value)),
        Exit::Failure(cause) => Exit::Failure(cause.map(unerase)),
    }
}

pub(crate) fn erased_exit<E: Data, A: Data>(exit: Exit<E, A>) -> Exit<Value, Value> {
    match exit {
        Exit::Success(value) => Exit::Success(erase(value)),
        Exit::Failure(cause) => Exit::Failure(cause.map(erase)),
    }
}

impl<E: Data, A: Data> Fiber<E, A> {
    pub(crate) fn from_raw(raw: RuntimeFiber) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    /// The fiber's identifier.
    pub fn id(&self) -> FiberId {
        self.raw.id()
    }

    /// Type-erased handle to the same fiber.
    pub fn runtime_fiber(&self) -> RuntimeFiber {
        self.raw.clone()
    }

    /// Current status snapshot.
    pub fn status(&self) -> FiberStatus {
        self.raw.status()
    }

    /// Wait for the fiber to finish and return its exit value.
    pub fn await_exit(&self) -> UIO<Exit<E, A>> {
        self.raw.await_erased().map(typed_exit::<E, A>)
    }

    /// The exit value if the fiber already finished.
    pub fn poll(&self) -> UIO<Option<Exit<E, A>>> {
        let inner = self.raw.inner.clone();
        effect::total(move || inner.poll_exit().map(typed_exit::<E, A>))
    }

    /// Wait for the fiber, merge its fiber-ref values into the caller and
    /// continue with its result.
    pub fn join(&self) -> Effect<(), E, A> {
        let inherit = self.inherit_refs();
        self.await_exit()
            .widen_error::<E>()
            .chain(move |exit| inherit.clone().widen_error::<E>().zip_right(effect::done(exit)))
    }

    /// Interrupt the fiber on behalf of `by` and wait for its exit value.
    pub fn interrupt_as(&self, by: FiberId) -> UIO<Exit<E, A>> {
        let inner = self.raw.inner.clone();
        Effect::<(), effect::Never, Exit<Value, Value>>::from_ir(Arc::new(Instr::Suspend(
            Arc::new(move || {
                inner.signal_interrupt(by);
                executor::await_ir(&inner)
            }),
        )))
        .map(typed_exit::<E, A>)
    }

    /// Interrupt the fiber on behalf of the calling fiber.
    pub fn interrupt(&self) -> UIO<Exit<E, A>> {
        let this = self.clone();
        descriptor().chain(move |d| this.interrupt_as(d.id))
    }

    /// Merge the fiber's current fiber-ref values into the caller using
    /// each ref's join function.
    pub fn inherit_refs(&self) -> UIO<()> {
        let inner = self.raw.inner.clone();
        Effect::from_ir(Arc::new(Instr::Suspend(Arc::new(move || {
            executor::inherit_refs_ir(inner.refs_snapshot())
        }))))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fiber_ids_are_ordered_and_unique() {
        let a = next_fiber_id();
        let b = next_fiber_id();
        assert!(a < b);
        assert_ne!(a, b);
        assert!(!a.is_none());
        assert!(FiberId::none().is_none());
    }

    #[test]
    fn test_fiber_id_display() {
        let id = next_fiber_id();
        assert_eq!(id.to_string(), format!("#{}", id.seq()));
    }

    #[test]
    fn test_interrupt_status_from_bool() {
        assert!(InterruptStatus::from_bool(true).is_interruptible());
        assert!(!InterruptStatus::from_bool(false).is_interruptible());
        assert_eq!(InterruptStatus::default(), InterruptStatus::Interruptible);
    }
}
