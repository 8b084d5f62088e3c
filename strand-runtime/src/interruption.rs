//! # Interruption Control
//!
//! Regions are interruptible by default. Marking a region uninterruptible
//! defers delivery of any interrupt request until the region ends; the
//! request itself is never lost.
//!
//! Masks let an uninterruptible region re-enable interruption for parts of
//! its body: [`uninterruptible_mask`] hands the body an
//! [`InterruptRestore`] that restores the status the caller had.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::cause::Cause;
use crate::effect::{self, Data, Effect, Never};
use crate::fiber::{FiberId, InterruptStatus};
use crate::instruction::Instr;

/// Restores the interrupt status captured by a mask.
#[derive(Debug, Clone, Copy)]
pub struct InterruptRestore {
    status: InterruptStatus,
}

impl InterruptRestore {
    /// The captured status.
    pub fn status(&self) -> InterruptStatus {
        self.status
    }

    /// Run `effect` with the captured interrupt status.
    pub fn restore<R: Data, E: Data, A: Data>(&self, effect: Effect<R, E, A>) -> Effect<R, E, A> {
        effect.with_interrupt_status(self.status)
    }

    /// Like [`InterruptRestore::restore`], but if the captured status is
    /// uninterruptible, run `effect` on a background fiber that can be
    /// interrupted and abandon it if the caller is interrupted.
    pub fn force<R: Data, E: Data, A: Data>(&self, effect: Effect<R, E, A>) -> Effect<R, E, A> {
        if self.status.is_interruptible() {
            self.restore(effect)
        } else {
            self.restore(effect).disconnect().interruptible()
        }
    }
}

/// Read the current interrupt status.
pub fn interrupt_status<R: Data, E: Data>() -> Effect<R, E, InterruptStatus> {
    check_interruptible(effect::succeed)
}

/// Build an effect from the current interrupt status.
pub fn check_interruptible<R: Data, E: Data, A: Data>(
    f: impl Fn(InterruptStatus) -> Effect<R, E, A> + Send + Sync + 'static,
) -> Effect<R, E, A> {
    Effect::from_ir(Arc::new(Instr::GetInterruptStatus(Arc::new(move |status| f(status).ir))))
}

/// Run the body uninterruptibly, giving it a way to restore the caller's
/// status for sub-regions.
pub fn uninterruptible_mask<R: Data, E: Data, A: Data>(
    f: impl Fn(InterruptRestore) -> Effect<R, E, A> + Send + Sync + 'static,
) -> Effect<R, E, A> {
    check_interruptible(move |status| f(InterruptRestore { status }).uninterruptible())
}

/// Run the body interruptibly, giving it a way to restore the caller's
/// status for sub-regions.
pub fn interruptible_mask<R: Data, E: Data, A: Data>(
    f: impl Fn(InterruptRestore) -> Effect<R, E, A> + Send + Sync + 'static,
) -> Effect<R, E, A> {
    check_interruptible(move |status| f(InterruptRestore { status }).interruptible())
}

/// Interrupt the calling fiber.
pub fn interrupt<R: Data, E: Data, A: Data>() -> Effect<R, E, A> {
    effect::fiber_id().chain(interrupt_as)
}

/// Fail with an interruption attributed to `fiber`.
pub fn interrupt_as<R: Data, E: Data, A: Data>(fiber: FiberId) -> Effect<R, E, A> {
    effect::halt(Cause::interrupt(fiber))
}

impl<R: Data, E: Data, A: Data> Effect<R, E, A> {
    /// Run with the given interrupt status.
    pub fn with_interrupt_status(self, status: InterruptStatus) -> Effect<R, E, A> {
        Effect::from_ir(Arc::new(Instr::SetInterruptStatus(self.ir, status)))
    }

    /// Make the region interruptible.
    pub fn interruptible(self) -> Effect<R, E, A> {
        self.with_interrupt_status(InterruptStatus::Interruptible)
    }

    /// Make the region uninterruptible.
    pub fn uninterruptible(self) -> Effect<R, E, A> {
        self.with_interrupt_status(InterruptStatus::Uninterruptible)
    }

    /// Run `cleanup` if the effect is interrupted, then re-raise.
    pub fn on_interrupt(
        self,
        cleanup: impl Fn(BTreeSet<FiberId>) -> Effect<R, Never, ()> + Send + Sync + 'static,
    ) -> Effect<R, E, A> {
        let cleanup = Arc::new(cleanup);
        uninterruptible_mask(move |restore| {
            let cleanup = cleanup.clone();
            restore.restore(self.clone()).fold_cause_m(
                move |cause: Cause<E>| {
                    if cause.is_interrupted() {
                        let failed = cause.clone();
                        cleanup(cause.interruptors())
                            .widen_error::<E>()
                            .zip_right(effect::halt(failed))
                    } else {
                        effect::halt(cause)
                    }
                },
                effect::succeed,
            )
        })
    }

    /// Run on a daemon fiber so that interrupting the caller does not wait
    /// for the effect to finish. The background fiber is interrupted on
    /// the caller's behalf without being awaited.
    pub fn disconnect(self) -> Effect<R, E, A> {
        uninterruptible_mask(move |restore| {
            let body = restore.restore(self.clone());
            effect::fiber_id::<R, E>().chain(move |caller| {
                body.clone()
                    .fork_daemon()
                    .widen_error::<E>()
                    .chain(move |fiber| {
                        let target = fiber.clone();
                        restore
                            .restore(fiber.join().widen())
                            .on_interrupt(move |_| {
                                target
                                    .interrupt_as(caller)
                                    .widen()
                                    .fork_daemon()
                                    .as_unit()
                            })
                    })
            })
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
