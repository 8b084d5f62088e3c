//! # Error Handling
//!
//! Combinators that observe or recover from failures.
//!
//! The primitive is [`Effect::fold_cause_m`], which sees the full
//! [`Cause`]. Everything else narrows it: [`Effect::fold_m`] and
//! [`Effect::catch_all`] only handle typed failures and let defects and
//! interruptions pass through untouched.

use std::sync::Arc;

use crate::cause::{Cause, Defect};
use crate::effect::{self, Data, Effect, Never};
use crate::exit::Exit;
use crate::instruction::{unerase, Instr, Value};

impl<R: Data, E: Data, A: Data> Effect<R, E, A> {
    /// Handle both outcomes, seeing the full cause on failure.
    pub fn fold_cause_m<E2: Data, B: Data>(
        self,
        on_failure: impl Fn(Cause<E>) -> Effect<R, E2, B> + Send + Sync + 'static,
        on_success: impl Fn(A) -> Effect<R, E2, B> + Send + Sync + 'static,
    ) -> Effect<R, E2, B> {
        Effect::from_ir(Arc::new(Instr::Fold(
            self.ir,
            Arc::new(move |cause: Cause<Value>| on_failure(cause.map(unerase::<E>)).ir),
            Arc::new(move |value: Value| on_success(unerase::<A>(value)).ir),
        )))
    }

    /// Handle both outcomes. Only typed failures reach `on_failure`;
    /// defects and interruptions are re-raised.
    pub fn fold_m<E2: Data, B: Data>(
        self,
        on_failure: impl Fn(E) -> Effect<R, E2, B> + Send + Sync + 'static,
        on_success: impl Fn(A) -> Effect<R, E2, B> + Send + Sync + 'static,
    ) -> Effect<R, E2, B> {
        self.fold_cause_m(
            move |cause| match cause.failure_or_cause() {
                Ok(error) => on_failure(error),
                Err(rest) => effect::halt(rest.map(absurd)),
            },
            on_success,
        )
    }

    /// Turn both outcomes into a value.
    pub fn fold<B: Data>(
        self,
        on_failure: impl Fn(E) -> B + Send + Sync + 'static,
        on_success: impl Fn(A) -> B + Send + Sync + 'static,
    ) -> Effect<R, Never, B> {
        self.fold_m(
            move |error| effect::succeed(on_failure(error)),
            move |value| effect::succeed(on_success(value)),
        )
    }

    /// Recover from any typed failure.
    pub fn catch_all<E2: Data>(
        self,
        f: impl Fn(E) -> Effect<R, E2, A> + Send + Sync + 'static,
    ) -> Effect<R, E2, A> {
        self.fold_m(f, effect::succeed)
    }

    /// Recover from any failure, seeing the full cause.
    pub fn catch_all_cause<E2: Data>(
        self,
        f: impl Fn(Cause<E>) -> Effect<R, E2, A> + Send + Sync + 'static,
    ) -> Effect<R, E2, A> {
        self.fold_cause_m(f, effect::succeed)
    }

    /// Recover from defects that `f` chooses to handle.
    pub fn catch_some_defect(
        self,
        f: impl Fn(&Defect) -> Option<Effect<R, E, A>> + Send + Sync + 'static,
    ) -> Effect<R, E, A> {
        self.fold_cause_m(
            move |cause: Cause<E>| {
                let handled = cause.defects().iter().find_map(|defect| f(defect));
                handled.unwrap_or_else(|| effect::halt(cause))
            },
            effect::succeed,
        )
    }

    /// Try `that` if `self` fails with a typed error.
    pub fn or_else<E2: Data>(self, that: Effect<R, E2, A>) -> Effect<R, E2, A> {
        self.catch_all(move |_| that.clone())
    }

    /// Transform typed failures; defects and interruptions are kept.
    pub fn map_err<E2: Data>(self, f: impl Fn(E) -> E2 + Send + Sync + 'static) -> Effect<R, E2, A> {
        let f = Arc::new(f);
        self.fold_cause_m(
            move |cause: Cause<E>| {
                let f = f.clone();
                effect::halt(cause.map(move |error| f(error)))
            },
            effect::succeed,
        )
    }

    /// Transform the whole failure cause.
    pub fn map_error_cause<E2: Data>(
        self,
        f: impl Fn(Cause<E>) -> Cause<E2> + Send + Sync + 'static,
    ) -> Effect<R, E2, A> {
        self.fold_cause_m(move |cause| effect::halt(f(cause)), effect::succeed)
    }

    /// Expose the full cause as the typed error.
    pub fn sandbox(self) -> Effect<R, Cause<E>, A> {
        self.fold_cause_m(effect::fail, effect::succeed)
    }

    /// Expose the outcome as a `Result`; the effect cannot fail with a
    /// typed error any more.
    pub fn either(self) -> Effect<R, Never, Result<A, E>> {
        self.fold(Err, Ok)
    }

    /// Expose the outcome as an [`Exit`]. Never fails.
    pub fn result(self) -> Effect<R, Never, Exit<E, A>> {
        self.fold_cause_m(
            |cause| effect::succeed(Exit::Failure(cause)),
            |value| effect::succeed(Exit::Success(value)),
        )
    }

    /// Turn every failure into a defect, converting typed errors with `f`.
    pub fn absorb_with(self, f: impl Fn(E) -> Defect + Send + Sync + 'static) -> Effect<R, Defect, A> {
        let f = Arc::new(f);
        self.sandbox().map_err(move |cause: Cause<E>| {
            let f = f.clone();
            match cause.failure_or_cause() {
                Ok(error) => f(error),
                Err(rest) => rest.squash_with(|never: &Never| match *never {}),
            }
        })
    }

    /// Run `finalizer` after `self` however it ends. Finalizer failures
    /// are appended to the cause.
    pub fn ensuring(self, finalizer: Effect<R, Never, ()>) -> Effect<R, E, A> {
        effect::uninterruptible_mask(move |restore| {
            let on_failure = finalizer.clone();
            let on_success = finalizer.clone();
            restore.restore(self.clone()).fold_cause_m(
                move |cause: Cause<E>| {
                    let failed = cause.clone();
                    on_failure.clone().widen_error::<E>().fold_cause_m(
                        move |finalizer_cause: Cause<E>| effect::halt(failed.clone().then(finalizer_cause)),
                        move |_| effect::halt(cause.clone()),
                    )
                },
                move |value: A| {
                    on_success
                        .clone()
                        .widen_error::<E>()
                        .fold_cause_m(effect::halt, move |_| effect::succeed(value.clone()))
                },
            )
        })
    }
}

impl<R: Data, E: Data, A: Data> Effect<R, Cause<E>, A> {
    /// Undo [`Effect::sandbox`].
    pub fn unsandbox(self) -> Effect<R, E, A> {
        self.map_error_cause(Cause::flatten)
    }
}

impl<R: Data, E: Data + From<Defect>, A: Data> Effect<R, E, A> {
    /// Turn defects back into typed failures.
    pub fn resurrect(self) -> Effect<R, E, A> {
        self.fold_cause_m(
            |cause: Cause<E>| {
                let defects = cause.defects();
                match defects.into_iter().next() {
                    Some(defect) if !cause.is_interrupted() => effect::fail(E::from(defect)),
                    _ => effect::halt(cause),
                }
            },
            effect::succeed,
        )
    }
}

fn absurd<E>(never: Never) -> E {
    match never {}
}

// ============================================================================
// Tests
// ============================================================================
