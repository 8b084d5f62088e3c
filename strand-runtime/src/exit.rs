//! # Exit Values
//!
//! The final outcome of running an effect: either a success value or the
//! full [`Cause`] of failure.

use std::fmt;

use thiserror::Error;

use crate::cause::{Cause, Defect};
use crate::fiber::FiberId;

/// Outcome of a finished computation.
#[derive(Clone, Debug, PartialEq)]
pub enum Exit<E, A> {
    /// The computation produced a value.
    Success(A),
    /// The computation failed.
    Failure(Cause<E>),
}

impl<E, A> Exit<E, A> {
    /// A successful exit.
    pub fn succeed(value: A) -> Self {
        Exit::Success(value)
    }

    /// An exit failed with a typed error.
    pub fn fail(error: E) -> Self {
        Exit::Failure(Cause::fail(error))
    }

    /// An exit failed with `cause`.
    pub fn halt(cause: Cause<E>) -> Self {
        Exit::Failure(cause)
    }

    /// An exit failed with a defect.
    pub fn die(defect: impl Into<Defect>) -> Self {
        Exit::Failure(Cause::die(defect))
    }

    /// An exit interrupted by `fiber`.
    pub fn interrupt(fiber: FiberId) -> Self {
        Exit::Failure(Cause::interrupt(fiber))
    }

    /// Whether this is a success.
    pub fn is_success(&self) -> bool {
        matches!(self, Exit::Success(_))
    }

    /// Whether this is a failure of any kind.
    pub fn is_failure(&self) -> bool {
        matches!(self, Exit::Failure(_))
    }

    /// Whether the failure cause contains an interruption.
    pub fn is_interrupted(&self) -> bool {
        match self {
            Exit::Success(_) => false,
            Exit::Failure(cause) => cause.is_interrupted(),
        }
    }

    /// The success value, if any.
    pub fn success(&self) -> Option<&A> {
        match self {
            Exit::Success(value) => Some(value),
            Exit::Failure(_) => None,
        }
    }

    /// The failure cause, if any.
    pub fn cause(&self) -> Option<&Cause<E>> {
        match self {
            Exit::Success(_) => None,
            Exit::Failure(cause) => Some(cause),
        }
    }

    /// Transform the success value.
    pub fn map<B>(self, f: impl FnOnce(A) -> B) -> Exit<E, B> {
        match self {
            Exit::Success(value) => Exit::Success(f(value)),
            Exit::Failure(cause) => Exit::Failure(cause),
        }
    }

    /// Transform the typed failures.
    pub fn map_err<E2>(self, f: impl Fn(E) -> E2) -> Exit<E2, A> {
        match self {
            Exit::Success(value) => Exit::Success(value),
            Exit::Failure(cause) => Exit::Failure(cause.map(f)),
        }
    }

    /// Replace the success value with `()`.
    pub fn unit(self) -> Exit<E, ()> {
        self.map(|_| ())
    }

    /// Combine two exits. Successes are merged with `f`; failures with
    /// `combine`, which receives the causes in left/right order.
    pub fn zip_with<B, C>(
        self,
        that: Exit<E, B>,
        f: impl FnOnce(A, B) -> C,
        combine: impl FnOnce(Cause<E>, Cause<E>) -> Cause<E>,
    ) -> Exit<E, C> {
        match (self, that) {
            (Exit::Success(a), Exit::Success(b)) => Exit::Success(f(a, b)),
            (Exit::Failure(left), Exit::Success(_)) => Exit::Failure(left),
            (Exit::Success(_), Exit::Failure(right)) => Exit::Failure(right),
            (Exit::Failure(left), Exit::Failure(right)) => Exit::Failure(combine(left, right)),
        }
    }

    /// Combine two exits, composing failures sequentially.
    pub fn zip<B>(self, that: Exit<E, B>) -> Exit<E, (A, B)> {
        self.zip_with(that, |a, b| (a, b), Cause::then)
    }

    /// Combine two exits, composing failures in parallel.
    pub fn zip_par<B>(self, that: Exit<E, B>) -> Exit<E, (A, B)> {
        self.zip_with(that, |a, b| (a, b), Cause::both)
    }

    /// Collect exits produced in parallel into one.
    pub fn collect_all_par(exits: impl IntoIterator<Item = Exit<E, A>>) -> Exit<E, Vec<A>> {
        exits
            .into_iter()
            .fold(Exit::Success(Vec::new()), |acc, exit| {
                acc.zip_with(
                    exit,
                    |mut values, value| {
                        values.push(value);
                        values
                    },
                    Cause::both,
                )
            })
    }
}

impl<E: fmt::Debug, A> Exit<E, A> {
    /// Convert into a `Result`, wrapping failures in [`FiberFailure`].
    pub fn into_result(self) -> Result<A, FiberFailure<E>> {
        match self {
            Exit::Success(value) => Ok(value),
            Exit::Failure(cause) => Err(FiberFailure { cause }),
        }
    }
}

/// A failed exit surfaced as a standard error.
///
/// Its message is the pretty-printed cause.
#[derive(Debug, Clone, Error)]
#[error("{}", .cause.pretty())]
pub struct FiberFailure<E: fmt::Debug> {
    /// The failure cause.
    pub cause: Cause<E>,
}

// ============================================================================
// Tests
// ============================================================================
