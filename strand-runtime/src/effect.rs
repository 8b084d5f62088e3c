//! # Effects
//!
//! [`Effect<R, E, A>`] is an immutable description of a computation that
//! needs an environment `R`, may fail with `E`, and succeeds with `A`.
//! Nothing happens until a [`Runtime`](crate::Runtime) runs it; the same
//! description can be run any number of times.
//!
//! ## Example
//!
//! ```rust,ignore
//! use strand_runtime::effect::{self, IO};
//! use strand_runtime::Runtime;
//!
//! let program: IO<String, i32> = effect::succeed(20)
//!     .chain(|n| if n > 10 { effect::succeed(n * 2) } else { effect::fail("too small".into()) })
//!     .map(|n| n + 2);
//!
//! let exit = Runtime::global().run_promise_exit(program).wait().unwrap();
//! ```
//!
//! This module holds the constructors and sequencing combinators. Error
//! handling lives in [`handling`](crate::handling), interruption control in
//! [`interruption`](crate::interruption), and fibers/races in
//! [`concurrency`](crate::concurrency).

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::cause::{Cause, Defect};
use crate::executor::Resume;
use crate::exit::Exit;
use crate::fiber::{Descriptor, FiberId};
use crate::instruction::{erase, unerase, Instr, Ir, Value};

pub use crate::concurrency::{collect_all_par, for_each_par, fork_scope_with, transplant};
pub use crate::interruption::{
    check_interruptible, interrupt, interrupt_as, interrupt_status, interruptible_mask,
    uninterruptible_mask, InterruptRestore,
};
pub use crate::timer::sleep;

/// Values that can flow through effects: cloneable, thread-safe, owned.
pub trait Data: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Data for T {}

/// Error type of effects that cannot fail.
pub type Never = std::convert::Infallible;

/// An effect with no environment requirement.
pub type IO<E, A> = Effect<(), E, A>;

/// An effect with no environment requirement that cannot fail.
pub type UIO<A> = Effect<(), Never, A>;

/// Description of a computation needing `R`, failing with `E`, producing `A`.
pub struct Effect<R, E, A> {
    pub(crate) ir: Ir,
    _marker: PhantomData<fn(R) -> (E, A)>,
}

impl<R, E, A> Clone for Effect<R, E, A> {
    fn clone(&self) -> Self {
        Self {
            ir: self.ir.clone(),
            _marker: PhantomData,
        }
    }
}

impl<R, E, A> fmt::Debug for Effect<R, E, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Effect")
            .field("instruction", &self.ir.tag())
            .finish()
    }
}

impl<R, E, A> Effect<R, E, A> {
    pub(crate) fn from_ir(ir: Ir) -> Self {
        Self {
            ir,
            _marker: PhantomData,
        }
    }
}

// ============================================================================
// Constructors
// ============================================================================

/// Succeed with `value`.
pub fn succeed<R: Data, E: Data, A: Data>(value: A) -> Effect<R, E, A> {
    Effect::from_ir(Arc::new(Instr::Succeed(erase(value))))
}

/// Succeed with `()`.
pub fn unit<R: Data, E: Data>() -> Effect<R, E, ()> {
    succeed(())
}

/// Fail with a typed error.
pub fn fail<R: Data, E: Data, A: Data>(error: E) -> Effect<R, E, A> {
    halt(Cause::fail(error))
}

/// Fail with a full cause.
pub fn halt<R: Data, E: Data, A: Data>(cause: Cause<E>) -> Effect<R, E, A> {
    Effect::from_ir(Arc::new(Instr::Fail(cause.map(erase))))
}

/// Fail with a defect.
pub fn die<R: Data, E: Data, A: Data>(defect: impl Into<Defect>) -> Effect<R, E, A> {
    halt(Cause::die(defect))
}

/// Fail with a defect carrying `message`.
pub fn die_message<R: Data, E: Data, A: Data>(message: impl Into<String>) -> Effect<R, E, A> {
    die(Defect::new(message))
}

/// Complete with an exit value.
pub fn done<R: Data, E: Data, A: Data>(exit: Exit<E, A>) -> Effect<R, E, A> {
    match exit {
        Exit::Success(value) => succeed(value),
        Exit::Failure(cause) => halt(cause),
    }
}

/// Run a side-effecting closure that is not expected to fail. A panic
/// becomes a defect.
pub fn total<R: Data, E: Data, A: Data>(f: impl Fn() -> A + Send + Sync + 'static) -> Effect<R, E, A> {
    Effect::from_ir(Arc::new(Instr::Total(Arc::new(move || erase(f())))))
}

/// Run a closure that may fail, converting its error with `on_error`.
pub fn partial<R: Data, E: Data, A: Data, X: Data>(
    f: impl Fn() -> Result<A, X> + Send + Sync + 'static,
    on_error: impl Fn(X) -> E + Send + Sync + 'static,
) -> Effect<R, E, A> {
    Effect::from_ir(Arc::new(Instr::Partial(
        Arc::new(move || f().map(erase).map_err(erase)),
        Arc::new(move |error: Value| erase(on_error(unerase::<X>(error)))),
    )))
}

/// Run a closure returning a `Result`, failing with its error.
pub fn try_with<R: Data, E: Data, A: Data>(
    f: impl Fn() -> Result<A, E> + Send + Sync + 'static,
) -> Effect<R, E, A> {
    partial(f, |error: E| error)
}

/// Build the effect lazily, each time it runs.
pub fn suspend<R: Data, E: Data, A: Data>(
    f: impl Fn() -> Effect<R, E, A> + Send + Sync + 'static,
) -> Effect<R, E, A> {
    Effect::from_ir(Arc::new(Instr::Suspend(Arc::new(move || f().ir))))
}

/// An effect that never completes. Interruptible.
pub fn never<R: Data, E: Data, A: Data>() -> Effect<R, E, A> {
    effect_async(|_callback: Callback<R, E, A>| {})
}

/// Let other fibers run before continuing.
pub fn yield_now<R: Data, E: Data>() -> Effect<R, E, ()> {
    Effect::from_ir(Arc::new(Instr::Yield))
}

/// The current environment.
pub fn ask<R: Data, E: Data>() -> Effect<R, E, R> {
    Effect::from_ir(Arc::new(Instr::Read(Arc::new(|environment: Value| {
        Arc::new(Instr::Succeed(environment))
    }))))
}

/// Project a value out of the environment.
pub fn access<R: Data, E: Data, A: Data>(f: impl Fn(&R) -> A + Send + Sync + 'static) -> Effect<R, E, A> {
    ask().map(move |environment: R| f(&environment))
}

/// Build an effect from the environment.
pub fn access_m<R: Data, E: Data, A: Data>(
    f: impl Fn(R) -> Effect<R, E, A> + Send + Sync + 'static,
) -> Effect<R, E, A> {
    ask().chain(f)
}

/// A snapshot of the running fiber.
pub fn descriptor<R: Data, E: Data>() -> Effect<R, E, Descriptor> {
    descriptor_with(succeed)
}

/// Build an effect from a snapshot of the running fiber.
pub fn descriptor_with<R: Data, E: Data, A: Data>(
    f: impl Fn(Descriptor) -> Effect<R, E, A> + Send + Sync + 'static,
) -> Effect<R, E, A> {
    Effect::from_ir(Arc::new(Instr::Descriptor(Arc::new(move |d| f(d).ir))))
}

/// Identifier of the running fiber.
pub fn fiber_id<R: Data, E: Data>() -> Effect<R, E, FiberId> {
    descriptor_with(|d: Descriptor| succeed(d.id))
}

// ============================================================================
// Asynchronous callbacks
// ============================================================================

/// Resumes a fiber suspended by [`effect_async`] and friends.
///
/// Only the first completion takes effect; later ones, and completions
/// arriving after the fiber was interrupted, are ignored.
pub struct Callback<R, E, A> {
    resume: Resume,
    _marker: PhantomData<fn(R) -> (E, A)>,
}

impl<R, E, A> Clone for Callback<R, E, A> {
    fn clone(&self) -> Self {
        Self {
            resume: self.resume.clone(),
            _marker: PhantomData,
        }
    }
}

impl<R: Data, E: Data, A: Data> Callback<R, E, A> {
    fn new(resume: Resume) -> Self {
        Self {
            resume,
            _marker: PhantomData,
        }
    }

    /// Continue the suspended fiber with `effect`. Returns `false` if the
    /// fiber was already resumed or interrupted.
    pub fn resume(&self, effect: Effect<R, E, A>) -> bool {
        self.resume.resume(effect.ir)
    }

    /// Continue with a success value.
    pub fn succeed(&self, value: A) -> bool {
        self.resume(succeed(value))
    }

    /// Continue with a typed failure.
    pub fn fail(&self, error: E) -> bool {
        self.resume(fail(error))
    }

    /// Continue with a defect.
    pub fn die(&self, defect: impl Into<Defect>) -> bool {
        self.resume(die(defect))
    }

    /// Continue with an exit value.
    pub fn done(&self, exit: Exit<E, A>) -> bool {
        self.resume(done(exit))
    }

    /// Identifier of the suspended fiber.
    pub fn fiber_id(&self) -> FiberId {
        self.resume.fiber_id()
    }
}

/// Outcome of registering an interruptible asynchronous wait.
pub enum AsyncRegistration<R, E, A> {
    /// The wait is pending; the effect cancels it if the fiber is
    /// interrupted.
    Pending(Effect<R, Never, ()>),
    /// The result is already available.
    Ready(Effect<R, E, A>),
}

/// Suspend until `register`'s callback is invoked.
pub fn effect_async<R: Data, E: Data, A: Data>(
    register: impl Fn(Callback<R, E, A>) + Send + Sync + 'static,
) -> Effect<R, E, A> {
    effect_async_blocking_on(register, Vec::new())
}

/// Like [`effect_async`], recording the fibers waited on for diagnostics.
pub fn effect_async_blocking_on<R: Data, E: Data, A: Data>(
    register: impl Fn(Callback<R, E, A>) + Send + Sync + 'static,
    blocking_on: Vec<FiberId>,
) -> Effect<R, E, A> {
    Effect::from_ir(Arc::new(Instr::Async(
        Arc::new(move |resume: Resume| -> Option<Ir> {
            register(Callback::new(resume));
            None
        }),
        blocking_on,
    )))
}

/// Suspend until `register`'s callback is invoked, unless `register`
/// returns the result synchronously.
pub fn effect_async_maybe<R: Data, E: Data, A: Data>(
    register: impl Fn(Callback<R, E, A>) -> Option<Effect<R, E, A>> + Send + Sync + 'static,
) -> Effect<R, E, A> {
    Effect::from_ir(Arc::new(Instr::Async(
        Arc::new(move |resume: Resume| register(Callback::new(resume)).map(|effect| effect.ir)),
        Vec::new(),
    )))
}

/// Suspend until `register`'s callback is invoked. If the fiber is
/// interrupted while waiting, the canceler returned by `register` runs.
pub fn effect_async_interrupt<R: Data, E: Data, A: Data>(
    register: impl Fn(Callback<R, E, A>) -> AsyncRegistration<R, E, A> + Send + Sync + 'static,
) -> Effect<R, E, A> {
    let register = Arc::new(register);
    suspend(move || {
        let canceler: Arc<parking_lot::Mutex<Option<Effect<R, Never, ()>>>> = Arc::default();
        let slot = canceler.clone();
        let register = register.clone();
        effect_async_maybe(move |callback| match register(callback) {
            AsyncRegistration::Ready(effect) => Some(effect),
            AsyncRegistration::Pending(cancel) => {
                *slot.lock() = Some(cancel);
                None
            }
        })
        .on_interrupt(move |_| canceler.lock().take().unwrap_or_else(unit))
    })
}

// ============================================================================
// Sequencing
// ============================================================================

impl<R: Data, E: Data, A: Data> Effect<R, E, A> {
    /// Continue with the effect `f` builds from the success value.
    pub fn chain<B: Data>(
        self,
        f: impl Fn(A) -> Effect<R, E, B> + Send + Sync + 'static,
    ) -> Effect<R, E, B> {
        Effect::from_ir(Arc::new(Instr::Chain(
            self.ir,
            Arc::new(move |value: Value| f(unerase::<A>(value)).ir),
        )))
    }

    /// Transform the success value.
    pub fn map<B: Data>(self, f: impl Fn(A) -> B + Send + Sync + 'static) -> Effect<R, E, B> {
        self.chain(move |value| succeed(f(value)))
    }

    /// Run `that` after `self`, combining both values with `f`.
    pub fn zip_with<B: Data, C: Data>(
        self,
        that: Effect<R, E, B>,
        f: impl Fn(A, B) -> C + Send + Sync + 'static,
    ) -> Effect<R, E, C> {
        let f = Arc::new(f);
        self.chain(move |a: A| {
            let f = f.clone();
            that.clone().map(move |b| f(a.clone(), b))
        })
    }

    /// Run `that` after `self`, keeping both values.
    pub fn zip<B: Data>(self, that: Effect<R, E, B>) -> Effect<R, E, (A, B)> {
        self.zip_with(that, |a, b| (a, b))
    }

    /// Run `that` after `self`, keeping the value of `that`.
    pub fn zip_right<B: Data>(self, that: Effect<R, E, B>) -> Effect<R, E, B> {
        self.chain(move |_| that.clone())
    }

    /// Run `that` after `self`, keeping the value of `self`.
    pub fn zip_left<B: Data>(self, that: Effect<R, E, B>) -> Effect<R, E, A> {
        self.chain(move |a: A| that.clone().as_(a))
    }

    /// Replace the success value.
    pub fn as_<B: Data>(self, value: B) -> Effect<R, E, B> {
        self.map(move |_| value.clone())
    }

    /// Discard the success value.
    pub fn as_unit(self) -> Effect<R, E, ()> {
        self.as_(())
    }

    /// Run an effect on the success value, keeping the original value.
    pub fn tap<B: Data>(self, f: impl Fn(A) -> Effect<R, E, B> + Send + Sync + 'static) -> Effect<R, E, A> {
        self.chain(move |a: A| f(a.clone()).as_(a))
    }

    /// Repeat forever; only a failure or interruption ends it.
    pub fn forever(self) -> Effect<R, E, Never> {
        let again = self.clone();
        self.chain(move |_| again.clone().forever())
    }

    /// Run `self` after sleeping for `duration`.
    pub fn delay(self, duration: std::time::Duration) -> Effect<R, E, A> {
        sleep::<R, E>(duration).zip_right(self)
    }

    /// Run with `environment`, discharging the requirement.
    pub fn provide<R0: Data>(self, environment: R) -> Effect<R0, E, A> {
        Effect::from_ir(Arc::new(Instr::Provide(self.ir, erase(environment))))
    }

    /// Run with an environment derived from the outer one.
    pub fn provide_some<R0: Data>(self, f: impl Fn(R0) -> R + Send + Sync + 'static) -> Effect<R0, E, A> {
        let inner = self.ir;
        Effect::from_ir(Arc::new(Instr::Read(Arc::new(move |outer: Value| {
            let environment = f(unerase::<R0>(outer));
            Arc::new(Instr::Provide(inner.clone(), erase(environment)))
        }))))
    }
}

impl<E: Data, A: Data> Effect<(), E, A> {
    /// Use an environment-free effect where some environment `R` is
    /// available.
    pub fn widen<R: Data>(self) -> Effect<R, E, A> {
        Effect::from_ir(Arc::new(Instr::Provide(self.ir, erase(()))))
    }
}

impl<R: Data, A: Data> Effect<R, Never, A> {
    /// Use an infallible effect where a failure type `E` is expected.
    pub fn widen_error<E: Data>(self) -> Effect<R, E, A> {
        Effect::from_ir(self.ir)
    }
}

impl<R: Data, E: Data, A: Data> Effect<R, E, Effect<R, E, A>> {
    /// Run the effect produced by this one.
    pub fn flatten(self) -> Effect<R, E, A> {
        self.chain(|inner| inner)
    }
}

// ============================================================================
// Tests
// ============================================================================
