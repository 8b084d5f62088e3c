//! # Instruction Set
//!
//! The closed set of primitive instructions an effect description is built
//! from. Typed effects are thin wrappers over a shared, immutable
//! instruction tree; values cross instruction boundaries type-erased.
//!
//! ## Design
//!
//! - Every instruction is immutable and shared through `Arc`, so an effect
//!   can be cloned cheaply and run any number of times.
//! - Continuations are `Fn` closures producing the next instruction. They
//!   are only ever invoked by the interpreter, one at a time, so no host
//!   recursion builds up while a long chain runs.
//! - Erased values carry `Arc<dyn Any + Send + Sync>`; the typed layer
//!   guarantees the downcasts line up.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::cause::Cause;
use crate::effect::Data;
use crate::executor::Resume;
use crate::exit::Exit;
use crate::fiber::{InterruptStatus, RuntimeFiber};
use crate::fiber_ref::FiberRefCell;
use crate::scope::Scope;
use crate::supervisor::Supervisor;

/// A type-erased value flowing between instructions.
pub(crate) type Value = Arc<dyn Any + Send + Sync>;

/// A shared instruction.
pub(crate) type Ir = Arc<Instr>;

/// Continuation for a success value.
pub(crate) type Cont = Arc<dyn Fn(Value) -> Ir + Send + Sync>;

/// Continuation for a failure cause.
pub(crate) type CauseCont = Arc<dyn Fn(Cause<Value>) -> Ir + Send + Sync>;

/// Registration of an asynchronous wait. Returning `Some` completes the
/// wait synchronously.
pub(crate) type Register = Arc<dyn Fn(Resume) -> Option<Ir> + Send + Sync>;

/// Handler invoked with the winner's exit and the loser's handle.
pub(crate) type RaceHandler = Arc<dyn Fn(Exit<Value, Value>, RuntimeFiber) -> Ir + Send + Sync>;

/// Lazily built instruction.
pub(crate) type Thunk = Arc<dyn Fn() -> Ir + Send + Sync>;

pub(crate) fn erase<T: Data>(value: T) -> Value {
    Arc::new(value)
}

/// Recover a typed value. The typed layer guarantees the type matches; a
/// mismatch is a bug and panics, which the interpreter reports as a defect.
pub(crate) fn unerase<T: Data>(value: Value) -> T {
    match value.downcast::<T>() {
        Ok(typed) => Arc::try_unwrap(typed).unwrap_or_else(|shared| (*shared).clone()),
        Err(_) => panic!(
            "erased value is not of type {}",
            std::any::type_name::<T>()
        ),
    }
}

/// Both sides of a race.
pub(crate) struct Race {
    pub(crate) left: Ir,
    pub(crate) right: Ir,
    pub(crate) left_wins: RaceHandler,
    pub(crate) right_wins: RaceHandler,
    pub(crate) scope: Option<Scope>,
}

/// A primitive instruction.
pub(crate) enum Instr {
    /// Produce a value.
    Succeed(Value),
    /// Fail with a cause.
    Fail(Cause<Value>),
    /// Run a side-effecting closure that cannot fail.
    Total(Arc<dyn Fn() -> Value + Send + Sync>),
    /// Run a closure that may fail; the error is converted by the mapper.
    Partial(
        Arc<dyn Fn() -> Result<Value, Value> + Send + Sync>,
        Arc<dyn Fn(Value) -> Value + Send + Sync>,
    ),
    /// Run the first instruction and feed its value to the continuation.
    Chain(Ir, Cont),
    /// Run the instruction and route the outcome to one of two handlers.
    Fold(Ir, CauseCont, Cont),
    /// Suspend until a callback resumes the fiber.
    Async(Register, Vec<crate::fiber::FiberId>),
    /// Start a child fiber, optionally in an explicit scope.
    Fork(Ir, Option<Scope>),
    /// Race two child fibers.
    Race(Box<Race>),
    /// Run the instruction with a given interrupt status.
    SetInterruptStatus(Ir, InterruptStatus),
    /// Read the current interrupt status.
    GetInterruptStatus(Arc<dyn Fn(InterruptStatus) -> Ir + Send + Sync>),
    /// Read the fiber descriptor.
    Descriptor(Arc<dyn Fn(crate::fiber::Descriptor) -> Ir + Send + Sync>),
    /// Read the current environment.
    Read(Cont),
    /// Run the instruction with a given environment.
    Provide(Ir, Value),
    /// Build the next instruction lazily.
    Suspend(Thunk),
    /// Run the instruction with an additional supervisor.
    Supervise(Ir, Supervisor),
    /// Read the scope children are forked into.
    GetForkScope(Arc<dyn Fn(Scope) -> Ir + Send + Sync>),
    /// Run the instruction with children forked into the given scope.
    OverrideForkScope(Ir, Option<Scope>),
    /// Allocate a fiber ref.
    NewFiberRef(Arc<FiberRefCell>),
    /// Atomically update a fiber ref; yields the first element.
    ModifyFiberRef(
        Arc<FiberRefCell>,
        Arc<dyn Fn(Value) -> (Value, Value) + Send + Sync>,
    ),
    /// Let other fibers run.
    Yield,
}

impl Instr {
    /// Short name, for diagnostics.
    pub(crate) fn tag(&self) -> &'static str {
        match self {
            Instr::Succeed(_) => "Succeed",
            Instr::Fail(_) => "Fail",
            Instr::Total(_) => "Total",
            Instr::Partial(..) => "Partial",
            Instr::Chain(..) => "Chain",
            Instr::Fold(..) => "Fold",
            Instr::Async(..) => "Async",
            Instr::Fork(..) => "Fork",
            Instr::Race(_) => "Race",
            Instr::SetInterruptStatus(..) => "SetInterruptStatus",
            Instr::GetInterruptStatus(_) => "GetInterruptStatus",
            Instr::Descriptor(_) => "Descriptor",
            Instr::Read(_) => "Read",
            Instr::Provide(..) => "Provide",
            Instr::Suspend(_) => "Suspend",
            Instr::Supervise(..) => "Supervise",
            Instr::GetForkScope(_) => "GetForkScope",
            Instr::OverrideForkScope(..) => "OverrideForkScope",
            Instr::NewFiberRef(_) => "NewFiberRef",
            Instr::ModifyFiberRef(..) => "ModifyFiberRef",
            Instr::Yield => "Yield",
        }
    }
}

/// Placeholder left behind when a nested instruction is detached.
fn detached() -> Ir {
    static DETACHED: OnceLock<Ir> = OnceLock::new();
    DETACHED.get_or_init(|| Arc::new(Instr::Yield)).clone()
}

impl Instr {
    /// Move directly nested instructions into `out`.
    fn detach_children(&mut self, out: &mut Vec<Ir>) {
        let mut take = |slot: &mut Ir| {
            if !matches!(**slot, Instr::Yield) {
                out.push(std::mem::replace(slot, detached()));
            }
        };
        match self {
            Instr::Chain(ir, _)
            | Instr::Fold(ir, ..)
            | Instr::Fork(ir, _)
            | Instr::SetInterruptStatus(ir, _)
            | Instr::Provide(ir, _)
            | Instr::Supervise(ir, _)
            | Instr::OverrideForkScope(ir, _) => take(ir),
            Instr::Race(race) => {
                take(&mut race.left);
                take(&mut race.right);
            }
            _ => {}
        }
    }
}

// Left-nested chains can be arbitrarily deep; release them iteratively.
impl Drop for Instr {
    fn drop(&mut self) {
        let mut pending = Vec::new();
        self.detach_children(&mut pending);
        while let Some(ir) = pending.pop() {
            if let Ok(mut instr) = Arc::try_unwrap(ir) {
                instr.detach_children(&mut pending);
            }
        }
    }
}

impl fmt::Debug for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

// Small constructors shared by the interpreter and the typed layer.

pub(crate) fn succeed_ir(value: Value) -> Ir {
    Arc::new(Instr::Succeed(value))
}

pub(crate) fn unit_ir() -> Ir {
    succeed_ir(erase(()))
}

pub(crate) fn fail_ir(cause: Cause<Value>) -> Ir {
    Arc::new(Instr::Fail(cause))
}

pub(crate) fn exit_ir(exit: Exit<Value, Value>) -> Ir {
    match exit {
        Exit::Success(value) => succeed_ir(value),
        Exit::Failure(cause) => fail_ir(cause),
    }
}

pub(crate) fn suspend_ir(thunk: impl Fn() -> Ir + Send + Sync + 'static) -> Ir {
    Arc::new(Instr::Suspend(Arc::new(thunk)))
}

pub(crate) fn chain_ir(first: Ir, next: impl Fn(Value) -> Ir + Send + Sync + 'static) -> Ir {
    Arc::new(Instr::Chain(first, Arc::new(next)))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_erase_round_trip() {
        let value = erase(String::from("hello"));
        let back: String = unerase(value);
        assert_eq!(back, "hello");
    }

    #[test]
    fn test_unerase_shared_value_clones() {
        let value = erase(vec![1, 2, 3]);
        let keep = value.clone();
        let back: Vec<i32> = unerase(value);
        assert_eq!(back, vec![1, 2, 3]);
        assert!(keep.downcast_ref::<Vec<i32>>().is_some());
    }

    #[test]
    #[should_panic(expected = "erased value is not of type")]
    fn test_unerase_mismatch_panics() {
        let _: u8 = unerase(erase(1u64));
    }

    #[test]
    fn test_exit_ir_tags() {
        assert_eq!(exit_ir(Exit::Success(erase(1))).tag(), "Succeed");
        assert_eq!(exit_ir(Exit::Failure(Cause::die("x"))).tag(), "Fail");
    }
}
