//! # Fiber References
//!
//! Fiber-local variables whose values propagate along the fork/join tree.
//!
//! Each fiber holds its own map from ref identity to value. When a fiber
//! forks, the child receives a copy of the map with every value passed
//! through the ref's `on_fork` function. When a parent joins a child, each
//! value the child holds is merged into the parent with `on_join`.
//!
//! ## Example
//!
//! ```rust,ignore
//! use strand_runtime::{FiberRef, effect::UIO};
//!
//! let program: UIO<i32> = FiberRef::make_with(0, |v| *v, |parent, child| parent + child)
//!     .chain(|counter| {
//!         let child = counter.update(|n| n + 5);
//!         child.fork().chain(|fiber| fiber.join()).zip_right(counter.get())
//!     });
//! ```

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::cause::Defect;
use crate::effect::{self, Data, Effect, Never, UIO};
use crate::instruction::{erase, unerase, Instr, Value};

type ForkFn = Arc<dyn Fn(&Value) -> Value + Send + Sync>;
type JoinFn = Arc<dyn Fn(&Value, &Value) -> Value + Send + Sync>;

/// Erased identity and behavior of a fiber ref.
pub(crate) struct FiberRefCell {
    id: u64,
    initial: Value,
    on_fork: ForkFn,
    on_join: JoinFn,
}

static NEXT_FIBER_REF_ID: AtomicU64 = AtomicU64::new(1);

impl FiberRefCell {
    pub(crate) fn new(initial: Value, on_fork: ForkFn, on_join: JoinFn) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_FIBER_REF_ID.fetch_add(1, Ordering::Relaxed),
            initial,
            on_fork,
            on_join,
        })
    }

    pub(crate) fn initial(&self) -> Value {
        self.initial.clone()
    }
}

/// Per-fiber values of every ref the fiber has touched.
#[derive(Clone, Default)]
pub(crate) struct FiberRefs {
    values: HashMap<u64, (Arc<FiberRefCell>, Value)>,
}

impl FiberRefs {
    pub(crate) fn get(&self, cell: &Arc<FiberRefCell>) -> Value {
        self.values
            .get(&cell.id)
            .map(|(_, value)| value.clone())
            .unwrap_or_else(|| cell.initial())
    }

    pub(crate) fn set(&mut self, cell: &Arc<FiberRefCell>, value: Value) {
        self.values.insert(cell.id, (cell.clone(), value));
    }

    /// Values for a new child, passed through each ref's fork function.
    pub(crate) fn fork(&self) -> Result<FiberRefs, Defect> {
        let mut values = HashMap::with_capacity(self.values.len());
        for (id, (cell, value)) in &self.values {
            let forked = crate::executor::guard_call(|| (cell.on_fork)(value))?;
            values.insert(*id, (cell.clone(), forked));
        }
        Ok(FiberRefs { values })
    }

    /// Entries held, for merging into another fiber.
    pub(crate) fn entries(&self) -> Vec<(Arc<FiberRefCell>, Value)> {
        self.values.values().cloned().collect()
    }
}

/// Merge function of `cell`, applied as `join(parent, child)`.
pub(crate) fn join_value(cell: &FiberRefCell, parent: &Value, child: &Value) -> Value {
    (cell.on_join)(parent, child)
}

// ============================================================================
// Typed API
// ============================================================================

/// A fiber-local variable holding an `A`.
pub struct FiberRef<A> {
    cell: Arc<FiberRefCell>,
    _marker: PhantomData<fn() -> A>,
}

impl<A> Clone for FiberRef<A> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A> fmt::Debug for FiberRef<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FiberRef").field(&self.cell.id).finish()
    }
}

impl<A: Data> FiberRef<A> {
    /// Allocate a ref. Children start with the parent's value; joining
    /// keeps the child's value.
    pub fn make(initial: A) -> UIO<FiberRef<A>> {
        Self::make_with(initial, |value: &A| value.clone(), |_: &A, child: &A| child.clone())
    }

    /// Allocate a ref with custom fork and join behavior.
    pub fn make_with(
        initial: A,
        on_fork: impl Fn(&A) -> A + Send + Sync + 'static,
        on_join: impl Fn(&A, &A) -> A + Send + Sync + 'static,
    ) -> UIO<FiberRef<A>> {
        let on_fork = Arc::new(on_fork);
        let on_join = Arc::new(on_join);
        effect::suspend(move || {
            let on_fork = on_fork.clone();
            let on_join = on_join.clone();
            let cell = FiberRefCell::new(
                erase(initial.clone()),
                Arc::new(move |value: &Value| erase(on_fork(&typed::<A>(value)))),
                Arc::new(move |parent: &Value, child: &Value| {
                    erase(on_join(&typed::<A>(parent), &typed::<A>(child)))
                }),
            );
            Effect::<(), Never, Arc<FiberRefCell>>::from_ir(Arc::new(Instr::NewFiberRef(cell)))
                .map(FiberRef::from_cell)
        })
    }

    fn from_cell(cell: Arc<FiberRefCell>) -> Self {
        Self {
            cell,
            _marker: PhantomData,
        }
    }

    /// Atomically update the value and return a result computed from it.
    pub fn modify<B: Data>(&self, f: impl Fn(A) -> (B, A) + Send + Sync + 'static) -> UIO<B> {
        Effect::from_ir(Arc::new(Instr::ModifyFiberRef(
            self.cell.clone(),
            Arc::new(move |value: Value| {
                let (result, next) = f(unerase::<A>(value));
                (erase(result), erase(next))
            }),
        )))
    }

    /// Read the current value.
    pub fn get(&self) -> UIO<A> {
        self.modify(|value: A| (value.clone(), value))
    }

    /// Replace the current value.
    pub fn set(&self, value: A) -> UIO<()> {
        self.modify(move |_| ((), value.clone()))
    }

    /// Replace the value, returning the previous one.
    pub fn get_and_set(&self, value: A) -> UIO<A> {
        self.modify(move |old| (old, value.clone()))
    }

    /// Apply `f` to the value.
    pub fn update(&self, f: impl Fn(A) -> A + Send + Sync + 'static) -> UIO<()> {
        self.modify(move |value| ((), f(value)))
    }

    /// Apply `f` to the value, returning the previous one.
    pub fn get_and_update(&self, f: impl Fn(A) -> A + Send + Sync + 'static) -> UIO<A> {
        self.modify(move |value: A| (value.clone(), f(value)))
    }

    /// Apply `f` to the value, returning the new one.
    pub fn update_and_get(&self, f: impl Fn(A) -> A + Send + Sync + 'static) -> UIO<A> {
        self.modify(move |value| {
            let next = f(value);
            (next.clone(), next)
        })
    }

    /// Run `effect` with the ref temporarily set to `value`, restoring the
    /// previous value afterwards whatever the outcome.
    pub fn locally<R: Data, E: Data, B: Data>(&self, value: A, effect: Effect<R, E, B>) -> Effect<R, E, B> {
        let this = self.clone();
        self.get().widen().widen_error::<E>().chain(move |old: A| {
            this.set(value.clone())
                .widen()
                .widen_error::<E>()
                .zip_right(effect.clone().ensuring(this.set(old).widen()))
        })
    }
}

fn typed<A: Data>(value: &Value) -> A {
    unerase::<A>(value.clone())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn counter_cell() -> Arc<FiberRefCell> {
        FiberRefCell::new(
            erase(0i32),
            Arc::new(|value: &Value| erase(unerase::<i32>(value.clone()) * 10)),
            Arc::new(|parent: &Value, child: &Value| {
                erase(unerase::<i32>(parent.clone()) + unerase::<i32>(child.clone()))
            }),
        )
    }

    #[test]
    fn test_get_defaults_to_initial() {
        let refs = FiberRefs::default();
        let cell = counter_cell();
        assert_eq!(unerase::<i32>(refs.get(&cell)), 0);
    }

    #[test]
    fn test_fork_applies_on_fork() {
        let mut refs = FiberRefs::default();
        let cell = counter_cell();
        refs.set(&cell, erase(3i32));
        let child = refs.fork().unwrap();
        assert_eq!(unerase::<i32>(child.get(&cell)), 30);
        assert_eq!(unerase::<i32>(refs.get(&cell)), 3);
    }

    #[test]
    fn test_join_value_merges() {
        let cell = counter_cell();
        let merged = join_value(&cell, &erase(2i32), &erase(5i32));
        assert_eq!(unerase::<i32>(merged), 7);
    }

    #[test]
    fn test_fork_reports_panics_as_defects() {
        let mut refs = FiberRefs::default();
        let cell = FiberRefCell::new(
            erase(0i32),
            Arc::new(|_: &Value| panic!("fork hook failed")),
            Arc::new(|_: &Value, child: &Value| child.clone()),
        );
        refs.set(&cell, erase(1i32));
        let defect = refs.fork().err().unwrap();
        assert_eq!(defect.message(), "fork hook failed");
    }
}
