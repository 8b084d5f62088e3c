//! # Scopes
//!
//! A scope is a container of finalizers that run when it closes. Every
//! fiber owns a scope; children forked by the fiber register a finalizer in
//! it that interrupts them, so closing the parent's scope tears the whole
//! subtree down. Scopes form a tree through parent links.
//!
//! The global scope never closes. Fibers forked into it are daemons.
//!
//! ## States
//!
//! ```text
//! Open { finalizers } ──close(exit)──▶ Closed(exit)
//! ```
//!
//! Registering a finalizer in a closed scope is refused; the caller
//! receives the scope's exit value instead.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::cause::Cause;
use crate::effect::{self, Data, Effect, UIO};
use crate::exit::Exit;
use crate::fiber::erased_exit;
use crate::instruction::{fail_ir, unit_ir, Instr, Ir, Value};

/// A finalizer receives the exit the scope closed with.
pub(crate) type Finalizer = Box<dyn FnOnce(&Exit<Value, Value>) -> Ir + Send>;

/// Handle to a registered finalizer, used to deregister it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeKey(u64);

enum ScopeState {
    Open {
        next_key: u64,
        finalizers: BTreeMap<u64, Finalizer>,
    },
    Closed(Exit<Value, Value>),
}

struct ScopeNode {
    id: u64,
    parent: Option<Scope>,
    global: bool,
    state: Mutex<ScopeState>,
}

/// A node in the scope tree.
#[derive(Clone)]
pub struct Scope {
    node: Arc<ScopeNode>,
}

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

impl Scope {
    fn with_parent(parent: Option<Scope>, global: bool) -> Self {
        Self {
            node: Arc::new(ScopeNode {
                id: NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed),
                parent,
                global,
                state: Mutex::new(ScopeState::Open {
                    next_key: 0,
                    finalizers: BTreeMap::new(),
                }),
            }),
        }
    }

    /// The process-wide scope that never closes.
    pub fn global() -> Scope {
        static GLOBAL: OnceLock<Scope> = OnceLock::new();
        GLOBAL.get_or_init(|| Scope::with_parent(None, true)).clone()
    }

    /// A fresh, detached, open scope.
    pub fn new() -> Scope {
        Scope::with_parent(None, false)
    }

    /// A fresh open scope whose parent is `parent`.
    pub fn child_of(parent: &Scope) -> Scope {
        Scope::with_parent(Some(parent.clone()), false)
    }

    /// Unique identifier of this scope.
    pub fn id(&self) -> u64 {
        self.node.id
    }

    /// Parent scope, if any.
    pub fn parent(&self) -> Option<&Scope> {
        self.node.parent.as_ref()
    }

    /// Whether this is the global scope.
    pub fn is_global(&self) -> bool {
        self.node.global
    }

    /// Whether the scope has closed.
    pub fn is_closed(&self) -> bool {
        matches!(*self.node.state.lock(), ScopeState::Closed(_))
    }

    /// Number of finalizers currently registered.
    pub fn finalizer_count(&self) -> usize {
        match &*self.node.state.lock() {
            ScopeState::Open { finalizers, .. } => finalizers.len(),
            ScopeState::Closed(_) => 0,
        }
    }

    /// Register a finalizer. Fails with the closing exit if the scope has
    /// already closed. The global scope accepts and discards finalizers.
    pub(crate) fn register(&self, finalizer: Finalizer) -> Result<ScopeKey, Exit<Value, Value>> {
        if self.node.global {
            return Ok(ScopeKey(u64::MAX));
        }
        let mut state = self.node.state.lock();
        match &mut *state {
            ScopeState::Open {
                next_key,
                finalizers,
            } => {
                let key = *next_key;
                *next_key += 1;
                finalizers.insert(key, finalizer);
                Ok(ScopeKey(key))
            }
            ScopeState::Closed(exit) => Err(exit.clone()),
        }
    }

    /// Deregister a finalizer. Returns `false` if it was not present.
    pub fn remove_finalizer(&self, key: ScopeKey) -> bool {
        match &mut *self.node.state.lock() {
            ScopeState::Open { finalizers, .. } => finalizers.remove(&key.0).is_some(),
            ScopeState::Closed(_) => false,
        }
    }

    /// Register an effect to run when the scope closes. Returns `None` if
    /// the scope is already closed.
    pub fn add_finalizer(&self, finalizer: UIO<()>) -> Option<ScopeKey> {
        let ir = finalizer.ir;
        self.register(Box::new(move |_: &Exit<Value, Value>| ir)).ok()
    }

    /// Close the scope with `exit`, producing the instruction that runs all
    /// finalizers in reverse registration order. The global scope never
    /// closes and reports [`Closing::Empty`].
    pub(crate) fn close_ir(&self, exit: &Exit<Value, Value>) -> Closing {
        if self.node.global {
            return Closing::Empty;
        }
        let finalizers = {
            let mut state = self.node.state.lock();
            match std::mem::replace(&mut *state, ScopeState::Closed(exit.clone())) {
                ScopeState::Open { finalizers, .. } => finalizers,
                closed @ ScopeState::Closed(_) => {
                    *state = closed;
                    return Closing::AlreadyClosed;
                }
            }
        };
        if finalizers.is_empty() {
            return Closing::Empty;
        }
        let irs: Vec<Ir> = finalizers
            .into_values()
            .rev()
            .map(|finalizer| finalizer(exit))
            .collect();
        Closing::Finalizers(run_all(Arc::new(irs), 0, Cause::Empty))
    }

    /// Close the scope with `exit`, running its finalizers. Succeeds with
    /// `false` if the scope was already closed.
    pub fn close<R: Data, E: Data, A: Data>(&self, exit: Exit<E, A>) -> Effect<R, effect::Never, bool> {
        let scope = self.clone();
        let exit = erased_exit(exit);
        effect::suspend(move || match scope.close_ir(&exit) {
            Closing::AlreadyClosed => effect::succeed(false),
            Closing::Empty => effect::succeed(true),
            Closing::Finalizers(ir) => Effect::<R, effect::Never, ()>::from_ir(ir)
                .catch_all_cause(|_| effect::unit())
                .as_(true),
        })
    }
}

/// Outcome of closing a scope.
pub(crate) enum Closing {
    /// Another close got there first.
    AlreadyClosed,
    /// Closed with no finalizers registered.
    Empty,
    /// Closed; the instruction runs the finalizers.
    Finalizers(Ir),
}

impl Closing {
    pub(crate) fn finalizers(self) -> Option<Ir> {
        match self {
            Closing::Finalizers(ir) => Some(ir),
            Closing::AlreadyClosed | Closing::Empty => None,
        }
    }
}

impl Default for Scope {
    fn default() -> Self {
        Scope::new()
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.node.id)
            .field("global", &self.node.global)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PartialEq for Scope {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }
}

/// Run every finalizer in order, collecting failures sequentially. Fails
/// with the accumulated cause if any finalizer failed.
fn run_all(finalizers: Arc<Vec<Ir>>, index: usize, acc: Cause<Value>) -> Ir {
    match finalizers.get(index) {
        None if acc.is_empty() => unit_ir(),
        None => fail_ir(acc),
        Some(finalizer) => {
            let on_failure = (finalizers.clone(), acc.clone());
            let on_success = (finalizers.clone(), acc);
            Arc::new(Instr::Fold(
                finalizer.clone(),
                Arc::new(move |cause: Cause<Value>| {
                    run_all(on_failure.0.clone(), index + 1, on_failure.1.clone().then(cause))
                }),
                Arc::new(move |_: Value| run_all(on_success.0.clone(), index + 1, on_success.1.clone())),
            ))
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
