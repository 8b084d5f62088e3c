//! # Fiber Executor
//!
//! The trampolined interpreter that runs one fiber's instructions.
//!
//! ## Design
//!
//! The interpreter keeps the continuation on an explicit heap stack of
//! frames, so deeply nested `chain`s never grow the host stack. It runs in
//! slices: after `max_ops` instructions the fiber is re-queued at the back
//! of the global queue so other fibers get a turn.
//!
//! ```text
//!        ┌────────────── run loop ───────────────┐
//!        │ interrupt pending & interruptible? ──▶ Fail(interrupted)
//!        │ budget exhausted? ────────────────────▶ re-queue, return
//!        │ step(instruction)                      │
//!        │   Succeed ─▶ pop frames ─▶ continuation│
//!        │   Fail    ─▶ unwind to a Fold handler  │
//!        │   Async   ─▶ suspend, return           │
//!        └────────────────────────────────────────┘
//! ```
//!
//! ## Interruption
//!
//! Interrupt requests are recorded in the fiber state and an atomic flag.
//! They are delivered at instruction boundaries while the current region is
//! interruptible. A fiber suspended interruptibly is woken directly by the
//! interrupter. While unwinding from an interruption, recovery handlers
//! are skipped and typed failures are stripped; only finalizers run.
//!
//! ## Suspension
//!
//! Every asynchronous wait gets a fresh epoch. A resume callback only takes
//! effect if the fiber is still suspended in that same epoch, so late or
//! duplicate callbacks are ignored.

use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::cause::{Cause, Defect};
use crate::exit::Exit;
use crate::fiber::{Descriptor, FiberId, FiberStatus, InterruptStatus, RuntimeFiber};
use crate::fiber_ref::{join_value, FiberRefs};
use crate::instruction::{
    chain_ir, erase, exit_ir, fail_ir, succeed_ir, suspend_ir, unit_ir, CauseCont, Cont, Instr, Ir,
    Race, RaceHandler, Register, Value,
};
use crate::runtime::RuntimeInner;
use crate::scope::{Scope, ScopeKey};
use crate::supervisor::Supervisor;

/// Callback run once a fiber finishes.
pub(crate) type Observer = Box<dyn FnOnce(Exit<Value, Value>) + Send>;

/// Run `f`, turning a panic into a defect.
pub(crate) fn guard_call<T>(f: impl FnOnce() -> T) -> Result<T, Defect> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(Defect::from_panic)
}

fn guarded(f: impl FnOnce() -> Ir) -> Ir {
    guard_call(f).unwrap_or_else(|defect| fail_ir(Cause::Die(defect)))
}

// ============================================================================
// Fiber state
// ============================================================================

enum Frame {
    Apply(Cont),
    Fold(CauseCont, Cont),
    RestoreInterrupt,
    RestoreEnvironment,
    RestoreSupervisor,
    RestoreForkScope,
}

struct FiberState {
    status: FiberStatus,
    epoch: u64,
    interruptors: BTreeSet<FiberId>,
    observers: Vec<Observer>,
    exit: Option<Exit<Value, Value>>,
}

/// Everything a new fiber inherits from whoever starts it.
pub(crate) struct FiberSeed {
    pub(crate) environment: Value,
    pub(crate) interrupt_status: InterruptStatus,
    pub(crate) reporting_to: Supervisor,
    pub(crate) fiber_refs: FiberRefs,
    pub(crate) parent_scope: Scope,
}

impl FiberSeed {
    /// Seed for a fiber started by the runtime rather than by another fiber.
    pub(crate) fn root() -> Self {
        Self {
            environment: erase(()),
            interrupt_status: InterruptStatus::Interruptible,
            reporting_to: Supervisor::none(),
            fiber_refs: FiberRefs::default(),
            parent_scope: Scope::global(),
        }
    }
}

/// Shared part of a fiber, referenced by handles, callbacks and the
/// scheduler.
pub(crate) struct FiberInner {
    pub(crate) id: FiberId,
    runtime: Arc<RuntimeInner>,
    state: Mutex<FiberState>,
    interrupt_requested: AtomicBool,
    /// Ref values, readable by other fibers while this one runs.
    refs: Mutex<FiberRefs>,
    context: Mutex<FiberContext>,
}

/// Interpreter state; only touched by the slice currently running the fiber.
struct FiberContext {
    stack: Vec<Frame>,
    environments: Vec<Value>,
    interrupt_status: Vec<InterruptStatus>,
    supervisors: Vec<Supervisor>,
    reporting_to: Supervisor,
    fork_scopes: Vec<Option<Scope>>,
    open_scope: Scope,
    parent_link: Option<(Scope, ScopeKey)>,
    interrupting: bool,
    max_ops: usize,
}

/// Resumes a suspended fiber. Only the first resume for the current
/// suspension has any effect.
#[derive(Clone)]
pub(crate) struct Resume {
    fiber: Arc<FiberInner>,
    epoch: u64,
}

impl Resume {
    pub(crate) fn resume(&self, next: Ir) -> bool {
        if self.fiber.exit_async(self.epoch) {
            self.fiber.evaluate_later(next);
            true
        } else {
            false
        }
    }

    pub(crate) fn fiber_id(&self) -> FiberId {
        self.fiber.id
    }
}

impl FiberInner {
    pub(crate) fn new(runtime: Arc<RuntimeInner>, seed: FiberSeed) -> Arc<Self> {
        let max_ops = runtime.config.fiber.max_ops.max(1);
        Arc::new(Self {
            id: crate::fiber::next_fiber_id(),
            runtime,
            state: Mutex::new(FiberState {
                status: FiberStatus::Running,
                epoch: 0,
                interruptors: BTreeSet::new(),
                observers: Vec::new(),
                exit: None,
            }),
            interrupt_requested: AtomicBool::new(false),
            refs: Mutex::new(seed.fiber_refs),
            context: Mutex::new(FiberContext {
                stack: Vec::new(),
                environments: vec![seed.environment],
                interrupt_status: vec![seed.interrupt_status],
                supervisors: Vec::new(),
                reporting_to: seed.reporting_to,
                fork_scopes: Vec::new(),
                open_scope: Scope::child_of(&seed.parent_scope),
                parent_link: None,
                interrupting: false,
                max_ops,
            }),
        })
    }

    /// Run `start` on the current thread until the fiber suspends, yields
    /// or finishes.
    pub(crate) fn evaluate_now(self: &Arc<Self>, start: Ir) {
        let mut context = self.context.lock();
        context.run(self, start);
    }

    /// Queue `next` on the scheduler.
    pub(crate) fn evaluate_later(self: &Arc<Self>, next: Ir) {
        let fiber = self.clone();
        self.runtime
            .scheduler
            .submit(Box::new(move || fiber.evaluate_now(next)));
    }

    /// Queue `next` behind all globally queued work.
    fn yield_later(self: &Arc<Self>, next: Ir) {
        let fiber = self.clone();
        self.runtime
            .scheduler
            .submit_global(Box::new(move || fiber.evaluate_now(next)));
    }

    pub(crate) fn status(&self) -> FiberStatus {
        self.state.lock().status.clone()
    }

    pub(crate) fn poll_exit(&self) -> Option<Exit<Value, Value>> {
        self.state.lock().exit.clone()
    }

    fn interruptors(&self) -> BTreeSet<FiberId> {
        self.state.lock().interruptors.clone()
    }

    /// Current values of the fiber's refs, final once it is done.
    pub(crate) fn refs_snapshot(&self) -> FiberRefs {
        self.refs.lock().clone()
    }

    /// Run `observer` with the exit value once the fiber is done; right
    /// away if it already is.
    pub(crate) fn observe(&self, observer: Observer) {
        let mut state = self.state.lock();
        if let Some(exit) = state.exit.clone() {
            drop(state);
            observer(exit);
        } else {
            state.observers.push(observer);
        }
    }

    /// Record an interrupt request from `by`. A fiber suspended
    /// interruptibly is woken to process it.
    pub(crate) fn signal_interrupt(self: &Arc<Self>, by: FiberId) {
        let wake = {
            let mut state = self.state.lock();
            if state.status.is_done() {
                return;
            }
            state.interruptors.insert(by);
            self.interrupt_requested.store(true, Ordering::Release);
            match state.status {
                FiberStatus::Suspended {
                    interruptible: true,
                    ..
                } => {
                    state.status = FiberStatus::Running;
                    true
                }
                _ => false,
            }
        };
        trace!(fiber = %self.id, by = %by, wake, "interrupt requested");
        if wake {
            self.evaluate_later(fail_ir(Cause::interrupt(by)));
        }
    }

    fn enter_async(&self, interruptible: bool, blocking_on: Vec<FiberId>) -> u64 {
        let mut state = self.state.lock();
        state.epoch += 1;
        state.status = FiberStatus::Suspended {
            interruptible,
            blocking_on,
        };
        state.epoch
    }

    fn exit_async(&self, epoch: u64) -> bool {
        let mut state = self.state.lock();
        if state.epoch == epoch && matches!(state.status, FiberStatus::Suspended { .. }) {
            state.status = FiberStatus::Running;
            true
        } else {
            false
        }
    }

    fn complete(self: &Arc<Self>, context: &mut FiberContext, exit: Exit<Value, Value>) {
        let observers = {
            let mut state = self.state.lock();
            state.status = FiberStatus::Done;
            state.exit = Some(exit.clone());
            std::mem::take(&mut state.observers)
        };

        if let Some((scope, key)) = context.parent_link.take() {
            scope.remove_finalizer(key);
        }
        if guard_call(|| context.reporting_to.notify_end(self.id)).is_err() {
            error!(fiber = %self.id, "supervisor panicked in on_end");
        }
        self.runtime.unregister_root(self.id);
        self.report(&exit);
        context.release();

        for observer in observers {
            let exit = exit.clone();
            if guard_call(move || observer(exit)).is_err() {
                error!(fiber = %self.id, "exit observer panicked");
            }
        }
    }

    fn report(&self, exit: &Exit<Value, Value>) {
        let Exit::Failure(cause) = exit else {
            trace!(fiber = %self.id, "fiber succeeded");
            return;
        };
        if cause.is_interrupted_only() {
            trace!(fiber = %self.id, "fiber interrupted");
            return;
        }
        if !self.runtime.config.log.report_failures {
            return;
        }
        if cause.is_die() {
            warn!(fiber = %self.id, "fiber terminated with a defect\n{}", cause.pretty());
        } else {
            debug!(fiber = %self.id, "fiber failed\n{}", cause.pretty());
        }
    }
}

// ============================================================================
// Interpreter
// ============================================================================

impl FiberContext {
    fn run(&mut self, fiber: &Arc<FiberInner>, start: Ir) {
        let mut current = Some(start);
        let mut ops = 0usize;

        while let Some(instr) = current.take() {
            if self.should_interrupt(fiber) {
                self.interrupting = true;
                current = Some(fail_ir(Cause::interrupt_all(fiber.interruptors())));
                continue;
            }
            if ops >= self.max_ops {
                trace!(fiber = %fiber.id, ops, "instruction budget exhausted");
                fiber.yield_later(instr);
                return;
            }
            ops += 1;
            current = self.step(fiber, &instr);
        }
    }

    fn step(&mut self, fiber: &Arc<FiberInner>, instr: &Instr) -> Option<Ir> {
        match instr {
            Instr::Succeed(value) => self.next_instr(fiber, value.clone()),

            Instr::Fail(cause) => self.unwind(fiber, cause.clone()),

            Instr::Total(thunk) => match guard_call(|| thunk()) {
                Ok(value) => self.next_instr(fiber, value),
                Err(defect) => Some(fail_ir(Cause::Die(defect))),
            },

            Instr::Partial(thunk, on_error) => match guard_call(|| thunk()) {
                Ok(Ok(value)) => self.next_instr(fiber, value),
                Ok(Err(error)) => Some(guarded(|| fail_ir(Cause::fail(on_error(error))))),
                Err(defect) => Some(fail_ir(Cause::Die(defect))),
            },

            Instr::Chain(effect, k) => {
                self.stack.push(Frame::Apply(k.clone()));
                Some(effect.clone())
            }

            Instr::Fold(effect, on_failure, on_success) => {
                self.stack
                    .push(Frame::Fold(on_failure.clone(), on_success.clone()));
                Some(effect.clone())
            }

            Instr::Async(register, blocking_on) => {
                self.suspend(fiber, register, blocking_on.clone())
            }

            Instr::Fork(effect, scope) => match self.fork(fiber, effect.clone(), scope.clone()) {
                Ok(child) => self.next_instr(fiber, erase(child)),
                Err(defect) => Some(fail_ir(Cause::Die(defect))),
            },

            Instr::Race(race) => match self.race(fiber, race) {
                Ok(next) => Some(next),
                Err(defect) => Some(fail_ir(Cause::Die(defect))),
            },

            Instr::SetInterruptStatus(effect, status) => {
                self.interrupt_status.push(*status);
                self.stack.push(Frame::RestoreInterrupt);
                Some(effect.clone())
            }

            Instr::GetInterruptStatus(k) => {
                let status = self.current_interrupt_status();
                Some(guarded(|| k(status)))
            }

            Instr::Descriptor(k) => {
                let descriptor = self.descriptor(fiber);
                Some(guarded(|| k(descriptor)))
            }

            Instr::Read(k) => {
                let environment = self.environment();
                Some(guarded(|| k(environment)))
            }

            Instr::Provide(effect, environment) => {
                self.environments.push(environment.clone());
                self.stack.push(Frame::RestoreEnvironment);
                Some(effect.clone())
            }

            Instr::Suspend(thunk) => Some(guarded(|| thunk())),

            Instr::Supervise(effect, supervisor) => {
                let combined = supervisor.clone().and(self.current_supervisor());
                self.supervisors.push(combined);
                self.stack.push(Frame::RestoreSupervisor);
                Some(effect.clone())
            }

            Instr::GetForkScope(k) => {
                let scope = self.fork_scope();
                Some(guarded(|| k(scope)))
            }

            Instr::OverrideForkScope(effect, scope) => {
                self.fork_scopes.push(scope.clone());
                self.stack.push(Frame::RestoreForkScope);
                Some(effect.clone())
            }

            Instr::NewFiberRef(cell) => {
                fiber.refs.lock().set(cell, cell.initial());
                self.next_instr(fiber, erase(cell.clone()))
            }

            Instr::ModifyFiberRef(cell, f) => {
                let current = fiber.refs.lock().get(cell);
                match guard_call(|| f(current)) {
                    Ok((result, next)) => {
                        fiber.refs.lock().set(cell, next);
                        self.next_instr(fiber, result)
                    }
                    Err(defect) => Some(fail_ir(Cause::Die(defect))),
                }
            }

            Instr::Yield => {
                fiber.yield_later(unit_ir());
                None
            }
        }
    }

    /// Feed `value` to the next continuation, popping restore frames on the
    /// way. An empty stack completes the fiber.
    fn next_instr(&mut self, fiber: &Arc<FiberInner>, value: Value) -> Option<Ir> {
        loop {
            match self.stack.pop() {
                None => return self.done(fiber, Exit::Success(value)),
                Some(Frame::Apply(k)) | Some(Frame::Fold(_, k)) => {
                    return Some(guarded(|| k(value)));
                }
                Some(frame) => self.restore(frame),
            }
        }
    }

    /// Unwind to the nearest failure handler. While an interruption is
    /// pending in an interruptible region, handlers are discarded and the
    /// cause loses its typed failures.
    fn unwind(&mut self, fiber: &Arc<FiberInner>, cause: Cause<Value>) -> Option<Ir> {
        let mut discarded = false;
        let mut handler = None;

        while let Some(frame) = self.stack.pop() {
            match frame {
                Frame::Apply(_) => {}
                Frame::Fold(on_failure, _) => {
                    if self.should_interrupt(fiber) {
                        discarded = true;
                    } else {
                        handler = Some(on_failure);
                        break;
                    }
                }
                other => self.restore(other),
            }
        }

        let cause = if discarded {
            cause.strip_failures()
        } else {
            cause
        };

        match handler {
            Some(on_failure) => {
                self.interrupting = false;
                Some(guarded(|| on_failure(cause)))
            }
            None => {
                let seen = cause.interruptors();
                let missing: Vec<FiberId> = fiber
                    .interruptors()
                    .into_iter()
                    .filter(|id| !seen.contains(id))
                    .collect();
                let full = cause.then(Cause::interrupt_all(missing));
                self.interrupting = true;
                self.done(fiber, Exit::Failure(full))
            }
        }
    }

    fn restore(&mut self, frame: Frame) {
        match frame {
            Frame::RestoreInterrupt => {
                self.interrupt_status.pop();
            }
            Frame::RestoreEnvironment => {
                self.environments.pop();
            }
            Frame::RestoreSupervisor => {
                self.supervisors.pop();
            }
            Frame::RestoreForkScope => {
                self.fork_scopes.pop();
            }
            Frame::Apply(_) | Frame::Fold(..) => {}
        }
    }

    /// Close the fiber's own scope, then publish the exit. Finalizers run
    /// uninterruptibly before the exit becomes visible.
    fn done(&mut self, fiber: &Arc<FiberInner>, exit: Exit<Value, Value>) -> Option<Ir> {
        if let Some(finalizers) = self.open_scope.close_ir(&exit).finalizers() {
            self.interrupting = true;
            let on_failure = exit.clone();
            let on_success = exit;
            let fold = Arc::new(Instr::Fold(
                finalizers,
                Arc::new(move |cause: Cause<Value>| {
                    let merged = match on_failure.clone() {
                        Exit::Success(_) => Exit::Failure(cause),
                        Exit::Failure(original) => Exit::Failure(original.then(cause)),
                    };
                    exit_ir(merged)
                }),
                Arc::new(move |_: Value| exit_ir(on_success.clone())),
            ));
            return Some(Arc::new(Instr::SetInterruptStatus(
                fold,
                InterruptStatus::Uninterruptible,
            )));
        }
        fiber.complete(self, exit);
        None
    }

    fn suspend(
        &mut self,
        fiber: &Arc<FiberInner>,
        register: &Register,
        blocking_on: Vec<FiberId>,
    ) -> Option<Ir> {
        let interruptible = self.is_interruptible() && !self.interrupting;
        let epoch = fiber.enter_async(interruptible, blocking_on);
        let resume = Resume {
            fiber: fiber.clone(),
            epoch,
        };

        match guard_call(|| register(resume)) {
            Ok(Some(next)) => fiber.exit_async(epoch).then_some(next),
            Ok(None) => {
                if self.should_interrupt(fiber) && fiber.exit_async(epoch) {
                    Some(fail_ir(Cause::interrupt_all(fiber.interruptors())))
                } else {
                    None
                }
            }
            Err(defect) => fiber
                .exit_async(epoch)
                .then(|| fail_ir(Cause::Die(defect))),
        }
    }

    fn fork(
        &mut self,
        fiber: &Arc<FiberInner>,
        effect: Ir,
        scope: Option<Scope>,
    ) -> Result<RuntimeFiber, Defect> {
        let target = scope.unwrap_or_else(|| self.fork_scope());
        let supervisor = self.current_supervisor();
        let child = FiberInner::new(
            fiber.runtime.clone(),
            FiberSeed {
                environment: self.environment(),
                interrupt_status: self.current_interrupt_status(),
                reporting_to: supervisor.clone(),
                fiber_refs: fiber.refs_snapshot().fork()?,
                parent_scope: target.clone(),
            },
        );
        let handle = RuntimeFiber::new(child.clone());
        guard_call(|| supervisor.notify_start(&handle))?;

        if target.is_global() {
            fiber.runtime.register_root(handle.clone());
        } else {
            let weak = Arc::downgrade(&child);
            let parent = fiber.id;
            let registered = target.register(Box::new(move |_: &Exit<Value, Value>| match weak.upgrade() {
                Some(child) => suspend_ir(move || {
                    child.signal_interrupt(parent);
                    await_ir(&child)
                }),
                None => unit_ir(),
            }));
            match registered {
                Ok(key) => child.context.lock().parent_link = Some((target, key)),
                Err(_) => child.signal_interrupt(parent),
            }
        }

        trace!(parent = %fiber.id, child = %child.id, "fiber forked");
        child.evaluate_later(effect);
        Ok(handle)
    }

    fn race(&mut self, fiber: &Arc<FiberInner>, race: &Race) -> Result<Ir, Defect> {
        let left = self.fork(fiber, race.left.clone(), race.scope.clone())?;
        let right = self.fork(fiber, race.right.clone(), race.scope.clone())?;
        let won = Arc::new(AtomicBool::new(false));
        let left_wins = race.left_wins.clone();
        let right_wins = race.right_wins.clone();
        let blocking_on = vec![left.id(), right.id()];

        Ok(Arc::new(Instr::Async(
            Arc::new(move |resume: Resume| -> Option<Ir> {
                arm(&left, &right, &left_wins, &won, &resume);
                arm(&right, &left, &right_wins, &won, &resume);
                None
            }),
            blocking_on,
        )))
    }

    fn should_interrupt(&self, fiber: &FiberInner) -> bool {
        !self.interrupting
            && self.is_interruptible()
            && fiber.interrupt_requested.load(Ordering::Acquire)
    }

    fn current_interrupt_status(&self) -> InterruptStatus {
        self.interrupt_status.last().copied().unwrap_or_default()
    }

    fn is_interruptible(&self) -> bool {
        self.current_interrupt_status().is_interruptible()
    }

    fn environment(&self) -> Value {
        self.environments.last().cloned().unwrap_or_else(|| erase(()))
    }

    fn current_supervisor(&self) -> Supervisor {
        self.supervisors.last().cloned().unwrap_or_default()
    }

    fn fork_scope(&self) -> Scope {
        self.fork_scopes
            .last()
            .cloned()
            .flatten()
            .unwrap_or_else(|| self.open_scope.clone())
    }

    fn descriptor(&self, fiber: &FiberInner) -> Descriptor {
        let (status, interruptors) = {
            let state = fiber.state.lock();
            (state.status.clone(), state.interruptors.clone())
        };
        Descriptor {
            id: fiber.id,
            status,
            interruptors,
            interrupt_status: self.current_interrupt_status(),
            scope: self.fork_scope(),
        }
    }

    /// Drop everything the finished fiber no longer needs.
    fn release(&mut self) {
        self.stack = Vec::new();
        self.environments = Vec::new();
        self.supervisors = Vec::new();
        self.fork_scopes = Vec::new();
    }
}

/// Watch `winner`; the first side to finish resumes the racing fiber with
/// its handler.
fn arm(
    winner: &RuntimeFiber,
    loser: &RuntimeFiber,
    handler: &RaceHandler,
    won: &Arc<AtomicBool>,
    resume: &Resume,
) {
    let loser = loser.clone();
    let handler = handler.clone();
    let won = won.clone();
    let resume = resume.clone();
    winner.inner().observe(Box::new(move |exit| {
        if !won.swap(true, Ordering::AcqRel) {
            resume.resume(suspend_ir(move || handler(exit.clone(), loser.clone())));
        }
    }));
}

/// Wait for `fiber` to finish; yields its erased `Exit<Value, Value>`.
pub(crate) fn await_ir(fiber: &Arc<FiberInner>) -> Ir {
    let fiber = fiber.clone();
    let blocking_on = vec![fiber.id];
    Arc::new(Instr::Async(
        Arc::new(move |resume: Resume| {
            if let Some(exit) = fiber.poll_exit() {
                return Some(succeed_ir(erase(exit)));
            }
            fiber.observe(Box::new(move |exit| {
                resume.resume(succeed_ir(erase(exit)));
            }));
            None
        }),
        blocking_on,
    ))
}

/// Merge `child` ref values into the running fiber.
pub(crate) fn inherit_refs_ir(child: FiberRefs) -> Ir {
    child
        .entries()
        .into_iter()
        .fold(unit_ir(), |acc, (cell, child_value)| {
            let merge = Arc::new(Instr::ModifyFiberRef(
                cell.clone(),
                Arc::new(move |parent: Value| (erase(()), join_value(&cell, &parent, &child_value))),
            ));
            chain_ir(acc, move |_| merge.clone())
        })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::instruction::unerase;
    use crate::runtime::Runtime;
    use std::time::Duration;

    fn run_ir(runtime: &Runtime, ir: Ir) -> Exit<Value, Value> {
        let fiber = FiberInner::new(runtime.inner().clone(), FiberSeed::root());
        let (tx, rx) = crossbeam_channel::bounded(1);
        fiber.observe(Box::new(move |exit| {
            let _ = tx.send(exit);
        }));
        fiber.evaluate_later(ir);
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::builder().num_workers(2).build().unwrap()).unwrap()
    }

    #[test]
    fn test_deep_chain_is_stack_safe() {
        let runtime = runtime();
        let mut ir = succeed_ir(erase(0u64));
        for _ in 0..100_000 {
            ir = chain_ir(ir, |value| succeed_ir(erase(unerase::<u64>(value) + 1)));
        }
        match run_ir(&runtime, ir) {
            Exit::Success(value) => assert_eq!(unerase::<u64>(value), 100_000),
            Exit::Failure(cause) => panic!("unexpected failure: {}", cause.pretty()),
        }
        runtime.shutdown();
    }

    #[test]
    fn test_panic_in_continuation_becomes_defect() {
        let runtime = runtime();
        let ir = chain_ir(unit_ir(), |_| panic!("bad continuation"));
        match run_ir(&runtime, ir) {
            Exit::Failure(cause) => {
                assert_eq!(cause.defects()[0].message(), "bad continuation");
            }
            Exit::Success(_) => panic!("expected a defect"),
        }
        runtime.shutdown();
    }

    #[test]
    fn test_fold_recovers_from_failure() {
        let runtime = runtime();
        let ir = Arc::new(Instr::Fold(
            fail_ir(Cause::fail(erase("boom"))),
            Arc::new(|cause: Cause<Value>| succeed_ir(erase(cause.failures().len()))),
            Arc::new(|value| succeed_ir(value)),
        ));
        match run_ir(&runtime, ir) {
            Exit::Success(value) => assert_eq!(unerase::<usize>(value), 1),
            Exit::Failure(cause) => panic!("unexpected failure: {}", cause.pretty()),
        }
        runtime.shutdown();
    }

    #[test]
    fn test_stale_resume_is_ignored() {
        let runtime = runtime();
        let saved: Arc<Mutex<Option<Resume>>> = Arc::new(Mutex::new(None));
        let slot = saved.clone();
        let ir = Arc::new(Instr::Async(
            Arc::new(move |resume: Resume| {
                *slot.lock() = Some(resume);
                None
            }),
            Vec::new(),
        ));
        let fiber = FiberInner::new(runtime.inner().clone(), FiberSeed::root());
        let (tx, rx) = crossbeam_channel::bounded(1);
        fiber.observe(Box::new(move |exit| {
            let _ = tx.send(exit);
        }));
        fiber.evaluate_now(ir);
        let resume = saved.lock().take().unwrap();
        assert!(resume.resume(succeed_ir(erase(1))));
        assert!(!resume.resume(succeed_ir(erase(2))));
        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            Exit::Success(value) => assert_eq!(unerase::<i32>(value), 1),
            Exit::Failure(cause) => panic!("unexpected failure: {}", cause.pretty()),
        }
        runtime.shutdown();
    }
}
