//! # Structured Concurrency
//!
//! Forking, racing and parallel composition.
//!
//! A forked child is attached to a scope. By default that is the scope of
//! the forking fiber, so the child is interrupted when its parent
//! finishes. [`Effect::fork_daemon`] attaches to the global scope instead,
//! and [`Effect::fork_in`] / [`Effect::override_fork_scope`] pick any other
//! scope.
//!
//! ```text
//! parent scope ─┬─ child A   (interrupted when parent finishes)
//!               └─ child B
//! global scope ─── daemon    (outlives its parent)
//! ```

use std::sync::Arc;

use crate::cause::Cause;
use crate::effect::{self, Data, Effect, Never};
use crate::exit::Exit;
use crate::fiber::{typed_exit, Fiber, FiberId, RuntimeFiber};
use crate::instruction::{Instr, Race, Value};
use crate::scope::Scope;
use crate::supervisor::Supervisor;

/// Restores the fork scope captured by [`fork_scope_mask`].
#[derive(Debug, Clone)]
pub struct ForkScopeRestore {
    scope: Scope,
}

impl ForkScopeRestore {
    /// Run `effect` forking into the captured scope.
    pub fn restore<R: Data, E: Data, A: Data>(&self, effect: Effect<R, E, A>) -> Effect<R, E, A> {
        effect.override_fork_scope(self.scope.clone())
    }
}

/// Re-parents effects into the scope captured by [`transplant`].
#[derive(Debug, Clone)]
pub struct Grafter {
    scope: Scope,
}

impl Grafter {
    /// Run `effect` so that its forks attach to the captured scope.
    pub fn apply<R: Data, E: Data, A: Data>(&self, effect: Effect<R, E, A>) -> Effect<R, E, A> {
        effect.override_fork_scope(self.scope.clone())
    }
}

/// Build an effect from the scope that forks currently attach to.
pub fn fork_scope_with<R: Data, E: Data, A: Data>(
    f: impl Fn(Scope) -> Effect<R, E, A> + Send + Sync + 'static,
) -> Effect<R, E, A> {
    Effect::from_ir(Arc::new(Instr::GetForkScope(Arc::new(move |scope| f(scope).ir))))
}

/// Fork into `scope` for the body, which may restore the previous fork
/// scope for sub-regions.
pub fn fork_scope_mask<R: Data, E: Data, A: Data>(
    scope: Scope,
    f: impl Fn(ForkScopeRestore) -> Effect<R, E, A> + Send + Sync + 'static,
) -> Effect<R, E, A> {
    fork_scope_with(move |previous| {
        f(ForkScopeRestore { scope: previous }).override_fork_scope(scope.clone())
    })
}

/// Capture the current fork scope so that effects run later, possibly
/// from elsewhere, fork into it.
pub fn transplant<R: Data, E: Data, A: Data>(
    f: impl Fn(Grafter) -> Effect<R, E, A> + Send + Sync + 'static,
) -> Effect<R, E, A> {
    fork_scope_with(move |scope| f(Grafter { scope }))
}

/// Run all effects in parallel, collecting results in order. The first
/// failure interrupts the rest.
pub fn collect_all_par<R: Data, E: Data, A: Data>(
    mut effects: Vec<Effect<R, E, A>>,
) -> Effect<R, E, Vec<A>> {
    if effects.len() <= 1 {
        return match effects.pop() {
            Some(only) => only.map(|value| vec![value]),
            None => effect::succeed(Vec::new()),
        };
    }
    let right = effects.split_off(effects.len() / 2);
    collect_all_par(effects).zip_with_par(collect_all_par(right), |mut left, right| {
        left.extend(right);
        left
    })
}

/// Apply `f` to every item and run the results in parallel.
pub fn for_each_par<R: Data, E: Data, T, B: Data>(
    items: impl IntoIterator<Item = T>,
    f: impl Fn(T) -> Effect<R, E, B>,
) -> Effect<R, E, Vec<B>> {
    collect_all_par(items.into_iter().map(f).collect())
}

impl<R: Data, E: Data, A: Data> Effect<R, E, A> {
    fn fork_into(self, scope: Option<Scope>) -> Effect<R, Never, Fiber<E, A>> {
        Effect::<R, Never, RuntimeFiber>::from_ir(Arc::new(Instr::Fork(self.ir, scope)))
            .map(Fiber::from_raw)
    }

    /// Start the effect on a new fiber attached to the current fork scope.
    pub fn fork(self) -> Effect<R, Never, Fiber<E, A>> {
        self.fork_into(None)
    }

    /// Start the effect on a new fiber attached to the global scope. The
    /// fiber outlives its parent.
    pub fn fork_daemon(self) -> Effect<R, Never, Fiber<E, A>> {
        self.fork_into(Some(Scope::global()))
    }

    /// Start the effect on a new fiber attached to `scope`.
    pub fn fork_in(self, scope: Scope) -> Effect<R, Never, Fiber<E, A>> {
        self.fork_into(Some(scope))
    }

    /// Run with forks attached to `scope`.
    pub fn override_fork_scope(self, scope: Scope) -> Effect<R, E, A> {
        Effect::from_ir(Arc::new(Instr::OverrideForkScope(self.ir, Some(scope))))
    }

    /// Run with forks attached to the fiber's own scope again.
    pub fn reset_fork_scope(self) -> Effect<R, E, A> {
        Effect::from_ir(Arc::new(Instr::OverrideForkScope(self.ir, None)))
    }

    /// Run `self` and `that` on two fibers. The handler of whichever side
    /// finishes first receives its exit and the other fiber, which keeps
    /// running unless the handler interrupts it.
    pub fn race_with<E2: Data, B: Data, E3: Data, C: Data>(
        self,
        that: Effect<R, E2, B>,
        left_wins: impl Fn(Exit<E, A>, Fiber<E2, B>) -> Effect<R, E3, C> + Send + Sync + 'static,
        right_wins: impl Fn(Exit<E2, B>, Fiber<E, A>) -> Effect<R, E3, C> + Send + Sync + 'static,
        scope: Option<Scope>,
    ) -> Effect<R, E3, C> {
        Effect::from_ir(Arc::new(Instr::Race(Box::new(Race {
            left: self.ir,
            right: that.ir,
            left_wins: Arc::new(move |exit: Exit<Value, Value>, loser: RuntimeFiber| {
                left_wins(typed_exit(exit), Fiber::from_raw(loser)).ir
            }),
            right_wins: Arc::new(move |exit: Exit<Value, Value>, loser: RuntimeFiber| {
                right_wins(typed_exit(exit), Fiber::from_raw(loser)).ir
            }),
            scope,
        }))))
    }

    /// The first side to succeed wins and the other is interrupted. If
    /// both fail, the causes are combined.
    pub fn race(self, that: Effect<R, E, A>) -> Effect<R, E, A> {
        effect::fiber_id().chain(move |parent| {
            self.clone().race_with(
                that.clone(),
                move |exit, loser| race_settled(exit, loser, parent, true),
                move |exit, loser| race_settled(exit, loser, parent, false),
                None,
            )
        })
    }

    /// The first side to finish wins, whether it succeeded or not.
    pub fn race_first(self, that: Effect<R, E, A>) -> Effect<R, E, A> {
        self.result()
            .race(that.result())
            .widen_error::<E>()
            .chain(effect::done)
    }

    /// Run `self` and `that` in parallel and combine their values. The
    /// first failure interrupts the other side.
    pub fn zip_with_par<B: Data, C: Data>(
        self,
        that: Effect<R, E, B>,
        f: impl Fn(A, B) -> C + Send + Sync + 'static,
    ) -> Effect<R, E, C> {
        let f = Arc::new(f);
        let flipped = f.clone();
        effect::fiber_id().chain(move |parent| {
            let f = f.clone();
            let flipped = flipped.clone();
            self.clone().race_with(
                that.clone(),
                move |exit, loser| {
                    let f = f.clone();
                    zip_settled(exit, loser, parent, true, move |a, b| f(a, b))
                },
                move |exit, loser| {
                    let f = flipped.clone();
                    zip_settled(exit, loser, parent, false, move |b, a| f(a, b))
                },
                None,
            )
        })
    }

    /// Run `self` and `that` in parallel, keeping both values.
    pub fn zip_par<B: Data>(self, that: Effect<R, E, B>) -> Effect<R, E, (A, B)> {
        self.zip_with_par(that, |a, b| (a, b))
    }

    /// Run with `supervisor` observing every fiber forked inside.
    pub fn supervised(self, supervisor: Supervisor) -> Effect<R, E, A> {
        Effect::from_ir(Arc::new(Instr::Supervise(self.ir, supervisor)))
    }

    /// Track the fibers forked inside and hand those still running to `f`
    /// once the effect ends.
    pub fn ensuring_children(
        self,
        f: impl Fn(Vec<RuntimeFiber>) -> Effect<R, Never, ()> + Send + Sync + 'static,
    ) -> Effect<R, E, A> {
        let f = Arc::new(f);
        Supervisor::track::<R, E>().chain(move |supervisor: Supervisor| {
            let f = f.clone();
            let children = supervisor.children().widen::<R>();
            self.clone()
                .supervised(supervisor)
                .ensuring(children.chain(move |children| f(children)))
        })
    }
}

/// Handler for [`Effect::race`]: a success interrupts the loser, a failure
/// defers to the loser's outcome.
fn race_settled<R: Data, E: Data, A: Data>(
    exit: Exit<E, A>,
    loser: Fiber<E, A>,
    parent: FiberId,
    left_first: bool,
) -> Effect<R, E, A> {
    match exit {
        Exit::Success(value) => loser
            .interrupt_as(parent)
            .widen::<R>()
            .widen_error::<E>()
            .as_(value),
        Exit::Failure(cause) => loser.join().widen::<R>().map_error_cause(move |other| {
            if left_first {
                cause.clone().both(other)
            } else {
                other.both(cause.clone())
            }
        }),
    }
}

/// Handler for [`Effect::zip_with_par`]. `combine` always receives the
/// winner's value first.
fn zip_settled<R: Data, E: Data, W: Data, L: Data, C: Data>(
    exit: Exit<E, W>,
    loser: Fiber<E, L>,
    parent: FiberId,
    left_first: bool,
    combine: impl Fn(W, L) -> C + Send + Sync + 'static,
) -> Effect<R, E, C> {
    match exit {
        Exit::Success(value) => loser
            .join()
            .widen::<R>()
            .map(move |other| combine(value.clone(), other)),
        Exit::Failure(cause) => loser
            .interrupt_as(parent)
            .widen::<R>()
            .widen_error::<E>()
            .chain(move |loser_exit| match loser_exit {
                Exit::Failure(other) if !other.is_interrupted_only() => {
                    effect::halt(merge_causes(cause.clone(), other, left_first))
                }
                _ => effect::halt(cause.clone()),
            }),
    }
}

fn merge_causes<E>(winner: Cause<E>, loser: Cause<E>, left_first: bool) -> Cause<E> {
    if left_first {
        winner.both(loser)
    } else {
        loser.both(winner)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::{fail, never, sleep, succeed, IO, UIO};
    use crate::runtime::Runtime;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    fn run<E: Data, A: Data>(effect: IO<E, A>) -> Exit<E, A> {
        Runtime::global().run_promise_exit(effect).wait().unwrap()
    }

    #[test]
    fn test_fork_join() {
        let program: IO<&str, i32> = succeed::<(), &str, i32>(21)
            .map(|n| n * 2)
            .fork()
            .widen_error()
            .chain(|fiber| fiber.join());
        assert_eq!(run(program), Exit::Success(42));
    }

    #[test]
    fn test_join_propagates_failure() {
        let program: IO<&str, i32> = fail::<(), &str, i32>("child failed")
            .fork()
            .widen_error()
            .chain(|fiber| fiber.join());
        assert_eq!(run(program), Exit::fail("child failed"));
    }

    #[test]
    fn test_interrupt_never_ending_child() {
        let program: UIO<bool> = never::<(), Never, ()>()
            .fork()
            .chain(|fiber| fiber.interrupt())
            .map(|exit| exit.is_interrupted());
        assert_eq!(run(program), Exit::Success(true));
    }

    #[test]
    fn test_race_first_success_wins() {
        let slow: IO<&str, i32> = sleep(Duration::from_millis(200)).as_(1);
        let fast: IO<&str, i32> = sleep(Duration::from_millis(5)).as_(2);
        assert_eq!(run(slow.race(fast)), Exit::Success(2));
    }

    #[test]
    fn test_race_failure_defers_to_other_side() {
        let failing: IO<&str, i32> = fail("left");
        let slow: IO<&str, i32> = sleep(Duration::from_millis(20)).as_(7);
        assert_eq!(run(failing.race(slow)), Exit::Success(7));
    }

    #[test]
    fn test_race_both_fail_combines_causes() {
        let left: IO<&str, i32> = fail("left");
        let right: IO<&str, i32> = sleep(Duration::from_millis(10)).zip_right(fail("right"));
        let exit = run(left.race(right));
        let cause = exit.cause().unwrap();
        assert_eq!(cause.failures(), vec![&"left", &"right"]);
    }

    #[test]
    fn test_race_first_takes_failure() {
        let failing: IO<&str, i32> = fail("fast failure");
        let slow: IO<&str, i32> = sleep(Duration::from_millis(50)).as_(7);
        assert_eq!(run(failing.race_first(slow)), Exit::fail("fast failure"));
    }

    #[test]
    fn test_race_with_leaves_loser_running() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let slow: IO<Never, ()> = sleep(Duration::from_millis(30)).zip_right(effect::total(move || {
            flag.store(true, Ordering::SeqCst);
        }));
        let fast: IO<Never, ()> = effect::unit();
        let program: IO<Never, bool> = fast.race_with(
            slow,
            |_, loser| loser.await_exit().map(|exit| exit.is_success()),
            |_, _| succeed(false),
            None,
        );
        assert_eq!(run(program), Exit::Success(true));
        assert!(finished.load(Ordering::SeqCst));
    }

    #[test]
    fn test_zip_par_collects_both() {
        let a: IO<&str, i32> = sleep(Duration::from_millis(10)).as_(1);
        let b: IO<&str, &str> = succeed("b");
        assert_eq!(run(a.zip_par(b)), Exit::Success((1, "b")));
    }

    #[test]
    fn test_zip_par_failure_interrupts_other_side() {
        let interrupted = Arc::new(AtomicBool::new(false));
        let flag = interrupted.clone();
        let endless: IO<&str, i32> = never().on_interrupt(move |_| {
            let flag = flag.clone();
            effect::total(move || flag.store(true, Ordering::SeqCst))
        });
        let failing: IO<&str, i32> = sleep(Duration::from_millis(10)).zip_right(fail("stop"));
        assert_eq!(run(endless.zip_par(failing)), Exit::fail("stop"));
        assert!(interrupted.load(Ordering::SeqCst));
    }

    #[test]
    fn test_collect_all_par_keeps_order() {
        let effects: Vec<IO<Never, u64>> = (0..10u64)
            .map(|n| sleep(Duration::from_millis(10 - n)).as_(n))
            .collect();
        assert_eq!(run(collect_all_par(effects)), Exit::Success((0..10).collect()));
    }

    #[test]
    fn test_for_each_par() {
        let program: IO<Never, Vec<usize>> = for_each_par(vec!["a", "bb", "ccc"], |s| succeed(s.len()));
        assert_eq!(run(program), Exit::Success(vec![1, 2, 3]));
        let empty: IO<Never, Vec<usize>> = for_each_par(Vec::<&str>::new(), |s| succeed(s.len()));
        assert_eq!(run(empty), Exit::Success(vec![]));
    }

    #[test]
    fn test_daemon_outlives_parent() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let tick: IO<Never, ()> = sleep(Duration::from_millis(5)).zip_right(effect::total(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let program: IO<Never, Fiber<Never, Never>> = tick.forever().fork_daemon();
        let daemon = match run(program) {
            Exit::Success(fiber) => fiber,
            Exit::Failure(cause) => panic!("fork failed: {}", cause.pretty()),
        };
        std::thread::sleep(Duration::from_millis(60));
        assert!(ticks.load(Ordering::SeqCst) > 1);
        let exit = run(daemon.interrupt());
        assert!(exit.is_interrupted());
    }

    #[test]
    fn test_children_interrupted_when_parent_finishes() {
        let interrupted = Arc::new(AtomicBool::new(false));
        let flag = interrupted.clone();
        let child: IO<Never, ()> = never().on_interrupt(move |_| {
            let flag = flag.clone();
            effect::total(move || flag.store(true, Ordering::SeqCst))
        });
        let program: IO<Never, ()> = child.fork().as_unit();
        assert_eq!(run(program), Exit::Success(()));
        assert!(interrupted.load(Ordering::SeqCst));
    }

    #[test]
    fn test_fork_in_closed_scope_starts_interrupted() {
        let scope = Scope::new();
        let program: IO<Never, bool> = scope
            .close::<(), Never, ()>(Exit::Success(()))
            .zip_right(never::<(), Never, ()>().fork_in(scope.clone()))
            .chain(|fiber| fiber.await_exit())
            .map(|exit| exit.is_interrupted());
        assert_eq!(run(program), Exit::Success(true));
    }

    #[test]
    fn test_transplant_forks_into_captured_scope() {
        let scope = Scope::new();
        let target = scope.clone();
        let program: IO<Never, usize> = fork_scope_mask(scope.clone(), move |_| {
            transplant(|grafter| grafter.apply(never::<(), Never, ()>().fork()).as_unit())
                .map({
                    let target = target.clone();
                    move |_| target.finalizer_count()
                })
        });
        assert_eq!(run(program), Exit::Success(1));
        run(scope.close::<(), Never, ()>(Exit::Success(())));
    }

    #[test]
    fn test_ensuring_children_sees_forked_children() {
        let seen = Arc::new(AtomicUsize::new(0));
        let sink = seen.clone();
        let forks: IO<Never, ()> = never::<(), Never, ()>()
            .fork()
            .zip(never::<(), Never, ()>().fork())
            .as_unit();
        let program: IO<Never, ()> = forks.ensuring_children(move |children| {
            let sink = sink.clone();
            effect::total(move || {
                sink.store(children.len(), Ordering::SeqCst);
            })
        });
        assert_eq!(run(program), Exit::Success(()));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}
