//! End-to-end scenarios for the strand runtime.
//!
//! Each test starts its own runtime so that worker counts and budgets can
//! differ between scenarios.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use strand_runtime::effect::{self, die, fail, fiber_id, never, sleep, succeed, unit, yield_now};
use strand_runtime::{
    Cause, Exit, FiberRef, Never, Runtime, RuntimeConfig, RuntimeFiber, IO, UIO,
};

const TIMEOUT: Duration = Duration::from_secs(10);

fn runtime(workers: usize) -> Runtime {
    Runtime::new(RuntimeConfig::builder().num_workers(workers).build().unwrap()).unwrap()
}

fn run<E, A>(runtime: &Runtime, effect: IO<E, A>) -> Exit<E, A>
where
    E: strand_runtime::Data,
    A: strand_runtime::Data,
{
    runtime
        .run_promise_exit(effect)
        .wait_timeout(TIMEOUT)
        .expect("effect did not finish in time")
}

/// Effect that bumps `counter` when run.
fn bump(counter: &Arc<AtomicUsize>) -> UIO<()> {
    let counter = counter.clone();
    effect::total(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    })
}

#[test]
fn chain_delivers_success_to_callback() {
    let rt = runtime(2);
    let (tx, rx) = crossbeam_channel::bounded(1);
    let program: IO<Never, i32> = succeed(1).chain(|x| succeed(x + 1));
    rt.run(program, move |exit| {
        let _ = tx.send(exit);
    });
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Exit::Success(2));
    rt.shutdown();
}

#[test]
fn typed_failure_reaches_callback() {
    let rt = runtime(2);
    let program: IO<&str, ()> = fail("boom");
    assert_eq!(run(&rt, program), Exit::Failure(Cause::fail("boom")));
    rt.shutdown();
}

#[test]
fn interrupting_forever_loop_reports_interruptor() {
    let rt = runtime(2);
    let program: UIO<(strand_runtime::FiberId, Exit<Never, Never>)> = fiber_id().chain(|root| {
        succeed::<(), Never, ()>(())
            .forever()
            .fork()
            .chain(move |fiber| fiber.interrupt_as(root))
            .map(move |exit| (root, exit))
    });
    match run(&rt, program) {
        Exit::Success((root, exit)) => {
            assert_eq!(exit, Exit::interrupt(root));
            let cause = exit.cause().unwrap();
            assert!(cause.interruptors().contains(&root));
        }
        Exit::Failure(cause) => panic!("unexpected failure: {}", cause.pretty()),
    }
    rt.shutdown();
}

#[test]
fn defects_pass_through_catch_all() {
    let rt = runtime(1);
    let caught: IO<Never, i32> = die::<(), &str, i32>("boom").catch_all(|_| succeed(1));
    let exit = run(&rt, caught);
    assert_eq!(exit.cause().unwrap().defects()[0].message(), "boom");

    let recovered: IO<Never, i32> = die::<(), &str, i32>("boom").catch_all_cause(|_| succeed(1));
    assert_eq!(run(&rt, recovered), Exit::Success(1));
    rt.shutdown();
}

#[test]
fn uninterruptible_region_defers_interruption() {
    let rt = runtime(2);
    let masked: IO<Never, i32> = sleep(Duration::from_millis(50)).zip_right(succeed(42)).uninterruptible();
    let program: UIO<Exit<Never, i32>> = masked
        .fork()
        .chain(|fiber| sleep(Duration::from_millis(10)).zip_right(fiber.interrupt()));
    assert_eq!(run(&rt, program), Exit::Success(Exit::Success(42)));
    rt.shutdown();
}

#[test]
fn finalizer_runs_when_interrupted() {
    let rt = runtime(2);
    let released = Arc::new(AtomicUsize::new(0));
    let guarded: IO<Never, ()> = never().ensuring(bump(&released));
    let program: UIO<bool> = guarded
        .fork()
        .chain(|fiber| sleep(Duration::from_millis(5)).zip_right(fiber.interrupt()))
        .map(|exit| exit.is_interrupted());
    assert_eq!(run(&rt, program), Exit::Success(true));
    assert_eq!(released.load(Ordering::SeqCst), 1);
    rt.shutdown();
}

#[test]
fn children_are_cleaned_up_when_parent_finishes() {
    let rt = runtime(2);
    let stopped = Arc::new(AtomicUsize::new(0));
    let counter = stopped.clone();
    let child: IO<Never, ()> = never().on_interrupt(move |_| bump(&counter));
    let mut parent: IO<Never, ()> = unit();
    for _ in 0..8 {
        parent = parent.zip_right(child.clone().fork().as_unit());
    }
    let parent = parent.zip_right(sleep(Duration::from_millis(10)));
    assert_eq!(run(&rt, parent), Exit::Success(()));
    assert_eq!(stopped.load(Ordering::SeqCst), 8);
    rt.shutdown();
}

#[test]
fn children_are_cleaned_up_when_parent_is_interrupted() {
    let rt = runtime(2);
    let stopped = Arc::new(AtomicUsize::new(0));
    let counter = stopped.clone();
    let child: IO<Never, ()> = never().on_interrupt(move |_| bump(&counter));
    let mut parent: IO<Never, ()> = unit();
    for _ in 0..4 {
        parent = parent.zip_right(child.clone().fork().as_unit());
    }
    let parent: IO<Never, ()> = parent.zip_right(never());
    let program: UIO<bool> = parent
        .fork()
        .chain(|fiber| sleep(Duration::from_millis(20)).zip_right(fiber.interrupt()))
        .map(|exit| exit.is_interrupted());
    assert_eq!(run(&rt, program), Exit::Success(true));
    assert_eq!(stopped.load(Ordering::SeqCst), 4);
    rt.shutdown();
}

#[test]
fn fiber_ref_merges_on_join() {
    let rt = runtime(2);
    let program: UIO<(i32, i32)> =
        FiberRef::make_with(10, |parent: &i32| parent + 1, |parent: &i32, child: &i32| parent + child)
            .chain(|fiber_ref| {
                let in_child = fiber_ref.clone();
                let after = fiber_ref.clone();
                fiber_ref
                    .get()
                    .chain(move |seen| in_child.set(seen * 2).as_(seen))
                    .fork()
                    .chain(|fiber| fiber.join())
                    .chain(move |seen| after.get().map(move |merged| (seen, merged)))
            });
    assert_eq!(run(&rt, program), Exit::Success((11, 32)));
    rt.shutdown();
}

#[test]
fn fiber_ref_unchanged_without_join() {
    let rt = runtime(2);
    let program: UIO<i32> = FiberRef::make(1).chain(|fiber_ref| {
        let after = fiber_ref.clone();
        fiber_ref
            .set(5)
            .fork()
            .chain(|fiber| fiber.await_exit())
            .zip_right(after.get())
    });
    assert_eq!(run(&rt, program), Exit::Success(1));
    rt.shutdown();
}

#[test]
fn inherit_refs_reads_children_that_are_still_running() {
    let rt = runtime(3);
    let program: UIO<(i32, i32)> = FiberRef::make(1).chain(|fiber_ref| {
        let busy = fiber_ref
            .set(7)
            .zip_right(effect::total(|| std::thread::sleep(Duration::from_millis(300))));
        let waiting = fiber_ref.set(9).zip_right(sleep(Duration::from_millis(300)));
        let after_busy = fiber_ref.clone();
        let after_waiting = fiber_ref.clone();
        busy.fork().zip(waiting.fork()).chain(move |(busy, waiting)| {
            let after_busy = after_busy.clone();
            let after_waiting = after_waiting.clone();
            sleep(Duration::from_millis(50))
                .zip_right(busy.inherit_refs())
                .zip_right(after_busy.get())
                .chain(move |seen_busy| {
                    waiting
                        .inherit_refs()
                        .zip_right(after_waiting.get())
                        .map(move |seen_waiting| (seen_busy, seen_waiting))
                })
        })
    });
    assert_eq!(run(&rt, program), Exit::Success((7, 9)));
    rt.shutdown();
}

#[test]
fn race_loser_keeps_running_until_interrupted() {
    let rt = runtime(2);
    let finished = Arc::new(AtomicUsize::new(0));
    let slow: IO<Never, ()> = sleep(Duration::from_millis(30)).zip_right(bump(&finished));
    let fast: IO<Never, ()> = unit();
    let program: IO<Never, bool> = fast.race_with(
        slow,
        |_, loser| loser.await_exit().map(|exit| exit.is_success()),
        |_, _| succeed(false),
        None,
    );
    assert_eq!(run(&rt, program), Exit::Success(true));
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    rt.shutdown();
}

#[test]
fn daemon_survives_its_parent() {
    let rt = runtime(2);
    let done = Arc::new(AtomicUsize::new(0));
    let daemon: IO<Never, ()> = sleep(Duration::from_millis(30)).zip_right(bump(&done));
    let parent: IO<Never, ()> = daemon.fork_daemon().as_unit();
    assert_eq!(run(&rt, parent), Exit::Success(()));
    assert_eq!(done.load(Ordering::SeqCst), 0);
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(done.load(Ordering::SeqCst), 1);
    rt.shutdown();
}

#[test]
fn ensuring_children_sees_forked_fibers() {
    let rt = runtime(2);
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let program: IO<Never, ()> = never::<(), Never, ()>()
        .fork()
        .zip_right(never::<(), Never, ()>().fork())
        .as_unit()
        .ensuring_children(move |children: Vec<RuntimeFiber>| {
            counter.store(children.len(), Ordering::SeqCst);
            strand_runtime::fiber::interrupt_all_as(children, strand_runtime::FiberId::none())
        });
    assert_eq!(run(&rt, program), Exit::Success(()));
    assert_eq!(seen.load(Ordering::SeqCst), 2);
    rt.shutdown();
}

#[test]
fn spinning_fiber_does_not_starve_siblings() {
    let rt = Runtime::new(
        RuntimeConfig::builder()
            .num_workers(1)
            .max_ops(64)
            .build()
            .unwrap(),
    )
    .unwrap();
    let program: IO<Never, u64> = succeed::<(), Never, ()>(())
        .forever()
        .fork()
        .zip_right(yield_now())
        .zip_right(effect::total(|| (1..=100u64).sum::<u64>()).fork())
        .chain(|fiber| fiber.join());
    assert_eq!(run(&rt, program), Exit::Success(5050));
    rt.shutdown();
}

#[test]
fn deep_chain_completes() {
    let rt = runtime(1);
    let mut program: IO<Never, u64> = succeed(0);
    for _ in 0..100_000 {
        program = program.map(|n| n + 1);
    }
    assert_eq!(run(&rt, program), Exit::Success(100_000));

    fn count_down(n: u64) -> IO<Never, u64> {
        if n == 0 {
            succeed(0)
        } else {
            effect::suspend(move || count_down(n - 1)).map(|m| m + 1)
        }
    }
    assert_eq!(run(&rt, count_down(100_000)), Exit::Success(100_000));
    rt.shutdown();
}

#[test]
fn run_main_reports_exit_codes() {
    let rt = runtime(2);
    let ok: IO<String, ()> = unit();
    assert_eq!(strand_runtime::run_main_with(&rt, ok), 0);
    let failed: IO<String, ()> = fail("no such file".to_string());
    assert_eq!(strand_runtime::run_main_with(&rt, failed), 1);
    let interrupted: IO<String, ()> = effect::interrupt();
    assert_eq!(strand_runtime::run_main_with(&rt, interrupted), 0);
    rt.shutdown();
}
