//! Property-based tests for the strand runtime.
//!
//! Uses proptest to generate random programs and causes and checks that the
//! algebraic laws of effects and causes hold when run.

use std::time::Duration;

use proptest::prelude::*;
use strand_runtime::effect::{self, succeed};
use strand_runtime::fiber::next_fiber_id;
use strand_runtime::{Cause, Exit, Never, Runtime, IO};

fn run<E: strand_runtime::Data, A: strand_runtime::Data>(effect: IO<E, A>) -> Exit<E, A> {
    Runtime::global()
        .run_promise_exit(effect)
        .wait_timeout(Duration::from_secs(10))
        .expect("effect did not finish in time")
}

/// A small program whose outcome is known from its shape.
#[derive(Debug, Clone)]
enum Shape {
    Succeed(i64),
    Fail(String),
    Die(String),
    Mapped(i64, i64),
    FailAfter(i64, String),
    Recovered(String, i64),
}

fn shape() -> impl Strategy<Value = Shape> {
    prop_oneof![
        any::<i64>().prop_map(Shape::Succeed),
        "[a-z]{1,8}".prop_map(Shape::Fail),
        "[a-z]{1,8}".prop_map(Shape::Die),
        (-1000i64..1000, -1000i64..1000).prop_map(|(a, b)| Shape::Mapped(a, b)),
        (any::<i64>(), "[a-z]{1,8}").prop_map(|(a, e)| Shape::FailAfter(a, e)),
        ("[a-z]{1,8}", any::<i64>()).prop_map(|(e, a)| Shape::Recovered(e, a)),
    ]
}

fn build(shape: &Shape) -> IO<String, i64> {
    match shape.clone() {
        Shape::Succeed(a) => succeed(a),
        Shape::Fail(e) => effect::fail(e),
        Shape::Die(message) => effect::die(message),
        Shape::Mapped(a, b) => succeed(a).map(move |x| x.wrapping_add(b)),
        Shape::FailAfter(a, e) => succeed(a).chain(move |_| effect::fail(e.clone())),
        Shape::Recovered(e, a) => effect::fail::<(), String, i64>(e).catch_all(move |_| succeed(a)),
    }
}

/// Continuations chosen by index so that failures shrink to readable cases.
fn continuation(index: u8) -> impl Fn(i64) -> IO<String, i64> + Send + Sync + 'static {
    move |x| match index % 4 {
        0 => succeed(x.wrapping_mul(2)),
        1 => effect::fail(format!("rejected {x}")),
        2 => effect::die(format!("bug at {x}")),
        _ => effect::yield_now().as_(x.wrapping_sub(1)),
    }
}

fn cause() -> impl Strategy<Value = Cause<u8>> {
    let leaf = prop_oneof![
        Just(Cause::<u8>::Empty),
        any::<u8>().prop_map(Cause::fail),
        "[a-z]{1,4}".prop_map(|m| Cause::die(m)),
        Just(()).prop_map(|_| Cause::interrupt(next_fiber_id())),
    ];
    leaf.prop_recursive(3, 16, 2, |inner| {
        prop_oneof![
            (inner.clone(), inner.clone()).prop_map(|(a, b)| a.then(b)),
            (inner.clone(), inner).prop_map(|(a, b)| a.both(b)),
        ]
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// chain(succeed(a), f) behaves like f(a)
    #[test]
    fn left_identity(a in any::<i64>(), index in any::<u8>()) {
        let f = continuation(index);
        let chained = run(succeed::<(), String, i64>(a).chain(continuation(index)));
        prop_assert_eq!(chained, run(f(a)));
    }

    /// chain(m, succeed) behaves like m
    #[test]
    fn right_identity(shape in shape()) {
        let program = build(&shape);
        let chained = run(program.clone().chain(succeed));
        prop_assert_eq!(chained, run(program));
    }

    /// Chaining is associative in its effects
    #[test]
    fn associativity(shape in shape(), first in any::<u8>(), second in any::<u8>()) {
        let left = build(&shape).chain(continuation(first)).chain(continuation(second));
        let right = build(&shape).chain(move |x| continuation(first)(x).chain(continuation(second)));
        prop_assert_eq!(run(left), run(right));
    }

    /// unsandbox(sandbox(m)) behaves like m
    #[test]
    fn sandbox_round_trip(shape in shape()) {
        let program = build(&shape);
        prop_assert_eq!(run(program.clone().sandbox().unsandbox()), run(program));
    }

    /// catch_all never swallows a defect
    #[test]
    fn defects_are_opaque_to_catch_all(message in "[a-z]{1,8}") {
        let program: IO<Never, i64> = effect::die::<(), String, i64>(message.clone())
            .catch_all(|_| succeed(1));
        let exit = run(program);
        prop_assert_eq!(exit.cause().map(|c| c.defects()[0].message().to_string()), Some(message));
    }

    /// then is associative and has Empty as unit
    #[test]
    fn then_laws(a in cause(), b in cause(), c in cause()) {
        prop_assert_eq!(
            a.clone().then(b.clone()).then(c.clone()),
            a.clone().then(b.then(c))
        );
        prop_assert_eq!(Cause::Empty.then(a.clone()), a.clone());
        prop_assert_eq!(a.clone().then(Cause::Empty), a);
    }

    /// both is commutative and associative
    #[test]
    fn both_laws(a in cause(), b in cause(), c in cause()) {
        prop_assert_eq!(a.clone().both(b.clone()), b.clone().both(a.clone()));
        prop_assert_eq!(
            a.clone().both(b.clone()).both(c.clone()),
            a.both(b.both(c))
        );
    }

    /// A cause lists exactly the failures it was built from
    #[test]
    fn failures_are_preserved(errors in prop::collection::vec(any::<u8>(), 0..6)) {
        let cause = errors
            .iter()
            .fold(Cause::Empty, |acc, e| acc.then(Cause::fail(*e)));
        let found: Vec<u8> = cause.failures().into_iter().copied().collect();
        prop_assert_eq!(found, errors);
    }
}
