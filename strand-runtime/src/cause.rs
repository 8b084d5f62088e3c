//! # Failure Causes
//!
//! A [`Cause`] records *why* a fiber failed, keeping every reason that
//! contributed to the failure instead of only the first one.
//!
//! ## Taxonomy
//!
//! - `Fail(E)`: an expected, typed, recoverable error.
//! - `Die(Defect)`: an unexpected failure (a bug, a caught panic).
//! - `Interrupt(FiberId)`: cancellation requested by the given fiber.
//!
//! Leaves are composed with `Then` (sequential, e.g. a finalizer failing
//! after the main effect failed) and `Both` (parallel, e.g. two raced
//! fibers failing). `Empty` is the unit of both.
//!
//! ## Equality
//!
//! Equality is semantic: `Then` is associative, `Both` is associative and
//! commutative, and `Empty` vanishes. Two causes built in different shapes
//! from the same leaves in the same order compare equal.

use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::effect::Never;
use crate::fiber::FiberId;

// ============================================================================
// Defect
// ============================================================================

/// An unexpected, untyped failure.
///
/// Defects are what `die` produces and what a panic inside a user closure
/// turns into. They carry a rendered message only.
#[derive(Clone)]
pub struct Defect {
    message: Arc<str>,
}

impl Defect {
    /// Create a defect from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Arc::from(message.into()),
        }
    }

    /// Create a defect from an error, including its chain of sources.
    pub fn from_error<E: std::error::Error + ?Sized>(error: &E) -> Self {
        let mut message = error.to_string();
        let mut source = error.source();
        while let Some(inner) = source {
            message.push_str(": ");
            message.push_str(&inner.to_string());
            source = inner.source();
        }
        Self::new(message)
    }

    /// Create a defect from a caught panic payload.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        if let Some(message) = payload.downcast_ref::<&'static str>() {
            Self::new(*message)
        } else if let Some(message) = payload.downcast_ref::<String>() {
            Self::new(message.clone())
        } else {
            Self::new("panic with a non-string payload")
        }
    }

    /// The defect message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Debug for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Defect({:?})", &*self.message)
    }
}

impl fmt::Display for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl PartialEq for Defect {
    fn eq(&self, other: &Self) -> bool {
        self.message == other.message
    }
}

impl Eq for Defect {}

impl std::hash::Hash for Defect {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.message.hash(state);
    }
}

impl From<&str> for Defect {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for Defect {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

// ============================================================================
// Cause
// ============================================================================

/// The full reason a computation failed.
#[derive(Clone, Debug)]
pub enum Cause<E> {
    /// No failure.
    Empty,
    /// A typed, recoverable error.
    Fail(E),
    /// An unexpected defect.
    Die(Defect),
    /// Interruption by the given fiber.
    Interrupt(FiberId),
    /// The left cause happened, then the right one.
    Then(Box<Cause<E>>, Box<Cause<E>>),
    /// Both causes happened in parallel.
    Both(Box<Cause<E>>, Box<Cause<E>>),
}

impl<E> Default for Cause<E> {
    fn default() -> Self {
        Cause::Empty
    }
}

impl<E> Cause<E> {
    /// The empty cause.
    pub fn empty() -> Self {
        Cause::Empty
    }

    /// A typed failure.
    pub fn fail(error: E) -> Self {
        Cause::Fail(error)
    }

    /// A defect.
    pub fn die(defect: impl Into<Defect>) -> Self {
        Cause::Die(defect.into())
    }

    /// Interruption by `fiber`.
    pub fn interrupt(fiber: FiberId) -> Self {
        Cause::Interrupt(fiber)
    }

    /// Interruption by every fiber in `fibers`, composed in parallel.
    pub fn interrupt_all(fibers: impl IntoIterator<Item = FiberId>) -> Self {
        fibers
            .into_iter()
            .fold(Cause::Empty, |acc, id| acc.both(Cause::Interrupt(id)))
    }

    /// Sequential composition. Empty operands vanish.
    pub fn then(self, next: Cause<E>) -> Self {
        match (self.is_empty(), next.is_empty()) {
            (true, _) => next,
            (_, true) => self,
            _ => Cause::Then(Box::new(self), Box::new(next)),
        }
    }

    /// Parallel composition. Empty operands vanish.
    pub fn both(self, other: Cause<E>) -> Self {
        match (self.is_empty(), other.is_empty()) {
            (true, _) => other,
            (_, true) => self,
            _ => Cause::Both(Box::new(self), Box::new(other)),
        }
    }

    /// Visit every leaf (`Fail`, `Die`, `Interrupt`) left to right.
    fn for_each_leaf<'a>(&'a self, mut visit: impl FnMut(&'a Cause<E>)) {
        let mut pending = vec![self];
        while let Some(node) = pending.pop() {
            match node {
                Cause::Empty => {}
                Cause::Then(left, right) | Cause::Both(left, right) => {
                    pending.push(right);
                    pending.push(left);
                }
                leaf => visit(leaf),
            }
        }
    }

    /// Whether the cause contains no leaves at all.
    pub fn is_empty(&self) -> bool {
        let mut empty = true;
        self.for_each_leaf(|_| empty = false);
        empty
    }

    /// Whether the cause contains a typed failure.
    pub fn is_failure(&self) -> bool {
        self.failure_option().is_some()
    }

    /// Whether the cause contains a defect.
    pub fn is_die(&self) -> bool {
        let mut found = false;
        self.for_each_leaf(|leaf| found |= matches!(leaf, Cause::Die(_)));
        found
    }

    /// Whether the cause contains an interruption.
    pub fn is_interrupted(&self) -> bool {
        let mut found = false;
        self.for_each_leaf(|leaf| found |= matches!(leaf, Cause::Interrupt(_)));
        found
    }

    /// Whether the cause is made of interruptions only.
    pub fn is_interrupted_only(&self) -> bool {
        let mut interrupted = false;
        let mut other = false;
        self.for_each_leaf(|leaf| match leaf {
            Cause::Interrupt(_) => interrupted = true,
            _ => other = true,
        });
        interrupted && !other
    }

    /// The first typed failure, if any.
    pub fn failure_option(&self) -> Option<&E> {
        let mut first = None;
        self.for_each_leaf(|leaf| {
            if let (None, Cause::Fail(error)) = (&first, leaf) {
                first = Some(error);
            }
        });
        first
    }

    /// All typed failures, in order.
    pub fn failures(&self) -> Vec<&E> {
        let mut out = Vec::new();
        self.for_each_leaf(|leaf| {
            if let Cause::Fail(error) = leaf {
                out.push(error);
            }
        });
        out
    }

    /// All defects, in order.
    pub fn defects(&self) -> Vec<Defect> {
        let mut out = Vec::new();
        self.for_each_leaf(|leaf| {
            if let Cause::Die(defect) = leaf {
                out.push(defect.clone());
            }
        });
        out
    }

    /// The set of fibers that interrupted this computation.
    pub fn interruptors(&self) -> BTreeSet<FiberId> {
        let mut out = BTreeSet::new();
        self.for_each_leaf(|leaf| {
            if let Cause::Interrupt(id) = leaf {
                out.insert(*id);
            }
        });
        out
    }

    /// Transform every typed failure.
    pub fn map<E2>(self, f: impl Fn(E) -> E2) -> Cause<E2> {
        self.map_ref(&f)
    }

    fn map_ref<E2>(self, f: &dyn Fn(E) -> E2) -> Cause<E2> {
        match self {
            Cause::Empty => Cause::Empty,
            Cause::Fail(error) => Cause::Fail(f(error)),
            Cause::Die(defect) => Cause::Die(defect),
            Cause::Interrupt(id) => Cause::Interrupt(id),
            Cause::Then(left, right) => {
                Cause::Then(Box::new(left.map_ref(f)), Box::new(right.map_ref(f)))
            }
            Cause::Both(left, right) => {
                Cause::Both(Box::new(left.map_ref(f)), Box::new(right.map_ref(f)))
            }
        }
    }

    /// Drop every typed failure, keeping defects and interruptions.
    ///
    /// The result has no `Fail` leaves, so it can be retyped freely.
    pub fn strip_failures<E2>(self) -> Cause<E2> {
        match self {
            Cause::Empty | Cause::Fail(_) => Cause::Empty,
            Cause::Die(defect) => Cause::Die(defect),
            Cause::Interrupt(id) => Cause::Interrupt(id),
            Cause::Then(left, right) => left.strip_failures().then(right.strip_failures()),
            Cause::Both(left, right) => left.strip_failures().both(right.strip_failures()),
        }
    }

    /// Keep only the defects, or `None` if there are none.
    pub fn keep_defects<E2>(&self) -> Option<Cause<E2>> {
        let kept = self
            .defects()
            .into_iter()
            .fold(Cause::Empty, |acc, defect| acc.then(Cause::Die(defect)));
        if kept.is_empty() {
            None
        } else {
            Some(kept)
        }
    }

    /// Narrow the cause to its recoverable failure.
    ///
    /// Returns the first `Fail` when the cause holds nothing but typed
    /// failures. When a defect or an interruption is present, the cause is
    /// returned with its typed failures stripped so that it can be
    /// re-raised past ordinary error handlers.
    pub fn failure_or_cause(self) -> Result<E, Cause<Never>> {
        if self.is_die() || self.is_interrupted() {
            return Err(self.strip_failures());
        }
        let mut pending = vec![self];
        while let Some(node) = pending.pop() {
            match node {
                Cause::Fail(error) => return Ok(error),
                Cause::Then(left, right) | Cause::Both(left, right) => {
                    pending.push(*right);
                    pending.push(*left);
                }
                _ => {}
            }
        }
        Err(Cause::Empty)
    }

    /// Collapse the cause into a single defect, converting a typed failure
    /// with `f`.
    ///
    /// Preference order: typed failure, then interruption, then the first
    /// defect.
    pub fn squash_with(&self, f: impl FnOnce(&E) -> Defect) -> Defect {
        if let Some(error) = self.failure_option() {
            return f(error);
        }
        let interruptors = self.interruptors();
        if !interruptors.is_empty() {
            let ids: Vec<String> = interruptors.iter().map(|id| id.to_string()).collect();
            return Defect::new(format!("interrupted by {}", ids.join(", ")));
        }
        self.defects()
            .into_iter()
            .next()
            .unwrap_or_else(|| Defect::new("interrupted"))
    }

    /// Does this cause contain `other` as a sub-tree?
    pub fn contains(&self, other: &Cause<E>) -> bool
    where
        E: PartialEq,
    {
        if other.is_empty() {
            return true;
        }
        let mut pending = vec![self];
        while let Some(node) = pending.pop() {
            if node == other {
                return true;
            }
            if let Cause::Then(left, right) | Cause::Both(left, right) = node {
                pending.push(right);
                pending.push(left);
            }
        }
        false
    }
}

impl<E: fmt::Debug> Cause<E> {
    /// Collapse the cause into a single defect, rendering typed failures
    /// with `Debug`.
    pub fn squash(&self) -> Defect {
        self.squash_with(|error| Defect::new(format!("{:?}", error)))
    }

    /// Render the whole cause tree, including parallel branches.
    pub fn pretty(&self) -> String {
        if self.is_empty() {
            return "Fiber failed.\nNo cause was recorded.".to_string();
        }
        let mut out = String::from("Fiber failed.\n");
        render(self, "", &mut out);
        while out.ends_with('\n') {
            out.pop();
        }
        out
    }
}

impl<E> Cause<Cause<E>> {
    /// Replace each typed failure (itself a cause) by its content.
    pub fn flatten(self) -> Cause<E> {
        match self {
            Cause::Empty => Cause::Empty,
            Cause::Fail(inner) => inner,
            Cause::Die(defect) => Cause::Die(defect),
            Cause::Interrupt(id) => Cause::Interrupt(id),
            Cause::Then(left, right) => left.flatten().then(right.flatten()),
            Cause::Both(left, right) => left.flatten().both(right.flatten()),
        }
    }
}

fn render<E: fmt::Debug>(cause: &Cause<E>, indent: &str, out: &mut String) {
    let mut steps = Vec::new();
    sequence(cause, &mut steps);
    for (index, step) in steps.iter().enumerate() {
        if index > 0 {
            out.push_str(indent);
            out.push_str("╥ then\n");
        }
        match step {
            Cause::Fail(error) => {
                out.push_str(&format!("{indent}A checked error was not handled: {error:?}\n"));
            }
            Cause::Die(defect) => {
                out.push_str(&format!("{indent}An unchecked error was produced: {defect}\n"));
            }
            Cause::Interrupt(id) => {
                out.push_str(&format!("{indent}Interrupted by fiber {id}\n"));
            }
            parallel => {
                let mut branches = Vec::new();
                parallel_branches(parallel, &mut branches);
                out.push_str(&format!("{indent}{} failures in parallel:\n", branches.len()));
                for (number, branch) in branches.iter().enumerate() {
                    out.push_str(&format!("{indent}╠═ branch {}\n", number + 1));
                    render(branch, &format!("{indent}║  "), out);
                }
            }
        }
    }
}

fn sequence<'a, E>(cause: &'a Cause<E>, out: &mut Vec<&'a Cause<E>>) {
    match cause {
        Cause::Empty => {}
        Cause::Then(left, right) => {
            sequence(left, out);
            sequence(right, out);
        }
        other => out.push(other),
    }
}

fn parallel_branches<'a, E>(cause: &'a Cause<E>, out: &mut Vec<&'a Cause<E>>) {
    match cause {
        Cause::Empty => {}
        Cause::Both(left, right) => {
            parallel_branches(left, out);
            parallel_branches(right, out);
        }
        other => out.push(other),
    }
}

impl<E: fmt::Debug> fmt::Display for Cause<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pretty())
    }
}

// ============================================================================
// Semantic equality
// ============================================================================

/// Canonical form: a sequence of leaves and parallel groups.
enum Normal<'a, E> {
    Leaf(&'a Cause<E>),
    Parallel(Vec<Vec<Normal<'a, E>>>),
}

fn normalize_seq<'a, E>(cause: &'a Cause<E>, out: &mut Vec<Normal<'a, E>>) {
    match cause {
        Cause::Empty => {}
        Cause::Then(left, right) => {
            normalize_seq(left, out);
            normalize_seq(right, out);
        }
        Cause::Both(..) => {
            let mut branches = Vec::new();
            normalize_par(cause, &mut branches);
            if branches.len() == 1 {
                out.extend(branches.pop().unwrap_or_default());
            } else if !branches.is_empty() {
                out.push(Normal::Parallel(branches));
            }
        }
        leaf => out.push(Normal::Leaf(leaf)),
    }
}

fn normalize_par<'a, E>(cause: &'a Cause<E>, branches: &mut Vec<Vec<Normal<'a, E>>>) {
    match cause {
        Cause::Both(left, right) => {
            normalize_par(left, branches);
            normalize_par(right, branches);
        }
        other => {
            let mut seq = Vec::new();
            normalize_seq(other, &mut seq);
            if !seq.is_empty() {
                branches.push(seq);
            }
        }
    }
}

fn seq_eq<E: PartialEq>(left: &[Normal<'_, E>], right: &[Normal<'_, E>]) -> bool {
    left.len() == right.len() && left.iter().zip(right).all(|(l, r)| normal_eq(l, r))
}

fn normal_eq<E: PartialEq>(left: &Normal<'_, E>, right: &Normal<'_, E>) -> bool {
    match (left, right) {
        (Normal::Leaf(l), Normal::Leaf(r)) => match (l, r) {
            (Cause::Fail(a), Cause::Fail(b)) => a == b,
            (Cause::Die(a), Cause::Die(b)) => a == b,
            (Cause::Interrupt(a), Cause::Interrupt(b)) => a == b,
            _ => false,
        },
        (Normal::Parallel(l), Normal::Parallel(r)) => {
            // Multiset comparison of branches.
            if l.len() != r.len() {
                return false;
            }
            let mut used = vec![false; r.len()];
            l.iter().all(|branch| {
                let found = r
                    .iter()
                    .enumerate()
                    .find(|(i, other)| !used[*i] && seq_eq(branch, other));
                match found {
                    Some((i, _)) => {
                        used[i] = true;
                        true
                    }
                    None => false,
                }
            })
        }
        _ => false,
    }
}

impl<E: PartialEq> PartialEq for Cause<E> {
    fn eq(&self, other: &Self) -> bool {
        let mut left = Vec::new();
        let mut right = Vec::new();
        normalize_seq(self, &mut left);
        normalize_seq(other, &mut right);
        seq_eq(&left, &right)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::next_fiber_id;

    #[test]
    fn test_then_is_associative() {
        let a = Cause::fail(1);
        let b = Cause::<i32>::die("b");
        let c = Cause::fail(3);
        let left = a.clone().then(b.clone()).then(c.clone());
        let right = a.then(b.then(c));
        assert_eq!(left, right);
    }

    #[test]
    fn test_both_is_commutative_and_associative() {
        let a = Cause::fail("a");
        let b = Cause::fail("b");
        let c = Cause::<&str>::die("c");
        assert_eq!(a.clone().both(b.clone()), b.clone().both(a.clone()));
        assert_eq!(
            a.clone().both(b.clone()).both(c.clone()),
            a.both(b.both(c))
        );
    }

    #[test]
    fn test_empty_is_unit() {
        let a = Cause::fail(7);
        assert_eq!(Cause::Empty.then(a.clone()), a);
        assert_eq!(a.clone().both(Cause::Empty), a);
        assert!(Cause::<i32>::Then(Box::new(Cause::Empty), Box::new(Cause::Empty)).is_empty());
    }

    #[test]
    fn test_order_matters_for_then() {
        let a = Cause::fail(1);
        let b = Cause::fail(2);
        assert_ne!(a.clone().then(b.clone()), b.then(a));
    }

    #[test]
    fn test_interruptors_collects_set() {
        let first = next_fiber_id();
        let second = next_fiber_id();
        let cause: Cause<()> = Cause::interrupt(first)
            .then(Cause::interrupt(second))
            .both(Cause::interrupt(first));
        let ids = cause.interruptors();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&first));
        assert!(ids.contains(&second));
        assert!(cause.is_interrupted_only());
    }

    #[test]
    fn test_failure_or_cause_only_fails() {
        let cause = Cause::fail("boom").then(Cause::fail("later"));
        assert_eq!(cause.failure_or_cause(), Ok("boom"));
    }

    #[test]
    fn test_failure_or_cause_reraises_defects() {
        let cause = Cause::fail("boom").both(Cause::die("bug"));
        match cause.failure_or_cause() {
            Ok(_) => panic!("defect must not be swallowed"),
            Err(rest) => {
                assert!(rest.is_die());
                assert!(!rest.is_failure());
            }
        }
    }

    #[test]
    fn test_strip_failures_keeps_defects_and_interrupts() {
        let id = next_fiber_id();
        let cause = Cause::fail(1).then(Cause::die("x")).both(Cause::interrupt(id));
        let stripped: Cause<i32> = cause.strip_failures();
        assert!(!stripped.is_failure());
        assert!(stripped.is_die());
        assert!(stripped.is_interrupted());
    }

    #[test]
    fn test_squash_prefers_failure() {
        let cause = Cause::die("defect").then(Cause::fail("typed"));
        assert_eq!(cause.squash().message(), "\"typed\"");
        let only_defect: Cause<String> = Cause::die("defect");
        assert_eq!(only_defect.squash().message(), "defect");
    }

    #[test]
    fn test_flatten() {
        let inner = Cause::fail("e").then(Cause::die("d"));
        let outer: Cause<Cause<&str>> = Cause::fail(inner.clone());
        assert_eq!(outer.flatten(), inner);
    }

    #[test]
    fn test_pretty_renders_parallel_branches() {
        let id = next_fiber_id();
        let cause = Cause::fail("left").both(Cause::<&str>::die("right").then(Cause::interrupt(id)));
        let text = cause.pretty();
        assert!(text.starts_with("Fiber failed."));
        assert!(text.contains("2 failures in parallel"));
        assert!(text.contains("A checked error was not handled: \"left\""));
        assert!(text.contains("An unchecked error was produced: right"));
        assert!(text.contains(&format!("Interrupted by fiber {}", id)));
    }

    #[test]
    fn test_defect_from_panic_payload() {
        let payload = std::panic::catch_unwind(|| panic!("kaboom")).unwrap_err();
        assert_eq!(Defect::from_panic(payload).message(), "kaboom");
        let formatted = std::panic::catch_unwind(|| panic!("code {}", 42)).unwrap_err();
        assert_eq!(Defect::from_panic(formatted).message(), "code 42");
    }

    #[test]
    fn test_contains() {
        let a = Cause::fail(1);
        let b = Cause::fail(2);
        let both = a.clone().both(b.clone());
        assert!(both.contains(&a));
        assert!(both.contains(&b));
        assert!(!a.contains(&b));
    }
}
