//! # Supervisors
//!
//! Hooks notified when fibers start and end. A supervisor installed with
//! `supervised` sees every fiber forked directly by the supervised region.
//! Forked children start with no supervisor of their own, so grandchildren
//! are only seen if the child installs one.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::effect::{self, Data, Effect, UIO};
use crate::fiber::{FiberId, RuntimeFiber};

/// Callbacks invoked by the runtime around a supervised fiber's lifetime.
pub trait SupervisorHooks: Send + Sync {
    /// A fiber was forked under supervision.
    fn on_start(&self, fiber: &RuntimeFiber);

    /// A supervised fiber finished.
    fn on_end(&self, _fiber: FiberId) {}

    /// Fibers tracked by this supervisor that are still alive.
    fn children(&self) -> Vec<RuntimeFiber> {
        Vec::new()
    }
}

/// A composable set of supervisor hooks.
#[derive(Clone, Default)]
pub struct Supervisor {
    hooks: Vec<Arc<dyn SupervisorHooks>>,
}

impl Supervisor {
    /// The supervisor that does nothing.
    pub fn none() -> Self {
        Self::default()
    }

    /// A supervisor backed by custom hooks.
    pub fn from_hooks(hooks: impl SupervisorHooks + 'static) -> Self {
        Self {
            hooks: vec![Arc::new(hooks)],
        }
    }

    /// Combine two supervisors; both are notified.
    pub fn and(mut self, other: Supervisor) -> Self {
        self.hooks.extend(other.hooks);
        self
    }

    /// Whether no hooks are installed.
    pub fn is_none(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Build a supervisor that keeps handles to the live fibers it sees.
    pub fn track<R: Data, E: Data>() -> Effect<R, E, Supervisor> {
        effect::total(|| Supervisor::from_hooks(Tracker::default()))
    }

    /// The live fibers tracked by this supervisor.
    pub fn children(&self) -> UIO<Vec<RuntimeFiber>> {
        let this = self.clone();
        effect::total(move || this.live_children())
    }

    pub(crate) fn live_children(&self) -> Vec<RuntimeFiber> {
        self.hooks.iter().flat_map(|hooks| hooks.children()).collect()
    }

    pub(crate) fn notify_start(&self, fiber: &RuntimeFiber) {
        for hooks in &self.hooks {
            hooks.on_start(fiber);
        }
    }

    pub(crate) fn notify_end(&self, fiber: FiberId) {
        for hooks in &self.hooks {
            hooks.on_end(fiber);
        }
    }
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

/// Keeps the live set of fibers started under it.
#[derive(Default)]
struct Tracker {
    live: Mutex<Vec<RuntimeFiber>>,
}

impl SupervisorHooks for Tracker {
    fn on_start(&self, fiber: &RuntimeFiber) {
        self.live.lock().push(fiber.clone());
    }

    fn on_end(&self, fiber: FiberId) {
        self.live.lock().retain(|tracked| tracked.id() != fiber);
    }

    fn children(&self) -> Vec<RuntimeFiber> {
        self.live.lock().clone()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(Arc<AtomicUsize>);

    impl SupervisorHooks for Counting {
        fn on_start(&self, _fiber: &RuntimeFiber) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_none_has_no_children() {
        let supervisor = Supervisor::none();
        assert!(supervisor.is_none());
        assert!(supervisor.live_children().is_empty());
    }

    #[test]
    fn test_and_keeps_both_hooks() {
        let count = Arc::new(AtomicUsize::new(0));
        let combined = Supervisor::from_hooks(Counting(count.clone()))
            .and(Supervisor::from_hooks(Counting(count.clone())));
        assert!(!combined.is_none());
        assert_eq!(format!("{:?}", combined), "Supervisor { hooks: 2 }");
    }
}
