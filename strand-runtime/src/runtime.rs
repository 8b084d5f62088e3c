//! # Runtime
//!
//! Owns the worker pool and starts root fibers.
//!
//! A [`Runtime`] is cheap to clone; clones share the same pool. Root
//! fibers, and daemons forked into the global scope, are tracked in a
//! registry so that a process can interrupt everything still running when
//! it shuts down.
//!
//! ```rust,ignore
//! use strand_runtime::{effect, Runtime};
//!
//! let runtime = Runtime::global();
//! let exit = runtime.run_promise_exit(effect::succeed::<(), String, _>(1)).wait()?;
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, trace};

use crate::config::{ConfigError, RuntimeConfig};
use crate::effect::{Data, IO, UIO};
use crate::executor::{FiberInner, FiberSeed};
use crate::exit::{Exit, FiberFailure};
use crate::fiber::{self, typed_exit, Fiber, FiberId, RuntimeFiber};
use crate::future::{self, Pending};
use crate::scheduler::Scheduler;

/// Error starting a runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Worker threads could not be spawned.
    #[error("failed to start worker threads: {0}")]
    Spawn(#[from] std::io::Error),
}

/// State shared by a runtime, its clones and every fiber it runs.
pub(crate) struct RuntimeInner {
    pub(crate) config: RuntimeConfig,
    pub(crate) scheduler: Scheduler,
    roots: Mutex<HashMap<FiberId, RuntimeFiber>>,
}

impl RuntimeInner {
    pub(crate) fn register_root(&self, fiber: RuntimeFiber) {
        self.roots.lock().insert(fiber.id(), fiber);
    }

    pub(crate) fn unregister_root(&self, id: FiberId) {
        self.roots.lock().remove(&id);
    }

    fn roots(&self) -> Vec<RuntimeFiber> {
        let mut roots: Vec<RuntimeFiber> = self.roots.lock().values().cloned().collect();
        roots.sort_by_key(|fiber| fiber.id());
        roots
    }
}

/// Runs effects on a pool of worker threads.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// Start a runtime with `config`.
    pub fn new(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        config.validate()?;
        let scheduler = Scheduler::start(&config.scheduler)?;
        debug!(
            workers = config.scheduler.num_workers,
            max_ops = config.fiber.max_ops,
            "runtime started"
        );
        Ok(Self {
            inner: Arc::new(RuntimeInner {
                config,
                scheduler,
                roots: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Start a runtime configured from `STRAND_*` environment variables.
    pub fn from_env() -> Result<Self, RuntimeError> {
        Self::new(RuntimeConfig::from_env())
    }

    /// The process-wide runtime, configured from the environment on first
    /// use.
    ///
    /// # Panics
    ///
    /// Panics if the worker threads cannot be started.
    pub fn global() -> &'static Runtime {
        static GLOBAL: OnceLock<Runtime> = OnceLock::new();
        GLOBAL.get_or_init(|| match Runtime::from_env() {
            Ok(runtime) => runtime,
            Err(err) => panic!("failed to start the global runtime: {err}"),
        })
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<RuntimeInner> {
        &self.inner
    }

    /// The configuration this runtime was started with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    fn spawn_root<E: Data, A: Data>(
        &self,
        on_exit: impl FnOnce(Exit<E, A>) + Send + 'static,
    ) -> Arc<FiberInner> {
        let fiber = FiberInner::new(self.inner.clone(), FiberSeed::root());
        self.inner.register_root(RuntimeFiber::new(fiber.clone()));
        fiber.observe(Box::new(move |exit| on_exit(typed_exit(exit))));
        trace!(fiber = %fiber.id, "root fiber started");
        fiber
    }

    /// Run `effect` on a new root fiber and call `on_exit` with its exit.
    pub fn run<E: Data, A: Data>(
        &self,
        effect: IO<E, A>,
        on_exit: impl FnOnce(Exit<E, A>) + Send + 'static,
    ) -> Fiber<E, A> {
        let fiber = self.spawn_root(on_exit);
        fiber.evaluate_later(effect.ir);
        Fiber::from_raw(RuntimeFiber::new(fiber))
    }

    /// Like [`Runtime::run`], but run the first slice on the calling
    /// thread.
    pub fn run_asap<E: Data, A: Data>(
        &self,
        effect: IO<E, A>,
        on_exit: impl FnOnce(Exit<E, A>) + Send + 'static,
    ) -> Fiber<E, A> {
        let fiber = self.spawn_root(on_exit);
        fiber.evaluate_now(effect.ir);
        Fiber::from_raw(RuntimeFiber::new(fiber))
    }

    /// Run `effect` and hand back its exit once it finishes.
    pub fn run_promise_exit<E: Data, A: Data>(&self, effect: IO<E, A>) -> Pending<Exit<E, A>> {
        let (completer, pending) = future::pending();
        self.run(effect, move |exit| completer.complete(exit));
        pending
    }

    /// Run `effect` and hand back its value, or its cause as a
    /// [`FiberFailure`].
    pub fn run_promise<E: Data + fmt::Debug, A: Data>(
        &self,
        effect: IO<E, A>,
    ) -> Pending<Result<A, FiberFailure<E>>> {
        let (completer, pending) = future::pending();
        self.run(effect, move |exit: Exit<E, A>| completer.complete(exit.into_result()));
        pending
    }

    /// Start `effect` and return an effect that interrupts it and yields
    /// its exit.
    pub fn run_cancel<E: Data, A: Data>(&self, effect: IO<E, A>) -> UIO<Exit<E, A>> {
        self.run(effect, |_| {}).interrupt()
    }

    /// Root and daemon fibers still running, oldest first.
    pub fn roots(&self) -> Vec<RuntimeFiber> {
        self.inner.roots()
    }

    /// Interrupt every root and daemon fiber on behalf of `by` and wait
    /// for them to finish.
    pub fn interrupt_all_as(&self, by: FiberId) -> UIO<()> {
        fiber::interrupt_all_as(self.roots(), by)
    }

    /// Stop the worker threads. Fibers still queued are dropped.
    pub fn shutdown(&self) {
        debug!(roots = self.inner.roots.lock().len(), "runtime shutting down");
        self.inner.scheduler.shutdown();
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("workers", &self.inner.scheduler.num_workers())
            .field("roots", &self.inner.roots.lock().len())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
