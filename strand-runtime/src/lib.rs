//! # Strand Runtime Library
//!
//! A user-space effect runtime. Programs are described as [`Effect`]
//! values and run by a trampolined interpreter on lightweight fibers:
//!
//! - **Effects**: lazy descriptions with typed errors and an environment
//! - **Causes**: every way a fiber can fail, including defects and interruption
//! - **Fibers**: M:N cooperative scheduling with work-stealing
//! - **Interruption**: asynchronous, maskable, with guaranteed finalizers
//! - **Structured concurrency**: children are bound to the scope they were forked in
//! - **Fiber refs**: fiber-local state with fork and join merge rules
//!
//! ## Technical Standards
//!
//! - **Work Stealing**: Chase-Lev deques per
//!   [crossbeam-deque](https://docs.rs/crossbeam-deque)
//! - **Completion handoff**: [crossbeam-channel](https://docs.rs/crossbeam-channel)
//! - **Errors**: [thiserror](https://docs.rs/thiserror)
//! - **Logging**: [tracing](https://docs.rs/tracing)
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       STRAND RUNTIME                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │    Effect    │  │   Handling   │  │ Concurrency  │          │
//! │  │ (effect.rs)  │  │(handling.rs) │  │(concurrency) │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │         │                 │                 │                   │
//! │         └─────────────────┼─────────────────┘                   │
//! │                           ▼                                     │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │ Instructions │─▶│  Executor    │─▶│  Scheduler   │          │
//! │  │(instruction) │  │(executor.rs) │  │(scheduler.rs)│          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │                      │    │    │                                │
//! │           ┌──────────┘    │    └──────────┐                     │
//! │           ▼               ▼               ▼                     │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │    Scope     │  │  FiberRefs   │  │    Timer     │          │
//! │  │  (scope.rs)  │  │(fiber_ref.rs)│  │  (timer.rs)  │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │                                                                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use strand_runtime::{effect, Runtime, IO};
//!
//! let program: IO<String, i32> = effect::succeed(20)
//!     .zip_with_par(effect::succeed(22), |a, b| a + b);
//! let answer = Runtime::global().run_promise(program).wait()??;
//! assert_eq!(answer, 42);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod cause;
pub mod concurrency;
pub mod config;
pub mod effect;
pub mod exit;
pub mod fiber;
pub mod fiber_ref;
pub mod future;
pub mod handling;
pub mod interruption;
pub mod logging;
pub mod process;
pub mod runtime;
pub mod scheduler;
pub mod scope;
pub mod supervisor;
pub mod timer;

pub(crate) mod executor;
pub(crate) mod instruction;

// Re-exports
pub use cause::{Cause, Defect};
pub use concurrency::{ForkScopeRestore, Grafter};
pub use config::{
    ConfigError, FiberConfig, LogConfig, RuntimeConfig, RuntimeConfigBuilder, SchedulerConfig,
    ShutdownConfig,
};
pub use effect::{AsyncRegistration, Callback, Data, Effect, Never, IO, UIO};
pub use exit::{Exit, FiberFailure};
pub use fiber::{Descriptor, Fiber, FiberId, FiberStatus, InterruptStatus, RuntimeFiber};
pub use fiber_ref::FiberRef;
pub use future::{Pending, PendingError};
pub use interruption::InterruptRestore;
pub use process::{exit_code, run_main, run_main_with};
pub use runtime::{Runtime, RuntimeError};
pub use scope::Scope;
pub use supervisor::{Supervisor, SupervisorHooks};
pub use timer::Timer;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
