//! # Process Entry Point
//!
//! [`run_main`] runs an effect as the body of a program:
//!
//! 1. SIGINT and SIGTERM are caught. The handlers only set flags; the
//!    calling thread notices them and interrupts every root fiber.
//! 2. Once the main fiber finishes, root and daemon fibers still running
//!    are interrupted and given `shutdown.graceful_timeout` to finish.
//! 3. The outcome becomes the process exit code:
//!
//! | Outcome | Output | Exit code |
//! |---------|--------|-----------|
//! | success | none | 0 |
//! | interruption only | cause on stderr | 0 |
//! | failure or defect | cause on stderr | 1 |

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::effect::{Data, IO};
use crate::exit::Exit;
use crate::fiber::FiberId;
use crate::future::PendingError;
use crate::logging;
use crate::runtime::Runtime;

/// How often the waiting thread checks for signals.
const SIGNAL_POLL: Duration = Duration::from_millis(25);

/// Set by the signal handler; cleared once the request is acted on.
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Last signal number received (0 if none).
static LAST_SIGNAL: AtomicI32 = AtomicI32::new(0);

static HANDLERS_INSTALLED: AtomicBool = AtomicBool::new(false);

/// Install SIGINT/SIGTERM handlers. Returns `false` if they were already
/// installed.
pub fn install_handlers() -> bool {
    if HANDLERS_INSTALLED.swap(true, Ordering::SeqCst) {
        return false;
    }

    #[cfg(unix)]
    install_unix_handlers();

    true
}

#[cfg(unix)]
fn install_unix_handlers() {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

    let action = SigAction::new(
        SigHandler::Handler(signal_handler),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for signal in [Signal::SIGINT, Signal::SIGTERM] {
        // SAFETY: the handler only stores to atomics, which is async-signal-safe.
        if let Err(err) = unsafe { sigaction(signal, &action) } {
            warn!(signal = %signal, error = %err, "failed to install signal handler");
        }
    }
}

/// Async-signal-safe: only touches atomics.
#[cfg(unix)]
extern "C" fn signal_handler(signal: i32) {
    LAST_SIGNAL.store(signal, Ordering::SeqCst);
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

/// Ask [`run_main`] to interrupt the program, as if a signal arrived.
pub fn request_shutdown() {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

/// Whether a shutdown request is waiting to be handled.
pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

/// Exit code for a program outcome.
pub fn exit_code<E, A>(exit: &Exit<E, A>) -> i32 {
    match exit {
        Exit::Success(_) => 0,
        Exit::Failure(cause) if cause.is_interrupted_only() => 0,
        Exit::Failure(_) => 1,
    }
}

/// Run `effect` as the whole program on the global runtime and exit the
/// process with its exit code.
pub fn run_main<E: Data + fmt::Debug, A: Data>(effect: IO<E, A>) -> ! {
    let runtime = Runtime::global();
    logging::init(&runtime.config().log);
    let code = run_main_with(runtime, effect);
    std::process::exit(code)
}

/// Run `effect` as the whole program on `runtime` and return the exit code
/// without exiting.
pub fn run_main_with<E: Data + fmt::Debug, A: Data>(runtime: &Runtime, effect: IO<E, A>) -> i32 {
    install_handlers();
    let pending = runtime.run_promise_exit(effect);

    let exit = loop {
        match pending.wait_timeout(SIGNAL_POLL) {
            Ok(exit) => break exit,
            Err(PendingError::Timeout) => {
                if SHUTDOWN_REQUESTED.swap(false, Ordering::SeqCst) {
                    info!(
                        signal = LAST_SIGNAL.load(Ordering::SeqCst),
                        "shutdown requested, interrupting root fibers"
                    );
                    runtime.run(runtime.interrupt_all_as(FiberId::none()), |_| {});
                }
            }
            Err(PendingError::Abandoned) => {
                error!("main fiber was abandoned");
                return 1;
            }
        }
    };

    drain(runtime);

    if let Exit::Failure(cause) = &exit {
        eprintln!("{}", cause.pretty());
        if cause.is_interrupted_only() {
            info!("main fiber interrupted");
        } else {
            error!("main fiber failed");
        }
    }
    exit_code(&exit)
}

/// Interrupt whatever is still running and wait for it, up to the
/// configured grace period.
fn drain(runtime: &Runtime) {
    let remaining = runtime.roots();
    if remaining.is_empty() {
        return;
    }
    let timeout = runtime.config().shutdown.graceful_timeout;
    debug!(fibers = remaining.len(), ?timeout, "draining remaining fibers");
    let done = runtime.run_promise_exit(runtime.interrupt_all_as(FiberId::none()));
    if let Err(err) = done.wait_timeout(timeout) {
        warn!(error = %err, "fibers still running after graceful shutdown timeout");
    }
}

// ============================================================================
// Tests
// ============================================================================
