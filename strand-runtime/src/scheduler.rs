//! # Work-Stealing Scheduler
//!
//! Host worker pool that executes fiber slices.
//!
//! ## Design
//!
//! - Each worker thread owns a local FIFO deque.
//! - A global injector receives work from outside the pool, and fibers
//!   that exhausted their instruction budget so they queue behind others.
//! - Idle workers steal from the injector, then from each other, and
//!   finally park on a condition variable until new work arrives.
//!
//! A task is an opaque closure; the scheduler knows nothing about fibers.
//!
//! ## Technical References
//!
//! - [Chase-Lev Deque](https://doi.org/10.1145/1073970.1073974)
//! - [crossbeam-deque](https://docs.rs/crossbeam-deque)
//! - [Tokio Scheduler](https://tokio.rs/blog/2019-10-scheduler)

use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_deque::{Injector, Steal, Stealer, Worker as Deque};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace};

use crate::config::SchedulerConfig;

/// A unit of work.
pub(crate) type Task = Box<dyn FnOnce() + Send>;

static NEXT_SCHEDULER_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    /// Local deque of the worker running on this thread, tagged with the
    /// owning scheduler.
    static LOCAL: RefCell<Option<(usize, Deque<Task>)>> = const { RefCell::new(None) };
}

struct Shared {
    id: usize,
    injector: Injector<Task>,
    stealers: Mutex<Vec<Stealer<Task>>>,
    shutdown: AtomicBool,
    sleepers: Mutex<usize>,
    wakeup: Condvar,
    active_workers: AtomicUsize,
    idle_wait: Duration,
}

/// Work-stealing pool of worker threads.
pub struct Scheduler {
    shared: Arc<Shared>,
    num_workers: usize,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Create and start a pool with `config.num_workers` threads.
    pub fn start(config: &SchedulerConfig) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            id: NEXT_SCHEDULER_ID.fetch_add(1, Ordering::Relaxed),
            injector: Injector::new(),
            stealers: Mutex::new(Vec::with_capacity(config.num_workers)),
            shutdown: AtomicBool::new(false),
            sleepers: Mutex::new(0),
            wakeup: Condvar::new(),
            active_workers: AtomicUsize::new(0),
            idle_wait: config.idle_wait,
        });

        let mut deques = Vec::with_capacity(config.num_workers);
        for _ in 0..config.num_workers {
            let deque = Deque::new_fifo();
            shared.stealers.lock().push(deque.stealer());
            deques.push(deque);
        }

        let scheduler = Self {
            shared: shared.clone(),
            num_workers: config.num_workers,
            threads: Mutex::new(Vec::with_capacity(config.num_workers)),
        };

        for (index, deque) in deques.into_iter().enumerate() {
            let worker = Worker {
                index,
                shared: shared.clone(),
            };
            let handle = thread::Builder::new()
                .name(format!("{}-{}", config.thread_name_prefix, index))
                .spawn(move || worker.run_loop(deque))?;
            scheduler.threads.lock().push(handle);
        }

        debug!(workers = config.num_workers, "scheduler started");
        Ok(scheduler)
    }

    /// Number of worker threads.
    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Number of workers currently inside their run loop.
    pub fn active_workers(&self) -> usize {
        self.shared.active_workers.load(Ordering::Acquire)
    }

    /// Submit a task. From a worker of this pool it lands on the worker's
    /// local deque; otherwise on the global injector.
    pub(crate) fn submit(&self, task: Task) {
        let id = self.shared.id;
        let leftover = LOCAL.with(|local| match &*local.borrow() {
            Some((owner, deque)) if *owner == id => {
                deque.push(task);
                None
            }
            _ => Some(task),
        });
        if let Some(task) = leftover {
            self.shared.injector.push(task);
        }
        self.shared.notify();
    }

    /// Submit a task behind everything already queued globally.
    pub(crate) fn submit_global(&self, task: Task) {
        self.shared.injector.push(task);
        self.shared.notify();
    }

    /// Stop the workers once their current task finishes, and wait for
    /// them. Tasks still queued are dropped.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let _sleepers = self.shared.sleepers.lock();
            self.shared.wakeup.notify_all();
        }
        let current = thread::current().id();
        let handles: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        for handle in handles {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
        debug!("scheduler stopped");
    }

    /// Whether shutdown was requested.
    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    fn notify(&self) {
        let sleepers = self.sleepers.lock();
        if *sleepers > 0 {
            self.wakeup.notify_one();
        }
    }
}

/// A worker thread in the pool.
struct Worker {
    index: usize,
    shared: Arc<Shared>,
}

impl Worker {
    fn run_loop(self, deque: Deque<Task>) {
        self.shared.active_workers.fetch_add(1, Ordering::AcqRel);
        LOCAL.with(|local| *local.borrow_mut() = Some((self.shared.id, deque)));
        trace!(worker = self.index, "worker started");

        loop {
            if self.shared.shutdown.load(Ordering::Acquire) {
                break;
            }
            if let Some(task) = self.find_work() {
                // A panicking task must not take the worker down with it.
                if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                    error!(worker = self.index, "task panicked outside of a fiber");
                }
                continue;
            }
            self.park();
        }

        LOCAL.with(|local| local.borrow_mut().take());
        self.shared.active_workers.fetch_sub(1, Ordering::AcqRel);
        trace!(worker = self.index, "worker stopped");
    }

    fn park(&self) {
        let mut sleepers = self.shared.sleepers.lock();
        if !self.shared.injector.is_empty() || self.shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        *sleepers += 1;
        self.shared
            .wakeup
            .wait_for(&mut sleepers, self.shared.idle_wait);
        *sleepers -= 1;
    }

    /// Local deque first, then the injector, then the other workers.
    fn find_work(&self) -> Option<Task> {
        let local = LOCAL.with(|local| {
            local
                .borrow()
                .as_ref()
                .and_then(|(_, deque)| deque.pop())
        });
        if local.is_some() {
            return local;
        }

        loop {
            match self.shared.injector.steal() {
                Steal::Success(task) => return Some(task),
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }

        let stealers = self.shared.stealers.lock();
        for (index, stealer) in stealers.iter().enumerate() {
            if index == self.index {
                continue;
            }
            loop {
                match stealer.steal() {
                    Steal::Success(task) => return Some(task),
                    Steal::Empty => break,
                    Steal::Retry => continue,
                }
            }
        }

        None
    }
}

// ============================================================================
// Tests
// ============================================================================
