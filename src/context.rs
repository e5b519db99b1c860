//! Pool of event-loop execution contexts.
//!
//! An [`IoContextPool`] owns a set of tokio runtimes and the OS threads driving them.
//! Sessions are spread across the pool by fetching a context with
//! [`IoContextPool::get`], which hands out runtime handles in round-robin order.
//!
//! Two layouts are supported:
//!
//! - *multiple contexts*: one current-thread runtime per thread, each thread driving
//!   its own reactor.
//! - *shared context*: a single multi-thread runtime whose worker threads all drive
//!   the same reactor.
//!
//! # Lifecycle
//!
//! ```text
//! Constructing --init()--> Initialized --run()--> Running --stop()--> Stopped
//!                               ^                                       |
//!                               +----------------init()-----------------+
//! ```
//!
//! A stopped pool can be initialized and run again and behaves like a fresh one.
use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use log::{debug, warn};
use thiserror::Error;
use tokio::{
    runtime::{Builder, Handle, Runtime},
    sync::oneshot,
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("run() called before init()")]
    NotInitialized,
    #[error("operation '{operation}' is not valid while the pool is {state}")]
    InvalidState {
        operation: &'static str,
        state: ContextState,
    },
    #[error("failed to create io context: {0}")]
    Runtime(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Constructing,
    Initialized,
    Running,
    Stopped,
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContextState::Constructing => "constructing",
            ContextState::Initialized => "initialized",
            ContextState::Running => "running",
            ContextState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

pub fn hardware_concurrency() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[derive(Debug)]
pub struct IoContextPool {
    size: usize,
    pinned: bool,
    multiple_contexts: bool,
    state: ContextState,
    contexts: Vec<Arc<Runtime>>,
    workers: Vec<Worker>,
    next: AtomicUsize,
}

impl IoContextPool {
    /// Creates the pool and its runtimes; `size == 0` selects the hardware concurrency.
    pub fn new(size: usize, pinned: bool, multiple_contexts: bool) -> Result<Self, ContextError> {
        let hw = hardware_concurrency();
        let size = match size {
            0 => hw,
            n if n > hw => {
                warn!("requested {n} io contexts but only {hw} cores are available; using {hw}");
                hw
            }
            n => n,
        };

        let mut pool = Self {
            size,
            pinned,
            multiple_contexts,
            state: ContextState::Constructing,
            contexts: Vec::new(),
            workers: Vec::new(),
            next: AtomicUsize::new(0),
        };
        pool.build_contexts()?;

        Ok(pool)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn get_context_state(&self) -> ContextState {
        self.state
    }

    pub fn init(&mut self) -> Result<(), ContextError> {
        match self.state {
            ContextState::Initialized | ContextState::Running => {
                warn!("io context pool is already {}; init() ignored", self.state);
                Ok(())
            }
            ContextState::Constructing => {
                self.state = ContextState::Initialized;
                Ok(())
            }
            ContextState::Stopped => {
                self.build_contexts()?;
                self.state = ContextState::Initialized;
                Ok(())
            }
        }
    }

    pub fn run(&mut self) -> Result<(), ContextError> {
        match self.state {
            ContextState::Initialized => {}
            ContextState::Running => {
                warn!("io context pool is already running; run() ignored");
                return Ok(());
            }
            ContextState::Constructing | ContextState::Stopped => {
                return Err(ContextError::NotInitialized);
            }
        }

        if self.multiple_contexts {
            for (id, runtime) in self.contexts.iter().enumerate() {
                self.workers
                    .push(Worker::new(id, Arc::clone(runtime), self.pinned)?);
            }
        }

        self.state = ContextState::Running;
        debug!(
            "io context pool running with {} threads ({} contexts)",
            self.size,
            self.contexts.len()
        );
        Ok(())
    }

    /// Next execution context in round-robin order.
    pub fn get(&self) -> Result<Handle, ContextError> {
        match self.state {
            ContextState::Constructing | ContextState::Running => {}
            state => {
                return Err(ContextError::InvalidState {
                    operation: "get",
                    state,
                });
            }
        }

        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.contexts.len();
        Ok(self.contexts[index].handle().clone())
    }

    /// Stops all reactors and joins their threads.
    ///
    /// Must not be called from within one of the pool's own contexts.
    pub fn stop(&mut self) {
        if self.state == ContextState::Stopped {
            warn!("io context pool is already stopped; stop() ignored");
            return;
        }

        for worker in self.workers.drain(..) {
            worker.shutdown();
        }

        for runtime in self.contexts.drain(..) {
            match Arc::try_unwrap(runtime) {
                Ok(runtime) => runtime.shutdown_timeout(SHUTDOWN_GRACE),
                Err(_) => warn!("io context still referenced after its thread was joined"),
            }
        }

        self.next.store(0, Ordering::Relaxed);
        self.state = ContextState::Stopped;
    }

    fn build_contexts(&mut self) -> Result<(), ContextError> {
        if self.multiple_contexts {
            for _ in 0..self.size {
                let runtime = Builder::new_current_thread().enable_all().build()?;
                self.contexts.push(Arc::new(runtime));
            }
        } else {
            let (pinned, size) = (self.pinned, self.size);
            let started = Arc::new(AtomicUsize::new(0));
            let runtime = Builder::new_multi_thread()
                .worker_threads(self.size)
                .enable_all()
                .on_thread_start(move || {
                    if let Some(core) = pinned.then(|| next_core(&started, size)).flatten() {
                        pin_to_core(core);
                    }
                })
                .build()?;
            self.contexts.push(Arc::new(runtime));
        }
        Ok(())
    }
}

impl Drop for IoContextPool {
    fn drop(&mut self) {
        if self.state != ContextState::Stopped {
            self.stop();
        }
    }
}

#[derive(Debug)]
struct Worker {
    id: usize,
    shutdown: oneshot::Sender<()>,
    thread: thread::JoinHandle<()>,
}

impl Worker {
    fn new(id: usize, runtime: Arc<Runtime>, pinned: bool) -> Result<Self, ContextError> {
        let (shutdown, signal) = oneshot::channel::<()>();
        let thread = thread::Builder::new()
            .name(format!("io-context-{id}"))
            .spawn(move || {
                if pinned {
                    pin_to_core(id);
                }
                debug!("io context {id} running");
                runtime.block_on(async {
                    let _ = signal.await;
                });
                debug!("io context {id} stopped");
            })?;

        Ok(Self {
            id,
            shutdown,
            thread,
        })
    }

    fn shutdown(self) {
        let _ = self.shutdown.send(());
        if self.thread.join().is_err() {
            warn!("io context thread {} panicked", self.id);
        }
    }
}

/// Core for the next thread started by a shared runtime, if it gets one.
///
/// Tokio calls `on_thread_start` for its blocking-pool threads as well. The worker
/// threads are all started while the runtime is built, so only the first `size`
/// starts are pinned and `spawn_blocking` threads keep the default affinity.
fn next_core(started: &AtomicUsize, size: usize) -> Option<usize> {
    let id = started.fetch_add(1, Ordering::Relaxed);
    (id < size).then_some(id)
}

/// Binds the calling thread to `core` (modulo the number of cores).
#[cfg(target_os = "linux")]
fn pin_to_core(core: usize) {
    let core = core % hardware_concurrency();

    // SAFETY: cpu_set_t is plain data, zero-initialisation is its empty set, and the
    // pointer handed to sched_setaffinity is valid for the duration of the call.
    let rc = unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        libc::sched_setaffinity(0, size_of::<libc::cpu_set_t>(), &set)
    };
    if rc != 0 {
        warn!(
            "failed to pin thread to core {core}: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_to_core(_core: usize) {}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    fn spawn_and_wait(pool: &IoContextPool) -> u32 {
        let (tx, rx) = mpsc::channel();
        pool.get().unwrap().spawn(async move {
            tokio::time::sleep(Duration::from_millis(1)).await;
            tx.send(42).unwrap();
        });
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn pool_size_zero_uses_hardware_concurrency() {
        let pool = IoContextPool::new(0, false, true).unwrap();
        assert_eq!(pool.size(), hardware_concurrency());
    }

    #[test]
    fn pool_size_is_capped() {
        let pool = IoContextPool::new(hardware_concurrency() + 8, false, true).unwrap();
        assert_eq!(pool.size(), hardware_concurrency());
    }

    #[test]
    fn run_before_init_fails() {
        let mut pool = IoContextPool::new(1, false, true).unwrap();
        assert!(matches!(pool.run(), Err(ContextError::NotInitialized)));
        assert_eq!(pool.get_context_state(), ContextState::Constructing);
    }

    #[test]
    fn get_after_stop_fails() {
        let mut pool = IoContextPool::new(1, false, true).unwrap();
        pool.init().unwrap();
        pool.run().unwrap();
        pool.stop();

        assert!(matches!(
            pool.get(),
            Err(ContextError::InvalidState {
                operation: "get",
                state: ContextState::Stopped
            })
        ));
    }

    #[test]
    fn repeated_init_and_stop_are_ignored() {
        let mut pool = IoContextPool::new(1, false, true).unwrap();
        pool.init().unwrap();
        pool.init().unwrap();
        assert_eq!(pool.get_context_state(), ContextState::Initialized);

        pool.run().unwrap();
        pool.stop();
        pool.stop();
        assert_eq!(pool.get_context_state(), ContextState::Stopped);
    }

    #[test]
    fn pool_restarts_after_stop() {
        let mut pool = IoContextPool::new(2, false, true).unwrap();
        pool.init().unwrap();
        pool.run().unwrap();
        assert_eq!(spawn_and_wait(&pool), 42);
        pool.stop();

        pool.init().unwrap();
        pool.run().unwrap();
        assert_eq!(pool.get_context_state(), ContextState::Running);
        assert_eq!(spawn_and_wait(&pool), 42);
        assert_eq!(spawn_and_wait(&pool), 42);
        pool.stop();
    }

    #[test]
    fn shared_context_runs_tasks() {
        let mut pool = IoContextPool::new(2, false, false).unwrap();
        pool.init().unwrap();
        pool.run().unwrap();

        assert_eq!(spawn_and_wait(&pool), 42);
        pool.stop();
    }

    #[test]
    fn pinned_pool_runs_tasks() {
        let mut pool = IoContextPool::new(1, true, true).unwrap();
        pool.init().unwrap();
        pool.run().unwrap();

        assert_eq!(spawn_and_wait(&pool), 42);
        pool.stop();
    }

    #[test]
    fn only_worker_threads_are_pinned() {
        let started = AtomicUsize::new(0);

        assert_eq!(next_core(&started, 2), Some(0));
        assert_eq!(next_core(&started, 2), Some(1));
        assert_eq!(next_core(&started, 2), None);
        assert_eq!(next_core(&started, 2), None);
    }

    #[test]
    fn pinned_shared_context_runs_blocking_tasks() {
        let mut pool = IoContextPool::new(1, true, false).unwrap();
        pool.init().unwrap();
        pool.run().unwrap();

        let (tx, rx) = mpsc::channel();
        pool.get().unwrap().spawn(async move {
            let value = tokio::task::spawn_blocking(|| 7).await.unwrap();
            tx.send(value).unwrap();
        });

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
        pool.stop();
    }

    #[test]
    fn contexts_are_handed_out_round_robin() {
        if hardware_concurrency() < 2 {
            return;
        }
        let mut pool = IoContextPool::new(2, false, true).unwrap();
        pool.init().unwrap();
        pool.run().unwrap();

        let thread_of = |handle: Handle| {
            let (tx, rx) = mpsc::channel();
            handle.spawn(async move {
                tx.send(thread::current().name().map(String::from)).unwrap();
            });
            rx.recv_timeout(Duration::from_secs(5)).unwrap()
        };
        let a = thread_of(pool.get().unwrap());
        let b = thread_of(pool.get().unwrap());
        let c = thread_of(pool.get().unwrap());

        assert_ne!(a, b);
        assert_eq!(a, c);
        pool.stop();
    }
}
