//! Dual-mode executor for forwarding futures and their completions.
//!
//! ## Architecture
//!
//! ```text
//!             execute(future, continuation)
//!                        │
//!         ┌──────────────┴──────────────┐
//!       Sync                          Async
//!         │                             │
//!  block caller until done      spawn, return at once
//!  or forward timeout                   │
//!         │                      future resolves
//!  continuation inline                  │
//!                           permit free? ──yes──► worker pool
//!                                │
//!                                no ──► completing task runs it
//! ```
//!
//! Futures run on a runtime owned by the scheduler, so a synchronous wait
//! never depends on the caller's executor making progress.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rbel_core::{SchedulerConfig, SchedulerMode};
use tokio::runtime::{Handle, Runtime, RuntimeFlavor};
use tokio::sync::Semaphore;

use crate::error::{Result, SchedulerError};

/// Counts continuations that have not finished yet.
#[derive(Debug, Default)]
struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

impl InFlight {
    fn enter(self: &Arc<Self>) -> InFlightGuard {
        *self.count.lock() += 1;
        InFlightGuard {
            tracker: self.clone(),
        }
    }

    fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count > 0 {
            if self.idle.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }
}

struct InFlightGuard {
    tracker: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut count = self.tracker.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.tracker.idle.notify_all();
        }
    }
}

/// Runs forwarding futures and hands their outcome to a continuation.
pub struct Scheduler {
    runtime: Option<Runtime>,
    handle: Handle,
    permits: Arc<Semaphore>,
    pool_size: usize,
    forward_timeout: Duration,
    mode: SchedulerMode,
    in_flight: Arc<InFlight>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("mode", &self.mode)
            .field("pool_size", &self.pool_size)
            .field("forward_timeout", &self.forward_timeout)
            .field("in_flight", &*self.in_flight.count.lock())
            .finish()
    }
}

impl Scheduler {
    /// Creates a scheduler with its own worker runtime.
    pub fn new(config: &SchedulerConfig) -> Result<Self> {
        let pool_size = config.pool_size();
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(pool_size)
            .thread_name("rbel-scheduler")
            .enable_all()
            .build()?;
        tracing::debug!(
            "Scheduler started: mode={:?}, pool={}, timeout={:?}",
            config.mode,
            pool_size,
            config.forward_timeout()
        );
        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
            permits: Arc::new(Semaphore::new(pool_size)),
            pool_size,
            forward_timeout: config.forward_timeout(),
            mode: config.mode,
            in_flight: Arc::new(InFlight::default()),
        })
    }

    /// The default execution mode.
    pub fn mode(&self) -> SchedulerMode {
        self.mode
    }

    /// Maximum number of continuations running on the worker pool at once.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Upper bound for synchronous waits.
    pub fn forward_timeout(&self) -> Duration {
        self.forward_timeout
    }

    /// Runs `future` and passes its outcome to `continuation`, in the default mode.
    pub fn execute<F, T, C>(&self, future: F, continuation: C)
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
        C: FnOnce(std::result::Result<T, SchedulerError>) + Send + 'static,
    {
        self.execute_with_mode(self.mode, future, continuation);
    }

    /// Runs `future` and passes its outcome to `continuation`.
    ///
    /// In [`SchedulerMode::Sync`] this returns after the continuation ran.
    /// In [`SchedulerMode::Async`] it returns immediately.
    pub fn execute_with_mode<F, T, C>(&self, mode: SchedulerMode, future: F, continuation: C)
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
        C: FnOnce(std::result::Result<T, SchedulerError>) + Send + 'static,
    {
        match mode {
            SchedulerMode::Sync => {
                let result = self.wait_for(future);
                continuation(result);
            }
            SchedulerMode::Async => self.attach(future, continuation),
        }
    }

    /// Blocks until `future` resolves, fails or exceeds the forward timeout.
    pub fn wait_for<F, T>(&self, future: F) -> std::result::Result<T, SchedulerError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let timeout = self.forward_timeout;
        let task = self.handle.spawn(async move {
            let inner = tokio::spawn(future);
            let abort = inner.abort_handle();
            match tokio::time::timeout(timeout, inner).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(_)) => Err(SchedulerError::Cancelled),
                Err(_) => {
                    abort.abort();
                    tracing::debug!("Forwarding future timed out after {:?}", timeout);
                    Err(SchedulerError::Timeout(timeout))
                }
            }
        });

        let joined = match Handle::try_current() {
            Ok(current) if current.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| futures::executor::block_on(task))
            }
            _ => futures::executor::block_on(task),
        };
        joined.unwrap_or(Err(SchedulerError::Shutdown))
    }

    fn attach<F, T, C>(&self, future: F, continuation: C)
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
        C: FnOnce(std::result::Result<T, SchedulerError>) + Send + 'static,
    {
        let guard = self.in_flight.enter();
        let permits = self.permits.clone();
        self.handle.spawn(async move {
            let result = match tokio::spawn(future).await {
                Ok(value) => Ok(value),
                Err(_) => Err(SchedulerError::Cancelled),
            };
            match permits.try_acquire_owned() {
                Ok(permit) => {
                    let _ = tokio::task::spawn_blocking(move || {
                        continuation(result);
                        drop(permit);
                        drop(guard);
                    })
                    .await;
                }
                Err(_) => {
                    tracing::debug!("Worker pool saturated, running continuation on completing task");
                    tokio::task::block_in_place(|| continuation(result));
                    drop(guard);
                }
            }
        });
    }

    /// Waits until every attached continuation has finished.
    ///
    /// Returns false if some were still running when `timeout` elapsed.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.in_flight.wait_idle(timeout)
    }

    /// Waits for pending continuations, then stops the worker runtime.
    pub fn shutdown(self, timeout: Duration) {
        if !self.wait_idle(timeout) {
            tracing::warn!("Scheduler shut down with continuations still running");
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
