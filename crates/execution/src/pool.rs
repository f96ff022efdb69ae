//! Bounded worker pool.
//!
//! A fixed number of core workers is started on demand and kept alive.
//! When every worker is busy and work is queued, extra workers are started
//! up to `max_threads`; extra workers retire after `keep_alive` of idleness.
//! The backlog is an unbounded FIFO, so submission never waits.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tasklane_core::PoolConfig;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::{debug, info};

/// Work accepted by a [`WorkerPool`].
#[async_trait]
pub trait PoolJob: Send + 'static {
    /// Run the job to completion on a worker.
    async fn run(self);
}

/// Bounded pool of async workers.
pub struct WorkerPool<J: PoolJob> {
    inner: Arc<PoolInner<J>>,
}

impl<J: PoolJob> Clone for WorkerPool<J> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct PoolInner<J> {
    name: String,
    config: PoolConfig,
    runtime: Handle,
    state: Mutex<PoolState<J>>,
    available: Notify,
    terminated: Notify,
}

struct PoolState<J> {
    queue: VecDeque<J>,
    workers: usize,
    busy: usize,
    shutdown: bool,
    largest: usize,
    completed: u64,
}

impl<J> PoolInner<J> {
    fn state(&self) -> MutexGuard<'_, PoolState<J>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn worker_exited(&self, state: &mut PoolState<J>) {
        state.workers -= 1;
        if state.shutdown && state.workers == 0 {
            info!("Worker pool '{}' terminated", self.name);
            self.terminated.notify_waiters();
        }
    }
}

impl<J: PoolJob> PoolInner<J> {
    /// Next job for a worker, or `None` once the worker should exit.
    ///
    /// A `None` return has already removed the worker from the count.
    async fn next_job(&self) -> Option<J> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if let Some(job) = state.queue.pop_front() {
                    state.busy += 1;
                    return Some(job);
                }
                if state.shutdown {
                    self.worker_exited(&mut state);
                    return None;
                }
            }

            if tokio::time::timeout(self.config.keep_alive(), notified).await.is_err() {
                let mut state = self.state();
                if state.queue.is_empty() && state.workers > self.config.core_threads {
                    debug!("Retiring idle worker of pool '{}'", self.name);
                    self.worker_exited(&mut state);
                    return None;
                }
            }
        }
    }
}

/// Keeps the worker count right if a job unwinds through the worker.
struct WorkerGuard<J: PoolJob> {
    inner: Arc<PoolInner<J>>,
    counted: bool,
}

impl<J: PoolJob> Drop for WorkerGuard<J> {
    fn drop(&mut self) {
        if self.counted {
            let mut state = self.inner.state();
            self.inner.worker_exited(&mut state);
        }
    }
}

struct BusyGuard<'a, J> {
    inner: &'a PoolInner<J>,
}

impl<J> Drop for BusyGuard<'_, J> {
    fn drop(&mut self) {
        let mut state = self.inner.state();
        state.busy -= 1;
        state.completed += 1;
    }
}

async fn worker_loop<J: PoolJob>(inner: Arc<PoolInner<J>>) {
    let mut guard = WorkerGuard {
        inner: inner.clone(),
        counted: true,
    };
    while let Some(job) = inner.next_job().await {
        let _busy = BusyGuard { inner: &inner };
        job.run().await;
    }
    guard.counted = false;
}

impl<J: PoolJob> WorkerPool<J> {
    /// Create a pool that spawns its workers on `runtime`.
    pub fn new(name: impl Into<String>, config: PoolConfig, runtime: Handle) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                config,
                runtime,
                state: Mutex::new(PoolState {
                    queue: VecDeque::new(),
                    workers: 0,
                    busy: 0,
                    shutdown: false,
                    largest: 0,
                    completed: 0,
                }),
                available: Notify::new(),
                terminated: Notify::new(),
            }),
        }
    }

    /// Queue a job. Gives the job back if the pool is shut down.
    pub fn submit(&self, job: J) -> Result<(), J> {
        let spawn = {
            let mut state = self.inner.state();
            if state.shutdown {
                return Err(job);
            }
            state.queue.push_back(job);

            let idle = state.workers - state.busy;
            let spawn = state.workers < self.inner.config.core_threads
                || (idle < state.queue.len() && state.workers < self.inner.config.max_threads);
            if spawn {
                state.workers += 1;
                state.largest = state.largest.max(state.workers);
                debug!(
                    "Pool '{}' starting worker {} (queued: {})",
                    self.inner.name,
                    state.workers,
                    state.queue.len()
                );
            }
            spawn
        };

        if spawn {
            self.inner.runtime.spawn(worker_loop(self.inner.clone()));
        }
        self.inner.available.notify_one();
        Ok(())
    }

    /// Stop accepting jobs; queued and running jobs still complete.
    pub fn shutdown(&self) {
        let mut state = self.inner.state();
        if !state.shutdown {
            info!("Shutting down worker pool '{}'", self.inner.name);
            state.shutdown = true;
        }
        if state.workers == 0 {
            self.inner.terminated.notify_waiters();
        }
        drop(state);
        self.inner.available.notify_waiters();
    }

    /// Stop accepting jobs and return the ones that never started.
    ///
    /// Running jobs are left to the caller to interrupt.
    pub fn shutdown_now(&self) -> Vec<J> {
        let drained: Vec<J> = {
            let mut state = self.inner.state();
            state.shutdown = true;
            if state.workers == 0 {
                self.inner.terminated.notify_waiters();
            }
            state.queue.drain(..).collect()
        };
        info!(
            "Worker pool '{}' shut down now, {} queued job(s) dropped",
            self.inner.name,
            drained.len()
        );
        self.inner.available.notify_waiters();
        drained
    }

    /// Whether shutdown was requested.
    pub fn is_shutdown(&self) -> bool {
        self.inner.state().shutdown
    }

    /// Whether shutdown was requested and every worker has exited.
    pub fn is_terminated(&self) -> bool {
        let state = self.inner.state();
        state.shutdown && state.workers == 0
    }

    /// Wait up to `timeout` for termination. Returns whether it terminated.
    pub async fn await_termination(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.inner.terminated.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.is_terminated() {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    /// Live workers.
    pub fn pool_size(&self) -> usize {
        self.inner.state().workers
    }

    /// Workers currently running a job.
    pub fn active_count(&self) -> usize {
        self.inner.state().busy
    }

    /// Jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.inner.state().queue.len()
    }

    /// Highest worker count seen.
    pub fn largest_pool_size(&self) -> usize {
        self.inner.state().largest
    }

    /// Jobs that ran to completion.
    pub fn completed_count(&self) -> u64 {
        self.inner.state().completed
    }

    /// Pool sizing.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }
}
