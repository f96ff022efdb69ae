//! The UI dispatch context.
//!
//! Every state change, callback and listener notification runs on a single
//! consumer of an unbounded queue. [`UiDispatcher`] is the cheap, cloneable
//! sending side; [`DispatchLoop`] owns the queue and runs jobs one at a time,
//! either on a dedicated thread, as an async task, or drained synchronously
//! by a test.

use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::JoinHandle;
use tasklane_core::listener::panic_message;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Job),
    Stop,
}

thread_local! {
    static ON_DISPATCH: Cell<bool> = const { Cell::new(false) };
}

/// Create a connected dispatcher and loop.
pub fn channel() -> (UiDispatcher, DispatchLoop) {
    let (tx, rx) = mpsc::unbounded_channel();
    (UiDispatcher { tx }, DispatchLoop { rx, stopped: false })
}

/// Sending side of the dispatch queue.
#[derive(Clone)]
pub struct UiDispatcher {
    tx: mpsc::UnboundedSender<Message>,
}

impl UiDispatcher {
    /// Whether the caller is currently running a dispatch job.
    pub fn is_dispatch_thread() -> bool {
        ON_DISPATCH.with(|flag| flag.get())
    }

    /// Queue `job` behind everything already posted.
    ///
    /// Returns false when the loop has stopped; the job is dropped.
    pub fn invoke_later<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.tx.send(Message::Run(Box::new(job))).is_err() {
            warn!("Dispatch loop is gone, dropping job");
            return false;
        }
        true
    }

    /// Run `job` inline when already on the dispatch context, else queue it.
    pub fn invoke_now_or_later<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if Self::is_dispatch_thread() {
            job();
            true
        } else {
            self.invoke_later(job)
        }
    }

    /// Run `job` on the dispatch context and wait for its result.
    ///
    /// Returns `None` if the loop stopped before the job ran or the job
    /// panicked.
    pub async fn invoke_and_wait<F, R>(&self, job: F) -> Option<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if Self::is_dispatch_thread() {
            return Some(job());
        }
        let (tx, rx) = oneshot::channel();
        let posted = self.invoke_later(move || {
            let _ = tx.send(job());
        });
        if !posted {
            return None;
        }
        rx.await.ok()
    }

    /// Ask the loop to stop once the jobs queued so far have run.
    pub fn stop(&self) {
        let _ = self.tx.send(Message::Stop);
    }

    /// Whether the loop has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl std::fmt::Debug for UiDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UiDispatcher").field("closed", &self.is_closed()).finish()
    }
}

/// Receiving side of the dispatch queue.
pub struct DispatchLoop {
    rx: mpsc::UnboundedReceiver<Message>,
    stopped: bool,
}

impl DispatchLoop {
    fn run_job(job: Job) {
        let previous = ON_DISPATCH.with(|flag| flag.replace(true));
        if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
            error!("Dispatch job panicked: {}", panic_message(payload.as_ref()));
        }
        ON_DISPATCH.with(|flag| flag.set(previous));
    }

    fn handle(&mut self, message: Message) {
        match message {
            Message::Run(job) => Self::run_job(job),
            Message::Stop => {
                debug!("Dispatch loop stop requested");
                self.stopped = true;
            }
        }
    }

    /// Whether a stop request has been processed.
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Run every job queued right now, without waiting. Returns how many ran.
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        while !self.stopped {
            match self.rx.try_recv() {
                Ok(message) => {
                    if matches!(message, Message::Run(_)) {
                        ran += 1;
                    }
                    self.handle(message);
                }
                Err(_) => break,
            }
        }
        ran
    }

    /// Run jobs until stopped or every dispatcher is dropped.
    pub async fn run(mut self) {
        while !self.stopped {
            match self.rx.recv().await {
                Some(message) => self.handle(message),
                None => break,
            }
        }
        debug!("Dispatch loop exited");
    }

    /// Blocking variant of [`run`](Self::run) for a dedicated thread.
    ///
    /// Must not be called from inside an async runtime.
    pub fn run_blocking(mut self) {
        while !self.stopped {
            match self.rx.blocking_recv() {
                Some(message) => self.handle(message),
                None => break,
            }
        }
        debug!("Dispatch loop exited");
    }

    /// Run the loop on a new named thread.
    pub fn spawn_thread(self, name: &str) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || self.run_blocking())
    }
}
