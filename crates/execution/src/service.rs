//! Task services: a named worker pool plus the list of tasks it owns.

use crate::context::AppContext;
use crate::dispatch::UiDispatcher;
use crate::pool::WorkerPool;
use crate::task::{Task, TaskRunner};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tasklane_core::{
    BlockingScope, ListenerId, Listeners, PoolConfig, TaskEventPayload, TaskId, UsageError,
};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

/// Published on the dispatch context whenever a service's task list changes.
#[derive(Debug, Clone)]
pub struct TasksChanged {
    /// Service name
    pub service: String,
    /// List before the change
    pub old: Vec<Task>,
    /// List after the change
    pub new: Vec<Task>,
}

impl TasksChanged {
    /// Tasks present in `new` but not in `old`.
    pub fn added(&self) -> Vec<Task> {
        self.new.iter().filter(|t| !self.old.contains(t)).cloned().collect()
    }

    /// Tasks present in `old` but not in `new`.
    pub fn removed(&self) -> Vec<Task> {
        self.old.iter().filter(|t| !self.new.contains(t)).cloned().collect()
    }
}

#[derive(Default)]
struct ServiceState {
    tasks: Vec<Task>,
    observers: HashMap<TaskId, ListenerId>,
}

struct ServiceInner {
    name: String,
    pool: WorkerPool<TaskRunner>,
    dispatcher: UiDispatcher,
    state: Mutex<ServiceState>,
    listeners: Listeners<TasksChanged>,
}

/// Named executor for tasks.
///
/// Tasks are listed from submission until their completion sequence has
/// run, in submission order.
#[derive(Clone)]
pub struct TaskService {
    inner: Arc<ServiceInner>,
}

impl TaskService {
    /// Create a service with the context's pool configuration.
    pub fn new(name: impl Into<String>, context: &AppContext) -> Self {
        Self::with_pool_config(name, context.config().pool, context)
    }

    /// Create a service with its own pool configuration.
    pub fn with_pool_config(name: impl Into<String>, config: PoolConfig, context: &AppContext) -> Self {
        Self::from_parts(name.into(), config, context.dispatcher().clone(), context.runtime().clone())
    }

    pub(crate) fn from_parts(name: String, config: PoolConfig, dispatcher: UiDispatcher, runtime: Handle) -> Self {
        debug!(
            "Creating task service '{}' ({}..{} workers)",
            name, config.core_threads, config.max_threads
        );
        Self {
            inner: Arc::new(ServiceInner {
                pool: WorkerPool::new(name.clone(), config, runtime),
                name,
                dispatcher,
                state: Mutex::new(ServiceState::default()),
                listeners: Listeners::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ServiceState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Service name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Snapshot of the owned tasks, oldest first.
    pub fn tasks(&self) -> Vec<Task> {
        self.state().tasks.clone()
    }

    /// Workers currently alive.
    pub fn pool_size(&self) -> usize {
        self.inner.pool.pool_size()
    }

    /// Workers currently running a task.
    pub fn active_count(&self) -> usize {
        self.inner.pool.active_count()
    }

    /// Submitted tasks waiting for a worker.
    pub fn queued_count(&self) -> usize {
        self.inner.pool.queued()
    }

    /// Listen for task list changes. Callbacks run on the dispatch context.
    pub fn subscribe<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&TasksChanged) + Send + Sync + 'static,
    {
        self.inner.listeners.add(callback)
    }

    /// Remove a listener.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    /// Submit a pending task.
    ///
    /// The task is listed and its input blocker applied before it reaches
    /// the pool. Fails if the task was already submitted, is no longer
    /// pending, or the service is shut down.
    pub fn execute(&self, task: &Task) -> Result<(), UsageError> {
        if self.is_shutdown() {
            return Err(UsageError::Rejected(self.inner.name.clone()));
        }
        task.claim(&self.inner.name)?;

        {
            let mut state = self.state();
            let old = state.tasks.clone();
            state.tasks.push(task.clone());
            let weak = Arc::downgrade(&self.inner);
            let observer = task.subscribe(move |event| {
                if matches!(event.payload, TaskEventPayload::Done) {
                    if let Some(service) = upgrade(&weak) {
                        service.task_done(event.task_id);
                    }
                }
            });
            state.observers.insert(task.id(), observer);
            let new = state.tasks.clone();
            self.publish(old, new);
        }
        info!("Service '{}' executing task {}", self.inner.name, task.id());

        // A task cancelled since `claim` may already have published Done,
        // possibly before the observer above was attached.
        let service = self.clone();
        let submitted = task.clone();
        self.inner.dispatcher.invoke_now_or_later(move || {
            if submitted.is_done() {
                service.task_done(submitted.id());
            } else if let Some(blocker) = submitted.input_blocker() {
                if blocker.scope() != BlockingScope::None {
                    blocker.block();
                }
            }
        });

        if let Err(runner) = self.inner.pool.submit(task.runner()) {
            warn!("Service '{}' rejected task {}", self.inner.name, task.id());
            runner.into_task().abort_unstarted();
            return Err(UsageError::Rejected(self.inner.name.clone()));
        }
        Ok(())
    }

    /// Post a change notification. Always queued so it never runs under the
    /// state lock.
    fn publish(&self, old: Vec<Task>, new: Vec<Task>) {
        let inner = self.inner.clone();
        let event = TasksChanged {
            service: self.inner.name.clone(),
            old,
            new,
        };
        self.inner
            .dispatcher
            .invoke_later(move || {
                inner.listeners.emit(&event);
            });
    }

    /// Drop a finished task and release its blocker. Runs on the dispatch
    /// context, after the task published `Done`.
    fn task_done(&self, id: TaskId) {
        let task = {
            let mut state = self.state();
            let Some(pos) = state.tasks.iter().position(|t| t.id() == id) else {
                return;
            };
            let old = state.tasks.clone();
            let task = state.tasks.remove(pos);
            if let Some(observer) = state.observers.remove(&id) {
                task.unsubscribe(observer);
            }
            let new = state.tasks.clone();
            self.publish(old, new);
            task
        };
        debug!("Service '{}' removed task {}", self.inner.name, id);

        if let Some(blocker) = task.input_blocker() {
            blocker.unblock();
        }
    }

    /// Stop accepting tasks; queued tasks still run.
    pub fn shutdown(&self) {
        info!("Shutting down task service '{}'", self.inner.name);
        self.inner.pool.shutdown();
    }

    /// Stop accepting tasks, cancel queued ones and interrupt running ones.
    ///
    /// Returns the tasks that never started; they complete as cancelled.
    pub fn shutdown_now(&self) -> Vec<Task> {
        info!("Shutting down task service '{}' now", self.inner.name);
        let never_started: Vec<Task> = self
            .inner
            .pool
            .shutdown_now()
            .into_iter()
            .map(TaskRunner::into_task)
            .collect();
        for task in &never_started {
            task.abort_unstarted();
        }
        for task in self.tasks() {
            if task.is_started() {
                task.cancel(true);
            }
        }
        never_started
    }

    /// Whether shutdown was requested.
    pub fn is_shutdown(&self) -> bool {
        self.inner.pool.is_shutdown()
    }

    /// Whether shut down and every worker has exited.
    pub fn is_terminated(&self) -> bool {
        self.inner.pool.is_terminated()
    }

    /// Wait up to `timeout` for termination.
    pub async fn await_termination(&self, timeout: Duration) -> bool {
        self.inner.pool.await_termination(timeout).await
    }
}

fn upgrade(weak: &Weak<ServiceInner>) -> Option<TaskService> {
    weak.upgrade().map(|inner| TaskService { inner })
}

impl PartialEq for TaskService {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for TaskService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskService")
            .field("name", &self.inner.name)
            .field("tasks", &self.state().tasks.len())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocker::tests::RecordingUi;
    use crate::dispatch::DispatchLoop;
    use crate::task::TaskContext;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tasklane_core::{TaskError, TaskState};
    use tokio::sync::Semaphore;

    fn context() -> (AppContext, DispatchLoop) {
        AppContext::builder().build().unwrap()
    }

    /// Pump the dispatch loop until `cond` holds.
    async fn pump_until(dispatch: &mut DispatchLoop, cond: impl Fn() -> bool) {
        for _ in 0..2000 {
            dispatch.run_pending();
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_execute_lists_task_until_done() {
        let (ctx, mut dispatch) = context();
        let service = ctx.task_service();
        let gate = Arc::new(Semaphore::new(0));
        let g = gate.clone();
        let task = Task::new(&ctx, move |_cx| async move {
            let _permit = g.acquire().await.map_err(TaskError::msg)?;
            Ok(())
        });

        service.execute(&task).unwrap();
        assert_eq!(service.tasks(), vec![task.clone()]);
        assert_eq!(task.service_name().as_deref(), Some(tasklane_core::DEFAULT_SERVICE_NAME));

        gate.add_permits(1);
        pump_until(&mut dispatch, || task.is_done()).await;
        dispatch.run_pending();
        assert!(service.tasks().is_empty());
    }

    #[tokio::test]
    async fn test_double_execute_is_rejected() {
        let (ctx, mut dispatch) = context();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let task = Task::new(&ctx, move |_cx| async move {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let other = TaskService::new("other", &ctx);

        assert!(ctx.task_service().execute(&task).is_ok());
        assert!(matches!(
            ctx.task_service().execute(&task),
            Err(UsageError::AlreadyExecuted { .. })
        ));
        assert!(other.execute(&task).is_err());

        pump_until(&mut dispatch, || task.is_done()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_execute_accepts_once() {
        let (ctx, mut dispatch) = context();
        let task = Task::new(&ctx, |_cx| async { Ok(()) });

        let mut handles = Vec::new();
        for _ in 0..8 {
            let service = ctx.task_service();
            let task = task.clone();
            handles.push(tokio::spawn(async move { service.execute(&task).is_ok() }));
        }
        let mut accepted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1);

        pump_until(&mut dispatch, || task.is_done()).await;
        assert_eq!(task.outcome(), Some(TaskState::Succeeded));
    }

    #[tokio::test]
    async fn test_execute_after_cancel_is_rejected() {
        let (ctx, mut dispatch) = context();
        let task = Task::new(&ctx, |_cx| async { Ok(()) });
        task.cancel(false);
        dispatch.run_pending();

        assert!(ctx.task_service().execute(&task).is_err());
        assert!(ctx.task_service().tasks().is_empty());
    }

    #[tokio::test]
    async fn test_tasks_changed_events() {
        let (ctx, mut dispatch) = context();
        let service = ctx.task_service();
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let s = sizes.clone();
        service.subscribe(move |change| {
            s.lock().unwrap().push((change.old.len(), change.new.len(), change.added().len(), change.removed().len()));
        });

        let task = Task::new(&ctx, |_cx| async { Ok(()) });
        service.execute(&task).unwrap();
        pump_until(&mut dispatch, || task.is_done()).await;
        dispatch.run_pending();

        assert_eq!(*sizes.lock().unwrap(), vec![(0, 1, 1, 0), (1, 0, 0, 1)]);
    }

    #[tokio::test]
    async fn test_cancel_queued_task_completes_once() {
        let (ctx, mut dispatch) = context();
        let service = TaskService::with_pool_config("single", PoolConfig::new().with_core_threads(1).with_max_threads(1), &ctx);
        let gate = Arc::new(Semaphore::new(0));
        let g = gate.clone();
        let blocker_task = Task::new(&ctx, move |_cx| async move {
            let _permit = g.acquire().await.map_err(TaskError::msg)?;
            Ok(())
        });
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let queued = Task::new(&ctx, move |_cx| async move {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let completed = Arc::new(AtomicUsize::new(0));
        let done = completed.clone();
        queued.subscribe(move |event| {
            if matches!(event.payload, TaskEventPayload::Completed) {
                done.fetch_add(1, Ordering::SeqCst);
            }
        });

        service.execute(&blocker_task).unwrap();
        service.execute(&queued).unwrap();
        assert!(queued.cancel(true));

        gate.add_permits(1);
        pump_until(&mut dispatch, || queued.is_done() && blocker_task.is_done()).await;
        dispatch.run_pending();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(completed.load(Ordering::SeqCst), 1);
        assert_eq!(queued.outcome(), Some(TaskState::Cancelled));
        assert!(service.tasks().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_queued_task_releases_block_while_worker_busy() {
        let ui = Arc::new(RecordingUi::default());
        let config = tasklane_core::AppConfig {
            busy_indicator_delay_ms: 10_000,
            ..tasklane_core::AppConfig::default()
        };
        let (ctx, mut dispatch) = AppContext::builder().config(config).blocking_ui(ui.clone()).build().unwrap();
        let service = TaskService::with_pool_config("single", PoolConfig::new().with_core_threads(1).with_max_threads(1), &ctx);
        let gate = Arc::new(Semaphore::new(0));
        let g = gate.clone();
        let busy = Task::new(&ctx, move |_cx| async move {
            let _permit = g.acquire().await.map_err(TaskError::msg)?;
            Ok(())
        });
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let queued = Task::builder(&ctx, move |_cx| async move {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .block(BlockingScope::Window, None)
        .build();

        service.execute(&busy).unwrap();
        service.execute(&queued).unwrap();
        pump_until(&mut dispatch, || busy.is_started()).await;
        assert!(queued.input_blocker().unwrap().is_blocked());

        assert!(queued.cancel(false));
        pump_until(&mut dispatch, || queued.is_done()).await;
        dispatch.run_pending();

        assert!(!busy.is_done());
        assert_eq!(queued.outcome(), Some(TaskState::Cancelled));
        assert!(!queued.input_blocker().unwrap().is_blocked());
        assert_eq!(service.tasks(), vec![busy.clone()]);
        assert_eq!(ui.calls(), vec!["block window None", "unblock window None"]);

        gate.add_permits(1);
        pump_until(&mut dispatch, || busy.is_done()).await;
        dispatch.run_pending();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(service.tasks().is_empty());
    }

    /// Run a blocked task, cancel it once its body is running, and return
    /// the outcome with the blocking calls made.
    async fn cancel_running(may_interrupt: bool) -> (Option<TaskState>, Vec<String>) {
        let ui = Arc::new(RecordingUi::default());
        let (ctx, mut dispatch) = AppContext::builder().blocking_ui(ui.clone()).build().unwrap();
        let entered = Arc::new(Semaphore::new(0));
        let e = entered.clone();
        let task = Task::builder(&ctx, move |cx: TaskContext| async move {
            e.add_permits(1);
            if may_interrupt {
                cx.sleep(Duration::from_secs(60)).await?;
            } else {
                cx.cancelled().await;
            }
            Ok(())
        })
        .block(BlockingScope::Window, None)
        .build();

        ctx.task_service().execute(&task).unwrap();
        pump_until(&mut dispatch, || entered.available_permits() > 0).await;
        assert!(task.cancel(may_interrupt));
        pump_until(&mut dispatch, || task.is_done()).await;
        dispatch.run_pending();

        assert!(!task.input_blocker().unwrap().is_blocked());
        (task.outcome(), ui.calls())
    }

    #[tokio::test]
    async fn test_cooperative_cancel_of_running_task_releases_block() {
        let (outcome, calls) = cancel_running(false).await;
        assert_eq!(outcome, Some(TaskState::Cancelled));
        assert_eq!(calls, vec!["block window None", "unblock window None"]);
    }

    #[tokio::test]
    async fn test_interrupting_cancel_of_running_task_releases_block() {
        let (outcome, calls) = cancel_running(true).await;
        assert_eq!(outcome, Some(TaskState::Interrupted));
        assert_eq!(calls, vec!["block window None", "unblock window None"]);
    }

    #[tokio::test]
    async fn test_blocker_released_on_every_outcome() {
        for (outcome, expected) in [
            ("ok", TaskState::Succeeded),
            ("fail", TaskState::Failed),
            ("cancel", TaskState::Cancelled),
        ] {
            let ui = Arc::new(RecordingUi::default());
            let (ctx, mut dispatch) = AppContext::builder().blocking_ui(ui.clone()).build().unwrap();
            let fail = outcome == "fail";
            let task = Task::builder(&ctx, move |cx: TaskContext| async move {
                if fail {
                    return Err(TaskError::msg("failed"));
                }
                cx.sleep(Duration::from_millis(20)).await?;
                Ok(())
            })
            .block(BlockingScope::Window, None)
            .build();

            ctx.task_service().execute(&task).unwrap();
            if outcome == "cancel" {
                // Still queued: the worker has not been polled yet.
                assert!(task.cancel(false));
            }
            pump_until(&mut dispatch, || task.is_done()).await;
            dispatch.run_pending();

            assert_eq!(task.outcome(), Some(expected), "outcome {}", outcome);
            assert_eq!(ui.calls(), vec!["block window None", "unblock window None"], "outcome {}", outcome);
            assert!(!task.input_blocker().unwrap().is_blocked());
        }
    }

    #[tokio::test]
    async fn test_block_precedes_body() {
        let ui = Arc::new(RecordingUi::default());
        let (ctx, mut dispatch) = AppContext::builder().blocking_ui(ui.clone()).build().unwrap();
        let observed = Arc::new(Mutex::new(None));
        let o = observed.clone();
        let u = ui.clone();
        let task = Task::builder(&ctx, move |_cx| async move {
            *o.lock().unwrap() = Some(u.calls().len());
            Ok(())
        })
        .block(BlockingScope::Application, None)
        .build();

        ctx.task_service().execute(&task).unwrap();
        pump_until(&mut dispatch, || task.is_done()).await;
        assert_eq!(*observed.lock().unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_tasks() {
        let (ctx, mut dispatch) = context();
        let service = TaskService::new("short-lived", &ctx);
        let task = Task::new(&ctx, |_cx| async { Ok(()) });
        service.execute(&task).unwrap();
        service.shutdown();

        let late = Task::new(&ctx, |_cx| async { Ok(()) });
        assert_eq!(service.execute(&late), Err(UsageError::Rejected("short-lived".to_string())));
        assert!(late.is_pending());

        pump_until(&mut dispatch, || task.is_done()).await;
        assert!(service.await_termination(Duration::from_secs(2)).await);
        assert!(service.is_terminated());
    }

    #[tokio::test]
    async fn test_shutdown_now_cancels_queued_and_interrupts_running() {
        let (ctx, mut dispatch) = context();
        let service = TaskService::with_pool_config("one", PoolConfig::new().with_core_threads(1).with_max_threads(1), &ctx);
        let running = Task::new(&ctx, |cx: TaskContext| async move {
            cx.sleep(Duration::from_secs(60)).await?;
            Ok(())
        });
        let queued = Task::new(&ctx, |_cx| async { Ok(()) });

        service.execute(&running).unwrap();
        service.execute(&queued).unwrap();
        pump_until(&mut dispatch, || running.is_started()).await;

        let never_started = service.shutdown_now();
        assert_eq!(never_started, vec![queued.clone()]);

        pump_until(&mut dispatch, || running.is_done() && queued.is_done()).await;
        assert_eq!(running.outcome(), Some(TaskState::Interrupted));
        assert_eq!(queued.outcome(), Some(TaskState::Cancelled));
        assert!(service.await_termination(Duration::from_secs(2)).await);
    }
}
