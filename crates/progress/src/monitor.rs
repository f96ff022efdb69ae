//! Foreground task tracking.
//!
//! A [`TaskMonitor`] watches every task service of a context, including
//! services registered later, and elects one running task as the
//! foreground task. Status bars bind to the monitor instead of to
//! individual tasks: the foreground task's message and progress changes are
//! re-published as [`MonitorEvent`]s.
//!
//! The first task to start becomes the foreground task. When it is done,
//! the oldest task that is still running takes over.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tasklane_core::{ListenerId, Listeners, TaskEvent, TaskEventPayload, TaskId, TaskState};
use tasklane_execution::{AppContext, ContextEvent, Task, TaskService, TasksChanged};
use tracing::debug;

/// Published on the dispatch context.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    /// A different task (or none) is now in the foreground
    ForegroundChanged {
        /// Previous foreground task
        old: Option<Task>,
        /// New foreground task
        new: Option<Task>,
    },

    /// The foreground task's message changed
    Message {
        /// Previous message
        old: Option<String>,
        /// New message
        new: Option<String>,
    },

    /// The foreground task's progress changed
    Progress {
        /// Previous progress
        old: Option<u8>,
        /// New progress
        new: Option<u8>,
    },

    /// The foreground task changed state
    State {
        /// Task that changed
        task: Task,
        /// Its new state
        state: TaskState,
    },
}

#[derive(Default)]
struct MonitorState {
    tasks: Vec<Task>,
    task_listeners: HashMap<TaskId, ListenerId>,
    services: Vec<(TaskService, ListenerId)>,
    context_listener: Option<ListenerId>,
    foreground: Option<Task>,
}

struct MonitorInner {
    context: AppContext,
    state: Mutex<MonitorState>,
    listeners: Listeners<MonitorEvent>,
}

/// Tracks the foreground task across all of a context's services.
#[derive(Clone)]
pub struct TaskMonitor {
    inner: Arc<MonitorInner>,
}

impl TaskMonitor {
    /// Start monitoring `context`.
    pub fn new(context: &AppContext) -> Self {
        let monitor = Self {
            inner: Arc::new(MonitorInner {
                context: context.clone(),
                state: Mutex::new(MonitorState::default()),
                listeners: Listeners::new(),
            }),
        };

        let weak = monitor.weak();
        let id = context.subscribe(move |event| {
            let ContextEvent::ServiceAdded(service) = event;
            if let Some(monitor) = upgrade(&weak) {
                monitor.watch_service(service);
            }
        });
        monitor.state().context_listener = Some(id);

        for service in context.task_services() {
            monitor.watch_service(&service);
        }
        monitor
    }

    fn weak(&self) -> Weak<MonitorInner> {
        Arc::downgrade(&self.inner)
    }

    fn state(&self) -> MutexGuard<'_, MonitorState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The task status displays should follow.
    pub fn foreground_task(&self) -> Option<Task> {
        self.state().foreground.clone()
    }

    /// Every task currently owned by a watched service, oldest first.
    pub fn tasks(&self) -> Vec<Task> {
        self.state().tasks.clone()
    }

    /// Listen for monitor events. Callbacks run on the dispatch context.
    pub fn subscribe<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&MonitorEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.add(callback)
    }

    /// Remove a listener.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    /// Detach from the context, its services and their tasks.
    pub fn close(&self) {
        let mut state = self.state();
        if let Some(id) = state.context_listener.take() {
            self.inner.context.unsubscribe(id);
        }
        for (service, id) in state.services.drain(..) {
            service.unsubscribe(id);
        }
        for task in std::mem::take(&mut state.tasks) {
            if let Some(id) = state.task_listeners.remove(&task.id()) {
                task.unsubscribe(id);
            }
        }
        state.foreground = None;
        debug!("Task monitor closed");
    }

    fn watch_service(&self, service: &TaskService) {
        {
            let mut state = self.state();
            if state.services.iter().any(|(s, _)| s == service) {
                return;
            }
            let weak = self.weak();
            let id = service.subscribe(move |change| {
                if let Some(monitor) = upgrade(&weak) {
                    monitor.tasks_changed(change);
                }
            });
            state.services.push((service.clone(), id));
        }
        debug!("Task monitor watching service '{}'", service.name());

        let mut events = Vec::new();
        for task in service.tasks() {
            self.track(&task);
            if task.is_started() {
                self.claim_foreground(&task, &mut events);
            }
        }
        self.publish(events);
    }

    fn tasks_changed(&self, change: &TasksChanged) {
        for task in change.added() {
            self.track(&task);
        }
        let mut events = Vec::new();
        for task in change.removed() {
            self.untrack(&task, &mut events);
        }
        self.publish(events);
    }

    fn track(&self, task: &Task) {
        let mut state = self.state();
        if state.task_listeners.contains_key(&task.id()) {
            return;
        }
        let weak = self.weak();
        let id = task.subscribe(move |event| {
            if let Some(monitor) = upgrade(&weak) {
                monitor.task_event(event);
            }
        });
        state.task_listeners.insert(task.id(), id);
        state.tasks.push(task.clone());
    }

    fn untrack(&self, task: &Task, events: &mut Vec<MonitorEvent>) {
        {
            let mut state = self.state();
            if let Some(id) = state.task_listeners.remove(&task.id()) {
                task.unsubscribe(id);
            }
            state.tasks.retain(|t| t != task);
        }
        self.release_foreground(task, events);
    }

    /// Make `task` the foreground task if there is none. Returns whether it
    /// was claimed.
    fn claim_foreground(&self, task: &Task, events: &mut Vec<MonitorEvent>) -> bool {
        {
            let mut state = self.state();
            if state.foreground.is_some() {
                return false;
            }
            state.foreground = Some(task.clone());
        }
        events.push(MonitorEvent::ForegroundChanged {
            old: None,
            new: Some(task.clone()),
        });
        foreground_values(None, task, events);
        true
    }

    /// Hand the foreground from `task` to the oldest other running task.
    fn release_foreground(&self, task: &Task, events: &mut Vec<MonitorEvent>) {
        let mut state = self.state();
        if state.foreground.as_ref() != Some(task) {
            return;
        }
        let next = state
            .tasks
            .iter()
            .find(|t| *t != task && t.is_started())
            .cloned();
        let old = std::mem::replace(&mut state.foreground, next.clone());
        drop(state);
        events.push(MonitorEvent::ForegroundChanged {
            old: old.clone(),
            new: next.clone(),
        });
        if let Some(next) = next {
            foreground_values(old.as_ref(), &next, events);
        }
    }

    fn is_foreground(&self, id: TaskId) -> bool {
        self.state().foreground.as_ref().map(Task::id) == Some(id)
    }

    fn task_event(&self, event: &TaskEvent) {
        let Some(task) = self.tracked(event.task_id) else {
            return;
        };

        let mut events = Vec::new();
        if matches!(event.payload, TaskEventPayload::Started)
            && self.claim_foreground(&task, &mut events)
        {
            self.publish(events);
            return;
        }

        if self.is_foreground(event.task_id) {
            match &event.payload {
                TaskEventPayload::Message { old, new } => events.push(MonitorEvent::Message {
                    old: old.clone(),
                    new: new.clone(),
                }),
                TaskEventPayload::Progress { old, new } => events.push(MonitorEvent::Progress {
                    old: *old,
                    new: *new,
                }),
                TaskEventPayload::Started | TaskEventPayload::Done => {
                    events.push(MonitorEvent::State {
                        task: task.clone(),
                        state: event.state,
                    })
                }
                payload if payload.is_outcome() => events.push(MonitorEvent::State {
                    task: task.clone(),
                    state: event.state,
                }),
                _ => {}
            }
        }

        if matches!(event.payload, TaskEventPayload::Done) {
            self.release_foreground(&task, &mut events);
        }
        self.publish(events);
    }

    fn tracked(&self, id: TaskId) -> Option<Task> {
        self.state().tasks.iter().find(|t| t.id() == id).cloned()
    }

    fn publish(&self, events: Vec<MonitorEvent>) {
        for event in &events {
            self.inner.listeners.emit(event);
        }
    }
}

/// Values of a new foreground task that differ from the previous one.
fn foreground_values(old: Option<&Task>, new: &Task, events: &mut Vec<MonitorEvent>) {
    let old_message = old.and_then(Task::message);
    let new_message = new.message();
    if old_message != new_message {
        events.push(MonitorEvent::Message {
            old: old_message,
            new: new_message,
        });
    }
    let old_progress = old.and_then(Task::progress);
    let new_progress = new.progress();
    if old_progress != new_progress {
        events.push(MonitorEvent::Progress {
            old: old_progress,
            new: new_progress,
        });
    }
    events.push(MonitorEvent::State {
        task: new.clone(),
        state: new.state(),
    });
}

fn upgrade(weak: &Weak<MonitorInner>) -> Option<TaskMonitor> {
    weak.upgrade().map(|inner| TaskMonitor { inner })
}

impl std::fmt::Debug for TaskMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("TaskMonitor")
            .field("tasks", &state.tasks.len())
            .field("foreground", &state.foreground.as_ref().map(Task::id))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tasklane_core::TaskError;
    use tasklane_execution::{DispatchLoop, TaskContext};
    use tokio::sync::Semaphore;

    fn context() -> (AppContext, DispatchLoop) {
        AppContext::builder().build().unwrap()
    }

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

    /// A task that reports messages around a gate.
    fn gated_task(ctx: &AppContext, name: &'static str, gate: Arc<Semaphore>) -> Task {
        ctx.task(move |cx: TaskContext| async move {
            cx.set_message(format!("{} running", name)).await;
            let _permit = gate.acquire().await.map_err(TaskError::msg)?;
            cx.set_progress(100).await;
            Ok(())
        })
        .title(name)
        .on_succeeded(move |task, ()| task.set_message(format!("{} succeeded", name)))
        .build()
    }

    fn foreground_titles(monitor: &TaskMonitor) -> Arc<Mutex<Vec<Option<String>>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        monitor.subscribe(move |event| {
            if let MonitorEvent::ForegroundChanged { new, .. } = event {
                s.lock().unwrap().push(new.as_ref().and_then(Task::title));
            }
        });
        seen
    }

    #[tokio::test]
    async fn test_no_foreground_without_tasks() {
        let (ctx, mut dispatch) = context();
        let monitor = TaskMonitor::new(&ctx);
        dispatch.run_pending();

        assert!(monitor.foreground_task().is_none());
        assert!(monitor.tasks().is_empty());
    }

    #[tokio::test]
    async fn test_foreground_passes_to_next_running_task() {
        let (ctx, mut dispatch) = context();
        let monitor = TaskMonitor::new(&ctx);
        let changes = foreground_titles(&monitor);

        let gate_a = Arc::new(Semaphore::new(0));
        let gate_b = Arc::new(Semaphore::new(0));
        let a = gated_task(&ctx, "A", gate_a.clone());
        let b = gated_task(&ctx, "B", gate_b.clone());

        ctx.task_service().execute(&a).unwrap();
        pump_until(&mut dispatch, || monitor.foreground_task().as_ref() == Some(&a)).await;

        ctx.task_service().execute(&b).unwrap();
        pump_until(&mut dispatch, || b.message().is_some()).await;
        assert_eq!(monitor.foreground_task(), Some(a.clone()));
        assert_eq!(monitor.tasks(), vec![a.clone(), b.clone()]);

        gate_a.add_permits(1);
        pump_until(&mut dispatch, || a.is_done()).await;
        assert_eq!(monitor.foreground_task(), Some(b.clone()));

        gate_b.add_permits(1);
        pump_until(&mut dispatch, || b.is_done()).await;
        dispatch.run_pending();

        assert!(monitor.foreground_task().is_none());
        assert!(monitor.tasks().is_empty());
        assert_eq!(
            *changes.lock().unwrap(),
            vec![Some("A".to_string()), Some("B".to_string()), None]
        );
    }

    #[tokio::test]
    async fn test_forwards_only_foreground_messages() {
        let (ctx, mut dispatch) = context();
        let monitor = TaskMonitor::new(&ctx);
        let messages = Arc::new(Mutex::new(Vec::new()));
        let m = messages.clone();
        monitor.subscribe(move |event| {
            if let MonitorEvent::Message { new, .. } = event {
                m.lock().unwrap().push(new.clone().unwrap_or_default());
            }
        });

        let gate_a = Arc::new(Semaphore::new(0));
        let gate_b = Arc::new(Semaphore::new(0));
        let a = gated_task(&ctx, "A", gate_a.clone());
        let b = gated_task(&ctx, "B", gate_b.clone());

        ctx.task_service().execute(&a).unwrap();
        pump_until(&mut dispatch, || a.message().is_some()).await;
        ctx.task_service().execute(&b).unwrap();
        pump_until(&mut dispatch, || b.message().is_some()).await;

        gate_a.add_permits(1);
        pump_until(&mut dispatch, || a.is_done()).await;
        gate_b.add_permits(1);
        pump_until(&mut dispatch, || b.is_done()).await;

        assert_eq!(
            *messages.lock().unwrap(),
            vec!["A running", "A succeeded", "B running", "B succeeded"]
        );
    }

    fn record_messages(monitor: &TaskMonitor) -> Arc<Mutex<Vec<String>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        monitor.subscribe(move |event| {
            if let MonitorEvent::Message { new: Some(message), .. } = event {
                s.lock().unwrap().push(message.clone());
            }
        });
        seen
    }

    #[tokio::test]
    async fn test_failure_messages_reach_monitor_in_order() {
        let (ctx, mut dispatch) = context();
        let monitor = TaskMonitor::new(&ctx);
        let messages = record_messages(&monitor);

        let task = ctx
            .task(|cx: TaskContext| async move {
                cx.set_message("doInBackground").await;
                cx.sleep(Duration::from_millis(100)).await?;
                Err::<(), _>(TaskError::msg("expected failure"))
            })
            .on_failed(|task, _err| task.set_message("failed"))
            .on_finished(|task| task.set_message("finished"))
            .build();
        ctx.task_service().execute(&task).unwrap();
        pump_until(&mut dispatch, || task.is_done()).await;

        assert_eq!(task.outcome(), Some(TaskState::Failed));
        assert_eq!(*messages.lock().unwrap(), vec!["doInBackground", "failed", "finished"]);
    }

    #[tokio::test]
    async fn test_chained_task_released_by_finished_hook() {
        let (ctx, mut dispatch) = context();
        let monitor = TaskMonitor::new(&ctx);
        let messages = record_messages(&monitor);
        let latch = Arc::new(Semaphore::new(0));
        let fired = Arc::new(AtomicUsize::new(0));

        let b = {
            let latch = latch.clone();
            let fired = fired.clone();
            ctx.task(move |cx: TaskContext| async move {
                cx.set_message("B waiting").await;
                let _permit = latch.acquire().await.map_err(TaskError::msg)?;
                fired.fetch_add(1, Ordering::SeqCst);
                cx.set_message("B fired").await;
                Ok(())
            })
            .build()
        };
        let a = {
            let b = b.clone();
            let fired = fired.clone();
            let service = ctx.task_service();
            ctx.task(move |cx: TaskContext| async move {
                cx.set_message("A running").await;
                service.execute(&b).map_err(TaskError::msg)?;
                fired.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .on_finished(move |_task| latch.add_permits(1))
            .build()
        };

        ctx.task_service().execute(&a).unwrap();
        pump_until(&mut dispatch, || a.is_done() && b.is_done()).await;
        dispatch.run_pending();

        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert_eq!(a.outcome(), Some(TaskState::Succeeded));
        assert_eq!(b.outcome(), Some(TaskState::Succeeded));
        let messages = messages.lock().unwrap();
        for expected in ["A running", "B waiting", "B fired"] {
            assert!(messages.iter().any(|m| m == expected), "missing {}", expected);
        }
        assert!(monitor.foreground_task().is_none());
    }

    #[tokio::test]
    async fn test_services_added_later_are_watched() {
        let (ctx, mut dispatch) = context();
        let monitor = TaskMonitor::new(&ctx);
        let io = ctx.create_task_service("io").unwrap();
        dispatch.run_pending();

        let task = ctx.task(|_cx| async { Ok(()) }).title("late").build();
        io.execute(&task).unwrap();
        let states = Arc::new(Mutex::new(Vec::new()));
        let s = states.clone();
        monitor.subscribe(move |event| {
            if let MonitorEvent::State { state, .. } = event {
                s.lock().unwrap().push(*state);
            }
        });

        pump_until(&mut dispatch, || task.is_done()).await;
        assert_eq!(
            *states.lock().unwrap(),
            vec![TaskState::Started, TaskState::Succeeded, TaskState::Finished]
        );
    }

    #[tokio::test]
    async fn test_close_detaches() {
        let (ctx, mut dispatch) = context();
        let monitor = TaskMonitor::new(&ctx);
        monitor.close();

        let task = ctx.task(|_cx| async { Ok(()) }).build();
        ctx.task_service().execute(&task).unwrap();
        pump_until(&mut dispatch, || task.is_done()).await;

        assert!(monitor.foreground_task().is_none());
        assert!(monitor.tasks().is_empty());
    }
}
