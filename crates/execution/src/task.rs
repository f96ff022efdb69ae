//! Tasks: a background body plus a lifecycle observed on the dispatch context.
//!
//! A [`Task`] is a cheap handle; clones refer to the same task. The body
//! runs once on a worker of the [`TaskService`](crate::TaskService) it was
//! submitted to. Every state change, hook and listener notification is
//! delivered on the dispatch context, in a fixed order:
//!
//! ```text
//! Started, DoInBackground, (Message | Progress)*,
//! Succeeded | Failed | Cancelled | Interrupted,
//! Finished, Done, Completed
//! ```
//!
//! A task cancelled before it starts skips straight to `Cancelled`.

use crate::blocker::{BlockTarget, InputBlocker};
use crate::context::AppContext;
use crate::dispatch::UiDispatcher;
use crate::pool::PoolJob;
use async_trait::async_trait;
use chrono::Utc;
use std::fmt::Display;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tasklane_core::listener::panic_message;
use tasklane_core::{
    format_message, BlockingScope, ListenerId, Listeners, ResourceError, ResourceMap, TaskError, TaskEvent,
    TaskEventPayload, TaskId, TaskState, Time, UsageError,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Delivers a successful value to the typed `on_succeeded` hook.
type Deliver = Box<dyn FnOnce(&Task) + Send>;

type TaskHook = Box<dyn Fn(&Task) + Send + Sync>;
type FailureHook = Box<dyn Fn(&Task, &TaskError) + Send + Sync>;

/// Background work that can be implemented on a struct instead of a closure.
#[async_trait]
pub trait Background<T>: Send + Sync + 'static {
    /// Compute the task's value. Runs once, off the dispatch context.
    async fn run(&self, ctx: TaskContext) -> Result<T, TaskError>;
}

/// Type-erased body with its success hook.
trait ErasedWork: Send {
    fn run(self: Box<Self>, ctx: TaskContext) -> BoxFuture<Result<Deliver, TaskError>>;
}

struct Work<T> {
    body: Box<dyn FnOnce(TaskContext) -> BoxFuture<Result<T, TaskError>> + Send>,
    on_succeeded: Option<Box<dyn FnOnce(&Task, T) + Send>>,
}

impl<T: Send + 'static> ErasedWork for Work<T> {
    fn run(self: Box<Self>, ctx: TaskContext) -> BoxFuture<Result<Deliver, TaskError>> {
        let Work { body, on_succeeded } = *self;
        Box::pin(async move {
            let value = body(ctx).await?;
            let deliver: Deliver = Box::new(move |task: &Task| {
                if let Some(hook) = on_succeeded {
                    hook(task, value);
                }
            });
            Ok(deliver)
        })
    }
}

#[derive(Default)]
struct Hooks {
    on_failed: Option<FailureHook>,
    on_cancelled: Option<TaskHook>,
    on_interrupted: Option<TaskHook>,
    on_finished: Option<TaskHook>,
}

/// How the background phase ended, before it is classified.
enum Completion {
    /// Never started
    Skipped,
    Ran(Result<Deliver, TaskError>),
}

enum Outcome {
    Succeeded(Deliver),
    Failed(Arc<TaskError>),
    Cancelled,
    Interrupted,
}

impl Outcome {
    fn state(&self) -> TaskState {
        match self {
            Outcome::Succeeded(_) => TaskState::Succeeded,
            Outcome::Failed(_) => TaskState::Failed,
            Outcome::Cancelled => TaskState::Cancelled,
            Outcome::Interrupted => TaskState::Interrupted,
        }
    }
}

struct Props {
    title: Option<String>,
    description: Option<String>,
    message: Option<String>,
    progress: Option<u8>,
    user_can_cancel: bool,
    state: TaskState,
    outcome: Option<TaskState>,
    service: Option<String>,
    started_at: Option<Time>,
    done_at: Option<Time>,
    completion_posted: bool,
}

struct TaskInner {
    id: TaskId,
    resource_prefix: Option<String>,
    resources: Option<Arc<dyn ResourceMap>>,
    dispatcher: UiDispatcher,
    props: Mutex<Props>,
    listeners: Listeners<TaskEvent>,
    cancel: CancellationToken,
    interrupt: CancellationToken,
    work: Mutex<Option<Box<dyn ErasedWork>>>,
    hooks: Hooks,
    blocker: Mutex<Option<InputBlocker>>,
}

/// Handle to a task.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

impl Task {
    /// Build a task with default settings around `work`.
    pub fn new<T, F, Fut>(context: &AppContext, work: F) -> Task
    where
        T: Send + 'static,
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, TaskError>> + Send + 'static,
    {
        TaskBuilder::new(context, work).build()
    }

    /// Start configuring a task around `work`.
    pub fn builder<T, F, Fut>(context: &AppContext, work: F) -> TaskBuilder<T>
    where
        T: Send + 'static,
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, TaskError>> + Send + 'static,
    {
        TaskBuilder::new(context, work)
    }

    fn props(&self) -> MutexGuard<'_, Props> {
        self.inner.props.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Unique id.
    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    /// Display title.
    pub fn title(&self) -> Option<String> {
        self.props().title.clone()
    }

    /// Set the display title.
    pub fn set_title(&self, title: impl Into<String>) {
        self.props().title = Some(title.into());
    }

    /// Longer description.
    pub fn description(&self) -> Option<String> {
        self.props().description.clone()
    }

    /// Set the description.
    pub fn set_description(&self, description: impl Into<String>) {
        self.props().description = Some(description.into());
    }

    /// Latest status message.
    pub fn message(&self) -> Option<String> {
        self.props().message.clone()
    }

    /// Progress in percent; `None` when indeterminate.
    pub fn progress(&self) -> Option<u8> {
        self.props().progress
    }

    /// Whether a UI may offer to cancel this task.
    pub fn user_can_cancel(&self) -> bool {
        self.props().user_can_cancel
    }

    /// Allow or forbid user cancellation.
    pub fn set_user_can_cancel(&self, allowed: bool) {
        self.props().user_can_cancel = allowed;
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        self.props().state
    }

    /// Final outcome, once the background phase ended.
    pub fn outcome(&self) -> Option<TaskState> {
        self.props().outcome
    }

    /// Not yet submitted, or submitted and still queued.
    pub fn is_pending(&self) -> bool {
        self.state() == TaskState::Pending
    }

    /// Body running or outcome not yet published.
    pub fn is_started(&self) -> bool {
        self.state() == TaskState::Started
    }

    /// Every completion step has run.
    pub fn is_done(&self) -> bool {
        self.state() == TaskState::Finished
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Name of the service the task was submitted to.
    pub fn service_name(&self) -> Option<String> {
        self.props().service.clone()
    }

    /// When the body started.
    pub fn started_at(&self) -> Option<Time> {
        self.props().started_at
    }

    /// Time between start and outcome; `None` until both happened.
    pub fn execution_duration(&self) -> Option<chrono::Duration> {
        let props = self.props();
        match (props.started_at, props.done_at) {
            (Some(start), Some(done)) => Some(done - start),
            _ => None,
        }
    }

    /// Resource key prefix.
    pub fn resource_prefix(&self) -> Option<&str> {
        self.inner.resource_prefix.as_deref()
    }

    /// Full resource key for `suffix`: `"<prefix>.<suffix>"`.
    pub fn resource_name(&self, suffix: &str) -> String {
        match &self.inner.resource_prefix {
            Some(prefix) if !prefix.is_empty() => format!("{}.{}", prefix, suffix),
            _ => suffix.to_string(),
        }
    }

    fn format_resource(&self, key: &str, args: &[&dyn Display]) -> Result<String, ResourceError> {
        let resources = self
            .inner
            .resources
            .as_ref()
            .filter(|_| self.inner.resource_prefix.is_some())
            .ok_or(ResourceError::NoResourceMap)?;
        let name = self.resource_name(key);
        let template = resources
            .get_string(&name)
            .ok_or(ResourceError::MissingKey(name))?;
        Ok(format_message(&template, args))
    }

    /// Register a listener for this task's events.
    ///
    /// Callbacks run on the dispatch context.
    pub fn subscribe<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&TaskEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.add(callback)
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    /// Input blocker attached to this task.
    pub fn input_blocker(&self) -> Option<InputBlocker> {
        self.inner
            .blocker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Attach an input blocker before the task is submitted.
    pub fn set_input_blocker(&self, blocker: InputBlocker) -> Result<(), UsageError> {
        if blocker.task_id() != self.id() {
            return Err(UsageError::BlockerMismatch {
                blocker_task: blocker.task_id(),
                task: self.id(),
            });
        }
        {
            let props = self.props();
            if props.state != TaskState::Pending || props.service.is_some() {
                return Err(UsageError::AlreadyExecuted {
                    task: self.id(),
                    state: props.state,
                });
            }
        }
        let mut slot = self.inner.blocker.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Err(UsageError::BlockerAlreadySet(self.id()));
        }
        *slot = Some(blocker);
        Ok(())
    }

    /// Set the status message. Applied inline on the dispatch context,
    /// posted otherwise.
    pub fn set_message(&self, message: impl Into<String>) {
        let task = self.clone();
        let message = Some(message.into());
        self.inner
            .dispatcher
            .invoke_now_or_later(move || task.apply_message(message));
    }

    /// Set the message from resource `"<prefix>.<key>"` formatted with `args`.
    pub fn set_resource_message(&self, key: &str, args: &[&dyn Display]) -> Result<(), ResourceError> {
        let text = self.format_resource(key, args)?;
        self.set_message(text);
        Ok(())
    }

    /// Set progress in percent. Values above 100 are clamped; negative
    /// values mean indeterminate.
    pub fn set_progress(&self, percent: i32) {
        let task = self.clone();
        let progress = normalize_progress(percent);
        self.inner
            .dispatcher
            .invoke_now_or_later(move || task.apply_progress(progress));
    }

    /// Set progress as a fraction of one.
    pub fn set_progress_ratio(&self, ratio: f32) {
        self.set_progress(ratio_to_percent(ratio));
    }

    /// Set progress as `value` within `[min, max]`.
    pub fn set_progress_range(&self, value: f64, min: f64, max: f64) -> Result<(), UsageError> {
        let percent = range_to_percent(value, min, max)?;
        self.set_progress(percent);
        Ok(())
    }

    /// Request cancellation.
    ///
    /// A pending task never runs its body and publishes its completion at
    /// once, even while still queued behind busy workers. A running task sees
    /// [`TaskContext::is_cancelled`]; with `may_interrupt` its interruption
    /// points also fail. Returns false if the task already finished or was
    /// already cancelled.
    pub fn cancel(&self, may_interrupt: bool) -> bool {
        let running = {
            let mut props = self.props();
            if self.inner.cancel.is_cancelled() {
                return false;
            }
            let running = match props.state {
                TaskState::Pending => {
                    props.state = TaskState::Cancelled;
                    props.outcome = Some(TaskState::Cancelled);
                    false
                }
                TaskState::Started => true,
                _ => return false,
            };
            // Set under the lock so `complete` sees either the request or a
            // final state, never neither.
            self.inner.cancel.cancel();
            if running && may_interrupt {
                self.inner.interrupt.cancel();
            }
            running
        };
        debug!("Task {} cancelled (interrupt: {})", self.id(), may_interrupt && running);

        if !running {
            // A worker dequeuing it later finds the completion already posted.
            self.post_completion(Completion::Skipped);
        }
        true
    }

    /// Mark the task as owned by `service`. Fails unless it is still pending
    /// and unclaimed.
    pub(crate) fn claim(&self, service: &str) -> Result<(), UsageError> {
        let mut props = self.props();
        if props.state != TaskState::Pending || props.service.is_some() {
            return Err(UsageError::AlreadyExecuted {
                task: self.id(),
                state: props.state,
            });
        }
        props.service = Some(service.to_string());
        Ok(())
    }

    /// Pool job running this task.
    pub(crate) fn runner(&self) -> TaskRunner {
        TaskRunner { task: self.clone() }
    }

    /// Cancel a submitted task that will never reach a worker.
    pub(crate) fn abort_unstarted(&self) {
        {
            let mut props = self.props();
            match props.state {
                TaskState::Pending => {
                    props.state = TaskState::Cancelled;
                    props.outcome = Some(TaskState::Cancelled);
                }
                TaskState::Cancelled => {}
                _ => return,
            }
        }
        self.inner.cancel.cancel();
        self.post_completion(Completion::Skipped);
    }

    /// Pending → Started. False if the task was cancelled while queued.
    fn begin(&self) -> bool {
        let mut props = self.props();
        if props.state != TaskState::Pending {
            return false;
        }
        props.state = TaskState::Started;
        props.started_at = Some(Utc::now());
        true
    }

    fn take_work(&self) -> Option<Box<dyn ErasedWork>> {
        self.inner.work.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    fn emit(&self, payload: TaskEventPayload) {
        let event = TaskEvent::new(self.id(), self.state(), payload);
        self.inner.listeners.emit(&event);
    }

    fn apply_message(&self, message: Option<String>) {
        let old = {
            let mut props = self.props();
            if props.message == message {
                return;
            }
            std::mem::replace(&mut props.message, message.clone())
        };
        self.emit(TaskEventPayload::Message { old, new: message });
    }

    fn apply_progress(&self, progress: Option<u8>) {
        let old = {
            let mut props = self.props();
            if props.progress == progress {
                return;
            }
            std::mem::replace(&mut props.progress, progress)
        };
        self.emit(TaskEventPayload::Progress { old, new: progress });
    }

    fn run_hook(&self, name: &str, hook: impl FnOnce()) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(hook)) {
            error!("Task {} {} hook panicked: {}", self.id(), name, panic_message(payload.as_ref()));
        }
    }

    /// Queue the completion sequence. Only the first call has an effect.
    fn post_completion(&self, completion: Completion) {
        {
            let mut props = self.props();
            if props.completion_posted {
                return;
            }
            props.completion_posted = true;
        }
        let task = self.clone();
        self.inner
            .dispatcher
            .invoke_later(move || task.complete(completion));
    }

    /// Publish the outcome, then Finished, Done and Completed. Runs on the
    /// dispatch context.
    fn complete(&self, completion: Completion) {
        let outcome = {
            let mut props = self.props();
            let cancel_requested = self.inner.cancel.is_cancelled();
            let outcome = match completion {
                Completion::Skipped => Outcome::Cancelled,
                Completion::Ran(Err(TaskError::Interrupted)) => Outcome::Interrupted,
                Completion::Ran(_) if cancel_requested => Outcome::Cancelled,
                Completion::Ran(Ok(deliver)) => Outcome::Succeeded(deliver),
                Completion::Ran(Err(e)) => Outcome::Failed(Arc::new(e)),
            };
            let state = outcome.state();
            props.state = state;
            props.outcome = Some(state);
            props.done_at = Some(Utc::now());
            outcome
        };

        let hooks = &self.inner.hooks;
        match outcome {
            Outcome::Succeeded(deliver) => {
                info!("Task {} succeeded", self.id());
                self.run_hook("succeeded", || deliver(self));
                self.emit(TaskEventPayload::Succeeded);
            }
            Outcome::Failed(err) => {
                warn!("Task {} failed: {}", self.id(), err);
                if let Some(hook) = &hooks.on_failed {
                    self.run_hook("failed", || hook(self, &err));
                }
                self.emit(TaskEventPayload::Failed(err));
            }
            Outcome::Cancelled => {
                info!("Task {} cancelled", self.id());
                if let Some(hook) = &hooks.on_cancelled {
                    self.run_hook("cancelled", || hook(self));
                }
                self.emit(TaskEventPayload::Cancelled);
            }
            Outcome::Interrupted => {
                info!("Task {} interrupted", self.id());
                if let Some(hook) = &hooks.on_interrupted {
                    self.run_hook("interrupted", || hook(self));
                }
                self.emit(TaskEventPayload::Interrupted);
            }
        }

        if let Some(hook) = &hooks.on_finished {
            self.run_hook("finished", || hook(self));
        }
        self.emit(TaskEventPayload::Finished);

        self.props().state = TaskState::Finished;
        self.emit(TaskEventPayload::Done);
        self.emit(TaskEventPayload::Completed);
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Task {}

impl std::hash::Hash for Task {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let props = self.props();
        f.debug_struct("Task")
            .field("id", &self.inner.id)
            .field("title", &props.title)
            .field("state", &props.state)
            .finish()
    }
}

fn normalize_progress(percent: i32) -> Option<u8> {
    if percent < 0 {
        None
    } else {
        Some(percent.min(100) as u8)
    }
}

fn ratio_to_percent(ratio: f32) -> i32 {
    if ratio.is_nan() {
        return -1;
    }
    (ratio.clamp(0.0, 1.0) * 100.0).round() as i32
}

fn range_to_percent(value: f64, min: f64, max: f64) -> Result<i32, UsageError> {
    if !(min < max) || value < min || value > max {
        return Err(UsageError::InvalidProgress { value, min, max });
    }
    Ok(((value - min) / (max - min) * 100.0).round() as i32)
}

/// Configures and creates a [`Task`].
pub struct TaskBuilder<T> {
    context: AppContext,
    resource_prefix: Option<String>,
    title: Option<String>,
    description: Option<String>,
    message: Option<String>,
    user_can_cancel: bool,
    blocking: Option<(BlockingScope, Option<BlockTarget>)>,
    work: Work<T>,
    hooks: Hooks,
}

impl<T: Send + 'static> TaskBuilder<T> {
    /// Start from a closure body.
    pub fn new<F, Fut>(context: &AppContext, work: F) -> Self
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, TaskError>> + Send + 'static,
    {
        let body = Box::new(move |ctx: TaskContext| -> BoxFuture<Result<T, TaskError>> {
            Box::pin(work(ctx))
        });
        Self::with_body(context, body)
    }

    /// Start from a [`Background`] implementation.
    pub fn from_background<B: Background<T>>(context: &AppContext, background: B) -> Self {
        let body = Box::new(move |ctx: TaskContext| -> BoxFuture<Result<T, TaskError>> {
            Box::pin(async move { background.run(ctx).await })
        });
        Self::with_body(context, body)
    }

    fn with_body(
        context: &AppContext,
        body: Box<dyn FnOnce(TaskContext) -> BoxFuture<Result<T, TaskError>> + Send>,
    ) -> Self {
        Self {
            context: context.clone(),
            resource_prefix: None,
            title: None,
            description: None,
            message: None,
            user_can_cancel: true,
            blocking: None,
            work: Work {
                body,
                on_succeeded: None,
            },
            hooks: Hooks::default(),
        }
    }

    /// Resource key prefix. Title, description and message default to the
    /// `<prefix>.title`, `<prefix>.description` and `<prefix>.message`
    /// resources.
    pub fn resource_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.resource_prefix = Some(prefix.into());
        self
    }

    /// Set the title.
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Set the description.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set the initial message.
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Whether a UI may offer to cancel. Defaults to true.
    pub fn user_can_cancel(mut self, allowed: bool) -> Self {
        self.user_can_cancel = allowed;
        self
    }

    /// Block input while the task runs.
    pub fn block(mut self, scope: BlockingScope, target: Option<BlockTarget>) -> Self {
        self.blocking = Some((scope, target));
        self
    }

    /// Called with the value when the body succeeds.
    pub fn on_succeeded<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(&Task, T) + Send + 'static,
    {
        self.work.on_succeeded = Some(Box::new(hook));
        self
    }

    /// Called with the error when the body fails or panics.
    pub fn on_failed<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Task, &TaskError) + Send + Sync + 'static,
    {
        self.hooks.on_failed = Some(Box::new(hook));
        self
    }

    /// Called when the task is cancelled.
    pub fn on_cancelled<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Task) + Send + Sync + 'static,
    {
        self.hooks.on_cancelled = Some(Box::new(hook));
        self
    }

    /// Called when the body stops at an interruption point.
    pub fn on_interrupted<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Task) + Send + Sync + 'static,
    {
        self.hooks.on_interrupted = Some(Box::new(hook));
        self
    }

    /// Called after every outcome.
    pub fn on_finished<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Task) + Send + Sync + 'static,
    {
        self.hooks.on_finished = Some(Box::new(hook));
        self
    }

    /// Create the task.
    pub fn build(self) -> Task {
        let id = TaskId::new();
        let resources = self.context.resources();
        let lookup = |suffix: &str| -> Option<String> {
            let prefix = self.resource_prefix.as_deref()?;
            resources.as_ref()?.get_string(&format!("{}.{}", prefix, suffix))
        };
        let title = self.title.clone().or_else(|| lookup("title"));
        let description = self.description.clone().or_else(|| lookup("description"));
        let message = self.message.clone().or_else(|| lookup("message"));

        let blocker = self.blocking.map(|(scope, target)| {
            InputBlocker::new(&self.context, id, title.clone(), scope, target)
        });

        let work: Box<dyn ErasedWork> = Box::new(self.work);
        debug!("Created task {} ({:?})", id, title);
        Task {
            inner: Arc::new(TaskInner {
                id,
                resource_prefix: self.resource_prefix,
                resources,
                dispatcher: self.context.dispatcher().clone(),
                props: Mutex::new(Props {
                    title,
                    description,
                    message,
                    progress: None,
                    user_can_cancel: self.user_can_cancel,
                    state: TaskState::Pending,
                    outcome: None,
                    service: None,
                    started_at: None,
                    done_at: None,
                    completion_posted: false,
                }),
                listeners: Listeners::new(),
                cancel: CancellationToken::new(),
                interrupt: CancellationToken::new(),
                work: Mutex::new(Some(work)),
                hooks: self.hooks,
                blocker: Mutex::new(blocker),
            }),
        }
    }
}

/// What the background body sees of its task.
///
/// Updates made through the context are applied on the dispatch context
/// before the call returns, so they are ordered before the outcome. Blocking
/// I/O belongs in [`TaskContext::blocking`]; interrupts only reach a body at
/// its interruption points.
#[derive(Clone)]
pub struct TaskContext {
    task: Task,
}

impl TaskContext {
    /// The task being run.
    pub fn task(&self) -> &Task {
        &self.task
    }

    /// Whether cancellation was requested. Bodies should poll this and
    /// return early.
    pub fn is_cancelled(&self) -> bool {
        self.task.inner.cancel.is_cancelled()
    }

    /// Whether an interrupting cancel was requested.
    pub fn is_interrupted(&self) -> bool {
        self.task.inner.interrupt.is_cancelled()
    }

    /// Interruption point: fails with [`TaskError::Interrupted`] once an
    /// interrupting cancel was requested.
    pub fn check_interrupted(&self) -> Result<(), TaskError> {
        if self.is_interrupted() {
            return Err(TaskError::Interrupted);
        }
        Ok(())
    }

    /// Sleep, waking early with [`TaskError::Interrupted`] on interrupt.
    pub async fn sleep(&self, duration: Duration) -> Result<(), TaskError> {
        self.interruptible(tokio::time::sleep(duration)).await
    }

    /// Await `future` unless an interrupt arrives first.
    pub async fn interruptible<F>(&self, future: F) -> Result<F::Output, TaskError>
    where
        F: Future,
    {
        tokio::select! {
            biased;
            _ = self.task.inner.interrupt.cancelled() => Err(TaskError::Interrupted),
            output = future => Ok(output),
        }
    }

    /// Run a blocking call on tokio's blocking thread pool.
    ///
    /// Bodies run as tasks on the runtime's core threads, so a blocking std
    /// call made directly in a body stalls one of those threads rather than
    /// a pool worker. An interrupt stops the wait but not the call itself.
    pub async fn blocking<F, R>(&self, call: F) -> Result<R, TaskError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        match self.interruptible(tokio::task::spawn_blocking(call)).await? {
            Ok(output) => Ok(output),
            Err(e) if e.is_panic() => Err(TaskError::Panicked(panic_message(e.into_panic().as_ref()))),
            Err(_) => Err(TaskError::Interrupted),
        }
    }

    /// Wait until cancellation is requested.
    pub async fn cancelled(&self) {
        self.task.inner.cancel.cancelled().await
    }

    /// Set the status message and wait until it is published.
    pub async fn set_message(&self, message: impl Into<String>) {
        let task = self.task.clone();
        let message = Some(message.into());
        self.task
            .inner
            .dispatcher
            .invoke_and_wait(move || task.apply_message(message))
            .await;
    }

    /// Set the message from resource `"<prefix>.<key>"` and wait until it is
    /// published.
    pub async fn message(
        &self,
        key: &str,
        args: &[&(dyn Display + Sync)],
    ) -> Result<(), ResourceError> {
        let text = {
            let args: Vec<&dyn Display> = args.iter().map(|a| *a as &dyn Display).collect();
            self.task.format_resource(key, &args)?
        };
        self.set_message(text).await;
        Ok(())
    }

    /// Set progress in percent and wait until it is published.
    pub async fn set_progress(&self, percent: i32) {
        let task = self.task.clone();
        let progress = normalize_progress(percent);
        self.task
            .inner
            .dispatcher
            .invoke_and_wait(move || task.apply_progress(progress))
            .await;
    }

    /// Set progress as a fraction of one.
    pub async fn set_progress_ratio(&self, ratio: f32) {
        self.set_progress(ratio_to_percent(ratio)).await
    }

    /// Set progress as `value` within `[min, max]`.
    pub async fn set_progress_range(&self, value: f64, min: f64, max: f64) -> Result<(), UsageError> {
        let percent = range_to_percent(value, min, max)?;
        self.set_progress(percent).await;
        Ok(())
    }
}

/// Pool job that runs one task.
pub(crate) struct TaskRunner {
    task: Task,
}

impl TaskRunner {
    pub(crate) fn into_task(self) -> Task {
        self.task
    }
}

#[async_trait]
impl PoolJob for TaskRunner {
    async fn run(self) {
        let task = self.task;
        if !task.begin() {
            debug!("Task {} was cancelled before it started", task.id());
            task.post_completion(Completion::Skipped);
            return;
        }

        // Waiting here orders the start events, and any input block posted
        // at submission, before the body's own updates.
        let started = task.clone();
        task.inner
            .dispatcher
            .invoke_and_wait(move || {
                started.emit(TaskEventPayload::Started);
                started.emit(TaskEventPayload::DoInBackground);
            })
            .await;

        let result = match task.take_work() {
            Some(work) => {
                let ctx = TaskContext { task: task.clone() };
                match tokio::spawn(work.run(ctx)).await {
                    Ok(result) => result,
                    Err(e) if e.is_panic() => {
                        Err(TaskError::Panicked(panic_message(e.into_panic().as_ref())))
                    }
                    Err(_) => Err(TaskError::Interrupted),
                }
            }
            None => Err(TaskError::msg("task body already consumed")),
        };
        task.post_completion(Completion::Ran(result));
    }
}
