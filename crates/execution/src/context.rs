//! Application context: the dispatch queue, resources, the blocking UI and
//! the registry of task services.

use crate::blocker::{BlockRegistry, HeadlessBlockingUi, InputBlockingUi};
use crate::dispatch::{self, DispatchLoop, UiDispatcher};
use crate::service::TaskService;
use crate::task::{Task, TaskBuilder, TaskContext};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tasklane_core::{
    AppConfig, ConfigError, ListenerId, Listeners, ResourceMap, TaskError, UsageError,
};
use tokio::runtime::Handle;
use tracing::{debug, info};

/// Context-level notifications, delivered on the dispatch context.
#[derive(Debug, Clone)]
pub enum ContextEvent {
    /// A task service was registered
    ServiceAdded(TaskService),
}

struct ContextInner {
    config: AppConfig,
    dispatcher: UiDispatcher,
    runtime: Handle,
    resources: Option<Arc<dyn ResourceMap>>,
    blocking_ui: Arc<dyn InputBlockingUi>,
    block_registry: Arc<BlockRegistry>,
    default_service: TaskService,
    services: Mutex<Vec<TaskService>>,
    listeners: Listeners<ContextEvent>,
}

/// Shared handle to the application context.
#[derive(Clone)]
pub struct AppContext {
    inner: Arc<ContextInner>,
}

/// Builder for [`AppContext`].
#[derive(Default)]
pub struct AppContextBuilder {
    config: Option<AppConfig>,
    resources: Option<Arc<dyn ResourceMap>>,
    blocking_ui: Option<Arc<dyn InputBlockingUi>>,
    runtime: Option<Handle>,
}

impl AppContextBuilder {
    /// Use `config` instead of the defaults.
    pub fn config(mut self, config: AppConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Resource bundle for task titles and messages.
    pub fn resources(mut self, resources: impl ResourceMap + 'static) -> Self {
        self.resources = Some(Arc::new(resources));
        self
    }

    /// Shared resource bundle.
    pub fn shared_resources(mut self, resources: Arc<dyn ResourceMap>) -> Self {
        self.resources = Some(resources);
        self
    }

    /// UI that performs input blocking. Defaults to [`HeadlessBlockingUi`].
    pub fn blocking_ui(mut self, ui: Arc<dyn InputBlockingUi>) -> Self {
        self.blocking_ui = Some(ui);
        self
    }

    /// Runtime hosting workers and timers. Defaults to the current one.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Build the context and its dispatch loop. The caller drives the loop.
    pub fn build(self) -> Result<(AppContext, DispatchLoop), ConfigError> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|e| ConfigError::NoRuntime(e.to_string()))?,
        };

        let (dispatcher, dispatch_loop) = dispatch::channel();
        let default_service = TaskService::from_parts(
            config.default_service.clone(),
            config.pool,
            dispatcher.clone(),
            runtime.clone(),
        );

        let context = AppContext {
            inner: Arc::new(ContextInner {
                dispatcher,
                runtime,
                resources: self.resources,
                blocking_ui: self.blocking_ui.unwrap_or_else(|| Arc::new(HeadlessBlockingUi)),
                block_registry: Arc::new(BlockRegistry::new()),
                services: Mutex::new(vec![default_service.clone()]),
                default_service,
                listeners: Listeners::new(),
                config,
            }),
        };
        Ok((context, dispatch_loop))
    }

    /// Build the context and run its dispatch loop on a `ui-dispatch` thread.
    pub fn start(self) -> Result<AppContext, ConfigError> {
        let (context, dispatch_loop) = self.build()?;
        dispatch_loop.spawn_thread("ui-dispatch")?;
        info!("Application context started");
        Ok(context)
    }
}

impl AppContext {
    /// Start building a context.
    pub fn builder() -> AppContextBuilder {
        AppContextBuilder::default()
    }

    fn services(&self) -> MutexGuard<'_, Vec<TaskService>> {
        self.inner.services.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Configuration in effect.
    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    /// Dispatcher for the UI context.
    pub fn dispatcher(&self) -> &UiDispatcher {
        &self.inner.dispatcher
    }

    /// Runtime hosting workers.
    pub fn runtime(&self) -> &Handle {
        &self.inner.runtime
    }

    /// Resource bundle, if any.
    pub fn resources(&self) -> Option<Arc<dyn ResourceMap>> {
        self.inner.resources.clone()
    }

    /// Blocking UI.
    pub fn blocking_ui(&self) -> Arc<dyn InputBlockingUi> {
        self.inner.blocking_ui.clone()
    }

    /// Overlay reference counts.
    pub fn block_registry(&self) -> Arc<BlockRegistry> {
        self.inner.block_registry.clone()
    }

    /// Shortcut for [`Task::builder`].
    pub fn task<T, F, Fut>(&self, work: F) -> TaskBuilder<T>
    where
        T: Send + 'static,
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, TaskError>> + Send + 'static,
    {
        Task::builder(self, work)
    }

    /// The default task service.
    pub fn task_service(&self) -> TaskService {
        self.inner.default_service.clone()
    }

    /// Look up a service by name.
    pub fn task_service_named(&self, name: &str) -> Result<TaskService, UsageError> {
        self.services()
            .iter()
            .find(|s| s.name() == name)
            .cloned()
            .ok_or_else(|| UsageError::UnknownService(name.to_string()))
    }

    /// Every registered service, in registration order.
    pub fn task_services(&self) -> Vec<TaskService> {
        self.services().clone()
    }

    /// Register a service. Names are unique.
    pub fn add_task_service(&self, service: TaskService) -> Result<(), UsageError> {
        {
            let mut services = self.services();
            if services.iter().any(|s| s.name() == service.name()) {
                return Err(UsageError::DuplicateService(service.name().to_string()));
            }
            services.push(service.clone());
        }
        debug!("Registered task service '{}'", service.name());
        let inner = self.inner.clone();
        self.inner.dispatcher.invoke_later(move || {
            inner.listeners.emit(&ContextEvent::ServiceAdded(service));
        });
        Ok(())
    }

    /// Create and register a service using the context's pool configuration.
    pub fn create_task_service(&self, name: &str) -> Result<TaskService, UsageError> {
        let service = TaskService::new(name, self);
        self.add_task_service(service.clone())?;
        Ok(service)
    }

    /// Listen for context events.
    pub fn subscribe<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&ContextEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.add(callback)
    }

    /// Remove a context listener.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    /// Shut down every service, wait up to `timeout` for them, then stop
    /// the dispatch loop. Returns true if every service terminated.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let services = self.task_services();
        for service in &services {
            service.shutdown();
        }
        let mut terminated = true;
        for service in &services {
            terminated &= service.await_termination(timeout).await;
        }
        self.inner.dispatcher.stop();
        info!("Application context shut down (clean: {})", terminated);
        terminated
    }
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("config", &self.inner.config)
            .field("services", &self.services().len())
            .finish()
    }
}
