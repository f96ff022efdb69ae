//! Execution layer - the dispatch context, worker pools, tasks, input
//! blocking and task services.

#![warn(missing_docs)]

pub mod dispatch;
pub mod pool;
pub mod task;
pub mod blocker;
pub mod service;
pub mod context;

pub use dispatch::{DispatchLoop, UiDispatcher};
pub use pool::{PoolJob, WorkerPool};
pub use task::{Background, Task, TaskBuilder, TaskContext};
pub use blocker::{BlockRegistry, BlockTarget, HeadlessBlockingUi, InputBlocker, InputBlockingUi};
pub use service::{TaskService, TasksChanged};
pub use context::{AppContext, AppContextBuilder, ContextEvent};
