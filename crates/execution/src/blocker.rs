//! Input blocking while a task runs.
//!
//! An [`InputBlocker`] disables part of the UI from the moment its task is
//! submitted until the task finishes. The actual overlay work is delegated
//! to an [`InputBlockingUi`] implementation; this module only tracks when
//! to call it. Blocking is applied at once, while the heavier busy
//! indicator only appears after a delay so short tasks never flash it.

use crate::context::AppContext;
use crate::dispatch::UiDispatcher;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tasklane_core::{BlockError, BlockingScope, TaskId};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Opaque identifier of the control that started a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlockTarget(String);

impl BlockTarget {
    /// Create a target id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for BlockTarget {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for BlockTarget {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for BlockTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The UI side of input blocking.
///
/// Every method is called on the dispatch context.
pub trait InputBlockingUi: Send + Sync {
    /// Disable the target or install an overlay.
    fn block(&self, scope: BlockingScope, target: Option<&BlockTarget>) -> Result<(), BlockError>;

    /// Undo [`block`](Self::block), restoring the previous state.
    fn unblock(&self, scope: BlockingScope, target: Option<&BlockTarget>) -> Result<(), BlockError>;

    /// Show a "please wait" indicator for a task that is still running.
    fn show_busy_indicator(
        &self,
        _scope: BlockingScope,
        _target: Option<&BlockTarget>,
        _title: Option<&str>,
    ) {
    }

    /// Remove the indicator.
    fn hide_busy_indicator(&self, _scope: BlockingScope, _target: Option<&BlockTarget>) {}
}

/// Blocking UI for headless use; only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeadlessBlockingUi;

impl InputBlockingUi for HeadlessBlockingUi {
    fn block(&self, scope: BlockingScope, target: Option<&BlockTarget>) -> Result<(), BlockError> {
        debug!("Blocking input ({}, target: {:?})", scope, target);
        Ok(())
    }

    fn unblock(&self, scope: BlockingScope, target: Option<&BlockTarget>) -> Result<(), BlockError> {
        debug!("Unblocking input ({}, target: {:?})", scope, target);
        Ok(())
    }
}

type BlockKey = (BlockingScope, Option<BlockTarget>);

/// Active overlays per scope and target.
///
/// Nested blockers on the same key share one overlay: it is installed by
/// the first and removed by the last.
#[derive(Debug, Default)]
pub struct BlockRegistry {
    active: Mutex<HashMap<BlockKey, usize>>,
}

impl BlockRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn active(&self) -> MutexGuard<'_, HashMap<BlockKey, usize>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count one holder; true when it is the first.
    fn acquire(&self, key: &BlockKey) -> bool {
        let mut active = self.active();
        let count = active.entry(key.clone()).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Drop one holder; true when it was the last.
    fn release(&self, key: &BlockKey) -> bool {
        let mut active = self.active();
        match active.get_mut(key) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                active.remove(key);
                true
            }
            None => false,
        }
    }

    /// Blockers currently holding the key.
    pub fn holders(&self, scope: BlockingScope, target: Option<&BlockTarget>) -> usize {
        self.active()
            .get(&(scope, target.cloned()))
            .copied()
            .unwrap_or(0)
    }

    /// Whether any overlay is installed.
    pub fn is_empty(&self) -> bool {
        self.active().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Blocked,
    Released,
}

struct BlockerState {
    phase: Phase,
    indicator_timer: Option<CancellationToken>,
    indicator_shown: bool,
}

struct BlockerInner {
    task: TaskId,
    title: Option<String>,
    key: BlockKey,
    ui: Arc<dyn InputBlockingUi>,
    registry: Arc<BlockRegistry>,
    dispatcher: UiDispatcher,
    runtime: Handle,
    busy_delay: Duration,
    state: Mutex<BlockerState>,
}

/// Scoped UI lock tied to one task.
#[derive(Clone)]
pub struct InputBlocker {
    inner: Arc<BlockerInner>,
}

impl InputBlocker {
    /// Create a blocker for `task`, wired to the context's blocking UI.
    pub fn new(
        context: &AppContext,
        task: TaskId,
        title: Option<String>,
        scope: BlockingScope,
        target: Option<BlockTarget>,
    ) -> Self {
        Self {
            inner: Arc::new(BlockerInner {
                task,
                title,
                key: (scope, target),
                ui: context.blocking_ui(),
                registry: context.block_registry(),
                dispatcher: context.dispatcher().clone(),
                runtime: context.runtime().clone(),
                busy_delay: context.config().busy_indicator_delay(),
                state: Mutex::new(BlockerState {
                    phase: Phase::Idle,
                    indicator_timer: None,
                    indicator_shown: false,
                }),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, BlockerState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Task this blocker belongs to.
    pub fn task_id(&self) -> TaskId {
        self.inner.task
    }

    /// Blocking scope.
    pub fn scope(&self) -> BlockingScope {
        self.inner.key.0
    }

    /// Originating control, if any.
    pub fn target(&self) -> Option<&BlockTarget> {
        self.inner.key.1.as_ref()
    }

    /// Whether `block` has run and `unblock` has not.
    pub fn is_blocked(&self) -> bool {
        self.state().phase == Phase::Blocked
    }

    /// Whether the busy indicator is showing.
    pub fn is_indicator_shown(&self) -> bool {
        self.state().indicator_shown
    }

    /// Apply the block. Idempotent; posted when called off the dispatch context.
    pub fn block(&self) {
        let this = self.clone();
        self.inner.dispatcher.invoke_now_or_later(move || this.block_now());
    }

    /// Release the block exactly once. A no-op without a prior `block`.
    pub fn unblock(&self) {
        let this = self.clone();
        self.inner.dispatcher.invoke_now_or_later(move || this.unblock_now());
    }

    fn block_now(&self) {
        if self.scope() == BlockingScope::None {
            return;
        }
        let timer = {
            let mut state = self.state();
            if state.phase != Phase::Idle {
                return;
            }
            state.phase = Phase::Blocked;
            let timer = CancellationToken::new();
            state.indicator_timer = Some(timer.clone());
            timer
        };

        debug!("Task {} blocking input ({})", self.inner.task, self.scope());
        if self.inner.registry.acquire(&self.inner.key) {
            if let Err(e) = self.inner.ui.block(self.scope(), self.target()) {
                warn!("Failed to block input for task {}: {}", self.inner.task, e);
            }
        }

        let this = self.clone();
        let delay = self.inner.busy_delay;
        self.inner.runtime.spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let dispatcher = this.inner.dispatcher.clone();
                    dispatcher.invoke_later(move || this.show_indicator_now());
                }
            }
        });
    }

    fn show_indicator_now(&self) {
        {
            let mut state = self.state();
            if state.phase != Phase::Blocked || state.indicator_shown {
                return;
            }
            state.indicator_shown = true;
        }
        self.inner
            .ui
            .show_busy_indicator(self.scope(), self.target(), self.inner.title.as_deref());
    }

    fn unblock_now(&self) {
        let was_shown = {
            let mut state = self.state();
            if state.phase != Phase::Blocked {
                return;
            }
            state.phase = Phase::Released;
            if let Some(timer) = state.indicator_timer.take() {
                timer.cancel();
            }
            std::mem::replace(&mut state.indicator_shown, false)
        };

        if was_shown {
            self.inner.ui.hide_busy_indicator(self.scope(), self.target());
        }
        debug!("Task {} unblocking input ({})", self.inner.task, self.scope());
        if self.inner.registry.release(&self.inner.key) {
            if let Err(e) = self.inner.ui.unblock(self.scope(), self.target()) {
                warn!("Failed to unblock input for task {}: {}", self.inner.task, e);
            }
        }
    }
}

impl std::fmt::Debug for InputBlocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputBlocker")
            .field("task", &self.inner.task)
            .field("scope", &self.scope())
            .field("target", &self.target())
            .field("blocked", &self.is_blocked())
            .finish()
    }
}
