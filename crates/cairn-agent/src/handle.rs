//! A cloneable handle for cancelling a task from external code.

use parking_lot::Mutex;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio_util::sync::CancellationToken;

/// A lifecycle hook currently awaited by the task
#[derive(Debug, Clone)]
pub struct ActiveHook {
    pub hook_name: String,
    pub tool_name: Option<String>,
    /// Timestamp of the `hook_status` message tracking this run
    pub message_ts: i64,
    pub cancellation: CancellationToken,
}

/// A cloneable handle for poking a task from external code.
///
/// All fields are `Arc`-wrapped, so cloning is cheap. Aborting is terminal:
/// a task that has been aborted never runs again under the same handle.
#[derive(Clone)]
pub struct TaskHandle {
    pub(crate) cancel: CancellationToken,
    aborted: Arc<AtomicBool>,
    abandoned: Arc<AtomicBool>,
    active_hook: Arc<Mutex<Option<ActiveHook>>>,
    pub(crate) idle_notify: Arc<tokio::sync::Notify>,
    pub(crate) is_running: Arc<AtomicBool>,
}

impl Default for TaskHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskHandle {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            aborted: Arc::new(AtomicBool::new(false)),
            abandoned: Arc::new(AtomicBool::new(false)),
            active_hook: Arc::new(Mutex::new(None)),
            idle_notify: Arc::new(tokio::sync::Notify::new()),
            is_running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Abort the task. Observed at the next checkpoint; also cancels a
    /// running cancellable hook.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
        self.cancel.cancel();
        self.cancel_active_hook();
    }

    /// Abort without graceful cleanup, for a task whose stream or provider
    /// connection has stopped responding.
    pub fn abandon(&self) {
        self.abandoned.store(true, Ordering::Release);
        self.abort();
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::Acquire)
    }

    /// Token cancelled when the task is aborted
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Record the hook now being awaited. The slot is cleared when the
    /// returned guard drops, whatever the outcome of the hook.
    pub fn register_hook(&self, hook: ActiveHook) -> ActiveHookGuard {
        *self.active_hook.lock() = Some(hook);
        ActiveHookGuard {
            slot: Arc::clone(&self.active_hook),
        }
    }

    /// Snapshot of the hook currently awaited, if any
    pub fn active_hook(&self) -> Option<ActiveHook> {
        self.active_hook.lock().clone()
    }

    /// Cancel the awaited hook. Returns `false` when no hook is running.
    pub fn cancel_active_hook(&self) -> bool {
        match self.active_hook.lock().as_ref() {
            Some(hook) => {
                hook.cancellation.cancel();
                true
            }
            None => false,
        }
    }

    /// Wait until the task loop becomes idle (finishes running).
    pub async fn wait_for_idle(&self) {
        let notified = self.idle_notify.notified();
        if !self.is_running.load(Ordering::Acquire) {
            return;
        }
        notified.await;
    }

    /// Whether the task loop is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.is_running.store(running, Ordering::Release);
        if !running {
            self.idle_notify.notify_waiters();
        }
    }
}

/// Clears the active hook slot on drop
pub struct ActiveHookGuard {
    slot: Arc<Mutex<Option<ActiveHook>>>,
}

impl Drop for ActiveHookGuard {
    fn drop(&mut self) {
        self.slot.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hook(token: &CancellationToken) -> ActiveHook {
        ActiveHook {
            hook_name: "TaskStart".into(),
            tool_name: None,
            message_ts: 1,
            cancellation: token.clone(),
        }
    }

    #[test]
    fn test_abort_cancels_token_and_active_hook() {
        let handle = TaskHandle::new();
        let hook_token = CancellationToken::new();
        let _guard = handle.register_hook(hook(&hook_token));

        handle.abort();

        assert!(handle.is_aborted());
        assert!(!handle.is_abandoned());
        assert!(handle.cancel_token().is_cancelled());
        assert!(hook_token.is_cancelled());
    }

    #[test]
    fn test_hook_slot_cleared_when_guard_drops() {
        let handle = TaskHandle::new();
        let token = CancellationToken::new();
        {
            let _guard = handle.register_hook(hook(&token));
            assert_eq!(handle.active_hook().unwrap().hook_name, "TaskStart");
        }
        assert!(handle.active_hook().is_none());
        assert!(!handle.cancel_active_hook());
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_abandon_implies_abort() {
        let handle = TaskHandle::new();
        let clone = handle.clone();
        clone.abandon();
        assert!(handle.is_aborted());
        assert!(handle.is_abandoned());
    }

    #[tokio::test]
    async fn test_wait_for_idle() {
        let handle = TaskHandle::new();
        handle.wait_for_idle().await;

        handle.set_running(true);
        let waiter = handle.clone();
        let join = tokio::spawn(async move { waiter.wait_for_idle().await });
        tokio::task::yield_now().await;
        handle.set_running(false);
        join.await.unwrap();
        assert!(!handle.is_running());
    }
}
