use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

type Hook = Box<dyn FnOnce() + Send>;

/// caller-side deadline and cancellation scope for a call. Cancellation is
/// local: it fails the waiter, nothing is transmitted to the server.
#[derive(Clone, Default)]
pub struct Context {
    deadline: Option<Instant>,
    cancel: Option<Arc<CancelState>>,
}

#[derive(Default)]
struct CancelState {
    cancelled: AtomicBool,
    hooks: Mutex<Vec<Hook>>,
}

impl CancelState {
    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let hooks = std::mem::take(&mut *self.hooks.lock().expect("context hooks poisoned"));
        for hook in hooks {
            hook();
        }
    }

    fn on_cancel(&self, hook: Hook) {
        let mut hooks = self.hooks.lock().expect("context hooks poisoned");
        if self.cancelled.load(Ordering::SeqCst) {
            drop(hooks);
            hook();
        } else {
            hooks.push(hook);
        }
    }
}

impl Context {
    pub fn background() -> Context {
        Context::default()
    }

    pub fn with_timeout(d: Duration) -> Context {
        Context {
            deadline: Some(Instant::now() + d),
            cancel: None,
        }
    }

    /// derives a cancellable child; cancelling the parent cancels the
    /// child, and the child inherits the parent's deadline.
    pub fn with_cancel(parent: &Context) -> (Context, CancelHandle) {
        let state = Arc::new(CancelState::default());
        if let Some(parent_state) = &parent.cancel {
            let child = state.clone();
            parent_state.on_cancel(Box::new(move || child.cancel()));
        }
        let ctx = Context {
            deadline: parent.deadline,
            cancel: Some(state.clone()),
        };
        (ctx, CancelHandle { state })
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|c| c.cancelled.load(Ordering::SeqCst))
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// runs `hook` when this context is cancelled, or immediately if it
    /// already was. No-op for non-cancellable contexts.
    pub(crate) fn on_cancel(&self, hook: Hook) {
        if let Some(state) = &self.cancel {
            state.on_cancel(hook);
        }
    }
}

pub struct CancelHandle {
    state: Arc<CancelState>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.state.cancel();
    }
}
