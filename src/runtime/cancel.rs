//! Per-task cancellation state.
//!
//! Every task gets exactly one [`CancelToken`], shared between the task itself
//! (consulted through the thread-local set up by [`super::tls`] while the task is
//! being polled) and anyone holding a [`super::task::JoinHandle`] for it.

use std::cell::RefCell;

/// The reason a task observes `get_error()` as `Some`.
///
/// A unit-like marker today: nothing in this crate needs to distinguish *why* a
/// task was cancelled, only that it was. Kept as its own `thiserror` enum (rather
/// than a bare marker struct) so a future cancellation reason can be added without
/// breaking callers matching on it.
#[derive(thiserror::Error, Debug, Copy, Clone, Eq, PartialEq)]
pub enum CancelReason {
    #[error("cancelled")]
    Cancelled,
}

struct State {
    reason: Option<CancelReason>,
    cancel_fn: Option<Box<dyn FnOnce()>>,
}

/// Cancellation state shared by a task and anything holding a handle to it.
///
/// Invariant: at most one `cancel_fn` is installed at a time (§4.1); `cancel()`
/// takes it before calling it, so a second cancellation of an already-cancelled
/// token is a no-op.
pub(crate) struct CancelToken(RefCell<State>);

impl CancelToken {
    pub(crate) fn new() -> Self {
        CancelToken(RefCell::new(State {
            reason: None,
            cancel_fn: None,
        }))
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.0.borrow().reason.is_some()
    }

    pub(crate) fn get_error(&self) -> Option<CancelReason> {
        self.0.borrow().reason
    }

    /// Installs a cancellation callback. Overwrites any previous one; callers are
    /// responsible for clearing it (via [`Self::clear_cancel_fn`]) before a
    /// suspension point installs another.
    pub(crate) fn set_cancel_fn(&self, f: impl FnOnce() + 'static) {
        let mut state = self.0.borrow_mut();
        debug_assert!(state.cancel_fn.is_none(), "at most one live cancel callback per task");
        state.cancel_fn = Some(Box::new(f));
    }

    pub(crate) fn clear_cancel_fn(&self) {
        self.0.borrow_mut().cancel_fn = None;
    }

    /// Marks this token cancelled and fires its installed cancel callback, if any.
    /// Safe to call more than once; only the first call has any effect.
    pub(crate) fn cancel(&self) {
        let (already_cancelled, cancel_fn) = {
            let mut state = self.0.borrow_mut();
            let already_cancelled = state.reason.is_some();
            state.reason.get_or_insert(CancelReason::Cancelled);
            (already_cancelled, state.cancel_fn.take())
        };

        if !already_cancelled {
            if let Some(f) = cancel_fn {
                f();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn starts_uncancelled() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.get_error().is_none());
    }

    #[test]
    fn cancel_runs_callback_once() {
        let token = CancelToken::new();
        let calls = Rc::new(Cell::new(0));

        let calls_clone = calls.clone();
        token.set_cancel_fn(move || calls_clone.set(calls_clone.get() + 1));

        token.cancel();
        token.cancel();

        assert_eq!(calls.get(), 1);
        assert!(token.is_cancelled());
    }

    #[test]
    fn cancel_without_installed_callback_still_marks_cancelled() {
        let token = CancelToken::new();
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn clear_cancel_fn_prevents_it_from_firing() {
        let token = CancelToken::new();
        let calls = Rc::new(Cell::new(0));

        let calls_clone = calls.clone();
        token.set_cancel_fn(move || calls_clone.set(calls_clone.get() + 1));
        token.clear_cancel_fn();

        token.cancel();

        assert_eq!(calls.get(), 0);
    }
}
