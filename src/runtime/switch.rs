//! Structured-concurrency scope: a `Switch` accumulates release hooks and runs
//! them, most-recently-registered first, when the scope it guards ends (§4.7).
//!
//! Used to tie the lifetime of fds, spawned tasks, and other resources to a
//! lexical scope instead of requiring every caller to remember to clean up on
//! every early-return path (cancellation included).

use std::cell::RefCell;

use crate::runtime::cancel::CancelReason;

enum Hook {
    Always(Box<dyn FnOnce()>),
    /// Only runs if the scope is unwinding because of cancellation.
    OnCancel(Box<dyn FnOnce()>),
}

/// A lexical scope that runs accumulated hooks on drop, LIFO.
pub(crate) struct Switch {
    hooks: RefCell<Vec<Hook>>,
    cancel_reason: RefCell<Option<CancelReason>>,
}

impl Switch {
    pub(crate) fn new() -> Self {
        Switch {
            hooks: RefCell::new(Vec::new()),
            cancel_reason: RefCell::new(None),
        }
    }

    /// Registers a hook that always runs when the scope ends.
    pub(crate) fn on_release(&self, hook: impl FnOnce() + 'static) {
        self.hooks.borrow_mut().push(Hook::Always(Box::new(hook)));
    }

    /// Registers a hook that only runs if [`Self::mark_cancelled`] was called
    /// before the scope ended.
    pub(crate) fn on_release_cancellable(&self, hook: impl FnOnce() + 'static) {
        self.hooks
            .borrow_mut()
            .push(Hook::OnCancel(Box::new(hook)));
    }

    /// Records that this scope is unwinding because of cancellation, so that
    /// `on_release_cancellable` hooks fire when the scope ends.
    pub(crate) fn mark_cancelled(&self, reason: CancelReason) {
        *self.cancel_reason.borrow_mut() = Some(reason);
    }

    /// Returns the cancellation reason this scope is unwinding with, if any.
    pub(crate) fn check(&self) -> Option<CancelReason> {
        *self.cancel_reason.borrow()
    }
}

impl Drop for Switch {
    fn drop(&mut self) {
        let cancelled = self.cancel_reason.borrow().is_some();
        let hooks = std::mem::take(&mut *self.hooks.borrow_mut());

        for hook in hooks.into_iter().rev() {
            match hook {
                Hook::Always(f) => f(),
                Hook::OnCancel(f) => {
                    if cancelled {
                        f()
                    }
                }
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
    fn release_hooks_run_on_drop_in_reverse_order() {
        let order = Rc::new(RefCell::new(Vec::new()));

        {
            let switch = Switch::new();
            let a = order.clone();
            switch.on_release(move || a.borrow_mut().push(1));
            let b = order.clone();
            switch.on_release(move || b.borrow_mut().push(2));
        }

        assert_eq!(*order.borrow(), vec![2, 1]);
    }

    #[test]
    fn cancellable_hook_skipped_without_cancellation() {
        let ran = Rc::new(Cell::new(false));

        {
            let switch = Switch::new();
            let flag = ran.clone();
            switch.on_release_cancellable(move || flag.set(true));
        }

        assert!(!ran.get());
    }

    #[test]
    fn cancellable_hook_runs_when_marked_cancelled() {
        let ran = Rc::new(Cell::new(false));

        {
            let switch = Switch::new();
            let flag = ran.clone();
            switch.on_release_cancellable(move || flag.set(true));
            switch.mark_cancelled(CancelReason::Cancelled);
            assert_eq!(switch.check(), Some(CancelReason::Cancelled));
        }

        assert!(ran.get());
    }
}
