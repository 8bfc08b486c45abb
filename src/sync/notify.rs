//! FIFO-ordered broadcast: any number of tasks can register a [`waiter`](Notify::waiter)
//! ahead of time, to be woken later by [`notify_one`](Notify::notify_one) or
//! [`notify_all`](Notify::notify_all). Unlike a condvar there's no lock to hold
//! while waiting — a waiter registered before the notify call always observes it,
//! one registered after does not.

use crate::sync::oneshot_notify;
use std::collections::VecDeque;

/// A single-threaded broadcast point. Registered waiters are delivered in
/// registration order by `notify_one`; `notify_all` wakes every waiter
/// outstanding at the time of the call.
#[derive(Debug)]
pub struct Notify {
    notifiers: VecDeque<oneshot_notify::Notifier>,
}

impl Notify {
    /// Creates a `Notify` with no waiters registered.
    pub fn new() -> Self {
        Notify {
            notifiers: VecDeque::new(),
        }
    }

    /// Registers a new waiter, to be woken by a future `notify_one` or
    /// `notify_all` call (not by any call that already happened).
    pub fn waiter(&mut self) -> oneshot_notify::Waiter {
        let (notifier, waiter) = oneshot_notify::oneshot_notify();
        self.notifiers.push_back(notifier);
        waiter
    }

    /// Wakes the oldest outstanding waiter, if any.
    pub fn notify_one(&mut self) {
        if let Some(notifier) = self.notifiers.pop_front() {
            notifier.notify();
        }
    }

    /// Wakes every outstanding waiter.
    pub fn notify_all(&mut self) {
        for notifier in self.notifiers.drain(..) {
            notifier.notify();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::oneshot_notify;
    use impls::impls;
    use std::fmt::Debug;
    use std::future::Future;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    fn poll(waiter: &mut oneshot_notify::Waiter) -> Poll<()> {
        let waker = noop_waker::noop_waker();
        let mut context = Context::from_waker(&waker);
        let waiter = unsafe { Pin::new_unchecked(waiter) };
        waiter.poll(&mut context)
    }

    #[test]
    fn pending_initially() {
        let mut notify = Notify::new();
        let mut waiter = notify.waiter();

        assert!(poll(&mut waiter).is_pending());
    }

    #[test]
    fn pending_if_created_after_notify() {
        let mut notify = Notify::new();

        notify.notify_one();
        notify.notify_all();

        let mut waiter = notify.waiter();
        assert!(poll(&mut waiter).is_pending());
    }

    #[test]
    fn ready_after_notify_one() {
        let mut notify = Notify::new();
        let mut waiter1 = notify.waiter();
        let mut waiter2 = notify.waiter();

        notify.notify_one();

        assert!(poll(&mut waiter1).is_ready());
        assert!(poll(&mut waiter2).is_pending());
    }

    #[test]
    fn ready_after_notify_all() {
        let mut notify = Notify::new();
        let mut waiter1 = notify.waiter();
        let mut waiter2 = notify.waiter();

        notify.notify_all();

        assert!(poll(&mut waiter1).is_ready());
        assert!(poll(&mut waiter2).is_ready());
    }

    #[test]
    fn pending_after_notify_drop() {
        let mut notify = Notify::new();
        let mut waiter = notify.waiter();

        drop(notify);

        assert!(poll(&mut waiter).is_pending());
    }

    #[test]
    fn unaware_of_dropped_waiter() {
        let mut notify = Notify::new();
        let waiter1 = notify.waiter();
        let mut waiter2 = notify.waiter();

        drop(waiter1);
        notify.notify_one();

        assert!(poll(&mut waiter2).is_pending());
    }

    #[test]
    fn trait_implementations() {
        assert!(impls!(Notify: Debug & !Send & !Sync));
    }
}
