//! Thread-local access to the current thread's [`super::scheduler::Scheduler`].
//!
//! Each OS thread that calls [`super::run`] owns an independent scheduler for the
//! duration of that call. Other modules reach it through [`scheduler`] rather than
//! threading a reference everywhere. Can transparently switch between using:
//! - `RefCell` and `UnsafeCell`.
//! - `thread_local` declarative and procedural macros.

use std::cell::RefCell;
use std::rc::Rc;

use super::cancel::CancelToken;

/// Cache padded to avoid potential performance hit due to false sharing.
#[repr(align(128))]
struct Runtime(RefCell<Option<super::scheduler::Scheduler>>);

#[cfg(not(feature = "fast_thread_local"))]
thread_local! {
    /// Each thread gets its own independent scheduler.
    static RUNTIME: Runtime = Runtime(RefCell::new(None));

    /// The cancel token of the task currently being polled, set for the duration
    /// of [`super::task::RunHandle::run`].
    static CURRENT_CANCEL_TOKEN: RefCell<Option<Rc<CancelToken>>> = RefCell::new(None);
}

/// Provides a scheduler for the duration of the closure.
#[cfg(not(feature = "fast_thread_local"))]
pub(super) fn exclusive_runtime<T>(scheduler: super::scheduler::Scheduler, f: impl FnOnce() -> T) -> T {
    RUNTIME.with(|thread_local| {
        let mut cell = thread_local.0.borrow_mut();
        assert!(cell.is_none(), "ringfiber::run cannot be nested on the same thread");
        *cell = Some(scheduler);
    });

    let output = f();

    let scheduler = RUNTIME.with(|thread_local| thread_local.0.borrow_mut().take().unwrap());
    drop(scheduler);

    output
}

/// Runs a closure that's given a reference to the active `Scheduler`.
#[cfg(not(feature = "fast_thread_local"))]
pub(super) fn runtime<T>(f: impl FnOnce(&mut super::scheduler::Scheduler) -> T) -> T {
    RUNTIME.with(|thread_local| {
        let mut cell = thread_local.0.borrow_mut();
        let runtime = cell.as_mut().expect("no ringfiber runtime on this thread");
        f(runtime)
    })
}

#[cfg(not(feature = "fast_thread_local"))]
pub(super) fn has_runtime() -> bool {
    RUNTIME.with(|thread_local| thread_local.0.borrow().is_some())
}

#[cfg(feature = "fast_thread_local")]
#[thread_local]
static RUNTIME: Runtime = Runtime(RefCell::new(None));

#[cfg(feature = "fast_thread_local")]
thread_local! {
    static CURRENT_CANCEL_TOKEN: RefCell<Option<Rc<CancelToken>>> = RefCell::new(None);
}

/// Provides a scheduler for the duration of the closure.
#[cfg(feature = "fast_thread_local")]
pub(super) fn exclusive_runtime<T>(scheduler: super::scheduler::Scheduler, f: impl FnOnce() -> T) -> T {
    {
        let mut cell = RUNTIME.0.borrow_mut();
        assert!(cell.is_none(), "ringfiber::run cannot be nested on the same thread");
        *cell = Some(scheduler);
    }

    let output = f();

    let scheduler = RUNTIME.0.borrow_mut().take().unwrap();
    drop(scheduler);

    output
}

/// Runs a closure that's given a reference to the active `Scheduler`.
#[cfg(feature = "fast_thread_local")]
pub(super) fn runtime<T>(f: impl FnOnce(&mut super::scheduler::Scheduler) -> T) -> T {
    let mut cell = RUNTIME.0.borrow_mut();
    let runtime = cell.as_mut().expect("no ringfiber runtime on this thread");
    f(runtime)
}

#[cfg(feature = "fast_thread_local")]
pub(super) fn has_runtime() -> bool {
    RUNTIME.0.borrow().is_some()
}

/// Installs `token` as the currently-polling task's cancel token for the duration of `f`.
pub(super) fn with_current_cancel_token<T>(token: Rc<CancelToken>, f: impl FnOnce() -> T) -> T {
    let previous = CURRENT_CANCEL_TOKEN.with(|cell| cell.borrow_mut().replace(token));
    let output = f();
    CURRENT_CANCEL_TOKEN.with(|cell| *cell.borrow_mut() = previous);
    output
}

/// Runs a closure with the currently-polling task's cancel token.
///
/// # Panics
/// Panics if called outside of a task poll (e.g. outside async code driven by this crate).
pub(super) fn current_cancel_token<T>(f: impl FnOnce(&Rc<CancelToken>) -> T) -> T {
    CURRENT_CANCEL_TOKEN.with(|cell| {
        let borrow = cell.borrow();
        let token = borrow.as_ref().expect("not running inside a ringfiber task");
        f(token)
    })
}
