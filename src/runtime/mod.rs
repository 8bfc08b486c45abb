//! A single-threaded concurrency runtime for Rust based on io_uring, with
//! cancellable, cooperatively-scheduled tasks.
//!
//! Call [`run`] (or `#[ringfiber::main]`) once per OS thread to start a
//! scheduler and drive a root future to completion; [`spawn`] more tasks onto
//! it from within. [`bridge`] crosses to independent scheduler instances on
//! other OS threads.

mod buffer_pool;
mod cancel;
pub(crate) mod fd;
mod io_driver;
pub(crate) mod ops;
mod run_queue;
mod scheduler;
pub(crate) mod sleep_queue;
mod switch;
mod task;
mod tls;

pub mod bridge;

use std::future::Future;

pub use scheduler::Config;
pub(crate) use switch::Switch;
pub use task::JoinHandle;

/// Starts a scheduler on the calling thread and drives `f()`'s future to
/// completion, returning its output. Panics inside the root future (or any
/// task it spawns, once they're polled) propagate out as a thread panic,
/// matching `std::thread::Builder::spawn`'s `thread::Result` convention.
///
/// Returns `Err` instead of panicking if the ring itself couldn't be set up
/// (e.g. `ENOSYS` on a kernel without io_uring support); `config.fallback` is
/// invoked with a diagnostic first (§6 "Ring ENOSYS fallback").
///
/// # Panics
/// Panics if called on a thread that's already running a ringfiber scheduler.
pub fn run<F, Fut, T>(f: F, config: Config) -> std::io::Result<std::thread::Result<T>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T> + 'static,
{
    let scheduler = scheduler::Scheduler::new(&config)?;

    Ok(std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        tls::exclusive_runtime(scheduler, || {
            let remote = tls::runtime(|scheduler| scheduler.remote());
            let root = task::create(f(), move |run_handle| remote.schedule(run_handle));
            scheduler::drive(root)
        })
    })))
}

/// [`run`] with a default [`Config`].
pub fn start<F, Fut, T>(f: F) -> std::io::Result<std::thread::Result<T>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T> + 'static,
{
    run(f, Config::default())
}

/// [`start`], taking the root future directly instead of a closure that
/// builds one. Convenient for `runtime::block_on(async { .. })`.
///
/// # Panics
/// Panics if the ring can't be set up, or if the root future panics.
pub fn block_on<Fut>(future: Fut) -> Fut::Output
where
    Fut: Future + 'static,
{
    start(move || future)
        .expect("failed to set up the io_uring ring")
        .unwrap()
}

/// Spawns `future` as an independent task on the current thread's scheduler,
/// returning a [`JoinHandle`] to await its output or request cancellation.
///
/// # Panics
/// Panics if called outside of [`run`] on this thread.
pub fn spawn<Fut>(future: Fut) -> JoinHandle<Fut::Output>
where
    Fut: Future + 'static,
{
    let remote = tls::runtime(|scheduler| scheduler.remote());
    task::create(future, move |run_handle| remote.schedule(run_handle))
}

/// Suspends the calling task once, letting other ready tasks run before it's
/// resumed (§5 "ordinary computation does not yield").
pub async fn yield_now() {
    struct YieldNow {
        yielded: bool,
    }

    impl Future for YieldNow {
        type Output = ();

        fn poll(mut self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<()> {
            if self.yielded {
                return std::task::Poll::Ready(());
            }
            self.yielded = true;
            cx.waker().wake_by_ref();
            std::task::Poll::Pending
        }
    }

    YieldNow { yielded: false }.await
}

/// Whether the task currently being polled has been cancelled.
///
/// # Panics
/// Panics if called outside of a task being polled by this runtime.
pub fn is_cancelled() -> bool {
    tls::current_cancel_token(|token| token.is_cancelled())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_root_future_to_completion() {
        let output = start(|| async { 1 + 1 }).unwrap().unwrap();
        assert_eq!(output, 2);
    }

    #[test]
    fn spawned_task_runs_and_is_joinable() {
        start(|| async {
            let handle = spawn(async { 41 + 1 });
            assert_eq!(handle.await, 42);
        })
        .unwrap()
        .unwrap();
    }

    #[test]
    fn cannot_nest_run_on_the_same_thread() {
        start(|| async {
            let inner = start(|| async {});
            assert!(inner.unwrap().is_err());
        })
        .unwrap()
        .unwrap();
    }

    #[test]
    fn is_cancelled_false_by_default() {
        start(|| async {
            let handle = spawn(async { is_cancelled() });
            assert!(!handle.await);
        })
        .unwrap()
        .unwrap();
    }
}
