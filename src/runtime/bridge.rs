//! Cross-domain bridge (§4.7): hops from the calling task to an independent
//! OS thread, suspending until that thread finishes and its result is
//! delivered back onto the calling scheduler's run queue.
//!
//! `run_raw` just runs a closure on a fresh thread (a `spawn_blocking` for
//! CPU-bound or blocking work). `run` goes one step further and starts a
//! whole new scheduler instance on that thread, running `f`'s future as its
//! root task. Neither shares a run queue with the caller: the two scheduler
//! instances (if any) communicate only through this one result handoff.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::thread;

use super::Config;

struct Shared<T> {
    result: Option<T>,
    waker: Option<Waker>,
}

/// Runs `f` on a new OS thread, suspending the calling task until it returns.
///
/// Unlike a task spawned with [`super::spawn`], `f` runs with no access to
/// this thread's scheduler: it's plain blocking code (or, compose with
/// [`run`] below, a fresh one of its own).
pub async fn run_raw<T, F>(f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    RunRaw {
        shared: Arc::new(Mutex::new(Shared { result: None, waker: None })),
        f: Some(f),
        started: false,
    }
    .await
}

struct RunRaw<T, F> {
    shared: Arc<Mutex<Shared<T>>>,
    f: Option<F>,
    started: bool,
}

impl<T, F> Future for RunRaw<T, F>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let this = self.get_mut();

        if !this.started {
            this.started = true;
            let shared = this.shared.clone();
            let f = this.f.take().expect("RunRaw polled after completion");

            thread::spawn(move || {
                let output = f();
                let waker = {
                    let mut guard = shared.lock().unwrap();
                    guard.result = Some(output);
                    guard.waker.take()
                };
                if let Some(waker) = waker {
                    waker.wake();
                }
            });
        }

        let mut guard = this.shared.lock().unwrap();
        match guard.result.take() {
            Some(output) => Poll::Ready(output),
            None => {
                guard.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

/// Starts an independent scheduler on a new OS thread, running `f()`'s future
/// as its root task, and suspends the calling task until it completes.
///
/// # Panics
/// Propagates a panic from the spawned domain's root future as a panic here.
pub async fn run<F, Fut, T>(f: F, config: Config) -> T
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = T> + 'static,
    T: Send + 'static,
{
    run_raw(move || {
        super::run(f, config)
            .expect("failed to set up the io_uring ring on the spawned domain")
            .expect("spawned ringfiber domain panicked")
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_raw_returns_closures_output() {
        let output = crate::runtime::start(|| async { run_raw(|| 1 + 1).await }).unwrap().unwrap();
        assert_eq!(output, 2);
    }

    #[test]
    fn run_starts_an_independent_scheduler() {
        let output = crate::runtime::start(|| async { run(|| async { 41 + 1 }, Config::default()).await })
            .unwrap()
            .unwrap();
        assert_eq!(output, 42);
    }
}
