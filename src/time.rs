//! Timers (§4.6 "sleep queue"), exposed as plain `async fn`s rather than raw
//! io_uring operations: unlike file and socket I/O, a sleep never touches the
//! ring at all, it's a pure in-process priority queue of deadlines drained by
//! the scheduler loop (§4.3 step 2).

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use crate::runtime::sleep_queue::Token;
use crate::runtime::tls;
use crate::{CancellableResult, Error};

/// Suspends the calling task for `duration`, unless cancelled first (§5
/// "Timeouts").
pub async fn sleep(duration: Duration) -> CancellableResult<()> {
    sleep_until(Instant::now() + duration).await
}

/// Suspends the calling task until `deadline`, unless cancelled first.
///
/// Used to build the "race against a timeout" combinator (§5) via
/// [`crate::runtime::ops::first`] — whichever side of the race finishes
/// first cancels the other, and a timed-out operation drops its `Sleep`
/// future along with everything else still in flight.
pub async fn sleep_until(deadline: Instant) -> CancellableResult<()> {
    Sleep { deadline, token: None }.await
}

/// Returned by [`timeout`] when `duration` elapses before `future` completes.
#[derive(thiserror::Error, Debug, Copy, Clone, Eq, PartialEq)]
#[error("timed out")]
pub struct Elapsed;

/// Races `future` against a `duration`-long sleep, cancelling whichever one
/// doesn't finish first (§5 "Timeouts").
pub async fn timeout<F: Future>(duration: Duration, future: F) -> Result<F::Output, Elapsed> {
    use crate::runtime::ops::{first, Either};

    match first(Box::pin(future), Box::pin(sleep(duration))).await {
        Either::Left(output) => Ok(output),
        Either::Right(_) => Err(Elapsed),
    }
}

struct Sleep {
    deadline: Instant,
    token: Option<Token>,
}

impl Future for Sleep {
    type Output = CancellableResult<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if tls::current_cancel_token(|token| token.get_error()).is_some() {
            if let Some(token) = this.token.take() {
                tls::runtime(|scheduler| scheduler.sleep_queue_mut().remove(token));
            }
            tls::current_cancel_token(|token| token.clear_cancel_fn());
            return Poll::Ready(Err(Error::Cancelled));
        }

        if Instant::now() >= this.deadline {
            if let Some(token) = this.token.take() {
                tls::runtime(|scheduler| scheduler.sleep_queue_mut().remove(token));
                tls::current_cancel_token(|token| token.clear_cancel_fn());
            }
            return Poll::Ready(Ok(()));
        }

        if this.token.is_none() {
            let token = tls::runtime(|scheduler| {
                scheduler.sleep_queue_mut().insert(this.deadline, cx.waker().clone())
            });
            this.token = Some(token);

            let remove_token = token;
            let waker = cx.waker().clone();
            tls::current_cancel_token(|current| {
                current.set_cancel_fn(move || {
                    tls::runtime(|scheduler| scheduler.sleep_queue_mut().remove(remove_token));
                    waker.wake();
                });
            });
        }

        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime;

    mod sleep {
        use super::*;

        #[test]
        fn returns_immediately_with_zero() {
            // Problematic for timerfd-based implementations.
            runtime::block_on(async {
                let before = Instant::now();
                sleep(Duration::from_millis(0)).await.unwrap();
                assert!(before.elapsed() <= Duration::from_millis(20));
            });
        }

        #[test]
        fn passes_time() {
            runtime::block_on(async {
                let before = Instant::now();
                sleep(Duration::from_millis(5)).await.unwrap();
                assert!(before.elapsed() >= Duration::from_millis(5));
            });
        }

        #[test]
        fn cancelling_a_sleeper_resumes_it_early_with_the_cancellation_reason() {
            // §8 end-to-end scenario 2: fiber A sleeps 1s, fiber B cancels it at
            // ~0.1s. A should observe the cancellation well before the deadline.
            runtime::block_on(async {
                let handle = runtime::spawn(async { sleep(Duration::from_secs(1)).await });

                sleep(Duration::from_millis(50)).await.unwrap();
                handle.cancel();

                let before = Instant::now();
                let result = handle.await;

                assert_eq!(result, Err(Error::Cancelled));
                assert!(before.elapsed() < Duration::from_millis(500));
            });
        }
    }

    mod timeout {
        use super::*;

        #[test]
        fn returns_the_future_s_output_when_it_wins_the_race() {
            runtime::block_on(async {
                let result = timeout(Duration::from_secs(1), async { 42 }).await;
                assert_eq!(result, Ok(42));
            });
        }

        #[test]
        fn returns_elapsed_when_the_duration_wins_the_race() {
            runtime::block_on(async {
                let before = Instant::now();
                let result = timeout(Duration::from_millis(10), async {
                    sleep(Duration::from_secs(1)).await.unwrap();
                })
                .await;

                assert_eq!(result, Err(Elapsed));
                assert!(before.elapsed() < Duration::from_millis(500));
            });
        }

        #[test]
        fn racing_twice_in_a_row_does_not_panic_on_a_stale_cancel_callback() {
            // A task polling two `first()` races back to back exercises the
            // same cancel slot twice; a leftover callback from the first race
            // must not trip the "one live callback" invariant on the second.
            runtime::block_on(async {
                timeout(Duration::from_millis(10), sleep(Duration::from_secs(1))).await.ok();
                let result = timeout(Duration::from_secs(1), async { 1 }).await;
                assert_eq!(result, Ok(1));
            });
        }
    }
}
