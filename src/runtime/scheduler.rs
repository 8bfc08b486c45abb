//! Per-thread scheduler: owns the io_uring driver, run queue, sleep queue, and
//! cross-thread wakeup channel, and drives the main loop (§4.3).
//!
//! One `Scheduler` exists for the lifetime of one [`super::run`] call, installed
//! into [`super::tls`] for the duration. It never outlives that call.

use std::sync::Once;
use std::time::{Duration, Instant};

use crate::runtime::buffer_pool::BufferPool;
use crate::runtime::io_driver::IoDriver;
use crate::runtime::run_queue::{self, RunQueue, RunQueueProducer};
use crate::runtime::sleep_queue::SleepQueue;
use crate::runtime::task::RunHandle;
use crate::runtime::wakeup::{self, Wakeup, WakeupProducer};

/// Tuning knobs for one [`super::run`] invocation (§4.2, §6).
#[derive(Clone)]
pub struct Config {
    /// Depth of the io_uring submission/completion queues.
    pub queue_depth: u32,
    /// Number of fixed buffers to register, or 0 to disable fixed buffers.
    pub fixed_buffer_count: u32,
    /// Size in bytes of each fixed buffer.
    pub fixed_buffer_size: u32,
    /// Idle time in milliseconds the kernel's submission-queue polling thread
    /// waits before parking, or `None` to not set up `SQPOLL` at all (§6).
    pub sqpoll_idle: Option<u32>,
    /// Invoked with a human-readable diagnostic, instead of panicking, if the
    /// ring can't be set up at all (e.g. `ENOSYS` on a kernel with no io_uring
    /// support) (§6 "Ring ENOSYS fallback").
    pub fallback: std::sync::Arc<dyn Fn(&str) + Send + Sync>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("queue_depth", &self.queue_depth)
            .field("fixed_buffer_count", &self.fixed_buffer_count)
            .field("fixed_buffer_size", &self.fixed_buffer_size)
            .field("sqpoll_idle", &self.sqpoll_idle)
            .field("fallback", &"<fn>")
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            queue_depth: 64,
            fixed_buffer_count: 64, // = queue_depth
            fixed_buffer_size: 4096,
            sqpoll_idle: None,
            fallback: std::sync::Arc::new(|message| eprintln!("ringfiber: {message}")),
        }
    }
}

pub(crate) struct Scheduler {
    io: IoDriver,
    run_queue: RunQueue,
    run_queue_producer: RunQueueProducer,
    sleep_queue: SleepQueue,
    wakeup: Wakeup,
    wakeup_producer: WakeupProducer,
}

/// `SIGPIPE`'s default disposition kills the process; ring-submitted writes to
/// a reader-gone pipe/socket raise it exactly like a blocking `write(2)` would
/// (§9 "Global signal handling"). Ignored once, process-wide, the first time
/// any thread starts a scheduler, so a broken pipe surfaces as `EPIPE` on the
/// CQE instead.
static IGNORE_SIGPIPE: Once = Once::new();

impl Scheduler {
    pub(crate) fn new(config: &Config) -> std::io::Result<Self> {
        IGNORE_SIGPIPE.call_once(|| unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        });

        let io = match IoDriver::new(
            config.queue_depth,
            config.fixed_buffer_count,
            config.fixed_buffer_size,
            config.sqpoll_idle,
        ) {
            Ok(io) => io,
            Err(err) => {
                (config.fallback)(&format!("failed to set up the io_uring ring: {err}"));
                return Err(err);
            }
        };
        let (run_queue_producer, run_queue) = run_queue::channel();
        let (wakeup, wakeup_producer) = wakeup::channel()?;

        Ok(Scheduler {
            io,
            run_queue,
            run_queue_producer,
            sleep_queue: SleepQueue::new(),
            wakeup,
            wakeup_producer,
        })
    }

    pub(crate) fn io_mut(&mut self) -> &mut IoDriver {
        &mut self.io
    }

    pub(crate) fn buffers(&self) -> Option<&BufferPool> {
        self.io.buffers()
    }

    pub(crate) fn buffers_mut(&mut self) -> &mut BufferPool {
        self.io.buffers_mut()
    }

    pub(crate) fn sleep_queue_mut(&mut self) -> &mut SleepQueue {
        &mut self.sleep_queue
    }

    pub(crate) fn schedule(&mut self, task: RunHandle) {
        self.run_queue.push_front(task);
    }

    /// Pops one runnable task off the local run queue, if any. Separate from
    /// actually running it: the caller must drop its `tls::runtime` borrow
    /// before calling `RunHandle::run`, since running a task can itself need
    /// fresh access to the scheduler (e.g. to submit a syscall) and the
    /// thread-local cell only supports one borrow at a time (§4.3).
    pub(crate) fn pop_ready(&mut self) -> Option<RunHandle> {
        self.run_queue.pop()
    }

    pub(crate) fn wake_due_sleepers(&mut self, now: Instant) {
        self.sleep_queue.wake_due(now);
    }

    pub(crate) fn is_quiescent(&self) -> bool {
        self.io.in_flight() == 0 && self.sleep_queue.is_empty() && self.run_queue.is_empty()
    }

    /// Invariant check for the scheduler's exit condition (§4.6): it must
    /// never go idle while a buffer request is still waiting to be granted.
    pub(crate) fn assert_no_stranded_buffer_waiters(&self) {
        assert!(
            !self.io.buffers().map(|pool| pool.has_waiters()).unwrap_or(false),
            "scheduler has no pending work but a buffer request is still waiting"
        );
    }

    /// A cloneable, `Send + Sync` handle other threads use to schedule work onto
    /// this scheduler and wake it up if it's blocked in the ring (§4.5).
    pub(crate) fn remote(&self) -> RemoteHandle {
        RemoteHandle {
            run_queue_producer: self.run_queue_producer.clone(),
            wakeup_producer: self.wakeup_producer.clone(),
        }
    }

    fn wait_timeout(&self, now: Instant) -> Option<Duration> {
        self.sleep_queue
            .earliest_deadline()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Blocks for at most `timeout` waiting for CQEs or a cross-thread wakeup,
    /// then dispatches whatever arrived (§4.3, §4.5).
    fn wait_for_completions(&mut self, timeout: Option<Duration>) {
        if self.io.has_completions() {
            self.io.process_completions();
            return;
        }

        self.io.ensure_wakeup_poll(self.wakeup.as_raw_fd());
        self.wakeup.arm();

        // A remote push between our last `pop_ready` drain and `arm()` can land
        // after `arm()` reads as armed but before the producer's `signal()` —
        // in that order `signal()` still sees `need_wakeup` and writes the
        // eventfd, so the race only bites the other way: a push that lands,
        // signals, and swaps `need_wakeup` back to `false` *before* this
        // `arm()` runs, leaving it armed with nothing left to wake it (§4.3
        // step 6, §4.5). Re-check the run queue now and skip blocking if a
        // task is already waiting.
        if !self.run_queue.is_empty() || self.io.has_completions() {
            self.wakeup.disarm();
            self.io.process_completions();
            return;
        }

        let want = 1;

        let result = match timeout {
            Some(timeout) => self.submit_and_wait_timeout(timeout),
            None => self.io.submit_and_wait(want),
        };

        self.wakeup.disarm();
        self.wakeup.drain();

        match result {
            Ok(_) => {}
            Err(err) if err.raw_os_error() == Some(libc::ETIME) => {}
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
            Err(err) => panic!("io_uring_enter failed: {err}"),
        }

        self.io.process_completions();
    }

    fn submit_and_wait_timeout(&mut self, timeout: Duration) -> std::io::Result<usize> {
        self.io.queue_wait_timeout(timeout);
        self.io.submit_and_wait(1)
    }
}

/// Runs the main loop until `root` completes, returning its output (§4.3).
///
/// Pops and runs tasks in two separate steps rather than one: `pop_ready`
/// takes (and releases) the thread-local scheduler borrow, then `RunHandle::run`
/// is called with no borrow held, since running a task legitimately needs its
/// own fresh access to the scheduler (e.g. to submit a syscall), and the
/// thread-local cell backing `tls::runtime` only supports one borrow at a time.
pub(crate) fn drive<O>(root: crate::runtime::task::JoinHandle<O>) -> O {
    use std::future::Future;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    let mut root = Box::pin(root);
    let root_waker = waker_fn::waker_fn(|| {});

    loop {
        while let Some(task) = super::tls::runtime(|scheduler| scheduler.pop_ready()) {
            task.run();
        }

        let now = Instant::now();
        super::tls::runtime(|scheduler| scheduler.wake_due_sleepers(now));

        while let Some(task) = super::tls::runtime(|scheduler| scheduler.pop_ready()) {
            task.run();
        }

        let mut context = Context::from_waker(&root_waker);
        if let Poll::Ready(output) = Pin::new(&mut root).as_mut().poll(&mut context) {
            return output;
        }

        super::tls::runtime(|scheduler| {
            if scheduler.is_quiescent() {
                scheduler.assert_no_stranded_buffer_waiters();
            }
        });

        let timeout = super::tls::runtime(|scheduler| scheduler.wait_timeout(now));
        super::tls::runtime(|scheduler| scheduler.wait_for_completions(timeout));
    }
}

/// `Send + Sync` handle used to reach a scheduler from another thread: push a
/// task onto its run queue and wake it if it's parked in `io_uring_enter`.
#[derive(Clone)]
pub(crate) struct RemoteHandle {
    run_queue_producer: RunQueueProducer,
    wakeup_producer: WakeupProducer,
}

impl RemoteHandle {
    pub(crate) fn schedule(&self, task: RunHandle) {
        self.run_queue_producer.push(task);
        self.wakeup_producer.signal();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_has_sane_defaults() {
        let config = Config::default();
        assert!(config.queue_depth > 0);
    }

    #[test]
    fn writing_to_a_broken_pipe_is_ignored_process_wide() {
        // Starting a scheduler once is enough to flip SIGPIPE's disposition
        // for the whole process (§9); a second broken-pipe write must report
        // EPIPE rather than kill the test process.
        let _ = Scheduler::new(&Config::default());

        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let [read_end, write_end] = fds;
        unsafe { libc::close(read_end) };

        let byte = 0u8;
        let result = unsafe { libc::write(write_end, &byte as *const _ as *const libc::c_void, 1) };
        assert_eq!(result, -1);
        assert_eq!(std::io::Error::last_os_error().raw_os_error(), Some(libc::EPIPE));

        unsafe { libc::close(write_end) };
    }
}
