//! Owned kernel file descriptor with open/closed state (§3).
//!
//! Closing goes through the ring (`close` SQE) rather than the blocking
//! `libc::close`, and is not cancellable (§9 Open Question (b), preserved from
//! the source). Once closed, any further use is a programmer error.

use std::cell::Cell;
use std::os::fd::RawFd;

use crate::runtime::io_driver;
use crate::runtime::switch::Switch;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum State {
    Open,
    Closed,
}

/// An owned, ring-managed file descriptor.
#[derive(Debug)]
pub(crate) struct Fd {
    raw: RawFd,
    state: Cell<State>,
    /// Whether dropping/closing this handle should close the underlying kernel
    /// fd, or whether it's borrowed from outside (e.g. stdin/stdout).
    close_kernel_fd: bool,
    seekable: bool,
}

impl Fd {
    /// Wraps a raw fd, probing whether it's seekable via `lseek(SEEK_CUR)`.
    pub(crate) fn new(raw: RawFd, close_kernel_fd: bool) -> Self {
        let seekable = unsafe { libc::lseek(raw, 0, libc::SEEK_CUR) } >= 0;

        Fd {
            raw,
            state: Cell::new(State::Open),
            close_kernel_fd,
            seekable,
        }
    }

    /// Registers this handle's release hook with `switch`: closing the scope
    /// closes the fd if it's still open.
    pub(crate) fn bind_to(self: std::rc::Rc<Self>, switch: &Switch) {
        let fd = self.clone();
        switch.on_release(move || fd.close_sync_if_open());
    }

    pub(crate) fn raw(&self) -> RawFd {
        assert_eq!(self.state.get(), State::Open, "use of a closed file descriptor");
        self.raw
    }

    pub(crate) fn is_seekable(&self) -> bool {
        self.seekable
    }

    /// Offset to use for file operations: the file's current position for
    /// non-seekable fds (pipes, sockets), expressed as the `-1` sentinel `Uring`
    /// operations expect.
    pub(crate) fn offset_or_sentinel(&self, offset: Option<u64>) -> i64 {
        match offset {
            Some(offset) if self.seekable => offset as i64,
            _ => -1,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.get() == State::Closed
    }

    /// Asynchronously closes the fd through the ring. Non-cancellable by design.
    pub(crate) async fn close(&self) -> crate::IoResult<()> {
        if self.state.get() == State::Closed || !self.close_kernel_fd {
            self.state.set(State::Closed);
            return Ok(());
        }

        self.state.set(State::Closed);
        let raw = self.raw;
        io_driver::syscall_non_cancellable(move |user_data| {
            io_uring::opcode::Close::new(raw).build().user_data(user_data)
        })
        .await
        .map(|_| ())
    }

    /// Best-effort fire-and-forget close, used from contexts that can't `.await`
    /// (structured-concurrency release hooks, and `Drop` impls of fd-owning
    /// collaborators like `fs::File`).
    pub(crate) fn close_sync_if_open(&self) {
        if self.state.get() == State::Closed || !self.close_kernel_fd {
            return;
        }
        self.state.set(State::Closed);

        let raw = self.raw;
        io_driver::fire_and_forget(
            move |user_data| io_uring::opcode::Close::new(raw).build().user_data(user_data),
            |_result| {},
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probes_seekability() {
        let file = std::fs::File::open("/dev/null").unwrap();
        let fd = Fd::new(std::os::fd::AsRawFd::as_raw_fd(&file), false);
        // /dev/null supports lseek, returning 0, so it reads as seekable.
        assert!(fd.is_seekable());
        std::mem::forget(file); // fd ownership modeled by close_kernel_fd, not std::fs::File
    }

    #[test]
    fn offset_sentinel_for_non_seekable() {
        let (read_end, _write_end) = {
            let mut fds = [0; 2];
            assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
            (fds[0], fds[1])
        };

        let fd = Fd::new(read_end, true);
        assert!(!fd.is_seekable());
        assert_eq!(fd.offset_or_sentinel(Some(10)), -1);
    }
}
