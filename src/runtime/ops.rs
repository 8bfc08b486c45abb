//! SQE builders for every opcode the core exposes (§4.2, §6), layered over the
//! cancellable-syscall primitive in [`super::io_driver`].
//!
//! Everything here is `pub(crate)`: higher layers (`fs`, `net`, `time`,
//! `process`) are external collaborators consuming this narrow contract, not
//! part of the core itself.

use std::future::Future;
use std::os::fd::RawFd;
use std::pin::Pin;
use std::task::{Context, Poll};

use io_uring::{opcode, types};

use crate::runtime::{buffer_pool, io_driver, tls};
use crate::{Error, IoResult};

/// Reads into a registered (fixed) buffer at `offset` (`-1` for "current
/// position" on non-seekable fds, per [`super::fd::Fd::offset_or_sentinel`]).
pub(crate) async fn read_fixed(fd: RawFd, buf: &mut [u8], buf_index: u32, offset: i64) -> IoResult<u32> {
    let pointer = buf.as_mut_ptr();
    let len = buf.len() as u32;
    io_driver::syscall(move |user_data| {
        opcode::ReadFixed::new(types::Fd(fd), pointer, len, buf_index)
            .offset(offset as u64)
            .build()
            .user_data(user_data)
    })
    .await
}

pub(crate) async fn write_fixed(fd: RawFd, buf: &[u8], buf_index: u32, offset: i64) -> IoResult<u32> {
    let pointer = buf.as_ptr();
    let len = buf.len() as u32;
    io_driver::syscall(move |user_data| {
        opcode::WriteFixed::new(types::Fd(fd), pointer, len, buf_index)
            .offset(offset as u64)
            .build()
            .user_data(user_data)
    })
    .await
}

/// Vectored read for unregistered user buffers.
pub(crate) async fn readv(fd: RawFd, iovecs: &mut [libc::iovec], offset: i64) -> IoResult<u32> {
    let pointer = iovecs.as_mut_ptr() as *const libc::iovec;
    let len = iovecs.len() as u32;
    io_driver::syscall(move |user_data| {
        opcode::Readv::new(types::Fd(fd), pointer, len)
            .offset(offset as u64)
            .build()
            .user_data(user_data)
    })
    .await
}

pub(crate) async fn writev(fd: RawFd, iovecs: &[libc::iovec], offset: i64) -> IoResult<u32> {
    let pointer = iovecs.as_ptr();
    let len = iovecs.len() as u32;
    io_driver::syscall(move |user_data| {
        opcode::Writev::new(types::Fd(fd), pointer, len)
            .offset(offset as u64)
            .build()
            .user_data(user_data)
    })
    .await
}

/// `openat2(2)`: access/flags/permissions/resolve-flags, with an optional
/// directory fd (`None` resolves relative to the process cwd, `AT_FDCWD`).
pub(crate) async fn openat2(
    dir_fd: Option<RawFd>,
    path: *const libc::c_char,
    how: &io_uring::types::OpenHow,
) -> IoResult<u32> {
    let dir_fd = types::Fd(dir_fd.unwrap_or(libc::AT_FDCWD));
    let how = how as *const _;
    io_driver::syscall(move |user_data| {
        opcode::OpenAt2::new(dir_fd, path, how)
            .build()
            .user_data(user_data)
    })
    .await
}

pub(crate) async fn mkdirat(dir_fd: Option<RawFd>, path: *const libc::c_char, mode: u32) -> IoResult<u32> {
    let dir_fd = types::Fd(dir_fd.unwrap_or(libc::AT_FDCWD));
    io_driver::syscall(move |user_data| {
        opcode::MkDirAt::new(dir_fd, path)
            .mode(mode)
            .build()
            .user_data(user_data)
    })
    .await
}

pub(crate) async fn unlinkat(dir_fd: Option<RawFd>, path: *const libc::c_char) -> IoResult<u32> {
    let dir_fd = types::Fd(dir_fd.unwrap_or(libc::AT_FDCWD));
    io_driver::syscall(move |user_data| {
        opcode::UnlinkAt::new(dir_fd, path).build().user_data(user_data)
    })
    .await
}

/// `fsync(2)`/`fdatasync(2)` via the ring; `data_only` sets `IORING_FSYNC_DATASYNC`.
pub(crate) async fn fsync(fd: RawFd, data_only: bool) -> IoResult<u32> {
    let mut sqe = opcode::Fsync::new(types::Fd(fd));
    if data_only {
        sqe = sqe.flags(types::FsyncFlags::DATASYNC);
    }
    io_driver::syscall(move |user_data| sqe.build().user_data(user_data)).await
}

pub(crate) async fn connect(fd: RawFd, addr: *const libc::sockaddr, addr_len: libc::socklen_t) -> IoResult<u32> {
    io_driver::syscall(move |user_data| {
        opcode::Connect::new(types::Fd(fd), addr, addr_len)
            .build()
            .user_data(user_data)
    })
    .await
}

pub(crate) async fn accept(fd: RawFd, addr: *mut libc::sockaddr, addr_len: *mut libc::socklen_t) -> IoResult<u32> {
    io_driver::syscall(move |user_data| {
        opcode::Accept::new(types::Fd(fd), addr, addr_len)
            .flags(libc::SOCK_CLOEXEC)
            .build()
            .user_data(user_data)
    })
    .await
}

/// Moves data between two fds entirely within the kernel (e.g. socket -> file)
/// without round-tripping through userspace (§1 scenario 3's zero-copy path).
pub(crate) async fn splice(
    fd_in: RawFd,
    off_in: i64,
    fd_out: RawFd,
    off_out: i64,
    len: u32,
) -> IoResult<u32> {
    io_driver::syscall(move |user_data| {
        opcode::Splice::new(types::Fd(fd_in), off_in, types::Fd(fd_out), off_out, len)
            .build()
            .user_data(user_data)
    })
    .await
}

/// Copies from `from_fd` to `to_fd` until end-of-input, preferring the
/// in-kernel `splice` path and falling back to a fixed-buffer copy loop if
/// the kernel rejects it outright (§8 scenario 3 "socket -> socket copy
/// where splice returns EINVAL").
pub(crate) async fn copy(from_fd: RawFd, to_fd: RawFd) -> IoResult<u64> {
    const SPLICE_CHUNK: u32 = 1 << 20;

    let mut total = 0u64;

    loop {
        match splice(from_fd, -1, to_fd, -1, SPLICE_CHUNK).await {
            Ok(0) => return Ok(total),
            Ok(n) => total += n as u64,
            Err(Error::Original(err)) if err.raw_os_error() == Some(libc::EINVAL) => break,
            Err(other) => return Err(other),
        }
    }

    copy_via_fixed_buffer(from_fd, to_fd, total).await
}

/// `splice` isn't supported between these two fds on this kernel; copy the
/// rest through a registered fixed buffer chunk instead, or a stack buffer
/// if this scheduler never registered any (§4.6).
async fn copy_via_fixed_buffer(from_fd: RawFd, to_fd: RawFd, mut total: u64) -> IoResult<u64> {
    let has_pool = tls::runtime(|scheduler| scheduler.buffers().is_some());

    if !has_pool {
        let mut stack_buffer = [0u8; 8192];
        loop {
            let read = read_upto(from_fd, &mut stack_buffer, None, false).await?;
            if read == 0 {
                return Ok(total);
            }
            write_all(to_fd, &stack_buffer[..read], None, false).await?;
            total += read as u64;
        }
    }

    loop {
        let mut chunk = buffer_pool::alloc_or_wait().await;
        let read = read_upto_fixed(from_fd, chunk.as_mut_slice(), chunk.buf_index(), None, false).await?;
        if read == 0 {
            return Ok(total);
        }
        write_all_fixed(to_fd, &chunk.as_slice()[..read], chunk.buf_index(), None, false).await?;
        total += read as u64;
    }
}

/// Sends one datagram described by `msg` (destination address plus iovecs),
/// for connectionless sockets that address each message individually rather
/// than a connected stream's plain `writev` (§4.2).
pub(crate) async fn send_msg(fd: RawFd, msg: *const libc::msghdr) -> IoResult<u32> {
    io_driver::syscall(move |user_data| {
        opcode::SendMsg::new(types::Fd(fd), msg).build().user_data(user_data)
    })
    .await
}

/// Receives one datagram into `msg`, filling in its source address.
pub(crate) async fn recv_msg(fd: RawFd, msg: *mut libc::msghdr) -> IoResult<u32> {
    io_driver::syscall(move |user_data| {
        opcode::RecvMsg::new(types::Fd(fd), msg).build().user_data(user_data)
    })
    .await
}

pub(crate) async fn poll_add(fd: RawFd, flags: u32) -> IoResult<u32> {
    io_driver::syscall(move |user_data| {
        opcode::PollAdd::new(types::Fd(fd), flags)
            .build()
            .user_data(user_data)
    })
    .await
}

/// Suspends until `fd` has data to read (or a peer shutdown/error is
/// pending), without consuming anything. Lets a collaborator wait for
/// readiness ahead of issuing its own read (§6 core-to-collaborator contract).
pub(crate) async fn await_readable(fd: RawFd) -> IoResult<()> {
    poll_add(fd, libc::POLLIN as u32).await.map(|_| ())
}

/// Suspends until `fd` is ready to accept a write without blocking.
pub(crate) async fn await_writable(fd: RawFd) -> IoResult<()> {
    poll_add(fd, libc::POLLOUT as u32).await.map(|_| ())
}

/// No-op round trip through the ring. Useful for benchmarking submission
/// latency and as a liveness probe.
pub(crate) async fn noop() -> IoResult<u32> {
    io_driver::syscall(|user_data| opcode::Nop::new().build().user_data(user_data)).await
}

/// Reads exactly `buf.len()` bytes (or fewer at end-of-stream), applying the
/// short-transfer retry policy of §4.2: partial reads advance the offset and
/// resubmit, EINTR/EAGAIN/ECANCELED resubmit unchanged, 0 signals EOF.
pub(crate) async fn read_exactly_fixed(
    fd: RawFd,
    buf: &mut [u8],
    buf_index: u32,
    mut offset: Option<u64>,
    seekable: bool,
) -> IoResult<usize> {
    let mut filled = 0;

    while filled < buf.len() {
        let sentinel = sentinel_offset(offset, seekable);
        match read_fixed(fd, &mut buf[filled..], buf_index, sentinel).await {
            Ok(0) => break,
            Ok(n) => {
                filled += n as usize;
                if let Some(current) = offset.as_mut() {
                    *current += n as u64;
                }
            }
            Err(Error::Original(err)) if is_retryable(&err) => continue,
            Err(other) => return Err(other),
        }
    }

    Ok(filled)
}

/// Reads up to `buf.len()` bytes, returning as soon as the kernel returns any
/// non-negative result (§4.2's `Upto N` semantics).
pub(crate) async fn read_upto_fixed(
    fd: RawFd,
    buf: &mut [u8],
    buf_index: u32,
    offset: Option<u64>,
    seekable: bool,
) -> IoResult<usize> {
    let sentinel = sentinel_offset(offset, seekable);
    loop {
        match read_fixed(fd, buf, buf_index, sentinel).await {
            Ok(n) => return Ok(n as usize),
            Err(Error::Original(err)) if is_retryable(&err) => continue,
            Err(other) => return Err(other),
        }
    }
}

/// Writes exactly `buf.len()` bytes, applying the same short-transfer policy.
pub(crate) async fn write_all_fixed(
    fd: RawFd,
    buf: &[u8],
    buf_index: u32,
    mut offset: Option<u64>,
    seekable: bool,
) -> IoResult<()> {
    let mut written = 0;

    while written < buf.len() {
        let sentinel = sentinel_offset(offset, seekable);
        match write_fixed(fd, &buf[written..], buf_index, sentinel).await {
            Ok(0) => break,
            Ok(n) => {
                written += n as usize;
                if let Some(current) = offset.as_mut() {
                    *current += n as u64;
                }
            }
            Err(Error::Original(err)) if is_retryable(&err) => continue,
            Err(other) => return Err(other),
        }
    }

    Ok(())
}

/// Reads exactly `buf.len()` bytes into an unregistered (user) buffer, same
/// short-transfer policy as [`read_exactly_fixed`] but over `readv` instead of
/// a fixed-buffer `ReadFixed`. Used by collaborators without registered
/// buffers (e.g. `fs`, `net`) (§4.2 "Vectored readv/writev for user buffers").
pub(crate) async fn read_exactly(
    fd: RawFd,
    buf: &mut [u8],
    mut offset: Option<u64>,
    seekable: bool,
) -> IoResult<usize> {
    let mut filled = 0;

    while filled < buf.len() {
        let sentinel = sentinel_offset(offset, seekable);
        let mut iov = [libc::iovec {
            iov_base: buf[filled..].as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len() - filled,
        }];

        match readv(fd, &mut iov, sentinel).await {
            Ok(0) => break,
            Ok(n) => {
                filled += n as usize;
                if let Some(current) = offset.as_mut() {
                    *current += n as u64;
                }
            }
            Err(Error::Original(err)) if is_retryable(&err) => continue,
            Err(other) => return Err(other),
        }
    }

    Ok(filled)
}

/// Reads up to `buf.len()` bytes into an unregistered (user) buffer.
pub(crate) async fn read_upto(fd: RawFd, buf: &mut [u8], offset: Option<u64>, seekable: bool) -> IoResult<usize> {
    let sentinel = sentinel_offset(offset, seekable);
    let mut iov = [libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    }];

    loop {
        match readv(fd, &mut iov, sentinel).await {
            Ok(n) => return Ok(n as usize),
            Err(Error::Original(err)) if is_retryable(&err) => continue,
            Err(other) => return Err(other),
        }
    }
}

/// Writes the entirety of `buf` through an unregistered (user) buffer, shifting
/// the slice forward on a short write rather than resubmitting the whole thing
/// (§4.2 "Vector writes that return short shift the iovec array").
pub(crate) async fn write_all(fd: RawFd, buf: &[u8], mut offset: Option<u64>, seekable: bool) -> IoResult<()> {
    let mut written = 0;

    while written < buf.len() {
        let sentinel = sentinel_offset(offset, seekable);
        let iov = [libc::iovec {
            iov_base: buf[written..].as_ptr() as *mut libc::c_void,
            iov_len: buf.len() - written,
        }];

        match writev(fd, &iov, sentinel).await {
            Ok(0) => break,
            Ok(n) => {
                written += n as usize;
                if let Some(current) = offset.as_mut() {
                    *current += n as u64;
                }
            }
            Err(Error::Original(err)) if is_retryable(&err) => continue,
            Err(other) => return Err(other),
        }
    }

    Ok(())
}

fn sentinel_offset(offset: Option<u64>, seekable: bool) -> i64 {
    match offset {
        Some(offset) if seekable => offset as i64,
        _ => -1,
    }
}

fn is_retryable(err: &std::io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EINTR) | Some(libc::EAGAIN) | Some(libc::ECANCELED)
    )
}

/// Races two futures, cancelling whichever one doesn't finish first (§5
/// "Timeouts" — used to race an operation against a timer-sleep).
pub(crate) struct First<A, B> {
    a: A,
    b: B,
    /// Both `a` and `b` install a cancel callback for the current task on
    /// their first poll, but the task's cancel slot holds at most one at a
    /// time (§4.1). Only the first round needs to arbitrate between them;
    /// clear it after polling `a` so `b`'s registration wins, and note that
    /// this round has happened so later rounds (where neither re-installs)
    /// leave the surviving one alone.
    first_poll: bool,
}

pub(crate) fn first<A, B>(a: A, b: B) -> First<A, B> {
    First { a, b, first_poll: true }
}

pub(crate) enum Either<A, B> {
    Left(A),
    Right(B),
}

impl<A: Future + Unpin, B: Future + Unpin> Future for First<A, B> {
    type Output = Either<A::Output, B::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Poll::Ready(output) = Pin::new(&mut this.a).poll(cx) {
            return Poll::Ready(Either::Left(output));
        }

        if this.first_poll {
            tls::current_cancel_token(|token| token.clear_cancel_fn());
            this.first_poll = false;
        }

        if let Poll::Ready(output) = Pin::new(&mut this.b).poll(cx) {
            return Poll::Ready(Either::Right(output));
        }

        Poll::Pending
    }
}
