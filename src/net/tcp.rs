//! TCP streams and listeners, built directly on BSD sockets plus the ring's
//! `Connect`/`Accept`/vectored read-write opcodes (§4.2) rather than
//! `std::net`'s blocking equivalents.

use std::mem;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;

use super::{addr_to_sockaddr, close_and_err, invalid_address, sockaddr_to_addr};
use crate::runtime::fd::Fd;
use crate::runtime::ops;
use crate::runtime::Switch;
use crate::{Error, IoResult};

/// Connects to `address`, returning the split write/read halves of the
/// resulting stream.
pub async fn connect(address: impl super::ToSocketAddrs) -> IoResult<(WriteHalf, ReadHalf)> {
    let address = address.to_socket_addrs()?.next().ok_or_else(invalid_address)?;

    let raw = new_socket(&address)?;
    let (storage, length) = addr_to_sockaddr(&address);

    if let Err(err) = ops::connect(raw, &storage as *const _ as *const libc::sockaddr, length).await {
        unsafe { libc::close(raw) };
        return Err(err);
    }

    let inner = Rc::new(StreamInner::new(raw));
    Ok((WriteHalf(inner.clone()), ReadHalf(inner)))
}

#[derive(Debug)]
struct StreamInner {
    fd: std::rc::Rc<Fd>,
    /// Owns the fd's release hook (§3 "Resource scopes"); closed once this
    /// (and both halves sharing it) are dropped.
    _switch: Switch,
}

impl StreamInner {
    fn new(raw: RawFd) -> Self {
        let fd = std::rc::Rc::new(Fd::new(raw, true));
        let switch = Switch::new();
        fd.clone().bind_to(&switch);
        StreamInner { fd, _switch: switch }
    }
}

/// The writing half of a connected TCP stream.
#[derive(Debug, Clone)]
pub struct WriteHalf(Rc<StreamInner>);

impl WriteHalf {
    /// Writes all of `buf`, retrying on short writes.
    pub async fn write_all(&self, buf: &[u8]) -> IoResult<()> {
        ops::write_all(self.0.fd.raw(), buf, None, false).await
    }

    /// Suspends until the stream is ready to accept a write without
    /// blocking, without writing anything itself (§6 core-to-collaborator
    /// contract "await_writable").
    pub async fn writable(&self) -> IoResult<()> {
        ops::await_writable(self.0.fd.raw()).await
    }
}

impl AsRawFd for WriteHalf {
    fn as_raw_fd(&self) -> RawFd {
        self.0.fd.raw()
    }
}

/// The reading half of a connected TCP stream.
#[derive(Debug, Clone)]
pub struct ReadHalf(Rc<StreamInner>);

impl ReadHalf {
    /// Reads up to `buf.len()` bytes, returning the number of bytes read
    /// (`0` signals the peer closed its write side).
    pub async fn read(&self, buf: &mut [u8]) -> IoResult<usize> {
        ops::read_upto(self.0.fd.raw(), buf, None, false).await
    }

    /// Reads until `buf` is completely filled or the peer closes the stream.
    pub async fn read_exact(&self, buf: &mut [u8]) -> IoResult<usize> {
        ops::read_exactly(self.0.fd.raw(), buf, None, false).await
    }

    /// Suspends until the stream has data ready to read (or the peer closed
    /// its write side), without reading anything itself (§6
    /// core-to-collaborator contract "await_readable").
    pub async fn readable(&self) -> IoResult<()> {
        ops::await_readable(self.0.fd.raw()).await
    }
}

impl AsRawFd for ReadHalf {
    fn as_raw_fd(&self) -> RawFd {
        self.0.fd.raw()
    }
}

/// A bound, listening TCP socket.
#[derive(Debug)]
pub struct Listener {
    fd: std::rc::Rc<Fd>,
    /// Owns the fd's release hook (§3 "Resource scopes").
    _switch: Switch,
}

impl Listener {
    /// Binds and starts listening on `address`.
    pub fn bind(address: impl super::ToSocketAddrs) -> IoResult<Self> {
        let address = address.to_socket_addrs()?.next().ok_or_else(invalid_address)?;
        let raw = new_socket(&address)?;

        let reuse: libc::c_int = 1;
        let result = unsafe {
            libc::setsockopt(
                raw,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &reuse as *const _ as *const libc::c_void,
                mem::size_of_val(&reuse) as libc::socklen_t,
            )
        };
        if result != 0 {
            return Err(close_and_err(raw));
        }

        let (storage, length) = addr_to_sockaddr(&address);
        let result = unsafe { libc::bind(raw, &storage as *const _ as *const libc::sockaddr, length) };
        if result != 0 {
            return Err(close_and_err(raw));
        }

        let result = unsafe { libc::listen(raw, libc::SOMAXCONN) };
        if result != 0 {
            return Err(close_and_err(raw));
        }

        let fd = std::rc::Rc::new(Fd::new(raw, true));
        let switch = Switch::new();
        fd.clone().bind_to(&switch);

        Ok(Listener { fd, _switch: switch })
    }

    /// Accepts one incoming connection.
    pub async fn accept(&self) -> IoResult<((WriteHalf, ReadHalf), SocketAddr)> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut length = mem::size_of_val(&storage) as libc::socklen_t;

        let raw = ops::accept(self.fd.raw(), &mut storage as *mut _ as *mut libc::sockaddr, &mut length).await? as RawFd;

        let addr = sockaddr_to_addr(&storage, length as usize)?;
        let inner = Rc::new(StreamInner::new(raw));

        Ok(((WriteHalf(inner.clone()), ReadHalf(inner)), addr))
    }

    /// The address this listener is bound to.
    pub fn local_addr(&self) -> IoResult<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut length = mem::size_of_val(&storage) as libc::socklen_t;

        let result = unsafe { libc::getsockname(self.fd.raw(), &mut storage as *mut _ as *mut libc::sockaddr, &mut length) };
        if result != 0 {
            return Err(Error::from_io_error(std::io::Error::last_os_error()));
        }

        sockaddr_to_addr(&storage, length as usize)
    }

    /// Sets `IP_TTL` on the underlying socket.
    pub fn set_ttl(&self, ttl: u32) -> IoResult<()> {
        let value = ttl as libc::c_int;
        let result = unsafe {
            libc::setsockopt(
                self.fd.raw(),
                libc::IPPROTO_IP,
                libc::IP_TTL,
                &value as *const _ as *const libc::c_void,
                mem::size_of_val(&value) as libc::socklen_t,
            )
        };
        if result != 0 {
            return Err(Error::from_io_error(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Reads the current `IP_TTL` value.
    pub fn ttl(&self) -> IoResult<u32> {
        let mut value: libc::c_int = 0;
        let mut length = mem::size_of_val(&value) as libc::socklen_t;
        let result = unsafe {
            libc::getsockopt(
                self.fd.raw(),
                libc::IPPROTO_IP,
                libc::IP_TTL,
                &mut value as *mut _ as *mut libc::c_void,
                &mut length,
            )
        };
        if result != 0 {
            return Err(Error::from_io_error(std::io::Error::last_os_error()));
        }
        Ok(value as u32)
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.raw()
    }
}

fn new_socket(address: &SocketAddr) -> IoResult<RawFd> {
    let domain = match address {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    let raw = unsafe { libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if raw < 0 {
        return Err(Error::from_io_error(std::io::Error::last_os_error()));
    }

    Ok(raw)
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use crate::runtime::{spawn, start};

    use super::*;

    #[test]
    fn smoke() {
        start(|| async {
            let listener = Listener::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
            let server_addr = listener.local_addr().unwrap();

            let (client_addr_tx, client_addr_rx) = crate::sync::channel::unbounded();

            spawn(async move {
                let ((w, r), address) = listener.accept().await.unwrap();
                client_addr_tx.send(address).unwrap();

                let mut buffer = vec![0; 1024];
                let bytes_read = r.read(&mut buffer).await.unwrap();
                w.write_all(&buffer[..bytes_read]).await.unwrap();
            });

            let (w, r) = connect((Ipv4Addr::LOCALHOST, server_addr.port())).await.unwrap();

            w.write_all(b"hello").await.unwrap();

            let mut buffer = vec![0; 1024];
            let bytes_read = r.read(&mut buffer).await.unwrap();
            assert_eq!(&buffer[..bytes_read], b"hello");

            let client_addr = client_addr_rx.recv().await.unwrap().unwrap();
            assert_eq!(client_addr.ip(), Ipv4Addr::LOCALHOST);
        })
        .unwrap()
        .unwrap();
    }

    #[test]
    fn listener_reports_its_bound_port() {
        start(|| async {
            let listener = Listener::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
            assert_ne!(listener.local_addr().unwrap().port(), 0);
        })
        .unwrap()
        .unwrap();
    }

    #[test]
    fn round_trips_ttl() {
        start(|| async {
            let listener = Listener::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
            listener.set_ttl(64).unwrap();
            assert_eq!(listener.ttl().unwrap(), 64);
        })
        .unwrap()
        .unwrap();
    }

    #[test]
    fn connect_fails_with_nothing_listening() {
        start(|| async {
            let result = connect((Ipv4Addr::LOCALHOST, 1)).await;
            assert!(result.is_err());
        })
        .unwrap()
        .unwrap();
    }

    #[test]
    fn writable_and_readable_resolve_once_data_is_available() {
        start(|| async {
            let listener = Listener::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
            let server_addr = listener.local_addr().unwrap();

            spawn(async move {
                let ((w, _r), _) = listener.accept().await.unwrap();
                w.writable().await.unwrap();
                w.write_all(b"hi").await.unwrap();
            });

            let (_w, r) = connect((Ipv4Addr::LOCALHOST, server_addr.port())).await.unwrap();

            r.readable().await.unwrap();
            let mut buffer = [0u8; 2];
            let bytes_read = r.read(&mut buffer).await.unwrap();
            assert_eq!(&buffer[..bytes_read], b"hi");
        })
        .unwrap()
        .unwrap();
    }
}
