//! UDP sockets, built on the ring's `SendMsg`/`RecvMsg` opcodes (§4.2): unlike
//! a connected TCP stream's plain `writev`/`readv`, each datagram carries its
//! own destination/source address, so every send and receive goes through a
//! `msghdr` rather than a flat buffer.

use std::mem;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};

use super::{addr_to_sockaddr, close_and_err, invalid_address, sockaddr_to_addr};
use crate::runtime::fd::Fd;
use crate::runtime::ops;
use crate::runtime::Switch;
use crate::{Error, IoResult};

/// A bound UDP socket.
#[derive(Debug)]
pub struct UdpSocket {
    fd: std::rc::Rc<Fd>,
    /// Owns the fd's release hook (§3 "Resource scopes").
    _switch: Switch,
}

impl UdpSocket {
    /// Binds a new UDP socket to `address`.
    pub fn bind(address: impl super::ToSocketAddrs) -> IoResult<Self> {
        let address = address.to_socket_addrs()?.next().ok_or_else(invalid_address)?;

        let domain = match address {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };
        let raw = unsafe { libc::socket(domain, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
        if raw < 0 {
            return Err(Error::from_io_error(std::io::Error::last_os_error()));
        }

        let (storage, length) = addr_to_sockaddr(&address);
        let result = unsafe { libc::bind(raw, &storage as *const _ as *const libc::sockaddr, length) };
        if result != 0 {
            return Err(close_and_err(raw));
        }

        let fd = std::rc::Rc::new(Fd::new(raw, true));
        let switch = Switch::new();
        fd.clone().bind_to(&switch);

        Ok(UdpSocket { fd, _switch: switch })
    }

    /// Sends `buf` as one datagram to `address`.
    pub async fn send_to(&self, buf: &[u8], address: impl super::ToSocketAddrs) -> IoResult<usize> {
        let address = address.to_socket_addrs()?.next().ok_or_else(invalid_address)?;
        let (mut storage, length) = addr_to_sockaddr(&address);

        let mut iov = libc::iovec {
            iov_base: buf.as_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };

        let msg = libc::msghdr {
            msg_name: &mut storage as *mut _ as *mut libc::c_void,
            msg_namelen: length,
            msg_iov: &mut iov,
            msg_iovlen: 1,
            msg_control: std::ptr::null_mut(),
            msg_controllen: 0,
            msg_flags: 0,
        };

        let sent = ops::send_msg(self.fd.raw(), &msg).await?;
        Ok(sent as usize)
    }

    /// Receives one datagram into `buf`, returning its length and the sender's
    /// address. A datagram larger than `buf` is truncated, matching `recvmsg`'s
    /// `MSG_TRUNC` semantics.
    pub async fn recv_from(&self, buf: &mut [u8]) -> IoResult<(usize, SocketAddr)> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };

        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };

        let mut msg = libc::msghdr {
            msg_name: &mut storage as *mut _ as *mut libc::c_void,
            msg_namelen: mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t,
            msg_iov: &mut iov,
            msg_iovlen: 1,
            msg_control: std::ptr::null_mut(),
            msg_controllen: 0,
            msg_flags: 0,
        };

        let received = ops::recv_msg(self.fd.raw(), &mut msg).await?;
        let address = sockaddr_to_addr(&storage, msg.msg_namelen as usize)?;
        Ok((received as usize, address))
    }

    /// The address this socket is bound to.
    pub fn local_addr(&self) -> IoResult<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut length = mem::size_of_val(&storage) as libc::socklen_t;

        let result = unsafe { libc::getsockname(self.fd.raw(), &mut storage as *mut _ as *mut libc::sockaddr, &mut length) };
        if result != 0 {
            return Err(Error::from_io_error(std::io::Error::last_os_error()));
        }

        sockaddr_to_addr(&storage, length as usize)
    }
}

impl AsRawFd for UdpSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.raw()
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use crate::runtime::start;

    use super::*;

    #[test]
    fn round_trips_a_datagram() {
        start(|| async {
            let server = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
            let server_addr = server.local_addr().unwrap();

            let client = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
            let client_addr = client.local_addr().unwrap();

            client.send_to(b"hello", (Ipv4Addr::LOCALHOST, server_addr.port())).await.unwrap();

            let mut buffer = [0u8; 1024];
            let (n, from) = server.recv_from(&mut buffer).await.unwrap();
            assert_eq!(&buffer[..n], b"hello");
            assert_eq!(from.port(), client_addr.port());

            server.send_to(b"world", from).await.unwrap();
            let (n, _) = client.recv_from(&mut buffer).await.unwrap();
            assert_eq!(&buffer[..n], b"world");
        })
        .unwrap()
        .unwrap();
    }

    #[test]
    fn reports_its_bound_port() {
        start(|| async {
            let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
            assert_ne!(socket.local_addr().unwrap().port(), 0);
        })
        .unwrap()
        .unwrap();
    }
}
