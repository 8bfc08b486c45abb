//! Networking: TCP streams/listeners ([`tcp`]) and UDP sockets ([`udp`]).
//! Address resolution stays synchronous and local (no DNS) — see
//! [`ToSocketAddrs`].

use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::option;

use crate::{Error, IoResult};

pub mod tcp;
pub mod udp;

/// Converts a value into one or more socket addresses, mirroring
/// `std::net::ToSocketAddrs` but without DNS resolution: hostnames aren't
/// accepted, only address literals. Resolving a hostname would mean
/// suspending the calling task while a background lookup runs, which this
/// runtime doesn't yet offer a mechanism for.
pub trait ToSocketAddrs {
    type Iter: Iterator<Item = SocketAddr>;

    fn to_socket_addrs(&self) -> IoResult<Self::Iter>;
}

impl ToSocketAddrs for SocketAddr {
    type Iter = option::IntoIter<SocketAddr>;

    fn to_socket_addrs(&self) -> IoResult<Self::Iter> {
        Ok(Some(*self).into_iter())
    }
}

impl ToSocketAddrs for SocketAddrV4 {
    type Iter = option::IntoIter<SocketAddr>;

    fn to_socket_addrs(&self) -> IoResult<Self::Iter> {
        SocketAddr::V4(*self).to_socket_addrs()
    }
}

impl ToSocketAddrs for (Ipv4Addr, u16) {
    type Iter = option::IntoIter<SocketAddr>;

    fn to_socket_addrs(&self) -> IoResult<Self::Iter> {
        let (ip, port) = *self;
        SocketAddrV4::new(ip, port).to_socket_addrs()
    }
}

pub(crate) fn invalid_address() -> Error<std::io::Error> {
    Error::from_io_error(std::io::Error::new(std::io::ErrorKind::InvalidInput, "no addresses to connect to"))
}

pub(crate) fn close_and_err(raw: std::os::fd::RawFd) -> Error<std::io::Error> {
    let error = std::io::Error::last_os_error();
    unsafe { libc::close(raw) };
    Error::from_io_error(error)
}

pub(crate) fn addr_to_sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };

    let length = match addr {
        SocketAddr::V4(addr) => {
            let sockaddr = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: addr.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(addr.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe { std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sockaddr) };
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(addr) => {
            let sockaddr = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: addr.port().to_be(),
                sin6_flowinfo: addr.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: addr.ip().octets(),
                },
                sin6_scope_id: addr.scope_id(),
            };
            unsafe { std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sockaddr) };
            mem::size_of::<libc::sockaddr_in6>()
        }
    };

    (storage, length as libc::socklen_t)
}

pub(crate) fn sockaddr_to_addr(storage: &libc::sockaddr_storage, length: usize) -> IoResult<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            assert!(length >= mem::size_of::<libc::sockaddr_in>());
            let addr = unsafe { *(storage as *const _ as *const libc::sockaddr_in) };

            Ok(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(addr.sin_addr.s_addr.to_ne_bytes()),
                u16::from_be(addr.sin_port),
            )))
        }
        libc::AF_INET6 => {
            assert!(length >= mem::size_of::<libc::sockaddr_in6>());
            let addr = unsafe { *(storage as *const _ as *const libc::sockaddr_in6) };

            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(addr.sin6_addr.s6_addr),
                u16::from_be(addr.sin6_port),
                addr.sin6_flowinfo,
                addr.sin6_scope_id,
            )))
        }
        _ => Err(Error::from_io_error(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "invalid argument",
        ))),
    }
}
