// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Conversions between the POSIX `sockaddr` wire representation and [`SocketAddr`].
//!
//! Only `AF_INET`/`AF_INET6` are understood, matching `select_global_path`'s own restriction to
//! those families; anything else is reported as unsupported so the caller falls back to the
//! kernel path.

use libc::{AF_INET, AF_INET6, sa_family_t, sockaddr, sockaddr_in, sockaddr_in6, socklen_t};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

/// Read a `sockaddr` the caller passed in, validating its length against its own family tag.
///
/// # Safety
///
/// `addr` must point to at least `len` readable bytes, and if non-null must be valid for at
/// least `size_of::<sockaddr_in>()` or `size_of::<sockaddr_in6>()` bytes depending on family.
pub unsafe fn read(addr: *const sockaddr, len: socklen_t) -> Option<SocketAddr> {
    if addr.is_null() {
        return None;
    }
    let family = unsafe { (*addr.cast::<sa_family_t>()).into() };
    match family {
        AF_INET if (len as usize) >= size_of::<sockaddr_in>() => {
            let a = unsafe { &*addr.cast::<sockaddr_in>() };
            let ip = Ipv4Addr::from(u32::from_be(a.sin_addr.s_addr));
            let port = u16::from_be(a.sin_port);
            Some(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        AF_INET6 if (len as usize) >= size_of::<sockaddr_in6>() => {
            let a = unsafe { &*addr.cast::<sockaddr_in6>() };
            let ip = Ipv6Addr::from(a.sin6_addr.s6_addr);
            let port = u16::from_be(a.sin6_port);
            Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                port,
                a.sin6_flowinfo,
                a.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

/// Write `addr` into the caller-supplied buffer, truncating to whatever `*len` allows and
/// updating `*len` to the full untruncated size (`getsockname`/`getpeername`/`accept` semantics).
///
/// # Safety
///
/// `out` must be valid for at least `*len` writable bytes, `len` must be a valid pointer to a
/// `socklen_t`.
pub unsafe fn write(addr: SocketAddr, out: *mut sockaddr, len: *mut socklen_t) {
    if out.is_null() || len.is_null() {
        return;
    }
    let available = unsafe { *len };
    match addr {
        SocketAddr::V4(a) => {
            let mut raw: sockaddr_in = unsafe { std::mem::zeroed() };
            raw.sin_family = AF_INET as sa_family_t;
            raw.sin_port = a.port().to_be();
            raw.sin_addr.s_addr = u32::from(*a.ip()).to_be();
            let n = (size_of::<sockaddr_in>() as socklen_t).min(available);
            unsafe {
                std::ptr::copy_nonoverlapping(
                    std::ptr::from_ref(&raw).cast::<u8>(),
                    out.cast::<u8>(),
                    n as usize,
                );
                *len = size_of::<sockaddr_in>() as socklen_t;
            }
        }
        SocketAddr::V6(a) => {
            let mut raw: sockaddr_in6 = unsafe { std::mem::zeroed() };
            raw.sin6_family = AF_INET6 as sa_family_t;
            raw.sin6_port = a.port().to_be();
            raw.sin6_addr.s6_addr = a.ip().octets();
            raw.sin6_flowinfo = a.flowinfo();
            raw.sin6_scope_id = a.scope_id();
            let n = (size_of::<sockaddr_in6>() as socklen_t).min(available);
            unsafe {
                std::ptr::copy_nonoverlapping(
                    std::ptr::from_ref(&raw).cast::<u8>(),
                    out.cast::<u8>(),
                    n as usize,
                );
                *len = size_of::<sockaddr_in6>() as socklen_t;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_an_ipv4_address() {
        let addr = SocketAddr::from(([10, 0, 0, 1], 8080));
        let mut raw: sockaddr_in = unsafe { std::mem::zeroed() };
        raw.sin_family = AF_INET as sa_family_t;
        raw.sin_port = 8080_u16.to_be();
        raw.sin_addr.s_addr = u32::from(Ipv4Addr::new(10, 0, 0, 1)).to_be();
        let got = unsafe {
            read(
                std::ptr::from_ref(&raw).cast(),
                size_of::<sockaddr_in>() as socklen_t,
            )
        };
        assert_eq!(got, Some(addr));
    }

    #[test]
    fn write_then_read_round_trips() {
        let addr = SocketAddr::from(([127, 0, 0, 1], 4242));
        let mut buf: sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = size_of::<sockaddr_in>() as socklen_t;
        unsafe { write(addr, std::ptr::from_mut(&mut buf).cast(), &raw mut len) };
        let got = unsafe { read(std::ptr::from_ref(&buf).cast(), len) };
        assert_eq!(got, Some(addr));
    }
}
