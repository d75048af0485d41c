// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The intercepted POSIX surface itself.
//!
//! Every call here follows the same shape as `lstack_wrap.c`'s `do_*` functions: consult the path
//! selector, and either run the fast path through the installed [`crate::erased::ErasedStack`] or
//! fall back to the real libc call resolved in [`crate::real`]. Two export conventions are
//! provided for each symbol (see the bottom of this module and [`crate::wrap`]): a plain name for
//! `LD_PRELOAD` interposition, and a `__wrap_*` name for link-time `--wrap` interposition.

use crate::erased::stack;
use crate::sockaddr;
use fastpath::descriptor::Fd;
use fastpath::engine::Protocol;
use fastpath::errors::FastpathError;
use fastpath::path::{self, SocketKind};
use fastpath::rpc::ShutdownHow;
use libc::{c_int, c_void, sockaddr as raw_sockaddr, socklen_t};

fn fail(err: FastpathError) -> c_int {
    unsafe { *libc::__errno_location() = err.as_errno() };
    -1
}

fn fail_errno(e: c_int) -> c_int {
    unsafe { *libc::__errno_location() = e };
    -1
}

fn socket_kind(domain: c_int, ty: c_int) -> SocketKind {
    let ty = ty & !(libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC);
    match (domain, ty) {
        (libc::AF_INET | libc::AF_INET6, libc::SOCK_STREAM) => SocketKind::Tcp,
        (libc::AF_INET | libc::AF_INET6, libc::SOCK_DGRAM) => SocketKind::Udp,
        _ => SocketKind::Unsupported,
    }
}

fn protocol_of(kind: SocketKind) -> Option<Protocol> {
    match kind {
        SocketKind::Tcp => Some(Protocol::Tcp),
        SocketKind::Udp => Some(Protocol::Udp),
        SocketKind::Unsupported => None,
    }
}

/// `socket(2)`: mints a plain kernel fd in every case (so the number stays globally unique and
/// `close`/`read`/`write` never need a second fd space), then additionally builds fast-path state
/// for it when the path selector admits the call.
unsafe fn do_socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    let fd = unsafe { crate::real::socket(domain, ty, protocol) };
    if fd < 0 {
        return fd;
    }
    let Some(s) = stack() else { return fd };
    let kind = socket_kind(domain, ty);
    if path::select_global_path(s.is_ready(), kind, s.config()) != path::Path::Fast {
        return fd;
    }
    let Some(proto) = protocol_of(kind) else { return fd };
    if let Err(e) = s.create(proto, fd as Fd) {
        tracing::debug!(error = %e, "fast-path create failed, falling back to kernel socket");
    }
    fd
}

unsafe fn do_bind(fd: c_int, addr: *const raw_sockaddr, len: socklen_t) -> c_int {
    let Some(s) = stack() else {
        return unsafe { crate::real::bind(fd, addr, len) };
    };
    if !s.is_fast(fd as Fd) {
        return unsafe { crate::real::bind(fd, addr, len) };
    }
    let Some(parsed) = (unsafe { sockaddr::read(addr, len) }) else {
        return fail(FastpathError::InvalidArgument("malformed sockaddr"));
    };
    match s.bind(fd as Fd, parsed) {
        Ok(()) => 0,
        Err(e) => fail(e),
    }
}

unsafe fn do_listen(fd: c_int, backlog: c_int) -> c_int {
    let Some(s) = stack() else {
        return unsafe { crate::real::listen(fd, backlog) };
    };
    if !s.is_fast(fd as Fd) {
        return unsafe { crate::real::listen(fd, backlog) };
    }
    match s.listen(fd as Fd, backlog.max(0) as u32) {
        Ok(()) => 0,
        Err(e) => fail(e),
    }
}

unsafe fn do_accept(fd: c_int, addr: *mut raw_sockaddr, len: *mut socklen_t, flags: c_int) -> c_int {
    let Some(s) = stack() else {
        return unsafe { crate::real::accept4(fd, addr, len, flags) };
    };
    if !s.is_fast(fd as Fd) {
        return unsafe { crate::real::accept4(fd, addr, len, flags) };
    }
    let blocking = flags & libc::SOCK_NONBLOCK == 0;
    let domain = match s.local_addr(fd as Fd) {
        Ok(Some(std::net::SocketAddr::V6(_))) => libc::AF_INET6,
        _ => libc::AF_INET,
    };
    let new_fd = unsafe { crate::real::socket(domain, libc::SOCK_STREAM | flags, 0) };
    if new_fd < 0 {
        return new_fd;
    }
    match s.accept(fd as Fd, new_fd as Fd, blocking) {
        Ok(()) => {
            if let Ok(Some(local)) = s.local_addr(new_fd as Fd) {
                unsafe { sockaddr::write(local, addr, len) };
            }
            new_fd
        }
        Err(e) => {
            unsafe { crate::real::close(new_fd) };
            fail(e)
        }
    }
}

unsafe fn do_connect(fd: c_int, addr: *const raw_sockaddr, len: socklen_t) -> c_int {
    let Some(s) = stack() else {
        return unsafe { crate::real::connect(fd, addr, len) };
    };
    if !s.is_fast(fd as Fd) {
        return unsafe { crate::real::connect(fd, addr, len) };
    }
    let Some(parsed) = (unsafe { sockaddr::read(addr, len) }) else {
        return fail(FastpathError::InvalidArgument("malformed sockaddr"));
    };
    if fastpath::local_addr::is_destination_local(parsed.ip(), s.config().host_addr) {
        s.tag_host(fd as Fd);
        return unsafe { crate::real::connect(fd, addr, len) };
    }
    match s.connect(fd as Fd, parsed) {
        Ok(()) => 0,
        Err(e) => fail(e),
    }
}

unsafe fn do_close(fd: c_int) -> c_int {
    if let Some(s) = stack() {
        if s.is_fast(fd as Fd) {
            if let Err(e) = s.close(fd as Fd) {
                tracing::debug!(error = %e, "fast-path close failed");
            }
        } else {
            s.forget(fd as Fd);
        }
    }
    unsafe { crate::real::close(fd) }
}

unsafe fn do_shutdown(fd: c_int, how: c_int) -> c_int {
    let Some(s) = stack() else {
        return unsafe { crate::real::shutdown(fd, how) };
    };
    if !s.is_fast(fd as Fd) {
        return unsafe { crate::real::shutdown(fd, how) };
    }
    let how = match how {
        libc::SHUT_RD => ShutdownHow::Read,
        libc::SHUT_WR => ShutdownHow::Write,
        _ => ShutdownHow::Both,
    };
    match s.shutdown(fd as Fd, how) {
        Ok(()) => 0,
        Err(e) => fail(e),
    }
}

unsafe fn do_read(fd: c_int, buf: *mut c_void, count: usize, blocking: bool) -> isize {
    let Some(s) = stack() else {
        return unsafe { crate::real::read(fd, buf, count) };
    };
    if !s.is_fast(fd as Fd) || buf.is_null() {
        if buf.is_null() {
            return isize::from(fail_errno(errno::EFAULT));
        }
        return unsafe { crate::real::read(fd, buf, count) };
    }
    let out = unsafe { std::slice::from_raw_parts_mut(buf.cast::<u8>(), count) };
    match s.read(fd as Fd, out, false, blocking) {
        Ok(n) => n as isize,
        Err(e) => isize::from(fail(e)),
    }
}

unsafe fn do_write(fd: c_int, buf: *const c_void, count: usize) -> isize {
    let Some(s) = stack() else {
        return unsafe { crate::real::write(fd, buf, count) };
    };
    if !s.is_fast(fd as Fd) || buf.is_null() {
        if buf.is_null() {
            return isize::from(fail_errno(errno::EFAULT));
        }
        return unsafe { crate::real::write(fd, buf, count) };
    }
    let data = unsafe { std::slice::from_raw_parts(buf.cast::<u8>(), count) };
    match s.write(fd as Fd, data) {
        Ok(n) => n as isize,
        Err(e) => isize::from(fail(e)),
    }
}

unsafe fn do_recvfrom(
    fd: c_int,
    buf: *mut c_void,
    len: usize,
    flags: c_int,
    addr: *mut raw_sockaddr,
    addrlen: *mut socklen_t,
) -> isize {
    let Some(s) = stack() else {
        return unsafe { crate::real::recvfrom(fd, buf, len, flags, addr, addrlen) };
    };
    if !s.is_fast(fd as Fd) || buf.is_null() {
        return unsafe { crate::real::recvfrom(fd, buf, len, flags, addr, addrlen) };
    }
    let peek = flags & libc::MSG_PEEK != 0;
    let out = unsafe { std::slice::from_raw_parts_mut(buf.cast::<u8>(), len) };
    let result = if addr.is_null() {
        s.read(fd as Fd, out, peek, flags & libc::MSG_DONTWAIT == 0)
    } else {
        s.recvfrom(fd as Fd, out, peek)
    };
    match result {
        Ok(n) => n as isize,
        Err(FastpathError::WouldBlock) if flags & libc::MSG_DONTWAIT != 0 => {
            isize::from(fail_errno(errno::EAGAIN))
        }
        Err(e) => isize::from(fail(e)),
    }
}

unsafe fn do_sendto(
    fd: c_int,
    buf: *const c_void,
    len: usize,
    flags: c_int,
    addr: *const raw_sockaddr,
    addrlen: socklen_t,
) -> isize {
    let Some(s) = stack() else {
        return unsafe { crate::real::sendto(fd, buf, len, flags, addr, addrlen) };
    };
    if !s.is_fast(fd as Fd) || buf.is_null() {
        return unsafe { crate::real::sendto(fd, buf, len, flags, addr, addrlen) };
    }
    let data = unsafe { std::slice::from_raw_parts(buf.cast::<u8>(), len) };
    match s.write(fd as Fd, data) {
        Ok(n) => n as isize,
        Err(e) => isize::from(fail(e)),
    }
}

/// The exact set of options `lstack_wrap.c`'s `unsupport_optname` refuses to hand to the fast
/// path — always sent to the kernel, whatever the descriptor's path.
fn unsupported_optname(optname: c_int) -> bool {
    matches!(
        optname,
        libc::SO_BROADCAST | libc::SO_PROTOCOL | libc::TCP_QUICKACK | libc::SO_SNDTIMEO | libc::SO_RCVTIMEO
    )
}

unsafe fn do_setsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: socklen_t,
) -> c_int {
    let fast = stack().is_some_and(|s| s.is_fast(fd as Fd));
    if !fast || unsupported_optname(optname) {
        return unsafe { crate::real::setsockopt(fd, level, optname, optval, optlen) };
    }
    let ret = unsafe { crate::real::setsockopt(fd, level, optname, optval, optlen) };
    if ret != 0 {
        return ret;
    }
    0
}

unsafe fn do_getsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *mut c_void,
    optlen: *mut socklen_t,
) -> c_int {
    unsafe { crate::real::getsockopt(fd, level, optname, optval, optlen) }
}

unsafe fn do_getsockname(fd: c_int, addr: *mut raw_sockaddr, len: *mut socklen_t) -> c_int {
    let Some(s) = stack() else {
        return unsafe { crate::real::getsockname(fd, addr, len) };
    };
    if !s.is_fast(fd as Fd) {
        return unsafe { crate::real::getsockname(fd, addr, len) };
    }
    match s.local_addr(fd as Fd) {
        Ok(Some(a)) => {
            unsafe { sockaddr::write(a, addr, len) };
            0
        }
        Ok(None) => fail_errno(errno::ENOTCONN),
        Err(e) => fail(e),
    }
}

unsafe fn do_getpeername(fd: c_int, addr: *mut raw_sockaddr, len: *mut socklen_t) -> c_int {
    unsafe { crate::real::getpeername(fd, addr, len) }
}

macro_rules! export_pair {
    ($plain:ident, $wrap:ident, ($($arg:ident: $ty:ty),* $(,)?) -> $ret:ty, $body:expr) => {
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn $plain($($arg: $ty),*) -> $ret {
            #[allow(clippy::redundant_closure_call)]
            unsafe { $body($($arg),*) }
        }

        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn $wrap($($arg: $ty),*) -> $ret {
            #[allow(clippy::redundant_closure_call)]
            unsafe { $body($($arg),*) }
        }
    };
}

export_pair!(socket, __wrap_socket, (domain: c_int, ty: c_int, protocol: c_int) -> c_int,
    |domain, ty, protocol| do_socket(domain, ty, protocol));
export_pair!(bind, __wrap_bind, (fd: c_int, addr: *const raw_sockaddr, len: socklen_t) -> c_int,
    |fd, addr, len| do_bind(fd, addr, len));
export_pair!(listen, __wrap_listen, (fd: c_int, backlog: c_int) -> c_int,
    |fd, backlog| do_listen(fd, backlog));
export_pair!(accept, __wrap_accept, (fd: c_int, addr: *mut raw_sockaddr, len: *mut socklen_t) -> c_int,
    |fd, addr, len| do_accept(fd, addr, len, 0));
export_pair!(accept4, __wrap_accept4, (fd: c_int, addr: *mut raw_sockaddr, len: *mut socklen_t, flags: c_int) -> c_int,
    |fd, addr, len, flags| do_accept(fd, addr, len, flags));
export_pair!(connect, __wrap_connect, (fd: c_int, addr: *const raw_sockaddr, len: socklen_t) -> c_int,
    |fd, addr, len| do_connect(fd, addr, len));
export_pair!(close, __wrap_close, (fd: c_int) -> c_int, |fd| do_close(fd));
export_pair!(shutdown, __wrap_shutdown, (fd: c_int, how: c_int) -> c_int, |fd, how| do_shutdown(fd, how));
export_pair!(read, __wrap_read, (fd: c_int, buf: *mut c_void, count: usize) -> isize,
    |fd, buf, count| do_read(fd, buf, count, true));
export_pair!(write, __wrap_write, (fd: c_int, buf: *const c_void, count: usize) -> isize,
    |fd, buf, count| do_write(fd, buf, count));
export_pair!(recv, __wrap_recv, (fd: c_int, buf: *mut c_void, len: usize, flags: c_int) -> isize,
    |fd, buf, len, flags| do_recvfrom(fd, buf, len, flags, std::ptr::null_mut(), std::ptr::null_mut()));
export_pair!(send, __wrap_send, (fd: c_int, buf: *const c_void, len: usize, flags: c_int) -> isize,
    |fd, buf, len, flags| do_sendto(fd, buf, len, flags, std::ptr::null(), 0));
export_pair!(recvfrom, __wrap_recvfrom,
    (fd: c_int, buf: *mut c_void, len: usize, flags: c_int, addr: *mut raw_sockaddr, addrlen: *mut socklen_t) -> isize,
    |fd, buf, len, flags, addr, addrlen| do_recvfrom(fd, buf, len, flags, addr, addrlen));
export_pair!(sendto, __wrap_sendto,
    (fd: c_int, buf: *const c_void, len: usize, flags: c_int, addr: *const raw_sockaddr, addrlen: socklen_t) -> isize,
    |fd, buf, len, flags, addr, addrlen| do_sendto(fd, buf, len, flags, addr, addrlen));
export_pair!(setsockopt, __wrap_setsockopt,
    (fd: c_int, level: c_int, optname: c_int, optval: *const c_void, optlen: socklen_t) -> c_int,
    |fd, level, optname, optval, optlen| do_setsockopt(fd, level, optname, optval, optlen));
export_pair!(getsockopt, __wrap_getsockopt,
    (fd: c_int, level: c_int, optname: c_int, optval: *mut c_void, optlen: *mut socklen_t) -> c_int,
    |fd, level, optname, optval, optlen| do_getsockopt(fd, level, optname, optval, optlen));
export_pair!(getsockname, __wrap_getsockname, (fd: c_int, addr: *mut raw_sockaddr, len: *mut socklen_t) -> c_int,
    |fd, addr, len| do_getsockname(fd, addr, len));
export_pair!(getpeername, __wrap_getpeername, (fd: c_int, addr: *mut raw_sockaddr, len: *mut socklen_t) -> c_int,
    |fd, addr, len| do_getpeername(fd, addr, len));
