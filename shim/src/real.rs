// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Resolution of the "real" (un-intercepted) libc calls this shim falls back to.
//!
//! The plain-named exports (`socket`, `bind`, ...) are meant to be loaded via `LD_PRELOAD`, so
//! calling `libc::socket` from inside `socket` would simply call back into this same symbol.
//! `dlsym(RTLD_NEXT, ...)` is the standard way a preloading interposition library reaches the
//! libc underneath it; this module resolves each symbol once and caches the address.

use libc::{c_char, c_int, c_void};
use std::ffi::CStr;
use std::sync::OnceLock;

unsafe extern "C" {
    fn dlsym(handle: *mut c_void, symbol: *const c_char) -> *mut c_void;
}

#[allow(clippy::cast_sign_loss, clippy::as_conversions)]
const RTLD_NEXT: *mut c_void = -1_isize as *mut c_void;

/// Look up and cache the real libc symbol named by `symbol`, reinterpreted as calling-convention
/// `F`.
///
/// # Safety
///
/// `F` must match the real symbol's actual signature exactly; a mismatch is undefined behavior
/// the moment the returned pointer is called.
unsafe fn resolve<F: Copy>(cell: &'static OnceLock<usize>, symbol: &'static CStr) -> F {
    let addr = *cell.get_or_init(|| {
        let ptr = unsafe { dlsym(RTLD_NEXT, symbol.as_ptr()) };
        assert!(!ptr.is_null(), "dlsym found no real {symbol:?}");
        ptr as usize
    });
    unsafe { std::mem::transmute_copy::<usize, F>(&addr) }
}

/// Declare a thin, cached wrapper around the real libc symbol `$sym`, used as the kernel-path
/// fallback for the plain-named export of the same call.
macro_rules! real_fn {
    ($name:ident, $sym:literal, fn($($arg:ident: $ty:ty),* $(,)?) -> $ret:ty) => {
        /// # Safety
        /// Same preconditions as the libc function of the same name.
        pub(crate) unsafe fn $name($($arg: $ty),*) -> $ret {
            type F = unsafe extern "C" fn($($ty),*) -> $ret;
            static CELL: OnceLock<usize> = OnceLock::new();
            let f: F = unsafe { resolve(&CELL, CStr::from_bytes_with_nul_unchecked(concat!($sym, "\0").as_bytes())) };
            unsafe { f($($arg),*) }
        }
    };
}

real_fn!(socket, "socket", fn(domain: c_int, ty: c_int, protocol: c_int) -> c_int);
real_fn!(bind, "bind", fn(fd: c_int, addr: *const libc::sockaddr, len: libc::socklen_t) -> c_int);
real_fn!(listen, "listen", fn(fd: c_int, backlog: c_int) -> c_int);
real_fn!(accept, "accept", fn(fd: c_int, addr: *mut libc::sockaddr, len: *mut libc::socklen_t) -> c_int);
real_fn!(accept4, "accept4", fn(fd: c_int, addr: *mut libc::sockaddr, len: *mut libc::socklen_t, flags: c_int) -> c_int);
real_fn!(connect, "connect", fn(fd: c_int, addr: *const libc::sockaddr, len: libc::socklen_t) -> c_int);
real_fn!(close, "close", fn(fd: c_int) -> c_int);
real_fn!(shutdown, "shutdown", fn(fd: c_int, how: c_int) -> c_int);
real_fn!(read, "read", fn(fd: c_int, buf: *mut c_void, count: usize) -> isize);
real_fn!(write, "write", fn(fd: c_int, buf: *const c_void, count: usize) -> isize);
real_fn!(recv, "recv", fn(fd: c_int, buf: *mut c_void, len: usize, flags: c_int) -> isize);
real_fn!(send, "send", fn(fd: c_int, buf: *const c_void, len: usize, flags: c_int) -> isize);
real_fn!(recvfrom, "recvfrom", fn(fd: c_int, buf: *mut c_void, len: usize, flags: c_int, addr: *mut libc::sockaddr, addrlen: *mut libc::socklen_t) -> isize);
real_fn!(sendto, "sendto", fn(fd: c_int, buf: *const c_void, len: usize, flags: c_int, addr: *const libc::sockaddr, addrlen: libc::socklen_t) -> isize);
real_fn!(setsockopt, "setsockopt", fn(fd: c_int, level: c_int, optname: c_int, optval: *const c_void, optlen: libc::socklen_t) -> c_int);
real_fn!(getsockopt, "getsockopt", fn(fd: c_int, level: c_int, optname: c_int, optval: *mut c_void, optlen: *mut libc::socklen_t) -> c_int);
real_fn!(getsockname, "getsockname", fn(fd: c_int, addr: *mut libc::sockaddr, len: *mut libc::socklen_t) -> c_int);
real_fn!(getpeername, "getpeername", fn(fd: c_int, addr: *mut libc::sockaddr, len: *mut libc::socklen_t) -> c_int);
