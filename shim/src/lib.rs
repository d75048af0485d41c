// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The POSIX shim (C9): LD_PRELOAD/`--wrap`-interposable socket calls backed by
//! [`fastpath::Stack`].
//!
//! This crate owns no protocol logic of its own. [`erased`] gives the `#[no_mangle]` exports in
//! [`posix`] a non-generic handle onto whatever concrete [`fastpath::Stack<E>`] the host process
//! installed; [`real`] resolves the libc calls those exports fall back to; [`sockaddr`] converts
//! between the wire and typed representations at that boundary.

pub mod erased;
mod posix;
mod real;
mod sockaddr;

pub use erased::{ErasedStack, install, stack};
