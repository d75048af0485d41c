#![forbid(unsafe_code)] // Validation logic should always be strictly safe
#![deny(missing_docs, clippy::all, clippy::pedantic)] // yeah, I'm that guy.  I'm not sorry.
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Do you know where your towel is?

//! Packet buffer traits and a pool-backed buffer implementation shared by the fast-path
//! descriptor rings.
//!
//! The trait definitions in [`buffer`] were `no_std`-compatible in their original form; the
//! pool-backed buffer added here needs heap allocation and the `concurrency` crate's mutex, so
//! this crate now targets `std`.

pub mod buffer;
