// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

#![deny(clippy::pedantic, missing_docs)]

//! Process-wide tracing setup for the fast-path demo binary.

/// Initialize the global tracing subscriber from the `RUST_LOG` environment variable, falling
/// back to `filter` when it is unset.
///
/// # Panics
///
/// Panics if a global subscriber has already been installed.
pub fn setup(filter: &str) {
    tracing_subscriber::fmt()
        .with_ansi(false)
        .with_file(true)
        .with_level(true)
        .with_line_number(true)
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(
            |_| tracing_subscriber::EnvFilter::new(filter),
        ))
        .init();
}

fn main() {
    setup("info");
}
