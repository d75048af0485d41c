// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

#![deny(clippy::all, clippy::pedantic)]

//! Command-line arguments for the fast-path demo binary.

pub use clap::Parser;

use std::net::IpAddr;
use std::path::PathBuf;

/// Command-line switches accepted by the fast-path demo binary.
///
/// These map directly onto `fastpath_config::Config`'s fields; a value given here overrides
/// whatever the `--config` file (if any) set for that field.
#[derive(Parser, Debug)]
#[command(name = "fastpath")]
#[command(version)]
#[command(about = "Userspace kernel-bypass POSIX socket fast path", long_about = None)]
#[allow(clippy::struct_excessive_bools)]
pub struct CmdArgs {
    /// Path to a YAML configuration file. Switches given on the command line override its
    /// values.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Number of fast-path workers.
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u16).range(1..=64))]
    pub workers: Option<u16>,

    /// Fan listening sockets out across every worker.
    #[arg(long)]
    pub listen_shadow: bool,

    /// Never fan a `listen` out, even if `--listen-shadow` is set.
    #[arg(long)]
    pub tuple_filter: bool,

    /// Disable the UDP fast path even if the loaded config enables it.
    #[arg(long)]
    pub udp_disable: bool,

    /// Enable minimum-connection-count master-clone election on shadow listeners.
    #[arg(long)]
    pub tcp_reuse_ipport: bool,

    /// Local interface address bound to the fast path.
    #[arg(long, value_name = "ADDR")]
    pub host_addr: Option<IpAddr>,

    /// Tracing filter, e.g. `info` or `fastpath=debug,fastpath_net=warn`.
    #[arg(long, value_name = "FILTER", default_value = "info")]
    pub tracing: String,
}
