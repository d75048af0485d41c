// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The local-address table (§6) consulted by `connect`'s destination-is-local routing rule.

use std::io;
use std::net::IpAddr;
use std::path::Path;

const PROC_NET_DEV: &str = "/proc/net/dev";

/// Parse the interface names out of a `/proc/net/dev`-formatted document.
///
/// The file has two header lines followed by one line per interface, of the form
/// `  face: <counters...>`; this extracts `face`, trimmed, for every line after the header.
#[must_use]
pub fn parse_interface_names(contents: &str) -> Vec<String> {
    contents
        .lines()
        .skip(2)
        .filter_map(|line| line.split_once(':').map(|(name, _)| name.trim().to_string()))
        .filter(|name| !name.is_empty())
        .collect()
}

/// Read and parse the live `/proc/net/dev` table.
///
/// # Errors
///
/// Returns an error if the file cannot be read (e.g. not running on Linux, or sandboxed without
/// `/proc` access).
pub fn read_interface_names() -> io::Result<Vec<String>> {
    read_interface_names_from(PROC_NET_DEV)
}

/// Read and parse an arbitrary `/proc/net/dev`-formatted file, for testing against a fixture
/// instead of the live table.
///
/// # Errors
///
/// Returns an error if `path` cannot be read.
pub fn read_interface_names_from(path: impl AsRef<Path>) -> io::Result<Vec<String>> {
    Ok(parse_interface_names(&std::fs::read_to_string(path)?))
}

/// The destination-is-local predicate (§6, §4.7): is `dest` an address this process should treat
/// as "on this host", so `connect` is routed to the kernel instead of dialing out over the fast
/// path?
///
/// Loopback destinations are always local. Otherwise `dest` is local only if it matches the single
/// interface address the fast path is bound to (`Config::host_addr`) — this crate does not carry a
/// full interface-address enumeration dependency; discovering that the named device (from
/// [`read_interface_names`]) is present is as far as the local device table goes, and is used for
/// diagnostics, not for this predicate's address match.
#[must_use]
pub fn is_destination_local(dest: IpAddr, host_addr: Option<IpAddr>) -> bool {
    dest.is_loopback() || host_addr.is_some_and(|addr| addr == dest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_interface_names_skipping_header() {
        let fixture = "Inter-|   Receive\n face |bytes    packets\n    lo: 129544505   46349\n  eth0:       0       0\n";
        assert_eq!(parse_interface_names(fixture), vec!["lo", "eth0"]);
    }

    #[test]
    fn loopback_is_always_local() {
        assert!(is_destination_local(IpAddr::from([127, 0, 0, 1]), None));
    }

    #[test]
    fn matching_host_addr_is_local() {
        let host = IpAddr::from([10, 0, 0, 5]);
        assert!(is_destination_local(host, Some(host)));
    }

    #[test]
    fn unrelated_address_is_not_local() {
        let host = IpAddr::from([10, 0, 0, 5]);
        let other = IpAddr::from([8, 8, 8, 8]);
        assert!(!is_destination_local(other, Some(host)));
    }
}
