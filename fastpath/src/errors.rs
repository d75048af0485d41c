// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The crate-wide error type, unifying POSIX errno kinds with internal failure modes.

use config::ConfigError;

/// Errors produced anywhere in the fast-path core.
///
/// Every fallible function in this crate returns `Result<T, FastpathError>` and propagates with
/// `?`; only the shim's outermost entry points call [`FastpathError::as_errno`] to flatten this
/// into the POSIX `-1`-and-`errno` convention.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FastpathError {
    /// The descriptor has no fast-path state (not tracked, or already closed).
    #[error("no fast-path state for descriptor")]
    BadFd,
    /// Arguments were invalid: a null pointer, an unsupported domain/type, a malformed address.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The operation would block: a ring is empty/full, or no shadow clone is ready.
    #[error("operation would block")]
    WouldBlock,
    /// A datagram fan-out operation exhausted every clone without finding data.
    #[error("not connected")]
    NotConnected,
    /// The descriptor is not a socket (e.g. an epoll fd was passed to a socket call).
    #[error("not a socket")]
    NotSocket,
    /// Configuration failed validation.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    /// The buffer pool (idle ring) has no free buffers left to hand out.
    #[error("buffer pool exhausted")]
    PoolExhausted,
    /// The protocol engine collaborator rejected the request.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
}

/// Errors a protocol engine ([`crate::engine::Engine`]) implementation may return.
#[derive(Debug, Clone, Copy, thiserror::Error)]
pub enum EngineError {
    /// The engine has no free pcb to hand out.
    #[error("engine out of pcbs")]
    OutOfPcbs,
    /// The requested address is already in use.
    #[error("address in use")]
    AddrInUse,
    /// The pcb is not in a state that permits this operation.
    #[error("bad pcb state for this operation")]
    BadState,
}

impl FastpathError {
    /// Map this error onto the POSIX errno value the shim reports to the application.
    #[must_use]
    pub const fn as_errno(&self) -> i32 {
        match self {
            FastpathError::BadFd => errno::EBADF,
            FastpathError::InvalidArgument(_) => errno::EINVAL,
            FastpathError::WouldBlock => errno::EAGAIN,
            FastpathError::NotConnected => errno::ENOTCONN,
            FastpathError::NotSocket => errno::ENOTSOCK,
            FastpathError::Config(_) | FastpathError::PoolExhausted => errno::ENOMEM,
            FastpathError::Engine(EngineError::AddrInUse) => errno::EADDRINUSE,
            FastpathError::Engine(_) => errno::EINVAL,
        }
    }
}

/// Crate-wide result alias.
pub type FastpathResult<T> = Result<T, FastpathError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_fd_maps_to_ebadf() {
        assert_eq!(FastpathError::BadFd.as_errno(), errno::EBADF);
    }

    #[test]
    fn would_block_maps_to_eagain() {
        assert_eq!(FastpathError::WouldBlock.as_errno(), errno::EAGAIN);
    }

    #[test]
    fn config_error_converts() {
        let cfg_err = ConfigError::ZeroWorkers;
        let err: FastpathError = cfg_err.into();
        assert!(matches!(err, FastpathError::Config(ConfigError::ZeroWorkers)));
    }
}
