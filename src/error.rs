use std::io;
use std::net::IpAddr;

use thiserror::Error;

use crate::config::{MAX_PAYLOAD_SIZE, MIN_PAYLOAD_SIZE};

pub type Result<T, E = PingError> = std::result::Result<T, E>;

/// Errors surfaced by the prober.
///
/// Recoverable per-probe conditions (timeout, unreachable destination,
/// malformed replies) never show up here; they degrade to an absent RTT.
#[derive(Debug, Error)]
pub enum PingError {
    #[error("payload size {0} out of range ({MIN_PAYLOAD_SIZE}..={MAX_PAYLOAD_SIZE})")]
    PayloadSize(usize),

    #[error("ttl must be between 1 and 255")]
    ZeroTtl,

    #[error("probe timeout must be greater than zero")]
    ZeroTimeout,

    #[error("source address {src} and destination {dest} belong to different address families")]
    FamilyMismatch { src: IpAddr, dest: IpAddr },

    #[error("permission denied opening ICMP socket - need root, CAP_NET_RAW or a ping_group_range that admits this process")]
    Permission(#[source] io::Error),

    #[error("all 65536 ICMP identifiers are claimed by live sessions")]
    IdentExhausted,

    #[error("a probe with sequence {seq} is already in flight")]
    DuplicateProbe { seq: u16 },

    #[error("socket error")]
    Io(#[from] io::Error),
}

impl PingError {
    /// Wrap a socket-creation error, promoting permission failures to their
    /// own variant so callers can tell "run with privileges" apart from
    /// ordinary I/O trouble.
    pub(crate) fn from_socket_err(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::PermissionDenied {
            PingError::Permission(err)
        } else {
            PingError::Io(err)
        }
    }
}
