use std::net::IpAddr;
use std::time::Duration;

use crate::error::{PingError, Result};

/// Smallest accepted payload: the 8-byte send timestamp plus 8 pattern bytes.
pub const MIN_PAYLOAD_SIZE: usize = 16;
/// Largest ICMP payload that fits a single IPv4 datagram.
pub const MAX_PAYLOAD_SIZE: usize = 65_507;

/// How the per-family socket is opened.
///
/// `Raw` needs root or `CAP_NET_RAW`; `Dgram` works unprivileged on Linux
/// when the caller's GID is inside `net.ipv4.ping_group_range`. `Auto` tries
/// `Dgram` first and falls back to `Raw`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionPolicy {
    Raw,
    Dgram,
    #[default]
    Auto,
}

/// Immutable per-session tunables.
///
/// Construct with [`SessionConfig::default`] and chain the setters, then hand
/// the result to [`crate::Session::new`], which validates it once.
///
/// ```
/// use std::time::Duration;
/// use pingmux::SessionConfig;
///
/// let config = SessionConfig::default()
///     .size(64)
///     .ttl(64)
///     .timeout(Duration::from_secs(1));
/// ```
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// ICMP payload length in bytes, timestamp included.
    pub size: usize,
    /// IPv4 TTL / IPv6 hop limit for outgoing probes.
    pub ttl: u8,
    /// DS field (DSCP + ECN bits, RFC 2474). Applied as IP_TOS / IPV6_TCLASS.
    pub tos: u8,
    /// Per-probe deadline.
    pub timeout: Duration,
    /// Gap between consecutive probes of a series; zero means back-to-back.
    pub interval: Duration,
    /// Optional source address, bound when the family's socket is created.
    pub src_addr: Option<IpAddr>,
    pub policy: SelectionPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            size: 64,
            ttl: 64,
            tos: 0,
            timeout: Duration::from_secs(1),
            interval: Duration::from_secs(1),
            src_addr: None,
            policy: SelectionPolicy::Auto,
        }
    }
}

impl SessionConfig {
    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn tos(mut self, tos: u8) -> Self {
        self.tos = tos;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn src_addr(mut self, src_addr: IpAddr) -> Self {
        self.src_addr = Some(src_addr);
        self
    }

    pub fn policy(mut self, policy: SelectionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.size < MIN_PAYLOAD_SIZE || self.size > MAX_PAYLOAD_SIZE {
            return Err(PingError::PayloadSize(self.size));
        }
        if self.ttl == 0 {
            return Err(PingError::ZeroTtl);
        }
        if self.timeout.is_zero() {
            return Err(PingError::ZeroTimeout);
        }
        // tos covers the full u8 range (low 2 bits are ECN, passed through)
        // and interval may be zero, so neither needs a check.
        Ok(())
    }
}
