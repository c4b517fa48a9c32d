//! Per-family ICMP socket creation, configuration and async I/O.
//!
//! Sockets are created with socket2 so every knob (type, protocol, TTL,
//! traffic class, bind) is applied before the fd is handed to tokio's
//! `UdpSocket` for readiness-driven reads and writes. ICMP sockets behave
//! like datagram sockets for I/O purposes, so the UDP wrapper fits.

use std::io;
use std::mem;
use std::net::{IpAddr, SocketAddr};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::config::{SelectionPolicy, SessionConfig};
use crate::error::{PingError, Result};
use crate::packet::IpFamily;

/// How the socket was actually opened, after policy resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SocketKind {
    Raw,
    Dgram,
}

/// One configured ICMP socket for one address family.
pub(crate) struct IcmpSocket {
    inner: UdpSocket,
    kind: SocketKind,
    family: IpFamily,
}

impl IcmpSocket {
    /// Open and configure a socket per the session's selection policy.
    ///
    /// Every configuration step must succeed; a half-configured socket is
    /// dropped rather than used. `AUTO` tries the unprivileged DGRAM
    /// facility first and falls back to RAW.
    pub(crate) fn open(family: IpFamily, config: &SessionConfig, idents: &[u16]) -> Result<Self> {
        let (kind, socket) = match config.policy {
            SelectionPolicy::Raw => (SocketKind::Raw, new_socket(family, Type::RAW)?),
            SelectionPolicy::Dgram => (SocketKind::Dgram, new_socket(family, Type::DGRAM)?),
            SelectionPolicy::Auto => match new_socket(family, Type::DGRAM) {
                Ok(socket) => (SocketKind::Dgram, socket),
                Err(err) => {
                    debug!(?family, "DGRAM ICMP socket unavailable ({err}), trying RAW");
                    (SocketKind::Raw, new_socket(family, Type::RAW)?)
                }
            },
        };

        configure(&socket, family, kind, config)?;

        #[cfg(target_os = "linux")]
        if kind == SocketKind::Raw {
            // Kernel-side filtering keeps foreign ICMP traffic out of
            // userspace. Best-effort: a missed filter costs CPU, not
            // correctness, since dispatch re-checks everything.
            if let Err(err) = bpf::attach_echo_filter(&socket, family, idents) {
                warn!(?family, "could not attach BPF echo filter: {err}");
            }
        }
        #[cfg(not(target_os = "linux"))]
        let _ = idents;

        socket.set_nonblocking(true).map_err(PingError::Io)?;
        let inner = UdpSocket::from_std(unsafe {
            std::net::UdpSocket::from_raw_fd(socket.into_raw_fd())
        })
        .map_err(PingError::Io)?;

        debug!(?family, ?kind, "ICMP socket ready");
        Ok(Self {
            inner,
            kind,
            family,
        })
    }

    pub(crate) fn kind(&self) -> SocketKind {
        self.kind
    }

    pub(crate) fn family(&self) -> IpFamily {
        self.family
    }

    /// Whether inbound datagrams start with the IPv4 header.
    ///
    /// RAW IPv4 sockets always include it. DGRAM includes it everywhere
    /// except Linux/Android. The IPv6 header is never delivered.
    pub(crate) fn strips_ip_header(&self) -> bool {
        self.family == IpFamily::V4
            && (self.kind == SocketKind::Raw
                || cfg!(not(any(target_os = "linux", target_os = "android"))))
    }

    /// Whether the kernel overwrites our echo identifier with its own
    /// socket-bound value (Linux/Android DGRAM). Waiters for such sockets
    /// are keyed by sequence only.
    pub(crate) fn kernel_assigns_ident(&self) -> bool {
        self.kind == SocketKind::Dgram
            && cfg!(any(target_os = "linux", target_os = "android"))
    }

    pub(crate) async fn send_to(&self, buf: &[u8], dest: IpAddr) -> io::Result<usize> {
        self.inner.send_to(buf, SocketAddr::new(dest, 0)).await
    }

    pub(crate) async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.inner.recv_from(buf).await
    }

    /// Wait until the kernel is ready to take more outbound data. Used to
    /// pace retries after ENOBUFS.
    pub(crate) async fn writable(&self) -> io::Result<()> {
        self.inner.writable().await
    }
}

fn new_socket(family: IpFamily, sock_type: Type) -> Result<Socket> {
    let (domain, protocol) = match family {
        IpFamily::V4 => (Domain::IPV4, Protocol::ICMPV4),
        IpFamily::V6 => (Domain::IPV6, Protocol::ICMPV6),
    };
    Socket::new(domain, sock_type, Some(protocol)).map_err(PingError::from_socket_err)
}

fn configure(
    socket: &Socket,
    family: IpFamily,
    kind: SocketKind,
    config: &SessionConfig,
) -> Result<()> {
    match family {
        IpFamily::V4 => {
            socket.set_ttl(config.ttl.into())?;
            socket.set_tos(config.tos.into())?;
        }
        IpFamily::V6 => {
            socket.set_unicast_hops_v6(config.ttl.into())?;
            socket.set_tclass_v6(config.tos.into())?;
        }
    }

    if let Some(src) = config.src_addr {
        socket.bind(&SockAddr::from(SocketAddr::new(src, 0)))?;
    }

    if family == IpFamily::V6 && kind == SocketKind::Raw {
        set_ipv6_checksum_offset(socket)?;
    }

    Ok(())
}

/// Tell the kernel to fill the ICMPv6 checksum at offset 2.
///
/// Linux pins ICMPv6 sockets to exactly this and answers EINVAL when asked
/// again, so that answer counts as success.
fn set_ipv6_checksum_offset(socket: &Socket) -> Result<()> {
    let offset: libc::c_int = 2;
    let res = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IPV6,
            libc::IPV6_CHECKSUM,
            &offset as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if res == -1 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINVAL) {
            return Err(PingError::Io(err));
        }
    }
    Ok(())
}

/// Classic BPF program generation for RAW sockets.
///
/// The filter accepts Echo Replies whose identifier belongs to this process
/// and rejects everything else before it crosses into userspace.
#[cfg(target_os = "linux")]
pub(crate) mod bpf {
    use std::io;
    use std::mem;
    use std::os::unix::io::AsRawFd;

    use socket2::Socket;

    use crate::packet::IpFamily;

    // ldxb 4*([k]&0xf) - X := IPv4 header length
    const OP_LDXB_MSH: u16 = 0xb1;
    // ldb [x + k] / ldh [x + k] - loads relative to X
    const OP_LDB_IND: u16 = 0x50;
    const OP_LDH_IND: u16 = 0x48;
    // ldb [k] / ldh [k] - absolute loads
    const OP_LDB_ABS: u16 = 0x30;
    const OP_LDH_ABS: u16 = 0x28;
    // jeq #k, jt, jf
    const OP_JEQ_K: u16 = 0x15;
    // ret #k
    const OP_RET_K: u16 = 0x06;

    const ECHO_REPLY_V4: u32 = 0;
    const ECHO_REPLY_V6: u32 = 129;

    /// Jump offsets are u8, which bounds how many identifiers one program
    /// can enumerate.
    pub(crate) const MAX_FILTER_IDENTS: usize = 200;

    fn insn(code: u16, jt: u8, jf: u8, k: u32) -> libc::sock_filter {
        libc::sock_filter { code, jt, jf, k }
    }

    /// Accept Echo Replies carrying one of `idents`, drop the rest.
    ///
    /// RAW IPv4 sockets see the IP header, so the ICMP offsets are indirect
    /// through the IHL nibble; RAW IPv6 sockets start at the ICMPv6 header.
    pub(crate) fn build_echo_filter(family: IpFamily, idents: &[u16]) -> Vec<libc::sock_filter> {
        let n = idents.len() as u8;
        let mut prog = Vec::with_capacity(idents.len() + 6);

        match family {
            IpFamily::V4 => {
                prog.push(insn(OP_LDXB_MSH, 0, 0, 0));
                prog.push(insn(OP_LDB_IND, 0, 0, 0));
                // not an Echo Reply -> jump over the ident checks to drop
                prog.push(insn(OP_JEQ_K, 0, n + 1, ECHO_REPLY_V4));
                prog.push(insn(OP_LDH_IND, 0, 0, 4));
            }
            IpFamily::V6 => {
                prog.push(insn(OP_LDB_ABS, 0, 0, 0));
                prog.push(insn(OP_JEQ_K, 0, n + 1, ECHO_REPLY_V6));
                prog.push(insn(OP_LDH_ABS, 0, 0, 4));
            }
        }

        for (i, ident) in idents.iter().enumerate() {
            // hit -> accept; miss -> fall through, last one lands on drop
            prog.push(insn(OP_JEQ_K, n - i as u8, 0, u32::from(*ident)));
        }

        prog.push(insn(OP_RET_K, 0, 0, 0)); // drop
        prog.push(insn(OP_RET_K, 0, 0, u32::MAX)); // accept whole packet

        prog
    }

    pub(crate) fn attach_echo_filter(
        socket: &Socket,
        family: IpFamily,
        idents: &[u16],
    ) -> io::Result<()> {
        if idents.is_empty() || idents.len() > MAX_FILTER_IDENTS {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("identifier set of {} not filterable", idents.len()),
            ));
        }

        let prog = build_echo_filter(family, idents);
        let fprog = libc::sock_fprog {
            len: prog.len() as u16,
            filter: prog.as_ptr() as *mut libc::sock_filter,
        };
        let res = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_ATTACH_FILTER,
                &fprog as *const _ as *const libc::c_void,
                mem::size_of::<libc::sock_fprog>() as libc::socklen_t,
            )
        };
        if res == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;

    // Socket-touching tests skip when the sandbox cannot open ICMP sockets
    // at all (no privileges and no ping_group_range).
    fn any_socket(family: IpFamily) -> Option<(SocketKind, Socket)> {
        if let Ok(socket) = new_socket(family, Type::DGRAM) {
            return Some((SocketKind::Dgram, socket));
        }
        match new_socket(family, Type::RAW) {
            Ok(socket) => Some((SocketKind::Raw, socket)),
            Err(err) => {
                eprintln!("skipping: cannot open {family:?} ICMP socket: {err}");
                None
            }
        }
    }

    #[test]
    fn test_configure_applies_ttl_and_tos_v4() {
        let Some((kind, socket)) = any_socket(IpFamily::V4) else {
            return;
        };
        let config = SessionConfig::default().ttl(33).tos(0x28);
        configure(&socket, IpFamily::V4, kind, &config).unwrap();
        assert_eq!(socket.ttl().unwrap(), 33);
        assert_eq!(socket.tos().unwrap(), 0x28);
    }

    #[test]
    fn test_configure_applies_hops_and_tclass_v6() {
        let Some((kind, socket)) = any_socket(IpFamily::V6) else {
            return;
        };
        let config = SessionConfig::default().ttl(47).tos(0x28);
        configure(&socket, IpFamily::V6, kind, &config).unwrap();
        assert_eq!(socket.unicast_hops_v6().unwrap(), 47);
        // DS field must land in the Traffic Class byte
        assert_eq!(socket.tclass_v6().unwrap(), 0x28);
    }

    #[tokio::test]
    async fn test_open_auto_resolves_to_some_kind() {
        let config = SessionConfig::default();
        match IcmpSocket::open(IpFamily::V4, &config, &[1]) {
            Ok(socket) => {
                assert!(matches!(socket.kind(), SocketKind::Dgram | SocketKind::Raw));
                assert_eq!(socket.family(), IpFamily::V4);
            }
            Err(err) => eprintln!("skipping: cannot open any v4 ICMP socket: {err}"),
        }
    }

    #[cfg(target_os = "linux")]
    mod bpf_tests {
        use super::super::bpf::build_echo_filter;
        use crate::packet::IpFamily;

        #[test]
        fn test_filter_shape_v4() {
            let prog = build_echo_filter(IpFamily::V4, &[0x1234]);
            // ldxb, ldb, jeq type, ldh, jeq ident, drop, accept
            assert_eq!(prog.len(), 7);
            assert_eq!(prog[0].code, 0xb1);
            assert_eq!(prog[2].k, 0); // echo reply type
            assert_eq!(prog[2].jf, 2); // miss jumps to the drop slot
            assert_eq!(prog[4].k, 0x1234);
            assert_eq!(prog[4].jt, 1); // hit jumps to the accept slot
            assert_eq!(prog[5].k, 0);
            assert_eq!(prog[6].k, u32::MAX);
        }

        #[test]
        fn test_filter_shape_v6_multiple_idents() {
            let idents = [10u16, 20, 30];
            let prog = build_echo_filter(IpFamily::V6, &idents);
            assert_eq!(prog.len(), 3 + idents.len() + 2);
            assert_eq!(prog[1].k, 129); // echo reply type
            assert_eq!(prog[1].jf, idents.len() as u8 + 1);

            // each ident check falls through on miss and lands on accept on hit
            for (i, ident) in idents.iter().enumerate() {
                let insn = &prog[3 + i];
                assert_eq!(insn.k, u32::from(*ident));
                assert_eq!(insn.jf, 0);
                assert_eq!(insn.jt, (idents.len() - i) as u8);
            }
            let drop = &prog[3 + idents.len()];
            let accept = &prog[4 + idents.len()];
            assert_eq!(drop.k, 0);
            assert_eq!(accept.k, u32::MAX);
        }
    }
}
