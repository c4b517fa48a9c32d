//! High-level probing facade.
//!
//! A [`Session`] bundles an immutable configuration with one lazily-created
//! socket per address family. All probes of a family share that socket; a
//! single receive task per socket demultiplexes replies to the waiters that
//! issued them. `ping` is the one-shot primitive, `iter_rtt` the repeating
//! one.

use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::stream::{FuturesUnordered, Stream, StreamExt};
use rand::Rng;
use tokio::sync::{mpsc, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, warn};

use crate::config::SessionConfig;
use crate::error::{PingError, Result};
use crate::packet::{self, IpFamily, TIMESTAMP_LEN};
use crate::registry::{monotonic_ns, ProbeKey, SessionIdent, WaiterGuard, WaiterMap};
use crate::socket::IcmpSocket;

/// Largest datagram an IPv4 socket can hand us, header included.
const RECV_BUFFER_LEN: usize = u16::MAX as usize;

/// Per-call knobs for `ping_with` / `iter_rtt_with`. Unset fields fall back
/// to the session configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProbeOverrides {
    pub timeout: Option<Duration>,
    pub interval: Option<Duration>,
}

/// One family's socket plus everything riding on it.
struct FamilySocket {
    socket: Arc<IcmpSocket>,
    waiters: Arc<WaiterMap>,
    recv_task: JoinHandle<()>,
}

impl Drop for FamilySocket {
    fn drop(&mut self) {
        self.recv_task.abort();
    }
}

struct SessionInner {
    config: SessionConfig,
    ident: SessionIdent,
    /// Pattern bytes echoed after the timestamp, chosen once per session.
    pattern: Vec<u8>,
    v4: OnceCell<Arc<FamilySocket>>,
    v6: OnceCell<Arc<FamilySocket>>,
}

impl SessionInner {
    /// Fresh payload buffer: zeroed timestamp slot followed by the pattern.
    fn payload(&self) -> Vec<u8> {
        let mut payload = vec![0u8; TIMESTAMP_LEN + self.pattern.len()];
        payload[TIMESTAMP_LEN..].copy_from_slice(&self.pattern);
        payload
    }
}

/// An asynchronous ICMP echo prober.
///
/// Cloning is cheap and clones share the sockets, the claimed identifier and
/// the in-flight probe registry, so a single `Session` can drive tens of
/// thousands of concurrent probes from as many tasks as the caller likes.
///
/// ```no_run
/// use pingmux::{Session, SessionConfig};
///
/// # async fn demo() -> pingmux::Result<()> {
/// let session = Session::new(SessionConfig::default())?;
/// if let Some(rtt) = session.ping("127.0.0.1".parse().unwrap()).await? {
///     println!("reply in {rtt:?}");
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Validate the configuration and claim an ICMP identifier.
    ///
    /// Sockets are not opened here; each family's socket appears on the
    /// first probe of that family, so an unprivileged process only fails
    /// once it actually probes.
    pub fn new(config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let ident = SessionIdent::claim()?;

        let mut pattern = vec![0u8; config.size - TIMESTAMP_LEN];
        rand::thread_rng().fill(&mut pattern[..]);

        debug!(ident = ident.get(), size = config.size, "session created");
        Ok(Self {
            inner: Arc::new(SessionInner {
                config,
                ident,
                pattern,
                v4: OnceCell::new(),
                v6: OnceCell::new(),
            }),
        })
    }

    /// Probe `dest` once. `Ok(Some(rtt))` on a matching reply, `Ok(None)`
    /// when the probe timed out or the destination was unreachable. Socket
    /// and address errors are real failures and come back as `Err`.
    pub async fn ping(&self, dest: IpAddr) -> Result<Option<Duration>> {
        self.ping_with(dest, ProbeOverrides::default()).await
    }

    /// `ping` with per-call overrides.
    pub async fn ping_with(
        &self,
        dest: IpAddr,
        overrides: ProbeOverrides,
    ) -> Result<Option<Duration>> {
        let family = self.family_socket(dest).await?;
        let timeout = overrides.timeout.unwrap_or(self.inner.config.timeout);
        probe_once(&self.inner, &family, dest, timeout).await
    }

    /// Probe `dest` repeatedly, yielding one `Option<Duration>` per probe in
    /// completion order.
    ///
    /// The k-th probe is sent at `start + k * interval` regardless of earlier
    /// results. With `count` the stream terminates after exactly that many
    /// items; without it the series runs until the stream is dropped.
    /// Dropping the stream cancels every in-flight probe of the series.
    pub async fn iter_rtt(&self, dest: IpAddr, count: Option<usize>) -> Result<RttStream> {
        self.iter_rtt_with(dest, count, ProbeOverrides::default()).await
    }

    /// `iter_rtt` with per-call overrides.
    pub async fn iter_rtt_with(
        &self,
        dest: IpAddr,
        count: Option<usize>,
        overrides: ProbeOverrides,
    ) -> Result<RttStream> {
        let family = self.family_socket(dest).await?;
        let timeout = overrides.timeout.unwrap_or(self.inner.config.timeout);
        let interval = overrides.interval.unwrap_or(self.inner.config.interval);

        let (tx, rx) = mpsc::unbounded_channel();
        let inner = self.inner.clone();
        let driver = tokio::spawn(async move {
            run_series(inner, family, dest, count, interval, timeout, tx).await;
        });

        Ok(RttStream { rx, driver })
    }

    /// Socket for the destination's family, created and wired up on first
    /// use, shared by every later probe of that family.
    async fn family_socket(&self, dest: IpAddr) -> Result<Arc<FamilySocket>> {
        if let Some(src) = self.inner.config.src_addr {
            if src.is_ipv4() != dest.is_ipv4() {
                return Err(PingError::FamilyMismatch { src, dest });
            }
        }

        let family = IpFamily::of(&dest);
        let cell = match family {
            IpFamily::V4 => &self.inner.v4,
            IpFamily::V6 => &self.inner.v6,
        };

        let inner = &self.inner;
        cell.get_or_try_init(|| async {
            let socket = Arc::new(IcmpSocket::open(
                family,
                &inner.config,
                &[inner.ident.get()],
            )?);
            let waiters = Arc::new(WaiterMap::new(inner.pattern.clone()));
            let recv_task = tokio::spawn(recv_loop(socket.clone(), waiters.clone()));
            Ok(Arc::new(FamilySocket {
                socket,
                waiters,
                recv_task,
            }))
        })
        .await
        .cloned()
    }
}

/// Issue a single probe on an established family socket.
///
/// The waiter is registered before the packet is sent, so a reply can never
/// race the bookkeeping. The guard removes the waiter on every exit path,
/// including this future being dropped mid-flight.
async fn probe_once(
    inner: &SessionInner,
    family: &FamilySocket,
    dest: IpAddr,
    timeout: Duration,
) -> Result<Option<Duration>> {
    let deadline = Instant::now() + timeout;
    let wire_ident = inner.ident.get();
    let key_ident = (!family.socket.kernel_assigns_ident()).then_some(wire_ident);

    let (seq, rx) = family.waiters.register_next(key_ident, dest).await;
    let _guard = WaiterGuard::new(&family.waiters, ProbeKey { ident: key_ident, seq });

    let mut payload = inner.payload();
    packet::write_timestamp(&mut payload, monotonic_ns());
    let request = packet::build_echo_request(family.socket.family(), wire_ident, seq, &payload);

    loop {
        match family.socket.send_to(&request, dest).await {
            Ok(_) => break,
            Err(err) => match err.raw_os_error() {
                // Transient backpressure: wait for the kernel to drain and
                // try again, but never past this probe's own deadline.
                Some(libc::ENOBUFS) => {
                    if Instant::now() >= deadline {
                        debug!(%dest, seq, "send backpressure persisted past deadline");
                        return Ok(None);
                    }
                    family.socket.writable().await?;
                }
                Some(libc::EHOSTUNREACH) | Some(libc::ENETUNREACH) => {
                    debug!(%dest, seq, "destination unreachable: {err}");
                    return Ok(None);
                }
                _ => return Err(PingError::Io(err)),
            },
        }
    }
    debug!(%dest, ident = wire_ident, seq, "probe sent");

    match time::timeout_at(deadline, rx).await {
        Ok(Ok(rtt)) => Ok(Some(rtt)),
        // The receive side only disappears when the session is torn down.
        Ok(Err(_)) => Ok(None),
        Err(_) => {
            debug!(%dest, seq, "probe timed out");
            Ok(None)
        }
    }
}

/// Drive one `iter_rtt` series: send on the tick schedule, forward results
/// as probes resolve. Owning the probe futures directly means aborting this
/// task drops them all, and their guards clear the registry.
async fn run_series(
    inner: Arc<SessionInner>,
    family: Arc<FamilySocket>,
    dest: IpAddr,
    count: Option<usize>,
    interval: Duration,
    timeout: Duration,
    tx: mpsc::UnboundedSender<Option<Duration>>,
) {
    let mut ticker =
        (!interval.is_zero()).then(|| time::interval_at(Instant::now(), interval));
    let mut inflight = FuturesUnordered::new();
    let mut sent = 0usize;

    loop {
        let more = count.map_or(true, |count| sent < count);
        if !more && inflight.is_empty() {
            break;
        }

        tokio::select! {
            _ = next_tick(&mut ticker), if more => {
                inflight.push(probe_once(&inner, &family, dest, timeout));
                sent += 1;
            }
            Some(result) = inflight.next() => {
                let item = result.unwrap_or_else(|err| {
                    // The series never dies on a per-probe error; the
                    // consumer sees a lost probe.
                    warn!(%dest, "probe failed: {err}");
                    None
                });
                if tx.send(item).is_err() {
                    break;
                }
            }
        }
    }
    debug!(%dest, sent, "series finished");
}

async fn next_tick(ticker: &mut Option<time::Interval>) {
    if let Some(ticker) = ticker {
        ticker.tick().await;
    }
}

/// Receive loop for one socket: parse, demultiplex, repeat. Lives until the
/// owning session drops the socket; per-packet problems never end it.
async fn recv_loop(socket: Arc<IcmpSocket>, waiters: Arc<WaiterMap>) {
    let mut buf = vec![0u8; RECV_BUFFER_LEN];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, addr)) => {
                let reply = match packet::parse_echo_reply(
                    socket.family(),
                    socket.strips_ip_header(),
                    &buf[..len],
                ) {
                    Some(reply) => reply,
                    // Short, malformed or non-echo traffic is not ours.
                    None => continue,
                };
                let ident = (!socket.kernel_assigns_ident()).then_some(reply.ident);
                waiters.dispatch(
                    ProbeKey { ident, seq: reply.seq },
                    reply.payload,
                    addr.ip(),
                );
            }
            Err(err) => {
                debug!("receive error: {err}");
                tokio::task::yield_now().await;
            }
        }
    }
}

/// Lazy sequence of per-probe results from [`Session::iter_rtt`].
///
/// Terminates after `count` items. Dropping it aborts the series driver,
/// which cancels all in-flight waiters of the series.
pub struct RttStream {
    rx: mpsc::UnboundedReceiver<Option<Duration>>,
    driver: JoinHandle<()>,
}

impl Stream for RttStream {
    type Item = Option<Duration>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for RttStream {
    fn drop(&mut self) {
        self.driver.abort();
    }
}
