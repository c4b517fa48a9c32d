//! Probe identity allocation and reply dispatch.
//!
//! Outstanding probes are named by `(identifier, sequence)`. Identifiers are
//! claimed from a process-global pool, one per session; sequences come from a
//! per-socket counter that skips values still in flight. The waiter map is
//! the rendezvous between issuers and the receive task: issuers insert a
//! oneshot sender before the packet hits the wire, the receive task resolves
//! it when a matching reply arrives.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, trace};

use crate::error::{PingError, Result};
use crate::packet::{self, TIMESTAMP_LEN};

/// Nanoseconds since a process-local epoch, monotonic.
///
/// Stamped into outgoing payloads so the RTT survives any bookkeeping delay
/// between the reply hitting the socket and the waiter waking up.
pub(crate) fn monotonic_ns() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// Identifiers claimed by live sessions. A `Vec` is fine here: sessions are
/// few and claims are rare.
static CLAIMED_IDENTS: Mutex<Vec<u16>> = Mutex::new(Vec::new());

/// A claimed slot in the 16-bit ICMP identifier space.
///
/// Held by a session for its lifetime; the slot returns to the pool on drop.
/// No identifier is handed out twice while a claim is live, so concurrent
/// sessions never shadow each other's replies on RAW sockets.
#[derive(Debug)]
pub(crate) struct SessionIdent(u16);

impl SessionIdent {
    pub(crate) fn claim() -> Result<Self> {
        let mut claimed = CLAIMED_IDENTS.lock();
        if claimed.len() > usize::from(u16::MAX) {
            return Err(PingError::IdentExhausted);
        }
        let mut ident = rand::random::<u16>();
        while claimed.contains(&ident) {
            ident = ident.wrapping_add(1);
        }
        claimed.push(ident);
        trace!(ident, "claimed ICMP identifier");
        Ok(Self(ident))
    }

    pub(crate) fn get(&self) -> u16 {
        self.0
    }
}

impl Drop for SessionIdent {
    fn drop(&mut self) {
        CLAIMED_IDENTS.lock().retain(|&id| id != self.0);
    }
}

/// Key of an outstanding probe within one socket.
///
/// `ident` is `None` on Linux DGRAM sockets, where the kernel overwrites the
/// identifier with a socket-bound value and waiters are matched by sequence
/// plus payload pattern instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ProbeKey {
    pub ident: Option<u16>,
    pub seq: u16,
}

struct Waiter {
    dest: IpAddr,
    sent_at: Instant,
    tx: oneshot::Sender<Duration>,
}

struct MapInner {
    waiters: HashMap<ProbeKey, Waiter>,
    next_seq: u16,
}

/// Pending waiters for one socket, plus the sequence allocator that feeds it.
pub(crate) struct WaiterMap {
    inner: Mutex<MapInner>,
    /// Signalled on every removal so a blocked sequence allocator can rescan.
    freed: Notify,
    /// Session payload pattern, compared byte-for-byte on dispatch. Defeats
    /// cross-process replies on DGRAM sockets where the kernel owns the
    /// identifier.
    pattern: Vec<u8>,
}

impl WaiterMap {
    pub(crate) fn new(pattern: Vec<u8>) -> Self {
        Self {
            inner: Mutex::new(MapInner {
                waiters: HashMap::new(),
                next_seq: 0,
            }),
            freed: Notify::new(),
            pattern,
        }
    }

    /// Allocate the next free sequence and insert a waiter for it, atomically.
    ///
    /// Sequences wrap modulo 2^16 and skip values with a live waiter. With
    /// the whole space in flight this parks until some probe resolves.
    pub(crate) async fn register_next(
        &self,
        ident: Option<u16>,
        dest: IpAddr,
    ) -> (u16, oneshot::Receiver<Duration>) {
        loop {
            let freed = self.freed.notified();
            if let Some(registered) = self.try_register_next(ident, dest) {
                return registered;
            }
            debug!("sequence space exhausted, waiting for a probe to resolve");
            freed.await;
        }
    }

    fn try_register_next(
        &self,
        ident: Option<u16>,
        dest: IpAddr,
    ) -> Option<(u16, oneshot::Receiver<Duration>)> {
        let mut inner = self.inner.lock();
        for _ in 0..=u16::MAX as u32 {
            let seq = inner.next_seq;
            inner.next_seq = seq.wrapping_add(1);
            let key = ProbeKey { ident, seq };
            if !inner.waiters.contains_key(&key) {
                let (tx, rx) = oneshot::channel();
                inner.waiters.insert(
                    key,
                    Waiter {
                        dest,
                        sent_at: Instant::now(),
                        tx,
                    },
                );
                return Some((seq, rx));
            }
        }
        None
    }

    /// Insert a waiter for a caller-chosen key. Rejects a key already in
    /// flight: one send on the wire per waiter, one waiter per key.
    pub(crate) fn register(
        &self,
        key: ProbeKey,
        dest: IpAddr,
    ) -> Result<oneshot::Receiver<Duration>> {
        let mut inner = self.inner.lock();
        if inner.waiters.contains_key(&key) {
            return Err(PingError::DuplicateProbe { seq: key.seq });
        }
        let (tx, rx) = oneshot::channel();
        inner.waiters.insert(
            key,
            Waiter {
                dest,
                sent_at: Instant::now(),
                tx,
            },
        );
        Ok(rx)
    }

    /// Remove a waiter without fulfilling it. Idempotent; a late reply for a
    /// cancelled probe simply misses the map and is dropped.
    pub(crate) fn cancel(&self, key: ProbeKey) {
        let removed = self.inner.lock().waiters.remove(&key).is_some();
        if removed {
            self.freed.notify_one();
        }
    }

    /// Resolve a parsed Echo Reply to its waiter, if any.
    ///
    /// The payload must echo our pattern bit-exactly after the timestamp
    /// prefix; a mismatch leaves the waiter in place so a forged or foreign
    /// reply cannot consume it. Duplicate replies miss the map and fall out.
    pub(crate) fn dispatch(&self, key: ProbeKey, payload: &[u8], src: IpAddr) {
        let now_ns = monotonic_ns();

        let waiter = {
            let mut inner = self.inner.lock();
            if !inner.waiters.contains_key(&key) {
                trace!(?key, %src, "reply without a waiter, dropped");
                return;
            }
            // Checked before removal so a forged reply cannot consume the
            // waiter of a probe that is still waiting for the real one.
            if payload.len() != TIMESTAMP_LEN + self.pattern.len()
                || payload[TIMESTAMP_LEN..] != self.pattern[..]
            {
                debug!(?key, %src, "payload mismatch, reply dropped");
                return;
            }
            match inner.waiters.remove(&key) {
                Some(waiter) => waiter,
                None => return,
            }
        };
        self.freed.notify_one();

        // The echoed timestamp is authoritative: it is immune to scheduling
        // jitter between recv and this dispatch. Fall back to the recorded
        // send instant if the payload carries garbage.
        let rtt = match packet::read_timestamp(payload) {
            Some(sent_ns) if sent_ns > 0 && sent_ns <= now_ns => {
                Duration::from_nanos(now_ns - sent_ns)
            }
            _ => waiter.sent_at.elapsed(),
        };

        debug!(?key, %src, dest = %waiter.dest, ?rtt, "reply matched");
        // A closed receiver means the prober gave up; nothing to do.
        let _ = waiter.tx.send(rtt);
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    #[cfg(test)]
    fn set_next_seq(&self, seq: u16) {
        self.inner.lock().next_seq = seq;
    }
}

/// Removes its waiter when dropped, whatever the exit path.
///
/// Fulfilled probes already left the map, so the removal is a no-op there;
/// for timeouts and cancelled futures it is the cleanup itself.
pub(crate) struct WaiterGuard<'a> {
    map: &'a WaiterMap,
    key: ProbeKey,
}

impl<'a> WaiterGuard<'a> {
    pub(crate) fn new(map: &'a WaiterMap, key: ProbeKey) -> Self {
        Self { map, key }
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.map.cancel(self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const DEST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn test_map() -> WaiterMap {
        WaiterMap::new(vec![0xa5; 24])
    }

    fn echoed_payload(map: &WaiterMap, sent_ns: u64) -> Vec<u8> {
        let mut payload = vec![0u8; TIMESTAMP_LEN];
        packet::write_timestamp(&mut payload, sent_ns);
        payload.extend_from_slice(&map.pattern);
        payload
    }

    #[test]
    fn test_monotonic_ns_increases() {
        let a = monotonic_ns();
        let b = monotonic_ns();
        assert!(b >= a);
    }

    #[test]
    fn test_ident_claims_are_unique() {
        let idents: Vec<SessionIdent> =
            (0..100).map(|_| SessionIdent::claim().unwrap()).collect();
        let mut seen: Vec<u16> = idents.iter().map(|i| i.get()).collect();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), idents.len());
    }

    #[test]
    fn test_ident_returns_to_pool_on_drop() {
        let ident = SessionIdent::claim().unwrap();
        let value = ident.get();
        assert!(CLAIMED_IDENTS.lock().contains(&value));
        drop(ident);
        assert!(!CLAIMED_IDENTS.lock().contains(&value));
    }

    #[tokio::test]
    async fn test_register_next_hands_out_distinct_sequences() {
        let map = test_map();
        let (seq_a, _rx_a) = map.register_next(Some(7), DEST).await;
        let (seq_b, _rx_b) = map.register_next(Some(7), DEST).await;
        assert_ne!(seq_a, seq_b);
        assert_eq!(map.len(), 2);
    }

    #[tokio::test]
    async fn test_register_next_skips_busy_sequence_on_wrap() {
        let map = test_map();
        let (seq, _rx) = map.register_next(Some(1), DEST).await;

        // force the counter back onto the live sequence
        map.set_next_seq(seq);
        let (next, _rx2) = map.register_next(Some(1), DEST).await;
        assert_ne!(next, seq);
    }

    #[test]
    fn test_register_rejects_duplicate_key() {
        let map = test_map();
        let key = ProbeKey {
            ident: Some(3),
            seq: 40,
        };
        let _rx = map.register(key, DEST).unwrap();
        assert!(matches!(
            map.register(key, DEST),
            Err(PingError::DuplicateProbe { seq: 40 })
        ));
    }

    #[tokio::test]
    async fn test_dispatch_fulfills_exactly_once() {
        let map = test_map();
        let key = ProbeKey {
            ident: Some(5),
            seq: 1,
        };
        let rx = map.register(key, DEST).unwrap();

        let payload = echoed_payload(&map, monotonic_ns());
        map.dispatch(key, &payload, DEST);
        // duplicate reply for the same identity
        map.dispatch(key, &payload, DEST);

        let rtt = rx.await.unwrap();
        assert!(rtt < Duration::from_secs(1));
        assert_eq!(map.len(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_ignores_tampered_payload() {
        let map = test_map();
        let key = ProbeKey {
            ident: Some(5),
            seq: 2,
        };
        let mut rx = map.register(key, DEST).unwrap();

        let mut tampered = echoed_payload(&map, monotonic_ns());
        *tampered.last_mut().unwrap() ^= 0xff;
        map.dispatch(key, &tampered, DEST);

        // waiter must survive the forged reply...
        assert_eq!(map.len(), 1);
        assert!(rx.try_recv().is_err());

        // ...and still be fulfillable by the genuine one
        let genuine = echoed_payload(&map, monotonic_ns());
        map.dispatch(key, &genuine, DEST);
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn test_dispatch_ignores_short_payload() {
        let map = test_map();
        let key = ProbeKey {
            ident: None,
            seq: 3,
        };
        let _rx = map.register(key, DEST).unwrap();
        map.dispatch(key, &[0u8; 4], DEST);
        assert_eq!(map.len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_without_waiter_is_dropped() {
        let map = test_map();
        let payload = echoed_payload(&map, monotonic_ns());
        map.dispatch(
            ProbeKey {
                ident: Some(9),
                seq: 9,
            },
            &payload,
            DEST,
        );
        assert_eq!(map.len(), 0);
    }

    #[tokio::test]
    async fn test_rtt_prefers_payload_timestamp() {
        let map = test_map();
        let key = ProbeKey {
            ident: Some(6),
            seq: 4,
        };
        // the waiter's own send instant is 60ms in the past by dispatch time
        let _ = monotonic_ns(); // pin the process epoch before sleeping
        let rx = map.register(key, DEST).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        // a payload claiming the probe left only 20ms ago must win over
        // the waiter's older recorded instant
        let sent_ns = monotonic_ns() - 20_000_000;
        map.dispatch(key, &echoed_payload(&map, sent_ns), DEST);

        let rtt = rx.await.unwrap();
        assert!(rtt >= Duration::from_millis(20));
        assert!(rtt < Duration::from_millis(50), "fell back to send instant: {rtt:?}");
    }

    #[tokio::test]
    async fn test_rtt_falls_back_on_future_timestamp() {
        let map = test_map();
        let key = ProbeKey {
            ident: Some(6),
            seq: 5,
        };
        let rx = map.register(key, DEST).unwrap();

        // a timestamp from the future cannot be trusted
        map.dispatch(key, &echoed_payload(&map, u64::MAX), DEST);

        let rtt = rx.await.unwrap();
        assert!(rtt < Duration::from_secs(1));
    }

    #[test]
    fn test_guard_removes_waiter() {
        let map = test_map();
        let key = ProbeKey {
            ident: Some(8),
            seq: 6,
        };
        let _rx = map.register(key, DEST).unwrap();
        {
            let _guard = WaiterGuard::new(&map, key);
            assert_eq!(map.len(), 1);
        }
        assert_eq!(map.len(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_then_late_reply_is_dropped() {
        let map = test_map();
        let key = ProbeKey {
            ident: Some(8),
            seq: 7,
        };
        let rx = map.register(key, DEST).unwrap();
        map.cancel(key);
        drop(rx);

        let payload = echoed_payload(&map, monotonic_ns());
        map.dispatch(key, &payload, DEST);
        assert_eq!(map.len(), 0);
    }
}
