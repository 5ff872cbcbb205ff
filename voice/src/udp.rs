//! UDP media socket: IP discovery, keepalive and datagram I/O.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::net::{lookup_host, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::ConnectionEndpoint;
use crate::error::{VoiceError, VoiceResult};

/// IP discovery probe and reply length
pub const DISCOVERY_PACKET_SIZE: usize = 70;

/// Keepalive datagram length
pub const KEEPALIVE_PACKET_SIZE: usize = 8;

/// Receive buffer size; larger than any voice datagram
pub const MAX_DATAGRAM_SIZE: usize = 4096;

/// How long to wait for the discovery reply
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Unanswered keepalives older than this are forgotten
const STALE_KEEPALIVE: Duration = Duration::from_secs(60);

const DISCOVERY_ADDRESS_END: usize = 68;

/// Probe carrying our SSRC (little-endian) in the first four bytes.
pub fn build_discovery_packet(ssrc: u32) -> [u8; DISCOVERY_PACKET_SIZE] {
    // ---
    let mut packet = [0u8; DISCOVERY_PACKET_SIZE];
    packet[..4].copy_from_slice(&ssrc.to_le_bytes());
    packet
}

/// Extracts our external address from a discovery reply.
///
/// # Errors
///
/// Returns [`VoiceError::Protocol`] if the reply is shorter than 70 bytes
/// or the address is not a valid IP.
pub fn parse_discovery_reply(reply: &[u8]) -> VoiceResult<ConnectionEndpoint> {
    // ---
    if reply.len() < DISCOVERY_PACKET_SIZE {
        return Err(VoiceError::Protocol(format!(
            "discovery reply too short: {} bytes",
            reply.len()
        )));
    }

    let raw = &reply[4..DISCOVERY_ADDRESS_END];
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    let ip = std::str::from_utf8(&raw[..end])
        .map_err(|e| VoiceError::Protocol(format!("discovery address is not UTF-8: {e}")))?;
    let ip: IpAddr = ip
        .parse()
        .map_err(|e| VoiceError::Protocol(format!("invalid discovery address '{ip}': {e}")))?;

    let port = u16::from_le_bytes([reply[DISCOVERY_ADDRESS_END], reply[DISCOVERY_ADDRESS_END + 1]]);

    Ok(ConnectionEndpoint::new(ip.to_string(), port))
}

/// Connected UDP socket to the voice server.
///
/// Shared between the transmit, receive and keepalive tasks.
#[derive(Debug)]
pub struct UdpSession {
    // ---
    socket: UdpSocket,
    remote: SocketAddr,
}

impl UdpSession {
    // ---
    /// Resolves `endpoint`, binds an ephemeral port and connects to it.
    pub async fn connect(endpoint: &ConnectionEndpoint) -> VoiceResult<Self> {
        // ---
        let remote = lookup_host(endpoint.authority())
            .await?
            .next()
            .ok_or_else(|| {
                VoiceError::Unsupported(format!("no address for {}", endpoint.authority()))
            })?;

        let bind: SocketAddr = if remote.is_ipv6() {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        };

        let socket = UdpSocket::bind(bind).await?;
        socket.connect(remote).await?;
        debug!("UDP socket {} connected to {}", socket.local_addr()?, remote);

        Ok(Self { socket, remote })
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn local_addr(&self) -> VoiceResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Sends the discovery probe and waits for the reply.
    pub async fn discover(
        &self,
        ssrc: u32,
        cancel: &CancellationToken,
    ) -> VoiceResult<ConnectionEndpoint> {
        // ---
        self.socket.send(&build_discovery_packet(ssrc)).await?;

        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        let len = tokio::select! {
            _ = cancel.cancelled() => return Err(VoiceError::Disposed),
            res = tokio::time::timeout(DISCOVERY_TIMEOUT, self.socket.recv(&mut buf)) => match res {
                Ok(len) => len?,
                Err(_) => {
                    return Err(VoiceError::Io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "no IP discovery reply",
                    )))
                }
            },
        };

        let external = parse_discovery_reply(&buf[..len])?;
        info!("IP discovery: external address {}", external.authority());
        Ok(external)
    }

    pub async fn send(&self, data: &[u8]) -> VoiceResult<usize> {
        Ok(self.socket.send(data).await?)
    }

    pub async fn recv(&self, buf: &mut [u8]) -> VoiceResult<usize> {
        Ok(self.socket.recv(buf).await?)
    }
}

/// Outstanding keepalives and the last measured round trip.
#[derive(Debug, Default)]
pub struct KeepaliveTracker {
    // ---
    counter: AtomicU64,
    pending: DashMap<u64, Instant>,
    rtt_ms: AtomicU64,
}

impl KeepaliveTracker {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    /// Next keepalive datagram; records its send time.
    pub fn next_packet(&self) -> [u8; KEEPALIVE_PACKET_SIZE] {
        // ---
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        self.pending.retain(|_, sent| sent.elapsed() < STALE_KEEPALIVE);
        self.pending.insert(n, Instant::now());
        n.to_le_bytes()
    }

    /// Matches a reply against a pending keepalive. Unmatched or
    /// wrong-sized replies yield `None`.
    pub fn handle_reply(&self, data: &[u8]) -> Option<Duration> {
        // ---
        let bytes: [u8; KEEPALIVE_PACKET_SIZE] = data.try_into().ok()?;
        let n = u64::from_le_bytes(bytes);
        let (_, sent) = self.pending.remove(&n)?;

        let rtt = sent.elapsed();
        self.rtt_ms.store(rtt.as_millis() as u64, Ordering::Relaxed);
        trace!(counter = n, rtt_ms = rtt.as_millis() as u64, "keepalive reply");
        Some(rtt)
    }

    /// Last UDP round trip in milliseconds (0 until the first reply).
    pub fn rtt_ms(&self) -> u64 {
        self.rtt_ms.load(Ordering::Relaxed)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Sends a keepalive every `interval` until cancelled.
pub async fn run_keepalive(
    session: Arc<UdpSession>,
    tracker: Arc<KeepaliveTracker>,
    interval: Duration,
    cancel: CancellationToken,
) {
    // ---
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let packet = tracker.next_packet();
                if let Err(e) = session.send(&packet).await {
                    warn!("Failed to send UDP keepalive: {e}");
                }
            }
        }
    }

    debug!("UDP keepalive loop stopped");
}
