//! Reliable-ordered user-space UDP peer.
//!
//! A minimal connection-oriented transport over a single UDP flow:
//! one outgoing peer, one channel, reliable in-order delivery. The
//! control session polls [`ReliablePeer::service`] to drive acks and
//! retransmissions; nothing progresses between calls, which is why
//! the caller's poll interval bounds retransmit latency.
//!
//! ## Wire format
//!
//! Every datagram carries a 7-byte header:
//!
//! ```text
//! magic:  u16 BE  (0x5650)
//! kind:   u8      (Connect / ConnectAck / Data / Ack / Disconnect)
//! seq:    u32 BE  (Data: sender sequence; Ack: acked sequence)
//! ```
//!
//! Data frames are acknowledged individually and retransmitted until
//! acked. Out-of-order arrivals are buffered and released in
//! sequence.
//!
//! ## Interception
//!
//! A raw-datagram hook runs before a frame is promoted into an
//! event. Returning `true` marks the frame handled and suppresses
//! it. The control session uses this to defer disconnect commands
//! until already-received data has drained, working around data loss
//! the transport otherwise exhibits on pending disconnects.

use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::time;
use tracing::{debug, trace};

use crate::error::VaporError;

/// Leading magic of every peer datagram.
const FRAME_MAGIC: u16 = 0x5650;
/// Datagram header size.
const HEADER_LENGTH: usize = 7;
/// Largest datagram we ever read.
const MAX_DATAGRAM: usize = 1400;
/// Unacked data frames are resent after this long.
const RETRANSMIT_INTERVAL: Duration = Duration::from_millis(40);
/// Connect requests are repeated at this cadence.
const CONNECT_RESEND_INTERVAL: Duration = Duration::from_millis(100);
/// Default peer idle timeout.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

// ── Frames ───────────────────────────────────────────────────────

/// Datagram discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Connect = 1,
    ConnectAck = 2,
    Data = 3,
    Ack = 4,
    Disconnect = 5,
}

impl FrameKind {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Connect),
            2 => Some(Self::ConnectAck),
            3 => Some(Self::Data),
            4 => Some(Self::Ack),
            5 => Some(Self::Disconnect),
            _ => None,
        }
    }
}

/// Classify a raw datagram without consuming it. This is what
/// intercept hooks use to spot disconnect commands on the wire.
pub fn datagram_kind(datagram: &[u8]) -> Option<FrameKind> {
    decode_header(datagram).map(|(kind, _)| kind)
}

fn encode_frame(kind: FrameKind, seq: u32, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LENGTH + payload.len());
    frame.extend_from_slice(&FRAME_MAGIC.to_be_bytes());
    frame.push(kind as u8);
    frame.extend_from_slice(&seq.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

fn decode_header(datagram: &[u8]) -> Option<(FrameKind, u32)> {
    if datagram.len() < HEADER_LENGTH {
        return None;
    }
    if u16::from_be_bytes([datagram[0], datagram[1]]) != FRAME_MAGIC {
        return None;
    }
    let kind = FrameKind::from_u8(datagram[2])?;
    let seq = u32::from_be_bytes([datagram[3], datagram[4], datagram[5], datagram[6]]);
    Some((kind, seq))
}

// ── Events ───────────────────────────────────────────────────────

/// Outcome of one [`ReliablePeer::service`] call.
#[derive(Debug, PartialEq, Eq)]
pub enum PeerEvent {
    /// Nothing happened within the timeout.
    None,
    /// An in-order data frame arrived.
    Receive(Vec<u8>),
    /// The remote side disconnected.
    Disconnected,
}

/// Raw-datagram hook; `true` means handled (event suppressed).
pub type Intercept = Box<dyn FnMut(&[u8]) -> bool + Send>;

#[derive(Debug, PartialEq, Eq)]
enum PeerState {
    Connected,
    Disconnected,
}

// ── ReliablePeer ─────────────────────────────────────────────────

/// One reliable-ordered UDP peer. Not internally synchronized: the
/// owner serializes access (the control transport wraps it in a
/// mutex shared by its send and receive paths).
pub struct ReliablePeer {
    socket: UdpSocket,
    state: PeerState,

    next_tx_seq: u32,
    unacked: BTreeMap<u32, UnackedFrame>,

    next_rx_seq: u32,
    reordered: BTreeMap<u32, Vec<u8>>,
    ready: VecDeque<PeerEvent>,

    last_recv: Instant,
    idle_timeout: Duration,
    intercept: Option<Intercept>,
}

impl std::fmt::Debug for ReliablePeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReliablePeer")
            .field("socket", &self.socket)
            .field("state", &self.state)
            .field("next_tx_seq", &self.next_tx_seq)
            .field("next_rx_seq", &self.next_rx_seq)
            .field("ready", &self.ready)
            .field("last_recv", &self.last_recv)
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}

#[derive(Debug)]
struct UnackedFrame {
    datagram: Vec<u8>,
    last_sent: Instant,
}

impl ReliablePeer {
    /// Connect to a listening peer, retrying the handshake until
    /// `connect_timeout` elapses.
    pub async fn connect(
        remote: SocketAddr,
        connect_timeout: Duration,
    ) -> Result<Self, VaporError> {
        let bind_addr: SocketAddr = if remote.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(remote).await?;

        let deadline = Instant::now() + connect_timeout;
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            // Handshake I/O errors (e.g. ICMP unreachable surfacing
            // as ECONNREFUSED) are retried until the deadline.
            let _ = socket.send(&encode_frame(FrameKind::Connect, 0, &[])).await;

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(VaporError::ConnectTimeout(connect_timeout));
            }
            let wait = remaining.min(CONNECT_RESEND_INTERVAL);
            match time::timeout(wait, socket.recv(&mut buf)).await {
                Ok(Ok(n)) => {
                    if let Some((FrameKind::ConnectAck, _)) = decode_header(&buf[..n]) {
                        break;
                    }
                }
                Ok(Err(_)) | Err(_) => continue,
            }
        }

        debug!(%remote, "peer connected");
        Ok(Self::from_socket(socket))
    }

    /// Wait on an already-bound socket for one incoming peer. The
    /// server half of the handshake, used by loopback tests and
    /// tooling.
    pub async fn accept(socket: UdpSocket, accept_timeout: Duration) -> Result<Self, VaporError> {
        let deadline = Instant::now() + accept_timeout;
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(VaporError::ConnectTimeout(accept_timeout));
            }
            match time::timeout(remaining, socket.recv_from(&mut buf)).await {
                Ok(Ok((n, from))) => {
                    if let Some((FrameKind::Connect, _)) = decode_header(&buf[..n]) {
                        socket.connect(from).await?;
                        socket
                            .send(&encode_frame(FrameKind::ConnectAck, 0, &[]))
                            .await?;
                        debug!(%from, "peer accepted");
                        return Ok(Self::from_socket(socket));
                    }
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Err(VaporError::ConnectTimeout(accept_timeout)),
            }
        }
    }

    fn from_socket(socket: UdpSocket) -> Self {
        Self {
            socket,
            state: PeerState::Connected,
            next_tx_seq: 0,
            unacked: BTreeMap::new(),
            next_rx_seq: 0,
            reordered: BTreeMap::new(),
            ready: VecDeque::new(),
            last_recv: Instant::now(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            intercept: None,
        }
    }

    /// Replace the idle timeout (time without any inbound datagram
    /// before the peer is declared dead).
    pub fn set_idle_timeout(&mut self, timeout: Duration) {
        self.idle_timeout = timeout;
    }

    /// Install a raw-datagram intercept hook.
    pub fn set_intercept(&mut self, hook: impl FnMut(&[u8]) -> bool + Send + 'static) {
        self.intercept = Some(Box::new(hook));
    }

    /// Remove the intercept hook, letting all frames promote to
    /// events again.
    pub fn clear_intercept(&mut self) {
        self.intercept = None;
    }

    pub fn intercept_installed(&self) -> bool {
        self.intercept.is_some()
    }

    /// Queue a payload for reliable in-order delivery and push it
    /// onto the wire immediately.
    pub async fn send_reliable(&mut self, payload: &[u8]) -> Result<(), VaporError> {
        if self.state == PeerState::Disconnected {
            return Err(VaporError::Disconnected);
        }
        let seq = self.next_tx_seq;
        self.next_tx_seq += 1;

        let datagram = encode_frame(FrameKind::Data, seq, payload);
        self.socket.send(&datagram).await?;
        self.unacked.insert(
            seq,
            UnackedFrame {
                datagram,
                last_sent: Instant::now(),
            },
        );
        Ok(())
    }

    /// Push any overdue retransmissions out now.
    pub async fn flush(&mut self) -> Result<(), VaporError> {
        self.retransmit_due().await
    }

    /// Tell the remote side we are gone, without waiting for an
    /// acknowledgment, so it can clean up for reconnection promptly.
    pub async fn disconnect_now(&mut self) {
        if self.state == PeerState::Connected {
            let _ = self
                .socket
                .send(&encode_frame(FrameKind::Disconnect, 0, &[]))
                .await;
            self.state = PeerState::Disconnected;
        }
    }

    /// Drive the peer: retransmit, then wait up to `service_timeout`
    /// for the next event. A zero timeout polls without blocking.
    pub async fn service(&mut self, service_timeout: Duration) -> Result<PeerEvent, VaporError> {
        self.retransmit_due().await?;

        if let Some(event) = self.ready.pop_front() {
            return Ok(event);
        }
        if self.state == PeerState::Connected && self.last_recv.elapsed() >= self.idle_timeout {
            return Err(VaporError::PeerTimeout(self.idle_timeout));
        }

        let mut buf = [0u8; MAX_DATAGRAM];
        if service_timeout.is_zero() {
            loop {
                match self.socket.try_recv(&mut buf) {
                    Ok(n) => self.process_datagram(&buf[..n]).await?,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(self.ready.pop_front().unwrap_or(PeerEvent::None))
        } else {
            let deadline = time::Instant::now() + service_timeout;
            loop {
                if let Some(event) = self.ready.pop_front() {
                    return Ok(event);
                }
                match time::timeout_at(deadline, self.socket.recv(&mut buf)).await {
                    Ok(Ok(n)) => self.process_datagram(&buf[..n]).await?,
                    Ok(Err(e)) => return Err(e.into()),
                    Err(_) => return Ok(PeerEvent::None),
                }
            }
        }
    }

    // ── Internal ─────────────────────────────────────────────────

    async fn retransmit_due(&mut self) -> Result<(), VaporError> {
        let now = Instant::now();
        for frame in self.unacked.values_mut() {
            if now.duration_since(frame.last_sent) >= RETRANSMIT_INTERVAL {
                self.socket.send(&frame.datagram).await?;
                frame.last_sent = now;
            }
        }
        Ok(())
    }

    async fn process_datagram(&mut self, datagram: &[u8]) -> Result<(), VaporError> {
        let Some((kind, seq)) = decode_header(datagram) else {
            trace!(len = datagram.len(), "ignoring malformed datagram");
            return Ok(());
        };
        self.last_recv = Instant::now();

        if let Some(hook) = self.intercept.as_mut() {
            if hook(datagram) {
                trace!(?kind, "datagram intercepted");
                return Ok(());
            }
        }

        match kind {
            FrameKind::Connect => {
                // Duplicate handshake from the remote: re-ack it.
                self.socket
                    .send(&encode_frame(FrameKind::ConnectAck, 0, &[]))
                    .await?;
            }
            FrameKind::ConnectAck => {}
            FrameKind::Data => {
                self.socket
                    .send(&encode_frame(FrameKind::Ack, seq, &[]))
                    .await?;
                let payload = &datagram[HEADER_LENGTH..];
                if seq == self.next_rx_seq {
                    self.next_rx_seq += 1;
                    self.ready.push_back(PeerEvent::Receive(payload.to_vec()));
                    while let Some(buffered) = self.reordered.remove(&self.next_rx_seq) {
                        self.next_rx_seq += 1;
                        self.ready.push_back(PeerEvent::Receive(buffered));
                    }
                } else if seq > self.next_rx_seq {
                    self.reordered.entry(seq).or_insert_with(|| payload.to_vec());
                }
                // Below next_rx_seq: duplicate of a delivered frame,
                // already re-acked above.
            }
            FrameKind::Ack => {
                self.unacked.remove(&seq);
            }
            FrameKind::Disconnect => {
                debug!("peer disconnect command received");
                self.state = PeerState::Disconnected;
                self.ready.push_back(PeerEvent::Disconnected);
            }
        }
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────
