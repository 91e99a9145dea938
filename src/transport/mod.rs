//! Control-channel transport adapter.
//!
//! Pre-Gen5 servers speak a plain TCP stream; Gen5+ servers speak the
//! reliable-UDP peer. The adapter hides the difference behind one
//! send/receive surface and owns the serialization policy: in peer
//! mode the peer, the outgoing envelope sequence counter, and the
//! cipher all sit behind a single mutex, so the receive worker and
//! any number of senders never touch the socket concurrently and
//! sequence numbers hit the wire in allocation order.

pub mod peer;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time;
use tracing::debug;

use crate::crypto::ControlCodec;
use crate::error::VaporError;
use peer::{datagram_kind, FrameKind, PeerEvent, ReliablePeer};

/// Connect deadline for both transport modes.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ── ControlTransport ─────────────────────────────────────────────

/// Uniform send/receive over TCP or the reliable peer.
pub struct ControlTransport {
    mode: Mode,
}

enum Mode {
    Tcp {
        stream: Mutex<TcpStream>,
    },
    Peer {
        shared: Mutex<PeerShared>,
        disconnect_pending: Arc<AtomicBool>,
    },
}

struct PeerShared {
    peer: ReliablePeer,
    /// Next control envelope sequence number. Allocated while the
    /// peer lock is held so observed wire order is strictly
    /// increasing.
    next_seq: u32,
}

impl ControlTransport {
    /// Open the legacy TCP control stream.
    pub async fn connect_tcp(
        host: std::net::IpAddr,
        port: u16,
        connect_timeout: Duration,
    ) -> Result<Self, VaporError> {
        let stream = time::timeout(connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| VaporError::ConnectTimeout(connect_timeout))??;
        stream.set_nodelay(true)?;
        debug!(%host, port, "control TCP connected");
        Ok(Self {
            mode: Mode::Tcp {
                stream: Mutex::new(stream),
            },
        })
    }

    /// Open the reliable peer and install the disconnect intercept.
    pub async fn connect_peer(
        host: std::net::IpAddr,
        port: u16,
        connect_timeout: Duration,
    ) -> Result<Self, VaporError> {
        let mut peer = ReliablePeer::connect((host, port).into(), connect_timeout).await?;
        peer.set_idle_timeout(peer::DEFAULT_IDLE_TIMEOUT);

        // Disconnect commands are recorded and suppressed so already
        // received frames can still drain before teardown.
        let disconnect_pending = Arc::new(AtomicBool::new(false));
        let pending = Arc::clone(&disconnect_pending);
        peer.set_intercept(move |datagram| {
            if datagram_kind(datagram) == Some(FrameKind::Disconnect) {
                debug!("peer disconnect event pending");
                pending.store(true, Ordering::SeqCst);
                true
            } else {
                false
            }
        });

        Ok(Self {
            mode: Mode::Peer {
                shared: Mutex::new(PeerShared { peer, next_seq: 0 }),
                disconnect_pending,
            },
        })
    }

    /// Send-and-discard-reply reads a response on TCP but not on the
    /// peer.
    pub fn requires_reply_drain(&self) -> bool {
        matches!(self.mode, Mode::Tcp { .. })
    }

    pub fn is_peer(&self) -> bool {
        matches!(self.mode, Mode::Peer { .. })
    }

    /// Whether the intercept has seen a disconnect command.
    pub fn disconnect_pending(&self) -> bool {
        match &self.mode {
            Mode::Tcp { .. } => false,
            Mode::Peer {
                disconnect_pending, ..
            } => disconnect_pending.load(Ordering::SeqCst),
        }
    }

    /// Send one control message. With a codec the message is sealed
    /// into an encrypted envelope whose sequence number is allocated
    /// under the peer lock; without one it goes out as a plaintext V1
    /// (peer) or TCP frame.
    pub async fn send_message(
        &self,
        packet_type: u16,
        payload: &[u8],
        codec: Option<&ControlCodec>,
    ) -> Result<(), VaporError> {
        match &self.mode {
            Mode::Tcp { stream } => {
                let mut frame = Vec::with_capacity(4 + payload.len());
                frame.extend_from_slice(&packet_type.to_le_bytes());
                frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
                frame.extend_from_slice(payload);

                let mut stream = stream.lock().await;
                stream.write_all(&frame).await?;
                Ok(())
            }
            Mode::Peer { shared, .. } => {
                let mut shared = shared.lock().await;
                let frame = match codec {
                    Some(codec) => {
                        let seq = shared.next_seq;
                        shared.next_seq += 1;
                        codec.encrypt_frame(seq, packet_type, payload)?
                    }
                    None => {
                        let mut frame = Vec::with_capacity(2 + payload.len());
                        frame.extend_from_slice(&packet_type.to_le_bytes());
                        frame.extend_from_slice(payload);
                        frame
                    }
                };
                shared.peer.send_reliable(&frame).await?;
                shared.peer.flush().await
            }
        }
    }

    /// Read and discard one TCP reply. No-op in peer mode.
    pub async fn drain_reply(&self) -> Result<(), VaporError> {
        match &self.mode {
            Mode::Tcp { stream } => {
                let mut stream = stream.lock().await;
                let mut header = [0u8; 4];
                stream.read_exact(&mut header).await?;
                let payload_len = u16::from_le_bytes([header[2], header[3]]) as usize;
                if payload_len > 0 {
                    let mut payload = vec![0u8; payload_len];
                    stream.read_exact(&mut payload).await?;
                }
                Ok(())
            }
            Mode::Peer { .. } => Ok(()),
        }
    }

    /// Drive the peer under the adapter lock. TCP mode has no events
    /// to service and reports none.
    pub async fn service(&self, timeout: Duration) -> Result<PeerEvent, VaporError> {
        match &self.mode {
            Mode::Tcp { .. } => Ok(PeerEvent::None),
            Mode::Peer { shared, .. } => shared.lock().await.peer.service(timeout).await,
        }
    }

    pub async fn intercept_installed(&self) -> bool {
        match &self.mode {
            Mode::Tcp { .. } => false,
            Mode::Peer { shared, .. } => shared.lock().await.peer.intercept_installed(),
        }
    }

    /// Drop the intercept so the server's disconnect can finally be
    /// processed as a normal event.
    pub async fn clear_intercept(&self) {
        if let Mode::Peer { shared, .. } = &self.mode {
            shared.lock().await.peer.clear_intercept();
        }
    }

    /// Terminate the peer immediately so the server learns of our
    /// departure without waiting for a timeout. TCP sockets just
    /// close on drop.
    pub async fn disconnect_now(&self) {
        if let Mode::Peer { shared, .. } = &self.mode {
            shared.lock().await.peer.disconnect_now().await;
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, UdpSocket};

    #[tokio::test]
    async fn tcp_send_frames_type_and_length() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let transport =
            ControlTransport::connect_tcp(addr.ip(), addr.port(), Duration::from_secs(5))
                .await
                .unwrap();
        assert!(transport.requires_reply_drain());

        let (mut server, _) = listener.accept().await.unwrap();
        transport
            .send_message(0x1407, &[0, 0], None)
            .await
            .unwrap();

        let mut frame = [0u8; 6];
        server.read_exact(&mut frame).await.unwrap();
        assert_eq!(frame, [0x07, 0x14, 0x02, 0x00, 0x00, 0x00]);
    }

    #[tokio::test]
    async fn peer_sends_are_sequenced_under_the_lock() {
        let server_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server_sock.local_addr().unwrap();
        let accept = tokio::spawn(ReliablePeer::accept(server_sock, Duration::from_secs(5)));

        let transport = ControlTransport::connect_peer(
            server_addr.ip(),
            server_addr.port(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert!(!transport.requires_reply_drain());
        let mut server = accept.await.unwrap().unwrap();

        let key = [7u8; 16];
        let codec = ControlCodec::new(&key);
        for _ in 0..5 {
            transport
                .send_message(0x0206, &[1, 2, 3], Some(&codec))
                .await
                .unwrap();
        }

        let mut seen = Vec::new();
        while seen.len() < 5 {
            match server.service(Duration::from_millis(100)).await.unwrap() {
                PeerEvent::Receive(frame) => {
                    seen.push(u32::from_le_bytes(frame[4..8].try_into().unwrap()));
                }
                PeerEvent::None => {}
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }
}
