//! Control session state machine.
//!
//! Owns the control transport and drives three workers for the life
//! of the stream:
//!
//! - **Receive** polls the peer, decrypts inbound envelopes, and
//!   dispatches server events (rumble, termination). It also runs the
//!   staged drain that works around data loss on pending disconnects.
//! - **Telemetry** sends either the fixed periodic ping or the
//!   loss-stats report, fire-and-forget.
//! - **Invalidation** coalesces queued reference-frame ranges into
//!   one request, escalating to an IDR-frame request when the queue
//!   overflows or the decoder demands one.
//!
//! The workers are tokio tasks cancelled cooperatively; teardown
//! joins all three before the peer is disconnected. Exactly one
//! terminal callback is ever delivered.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::BufMut;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{SessionListener, StreamConfig, TerminationReason};
use crate::crypto::{ControlCodec, ENCRYPTED_HEADER_TYPE};
use crate::error::VaporError;
use crate::profile::{MessageIndex, ProtocolProfile, IDX_REQUEST_IDR_FRAME};
use crate::quality::QualityMonitor;
use crate::queue::BoundedQueue;
use crate::transport::peer::PeerEvent;
use crate::transport::{ControlTransport, CONNECT_TIMEOUT};

const LOSS_REPORT_INTERVAL: Duration = Duration::from_millis(50);
const PERIODIC_PING_INTERVAL: Duration = Duration::from_millis(250);
/// Message type of the fixed periodic ping (not in the profile table).
const PERIODIC_PING_TYPE: u16 = 0x0200;
/// Poll cadence of the receive worker. This sleep is the floor on
/// retransmit latency after a loss event, so it stays small.
const RECEIVE_POLL_SLEEP: Duration = Duration::from_millis(10);
/// Window for pending receives to drain after a disconnect command.
const DISCONNECT_DRAIN_TIMEOUT: Duration = Duration::from_millis(100);
/// Window for the server's disconnect to be retransmitted once the
/// intercept is gone.
const DISCONNECT_WAIT_TIMEOUT: Duration = Duration::from_millis(1000);
const INVALIDATION_QUEUE_BOUND: usize = 20;
/// An IDR fallback invalidates this many frames behind the last seen.
const IDR_BACKTRACK_FRAMES: u32 = 0x20;

/// Expected graceful server close (server-terminated-closed HRESULT).
const TERMINATION_GRACEFUL_HRESULT: u32 = 0x8003_0023;
/// Stream refused because protected content was on screen.
const TERMINATION_PROTECTED_HRESULT: u32 = 0x800e_9302;
/// Pre-HRESULT "server terminated intentionally" reason code.
const TERMINATION_GRACEFUL_LEGACY: u16 = 0x0100;

// ── FrameRange ───────────────────────────────────────────────────

/// Inclusive range of frames to invalidate. `start <= end` always.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRange {
    pub start: u32,
    pub end: u32,
}

// ── ControlSession ───────────────────────────────────────────────

/// A live control channel to the streaming server.
///
/// At most one session exists per stream; the orchestrator owns it
/// and shares it (behind an `Arc`) with the input pipeline and the
/// video depacketizer callbacks.
pub struct ControlSession {
    inner: Arc<SessionInner>,
    workers: StdMutex<Vec<JoinHandle<()>>>,
}

struct SessionInner {
    profile: ProtocolProfile,
    transport: ControlTransport,
    /// Present only when the whole control stream is encrypted.
    codec: Option<ControlCodec>,
    listener: Arc<dyn SessionListener>,

    cancel: CancellationToken,
    stopping: AtomicBool,
    terminated: AtomicBool,

    idr_required: AtomicBool,
    invalidations: BoundedQueue<FrameRange>,
    invalidate_event: Notify,

    quality: StdMutex<QualityMonitor>,
}

impl ControlSession {
    /// Connect the control channel and run the handshake.
    ///
    /// On failure every worker already started is cancelled and
    /// joined before the transport is torn down.
    pub async fn start(
        config: &StreamConfig,
        listener: Arc<dyn SessionListener>,
    ) -> Result<Self, VaporError> {
        let profile = ProtocolProfile::for_version(config.app_version);
        info!(version = %config.app_version, generation = ?profile.generation, "starting control stream");

        let transport = if profile.uses_reliable_udp {
            ControlTransport::connect_peer(config.host, config.peer_port, CONNECT_TIMEOUT).await?
        } else {
            ControlTransport::connect_tcp(config.host, config.control_port, CONNECT_TIMEOUT)
                .await?
        };

        let codec = profile
            .encrypted_control_stream
            .then(|| ControlCodec::new(&config.remote_input_aes_key));

        let inner = Arc::new(SessionInner {
            profile,
            transport,
            codec,
            listener,
            cancel: CancellationToken::new(),
            stopping: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            idr_required: AtomicBool::new(false),
            invalidations: BoundedQueue::new(INVALIDATION_QUEUE_BOUND),
            invalidate_event: Notify::new(),
            quality: StdMutex::new(QualityMonitor::new()),
        });

        let receive = tokio::spawn(receive_worker(Arc::clone(&inner)));

        for idx in [MessageIndex::StartA, MessageIndex::StartB] {
            let body = inner.profile.preconstructed(idx).unwrap_or(&[]);
            if let Err(e) = inner.send_and_discard_reply(idx, body).await {
                warn!(?idx, "handshake failed: {e}");
                inner.stopping.store(true, Ordering::SeqCst);
                inner.cancel.cancel();
                let _ = receive.await;
                inner.transport.disconnect_now().await;
                return Err(e);
            }
        }

        let telemetry = tokio::spawn(telemetry_worker(Arc::clone(&inner)));
        let invalidation = tokio::spawn(invalidation_worker(Arc::clone(&inner)));

        Ok(Self {
            workers: StdMutex::new(vec![receive, telemetry, invalidation]),
            inner,
        })
    }

    /// Stop the session: interrupt and join every worker, then
    /// disconnect the peer so the server learns of our departure
    /// immediately.
    pub async fn stop(&self) {
        self.inner.stopping.store(true, Ordering::SeqCst);
        self.inner.invalidations.shutdown();
        self.inner.invalidate_event.notify_one();
        self.inner.cancel.cancel();

        let workers: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
        for handle in workers {
            let _ = handle.await;
        }

        self.inner.transport.disconnect_now().await;
        debug!("control stream stopped");
    }

    // ── Video pipeline feedback ──────────────────────────────────

    /// A frame was fully assembled.
    pub fn connection_received_complete_frame(&self, frame_index: u32) {
        self.inner
            .quality
            .lock()
            .unwrap()
            .received_complete_frame(frame_index);
    }

    /// A frame header was observed; may emit a quality transition.
    pub fn connection_saw_frame(&self, frame_index: u32) {
        let transition = self.inner.quality.lock().unwrap().saw_frame(frame_index);
        if let Some(status) = transition {
            info!(?status, "connection status changed");
            self.inner.listener.connection_status_update(status);
        }
    }

    /// Packets `last + 1 .. next` were lost on the video stream.
    pub fn connection_lost_packets(&self, last_received: u32, next_received: u32) {
        self.inner
            .quality
            .lock()
            .unwrap()
            .add_lost_packets(last_received, next_received);
    }

    /// Frames `start..=end` are unusable as references. Queue an
    /// invalidation; a full queue escalates to a forced IDR frame.
    pub fn connection_detected_frame_loss(&self, start_frame: u32, end_frame: u32) {
        debug_assert!(start_frame <= end_frame);
        if self
            .inner
            .invalidations
            .offer(FrameRange {
                start: start_frame,
                end: end_frame,
            })
            .is_err()
        {
            // Too many pending ranges; only a fresh IDR frame can
            // recover the reference state now.
            self.inner.idr_required.store(true, Ordering::SeqCst);
        }
        self.inner.invalidate_event.notify_one();
    }

    /// The decoder needs a keyframe regardless of loss state.
    pub fn request_idr_on_demand(&self) {
        self.inner.idr_required.store(true, Ordering::SeqCst);
        self.inner.invalidate_event.notify_one();
    }

    /// Forward input bytes as an InputData control message. Used by
    /// the input pipeline on Gen5+ profiles.
    pub(crate) async fn send_input_packet(&self, data: &[u8]) -> Result<(), VaporError> {
        self.inner.send_and_forget(MessageIndex::InputData, data).await
    }

    /// Report a transport-level failure observed outside this
    /// session's own workers (the input pipeline's send path). The
    /// terminal callback still fires at most once.
    pub(crate) fn notify_transport_failure(&self) {
        self.inner.emit_terminated(TerminationReason::Transport(-1));
    }
}

impl SessionInner {
    /// Deliver the terminal callback exactly once.
    fn emit_terminated(&self, reason: TerminationReason) {
        if !self.terminated.swap(true, Ordering::SeqCst) {
            info!(?reason, "connection terminated");
            self.listener.connection_terminated(reason);
        }
    }

    async fn send_and_forget(&self, idx: MessageIndex, payload: &[u8]) -> Result<(), VaporError> {
        let code = self.profile.code(idx).ok_or(VaporError::UnsupportedMessage)?;
        self.transport
            .send_message(code, payload, self.codec.as_ref())
            .await
    }

    async fn send_and_discard_reply(
        &self,
        idx: MessageIndex,
        payload: &[u8],
    ) -> Result<(), VaporError> {
        self.send_and_forget(idx, payload).await?;
        if self.transport.requires_reply_drain() {
            self.transport.drain_reply().await?;
        }
        Ok(())
    }
}

// ── Receive worker ───────────────────────────────────────────────

async fn receive_worker(inner: Arc<SessionInner>) {
    // Only the peer transport delivers server events; the TCP control
    // stream is strictly request/reply.
    if !inner.transport.is_peer() {
        return;
    }

    loop {
        if inner.cancel.is_cancelled() {
            return;
        }

        match inner.transport.service(Duration::ZERO).await {
            Ok(PeerEvent::None) => {
                if inner.transport.disconnect_pending() {
                    // A disconnect command was intercepted. Give
                    // pending receives a short drain window, then
                    // drop the intercept and wait for the server's
                    // disconnect to be retransmitted and processed.
                    let intercepted = inner.transport.intercept_installed().await;
                    let timeout = if intercepted {
                        DISCONNECT_DRAIN_TIMEOUT
                    } else {
                        DISCONNECT_WAIT_TIMEOUT
                    };
                    match inner.transport.service(timeout).await {
                        Ok(PeerEvent::None) => {
                            if intercepted {
                                inner.transport.clear_intercept().await;
                                continue;
                            }
                            // No disconnect retransmission either;
                            // assume the server died.
                            warn!("disconnect event timeout expired");
                            inner.emit_terminated(TerminationReason::Transport(-1));
                            return;
                        }
                        Ok(event) => {
                            if handle_event(&inner, event) {
                                return;
                            }
                        }
                        Err(e) => {
                            warn!("control stream connection failed: {e}");
                            inner.emit_terminated(TerminationReason::Transport(-1));
                            return;
                        }
                    }
                } else {
                    tokio::select! {
                        _ = inner.cancel.cancelled() => return,
                        _ = time::sleep(RECEIVE_POLL_SLEEP) => {}
                    }
                }
            }
            Ok(event) => {
                if handle_event(&inner, event) {
                    return;
                }
            }
            Err(e) => {
                warn!("control stream connection failed: {e}");
                inner.emit_terminated(TerminationReason::Transport(-1));
                return;
            }
        }
    }
}

/// Returns `true` when the worker should exit.
fn handle_event(inner: &SessionInner, event: PeerEvent) -> bool {
    match event {
        PeerEvent::Receive(packet) => handle_packet(inner, &packet),
        PeerEvent::Disconnected => {
            warn!("control stream received unexpected disconnect event");
            inner.emit_terminated(TerminationReason::Transport(-1));
            true
        }
        PeerEvent::None => false,
    }
}

/// Decrypt (if negotiated) and dispatch one inbound control packet.
/// Returns `true` when the session is over.
fn handle_packet(inner: &SessionInner, packet: &[u8]) -> bool {
    if packet.len() < 2 {
        warn!(len = packet.len(), "discarding runt control packet");
        return false;
    }

    let decrypted;
    let v1: &[u8] = if let Some(codec) = &inner.codec {
        let outer_type = u16::from_le_bytes([packet[0], packet[1]]);
        if outer_type != ENCRYPTED_HEADER_TYPE {
            warn!(outer_type, "dropping plaintext packet on encrypted control stream");
            return false;
        }
        match codec.decrypt_frame_to_v1(packet) {
            Ok(plaintext) => {
                decrypted = plaintext;
                &decrypted
            }
            Err(VaporError::Runt { actual, min }) => {
                warn!(actual, min, "discarding runt encrypted control packet");
                return false;
            }
            Err(e) => {
                warn!(len = packet.len(), "failed to decrypt control packet: {e}");
                return false;
            }
        }
    } else {
        packet
    };

    let packet_type = u16::from_le_bytes([v1[0], v1[1]]);
    let payload = &v1[2..];

    if Some(packet_type) == inner.profile.code(MessageIndex::RumbleData) {
        // Four bytes of padding precede the rumble triple.
        if payload.len() < 10 {
            warn!(len = payload.len(), "discarding runt rumble packet");
            return false;
        }
        let controller_number = u16::from_le_bytes([payload[4], payload[5]]);
        let low_freq = u16::from_le_bytes([payload[6], payload[7]]);
        let high_freq = u16::from_le_bytes([payload[8], payload[9]]);
        inner
            .listener
            .rumble(controller_number, low_freq, high_freq);
        false
    } else if Some(packet_type) == inner.profile.code(MessageIndex::Termination) {
        let any_frame_seen = inner.quality.lock().unwrap().last_seen_frame() != 0;
        let reason = map_termination(v1, any_frame_seen);
        // The termination message is reliable enough to end the
        // stream now; waiting for a disconnect event can block for
        // another ten seconds on current servers.
        inner.emit_terminated(reason);
        true
    } else {
        false
    }
}

/// Map a termination packet (V1 header included) to a listener
/// reason. Packets of 6+ bytes carry a big-endian HRESULT, shorter
/// ones a legacy little-endian reason code.
fn map_termination(packet: &[u8], any_frame_seen: bool) -> TerminationReason {
    let graceful = |seen: bool| {
        if seen {
            TerminationReason::Graceful
        } else {
            // Nothing was ever streamed; the server most likely hit
            // an error before sending the first frame.
            TerminationReason::UnexpectedEarly
        }
    };

    if packet.len() >= 6 {
        let code = u32::from_be_bytes([packet[2], packet[3], packet[4], packet[5]]);
        info!(code = format_args!("{code:#010x}"), "server notified termination reason");
        match code {
            TERMINATION_GRACEFUL_HRESULT => graceful(any_frame_seen),
            TERMINATION_PROTECTED_HRESULT => TerminationReason::ProtectedContent,
            other => TerminationReason::Server(other),
        }
    } else if packet.len() >= 4 {
        let reason = u16::from_le_bytes([packet[2], packet[3]]);
        info!(reason = format_args!("{reason:#06x}"), "server notified termination reason");
        if reason == TERMINATION_GRACEFUL_LEGACY {
            graceful(any_frame_seen)
        } else {
            TerminationReason::Server(reason as u32)
        }
    } else {
        warn!(len = packet.len(), "termination packet carried no reason");
        TerminationReason::Server(0)
    }
}

// ── Telemetry worker ─────────────────────────────────────────────

async fn telemetry_worker(inner: Arc<SessionInner>) {
    if inner.profile.use_periodic_ping {
        // [payload length = 4 u16 LE][timestamp = 0 u32 LE][padding]
        let mut payload = [0u8; 8];
        payload[0] = 4;

        loop {
            if let Err(e) = inner
                .transport
                .send_message(PERIODIC_PING_TYPE, &payload, inner.codec.as_ref())
                .await
            {
                warn!("periodic ping failed: {e}");
                inner.emit_terminated(TerminationReason::Transport(-1));
                return;
            }
            tokio::select! {
                _ = inner.cancel.cancelled() => return,
                _ = time::sleep(PERIODIC_PING_INTERVAL) => {}
            }
        }
    } else {
        loop {
            let (loss_count, last_good_frame) = {
                let mut quality = inner.quality.lock().unwrap();
                (quality.take_loss_count(), quality.last_good_frame())
            };
            let payload = build_loss_stats(loss_count, last_good_frame);

            if let Err(e) = inner.send_and_forget(MessageIndex::LossStats, &payload).await {
                warn!("loss stats send failed: {e}");
                inner.emit_terminated(TerminationReason::Transport(-1));
                return;
            }
            tokio::select! {
                _ = inner.cancel.cancelled() => return,
                _ = time::sleep(LOSS_REPORT_INTERVAL) => {}
            }
        }
    }
}

/// 32-byte little-endian loss report.
fn build_loss_stats(loss_count: u32, last_good_frame: u32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(32);
    payload.put_u32_le(loss_count);
    payload.put_u32_le(LOSS_REPORT_INTERVAL.as_millis() as u32);
    payload.put_u32_le(1000);
    payload.put_u64_le(last_good_frame as u64);
    payload.put_u32_le(0);
    payload.put_u32_le(0);
    payload.put_u32_le(0x14);
    payload
}

// ── Invalidation worker ──────────────────────────────────────────

async fn invalidation_worker(inner: Arc<SessionInner>) {
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => return,
            _ = inner.invalidate_event.notified() => {}
        }
        if inner.stopping.load(Ordering::SeqCst) {
            return;
        }

        if inner.idr_required.load(Ordering::SeqCst) {
            // Pending ranges are moot once a whole keyframe is coming.
            while inner.invalidations.poll().is_some() {}
            inner.idr_required.store(false, Ordering::SeqCst);

            if let Err(e) = request_idr_frame(&inner).await {
                warn!("IDR frame request failed: {e}");
                inner.emit_terminated(TerminationReason::Transport(-1));
                return;
            }
        } else if let Some(mut range) = inner.invalidations.poll() {
            // Aggregate every queued range into one request. Ranges
            // arrive in frame order, so the end only ever extends.
            while let Some(next) = inner.invalidations.poll() {
                debug_assert!(next.end >= range.end);
                range.end = next.end;
            }

            if let Err(e) = send_invalidate_ref_frames(&inner, range).await {
                warn!("invalidate reference frames failed: {e}");
                inner.emit_terminated(TerminationReason::Transport(-1));
                return;
            }
            info!(start = range.start, end = range.end, "invalidate reference frame request sent");
        }
    }
}

async fn request_idr_frame(inner: &SessionInner) -> Result<(), VaporError> {
    if inner.profile.uses_reliable_udp {
        // Gen5+ has no dedicated IDR request; invalidating the last
        // 32 frames forces one.
        let last_seen = inner.quality.lock().unwrap().last_seen_frame();
        send_invalidate_ref_frames(
            inner,
            FrameRange {
                start: last_seen.saturating_sub(IDR_BACKTRACK_FRAMES),
                end: last_seen,
            },
        )
        .await?;
    } else {
        let body = inner
            .profile
            .preconstructed(IDX_REQUEST_IDR_FRAME)
            .unwrap_or(&[]);
        inner.send_and_discard_reply(IDX_REQUEST_IDR_FRAME, body).await?;
    }
    info!("IDR frame request sent");
    Ok(())
}

async fn send_invalidate_ref_frames(
    inner: &SessionInner,
    range: FrameRange,
) -> Result<(), VaporError> {
    // Frame fields are big-endian u64s; the third word is reserved.
    let mut payload = Vec::with_capacity(24);
    payload.put_u64(range.start as u64);
    payload.put_u64(range.end as u64);
    payload.put_u64(0);
    inner
        .send_and_discard_reply(MessageIndex::InvalidateRefFrames, &payload)
        .await
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn termination_hresult_mapping() {
        let mut packet = vec![0x09, 0x01]; // type
        packet.extend_from_slice(&0x8003_0023u32.to_be_bytes());

        assert_eq!(
            map_termination(&packet, true),
            TerminationReason::Graceful
        );
        assert_eq!(
            map_termination(&packet, false),
            TerminationReason::UnexpectedEarly
        );

        let mut packet = vec![0x09, 0x01];
        packet.extend_from_slice(&0x800e_9302u32.to_be_bytes());
        assert_eq!(
            map_termination(&packet, true),
            TerminationReason::ProtectedContent
        );

        let mut packet = vec![0x09, 0x01];
        packet.extend_from_slice(&0x1234_5678u32.to_be_bytes());
        assert_eq!(
            map_termination(&packet, true),
            TerminationReason::Server(0x1234_5678)
        );
    }

    #[test]
    fn termination_legacy_mapping() {
        let mut packet = vec![0x00, 0x01];
        packet.extend_from_slice(&0x0100u16.to_le_bytes());
        assert_eq!(map_termination(&packet, true), TerminationReason::Graceful);
        assert_eq!(
            map_termination(&packet, false),
            TerminationReason::UnexpectedEarly
        );

        let mut packet = vec![0x00, 0x01];
        packet.extend_from_slice(&0x0200u16.to_le_bytes());
        assert_eq!(
            map_termination(&packet, true),
            TerminationReason::Server(0x0200)
        );
    }

    #[test]
    fn loss_stats_layout() {
        let payload = build_loss_stats(147, 5000);
        assert_eq!(payload.len(), 32);
        assert_eq!(u32::from_le_bytes(payload[0..4].try_into().unwrap()), 147);
        assert_eq!(u32::from_le_bytes(payload[4..8].try_into().unwrap()), 50);
        assert_eq!(u32::from_le_bytes(payload[8..12].try_into().unwrap()), 1000);
        assert_eq!(
            u64::from_le_bytes(payload[12..20].try_into().unwrap()),
            5000
        );
        assert_eq!(
            u32::from_le_bytes(payload[28..32].try_into().unwrap()),
            0x14
        );
    }
}
