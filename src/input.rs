//! Input pipeline: queueing, coalescing, and dispatch of user input.
//!
//! Callers enqueue keyboard, mouse, controller, scroll, and haptics
//! events; a single worker drains the bounded queue, coalesces bursts
//! (gamepad states, mouse deltas, pointer positions), seals packets
//! with the negotiated input cipher where the dialect demands it, and
//! routes the result to the control channel or the dedicated legacy
//! input socket.
//!
//! Packet bodies use the server's mixed byte order: the leading
//! packet type and most header fields are big-endian, while the
//! legacy magic words travel in little-endian host order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::BufMut;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::StreamConfig;
use crate::control::ControlSession;
use crate::crypto::InputEncryptor;
use crate::error::VaporError;
use crate::profile::{Generation, ProtocolProfile};
use crate::queue::BoundedQueue;

const INPUT_QUEUE_BOUND: usize = 30;
const INPUT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ── Wire constants ───────────────────────────────────────────────

const PACKET_TYPE_KEYBOARD: u32 = 0x0a03;
const PACKET_TYPE_REL_MOUSE_MOVE: u32 = 0x08;
const PACKET_TYPE_ABS_MOUSE_MOVE: u32 = 0x0e;
const PACKET_TYPE_MOUSE_BUTTON: u32 = 0x05;
const PACKET_TYPE_SCROLL: u32 = 0x0a;
const PACKET_TYPE_CONTROLLER: u32 = 0x18;
const PACKET_TYPE_MULTI_CONTROLLER: u32 = 0x1e;
const PACKET_TYPE_HAPTICS: u32 = 0x0d;

const MOUSE_MOVE_REL_MAGIC: u16 = 0x06;
const MOUSE_MOVE_ABS_MAGIC: u16 = 0x05;
const SCROLL_MAGIC: u16 = 0x09;

const C_HEADER_A: u32 = 0x0a;
const C_HEADER_B: u16 = 0x0000;
const C_TAIL_A: u32 = 0x9c;
const C_TAIL_B: u16 = 0x0055;

const MC_HEADER_A: u32 = 0x1e;
const MC_HEADER_B: u16 = 0x0000;
const MC_MID_B: u16 = 0x0014;
const MC_TAIL_A: u32 = 0x9c;
const MC_TAIL_B: u16 = 0x0055;

const H_MAGIC_A: u16 = 0x0d;
const H_MAGIC_B: u16 = 0x00;

/// Key action byte for a press.
pub const KEY_ACTION_DOWN: u8 = 0x03;
/// Key action byte for a release.
pub const KEY_ACTION_UP: u8 = 0x04;
/// Mouse button action byte for a press.
pub const BUTTON_ACTION_PRESS: u8 = 0x07;
/// Mouse button action byte for a release.
pub const BUTTON_ACTION_RELEASE: u8 = 0x08;

/// Keyboard modifier flag bits.
pub mod key_modifier {
    pub const SHIFT: u8 = 0x01;
    pub const CTRL: u8 = 0x02;
    pub const ALT: u8 = 0x04;
    pub const META: u8 = 0x08;
}

// ── InputPacket ──────────────────────────────────────────────────

/// One queued input event, held in host order until encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum InputPacket {
    Keyboard {
        action: u8,
        key_code: u16,
        modifiers: u8,
    },
    MouseMoveRel {
        delta_x: i16,
        delta_y: i16,
    },
    MouseMoveAbs {
        x: i16,
        y: i16,
        width: i16,
        height: i16,
    },
    MouseButton {
        action: u8,
        button: u32,
    },
    Controller {
        button_flags: u16,
        left_trigger: u8,
        right_trigger: u8,
        left_stick_x: i16,
        left_stick_y: i16,
        right_stick_x: i16,
        right_stick_y: i16,
    },
    MultiController {
        controller_number: u16,
        active_gamepad_mask: u16,
        button_flags: u16,
        left_trigger: u8,
        right_trigger: u8,
        left_stick_x: i16,
        left_stick_y: i16,
        right_stick_x: i16,
        right_stick_y: i16,
    },
    Scroll {
        amount: i16,
    },
    Haptics,
}

impl InputPacket {
    /// Serialize to the wire body, applying the dialect's magic
    /// number adjustments.
    pub(crate) fn encode(&self, profile: &ProtocolProfile) -> Vec<u8> {
        let gen5_plus = profile.uses_reliable_udp;
        let mut buf = Vec::with_capacity(34);
        match *self {
            InputPacket::Keyboard {
                action,
                key_code,
                modifiers,
            } => {
                buf.put_u32(PACKET_TYPE_KEYBOARD);
                buf.put_u8(action);
                buf.put_u32(0);
                buf.extend_from_slice(&key_code.to_le_bytes());
                buf.put_u8(modifiers);
                buf.put_u16(0);
            }
            InputPacket::MouseMoveRel { delta_x, delta_y } => {
                let magic = MOUSE_MOVE_REL_MAGIC + u16::from(gen5_plus);
                buf.put_u32(PACKET_TYPE_REL_MOUSE_MOVE);
                buf.extend_from_slice(&magic.to_le_bytes());
                buf.put_i16(delta_x);
                buf.put_i16(delta_y);
            }
            InputPacket::MouseMoveAbs {
                x,
                y,
                width,
                height,
            } => {
                buf.put_u32(PACKET_TYPE_ABS_MOUSE_MOVE);
                buf.extend_from_slice(&MOUSE_MOVE_ABS_MAGIC.to_le_bytes());
                buf.put_i16(x);
                buf.put_i16(y);
                buf.put_u16(0);
                buf.put_i16(width);
                buf.put_i16(height);
            }
            InputPacket::MouseButton { action, button } => {
                buf.put_u32(PACKET_TYPE_MOUSE_BUTTON);
                buf.put_u8(action + u8::from(gen5_plus));
                buf.put_u32(button);
            }
            InputPacket::Controller {
                button_flags,
                left_trigger,
                right_trigger,
                left_stick_x,
                left_stick_y,
                right_stick_x,
                right_stick_y,
            } => {
                buf.put_u32(PACKET_TYPE_CONTROLLER);
                buf.put_u32(C_HEADER_A);
                buf.put_u16(C_HEADER_B);
                buf.put_u16(button_flags);
                buf.put_u8(left_trigger);
                buf.put_u8(right_trigger);
                buf.put_i16(left_stick_x);
                buf.put_i16(left_stick_y);
                buf.put_i16(right_stick_x);
                buf.put_i16(right_stick_y);
                buf.put_u32(C_TAIL_A);
                buf.put_u16(C_TAIL_B);
            }
            InputPacket::MultiController {
                controller_number,
                active_gamepad_mask,
                button_flags,
                left_trigger,
                right_trigger,
                left_stick_x,
                left_stick_y,
                right_stick_x,
                right_stick_y,
            } => {
                let header_a = MC_HEADER_A - u32::from(gen5_plus);
                buf.put_u32(PACKET_TYPE_MULTI_CONTROLLER);
                buf.put_u32(header_a);
                buf.put_u16(MC_HEADER_B);
                buf.put_u16(controller_number);
                buf.put_u16(active_gamepad_mask);
                buf.put_u16(MC_MID_B);
                buf.put_u16(button_flags);
                buf.put_u8(left_trigger);
                buf.put_u8(right_trigger);
                buf.put_i16(left_stick_x);
                buf.put_i16(left_stick_y);
                buf.put_i16(right_stick_x);
                buf.put_i16(right_stick_y);
                buf.put_u32(MC_TAIL_A);
                buf.put_u16(MC_TAIL_B);
            }
            InputPacket::Scroll { amount } => {
                let magic = SCROLL_MAGIC + u16::from(gen5_plus);
                buf.put_u32(PACKET_TYPE_SCROLL);
                buf.extend_from_slice(&magic.to_le_bytes());
                buf.put_u16(0);
                buf.put_u16(0);
                buf.put_i16(amount);
                buf.put_i16(amount);
                buf.put_u16(0);
            }
            InputPacket::Haptics => {
                buf.put_u32(PACKET_TYPE_HAPTICS);
                buf.extend_from_slice(&H_MAGIC_A.to_le_bytes());
                buf.extend_from_slice(&H_MAGIC_B.to_le_bytes());
            }
        }
        buf
    }
}

/// The extended modifier keys on the right side of the keyboard must
/// not carry their own modifier flag, or the server synthesizes an
/// errant non-extended key press that then sticks. Meta never works
/// with its flag set at all, so it is cleared on both sides.
fn fixup_keyboard_modifiers(key_code: u16, modifiers: u8) -> u8 {
    match key_code & 0xff {
        0x5b | 0x5c => modifiers & !key_modifier::META,
        0xa0 => modifiers | key_modifier::SHIFT,
        0xa1 => modifiers & !key_modifier::SHIFT,
        0xa2 => modifiers | key_modifier::CTRL,
        0xa3 => modifiers & !key_modifier::CTRL,
        0xa4 => modifiers | key_modifier::ALT,
        0xa5 => modifiers & !key_modifier::ALT,
        _ => modifiers,
    }
}

// ── Coalescing ───────────────────────────────────────────────────

/// Merge queued packets of the head's kind into the head.
fn coalesce(mut head: InputPacket, queue: &BoundedQueue<InputPacket>) -> InputPacket {
    // Only the latest pointer position matters; older ones are
    // discarded outright.
    if matches!(head, InputPacket::MouseMoveAbs { .. }) {
        while let Some(newer) = queue.poll_if(|n| matches!(n, InputPacket::MouseMoveAbs { .. })) {
            head = newer;
        }
        return head;
    }

    match &mut head {
        InputPacket::MultiController {
            controller_number,
            active_gamepad_mask,
            button_flags,
            left_trigger,
            right_trigger,
            left_stick_x,
            left_stick_y,
            right_stick_x,
            right_stick_y,
        } => {
            // The server discards gamepad packets that arrive in
            // quick succession, and it drops the *newer* ones, so
            // batching axis updates into the head packet is needed
            // for correctness. Button changes are never merged.
            let (num, mask, buttons) = (*controller_number, *active_gamepad_mask, *button_flags);
            while let Some(next) = queue.poll_if(|n| {
                matches!(n, InputPacket::MultiController {
                    controller_number,
                    active_gamepad_mask,
                    button_flags,
                    ..
                } if *controller_number == num
                    && *active_gamepad_mask == mask
                    && *button_flags == buttons)
            }) {
                if let InputPacket::MultiController {
                    left_trigger: lt,
                    right_trigger: rt,
                    left_stick_x: lsx,
                    left_stick_y: lsy,
                    right_stick_x: rsx,
                    right_stick_y: rsy,
                    ..
                } = next
                {
                    *left_trigger = lt;
                    *right_trigger = rt;
                    *left_stick_x = lsx;
                    *left_stick_y = lsy;
                    *right_stick_x = rsx;
                    *right_stick_y = rsy;
                }
            }
        }
        InputPacket::MouseMoveRel { delta_x, delta_y } => loop {
            let (dx, dy) = (*delta_x as i32, *delta_y as i32);
            let fits = |next: &InputPacket| match next {
                InputPacket::MouseMoveRel {
                    delta_x: ndx,
                    delta_y: ndy,
                } => {
                    let (sx, sy) = (dx + *ndx as i32, dy + *ndy as i32);
                    // The accumulated delta must still fit the wire's
                    // 16-bit fields.
                    (i16::MIN as i32..=i16::MAX as i32).contains(&sx)
                        && (i16::MIN as i32..=i16::MAX as i32).contains(&sy)
                }
                _ => false,
            };
            let Some(InputPacket::MouseMoveRel {
                delta_x: ndx,
                delta_y: ndy,
            }) = queue.poll_if(fits)
            else {
                break;
            };
            *delta_x += ndx;
            *delta_y += ndy;
        },
        _ => {}
    }
    head
}

// ── InputPipeline ────────────────────────────────────────────────

enum InputRoute {
    /// Plaintext packets ride the encrypted control stream.
    PlaintextControl,
    /// Sealed packets ride the control stream behind a length prefix.
    SealedControl(InputEncryptor),
    /// Sealed packets go to the dedicated legacy input socket.
    SealedSocket(InputEncryptor, TcpStream),
}

struct InputInner {
    profile: ProtocolProfile,
    queue: BoundedQueue<InputPacket>,
    initialized: AtomicBool,
    cancel: CancellationToken,
}

/// User-input front end for a running stream.
pub struct InputPipeline {
    inner: Arc<InputInner>,
    worker: StdMutex<Option<JoinHandle<()>>>,
}

impl InputPipeline {
    /// Start the input worker. On pre-Gen5 servers this also opens
    /// the dedicated input socket. Once the worker is up a haptics
    /// enable packet is queued (7.1+), which tells the server to
    /// start emitting rumble events.
    pub async fn start(
        config: &StreamConfig,
        control: Arc<ControlSession>,
    ) -> Result<Self, VaporError> {
        let profile = ProtocolProfile::for_version(config.app_version);

        let route = if profile.encrypted_control_stream {
            InputRoute::PlaintextControl
        } else {
            let encryptor = InputEncryptor::new(
                profile.input_gcm_mode,
                &config.remote_input_aes_key,
                &config.remote_input_aes_iv,
            );
            if profile.input_on_control_stream {
                InputRoute::SealedControl(encryptor)
            } else {
                let stream = time::timeout(
                    INPUT_CONNECT_TIMEOUT,
                    TcpStream::connect((config.host, config.input_port)),
                )
                .await
                .map_err(|_| VaporError::ConnectTimeout(INPUT_CONNECT_TIMEOUT))??;
                stream.set_nodelay(true)?;
                debug!(host = %config.host, port = config.input_port, "input TCP connected");
                InputRoute::SealedSocket(encryptor, stream)
            }
        };

        let inner = Arc::new(InputInner {
            profile,
            queue: BoundedQueue::new(INPUT_QUEUE_BOUND),
            initialized: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });

        let worker = tokio::spawn(input_worker(Arc::clone(&inner), control, route));

        // Allow user packets through now.
        inner.initialized.store(true, Ordering::SeqCst);

        // The server will not send haptics events without this magic
        // packet first.
        if inner.profile.supports_haptics() {
            let _ = inner.queue.offer(InputPacket::Haptics);
        }

        Ok(Self {
            inner,
            worker: StdMutex::new(Some(worker)),
        })
    }

    /// Stop accepting packets and join the worker.
    pub async fn stop(&self) {
        self.inner.initialized.store(false, Ordering::SeqCst);
        self.inner.queue.shutdown();
        self.inner.cancel.cancel();

        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        debug!("input pipeline stopped");
    }

    fn offer(&self, packet: InputPacket) -> Result<(), VaporError> {
        if !self.inner.initialized.load(Ordering::SeqCst) {
            return Err(VaporError::NotStarted);
        }
        self.inner.queue.offer(packet)
    }

    // ── Event entry points ───────────────────────────────────────

    /// Relative mouse motion. A zero delta is accepted and dropped.
    pub fn send_mouse_move(&self, delta_x: i16, delta_y: i16) -> Result<(), VaporError> {
        if !self.inner.initialized.load(Ordering::SeqCst) {
            return Err(VaporError::NotStarted);
        }
        if delta_x == 0 && delta_y == 0 {
            return Ok(());
        }
        self.offer(InputPacket::MouseMoveRel { delta_x, delta_y })
    }

    /// Absolute pointer position within a reference surface.
    pub fn send_mouse_position(
        &self,
        x: i16,
        y: i16,
        reference_width: i16,
        reference_height: i16,
    ) -> Result<(), VaporError> {
        // The server's coordinate scaling rounds such that the cursor
        // cannot reach the far edges; shrinking the reference
        // dimensions by one works around it.
        self.offer(InputPacket::MouseMoveAbs {
            x,
            y,
            width: reference_width - 1,
            height: reference_height - 1,
        })
    }

    /// Mouse button press/release ([`BUTTON_ACTION_PRESS`] /
    /// [`BUTTON_ACTION_RELEASE`]).
    pub fn send_mouse_button(&self, action: u8, button: u32) -> Result<(), VaporError> {
        self.offer(InputPacket::MouseButton { action, button })
    }

    /// Keyboard press/release with modifier flags. Modifier fixups
    /// required by the server are applied here.
    pub fn send_keyboard(
        &self,
        key_code: u16,
        action: u8,
        modifiers: u8,
    ) -> Result<(), VaporError> {
        self.offer(InputPacket::Keyboard {
            action,
            key_code,
            modifiers: fixup_keyboard_modifiers(key_code, modifiers),
        })
    }

    /// Single-gamepad state snapshot.
    pub fn send_controller(
        &self,
        button_flags: u16,
        left_trigger: u8,
        right_trigger: u8,
        left_stick_x: i16,
        left_stick_y: i16,
        right_stick_x: i16,
        right_stick_y: i16,
    ) -> Result<(), VaporError> {
        self.send_controller_internal(
            0,
            0x1,
            button_flags,
            left_trigger,
            right_trigger,
            left_stick_x,
            left_stick_y,
            right_stick_x,
            right_stick_y,
        )
    }

    /// Multi-gamepad state snapshot.
    #[allow(clippy::too_many_arguments)]
    pub fn send_multi_controller(
        &self,
        controller_number: u16,
        active_gamepad_mask: u16,
        button_flags: u16,
        left_trigger: u8,
        right_trigger: u8,
        left_stick_x: i16,
        left_stick_y: i16,
        right_stick_x: i16,
        right_stick_y: i16,
    ) -> Result<(), VaporError> {
        self.send_controller_internal(
            controller_number,
            active_gamepad_mask,
            button_flags,
            left_trigger,
            right_trigger,
            left_stick_x,
            left_stick_y,
            right_stick_x,
            right_stick_y,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn send_controller_internal(
        &self,
        controller_number: u16,
        active_gamepad_mask: u16,
        button_flags: u16,
        left_trigger: u8,
        right_trigger: u8,
        left_stick_x: i16,
        left_stick_y: i16,
        right_stick_x: i16,
        right_stick_y: i16,
    ) -> Result<(), VaporError> {
        // Gen3 servers know nothing of multiple controllers.
        let packet = if self.inner.profile.generation == Generation::Gen3 {
            InputPacket::Controller {
                button_flags,
                left_trigger,
                right_trigger,
                left_stick_x,
                left_stick_y,
                right_stick_x,
                right_stick_y,
            }
        } else {
            InputPacket::MultiController {
                controller_number,
                active_gamepad_mask,
                button_flags,
                left_trigger,
                right_trigger,
                left_stick_x,
                left_stick_y,
                right_stick_x,
                right_stick_y,
            }
        };
        self.offer(packet)
    }

    /// High-resolution scroll in 1/120 notch units. Zero is dropped.
    pub fn send_high_res_scroll(&self, amount: i16) -> Result<(), VaporError> {
        if !self.inner.initialized.load(Ordering::SeqCst) {
            return Err(VaporError::NotStarted);
        }
        if amount == 0 {
            return Ok(());
        }
        self.offer(InputPacket::Scroll { amount })
    }

    /// Whole-notch scroll.
    pub fn send_scroll(&self, scroll_clicks: i8) -> Result<(), VaporError> {
        self.send_high_res_scroll(scroll_clicks as i16 * 120)
    }

    #[cfg(test)]
    fn for_tests(profile: ProtocolProfile) -> Self {
        let inner = Arc::new(InputInner {
            profile,
            queue: BoundedQueue::new(INPUT_QUEUE_BOUND),
            initialized: AtomicBool::new(true),
            cancel: CancellationToken::new(),
        });
        Self {
            inner,
            worker: StdMutex::new(None),
        }
    }

    #[cfg(test)]
    fn pop(&self) -> Option<InputPacket> {
        self.inner.queue.poll()
    }
}

// ── Dispatch worker ──────────────────────────────────────────────

async fn input_worker(
    inner: Arc<InputInner>,
    control: Arc<ControlSession>,
    mut route: InputRoute,
) {
    loop {
        let head = tokio::select! {
            _ = inner.cancel.cancelled() => return,
            item = inner.queue.take() => match item {
                Some(packet) => packet,
                None => return,
            },
        };

        let packet = coalesce(head, &inner.queue);
        let plaintext = packet.encode(&inner.profile);

        if let Err(e) = dispatch(&control, &mut route, &plaintext).await {
            warn!("input send failed: {e}");
            control.notify_transport_failure();
            return;
        }
    }
}

async fn dispatch(
    control: &ControlSession,
    route: &mut InputRoute,
    plaintext: &[u8],
) -> Result<(), VaporError> {
    match route {
        InputRoute::PlaintextControl => {
            // The control stream seals everything itself.
            control.send_input_packet(plaintext).await
        }
        InputRoute::SealedControl(encryptor) => {
            let wire = seal_with_prefix(encryptor, plaintext)?;
            control.send_input_packet(&wire).await
        }
        InputRoute::SealedSocket(encryptor, stream) => {
            let wire = seal_with_prefix(encryptor, plaintext)?;
            stream.write_all(&wire).await?;
            Ok(())
        }
    }
}

/// Seal and prepend the big-endian u32 length the server expects.
fn seal_with_prefix(
    encryptor: &mut InputEncryptor,
    plaintext: &[u8],
) -> Result<Vec<u8>, VaporError> {
    let sealed = encryptor.seal(plaintext)?;
    let mut wire = Vec::with_capacity(4 + sealed.len());
    wire.put_u32(sealed.len() as u32);
    wire.extend_from_slice(&sealed);
    Ok(wire)
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::VersionQuad;

    fn gen7_profile() -> ProtocolProfile {
        ProtocolProfile::for_version(VersionQuad::new(7, 1, 431, 0))
    }

    fn gen4_profile() -> ProtocolProfile {
        ProtocolProfile::for_version(VersionQuad::new(4, 0, 0, 0))
    }

    // ── Modifier fixups ──────────────────────────────────────────

    #[test]
    fn left_shift_sets_shift_flag() {
        assert_eq!(
            fixup_keyboard_modifiers(0xa0, 0),
            key_modifier::SHIFT
        );
    }

    #[test]
    fn right_side_modifiers_clear_their_flag() {
        assert_eq!(
            fixup_keyboard_modifiers(0xa1, key_modifier::SHIFT),
            0
        );
        assert_eq!(fixup_keyboard_modifiers(0xa3, key_modifier::CTRL), 0);
        assert_eq!(fixup_keyboard_modifiers(0xa5, key_modifier::ALT), 0);
    }

    #[test]
    fn meta_keys_drop_meta_flag() {
        for key in [0x5bu16, 0x5c] {
            assert_eq!(
                fixup_keyboard_modifiers(key, key_modifier::META | key_modifier::SHIFT),
                key_modifier::SHIFT
            );
        }
    }

    #[test]
    fn ordinary_keys_keep_modifiers() {
        let mods = key_modifier::SHIFT | key_modifier::CTRL;
        assert_eq!(fixup_keyboard_modifiers(0x41, mods), mods);
    }

    // ── Coalescing ───────────────────────────────────────────────

    #[test]
    fn relative_moves_accumulate() {
        let pipeline = InputPipeline::for_tests(gen7_profile());
        pipeline.send_mouse_move(1000, 10).unwrap();
        pipeline.send_mouse_move(2000, 20).unwrap();
        pipeline.send_mouse_move(-500, 5).unwrap();

        let head = pipeline.pop().unwrap();
        let merged = coalesce(head, &pipeline.inner.queue);
        assert_eq!(
            merged,
            InputPacket::MouseMoveRel {
                delta_x: 2500,
                delta_y: 35
            }
        );
        assert!(pipeline.pop().is_none());
    }

    #[test]
    fn relative_move_coalescing_stops_before_overflow() {
        let pipeline = InputPipeline::for_tests(gen7_profile());
        pipeline.send_mouse_move(30000, 0).unwrap();
        pipeline.send_mouse_move(30000, 0).unwrap();
        pipeline.send_mouse_move(30000, 0).unwrap();

        // 30000 + 30000 would overflow the wire's int16, so nothing
        // merges; each delta is dispatched separately.
        let head = pipeline.pop().unwrap();
        let merged = coalesce(head, &pipeline.inner.queue);
        assert_eq!(
            merged,
            InputPacket::MouseMoveRel {
                delta_x: 30000,
                delta_y: 0
            }
        );

        let head = pipeline.pop().unwrap();
        let merged = coalesce(head, &pipeline.inner.queue);
        assert_eq!(
            merged,
            InputPacket::MouseMoveRel {
                delta_x: 30000,
                delta_y: 0
            }
        );
        assert!(pipeline.pop().is_some());
    }

    #[test]
    fn relative_move_saturation_is_per_pair() {
        let pipeline = InputPipeline::for_tests(gen7_profile());
        pipeline.send_mouse_move(30000, 0).unwrap();
        pipeline.send_mouse_move(2000, 0).unwrap();
        pipeline.send_mouse_move(2000, 0).unwrap();

        // The first merge fits (32000); the second would overflow and
        // stays queued.
        let head = pipeline.pop().unwrap();
        let merged = coalesce(head, &pipeline.inner.queue);
        assert_eq!(
            merged,
            InputPacket::MouseMoveRel {
                delta_x: 32000,
                delta_y: 0
            }
        );
        assert_eq!(
            pipeline.pop(),
            Some(InputPacket::MouseMoveRel {
                delta_x: 2000,
                delta_y: 0
            })
        );
    }

    #[test]
    fn absolute_positions_keep_only_latest() {
        let pipeline = InputPipeline::for_tests(gen7_profile());
        for x in 1..=5i16 {
            pipeline.send_mouse_position(x, x, 1920, 1080).unwrap();
        }

        let head = pipeline.pop().unwrap();
        let merged = coalesce(head, &pipeline.inner.queue);
        assert_eq!(
            merged,
            InputPacket::MouseMoveAbs {
                x: 5,
                y: 5,
                width: 1919,
                height: 1079
            }
        );
        assert!(pipeline.pop().is_none());
    }

    #[test]
    fn matching_controller_states_batch_to_newest_axes() {
        let pipeline = InputPipeline::for_tests(gen7_profile());
        pipeline
            .send_multi_controller(0, 0x1, 0x10, 0, 0, 100, 100, 0, 0)
            .unwrap();
        pipeline
            .send_multi_controller(0, 0x1, 0x10, 50, 50, 200, 200, -10, -10)
            .unwrap();
        pipeline
            .send_multi_controller(0, 0x1, 0x10, 80, 80, 0, 0, 30, 30)
            .unwrap();

        let head = pipeline.pop().unwrap();
        let merged = coalesce(head, &pipeline.inner.queue);
        assert_eq!(
            merged,
            InputPacket::MultiController {
                controller_number: 0,
                active_gamepad_mask: 0x1,
                button_flags: 0x10,
                left_trigger: 80,
                right_trigger: 80,
                left_stick_x: 0,
                left_stick_y: 0,
                right_stick_x: 30,
                right_stick_y: 30,
            }
        );
        assert!(pipeline.pop().is_none());
    }

    #[test]
    fn button_changes_stop_controller_batching() {
        let pipeline = InputPipeline::for_tests(gen7_profile());
        pipeline
            .send_multi_controller(0, 0x1, 0x10, 0, 0, 1, 1, 1, 1)
            .unwrap();
        pipeline
            .send_multi_controller(0, 0x1, 0x20, 0, 0, 2, 2, 2, 2)
            .unwrap();

        let head = pipeline.pop().unwrap();
        let merged = coalesce(head, &pipeline.inner.queue);
        assert!(
            matches!(merged, InputPacket::MultiController { button_flags: 0x10, .. })
        );
        // The differing packet is still queued.
        assert!(pipeline.pop().is_some());
    }

    #[test]
    fn keyboard_packets_never_coalesce() {
        let pipeline = InputPipeline::for_tests(gen7_profile());
        pipeline.send_keyboard(0x41, KEY_ACTION_DOWN, 0).unwrap();
        pipeline.send_keyboard(0x42, KEY_ACTION_DOWN, 0).unwrap();

        let head = pipeline.pop().unwrap();
        let merged = coalesce(head, &pipeline.inner.queue);
        assert!(matches!(merged, InputPacket::Keyboard { key_code: 0x41, .. }));
        assert!(pipeline.pop().is_some());
    }

    // ── API edge cases ───────────────────────────────────────────

    #[test]
    fn zero_deltas_are_dropped_silently() {
        let pipeline = InputPipeline::for_tests(gen7_profile());
        pipeline.send_mouse_move(0, 0).unwrap();
        pipeline.send_high_res_scroll(0).unwrap();
        assert!(pipeline.pop().is_none());
    }

    #[test]
    fn scroll_scales_clicks_to_high_res_units() {
        let pipeline = InputPipeline::for_tests(gen7_profile());
        pipeline.send_scroll(-2).unwrap();
        assert_eq!(pipeline.pop(), Some(InputPacket::Scroll { amount: -240 }));
    }

    #[test]
    fn rejects_before_start() {
        let pipeline = InputPipeline::for_tests(gen7_profile());
        pipeline.inner.initialized.store(false, Ordering::SeqCst);
        assert!(matches!(
            pipeline.send_mouse_move(1, 1),
            Err(VaporError::NotStarted)
        ));
        assert!(matches!(
            pipeline.send_keyboard(0x41, KEY_ACTION_DOWN, 0),
            Err(VaporError::NotStarted)
        ));
    }

    #[test]
    fn gen3_uses_single_controller_packets() {
        let pipeline = InputPipeline::for_tests(ProtocolProfile::for_version(VersionQuad::new(
            3, 0, 0, 0,
        )));
        pipeline.send_controller(0x1, 0, 0, 0, 0, 0, 0).unwrap();
        assert!(matches!(
            pipeline.pop(),
            Some(InputPacket::Controller { button_flags: 0x1, .. })
        ));
    }

    #[test]
    fn gen4_uses_multi_controller_packets() {
        let pipeline = InputPipeline::for_tests(gen4_profile());
        pipeline.send_controller(0x1, 0, 0, 0, 0, 0, 0).unwrap();
        assert!(matches!(
            pipeline.pop(),
            Some(InputPacket::MultiController {
                controller_number: 0,
                active_gamepad_mask: 0x1,
                ..
            })
        ));
    }

    // ── Encoding ─────────────────────────────────────────────────

    #[test]
    fn keyboard_encoding_layout() {
        let profile = gen7_profile();
        let packet = InputPacket::Keyboard {
            action: KEY_ACTION_DOWN,
            key_code: 0x0141,
            modifiers: key_modifier::SHIFT,
        };
        let bytes = packet.encode(&profile);
        assert_eq!(bytes.len(), 14);
        assert_eq!(&bytes[0..4], &[0x00, 0x00, 0x0a, 0x03]);
        assert_eq!(bytes[4], KEY_ACTION_DOWN);
        // Key code is little-endian, unlike the header.
        assert_eq!(&bytes[9..11], &[0x41, 0x01]);
        assert_eq!(bytes[11], key_modifier::SHIFT);
    }

    #[test]
    fn gen5_magic_adjustments() {
        let gen4 = gen4_profile();
        let gen7 = gen7_profile();
        let rel = InputPacket::MouseMoveRel {
            delta_x: 1,
            delta_y: 1,
        };
        // Rel-mouse magic is bumped by one from Gen5 on.
        assert_eq!(rel.encode(&gen4)[4], MOUSE_MOVE_REL_MAGIC as u8);
        assert_eq!(rel.encode(&gen7)[4], MOUSE_MOVE_REL_MAGIC as u8 + 1);

        let button = InputPacket::MouseButton {
            action: BUTTON_ACTION_PRESS,
            button: 1,
        };
        assert_eq!(button.encode(&gen4)[4], BUTTON_ACTION_PRESS);
        assert_eq!(button.encode(&gen7)[4], BUTTON_ACTION_PRESS + 1);

        let pad = InputPacket::MultiController {
            controller_number: 0,
            active_gamepad_mask: 1,
            button_flags: 0,
            left_trigger: 0,
            right_trigger: 0,
            left_stick_x: 0,
            left_stick_y: 0,
            right_stick_x: 0,
            right_stick_y: 0,
        };
        // Multi-controller header is decremented by one from Gen5 on.
        assert_eq!(pad.encode(&gen4)[7], MC_HEADER_A as u8);
        assert_eq!(pad.encode(&gen7)[7], MC_HEADER_A as u8 - 1);
    }

    #[test]
    fn scroll_encoding_duplicates_amount() {
        let bytes = InputPacket::Scroll { amount: 0x1234 }.encode(&gen7_profile());
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[10..12], &[0x12, 0x34]);
        assert_eq!(&bytes[12..14], &[0x12, 0x34]);
    }

    #[test]
    fn controller_packet_sizes() {
        let gen3 = ProtocolProfile::for_version(VersionQuad::new(3, 0, 0, 0));
        let single = InputPacket::Controller {
            button_flags: 0,
            left_trigger: 0,
            right_trigger: 0,
            left_stick_x: 0,
            left_stick_y: 0,
            right_stick_x: 0,
            right_stick_y: 0,
        };
        assert_eq!(single.encode(&gen3).len(), 28);

        let multi = InputPacket::MultiController {
            controller_number: 0,
            active_gamepad_mask: 1,
            button_flags: 0,
            left_trigger: 0,
            right_trigger: 0,
            left_stick_x: 0,
            left_stick_y: 0,
            right_stick_x: 0,
            right_stick_y: 0,
        };
        assert_eq!(multi.encode(&gen7_profile()).len(), 34);
    }

    #[test]
    fn haptics_packet_layout() {
        let bytes = InputPacket::Haptics.encode(&gen7_profile());
        assert_eq!(bytes.len(), 8);
        assert_eq!(&bytes[0..4], &[0x00, 0x00, 0x00, 0x0d]);
        assert_eq!(&bytes[4..6], &[0x0d, 0x00]);
    }
}
