//! # vapor — game streaming client core
//!
//! Control and input channels of a low-latency remote-desktop /
//! cloud-gaming client. The crate negotiates a persistent control
//! session with the streaming server, exchanges keepalive and loss
//! telemetry, requests IDR frames and reference-frame invalidation on
//! video feedback, surfaces server events (rumble, termination), and
//! forwards user input — multiplexed onto the control channel on
//! dialects that support it.
//!
//! ## Architecture
//!
//! ```text
//! video pipeline ──► QualityMonitor ──► status updates
//!        │
//!        └──► ControlSession ◄──────── InputPipeline ◄── user events
//!                  │   (3 workers: receive /                │
//!                  │    telemetry / invalidation)           │ (1 worker:
//!                  ▼                                        ▼  coalesce + seal)
//!            ControlTransport ◄──────────────────── legacy input TCP
//!             (TCP | reliable-UDP peer, one mutex)
//! ```
//!
//! ## Sub-modules
//!
//! | Module      | Purpose                                            |
//! |-------------|----------------------------------------------------|
//! | `profile`   | Version → message codes / lengths / behavior flags |
//! | `crypto`    | AES-GCM control envelopes, GCM/CBC input sealing   |
//! | `transport` | TCP & reliable-UDP peer behind one send/recv face  |
//! | `control`   | Handshake, telemetry, invalidation, teardown       |
//! | `input`     | Input queueing, coalescing, and dispatch           |
//! | `quality`   | Frame-loss windows and OKAY/POOR hysteresis        |
//! | `queue`     | Bounded blocking queue with head inspection        |
//! | `config`    | Session parameters and listener callbacks          |
//! | `error`     | Typed error taxonomy                               |

mod config;
mod control;
mod crypto;
mod error;
mod input;
mod profile;
mod quality;
mod queue;
mod transport;

pub use config::{
    SessionListener, StreamConfig, TerminationReason, DEFAULT_CONTROL_PORT, DEFAULT_INPUT_PORT,
    DEFAULT_PEER_PORT,
};
pub use control::{ControlSession, FrameRange};
pub use crypto::ControlCodec;
pub use error::VaporError;
pub use input::{
    key_modifier, InputPipeline, BUTTON_ACTION_PRESS, BUTTON_ACTION_RELEASE, KEY_ACTION_DOWN,
    KEY_ACTION_UP,
};
pub use profile::{Generation, MessageIndex, ProtocolProfile, VersionQuad};
pub use quality::{ConnectionStatus, QualityMonitor};
pub use transport::peer::{PeerEvent, ReliablePeer};
