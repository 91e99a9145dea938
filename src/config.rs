//! Session configuration and listener callbacks.
//!
//! The surrounding orchestrator (RTSP handshake, session setup) fills
//! in a [`StreamConfig`] and implements [`SessionListener`]; this core
//! never reads configuration from disk itself.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::profile::VersionQuad;
use crate::quality::ConnectionStatus;

/// Default TCP control port for pre-Gen5 servers.
pub const DEFAULT_CONTROL_PORT: u16 = 47995;
/// Default TCP input port for pre-Gen5 servers.
pub const DEFAULT_INPUT_PORT: u16 = 35043;
/// Default UDP port for the Gen5+ reliable peer.
pub const DEFAULT_PEER_PORT: u16 = 47999;

// ── StreamConfig ─────────────────────────────────────────────────

/// Connection parameters handed down by the session orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Remote streaming host.
    pub host: IpAddr,
    /// Server application version, as negotiated out of band.
    pub app_version: VersionQuad,
    /// AES-128 key provisioned during session setup.
    pub remote_input_aes_key: [u8; 16],
    /// Initial AES IV for the legacy input cipher.
    pub remote_input_aes_iv: [u8; 16],
    /// TCP control port (pre-Gen5).
    pub control_port: u16,
    /// TCP input port (pre-Gen5).
    pub input_port: u16,
    /// UDP peer port (Gen5+).
    pub peer_port: u16,
}

impl StreamConfig {
    /// Build a config with the standard server ports.
    pub fn new(host: IpAddr, app_version: VersionQuad, key: [u8; 16], iv: [u8; 16]) -> Self {
        Self {
            host,
            app_version,
            remote_input_aes_key: key,
            remote_input_aes_iv: iv,
            control_port: DEFAULT_CONTROL_PORT,
            input_port: DEFAULT_INPUT_PORT,
            peer_port: DEFAULT_PEER_PORT,
        }
    }
}

// ── TerminationReason ────────────────────────────────────────────

/// Why the session ended, as reported to the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// The server closed the stream after at least one frame was
    /// delivered. Not an error.
    Graceful,
    /// The server closed before any frame was seen — something broke
    /// during stream bring-up.
    UnexpectedEarly,
    /// The server refused to stream protected content on screen.
    ProtectedContent,
    /// Any other server-reported code, passed through unmodified.
    Server(u32),
    /// Local transport failure (send error, service error, or a
    /// disconnect that never completed).
    Transport(i32),
}

// ── SessionListener ──────────────────────────────────────────────

/// Callbacks emitted by the control session and input pipeline.
///
/// All methods default to no-ops so implementors only override what
/// they consume. `connection_terminated` fires at most once per
/// session; after it the session is terminal.
pub trait SessionListener: Send + Sync {
    /// A controller rumble event arrived from the server.
    fn rumble(&self, _controller_number: u16, _low_freq: u16, _high_freq: u16) {}

    /// The frame-loss monitor crossed a quality threshold.
    fn connection_status_update(&self, _status: ConnectionStatus) {}

    /// The session ended. Terminal.
    fn connection_terminated(&self, _reason: TerminationReason) {}
}
