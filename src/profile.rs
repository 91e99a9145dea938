//! Protocol profile table.
//!
//! The streaming server speaks one of five dialects selected by its
//! four-part application version. Each dialect maps a fixed set of
//! message indices to 16-bit message codes, expected payload lengths,
//! and (for the two handshake messages) preconstructed constant
//! bodies. A handful of behavior switches also derive from the
//! version. The whole table is immutable and resolved once at session
//! start.

use serde::{Deserialize, Serialize};

// ── VersionQuad ──────────────────────────────────────────────────

/// Four-part server application version, e.g. `7.1.431.0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionQuad {
    pub major: u32,
    pub minor: u32,
    pub build: u32,
    pub revision: u32,
}

impl VersionQuad {
    /// Construct from the four dotted components.
    pub const fn new(major: u32, minor: u32, build: u32, revision: u32) -> Self {
        Self {
            major,
            minor,
            build,
            revision,
        }
    }

    /// Lexicographic comparison on the first three components.
    pub const fn at_least(&self, major: u32, minor: u32, build: u32) -> bool {
        if self.major != major {
            return self.major > major;
        }
        if self.minor != minor {
            return self.minor > minor;
        }
        self.build >= build
    }
}

impl std::fmt::Display for VersionQuad {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.build, self.revision
        )
    }
}

// ── MessageIndex ─────────────────────────────────────────────────

/// Index into a profile's message tables.
///
/// `StartA` doubles as the IDR-frame request on pre-Gen5 dialects,
/// which share one table slot for both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum MessageIndex {
    StartA = 0,
    StartB = 1,
    InvalidateRefFrames = 2,
    LossStats = 3,
    FrameStats = 4,
    InputData = 5,
    RumbleData = 6,
    Termination = 7,
}

/// Alias for the shared Start A / IDR-request slot on pre-Gen5.
pub const IDX_REQUEST_IDR_FRAME: MessageIndex = MessageIndex::StartA;

// ── Generation ───────────────────────────────────────────────────

/// Server protocol generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    Gen3,
    Gen4,
    Gen5,
    Gen7,
    /// Gen7 on 7.1.431+, where the whole control stream is encrypted.
    Gen7Encrypted,
}

// ── Tables ───────────────────────────────────────────────────────

const ABSENT: i32 = -1;

const CODES_GEN3: [i32; 8] = [0x1407, 0x1410, 0x1404, 0x140c, 0x1417, ABSENT, ABSENT, ABSENT];
const CODES_GEN4: [i32; 8] = [0x0606, 0x0609, 0x0604, 0x060a, 0x0611, ABSENT, ABSENT, ABSENT];
const CODES_GEN5: [i32; 8] = [0x0305, 0x0307, 0x0301, 0x0201, 0x0204, 0x0207, ABSENT, ABSENT];
const CODES_GEN7: [i32; 8] = [0x0305, 0x0307, 0x0301, 0x0201, 0x0204, 0x0206, 0x010b, 0x0100];
const CODES_GEN7_ENC: [i32; 8] = [0x0305, 0x0307, 0x0301, 0x0201, 0x0204, 0x0206, 0x010b, 0x0109];

/// Start B on Gen3 is four little-endian u32 words `0, 0, 0, 0xa`.
const START_B_GEN3: [u8; 16] = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x0a, 0, 0, 0];
const START_A_GEN3: [u8; 2] = [0, 0];
const START_A_GEN4: [u8; 2] = [0, 0];
const START_B_GEN4: [u8; 1] = [0];
const START_A_GEN5: [u8; 2] = [0, 0];
const START_B_GEN5: [u8; 1] = [0];

const LENS_GEN3: [i32; 6] = [2, 16, 24, 32, 64, ABSENT];
const LENS_GEN4: [i32; 6] = [2, 1, 24, 32, 64, ABSENT];
const LENS_GEN5: [i32; 6] = [2, 1, 24, 32, 80, ABSENT];

// ── ProtocolProfile ──────────────────────────────────────────────

/// Immutable per-session view of the negotiated dialect.
#[derive(Debug, Clone)]
pub struct ProtocolProfile {
    pub generation: Generation,
    pub version: VersionQuad,

    /// The control channel rides a reliable-UDP peer instead of TCP.
    pub uses_reliable_udp: bool,
    /// Every control message is wrapped in an AES-GCM envelope.
    pub encrypted_control_stream: bool,
    /// Telemetry is a fixed periodic ping rather than loss stats.
    pub use_periodic_ping: bool,
    /// Input packets travel on the control transport.
    pub input_on_control_stream: bool,
    /// Input packets are sealed with AES-GCM rather than chained CBC.
    pub input_gcm_mode: bool,
    /// The input IV is overwritten with trailing ciphertext after
    /// each send. Only the pre-encrypted Gen7 input path does this.
    pub rolling_iv_quirk: bool,

    codes: &'static [i32; 8],
    payload_lens: &'static [i32; 6],
    preconstructed: [&'static [u8]; 2],
}

impl ProtocolProfile {
    /// Resolve the profile for a server version.
    pub fn for_version(version: VersionQuad) -> Self {
        let encrypted_control_stream = version.at_least(7, 1, 431);
        let use_periodic_ping = version.at_least(7, 1, 415);

        let (generation, codes, payload_lens, preconstructed): (
            Generation,
            &'static [i32; 8],
            &'static [i32; 6],
            [&'static [u8]; 2],
        ) = match version.major {
            3 => (
                Generation::Gen3,
                &CODES_GEN3,
                &LENS_GEN3,
                [&START_A_GEN3, &START_B_GEN3],
            ),
            4 => (
                Generation::Gen4,
                &CODES_GEN4,
                &LENS_GEN4,
                [&START_A_GEN4, &START_B_GEN4],
            ),
            5 => (
                Generation::Gen5,
                &CODES_GEN5,
                &LENS_GEN5,
                [&START_A_GEN5, &START_B_GEN5],
            ),
            _ => (
                if encrypted_control_stream {
                    Generation::Gen7Encrypted
                } else {
                    Generation::Gen7
                },
                if encrypted_control_stream {
                    &CODES_GEN7_ENC
                } else {
                    &CODES_GEN7
                },
                &LENS_GEN5,
                [&START_A_GEN5, &START_B_GEN5],
            ),
        };

        let uses_reliable_udp = version.major >= 5;
        let input_gcm_mode = version.major >= 7;

        Self {
            generation,
            version,
            uses_reliable_udp,
            encrypted_control_stream,
            use_periodic_ping,
            input_on_control_stream: uses_reliable_udp,
            input_gcm_mode,
            rolling_iv_quirk: input_gcm_mode && !encrypted_control_stream,
            codes,
            payload_lens,
            preconstructed,
        }
    }

    /// Message code for `idx`, or `None` if the dialect lacks it.
    pub fn code(&self, idx: MessageIndex) -> Option<u16> {
        match self.codes[idx as usize] {
            ABSENT => None,
            c => Some(c as u16),
        }
    }

    /// Expected payload length for `idx` (first six indices only).
    pub fn payload_len(&self, idx: MessageIndex) -> Option<u16> {
        match self.payload_lens.get(idx as usize)? {
            &ABSENT => None,
            &l => Some(l as u16),
        }
    }

    /// Preconstructed constant body for Start A / Start B.
    pub fn preconstructed(&self, idx: MessageIndex) -> Option<&'static [u8]> {
        match idx {
            MessageIndex::StartA => Some(self.preconstructed[0]),
            MessageIndex::StartB => Some(self.preconstructed[1]),
            _ => None,
        }
    }

    /// Whether the haptics-enable packet may be sent at input start.
    /// Older servers terminate the connection on unexpected packets.
    pub fn supports_haptics(&self) -> bool {
        self.version.at_least(7, 1, 0)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_at_least() {
        let v = VersionQuad::new(7, 1, 431, 0);
        assert!(v.at_least(7, 1, 431));
        assert!(v.at_least(7, 1, 415));
        assert!(v.at_least(5, 0, 0));
        assert!(!v.at_least(7, 1, 432));
        assert!(!v.at_least(7, 2, 0));
        assert!(!v.at_least(8, 0, 0));
    }

    #[test]
    fn gen3_profile() {
        let p = ProtocolProfile::for_version(VersionQuad::new(3, 0, 0, 0));
        assert_eq!(p.generation, Generation::Gen3);
        assert!(!p.uses_reliable_udp);
        assert!(!p.encrypted_control_stream);
        assert!(!p.input_on_control_stream);
        assert_eq!(p.code(MessageIndex::StartA), Some(0x1407));
        assert_eq!(p.code(MessageIndex::StartB), Some(0x1410));
        assert_eq!(p.code(MessageIndex::InputData), None);
        assert_eq!(p.code(MessageIndex::RumbleData), None);
        assert_eq!(p.payload_len(MessageIndex::LossStats), Some(32));
        assert_eq!(p.payload_len(MessageIndex::FrameStats), Some(64));
        assert_eq!(p.preconstructed(MessageIndex::StartB).unwrap().len(), 16);
        assert_eq!(p.preconstructed(MessageIndex::StartB).unwrap()[12], 0x0a);
    }

    #[test]
    fn gen5_profile() {
        let p = ProtocolProfile::for_version(VersionQuad::new(5, 0, 0, 0));
        assert_eq!(p.generation, Generation::Gen5);
        assert!(p.uses_reliable_udp);
        assert!(p.input_on_control_stream);
        assert!(!p.input_gcm_mode);
        assert!(!p.rolling_iv_quirk);
        assert_eq!(p.code(MessageIndex::InputData), Some(0x0207));
        assert_eq!(p.code(MessageIndex::Termination), None);
        assert_eq!(p.payload_len(MessageIndex::FrameStats), Some(80));
    }

    #[test]
    fn gen7_profiles_split_on_encryption() {
        let plain = ProtocolProfile::for_version(VersionQuad::new(7, 1, 430, 0));
        assert_eq!(plain.generation, Generation::Gen7);
        assert!(plain.use_periodic_ping);
        assert!(!plain.encrypted_control_stream);
        assert!(plain.rolling_iv_quirk);
        assert_eq!(plain.code(MessageIndex::Termination), Some(0x0100));

        let enc = ProtocolProfile::for_version(VersionQuad::new(7, 1, 431, 0));
        assert_eq!(enc.generation, Generation::Gen7Encrypted);
        assert!(enc.encrypted_control_stream);
        assert!(!enc.rolling_iv_quirk);
        assert_eq!(enc.code(MessageIndex::Termination), Some(0x0109));
        assert_eq!(enc.code(MessageIndex::RumbleData), Some(0x010b));
    }

    #[test]
    fn start_bodies_match_declared_lengths() {
        for major in [3u32, 4, 5, 7] {
            let p = ProtocolProfile::for_version(VersionQuad::new(major, 0, 0, 0));
            for idx in [MessageIndex::StartA, MessageIndex::StartB] {
                assert_eq!(
                    p.preconstructed(idx).unwrap().len(),
                    p.payload_len(idx).unwrap() as usize,
                    "gen {major}",
                );
            }
        }
    }
}
