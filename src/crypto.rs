//! AES framing for the control and input channels.
//!
//! Two independent cipher layers share the session's 16-byte key:
//!
//! **Control envelope** (AES-128-GCM, 7.1.431+). Plaintext is a V2
//! header plus payload; the wire frame is:
//!
//! ```text
//! outer_type:  u16 LE   (always 0x0001)
//! length:      u16 LE   (4 + 16 + plaintext length)
//! seq:         u32 LE   (monotonic, doubles as the IV source)
//! tag:         [u8; 16]
//! ciphertext:  [u8]     ([type u16 LE][payload_len u16 LE][payload])
//! ```
//!
//! The IV is sixteen zero bytes with byte 0 set to `seq & 0xFF`. The
//! truncation is the server's own bug, mimicked for compatibility.
//! Decryption additionally squeezes the V2 header down to a V1 header
//! (`[type][payload]`) by deleting the inner length field.
//!
//! **Input sealing** (pre-unified profiles). Gen7 uses one-shot
//! AES-128-GCM framed `[tag][ciphertext]`, then overwrites the
//! session IV with the final 16 ciphertext bytes of each sufficiently
//! long message — another server-imitated quirk that must survive
//! bit-exactly. Earlier generations use AES-128-CBC with PKCS#7
//! padding through a single long-lived cipher whose chaining state
//! deliberately spans messages.

use aead::generic_array::GenericArray;
use aead::{AeadInPlace, KeyInit};
use aes::cipher::{BlockEncryptMut, KeyIvInit};
use aes::Aes128;
use aes_gcm::aead::consts::U16;
use aes_gcm::{AesGcm, Tag};
use bytes::{Buf, BufMut};

use crate::error::VaporError;

/// AES-128-GCM with the protocol's 16-byte IVs.
type StreamAesGcm = AesGcm<Aes128, U16>;

/// Authentication tag size for every GCM framing.
pub const GCM_TAG_LENGTH: usize = 16;
/// Outer message type marking an encrypted control envelope.
pub const ENCRYPTED_HEADER_TYPE: u16 = 0x0001;
/// `[outer_type][length][seq]`.
pub const ENCRYPTED_HEADER_LENGTH: usize = 8;
/// `[type][payload_len]` — the plaintext V2 header.
const V2_HEADER_LENGTH: usize = 4;

/// 16 zero bytes with the low byte of `seq` in position 0.
fn seq_iv(seq: u32) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[0] = seq as u8;
    iv
}

// ── ControlCodec ─────────────────────────────────────────────────

/// One-shot GCM sealer/opener for control envelopes.
///
/// Stateless apart from the key; the caller owns the sequence counter
/// (allocated under the transport mutex so wire order matches).
pub struct ControlCodec {
    cipher: StreamAesGcm,
}

impl ControlCodec {
    pub fn new(key: &[u8; 16]) -> Self {
        Self {
            cipher: StreamAesGcm::new(GenericArray::from_slice(key)),
        }
    }

    /// Seal `[type][payload]` into a complete encrypted wire frame.
    pub fn encrypt_frame(
        &self,
        seq: u32,
        packet_type: u16,
        payload: &[u8],
    ) -> Result<Vec<u8>, VaporError> {
        let mut plaintext = Vec::with_capacity(V2_HEADER_LENGTH + payload.len());
        plaintext.put_u16_le(packet_type);
        plaintext.put_u16_le(payload.len() as u16);
        plaintext.extend_from_slice(payload);

        let nonce = seq_iv(seq);
        let tag = self
            .cipher
            .encrypt_in_place_detached(GenericArray::from_slice(&nonce), b"", &mut plaintext)
            .map_err(|_| VaporError::Crypto("control encrypt"))?;

        let length = (4 + GCM_TAG_LENGTH + plaintext.len()) as u16;
        let mut frame =
            Vec::with_capacity(ENCRYPTED_HEADER_LENGTH + GCM_TAG_LENGTH + plaintext.len());
        frame.put_u16_le(ENCRYPTED_HEADER_TYPE);
        frame.put_u16_le(length);
        frame.put_u32_le(seq);
        frame.extend_from_slice(&tag);
        frame.extend_from_slice(&plaintext);
        Ok(frame)
    }

    /// Open an encrypted envelope and return the V1 plaintext
    /// (`[type u16 LE][payload]`).
    pub fn decrypt_frame_to_v1(&self, frame: &[u8]) -> Result<Vec<u8>, VaporError> {
        if frame.len() < ENCRYPTED_HEADER_LENGTH + GCM_TAG_LENGTH {
            return Err(VaporError::Runt {
                actual: frame.len(),
                min: ENCRYPTED_HEADER_LENGTH + GCM_TAG_LENGTH,
            });
        }

        let mut header = &frame[..ENCRYPTED_HEADER_LENGTH];
        let outer_type = header.get_u16_le();
        let length = header.get_u16_le() as usize;
        let seq = header.get_u32_le();

        if outer_type != ENCRYPTED_HEADER_TYPE {
            return Err(VaporError::Crypto("unexpected outer type"));
        }
        // Too short to even hold the inner V2 header.
        if length < 4 + GCM_TAG_LENGTH + V2_HEADER_LENGTH {
            return Err(VaporError::Runt {
                actual: length,
                min: 4 + GCM_TAG_LENGTH + V2_HEADER_LENGTH,
            });
        }
        // The declared length spans seq + tag + ciphertext.
        if frame.len() < 4 + length {
            return Err(VaporError::Runt {
                actual: frame.len(),
                min: 4 + length,
            });
        }

        let ciphertext_len = length - 4 - GCM_TAG_LENGTH;
        let tag_start = ENCRYPTED_HEADER_LENGTH;
        let ct_start = tag_start + GCM_TAG_LENGTH;
        let mut plaintext = frame[ct_start..ct_start + ciphertext_len].to_vec();

        let nonce = seq_iv(seq);
        let tag = Tag::from_slice(&frame[tag_start..ct_start]);
        self.cipher
            .decrypt_in_place_detached(GenericArray::from_slice(&nonce), b"", &mut plaintext, tag)
            .map_err(|_| VaporError::Crypto("control decrypt"))?;

        // In-place V2 → V1 conversion: delete the inner length field
        // so downstream parsing sees `[type][payload]`.
        plaintext.copy_within(V2_HEADER_LENGTH.., 2);
        plaintext.truncate(plaintext.len() - 2);
        Ok(plaintext)
    }
}

// ── InputEncryptor ───────────────────────────────────────────────

/// Sealer for the pre-unified input channel.
pub enum InputEncryptor {
    Gcm(GcmInputEncryptor),
    Cbc(CbcInputEncryptor),
}

impl InputEncryptor {
    /// Pick the cipher the negotiated generation expects.
    pub fn new(gcm_mode: bool, key: &[u8; 16], iv: &[u8; 16]) -> Self {
        if gcm_mode {
            Self::Gcm(GcmInputEncryptor::new(key, iv))
        } else {
            Self::Cbc(CbcInputEncryptor::new(key, iv))
        }
    }

    /// Seal one input packet; the result goes behind a u32 BE length
    /// prefix on the wire.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, VaporError> {
        match self {
            Self::Gcm(g) => g.seal(plaintext),
            Self::Cbc(c) => c.seal(plaintext),
        }
    }
}

/// One-shot GCM with the rolling-IV quirk.
pub struct GcmInputEncryptor {
    cipher: StreamAesGcm,
    iv: [u8; 16],
}

impl GcmInputEncryptor {
    pub fn new(key: &[u8; 16], iv: &[u8; 16]) -> Self {
        Self {
            cipher: StreamAesGcm::new(GenericArray::from_slice(key)),
            iv: *iv,
        }
    }

    /// Seal as `[tag][ciphertext]`, then roll the IV forward.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, VaporError> {
        let mut ciphertext = plaintext.to_vec();
        let tag = self
            .cipher
            .encrypt_in_place_detached(GenericArray::from_slice(&self.iv), b"", &mut ciphertext)
            .map_err(|_| VaporError::Crypto("input encrypt"))?;

        let mut sealed = Vec::with_capacity(GCM_TAG_LENGTH + ciphertext.len());
        sealed.extend_from_slice(&tag);
        sealed.extend_from_slice(&ciphertext);

        // The server reuses the trailing 16 ciphertext bytes of each
        // long-enough message as the next IV. Mimic it bit-exactly.
        if ciphertext.len() >= 16 {
            self.iv.copy_from_slice(&sealed[sealed.len() - 16..]);
        }

        Ok(sealed)
    }

    #[cfg(test)]
    pub(crate) fn current_iv(&self) -> [u8; 16] {
        self.iv
    }
}

/// Chained CBC whose state spans messages.
///
/// The cipher is initialized once with the session IV and never
/// reset, so block chaining continues from one packet into the next.
pub struct CbcInputEncryptor {
    cipher: cbc::Encryptor<Aes128>,
}

impl CbcInputEncryptor {
    pub fn new(key: &[u8; 16], iv: &[u8; 16]) -> Self {
        Self {
            cipher: cbc::Encryptor::<Aes128>::new(
                GenericArray::from_slice(key),
                GenericArray::from_slice(iv),
            ),
        }
    }

    /// PKCS#7-pad to the block size and encrypt in place.
    ///
    /// Block-aligned input gets no padding block, matching the
    /// server's padding routine.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, VaporError> {
        let padded_len = (plaintext.len() + 15) / 16 * 16;
        let padding_byte = (16 - plaintext.len() % 16) as u8;

        let mut buf = plaintext.to_vec();
        buf.resize(padded_len, padding_byte);
        for block in buf.chunks_exact_mut(16) {
            self.cipher
                .encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        Ok(buf)
    }
}

// ── Tests ────────────────────────────────────────────────────────
