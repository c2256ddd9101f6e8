//! Encrypted frame codec
//!
//! ## Cleartext Layout
//!
//! - Sequence: 4 bytes (u32, big-endian)
//! - Ack sequence: 4 bytes (u32, big-endian)
//! - Code: 2 bytes (u16, big-endian)
//! - Payload length: 2 bytes (u16, big-endian)
//! - Payload
//! - CRC16/MODBUS of everything above: 2 bytes (u16, big-endian)
//! - Zero padding to a 16-byte multiple
//!
//! ## Wire Layout
//!
//! `security_flag:u8 ‖ iv:16 ‖ AES-128-CBC(key[security_flag], iv, cleartext)`

use crate::crypto::{self, BLOCK_SIZE, KEY_SIZE};
use crate::{ProtocolError, Result};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Bytes of sequence, ack sequence, code and payload length
pub const FRAME_HEADER_LEN: usize = 12;

/// Trailing CRC16 bytes
pub const FRAME_CRC_LEN: usize = 2;

/// Security flag byte plus IV
pub const ENVELOPE_HEADER_LEN: usize = 1 + BLOCK_SIZE;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One decrypted protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Sender's sequence number
    pub sequence: u32,
    /// Sequence number being acknowledged, 0 if none
    pub ack_sequence: u32,
    /// Message code
    pub code: u16,
    /// Message body
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a new frame
    pub fn new(sequence: u32, ack_sequence: u32, code: u16, payload: Vec<u8>) -> Self {
        Self {
            sequence,
            ack_sequence,
            code,
            payload,
        }
    }

    /// Header, payload and CRC, zero-padded to the AES block size
    pub fn to_cleartext(&self) -> Result<Vec<u8>> {
        let payload_len = u16::try_from(self.payload.len()).map_err(|_| {
            ProtocolError::MessageTooLarge {
                size: self.payload.len(),
                max_size: u16::MAX as usize,
            }
        })?;

        let mut bytes = Vec::with_capacity(FRAME_HEADER_LEN + self.payload.len() + FRAME_CRC_LEN);
        bytes.extend_from_slice(&self.sequence.to_be_bytes());
        bytes.extend_from_slice(&self.ack_sequence.to_be_bytes());
        bytes.extend_from_slice(&self.code.to_be_bytes());
        bytes.extend_from_slice(&payload_len.to_be_bytes());
        bytes.extend_from_slice(&self.payload);
        let crc = crypto::crc16_modbus(&bytes);
        bytes.extend_from_slice(&crc.to_be_bytes());

        Ok(crypto::pad_to_multiple(&bytes, BLOCK_SIZE))
    }

    /// Parse decrypted bytes and verify the CRC; trailing padding is ignored
    pub fn from_cleartext(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FRAME_HEADER_LEN + FRAME_CRC_LEN {
            return Err(ProtocolError::malformed(format!(
                "cleartext too short: {} bytes",
                bytes.len()
            )));
        }

        let sequence = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let ack_sequence = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let code = u16::from_be_bytes([bytes[8], bytes[9]]);
        let payload_len = usize::from(u16::from_be_bytes([bytes[10], bytes[11]]));

        let crc_offset = FRAME_HEADER_LEN + payload_len;
        if bytes.len() < crc_offset + FRAME_CRC_LEN {
            return Err(ProtocolError::malformed(format!(
                "declared payload of {} bytes exceeds {} byte frame",
                payload_len,
                bytes.len()
            )));
        }

        let received = u16::from_be_bytes([bytes[crc_offset], bytes[crc_offset + 1]]);
        let computed = crypto::crc16_modbus(&bytes[..crc_offset]);
        if received != computed {
            return Err(ProtocolError::ChecksumMismatch { received, computed });
        }

        Ok(Self {
            sequence,
            ack_sequence,
            code,
            payload: bytes[FRAME_HEADER_LEN..crc_offset].to_vec(),
        })
    }

    /// Encrypt under `key` with a fresh random IV
    pub fn seal(&self, security_flag: u8, key: &[u8; KEY_SIZE]) -> Result<Vec<u8>> {
        self.seal_with_iv(security_flag, key, &crypto::random_iv())
    }

    /// Encrypt under `key` with a caller-chosen IV
    pub fn seal_with_iv(
        &self,
        security_flag: u8,
        key: &[u8; KEY_SIZE],
        iv: &[u8; BLOCK_SIZE],
    ) -> Result<Vec<u8>> {
        let ciphertext = crypto::aes_cbc_encrypt(key, iv, &self.to_cleartext()?)?;

        let mut wire = Vec::with_capacity(ENVELOPE_HEADER_LEN + ciphertext.len());
        wire.push(security_flag);
        wire.extend_from_slice(iv);
        wire.extend_from_slice(&ciphertext);
        Ok(wire)
    }
}

// ----------------------------------------------------------------------------
// Envelope
// ----------------------------------------------------------------------------

/// Security flag, IV and ciphertext of a received message
#[derive(Debug, Clone, Copy)]
pub struct Envelope<'a> {
    pub security_flag: u8,
    pub iv: [u8; BLOCK_SIZE],
    pub ciphertext: &'a [u8],
}

impl<'a> Envelope<'a> {
    /// Split wire bytes into their envelope fields
    pub fn parse(wire: &'a [u8]) -> Result<Self> {
        if wire.len() <= ENVELOPE_HEADER_LEN {
            return Err(ProtocolError::malformed(format!(
                "message too short: {} bytes",
                wire.len()
            )));
        }

        let mut iv = [0u8; BLOCK_SIZE];
        iv.copy_from_slice(&wire[1..ENVELOPE_HEADER_LEN]);

        Ok(Self {
            security_flag: wire[0],
            iv,
            ciphertext: &wire[ENVELOPE_HEADER_LEN..],
        })
    }

    /// Decrypt with `key` and parse the frame inside
    pub fn open(&self, key: &[u8; KEY_SIZE]) -> Result<Frame> {
        let cleartext = crypto::aes_cbc_decrypt(key, &self.iv, self.ciphertext)?;
        Frame::from_cleartext(&cleartext)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
