//! Checksum and cipher primitives used by the device protocol
//!
//! - XOR checksum for the simple single-byte framed devices
//! - CRC16/MODBUS over the cleartext of every encrypted frame
//! - zero padding to a block multiple
//! - random 16-byte IVs and AES-128-CBC without padding
//! - MD5 key derivation

use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use md5::{Digest, Md5};
use rand_core::{OsRng, RngCore};

use crate::{ProtocolError, Result};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// AES block size, also the IV length
pub const BLOCK_SIZE: usize = 16;

/// Length of an AES-128 key and of an MD5 digest
pub const KEY_SIZE: usize = 16;

const CRC16_MODBUS_INIT: u16 = 0xFFFF;
const CRC16_MODBUS_POLY: u16 = 0xA001;

// ----------------------------------------------------------------------------
// Checksums
// ----------------------------------------------------------------------------

/// XOR of every byte in `data`
///
/// Checksum used by accessories with unencrypted framing, such as AM43 blind
/// motors; the Tuya path uses [`crc16_modbus`].
pub fn xor_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, byte| acc ^ byte)
}

/// CRC16/MODBUS (reflected polynomial 0xA001, initial value 0xFFFF)
pub fn crc16_modbus(data: &[u8]) -> u16 {
    let mut crc = CRC16_MODBUS_INIT;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            let carry = crc & 0x0001;
            crc >>= 1;
            if carry != 0 {
                crc ^= CRC16_MODBUS_POLY;
            }
        }
    }
    crc
}

// ----------------------------------------------------------------------------
// Padding and Randomness
// ----------------------------------------------------------------------------

/// Append zero bytes until the length is a multiple of `multiple`
pub fn pad_to_multiple(data: &[u8], multiple: usize) -> Vec<u8> {
    let mut padded = data.to_vec();
    if multiple > 0 {
        let remainder = padded.len() % multiple;
        if remainder != 0 {
            padded.resize(padded.len() + multiple - remainder, 0);
        }
    }
    padded
}

/// Fresh random IV from the operating system RNG
pub fn random_iv() -> [u8; BLOCK_SIZE] {
    let mut iv = [0u8; BLOCK_SIZE];
    OsRng.fill_bytes(&mut iv);
    iv
}

// ----------------------------------------------------------------------------
// Key Derivation
// ----------------------------------------------------------------------------

/// MD5 over the concatenation of `parts`
pub fn md5_concat(parts: &[&[u8]]) -> [u8; KEY_SIZE] {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

// ----------------------------------------------------------------------------
// AES-128-CBC
// ----------------------------------------------------------------------------

/// Encrypt block-aligned `cleartext`; callers pad first
pub fn aes_cbc_encrypt(key: &[u8; KEY_SIZE], iv: &[u8; BLOCK_SIZE], cleartext: &[u8]) -> Result<Vec<u8>> {
    if cleartext.len() % BLOCK_SIZE != 0 {
        return Err(ProtocolError::malformed(format!(
            "cleartext length {} is not a multiple of {}",
            cleartext.len(),
            BLOCK_SIZE
        )));
    }
    let cipher = Aes128CbcEnc::new_from_slices(key, iv)
        .map_err(|e| ProtocolError::Decrypt(e.to_string()))?;
    Ok(cipher.encrypt_padded_vec_mut::<NoPadding>(cleartext))
}

/// Decrypt block-aligned `ciphertext`, leaving any zero padding in place
pub fn aes_cbc_decrypt(key: &[u8; KEY_SIZE], iv: &[u8; BLOCK_SIZE], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(ProtocolError::Decrypt(format!(
            "ciphertext length {} is not a positive multiple of {}",
            ciphertext.len(),
            BLOCK_SIZE
        )));
    }
    let cipher = Aes128CbcDec::new_from_slices(key, iv)
        .map_err(|e| ProtocolError::Decrypt(e.to_string()))?;
    cipher
        .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
        .map_err(|e| ProtocolError::Decrypt(e.to_string()))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
