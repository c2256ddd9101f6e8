//! MTU-bounded packet fragmentation and reassembly
//!
//! An encrypted message is written to the device as a run of GATT writes no
//! larger than [`GATT_MTU`] bytes each.
//!
//! ## Packet Format
//!
//! - First packet: `index:u8 = 0`, `total_len:u8`, `version << 4:u8`, chunk (≤ 17 bytes)
//! - Continuation packets: `index:u8`, chunk (≤ 19 bytes)
//!
//! Indices increase by one per packet within a message. The receiving side
//! restarts on every index-0 packet and otherwise only accepts indices greater
//! than the last one it took.

use tracing::{debug, warn};

use crate::{ProtocolError, Result};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Maximum bytes per GATT write or notification for these devices
pub const GATT_MTU: usize = 20;

/// Protocol version carried in the high nibble of the first packet's third byte
pub const PROTOCOL_VERSION: u8 = 2;

/// Header bytes in the first packet of a message
pub const FIRST_PACKET_HEADER_LEN: usize = 3;

/// Header bytes in every continuation packet
pub const CONTINUATION_HEADER_LEN: usize = 1;

/// Largest message expressible with a one-byte total length
pub const MAX_MESSAGE_LEN: usize = u8::MAX as usize;

// ----------------------------------------------------------------------------
// Fragmentation
// ----------------------------------------------------------------------------

/// Split an encrypted message into packets that each fit in one GATT write
///
/// An empty message still produces the first packet so the receiver sees a
/// complete zero-length message.
pub fn split_packets(message: &[u8]) -> Result<Vec<Vec<u8>>> {
    if message.len() > MAX_MESSAGE_LEN {
        return Err(ProtocolError::MessageTooLarge {
            size: message.len(),
            max_size: MAX_MESSAGE_LEN,
        });
    }

    let first_chunk = GATT_MTU - FIRST_PACKET_HEADER_LEN;
    let rest_chunk = GATT_MTU - CONTINUATION_HEADER_LEN;

    let (head, mut rest) = message.split_at(message.len().min(first_chunk));
    let mut packets = Vec::with_capacity(1 + rest.len().div_ceil(rest_chunk));

    let mut first = Vec::with_capacity(FIRST_PACKET_HEADER_LEN + head.len());
    first.push(0);
    first.push(message.len() as u8);
    first.push(PROTOCOL_VERSION << 4);
    first.extend_from_slice(head);
    packets.push(first);

    let mut index: u8 = 1;
    while !rest.is_empty() {
        let (chunk, tail) = rest.split_at(rest.len().min(rest_chunk));
        let mut packet = Vec::with_capacity(CONTINUATION_HEADER_LEN + chunk.len());
        packet.push(index);
        packet.extend_from_slice(chunk);
        packets.push(packet);
        rest = tail;
        index = index.wrapping_add(1);
    }

    Ok(packets)
}

// ----------------------------------------------------------------------------
// Reassembly
// ----------------------------------------------------------------------------

/// Message currently being collected
#[derive(Debug, Clone)]
struct PendingMessage {
    /// Declared total length from packet 0
    total_len: usize,
    /// Protocol version nibble from packet 0
    version: u8,
    /// Last accepted packet index
    last_index: u8,
    /// Accumulated chunks
    buffer: Vec<u8>,
}

/// Rebuilds messages from notification packets, one message at a time
#[derive(Debug, Clone, Default)]
pub struct PacketReassembler {
    pending: Option<PendingMessage>,
}

impl PacketReassembler {
    /// Create an empty reassembler
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one packet; returns the message once its declared length is reached
    ///
    /// Out-of-order, repeated and orphaned continuation packets are ignored.
    pub fn accept(&mut self, packet: &[u8]) -> Option<Vec<u8>> {
        let (&index, body) = packet.split_first()?;

        if index == 0 {
            if body.len() < FIRST_PACKET_HEADER_LEN - 1 {
                warn!("Dropping truncated first packet ({} bytes)", packet.len());
                self.pending = None;
                return None;
            }
            self.pending = Some(PendingMessage {
                total_len: usize::from(body[0]),
                version: body[1] >> 4,
                last_index: 0,
                buffer: Vec::with_capacity(usize::from(body[0])),
            });
            return self.append(&body[2..]);
        }

        match self.pending.as_mut() {
            Some(pending) if index > pending.last_index => {
                pending.last_index = index;
                self.append(body)
            }
            Some(pending) => {
                debug!(
                    "Ignoring packet {} after {} in current message",
                    index, pending.last_index
                );
                None
            }
            None => {
                debug!("Ignoring packet {} with no message in progress", index);
                None
            }
        }
    }

    fn append(&mut self, chunk: &[u8]) -> Option<Vec<u8>> {
        let pending = self.pending.as_mut()?;
        pending.buffer.extend_from_slice(chunk);

        if pending.buffer.len() == pending.total_len {
            return self.pending.take().map(|p| p.buffer);
        }
        if pending.buffer.len() > pending.total_len {
            warn!(
                "Discarding message: {} bytes received, {} declared",
                pending.buffer.len(),
                pending.total_len
            );
            self.pending = None;
        }
        None
    }

    /// Protocol version declared by the message in progress
    pub fn protocol_version(&self) -> Option<u8> {
        self.pending.as_ref().map(|p| p.version)
    }

    /// Bytes collected so far for the message in progress
    pub fn buffered_len(&self) -> usize {
        self.pending.as_ref().map_or(0, |p| p.buffer.len())
    }

    /// Index of the last accepted packet of the message in progress
    pub fn last_index(&self) -> Option<u8> {
        self.pending.as_ref().map(|p| p.last_index)
    }

    /// Whether a message is partially collected
    pub fn is_idle(&self) -> bool {
        self.pending.is_none()
    }

    /// Drop any partially collected message
    pub fn reset(&mut self) {
        self.pending = None;
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
