//! BLE Bridge Core Protocol Implementation
//!
//! This crate provides the I/O-free half of the gateway: checksum and cipher
//! primitives, MTU-bounded packet fragmentation, the encrypted frame codec, the
//! per-connection session key table and the pairing handshake state machine
//! used by Tuya-style BLE accessories.
//!
//! Nothing in here touches a radio. The async side (`blebridge-ble`) feeds
//! received notification bytes into a [`SecureChannel`] and writes the packets
//! it produces.
//!
//! ## Outbound path
//!
//! ```rust
//! use blebridge_core::{split_packets, DataPoint, DeviceCredentials, SecureChannel};
//!
//! # fn example() -> blebridge_core::Result<()> {
//! let credentials = DeviceCredentials::new("tuyaf1e2d3c4b5a6", "a1b2c3d4e5f60718", "k3y5ecretxyz")?;
//! let mut channel = SecureChannel::new(credentials);
//!
//! // The first step of the handshake is available right away
//! let request = channel.device_info_request()?;
//! for packet in split_packets(&request)? {
//!     assert!(packet.len() <= 20);
//! }
//!
//! // Commands are refused until the handshake completes
//! assert!(channel.command_request(&[DataPoint::boolean(101, true)]).is_err());
//! # Ok(())
//! # }
//! ```

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod channel;
pub mod command;
pub mod crypto;
pub mod error;
pub mod frame;
pub mod packet;
pub mod session;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use channel::{ChannelEvent, SecureChannel};
pub use command::{decode_data_points, encode_data_points, DataPoint, DataType, DataValue, TuyaCode};
pub use error::{ProtocolError, Result};
pub use frame::{Frame, FRAME_HEADER_LEN};
pub use packet::{split_packets, PacketReassembler, GATT_MTU, PROTOCOL_VERSION};
pub use session::{
    DeviceCredentials, DeviceInfo, HandshakeState, Session, SECURITY_FLAG_LOGIN,
    SECURITY_FLAG_SESSION,
};
