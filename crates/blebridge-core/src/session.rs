//! Per-connection session state
//!
//! A [`Session`] holds the key table, the outbound sequence counter and the
//! handshake state for exactly one physical connection. The server random that
//! keys security flag 5 is only valid for the connection it was negotiated on,
//! so the owner throws the whole session away on every disconnect.

use smallvec::SmallVec;

use crate::crypto::{self, KEY_SIZE};
use crate::frame::{Envelope, Frame};
use crate::{ProtocolError, Result};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Key derived from the login key alone, used for the device info exchange
pub const SECURITY_FLAG_LOGIN: u8 = 4;

/// Key derived from the login key and the server random
pub const SECURITY_FLAG_SESSION: u8 = 5;

/// Number of local key characters that form the login key
pub const LOGIN_KEY_LEN: usize = 6;

/// Fixed size of the pairing payload
pub const PAIR_PAYLOAD_LEN: usize = 44;

/// Size of the device info reply this implementation understands
pub const DEVICE_INFO_LEN: usize = 46;

/// Length of the server random carried in the device info reply
pub const SERVER_RANDOM_LEN: usize = 6;

// ----------------------------------------------------------------------------
// Handshake State
// ----------------------------------------------------------------------------

/// Pairing progress of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeState {
    /// Fresh session, only the login key is usable
    Unpaired,
    /// Device info request sent
    InfoRequested,
    /// Server random received and the session key derived
    InfoReceived,
    /// Pair request sent
    AwaitingPairAck,
    /// Application commands may be sent
    Paired,
}

// ----------------------------------------------------------------------------
// Device Credentials
// ----------------------------------------------------------------------------

/// Per-device secrets issued by the vendor cloud
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceCredentials {
    uuid: Vec<u8>,
    device_id: Vec<u8>,
    login_key: [u8; LOGIN_KEY_LEN],
}

impl DeviceCredentials {
    /// Validate and build credentials from their string forms
    pub fn new(uuid: &str, device_id: &str, local_key: &str) -> Result<Self> {
        let key_bytes = local_key.as_bytes();
        if !local_key.is_ascii() || key_bytes.len() < LOGIN_KEY_LEN {
            return Err(ProtocolError::InvalidCredentials(format!(
                "local key must be at least {} ASCII characters",
                LOGIN_KEY_LEN
            )));
        }
        if !uuid.is_ascii() || !device_id.is_ascii() {
            return Err(ProtocolError::InvalidCredentials(
                "uuid and device id must be ASCII".into(),
            ));
        }
        let pair_len = uuid.len() + LOGIN_KEY_LEN + device_id.len();
        if pair_len > PAIR_PAYLOAD_LEN {
            return Err(ProtocolError::InvalidCredentials(format!(
                "uuid and device id take {} of {} pairing bytes",
                pair_len, PAIR_PAYLOAD_LEN
            )));
        }

        let mut login_key = [0u8; LOGIN_KEY_LEN];
        login_key.copy_from_slice(&key_bytes[..LOGIN_KEY_LEN]);

        Ok(Self {
            uuid: uuid.as_bytes().to_vec(),
            device_id: device_id.as_bytes().to_vec(),
            login_key,
        })
    }

    /// Login key: the first six characters of the local key
    pub fn login_key(&self) -> &[u8; LOGIN_KEY_LEN] {
        &self.login_key
    }

    /// `uuid ‖ login_key ‖ device_id`, zero-padded to 44 bytes
    pub fn pair_payload(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(PAIR_PAYLOAD_LEN);
        data.extend_from_slice(&self.uuid);
        data.extend_from_slice(&self.login_key);
        data.extend_from_slice(&self.device_id);
        crypto::pad_to_multiple(&data, PAIR_PAYLOAD_LEN)
    }
}

impl core::fmt::Debug for DeviceCredentials {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DeviceCredentials")
            .field("uuid", &String::from_utf8_lossy(&self.uuid))
            .field("device_id", &String::from_utf8_lossy(&self.device_id))
            .field("login_key", &"<redacted>")
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Device Info
// ----------------------------------------------------------------------------

/// Parsed device info reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_version: (u8, u8),
    pub protocol_version: (u8, u8),
    pub flag: u8,
    pub is_bound: bool,
    pub server_random: [u8; SERVER_RANDOM_LEN],
    pub hardware_version: (u8, u8),
    pub auth_key: [u8; 32],
}

impl DeviceInfo {
    /// Parse the reply body; devices older than protocol 3 are rejected
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < DEVICE_INFO_LEN {
            return Err(ProtocolError::malformed(format!(
                "device info needs {} bytes, got {}",
                DEVICE_INFO_LEN,
                data.len()
            )));
        }

        let protocol_version = (data[2], data[3]);
        if protocol_version.0 <= 2 {
            return Err(ProtocolError::UnsupportedVersion {
                major: protocol_version.0,
                minor: protocol_version.1,
            });
        }

        let mut server_random = [0u8; SERVER_RANDOM_LEN];
        server_random.copy_from_slice(&data[6..12]);
        let mut auth_key = [0u8; 32];
        auth_key.copy_from_slice(&data[14..46]);

        Ok(Self {
            device_version: (data[0], data[1]),
            protocol_version,
            flag: data[4],
            is_bound: data[5] != 0,
            server_random,
            hardware_version: (data[12], data[13]),
            auth_key,
        })
    }

    /// Serialize back to the reply layout
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(DEVICE_INFO_LEN);
        bytes.extend_from_slice(&[
            self.device_version.0,
            self.device_version.1,
            self.protocol_version.0,
            self.protocol_version.1,
            self.flag,
            u8::from(self.is_bound),
        ]);
        bytes.extend_from_slice(&self.server_random);
        bytes.extend_from_slice(&[self.hardware_version.0, self.hardware_version.1]);
        bytes.extend_from_slice(&self.auth_key);
        bytes
    }
}

// ----------------------------------------------------------------------------
// Session
// ----------------------------------------------------------------------------

/// Key table, sequence counter and handshake state for one connection
#[derive(Debug, Clone)]
pub struct Session {
    login_key: [u8; LOGIN_KEY_LEN],
    keys: SmallVec<[(u8, [u8; KEY_SIZE]); 2]>,
    last_sequence: u32,
    state: HandshakeState,
}

impl Session {
    /// Fresh session; the flag-4 key is available immediately
    pub fn new(login_key: [u8; LOGIN_KEY_LEN]) -> Self {
        let mut keys = SmallVec::new();
        keys.push((SECURITY_FLAG_LOGIN, crypto::md5_concat(&[&login_key])));
        Self {
            login_key,
            keys,
            last_sequence: 0,
            state: HandshakeState::Unpaired,
        }
    }

    /// Session for the given credentials
    pub fn for_credentials(credentials: &DeviceCredentials) -> Self {
        Self::new(*credentials.login_key())
    }

    /// Current handshake state
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: HandshakeState) {
        self.state = state;
    }

    /// Whether the flag-5 key has been derived
    pub fn has_session_key(&self) -> bool {
        self.keys.iter().any(|(flag, _)| *flag == SECURITY_FLAG_SESSION)
    }

    /// Key for a security flag
    pub fn key(&self, security_flag: u8) -> Result<&[u8; KEY_SIZE]> {
        if let Some((_, key)) = self.keys.iter().find(|(flag, _)| *flag == security_flag) {
            return Ok(key);
        }
        match security_flag {
            SECURITY_FLAG_SESSION => Err(ProtocolError::KeyUnavailable(security_flag)),
            other => Err(ProtocolError::UnknownSecurityFlag(other)),
        }
    }

    /// Derive the flag-5 key as MD5(login_key ‖ server_random)
    pub fn set_server_random(&mut self, server_random: &[u8]) {
        let key = crypto::md5_concat(&[&self.login_key, server_random]);
        self.keys.retain(|(flag, _)| *flag != SECURITY_FLAG_SESSION);
        self.keys.push((SECURITY_FLAG_SESSION, key));
    }

    /// Claim the next outbound sequence number
    pub fn next_sequence(&mut self) -> Result<u32> {
        let next = self
            .last_sequence
            .checked_add(1)
            .ok_or(ProtocolError::SequenceExhausted)?;
        self.last_sequence = next;
        Ok(next)
    }

    /// Build and encrypt an outbound message under `security_flag`
    pub fn seal(&mut self, code: u16, payload: &[u8], security_flag: u8, ack_sequence: u32) -> Result<Vec<u8>> {
        // Resolve the key before burning a sequence number
        let key = *self.key(security_flag)?;
        let frame = Frame::new(self.next_sequence()?, ack_sequence, code, payload.to_vec());
        frame.seal(security_flag, &key)
    }

    /// Decrypt and authenticate a reassembled inbound message
    pub fn open(&self, wire: &[u8]) -> Result<Frame> {
        let envelope = Envelope::parse(wire)?;
        envelope.open(self.key(envelope.security_flag)?)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
