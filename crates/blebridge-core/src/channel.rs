//! Secure channel: handshake state machine over an encrypted packet stream
//!
//! ```text
//! Unpaired --device_info_request--> InfoRequested
//! InfoRequested --DeviceInfo reply--> InfoReceived   (flag-5 key derived)
//! InfoReceived --pair_request--> AwaitingPairAck
//! AwaitingPairAck --Pair reply--> Paired
//! ```
//!
//! The channel never performs I/O. Outbound methods return a sealed message
//! for [`split_packets`](crate::split_packets); inbound packets go through
//! [`SecureChannel::accept_packet`].

use tracing::{debug, info};

use crate::command::{decode_data_points, encode_data_points, DataPoint, TuyaCode};
use crate::frame::Frame;
use crate::packet::PacketReassembler;
use crate::session::{
    DeviceCredentials, DeviceInfo, HandshakeState, Session, SECURITY_FLAG_LOGIN,
    SECURITY_FLAG_SESSION,
};
use crate::{ProtocolError, Result};

/// Digits of the millisecond timestamp in a time reply
const TIME_DIGITS: usize = 13;

// ----------------------------------------------------------------------------
// Channel Events
// ----------------------------------------------------------------------------

/// Outcome of one authenticated inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Device info received and the session key derived
    SessionUpdated(DeviceInfo),
    /// Pairing acknowledged
    Paired,
    /// Device reported data point values
    DataPoints(Vec<DataPoint>),
    /// Device asked for the current time; answer with [`SecureChannel::time_response`]
    TimeRequested { sequence: u32 },
    /// Any other message
    Message(Frame),
}

// ----------------------------------------------------------------------------
// Secure Channel
// ----------------------------------------------------------------------------

/// Session, reassembly buffer and handshake driver for one device link
#[derive(Debug, Clone)]
pub struct SecureChannel {
    credentials: DeviceCredentials,
    session: Session,
    reassembler: PacketReassembler,
}

impl SecureChannel {
    /// Create a channel in the `Unpaired` state
    pub fn new(credentials: DeviceCredentials) -> Self {
        let session = Session::for_credentials(&credentials);
        Self {
            credentials,
            session,
            reassembler: PacketReassembler::new(),
        }
    }

    /// Current handshake state
    pub fn state(&self) -> HandshakeState {
        self.session.state()
    }

    /// Whether application commands may be sent
    pub fn is_paired(&self) -> bool {
        self.session.state() == HandshakeState::Paired
    }

    /// Session backing this channel
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Discard the session and any half-received message
    ///
    /// Called on every disconnect: the negotiated server random belongs to the
    /// physical connection that produced it.
    pub fn reset(&mut self) {
        self.session = Session::for_credentials(&self.credentials);
        self.reassembler.reset();
    }

    // ------------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------------

    /// Build the device info request and move to `InfoRequested`
    pub fn device_info_request(&mut self) -> Result<Vec<u8>> {
        self.expect_state(&[HandshakeState::Unpaired, HandshakeState::InfoRequested])?;
        let message = self.session.seal(
            TuyaCode::DeviceInfo.into(),
            &[],
            SECURITY_FLAG_LOGIN,
            0,
        )?;
        self.session.set_state(HandshakeState::InfoRequested);
        Ok(message)
    }

    /// Build the pair request and move to `AwaitingPairAck`
    pub fn pair_request(&mut self) -> Result<Vec<u8>> {
        self.expect_state(&[HandshakeState::InfoReceived, HandshakeState::AwaitingPairAck])?;
        let message = self.session.seal(
            TuyaCode::Pair.into(),
            &self.credentials.pair_payload(),
            SECURITY_FLAG_SESSION,
            0,
        )?;
        self.session.set_state(HandshakeState::AwaitingPairAck);
        Ok(message)
    }

    /// Build a DPS command message; refused until paired
    pub fn command_request(&mut self, points: &[DataPoint]) -> Result<Vec<u8>> {
        if !self.is_paired() {
            return Err(ProtocolError::NotPaired);
        }
        let body = encode_data_points(points)?;
        self.session
            .seal(TuyaCode::Dps.into(), &body, SECURITY_FLAG_SESSION, 0)
    }

    /// Build the reply to a device time request
    ///
    /// Body: 13 ASCII digits of the Unix time in milliseconds followed by the
    /// UTC offset in hundredths of an hour (i16, big-endian). A fixed offset
    /// only; daylight saving is the caller's concern.
    pub fn time_response(&mut self, unix_millis: u64, utc_offset_secs: i32) -> Result<Vec<u8>> {
        let mut body = format!("{:0width$}", unix_millis, width = TIME_DIGITS).into_bytes();
        body.truncate(TIME_DIGITS);
        let offset = i16::try_from(utc_offset_secs / 36).unwrap_or(0);
        body.extend_from_slice(&offset.to_be_bytes());

        self.session.seal(
            TuyaCode::Time1Request.into(),
            &body,
            SECURITY_FLAG_SESSION,
            0,
        )
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    /// Feed one notification packet
    ///
    /// Returns `None` while a message is still incomplete. A protocol error
    /// concerns only the message it came with; the channel stays usable.
    pub fn accept_packet(&mut self, packet: &[u8]) -> Option<Result<ChannelEvent>> {
        let message = self.reassembler.accept(packet)?;
        Some(self.handle_message(&message))
    }

    /// Decrypt one reassembled message and advance the handshake
    pub fn handle_message(&mut self, message: &[u8]) -> Result<ChannelEvent> {
        let frame = self.session.open(message)?;
        debug!(
            "Received code {:#06x} seq {} payload {}",
            frame.code,
            frame.sequence,
            hex::encode(&frame.payload)
        );

        match TuyaCode::try_from(frame.code) {
            Ok(TuyaCode::DeviceInfo) => {
                self.expect_state(&[
                    HandshakeState::Unpaired,
                    HandshakeState::InfoRequested,
                    HandshakeState::InfoReceived,
                ])?;
                let device_info = DeviceInfo::parse(&frame.payload)?;
                self.session.set_server_random(&device_info.server_random);
                self.session.set_state(HandshakeState::InfoReceived);
                info!(
                    "Session key derived (device {}.{}, protocol {}.{})",
                    device_info.device_version.0,
                    device_info.device_version.1,
                    device_info.protocol_version.0,
                    device_info.protocol_version.1
                );
                Ok(ChannelEvent::SessionUpdated(device_info))
            }
            Ok(TuyaCode::Pair) => {
                self.expect_state(&[HandshakeState::AwaitingPairAck])?;
                self.session.set_state(HandshakeState::Paired);
                info!("Pairing acknowledged");
                Ok(ChannelEvent::Paired)
            }
            Ok(TuyaCode::ReceiveDp) => Ok(ChannelEvent::DataPoints(decode_data_points(&frame.payload)?)),
            Ok(TuyaCode::Time1Request) => Ok(ChannelEvent::TimeRequested {
                sequence: frame.sequence,
            }),
            _ => Ok(ChannelEvent::Message(frame)),
        }
    }

    fn expect_state(&self, allowed: &[HandshakeState]) -> Result<()> {
        let actual = self.session.state();
        if allowed.contains(&actual) {
            Ok(())
        } else {
            Err(ProtocolError::InvalidHandshakeState {
                expected: allowed[0],
                actual,
            })
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> DeviceCredentials {
        DeviceCredentials::new("tuya0123456789ab", "bf0123456789abcd", "a1b2c3d4e5f6").unwrap()
    }

    #[test]
    fn test_request_ordering_enforced() {
        let mut channel = SecureChannel::new(credentials());
        assert!(matches!(
            channel.pair_request(),
            Err(ProtocolError::InvalidHandshakeState {
                actual: HandshakeState::Unpaired,
                ..
            })
        ));

        channel.device_info_request().unwrap();
        assert_eq!(channel.state(), HandshakeState::InfoRequested);
        // Resending is allowed while waiting
        channel.device_info_request().unwrap();
        assert_eq!(channel.state(), HandshakeState::InfoRequested);
    }

    #[test]
    fn test_command_refused_before_pairing() {
        let mut channel = SecureChannel::new(credentials());
        assert_eq!(
            channel.command_request(&[DataPoint::boolean(101, true)]),
            Err(ProtocolError::NotPaired)
        );
    }

    #[test]
    fn test_device_info_request_uses_login_key() {
        let mut channel = SecureChannel::new(credentials());
        let message = channel.device_info_request().unwrap();
        assert_eq!(message[0], SECURITY_FLAG_LOGIN);

        let frame = channel.session().open(&message).unwrap();
        assert_eq!(frame.code, u16::from(TuyaCode::DeviceInfo));
        assert_eq!(frame.sequence, 1);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn test_reset_discards_session() {
        let mut channel = SecureChannel::new(credentials());
        channel.device_info_request().unwrap();
        channel.reset();
        assert_eq!(channel.state(), HandshakeState::Unpaired);
        assert!(!channel.session().has_session_key());
    }
}
