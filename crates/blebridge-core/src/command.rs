//! Message codes and the data point (DP) command codec
//!
//! A command message is a concatenation of data points:
//!
//! - id: 1 byte
//! - type: 1 byte ([`DataType`])
//! - length: 1 byte
//! - value: `length` bytes
//!
//! Raw values carry their own type and length bytes and are written after the
//! id untouched.

use crate::{ProtocolError, Result};

// ----------------------------------------------------------------------------
// Message Codes
// ----------------------------------------------------------------------------

/// Message codes understood by the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum TuyaCode {
    DeviceInfo = 0,
    Pair = 1,
    Dps = 2,
    DeviceStatus = 3,
    ReceiveDp = 0x8001,
    Time1Request = 0x8011,
}

impl TryFrom<u16> for TuyaCode {
    type Error = u16;

    fn try_from(value: u16) -> core::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::DeviceInfo),
            1 => Ok(Self::Pair),
            2 => Ok(Self::Dps),
            3 => Ok(Self::DeviceStatus),
            0x8001 => Ok(Self::ReceiveDp),
            0x8011 => Ok(Self::Time1Request),
            other => Err(other),
        }
    }
}

impl From<TuyaCode> for u16 {
    fn from(code: TuyaCode) -> Self {
        code as u16
    }
}

// ----------------------------------------------------------------------------
// Data Types
// ----------------------------------------------------------------------------

/// Wire type tag of a data point value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DataType {
    Raw = 0,
    Boolean = 1,
    Integer = 2,
    String = 3,
    Enum = 4,
}

impl TryFrom<u8> for DataType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Raw),
            1 => Ok(Self::Boolean),
            2 => Ok(Self::Integer),
            3 => Ok(Self::String),
            4 => Ok(Self::Enum),
            other => Err(ProtocolError::malformed(format!("unknown data type {}", other))),
        }
    }
}

/// Value of one data point
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataValue {
    Boolean(bool),
    Integer(u32),
    String(String),
    Enum(u8),
    /// Pre-encoded bytes, written verbatim after the id
    Raw(Vec<u8>),
}

impl DataValue {
    /// Type tag this value is written with
    pub fn data_type(&self) -> DataType {
        match self {
            Self::Boolean(_) => DataType::Boolean,
            Self::Integer(_) => DataType::Integer,
            Self::String(_) => DataType::String,
            Self::Enum(_) => DataType::Enum,
            Self::Raw(_) => DataType::Raw,
        }
    }
}

/// One device attribute write or report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPoint {
    pub id: u8,
    pub value: DataValue,
}

impl DataPoint {
    pub fn new(id: u8, value: DataValue) -> Self {
        Self { id, value }
    }

    pub fn boolean(id: u8, value: bool) -> Self {
        Self::new(id, DataValue::Boolean(value))
    }

    pub fn integer(id: u8, value: u32) -> Self {
        Self::new(id, DataValue::Integer(value))
    }

    pub fn string(id: u8, value: impl Into<String>) -> Self {
        Self::new(id, DataValue::String(value.into()))
    }

    pub fn enumeration(id: u8, value: u8) -> Self {
        Self::new(id, DataValue::Enum(value))
    }

    pub fn raw(id: u8, bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(id, DataValue::Raw(bytes.into()))
    }

    fn encode_into(&self, out: &mut Vec<u8>) -> Result<()> {
        out.push(self.id);
        match &self.value {
            DataValue::Boolean(value) => {
                out.extend_from_slice(&[DataType::Boolean as u8, 1, u8::from(*value)]);
            }
            DataValue::Integer(value) => {
                out.extend_from_slice(&[DataType::Integer as u8, 4]);
                out.extend_from_slice(&value.to_be_bytes());
            }
            DataValue::String(value) => {
                let len = u8::try_from(value.len()).map_err(|_| ProtocolError::ValueTooLarge {
                    id: self.id,
                    len: value.len(),
                })?;
                out.extend_from_slice(&[DataType::String as u8, len]);
                out.extend_from_slice(value.as_bytes());
            }
            DataValue::Enum(value) => {
                out.extend_from_slice(&[DataType::Enum as u8, 1, *value]);
            }
            DataValue::Raw(bytes) => out.extend_from_slice(bytes),
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Codec
// ----------------------------------------------------------------------------

/// Concatenate data points into one DPS message body
pub fn encode_data_points(points: &[DataPoint]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for point in points {
        point.encode_into(&mut out)?;
    }
    Ok(out)
}

/// Parse a DP report body back into data points
///
/// Every entry must carry a type and length; raw entries come back as
/// [`DataValue::Raw`] holding only the value bytes.
pub fn decode_data_points(mut data: &[u8]) -> Result<Vec<DataPoint>> {
    let mut points = Vec::new();
    while !data.is_empty() {
        if data.len() < 3 {
            return Err(ProtocolError::malformed("truncated data point header"));
        }
        let (id, data_type, len) = (data[0], DataType::try_from(data[1])?, usize::from(data[2]));
        let value_bytes = data
            .get(3..3 + len)
            .ok_or_else(|| ProtocolError::malformed(format!("data point {} truncated", id)))?;

        let value = match data_type {
            DataType::Boolean => DataValue::Boolean(value_bytes.first().copied().unwrap_or(0) != 0),
            DataType::Integer => {
                let bytes: [u8; 4] = value_bytes.try_into().map_err(|_| {
                    ProtocolError::malformed(format!("integer data point {} has {} bytes", id, len))
                })?;
                DataValue::Integer(u32::from_be_bytes(bytes))
            }
            DataType::String => DataValue::String(String::from_utf8_lossy(value_bytes).into_owned()),
            DataType::Enum => DataValue::Enum(value_bytes.first().copied().unwrap_or(0)),
            DataType::Raw => DataValue::Raw(value_bytes.to_vec()),
        };

        points.push(DataPoint::new(id, value));
        data = &data[3 + len..];
    }
    Ok(points)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
