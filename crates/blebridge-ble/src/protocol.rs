//! GATT identifiers

use uuid::Uuid;

use crate::error::{GatewayError, GatewayResult};

// ----------------------------------------------------------------------------
// Short UUID Expansion
// ----------------------------------------------------------------------------

const BASE_UUID_TAIL: u128 = 0x00000000_0000_1000_8000_00805F9B34FB;

/// Bluetooth base UUID `00000000-0000-1000-8000-00805f9b34fb`
pub const BLUETOOTH_BASE_UUID: Uuid = Uuid::from_u128(BASE_UUID_TAIL);

/// Expand a 16- or 32-bit short identifier at compile time
pub const fn short_uuid(short: u32) -> Uuid {
    Uuid::from_u128(BASE_UUID_TAIL | ((short as u128) << 96))
}

/// Expand a short hex identifier such as `"2b10"`
///
/// Left-pads to eight hex digits and appends the base UUID tail. A full
/// 128-bit UUID string is accepted unchanged.
pub fn expand_uuid(short: &str) -> GatewayResult<Uuid> {
    let expanded = if short.len() <= 8 {
        format!("{:0>8}-0000-1000-8000-00805f9b34fb", short)
    } else {
        short.to_string()
    };
    Uuid::parse_str(&expanded)
        .map_err(|e| GatewayError::Config(format!("Invalid characteristic id {:?}: {}", short, e)))
}

// ----------------------------------------------------------------------------
// Tuya Fingerbot Characteristics
// ----------------------------------------------------------------------------

/// Notifications from the device
pub const FINGERBOT_NOTIFY_CHARACTERISTIC_UUID: Uuid = short_uuid(0x2b10);

/// Writes to the device
pub const FINGERBOT_WRITE_CHARACTERISTIC_UUID: Uuid = short_uuid(0x2b11);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_short_uuid() {
        let uuid = expand_uuid("2b10").unwrap();
        assert_eq!(uuid.to_string(), "00002b10-0000-1000-8000-00805f9b34fb");
        assert_eq!(uuid, FINGERBOT_NOTIFY_CHARACTERISTIC_UUID);
    }

    #[test]
    fn test_expand_32_bit_uuid() {
        assert_eq!(
            expand_uuid("0000fe95").unwrap(),
            short_uuid(0xfe95)
        );
        assert_eq!(
            short_uuid(0x1234_5678).to_string(),
            "12345678-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_expand_rejects_garbage() {
        assert!(matches!(expand_uuid("zz"), Err(GatewayError::Config(_))));
    }

    #[test]
    fn test_full_uuid_passthrough() {
        let full = "6e400001-b5a3-f393-e0a9-e50e24dcca9e";
        assert_eq!(expand_uuid(full).unwrap().to_string(), full);
    }
}
