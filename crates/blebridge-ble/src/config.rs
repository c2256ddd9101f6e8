//! Gateway configuration
//!
//! A typed record handed in by whoever loads configuration. Durations use
//! serde's default `{ secs, nanos }` representation.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};

// ----------------------------------------------------------------------------
// Gateway Configuration
// ----------------------------------------------------------------------------

/// Connection scheduling and retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Maximum number of concurrently connected links
    pub pool_capacity: usize,
    /// Transport connect attempts before giving up
    pub connect_attempts: u32,
    /// Sleep between connect attempts, taken with the pool lock released
    pub connect_backoff: Duration,
    /// Bound on the rescan triggered by a device-not-found failure
    pub scan_timeout: Duration,
    /// Write attempts per `Link::send`
    pub send_retries: u32,
    /// Sleep after a failed write before reconnecting
    pub send_backoff: Duration,
    /// Buffered notifications per stream subscriber
    pub notification_queue_depth: usize,
    /// Bound on each handshake round trip
    pub handshake_timeout: Duration,
    /// Devices to register at startup
    pub devices: Vec<DeviceConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            pool_capacity: 6,
            connect_attempts: 10,
            connect_backoff: Duration::from_secs(3),
            scan_timeout: Duration::from_secs(10),
            send_retries: 10,
            send_backoff: Duration::from_secs(3),
            notification_queue_depth: 64,
            handshake_timeout: Duration::from_secs(15),
            devices: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// Create a configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(source: &str) -> GatewayResult<Self> {
        let config: Self = toml::from_str(source)
            .map_err(|e| GatewayError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pool and links cannot run with
    pub fn validate(&self) -> GatewayResult<()> {
        if self.pool_capacity == 0 {
            return Err(GatewayError::Config("pool_capacity must be at least 1".into()));
        }
        if self.connect_attempts == 0 {
            return Err(GatewayError::Config("connect_attempts must be at least 1".into()));
        }
        if self.send_retries == 0 {
            return Err(GatewayError::Config("send_retries must be at least 1".into()));
        }
        if self.notification_queue_depth == 0 {
            return Err(GatewayError::Config(
                "notification_queue_depth must be at least 1".into(),
            ));
        }
        for device in &self.devices {
            device.validate()?;
        }
        Ok(())
    }

    /// Set pool capacity
    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }

    /// Set connect attempts and the backoff between them
    pub fn with_connect_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.connect_attempts = attempts;
        self.connect_backoff = backoff;
        self
    }

    /// Set rescan bound
    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    /// Set write attempts and the backoff between them
    pub fn with_send_retry(mut self, retries: u32, backoff: Duration) -> Self {
        self.send_retries = retries;
        self.send_backoff = backoff;
        self
    }

    /// Set per-subscriber queue depth
    pub fn with_notification_queue_depth(mut self, depth: usize) -> Self {
        self.notification_queue_depth = depth;
        self
    }

    /// Set handshake timeout
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Add a device
    pub fn with_device(mut self, device: DeviceConfig) -> Self {
        self.devices.push(device);
        self
    }
}

// ----------------------------------------------------------------------------
// Device Configuration
// ----------------------------------------------------------------------------

/// Per-device settings, tagged by adapter kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceConfig {
    TuyaFingerbot(FingerbotConfig),
}

impl DeviceConfig {
    /// Transport address of the device
    pub fn address(&self) -> &str {
        match self {
            Self::TuyaFingerbot(config) => &config.address,
        }
    }

    fn validate(&self) -> GatewayResult<()> {
        match self {
            Self::TuyaFingerbot(config) => config.validate(),
        }
    }
}

/// Settings for a Tuya Fingerbot
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct FingerbotConfig {
    pub address: String,
    pub device_id: String,
    pub uuid: String,
    pub local_key: String,
    /// Arm travel on press, in percent
    #[serde(default = "default_down_percent")]
    pub down_percent: u8,
    #[serde(default)]
    pub identifier: Option<String>,
    /// Fixed offset reported in time sync replies
    #[serde(default)]
    pub utc_offset_secs: i32,
}

fn default_down_percent() -> u8 {
    80
}

impl FingerbotConfig {
    pub fn new(
        address: impl Into<String>,
        device_id: impl Into<String>,
        uuid: impl Into<String>,
        local_key: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            device_id: device_id.into(),
            uuid: uuid.into(),
            local_key: local_key.into(),
            down_percent: default_down_percent(),
            identifier: None,
            utc_offset_secs: 0,
        }
    }

    /// Set arm travel
    pub fn with_down_percent(mut self, percent: u8) -> Self {
        self.down_percent = percent;
        self
    }

    /// Set an explicit identifier
    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    /// Set the UTC offset used for time sync
    pub fn with_utc_offset_secs(mut self, offset: i32) -> Self {
        self.utc_offset_secs = offset;
        self
    }

    /// Configured identifier, or one derived from the address
    pub fn identifier(&self) -> String {
        self.identifier.clone().unwrap_or_else(|| {
            format!(
                "tuya_fingerbot_{}",
                self.address.replace(':', "").to_lowercase()
            )
        })
    }

    fn validate(&self) -> GatewayResult<()> {
        if self.address.is_empty() {
            return Err(GatewayError::Config("device address must not be empty".into()));
        }
        if self.down_percent > 100 {
            return Err(GatewayError::Config(format!(
                "down_percent {} exceeds 100 for {}",
                self.down_percent, self.address
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for FingerbotConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FingerbotConfig")
            .field("address", &self.address)
            .field("device_id", &self.device_id)
            .field("uuid", &self.uuid)
            .field("local_key", &"<redacted>")
            .field("down_percent", &self.down_percent)
            .field("identifier", &self.identifier)
            .field("utc_offset_secs", &self.utc_offset_secs)
            .finish()
    }
}
