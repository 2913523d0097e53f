use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{DriverError, ErrorCode, Result};

/// CAN identifier type
pub type CanId = u32;

/// Maximum payload of a classic CAN frame
pub const CAN_MAX_DLEN: usize = 8;

/// Longest interface name the kernel accepts, excluding the terminating NUL
pub const IFNAME_MAX_LEN: usize = 15;

/// Transport-neutral CAN frame exchanged with listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Frame {
    pub id: CanId,
    pub dlc: u8,
    pub data: [u8; CAN_MAX_DLEN],
    pub is_extended: bool,
    pub is_rtr: bool,
    pub is_error: bool,
}

impl Frame {
    /// Data frame with an 11-bit identifier. Payloads longer than 8 bytes are truncated.
    pub fn new(id: CanId, payload: &[u8]) -> Self {
        let len = payload.len().min(CAN_MAX_DLEN);
        let mut data = [0u8; CAN_MAX_DLEN];
        data[..len].copy_from_slice(&payload[..len]);
        Self {
            id,
            dlc: len as u8,
            data,
            ..Default::default()
        }
    }

    /// Data frame with a 29-bit identifier
    pub fn extended(id: CanId, payload: &[u8]) -> Self {
        Self {
            is_extended: true,
            ..Self::new(id, payload)
        }
    }

    /// Remote transmission request for `dlc` bytes
    pub fn remote(id: CanId, dlc: u8, is_extended: bool) -> Self {
        Self {
            id,
            dlc,
            is_extended,
            is_rtr: true,
            ..Default::default()
        }
    }

    /// Valid payload bytes, bounded by the array size
    pub fn payload(&self) -> &[u8] {
        &self.data[..(self.dlc as usize).min(CAN_MAX_DLEN)]
    }
}

/// Driver lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DriverState {
    #[default]
    Closed,
    Open,
}

/// Snapshot of the transport state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct State {
    pub driver_state: DriverState,
    pub error_code: ErrorCode,
    /// Class bits of the last received error frame
    pub internal_error: u32,
}

impl State {
    pub fn is_open(&self) -> bool {
        self.driver_state == DriverState::Open
    }
}

/// Configuration trait that must be implemented by all driver configurations
pub trait Config: Send + Sync {
    fn validate(&self) -> Result<()>;
}

/// Bounded waits on the send path, in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub send_lock_ms: u64,
    pub write_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            send_lock_ms: 100,
            write_ms: 100,
        }
    }
}

impl Timeouts {
    pub fn send_lock(&self) -> Duration {
        Duration::from_millis(self.send_lock_ms)
    }

    pub fn write(&self) -> Duration {
        Duration::from_millis(self.write_ms)
    }
}

/// Driver configuration
///
/// ```toml
/// device = "vcan0"
/// bitrate = 0
///
/// [timeouts]
/// send_lock_ms = 50
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverConfig {
    pub device: String,
    /// Only 0 is accepted: the interface must already be configured
    #[serde(default)]
    pub bitrate: u32,
    #[serde(default)]
    pub timeouts: Timeouts,
}

impl DriverConfig {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            bitrate: 0,
            timeouts: Timeouts::default(),
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: DriverConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

impl Config for DriverConfig {
    fn validate(&self) -> Result<()> {
        validate_device_name(&self.device)?;
        if self.bitrate != 0 {
            return Err(DriverError::UnsupportedBitrate(self.bitrate));
        }
        Ok(())
    }
}

/// Checks that `name` can be passed to the kernel as an interface name.
pub fn validate_device_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= IFNAME_MAX_LEN
        && !name.contains(['\0', '/'])
        && !name.chars().any(char::is_whitespace);
    if valid {
        Ok(())
    } else {
        Err(DriverError::InvalidDevice(name.to_string()))
    }
}
