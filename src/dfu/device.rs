//! Bootloader version and application/bootloader mode detection.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Value of the DFU Version characteristic.
///
/// Bootloaders from SDK 6.1 and older do not expose the characteristic at
/// all, so callers keep this as an `Option` where absence is meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceVersion {
    pub major: u8,
    pub minor: u8,
}

impl DeviceVersion {
    pub fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Decode the characteristic value, `[minor, major]`.
    pub fn parse(data: &[u8]) -> Option<Self> {
        match data {
            [minor, major, ..] => Some(Self::new(*major, *minor)),
            _ => None,
        }
    }

    /// Version 0.1 is reported by applications with buttonless update.
    pub fn is_buttonless_application(&self) -> bool {
        self.major == 0 && self.minor == 1
    }

    /// Bootloaders 0.5+ (SDK 7.0) require the extended init packet.
    pub fn requires_extended_init_packet(&self) -> bool {
        !self.is_buttonless_application()
    }
}

impl fmt::Display for DeviceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// What the connected peripheral is currently running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceMode {
    Application,
    Bootloader,
    Unknown,
}

impl DeviceMode {
    /// Guess the mode from what discovery found, most reliable hint first.
    pub fn detect(version: Option<DeviceVersion>, has_packet: bool, service_count: usize) -> Self {
        if let Some(version) = version {
            return if version.is_buttonless_application() {
                DeviceMode::Application
            } else {
                DeviceMode::Bootloader
            };
        }

        // mbed DFU has no packet characteristic in application mode
        if !has_packet {
            return DeviceMode::Application;
        }

        // A device exposing only the DFU service is useless unless in bootloader
        if service_count == 1 {
            return DeviceMode::Bootloader;
        }

        DeviceMode::Unknown
    }

    /// Whether a jump to the bootloader is needed before DFU.
    ///
    /// `force_dfu` resolves the unknown case towards bootloader mode.
    pub fn requires_jump(self, force_dfu: bool) -> bool {
        match self {
            DeviceMode::Application => true,
            DeviceMode::Bootloader => false,
            DeviceMode::Unknown => !force_dfu,
        }
    }
}
