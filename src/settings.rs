//! DFU options with JSON persistence.
//!
//! This module provides:
//! - `DfuSettings`, the knobs of a DFU run (PRN interval, forced DFU mode,
//!   expected advertising name, UUID overrides, ...)
//! - Persistence to a JSON file in the caller's data directory
//!
//! ## Extensibility
//!
//! To add a new setting:
//! 1. Add the field to `DfuSettings` with a `#[serde(default)]` attribute
//! 2. Add it to the `Default` impl
//! 3. Read it where the controller builds its per-connection options

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::dfu::config::{
    DEFAULT_INVALID_STATE_RETRIES, DEFAULT_MBR_SIZE, DEFAULT_PRN, LEGACY_START_DELAY,
};
use crate::dfu::{DfuResult, DfuUuids, UuidOverride};

/// Options of a DFU run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct DfuSettings {
    /// Packets between Packet Receipt Notifications, 0 disables them.
    pub packet_receipt_notification: u16,

    /// Assume bootloader mode when discovery cannot tell.
    pub force_dfu: bool,

    /// Name the bootloader advertises after the jump, used while scanning.
    /// Secure DFU applications without bond sharing are asked to set it.
    pub alternative_advertising_name: Option<String>,

    /// Look for the experimental buttonless service (nRF5 SDK 12).
    pub experimental_buttonless: bool,

    /// Bytes skipped from the start of Intel HEX images.
    pub mbr_size: u32,

    /// Reset-and-reconnect attempts on an Invalid State start response.
    pub invalid_state_retries: u8,

    /// Wait before Start DFU on bootloaders without a version characteristic.
    pub legacy_start_delay_ms: u64,

    /// Compare a 2-byte init packet with the image CRC before sending it.
    pub verify_init_packet_crc: bool,

    pub uuid_overrides: Vec<UuidOverride>,
}

impl Default for DfuSettings {
    fn default() -> Self {
        Self {
            packet_receipt_notification: DEFAULT_PRN,
            force_dfu: false,
            alternative_advertising_name: None,
            experimental_buttonless: false,
            mbr_size: DEFAULT_MBR_SIZE,
            invalid_state_retries: DEFAULT_INVALID_STATE_RETRIES,
            legacy_start_delay_ms: LEGACY_START_DELAY.as_millis() as u64,
            verify_init_packet_crc: true,
            uuid_overrides: Vec::new(),
        }
    }
}

impl DfuSettings {
    /// The UUID set with every override applied.
    pub fn uuids(&self) -> DfuUuids {
        DfuUuids::with_overrides(&self.uuid_overrides)
    }

    pub fn legacy_start_delay(&self) -> Duration {
        Duration::from_millis(self.legacy_start_delay_ms)
    }

    /// Check if these settings differ from defaults.
    pub fn has_non_default_settings(&self) -> bool {
        *self != Self::default()
    }
}

/// Settings file name stored in the data directory.
const SETTINGS_FILENAME: &str = "dfu_settings.json";

/// Manages persistence of DFU settings to a JSON file.
pub struct SettingsManager {
    settings_file_path: PathBuf,
}

impl SettingsManager {
    /// Create a new settings manager for the given data directory.
    pub fn new(data_dir: &Path) -> Self {
        let settings_file_path = data_dir.join(SETTINGS_FILENAME);
        Self { settings_file_path }
    }

    /// Load settings from disk, returning defaults if file doesn't exist.
    pub fn load(&self) -> DfuResult<DfuSettings> {
        if !self.settings_file_path.exists() {
            return Ok(DfuSettings::default());
        }

        let contents = fs::read_to_string(&self.settings_file_path)?;

        // Handle empty file gracefully
        if contents.trim().is_empty() {
            return Ok(DfuSettings::default());
        }

        Ok(serde_json::from_str(&contents)?)
    }

    /// Save settings to disk.
    pub fn save(&self, settings: &DfuSettings) -> DfuResult<()> {
        // Ensure parent directory exists
        if let Some(parent) = self.settings_file_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = serde_json::to_string_pretty(settings)?;
        fs::write(&self.settings_file_path, contents)?;

        Ok(())
    }

    /// Get the path where settings are stored.
    pub fn settings_path(&self) -> &Path {
        &self.settings_file_path
    }
}
