//! Parsed `manifest.json` of a distribution package.

use serde::Deserialize;

use crate::dfu::error::{DfuError, DfuResult};

/// Top-level `{"manifest": {...}}` wrapper.
#[derive(Debug, Deserialize)]
pub(super) struct ManifestFile {
    pub manifest: Manifest,
}

/// Firmware roles listed in the manifest.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub application: Option<ManifestFirmware>,
    #[serde(default)]
    pub softdevice: Option<ManifestFirmware>,
    #[serde(default)]
    pub bootloader: Option<ManifestFirmware>,
    #[serde(default, alias = "softdeviceBootloader")]
    pub softdevice_bootloader: Option<SoftDeviceBootloaderManifest>,
}

/// File names of one firmware role.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ManifestFirmware {
    #[serde(default)]
    pub bin_file: Option<String>,
    #[serde(default)]
    pub dat_file: Option<String>,
}

/// The combined SoftDevice and Bootloader role, which carries its own split.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SoftDeviceBootloaderManifest {
    #[serde(flatten)]
    pub firmware: ManifestFirmware,
    #[serde(default)]
    pub sd_size: Option<u32>,
    #[serde(default)]
    pub bl_size: Option<u32>,
    #[serde(default)]
    pub info_read_only_metadata: Option<SizeMetadata>,
}

// Newer nrfutil versions nest the sizes here
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SizeMetadata {
    pub sd_size: u32,
    pub bl_size: u32,
}

impl ManifestFirmware {
    /// The binary file name, required for every listed role.
    pub(super) fn bin_file(&self, role: &str) -> DfuResult<&str> {
        self.bin_file
            .as_deref()
            .ok_or_else(|| DfuError::InvalidManifest {
                reason: format!("{} entry has no bin_file", role),
            })
    }
}

impl SoftDeviceBootloaderManifest {
    /// SoftDevice and Bootloader sizes, from the flat or nested form.
    pub fn sizes(&self) -> DfuResult<(u32, u32)> {
        match (self.sd_size, self.bl_size, &self.info_read_only_metadata) {
            (Some(sd), Some(bl), _) => Ok((sd, bl)),
            (_, _, Some(meta)) => Ok((meta.sd_size, meta.bl_size)),
            _ => Err(DfuError::InvalidManifest {
                reason: "softdevice_bootloader entry has no sd_size/bl_size".to_string(),
            }),
        }
    }
}

impl Manifest {
    /// Parse the manifest from JSON text.
    pub(super) fn from_json(contents: &str) -> DfuResult<Self> {
        let file: ManifestFile = serde_json::from_str(contents)?;
        file.manifest.validate()?;
        Ok(file.manifest)
    }

    /// At most one system role may be present, and something must be.
    ///
    /// `softdevice_bootloader` excludes `softdevice` and `bootloader`, and
    /// the latter two are mutually exclusive as well because a single
    /// connection can only carry one system image.
    pub fn validate(&self) -> DfuResult<()> {
        let system_roles = [
            self.softdevice.is_some(),
            self.bootloader.is_some(),
            self.softdevice_bootloader.is_some(),
        ]
        .iter()
        .filter(|present| **present)
        .count();

        match system_roles {
            1 => Ok(()),
            0 if self.application.is_some() => Ok(()),
            0 => Err(DfuError::InvalidManifest {
                reason: "manifest lists no firmware".to_string(),
            }),
            _ => Err(DfuError::InvalidManifest {
                reason: "softdevice, bootloader and softdevice_bootloader are mutually exclusive"
                    .to_string(),
            }),
        }
    }
}
