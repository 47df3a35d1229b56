//! Firmware container for Nordic DFU.
//!
//! Decodes one of three artifact formats into one or two [`FirmwarePart`]s:
//! - a raw binary (`.bin`) with an optional init packet (`.dat`)
//! - an Intel HEX file (`.hex`), flattened to binary past the MBR
//! - a distribution ZIP with a `manifest.json`
//!
//! When the ZIP carries both a system image (SoftDevice and/or Bootloader)
//! and an Application, the container yields two parts which are sent in two
//! separate connections.

mod archive;
mod hex;
mod manifest;

use std::io::Cursor;
use std::ops::BitOr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::error::{DfuError, DfuResult};

pub use hex::hex_to_bin;
pub use manifest::{Manifest, ManifestFirmware, SizeMetadata, SoftDeviceBootloaderManifest};

/// Firmware component type, as sent in the StartDfu request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[repr(u8)]
pub enum FirmwareType {
    SoftDevice = 0x01,
    Bootloader = 0x02,
    SoftDeviceBootloader = 0x03,
    Application = 0x04,
}

impl FirmwareType {
    /// Type bits carried by the StartDfu request.
    pub fn bits(self) -> u8 {
        self as u8
    }

    /// Get a human-readable name.
    pub fn name(self) -> &'static str {
        match self {
            FirmwareType::SoftDevice => "SoftDevice",
            FirmwareType::Bootloader => "Bootloader",
            FirmwareType::SoftDeviceBootloader => "SoftDevice and Bootloader",
            FirmwareType::Application => "Application",
        }
    }
}

/// A set of requested firmware types, as a bitmask of [`FirmwareType`] bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FirmwareTypes(u8);

impl FirmwareTypes {
    pub const SOFTDEVICE: Self = Self(0x01);
    pub const BOOTLOADER: Self = Self(0x02);
    pub const SOFTDEVICE_BOOTLOADER: Self = Self(0x03);
    pub const APPLICATION: Self = Self(0x04);
    pub const ALL: Self = Self(0x07);

    /// Build a set from raw bits; unknown bits are dropped.
    pub fn from_bits(bits: u8) -> Self {
        Self(bits & Self::ALL.0)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    /// True when every bit of `other` is requested.
    pub fn contains(self, other: FirmwareTypes) -> bool {
        self.0 & other.0 == other.0
    }
}

impl Default for FirmwareTypes {
    fn default() -> Self {
        Self::ALL
    }
}

impl BitOr for FirmwareTypes {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl From<FirmwareType> for FirmwareTypes {
    fn from(kind: FirmwareType) -> Self {
        Self(kind.bits())
    }
}

/// Byte sizes of each firmware component in a part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FirmwareSize {
    pub softdevice: u32,
    pub bootloader: u32,
    pub application: u32,
}

impl FirmwareSize {
    /// Size record for a single image of the given type.
    pub fn for_type(kind: FirmwareType, len: u32) -> Option<Self> {
        let mut size = FirmwareSize::default();
        match kind {
            FirmwareType::SoftDevice => size.softdevice = len,
            FirmwareType::Bootloader => size.bootloader = len,
            FirmwareType::Application => size.application = len,
            FirmwareType::SoftDeviceBootloader => return None,
        }
        Some(size)
    }

    pub fn total(&self) -> u64 {
        self.softdevice as u64 + self.bootloader as u64 + self.application as u64
    }

    /// The 12-byte record written after StartDfu: SD, BL, APP as u32 LE.
    pub fn to_le_bytes(&self) -> [u8; 12] {
        let mut bytes = [0u8; 12];
        bytes[0..4].copy_from_slice(&self.softdevice.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.bootloader.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.application.to_le_bytes());
        bytes
    }
}

/// One image sent within a single connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwarePart {
    data: Vec<u8>,
    init_packet: Option<Vec<u8>>,
    firmware_type: FirmwareType,
    size: FirmwareSize,
}

impl FirmwarePart {
    pub(crate) fn new(
        data: Vec<u8>,
        init_packet: Option<Vec<u8>>,
        firmware_type: FirmwareType,
        size: FirmwareSize,
    ) -> Self {
        Self {
            data,
            init_packet,
            firmware_type,
            size,
        }
    }

    /// Binary image streamed to the DFU Packet characteristic.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn init_packet(&self) -> Option<&[u8]> {
        self.init_packet.as_deref()
    }

    pub fn firmware_type(&self) -> FirmwareType {
        self.firmware_type
    }

    pub fn size(&self) -> FirmwareSize {
        self.size
    }

    /// CRC-16/CCITT of the image, the content of a pre-0.5 init packet.
    pub fn crc16(&self) -> u16 {
        crc16::State::<crc16::CCITT_FALSE>::calculate(&self.data)
    }

    /// Hex-encoded SHA-256 of the image.
    pub fn sha256(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.data);
        format!("{:x}", hasher.finalize())
    }
}

/// Summary of one part for callers and logs.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartInfo {
    pub number: usize,
    pub firmware_type: FirmwareType,
    pub size: FirmwareSize,
    pub init_packet_len: Option<usize>,
    pub sha256: String,
}

/// Summary of a firmware container.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FirmwareInfo {
    pub file_name: Option<String>,
    pub parts: Vec<PartInfo>,
    pub total_size: FirmwareSize,
}

/// Ordered sequence of one or two firmware parts.
#[derive(Debug, Clone)]
pub struct FirmwareContainer {
    file_name: Option<String>,
    parts: Vec<FirmwarePart>,
    current: usize,
}

impl FirmwareContainer {
    fn new(file_name: Option<String>, parts: Vec<FirmwarePart>) -> DfuResult<Self> {
        if parts.is_empty() || parts.len() > 2 {
            return Err(DfuError::FileInvalid {
                reason: format!("{} firmware parts found, expected 1 or 2", parts.len()),
            });
        }
        Ok(Self {
            file_name,
            parts,
            current: 0,
        })
    }

    /// Decode a distribution ZIP held in memory.
    pub fn from_zip_bytes(bytes: &[u8], types: FirmwareTypes) -> DfuResult<Self> {
        let parts = archive::read_distribution_package(Cursor::new(bytes), types)?;
        Self::new(None, parts)
    }

    /// Decode a distribution ZIP from disk.
    pub fn from_zip_path<P: AsRef<Path>>(path: P, types: FirmwareTypes) -> DfuResult<Self> {
        let path = path.as_ref();
        require_extension(path, &["zip"])?;
        let file = std::fs::File::open(path)?;
        let parts = archive::read_distribution_package(file, types)?;
        Self::new(file_name_of(path), parts)
    }

    /// Decode a distribution ZIP from disk using every type it contains.
    pub fn from_path<P: AsRef<Path>>(path: P) -> DfuResult<Self> {
        Self::from_zip_path(path, FirmwareTypes::ALL)
    }

    /// Wrap a raw binary image.
    pub fn from_bin(
        data: Vec<u8>,
        init_packet: Option<Vec<u8>>,
        firmware_type: FirmwareType,
    ) -> DfuResult<Self> {
        if data.is_empty() {
            return Err(DfuError::FileInvalid {
                reason: "Firmware image is empty".to_string(),
            });
        }
        let size = single_image_size(firmware_type, data.len())?;
        Self::new(
            None,
            vec![FirmwarePart::new(data, init_packet, firmware_type, size)],
        )
    }

    /// Convert an Intel HEX image, skipping everything below `mbr_size`.
    pub fn from_hex(
        hex: &[u8],
        init_packet: Option<Vec<u8>>,
        firmware_type: FirmwareType,
        mbr_size: u32,
    ) -> DfuResult<Self> {
        let data = hex_to_bin(hex, mbr_size).ok_or_else(|| DfuError::FileInvalid {
            reason: "Intel HEX conversion failed".to_string(),
        })?;
        Self::from_bin(data, init_packet, firmware_type)
    }

    /// Read a `.bin` or `.hex` file with an optional `.dat` init packet.
    pub fn from_bin_or_hex_path<P: AsRef<Path>>(
        path: P,
        dat_path: Option<&Path>,
        firmware_type: FirmwareType,
        mbr_size: u32,
    ) -> DfuResult<Self> {
        let path = path.as_ref();
        let extension = require_extension(path, &["bin", "hex"])?;
        if let Some(dat) = dat_path {
            require_extension(dat, &["dat"])?;
        }

        let contents = std::fs::read(path)?;
        let init_packet = dat_path.map(std::fs::read).transpose()?;

        let mut container = if extension == "hex" {
            Self::from_hex(&contents, init_packet, firmware_type, mbr_size)?
        } else {
            Self::from_bin(contents, init_packet, firmware_type)?
        };
        container.file_name = file_name_of(path);
        Ok(container)
    }

    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    pub fn current_part(&self) -> &FirmwarePart {
        &self.parts[self.current]
    }

    /// 1-based number of the current part.
    pub fn current_part_number(&self) -> usize {
        self.current + 1
    }

    pub fn parts(&self) -> usize {
        self.parts.len()
    }

    pub fn has_next_part(&self) -> bool {
        self.current + 1 < self.parts.len()
    }

    /// Move to the next part. Returns false, and stays put, after the last.
    pub fn advance_to_next_part(&mut self) -> bool {
        if !self.has_next_part() {
            return false;
        }
        self.current += 1;
        true
    }

    /// Sum of all component sizes across parts.
    pub fn total_size(&self) -> FirmwareSize {
        self.parts
            .iter()
            .fold(FirmwareSize::default(), |acc, part| FirmwareSize {
                softdevice: acc.softdevice + part.size.softdevice,
                bootloader: acc.bootloader + part.size.bootloader,
                application: acc.application + part.size.application,
            })
    }

    pub fn info(&self) -> FirmwareInfo {
        FirmwareInfo {
            file_name: self.file_name.clone(),
            parts: self
                .parts
                .iter()
                .enumerate()
                .map(|(index, part)| PartInfo {
                    number: index + 1,
                    firmware_type: part.firmware_type,
                    size: part.size,
                    init_packet_len: part.init_packet.as_ref().map(Vec::len),
                    sha256: part.sha256(),
                })
                .collect(),
            total_size: self.total_size(),
        }
    }
}

fn single_image_size(firmware_type: FirmwareType, len: usize) -> DfuResult<FirmwareSize> {
    let len = u32::try_from(len).map_err(|_| DfuError::FileInvalid {
        reason: format!("image of {} bytes is too large", len),
    })?;
    FirmwareSize::for_type(firmware_type, len).ok_or_else(|| DfuError::FileInvalid {
        reason: "a combined SoftDevice and Bootloader image requires a distribution ZIP"
            .to_string(),
    })
}

/// Check the extension case-insensitively and return it lowercased.
fn require_extension(path: &Path, allowed: &[&str]) -> DfuResult<String> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    if allowed.contains(&extension.as_str()) {
        Ok(extension)
    } else {
        Err(DfuError::FileInvalid {
            reason: format!(
                "{} is not a {} file",
                path.display(),
                allowed.join(" or ").to_uppercase()
            ),
        })
    }
}

fn file_name_of(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{hex_data_record, FirmwareZipBuilder, TestContext};

    #[test]
    fn test_firmware_types_contains() {
        assert!(FirmwareTypes::ALL.contains(FirmwareTypes::SOFTDEVICE_BOOTLOADER));
        assert!(!FirmwareTypes::SOFTDEVICE.contains(FirmwareTypes::SOFTDEVICE_BOOTLOADER));
        let sd_app = FirmwareTypes::SOFTDEVICE | FirmwareTypes::APPLICATION;
        assert!(sd_app.contains(FirmwareType::Application.into()));
        assert!(!sd_app.contains(FirmwareTypes::BOOTLOADER));
        assert_eq!(FirmwareTypes::from_bits(0xFF), FirmwareTypes::ALL);
    }

    #[test]
    fn test_size_record_layout() {
        let size = FirmwareSize {
            softdevice: 0x0102_0304,
            bootloader: 0,
            application: 41,
        };
        assert_eq!(
            size.to_le_bytes(),
            [0x04, 0x03, 0x02, 0x01, 0, 0, 0, 0, 41, 0, 0, 0]
        );
    }

    #[test]
    fn test_bin_places_size_in_type_slot() {
        let container =
            FirmwareContainer::from_bin(vec![0xAA; 100], None, FirmwareType::Bootloader).unwrap();
        assert_eq!(container.parts(), 1);
        let part = container.current_part();
        assert_eq!(part.size().bootloader, 100);
        assert_eq!(part.size().softdevice, 0);
        assert_eq!(part.size().application, 0);
        assert!(part.init_packet().is_none());
    }

    #[test]
    fn test_bin_rejects_combined_type() {
        let result =
            FirmwareContainer::from_bin(vec![1, 2, 3], None, FirmwareType::SoftDeviceBootloader);
        assert!(matches!(result, Err(DfuError::FileInvalid { .. })));
    }

    #[test]
    fn test_empty_image_is_file_invalid() {
        let result = FirmwareContainer::from_bin(Vec::new(), None, FirmwareType::Application);
        assert!(matches!(result, Err(DfuError::FileInvalid { .. })));

        // A HEX file with only an end record converts to nothing
        let result = FirmwareContainer::from_hex(b":00000001FF\n", None, FirmwareType::Application, 0);
        assert!(matches!(result, Err(DfuError::FileInvalid { .. })));
    }

    #[test]
    fn test_invalid_hex_is_file_invalid() {
        let result = FirmwareContainer::from_hex(b"not hex", None, FirmwareType::Application, 0);
        assert!(matches!(result, Err(DfuError::FileInvalid { .. })));
    }

    #[test]
    fn test_two_parts_advance_once() {
        let bytes = FirmwareZipBuilder::new()
            .manifest(
                r#"{"manifest": {
                    "softdevice": {"bin_file": "sd.bin", "dat_file": "sd.dat"},
                    "application": {"bin_file": "app.bin", "dat_file": "app.dat"}
                }}"#,
            )
            .file("sd.bin", &[1; 30])
            .file("sd.dat", &[9; 14])
            .file("app.bin", &[2; 41])
            .file("app.dat", &[8; 14])
            .build_bytes();
        let mut container = FirmwareContainer::from_zip_bytes(&bytes, FirmwareTypes::ALL).unwrap();

        assert_eq!(container.parts(), 2);
        assert_eq!(container.current_part_number(), 1);
        assert_eq!(
            container.current_part().size(),
            FirmwareSize {
                softdevice: 30,
                bootloader: 0,
                application: 0
            }
        );
        assert!(container.has_next_part());

        assert!(container.advance_to_next_part());
        assert_eq!(container.current_part_number(), 2);
        assert_eq!(
            container.current_part().firmware_type(),
            FirmwareType::Application
        );
        assert_eq!(
            container.current_part().size(),
            FirmwareSize {
                softdevice: 0,
                bootloader: 0,
                application: 41
            }
        );

        assert!(!container.has_next_part());
        assert!(!container.advance_to_next_part());
        assert!(!container.has_next_part());
        assert_eq!(container.current_part_number(), 2);
    }

    #[test]
    fn test_from_path_checks_extension() {
        let ctx = TestContext::new();
        let path = ctx.create_file_bytes("firmware.bin", &[1, 2, 3]);

        let result = FirmwareContainer::from_path(&path);
        assert!(matches!(result, Err(DfuError::FileInvalid { .. })));
    }

    #[test]
    fn test_from_bin_or_hex_path_reads_dat() {
        let ctx = TestContext::new();
        let bin = ctx.create_file_bytes("app.BIN", &[7; 64]);
        let dat = ctx.create_file_bytes("app.dat", &[1, 2]);

        let container =
            FirmwareContainer::from_bin_or_hex_path(&bin, Some(dat.as_path()), FirmwareType::Application, 0)
                .unwrap();

        assert_eq!(container.file_name(), Some("app.BIN"));
        assert_eq!(container.current_part().init_packet(), Some(&[1u8, 2][..]));
        assert_eq!(container.current_part().size().application, 64);
    }

    #[test]
    fn test_from_bin_or_hex_path_converts_hex() {
        let ctx = TestContext::new();
        let hex = [
            hex_data_record(0x0000, &[0xEE; 4]),
            hex_data_record(0x0004, &[1, 2, 3, 4]),
            hex_data_record(0x0008, &[5, 6]),
            ":00000001FF\n".to_string(),
        ]
        .concat();
        let path = ctx.create_file("app.hex", &hex);

        let container =
            FirmwareContainer::from_bin_or_hex_path(&path, None, FirmwareType::Application, 0x0004)
                .unwrap();

        assert_eq!(container.current_part().data(), &[1, 2, 3, 4, 5, 6]);
        assert_eq!(container.current_part().size().application, 6);
        assert_eq!(container.current_part().init_packet(), None);
    }

    #[test]
    fn test_from_bin_or_hex_path_rejects_wrong_dat_extension() {
        let ctx = TestContext::new();
        let bin = ctx.create_file_bytes("app.bin", &[7; 64]);
        let dat = ctx.create_file_bytes("app.txt", &[1, 2]);

        let result =
            FirmwareContainer::from_bin_or_hex_path(&bin, Some(dat.as_path()), FirmwareType::Application, 0);
        assert!(matches!(result, Err(DfuError::FileInvalid { .. })));
    }

    #[test]
    fn test_info_summarizes_parts() {
        let container =
            FirmwareContainer::from_bin(b"abc".to_vec(), Some(vec![0; 14]), FirmwareType::Application)
                .unwrap();
        let info = container.info();

        assert_eq!(info.parts.len(), 1);
        assert_eq!(info.parts[0].init_packet_len, Some(14));
        assert_eq!(
            info.parts[0].sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_crc16_matches_ccitt_check_value() {
        let container =
            FirmwareContainer::from_bin(b"123456789".to_vec(), None, FirmwareType::Application)
                .unwrap();
        assert_eq!(container.current_part().crc16(), 0x29B1);
    }
}
