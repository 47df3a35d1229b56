//! Distribution package reader.
//!
//! Reads the `manifest.json` of a firmware ZIP and the binaries and init
//! packets it references, then splits them into parts.

use std::io::{Read, Seek};

use tracing::{debug, warn};
use zip::result::ZipError;
use zip::ZipArchive;

use super::manifest::{Manifest, ManifestFirmware};
use super::{FirmwarePart, FirmwareSize, FirmwareType, FirmwareTypes};
use crate::dfu::config::MANIFEST_FILENAME;
use crate::dfu::error::{DfuError, DfuResult};

/// A binary with its optional init packet, as read from the archive.
struct Image {
    data: Vec<u8>,
    init_packet: Option<Vec<u8>>,
}

/// The SoftDevice and/or Bootloader image of the package.
struct SystemImage {
    image: Image,
    firmware_type: FirmwareType,
    softdevice: u32,
    bootloader: u32,
}

/// Read a distribution package and select the parts matching `types`.
///
/// A system image and an application yield two parts: the first carries the
/// SoftDevice/Bootloader sizes, the second only the application size.
pub(super) fn read_distribution_package<R: Read + Seek>(
    reader: R,
    types: FirmwareTypes,
) -> DfuResult<Vec<FirmwarePart>> {
    let mut archive = ZipArchive::new(reader)?;
    let manifest = read_manifest(&mut archive)?;

    let mut system: Option<SystemImage> = None;

    if types.contains(FirmwareTypes::SOFTDEVICE_BOOTLOADER) {
        if let Some(combined) = &manifest.softdevice_bootloader {
            let image = read_image(&mut archive, &combined.firmware, "softdevice_bootloader")?;
            let (softdevice, bootloader) = combined.sizes()?;
            if softdevice as u64 + bootloader as u64 != image.data.len() as u64 {
                warn!(
                    "SoftDevice ({}) and Bootloader ({}) sizes do not add up to {} bytes",
                    softdevice,
                    bootloader,
                    image.data.len()
                );
            }
            system = Some(SystemImage {
                image,
                firmware_type: FirmwareType::SoftDeviceBootloader,
                softdevice,
                bootloader,
            });
        }
    }

    if types.contains(FirmwareTypes::SOFTDEVICE) {
        if let Some(softdevice) = &manifest.softdevice {
            ensure_single_system_image(&system)?;
            let image = read_image(&mut archive, softdevice, "softdevice")?;
            let len = image_len(&image)?;
            system = Some(SystemImage {
                image,
                firmware_type: FirmwareType::SoftDevice,
                softdevice: len,
                bootloader: 0,
            });
        }
    }

    if types.contains(FirmwareTypes::BOOTLOADER) {
        if let Some(bootloader) = &manifest.bootloader {
            ensure_single_system_image(&system)?;
            let image = read_image(&mut archive, bootloader, "bootloader")?;
            let len = image_len(&image)?;
            system = Some(SystemImage {
                image,
                firmware_type: FirmwareType::Bootloader,
                softdevice: 0,
                bootloader: len,
            });
        }
    }

    let application = match (&manifest.application, types.contains(FirmwareTypes::APPLICATION)) {
        (Some(application), true) => Some(read_image(&mut archive, application, "application")?),
        _ => None,
    };

    let mut parts = Vec::with_capacity(2);
    if let Some(system) = system {
        debug!(
            "Selected {} image ({} bytes)",
            system.firmware_type.name(),
            system.image.data.len()
        );
        let size = FirmwareSize {
            softdevice: system.softdevice,
            bootloader: system.bootloader,
            application: 0,
        };
        parts.push(FirmwarePart::new(
            system.image.data,
            system.image.init_packet,
            system.firmware_type,
            size,
        ));
    }
    if let Some(application) = application {
        debug!("Selected Application image ({} bytes)", application.data.len());
        let size = FirmwareSize {
            softdevice: 0,
            bootloader: 0,
            application: image_len(&application)?,
        };
        parts.push(FirmwarePart::new(
            application.data,
            application.init_packet,
            FirmwareType::Application,
            size,
        ));
    }

    if parts.is_empty() {
        return Err(DfuError::TypeNotFound {
            requested: types.bits(),
        });
    }
    Ok(parts)
}

fn ensure_single_system_image(system: &Option<SystemImage>) -> DfuResult<()> {
    match system {
        Some(existing) => Err(DfuError::InvalidManifest {
            reason: format!(
                "{} already selected, only one system image is allowed",
                existing.firmware_type.name()
            ),
        }),
        None => Ok(()),
    }
}

fn image_len(image: &Image) -> DfuResult<u32> {
    u32::try_from(image.data.len()).map_err(|_| DfuError::FileInvalid {
        reason: format!("image of {} bytes is too large", image.data.len()),
    })
}

/// Read and parse the manifest.json from the archive.
fn read_manifest<R: Read + Seek>(archive: &mut ZipArchive<R>) -> DfuResult<Manifest> {
    let mut manifest_file = match archive.by_name(MANIFEST_FILENAME) {
        Ok(file) => file,
        Err(ZipError::FileNotFound) => return Err(DfuError::NoManifest),
        Err(e) => return Err(e.into()),
    };

    let mut contents = String::new();
    manifest_file.read_to_string(&mut contents)?;

    Manifest::from_json(&contents)
}

fn read_image<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    firmware: &ManifestFirmware,
    role: &str,
) -> DfuResult<Image> {
    let bin_file = firmware.bin_file(role)?;
    let data = read_file_from_zip(archive, bin_file)?;
    if data.is_empty() {
        return Err(DfuError::FileInvalid {
            reason: format!("{} is empty", bin_file),
        });
    }
    let init_packet = firmware
        .dat_file
        .as_deref()
        .map(|name| read_file_from_zip(archive, name))
        .transpose()?;
    Ok(Image { data, init_packet })
}

/// Read a file from the zip archive by name.
fn read_file_from_zip<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
) -> DfuResult<Vec<u8>> {
    let mut file = match archive.by_name(name) {
        Ok(file) => file,
        Err(ZipError::FileNotFound) => {
            return Err(DfuError::FileNotFound {
                filename: name.to_string(),
            })
        }
        Err(e) => return Err(e.into()),
    };

    let mut data = Vec::with_capacity(file.size() as usize);
    file.read_to_end(&mut data)?;

    Ok(data)
}
