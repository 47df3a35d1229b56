//! Nordic DFU (Device Firmware Update) over Bluetooth LE.
//!
//! This module provides a complete Rust implementation of the Legacy DFU
//! protocol spoken by nRF5 SDK bootloaders up to SDK 11 and of Secure DFU
//! spoken by SDK 12 and later, on top of any BLE stack that implements
//! [`GattTransport`]. The variant is picked per connection from the
//! discovered services.
//!
//! # Protocol Overview
//!
//! The Legacy DFU process consists of:
//! 1. **Discovery** - Find the DFU service, its characteristics and version
//! 2. **Bootloader Entry** - Buttonless jump when an application is running
//! 3. **Start** - Send the firmware type and component sizes
//! 4. **Init Transfer** - Send the init packet (`.dat`)
//! 5. **Firmware Transfer** - Stream the image with PRN flow control
//! 6. **Validation** - The bootloader checks the received image
//! 7. **Activation** - The bootloader resets into the new firmware
//!
//! A SoftDevice/Bootloader update followed by an application repeats
//! steps 1 to 7 for the second part after reconnecting.
//!
//! Secure DFU sends the init packet as a command object and the image as
//! a series of data objects, each created, streamed, checksummed with
//! CRC-32 and executed. An application enters the bootloader through one
//! of the buttonless characteristics.
//!
//! # Example
//!
//! ```ignore
//! use nordic_ble_dfu::dfu::{driver, DfuController, FirmwareContainer, PeripheralId};
//! use nordic_ble_dfu::settings::DfuSettings;
//!
//! let firmware = FirmwareContainer::from_path("app_dfu_package.zip")?;
//! let controller = DfuController::new(firmware, DfuSettings::default(), PeripheralId::new(id));
//! let (handle, commands) = driver::channel();
//! let outcome = driver::run(controller, &mut transport, gatt_events, commands, |stage| {
//!     println!("{}: {:.0}%", stage.message(), stage.percent())
//! })
//! .await?;
//! ```

mod buttonless;
pub(crate) mod config;
mod connection;
mod control_point;
mod device;
pub mod driver;
mod error;
pub mod firmware;
mod packet;
mod protocol;
mod secure_control_point;
mod secure_service;
mod service;
mod transport;
pub mod uuids;

// Wire format
pub use buttonless::{ButtonlessKind, ButtonlessRequest, ButtonlessResponse, MAX_ADVERTISING_NAME_LEN};
pub use config::{
    ButtonlessOpCode, ButtonlessStatus, ExtendedError, ObjectType, OpCode, ResponseStatus,
    SecureOpCode, SecureStatus,
};
pub use control_point::{ControlPointResponse, InitParams, PacketReceiptNotification, Request};
pub use secure_control_point::{crc32, Checksum, ObjectInfo, SecureRequest, SecureResponse};

// Errors
pub use error::{is_remote_code, DfuError, DfuErrorCode, DfuResult};

// Firmware
pub use firmware::{FirmwareContainer, FirmwareInfo, FirmwarePart, FirmwareSize, FirmwareType, FirmwareTypes};

// Transport seam
pub use transport::{
    AdvertisementData, Characteristic, CharacteristicProperties, GattEvent, GattTransport,
    PeripheralId, WriteKind,
};
pub use uuids::{DfuUuids, UuidOverride, UuidRole};

// Orchestration
pub use device::{DeviceMode, DeviceVersion};
pub use packet::TransferProgress;
pub use protocol::{DfuController, DfuOutcome, DfuStage};
pub use connection::{DfuConnection, DfuVariant};
pub use secure_service::SecureDfuService;
pub use service::{ConnectionOutcome, LegacyDfuService, ServiceEvent, ServiceOptions};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        // Verify key types are accessible
        let _ = std::any::type_name::<DfuController>();
        let _ = std::any::type_name::<DfuStage>();
        let _ = std::any::type_name::<LegacyDfuService>();
        let _ = std::any::type_name::<SecureDfuService>();
        let _ = std::any::type_name::<DfuConnection>();
        assert!(is_remote_code(DfuErrorCode::RemoteLegacyDfuCrcError.value()));
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }
}
