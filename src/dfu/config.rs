//! Configuration constants for the Nordic Legacy and Secure DFU protocols over BLE.

use std::time::Duration;

// ============================================================================
// DFU Packet Configuration
// ============================================================================

/// Maximum payload written to the DFU Packet characteristic in one go.
///
/// Legacy bootloaders do not negotiate a larger MTU, so every firmware chunk,
/// size record and init packet fragment is capped at 20 bytes.
pub const LEGACY_PACKET_SIZE: usize = 20;

/// Default number of packets between Packet Receipt Notifications.
pub const DEFAULT_PRN: u16 = 12;

/// Length of the firmware size record sent after StartDfu (SD, BL, APP).
pub const FIRMWARE_SIZE_RECORD_LEN: usize = 12;

// ============================================================================
// Init Packet
// ============================================================================

/// Minimum length of an extended init packet (bootloader 0.5 and newer).
///
/// Device Type (2), Device Revision (2), Application Version (4),
/// SoftDevice array length (2), one SoftDevice entry (2), CRC or hash (2+).
pub const EXTENDED_INIT_PACKET_MIN_LEN: usize = 14;

/// Exact length of a pre-0.5 init packet: the CRC-16 of the firmware.
pub const LEGACY_INIT_PACKET_LEN: usize = 2;

// ============================================================================
// Firmware Files
// ============================================================================

/// Name of the manifest inside a distribution ZIP.
pub const MANIFEST_FILENAME: &str = "manifest.json";

/// Size of the Master Boot Record skipped when converting Intel HEX files.
pub const DEFAULT_MBR_SIZE: u32 = 0x1000;

// ============================================================================
// Retry and Timing
// ============================================================================

/// How many times a StartDfu answered with Invalid State is retried.
pub const DEFAULT_INVALID_STATE_RETRIES: u8 = 1;

/// Attempts at an object whose checksum does not match before giving up.
pub const SECURE_CRC_ATTEMPTS: u8 = 3;

/// Delay before StartDfu on bootloaders without a DFU Version characteristic.
///
/// SDK 6.1 and older need time to prepare flash after a Reset, 600ms was
/// measured as too short.
pub const LEGACY_START_DELAY: Duration = Duration::from_millis(1000);

// ============================================================================
// DFU Opcodes
// ============================================================================

/// Legacy DFU Control Point op codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// Start DFU, optionally followed by the firmware type byte
    StartDfu = 0x01,
    /// Initialize DFU parameters (init packet)
    InitDfuParams = 0x02,
    /// Receive firmware image (data follows on the packet characteristic)
    ReceiveFirmwareImage = 0x03,
    /// Validate the received firmware
    ValidateFirmware = 0x04,
    /// Activate firmware and reset device
    ActivateAndReset = 0x05,
    /// System reset
    Reset = 0x06,
    /// Report received image size (diagnostic)
    ReportReceivedImageSize = 0x07,
    /// Request packet receipt notification interval
    PacketReceiptNotificationRequest = 0x08,
    /// Response from bootloader
    Response = 0x10,
    /// Packet receipt notification from bootloader
    PacketReceiptNotification = 0x11,
}

impl OpCode {
    /// Parse an op code from a byte value.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(OpCode::StartDfu),
            0x02 => Some(OpCode::InitDfuParams),
            0x03 => Some(OpCode::ReceiveFirmwareImage),
            0x04 => Some(OpCode::ValidateFirmware),
            0x05 => Some(OpCode::ActivateAndReset),
            0x06 => Some(OpCode::Reset),
            0x07 => Some(OpCode::ReportReceivedImageSize),
            0x08 => Some(OpCode::PacketReceiptNotificationRequest),
            0x10 => Some(OpCode::Response),
            0x11 => Some(OpCode::PacketReceiptNotification),
            _ => None,
        }
    }

    /// Whether a Response notification may echo this op code.
    pub fn is_request(&self) -> bool {
        !matches!(self, OpCode::Response | OpCode::PacketReceiptNotification)
    }

    /// Get a human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            OpCode::StartDfu => "Start DFU",
            OpCode::InitDfuParams => "Initialize DFU Parameters",
            OpCode::ReceiveFirmwareImage => "Receive Firmware Image",
            OpCode::ValidateFirmware => "Validate Firmware",
            OpCode::ActivateAndReset => "Activate and Reset",
            OpCode::Reset => "Reset",
            OpCode::ReportReceivedImageSize => "Report Received Image Size",
            OpCode::PacketReceiptNotificationRequest => "Packet Receipt Notification Request",
            OpCode::Response => "Response",
            OpCode::PacketReceiptNotification => "Packet Receipt Notification",
        }
    }
}

/// DFU response status codes from the bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResponseStatus {
    Success = 0x01,
    InvalidState = 0x02,
    NotSupported = 0x03,
    DataSizeExceedsLimit = 0x04,
    CrcError = 0x05,
    OperationFailed = 0x06,
}

impl ResponseStatus {
    /// Parse a status code from a byte value.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(ResponseStatus::Success),
            0x02 => Some(ResponseStatus::InvalidState),
            0x03 => Some(ResponseStatus::NotSupported),
            0x04 => Some(ResponseStatus::DataSizeExceedsLimit),
            0x05 => Some(ResponseStatus::CrcError),
            0x06 => Some(ResponseStatus::OperationFailed),
            _ => None,
        }
    }

    /// Get a human-readable description.
    pub fn description(&self) -> &'static str {
        match self {
            ResponseStatus::Success => "Success",
            ResponseStatus::InvalidState => "Device is in invalid state",
            ResponseStatus::NotSupported => "Operation not supported",
            ResponseStatus::DataSizeExceedsLimit => "Data size exceeds limit",
            ResponseStatus::CrcError => "CRC Error",
            ResponseStatus::OperationFailed => "Operation failed",
        }
    }
}

// ============================================================================
// Secure DFU
// ============================================================================

/// Secure DFU Control Point op codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SecureOpCode {
    CreateObject = 0x01,
    SetPrnValue = 0x02,
    CalculateChecksum = 0x03,
    Execute = 0x04,
    ReadObjectInfo = 0x06,
    Response = 0x60,
}

impl SecureOpCode {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(SecureOpCode::CreateObject),
            0x02 => Some(SecureOpCode::SetPrnValue),
            0x03 => Some(SecureOpCode::CalculateChecksum),
            0x04 => Some(SecureOpCode::Execute),
            0x06 => Some(SecureOpCode::ReadObjectInfo),
            0x60 => Some(SecureOpCode::Response),
            _ => None,
        }
    }
}

/// Object kinds of Create and Read Object Info.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ObjectType {
    /// The init packet.
    Command = 0x01,
    /// A slice of the firmware image.
    Data = 0x02,
}

impl ObjectType {
    pub fn name(&self) -> &'static str {
        match self {
            ObjectType::Command => "Command",
            ObjectType::Data => "Data",
        }
    }
}

/// Secure DFU result codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SecureStatus {
    Success = 0x01,
    OpCodeNotSupported = 0x02,
    InvalidParameter = 0x03,
    InsufficientResources = 0x04,
    InvalidObject = 0x05,
    SignatureMismatch = 0x06,
    UnsupportedType = 0x07,
    OperationNotPermitted = 0x08,
    OperationFailed = 0x0A,
    /// The reason follows in an extra byte, see [`ExtendedError`].
    ExtendedError = 0x0B,
}

impl SecureStatus {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(SecureStatus::Success),
            0x02 => Some(SecureStatus::OpCodeNotSupported),
            0x03 => Some(SecureStatus::InvalidParameter),
            0x04 => Some(SecureStatus::InsufficientResources),
            0x05 => Some(SecureStatus::InvalidObject),
            0x06 => Some(SecureStatus::SignatureMismatch),
            0x07 => Some(SecureStatus::UnsupportedType),
            0x08 => Some(SecureStatus::OperationNotPermitted),
            0x0A => Some(SecureStatus::OperationFailed),
            0x0B => Some(SecureStatus::ExtendedError),
            _ => None,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            SecureStatus::Success => "Success",
            SecureStatus::OpCodeNotSupported => "Operation not supported",
            SecureStatus::InvalidParameter => "Invalid parameter",
            SecureStatus::InsufficientResources => "Insufficient resources",
            SecureStatus::InvalidObject => "Invalid object",
            SecureStatus::SignatureMismatch => "Signature mismatch",
            SecureStatus::UnsupportedType => "Unsupported type",
            SecureStatus::OperationNotPermitted => "Operation not permitted",
            SecureStatus::OperationFailed => "Operation failed",
            SecureStatus::ExtendedError => "Extended error",
        }
    }
}

/// Reason carried by a [`SecureStatus::ExtendedError`] response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExtendedError {
    WrongCommandFormat = 0x02,
    UnknownCommand = 0x03,
    InitCommandInvalid = 0x04,
    FwVersionFailure = 0x05,
    HwVersionFailure = 0x06,
    SdVersionFailure = 0x07,
    SignatureMissing = 0x08,
    WrongHashType = 0x09,
    HashFailed = 0x0A,
    WrongSignatureType = 0x0B,
    VerificationFailed = 0x0C,
    InsufficientSpace = 0x0D,
}

impl ExtendedError {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x02 => Some(ExtendedError::WrongCommandFormat),
            0x03 => Some(ExtendedError::UnknownCommand),
            0x04 => Some(ExtendedError::InitCommandInvalid),
            0x05 => Some(ExtendedError::FwVersionFailure),
            0x06 => Some(ExtendedError::HwVersionFailure),
            0x07 => Some(ExtendedError::SdVersionFailure),
            0x08 => Some(ExtendedError::SignatureMissing),
            0x09 => Some(ExtendedError::WrongHashType),
            0x0A => Some(ExtendedError::HashFailed),
            0x0B => Some(ExtendedError::WrongSignatureType),
            0x0C => Some(ExtendedError::VerificationFailed),
            0x0D => Some(ExtendedError::InsufficientSpace),
            _ => None,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ExtendedError::WrongCommandFormat => "Wrong command format",
            ExtendedError::UnknownCommand => "Unknown command",
            ExtendedError::InitCommandInvalid => "Init command was invalid",
            ExtendedError::FwVersionFailure => "FW version check failed",
            ExtendedError::HwVersionFailure => "HW version check failed",
            ExtendedError::SdVersionFailure => "SD version check failed",
            ExtendedError::SignatureMissing => "Signature missing",
            ExtendedError::WrongHashType => "Invalid hash type",
            ExtendedError::HashFailed => "Hashing failed",
            ExtendedError::WrongSignatureType => "Invalid signature type",
            ExtendedError::VerificationFailed => "Verification failed",
            ExtendedError::InsufficientSpace => "Insufficient space for upgrade",
        }
    }
}

// ============================================================================
// Buttonless DFU
// ============================================================================

/// Op codes of the buttonless DFU characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ButtonlessOpCode {
    EnterBootloader = 0x01,
    SetName = 0x02,
    Response = 0x20,
}

impl ButtonlessOpCode {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(ButtonlessOpCode::EnterBootloader),
            0x02 => Some(ButtonlessOpCode::SetName),
            0x20 => Some(ButtonlessOpCode::Response),
            _ => None,
        }
    }
}

/// Result codes of the buttonless DFU characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ButtonlessStatus {
    Success = 0x01,
    OpCodeNotSupported = 0x02,
    OperationFailed = 0x04,
}

impl ButtonlessStatus {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(ButtonlessStatus::Success),
            0x02 => Some(ButtonlessStatus::OpCodeNotSupported),
            0x04 => Some(ButtonlessStatus::OperationFailed),
            _ => None,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ButtonlessStatus::Success => "Success",
            ButtonlessStatus::OpCodeNotSupported => "Operation not supported",
            ButtonlessStatus::OperationFailed => "Operation failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_from_byte() {
        assert_eq!(OpCode::from_byte(0x03), Some(OpCode::ReceiveFirmwareImage));
        assert_eq!(OpCode::from_byte(0x10), Some(OpCode::Response));
        assert_eq!(OpCode::from_byte(0x11), Some(OpCode::PacketReceiptNotification));
        assert_eq!(OpCode::from_byte(0x09), None);
        assert_eq!(OpCode::from_byte(0x00), None);
    }

    #[test]
    fn test_opcode_is_request() {
        assert!(OpCode::StartDfu.is_request());
        assert!(OpCode::PacketReceiptNotificationRequest.is_request());
        assert!(!OpCode::Response.is_request());
        assert!(!OpCode::PacketReceiptNotification.is_request());
    }

    #[test]
    fn test_response_status_roundtrip() {
        for byte in 1..=6u8 {
            let status = ResponseStatus::from_byte(byte).unwrap();
            assert_eq!(status as u8, byte);
        }
        assert_eq!(ResponseStatus::from_byte(0), None);
        assert_eq!(ResponseStatus::from_byte(7), None);
    }

    #[test]
    fn test_init_packet_limits() {
        assert!(LEGACY_INIT_PACKET_LEN < EXTENDED_INIT_PACKET_MIN_LEN);
        assert_eq!(FIRMWARE_SIZE_RECORD_LEN, 3 * std::mem::size_of::<u32>());
    }

    #[test]
    fn test_secure_status_skips_unassigned_byte() {
        assert_eq!(SecureStatus::from_byte(0x08), Some(SecureStatus::OperationNotPermitted));
        assert_eq!(SecureStatus::from_byte(0x09), None);
        assert_eq!(SecureStatus::from_byte(0x0B), Some(SecureStatus::ExtendedError));
        assert_eq!(ExtendedError::from_byte(0x01), None);
        assert_eq!(ExtendedError::from_byte(0x0D), Some(ExtendedError::InsufficientSpace));
    }

    #[test]
    fn test_buttonless_status() {
        assert_eq!(ButtonlessStatus::from_byte(0x03), None);
        assert_eq!(ButtonlessStatus::from_byte(0x04), Some(ButtonlessStatus::OperationFailed));
        assert_eq!(ButtonlessOpCode::from_byte(0x20), Some(ButtonlessOpCode::Response));
    }
}
