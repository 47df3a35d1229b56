//! DFU error types and the unified numeric error taxonomy.

use thiserror::Error;

use super::config::{
    ButtonlessStatus, ExtendedError, ObjectType, OpCode, ResponseStatus, SecureOpCode, SecureStatus,
};

/// Result type alias for DFU operations.
pub type DfuResult<T> = Result<T, DfuError>;

/// Errors that can occur during DFU operations.
#[derive(Debug, Error)]
pub enum DfuError {
    /// Standard I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// ZIP archive error.
    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// JSON parsing error for manifest.json or settings.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// No firmware file was given.
    #[error("Firmware not specified")]
    FileNotSpecified,

    /// The firmware file has the wrong extension or could not be decoded.
    #[error("Invalid firmware file: {reason}")]
    FileInvalid { reason: String },

    /// The distribution ZIP has no manifest.json.
    #[error("No manifest.json found in firmware ZIP")]
    NoManifest,

    /// Invalid or malformed manifest.json.
    #[error("Invalid manifest: {reason}")]
    InvalidManifest { reason: String },

    /// A file referenced by the manifest is not in the archive.
    #[error("File referenced by manifest not found: {filename}")]
    FileNotFound { filename: String },

    /// None of the requested firmware types exist in the package.
    #[error("Requested firmware type(s) 0x{requested:02X} not found in package")]
    TypeNotFound { requested: u8 },

    /// The target requires an extended init packet (bootloader 0.5+).
    #[error("{message}")]
    ExtendedInitPacketRequired { message: String },

    /// The target accepts only the 2-byte CRC init packet.
    #[error("Init packet with 2-byte CRC supported. Extended init packet found.")]
    InitPacketRequired,

    /// Connecting to the peripheral failed.
    #[error("Device failed to connect: {reason}")]
    FailedToConnect { reason: String },

    /// The peripheral disconnected while it was still needed.
    #[error("Device disconnected unexpectedly: {reason}")]
    DeviceDisconnected { reason: String },

    /// The platform Bluetooth adapter is powered off.
    #[error("Bluetooth adapter is disabled")]
    BluetoothDisabled,

    /// Service or characteristic discovery failed.
    #[error("Service discovery failed: {reason}")]
    ServiceDiscoveryFailed { reason: String },

    /// The peripheral does not expose a supported DFU service.
    #[error("Device not supported: {reason}")]
    DeviceNotSupported { reason: String },

    /// Reading the DFU Version characteristic failed.
    #[error("Reading DFU version failed: {reason}")]
    ReadingVersionFailed { reason: String },

    /// Enabling notifications on the DFU Control Point failed.
    #[error("Enabling notifications failed: {reason}")]
    EnablingControlPointFailed { reason: String },

    /// A write to a DFU characteristic failed.
    #[error("Writing to characteristic failed: {reason}")]
    WritingCharacteristicFailed { reason: String },

    /// A notification carried an error instead of a value.
    #[error("Receiving notification failed: {reason}")]
    ReceivingNotificationFailed { reason: String },

    /// A notification could not be parsed as a response or PRN.
    #[error("Unsupported response received: 0x{}", hex(.data))]
    UnsupportedResponse { data: Vec<u8> },

    /// The device reported a different byte count than was sent.
    #[error("{sent} bytes were sent while {received} bytes were reported as received")]
    BytesLost { sent: u32, received: u32 },

    /// CRC checksum mismatch detected locally.
    #[error("CRC mismatch: expected 0x{expected:04X}, got 0x{actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },

    /// The bootloader answered a request with a non-success status.
    #[error("{message}")]
    Remote {
        request: OpCode,
        status: ResponseStatus,
        message: String,
    },

    /// A Secure DFU bootloader answered a request with a non-success status.
    #[error("{message}")]
    RemoteSecure {
        request: SecureOpCode,
        status: SecureStatus,
        /// Set when `status` is [`SecureStatus::ExtendedError`] and the
        /// reason byte was recognised.
        extended: Option<ExtendedError>,
        message: String,
    },

    /// The application refused a buttonless DFU request.
    #[error("{message}")]
    RemoteButtonless {
        status: ButtonlessStatus,
        /// Reported by the experimental buttonless service.
        experimental: bool,
        message: String,
    },

    /// An object kept failing its CRC-32 check.
    #[error("Sending {} object failed: CRC mismatch after {attempts} attempts", .object.name())]
    ObjectCrcMismatch { object: ObjectType, attempts: u8 },
}

impl DfuError {
    /// Build a remote error with the status' default description.
    pub fn remote(request: OpCode, status: ResponseStatus) -> Self {
        DfuError::Remote {
            request,
            status,
            message: status.description().to_string(),
        }
    }

    /// Build a remote error with a context-specific message.
    pub fn remote_with_message(
        request: OpCode,
        status: ResponseStatus,
        message: impl Into<String>,
    ) -> Self {
        DfuError::Remote {
            request,
            status,
            message: message.into(),
        }
    }

    /// Build a Secure DFU remote error with the most specific description.
    pub fn remote_secure(
        request: SecureOpCode,
        status: SecureStatus,
        extended: Option<ExtendedError>,
    ) -> Self {
        let message = match extended {
            Some(extended) => extended.description(),
            None => status.description(),
        };
        DfuError::RemoteSecure {
            request,
            status,
            extended,
            message: message.to_string(),
        }
    }

    pub fn remote_buttonless(status: ButtonlessStatus, experimental: bool) -> Self {
        DfuError::RemoteButtonless {
            status,
            experimental,
            message: status.description().to_string(),
        }
    }

    /// Status reported by the bootloader, if this is a remote error.
    pub fn remote_status(&self) -> Option<ResponseStatus> {
        match self {
            DfuError::Remote { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Map this error onto the unified numeric taxonomy.
    pub fn code(&self) -> DfuErrorCode {
        match self {
            DfuError::FileNotSpecified => DfuErrorCode::FileNotSpecified,
            DfuError::Io(_)
            | DfuError::Zip(_)
            | DfuError::Json(_)
            | DfuError::FileInvalid { .. }
            | DfuError::NoManifest
            | DfuError::InvalidManifest { .. }
            | DfuError::FileNotFound { .. }
            | DfuError::TypeNotFound { .. } => DfuErrorCode::FileInvalid,
            DfuError::ExtendedInitPacketRequired { .. } => DfuErrorCode::ExtendedInitPacketRequired,
            DfuError::InitPacketRequired => DfuErrorCode::InitPacketRequired,
            DfuError::FailedToConnect { .. } => DfuErrorCode::FailedToConnect,
            DfuError::DeviceDisconnected { .. } => DfuErrorCode::DeviceDisconnected,
            DfuError::BluetoothDisabled => DfuErrorCode::BluetoothDisabled,
            DfuError::ServiceDiscoveryFailed { .. } => DfuErrorCode::ServiceDiscoveryFailed,
            DfuError::DeviceNotSupported { .. } => DfuErrorCode::DeviceNotSupported,
            DfuError::ReadingVersionFailed { .. } => DfuErrorCode::ReadingVersionFailed,
            DfuError::EnablingControlPointFailed { .. } => DfuErrorCode::EnablingControlPointFailed,
            DfuError::WritingCharacteristicFailed { .. } => {
                DfuErrorCode::WritingCharacteristicFailed
            }
            DfuError::ReceivingNotificationFailed { .. } => {
                DfuErrorCode::ReceivingNotificationFailed
            }
            DfuError::UnsupportedResponse { .. } => DfuErrorCode::UnsupportedResponse,
            DfuError::BytesLost { .. } => DfuErrorCode::BytesLost,
            DfuError::CrcMismatch { .. } => DfuErrorCode::CrcError,
            DfuError::ObjectCrcMismatch { .. } => DfuErrorCode::CrcError,
            DfuError::Remote { status, .. } => DfuErrorCode::from(*status),
            DfuError::RemoteSecure {
                extended: Some(extended),
                ..
            } => DfuErrorCode::from(*extended),
            DfuError::RemoteSecure { status, .. } => DfuErrorCode::from(*status),
            DfuError::RemoteButtonless {
                status,
                experimental,
                ..
            } => DfuErrorCode::buttonless(*status, *experimental),
        }
    }

    /// Whether the error was reported by the remote device.
    pub fn is_remote(&self) -> bool {
        self.code().is_remote()
    }
}

fn hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02X}", b)).collect()
}

/// Unified numeric error codes shared by remote and local failures.
///
/// Remote codes are below 100 or above 9000, local ones fall in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum DfuErrorCode {
    // Legacy DFU bootloader status codes
    RemoteLegacyDfuSuccess = 1,
    RemoteLegacyDfuInvalidState = 2,
    RemoteLegacyDfuNotSupported = 3,
    RemoteLegacyDfuDataExceedsLimit = 4,
    RemoteLegacyDfuCrcError = 5,
    RemoteLegacyDfuOperationFailed = 6,

    // Secure DFU status codes (10 + status)
    RemoteSecureDfuSuccess = 11,
    RemoteSecureDfuOpCodeNotSupported = 12,
    RemoteSecureDfuInvalidParameter = 13,
    RemoteSecureDfuInsufficientResources = 14,
    RemoteSecureDfuInvalidObject = 15,
    RemoteSecureDfuSignatureMismatch = 16,
    RemoteSecureDfuUnsupportedType = 17,
    RemoteSecureDfuOperationNotPermitted = 18,
    RemoteSecureDfuOperationFailed = 20,
    RemoteSecureDfuExtendedError = 21,

    // Secure DFU extended errors (20 + extended code)
    RemoteExtendedErrorWrongCommandFormat = 22,
    RemoteExtendedErrorUnknownCommand = 23,
    RemoteExtendedErrorInitCommandInvalid = 24,
    RemoteExtendedErrorFwVersionFailure = 25,
    RemoteExtendedErrorHwVersionFailure = 26,
    RemoteExtendedErrorSdVersionFailure = 27,
    RemoteExtendedErrorSignatureMissing = 28,
    RemoteExtendedErrorWrongHashType = 29,
    RemoteExtendedErrorHashFailed = 30,
    RemoteExtendedErrorWrongSignatureType = 31,
    RemoteExtendedErrorVerificationFailed = 32,
    RemoteExtendedErrorInsufficientSpace = 33,

    // Buttonless DFU status codes (90 + status)
    RemoteButtonlessDfuSuccess = 91,
    RemoteButtonlessDfuOpCodeNotSupported = 92,
    RemoteButtonlessDfuOperationFailed = 94,

    // Experimental Buttonless DFU status codes (9000 + status)
    RemoteExperimentalButtonlessDfuSuccess = 9001,
    RemoteExperimentalButtonlessDfuOpCodeNotSupported = 9002,
    RemoteExperimentalButtonlessDfuOperationFailed = 9004,

    // Firmware
    FileNotSpecified = 101,
    FileInvalid = 102,
    ExtendedInitPacketRequired = 103,
    InitPacketRequired = 104,

    // Connection
    FailedToConnect = 201,
    DeviceDisconnected = 202,
    BluetoothDisabled = 203,

    // Protocol
    ServiceDiscoveryFailed = 301,
    DeviceNotSupported = 302,
    ReadingVersionFailed = 303,
    EnablingControlPointFailed = 304,
    WritingCharacteristicFailed = 305,
    ReceivingNotificationFailed = 306,
    UnsupportedResponse = 307,
    BytesLost = 308,
    CrcError = 309,
}

impl DfuErrorCode {
    /// Numeric value of the code.
    pub fn value(&self) -> u32 {
        *self as u32
    }

    /// Whether the code was reported by the remote device.
    pub fn is_remote(&self) -> bool {
        is_remote_code(self.value())
    }

    fn buttonless(status: ButtonlessStatus, experimental: bool) -> Self {
        match (status, experimental) {
            (ButtonlessStatus::Success, false) => DfuErrorCode::RemoteButtonlessDfuSuccess,
            (ButtonlessStatus::OpCodeNotSupported, false) => {
                DfuErrorCode::RemoteButtonlessDfuOpCodeNotSupported
            }
            (ButtonlessStatus::OperationFailed, false) => {
                DfuErrorCode::RemoteButtonlessDfuOperationFailed
            }
            (ButtonlessStatus::Success, true) => DfuErrorCode::RemoteExperimentalButtonlessDfuSuccess,
            (ButtonlessStatus::OpCodeNotSupported, true) => {
                DfuErrorCode::RemoteExperimentalButtonlessDfuOpCodeNotSupported
            }
            (ButtonlessStatus::OperationFailed, true) => {
                DfuErrorCode::RemoteExperimentalButtonlessDfuOperationFailed
            }
        }
    }
}

/// Classify any unified numeric code by its range.
pub fn is_remote_code(code: u32) -> bool {
    code < 100 || code > 9000
}

impl From<ResponseStatus> for DfuErrorCode {
    fn from(status: ResponseStatus) -> Self {
        match status {
            ResponseStatus::Success => DfuErrorCode::RemoteLegacyDfuSuccess,
            ResponseStatus::InvalidState => DfuErrorCode::RemoteLegacyDfuInvalidState,
            ResponseStatus::NotSupported => DfuErrorCode::RemoteLegacyDfuNotSupported,
            ResponseStatus::DataSizeExceedsLimit => DfuErrorCode::RemoteLegacyDfuDataExceedsLimit,
            ResponseStatus::CrcError => DfuErrorCode::RemoteLegacyDfuCrcError,
            ResponseStatus::OperationFailed => DfuErrorCode::RemoteLegacyDfuOperationFailed,
        }
    }
}

impl From<SecureStatus> for DfuErrorCode {
    fn from(status: SecureStatus) -> Self {
        match status {
            SecureStatus::Success => DfuErrorCode::RemoteSecureDfuSuccess,
            SecureStatus::OpCodeNotSupported => DfuErrorCode::RemoteSecureDfuOpCodeNotSupported,
            SecureStatus::InvalidParameter => DfuErrorCode::RemoteSecureDfuInvalidParameter,
            SecureStatus::InsufficientResources => {
                DfuErrorCode::RemoteSecureDfuInsufficientResources
            }
            SecureStatus::InvalidObject => DfuErrorCode::RemoteSecureDfuInvalidObject,
            SecureStatus::SignatureMismatch => DfuErrorCode::RemoteSecureDfuSignatureMismatch,
            SecureStatus::UnsupportedType => DfuErrorCode::RemoteSecureDfuUnsupportedType,
            SecureStatus::OperationNotPermitted => {
                DfuErrorCode::RemoteSecureDfuOperationNotPermitted
            }
            SecureStatus::OperationFailed => DfuErrorCode::RemoteSecureDfuOperationFailed,
            SecureStatus::ExtendedError => DfuErrorCode::RemoteSecureDfuExtendedError,
        }
    }
}

impl From<ExtendedError> for DfuErrorCode {
    fn from(error: ExtendedError) -> Self {
        match error {
            ExtendedError::WrongCommandFormat => DfuErrorCode::RemoteExtendedErrorWrongCommandFormat,
            ExtendedError::UnknownCommand => DfuErrorCode::RemoteExtendedErrorUnknownCommand,
            ExtendedError::InitCommandInvalid => DfuErrorCode::RemoteExtendedErrorInitCommandInvalid,
            ExtendedError::FwVersionFailure => DfuErrorCode::RemoteExtendedErrorFwVersionFailure,
            ExtendedError::HwVersionFailure => DfuErrorCode::RemoteExtendedErrorHwVersionFailure,
            ExtendedError::SdVersionFailure => DfuErrorCode::RemoteExtendedErrorSdVersionFailure,
            ExtendedError::SignatureMissing => DfuErrorCode::RemoteExtendedErrorSignatureMissing,
            ExtendedError::WrongHashType => DfuErrorCode::RemoteExtendedErrorWrongHashType,
            ExtendedError::HashFailed => DfuErrorCode::RemoteExtendedErrorHashFailed,
            ExtendedError::WrongSignatureType => DfuErrorCode::RemoteExtendedErrorWrongSignatureType,
            ExtendedError::VerificationFailed => DfuErrorCode::RemoteExtendedErrorVerificationFailed,
            ExtendedError::InsufficientSpace => DfuErrorCode::RemoteExtendedErrorInsufficientSpace,
        }
    }
}
