//! Buttonless DFU characteristic: asks a running application to reboot into
//! its Secure DFU bootloader.
//!
//! Three variants exist. The experimental one (SDK 12) is a service of its
//! own and uses notifications. The ones without bond sharing (SDK 13) and
//! with bond sharing (SDK 14) live in the Secure DFU service and use
//! indications. Requests are `01` (enter bootloader) and `02 ll name..`
//! (set the bootloader's advertising name); the answer is `20 rq st`.

use tracing::{debug, warn};
use uuid::Uuid;

use super::config::{ButtonlessOpCode, ButtonlessStatus};
use super::error::{DfuError, DfuResult};
use super::transport::{GattTransport, WriteKind};
use super::uuids::{DfuUuids, UuidRole};

/// Longest advertising name the bootloader accepts, in bytes.
pub const MAX_ADVERTISING_NAME_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonlessKind {
    Experimental,
    WithoutBonds,
    WithBonds,
}

impl ButtonlessKind {
    pub fn detect(uuid: Uuid, uuids: &DfuUuids) -> Option<Self> {
        if uuid == uuids.get(UuidRole::ButtonlessExperimentalCharacteristic) {
            Some(ButtonlessKind::Experimental)
        } else if uuid == uuids.get(UuidRole::ButtonlessWithoutBonds) {
            Some(ButtonlessKind::WithoutBonds)
        } else if uuid == uuids.get(UuidRole::ButtonlessWithBonds) {
            Some(ButtonlessKind::WithBonds)
        } else {
            None
        }
    }

    /// Without shared bonds the bootloader advertises with the address
    /// incremented by one.
    pub fn new_address_expected(&self) -> bool {
        !matches!(self, ButtonlessKind::WithBonds)
    }

    /// Set Name was added in SDK 14 to the variant without bond sharing.
    /// Its SDK 13 version answers Op Code Not Supported.
    pub fn may_support_setting_name(&self) -> bool {
        matches!(self, ButtonlessKind::WithoutBonds)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ButtonlessRequest {
    EnterBootloader,
    SetName(String),
}

impl ButtonlessRequest {
    pub fn op_code(&self) -> ButtonlessOpCode {
        match self {
            ButtonlessRequest::EnterBootloader => ButtonlessOpCode::EnterBootloader,
            ButtonlessRequest::SetName(_) => ButtonlessOpCode::SetName,
        }
    }

    /// Names longer than [`MAX_ADVERTISING_NAME_LEN`] bytes are rejected.
    pub fn encode(&self) -> DfuResult<Vec<u8>> {
        match self {
            ButtonlessRequest::EnterBootloader => Ok(vec![self.op_code() as u8]),
            ButtonlessRequest::SetName(name) => {
                let len = name.len();
                if len == 0 || len > MAX_ADVERTISING_NAME_LEN {
                    return Err(DfuError::WritingCharacteristicFailed {
                        reason: format!(
                            "advertising name must be 1 to {} bytes, got {}",
                            MAX_ADVERTISING_NAME_LEN, len
                        ),
                    });
                }
                let mut value = vec![self.op_code() as u8, len as u8];
                value.extend_from_slice(name.as_bytes());
                Ok(value)
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ButtonlessRequest::EnterBootloader => "Enter Bootloader",
            ButtonlessRequest::SetName(_) => "Set Name",
        }
    }
}

/// A response indication: `[0x20, request op code, status]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ButtonlessResponse {
    pub request: ButtonlessOpCode,
    pub status: ButtonlessStatus,
}

impl ButtonlessResponse {
    pub fn parse(data: &[u8]) -> DfuResult<Self> {
        let unsupported = || DfuError::UnsupportedResponse {
            data: data.to_vec(),
        };

        let [op, request, status] = data else {
            return Err(unsupported());
        };
        if ButtonlessOpCode::from_byte(*op) != Some(ButtonlessOpCode::Response) {
            return Err(unsupported());
        }
        let request = ButtonlessOpCode::from_byte(*request)
            .filter(|op| *op != ButtonlessOpCode::Response)
            .ok_or_else(unsupported)?;
        let status = ButtonlessStatus::from_byte(*status).ok_or_else(unsupported)?;
        Ok(Self { request, status })
    }

    pub fn encode(&self) -> [u8; 3] {
        [ButtonlessOpCode::Response as u8, self.request as u8, self.status as u8]
    }
}

#[derive(Debug)]
pub enum ButtonlessEvent {
    NotificationsEnabled,
    Completed(ButtonlessOpCode),
    Failed(DfuError),
}

/// The buttonless characteristic of a device running its application.
#[derive(Debug)]
pub struct Buttonless {
    uuid: Uuid,
    kind: ButtonlessKind,
    pending: Option<ButtonlessOpCode>,
}

impl Buttonless {
    pub fn new(uuid: Uuid, kind: ButtonlessKind) -> Self {
        Self {
            uuid,
            kind,
            pending: None,
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn kind(&self) -> ButtonlessKind {
        self.kind
    }

    /// Enables indications, or notifications on the experimental variant.
    pub fn enable_notifications<T: GattTransport + ?Sized>(&mut self, transport: &mut T) {
        debug!("Enabling {:?} buttonless responses for {}", self.kind, self.uuid);
        transport.enable_notifications(self.uuid);
    }

    pub fn send<T: GattTransport + ?Sized>(
        &mut self,
        request: &ButtonlessRequest,
        transport: &mut T,
    ) -> DfuResult<()> {
        let value = request.encode()?;
        debug!("Writing {} {:02X?} to {}", request.name(), value, self.uuid);
        self.pending = Some(request.op_code());
        transport.write(self.uuid, &value, WriteKind::WithResponse);
        Ok(())
    }

    pub fn handle_notification_state(&mut self, result: Result<(), String>) -> ButtonlessEvent {
        match result {
            Ok(()) => ButtonlessEvent::NotificationsEnabled,
            Err(reason) => ButtonlessEvent::Failed(DfuError::EnablingControlPointFailed { reason }),
        }
    }

    pub fn handle_write(&mut self, result: Result<(), String>) -> Option<ButtonlessEvent> {
        match (result, self.pending) {
            (Ok(()), _) => None,
            (Err(reason), Some(ButtonlessOpCode::EnterBootloader)) => {
                // The application may reboot before acknowledging
                warn!("Enter Bootloader write failed ({}), device is resetting", reason);
                None
            }
            (Err(reason), _) => {
                self.pending = None;
                Some(ButtonlessEvent::Failed(
                    DfuError::WritingCharacteristicFailed { reason },
                ))
            }
        }
    }

    pub fn handle_value(&mut self, result: Result<Vec<u8>, String>) -> Option<ButtonlessEvent> {
        let data = match result {
            Ok(data) => data,
            Err(reason) => {
                self.pending = None;
                return Some(ButtonlessEvent::Failed(
                    DfuError::ReceivingNotificationFailed { reason },
                ));
            }
        };
        let response = match ButtonlessResponse::parse(&data) {
            Ok(response) => response,
            Err(e) => return Some(ButtonlessEvent::Failed(e)),
        };
        if self.pending.take().is_none() {
            warn!("Unexpected buttonless response {:02X?}", data);
            return None;
        }

        if response.status == ButtonlessStatus::Success {
            debug!("Buttonless {:?} completed", response.request);
            Some(ButtonlessEvent::Completed(response.request))
        } else {
            Some(ButtonlessEvent::Failed(DfuError::remote_buttonless(
                response.status,
                self.kind == ButtonlessKind::Experimental,
            )))
        }
    }
}
