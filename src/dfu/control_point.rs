//! DFU Control Point requests, responses and the single-slot request state
//! machine.
//!
//! Wire format (all values little-endian):
//!
//! | Request                 | Bytes             |
//! |-------------------------|-------------------|
//! | Jump to bootloader      | `01 04`           |
//! | Start DFU (type)        | `01 tt`           |
//! | Start DFU (pre SDK 7)   | `01`              |
//! | Init params (rx / done) | `02 00` / `02 01` |
//! | Init params (pre SDK 7) | `02`              |
//! | Receive firmware image  | `03`              |
//! | Validate                | `04`              |
//! | Activate and reset      | `05`              |
//! | Reset                   | `06`              |
//! | Set PRN                 | `08 nn nn`        |
//!
//! Notifications are either a response `10 rq st` or a packet receipt
//! notification `11 bb bb bb bb`.

use tracing::{debug, warn};
use uuid::Uuid;

use super::config::{OpCode, ResponseStatus};
use super::error::{DfuError, DfuResult};
use super::firmware::FirmwareType;
use super::transport::{GattTransport, WriteKind};

/// Second byte of an Init DFU Parameters request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InitParams {
    Receive = 0x00,
    Complete = 0x01,
}

/// A request written to the DFU Control Point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// Buttonless jump from the application into the bootloader.
    JumpToBootloader,
    StartDfu(FirmwareType),
    /// Start DFU without the type byte, application only.
    StartDfuLegacy,
    InitParams(InitParams),
    /// Single init request followed by a 2-byte CRC init packet.
    InitParamsLegacy,
    ReceiveFirmwareImage,
    Validate,
    ActivateAndReset,
    Reset,
    /// Packet Receipt Notification interval, 0 disables notifications.
    SetPrn(u16),
}

impl Request {
    pub fn op_code(&self) -> OpCode {
        match self {
            Request::JumpToBootloader | Request::StartDfu(_) | Request::StartDfuLegacy => {
                OpCode::StartDfu
            }
            Request::InitParams(_) | Request::InitParamsLegacy => OpCode::InitDfuParams,
            Request::ReceiveFirmwareImage => OpCode::ReceiveFirmwareImage,
            Request::Validate => OpCode::ValidateFirmware,
            Request::ActivateAndReset => OpCode::ActivateAndReset,
            Request::Reset => OpCode::Reset,
            Request::SetPrn(_) => OpCode::PacketReceiptNotificationRequest,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let op = self.op_code() as u8;
        match self {
            Request::JumpToBootloader => vec![op, FirmwareType::Application.bits()],
            Request::StartDfu(kind) => vec![op, kind.bits()],
            Request::InitParams(step) => vec![op, *step as u8],
            Request::SetPrn(count) => {
                let [lo, hi] = count.to_le_bytes();
                vec![op, lo, hi]
            }
            Request::StartDfuLegacy
            | Request::InitParamsLegacy
            | Request::ReceiveFirmwareImage
            | Request::Validate
            | Request::ActivateAndReset
            | Request::Reset => vec![op],
        }
    }

    /// Requests after which the device resets and may drop the link before
    /// acknowledging the write.
    pub fn is_reset_class(&self) -> bool {
        matches!(
            self,
            Request::JumpToBootloader | Request::ActivateAndReset | Request::Reset
        )
    }

    /// Requests that complete with a Response notification rather than the
    /// write acknowledgement.
    pub fn expects_response(&self) -> bool {
        matches!(
            self,
            Request::StartDfu(_)
                | Request::StartDfuLegacy
                | Request::InitParams(InitParams::Complete)
                | Request::InitParamsLegacy
                | Request::ReceiveFirmwareImage
                | Request::Validate
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Request::JumpToBootloader => "Jump to Bootloader",
            Request::StartDfu(_) => "Start DFU",
            Request::StartDfuLegacy => "Start DFU (v1)",
            Request::InitParams(InitParams::Receive) => "Initialize DFU Parameters (Receive)",
            Request::InitParams(InitParams::Complete) => "Initialize DFU Parameters (Complete)",
            Request::InitParamsLegacy => "Initialize DFU Parameters (v1)",
            Request::ReceiveFirmwareImage => "Receive Firmware Image",
            Request::Validate => "Validate Firmware",
            Request::ActivateAndReset => "Activate and Reset",
            Request::Reset => "Reset",
            Request::SetPrn(_) => "Packet Receipt Notification Request",
        }
    }
}

/// A Response notification: `[0x10, request op code, status]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlPointResponse {
    pub request: OpCode,
    pub status: ResponseStatus,
}

impl ControlPointResponse {
    pub fn parse(data: &[u8]) -> DfuResult<Self> {
        let unsupported = || DfuError::UnsupportedResponse {
            data: data.to_vec(),
        };

        let [op, request, status, ..] = data else {
            return Err(unsupported());
        };
        if OpCode::from_byte(*op) != Some(OpCode::Response) {
            return Err(unsupported());
        }
        let request = OpCode::from_byte(*request)
            .filter(OpCode::is_request)
            .ok_or_else(unsupported)?;
        let status = ResponseStatus::from_byte(*status).ok_or_else(unsupported)?;

        Ok(Self { request, status })
    }

    /// The notification bytes a bootloader sends for this response.
    pub fn encode(&self) -> [u8; 3] {
        [OpCode::Response as u8, self.request as u8, self.status as u8]
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }
}

/// A Packet Receipt Notification: `[0x11, bytes received u32 LE]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketReceiptNotification {
    pub bytes_received: u32,
}

impl PacketReceiptNotification {
    pub fn parse(data: &[u8]) -> Option<Self> {
        match data {
            [op, b0, b1, b2, b3, ..] if *op == OpCode::PacketReceiptNotification as u8 => {
                Some(Self {
                    bytes_received: u32::from_le_bytes([*b0, *b1, *b2, *b3]),
                })
            }
            _ => None,
        }
    }

    pub fn encode(&self) -> [u8; 5] {
        let [b0, b1, b2, b3] = self.bytes_received.to_le_bytes();
        [OpCode::PacketReceiptNotification as u8, b0, b1, b2, b3]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlPointState {
    Idle,
    AwaitingNotificationEnable,
    /// Written, waiting for the write acknowledgement.
    RequestSent(Request),
    /// Acknowledged, waiting for the Response notification.
    AwaitingResponse(Request),
}

/// What a transport event meant for the control point.
#[derive(Debug)]
pub enum ControlPointEvent {
    NotificationsEnabled,
    /// The write of a request was acknowledged (or demoted to success).
    Written(Request),
    /// The device answered a request with Success.
    Completed(Request),
    PacketReceipt(PacketReceiptNotification),
    Failed(DfuError),
}

/// DFU Control Point characteristic with at most one request in flight.
#[derive(Debug)]
pub struct ControlPoint {
    uuid: Uuid,
    state: ControlPointState,
}

impl ControlPoint {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            state: ControlPointState::Idle,
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn state(&self) -> ControlPointState {
        self.state
    }

    /// True while firmware packets are being streamed.
    pub fn is_streaming(&self) -> bool {
        self.state == ControlPointState::AwaitingResponse(Request::ReceiveFirmwareImage)
    }

    pub fn enable_notifications<T: GattTransport + ?Sized>(&mut self, transport: &mut T) {
        debug!("Enabling notifications for {}", self.uuid);
        self.state = ControlPointState::AwaitingNotificationEnable;
        transport.enable_notifications(self.uuid);
    }

    /// Write a request. Use [`reset`](Self::reset) to replace one in flight.
    pub fn send<T: GattTransport + ?Sized>(
        &mut self,
        request: Request,
        transport: &mut T,
    ) -> DfuResult<()> {
        if request == Request::Reset {
            self.reset(transport);
            return Ok(());
        }
        if let ControlPointState::RequestSent(pending)
        | ControlPointState::AwaitingResponse(pending) = self.state
        {
            return Err(DfuError::WritingCharacteristicFailed {
                reason: format!(
                    "cannot send {} while {} is in progress",
                    request.name(),
                    pending.name()
                ),
            });
        }
        self.write(request, transport);
        Ok(())
    }

    /// Write `Reset`, replacing whatever request is still in flight.
    pub fn reset<T: GattTransport + ?Sized>(&mut self, transport: &mut T) {
        if let ControlPointState::RequestSent(pending)
        | ControlPointState::AwaitingResponse(pending) = self.state
        {
            debug!("Reset replaces pending {}", pending.name());
        }
        self.write(Request::Reset, transport);
    }

    fn write<T: GattTransport + ?Sized>(&mut self, request: Request, transport: &mut T) {
        let value = request.encode();
        debug!("Writing {} {:02X?} to Control Point", request.name(), value);
        self.state = ControlPointState::RequestSent(request);
        transport.write(self.uuid, &value, WriteKind::WithResponse);
    }

    pub fn handle_notification_state(&mut self, result: Result<(), String>) -> ControlPointEvent {
        if self.state == ControlPointState::AwaitingNotificationEnable {
            self.state = ControlPointState::Idle;
        }
        match result {
            Ok(()) => {
                debug!("Control Point notifications enabled");
                ControlPointEvent::NotificationsEnabled
            }
            Err(reason) => ControlPointEvent::Failed(DfuError::EnablingControlPointFailed { reason }),
        }
    }

    pub fn handle_write(&mut self, result: Result<(), String>) -> Option<ControlPointEvent> {
        let ControlPointState::RequestSent(request) = self.state else {
            debug!("Ignoring write acknowledgement in state {:?}", self.state);
            return None;
        };

        match result {
            Ok(()) => {
                debug!("{} written", request.name());
            }
            Err(reason) if request.is_reset_class() => {
                // The device may reset before the acknowledgement
                warn!("{} write failed ({}), device is resetting", request.name(), reason);
            }
            Err(reason) => {
                self.state = ControlPointState::Idle;
                return Some(ControlPointEvent::Failed(
                    DfuError::WritingCharacteristicFailed {
                        reason: format!("{}: {}", request.name(), reason),
                    },
                ));
            }
        }

        self.state = if request.expects_response() {
            ControlPointState::AwaitingResponse(request)
        } else {
            ControlPointState::Idle
        };
        Some(ControlPointEvent::Written(request))
    }

    pub fn handle_value(&mut self, result: Result<Vec<u8>, String>) -> Option<ControlPointEvent> {
        let data = match result {
            Ok(data) => data,
            Err(reason) => {
                self.state = ControlPointState::Idle;
                return Some(ControlPointEvent::Failed(
                    DfuError::ReceivingNotificationFailed { reason },
                ));
            }
        };

        if self.is_streaming() {
            if let Some(receipt) = PacketReceiptNotification::parse(&data) {
                return Some(ControlPointEvent::PacketReceipt(receipt));
            }
        }

        let response = match ControlPointResponse::parse(&data) {
            Ok(response) => response,
            Err(e) => {
                self.state = ControlPointState::Idle;
                return Some(ControlPointEvent::Failed(e));
            }
        };

        let request = match self.state {
            ControlPointState::AwaitingResponse(request) | ControlPointState::RequestSent(request) => {
                request
            }
            _ => {
                warn!(
                    "Unexpected response to {}: {}",
                    response.request.name(),
                    response.status.description()
                );
                return None;
            }
        };
        if response.request != request.op_code() {
            warn!(
                "Response to {} received while waiting for {}",
                response.request.name(),
                request.name()
            );
        }

        self.state = ControlPointState::Idle;
        if response.is_success() {
            debug!("{} completed", request.name());
            Some(ControlPointEvent::Completed(request))
        } else {
            Some(ControlPointEvent::Failed(DfuError::remote(
                request.op_code(),
                response.status,
            )))
        }
    }
}
