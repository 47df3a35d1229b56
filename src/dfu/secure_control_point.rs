//! Secure DFU Control Point requests, responses and request state machine.
//!
//! Wire format (all values little-endian):
//!
//! | Request            | Bytes               |
//! |--------------------|---------------------|
//! | Create object      | `01 tt ss ss ss ss` |
//! | Set PRN value      | `02 nn nn`          |
//! | Calculate checksum | `03`                |
//! | Execute            | `04`                |
//! | Read object info   | `06 tt`             |
//!
//! Every request is answered with `60 rq st`. A successful Read Object Info
//! adds max size, offset and CRC-32, a successful Calculate Checksum adds
//! offset and CRC-32, and an extended error adds its reason byte.
//!
//! While an object is streamed the bootloader sends unsolicited Calculate
//! Checksum responses every `prn` packets. They are the receipts.

use crc::{Crc, CRC_32_ISO_HDLC};
use tracing::{debug, warn};
use uuid::Uuid;

use super::config::{ExtendedError, ObjectType, SecureOpCode, SecureStatus};
use super::error::{DfuError, DfuResult};
use super::transport::{GattTransport, WriteKind};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// CRC-32 as computed by Secure DFU bootloaders.
pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// A request written to the Secure DFU Control Point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecureRequest {
    CreateObject { object: ObjectType, size: u32 },
    /// Packet Receipt Notification interval, 0 disables notifications.
    SetPrn(u16),
    CalculateChecksum,
    Execute,
    ReadObjectInfo(ObjectType),
}

impl SecureRequest {
    pub fn op_code(&self) -> SecureOpCode {
        match self {
            SecureRequest::CreateObject { .. } => SecureOpCode::CreateObject,
            SecureRequest::SetPrn(_) => SecureOpCode::SetPrnValue,
            SecureRequest::CalculateChecksum => SecureOpCode::CalculateChecksum,
            SecureRequest::Execute => SecureOpCode::Execute,
            SecureRequest::ReadObjectInfo(_) => SecureOpCode::ReadObjectInfo,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let op = self.op_code() as u8;
        match self {
            SecureRequest::CreateObject { object, size } => {
                let mut value = vec![op, *object as u8];
                value.extend_from_slice(&size.to_le_bytes());
                value
            }
            SecureRequest::SetPrn(count) => {
                let [lo, hi] = count.to_le_bytes();
                vec![op, lo, hi]
            }
            SecureRequest::ReadObjectInfo(object) => vec![op, *object as u8],
            SecureRequest::CalculateChecksum | SecureRequest::Execute => vec![op],
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SecureRequest::CreateObject {
                object: ObjectType::Command,
                ..
            } => "Create Command Object",
            SecureRequest::CreateObject {
                object: ObjectType::Data,
                ..
            } => "Create Data Object",
            SecureRequest::SetPrn(_) => "Set PRN Value",
            SecureRequest::CalculateChecksum => "Calculate Checksum",
            SecureRequest::Execute => "Execute",
            SecureRequest::ReadObjectInfo(ObjectType::Command) => "Read Command Object Info",
            SecureRequest::ReadObjectInfo(ObjectType::Data) => "Read Data Object Info",
        }
    }
}

/// State of the selected object, from Read Object Info.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectInfo {
    pub max_size: u32,
    pub offset: u32,
    pub crc: u32,
}

/// Bytes received so far and their CRC-32.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checksum {
    pub offset: u32,
    pub crc: u32,
}

/// Data carried by a successful response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponsePayload {
    None,
    ObjectInfo(ObjectInfo),
    Checksum(Checksum),
}

/// A response notification: `[0x60, request op code, status, ...]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecureResponse {
    pub request: SecureOpCode,
    pub status: SecureStatus,
    /// Reason byte following an extended error status.
    pub extended: Option<u8>,
    pub payload: ResponsePayload,
}

impl SecureResponse {
    pub fn parse(data: &[u8]) -> DfuResult<Self> {
        let unsupported = || DfuError::UnsupportedResponse {
            data: data.to_vec(),
        };

        let [op, request, status, rest @ ..] = data else {
            return Err(unsupported());
        };
        if SecureOpCode::from_byte(*op) != Some(SecureOpCode::Response) {
            return Err(unsupported());
        }
        let request = SecureOpCode::from_byte(*request)
            .filter(|op| *op != SecureOpCode::Response)
            .ok_or_else(unsupported)?;
        let status = SecureStatus::from_byte(*status).ok_or_else(unsupported)?;

        let payload = match (status, request) {
            (SecureStatus::Success, SecureOpCode::ReadObjectInfo) => {
                let (Some(max_size), Some(offset), Some(crc)) =
                    (le_u32(rest, 0), le_u32(rest, 1), le_u32(rest, 2))
                else {
                    return Err(unsupported());
                };
                ResponsePayload::ObjectInfo(ObjectInfo {
                    max_size,
                    offset,
                    crc,
                })
            }
            (SecureStatus::Success, SecureOpCode::CalculateChecksum) => {
                let (Some(offset), Some(crc)) = (le_u32(rest, 0), le_u32(rest, 1)) else {
                    return Err(unsupported());
                };
                ResponsePayload::Checksum(Checksum { offset, crc })
            }
            _ => ResponsePayload::None,
        };
        let extended = match status {
            SecureStatus::ExtendedError => rest.first().copied(),
            _ => None,
        };

        Ok(Self {
            request,
            status,
            extended,
            payload,
        })
    }

    /// The notification bytes a bootloader sends for this response.
    pub fn encode(&self) -> Vec<u8> {
        let mut value = vec![SecureOpCode::Response as u8, self.request as u8, self.status as u8];
        match self.payload {
            ResponsePayload::ObjectInfo(info) => {
                value.extend_from_slice(&info.max_size.to_le_bytes());
                value.extend_from_slice(&info.offset.to_le_bytes());
                value.extend_from_slice(&info.crc.to_le_bytes());
            }
            ResponsePayload::Checksum(checksum) => {
                value.extend_from_slice(&checksum.offset.to_le_bytes());
                value.extend_from_slice(&checksum.crc.to_le_bytes());
            }
            ResponsePayload::None => value.extend(self.extended),
        }
        value
    }

    pub fn is_success(&self) -> bool {
        self.status == SecureStatus::Success
    }

    fn error(&self) -> DfuError {
        DfuError::remote_secure(
            self.request,
            self.status,
            self.extended.and_then(ExtendedError::from_byte),
        )
    }
}

fn le_u32(data: &[u8], index: usize) -> Option<u32> {
    let bytes = data.get(index * 4..index * 4 + 4)?;
    Some(u32::from_le_bytes(bytes.try_into().ok()?))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecureControlPointState {
    Idle,
    AwaitingNotificationEnable,
    /// Written, waiting for the write acknowledgement.
    RequestSent(SecureRequest),
    /// Acknowledged, waiting for the response notification.
    AwaitingResponse(SecureRequest),
    /// Object data is going out on the packet characteristic.
    Streaming,
}

/// What a transport event meant for the control point.
#[derive(Debug)]
pub enum SecureControlPointEvent {
    NotificationsEnabled,
    /// The device answered a request with Success.
    Completed(SecureRequest, ResponsePayload),
    PacketReceipt(Checksum),
    Failed(DfuError),
}

/// Secure DFU Control Point characteristic with at most one request in
/// flight.
#[derive(Debug)]
pub struct SecureControlPoint {
    uuid: Uuid,
    state: SecureControlPointState,
}

impl SecureControlPoint {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            state: SecureControlPointState::Idle,
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn state(&self) -> SecureControlPointState {
        self.state
    }

    pub fn enable_notifications<T: GattTransport + ?Sized>(&mut self, transport: &mut T) {
        debug!("Enabling notifications for {}", self.uuid);
        self.state = SecureControlPointState::AwaitingNotificationEnable;
        transport.enable_notifications(self.uuid);
    }

    /// Treat checksum notifications as receipts until the next request.
    pub fn start_streaming(&mut self) {
        self.state = SecureControlPointState::Streaming;
    }

    pub fn send<T: GattTransport + ?Sized>(
        &mut self,
        request: SecureRequest,
        transport: &mut T,
    ) -> DfuResult<()> {
        if let SecureControlPointState::RequestSent(pending)
        | SecureControlPointState::AwaitingResponse(pending) = self.state
        {
            return Err(DfuError::WritingCharacteristicFailed {
                reason: format!(
                    "cannot send {} while {} is in progress",
                    request.name(),
                    pending.name()
                ),
            });
        }

        let value = request.encode();
        debug!("Writing {} {:02X?} to Control Point", request.name(), value);
        self.state = SecureControlPointState::RequestSent(request);
        transport.write(self.uuid, &value, WriteKind::WithResponse);
        Ok(())
    }

    pub fn handle_notification_state(
        &mut self,
        result: Result<(), String>,
    ) -> SecureControlPointEvent {
        if self.state == SecureControlPointState::AwaitingNotificationEnable {
            self.state = SecureControlPointState::Idle;
        }
        match result {
            Ok(()) => {
                debug!("Control Point notifications enabled");
                SecureControlPointEvent::NotificationsEnabled
            }
            Err(reason) => {
                SecureControlPointEvent::Failed(DfuError::EnablingControlPointFailed { reason })
            }
        }
    }

    pub fn handle_write(&mut self, result: Result<(), String>) -> Option<SecureControlPointEvent> {
        let SecureControlPointState::RequestSent(request) = self.state else {
            debug!("Ignoring write acknowledgement in state {:?}", self.state);
            return None;
        };

        match result {
            Ok(()) => {
                debug!("{} written", request.name());
                self.state = SecureControlPointState::AwaitingResponse(request);
                None
            }
            Err(reason) => {
                self.state = SecureControlPointState::Idle;
                Some(SecureControlPointEvent::Failed(
                    DfuError::WritingCharacteristicFailed {
                        reason: format!("{}: {}", request.name(), reason),
                    },
                ))
            }
        }
    }

    pub fn handle_value(
        &mut self,
        result: Result<Vec<u8>, String>,
    ) -> Option<SecureControlPointEvent> {
        let data = match result {
            Ok(data) => data,
            Err(reason) => {
                self.state = SecureControlPointState::Idle;
                return Some(SecureControlPointEvent::Failed(
                    DfuError::ReceivingNotificationFailed { reason },
                ));
            }
        };

        let response = match SecureResponse::parse(&data) {
            Ok(response) => response,
            Err(e) => {
                self.state = SecureControlPointState::Idle;
                return Some(SecureControlPointEvent::Failed(e));
            }
        };

        let request = match self.state {
            SecureControlPointState::Streaming => {
                if let (true, ResponsePayload::Checksum(checksum)) =
                    (response.is_success(), response.payload)
                {
                    return Some(SecureControlPointEvent::PacketReceipt(checksum));
                }
                self.state = SecureControlPointState::Idle;
                return Some(SecureControlPointEvent::Failed(DfuError::UnsupportedResponse {
                    data,
                }));
            }
            SecureControlPointState::AwaitingResponse(request)
            | SecureControlPointState::RequestSent(request) => request,
            _ => {
                warn!(
                    "Unexpected response to op code {:?}: {}",
                    response.request,
                    response.status.description()
                );
                return None;
            }
        };
        if response.request != request.op_code() {
            warn!(
                "Response to op code {:?} received while waiting for {}",
                response.request,
                request.name()
            );
        }

        self.state = SecureControlPointState::Idle;
        if response.is_success() {
            debug!("{} completed", request.name());
            Some(SecureControlPointEvent::Completed(request, response.payload))
        } else {
            Some(SecureControlPointEvent::Failed(response.error()))
        }
    }
}
