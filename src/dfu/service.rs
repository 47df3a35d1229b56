//! Legacy DFU sequence for a single connection.
//!
//! Discover → read version → enable notifications → (jump to bootloader) or
//! (Start DFU + sizes → init packet → PRN → stream → validate → activate).
//!
//! The service never blocks. It issues one transport request, then waits
//! for the matching [`GattEvent`]. Everything the controller needs to know
//! is queued as a [`ServiceEvent`], and the end of the connection is
//! classified by [`LegacyDfuService::on_disconnected`].

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::config::{OpCode, ResponseStatus, EXTENDED_INIT_PACKET_MIN_LEN, LEGACY_INIT_PACKET_LEN};
use super::control_point::{
    ControlPoint, ControlPointEvent, InitParams, PacketReceiptNotification, Request,
};
use super::device::{DeviceMode, DeviceVersion};
use super::error::DfuError;
use super::firmware::{FirmwarePart, FirmwareType};
use super::packet::{DfuPacket, TransferProgress, TransferSession};
use super::transport::{Characteristic, GattEvent, GattTransport};
use super::uuids::DfuUuids;

/// Per-connection options, derived from the settings by the controller.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub prn: u16,
    pub force_dfu: bool,
    pub start_delay: Duration,
    /// Reset and reconnect once more on an Invalid State start response.
    pub allow_invalid_state_retry: bool,
    pub verify_init_packet_crc: bool,
    /// Name a Secure DFU bootloader should advertise after a buttonless jump.
    pub alternative_advertising_name: Option<String>,
    /// Look for the experimental buttonless service of SDK 12 applications.
    pub experimental_buttonless: bool,
}

/// Notifications for the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceEvent {
    Starting,
    EnablingDfuMode,
    Progress(TransferProgress),
    Validating,
    Disconnecting,
    /// Call [`LegacyDfuService::timer_fired`] after this long.
    ScheduleTimer(Duration),
}

/// How a connection ended.
#[derive(Debug)]
pub enum ConnectionOutcome {
    /// The application jumped into the bootloader.
    JumpedToBootloader {
        new_address_expected: bool,
        /// Name the bootloader advertises with, when known.
        bootloader_name: Option<String>,
    },
    /// The part was validated and the device is booting it.
    Activated,
    Aborted,
    /// The device reported Invalid State and was reset for another attempt.
    RetryAfterReset,
    Failed(DfuError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    DiscoveringServices,
    DiscoveringCharacteristics,
    ReadingVersion,
    EnablingNotifications,
    JumpingToBootloader,
    StartDelay(Request),
    Starting(Request),
    SendingInitPacket,
    Uploading,
    Validating,
    Activating,
    ResettingForRetry,
    /// Reset sent after an error or abort.
    Resetting,
    /// Disconnect requested before a control point was available.
    Disconnecting,
}

/// Drives one connection through the Legacy DFU sequence.
pub struct LegacyDfuService {
    part: FirmwarePart,
    options: ServiceOptions,
    uuids: DfuUuids,
    step: Step,
    service_count: usize,
    control_point: Option<ControlPoint>,
    packet: Option<DfuPacket>,
    version: Option<DeviceVersion>,
    jump_required: bool,
    session: Option<TransferSession>,
    aborted: bool,
    error: Option<DfuError>,
    events: VecDeque<ServiceEvent>,
}

impl LegacyDfuService {
    pub fn new(part: FirmwarePart, options: ServiceOptions, uuids: DfuUuids) -> Self {
        Self {
            part,
            options,
            uuids,
            step: Step::DiscoveringServices,
            service_count: 0,
            control_point: None,
            packet: None,
            version: None,
            jump_required: false,
            session: None,
            aborted: false,
            error: None,
            events: VecDeque::new(),
        }
    }

    /// Begin with service discovery; call once connected.
    pub fn start<T: GattTransport + ?Sized>(&mut self, transport: &mut T) {
        debug!("Discovering services...");
        self.step = Step::DiscoveringServices;
        transport.discover_services();
    }

    pub fn version(&self) -> Option<DeviceVersion> {
        self.version
    }

    pub fn is_uploading(&self) -> bool {
        self.session.is_some()
    }

    pub fn poll_event(&mut self) -> Option<ServiceEvent> {
        self.events.pop_front()
    }

    pub fn handle_event<T: GattTransport + ?Sized>(&mut self, event: GattEvent, transport: &mut T) {
        if self.step == Step::Disconnecting {
            debug!("Ignoring {:?} while disconnecting", event);
            return;
        }

        match event {
            GattEvent::ServicesDiscovered(result) => self.on_services(result, transport),
            GattEvent::CharacteristicsDiscovered { service, result }
                if self.uuids.is_legacy_service(&service) =>
            {
                self.on_characteristics(result, transport)
            }
            GattEvent::ValueRead {
                characteristic,
                result,
            } if characteristic == self.uuids.legacy_version() => {
                self.on_version(result, transport)
            }
            GattEvent::ValueUpdated {
                characteristic,
                result,
            } if characteristic == self.uuids.legacy_version() => {
                self.on_version(result, transport)
            }
            GattEvent::NotificationStateUpdated {
                characteristic,
                result,
            } if self.is_control_point(characteristic) => {
                if let Some(cp) = self.control_point.as_mut() {
                    let event = cp.handle_notification_state(result);
                    self.dispatch(event, transport);
                }
            }
            GattEvent::WriteCompleted {
                characteristic,
                result,
            } if self.is_control_point(characteristic) => {
                if let Some(event) = self
                    .control_point
                    .as_mut()
                    .and_then(|cp| cp.handle_write(result))
                {
                    self.dispatch(event, transport);
                }
            }
            GattEvent::ValueUpdated {
                characteristic,
                result,
            } if self.is_control_point(characteristic) => {
                if let Some(event) = self
                    .control_point
                    .as_mut()
                    .and_then(|cp| cp.handle_value(result))
                {
                    self.dispatch(event, transport);
                }
            }
            GattEvent::ReadyToSendWriteWithoutResponse => self.on_ready_to_send(transport),
            other => debug!("Ignoring {:?}", other),
        }
    }

    /// The delay requested with [`ServiceEvent::ScheduleTimer`] elapsed.
    pub fn timer_fired<T: GattTransport + ?Sized>(&mut self, transport: &mut T) {
        if let Step::StartDelay(request) = self.step {
            self.send(request, Step::Starting(request), transport);
        }
    }

    /// Stop sending packets at the next opportunity. Returns false when no
    /// upload is in progress.
    pub fn pause(&mut self) -> bool {
        match self.session.as_mut() {
            Some(session) if !session.is_aborted() => {
                info!("Upload paused");
                session.pause();
                true
            }
            _ => false,
        }
    }

    /// Continue a paused upload. Returns false when nothing was paused.
    pub fn resume<T: GattTransport + ?Sized>(&mut self, transport: &mut T) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        if !session.is_paused() {
            return false;
        }
        info!("Upload resumed");
        if session.resume() {
            self.continue_upload(transport);
        }
        true
    }

    /// Abort permanently; every later step sends Reset instead.
    pub fn abort<T: GattTransport + ?Sized>(&mut self, transport: &mut T) {
        if self.aborted {
            return;
        }
        info!("Upload aborted");
        self.aborted = true;

        match self.step {
            Step::DiscoveringServices | Step::DiscoveringCharacteristics | Step::ReadingVersion => {
                self.disconnect(transport)
            }
            Step::StartDelay(_) => self.reset(transport),
            Step::Uploading => match self.session.as_mut() {
                // No PRN will come while paused, reset right away
                Some(session) if session.is_paused() => {
                    session.abort();
                    self.reset(transport);
                }
                Some(session) => session.abort(),
                None => {}
            },
            // The reply to the request in flight triggers the Reset
            _ => {}
        }
    }

    /// Classify the end of the connection. The service is spent afterwards.
    pub fn on_disconnected(&mut self, reason: Option<String>) -> ConnectionOutcome {
        self.session = None;

        if let Some(error) = self.error.take() {
            return ConnectionOutcome::Failed(error);
        }
        if self.aborted {
            return ConnectionOutcome::Aborted;
        }
        match self.step {
            Step::JumpingToBootloader => ConnectionOutcome::JumpedToBootloader {
                new_address_expected: self.version.is_none(),
                bootloader_name: self.options.alternative_advertising_name.clone(),
            },
            Step::Activating => ConnectionOutcome::Activated,
            Step::ResettingForRetry => ConnectionOutcome::RetryAfterReset,
            _ => ConnectionOutcome::Failed(DfuError::DeviceDisconnected {
                reason: reason.unwrap_or_else(|| "connection lost".to_string()),
            }),
        }
    }

    fn is_control_point(&self, uuid: Uuid) -> bool {
        self.control_point.as_ref().map(ControlPoint::uuid) == Some(uuid)
    }

    fn on_services<T: GattTransport + ?Sized>(
        &mut self,
        result: Result<Vec<Uuid>, String>,
        transport: &mut T,
    ) {
        let services = match result {
            Ok(services) => services,
            Err(reason) => return self.fail(DfuError::ServiceDiscoveryFailed { reason }, transport),
        };
        self.service_count = services.len();

        if services.iter().any(|s| self.uuids.is_legacy_service(s)) {
            debug!("Legacy DFU Service found, discovering characteristics...");
            self.step = Step::DiscoveringCharacteristics;
            transport.discover_characteristics(self.uuids.legacy_service());
        } else {
            self.fail(
                DfuError::DeviceNotSupported {
                    reason: "DFU Service not found".to_string(),
                },
                transport,
            );
        }
    }

    fn on_characteristics<T: GattTransport + ?Sized>(
        &mut self,
        result: Result<Vec<Characteristic>, String>,
        transport: &mut T,
    ) {
        let characteristics = match result {
            Ok(characteristics) => characteristics,
            Err(reason) => return self.fail(DfuError::ServiceDiscoveryFailed { reason }, transport),
        };
        let has = |uuid: Uuid| characteristics.iter().any(|c| c.uuid == uuid);

        if !has(self.uuids.legacy_control_point()) {
            return self.fail(
                DfuError::DeviceNotSupported {
                    reason: "DFU Control Point characteristic not found".to_string(),
                },
                transport,
            );
        }
        self.control_point = Some(ControlPoint::new(self.uuids.legacy_control_point()));
        if has(self.uuids.legacy_packet()) {
            self.packet = Some(DfuPacket::new(self.uuids.legacy_packet(), transport));
        }

        if has(self.uuids.legacy_version()) {
            debug!("Reading DFU Version number...");
            self.step = Step::ReadingVersion;
            transport.read(self.uuids.legacy_version());
        } else {
            self.after_version(transport);
        }
    }

    fn on_version<T: GattTransport + ?Sized>(
        &mut self,
        result: Result<Vec<u8>, String>,
        transport: &mut T,
    ) {
        if self.step != Step::ReadingVersion {
            return;
        }
        let version = match result {
            Ok(data) => DeviceVersion::parse(&data).ok_or_else(|| DfuError::ReadingVersionFailed {
                reason: format!("unexpected value {:02X?}", data),
            }),
            Err(reason) => Err(DfuError::ReadingVersionFailed { reason }),
        };

        match version {
            Ok(version) => {
                info!("Version number read: {}", version);
                self.version = Some(version);
                self.after_version(transport);
            }
            Err(e) => self.fail(e, transport),
        }
    }

    fn after_version<T: GattTransport + ?Sized>(&mut self, transport: &mut T) {
        let mode = DeviceMode::detect(self.version, self.packet.is_some(), self.service_count);
        if mode == DeviceMode::Unknown {
            warn!(
                "Cannot tell whether the device is in bootloader mode, force DFU: {}",
                self.options.force_dfu
            );
        }
        self.jump_required = mode.requires_jump(self.options.force_dfu);
        debug!("Device mode: {:?}, jump required: {}", mode, self.jump_required);

        if let Some(version) = self.version {
            if !self.jump_required
                && version.requires_extended_init_packet()
                && self.part.init_packet().is_none()
            {
                return self.fail(
                    DfuError::ExtendedInitPacketRequired {
                        message: "The init packet is required by the target device".to_string(),
                    },
                    transport,
                );
            }
        }

        let Some(cp) = self.control_point.as_mut() else {
            return;
        };
        self.step = Step::EnablingNotifications;
        cp.enable_notifications(transport);
    }

    fn dispatch<T: GattTransport + ?Sized>(&mut self, event: ControlPointEvent, transport: &mut T) {
        if matches!(
            self.step,
            Step::Resetting | Step::ResettingForRetry | Step::Disconnecting
        ) {
            debug!("Ignoring {:?} while resetting", event);
            return;
        }

        match event {
            ControlPointEvent::NotificationsEnabled => self.on_notifications_enabled(transport),
            ControlPointEvent::Written(request) => self.on_written(request, transport),
            ControlPointEvent::Completed(request) => self.on_completed(request, transport),
            ControlPointEvent::PacketReceipt(receipt) => self.on_receipt(receipt, transport),
            ControlPointEvent::Failed(e) => self.on_failed(e, transport),
        }
    }

    fn on_notifications_enabled<T: GattTransport + ?Sized>(&mut self, transport: &mut T) {
        if self.jump_required {
            info!("Application with buttonless update found, jumping to bootloader");
            self.events.push_back(ServiceEvent::EnablingDfuMode);
            self.send(Request::JumpToBootloader, Step::JumpingToBootloader, transport);
        } else {
            self.events.push_back(ServiceEvent::Starting);
            self.start_dfu(Request::StartDfu(self.part.firmware_type()), transport);
        }
    }

    fn start_dfu<T: GattTransport + ?Sized>(&mut self, request: Request, transport: &mut T) {
        if self.version.is_none() && !self.options.start_delay.is_zero() {
            // SDK 6.1 bootloaders need time to prepare flash after a reset
            debug!("wait({}ms)", self.options.start_delay.as_millis());
            self.step = Step::StartDelay(request);
            self.events
                .push_back(ServiceEvent::ScheduleTimer(self.options.start_delay));
        } else {
            self.send(request, Step::Starting(request), transport);
        }
    }

    fn on_written<T: GattTransport + ?Sized>(&mut self, request: Request, transport: &mut T) {
        match request {
            Request::StartDfu(_) => {
                let Some(packet) = self.packet.as_ref() else {
                    return self.fail(missing_packet(), transport);
                };
                packet.write_sizes(&self.part.size(), transport);
            }
            Request::StartDfuLegacy => {
                let Some(packet) = self.packet.as_ref() else {
                    return self.fail(missing_packet(), transport);
                };
                packet.write_application_size(&self.part.size(), transport);
            }
            Request::InitParams(InitParams::Receive) => {
                if let (Some(packet), Some(init)) = (self.packet.as_ref(), self.part.init_packet()) {
                    packet.write_init_packet(init, transport);
                }
                self.send(
                    Request::InitParams(InitParams::Complete),
                    Step::SendingInitPacket,
                    transport,
                );
            }
            Request::InitParamsLegacy => {
                if let (Some(packet), Some(init)) = (self.packet.as_ref(), self.part.init_packet()) {
                    packet.write_init_packet(init, transport);
                }
            }
            Request::SetPrn(_) => {
                self.send(Request::ReceiveFirmwareImage, Step::Uploading, transport);
            }
            Request::ReceiveFirmwareImage => {
                if self.aborted {
                    return self.reset(transport);
                }
                self.session = Some(TransferSession::new());
                self.continue_upload(transport);
            }
            Request::JumpToBootloader | Request::ActivateAndReset | Request::Reset => {
                debug!("Waiting for the device to disconnect");
            }
            Request::InitParams(InitParams::Complete) | Request::Validate => {}
        }
    }

    fn on_completed<T: GattTransport + ?Sized>(&mut self, request: Request, transport: &mut T) {
        match request {
            Request::StartDfu(_) | Request::StartDfuLegacy => self.send_init_packet(transport),
            Request::InitParams(InitParams::Complete) | Request::InitParamsLegacy => {
                debug!("Init packet accepted");
                self.send_prn(transport);
            }
            Request::ReceiveFirmwareImage => {
                let sent = self.session.take().map(|s| s.bytes_sent()).unwrap_or_default();
                info!("Upload completed ({} bytes)", sent);
                self.events.push_back(ServiceEvent::Validating);
                self.send(Request::Validate, Step::Validating, transport);
            }
            Request::Validate => {
                info!("Firmware validated, activating");
                self.events.push_back(ServiceEvent::Disconnecting);
                self.send(Request::ActivateAndReset, Step::Activating, transport);
            }
            other => warn!("Unexpected completion of {}", other.name()),
        }
    }

    fn send_init_packet<T: GattTransport + ?Sized>(&mut self, transport: &mut T) {
        let init = self.part.init_packet();
        match (self.version, init) {
            (Some(_), Some(init)) if init.len() >= EXTENDED_INIT_PACKET_MIN_LEN => {
                self.send(
                    Request::InitParams(InitParams::Receive),
                    Step::SendingInitPacket,
                    transport,
                );
            }
            (Some(_), Some(_)) => self.fail(
                DfuError::ExtendedInitPacketRequired {
                    message: "Extended init packet required. Old one found instead.".to_string(),
                },
                transport,
            ),
            (Some(_), None) => self.fail(
                DfuError::ExtendedInitPacketRequired {
                    message: "The init packet is required by the target device".to_string(),
                },
                transport,
            ),
            (None, Some(init)) if init.len() == LEGACY_INIT_PACKET_LEN => {
                if self.options.verify_init_packet_crc {
                    let expected = u16::from_le_bytes([init[0], init[1]]);
                    let actual = self.part.crc16();
                    if expected != actual {
                        return self.fail(DfuError::CrcMismatch { expected, actual }, transport);
                    }
                }
                self.send(Request::InitParamsLegacy, Step::SendingInitPacket, transport);
            }
            (None, Some(_)) => self.fail(DfuError::InitPacketRequired, transport),
            (None, None) => self.send_prn(transport),
        }
    }

    fn send_prn<T: GattTransport + ?Sized>(&mut self, transport: &mut T) {
        debug!("Sending PRN request ({})", self.options.prn);
        self.send(Request::SetPrn(self.options.prn), Step::Uploading, transport);
    }

    fn on_receipt<T: GattTransport + ?Sized>(
        &mut self,
        receipt: PacketReceiptNotification,
        transport: &mut T,
    ) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if let Err(e) = session.verify_receipt(receipt) {
            return self.fail(e, transport);
        }

        if session.is_aborted() {
            self.reset(transport);
        } else if session.is_paused() {
            debug!("{} bytes received, upload paused", receipt.bytes_received);
        } else {
            self.continue_upload(transport);
        }
    }

    fn on_ready_to_send<T: GattTransport + ?Sized>(&mut self, transport: &mut T) {
        // With PRNs enabled, the receipts pace the upload
        if self.options.prn > 0 {
            return;
        }
        match self.session.as_ref() {
            Some(session) if session.is_aborted() => self.reset(transport),
            Some(session) if !session.is_paused() => self.continue_upload(transport),
            _ => {}
        }
    }

    fn continue_upload<T: GattTransport + ?Sized>(&mut self, transport: &mut T) {
        let (Some(session), Some(packet)) = (self.session.as_mut(), self.packet.as_ref()) else {
            return;
        };
        let events = &mut self.events;
        session.send_next(
            self.options.prn,
            self.part.data(),
            packet,
            transport,
            Instant::now(),
            |progress| events.push_back(ServiceEvent::Progress(progress)),
        );
    }

    fn on_failed<T: GattTransport + ?Sized>(&mut self, error: DfuError, transport: &mut T) {
        if let Step::Starting(request) = self.step {
            match (error.remote_status(), request) {
                (Some(ResponseStatus::NotSupported), Request::StartDfu(_)) => {
                    if self.part.firmware_type() == FirmwareType::Application {
                        info!("Start DFU with type not supported, retrying without type");
                        return self.start_dfu(Request::StartDfuLegacy, transport);
                    }
                    return self.fail(
                        DfuError::remote_with_message(
                            OpCode::StartDfu,
                            ResponseStatus::NotSupported,
                            "Updating Softdevice or Bootloader is not supported",
                        ),
                        transport,
                    );
                }
                (Some(ResponseStatus::InvalidState), _) => {
                    if self.options.allow_invalid_state_retry {
                        warn!("Device reported invalid state, resetting and retrying...");
                        return self.reset_for_retry(transport);
                    }
                    return self.fail(
                        DfuError::remote_with_message(
                            OpCode::StartDfu,
                            ResponseStatus::InvalidState,
                            "Peripheral is in an invalid state, please try to reset and start over again.",
                        ),
                        transport,
                    );
                }
                _ => {}
            }
        }

        if self.step == Step::SendingInitPacket
            && self.version.is_some()
            && error.remote_status() == Some(ResponseStatus::OperationFailed)
        {
            return self.fail(
                DfuError::remote_with_message(
                    OpCode::InitDfuParams,
                    ResponseStatus::OperationFailed,
                    "Operation failed. Ensure the firmware targets that device type and version.",
                ),
                transport,
            );
        }

        self.fail(error, transport);
    }

    /// Write a request, or Reset instead once aborted.
    fn send<T: GattTransport + ?Sized>(&mut self, request: Request, step: Step, transport: &mut T) {
        if self.aborted && request != Request::Reset {
            return self.reset(transport);
        }
        let Some(cp) = self.control_point.as_mut() else {
            return self.fail(
                DfuError::DeviceNotSupported {
                    reason: "DFU Control Point characteristic not found".to_string(),
                },
                transport,
            );
        };
        self.step = step;
        if let Err(e) = cp.send(request, transport) {
            self.fail(e, transport);
        }
    }

    fn fail<T: GattTransport + ?Sized>(&mut self, error: DfuError, transport: &mut T) {
        if let Some(first) = &self.error {
            debug!("Ignoring {} after {}", error, first);
            return;
        }
        error!("DFU failed: {} (code {})", error, error.code().value());
        self.error = Some(error);
        self.session = None;
        self.reset(transport);
    }

    /// Reset the device when the control point is known, otherwise disconnect.
    fn reset<T: GattTransport + ?Sized>(&mut self, transport: &mut T) {
        if matches!(self.step, Step::Resetting | Step::Disconnecting) {
            return;
        }
        match self.control_point.as_mut() {
            Some(cp) => {
                info!("Sending Reset");
                self.step = Step::Resetting;
                cp.reset(transport);
            }
            None => self.disconnect(transport),
        }
    }

    fn reset_for_retry<T: GattTransport + ?Sized>(&mut self, transport: &mut T) {
        if let Some(cp) = self.control_point.as_mut() {
            self.step = Step::ResettingForRetry;
            cp.reset(transport);
        }
    }

    fn disconnect<T: GattTransport + ?Sized>(&mut self, transport: &mut T) {
        debug!("Disconnecting...");
        self.step = Step::Disconnecting;
        transport.disconnect();
    }
}

fn missing_packet() -> DfuError {
    DfuError::DeviceNotSupported {
        reason: "DFU Packet characteristic not found".to_string(),
    }
}
