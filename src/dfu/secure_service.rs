//! Secure DFU sequence for a single connection.
//!
//! Application mode: enable the buttonless characteristic, optionally name
//! the bootloader, then Enter Bootloader and wait for the reset.
//!
//! Bootloader mode: select → create → send → checksum → execute the
//! command object (the init packet), then the same for every data object
//! of the image. Objects the device already holds are resumed when their
//! CRC-32 matches. Executing the last data object activates the image.

use std::collections::VecDeque;
use std::ops::Range;
use std::time::Instant;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::buttonless::{
    Buttonless, ButtonlessEvent, ButtonlessKind, ButtonlessRequest, MAX_ADVERTISING_NAME_LEN,
};
use super::config::{ButtonlessOpCode, ButtonlessStatus, ObjectType, SECURE_CRC_ATTEMPTS};
use super::error::DfuError;
use super::firmware::FirmwarePart;
use super::packet::{DfuPacket, TransferSession};
use super::secure_control_point::{
    crc32, Checksum, ObjectInfo, ResponsePayload, SecureControlPoint, SecureControlPointEvent,
    SecureRequest,
};
use super::service::{ConnectionOutcome, ServiceEvent, ServiceOptions};
use super::transport::{Characteristic, GattEvent, GattTransport};
use super::uuids::{DfuUuids, UuidRole};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    DiscoveringServices,
    DiscoveringCharacteristics,
    EnablingButtonless,
    SettingName,
    JumpingToBootloader,
    EnablingNotifications,
    SelectingCommand,
    CreatingCommand,
    SendingCommand,
    ExecutingCommand,
    SelectingData,
    CreatingData,
    Streaming,
    ChecksummingData,
    ExecutingData,
    /// The last data object is being executed.
    Activating,
    Disconnecting,
}

/// What to do once the PRN value is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AfterPrn {
    SendCommand { from: usize },
    CreateData,
    ResumeData { from: usize },
}

/// Drives one connection through the Secure DFU sequence.
pub struct SecureDfuService {
    part: FirmwarePart,
    options: ServiceOptions,
    uuids: DfuUuids,
    step: Step,
    service: Option<Uuid>,
    control_point: Option<SecureControlPoint>,
    packet: Option<DfuPacket>,
    buttonless: Option<Buttonless>,
    bootloader_name: Option<String>,
    /// Last PRN value the device accepted on this connection.
    device_prn: Option<u16>,
    after_prn: Option<AfterPrn>,
    objects: Vec<Range<usize>>,
    object_index: usize,
    crc_failures: u8,
    session: Option<TransferSession>,
    aborted: bool,
    error: Option<DfuError>,
    events: VecDeque<ServiceEvent>,
}

impl SecureDfuService {
    pub fn new(part: FirmwarePart, options: ServiceOptions, uuids: DfuUuids) -> Self {
        Self {
            part,
            options,
            uuids,
            step: Step::DiscoveringServices,
            service: None,
            control_point: None,
            packet: None,
            buttonless: None,
            bootloader_name: None,
            device_prn: None,
            after_prn: None,
            objects: Vec::new(),
            object_index: 0,
            crc_failures: 0,
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
                if Some(service) == self.service =>
            {
                self.on_characteristics(result, transport)
            }
            GattEvent::NotificationStateUpdated {
                characteristic,
                result,
            } => {
                if self.is_control_point(characteristic) {
                    if let Some(cp) = self.control_point.as_mut() {
                        let event = cp.handle_notification_state(result);
                        self.dispatch(event, transport);
                    }
                } else if self.is_buttonless(characteristic) {
                    if let Some(buttonless) = self.buttonless.as_mut() {
                        let event = buttonless.handle_notification_state(result);
                        self.on_buttonless(event, transport);
                    }
                }
            }
            GattEvent::WriteCompleted {
                characteristic,
                result,
            } => {
                if self.is_control_point(characteristic) {
                    if let Some(event) = self
                        .control_point
                        .as_mut()
                        .and_then(|cp| cp.handle_write(result))
                    {
                        self.dispatch(event, transport);
                    }
                } else if self.is_buttonless(characteristic) {
                    if let Some(event) = self
                        .buttonless
                        .as_mut()
                        .and_then(|b| b.handle_write(result))
                    {
                        self.on_buttonless(event, transport);
                    }
                }
            }
            GattEvent::ValueUpdated {
                characteristic,
                result,
            } => {
                if self.is_control_point(characteristic) {
                    if let Some(event) = self
                        .control_point
                        .as_mut()
                        .and_then(|cp| cp.handle_value(result))
                    {
                        self.dispatch(event, transport);
                    }
                } else if self.is_buttonless(characteristic) {
                    if let Some(event) = self
                        .buttonless
                        .as_mut()
                        .and_then(|b| b.handle_value(result))
                    {
                        self.on_buttonless(event, transport);
                    }
                }
            }
            GattEvent::ReadyToSendWriteWithoutResponse => self.on_ready_to_send(transport),
            other => debug!("Ignoring {:?}", other),
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
        if session.resume() && self.step == Step::Streaming {
            self.continue_upload(transport);
        }
        true
    }

    /// Secure DFU has no Reset request: aborting drops the connection and
    /// the bootloader keeps what it validated so far.
    pub fn abort<T: GattTransport + ?Sized>(&mut self, transport: &mut T) {
        if self.aborted {
            return;
        }
        info!("Upload aborted");
        self.aborted = true;
        if let Some(session) = self.session.as_mut() {
            session.abort();
        }
        self.disconnect(transport);
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
                new_address_expected: self
                    .buttonless
                    .as_ref()
                    .map_or(true, |b| b.kind().new_address_expected()),
                bootloader_name: self.bootloader_name.take(),
            },
            Step::Activating => ConnectionOutcome::Activated,
            _ => ConnectionOutcome::Failed(DfuError::DeviceDisconnected {
                reason: reason.unwrap_or_else(|| "connection lost".to_string()),
            }),
        }
    }

    fn is_control_point(&self, uuid: Uuid) -> bool {
        self.control_point.as_ref().map(SecureControlPoint::uuid) == Some(uuid)
    }

    fn is_buttonless(&self, uuid: Uuid) -> bool {
        self.buttonless.as_ref().map(Buttonless::uuid) == Some(uuid)
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

        let experimental = services.iter().find(|s| {
            self.options.experimental_buttonless && self.uuids.is_buttonless_experimental_service(s)
        });
        let service =
            experimental.or_else(|| services.iter().find(|s| self.uuids.is_secure_service(s)));
        match service {
            Some(service) => {
                debug!("Secure DFU Service {} found, discovering characteristics...", service);
                self.service = Some(*service);
                self.step = Step::DiscoveringCharacteristics;
                transport.discover_characteristics(*service);
            }
            None => self.fail(
                DfuError::DeviceNotSupported {
                    reason: "DFU Service not found".to_string(),
                },
                transport,
            ),
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
        if self.part.init_packet().is_none() {
            return self.fail(
                DfuError::ExtendedInitPacketRequired {
                    message: "The init packet is required by the target device".to_string(),
                },
                transport,
            );
        }
        let has = |uuid: Uuid| characteristics.iter().any(|c| c.uuid == uuid);

        if self
            .service
            .is_some_and(|s| self.uuids.is_buttonless_experimental_service(&s))
        {
            let uuid = self.uuids.get(UuidRole::ButtonlessExperimentalCharacteristic);
            if !has(uuid) {
                return self.fail(
                    DfuError::DeviceNotSupported {
                        reason: "Buttonless DFU characteristic not found".to_string(),
                    },
                    transport,
                );
            }
            return self.enable_buttonless(Buttonless::new(uuid, ButtonlessKind::Experimental), transport);
        }

        let buttonless = characteristics.iter().find_map(|c| {
            ButtonlessKind::detect(c.uuid, &self.uuids).map(|kind| Buttonless::new(c.uuid, kind))
        });
        if let Some(buttonless) = buttonless {
            return self.enable_buttonless(buttonless, transport);
        }

        let control_point = self.uuids.secure_control_point();
        if !has(control_point) {
            return self.fail(
                DfuError::DeviceNotSupported {
                    reason: "DFU Control Point characteristic not found".to_string(),
                },
                transport,
            );
        }
        let packet = self.uuids.secure_packet();
        if !has(packet) {
            return self.fail(
                DfuError::DeviceNotSupported {
                    reason: "DFU Packet characteristic not found".to_string(),
                },
                transport,
            );
        }

        let packet = DfuPacket::sized_to_link(packet, transport);
        debug!("Packet size: {} bytes", packet.packet_size());
        self.packet = Some(packet);
        let mut cp = SecureControlPoint::new(control_point);
        self.step = Step::EnablingNotifications;
        cp.enable_notifications(transport);
        self.control_point = Some(cp);
    }

    fn enable_buttonless<T: GattTransport + ?Sized>(
        &mut self,
        mut buttonless: Buttonless,
        transport: &mut T,
    ) {
        info!("Application with {:?} buttonless service found", buttonless.kind());
        self.events.push_back(ServiceEvent::EnablingDfuMode);
        self.step = Step::EnablingButtonless;
        buttonless.enable_notifications(transport);
        self.buttonless = Some(buttonless);
    }

    fn on_buttonless<T: GattTransport + ?Sized>(&mut self, event: ButtonlessEvent, transport: &mut T) {
        match event {
            ButtonlessEvent::NotificationsEnabled => self.name_bootloader(transport),
            ButtonlessEvent::Completed(ButtonlessOpCode::SetName) => {
                self.bootloader_name = self.options.alternative_advertising_name.clone();
                info!("Bootloader will advertise as {:?}", self.bootloader_name);
                self.enter_bootloader(transport);
            }
            ButtonlessEvent::Completed(op) => {
                debug!("{:?} completed, waiting for the device to reset", op)
            }
            ButtonlessEvent::Failed(DfuError::RemoteButtonless {
                status: ButtonlessStatus::OpCodeNotSupported,
                ..
            }) if self.step == Step::SettingName => {
                warn!("Setting the bootloader name is not supported, keeping the default");
                self.bootloader_name = None;
                self.enter_bootloader(transport);
            }
            ButtonlessEvent::Failed(e) => self.fail(e, transport),
        }
    }

    fn name_bootloader<T: GattTransport + ?Sized>(&mut self, transport: &mut T) {
        let supported = self
            .buttonless
            .as_ref()
            .is_some_and(|b| b.kind().may_support_setting_name());
        let name = match self.options.alternative_advertising_name.as_deref() {
            Some(name) if supported && !name.is_empty() => name,
            _ => return self.enter_bootloader(transport),
        };
        if name.len() > MAX_ADVERTISING_NAME_LEN {
            warn!(
                "Advertising name {:?} is longer than {} bytes, keeping the default",
                name, MAX_ADVERTISING_NAME_LEN
            );
            return self.enter_bootloader(transport);
        }

        let request = ButtonlessRequest::SetName(name.to_string());
        self.send_buttonless(request, Step::SettingName, transport);
    }

    fn enter_bootloader<T: GattTransport + ?Sized>(&mut self, transport: &mut T) {
        info!("Jumping to bootloader");
        self.send_buttonless(ButtonlessRequest::EnterBootloader, Step::JumpingToBootloader, transport);
    }

    fn send_buttonless<T: GattTransport + ?Sized>(
        &mut self,
        request: ButtonlessRequest,
        step: Step,
        transport: &mut T,
    ) {
        let Some(buttonless) = self.buttonless.as_mut() else {
            return;
        };
        self.step = step;
        if let Err(e) = buttonless.send(&request, transport) {
            self.fail(e, transport);
        }
    }

    fn dispatch<T: GattTransport + ?Sized>(
        &mut self,
        event: SecureControlPointEvent,
        transport: &mut T,
    ) {
        match event {
            SecureControlPointEvent::NotificationsEnabled => {
                self.events.push_back(ServiceEvent::Starting);
                self.send(
                    SecureRequest::ReadObjectInfo(ObjectType::Command),
                    Step::SelectingCommand,
                    transport,
                );
            }
            SecureControlPointEvent::Completed(request, payload) => {
                self.on_completed(request, payload, transport)
            }
            SecureControlPointEvent::PacketReceipt(checksum) => self.on_receipt(checksum, transport),
            // The bootloader may reset before acknowledging the last Execute
            SecureControlPointEvent::Failed(DfuError::WritingCharacteristicFailed { reason })
                if self.step == Step::Activating =>
            {
                debug!("Execute not acknowledged ({}), waiting for reset", reason)
            }
            SecureControlPointEvent::Failed(e) => self.fail(e, transport),
        }
    }

    fn on_completed<T: GattTransport + ?Sized>(
        &mut self,
        request: SecureRequest,
        payload: ResponsePayload,
        transport: &mut T,
    ) {
        match (request, payload) {
            (SecureRequest::ReadObjectInfo(ObjectType::Command), ResponsePayload::ObjectInfo(info)) => {
                self.on_command_info(info, transport)
            }
            (SecureRequest::ReadObjectInfo(ObjectType::Data), ResponsePayload::ObjectInfo(info)) => {
                self.on_data_info(info, transport)
            }
            (
                SecureRequest::CreateObject {
                    object: ObjectType::Command,
                    ..
                },
                _,
            ) => self.set_prn(0, AfterPrn::SendCommand { from: 0 }, transport),
            (
                SecureRequest::CreateObject {
                    object: ObjectType::Data,
                    ..
                },
                _,
            ) => {
                debug!(
                    "Data object {}/{} created",
                    self.object_index + 1,
                    self.objects.len()
                );
                if let Some(start) = self.objects.get(self.object_index).map(|r| r.start) {
                    self.stream_object(start, transport);
                }
            }
            (SecureRequest::SetPrn(value), _) => {
                self.device_prn = Some(value);
                if let Some(next) = self.after_prn.take() {
                    self.proceed(next, transport);
                }
            }
            (SecureRequest::CalculateChecksum, ResponsePayload::Checksum(checksum)) => {
                self.on_checksum(checksum, transport)
            }
            (SecureRequest::Execute, _) => self.on_executed(transport),
            (request, payload) => warn!("Unexpected completion of {}: {:?}", request.name(), payload),
        }
    }

    fn on_command_info<T: GattTransport + ?Sized>(&mut self, info: ObjectInfo, transport: &mut T) {
        let Some(init) = self.part.init_packet() else {
            return;
        };
        let len = init.len();
        let offset = info.offset as usize;
        let resumable = offset > 0 && crc_matches(init, offset, info.crc);

        match (resumable, offset < len) {
            (true, true) => {
                info!("Resuming init packet from byte {}", offset);
                self.set_prn(0, AfterPrn::SendCommand { from: offset }, transport);
            }
            (true, false) => {
                info!("Init packet already received");
                self.send(SecureRequest::Execute, Step::ExecutingCommand, transport);
            }
            (false, _) => self.create_command(transport),
        }
    }

    fn create_command<T: GattTransport + ?Sized>(&mut self, transport: &mut T) {
        let size = self.part.init_packet().map_or(0, <[u8]>::len) as u32;
        self.send(
            SecureRequest::CreateObject {
                object: ObjectType::Command,
                size,
            },
            Step::CreatingCommand,
            transport,
        );
    }

    fn on_data_info<T: GattTransport + ?Sized>(&mut self, info: ObjectInfo, transport: &mut T) {
        let max_size = info.max_size as usize;
        if max_size == 0 {
            return self.fail(
                DfuError::DeviceNotSupported {
                    reason: "the bootloader accepts no data objects".to_string(),
                },
                transport,
            );
        }
        let data = self.part.data();
        self.objects = object_ranges(data.len(), max_size);
        let total = data.len();
        let offset = info.offset as usize;
        let resumable = offset > 0 && crc_matches(data, offset, info.crc);
        debug!(
            "{} data objects of up to {} bytes, device holds {} bytes",
            self.objects.len(),
            max_size,
            offset
        );

        if offset == 0 {
            self.object_index = 0;
            self.session = Some(TransferSession::new());
            return self.set_prn(self.options.prn, AfterPrn::CreateData, transport);
        }

        let containing = self
            .objects
            .iter()
            .position(|range| range.contains(&offset))
            .unwrap_or(self.objects.len());
        if resumable {
            info!("{} bytes of data sent before, CRC match", offset);
            self.session = Some(TransferSession::resuming_at(offset));
            if offset == total {
                return self.activate(transport);
            }
            self.object_index = containing;
            return self.set_prn(self.options.prn, AfterPrn::ResumeData { from: offset }, transport);
        }

        // A full object that fails its CRC is the one before the offset
        let index = if offset % max_size == 0 {
            containing.saturating_sub(1)
        } else {
            containing
        };
        self.object_index = index.min(self.objects.len().saturating_sub(1));
        let start = self.objects.get(self.object_index).map_or(0, |r| r.start);
        warn!("CRC of the {} bytes held by the device does not match", offset);
        self.session = Some(TransferSession::resuming_at(start));
        if self.count_crc_failure(ObjectType::Data, transport) {
            self.set_prn(self.options.prn, AfterPrn::CreateData, transport);
        }
    }

    /// Set the PRN value and continue with `next`, skipping the request
    /// when the device already uses that value.
    fn set_prn<T: GattTransport + ?Sized>(&mut self, value: u16, next: AfterPrn, transport: &mut T) {
        if self.device_prn == Some(value) {
            return self.proceed(next, transport);
        }
        debug!("Sending PRN request ({})", value);
        self.after_prn = Some(next);
        let step = match next {
            AfterPrn::SendCommand { .. } => Step::SendingCommand,
            AfterPrn::CreateData | AfterPrn::ResumeData { .. } => Step::SelectingData,
        };
        self.send(SecureRequest::SetPrn(value), step, transport);
    }

    fn proceed<T: GattTransport + ?Sized>(&mut self, next: AfterPrn, transport: &mut T) {
        match next {
            AfterPrn::SendCommand { from } => self.send_command(from, transport),
            AfterPrn::CreateData => self.create_data(transport),
            AfterPrn::ResumeData { from } => {
                if self.objects.get(self.object_index).map(|r| r.start) == Some(from) {
                    self.create_data(transport)
                } else {
                    info!("Resuming upload from byte {}", from);
                    self.stream_object(from, transport)
                }
            }
        }
    }

    fn send_command<T: GattTransport + ?Sized>(&mut self, from: usize, transport: &mut T) {
        if let (Some(packet), Some(init)) = (self.packet.as_ref(), self.part.init_packet()) {
            packet.write_init_packet(init.get(from..).unwrap_or_default(), transport);
        }
        self.send(SecureRequest::CalculateChecksum, Step::SendingCommand, transport);
    }

    fn create_data<T: GattTransport + ?Sized>(&mut self, transport: &mut T) {
        let Some(range) = self.objects.get(self.object_index) else {
            return;
        };
        let size = range.len() as u32;
        self.send(
            SecureRequest::CreateObject {
                object: ObjectType::Data,
                size,
            },
            Step::CreatingData,
            transport,
        );
    }

    fn stream_object<T: GattTransport + ?Sized>(&mut self, from: usize, transport: &mut T) {
        let Some(end) = self.objects.get(self.object_index).map(|r| r.end) else {
            return;
        };
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.start_object(from, end);
        if let Some(cp) = self.control_point.as_mut() {
            cp.start_streaming();
        }
        self.step = Step::Streaming;
        self.continue_upload(transport);
    }

    fn on_receipt<T: GattTransport + ?Sized>(&mut self, checksum: Checksum, transport: &mut T) {
        if self.step != Step::Streaming {
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if let Err(e) = session.verify_offset(checksum.offset) {
            return self.fail(e, transport);
        }

        if session.is_object_complete() {
            self.checksum_object(transport);
        } else if session.is_paused() {
            debug!("{} bytes received, upload paused", checksum.offset);
        } else {
            self.continue_upload(transport);
        }
    }

    fn on_ready_to_send<T: GattTransport + ?Sized>(&mut self, transport: &mut T) {
        // With PRNs enabled, the receipts pace the upload
        if self.options.prn > 0 || self.step != Step::Streaming {
            return;
        }
        if self.session.as_ref().is_some_and(|s| !s.is_paused()) {
            self.continue_upload(transport);
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
        if session.is_object_complete() {
            self.checksum_object(transport);
        }
    }

    fn checksum_object<T: GattTransport + ?Sized>(&mut self, transport: &mut T) {
        self.send(SecureRequest::CalculateChecksum, Step::ChecksummingData, transport);
    }

    fn on_checksum<T: GattTransport + ?Sized>(&mut self, checksum: Checksum, transport: &mut T) {
        match self.step {
            Step::SendingCommand => {
                let init = self.part.init_packet().unwrap_or_default();
                if checksum.offset as usize == init.len() && crc32(init) == checksum.crc {
                    debug!("Command object sent (CRC = {:08X})", checksum.crc);
                    self.crc_failures = 0;
                    self.send(SecureRequest::Execute, Step::ExecutingCommand, transport);
                } else if self.count_crc_failure(ObjectType::Command, transport) {
                    self.create_command(transport);
                }
            }
            Step::ChecksummingData => {
                let data = self.part.data();
                let end = self.objects.get(self.object_index).map_or(0, |r| r.end);
                let offset = checksum.offset as usize;
                if offset == end && crc_matches(data, offset, checksum.crc) {
                    self.crc_failures = 0;
                    if end == data.len() {
                        self.activate(transport);
                    } else {
                        self.send(SecureRequest::Execute, Step::ExecutingData, transport);
                    }
                } else if self.count_crc_failure(ObjectType::Data, transport) {
                    let start = self.objects.get(self.object_index).map_or(0, |r| r.start);
                    if let Some(session) = self.session.as_mut() {
                        session.start_object(start, end);
                    }
                    self.create_data(transport);
                }
            }
            step => warn!("Unexpected checksum {:?} in {:?}", checksum, step),
        }
    }

    /// Record a CRC mismatch. Returns true when the object may be sent again.
    fn count_crc_failure<T: GattTransport + ?Sized>(
        &mut self,
        object: ObjectType,
        transport: &mut T,
    ) -> bool {
        self.crc_failures += 1;
        if self.crc_failures >= SECURE_CRC_ATTEMPTS {
            self.fail(
                DfuError::ObjectCrcMismatch {
                    object,
                    attempts: self.crc_failures,
                },
                transport,
            );
            return false;
        }
        warn!("{} object CRC does not match, retrying...", object.name());
        true
    }

    fn on_executed<T: GattTransport + ?Sized>(&mut self, transport: &mut T) {
        match self.step {
            Step::ExecutingCommand => {
                info!("Command object executed");
                self.send(
                    SecureRequest::ReadObjectInfo(ObjectType::Data),
                    Step::SelectingData,
                    transport,
                );
            }
            Step::ExecutingData => {
                debug!("Data object {}/{} executed", self.object_index + 1, self.objects.len());
                self.object_index += 1;
                self.create_data(transport);
            }
            Step::Activating => debug!("Firmware executed, waiting for the device to reset"),
            step => warn!("Unexpected Execute completion in {:?}", step),
        }
    }

    fn activate<T: GattTransport + ?Sized>(&mut self, transport: &mut T) {
        let sent = self.session.take().map(|s| s.bytes_sent()).unwrap_or_default();
        info!("Upload completed ({} bytes), activating", sent);
        self.events.push_back(ServiceEvent::Disconnecting);
        self.send(SecureRequest::Execute, Step::Activating, transport);
    }

    /// Write a request, or disconnect instead once aborted.
    fn send<T: GattTransport + ?Sized>(&mut self, request: SecureRequest, step: Step, transport: &mut T) {
        if self.aborted {
            return self.disconnect(transport);
        }
        let Some(cp) = self.control_point.as_mut() else {
            return;
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
        self.disconnect(transport);
    }

    fn disconnect<T: GattTransport + ?Sized>(&mut self, transport: &mut T) {
        if self.step == Step::Disconnecting {
            return;
        }
        debug!("Disconnecting...");
        self.step = Step::Disconnecting;
        transport.disconnect();
    }
}

/// Split `len` bytes into objects of at most `max_size` bytes.
fn object_ranges(len: usize, max_size: usize) -> Vec<Range<usize>> {
    (0..len)
        .step_by(max_size)
        .map(|start| start..(start + max_size).min(len))
        .collect()
}

/// Whether the first `offset` bytes of `data` have the given CRC-32.
fn crc_matches(data: &[u8], offset: usize, crc: u32) -> bool {
    data.get(..offset).is_some_and(|received| crc32(received) == crc)
}
