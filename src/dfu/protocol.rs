//! Multi-connection DFU controller.
//!
//! Orchestrates the complete update across connections:
//! 1. Connect to the target and run the Legacy or Secure DFU service
//! 2. Reconnect after a buttonless jump into the bootloader
//! 3. Reconnect (scanning if the address may change) between parts
//! 4. Reset and retry once when the device reports an invalid state
//!
//! Like the service, the controller is event-driven: feed it every
//! [`GattEvent`], fire its timers and drain [`DfuStage`]s.
//! [`run`](super::driver::run) does all three on a tokio runtime.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::error::{DfuError, DfuResult};
use super::firmware::FirmwareContainer;
use super::connection::DfuConnection;
use super::service::{ConnectionOutcome, ServiceEvent, ServiceOptions};
use super::transport::{GattEvent, GattTransport, PeripheralId};
use super::uuids::DfuUuids;
use crate::settings::DfuSettings;
use crate::traits::{DefaultPeripheralSelector, PeripheralSelector};

/// DFU progress stages for UI feedback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", content = "data")]
pub enum DfuStage {
    /// Connecting to the target, or reconnecting after a reset.
    Connecting,
    /// Starting DFU on the bootloader.
    Starting,
    /// Asking the application to jump into the bootloader.
    EnablingDfuMode,
    /// Uploading firmware data. Speeds are in bytes per second.
    #[serde(rename_all = "camelCase")]
    Uploading {
        part: usize,
        parts: usize,
        percent: u8,
        current_speed: f64,
        average_speed: f64,
    },
    /// Waiting for the bootloader to validate the image.
    Validating,
    /// Activating the new firmware, the device is about to reset.
    Disconnecting,
    /// DFU process complete.
    Completed,
    /// Stopped on request.
    Aborted,
}

impl DfuStage {
    /// Get a percentage estimate of the whole update for this stage.
    pub fn percent(&self) -> f32 {
        match self {
            DfuStage::Connecting | DfuStage::Starting | DfuStage::EnablingDfuMode => 0.0,
            DfuStage::Uploading {
                part,
                parts,
                percent,
                ..
            } => {
                if *parts == 0 {
                    0.0
                } else {
                    let done = part.saturating_sub(1) as f32 * 100.0 + *percent as f32;
                    done / *parts as f32
                }
            }
            DfuStage::Completed => 100.0,
            // These don't move the progress bar
            DfuStage::Validating | DfuStage::Disconnecting | DfuStage::Aborted => -1.0,
        }
    }

    /// Get a human-readable message for this stage.
    pub fn message(&self) -> String {
        match self {
            DfuStage::Connecting => "Connecting...".into(),
            DfuStage::Starting => "Starting DFU...".into(),
            DfuStage::EnablingDfuMode => "Enabling DFU mode...".into(),
            DfuStage::Uploading {
                part,
                parts,
                percent,
                current_speed,
                ..
            } => {
                let speed = current_speed / 1024.0;
                if *parts > 1 {
                    format!(
                        "Uploading part {}/{}... {}% ({:.1} kB/s)",
                        part, parts, percent, speed
                    )
                } else {
                    format!("Uploading firmware... {}% ({:.1} kB/s)", percent, speed)
                }
            }
            DfuStage::Validating => "Validating firmware...".into(),
            DfuStage::Disconnecting => "Activating new firmware...".into(),
            DfuStage::Completed => "Update complete!".into(),
            DfuStage::Aborted => "Update aborted".into(),
        }
    }
}

/// How a successful run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DfuOutcome {
    Completed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Connecting,
    Connected,
    Scanning,
    Finished,
}

/// Drives a [`FirmwareContainer`] onto one peripheral, across as many
/// connections as the update needs.
pub struct DfuController<S: PeripheralSelector = DefaultPeripheralSelector> {
    firmware: FirmwareContainer,
    settings: DfuSettings,
    uuids: DfuUuids,
    selector: S,
    target: PeripheralId,
    phase: Phase,
    service: Option<DfuConnection>,
    /// Advertising name to look for while scanning.
    expected_name: Option<String>,
    invalid_state_retries_left: u8,
    aborted: bool,
    stages: VecDeque<DfuStage>,
    timer: Option<Duration>,
    outcome: Option<DfuResult<DfuOutcome>>,
}

impl DfuController<DefaultPeripheralSelector> {
    pub fn new(firmware: FirmwareContainer, settings: DfuSettings, target: PeripheralId) -> Self {
        Self::with_selector(firmware, settings, target, DefaultPeripheralSelector)
    }
}

impl<S: PeripheralSelector> DfuController<S> {
    pub fn with_selector(
        firmware: FirmwareContainer,
        settings: DfuSettings,
        target: PeripheralId,
        selector: S,
    ) -> Self {
        Self {
            uuids: settings.uuids(),
            invalid_state_retries_left: settings.invalid_state_retries,
            expected_name: settings.alternative_advertising_name.clone(),
            firmware,
            settings,
            selector,
            target,
            phase: Phase::Idle,
            service: None,
            aborted: false,
            stages: VecDeque::new(),
            timer: None,
            outcome: None,
        }
    }

    pub fn target(&self) -> &PeripheralId {
        &self.target
    }

    pub fn is_finished(&self) -> bool {
        self.phase == Phase::Finished
    }

    /// Connect to the target and begin with the first part.
    pub fn start<T: GattTransport + ?Sized>(&mut self, transport: &mut T) {
        if self.phase != Phase::Idle {
            warn!("DFU already started");
            return;
        }
        let info = self.firmware.info();
        for part in &info.parts {
            info!(
                "Part {}/{}: {} ({} bytes, sha256 {})",
                part.number,
                info.parts.len(),
                part.firmware_type.name(),
                part.size.total(),
                part.sha256
            );
        }
        self.connect(transport);
    }

    pub fn handle_event<T: GattTransport + ?Sized>(&mut self, event: GattEvent, transport: &mut T) {
        if self.phase == Phase::Finished {
            debug!("Ignoring {:?} after finish", event);
            return;
        }

        match event {
            GattEvent::BluetoothStateChanged { powered_on: false } => {
                self.service = None;
                self.finish(Err(DfuError::BluetoothDisabled));
            }
            GattEvent::BluetoothStateChanged { powered_on: true } => {}
            GattEvent::Connected if self.phase == Phase::Connecting => {
                info!("Connected to {}", self.target);
                self.phase = Phase::Connected;
                let mut service = DfuConnection::new(
                    self.firmware.current_part().clone(),
                    self.service_options(),
                    self.uuids.clone(),
                );
                service.start(transport);
                self.service = Some(service);
                self.drain_service();
            }
            GattEvent::ConnectFailed { reason } => {
                self.finish(Err(DfuError::FailedToConnect { reason }));
            }
            GattEvent::Disconnected { reason } => self.on_disconnected(reason, transport),
            GattEvent::Discovered {
                peripheral,
                advertisement,
                rssi,
            } if self.phase == Phase::Scanning => {
                let expected = self.expected_name.as_deref();
                if self
                    .selector
                    .select(&peripheral, &advertisement, rssi, expected)
                {
                    info!("Found bootloader {} (RSSI {})", peripheral, rssi);
                    transport.stop_scan();
                    self.target = peripheral;
                    self.connect(transport);
                }
            }
            event => match self.service.as_mut() {
                Some(service) => {
                    service.handle_event(event, transport);
                    self.drain_service();
                }
                None => debug!("Ignoring {:?} while {:?}", event, self.phase),
            },
        }
    }

    /// The delay last returned by [`take_timer`](Self::take_timer) elapsed.
    pub fn timer_fired<T: GattTransport + ?Sized>(&mut self, transport: &mut T) {
        if let Some(service) = self.service.as_mut() {
            service.timer_fired(transport);
            self.drain_service();
        }
    }

    pub fn pause(&mut self) -> bool {
        self.service.as_mut().is_some_and(DfuConnection::pause)
    }

    pub fn resume<T: GattTransport + ?Sized>(&mut self, transport: &mut T) -> bool {
        let resumed = self
            .service
            .as_mut()
            .is_some_and(|service| service.resume(transport));
        self.drain_service();
        resumed
    }

    /// Abort the update. The outcome is reported once the device is gone.
    pub fn abort<T: GattTransport + ?Sized>(&mut self, transport: &mut T) {
        if self.aborted || self.phase == Phase::Finished {
            return;
        }
        self.aborted = true;

        match self.phase {
            Phase::Connected => match self.service.as_mut() {
                Some(service) => {
                    service.abort(transport);
                    self.drain_service();
                }
                None => transport.disconnect(),
            },
            Phase::Scanning => {
                transport.stop_scan();
                self.finish_aborted();
            }
            Phase::Connecting => {
                transport.disconnect();
                self.finish_aborted();
            }
            Phase::Idle => self.finish_aborted(),
            Phase::Finished => {}
        }
    }

    pub fn poll_stage(&mut self) -> Option<DfuStage> {
        self.stages.pop_front()
    }

    /// A delay after which [`timer_fired`](Self::timer_fired) must be called.
    pub fn take_timer(&mut self) -> Option<Duration> {
        self.timer.take()
    }

    pub fn take_outcome(&mut self) -> Option<DfuResult<DfuOutcome>> {
        self.outcome.take()
    }

    fn service_options(&self) -> ServiceOptions {
        ServiceOptions {
            prn: self.settings.packet_receipt_notification,
            force_dfu: self.settings.force_dfu,
            start_delay: self.settings.legacy_start_delay(),
            allow_invalid_state_retry: self.invalid_state_retries_left > 0,
            verify_init_packet_crc: self.settings.verify_init_packet_crc,
            alternative_advertising_name: self.settings.alternative_advertising_name.clone(),
            experimental_buttonless: self.settings.experimental_buttonless,
        }
    }

    fn connect<T: GattTransport + ?Sized>(&mut self, transport: &mut T) {
        info!("Connecting to {}...", self.target);
        self.phase = Phase::Connecting;
        self.stages.push_back(DfuStage::Connecting);
        transport.connect(&self.target);
    }

    fn reconnect<T: GattTransport + ?Sized>(&mut self, new_address_expected: bool, transport: &mut T) {
        if self.aborted {
            return self.finish_aborted();
        }
        if new_address_expected {
            info!("Scanning for the bootloader...");
            self.phase = Phase::Scanning;
            transport.scan(&self.selector.filter_by(&self.uuids));
        } else {
            self.connect(transport);
        }
    }

    fn on_disconnected<T: GattTransport + ?Sized>(
        &mut self,
        reason: Option<String>,
        transport: &mut T,
    ) {
        let Some(mut service) = self.service.take() else {
            if self.phase == Phase::Connecting {
                self.finish(Err(DfuError::FailedToConnect {
                    reason: reason.unwrap_or_else(|| "disconnected".to_string()),
                }));
            }
            return;
        };
        self.drain(&mut service);
        debug!("Disconnected ({:?})", reason);

        match service.on_disconnected(reason) {
            ConnectionOutcome::JumpedToBootloader {
                new_address_expected,
                bootloader_name,
            } => {
                info!("Device switched to bootloader mode");
                self.expected_name = bootloader_name;
                self.reconnect(new_address_expected, transport);
            }
            ConnectionOutcome::Activated if self.firmware.advance_to_next_part() => {
                info!(
                    "Part {}/{} completed",
                    self.firmware.current_part_number() - 1,
                    self.firmware.parts()
                );
                self.reconnect(true, transport);
            }
            ConnectionOutcome::Activated => {
                info!("Update complete");
                self.stages.push_back(DfuStage::Completed);
                self.finish(Ok(DfuOutcome::Completed));
            }
            ConnectionOutcome::Aborted => self.finish_aborted(),
            ConnectionOutcome::RetryAfterReset => {
                self.invalid_state_retries_left = self.invalid_state_retries_left.saturating_sub(1);
                info!(
                    "Retrying after reset ({} retries left)",
                    self.invalid_state_retries_left
                );
                self.reconnect(false, transport);
            }
            ConnectionOutcome::Failed(e) => self.finish(Err(e)),
        }
    }

    fn drain_service(&mut self) {
        if let Some(mut service) = self.service.take() {
            self.drain(&mut service);
            self.service = Some(service);
        }
    }

    fn drain(&mut self, service: &mut DfuConnection) {
        while let Some(event) = service.poll_event() {
            let stage = match event {
                ServiceEvent::Starting => DfuStage::Starting,
                ServiceEvent::EnablingDfuMode => DfuStage::EnablingDfuMode,
                ServiceEvent::Progress(progress) => DfuStage::Uploading {
                    part: self.firmware.current_part_number(),
                    parts: self.firmware.parts(),
                    percent: progress.percent,
                    current_speed: progress.current_speed,
                    average_speed: progress.average_speed,
                },
                ServiceEvent::Validating => DfuStage::Validating,
                ServiceEvent::Disconnecting => DfuStage::Disconnecting,
                ServiceEvent::ScheduleTimer(delay) => {
                    self.timer = Some(delay);
                    continue;
                }
            };
            self.stages.push_back(stage);
        }
    }

    fn finish_aborted(&mut self) {
        self.stages.push_back(DfuStage::Aborted);
        self.finish(Ok(DfuOutcome::Aborted));
    }

    fn finish(&mut self, result: DfuResult<DfuOutcome>) {
        match &result {
            Ok(outcome) => info!("DFU finished: {:?}", outcome),
            Err(e) => error!("DFU failed: {} (code {})", e, e.code().value()),
        }
        self.phase = Phase::Finished;
        self.outcome = Some(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dfu::error::DfuErrorCode;
    use crate::dfu::firmware::{FirmwareType, FirmwareTypes};
    use crate::test_helpers::{
        FirmwareZipBuilder, SecureSimulatedDevice, SimulatedButtonless, SimulatedDevice,
        Simulation, TransportCall,
    };

    fn application_zip(len: usize) -> FirmwareContainer {
        let bytes = FirmwareZipBuilder::new()
            .manifest(
                r#"{"manifest": {
                    "application": {"bin_file": "app.bin", "dat_file": "app.dat"}
                }}"#,
            )
            .file("app.bin", &vec![0x5A; len])
            .file("app.dat", &[0x01; 14])
            .build_bytes();
        FirmwareContainer::from_zip_bytes(&bytes, FirmwareTypes::ALL).unwrap()
    }

    /// Image for a Secure DFU bootloader; its init packet starts with the
    /// image length.
    fn secure_zip(len: usize) -> (FirmwareContainer, Vec<u8>) {
        let image: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let mut init = (len as u32).to_le_bytes().to_vec();
        init.resize(14, 0x11);
        let bytes = FirmwareZipBuilder::new()
            .manifest(
                r#"{"manifest": {
                    "application": {"bin_file": "app.bin", "dat_file": "app.dat"}
                }}"#,
            )
            .file("app.bin", &image)
            .file("app.dat", &init)
            .build_bytes();
        let firmware = FirmwareContainer::from_zip_bytes(&bytes, FirmwareTypes::ALL).unwrap();
        (firmware, image)
    }

    fn settings() -> DfuSettings {
        DfuSettings {
            packet_receipt_notification: 4,
            ..Default::default()
        }
    }

    /// Pump events and timers until the controller finishes.
    fn run_to_end<S: PeripheralSelector, D: Simulation>(
        controller: &mut DfuController<S>,
        device: &mut D,
    ) -> (Vec<DfuStage>, DfuResult<DfuOutcome>) {
        controller.start(device);
        let mut stages = Vec::new();
        loop {
            stages.extend(std::iter::from_fn(|| controller.poll_stage()));
            if let Some(outcome) = controller.take_outcome() {
                return (stages, outcome);
            }
            if controller.take_timer().is_some() {
                controller.timer_fired(device);
                continue;
            }
            let event = device.next_event().expect("simulation stalled");
            controller.handle_event(event, device);
        }
    }

    #[test]
    fn test_stage_percent() {
        assert_eq!(DfuStage::Connecting.percent(), 0.0);
        assert_eq!(DfuStage::Completed.percent(), 100.0);

        let stage = DfuStage::Uploading {
            part: 2,
            parts: 2,
            percent: 50,
            current_speed: 0.0,
            average_speed: 0.0,
        };
        assert_eq!(stage.percent(), 75.0);
        assert!(DfuStage::Validating.percent() < 0.0);
    }

    #[test]
    fn test_stage_message() {
        assert!(DfuStage::Completed.message().contains("complete"));

        let stage = DfuStage::Uploading {
            part: 1,
            parts: 1,
            percent: 75,
            current_speed: 2048.0,
            average_speed: 1024.0,
        };
        assert_eq!(stage.message(), "Uploading firmware... 75% (2.0 kB/s)");
    }

    #[test]
    fn test_stage_serialization() {
        let json = serde_json::to_string(&DfuStage::Uploading {
            part: 1,
            parts: 2,
            percent: 10,
            current_speed: 1.0,
            average_speed: 1.0,
        })
        .unwrap();
        assert!(json.contains(r#""stage":"Uploading""#));
        assert!(json.contains("currentSpeed"));
    }

    #[test]
    fn test_update_from_bootloader() {
        let mut device = SimulatedDevice::bootloader(Some([0x08, 0x00]));
        let mut controller =
            DfuController::new(application_zip(100), settings(), PeripheralId::new("AA"));

        let (stages, outcome) = run_to_end(&mut controller, &mut device);

        assert_eq!(outcome.unwrap(), DfuOutcome::Completed);
        assert_eq!(device.images, vec![100]);
        assert_eq!(device.activations, 1);
        assert_eq!(stages.first(), Some(&DfuStage::Connecting));
        assert_eq!(stages.last(), Some(&DfuStage::Completed));
        assert!(stages.contains(&DfuStage::Validating));

        let percents: Vec<u8> = stages
            .iter()
            .filter_map(|s| match s {
                DfuStage::Uploading { percent, .. } => Some(*percent),
                _ => None,
            })
            .collect();
        assert_eq!(percents.first(), Some(&0));
        assert_eq!(percents.last(), Some(&100));
        assert!(percents.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_buttonless_jump_reconnects_to_same_address() {
        let mut device = SimulatedDevice::application([0x08, 0x00]);
        let mut controller =
            DfuController::new(application_zip(64), settings(), PeripheralId::new("AA"));

        let (stages, outcome) = run_to_end(&mut controller, &mut device);

        assert_eq!(outcome.unwrap(), DfuOutcome::Completed);
        assert!(stages.contains(&DfuStage::EnablingDfuMode));
        let connects = device
            .calls
            .iter()
            .filter(|c| **c == TransportCall::Connect(PeripheralId::new("AA")))
            .count();
        assert_eq!(connects, 2);
        assert!(!device.calls.iter().any(|c| matches!(c, TransportCall::Scan(_))));
    }

    #[test]
    fn test_two_parts_scan_between_parts() {
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
        let firmware = FirmwareContainer::from_zip_bytes(&bytes, FirmwareTypes::ALL).unwrap();
        let mut device = SimulatedDevice::bootloader(Some([0x08, 0x00]))
            .advertising("CC", "Other")
            .advertising("BB", "DfuTarg");
        let settings = DfuSettings {
            alternative_advertising_name: Some("DfuTarg".to_string()),
            ..settings()
        };
        let mut controller = DfuController::new(firmware, settings, PeripheralId::new("AA"));

        let (stages, outcome) = run_to_end(&mut controller, &mut device);

        assert_eq!(outcome.unwrap(), DfuOutcome::Completed);
        assert_eq!(device.images, vec![30, 41]);
        assert_eq!(controller.target(), &PeripheralId::new("BB"));
        assert!(device.calls.contains(&TransportCall::Connect(PeripheralId::new("BB"))));
        assert!(!device.calls.contains(&TransportCall::Connect(PeripheralId::new("CC"))));

        let starts: Vec<Vec<u8>> = device
            .control_point_writes()
            .into_iter()
            .filter(|w| w.first() == Some(&0x01))
            .collect();
        assert_eq!(
            starts,
            vec![
                vec![0x01, FirmwareType::SoftDevice.bits()],
                vec![0x01, FirmwareType::Application.bits()]
            ]
        );
        assert!(stages.iter().any(|s| matches!(s, DfuStage::Uploading { part: 2, parts: 2, .. })));
    }

    #[test]
    fn test_invalid_state_retried_once() {
        let mut device = SimulatedDevice::bootloader(Some([0x08, 0x00]));
        device.start_status = Some(0x02);
        let mut controller =
            DfuController::new(application_zip(64), settings(), PeripheralId::new("AA"));

        let (_, outcome) = run_to_end(&mut controller, &mut device);

        assert_eq!(outcome.unwrap(), DfuOutcome::Completed);
        assert_eq!(device.images, vec![64]);
    }

    #[test]
    fn test_invalid_state_without_retries_fails() {
        let mut device = SimulatedDevice::bootloader(Some([0x08, 0x00]));
        device.start_status = Some(0x02);
        let settings = DfuSettings {
            invalid_state_retries: 0,
            ..settings()
        };
        let mut controller =
            DfuController::new(application_zip(64), settings, PeripheralId::new("AA"));

        let (_, outcome) = run_to_end(&mut controller, &mut device);

        let err = outcome.unwrap_err();
        assert_eq!(err.code(), DfuErrorCode::RemoteLegacyDfuInvalidState);
        assert!(err.is_remote());
    }

    #[test]
    fn test_legacy_bootloader_uses_start_delay() {
        let mut device = SimulatedDevice::bootloader(None);
        let mut controller =
            DfuController::new(application_zip(64), settings(), PeripheralId::new("AA"));
        controller.start(&mut device);

        while controller.take_timer().is_none() {
            let event = device.next_event().expect("no timer requested");
            controller.handle_event(event, &mut device);
        }
        // Nothing written to the control point until the timer fires
        assert!(device.control_point_writes().is_empty());
        controller.timer_fired(&mut device);
        assert_eq!(device.control_point_writes(), vec![vec![0x01, 0x04]]);
    }

    #[test]
    fn test_abort_while_scanning() {
        let mut device = SimulatedDevice::bootloader(Some([0x08, 0x00]));
        let mut controller =
            DfuController::new(application_zip(64), settings(), PeripheralId::new("AA"));
        controller.phase = Phase::Scanning;

        controller.abort(&mut device);

        assert_eq!(device.calls, vec![TransportCall::StopScan]);
        assert_eq!(controller.poll_stage(), Some(DfuStage::Aborted));
        assert_eq!(controller.take_outcome().unwrap().unwrap(), DfuOutcome::Aborted);
        assert!(controller.is_finished());
    }

    #[test]
    fn test_abort_mid_upload_resets_device() {
        let mut device = SimulatedDevice::bootloader(Some([0x08, 0x00]));
        let mut controller =
            DfuController::new(application_zip(400), settings(), PeripheralId::new("AA"));
        controller.start(&mut device);

        // Run until the first progress report
        loop {
            let event = device.next_event().unwrap();
            controller.handle_event(event, &mut device);
            if std::iter::from_fn(|| controller.poll_stage())
                .any(|s| matches!(s, DfuStage::Uploading { .. }))
            {
                break;
            }
        }
        assert!(controller.pause());
        controller.abort(&mut device);
        assert_eq!(device.control_point_writes().last(), Some(&vec![0x06]));

        while let Some(event) = device.next_event() {
            controller.handle_event(event, &mut device);
        }
        assert_eq!(controller.take_outcome().unwrap().unwrap(), DfuOutcome::Aborted);
        assert!(device.images.is_empty());
    }

    #[test]
    fn test_bluetooth_off_fails() {
        let mut device = SimulatedDevice::bootloader(Some([0x08, 0x00]));
        let mut controller =
            DfuController::new(application_zip(64), settings(), PeripheralId::new("AA"));
        controller.start(&mut device);

        controller.handle_event(GattEvent::BluetoothStateChanged { powered_on: false }, &mut device);

        let err = controller.take_outcome().unwrap().unwrap_err();
        assert_eq!(err.code(), DfuErrorCode::BluetoothDisabled);
    }

    #[test]
    fn test_connect_failure() {
        let mut device = SimulatedDevice::bootloader(Some([0x08, 0x00]));
        let mut controller =
            DfuController::new(application_zip(64), settings(), PeripheralId::new("AA"));
        controller.start(&mut device);

        controller.handle_event(
            GattEvent::ConnectFailed {
                reason: "timeout".to_string(),
            },
            &mut device,
        );

        let err = controller.take_outcome().unwrap().unwrap_err();
        assert_eq!(err.code(), DfuErrorCode::FailedToConnect);
        assert!(!err.is_remote());
    }

    fn data_objects_created(device: &SecureSimulatedDevice) -> usize {
        device
            .control_point_writes()
            .iter()
            .filter(|w| w.starts_with(&[0x01, 0x02]))
            .count()
    }

    #[test]
    fn test_secure_update_from_bootloader() {
        let mut device = SecureSimulatedDevice::bootloader();
        let (firmware, image) = secure_zip(300);
        let mut controller = DfuController::new(firmware, settings(), PeripheralId::new("AA"));

        let (stages, outcome) = run_to_end(&mut controller, &mut device);

        assert_eq!(outcome.unwrap(), DfuOutcome::Completed);
        assert_eq!(device.images, vec![image]);
        assert_eq!(device.activations, 1);
        // 128 + 128 + 44 bytes
        assert_eq!(data_objects_created(&device), 3);
        assert!(stages.contains(&DfuStage::Starting));
        assert!(stages.contains(&DfuStage::Disconnecting));
        assert_eq!(stages.last(), Some(&DfuStage::Completed));
        assert!(stages
            .iter()
            .any(|s| matches!(s, DfuStage::Uploading { percent: 100, .. })));
    }

    #[test]
    fn test_secure_update_paced_by_receipts() {
        let mut device = SecureSimulatedDevice::bootloader();
        device.max_write_length = 20;
        let (firmware, image) = secure_zip(250);
        let settings = DfuSettings {
            packet_receipt_notification: 2,
            ..settings()
        };
        let mut controller = DfuController::new(firmware, settings, PeripheralId::new("AA"));

        let (_, outcome) = run_to_end(&mut controller, &mut device);

        assert_eq!(outcome.unwrap(), DfuOutcome::Completed);
        assert_eq!(device.images, vec![image]);
        assert!(device.control_point_writes().contains(&vec![0x02, 0x02, 0x00]));
    }

    #[test]
    fn test_secure_bonded_jump_reconnects_to_same_address() {
        let mut device = SecureSimulatedDevice::application(SimulatedButtonless::WithBonds);
        let (firmware, image) = secure_zip(100);
        let mut controller = DfuController::new(firmware, settings(), PeripheralId::new("AA"));

        let (stages, outcome) = run_to_end(&mut controller, &mut device);

        assert_eq!(outcome.unwrap(), DfuOutcome::Completed);
        assert_eq!(device.images, vec![image]);
        assert!(stages.contains(&DfuStage::EnablingDfuMode));
        let connects = device
            .calls
            .iter()
            .filter(|c| **c == TransportCall::Connect(PeripheralId::new("AA")))
            .count();
        assert_eq!(connects, 2);
        assert!(!device.calls.iter().any(|c| matches!(c, TransportCall::Scan(_))));
    }

    #[test]
    fn test_secure_unbonded_jump_scans_for_named_bootloader() {
        let mut device = SecureSimulatedDevice::application(SimulatedButtonless::WithoutBonds)
            .advertising("CC", "DfuTarg")
            .advertising("BB", "MyDfu");
        let (firmware, _) = secure_zip(100);
        let settings = DfuSettings {
            alternative_advertising_name: Some("MyDfu".to_string()),
            ..settings()
        };
        let mut controller = DfuController::new(firmware, settings, PeripheralId::new("AA"));

        let (_, outcome) = run_to_end(&mut controller, &mut device);

        assert_eq!(outcome.unwrap(), DfuOutcome::Completed);
        assert_eq!(device.bootloader_name.as_deref(), Some("MyDfu"));
        assert_eq!(controller.target(), &PeripheralId::new("BB"));
        assert!(!device.calls.contains(&TransportCall::Connect(PeripheralId::new("CC"))));
    }

    #[test]
    fn test_secure_unsupported_set_name_scans_for_any_bootloader() {
        let mut device = SecureSimulatedDevice::application(SimulatedButtonless::WithoutBonds)
            .advertising("CC", "DfuTarg");
        device.set_name_unsupported = true;
        let (firmware, _) = secure_zip(100);
        let settings = DfuSettings {
            alternative_advertising_name: Some("MyDfu".to_string()),
            ..settings()
        };
        let mut controller = DfuController::new(firmware, settings, PeripheralId::new("AA"));

        let (_, outcome) = run_to_end(&mut controller, &mut device);

        assert_eq!(outcome.unwrap(), DfuOutcome::Completed);
        assert_eq!(device.bootloader_name, None);
        assert_eq!(controller.target(), &PeripheralId::new("CC"));
    }

    #[test]
    fn test_secure_crc_mismatch_is_retried() {
        let mut device = SecureSimulatedDevice::bootloader();
        device.corrupt_checksums = 2;
        let (firmware, image) = secure_zip(200);
        let mut controller = DfuController::new(firmware, settings(), PeripheralId::new("AA"));

        let (_, outcome) = run_to_end(&mut controller, &mut device);

        assert_eq!(outcome.unwrap(), DfuOutcome::Completed);
        assert_eq!(device.images, vec![image]);
        // Two objects, the first one sent three times
        assert_eq!(data_objects_created(&device), 4);
    }

    #[test]
    fn test_secure_crc_mismatch_fails_after_three_attempts() {
        let mut device = SecureSimulatedDevice::bootloader();
        device.corrupt_checksums = 3;
        let (firmware, _) = secure_zip(200);
        let mut controller = DfuController::new(firmware, settings(), PeripheralId::new("AA"));

        let (_, outcome) = run_to_end(&mut controller, &mut device);

        let err = outcome.unwrap_err();
        assert_eq!(err.code(), DfuErrorCode::CrcError);
        assert!(device.images.is_empty());
        assert_eq!(data_objects_created(&device), 3);
    }

    #[test]
    fn test_experimental_buttonless_only_when_enabled() {
        let mut device = SecureSimulatedDevice::application(SimulatedButtonless::Experimental)
            .advertising("BB", "DfuTarg");
        let (firmware, _) = secure_zip(100);
        let mut controller = DfuController::new(firmware, settings(), PeripheralId::new("AA"));

        let (_, outcome) = run_to_end(&mut controller, &mut device);

        assert_eq!(outcome.unwrap_err().code(), DfuErrorCode::DeviceNotSupported);

        let mut device = SecureSimulatedDevice::application(SimulatedButtonless::Experimental)
            .advertising("BB", "DfuTarg");
        let (firmware, image) = secure_zip(100);
        let settings = DfuSettings {
            experimental_buttonless: true,
            ..settings()
        };
        let mut controller = DfuController::new(firmware, settings, PeripheralId::new("AA"));

        let (_, outcome) = run_to_end(&mut controller, &mut device);

        assert_eq!(outcome.unwrap(), DfuOutcome::Completed);
        assert_eq!(device.images, vec![image]);
        assert_eq!(controller.target(), &PeripheralId::new("BB"));
    }
}
