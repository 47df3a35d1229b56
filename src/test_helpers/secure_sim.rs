use std::collections::VecDeque;

use uuid::Uuid;

use super::sim::{Simulation, HEART_RATE_SERVICE};
use super::TransportCall;
use crate::dfu::uuids::{
    BUTTONLESS_EXPERIMENTAL_CHARACTERISTIC, BUTTONLESS_EXPERIMENTAL_SERVICE,
    BUTTONLESS_WITHOUT_BONDS, BUTTONLESS_WITH_BONDS, SECURE_DFU_CONTROL_POINT, SECURE_DFU_PACKET,
    SECURE_DFU_SERVICE,
};
use crate::dfu::{
    crc32, AdvertisementData, Characteristic, CharacteristicProperties, GattEvent, GattTransport,
    PeripheralId, WriteKind,
};

/// Buttonless characteristic exposed by a simulated application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulatedButtonless {
    Experimental,
    WithoutBonds,
    WithBonds,
}

impl SimulatedButtonless {
    fn uuid(self) -> Uuid {
        match self {
            SimulatedButtonless::Experimental => BUTTONLESS_EXPERIMENTAL_CHARACTERISTIC,
            SimulatedButtonless::WithoutBonds => BUTTONLESS_WITHOUT_BONDS,
            SimulatedButtonless::WithBonds => BUTTONLESS_WITH_BONDS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Selected {
    Command,
    Data,
}

/// In-memory Secure DFU peripheral.
///
/// The first four bytes of the init packet hold the image length, as the
/// size fields of a real init command do. Executing the data object that
/// completes the image activates it.
pub struct SecureSimulatedDevice {
    pub calls: Vec<TransportCall>,
    /// Running an application with this buttonless characteristic.
    pub buttonless: Option<SimulatedButtonless>,
    /// Answer Set Name with Op Code Not Supported.
    pub set_name_unsupported: bool,
    /// Name set through the buttonless characteristic.
    pub bootloader_name: Option<String>,
    pub advertisers: Vec<(PeripheralId, AdvertisementData)>,
    pub max_write_length: usize,
    pub max_object_size: u32,
    /// Report a wrong CRC for this many data object checksums.
    pub corrupt_checksums: usize,
    pub activations: usize,
    pub images: Vec<Vec<u8>>,
    pending: VecDeque<GattEvent>,
    prn: u16,
    selected: Selected,
    command: Vec<u8>,
    data: Vec<u8>,
    executed: usize,
    image_len: usize,
    packets_in_object: usize,
}

impl SecureSimulatedDevice {
    pub fn bootloader() -> Self {
        Self {
            calls: Vec::new(),
            buttonless: None,
            set_name_unsupported: false,
            bootloader_name: None,
            advertisers: Vec::new(),
            max_write_length: 64,
            max_object_size: 128,
            corrupt_checksums: 0,
            activations: 0,
            images: Vec::new(),
            pending: VecDeque::new(),
            prn: 0,
            selected: Selected::Command,
            command: Vec::new(),
            data: Vec::new(),
            executed: 0,
            image_len: 0,
            packets_in_object: 0,
        }
    }

    pub fn application(buttonless: SimulatedButtonless) -> Self {
        Self {
            buttonless: Some(buttonless),
            ..Self::bootloader()
        }
    }

    pub fn advertising(mut self, id: &str, name: &str) -> Self {
        self.advertisers.push((
            PeripheralId::new(id),
            AdvertisementData {
                local_name: Some(name.to_string()),
                service_uuids: vec![SECURE_DFU_SERVICE],
            },
        ));
        self
    }

    /// Control Point values written, in order
    pub fn control_point_writes(&self) -> Vec<Vec<u8>> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                TransportCall::Write {
                    characteristic,
                    value,
                    ..
                } if *characteristic == SECURE_DFU_CONTROL_POINT => Some(value.clone()),
                _ => None,
            })
            .collect()
    }

    fn emit(&mut self, event: GattEvent) {
        self.pending.push_back(event);
    }

    fn respond(&mut self, characteristic: Uuid, value: Vec<u8>) {
        self.emit(GattEvent::ValueUpdated {
            characteristic,
            result: Ok(value),
        });
    }

    fn success(&mut self, request: u8, payload: &[u32]) {
        let mut value = vec![0x60, request, 0x01];
        for field in payload {
            value.extend_from_slice(&field.to_le_bytes());
        }
        self.respond(SECURE_DFU_CONTROL_POINT, value);
    }

    fn reset(&mut self, reason: &str) {
        self.prn = 0;
        self.command.clear();
        self.data.clear();
        self.executed = 0;
        self.emit(GattEvent::Disconnected {
            reason: Some(reason.to_string()),
        });
    }

    fn on_buttonless(&mut self, characteristic: Uuid, value: &[u8]) {
        self.emit(GattEvent::WriteCompleted {
            characteristic,
            result: Ok(()),
        });
        match value {
            [0x01] => {
                self.respond(characteristic, vec![0x20, 0x01, 0x01]);
                self.buttonless = None;
                self.reset("jumped to bootloader");
            }
            [0x02, _, name @ ..] if !self.set_name_unsupported => {
                self.bootloader_name = Some(String::from_utf8_lossy(name).into_owned());
                self.respond(characteristic, vec![0x20, 0x02, 0x01]);
            }
            [op, ..] => self.respond(characteristic, vec![0x20, *op, 0x02]),
            [] => {}
        }
    }

    fn on_control_point(&mut self, value: &[u8]) {
        self.emit(GattEvent::WriteCompleted {
            characteristic: SECURE_DFU_CONTROL_POINT,
            result: Ok(()),
        });

        match value {
            [0x01, 0x01, ..] => {
                self.selected = Selected::Command;
                self.command.clear();
                self.success(0x01, &[]);
            }
            [0x01, 0x02, ..] => {
                self.selected = Selected::Data;
                self.data.truncate(self.executed);
                self.packets_in_object = 0;
                self.success(0x01, &[]);
            }
            [0x02, lo, hi] => {
                self.prn = u16::from_le_bytes([*lo, *hi]);
                self.success(0x02, &[]);
            }
            [0x03] => {
                let (offset, mut crc) = match self.selected {
                    Selected::Command => (self.command.len(), crc32(&self.command)),
                    Selected::Data => (self.data.len(), crc32(&self.data)),
                };
                if self.selected == Selected::Data && self.corrupt_checksums > 0 {
                    self.corrupt_checksums -= 1;
                    crc ^= 1;
                }
                self.success(0x03, &[offset as u32, crc]);
            }
            [0x04] => self.execute(),
            [0x06, 0x01] => {
                self.selected = Selected::Command;
                let crc = crc32(&self.command);
                self.success(0x06, &[256, self.command.len() as u32, crc]);
            }
            [0x06, 0x02] => {
                self.selected = Selected::Data;
                let crc = crc32(&self.data);
                self.success(0x06, &[self.max_object_size, self.data.len() as u32, crc]);
            }
            [op, ..] => self.respond(SECURE_DFU_CONTROL_POINT, vec![0x60, *op, 0x02]),
            [] => {}
        }
    }

    fn execute(&mut self) {
        match self.selected {
            Selected::Command => {
                self.image_len = self
                    .command
                    .get(..4)
                    .map_or(0, |b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize);
                self.success(0x04, &[]);
            }
            Selected::Data => {
                self.executed = self.data.len();
                self.success(0x04, &[]);
                if self.executed >= self.image_len {
                    self.activations += 1;
                    self.images.push(self.data.clone());
                    self.reset("activated");
                }
            }
        }
    }

    fn on_packet(&mut self, value: &[u8]) {
        match self.selected {
            Selected::Command => self.command.extend_from_slice(value),
            Selected::Data => {
                self.data.extend_from_slice(value);
                self.packets_in_object += 1;
                if self.prn > 0 && self.packets_in_object % self.prn as usize == 0 {
                    let crc = crc32(&self.data);
                    self.success(0x03, &[self.data.len() as u32, crc]);
                }
            }
        }
    }
}

impl Simulation for SecureSimulatedDevice {
    fn next_event(&mut self) -> Option<GattEvent> {
        self.pending.pop_front()
    }
}

impl GattTransport for SecureSimulatedDevice {
    fn connect(&mut self, peripheral: &PeripheralId) {
        self.calls.push(TransportCall::Connect(peripheral.clone()));
        self.emit(GattEvent::Connected);
    }

    fn disconnect(&mut self) {
        self.calls.push(TransportCall::Disconnect);
        self.emit(GattEvent::Disconnected { reason: None });
    }

    fn discover_services(&mut self) {
        self.calls.push(TransportCall::DiscoverServices);
        let services = match self.buttonless {
            Some(SimulatedButtonless::Experimental) => {
                vec![HEART_RATE_SERVICE, BUTTONLESS_EXPERIMENTAL_SERVICE]
            }
            Some(_) => vec![HEART_RATE_SERVICE, SECURE_DFU_SERVICE],
            None => vec![SECURE_DFU_SERVICE],
        };
        self.emit(GattEvent::ServicesDiscovered(Ok(services)));
    }

    fn discover_characteristics(&mut self, service: Uuid) {
        self.calls.push(TransportCall::DiscoverCharacteristics(service));
        let uuids = match self.buttonless {
            Some(buttonless) => vec![buttonless.uuid()],
            None => vec![SECURE_DFU_CONTROL_POINT, SECURE_DFU_PACKET],
        };
        let characteristics = uuids
            .into_iter()
            .map(|uuid| Characteristic::new(uuid, CharacteristicProperties::default()))
            .collect();
        self.emit(GattEvent::CharacteristicsDiscovered {
            service,
            result: Ok(characteristics),
        });
    }

    fn read(&mut self, characteristic: Uuid) {
        self.calls.push(TransportCall::Read(characteristic));
        self.emit(GattEvent::ValueRead {
            characteristic,
            result: Err("read not permitted".to_string()),
        });
    }

    fn write(&mut self, characteristic: Uuid, value: &[u8], kind: WriteKind) {
        self.calls.push(TransportCall::Write {
            characteristic,
            value: value.to_vec(),
            kind,
        });
        if characteristic == SECURE_DFU_CONTROL_POINT {
            self.on_control_point(value);
        } else if characteristic == SECURE_DFU_PACKET {
            self.on_packet(value);
        } else if self.buttonless.map(SimulatedButtonless::uuid) == Some(characteristic) {
            self.on_buttonless(characteristic, value);
        }
    }

    fn enable_notifications(&mut self, characteristic: Uuid) {
        self.calls
            .push(TransportCall::EnableNotifications(characteristic));
        self.emit(GattEvent::NotificationStateUpdated {
            characteristic,
            result: Ok(()),
        });
    }

    fn maximum_write_length(&self, _kind: WriteKind) -> usize {
        self.max_write_length
    }

    fn scan(&mut self, services: &[Uuid]) {
        self.calls.push(TransportCall::Scan(services.to_vec()));
        let advertisers = self.advertisers.clone();
        for (peripheral, advertisement) in advertisers {
            self.emit(GattEvent::Discovered {
                peripheral,
                advertisement,
                rssi: -55,
            });
        }
    }

    fn stop_scan(&mut self) {
        self.calls.push(TransportCall::StopScan);
    }
}
