use std::collections::VecDeque;

use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use super::TransportCall;
use crate::dfu::uuids::{LEGACY_DFU_CONTROL_POINT, LEGACY_DFU_PACKET, LEGACY_DFU_SERVICE, LEGACY_DFU_VERSION};
use crate::dfu::{
    AdvertisementData, Characteristic, CharacteristicProperties, GattEvent, GattTransport,
    PeripheralId, WriteKind,
};

pub(super) const HEART_RATE_SERVICE: Uuid =
    Uuid::from_u128(0x0000180D_0000_1000_8000_00805F9B34FB);

/// A simulated peripheral queuing the events it answers with.
pub trait Simulation: GattTransport {
    fn next_event(&mut self) -> Option<GattEvent>;
}

/// In-memory Legacy DFU peripheral answering every request with the events
/// a real one would send.
///
/// Events are queued for [`Simulation::next_event`], or forwarded to a
/// channel when built with [`with_sender`](Self::with_sender).
pub struct SimulatedDevice {
    pub calls: Vec<TransportCall>,
    /// Bootloader version; `None` for a pre-SDK 7 bootloader.
    pub bootloader_version: Option<[u8; 2]>,
    /// Running an application with buttonless update (version 0.1).
    pub in_application: bool,
    /// Answer the next Start DFU with this status instead of Success.
    pub start_status: Option<u8>,
    /// Advertisers reported when scanning.
    pub advertisers: Vec<(PeripheralId, AdvertisementData)>,
    pub activations: usize,
    pub images: Vec<usize>,
    pending: VecDeque<GattEvent>,
    sender: Option<UnboundedSender<GattEvent>>,
    prn: u16,
    expecting_sizes: bool,
    expecting_legacy_init: bool,
    image_len: usize,
    streaming: bool,
    received: usize,
    packets: usize,
}

impl SimulatedDevice {
    pub fn bootloader(version: Option<[u8; 2]>) -> Self {
        Self {
            calls: Vec::new(),
            bootloader_version: version,
            in_application: false,
            start_status: None,
            advertisers: Vec::new(),
            activations: 0,
            images: Vec::new(),
            pending: VecDeque::new(),
            sender: None,
            prn: 0,
            expecting_sizes: false,
            expecting_legacy_init: false,
            image_len: 0,
            streaming: false,
            received: 0,
            packets: 0,
        }
    }

    /// Application with buttonless jump into a bootloader of the given version.
    pub fn application(version: [u8; 2]) -> Self {
        Self {
            in_application: true,
            ..Self::bootloader(Some(version))
        }
    }

    pub fn with_sender(mut self, sender: UnboundedSender<GattEvent>) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn advertising(mut self, id: &str, name: &str) -> Self {
        self.advertisers.push((
            PeripheralId::new(id),
            AdvertisementData {
                local_name: Some(name.to_string()),
                service_uuids: vec![LEGACY_DFU_SERVICE],
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
                } if *characteristic == LEGACY_DFU_CONTROL_POINT => Some(value.clone()),
                _ => None,
            })
            .collect()
    }

    fn emit(&mut self, event: GattEvent) {
        match &self.sender {
            Some(sender) => {
                let _ = sender.send(event);
            }
            None => self.pending.push_back(event),
        }
    }

    fn notify(&mut self, value: Vec<u8>) {
        self.emit(GattEvent::ValueUpdated {
            characteristic: LEGACY_DFU_CONTROL_POINT,
            result: Ok(value),
        });
    }

    fn reset(&mut self, reason: &str) {
        self.streaming = false;
        self.expecting_sizes = false;
        self.expecting_legacy_init = false;
        self.emit(GattEvent::Disconnected {
            reason: Some(reason.to_string()),
        });
    }

    fn on_control_point(&mut self, value: &[u8]) {
        self.emit(GattEvent::WriteCompleted {
            characteristic: LEGACY_DFU_CONTROL_POINT,
            result: Ok(()),
        });

        match value {
            [0x01, ..] if self.in_application => {
                self.in_application = false;
                self.reset("jumped to bootloader");
            }
            [0x01, ..] => self.expecting_sizes = true,
            [0x02, 0x01] => self.notify(vec![0x10, 0x02, 0x01]),
            [0x02] => self.expecting_legacy_init = true,
            [0x03] => {
                self.streaming = true;
                self.received = 0;
                self.packets = 0;
            }
            [0x04] => self.notify(vec![0x10, 0x04, 0x01]),
            [0x05] => {
                self.activations += 1;
                self.reset("activated");
            }
            [0x06] => self.reset("reset"),
            [0x08, lo, hi] => self.prn = u16::from_le_bytes([*lo, *hi]),
            _ => {}
        }
    }

    fn on_packet(&mut self, value: &[u8]) {
        if self.expecting_sizes {
            self.expecting_sizes = false;
            self.image_len = value
                .chunks_exact(4)
                .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize)
                .sum();
            let status = self.start_status.take().unwrap_or(0x01);
            self.notify(vec![0x10, 0x01, status]);
        } else if self.streaming {
            self.received += value.len();
            self.packets += 1;
            if self.received >= self.image_len {
                self.streaming = false;
                self.images.push(self.received);
                self.notify(vec![0x10, 0x03, 0x01]);
            } else if self.prn > 0 && self.packets % self.prn as usize == 0 {
                let mut receipt = vec![0x11];
                receipt.extend_from_slice(&(self.received as u32).to_le_bytes());
                self.notify(receipt);
            }
        } else if self.expecting_legacy_init {
            self.expecting_legacy_init = false;
            self.notify(vec![0x10, 0x02, 0x01]);
        }
    }
}

impl Simulation for SimulatedDevice {
    fn next_event(&mut self) -> Option<GattEvent> {
        self.pending.pop_front()
    }
}

impl GattTransport for SimulatedDevice {
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
        let services = if self.in_application {
            vec![LEGACY_DFU_SERVICE, HEART_RATE_SERVICE]
        } else {
            vec![LEGACY_DFU_SERVICE]
        };
        self.emit(GattEvent::ServicesDiscovered(Ok(services)));
    }

    fn discover_characteristics(&mut self, service: Uuid) {
        self.calls.push(TransportCall::DiscoverCharacteristics(service));
        let mut uuids = vec![LEGACY_DFU_CONTROL_POINT, LEGACY_DFU_PACKET];
        if self.bootloader_version.is_some() {
            uuids.push(LEGACY_DFU_VERSION);
        }
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
        let value = match (self.in_application, self.bootloader_version) {
            (true, _) => Ok(vec![0x01, 0x00]),
            (false, Some(version)) => Ok(version.to_vec()),
            (false, None) => Err("attribute not found".to_string()),
        };
        self.emit(GattEvent::ValueRead {
            characteristic,
            result: value,
        });
    }

    fn write(&mut self, characteristic: Uuid, value: &[u8], kind: WriteKind) {
        self.calls.push(TransportCall::Write {
            characteristic,
            value: value.to_vec(),
            kind,
        });
        if characteristic == LEGACY_DFU_CONTROL_POINT {
            self.on_control_point(value);
        } else if characteristic == LEGACY_DFU_PACKET {
            self.on_packet(value);
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
        20
    }

    fn scan(&mut self, services: &[Uuid]) {
        self.calls.push(TransportCall::Scan(services.to_vec()));
        let advertisers = self.advertisers.clone();
        for (peripheral, advertisement) in advertisers {
            self.emit(GattEvent::Discovered {
                peripheral,
                advertisement,
                rssi: -60,
            });
        }
    }

    fn stop_scan(&mut self) {
        self.calls.push(TransportCall::StopScan);
    }
}
