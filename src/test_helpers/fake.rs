use uuid::Uuid;

use crate::dfu::config::LEGACY_PACKET_SIZE;
use crate::dfu::{GattTransport, PeripheralId, WriteKind};

/// A single request made to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Connect(PeripheralId),
    Disconnect,
    DiscoverServices,
    DiscoverCharacteristics(Uuid),
    Read(Uuid),
    Write {
        characteristic: Uuid,
        value: Vec<u8>,
        kind: WriteKind,
    },
    EnableNotifications(Uuid),
    Scan(Vec<Uuid>),
    StopScan,
}

/// Transport that records every call and never answers.
///
/// Tests feed the matching `GattEvent`s by hand.
pub struct RecordingTransport {
    pub calls: Vec<TransportCall>,
    pub max_write_length: usize,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self {
            calls: Vec::new(),
            max_write_length: LEGACY_PACKET_SIZE,
        }
    }

    /// Values written to one characteristic, in order
    pub fn writes_to(&self, characteristic: Uuid) -> Vec<Vec<u8>> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                TransportCall::Write {
                    characteristic: c,
                    value,
                    ..
                } if *c == characteristic => Some(value.clone()),
                _ => None,
            })
            .collect()
    }
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl GattTransport for RecordingTransport {
    fn connect(&mut self, peripheral: &PeripheralId) {
        self.calls.push(TransportCall::Connect(peripheral.clone()));
    }

    fn disconnect(&mut self) {
        self.calls.push(TransportCall::Disconnect);
    }

    fn discover_services(&mut self) {
        self.calls.push(TransportCall::DiscoverServices);
    }

    fn discover_characteristics(&mut self, service: Uuid) {
        self.calls.push(TransportCall::DiscoverCharacteristics(service));
    }

    fn read(&mut self, characteristic: Uuid) {
        self.calls.push(TransportCall::Read(characteristic));
    }

    fn write(&mut self, characteristic: Uuid, value: &[u8], kind: WriteKind) {
        self.calls.push(TransportCall::Write {
            characteristic,
            value: value.to_vec(),
            kind,
        });
    }

    fn enable_notifications(&mut self, characteristic: Uuid) {
        self.calls
            .push(TransportCall::EnableNotifications(characteristic));
    }

    fn maximum_write_length(&self, _kind: WriteKind) -> usize {
        self.max_write_length
    }

    fn scan(&mut self, services: &[Uuid]) {
        self.calls.push(TransportCall::Scan(services.to_vec()));
    }

    fn stop_scan(&mut self) {
        self.calls.push(TransportCall::StopScan);
    }
}
