//! GATT transport layer for DFU communication.
//!
//! Provides a trait-based abstraction over the platform BLE stack,
//! enabling both real adapters and mock testing.
//!
//! Every request is non-blocking. Its completion, or failure, comes back as
//! a [`GattEvent`] which the platform adapter delivers to the DFU driver.

#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Platform identifier of a peripheral (address or OS-assigned UUID).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeripheralId(pub String);

impl PeripheralId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// GATT write procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// Write Request, acknowledged by a [`GattEvent::WriteCompleted`].
    WithResponse,
    /// Write Command, never acknowledged.
    WithoutResponse,
}

/// Characteristic properties relevant to DFU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
}

/// A discovered characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Characteristic {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
}

impl Characteristic {
    pub fn new(uuid: Uuid, properties: CharacteristicProperties) -> Self {
        Self { uuid, properties }
    }
}

/// Advertising packet content used to pick a peripheral while scanning.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AdvertisementData {
    pub local_name: Option<String>,
    pub service_uuids: Vec<Uuid>,
}

/// Completion and notification events delivered by the platform adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum GattEvent {
    Connected,
    ConnectFailed {
        reason: String,
    },
    Disconnected {
        reason: Option<String>,
    },
    ServicesDiscovered(Result<Vec<Uuid>, String>),
    CharacteristicsDiscovered {
        service: Uuid,
        result: Result<Vec<Characteristic>, String>,
    },
    ValueRead {
        characteristic: Uuid,
        result: Result<Vec<u8>, String>,
    },
    NotificationStateUpdated {
        characteristic: Uuid,
        result: Result<(), String>,
    },
    WriteCompleted {
        characteristic: Uuid,
        result: Result<(), String>,
    },
    /// A notification, or the answer to a read of a notifying characteristic.
    ValueUpdated {
        characteristic: Uuid,
        result: Result<Vec<u8>, String>,
    },
    /// The outgoing Write Command queue has room again.
    ReadyToSendWriteWithoutResponse,
    Discovered {
        peripheral: PeripheralId,
        advertisement: AdvertisementData,
        rssi: i16,
    },
    BluetoothStateChanged {
        powered_on: bool,
    },
}

/// Trait for the platform BLE primitives used by DFU.
///
/// This abstraction allows for mocking in tests and any platform stack
/// (CoreBluetooth, BlueZ, WinRT) behind a thin adapter.
#[cfg_attr(test, automock)]
pub trait GattTransport: Send {
    /// Connect to a peripheral. Answered by `Connected` or `ConnectFailed`.
    fn connect(&mut self, peripheral: &PeripheralId);

    /// Cancel the connection. Answered by `Disconnected`.
    fn disconnect(&mut self);

    fn discover_services(&mut self);

    fn discover_characteristics(&mut self, service: Uuid);

    fn read(&mut self, characteristic: Uuid);

    fn write(&mut self, characteristic: Uuid, value: &[u8], kind: WriteKind);

    fn enable_notifications(&mut self, characteristic: Uuid);

    /// Largest value accepted by a single write of the given kind.
    fn maximum_write_length(&self, kind: WriteKind) -> usize;

    /// Scan for advertising peripherals exposing any of `services`.
    fn scan(&mut self, services: &[Uuid]);

    fn stop_scan(&mut self);
}

impl<T: GattTransport + ?Sized> GattTransport for Box<T> {
    fn connect(&mut self, peripheral: &PeripheralId) {
        (**self).connect(peripheral)
    }

    fn disconnect(&mut self) {
        (**self).disconnect()
    }

    fn discover_services(&mut self) {
        (**self).discover_services()
    }

    fn discover_characteristics(&mut self, service: Uuid) {
        (**self).discover_characteristics(service)
    }

    fn read(&mut self, characteristic: Uuid) {
        (**self).read(characteristic)
    }

    fn write(&mut self, characteristic: Uuid, value: &[u8], kind: WriteKind) {
        (**self).write(characteristic, value, kind)
    }

    fn enable_notifications(&mut self, characteristic: Uuid) {
        (**self).enable_notifications(characteristic)
    }

    fn maximum_write_length(&self, kind: WriteKind) -> usize {
        (**self).maximum_write_length(kind)
    }

    fn scan(&mut self, services: &[Uuid]) {
        (**self).scan(services)
    }

    fn stop_scan(&mut self) {
        (**self).stop_scan()
    }
}
