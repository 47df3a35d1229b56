//! GATT UUIDs of the DFU services and characteristics.
//!
//! [`DfuUuids`] is built once, optionally with overrides for devices that
//! ship the DFU service under non-standard UUIDs, and is read-only afterwards.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The Bluetooth Base UUID used to expand 16-bit assigned numbers.
const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;

/// Expand a 16-bit Bluetooth SIG assigned number into a full UUID.
pub const fn uuid_from_u16(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

pub const LEGACY_DFU_SERVICE: Uuid = Uuid::from_u128(0x00001530_1212_EFDE_1523_785FEABCD123);
pub const LEGACY_DFU_CONTROL_POINT: Uuid = Uuid::from_u128(0x00001531_1212_EFDE_1523_785FEABCD123);
pub const LEGACY_DFU_PACKET: Uuid = Uuid::from_u128(0x00001532_1212_EFDE_1523_785FEABCD123);
pub const LEGACY_DFU_VERSION: Uuid = Uuid::from_u128(0x00001534_1212_EFDE_1523_785FEABCD123);

pub const SECURE_DFU_SERVICE: Uuid = uuid_from_u16(0xFE59);
pub const SECURE_DFU_CONTROL_POINT: Uuid = Uuid::from_u128(0x8EC90001_F315_4F60_9FB8_838830DAEA50);
pub const SECURE_DFU_PACKET: Uuid = Uuid::from_u128(0x8EC90002_F315_4F60_9FB8_838830DAEA50);

/// Experimental buttonless service; the characteristic shares its UUID.
pub const BUTTONLESS_EXPERIMENTAL_SERVICE: Uuid =
    Uuid::from_u128(0x8E400001_F315_4F60_9FB8_838830DAEA50);
pub const BUTTONLESS_EXPERIMENTAL_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x8E400001_F315_4F60_9FB8_838830DAEA50);
pub const BUTTONLESS_WITHOUT_BONDS: Uuid = Uuid::from_u128(0x8EC90003_F315_4F60_9FB8_838830DAEA50);
pub const BUTTONLESS_WITH_BONDS: Uuid = Uuid::from_u128(0x8EC90004_F315_4F60_9FB8_838830DAEA50);

/// Every UUID slot that can be overridden.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UuidRole {
    LegacyService,
    LegacyControlPoint,
    LegacyPacket,
    LegacyVersion,
    SecureService,
    SecureControlPoint,
    SecurePacket,
    ButtonlessExperimentalService,
    ButtonlessExperimentalCharacteristic,
    ButtonlessWithoutBonds,
    ButtonlessWithBonds,
}

/// A single UUID replacement, as stored in settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UuidOverride {
    pub role: UuidRole,
    pub uuid: Uuid,
}

/// Immutable set of DFU UUIDs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfuUuids {
    legacy_service: Uuid,
    legacy_control_point: Uuid,
    legacy_packet: Uuid,
    legacy_version: Uuid,
    secure_service: Uuid,
    secure_control_point: Uuid,
    secure_packet: Uuid,
    buttonless_experimental_service: Uuid,
    buttonless_experimental_characteristic: Uuid,
    buttonless_without_bonds: Uuid,
    buttonless_with_bonds: Uuid,
}

impl Default for DfuUuids {
    fn default() -> Self {
        Self {
            legacy_service: LEGACY_DFU_SERVICE,
            legacy_control_point: LEGACY_DFU_CONTROL_POINT,
            legacy_packet: LEGACY_DFU_PACKET,
            legacy_version: LEGACY_DFU_VERSION,
            secure_service: SECURE_DFU_SERVICE,
            secure_control_point: SECURE_DFU_CONTROL_POINT,
            secure_packet: SECURE_DFU_PACKET,
            buttonless_experimental_service: BUTTONLESS_EXPERIMENTAL_SERVICE,
            buttonless_experimental_characteristic: BUTTONLESS_EXPERIMENTAL_CHARACTERISTIC,
            buttonless_without_bonds: BUTTONLESS_WITHOUT_BONDS,
            buttonless_with_bonds: BUTTONLESS_WITH_BONDS,
        }
    }
}

impl DfuUuids {
    /// Start from the default UUIDs and override selected roles.
    pub fn builder() -> DfuUuidsBuilder {
        DfuUuidsBuilder {
            uuids: DfuUuids::default(),
        }
    }

    /// Default UUIDs with every override in `overrides` applied in order.
    pub fn with_overrides(overrides: &[UuidOverride]) -> Self {
        overrides
            .iter()
            .fold(Self::builder(), |builder, o| builder.set(o.role, o.uuid))
            .build()
    }

    /// Look up the UUID configured for a role.
    pub fn get(&self, role: UuidRole) -> Uuid {
        match role {
            UuidRole::LegacyService => self.legacy_service,
            UuidRole::LegacyControlPoint => self.legacy_control_point,
            UuidRole::LegacyPacket => self.legacy_packet,
            UuidRole::LegacyVersion => self.legacy_version,
            UuidRole::SecureService => self.secure_service,
            UuidRole::SecureControlPoint => self.secure_control_point,
            UuidRole::SecurePacket => self.secure_packet,
            UuidRole::ButtonlessExperimentalService => self.buttonless_experimental_service,
            UuidRole::ButtonlessExperimentalCharacteristic => {
                self.buttonless_experimental_characteristic
            }
            UuidRole::ButtonlessWithoutBonds => self.buttonless_without_bonds,
            UuidRole::ButtonlessWithBonds => self.buttonless_with_bonds,
        }
    }

    pub fn legacy_service(&self) -> Uuid {
        self.legacy_service
    }

    pub fn legacy_control_point(&self) -> Uuid {
        self.legacy_control_point
    }

    pub fn legacy_packet(&self) -> Uuid {
        self.legacy_packet
    }

    pub fn legacy_version(&self) -> Uuid {
        self.legacy_version
    }

    pub fn secure_service(&self) -> Uuid {
        self.secure_service
    }

    pub fn secure_control_point(&self) -> Uuid {
        self.secure_control_point
    }

    pub fn secure_packet(&self) -> Uuid {
        self.secure_packet
    }

    pub fn is_legacy_service(&self, uuid: &Uuid) -> bool {
        *uuid == self.legacy_service
    }

    pub fn is_secure_service(&self, uuid: &Uuid) -> bool {
        *uuid == self.secure_service
    }

    /// Matches the experimental buttonless service only; the bonded and
    /// unbonded variants live inside the Secure DFU service.
    pub fn is_buttonless_experimental_service(&self, uuid: &Uuid) -> bool {
        *uuid == self.buttonless_experimental_service
    }

    /// Services to scan for when looking for a device in bootloader mode.
    pub fn dfu_services(&self) -> Vec<Uuid> {
        vec![self.legacy_service, self.secure_service]
    }
}

/// Builder applying overrides on top of the default UUIDs.
#[derive(Debug, Clone)]
pub struct DfuUuidsBuilder {
    uuids: DfuUuids,
}

impl DfuUuidsBuilder {
    pub fn set(mut self, role: UuidRole, uuid: Uuid) -> Self {
        let slot = match role {
            UuidRole::LegacyService => &mut self.uuids.legacy_service,
            UuidRole::LegacyControlPoint => &mut self.uuids.legacy_control_point,
            UuidRole::LegacyPacket => &mut self.uuids.legacy_packet,
            UuidRole::LegacyVersion => &mut self.uuids.legacy_version,
            UuidRole::SecureService => &mut self.uuids.secure_service,
            UuidRole::SecureControlPoint => &mut self.uuids.secure_control_point,
            UuidRole::SecurePacket => &mut self.uuids.secure_packet,
            UuidRole::ButtonlessExperimentalService => {
                &mut self.uuids.buttonless_experimental_service
            }
            UuidRole::ButtonlessExperimentalCharacteristic => {
                &mut self.uuids.buttonless_experimental_characteristic
            }
            UuidRole::ButtonlessWithoutBonds => &mut self.uuids.buttonless_without_bonds,
            UuidRole::ButtonlessWithBonds => &mut self.uuids.buttonless_with_bonds,
        };
        *slot = uuid;
        self
    }

    pub fn build(self) -> DfuUuids {
        self.uuids
    }
}
