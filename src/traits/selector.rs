use uuid::Uuid;

use crate::dfu::{AdvertisementData, DfuUuids, PeripheralId};

/// Decides which scanned peripheral is the target after it rebooted into
/// the bootloader, possibly under a new address.
pub trait PeripheralSelector: Send {
    /// Return true to stop scanning and connect to `candidate`.
    ///
    /// `expected_name` is the advertising name the bootloader was asked to
    /// use, if any.
    fn select(
        &self,
        candidate: &PeripheralId,
        advertisement: &AdvertisementData,
        rssi: i16,
        expected_name: Option<&str>,
    ) -> bool;

    /// Service UUIDs to scan for.
    fn filter_by(&self, uuids: &DfuUuids) -> Vec<Uuid>;
}

/// Picks the first advertising DFU bootloader, or the one advertising the
/// expected name.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultPeripheralSelector;

impl PeripheralSelector for DefaultPeripheralSelector {
    fn select(
        &self,
        _candidate: &PeripheralId,
        advertisement: &AdvertisementData,
        _rssi: i16,
        expected_name: Option<&str>,
    ) -> bool {
        match (expected_name, advertisement.local_name.as_deref()) {
            (Some(expected), Some(name)) => expected == name,
            _ => true,
        }
    }

    fn filter_by(&self, uuids: &DfuUuids) -> Vec<Uuid> {
        uuids.dfu_services()
    }
}
