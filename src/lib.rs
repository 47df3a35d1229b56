//! Nordic DFU over Bluetooth LE.
//!
//! Updates the firmware of nRF5 devices running a Legacy DFU bootloader
//! (nRF5 SDK 11 and older) or a Secure DFU bootloader (SDK 12 and later),
//! including the buttonless jump from a running application. The platform
//! BLE stack stays outside of this crate: plug it in through
//! [`dfu::GattTransport`] and feed its completion events back as
//! [`dfu::GattEvent`]s.
//!
//! - [`dfu`]: firmware packages, the Legacy and Secure DFU protocols and
//!   their driver
//! - [`settings`]: persisted options of a DFU run
//! - [`traits`]: pluggable peripheral selection

pub mod dfu;
pub mod settings;
pub mod traits;

#[cfg(test)]
mod test_helpers;

pub use dfu::{DfuController, DfuError, DfuOutcome, DfuResult, DfuStage, FirmwareContainer};
pub use settings::{DfuSettings, SettingsManager};
