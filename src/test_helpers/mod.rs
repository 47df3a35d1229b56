//! Builders, fakes and temp-dir management shared by unit tests.

mod fake;
mod fixtures;
mod secure_sim;
mod sim;
mod temp;

pub use fake::{RecordingTransport, TransportCall};
pub use fixtures::{hex_data_record, FirmwareZipBuilder};
pub use secure_sim::{SecureSimulatedDevice, SimulatedButtonless};
pub use sim::{SimulatedDevice, Simulation};
pub use temp::TestContext;
