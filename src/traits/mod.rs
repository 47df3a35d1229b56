pub mod selector;

pub use selector::{DefaultPeripheralSelector, PeripheralSelector};
