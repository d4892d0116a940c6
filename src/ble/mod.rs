//! BLE transport layer for the GATT connection core
//!
//! Provides the abstract central/link traits the connection state machine
//! drives, the GATT data model, and a simulated transport for testing.

pub mod gatt;
pub mod simulated;
pub mod transport;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BleError {
    #[error("Bluetooth adapter is disabled")]
    AdapterDisabled,

    #[error("Operation not supported by this transport")]
    Unsupported,

    #[error("GATT error: {0}")]
    GattError(String),

    #[error("Payload exceeds MTU ({size} > {mtu})")]
    MtuExceeded { size: usize, mtu: usize },

    #[error("Peer disconnected")]
    Disconnected,
}
