// Gattlink - managed BLE GATT connections

pub mod ble;
pub mod connection;
pub mod events;
pub mod manager;

pub use ble::gatt::{CharacteristicId, DescriptorId, GattStatus};
pub use ble::transport::{
    BleAddress, BleCentral, BondState, GattLink, Phy, PhyMask, PhyOptions, ScanRecord,
    TransportMode, WriteType,
};
pub use ble::BleError;
pub use connection::config::ConnectionConfig;
pub use connection::request::{
    FailReason, PhyPreference, Request, RequestCallback, RequestFailure, RequestKind,
    RequestResult, RequestSuccess,
};
pub use connection::{Connection, ConnectionState, Device};
pub use events::{ConnectionEvent, Dispatch, EventSink, MainContext};
pub use manager::{ConnectError, ConnectionManager};
