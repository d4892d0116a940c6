//! A managed link to one peripheral
//!
//! `Connection` is a cheap, cloneable handle. The link itself, the request
//! queue and the reconnect policy live on a task spawned by
//! [`Connection::open`]; handles talk to it over a channel and read its
//! latest [`Device`] snapshot from a watch channel.

pub mod config;
pub mod fragmenter;
mod machine;
pub mod queue;
pub mod request;
pub mod supervisor;

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};

use crate::ble::gatt::{CharacteristicId, DescriptorId};
use crate::ble::transport::{BleAddress, BleCentral, PhyMask, PhyOptions, ScanRecord, WriteType};
use crate::events::{Dispatcher, EventSink, MainContextHandle};

use self::config::ConnectionConfig;
use self::machine::{Command, Reporter};
use self::request::{FailReason, Request, RequestCallback, RequestKind, RequestResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Scanning,
    /// Link is up; services not yet discovered.
    Connected,
    ServiceDiscovering,
    /// Ready for requests.
    ServiceDiscovered,
    /// Terminal. The connection accepts nothing further.
    Released,
}

pub use crate::ble::transport::BondState;

/// What is known about the peripheral behind a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub address: BleAddress,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub state: ConnectionState,
    pub bond_state: BondState,
    /// When the peripheral was last seen advertising.
    pub last_seen: Option<DateTime<Utc>>,
}

impl Device {
    pub fn new(address: BleAddress) -> Self {
        Self {
            address,
            name: None,
            rssi: None,
            state: ConnectionState::Disconnected,
            bond_state: BondState::None,
            last_seen: None,
        }
    }
}

#[derive(Clone)]
pub struct Connection {
    address: BleAddress,
    commands: mpsc::UnboundedSender<Command>,
    device: watch::Receiver<Device>,
    reporter: Reporter,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Spawn the connection task and start connecting right away.
    ///
    /// Must be called from within a tokio runtime. Callbacks registered
    /// with `Dispatch::MainContext` go to `main_context`.
    pub fn open(
        address: BleAddress,
        config: ConnectionConfig,
        central: Arc<dyn BleCentral>,
        sink: Arc<dyn EventSink>,
        main_context: Option<MainContextHandle>,
    ) -> Self {
        let reporter = Reporter::new(sink, Dispatcher::new(main_context));
        let (commands, device) = machine::spawn(
            Device::new(address),
            config.normalized(),
            central,
            reporter.clone(),
        );
        Self {
            address,
            commands,
            device,
            reporter,
        }
    }

    pub fn address(&self) -> BleAddress {
        self.address
    }

    pub fn state(&self) -> ConnectionState {
        self.device.borrow().state
    }

    /// Latest snapshot of the peripheral.
    pub fn device(&self) -> Device {
        self.device.borrow().clone()
    }

    /// Watch every snapshot the connection publishes.
    pub fn subscribe_device(&self) -> watch::Receiver<Device> {
        self.device.clone()
    }

    /// Whether the connection task has stopped.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    fn send(&self, command: Command) -> bool {
        self.commands.send(command).is_ok()
    }

    /// Drop the link and stay down until `reconnect`.
    pub fn disconnect(&self) {
        self.send(Command::Disconnect);
    }

    /// Drop the link and connect again, with fresh retry counters.
    pub fn reconnect(&self) {
        self.send(Command::Reconnect);
    }

    /// Disconnect and invalidate the peripheral's cached service table.
    pub fn refresh(&self) {
        self.send(Command::Refresh);
    }

    /// Tear the connection down for good. Queued requests fail with
    /// `ConnectionReleased` and a final `Released` state is emitted.
    pub fn release(&self) {
        self.send(Command::Release { notify: true });
    }

    /// Like `release`, without the final state notification.
    pub fn release_silently(&self) {
        self.send(Command::Release { notify: false });
    }

    pub fn set_auto_reconnect(&self, enabled: bool) {
        self.send(Command::SetAutoReconnect(enabled));
    }

    /// Override the write type used for `target` on later writes.
    pub fn set_write_type(&self, target: CharacteristicId, write_type: WriteType) {
        self.send(Command::SetWriteType(target, write_type));
    }

    /// Queue a request. Its result goes to its callback, or to the event
    /// sink if it has none.
    ///
    /// A write with an empty payload is refused before it is queued.
    pub fn enqueue(&self, request: Request) {
        if request.kind() == RequestKind::WriteCharacteristic
            && request.payload().map_or(true, <[u8]>::is_empty)
        {
            log::warn!("refusing empty write [addr: {}]", self.address);
            let failure = request.failure(FailReason::ValueIsNullOrEmpty);
            self.reporter.deliver(&self.device(), request, Err(failure));
            return;
        }
        if let Err(mpsc::error::SendError(Command::Enqueue(request))) =
            self.commands.send(Command::Enqueue(request))
        {
            let failure = request.failure(FailReason::ConnectionReleased);
            self.reporter.deliver(&self.device(), request, Err(failure));
        }
    }

    /// Queue a request and wait for its result.
    ///
    /// Any callback already attached to `request` is replaced.
    pub async fn execute(&self, request: Request) -> RequestResult {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let fallback = request.failure(FailReason::ConnectionReleased);
        self.enqueue(request.with_callback(RequestCallback::new(move |result| {
            let sender = tx.lock().ok().and_then(|mut slot| slot.take());
            if let Some(sender) = sender {
                let _ = sender.send(result);
            }
        })));
        rx.await.unwrap_or(Err(fallback))
    }

    pub fn read_characteristic(&self, request_id: impl Into<String>, target: CharacteristicId) {
        self.enqueue(Request::read_characteristic(request_id, target));
    }

    pub fn write_characteristic(
        &self,
        request_id: impl Into<String>,
        target: CharacteristicId,
        value: impl Into<Vec<u8>>,
    ) {
        self.enqueue(Request::write_characteristic(request_id, target, value));
    }

    pub fn toggle_notification(
        &self,
        request_id: impl Into<String>,
        target: CharacteristicId,
        enable: bool,
    ) {
        self.enqueue(Request::toggle_notification(request_id, target, enable));
    }

    pub fn toggle_indication(
        &self,
        request_id: impl Into<String>,
        target: CharacteristicId,
        enable: bool,
    ) {
        self.enqueue(Request::toggle_indication(request_id, target, enable));
    }

    pub fn read_descriptor(&self, request_id: impl Into<String>, target: DescriptorId) {
        self.enqueue(Request::read_descriptor(request_id, target));
    }

    pub fn read_rssi(&self, request_id: impl Into<String>) {
        self.enqueue(Request::read_rssi(request_id));
    }

    pub fn change_mtu(&self, request_id: impl Into<String>, mtu: u16) {
        self.enqueue(Request::change_mtu(request_id, mtu));
    }

    pub fn read_phy(&self, request_id: impl Into<String>) {
        self.enqueue(Request::read_phy(request_id));
    }

    pub fn set_preferred_phy(
        &self,
        request_id: impl Into<String>,
        tx: PhyMask,
        rx: PhyMask,
        options: PhyOptions,
    ) {
        self.enqueue(Request::set_preferred_phy(request_id, tx, rx, options));
    }

    /// Drop every queued request without reporting them.
    pub fn clear_requests(&self) {
        self.send(Command::ClearRequests);
    }

    /// Drop queued requests of one kind without reporting them.
    pub fn clear_requests_by_kind(&self, kind: RequestKind) {
        self.send(Command::ClearRequestsByKind(kind));
    }

    /// Feed an advertisement seen by the scanner.
    pub fn on_scan_result(&self, record: ScanRecord) {
        self.send(Command::ScanResult(record));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::gatt::{uuid_from_short, GattCharacteristic, GattService};
    use crate::ble::simulated::{SimCentral, SimPeripheral};
    use crate::connection::request::RequestSuccess;
    use crate::events::BroadcastSink;

    fn addr() -> BleAddress {
        "AA:BB:CC:DD:EE:01".parse().unwrap()
    }

    fn target() -> CharacteristicId {
        CharacteristicId::new(uuid_from_short(0xFFE0), uuid_from_short(0xFFE1))
    }

    fn central() -> SimCentral {
        let central = SimCentral::new();
        central.add_peripheral(
            SimPeripheral::new(addr())
                .with_name("Sensor")
                .with_service(GattService::new(
                    target().service,
                    vec![GattCharacteristic::notifying(target().characteristic)],
                ))
                .with_value(target(), &[0x2A]),
        );
        central
    }

    async fn ready(conn: &Connection) {
        let mut rx = conn.subscribe_device();
        while rx.borrow_and_update().state != ConnectionState::ServiceDiscovered {
            rx.changed().await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_reaches_service_discovered() {
        let sink = Arc::new(BroadcastSink::default());
        let conn = Connection::open(
            addr(),
            ConnectionConfig::default(),
            Arc::new(central()),
            sink,
            None,
        );
        assert_eq!(conn.address(), addr());
        ready(&conn).await;
        assert_eq!(conn.state(), ConnectionState::ServiceDiscovered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_read() {
        let conn = Connection::open(
            addr(),
            ConnectionConfig::default(),
            Arc::new(central()),
            Arc::new(BroadcastSink::default()),
            None,
        );
        ready(&conn).await;
        let result = conn.execute(Request::read_characteristic("r", target())).await;
        assert_eq!(
            result,
            Ok(RequestSuccess::CharacteristicRead {
                target: target(),
                value: vec![0x2A]
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_write_refused_synchronously() {
        let conn = Connection::open(
            addr(),
            ConnectionConfig::default(),
            Arc::new(central()),
            Arc::new(BroadcastSink::default()),
            None,
        );
        let result = conn
            .execute(Request::write_characteristic("w", target(), Vec::new()))
            .await;
        assert_eq!(result.unwrap_err().reason, FailReason::ValueIsNullOrEmpty);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_after_release_are_refused() {
        let conn = Connection::open(
            addr(),
            ConnectionConfig::default(),
            Arc::new(central()),
            Arc::new(BroadcastSink::default()),
            None,
        );
        conn.release();
        let mut rx = conn.subscribe_device();
        while rx.borrow_and_update().state != ConnectionState::Released {
            rx.changed().await.unwrap();
        }
        let result = conn.execute(Request::read_rssi("late")).await;
        assert_eq!(result.unwrap_err().reason, FailReason::ConnectionReleased);
    }
}
