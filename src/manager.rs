//! ConnectionManager: registry of managed connections
//!
//! Owns one `Connection` per peripheral address, forwards scanner
//! advertisements to them, and offers bulk lifecycle operations.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, RwLock};

use crate::ble::transport::{BleAddress, BleCentral, ScanRecord};
use crate::connection::config::ConnectionConfig;
use crate::connection::{Connection, ConnectionState};
use crate::events::{ConnectFailReason, ConnectionEvent, EventSink, MainContextHandle};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

pub struct ConnectionManager {
    central: Arc<dyn BleCentral>,
    sink: Arc<dyn EventSink>,
    main_context: Option<MainContextHandle>,
    connections: RwLock<HashMap<BleAddress, Connection>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ConnectionManager {
    pub fn new(central: Arc<dyn BleCentral>, sink: Arc<dyn EventSink>) -> Arc<Self> {
        Self::build(central, sink, None)
    }

    /// Like `new`, with a main context for `Dispatch::MainContext` callbacks.
    pub fn with_main_context(
        central: Arc<dyn BleCentral>,
        sink: Arc<dyn EventSink>,
        main_context: MainContextHandle,
    ) -> Arc<Self> {
        Self::build(central, sink, Some(main_context))
    }

    fn build(
        central: Arc<dyn BleCentral>,
        sink: Arc<dyn EventSink>,
        main_context: Option<MainContextHandle>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        Arc::new(Self {
            central,
            sink,
            main_context,
            connections: RwLock::new(HashMap::new()),
            shutdown_tx,
        })
    }

    /// Open a managed connection to `address`.
    ///
    /// A malformed address emits `ConnectFailed` with `UnspecifiedAddress`
    /// and returns an error. An existing connection to the same address is
    /// released silently and replaced.
    pub async fn connect(
        &self,
        address: &str,
        config: ConnectionConfig,
    ) -> Result<Connection, ConnectError> {
        let address: BleAddress = match address.parse() {
            Ok(address) => address,
            Err(e) => {
                log::error!("connect failed! [type: unspecified address, address: {:?}]", address);
                self.sink.emit(ConnectionEvent::ConnectFailed {
                    device: None,
                    reason: ConnectFailReason::UnspecifiedAddress,
                });
                return Err(ConnectError::InvalidAddress(e.to_string()));
            }
        };

        let connection = Connection::open(
            address,
            config,
            Arc::clone(&self.central),
            Arc::clone(&self.sink),
            self.main_context.clone(),
        );
        let previous = self
            .connections
            .write()
            .await
            .insert(address, connection.clone());
        if let Some(previous) = previous {
            log::debug!("replacing connection [addr: {}]", address);
            previous.release_silently();
        }
        Ok(connection)
    }

    pub async fn connection(&self, address: &BleAddress) -> Option<Connection> {
        self.connections.read().await.get(address).cloned()
    }

    pub async fn connections(&self) -> Vec<Connection> {
        self.connections.read().await.values().cloned().collect()
    }

    /// State of the connection to `address`, or `Disconnected` if there is
    /// none.
    pub async fn connection_state(&self, address: &BleAddress) -> ConnectionState {
        self.connection(address)
            .await
            .map(|c| c.state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub async fn disconnect(&self, address: &BleAddress) {
        if let Some(connection) = self.connection(address).await {
            connection.disconnect();
        }
    }

    pub async fn disconnect_all(&self) {
        for connection in self.connections().await {
            connection.disconnect();
        }
    }

    /// Release the connection to `address` and forget it.
    pub async fn release(&self, address: &BleAddress) {
        if let Some(connection) = self.connections.write().await.remove(address) {
            connection.release();
        }
    }

    pub async fn release_all(&self) {
        let drained: Vec<Connection> = self
            .connections
            .write()
            .await
            .drain()
            .map(|(_, connection)| connection)
            .collect();
        for connection in drained {
            connection.release();
        }
    }

    pub async fn reconnect(&self, address: &BleAddress) {
        if let Some(connection) = self.connection(address).await {
            connection.reconnect();
        }
    }

    /// Reconnect every connection that is not already ready.
    pub async fn reconnect_all(&self) {
        for connection in self.connections().await {
            if connection.state() != ConnectionState::ServiceDiscovered {
                connection.reconnect();
            }
        }
    }

    pub async fn refresh(&self, address: &BleAddress) {
        if let Some(connection) = self.connection(address).await {
            connection.refresh();
        }
    }

    pub async fn set_auto_reconnect(&self, address: &BleAddress, enabled: bool) {
        if let Some(connection) = self.connection(address).await {
            connection.set_auto_reconnect(enabled);
        }
    }

    pub async fn set_auto_reconnect_all(&self, enabled: bool) {
        for connection in self.connections().await {
            connection.set_auto_reconnect(enabled);
        }
    }

    /// Route an advertisement to the connection for its address.
    pub async fn on_scan_result(&self, record: ScanRecord) {
        if let Some(connection) = self.connection(&record.address).await {
            connection.on_scan_result(record);
        }
    }

    /// Forward the central's advertisements to the managed connections
    /// until `shutdown` is called.
    pub fn attach_scanner(self: &Arc<Self>) {
        let mut adverts = self.central.advertisements();
        let mut shutdown = self.shutdown_tx.subscribe();
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = adverts.recv() => match result {
                        Ok(record) => manager.on_scan_result(record).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            log::warn!("scanner lagged, {} advertisements dropped", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown.recv() => break,
                }
            }
            log::debug!("scanner detached");
        });
    }

    /// Stop the scanner task and release every connection.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        self.release_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::simulated::{SimCentral, SimPeripheral};
    use crate::events::BroadcastSink;

    #[tokio::test]
    async fn test_malformed_address_emits_connect_failed() {
        let sink = Arc::new(BroadcastSink::default());
        let mut events = sink.subscribe();
        let manager = ConnectionManager::new(Arc::new(SimCentral::new()), sink);

        let err = manager
            .connect("aa:bb:cc:dd:ee:ff", ConnectionConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::InvalidAddress(_)));

        match events.recv().await.unwrap() {
            ConnectionEvent::ConnectFailed { device, reason } => {
                assert!(device.is_none());
                assert_eq!(reason, ConnectFailReason::UnspecifiedAddress);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_replaces_existing() {
        let central = SimCentral::new();
        let address: BleAddress = "AA:BB:CC:DD:EE:02".parse().unwrap();
        central.add_peripheral(SimPeripheral::new(address));
        let manager = ConnectionManager::new(Arc::new(central), Arc::new(BroadcastSink::default()));

        let first = manager
            .connect("AA:BB:CC:DD:EE:02", ConnectionConfig::default())
            .await
            .unwrap();
        let _second = manager
            .connect("AA:BB:CC:DD:EE:02", ConnectionConfig::default())
            .await
            .unwrap();

        let mut rx = first.subscribe_device();
        while rx.borrow_and_update().state != ConnectionState::Released {
            rx.changed().await.unwrap();
        }
        assert_eq!(manager.connections().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_address_state() {
        let manager =
            ConnectionManager::new(Arc::new(SimCentral::new()), Arc::new(BroadcastSink::default()));
        let address: BleAddress = "01:02:03:04:05:06".parse().unwrap();
        assert_eq!(manager.connection_state(&address).await, ConnectionState::Disconnected);
        assert!(manager.connection(&address).await.is_none());
    }
}
