//! In-process BLE simulator
//!
//! Provides a simulated central and scripted peripherals so the connection
//! core can be exercised entirely in-process. Completions are delivered from
//! spawned tasks after the peripheral's configured latency, which runs on
//! tokio virtual time when the clock is paused in tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::gatt::{CharacteristicId, DescriptorId, GattService, GattStatus, DISABLE_NOTIFICATION_VALUE};
use super::transport::{
    BleAddress, BleCentral, BondState, EventSender, GattLink, LinkState, Phy, PhyMask, PhyOptions,
    ScanRecord, TransportEvent, TransportMode, WriteType,
};
use super::BleError;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One call made against the simulated stack, in submission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimOp {
    StartScan,
    StopScan,
    Connect(BleAddress),
    Disconnect,
    Close,
    DiscoverServices,
    ReadCharacteristic(CharacteristicId),
    WriteCharacteristic {
        target: CharacteristicId,
        value: Vec<u8>,
        write_type: WriteType,
    },
    ReadDescriptor(DescriptorId),
    WriteDescriptor {
        target: DescriptorId,
        value: Vec<u8>,
    },
    SetNotification {
        target: CharacteristicId,
        enable: bool,
    },
    RequestMtu(u16),
    ReadRssi,
    ReadPhy,
    SetPreferredPhy {
        tx: PhyMask,
        rx: PhyMask,
        options: PhyOptions,
    },
    InvalidateCache,
}

/// Scripted behaviour of one simulated peripheral.
#[derive(Debug, Clone)]
pub struct SimPeripheral {
    address: BleAddress,
    name: Option<String>,
    services: Vec<GattService>,
    values: HashMap<CharacteristicId, Vec<u8>>,
    descriptors: HashMap<DescriptorId, Vec<u8>>,
    failing: HashMap<CharacteristicId, GattStatus>,
    connectable: bool,
    responsive: bool,
    advertising: bool,
    empty_services_until_refresh: bool,
    link_status: GattStatus,
    latency: Duration,
    mtu: u16,
    rssi: i16,
    phys: PhyMask,
    bond_state: BondState,
    write_limit: Option<usize>,
}

impl SimPeripheral {
    pub fn new(address: BleAddress) -> Self {
        Self {
            address,
            name: None,
            services: Vec::new(),
            values: HashMap::new(),
            descriptors: HashMap::new(),
            failing: HashMap::new(),
            connectable: true,
            responsive: true,
            advertising: true,
            empty_services_until_refresh: false,
            link_status: GattStatus::SUCCESS,
            latency: Duration::ZERO,
            mtu: 247,
            rssi: -50,
            phys: PhyMask::LE_1M | PhyMask::LE_2M,
            bond_state: BondState::None,
            write_limit: None,
        }
    }

    pub fn address(&self) -> BleAddress {
        self.address
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn with_service(mut self, service: GattService) -> Self {
        self.services.push(service);
        self
    }

    /// Initial value returned by reads of `target`.
    pub fn with_value(mut self, target: CharacteristicId, value: &[u8]) -> Self {
        self.values.insert(target, value.to_vec());
        self
    }

    pub fn with_descriptor_value(mut self, target: DescriptorId, value: &[u8]) -> Self {
        self.descriptors.insert(target, value.to_vec());
        self
    }

    /// Reads and writes of `target` complete with `status`.
    pub fn with_failing_characteristic(mut self, target: CharacteristicId, status: GattStatus) -> Self {
        self.failing.insert(target, status);
        self
    }

    /// Accept link requests but never report the link coming up.
    pub fn unconnectable(mut self) -> Self {
        self.connectable = false;
        self
    }

    /// Accept request submissions but never complete them.
    pub fn unresponsive(mut self) -> Self {
        self.responsive = false;
        self
    }

    /// Stay silent during scans.
    pub fn hidden(mut self) -> Self {
        self.advertising = false;
        self
    }

    /// Report an empty service list until the service cache is invalidated.
    pub fn empty_services_until_refresh(mut self) -> Self {
        self.empty_services_until_refresh = true;
        self
    }

    /// Status carried by the link-up event. Anything but success reports the
    /// link as disconnected.
    pub fn with_link_status(mut self, status: GattStatus) -> Self {
        self.link_status = status;
        self
    }

    /// Set the simulated latency applied to every completion.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Largest MTU the peripheral will agree to.
    pub fn with_mtu(mut self, mtu: u16) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = rssi;
        self
    }

    /// PHYs the peripheral's controller supports.
    pub fn with_phys(mut self, phys: PhyMask) -> Self {
        self.phys = phys;
        self
    }

    pub fn with_bond_state(mut self, state: BondState) -> Self {
        self.bond_state = state;
        self
    }

    /// Accept `limit` characteristic writes, then refuse every further
    /// submission as if the stack's write queue were full.
    pub fn rejecting_writes_after(mut self, limit: usize) -> Self {
        self.write_limit = Some(limit);
        self
    }

    fn scan_record(&self) -> ScanRecord {
        ScanRecord {
            address: self.address,
            name: self.name.clone(),
            rssi: Some(self.rssi),
            data: Vec::new(),
        }
    }
}

/// Per-peripheral runtime state, shared by every link opened to it.
struct PeripheralState {
    script: SimPeripheral,
    cache_invalidated: bool,
    accepted_writes: usize,
    current_link: Option<Arc<LinkShared>>,
}

struct LinkShared {
    events: EventSender,
    open: AtomicBool,
    connected: AtomicBool,
    services: Mutex<Vec<GattService>>,
    /// (tx, rx) PHYs in use.
    phy: Mutex<(Phy, Phy)>,
}

impl LinkShared {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

struct SimInner {
    adv_tx: broadcast::Sender<ScanRecord>,
    peripherals: Mutex<HashMap<BleAddress, PeripheralState>>,
    scanning: AtomicBool,
    powered: AtomicBool,
    ops: Mutex<Vec<SimOp>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl SimInner {
    fn record(&self, op: SimOp) {
        log::trace!("sim: {:?}", op);
        lock(&self.ops).push(op);
    }

    fn begin_op(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn end_op(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn check_powered(&self) -> Result<(), BleError> {
        if self.powered.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BleError::AdapterDisabled)
        }
    }
}

/// Simulated central with a registry of scripted peripherals.
///
/// Cloning yields another handle onto the same simulated air, so a test can
/// keep inspecting the operation log after handing the central to a manager.
#[derive(Clone)]
pub struct SimCentral {
    inner: Arc<SimInner>,
}

impl Default for SimCentral {
    fn default() -> Self {
        Self::new()
    }
}

impl SimCentral {
    pub fn new() -> Self {
        let (adv_tx, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(SimInner {
                adv_tx,
                peripherals: Mutex::new(HashMap::new()),
                scanning: AtomicBool::new(false),
                powered: AtomicBool::new(true),
                ops: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }),
        }
    }

    /// Register (or replace) a peripheral.
    pub fn add_peripheral(&self, script: SimPeripheral) {
        let address = script.address;
        lock(&self.inner.peripherals).insert(
            address,
            PeripheralState {
                script,
                cache_invalidated: false,
                accepted_writes: 0,
                current_link: None,
            },
        );
    }

    pub fn set_powered(&self, powered: bool) {
        self.inner.powered.store(powered, Ordering::SeqCst);
    }

    pub fn set_connectable(&self, address: &BleAddress, connectable: bool) {
        if let Some(state) = lock(&self.inner.peripherals).get_mut(address) {
            state.script.connectable = connectable;
        }
    }

    pub fn set_responsive(&self, address: &BleAddress, responsive: bool) {
        if let Some(state) = lock(&self.inner.peripherals).get_mut(address) {
            state.script.responsive = responsive;
        }
    }

    /// Latency applied to completions submitted from now on.
    pub fn set_latency(&self, address: &BleAddress, latency: Duration) {
        if let Some(state) = lock(&self.inner.peripherals).get_mut(address) {
            state.script.latency = latency;
        }
    }

    /// Change the pairing state and report it over the live link, if any.
    pub fn set_bond_state(&self, address: &BleAddress, bond_state: BondState) -> bool {
        let link = match lock(&self.inner.peripherals).get_mut(address) {
            Some(state) => {
                state.script.bond_state = bond_state;
                state.current_link.clone()
            }
            None => return false,
        };
        match link {
            Some(link) if link.is_open() => link
                .events
                .send(TransportEvent::BondStateChanged { state: bond_state }),
            _ => false,
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.scanning.load(Ordering::SeqCst)
    }

    /// Broadcast one advertisement for `address` if a scan is running.
    pub fn advertise(&self, address: &BleAddress) -> bool {
        if !self.is_scanning() {
            return false;
        }
        let record = match lock(&self.inner.peripherals).get(address) {
            Some(state) => state.script.scan_record(),
            None => return false,
        };
        self.inner.adv_tx.send(record).is_ok()
    }

    /// Drop the live link to `address`, as if the peer went out of range.
    pub fn drop_link(&self, address: &BleAddress, status: GattStatus) -> bool {
        let link = lock(&self.inner.peripherals)
            .get_mut(address)
            .and_then(|state| state.current_link.take());
        match link {
            Some(link) if link.is_open() => {
                link.connected.store(false, Ordering::SeqCst);
                link.events.send(TransportEvent::LinkStateChanged {
                    status,
                    state: LinkState::Disconnected,
                })
            }
            _ => false,
        }
    }

    /// Push a notification from the peripheral over its live link.
    pub fn notify(&self, address: &BleAddress, target: CharacteristicId, value: &[u8]) -> bool {
        let link = lock(&self.inner.peripherals)
            .get(address)
            .and_then(|state| state.current_link.clone());
        match link {
            Some(link) if link.is_open() && link.connected.load(Ordering::SeqCst) => {
                link.events.send(TransportEvent::CharacteristicChanged {
                    target,
                    value: value.to_vec(),
                })
            }
            _ => false,
        }
    }

    /// Every operation submitted so far.
    pub fn ops(&self) -> Vec<SimOp> {
        lock(&self.inner.ops).clone()
    }

    pub fn count_ops(&self, predicate: impl Fn(&SimOp) -> bool) -> usize {
        lock(&self.inner.ops).iter().filter(|op| predicate(op)).count()
    }

    /// Payloads written to `target`, one entry per transport write call.
    pub fn writes_to(&self, target: &CharacteristicId) -> Vec<Vec<u8>> {
        lock(&self.inner.ops)
            .iter()
            .filter_map(|op| match op {
                SimOp::WriteCharacteristic { target: t, value, .. } if t == target => {
                    Some(value.clone())
                }
                _ => None,
            })
            .collect()
    }

    /// Highest number of simultaneously outstanding completions observed.
    pub fn max_in_flight(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn clear_ops(&self) {
        lock(&self.inner.ops).clear();
    }
}

#[async_trait]
impl BleCentral for SimCentral {
    async fn start_scan(&self) -> Result<(), BleError> {
        self.inner.check_powered()?;
        self.inner.record(SimOp::StartScan);
        self.inner.scanning.store(true, Ordering::SeqCst);
        let records: Vec<ScanRecord> = lock(&self.inner.peripherals)
            .values()
            .filter(|state| state.script.advertising)
            .map(|state| state.script.scan_record())
            .collect();
        for record in records {
            let _ = self.inner.adv_tx.send(record);
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        self.inner.record(SimOp::StopScan);
        self.inner.scanning.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn advertisements(&self) -> broadcast::Receiver<ScanRecord> {
        self.inner.adv_tx.subscribe()
    }

    fn bond_state(&self, address: &BleAddress) -> BondState {
        lock(&self.inner.peripherals)
            .get(address)
            .map(|state| state.script.bond_state)
            .unwrap_or_default()
    }

    async fn connect(
        &self,
        address: &BleAddress,
        _mode: TransportMode,
        phy: PhyMask,
        events: EventSender,
    ) -> Result<Box<dyn GattLink>, BleError> {
        self.inner.check_powered()?;
        self.inner.record(SimOp::Connect(*address));

        let supported = lock(&self.inner.peripherals)
            .get(address)
            .map(|state| state.script.phys)
            .unwrap_or_default();
        let initial = phy.intersect(supported).fastest();
        let shared = Arc::new(LinkShared {
            events,
            open: AtomicBool::new(true),
            connected: AtomicBool::new(false),
            services: Mutex::new(Vec::new()),
            phy: Mutex::new((initial, initial)),
        });
        let link = SimLink {
            address: *address,
            inner: Arc::clone(&self.inner),
            shared: Arc::clone(&shared),
        };

        let script = {
            let mut peripherals = lock(&self.inner.peripherals);
            match peripherals.get_mut(address) {
                Some(state) => {
                    state.current_link = Some(Arc::clone(&shared));
                    Some(state.script.clone())
                }
                None => None,
            }
        };

        // Unknown or unconnectable peers simply never come up.
        if let Some(script) = script.filter(|s| s.connectable) {
            let status = script.link_status;
            if status.is_success() {
                shared.connected.store(true, Ordering::SeqCst);
            }
            let state = if status.is_success() {
                LinkState::Connected
            } else {
                LinkState::Disconnected
            };
            link.complete(script.latency, TransportEvent::LinkStateChanged { status, state });
        }

        Ok(Box::new(link))
    }
}

/// A link to one simulated peripheral.
pub struct SimLink {
    address: BleAddress,
    inner: Arc<SimInner>,
    shared: Arc<LinkShared>,
}

impl SimLink {
    fn script(&self) -> Option<SimPeripheral> {
        lock(&self.inner.peripherals)
            .get(&self.address)
            .map(|state| state.script.clone())
    }

    fn ensure_connected(&self) -> Result<(), BleError> {
        self.inner.check_powered()?;
        if self.shared.is_open() && self.shared.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BleError::Disconnected)
        }
    }

    /// Deliver `event` after `latency` unless the link is closed by then.
    fn complete(&self, latency: Duration, event: TransportEvent) {
        let inner = Arc::clone(&self.inner);
        let shared = Arc::clone(&self.shared);
        inner.begin_op();
        tokio::spawn(async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            inner.end_op();
            if shared.is_open() {
                shared.events.send(event);
            }
        });
    }

    /// Complete a request-style operation, honouring the responsive knob.
    fn respond(&self, script: &SimPeripheral, event: TransportEvent) {
        if script.responsive {
            self.complete(script.latency, event);
        }
    }

    fn script_or_disconnected(&self) -> Result<SimPeripheral, BleError> {
        self.script().ok_or(BleError::Disconnected)
    }
}

#[async_trait]
impl GattLink for SimLink {
    async fn disconnect(&self) -> Result<(), BleError> {
        self.inner.record(SimOp::Disconnect);
        if !self.shared.is_open() {
            return Err(BleError::Disconnected);
        }
        self.shared.connected.store(false, Ordering::SeqCst);
        let latency = self.script().map(|s| s.latency).unwrap_or_default();
        self.complete(
            latency,
            TransportEvent::LinkStateChanged {
                status: GattStatus::SUCCESS,
                state: LinkState::Disconnected,
            },
        );
        Ok(())
    }

    async fn close(&self) {
        self.inner.record(SimOp::Close);
        self.shared.open.store(false, Ordering::SeqCst);
        self.shared.connected.store(false, Ordering::SeqCst);
        let mut peripherals = lock(&self.inner.peripherals);
        if let Some(state) = peripherals.get_mut(&self.address) {
            let is_current = state
                .current_link
                .as_ref()
                .map(|current| Arc::ptr_eq(current, &self.shared))
                .unwrap_or(false);
            if is_current {
                state.current_link = None;
            }
        }
    }

    async fn discover_services(&self) -> Result<(), BleError> {
        self.inner.record(SimOp::DiscoverServices);
        self.ensure_connected()?;
        let (script, cache_invalidated) = {
            let peripherals = lock(&self.inner.peripherals);
            let state = peripherals.get(&self.address).ok_or(BleError::Disconnected)?;
            (state.script.clone(), state.cache_invalidated)
        };
        let services = if script.empty_services_until_refresh && !cache_invalidated {
            Vec::new()
        } else {
            script.services.clone()
        };
        *lock(&self.shared.services) = services;
        self.complete(
            script.latency,
            TransportEvent::ServicesDiscovered {
                status: GattStatus::SUCCESS,
            },
        );
        Ok(())
    }

    fn services(&self) -> Vec<GattService> {
        lock(&self.shared.services).clone()
    }

    async fn read_characteristic(&self, target: &CharacteristicId) -> Result<(), BleError> {
        self.inner.record(SimOp::ReadCharacteristic(*target));
        self.ensure_connected()?;
        let script = self.script_or_disconnected()?;
        let status = script.failing.get(target).copied().unwrap_or(GattStatus::SUCCESS);
        let value = script.values.get(target).cloned().unwrap_or_default();
        self.respond(
            &script,
            TransportEvent::CharacteristicRead {
                status,
                target: *target,
                value,
            },
        );
        Ok(())
    }

    async fn write_characteristic(
        &self,
        target: &CharacteristicId,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), BleError> {
        self.inner.record(SimOp::WriteCharacteristic {
            target: *target,
            value: value.to_vec(),
            write_type,
        });
        self.ensure_connected()?;
        let script = self.script_or_disconnected()?;
        let mtu_payload = script.mtu.saturating_sub(3) as usize;
        if value.len() > mtu_payload {
            return Err(BleError::MtuExceeded {
                size: value.len(),
                mtu: mtu_payload,
            });
        }
        let status = script.failing.get(target).copied().unwrap_or(GattStatus::SUCCESS);
        if let Some(state) = lock(&self.inner.peripherals).get_mut(&self.address) {
            if script.write_limit.map_or(false, |limit| state.accepted_writes >= limit) {
                return Err(BleError::GattError("write queue full".to_string()));
            }
            state.accepted_writes += 1;
            if status.is_success() {
                state.script.values.insert(*target, value.to_vec());
            }
        }
        self.respond(
            &script,
            TransportEvent::CharacteristicWritten {
                status,
                target: *target,
            },
        );
        Ok(())
    }

    async fn read_descriptor(&self, target: &DescriptorId) -> Result<(), BleError> {
        self.inner.record(SimOp::ReadDescriptor(*target));
        self.ensure_connected()?;
        let script = self.script_or_disconnected()?;
        let value = script
            .descriptors
            .get(target)
            .cloned()
            .unwrap_or_else(|| DISABLE_NOTIFICATION_VALUE.to_vec());
        self.respond(
            &script,
            TransportEvent::DescriptorRead {
                status: GattStatus::SUCCESS,
                target: *target,
                value,
            },
        );
        Ok(())
    }

    async fn write_descriptor(&self, target: &DescriptorId, value: &[u8]) -> Result<(), BleError> {
        self.inner.record(SimOp::WriteDescriptor {
            target: *target,
            value: value.to_vec(),
        });
        self.ensure_connected()?;
        let script = self.script_or_disconnected()?;
        if let Some(state) = lock(&self.inner.peripherals).get_mut(&self.address) {
            state.script.descriptors.insert(*target, value.to_vec());
        }
        self.respond(
            &script,
            TransportEvent::DescriptorWritten {
                status: GattStatus::SUCCESS,
                target: *target,
                value: value.to_vec(),
            },
        );
        Ok(())
    }

    async fn set_characteristic_notification(
        &self,
        target: &CharacteristicId,
        enable: bool,
    ) -> Result<(), BleError> {
        self.inner.record(SimOp::SetNotification {
            target: *target,
            enable,
        });
        self.ensure_connected()
    }

    async fn request_mtu(&self, mtu: u16) -> Result<(), BleError> {
        self.inner.record(SimOp::RequestMtu(mtu));
        self.ensure_connected()?;
        let script = self.script_or_disconnected()?;
        self.respond(
            &script,
            TransportEvent::MtuChanged {
                status: GattStatus::SUCCESS,
                mtu: mtu.min(script.mtu),
            },
        );
        Ok(())
    }

    async fn read_rssi(&self) -> Result<(), BleError> {
        self.inner.record(SimOp::ReadRssi);
        self.ensure_connected()?;
        let script = self.script_or_disconnected()?;
        self.respond(
            &script,
            TransportEvent::RssiRead {
                status: GattStatus::SUCCESS,
                rssi: script.rssi,
            },
        );
        Ok(())
    }

    async fn read_phy(&self) -> Result<(), BleError> {
        self.inner.record(SimOp::ReadPhy);
        self.ensure_connected()?;
        let script = self.script_or_disconnected()?;
        let (tx, rx) = *lock(&self.shared.phy);
        self.respond(
            &script,
            TransportEvent::PhyRead {
                status: GattStatus::SUCCESS,
                tx,
                rx,
            },
        );
        Ok(())
    }

    async fn set_preferred_phy(
        &self,
        tx: PhyMask,
        rx: PhyMask,
        options: PhyOptions,
    ) -> Result<(), BleError> {
        self.inner.record(SimOp::SetPreferredPhy { tx, rx, options });
        self.ensure_connected()?;
        let script = self.script_or_disconnected()?;
        let chosen = (
            tx.intersect(script.phys).fastest(),
            rx.intersect(script.phys).fastest(),
        );
        *lock(&self.shared.phy) = chosen;
        self.respond(
            &script,
            TransportEvent::PhyUpdated {
                status: GattStatus::SUCCESS,
                tx: chosen.0,
                rx: chosen.1,
            },
        );
        Ok(())
    }

    async fn invalidate_service_cache(&self) -> bool {
        self.inner.record(SimOp::InvalidateCache);
        match lock(&self.inner.peripherals).get_mut(&self.address) {
            Some(state) => {
                state.cache_invalidated = true;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::gatt::{uuid_from_short, GattCharacteristic};
    use tokio::sync::mpsc;

    fn addr() -> BleAddress {
        "C0:FF:EE:00:00:01".parse().unwrap()
    }

    fn battery_level() -> CharacteristicId {
        CharacteristicId::new(uuid_from_short(0x180F), uuid_from_short(0x2A19))
    }

    fn battery_peripheral() -> SimPeripheral {
        SimPeripheral::new(addr())
            .with_name("battery")
            .with_service(GattService::new(
                uuid_from_short(0x180F),
                vec![GattCharacteristic::notifying(uuid_from_short(0x2A19))],
            ))
            .with_value(battery_level(), &[87])
    }

    #[tokio::test]
    async fn test_scan_broadcasts_advertising_peripherals() {
        let central = SimCentral::new();
        central.add_peripheral(battery_peripheral());
        let mut rx = central.advertisements();

        assert!(!central.advertise(&addr()), "no broadcast while idle");
        central.start_scan().await.unwrap();

        let record = rx.recv().await.unwrap();
        assert_eq!(record.address, addr());
        assert_eq!(record.name.as_deref(), Some("battery"));
        assert!(central.is_scanning());

        central.stop_scan().await.unwrap();
        assert!(!central.is_scanning());
    }

    #[tokio::test]
    async fn test_link_up_and_read() {
        let central = SimCentral::new();
        central.add_peripheral(battery_peripheral());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let link = central
            .connect(&addr(), TransportMode::Le, PhyMask::default(), EventSender::new(1, tx))
            .await
            .unwrap();
        let up = rx.recv().await.unwrap();
        assert!(matches!(
            up.event,
            TransportEvent::LinkStateChanged { state: LinkState::Connected, .. }
        ));

        link.discover_services().await.unwrap();
        rx.recv().await.unwrap();
        assert_eq!(link.services().len(), 1);

        link.read_characteristic(&battery_level()).await.unwrap();
        match rx.recv().await.unwrap().event {
            TransportEvent::CharacteristicRead { status, value, .. } => {
                assert!(status.is_success());
                assert_eq!(value, vec![87]);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_closed_link_is_silent() {
        let central = SimCentral::new();
        central.add_peripheral(battery_peripheral().with_latency(Duration::from_millis(10)));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let link = central
            .connect(&addr(), TransportMode::Le, PhyMask::default(), EventSender::new(1, tx))
            .await
            .unwrap();
        link.close().await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        assert!(!central.notify(&addr(), battery_level(), &[1]));
    }

    #[tokio::test]
    async fn test_unconnectable_never_reports_link() {
        let central = SimCentral::new();
        central.add_peripheral(battery_peripheral().unconnectable());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _link = central
            .connect(&addr(), TransportMode::Le, PhyMask::default(), EventSender::new(1, tx))
            .await
            .unwrap();
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
        assert_eq!(central.count_ops(|op| matches!(op, SimOp::Connect(_))), 1);
    }

    #[tokio::test]
    async fn test_empty_services_until_cache_invalidated() {
        let central = SimCentral::new();
        central.add_peripheral(battery_peripheral().empty_services_until_refresh());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let link = central
            .connect(&addr(), TransportMode::Le, PhyMask::default(), EventSender::new(1, tx))
            .await
            .unwrap();
        rx.recv().await.unwrap();

        link.discover_services().await.unwrap();
        rx.recv().await.unwrap();
        assert!(link.services().is_empty());

        assert!(link.invalidate_service_cache().await);
        link.discover_services().await.unwrap();
        rx.recv().await.unwrap();
        assert_eq!(link.services().len(), 1);
    }

    #[tokio::test]
    async fn test_mtu_enforced_on_write() {
        let central = SimCentral::new();
        central.add_peripheral(battery_peripheral().with_mtu(23));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let link = central
            .connect(&addr(), TransportMode::Le, PhyMask::default(), EventSender::new(1, tx))
            .await
            .unwrap();
        rx.recv().await.unwrap();

        link.write_characteristic(&battery_level(), &[0u8; 20], WriteType::Default)
            .await
            .unwrap();
        let result = link
            .write_characteristic(&battery_level(), &[0u8; 21], WriteType::Default)
            .await;
        assert!(matches!(result, Err(BleError::MtuExceeded { size: 21, mtu: 20 })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_delays_completion() {
        let central = SimCentral::new();
        central.add_peripheral(battery_peripheral().with_latency(Duration::from_millis(100)));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let before = tokio::time::Instant::now();
        let _link = central
            .connect(&addr(), TransportMode::Le, PhyMask::default(), EventSender::new(1, tx))
            .await
            .unwrap();
        rx.recv().await.unwrap();
        let elapsed = before.elapsed();

        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_write_limit_refuses_further_submissions() {
        let central = SimCentral::new();
        central.add_peripheral(battery_peripheral().rejecting_writes_after(1));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let link = central
            .connect(&addr(), TransportMode::Le, PhyMask::default(), EventSender::new(1, tx))
            .await
            .unwrap();
        rx.recv().await.unwrap();

        link.write_characteristic(&battery_level(), &[1], WriteType::Default)
            .await
            .unwrap();
        let refused = link
            .write_characteristic(&battery_level(), &[2], WriteType::Default)
            .await;
        assert!(matches!(refused, Err(BleError::GattError(_))));
        assert_eq!(central.writes_to(&battery_level()).len(), 2);
    }

    #[tokio::test]
    async fn test_phy_negotiation() {
        let central = SimCentral::new();
        central.add_peripheral(battery_peripheral().with_phys(PhyMask::LE_1M | PhyMask::LE_CODED));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let link = central
            .connect(
                &addr(),
                TransportMode::Le,
                PhyMask::LE_1M | PhyMask::LE_2M,
                EventSender::new(1, tx),
            )
            .await
            .unwrap();
        rx.recv().await.unwrap();

        link.read_phy().await.unwrap();
        assert!(matches!(
            rx.recv().await.unwrap().event,
            TransportEvent::PhyRead { tx: Phy::Le1M, rx: Phy::Le1M, .. }
        ));

        link.set_preferred_phy(PhyMask::LE_CODED, PhyMask::LE_2M, PhyOptions::S8)
            .await
            .unwrap();
        assert!(matches!(
            rx.recv().await.unwrap().event,
            TransportEvent::PhyUpdated { tx: Phy::LeCoded, rx: Phy::Le1M, .. }
        ));
    }

    #[tokio::test]
    async fn test_bond_state_reported_over_link() {
        let central = SimCentral::new();
        central.add_peripheral(battery_peripheral().with_bond_state(BondState::Bonded));
        assert_eq!(central.bond_state(&addr()), BondState::Bonded);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _link = central
            .connect(&addr(), TransportMode::Le, PhyMask::default(), EventSender::new(1, tx))
            .await
            .unwrap();
        rx.recv().await.unwrap();

        assert!(central.set_bond_state(&addr(), BondState::None));
        assert!(matches!(
            rx.recv().await.unwrap().event,
            TransportEvent::BondStateChanged { state: BondState::None }
        ));
        assert_eq!(central.bond_state(&addr()), BondState::None);
    }

    #[tokio::test]
    async fn test_adapter_disabled() {
        let central = SimCentral::new();
        central.add_peripheral(battery_peripheral());
        central.set_powered(false);
        let (tx, _rx) = mpsc::unbounded_channel();

        let result = central
            .connect(&addr(), TransportMode::Le, PhyMask::default(), EventSender::new(1, tx))
            .await;
        assert!(matches!(result, Err(BleError::AdapterDisabled)));
    }
}
