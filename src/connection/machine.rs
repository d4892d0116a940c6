//! Connection task
//!
//! One tokio task per connection owns the link handle, the request queue and
//! the reconnect bookkeeping. Commands from `Connection` handles, transport
//! completions, delayed self-messages and the 500 ms supervisor tick are all
//! processed on this task, one at a time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::ble::gatt::{
    find_service, CharacteristicId, DescriptorId, GattStatus, CLIENT_CHARACTERISTIC_CONFIG,
    DISABLE_NOTIFICATION_VALUE, ENABLE_INDICATION_VALUE, ENABLE_NOTIFICATION_VALUE,
};
use crate::ble::transport::{
    BleCentral, EventSender, GattLink, LinkEvent, LinkState, Phy, ScanRecord, TransportEvent,
    WriteType,
};
use crate::ble::BleError;
use crate::events::{ConnectFailReason, ConnectionEvent, Dispatcher, EventSink};

use super::config::ConnectionConfig;
use super::fragmenter::{AfterAck, AfterSubmit, FragmentedWrite};
use super::queue::{Enqueued, RequestQueue};
use super::request::{FailReason, Request, RequestKind, RequestResult, RequestSuccess};
use super::supervisor::{ReconnectStrategy, ReconnectSupervisor, TickAction, TickInput};
use super::{ConnectionState, Device};

const TICK_INTERVAL: Duration = Duration::from_millis(500);
const OPEN_LINK_DELAY: Duration = Duration::from_millis(500);
const SCAN_RECONNECT_DELAY: Duration = Duration::from_secs(2);
const REFRESH_GUARD: Duration = Duration::from_secs(2);

/// Messages from `Connection` handles.
pub(crate) enum Command {
    Disconnect,
    Reconnect,
    Refresh,
    Release { notify: bool },
    SetAutoReconnect(bool),
    SetWriteType(CharacteristicId, WriteType),
    Enqueue(Request),
    ClearRequests,
    ClearRequestsByKind(RequestKind),
    ScanResult(ScanRecord),
}

/// Delayed messages the task posts to itself.
enum Internal {
    OpenLink { attempt: u64 },
    DiscoverServices { link_id: u64 },
    CancelRefresh,
    ScanReconnect { attempt: u64 },
    RequestTimeout { seq: u64 },
    WriteStep { seq: u64 },
}

/// Routes request results and connection events to their receivers.
#[derive(Clone)]
pub(crate) struct Reporter {
    sink: Arc<dyn EventSink>,
    dispatcher: Dispatcher,
}

impl Reporter {
    pub(crate) fn new(sink: Arc<dyn EventSink>, dispatcher: Dispatcher) -> Self {
        Self { sink, dispatcher }
    }

    pub(crate) fn emit(&self, event: ConnectionEvent) {
        self.sink.emit(event);
    }

    /// Hand a terminal result to the request's callback, or to the sink if
    /// it has none.
    pub(crate) fn deliver(&self, device: &Device, mut request: Request, result: RequestResult) {
        if let Err(failure) = &result {
            log::debug!(
                "request failed! [addr: {}, requestId: {}, reason: {:?}]",
                device.address,
                failure.request_id,
                failure.reason
            );
        }
        match request.take_callback() {
            Some(callback) => {
                self.dispatcher
                    .run(callback.dispatch(), move || callback.call(result));
            }
            None => match result {
                Ok(success) => self.sink.emit(ConnectionEvent::RequestSucceeded {
                    device: device.clone(),
                    request_id: request.request_id().to_string(),
                    success,
                }),
                Err(failure) => self.sink.emit(ConnectionEvent::RequestFailed {
                    device: device.clone(),
                    failure,
                }),
            },
        }
    }
}

fn submit_failure(err: BleError) -> FailReason {
    match err {
        BleError::AdapterDisabled => FailReason::AdapterDisabled,
        BleError::Unsupported => FailReason::ApiUnsupported,
        _ => FailReason::RequestFailed,
    }
}

fn toggled(kind: RequestKind, target: CharacteristicId, enabled: bool) -> RequestSuccess {
    if kind == RequestKind::ToggleIndication {
        RequestSuccess::IndicationChanged { target, enabled }
    } else {
        RequestSuccess::NotificationChanged { target, enabled }
    }
}

fn config_value(kind: RequestKind, enable: bool) -> &'static [u8] {
    match (kind, enable) {
        (_, false) => &DISABLE_NOTIFICATION_VALUE,
        (RequestKind::ToggleIndication, true) => &ENABLE_INDICATION_VALUE,
        _ => &ENABLE_NOTIFICATION_VALUE,
    }
}

/// Start the task for `device` and return its command and snapshot channels.
pub(crate) fn spawn(
    device: Device,
    config: ConnectionConfig,
    central: Arc<dyn BleCentral>,
    reporter: Reporter,
) -> (mpsc::UnboundedSender<Command>, watch::Receiver<Device>) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (link_tx, link_rx) = mpsc::unbounded_channel();
    let (internal_tx, internal_rx) = mpsc::unbounded_channel();
    let (device_tx, device_rx) = watch::channel(device.clone());

    let now = Instant::now();
    let actor = ConnectionActor {
        supervisor: ReconnectSupervisor::new(&config, now),
        central,
        config,
        device,
        device_tx,
        reporter,
        link: None,
        link_id: 0,
        link_tx,
        internal_tx,
        queue: RequestQueue::new(),
        last_notified: None,
        refreshing: false,
        active_disconnect: false,
        released: false,
        scan_pending: false,
        attempt: 0,
        request_timer: None,
        write: None,
        stale_acks: HashMap::new(),
        toggle_writing: false,
    };
    tokio::spawn(actor.run(cmd_rx, link_rx, internal_rx));
    (cmd_tx, device_rx)
}

struct ConnectionActor {
    central: Arc<dyn BleCentral>,
    config: ConnectionConfig,
    device: Device,
    device_tx: watch::Sender<Device>,
    reporter: Reporter,
    link: Option<Box<dyn GattLink>>,
    /// Id of the most recently acquired link; events tagged otherwise are stale.
    link_id: u64,
    link_tx: mpsc::UnboundedSender<LinkEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    queue: RequestQueue,
    supervisor: ReconnectSupervisor,
    last_notified: Option<ConnectionState>,
    refreshing: bool,
    active_disconnect: bool,
    released: bool,
    scan_pending: bool,
    /// Bumped on every connect/disconnect so delayed opens and scans that
    /// were overtaken are dropped.
    attempt: u64,
    request_timer: Option<JoinHandle<()>>,
    write: Option<FragmentedWrite>,
    /// Write completions still owed for chunks of abandoned writes, per
    /// characteristic. They must not be credited to a later write.
    stale_acks: HashMap<CharacteristicId, usize>,
    toggle_writing: bool,
}

impl ConnectionActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut link_rx: mpsc::UnboundedReceiver<LinkEvent>,
        mut internal_rx: mpsc::UnboundedReceiver<Internal>,
    ) {
        self.supervisor.restart_timer(Instant::now());
        self.do_connect().await;

        let mut ticker = tokio::time::interval_at(Instant::now() + TICK_INTERVAL, TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.released {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                Some(event) = link_rx.recv() => self.handle_link_event(event).await,
                Some(msg) = internal_rx.recv() => self.handle_internal(msg).await,
                _ = ticker.tick() => self.on_tick().await,
            }
        }

        if !self.released {
            // Every handle is gone.
            self.release(false).await;
        }

        // Anything that raced the release still gets its answer.
        cmd_rx.close();
        while let Ok(cmd) = cmd_rx.try_recv() {
            if let Command::Enqueue(request) = cmd {
                self.reject_released(request);
            }
        }
        log::debug!("connection task finished [addr: {}]", self.device.address);
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Disconnect => {
                self.active_disconnect = true;
                self.do_disconnect(false, true).await;
            }
            Command::Reconnect => {
                self.active_disconnect = false;
                self.supervisor.reset_retries();
                self.do_disconnect(true, true).await;
            }
            Command::Refresh => self.do_refresh(false).await,
            Command::Release { notify } => self.release(notify).await,
            Command::SetAutoReconnect(enabled) => self.config.auto_reconnect = enabled,
            Command::SetWriteType(target, write_type) => {
                self.config.set_write_type(&target, write_type)
            }
            Command::Enqueue(request) => self.enqueue(request).await,
            Command::ClearRequests => {
                self.queue.clear();
                self.reset_in_flight();
            }
            Command::ClearRequestsByKind(kind) => {
                let (_, current_removed) = self.queue.cancel_by_kind(kind);
                if current_removed {
                    self.reset_in_flight();
                    self.pump().await;
                }
            }
            Command::ScanResult(record) => self.on_scan_result(record).await,
        }
    }

    async fn handle_internal(&mut self, msg: Internal) {
        match msg {
            Internal::OpenLink { attempt } => self.open_link(attempt).await,
            Internal::DiscoverServices { link_id } => self.discover_services(link_id).await,
            Internal::CancelRefresh => self.cancel_refresh_state().await,
            Internal::ScanReconnect { attempt } => self.scan_reconnect(attempt).await,
            Internal::RequestTimeout { seq } => {
                if self.queue.is_current(seq) {
                    log::warn!("request timeout! [addr: {}]", self.device.address);
                    self.complete(Err(FailReason::RequestTimeout)).await;
                }
            }
            Internal::WriteStep { seq } => self.write_step(seq).await,
        }
    }

    // ---------------------------------------------------------------
    // State publication
    // ---------------------------------------------------------------

    fn set_state(&mut self, state: ConnectionState) {
        self.device.state = state;
        self.device_tx.send_replace(self.device.clone());
    }

    /// Emit a state change only if it differs from the last one emitted.
    fn notify_state(&mut self) {
        if self.last_notified != Some(self.device.state) {
            self.last_notified = Some(self.device.state);
            self.reporter.emit(ConnectionEvent::StateChanged {
                device: self.device.clone(),
                state: self.device.state,
            });
        }
    }

    fn post_after(&self, delay: Duration, msg: Internal) {
        let tx = self.internal_tx.clone();
        if delay.is_zero() {
            let _ = tx.send(msg);
            return;
        }
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(msg);
        });
    }

    // ---------------------------------------------------------------
    // Link lifecycle
    // ---------------------------------------------------------------

    async fn do_connect(&mut self) {
        self.cancel_refresh_state().await;
        self.scan_pending = false;
        self.set_state(ConnectionState::Connecting);
        self.notify_state();
        log::debug!(
            "connecting [name: {:?}, addr: {}]",
            self.device.name,
            self.device.address
        );
        // Scanning while connecting upsets most stacks.
        if let Err(e) = self.central.stop_scan().await {
            log::debug!("stop scan failed: {}", e);
        }
        self.attempt += 1;
        self.post_after(
            OPEN_LINK_DELAY,
            Internal::OpenLink {
                attempt: self.attempt,
            },
        );
    }

    async fn open_link(&mut self, attempt: u64) {
        if self.released || attempt != self.attempt {
            return;
        }
        self.close_link().await;
        self.link_id += 1;
        self.stale_acks.clear();
        self.device.bond_state = self.central.bond_state(&self.device.address);
        self.device_tx.send_replace(self.device.clone());
        let events = EventSender::new(self.link_id, self.link_tx.clone());
        match self
            .central
            .connect(
                &self.device.address,
                self.config.transport_mode,
                self.config.phy,
                events,
            )
            .await
        {
            Ok(link) => self.link = Some(link),
            Err(e) => log::error!(
                "connect failed! [addr: {}, error: {}]",
                self.device.address,
                e
            ),
        }
    }

    async fn close_link(&mut self) {
        if let Some(link) = self.link.take() {
            let _ = link.disconnect().await;
            link.close().await;
        }
    }

    async fn do_disconnect(&mut self, reconnect: bool, notify: bool) {
        self.cancel_all(FailReason::ConnectionDisconnected);
        self.attempt += 1;
        self.scan_pending = false;
        self.close_link().await;
        self.set_state(ConnectionState::Disconnected);
        if self.released {
            self.set_state(ConnectionState::Released);
            log::debug!("connection released! [addr: {}]", self.device.address);
        } else if reconnect {
            match self.supervisor.next_strategy(Instant::now()) {
                ReconnectStrategy::Immediate => self.do_connect().await,
                ReconnectStrategy::ScanAssisted => self.try_scan_reconnect().await,
            }
        }
        if notify {
            self.notify_state();
        }
    }

    async fn try_scan_reconnect(&mut self) {
        if self.released {
            return;
        }
        self.supervisor.restart_timer(Instant::now());
        if let Err(e) = self.central.stop_scan().await {
            log::debug!("stop scan failed: {}", e);
        }
        self.scan_pending = true;
        self.post_after(
            SCAN_RECONNECT_DELAY,
            Internal::ScanReconnect {
                attempt: self.attempt,
            },
        );
    }

    async fn scan_reconnect(&mut self, attempt: u64) {
        if self.released || attempt != self.attempt {
            return;
        }
        self.scan_pending = false;
        self.set_state(ConnectionState::Scanning);
        self.notify_state();
        log::debug!(
            "scanning [name: {:?}, addr: {}]",
            self.device.name,
            self.device.address
        );
        if let Err(e) = self.central.start_scan().await {
            log::warn!("start scan failed: {}", e);
        }
    }

    async fn on_scan_result(&mut self, record: ScanRecord) {
        if record.address != self.device.address {
            return;
        }
        if record.name.is_some() {
            self.device.name = record.name;
        }
        if record.rssi.is_some() {
            self.device.rssi = record.rssi;
        }
        self.device.last_seen = Some(Utc::now());
        self.device_tx.send_replace(self.device.clone());

        if !self.released && self.device.state == ConnectionState::Scanning {
            self.do_connect().await;
        }
    }

    async fn discover_services(&mut self, link_id: u64) {
        if link_id != self.link_id {
            return;
        }
        if self.refreshing {
            log::debug!(
                "skipping discovery while refreshing [addr: {}]",
                self.device.address
            );
            return;
        }
        match self.link.as_ref() {
            Some(link) => {
                if let Err(e) = link.discover_services().await {
                    log::warn!(
                        "discover services failed! [addr: {}, error: {}]",
                        self.device.address,
                        e
                    );
                }
                self.set_state(ConnectionState::ServiceDiscovering);
                self.notify_state();
            }
            None => {
                self.set_state(ConnectionState::Disconnected);
                self.notify_state();
            }
        }
    }

    async fn do_refresh(&mut self, auto: bool) {
        log::debug!("refresh GATT! [addr: {}]", self.device.address);
        // Keeps the supervisor from counting the refresh against the
        // connect timeout.
        self.supervisor.restart_timer(Instant::now());
        if let Some(link) = self.link.as_ref() {
            let _ = link.disconnect().await;
            let invalidate = !auto || self.supervisor.allow_auto_refresh();
            if invalidate {
                self.refreshing = link.invalidate_service_cache().await;
            }
            if self.refreshing {
                self.post_after(REFRESH_GUARD, Internal::CancelRefresh);
            }
        }
        self.set_state(ConnectionState::Disconnected);
        self.notify_state();
    }

    async fn cancel_refresh_state(&mut self) {
        if self.refreshing {
            self.refreshing = false;
            self.close_link().await;
        }
    }

    async fn clear_and_refresh(&mut self) {
        self.cancel_all(FailReason::ConnectionDisconnected);
        self.do_refresh(true).await;
    }

    async fn release(&mut self, notify: bool) {
        if self.released {
            return;
        }
        log::debug!("releasing connection [addr: {}]", self.device.address);
        self.released = true;
        self.config.auto_reconnect = false;
        for request in self.queue.release() {
            self.reject_released(request);
        }
        self.reset_in_flight();
        self.do_disconnect(false, notify).await;
    }

    async fn on_tick(&mut self) {
        let input = TickInput {
            state: self.device.state,
            refreshing: self.refreshing,
            active_disconnect: self.active_disconnect,
            auto_reconnect: self.config.auto_reconnect,
            scan_pending: self.scan_pending,
        };
        match self.supervisor.on_tick(Instant::now(), input) {
            TickAction::Idle => {}
            TickAction::Reconnect => self.do_disconnect(true, true).await,
            TickAction::Timeout { kind, retry } => {
                log::error!(
                    "connect timeout! [addr: {}, kind: {:?}]",
                    self.device.address,
                    kind
                );
                self.reporter.emit(ConnectionEvent::ConnectTimeout {
                    device: self.device.clone(),
                    kind,
                });
                if retry {
                    self.do_disconnect(true, true).await;
                } else {
                    self.do_disconnect(false, true).await;
                    log::error!(
                        "connect failed! [type: maximum reconnection, addr: {}]",
                        self.device.address
                    );
                    self.reporter.emit(ConnectionEvent::ConnectFailed {
                        device: Some(self.device.clone()),
                        reason: ConnectFailReason::MaximumReconnection,
                    });
                }
            }
        }
    }

    // ---------------------------------------------------------------
    // Transport completions
    // ---------------------------------------------------------------

    async fn handle_link_event(&mut self, event: LinkEvent) {
        if self.released || self.link.is_none() || event.link_id != self.link_id {
            log::trace!("dropping event from stale link {}", event.link_id);
            return;
        }
        match event.event {
            TransportEvent::LinkStateChanged { status, state } => {
                self.on_link_state(status, state).await
            }
            TransportEvent::ServicesDiscovered { status } => self.on_services_discovered(status).await,
            TransportEvent::CharacteristicRead {
                status,
                target,
                value,
            } => {
                let ours = matches!(self.queue.current(), Some(r)
                    if r.kind() == RequestKind::ReadCharacteristic && r.characteristic_id() == Some(target));
                if ours {
                    let outcome = if status.is_success() {
                        log::debug!(
                            "characteristic read! [addr: {}, value: {}]",
                            self.device.address,
                            hex::encode(&value)
                        );
                        Ok(RequestSuccess::CharacteristicRead { target, value })
                    } else {
                        Err(FailReason::GattStatusFailed)
                    };
                    self.complete(outcome).await;
                }
            }
            TransportEvent::CharacteristicWritten { status, target } => {
                self.on_characteristic_written(status, target).await
            }
            TransportEvent::CharacteristicChanged { target, value } => {
                log::info!(
                    "characteristic change! [addr: {}, value: {}]",
                    self.device.address,
                    hex::encode(&value)
                );
                self.reporter.emit(ConnectionEvent::CharacteristicChanged {
                    device: self.device.clone(),
                    characteristic: target,
                    value,
                });
            }
            TransportEvent::DescriptorRead {
                status,
                target,
                value,
            } => self.on_descriptor_read(status, target, value).await,
            TransportEvent::DescriptorWritten { status, target, .. } => {
                let current = self
                    .queue
                    .current()
                    .map(|r| (r.kind(), r.characteristic_id(), r.enable()));
                if let Some((kind, Some(characteristic), enable)) = current {
                    let is_toggle = matches!(
                        kind,
                        RequestKind::ToggleNotification | RequestKind::ToggleIndication
                    );
                    if is_toggle
                        && self.toggle_writing
                        && target.characteristic_id() == characteristic
                    {
                        let outcome = if status.is_success() {
                            log::debug!(
                                "{} {} [addr: {}]",
                                if kind == RequestKind::ToggleIndication { "indication" } else { "notification" },
                                if enable { "enabled!" } else { "disabled!" },
                                self.device.address
                            );
                            Ok(toggled(kind, characteristic, enable))
                        } else {
                            Err(FailReason::GattStatusFailed)
                        };
                        self.complete(outcome).await;
                    }
                }
            }
            TransportEvent::MtuChanged { status, mtu } => {
                if matches!(self.queue.current(), Some(r) if r.kind() == RequestKind::ChangeMtu) {
                    let outcome = if status.is_success() {
                        log::debug!("mtu change! [addr: {}, mtu: {}]", self.device.address, mtu);
                        Ok(RequestSuccess::MtuChanged { mtu })
                    } else {
                        Err(FailReason::GattStatusFailed)
                    };
                    self.complete(outcome).await;
                }
            }
            TransportEvent::RssiRead { status, rssi } => {
                if matches!(self.queue.current(), Some(r) if r.kind() == RequestKind::ReadRssi) {
                    let outcome = if status.is_success() {
                        self.device.rssi = Some(rssi);
                        self.device_tx.send_replace(self.device.clone());
                        Ok(RequestSuccess::RssiRead { rssi })
                    } else {
                        Err(FailReason::GattStatusFailed)
                    };
                    self.complete(outcome).await;
                }
            }
            TransportEvent::PhyRead { status, tx, rx } => {
                self.on_phy(RequestKind::ReadPhy, status, tx, rx).await
            }
            TransportEvent::PhyUpdated { status, tx, rx } => {
                self.on_phy(RequestKind::SetPreferredPhy, status, tx, rx).await
            }
            TransportEvent::BondStateChanged { state } => {
                log::debug!(
                    "bond state changed! [addr: {}, state: {:?}]",
                    self.device.address,
                    state
                );
                self.device.bond_state = state;
                self.device_tx.send_replace(self.device.clone());
            }
        }
    }

    async fn on_phy(&mut self, kind: RequestKind, status: GattStatus, tx: Phy, rx: Phy) {
        if !matches!(self.queue.current(), Some(r) if r.kind() == kind) {
            // Peer-initiated change.
            log::debug!(
                "phy update! [addr: {}, txPhy: {:?}, rxPhy: {:?}]",
                self.device.address,
                tx,
                rx
            );
            return;
        }
        let outcome = if !status.is_success() {
            Err(FailReason::GattStatusFailed)
        } else if kind == RequestKind::ReadPhy {
            log::debug!(
                "phy read! [addr: {}, txPhy: {:?}, rxPhy: {:?}]",
                self.device.address,
                tx,
                rx
            );
            Ok(RequestSuccess::PhyRead { tx, rx })
        } else {
            Ok(RequestSuccess::PhyUpdated { tx, rx })
        };
        self.complete(outcome).await;
    }

    async fn on_link_state(&mut self, status: GattStatus, state: LinkState) {
        if status.is_success() {
            match state {
                LinkState::Connected => {
                    log::debug!(
                        "connected! [name: {:?}, addr: {}]",
                        self.device.name,
                        self.device.address
                    );
                    self.set_state(ConnectionState::Connected);
                    self.notify_state();
                    self.post_after(
                        self.config.discover_services_delay(),
                        Internal::DiscoverServices {
                            link_id: self.link_id,
                        },
                    );
                }
                LinkState::Disconnected => {
                    log::debug!(
                        "disconnected! [addr: {}, autoReconnect: {}]",
                        self.device.address,
                        self.config.auto_reconnect
                    );
                    self.cancel_all(FailReason::ConnectionDisconnected);
                    self.set_state(ConnectionState::Disconnected);
                    self.notify_state();
                }
            }
        } else {
            log::error!(
                "GATT error! [addr: {}, status: {}]",
                self.device.address,
                status.0
            );
            if status.is_stale_cache() {
                self.clear_and_refresh().await;
            } else {
                self.cancel_all(FailReason::ConnectionDisconnected);
                self.set_state(ConnectionState::Disconnected);
                self.notify_state();
            }
        }
    }

    async fn on_services_discovered(&mut self, status: GattStatus) {
        if !status.is_success() {
            log::error!(
                "GATT error! [status: {}, addr: {}]",
                status.0,
                self.device.address
            );
            self.clear_and_refresh().await;
            return;
        }
        let count = self.link.as_ref().map(|l| l.services().len()).unwrap_or(0);
        log::debug!(
            "services discovered! [addr: {}, size: {}]",
            self.device.address,
            count
        );
        if count == 0 {
            self.clear_and_refresh().await;
        } else {
            self.supervisor.on_services_discovered();
            self.set_state(ConnectionState::ServiceDiscovered);
            self.notify_state();
        }
    }

    async fn on_characteristic_written(&mut self, status: GattStatus, target: CharacteristicId) {
        if let Some(owed) = self.stale_acks.get_mut(&target).filter(|owed| **owed > 0) {
            *owed -= 1;
            log::debug!(
                "dropping completion of an abandoned write [addr: {}]",
                self.device.address
            );
            return;
        }
        let seq = match self.queue.current_seq() {
            Some(seq) => seq,
            None => return,
        };
        let ours = matches!(self.queue.current(), Some(r) if r.kind() == RequestKind::WriteCharacteristic)
            && self
                .write
                .as_ref()
                .map(|w| w.is_awaiting_ack() && w.target() == &target)
                .unwrap_or(false);
        if !ours {
            return;
        }
        if !status.is_success() {
            log::warn!(
                "write failed! [addr: {}, status: {}]",
                self.device.address,
                status.0
            );
            // The chunk was answered; nothing more is owed for it.
            self.write = None;
            self.complete(Err(FailReason::GattStatusFailed)).await;
            return;
        }
        let next = match self.write.as_mut() {
            Some(write) => write.acknowledged(),
            None => return,
        };
        match next {
            AfterAck::Done => self.complete_write(target).await,
            AfterAck::SendNext(delay) => {
                self.arm_request_timer(seq);
                self.post_after(delay, Internal::WriteStep { seq });
            }
        }
    }

    async fn on_descriptor_read(&mut self, status: GattStatus, target: DescriptorId, value: Vec<u8>) {
        let (kind, characteristic, descriptor, enable) = match self.queue.current() {
            Some(r) => (r.kind(), r.characteristic_id(), r.descriptor_id(), r.enable()),
            None => return,
        };
        match kind {
            RequestKind::ToggleNotification | RequestKind::ToggleIndication => {
                if self.toggle_writing
                    || Some(target.characteristic_id()) != characteristic
                    || target.descriptor != CLIENT_CHARACTERISTIC_CONFIG
                {
                    return;
                }
                if !status.is_success() {
                    self.complete(Err(FailReason::GattStatusFailed)).await;
                    return;
                }
                let characteristic = target.characteristic_id();
                let desired = config_value(kind, enable);
                let link = match self.link.as_ref() {
                    Some(link) => link,
                    None => {
                        self.complete(Err(FailReason::GattIsNull)).await;
                        return;
                    }
                };
                if let Err(e) = link
                    .set_characteristic_notification(&characteristic, enable)
                    .await
                {
                    self.complete(Err(submit_failure(e))).await;
                    return;
                }
                if value.as_slice() == desired {
                    log::debug!(
                        "descriptor already {} [addr: {}]",
                        hex::encode(desired),
                        self.device.address
                    );
                    self.complete(Ok(toggled(kind, characteristic, enable))).await;
                    return;
                }
                if let Err(e) = link.write_descriptor(&target, desired).await {
                    self.complete(Err(submit_failure(e))).await;
                    return;
                }
                self.toggle_writing = true;
            }
            RequestKind::ReadDescriptor if descriptor == Some(target) => {
                let outcome = if status.is_success() {
                    log::debug!(
                        "descriptor read! [addr: {}, value: {}]",
                        self.device.address,
                        hex::encode(&value)
                    );
                    Ok(RequestSuccess::DescriptorRead { target, value })
                } else {
                    Err(FailReason::GattStatusFailed)
                };
                self.complete(outcome).await;
            }
            _ => {}
        }
    }

    // ---------------------------------------------------------------
    // Request queue
    // ---------------------------------------------------------------

    async fn enqueue(&mut self, request: Request) {
        match self.queue.enqueue(request) {
            Ok(Enqueued::Current) => self.pump().await,
            Ok(Enqueued::Waiting) => {}
            Err(request) => self.reject_released(request),
        }
    }

    fn reject_released(&self, request: Request) {
        let failure = request.failure(FailReason::ConnectionReleased);
        self.reporter.deliver(&self.device, request, Err(failure));
    }

    /// Start the in-flight request, moving past any that fail to start.
    async fn pump(&mut self) {
        while let Some(seq) = self.queue.start_current() {
            self.arm_request_timer(seq);
            match self.start_request(seq).await {
                Ok(()) => break,
                Err(reason) => {
                    log::warn!(
                        "request not started [addr: {}, reason: {:?}]",
                        self.device.address,
                        reason
                    );
                    self.finish_current(Err(reason));
                }
            }
        }
    }

    async fn complete(&mut self, outcome: Result<RequestSuccess, FailReason>) {
        self.finish_current(outcome);
        self.pump().await;
    }

    fn finish_current(&mut self, outcome: Result<RequestSuccess, FailReason>) {
        self.reset_in_flight();
        if let Some(request) = self.queue.finish_current() {
            let result = outcome.map_err(|reason| request.failure(reason));
            self.reporter.deliver(&self.device, request, result);
        }
    }

    /// Fail every queued request. Waiting ones go first, in order.
    fn cancel_all(&mut self, reason: FailReason) {
        self.reset_in_flight();
        for request in self.queue.drain_all() {
            let failure = request.failure(reason);
            self.reporter.deliver(&self.device, request, Err(failure));
        }
    }

    fn reset_in_flight(&mut self) {
        if let Some(timer) = self.request_timer.take() {
            timer.abort();
        }
        if let Some(write) = self.write.take() {
            if write.is_awaiting_ack() {
                *self.stale_acks.entry(*write.target()).or_insert(0) += 1;
            }
        }
        self.toggle_writing = false;
    }

    fn arm_request_timer(&mut self, seq: u64) {
        if let Some(timer) = self.request_timer.take() {
            timer.abort();
        }
        let tx = self.internal_tx.clone();
        let timeout = self.config.request_timeout();
        self.request_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(Internal::RequestTimeout { seq });
        }));
    }

    async fn start_request(&mut self, seq: u64) -> Result<(), FailReason> {
        let (kind, target, descriptor, mtu, phy, payload) = match self.queue.current() {
            Some(r) => (
                r.kind(),
                r.characteristic_id(),
                r.descriptor_id(),
                r.mtu(),
                r.phy_preference(),
                r.payload().map(<[u8]>::to_vec),
            ),
            None => return Ok(()),
        };
        let link = self.link.as_ref().ok_or(FailReason::GattIsNull)?;

        match kind {
            RequestKind::ReadRssi => return link.read_rssi().await.map_err(submit_failure),
            RequestKind::ChangeMtu => return link.request_mtu(mtu).await.map_err(submit_failure),
            RequestKind::ReadPhy => return link.read_phy().await.map_err(submit_failure),
            RequestKind::SetPreferredPhy => {
                let phy = phy.ok_or(FailReason::RequestFailed)?;
                return link
                    .set_preferred_phy(phy.tx, phy.rx, phy.options)
                    .await
                    .map_err(submit_failure);
            }
            _ => {}
        }

        let target = target.ok_or(FailReason::NullCharacteristic)?;
        let services = link.services();
        let service = find_service(&services, &target.service).ok_or(FailReason::NullService)?;
        let characteristic = service
            .characteristic(&target.characteristic)
            .ok_or(FailReason::NullCharacteristic)?;

        match kind {
            RequestKind::ToggleNotification | RequestKind::ToggleIndication => {
                if !characteristic.has_descriptor(&CLIENT_CHARACTERISTIC_CONFIG) {
                    return Err(FailReason::NullDescriptor);
                }
                link.read_descriptor(&target.descriptor(CLIENT_CHARACTERISTIC_CONFIG))
                    .await
                    .map_err(submit_failure)
            }
            RequestKind::ReadCharacteristic => {
                link.read_characteristic(&target).await.map_err(submit_failure)
            }
            RequestKind::ReadDescriptor => {
                let descriptor = descriptor.ok_or(FailReason::NullDescriptor)?;
                if !characteristic.has_descriptor(&descriptor.descriptor) {
                    return Err(FailReason::NullDescriptor);
                }
                link.read_descriptor(&descriptor).await.map_err(submit_failure)
            }
            RequestKind::WriteCharacteristic => {
                let payload = payload
                    .filter(|p| !p.is_empty())
                    .ok_or(FailReason::ValueIsNullOrEmpty)?;
                self.write = Some(FragmentedWrite::new(
                    target,
                    &payload,
                    self.config.package_size,
                    self.config.write_type(&target),
                    self.config.wait_write_result,
                    self.config.package_write_delay(),
                ));
                self.post_after(self.config.request_write_delay(), Internal::WriteStep { seq });
                Ok(())
            }
            RequestKind::ReadRssi
            | RequestKind::ChangeMtu
            | RequestKind::ReadPhy
            | RequestKind::SetPreferredPhy => Ok(()),
        }
    }

    /// Submit the next chunk of the in-flight write.
    async fn write_step(&mut self, seq: u64) {
        if !self.queue.is_current(seq) {
            return;
        }
        let (chunk, target, write_type) = match self.write.as_mut() {
            Some(write) => match write.next_chunk() {
                Some(chunk) => (chunk, *write.target(), write.write_type()),
                None => return,
            },
            None => return,
        };
        let submitted = match self.link.as_ref() {
            Some(link) => link.write_characteristic(&target, &chunk, write_type).await,
            None => Err(BleError::Disconnected),
        };
        if let Err(e) = submitted {
            log::warn!("write failed! [addr: {}, error: {}]", self.device.address, e);
            self.complete(Err(FailReason::RequestFailed)).await;
            return;
        }
        let next = match self.write.as_mut() {
            Some(write) => write.submitted(),
            None => return,
        };
        match next {
            AfterSubmit::AwaitAck => {}
            AfterSubmit::SendNext(delay) => self.post_after(delay, Internal::WriteStep { seq }),
            AfterSubmit::Done => self.complete_write(target).await,
        }
    }

    async fn complete_write(&mut self, target: CharacteristicId) {
        let value = self
            .queue
            .current()
            .and_then(|r| r.payload())
            .map(<[u8]>::to_vec)
            .unwrap_or_default();
        log::debug!(
            "write success! [addr: {}, value: {}]",
            self.device.address,
            hex::encode(&value)
        );
        self.complete(Ok(RequestSuccess::CharacteristicWritten { target, value }))
            .await;
    }
}
