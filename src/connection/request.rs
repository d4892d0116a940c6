//! Queued GATT operations and their outcomes

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::ble::gatt::{CharacteristicId, DescriptorId, MAX_MTU, MIN_MTU};
use crate::ble::transport::{Phy, PhyMask, PhyOptions};
use crate::events::Dispatch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    ReadCharacteristic,
    WriteCharacteristic,
    ToggleNotification,
    ToggleIndication,
    ReadDescriptor,
    ReadRssi,
    ChangeMtu,
    ReadPhy,
    SetPreferredPhy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestSuccess {
    CharacteristicRead { target: CharacteristicId, value: Vec<u8> },
    CharacteristicWritten { target: CharacteristicId, value: Vec<u8> },
    NotificationChanged { target: CharacteristicId, enabled: bool },
    IndicationChanged { target: CharacteristicId, enabled: bool },
    DescriptorRead { target: DescriptorId, value: Vec<u8> },
    RssiRead { rssi: i16 },
    MtuChanged { mtu: u16 },
    PhyRead { tx: Phy, rx: Phy },
    /// The PHYs in use after a preference request.
    PhyUpdated { tx: Phy, rx: Phy },
}

/// Preferred PHYs for a `SetPreferredPhy` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhyPreference {
    pub tx: PhyMask,
    pub rx: PhyMask,
    pub options: PhyOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailReason {
    /// The transport refused the submission.
    RequestFailed,
    NullCharacteristic,
    NullDescriptor,
    NullService,
    /// The peer answered with a non-success status.
    GattStatusFailed,
    /// No link is open.
    GattIsNull,
    ApiUnsupported,
    AdapterDisabled,
    RequestTimeout,
    ConnectionDisconnected,
    ConnectionReleased,
    ValueIsNullOrEmpty,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("request {request_id:?} ({kind:?}) failed: {reason:?}")]
pub struct RequestFailure {
    pub request_id: String,
    pub kind: RequestKind,
    pub reason: FailReason,
    /// The payload the request carried, if any.
    pub payload: Option<Vec<u8>>,
}

pub type RequestResult = Result<RequestSuccess, RequestFailure>;

/// Completion handler for a single request.
#[derive(Clone)]
pub struct RequestCallback {
    dispatch: Dispatch,
    handler: Arc<dyn Fn(RequestResult) + Send + Sync>,
}

impl RequestCallback {
    /// A callback run on the connection task.
    pub fn new(handler: impl Fn(RequestResult) + Send + Sync + 'static) -> Self {
        Self::on(Dispatch::Immediate, handler)
    }

    pub fn on(dispatch: Dispatch, handler: impl Fn(RequestResult) + Send + Sync + 'static) -> Self {
        Self {
            dispatch,
            handler: Arc::new(handler),
        }
    }

    pub fn dispatch(&self) -> Dispatch {
        self.dispatch
    }

    pub(crate) fn call(&self, result: RequestResult) {
        (self.handler)(result)
    }
}

impl fmt::Debug for RequestCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestCallback")
            .field("dispatch", &self.dispatch)
            .finish_non_exhaustive()
    }
}

/// One operation against the peripheral.
///
/// `request_id` is an opaque correlation token chosen by the caller and
/// handed back with the result; it need not be unique.
#[derive(Debug, Clone)]
pub struct Request {
    kind: RequestKind,
    request_id: String,
    service: Option<Uuid>,
    characteristic: Option<Uuid>,
    descriptor: Option<Uuid>,
    payload: Option<Vec<u8>>,
    enable: bool,
    mtu: u16,
    phy: Option<PhyPreference>,
    callback: Option<RequestCallback>,
}

impl Request {
    fn new(kind: RequestKind, request_id: impl Into<String>) -> Self {
        Self {
            kind,
            request_id: request_id.into(),
            service: None,
            characteristic: None,
            descriptor: None,
            payload: None,
            enable: false,
            mtu: 0,
            phy: None,
            callback: None,
        }
    }

    fn targeting(mut self, target: &CharacteristicId) -> Self {
        self.service = Some(target.service);
        self.characteristic = Some(target.characteristic);
        self
    }

    pub fn read_characteristic(request_id: impl Into<String>, target: CharacteristicId) -> Self {
        Self::new(RequestKind::ReadCharacteristic, request_id).targeting(&target)
    }

    pub fn write_characteristic(
        request_id: impl Into<String>,
        target: CharacteristicId,
        value: impl Into<Vec<u8>>,
    ) -> Self {
        let mut request = Self::new(RequestKind::WriteCharacteristic, request_id).targeting(&target);
        request.payload = Some(value.into());
        request
    }

    pub fn toggle_notification(
        request_id: impl Into<String>,
        target: CharacteristicId,
        enable: bool,
    ) -> Self {
        let mut request = Self::new(RequestKind::ToggleNotification, request_id).targeting(&target);
        request.enable = enable;
        request
    }

    pub fn toggle_indication(
        request_id: impl Into<String>,
        target: CharacteristicId,
        enable: bool,
    ) -> Self {
        let mut request = Self::new(RequestKind::ToggleIndication, request_id).targeting(&target);
        request.enable = enable;
        request
    }

    pub fn read_descriptor(request_id: impl Into<String>, target: DescriptorId) -> Self {
        let mut request =
            Self::new(RequestKind::ReadDescriptor, request_id).targeting(&target.characteristic_id());
        request.descriptor = Some(target.descriptor);
        request
    }

    pub fn read_rssi(request_id: impl Into<String>) -> Self {
        Self::new(RequestKind::ReadRssi, request_id)
    }

    /// The requested MTU is clamped to 23..=517.
    pub fn change_mtu(request_id: impl Into<String>, mtu: u16) -> Self {
        let mut request = Self::new(RequestKind::ChangeMtu, request_id);
        request.mtu = mtu.clamp(MIN_MTU, MAX_MTU);
        request
    }

    pub fn read_phy(request_id: impl Into<String>) -> Self {
        Self::new(RequestKind::ReadPhy, request_id)
    }

    /// Only a hint to the controller; the result carries the PHYs
    /// actually in use afterwards.
    pub fn set_preferred_phy(
        request_id: impl Into<String>,
        tx: PhyMask,
        rx: PhyMask,
        options: PhyOptions,
    ) -> Self {
        let mut request = Self::new(RequestKind::SetPreferredPhy, request_id);
        request.phy = Some(PhyPreference { tx, rx, options });
        request
    }

    pub fn with_callback(mut self, callback: RequestCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    pub fn enable(&self) -> bool {
        self.enable
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    pub fn phy_preference(&self) -> Option<PhyPreference> {
        self.phy
    }

    pub fn characteristic_id(&self) -> Option<CharacteristicId> {
        match (self.service, self.characteristic) {
            (Some(service), Some(characteristic)) => {
                Some(CharacteristicId::new(service, characteristic))
            }
            _ => None,
        }
    }

    pub fn descriptor_id(&self) -> Option<DescriptorId> {
        let descriptor = self.descriptor?;
        self.characteristic_id().map(|c| c.descriptor(descriptor))
    }

    pub fn callback(&self) -> Option<&RequestCallback> {
        self.callback.as_ref()
    }

    pub(crate) fn take_callback(&mut self) -> Option<RequestCallback> {
        self.callback.take()
    }

    /// Build the failure record for this request.
    pub fn failure(&self, reason: FailReason) -> RequestFailure {
        RequestFailure {
            request_id: self.request_id.clone(),
            kind: self.kind,
            reason,
            payload: self.payload.clone(),
        }
    }
}
