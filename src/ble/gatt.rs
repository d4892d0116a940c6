//! GATT data model
//!
//! Services, characteristics and descriptors as reported by a link after
//! discovery, the status codes carried by transport completions, and the
//! Client Characteristic Configuration sentinels used to toggle
//! notifications and indications.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Bluetooth Base UUID (`00000000-0000-1000-8000-00805F9B34FB`).
const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;

/// Expand a 16-bit assigned number into a full 128-bit UUID.
pub fn uuid_from_short(short: u16) -> Uuid {
    Uuid::from_u128(BASE_UUID | ((short as u128) << 96))
}

/// Client Characteristic Configuration descriptor (0x2902).
pub const CLIENT_CHARACTERISTIC_CONFIG: Uuid =
    Uuid::from_u128(0x0000_2902_0000_1000_8000_0080_5F9B_34FB);

pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];
pub const ENABLE_INDICATION_VALUE: [u8; 2] = [0x02, 0x00];
pub const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];

/// Smallest and largest ATT MTU a request may ask for.
pub const MIN_MTU: u16 = 23;
pub const MAX_MTU: u16 = 517;

/// Status code attached to every transport completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GattStatus(pub u16);

impl GattStatus {
    pub const SUCCESS: GattStatus = GattStatus(0);
    /// Generic failure.
    pub const FAILURE: GattStatus = GattStatus(0x101);
    /// Transient link error that usually means the peer's service cache is
    /// stale; answered with a cache refresh rather than a failure report.
    pub const STALE_CACHE: GattStatus = GattStatus(133);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }

    pub fn is_stale_cache(self) -> bool {
        self == Self::STALE_CACHE
    }
}

/// A characteristic as exposed by a discovered service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub descriptors: Vec<Uuid>,
}

impl GattCharacteristic {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            descriptors: Vec::new(),
        }
    }

    /// A characteristic that carries a CCCD and can therefore notify/indicate.
    pub fn notifying(uuid: Uuid) -> Self {
        Self {
            uuid,
            descriptors: vec![CLIENT_CHARACTERISTIC_CONFIG],
        }
    }

    pub fn with_descriptor(mut self, descriptor: Uuid) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    pub fn has_descriptor(&self, descriptor: &Uuid) -> bool {
        self.descriptors.contains(descriptor)
    }
}

/// A primary service and its characteristics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

impl GattService {
    pub fn new(uuid: Uuid, characteristics: Vec<GattCharacteristic>) -> Self {
        Self {
            uuid,
            characteristics,
        }
    }

    pub fn characteristic(&self, uuid: &Uuid) -> Option<&GattCharacteristic> {
        self.characteristics.iter().find(|c| &c.uuid == uuid)
    }
}

/// Look up a service by UUID in a discovered service list.
pub fn find_service<'a>(services: &'a [GattService], uuid: &Uuid) -> Option<&'a GattService> {
    services.iter().find(|s| &s.uuid == uuid)
}

/// Address of a characteristic within the remote GATT database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CharacteristicId {
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl CharacteristicId {
    pub fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            service,
            characteristic,
        }
    }

    pub fn descriptor(&self, descriptor: Uuid) -> DescriptorId {
        DescriptorId {
            service: self.service,
            characteristic: self.characteristic,
            descriptor,
        }
    }

    /// Key used for per-characteristic configuration overrides.
    pub fn config_key(&self) -> String {
        format!("{}:{}", self.service, self.characteristic)
    }
}

/// Address of a descriptor within the remote GATT database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DescriptorId {
    pub service: Uuid,
    pub characteristic: Uuid,
    pub descriptor: Uuid,
}

impl DescriptorId {
    pub fn characteristic_id(&self) -> CharacteristicId {
        CharacteristicId::new(self.service, self.characteristic)
    }
}
