//! BLE transport trait definitions and core types
//!
//! Defines the abstract central/link interface that both the simulated
//! transport and platform radio adapters conform to. Every `GattLink`
//! operation is a submission: `Err` means the stack refused it outright,
//! `Ok` means exactly one matching `TransportEvent` will follow on the
//! link's `EventSender` (unless the link dies first).

use std::fmt;
use std::ops::BitOr;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use super::gatt::{CharacteristicId, DescriptorId, GattService, GattStatus};
use super::BleError;

/// A 6-byte link-layer address, rendered as `AA:BB:CC:DD:EE:FF`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BleAddress(pub [u8; 6]);

/// Returned when an address string is not six upper-case hex octets
/// separated by colons.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed BLE address: {0:?}")]
pub struct AddressParseError(pub String);

impl FromStr for BleAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || AddressParseError(s.to_string());
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(err());
        }
        let mut bytes = [0u8; 6];
        for (slot, part) in bytes.iter_mut().zip(parts) {
            let valid = part.len() == 2
                && part
                    .chars()
                    .all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c));
            if !valid {
                return Err(err());
            }
            *slot = u8::from_str_radix(part, 16).map_err(|_| err())?;
        }
        Ok(BleAddress(bytes))
    }
}

impl fmt::Display for BleAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// What the scan collaborator reports for each advertisement it sees.
#[derive(Debug, Clone)]
pub struct ScanRecord {
    /// Address of the advertising device.
    pub address: BleAddress,
    /// Advertised local name, if any.
    pub name: Option<String>,
    /// Received signal strength indicator (if available).
    pub rssi: Option<i16>,
    /// Raw advertisement data.
    pub data: Vec<u8>,
}

/// Preferred transport for links to dual-mode peripherals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TransportMode {
    Auto,
    BrEdr,
    #[default]
    Le,
}

/// ATT write procedure used for a characteristic write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WriteType {
    /// Write request, acknowledged by the peer.
    #[default]
    Default,
    /// Write command, no acknowledgment on the air.
    NoResponse,
    /// Authenticated signed write.
    Signed,
}

/// A physical layer an LE link can run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phy {
    Le1M,
    Le2M,
    LeCoded,
}

/// A set of acceptable PHYs, used for connection and link preferences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PhyMask(pub u8);

impl PhyMask {
    pub const LE_1M: PhyMask = PhyMask(0x01);
    pub const LE_2M: PhyMask = PhyMask(0x02);
    pub const LE_CODED: PhyMask = PhyMask(0x04);

    pub fn contains(self, phy: Phy) -> bool {
        let bit = match phy {
            Phy::Le1M => Self::LE_1M,
            Phy::Le2M => Self::LE_2M,
            Phy::LeCoded => Self::LE_CODED,
        };
        self.0 & bit.0 != 0
    }

    pub fn intersect(self, other: PhyMask) -> PhyMask {
        PhyMask(self.0 & other.0)
    }

    /// Fastest PHY in the set. An empty set falls back to 1M.
    pub fn fastest(self) -> Phy {
        if self.contains(Phy::Le2M) {
            Phy::Le2M
        } else if self.contains(Phy::Le1M) || !self.contains(Phy::LeCoded) {
            Phy::Le1M
        } else {
            Phy::LeCoded
        }
    }
}

impl Default for PhyMask {
    fn default() -> Self {
        Self::LE_1M
    }
}

impl BitOr for PhyMask {
    type Output = PhyMask;

    fn bitor(self, rhs: PhyMask) -> PhyMask {
        PhyMask(self.0 | rhs.0)
    }
}

/// Coding preference when transmitting on the LE Coded PHY.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PhyOptions {
    #[default]
    NoPreferred,
    S2,
    S8,
}

/// Pairing state of the peripheral as reported by the host stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BondState {
    #[default]
    None,
    Bonding,
    Bonded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Disconnected,
}

/// Completion (or unsolicited) event reported by a link.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    LinkStateChanged {
        status: GattStatus,
        state: LinkState,
    },
    ServicesDiscovered {
        status: GattStatus,
    },
    CharacteristicRead {
        status: GattStatus,
        target: CharacteristicId,
        value: Vec<u8>,
    },
    CharacteristicWritten {
        status: GattStatus,
        target: CharacteristicId,
    },
    /// Peripheral-initiated notification or indication.
    CharacteristicChanged {
        target: CharacteristicId,
        value: Vec<u8>,
    },
    DescriptorRead {
        status: GattStatus,
        target: DescriptorId,
        value: Vec<u8>,
    },
    DescriptorWritten {
        status: GattStatus,
        target: DescriptorId,
        value: Vec<u8>,
    },
    MtuChanged {
        status: GattStatus,
        mtu: u16,
    },
    RssiRead {
        status: GattStatus,
        rssi: i16,
    },
    PhyRead {
        status: GattStatus,
        tx: Phy,
        rx: Phy,
    },
    /// Completion of a preference request, or a PHY change the peer
    /// initiated.
    PhyUpdated {
        status: GattStatus,
        tx: Phy,
        rx: Phy,
    },
    BondStateChanged {
        state: BondState,
    },
}

/// An event tagged with the link that produced it.
#[derive(Debug, Clone)]
pub struct LinkEvent {
    pub link_id: u64,
    pub event: TransportEvent,
}

/// Handed to `BleCentral::connect`; the link reports every completion
/// through it. Events sent after the owning connection has moved on to a
/// newer link are dropped by the receiver.
#[derive(Debug, Clone)]
pub struct EventSender {
    link_id: u64,
    tx: mpsc::UnboundedSender<LinkEvent>,
}

impl EventSender {
    pub fn new(link_id: u64, tx: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self { link_id, tx }
    }

    pub fn link_id(&self) -> u64 {
        self.link_id
    }

    /// Report an event. Returns false if the receiving connection is gone.
    pub fn send(&self, event: TransportEvent) -> bool {
        self.tx
            .send(LinkEvent {
                link_id: self.link_id,
                event,
            })
            .is_ok()
    }
}

/// An open (or opening) GATT client link to one peripheral.
///
/// The link is an owned resource: it is acquired through
/// `BleCentral::connect` and must be `close`d before being dropped.
#[async_trait]
pub trait GattLink: Send + Sync {
    /// Request link teardown; reported as `LinkStateChanged(Disconnected)`.
    async fn disconnect(&self) -> Result<(), BleError>;

    /// Release the link handle. No further events are reported.
    async fn close(&self);

    async fn discover_services(&self) -> Result<(), BleError>;

    /// Services from the most recent successful discovery.
    fn services(&self) -> Vec<GattService>;

    async fn read_characteristic(&self, target: &CharacteristicId) -> Result<(), BleError>;

    async fn write_characteristic(
        &self,
        target: &CharacteristicId,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), BleError>;

    async fn read_descriptor(&self, target: &DescriptorId) -> Result<(), BleError>;

    async fn write_descriptor(&self, target: &DescriptorId, value: &[u8]) -> Result<(), BleError>;

    /// Local registration for notifications/indications on a characteristic.
    /// Completes synchronously; no event follows.
    async fn set_characteristic_notification(
        &self,
        target: &CharacteristicId,
        enable: bool,
    ) -> Result<(), BleError>;

    async fn request_mtu(&self, mtu: u16) -> Result<(), BleError>;

    async fn read_rssi(&self) -> Result<(), BleError>;

    /// Reported as `PhyRead`.
    async fn read_phy(&self) -> Result<(), BleError>;

    /// Ask for a PHY change. The controller may ignore the preference;
    /// the PHYs actually in use are reported as `PhyUpdated`.
    async fn set_preferred_phy(
        &self,
        tx: PhyMask,
        rx: PhyMask,
        options: PhyOptions,
    ) -> Result<(), BleError>;

    /// Drop the platform's cached GATT database for this peer. Returns
    /// whether the invalidation was performed.
    async fn invalidate_service_cache(&self) -> bool;
}

/// BLE central role: scanning for advertisements and opening links.
#[async_trait]
pub trait BleCentral: Send + Sync {
    /// Start scanning for BLE advertisements.
    async fn start_scan(&self) -> Result<(), BleError>;

    /// Stop scanning.
    async fn stop_scan(&self) -> Result<(), BleError>;

    /// Subscribe to scan results.
    fn advertisements(&self) -> broadcast::Receiver<ScanRecord>;

    /// Pairing state the host stack currently holds for `address`.
    fn bond_state(&self, address: &BleAddress) -> BondState;

    /// Open a link to the peripheral at `address`, preferring the PHYs in
    /// `phy`. Link-up is reported asynchronously through `events`.
    async fn connect(
        &self,
        address: &BleAddress,
        mode: TransportMode,
        phy: PhyMask,
        events: EventSender,
    ) -> Result<Box<dyn GattLink>, BleError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ble_address_parse_and_display() {
        let addr: BleAddress = "01:02:0A:FF:10:EE".parse().unwrap();
        assert_eq!(addr, BleAddress([0x01, 0x02, 0x0A, 0xFF, 0x10, 0xEE]));
        assert_eq!(addr.to_string(), "01:02:0A:FF:10:EE");
    }

    #[test]
    fn test_ble_address_rejects_malformed() {
        for bad in [
            "",
            "01:02:03:04:05",
            "01:02:03:04:05:06:07",
            "01-02-03-04-05-06",
            "01:02:03:04:05:0g",
            "aa:bb:cc:dd:ee:ff",
            "1:02:03:04:05:06",
            "001:02:03:04:05:06",
        ] {
            assert!(bad.parse::<BleAddress>().is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn test_phy_mask_picks_fastest() {
        assert_eq!(PhyMask::LE_1M.fastest(), Phy::Le1M);
        assert_eq!((PhyMask::LE_1M | PhyMask::LE_2M).fastest(), Phy::Le2M);
        assert_eq!(PhyMask::LE_CODED.fastest(), Phy::LeCoded);
        assert_eq!(PhyMask(0).fastest(), Phy::Le1M);

        let both = PhyMask::LE_1M | PhyMask::LE_CODED;
        assert!(both.contains(Phy::LeCoded));
        assert!(!both.contains(Phy::Le2M));
        assert_eq!(both.intersect(PhyMask::LE_2M | PhyMask::LE_CODED), PhyMask::LE_CODED);
    }

    #[test]
    fn test_event_sender_tags_link_id() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sender = EventSender::new(7, tx);
        assert!(sender.send(TransportEvent::ServicesDiscovered {
            status: GattStatus::SUCCESS,
        }));

        let received = rx.try_recv().unwrap();
        assert_eq!(received.link_id, 7);
        assert!(matches!(
            received.event,
            TransportEvent::ServicesDiscovered { status } if status.is_success()
        ));

        drop(rx);
        assert!(!sender.send(TransportEvent::RssiRead {
            status: GattStatus::SUCCESS,
            rssi: -40,
        }));
    }
}
