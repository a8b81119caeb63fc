//! Local USB device model and the registry of currently attached devices.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

use crate::backend::{BackendError, UsbBackend};
use crate::proto::{self, DeviceRecord, InterfaceRecord};

/// Canonical `"{bus}-{dev}"` device identifier.
///
/// Both halves are decimal numbers in 1..=999. This is the key used on the
/// wire (busid field), in the binding registry, and at the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Busid {
    pub bus: u32,
    pub dev: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid busid {0:?}, expected \"<bus>-<dev>\"")]
pub struct BusidParseError(pub String);

impl Busid {
    pub fn new(bus: u32, dev: u32) -> Self {
        Self { bus, dev }
    }

    /// Backends hand out an opaque 16-bit locator; bus lives in the high
    /// byte, device number in the low byte.
    pub fn from_locator(locator: u16) -> Self {
        Self {
            bus: u32::from(locator >> 8),
            dev: u32::from(locator & 0xff),
        }
    }

    /// `devid` as it appears in URB headers.
    pub fn devid(self) -> u32 {
        (self.bus << 16) | self.dev
    }
}

impl fmt::Display for Busid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.bus, self.dev)
    }
}

impl FromStr for Busid {
    type Err = BusidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || BusidParseError(s.to_string());
        let (bus, dev) = s.split_once('-').ok_or_else(err)?;
        let parse = |part: &str| -> Result<u32, BusidParseError> {
            if part.is_empty() || part.len() > 3 || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(err());
            }
            let n: u32 = part.parse().map_err(|_| err())?;
            if n == 0 {
                return Err(err());
            }
            Ok(n)
        };
        Ok(Busid {
            bus: parse(bus)?,
            dev: parse(dev)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Speed {
    Unknown = proto::SPEED_UNKNOWN,
    Low = proto::SPEED_LOW,
    Full = proto::SPEED_FULL,
    High = proto::SPEED_HIGH,
    Wireless = proto::SPEED_WIRELESS,
    Super = proto::SPEED_SUPER,
    SuperPlus = proto::SPEED_SUPER_PLUS,
}

impl Speed {
    pub fn as_wire(self) -> u32 {
        self as u32
    }

    /// Linux sysfs reports speed as Mbit/s strings.
    pub fn from_sysfs(s: &str) -> Self {
        match s.trim() {
            "1.5" => Speed::Low,
            "12" => Speed::Full,
            "480" => Speed::High,
            "5000" => Speed::Super,
            "10000" | "20000" => Speed::SuperPlus,
            _ => Speed::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub number: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

impl InterfaceInfo {
    pub fn to_record(self) -> InterfaceRecord {
        InterfaceRecord {
            b_interface_class: self.class,
            b_interface_sub_class: self.subclass,
            b_interface_protocol: self.protocol,
            padding: 0,
        }
    }
}

/// Snapshot of one locally attached device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDevice {
    pub busid: Busid,
    pub speed: Speed,
    pub vendor_id: u16,
    pub product_id: u16,
    pub bcd_device: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub configuration_value: u8,
    pub num_configurations: u8,
    pub interfaces: Vec<InterfaceInfo>,
    /// Endpoint numbers (without the direction bit) the active
    /// configuration declares, excluding the default control endpoint.
    pub endpoints: Vec<u8>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial: Option<String>,
}

impl UsbDevice {
    pub fn devid(&self) -> u32 {
        self.busid.devid()
    }

    /// Export path reported to clients.
    pub fn path(&self) -> String {
        format!("/sys/bus/usb/devices/{}", self.busid)
    }

    pub fn has_endpoint(&self, ep: u8) -> bool {
        ep == 0 || self.endpoints.contains(&ep)
    }

    /// Build the 312-byte exported device record.
    pub fn to_record(&self) -> DeviceRecord {
        let mut rec = DeviceRecord::empty();
        rec.set_path(&self.path());
        rec.set_busid(&self.busid.to_string());
        rec.busnum = self.busid.bus.into();
        rec.devnum = self.busid.dev.into();
        rec.speed = self.speed.as_wire().into();
        rec.id_vendor = self.vendor_id.into();
        rec.id_product = self.product_id.into();
        rec.bcd_device = self.bcd_device.into();
        rec.b_device_class = self.device_class;
        rec.b_device_sub_class = self.device_subclass;
        rec.b_device_protocol = self.device_protocol;
        rec.b_configuration_value = self.configuration_value;
        rec.b_num_configurations = self.num_configurations;
        rec.b_num_interfaces = self.interfaces.len() as u8;
        rec
    }
}

#[derive(Debug, Clone)]
pub enum HotplugEvent {
    Connected(UsbDevice),
    Disconnected(Busid),
}

/// Registry of currently attached devices, keyed by busid.
///
/// `refresh` swaps in a fresh backend scan and fans out the diff as
/// hotplug events, in event order, to every subscriber.
pub struct DeviceRegistry {
    devices: Mutex<BTreeMap<Busid, UsbDevice>>,
    events: broadcast::Sender<HotplugEvent>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            devices: Mutex::new(BTreeMap::new()),
            events,
        }
    }

    /// Re-enumerate through the backend and replace the snapshot.
    ///
    /// Returns the new snapshot in busid order.
    pub async fn refresh(&self, backend: &Arc<dyn UsbBackend>) -> Result<Vec<UsbDevice>, BackendError> {
        let scanned = backend.enumerate().await?;
        let mut fresh = BTreeMap::new();
        for dev in scanned {
            fresh.insert(dev.busid, dev);
        }

        let diff = {
            let mut current = self.devices.lock();
            let mut diff = Vec::new();
            for (busid, dev) in &fresh {
                if !current.contains_key(busid) {
                    diff.push(HotplugEvent::Connected(dev.clone()));
                }
            }
            for busid in current.keys() {
                if !fresh.contains_key(busid) {
                    diff.push(HotplugEvent::Disconnected(*busid));
                }
            }
            *current = fresh.clone();
            diff
        };

        for event in diff {
            match &event {
                HotplugEvent::Connected(d) => debug!(busid = %d.busid, "device attached"),
                HotplugEvent::Disconnected(id) => debug!(busid = %id, "device detached"),
            }
            // No subscribers is fine.
            let _ = self.events.send(event);
        }

        Ok(fresh.into_values().collect())
    }

    pub fn lookup(&self, busid: &Busid) -> Option<UsbDevice> {
        self.devices.lock().get(busid).cloned()
    }

    /// Current devices in busid order.
    pub fn snapshot(&self) -> Vec<UsbDevice> {
        self.devices.lock().values().cloned().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HotplugEvent> {
        self.events.subscribe()
    }

    pub fn len(&self) -> usize {
        self.devices.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busid_parse_and_format() {
        let id: Busid = "3-12".parse().unwrap();
        assert_eq!(id, Busid::new(3, 12));
        assert_eq!(id.to_string(), "3-12");
        assert_eq!(id.devid(), (3 << 16) | 12);
    }

    #[test]
    fn busid_rejects_garbage() {
        for bad in ["", "1", "-1", "1-", "1-0", "0-1", "a-1", "1-b", "1234-1", "1-1-1", "1 1"] {
            assert!(bad.parse::<Busid>().is_err(), "{bad:?} should not parse");
        }
    }

    #[test]
    fn busid_from_locator_round_trips() {
        let id = Busid::from_locator(0x030c);
        assert_eq!(id, Busid::new(3, 12));
        assert_eq!(id.to_string().parse::<Busid>().unwrap(), id);
    }

    #[test]
    fn busid_ordering_is_numeric() {
        let mut ids: Vec<Busid> = ["2-1", "1-10", "1-2", "10-1"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        ids.sort();
        let strs: Vec<String> = ids.iter().map(|b| b.to_string()).collect();
        assert_eq!(strs, ["1-2", "1-10", "2-1", "10-1"]);
    }

    #[test]
    fn speed_from_sysfs() {
        assert_eq!(Speed::from_sysfs("1.5"), Speed::Low);
        assert_eq!(Speed::from_sysfs("480"), Speed::High);
        assert_eq!(Speed::from_sysfs("5000"), Speed::Super);
        assert_eq!(Speed::from_sysfs("lots"), Speed::Unknown);
    }

    #[test]
    fn record_reflects_device() {
        let dev = UsbDevice {
            busid: Busid::new(1, 1),
            speed: Speed::Low,
            vendor_id: 0x05ac,
            product_id: 0x030d,
            bcd_device: 0x0100,
            device_class: 0,
            device_subclass: 0,
            device_protocol: 0,
            configuration_value: 1,
            num_configurations: 1,
            interfaces: vec![InterfaceInfo {
                number: 0,
                class: 3,
                subclass: 1,
                protocol: 2,
            }],
            endpoints: vec![1],
            manufacturer: None,
            product: None,
            serial: None,
        };
        let rec = dev.to_record();
        assert_eq!(proto::trim_padded(&rec.busid), "1-1");
        assert_eq!(rec.speed.get(), proto::SPEED_LOW);
        assert_eq!(rec.id_vendor.get(), 0x05ac);
        assert_eq!(rec.b_num_interfaces, 1);
        assert!(dev.has_endpoint(0));
        assert!(dev.has_endpoint(1));
        assert!(!dev.has_endpoint(2));
    }
}
