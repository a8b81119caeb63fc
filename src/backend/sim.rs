//! Simulated backend: in-memory devices that answer standard control
//! requests and loop bulk data back. Used by the e2e tests and by
//! `usbwired --backend sim`.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use parking_lot::Mutex;
use tracing::{debug, trace};

use async_trait::async_trait;

use super::{
    BackendError, CancelOutcome, CompletionSink, DeviceHandle, Direction, TransferKind,
    UrbCompletion, UrbRequest, UsbBackend,
};
use crate::device::{Busid, UsbDevice};
use crate::endian::BeU32;
use crate::proto::{self, IsoPacket};

struct Parked {
    seqnum: u32,
    sink: CompletionSink,
}

struct SimDevice {
    info: UsbDevice,
    /// Pretend another process on the host holds this device.
    host_claimed: bool,
    /// Endpoints whose submissions park until cancelled or kicked.
    parked_endpoints: HashSet<u8>,
    /// Bulk loopback storage per endpoint number.
    bulk: HashMap<u8, VecDeque<Vec<u8>>>,
}

#[derive(Default)]
struct Inner {
    devices: BTreeMap<Busid, SimDevice>,
    handles: HashMap<u64, Busid>,
    claimed: HashMap<Busid, u64>,
    next_handle: u64,
    parked: HashMap<(u64, u32), Parked>,
    cancel_log: Vec<u32>,
}

/// See module docs. All state sits behind one short-lived lock; channel
/// sends happen outside it.
#[derive(Default)]
pub struct SimBackend {
    inner: Mutex<Inner>,
}

impl SimBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(devices: impl IntoIterator<Item = UsbDevice>) -> Self {
        let sim = Self::new();
        for dev in devices {
            sim.plug(dev);
        }
        sim
    }

    /// Attach a device. Visible on the next enumeration.
    pub fn plug(&self, info: UsbDevice) {
        let mut inner = self.inner.lock();
        inner.devices.insert(
            info.busid,
            SimDevice {
                info,
                host_claimed: false,
                parked_endpoints: HashSet::new(),
                bulk: HashMap::new(),
            },
        );
    }

    /// Detach a device. Claims on it die with it.
    pub fn unplug(&self, busid: &Busid) {
        let mut inner = self.inner.lock();
        inner.devices.remove(busid);
        if let Some(handle) = inner.claimed.remove(busid) {
            inner.handles.remove(&handle);
        }
    }

    /// Make submissions on `ep` hang until cancelled (for unlink and
    /// teardown tests).
    pub fn park_endpoint(&self, busid: &Busid, ep: u8) {
        if let Some(dev) = self.inner.lock().devices.get_mut(busid) {
            dev.parked_endpoints.insert(ep);
        }
    }

    /// Simulate the host itself holding the device.
    pub fn set_host_claimed(&self, busid: &Busid, held: bool) {
        if let Some(dev) = self.inner.lock().devices.get_mut(busid) {
            dev.host_claimed = held;
        }
    }

    /// Seqnums cancel() was called for, in call order.
    pub fn cancel_log(&self) -> Vec<u32> {
        self.inner.lock().cancel_log.clone()
    }

    pub fn claim_count(&self) -> usize {
        self.inner.lock().claimed.len()
    }

    fn control_response(info: &UsbDevice, setup: [u8; 8]) -> Result<Vec<u8>, i32> {
        let request_type = setup[0];
        let request = setup[1];
        let value = u16::from_le_bytes([setup[2], setup[3]]);

        if request_type & 0x80 == 0 {
            // OUT control requests (SET_*) are acknowledged without data.
            return Ok(Vec::new());
        }

        match request {
            // GET_DESCRIPTOR
            0x06 => match (value >> 8) as u8 {
                0x01 => Ok(device_descriptor(info)),
                0x02 => Ok(config_descriptor(info)),
                0x03 => string_descriptor(info, (value & 0xff) as u8).ok_or(proto::EPIPE),
                _ => Err(proto::EPIPE),
            },
            // GET_CONFIGURATION
            0x08 => Ok(vec![info.configuration_value]),
            // GET_STATUS
            0x00 => Ok(vec![0, 0]),
            _ => Err(proto::EPIPE),
        }
    }
}

fn device_descriptor(info: &UsbDevice) -> Vec<u8> {
    let max_packet0 = match info.speed {
        crate::device::Speed::Low => 8,
        _ => 64,
    };
    let str_index = |s: &Option<String>, idx: u8| if s.is_some() { idx } else { 0 };
    vec![
        0x12,
        0x01,
        0x00,
        0x02,
        info.device_class,
        info.device_subclass,
        info.device_protocol,
        max_packet0,
        (info.vendor_id & 0xff) as u8,
        (info.vendor_id >> 8) as u8,
        (info.product_id & 0xff) as u8,
        (info.product_id >> 8) as u8,
        (info.bcd_device & 0xff) as u8,
        (info.bcd_device >> 8) as u8,
        str_index(&info.manufacturer, 1),
        str_index(&info.product, 2),
        str_index(&info.serial, 3),
        info.num_configurations,
    ]
}

fn config_descriptor(info: &UsbDevice) -> Vec<u8> {
    let mut body = Vec::new();
    for (i, iface) in info.interfaces.iter().enumerate() {
        // All declared endpoints hang off the first interface.
        let eps: &[u8] = if i == 0 { &info.endpoints } else { &[] };
        body.extend_from_slice(&[
            0x09,
            0x04,
            iface.number,
            0x00,
            eps.len() as u8 * 2,
            iface.class,
            iface.subclass,
            iface.protocol,
            0x00,
        ]);
        for &ep in eps {
            for addr in [0x80 | ep, ep] {
                // bulk, 512-byte max packet
                body.extend_from_slice(&[0x07, 0x05, addr, 0x02, 0x00, 0x02, 0x00]);
            }
        }
    }
    let total = (9 + body.len()) as u16;
    let mut out = vec![
        0x09,
        0x02,
        (total & 0xff) as u8,
        (total >> 8) as u8,
        info.interfaces.len() as u8,
        info.configuration_value,
        0x00,
        0x80,
        0xfa,
    ];
    out.extend_from_slice(&body);
    out
}

fn string_descriptor(info: &UsbDevice, index: u8) -> Option<Vec<u8>> {
    if index == 0 {
        return Some(vec![0x04, 0x03, 0x09, 0x04]);
    }
    let s = match index {
        1 => info.manufacturer.as_ref()?,
        2 => info.product.as_ref()?,
        3 => info.serial.as_ref()?,
        _ => return None,
    };
    let mut out = vec![0, 0x03];
    for unit in s.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out[0] = out.len() as u8;
    Some(out)
}

#[async_trait]
impl UsbBackend for SimBackend {
    async fn enumerate(&self) -> Result<Vec<UsbDevice>, BackendError> {
        Ok(self
            .inner
            .lock()
            .devices
            .values()
            .map(|d| d.info.clone())
            .collect())
    }

    async fn claim(&self, busid: &Busid) -> Result<DeviceHandle, BackendError> {
        let mut inner = self.inner.lock();
        let dev = inner.devices.get(busid).ok_or(BackendError::NoSuchDevice)?;
        if dev.host_claimed || inner.claimed.contains_key(busid) {
            return Err(BackendError::Busy);
        }
        inner.next_handle += 1;
        let handle = inner.next_handle;
        inner.handles.insert(handle, *busid);
        inner.claimed.insert(*busid, handle);
        debug!(busid = %busid, handle, "sim device claimed");
        Ok(DeviceHandle(handle))
    }

    async fn release(&self, handle: DeviceHandle) -> Result<(), BackendError> {
        let orphans = {
            let mut inner = self.inner.lock();
            let Some(busid) = inner.handles.remove(&handle.0) else {
                return Ok(());
            };
            inner.claimed.remove(&busid);
            let keys: Vec<(u64, u32)> = inner
                .parked
                .keys()
                .filter(|(h, _)| *h == handle.0)
                .copied()
                .collect();
            keys.into_iter()
                .filter_map(|k| inner.parked.remove(&k))
                .collect::<Vec<_>>()
        };
        for parked in orphans {
            deliver(parked.sink, UrbCompletion::cancelled(parked.seqnum));
        }
        Ok(())
    }

    async fn submit(
        &self,
        handle: DeviceHandle,
        urb: UrbRequest,
        sink: CompletionSink,
    ) -> Result<(), BackendError> {
        let completion = {
            let mut inner = self.inner.lock();
            let busid = *inner
                .handles
                .get(&handle.0)
                .ok_or(BackendError::NoSuchDevice)?;
            let parked_here = inner
                .devices
                .get(&busid)
                .ok_or(BackendError::NoSuchDevice)?
                .parked_endpoints
                .contains(&urb.endpoint);
            if parked_here {
                trace!(seqnum = urb.seqnum, ep = urb.endpoint, "urb parked");
                inner.parked.insert(
                    (handle.0, urb.seqnum),
                    Parked {
                        seqnum: urb.seqnum,
                        sink,
                    },
                );
                return Ok(());
            }
            let dev = inner
                .devices
                .get_mut(&busid)
                .ok_or(BackendError::NoSuchDevice)?;

            match urb.kind {
                TransferKind::Control => match Self::control_response(&dev.info, urb.setup) {
                    Ok(data) => {
                        let wanted = u16::from_le_bytes([urb.setup[6], urb.setup[7]]) as usize;
                        let cap = wanted.min(urb.buffer_length as usize);
                        let mut data = data;
                        data.truncate(cap);
                        if urb.direction == Direction::Out {
                            UrbCompletion {
                                actual_length: urb.out_data.len() as u32,
                                ..UrbCompletion::success(urb.seqnum, Vec::new())
                            }
                        } else {
                            UrbCompletion::success(urb.seqnum, data)
                        }
                    }
                    Err(status) => UrbCompletion::failure(urb.seqnum, status),
                },
                TransferKind::Bulk | TransferKind::Interrupt => match urb.direction {
                    Direction::Out => {
                        let len = urb.out_data.len() as u32;
                        dev.bulk
                            .entry(urb.endpoint)
                            .or_default()
                            .push_back(urb.out_data);
                        UrbCompletion {
                            actual_length: len,
                            ..UrbCompletion::success(urb.seqnum, Vec::new())
                        }
                    }
                    Direction::In => {
                        let mut data = dev
                            .bulk
                            .get_mut(&urb.endpoint)
                            .and_then(|q| q.pop_front())
                            .unwrap_or_default();
                        data.truncate(urb.buffer_length as usize);
                        UrbCompletion::success(urb.seqnum, data)
                    }
                },
                TransferKind::Isochronous => {
                    let packets: Vec<IsoPacket> = urb
                        .iso_packets
                        .iter()
                        .map(|&(off, len)| IsoPacket {
                            offset: BeU32::new(off),
                            length: BeU32::new(len),
                            actual_length: BeU32::new(len),
                            status: BeU32::ZERO,
                        })
                        .collect();
                    let total: u32 = urb.iso_packets.iter().map(|&(_, len)| len).sum();
                    let data = if urb.direction == Direction::In {
                        vec![0u8; total as usize]
                    } else {
                        Vec::new()
                    };
                    UrbCompletion {
                        seqnum: urb.seqnum,
                        status: 0,
                        actual_length: total,
                        data,
                        start_frame: urb.start_frame,
                        error_count: 0,
                        iso_packets: packets,
                    }
                }
            }
        };

        deliver(sink, completion);
        Ok(())
    }

    async fn cancel(&self, handle: DeviceHandle, seqnum: u32) -> Result<CancelOutcome, BackendError> {
        let parked = {
            let mut inner = self.inner.lock();
            inner.cancel_log.push(seqnum);
            inner.parked.remove(&(handle.0, seqnum))
        };
        match parked {
            Some(parked) => {
                deliver(parked.sink, UrbCompletion::cancelled(seqnum));
                Ok(CancelOutcome::Cancelled)
            }
            None => Ok(CancelOutcome::AlreadyDone),
        }
    }
}

/// Completions go out on a separate task so a full (or abandoned) sink
/// never wedges the submitter, which may be the very task that drains
/// the sink.
fn deliver(sink: CompletionSink, completion: UrbCompletion) {
    tokio::spawn(async move {
        let _ = sink.send(completion).await;
    });
}

/// A keyboard-ish low-speed device used by tests and demo mode.
pub fn demo_device(busid: Busid) -> UsbDevice {
    UsbDevice {
        busid,
        speed: crate::device::Speed::Low,
        vendor_id: 0x05ac,
        product_id: 0x030d,
        bcd_device: 0x0100,
        device_class: 0,
        device_subclass: 0,
        device_protocol: 0,
        configuration_value: 1,
        num_configurations: 1,
        interfaces: vec![crate::device::InterfaceInfo {
            number: 0,
            class: 3,
            subclass: 1,
            protocol: 1,
        }],
        endpoints: vec![1],
        manufacturer: Some("Example".to_string()),
        product: Some("Example Keyboard".to_string()),
        serial: Some("0001".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn busid() -> Busid {
        Busid::new(1, 1)
    }

    fn control_in(seqnum: u32, setup: [u8; 8], len: u32) -> UrbRequest {
        UrbRequest {
            seqnum,
            endpoint: 0,
            direction: Direction::In,
            kind: TransferKind::Control,
            setup,
            buffer_length: len,
            out_data: Vec::new(),
            iso_packets: Vec::new(),
            interval: 0,
            start_frame: 0,
            flags: 0,
        }
    }

    #[tokio::test]
    async fn get_device_descriptor() {
        let sim = SimBackend::with_devices([demo_device(busid())]);
        let handle = sim.claim(&busid()).await.unwrap();
        let (tx, mut rx) = mpsc::channel(4);

        let setup = [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00];
        sim.submit(handle, control_in(1, setup, 18), tx).await.unwrap();

        let done = rx.recv().await.unwrap();
        assert_eq!(done.seqnum, 1);
        assert_eq!(done.status, 0);
        assert_eq!(done.actual_length, 18);
        assert_eq!(done.data.len(), 18);
        // idVendor is little-endian inside the descriptor
        assert_eq!(&done.data[8..10], &[0xac, 0x05]);
    }

    #[tokio::test]
    async fn exclusive_claim() {
        let sim = SimBackend::with_devices([demo_device(busid())]);
        let h = sim.claim(&busid()).await.unwrap();
        assert!(matches!(sim.claim(&busid()).await, Err(BackendError::Busy)));
        sim.release(h).await.unwrap();
        sim.claim(&busid()).await.unwrap();
    }

    #[tokio::test]
    async fn host_claimed_device_is_busy() {
        let sim = SimBackend::with_devices([demo_device(busid())]);
        sim.set_host_claimed(&busid(), true);
        assert!(matches!(sim.claim(&busid()).await, Err(BackendError::Busy)));
    }

    #[tokio::test]
    async fn bulk_loopback() {
        let sim = SimBackend::with_devices([demo_device(busid())]);
        let handle = sim.claim(&busid()).await.unwrap();
        let (tx, mut rx) = mpsc::channel(4);

        let out = UrbRequest {
            seqnum: 1,
            endpoint: 1,
            direction: Direction::Out,
            kind: TransferKind::Bulk,
            setup: [0; 8],
            buffer_length: 3,
            out_data: vec![1, 2, 3],
            iso_packets: Vec::new(),
            interval: 0,
            start_frame: 0,
            flags: 0,
        };
        sim.submit(handle, out, tx.clone()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().actual_length, 3);

        let inp = UrbRequest {
            seqnum: 2,
            endpoint: 1,
            direction: Direction::In,
            kind: TransferKind::Bulk,
            setup: [0; 8],
            buffer_length: 64,
            out_data: Vec::new(),
            iso_packets: Vec::new(),
            interval: 0,
            start_frame: 0,
            flags: 0,
        };
        sim.submit(handle, inp, tx).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().data, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn parked_urb_resolves_on_cancel() {
        let sim = SimBackend::with_devices([demo_device(busid())]);
        sim.park_endpoint(&busid(), 1);
        let handle = sim.claim(&busid()).await.unwrap();
        let (tx, mut rx) = mpsc::channel(4);

        let urb = UrbRequest {
            seqnum: 0x42,
            endpoint: 1,
            direction: Direction::In,
            kind: TransferKind::Bulk,
            setup: [0; 8],
            buffer_length: 64,
            out_data: Vec::new(),
            iso_packets: Vec::new(),
            interval: 0,
            start_frame: 0,
            flags: 0,
        };
        sim.submit(handle, urb, tx).await.unwrap();
        assert!(rx.try_recv().is_err());

        assert_eq!(
            sim.cancel(handle, 0x42).await.unwrap(),
            CancelOutcome::Cancelled
        );
        let done = rx.recv().await.unwrap();
        assert_eq!(done.seqnum, 0x42);
        assert_eq!(done.status, proto::ECONNRESET);

        assert_eq!(
            sim.cancel(handle, 0x42).await.unwrap(),
            CancelOutcome::AlreadyDone
        );
        assert_eq!(sim.cancel_log(), vec![0x42, 0x42]);
    }
}
