//! Linux real backend: sysfs enumeration plus usbfs URB relay.
//!
//! Each claimed device gets one blocking worker thread that owns the
//! `/dev/bus/usb/BBB/DDD` file descriptor. The async side talks to it
//! over a command channel with oneshot replies; completions are reaped
//! with `USBDEVFS_REAPURBNDELAY` and pushed into the per-connection
//! completion sink.
//!
//! The kernel holds raw pointers into a submitted URB and its transfer
//! buffer until the URB is reaped or discarded, so both live in stable
//! heap allocations owned by the worker until then.

use std::collections::HashMap;
use std::fs;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use super::{
    BackendError, CancelOutcome, CompletionSink, DeviceHandle, Direction, TransferKind,
    UrbCompletion, UrbRequest, UsbBackend,
};
use crate::device::{Busid, InterfaceInfo, Speed, UsbDevice};

const SYSFS_DEVICES: &str = "/sys/bus/usb/devices";
const DEVFS_ROOT: &str = "/dev/bus/usb";

// usbdevfs ioctl request codes: _IOC(dir, 'U', nr, size) with the
// generic Linux encoding. Note that usbfs historically inverted read
// and write in several of these; the codes below match the kernel
// headers, inversion and all.
const IOC_NONE: u64 = 0;
const IOC_WRITE: u64 = 1;
const IOC_READ: u64 = 2;

const fn ioc(dir: u64, nr: u64, size: u64) -> u64 {
    (dir << 30) | (size << 16) | ((b'U' as u64) << 8) | nr
}

const USBDEVFS_SUBMITURB: u64 = ioc(IOC_READ, 10, std::mem::size_of::<UsbfsUrb>() as u64);
const USBDEVFS_DISCARDURB: u64 = ioc(IOC_NONE, 11, 0);
const USBDEVFS_REAPURBNDELAY: u64 =
    ioc(IOC_WRITE, 13, std::mem::size_of::<*mut UsbfsUrb>() as u64);
const USBDEVFS_CLAIMINTERFACE: u64 =
    ioc(IOC_READ, 15, std::mem::size_of::<libc::c_uint>() as u64);
const USBDEVFS_RELEASEINTERFACE: u64 =
    ioc(IOC_READ, 16, std::mem::size_of::<libc::c_uint>() as u64);
const USBDEVFS_DISCONNECT_CLAIM: u64 =
    ioc(IOC_READ, 27, std::mem::size_of::<UsbfsDisconnectClaim>() as u64);

// usbdevfs URB types (ISO, type 0, is not relayed here).
const URB_TYPE_INTERRUPT: u8 = 1;
const URB_TYPE_CONTROL: u8 = 2;
const URB_TYPE_BULK: u8 = 3;

/// `struct usbdevfs_urb` without the trailing ISO descriptor array.
#[repr(C)]
struct UsbfsUrb {
    urb_type: u8,
    endpoint: u8,
    status: i32,
    flags: u32,
    buffer: *mut u8,
    buffer_length: i32,
    actual_length: i32,
    start_frame: i32,
    // Union with stream_id; only ISO uses it.
    number_of_packets: i32,
    error_count: i32,
    signr: u32,
    usercontext: *mut libc::c_void,
}

// Safety: the buffer pointer references the heap allocation owned by
// the same `PendingUrb`; moving the pair between threads is sound.
unsafe impl Send for UsbfsUrb {}

#[repr(C)]
struct UsbfsDisconnectClaim {
    interface: libc::c_uint,
    flags: libc::c_uint,
    driver: [u8; 256],
}

fn ioctl(fd: i32, request: u64, arg: *mut libc::c_void) -> Result<i32, Errno> {
    // Safety: callers pass pointers that outlive the call per the
    // usbdevfs contract for each request.
    let ret = unsafe { libc::ioctl(fd, request as libc::c_ulong, arg) };
    if ret < 0 {
        Err(Errno::last())
    } else {
        Ok(ret)
    }
}

fn map_errno(errno: Errno, what: &str) -> BackendError {
    match errno {
        Errno::EBUSY => BackendError::Busy,
        Errno::ENOENT | Errno::ENODEV => BackendError::NoSuchDevice,
        Errno::EACCES | Errno::EPERM => BackendError::AccessDenied(format!("{what}: {errno}")),
        other => BackendError::Unavailable(format!("{what}: {other}")),
    }
}

// === Worker thread ===

enum Command {
    Submit {
        urb: UrbRequest,
        sink: CompletionSink,
        reply: oneshot::Sender<Result<(), BackendError>>,
    },
    Cancel {
        seqnum: u32,
        reply: oneshot::Sender<CancelOutcome>,
    },
    Release,
}

struct PendingUrb {
    // Boxed: the kernel keeps the pointer until reap or discard.
    urb: Box<UsbfsUrb>,
    buffer: Vec<u8>,
    sink: CompletionSink,
    direction: Direction,
    kind: TransferKind,
}

struct Worker {
    file: fs::File,
    claimed_interfaces: Vec<u32>,
    pending: HashMap<u32, PendingUrb>,
}

impl Worker {
    fn run(mut self, commands: std_mpsc::Receiver<Command>) {
        let mut released = false;
        while !released {
            match commands.recv_timeout(Duration::from_millis(50)) {
                Ok(Command::Submit { urb, sink, reply }) => {
                    let _ = reply.send(self.submit(urb, sink));
                }
                Ok(Command::Cancel { seqnum, reply }) => {
                    let _ = reply.send(self.cancel(seqnum));
                }
                Ok(Command::Release) | Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                    released = true;
                }
                Err(std_mpsc::RecvTimeoutError::Timeout) => {}
            }
            self.reap();
        }
        self.shutdown();
    }

    fn submit(&mut self, request: UrbRequest, sink: CompletionSink) -> Result<(), BackendError> {
        if request.kind == TransferKind::Isochronous {
            // The variable-length usbdevfs ISO layout is not relayed
            // through this backend.
            return Err(BackendError::Unavailable(
                "isochronous transfers are not supported by the usbfs backend".to_string(),
            ));
        }
        if self.pending.contains_key(&request.seqnum) {
            return Err(BackendError::Unavailable("seqnum already in flight".to_string()));
        }

        let (urb_type, mut buffer) = match request.kind {
            TransferKind::Control => {
                // Control buffers start with the 8-byte setup packet.
                let mut buf = request.setup.to_vec();
                match request.direction {
                    Direction::Out => buf.extend_from_slice(&request.out_data),
                    Direction::In => buf.resize(8 + request.buffer_length as usize, 0),
                }
                (URB_TYPE_CONTROL, buf)
            }
            TransferKind::Interrupt | TransferKind::Bulk => {
                let buf = match request.direction {
                    Direction::Out => request.out_data.clone(),
                    Direction::In => vec![0u8; request.buffer_length as usize],
                };
                let urb_type = if request.kind == TransferKind::Interrupt {
                    URB_TYPE_INTERRUPT
                } else {
                    URB_TYPE_BULK
                };
                (urb_type, buf)
            }
            TransferKind::Isochronous => unreachable!(),
        };

        let endpoint = match request.direction {
            Direction::In => 0x80 | request.endpoint,
            Direction::Out => request.endpoint,
        };

        let mut urb = Box::new(UsbfsUrb {
            urb_type,
            endpoint,
            status: 0,
            flags: 0,
            buffer: buffer.as_mut_ptr(),
            buffer_length: buffer.len() as i32,
            actual_length: 0,
            start_frame: 0,
            number_of_packets: 0,
            error_count: 0,
            signr: 0,
            usercontext: request.seqnum as usize as *mut libc::c_void,
        });

        let fd = self.file.as_raw_fd();
        ioctl(fd, USBDEVFS_SUBMITURB, urb.as_mut() as *mut UsbfsUrb as *mut libc::c_void)
            .map_err(|e| map_errno(e, "submit urb"))?;
        trace!(seqnum = request.seqnum, endpoint, "urb handed to usbfs");

        self.pending.insert(
            request.seqnum,
            PendingUrb {
                urb,
                buffer,
                sink,
                direction: request.direction,
                kind: request.kind,
            },
        );
        Ok(())
    }

    fn cancel(&mut self, seqnum: u32) -> CancelOutcome {
        let Some(pending) = self.pending.get_mut(&seqnum) else {
            return CancelOutcome::AlreadyDone;
        };
        let fd = self.file.as_raw_fd();
        let ptr = pending.urb.as_mut() as *mut UsbfsUrb as *mut libc::c_void;
        match ioctl(fd, USBDEVFS_DISCARDURB, ptr) {
            // The discarded URB still comes back through reap with a
            // cancelled status.
            Ok(_) => CancelOutcome::Cancelled,
            // Completed in the race window.
            Err(Errno::EINVAL) | Err(Errno::ENOENT) => CancelOutcome::AlreadyDone,
            Err(e) => {
                warn!(seqnum, errno = %e, "discard urb failed");
                CancelOutcome::AlreadyDone
            }
        }
    }

    /// Reap every finished URB without blocking.
    fn reap(&mut self) {
        let fd = self.file.as_raw_fd();
        loop {
            let mut reaped: *mut UsbfsUrb = std::ptr::null_mut();
            match ioctl(
                fd,
                USBDEVFS_REAPURBNDELAY,
                &mut reaped as *mut *mut UsbfsUrb as *mut libc::c_void,
            ) {
                Ok(_) => {
                    let seqnum = {
                        // Safety: the pointer is one of our boxed URBs;
                        // it stays alive in `pending` until removed below.
                        let urb = unsafe { &*reaped };
                        urb.usercontext as usize as u32
                    };
                    let Some(pending) = self.pending.remove(&seqnum) else {
                        warn!(seqnum, "reaped unknown urb");
                        continue;
                    };
                    self.deliver(seqnum, pending);
                }
                Err(Errno::EAGAIN) => break,
                Err(Errno::ENODEV) => {
                    // Device went away: everything pending is dead.
                    self.fail_all(crate::proto::ENODEV);
                    break;
                }
                Err(e) => {
                    warn!(errno = %e, "reap failed");
                    break;
                }
            }
        }
    }

    fn deliver(&self, seqnum: u32, pending: PendingUrb) {
        let status = pending.urb.status;
        let actual = pending.urb.actual_length.max(0) as usize;
        let data = if pending.direction == Direction::In {
            let skip = if pending.kind == TransferKind::Control { 8 } else { 0 };
            let end = (skip + actual).min(pending.buffer.len());
            pending.buffer[skip.min(end)..end].to_vec()
        } else {
            Vec::new()
        };
        let completion = UrbCompletion {
            seqnum,
            status,
            actual_length: actual as u32,
            data,
            start_frame: pending.urb.start_frame.max(0) as u32,
            error_count: pending.urb.error_count.max(0) as u32,
            iso_packets: Vec::new(),
        };
        trace!(seqnum, status, actual, "urb reaped");
        // Bounded sink: a slow connection backpressures this worker.
        let _ = pending.sink.blocking_send(completion);
    }

    fn fail_all(&mut self, status: i32) {
        for (seqnum, pending) in self.pending.drain() {
            let _ = pending
                .sink
                .blocking_send(UrbCompletion::failure(seqnum, status));
            // These URBs were never reaped, so the kernel may still own
            // the pointers. Leaking beats a use-after-free.
            std::mem::forget(pending.urb);
            std::mem::forget(pending.buffer);
        }
    }

    fn shutdown(mut self) {
        let fd = self.file.as_raw_fd();
        let seqnums: Vec<u32> = self.pending.keys().copied().collect();
        for seqnum in seqnums {
            if let Some(pending) = self.pending.get_mut(&seqnum) {
                let ptr = pending.urb.as_mut() as *mut UsbfsUrb as *mut libc::c_void;
                let _ = ioctl(fd, USBDEVFS_DISCARDURB, ptr);
            }
        }
        // Collect the discards so the kernel is done with our buffers
        // before they are freed.
        for _ in 0..20 {
            if self.pending.is_empty() {
                break;
            }
            self.reap();
            std::thread::sleep(Duration::from_millis(10));
        }
        self.fail_all(crate::proto::ECONNRESET);

        for iface in &self.claimed_interfaces {
            let mut num = *iface as libc::c_uint;
            let _ = ioctl(
                fd,
                USBDEVFS_RELEASEINTERFACE,
                &mut num as *mut libc::c_uint as *mut libc::c_void,
            );
        }
        debug!("usbfs worker exiting");
    }
}

// === Backend ===

struct WorkerHandle {
    commands: std_mpsc::Sender<Command>,
    busid: Busid,
}

#[derive(Default)]
struct Inner {
    workers: HashMap<u64, WorkerHandle>,
    next_handle: u64,
}

pub struct UsbfsBackend {
    sysfs_root: PathBuf,
    devfs_root: PathBuf,
    inner: Mutex<Inner>,
}

impl UsbfsBackend {
    pub fn new() -> Self {
        Self {
            sysfs_root: PathBuf::from(SYSFS_DEVICES),
            devfs_root: PathBuf::from(DEVFS_ROOT),
            inner: Mutex::new(Inner::default()),
        }
    }

    fn scan(sysfs_root: &Path) -> Result<Vec<UsbDevice>, BackendError> {
        let entries = match fs::read_dir(sysfs_root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BackendError::Unavailable(format!(
                    "{} missing: {e}",
                    sysfs_root.display()
                )))
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return Err(BackendError::AccessDenied(sysfs_root.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let mut devices = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            // Device directories look like "3-2" or "3-2.1"; interface
            // directories carry a ':', root hubs start with "usb".
            if name.contains(':') || !name.chars().next().is_some_and(|c| c.is_ascii_digit()) {
                continue;
            }
            match read_device(&entry.path()) {
                Ok(Some(dev)) => devices.push(dev),
                Ok(None) => {}
                Err(e) => debug!(dir = %name, error = %e, "skipping unreadable device"),
            }
        }
        devices.sort_by_key(|d| d.busid);
        Ok(devices)
    }

    fn node_path(&self, busid: &Busid) -> PathBuf {
        self.devfs_root
            .join(format!("{:03}", busid.bus))
            .join(format!("{:03}", busid.dev))
    }

    fn claim_blocking(
        node: &Path,
        interfaces: &[u32],
    ) -> Result<(fs::File, Vec<u32>), BackendError> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
            .open(node)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => BackendError::NoSuchDevice,
                std::io::ErrorKind::PermissionDenied => {
                    BackendError::AccessDenied(node.display().to_string())
                }
                _ => BackendError::Io(e),
            })?;

        let fd = file.as_raw_fd();
        let mut claimed = Vec::new();
        for &iface in interfaces {
            // Detach whatever kernel driver holds the interface, then
            // claim it; fall back to a plain claim on old kernels.
            let mut dc = UsbfsDisconnectClaim {
                interface: iface,
                flags: 0,
                driver: [0; 256],
            };
            let result = ioctl(
                fd,
                USBDEVFS_DISCONNECT_CLAIM,
                &mut dc as *mut UsbfsDisconnectClaim as *mut libc::c_void,
            )
            .or_else(|e| {
                if e == Errno::ENOTTY {
                    let mut num = iface as libc::c_uint;
                    ioctl(
                        fd,
                        USBDEVFS_CLAIMINTERFACE,
                        &mut num as *mut libc::c_uint as *mut libc::c_void,
                    )
                } else {
                    Err(e)
                }
            });

            match result {
                Ok(_) => claimed.push(iface),
                Err(e) => {
                    for &done in &claimed {
                        let mut num = done as libc::c_uint;
                        let _ = ioctl(
                            fd,
                            USBDEVFS_RELEASEINTERFACE,
                            &mut num as *mut libc::c_uint as *mut libc::c_void,
                        );
                    }
                    return Err(map_errno(e, "claim interface"));
                }
            }
        }
        Ok((file, claimed))
    }
}

impl Default for UsbfsBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UsbBackend for UsbfsBackend {
    async fn enumerate(&self) -> Result<Vec<UsbDevice>, BackendError> {
        let root = self.sysfs_root.clone();
        tokio::task::spawn_blocking(move || Self::scan(&root))
            .await
            .map_err(|e| BackendError::Fatal(format!("scan task died: {e}")))?
    }

    async fn claim(&self, busid: &Busid) -> Result<DeviceHandle, BackendError> {
        let devices = self.enumerate().await?;
        let device = devices
            .into_iter()
            .find(|d| d.busid == *busid)
            .ok_or(BackendError::NoSuchDevice)?;
        let interfaces: Vec<u32> = device.interfaces.iter().map(|i| i.number as u32).collect();
        let node = self.node_path(busid);

        let (file, claimed) =
            tokio::task::spawn_blocking(move || Self::claim_blocking(&node, &interfaces))
                .await
                .map_err(|e| BackendError::Fatal(format!("claim task died: {e}")))??;

        let (cmd_tx, cmd_rx) = std_mpsc::channel();
        let worker = Worker {
            file,
            claimed_interfaces: claimed,
            pending: HashMap::new(),
        };
        std::thread::Builder::new()
            .name(format!("usbfs-{busid}"))
            .spawn(move || worker.run(cmd_rx))
            .map_err(BackendError::Io)?;

        let mut inner = self.inner.lock();
        inner.next_handle += 1;
        let handle = inner.next_handle;
        inner.workers.insert(
            handle,
            WorkerHandle {
                commands: cmd_tx,
                busid: *busid,
            },
        );
        info!(busid = %busid, handle, "usbfs device claimed");
        Ok(DeviceHandle(handle))
    }

    async fn release(&self, handle: DeviceHandle) -> Result<(), BackendError> {
        let worker = self.inner.lock().workers.remove(&handle.0);
        if let Some(worker) = worker {
            // A dead worker already released everything.
            let _ = worker.commands.send(Command::Release);
            debug!(busid = %worker.busid, "usbfs device released");
        }
        Ok(())
    }

    async fn submit(
        &self,
        handle: DeviceHandle,
        urb: UrbRequest,
        sink: CompletionSink,
    ) -> Result<(), BackendError> {
        let commands = {
            let inner = self.inner.lock();
            let worker = inner
                .workers
                .get(&handle.0)
                .ok_or(BackendError::NoSuchDevice)?;
            worker.commands.clone()
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        commands
            .send(Command::Submit {
                urb,
                sink,
                reply: reply_tx,
            })
            .map_err(|_| BackendError::NoSuchDevice)?;
        reply_rx
            .await
            .map_err(|_| BackendError::Unavailable("usbfs worker died".to_string()))?
    }

    async fn cancel(&self, handle: DeviceHandle, seqnum: u32) -> Result<CancelOutcome, BackendError> {
        let commands = {
            let inner = self.inner.lock();
            let worker = inner
                .workers
                .get(&handle.0)
                .ok_or(BackendError::NoSuchDevice)?;
            worker.commands.clone()
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        commands
            .send(Command::Cancel {
                seqnum,
                reply: reply_tx,
            })
            .map_err(|_| BackendError::NoSuchDevice)?;
        reply_rx
            .await
            .map_err(|_| BackendError::Unavailable("usbfs worker died".to_string()))
    }
}

// === sysfs parsing ===

fn read_attr(dir: &Path, name: &str) -> Option<String> {
    fs::read_to_string(dir.join(name))
        .ok()
        .map(|s| s.trim().to_string())
}

fn attr_u32(dir: &Path, name: &str) -> Option<u32> {
    read_attr(dir, name)?.parse().ok()
}

fn attr_hex16(dir: &Path, name: &str) -> Option<u16> {
    u16::from_str_radix(&read_attr(dir, name)?, 16).ok()
}

fn attr_hex8(dir: &Path, name: &str) -> Option<u8> {
    u8::from_str_radix(&read_attr(dir, name)?, 16).ok()
}

/// Parse one sysfs device directory. Returns `None` for directories
/// missing the core attributes (e.g. raced with an unplug).
fn read_device(dir: &Path) -> std::io::Result<Option<UsbDevice>> {
    let (Some(busnum), Some(devnum)) = (attr_u32(dir, "busnum"), attr_u32(dir, "devnum")) else {
        return Ok(None);
    };
    let (Some(vendor_id), Some(product_id)) =
        (attr_hex16(dir, "idVendor"), attr_hex16(dir, "idProduct"))
    else {
        return Ok(None);
    };

    let mut interfaces = Vec::new();
    let mut endpoints = Vec::new();
    for entry in fs::read_dir(dir)?.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy().into_owned();
        if !name.contains(':') {
            continue;
        }
        let iface_dir = entry.path();
        let Some(number) = attr_hex8(&iface_dir, "bInterfaceNumber") else {
            continue;
        };
        interfaces.push(InterfaceInfo {
            number,
            class: attr_hex8(&iface_dir, "bInterfaceClass").unwrap_or(0),
            subclass: attr_hex8(&iface_dir, "bInterfaceSubClass").unwrap_or(0),
            protocol: attr_hex8(&iface_dir, "bInterfaceProtocol").unwrap_or(0),
        });

        for ep_entry in fs::read_dir(&iface_dir)?.flatten() {
            let ep_name = ep_entry.file_name();
            let ep_name = ep_name.to_string_lossy();
            if let Some(hex) = ep_name.strip_prefix("ep_") {
                if let Ok(address) = u8::from_str_radix(hex, 16) {
                    let number = address & 0x0f;
                    if number != 0 && !endpoints.contains(&number) {
                        endpoints.push(number);
                    }
                }
            }
        }
    }
    interfaces.sort_by_key(|i| i.number);
    endpoints.sort_unstable();

    Ok(Some(UsbDevice {
        busid: Busid::new(busnum, devnum),
        speed: read_attr(dir, "speed")
            .map(|s| Speed::from_sysfs(&s))
            .unwrap_or(Speed::Unknown),
        vendor_id,
        product_id,
        bcd_device: attr_hex16(dir, "bcdDevice").unwrap_or(0),
        device_class: attr_hex8(dir, "bDeviceClass").unwrap_or(0),
        device_subclass: attr_hex8(dir, "bDeviceSubClass").unwrap_or(0),
        device_protocol: attr_hex8(dir, "bDeviceProtocol").unwrap_or(0),
        configuration_value: attr_u32(dir, "bConfigurationValue").unwrap_or(0) as u8,
        num_configurations: attr_u32(dir, "bNumConfigurations").unwrap_or(1) as u8,
        interfaces,
        endpoints,
        manufacturer: read_attr(dir, "manufacturer"),
        product: read_attr(dir, "product"),
        serial: read_attr(dir, "serial"),
    }))
}
