//! USB/IP wire protocol definitions, version 0x0111.
//!
//! Layouts follow the Linux `usbip` userspace tools bit for bit. All
//! integers are big-endian; fixed-size string fields are NUL-padded
//! ASCII. Structs here are `Pod` so the codec can cast them straight
//! out of receive buffers.

use bytemuck::{Pod, Zeroable};

use crate::endian::{BeU16, BeU32};

pub const USBIP_VERSION: u16 = 0x0111;

// OP codes (pre-import phase)
pub const OP_REQ_DEVLIST: u16 = 0x8005;
pub const OP_REP_DEVLIST: u16 = 0x0005;
pub const OP_REQ_IMPORT: u16 = 0x8003;
pub const OP_REP_IMPORT: u16 = 0x0003;

// URB commands (post-import phase)
pub const CMD_SUBMIT: u32 = 0x0000_0001;
pub const CMD_UNLINK: u32 = 0x0000_0002;
pub const RET_SUBMIT: u32 = 0x0000_0003;
pub const RET_UNLINK: u32 = 0x0000_0004;

// URB directions
pub const DIR_OUT: u32 = 0;
pub const DIR_IN: u32 = 1;

// OP status values
pub const OP_STATUS_OK: u32 = 0;
pub const OP_STATUS_ERROR: u32 = 1;

// Negative errno values used in URB status fields.
pub const EPIPE: i32 = -32;
pub const ENOENT: i32 = -2;
pub const EIO: i32 = -5;
pub const ENODEV: i32 = -19;
pub const ETIME: i32 = -62;
pub const ECONNRESET: i32 = -104;

// USB speeds as reported in the exported device record.
pub const SPEED_UNKNOWN: u32 = 0;
pub const SPEED_LOW: u32 = 1;
pub const SPEED_FULL: u32 = 2;
pub const SPEED_HIGH: u32 = 3;
pub const SPEED_WIRELESS: u32 = 4;
pub const SPEED_SUPER: u32 = 5;
pub const SPEED_SUPER_PLUS: u32 = 6;

pub const BUSID_LEN: usize = 32;
pub const PATH_LEN: usize = 256;

/// 8-byte header common to all OP messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct OpHeader {
    pub version: BeU16,
    pub code: BeU16,
    pub status: BeU32,
}

impl OpHeader {
    pub fn new(code: u16, status: u32) -> Self {
        Self {
            version: BeU16::new(USBIP_VERSION),
            code: BeU16::new(code),
            status: BeU32::new(status),
        }
    }
}

/// OP_REQ_IMPORT payload: the busid being requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct ImportRequest {
    pub busid: [u8; BUSID_LEN],
}

/// Count prefix of OP_REP_DEVLIST.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct DevlistCount {
    pub device_count: BeU32,
}

/// The 312-byte exported device record used by OP_REP_DEVLIST and
/// OP_REP_IMPORT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct DeviceRecord {
    pub path: [u8; PATH_LEN],
    pub busid: [u8; BUSID_LEN],
    pub busnum: BeU32,
    pub devnum: BeU32,
    pub speed: BeU32,
    pub id_vendor: BeU16,
    pub id_product: BeU16,
    pub bcd_device: BeU16,
    pub b_device_class: u8,
    pub b_device_sub_class: u8,
    pub b_device_protocol: u8,
    pub b_configuration_value: u8,
    pub b_num_configurations: u8,
    pub b_num_interfaces: u8,
}

impl DeviceRecord {
    /// Record sent alongside a failed OP_REP_IMPORT is all zeroes.
    pub fn empty() -> Self {
        Zeroable::zeroed()
    }

    pub fn set_path(&mut self, path: &str) {
        copy_padded(&mut self.path, path.as_bytes());
    }

    pub fn set_busid(&mut self, busid: &str) {
        copy_padded(&mut self.busid, busid.as_bytes());
    }
}

/// 4-byte per-interface record appended per device in OP_REP_DEVLIST.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct InterfaceRecord {
    pub b_interface_class: u8,
    pub b_interface_sub_class: u8,
    pub b_interface_protocol: u8,
    pub padding: u8,
}

/// 20-byte header common to all URB-phase messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct UrbHeader {
    pub command: BeU32,
    pub seqnum: BeU32,
    pub devid: BeU32,
    pub direction: BeU32,
    pub ep: BeU32,
}

impl UrbHeader {
    pub fn new(command: u32, seqnum: u32, devid: u32, direction: u32, ep: u32) -> Self {
        Self {
            command: BeU32::new(command),
            seqnum: BeU32::new(seqnum),
            devid: BeU32::new(devid),
            direction: BeU32::new(direction),
            ep: BeU32::new(ep),
        }
    }
}

/// CMD_SUBMIT: header + 28-byte trailer, then `transfer_buffer_length`
/// bytes of OUT data, then ISO packet descriptors when isochronous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct CmdSubmit {
    pub header: UrbHeader,
    pub transfer_flags: BeU32,
    pub transfer_buffer_length: BeU32,
    pub start_frame: BeU32,
    pub number_of_packets: BeU32,
    pub interval: BeU32,
    pub setup: [u8; 8],
}

/// RET_SUBMIT: header + 28-byte trailer, then `actual_length` bytes of
/// IN data, then ISO packet descriptors when isochronous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct RetSubmit {
    pub header: UrbHeader,
    pub status: BeU32,
    pub actual_length: BeU32,
    pub start_frame: BeU32,
    pub number_of_packets: BeU32,
    pub error_count: BeU32,
    pub setup: [u8; 8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct CmdUnlink {
    pub header: UrbHeader,
    pub unlink_seqnum: BeU32,
    pub padding: [u8; 24],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct RetUnlink {
    pub header: UrbHeader,
    pub status: BeU32,
    pub padding: [u8; 24],
}

/// 16-byte ISO packet descriptor carried after the transfer buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct IsoPacket {
    pub offset: BeU32,
    pub length: BeU32,
    pub actual_length: BeU32,
    pub status: BeU32,
}

fn copy_padded(dst: &mut [u8], src: &[u8]) {
    let n = src.len().min(dst.len());
    dst[..n].copy_from_slice(&src[..n]);
    for b in &mut dst[n..] {
        *b = 0;
    }
}

/// Trim a NUL-padded fixed field back to its string value.
pub fn trim_padded(field: &[u8]) -> &str {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    std::str::from_utf8(&field[..end]).unwrap_or("")
}

// The wire is unforgiving about these.
const _: () = assert!(std::mem::size_of::<OpHeader>() == 8);
const _: () = assert!(std::mem::size_of::<ImportRequest>() == 32);
const _: () = assert!(std::mem::size_of::<DeviceRecord>() == 312);
const _: () = assert!(std::mem::size_of::<InterfaceRecord>() == 4);
const _: () = assert!(std::mem::size_of::<UrbHeader>() == 20);
const _: () = assert!(std::mem::size_of::<CmdSubmit>() == 48);
const _: () = assert!(std::mem::size_of::<RetSubmit>() == 48);
const _: () = assert!(std::mem::size_of::<CmdUnlink>() == 48);
const _: () = assert!(std::mem::size_of::<RetUnlink>() == 48);
const _: () = assert!(std::mem::size_of::<IsoPacket>() == 16);
