#![forbid(unsafe_code)]

//! USB/IP wire protocol codec.
//!
//! This crate is the canonical encoder/decoder for the PDUs exchanged between
//! a USB/IP client and server, as specified by the Linux kernel
//! (`Documentation/usb/usbip_protocol.rst`). It has no opinion about sockets
//! or URBs; it only turns protocol records into bytes and back.
//!
//! All multi-byte integer fields are big-endian on the wire.
//!
//! ```text
//! 0               4               8      ...      20              48
//! +---------------+---------------+---------------+---------------+
//! | command (u32) | seqnum (u32)  | devid/dir/ep  | command union |
//! +---------------+---------------+---------------+---------------+
//! | payload: OUT data and/or iso_packet_descriptor[N]             |
//! +---------------------------------------------------------------+
//! ```
//!
//! The fixed header is always [`USBIP_HEADER_LEN`] bytes; the union part is
//! zero-padded to 28 bytes for every command. Servers echo `direction` as
//! zero in RET PDUs, so clients recover it from the low bit of `seqnum`
//! ([`extract_dir`]).

use core::fmt;

/// Protocol version sent in every `op_common`: 1.1.1.
pub const USBIP_VERSION: u16 = 0x0111;

/// `OP_REQ_IMPORT`: claim one exported device by bus id.
pub const OP_REQ_IMPORT: u16 = 0x8003;
/// `OP_REP_IMPORT`: reply to [`OP_REQ_IMPORT`].
pub const OP_REP_IMPORT: u16 = 0x0003;

pub const USBIP_CMD_SUBMIT: u32 = 0x0001;
pub const USBIP_CMD_UNLINK: u32 = 0x0002;
pub const USBIP_RET_SUBMIT: u32 = 0x0003;
pub const USBIP_RET_UNLINK: u32 = 0x0004;

/// Length of `op_common`, the preamble of every `OP_*` PDU.
pub const OP_COMMON_LEN: usize = 8;
/// Length of the bus id field in `OP_REQ_IMPORT`.
pub const BUS_ID_LEN: usize = 32;
/// Length of the sysfs path field in `usbip_usb_device`.
pub const SYSFS_PATH_LEN: usize = 256;
/// Length of the `usbip_usb_device` block in `OP_REP_IMPORT`.
pub const USB_DEVICE_LEN: usize = 312;
/// Length of a full `OP_REQ_IMPORT` PDU (`op_common` + bus id).
pub const OP_IMPORT_REQUEST_LEN: usize = OP_COMMON_LEN + BUS_ID_LEN;
/// Length of the fixed `usbip_header` preceding CMD/RET payloads.
pub const USBIP_HEADER_LEN: usize = 48;
/// Length of one packed `usbip_iso_packet_descriptor`.
pub const ISO_PACKET_DESCRIPTOR_LEN: usize = 16;

// Linux URB transfer flags carried in `cmd_submit.transfer_flags`. Only the
// bits a client is expected to set; the server ignores the rest.
pub const URB_SHORT_NOT_OK: u32 = 0x0001;
pub const URB_ISO_ASAP: u32 = 0x0002;
pub const URB_ZERO_PACKET: u32 = 0x0040;
pub const URB_DIR_IN: u32 = 0x0200;

/// Transfer direction as encoded in `usbip_header_basic.direction`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Out,
    In,
}

impl Direction {
    pub fn from_wire(raw: u32) -> Result<Self, Error> {
        match raw {
            0 => Ok(Direction::Out),
            1 => Ok(Direction::In),
            _ => Err(Error::InvalidDirection { raw }),
        }
    }

    pub fn to_wire(self) -> u32 {
        match self {
            Direction::Out => 0,
            Direction::In => 1,
        }
    }

    pub fn is_in(self) -> bool {
        self == Direction::In
    }
}

/// Sequence number without its direction bit.
pub fn extract_num(seqnum: u32) -> u32 {
    seqnum >> 1
}

/// Direction encoded in the low bit of a sequence number. Authoritative for
/// RET PDUs, where the server zeroes `direction`.
pub fn extract_dir(seqnum: u32) -> Direction {
    if seqnum & 1 == 1 {
        Direction::In
    } else {
        Direction::Out
    }
}

/// Zero is reserved as "no sequence number".
pub fn is_valid_seqnum(seqnum: u32) -> bool {
    extract_num(seqnum) != 0
}

/// Server-side device identity: `(busnum << 16) | devnum`.
pub fn make_devid(busnum: u16, devnum: u16) -> u32 {
    (u32::from(busnum) << 16) | u32::from(devnum)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    BusIdTooLong {
        len: usize,
        max: usize,
    },
    UnknownCommand {
        command: u32,
    },
    InvalidDirection {
        raw: u32,
    },
    /// A string field was not NUL-terminated UTF-8.
    InvalidString {
        context: &'static str,
    },
    /// A buffer handed to an array decoder had the wrong length.
    LengthMismatch {
        context: &'static str,
        expected: usize,
        got: usize,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BusIdTooLong { len, max } => write!(f, "bus id too long: {len} > {max}"),
            Error::UnknownCommand { command } => {
                write!(f, "unknown usbip command: {command:#010x}")
            }
            Error::InvalidDirection { raw } => write!(f, "invalid direction: {raw}"),
            Error::InvalidString { context } => write!(f, "invalid string in {context}"),
            Error::LengthMismatch {
                context,
                expected,
                got,
            } => write!(f, "{context}: expected {expected} bytes, got {got}"),
        }
    }
}

impl std::error::Error for Error {}

/// `op_common`: the 8-byte preamble of every `OP_*` PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpCommon {
    pub version: u16,
    pub code: u16,
    pub status: u32,
}

impl OpCommon {
    pub fn request(code: u16) -> Self {
        Self {
            version: USBIP_VERSION,
            code,
            status: 0,
        }
    }

    pub fn encode(&self) -> [u8; OP_COMMON_LEN] {
        let mut out = [0u8; OP_COMMON_LEN];
        out[0..2].copy_from_slice(&self.version.to_be_bytes());
        out[2..4].copy_from_slice(&self.code.to_be_bytes());
        out[4..8].copy_from_slice(&self.status.to_be_bytes());
        out
    }

    pub fn decode(buf: &[u8; OP_COMMON_LEN]) -> Self {
        Self {
            version: u16::from_be_bytes([buf[0], buf[1]]),
            code: u16::from_be_bytes([buf[2], buf[3]]),
            status: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        }
    }
}

/// Encode a full `OP_REQ_IMPORT` PDU for `busid`.
pub fn encode_op_import_request(busid: &str) -> Result<[u8; OP_IMPORT_REQUEST_LEN], Error> {
    let bytes = busid.as_bytes();
    // One byte is reserved for the NUL terminator.
    if bytes.len() >= BUS_ID_LEN {
        return Err(Error::BusIdTooLong {
            len: bytes.len(),
            max: BUS_ID_LEN - 1,
        });
    }

    let mut out = [0u8; OP_IMPORT_REQUEST_LEN];
    out[..OP_COMMON_LEN].copy_from_slice(&OpCommon::request(OP_REQ_IMPORT).encode());
    out[OP_COMMON_LEN..OP_COMMON_LEN + bytes.len()].copy_from_slice(bytes);
    Ok(out)
}

/// `usbip_usb_device`: the exported-device block of `OP_REP_IMPORT`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDevice {
    pub path: String,
    pub busid: String,
    pub busnum: u32,
    pub devnum: u32,
    pub speed: u32,
    pub id_vendor: u16,
    pub id_product: u16,
    pub bcd_device: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub configuration_value: u8,
    pub num_configurations: u8,
    pub num_interfaces: u8,
}

impl UsbDevice {
    pub fn devid(&self) -> u32 {
        make_devid(self.busnum as u16, self.devnum as u16)
    }

    pub fn encode(&self) -> [u8; USB_DEVICE_LEN] {
        let mut out = [0u8; USB_DEVICE_LEN];
        let path = self.path.as_bytes();
        let busid = self.busid.as_bytes();
        out[..path.len().min(SYSFS_PATH_LEN - 1)]
            .copy_from_slice(&path[..path.len().min(SYSFS_PATH_LEN - 1)]);
        out[SYSFS_PATH_LEN..SYSFS_PATH_LEN + busid.len().min(BUS_ID_LEN - 1)]
            .copy_from_slice(&busid[..busid.len().min(BUS_ID_LEN - 1)]);
        let mut o = SYSFS_PATH_LEN + BUS_ID_LEN;
        out[o..o + 4].copy_from_slice(&self.busnum.to_be_bytes());
        out[o + 4..o + 8].copy_from_slice(&self.devnum.to_be_bytes());
        out[o + 8..o + 12].copy_from_slice(&self.speed.to_be_bytes());
        o += 12;
        out[o..o + 2].copy_from_slice(&self.id_vendor.to_be_bytes());
        out[o + 2..o + 4].copy_from_slice(&self.id_product.to_be_bytes());
        out[o + 4..o + 6].copy_from_slice(&self.bcd_device.to_be_bytes());
        o += 6;
        out[o] = self.device_class;
        out[o + 1] = self.device_subclass;
        out[o + 2] = self.device_protocol;
        out[o + 3] = self.configuration_value;
        out[o + 4] = self.num_configurations;
        out[o + 5] = self.num_interfaces;
        out
    }

    pub fn decode(buf: &[u8; USB_DEVICE_LEN]) -> Result<Self, Error> {
        let path = decode_fixed_str(&buf[..SYSFS_PATH_LEN], "usb_device.path")?;
        let busid = decode_fixed_str(
            &buf[SYSFS_PATH_LEN..SYSFS_PATH_LEN + BUS_ID_LEN],
            "usb_device.busid",
        )?;
        let o = SYSFS_PATH_LEN + BUS_ID_LEN;
        Ok(Self {
            path,
            busid,
            busnum: be_u32(&buf[o..]),
            devnum: be_u32(&buf[o + 4..]),
            speed: be_u32(&buf[o + 8..]),
            id_vendor: be_u16(&buf[o + 12..]),
            id_product: be_u16(&buf[o + 14..]),
            bcd_device: be_u16(&buf[o + 16..]),
            device_class: buf[o + 18],
            device_subclass: buf[o + 19],
            device_protocol: buf[o + 20],
            configuration_value: buf[o + 21],
            num_configurations: buf[o + 22],
            num_interfaces: buf[o + 23],
        })
    }
}

fn decode_fixed_str(field: &[u8], context: &'static str) -> Result<String, Error> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    core::str::from_utf8(&field[..end])
        .map(str::to_owned)
        .map_err(|_| Error::InvalidString { context })
}

fn be_u16(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

fn be_u32(buf: &[u8]) -> u32 {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
}

fn be_i32(buf: &[u8]) -> i32 {
    i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
}

/// `usbip_header_basic`: the first 20 bytes of every CMD/RET PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderBasic {
    pub seqnum: u32,
    pub devid: u32,
    pub direction: Direction,
    pub ep: u32,
}

/// `usbip_header_cmd_submit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdSubmit {
    pub transfer_flags: u32,
    pub transfer_buffer_length: i32,
    pub start_frame: i32,
    pub number_of_packets: i32,
    pub interval: i32,
    pub setup: [u8; 8],
}

/// `usbip_header_ret_submit`. `status` is a Linux negative errno.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetSubmit {
    pub status: i32,
    pub actual_length: i32,
    pub start_frame: i32,
    pub number_of_packets: i32,
    pub error_count: i32,
}

/// `usbip_header_cmd_unlink`: `seqnum` names the victim CMD_SUBMIT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdUnlink {
    pub seqnum: u32,
}

/// `usbip_header_ret_unlink`: `-ECONNRESET` when the unlink won the race,
/// `0` when the RET_SUBMIT had already been sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetUnlink {
    pub status: i32,
}

/// The command-specific 28-byte tail of a `usbip_header`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderCmd {
    Submit(CmdSubmit),
    RetSubmit(RetSubmit),
    Unlink(CmdUnlink),
    RetUnlink(RetUnlink),
}

impl HeaderCmd {
    pub fn command(&self) -> u32 {
        match self {
            HeaderCmd::Submit(_) => USBIP_CMD_SUBMIT,
            HeaderCmd::RetSubmit(_) => USBIP_RET_SUBMIT,
            HeaderCmd::Unlink(_) => USBIP_CMD_UNLINK,
            HeaderCmd::RetUnlink(_) => USBIP_RET_UNLINK,
        }
    }
}

/// A full 48-byte `usbip_header`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbipHeader {
    pub base: HeaderBasic,
    pub cmd: HeaderCmd,
}

impl UsbipHeader {
    pub fn encode(&self) -> [u8; USBIP_HEADER_LEN] {
        let mut out = [0u8; USBIP_HEADER_LEN];
        out[0..4].copy_from_slice(&self.cmd.command().to_be_bytes());
        out[4..8].copy_from_slice(&self.base.seqnum.to_be_bytes());
        out[8..12].copy_from_slice(&self.base.devid.to_be_bytes());
        out[12..16].copy_from_slice(&self.base.direction.to_wire().to_be_bytes());
        out[16..20].copy_from_slice(&self.base.ep.to_be_bytes());

        match &self.cmd {
            HeaderCmd::Submit(c) => {
                out[20..24].copy_from_slice(&c.transfer_flags.to_be_bytes());
                out[24..28].copy_from_slice(&c.transfer_buffer_length.to_be_bytes());
                out[28..32].copy_from_slice(&c.start_frame.to_be_bytes());
                out[32..36].copy_from_slice(&c.number_of_packets.to_be_bytes());
                out[36..40].copy_from_slice(&c.interval.to_be_bytes());
                out[40..48].copy_from_slice(&c.setup);
            }
            HeaderCmd::RetSubmit(c) => {
                out[20..24].copy_from_slice(&c.status.to_be_bytes());
                out[24..28].copy_from_slice(&c.actual_length.to_be_bytes());
                out[28..32].copy_from_slice(&c.start_frame.to_be_bytes());
                out[32..36].copy_from_slice(&c.number_of_packets.to_be_bytes());
                out[36..40].copy_from_slice(&c.error_count.to_be_bytes());
            }
            HeaderCmd::Unlink(c) => {
                out[20..24].copy_from_slice(&c.seqnum.to_be_bytes());
            }
            HeaderCmd::RetUnlink(c) => {
                out[20..24].copy_from_slice(&c.status.to_be_bytes());
            }
        }

        out
    }

    pub fn decode(buf: &[u8; USBIP_HEADER_LEN]) -> Result<Self, Error> {
        let command = be_u32(&buf[0..]);
        let base = HeaderBasic {
            seqnum: be_u32(&buf[4..]),
            devid: be_u32(&buf[8..]),
            direction: Direction::from_wire(be_u32(&buf[12..]))?,
            ep: be_u32(&buf[16..]),
        };

        let cmd = match command {
            USBIP_CMD_SUBMIT => {
                let mut setup = [0u8; 8];
                setup.copy_from_slice(&buf[40..48]);
                HeaderCmd::Submit(CmdSubmit {
                    transfer_flags: be_u32(&buf[20..]),
                    transfer_buffer_length: be_i32(&buf[24..]),
                    start_frame: be_i32(&buf[28..]),
                    number_of_packets: be_i32(&buf[32..]),
                    interval: be_i32(&buf[36..]),
                    setup,
                })
            }
            USBIP_RET_SUBMIT => HeaderCmd::RetSubmit(RetSubmit {
                status: be_i32(&buf[20..]),
                actual_length: be_i32(&buf[24..]),
                start_frame: be_i32(&buf[28..]),
                number_of_packets: be_i32(&buf[32..]),
                error_count: be_i32(&buf[36..]),
            }),
            USBIP_CMD_UNLINK => HeaderCmd::Unlink(CmdUnlink {
                seqnum: be_u32(&buf[20..]),
            }),
            USBIP_RET_UNLINK => HeaderCmd::RetUnlink(RetUnlink {
                status: be_i32(&buf[20..]),
            }),
            command => return Err(Error::UnknownCommand { command }),
        };

        Ok(Self { base, cmd })
    }
}

/// `usbip_iso_packet_descriptor`: per-packet metadata appended after the
/// payload of isochronous PDUs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IsoPacketDescriptor {
    pub offset: u32,
    pub length: u32,
    pub actual_length: u32,
    pub status: i32,
}

impl IsoPacketDescriptor {
    pub fn encode(&self) -> [u8; ISO_PACKET_DESCRIPTOR_LEN] {
        let mut out = [0u8; ISO_PACKET_DESCRIPTOR_LEN];
        out[0..4].copy_from_slice(&self.offset.to_be_bytes());
        out[4..8].copy_from_slice(&self.length.to_be_bytes());
        out[8..12].copy_from_slice(&self.actual_length.to_be_bytes());
        out[12..16].copy_from_slice(&self.status.to_be_bytes());
        out
    }

    pub fn decode(buf: &[u8; ISO_PACKET_DESCRIPTOR_LEN]) -> Self {
        Self {
            offset: be_u32(&buf[0..]),
            length: be_u32(&buf[4..]),
            actual_length: be_u32(&buf[8..]),
            status: be_i32(&buf[12..]),
        }
    }
}

/// Pack an iso descriptor array the way it appears on the wire.
pub fn encode_iso_descriptors(descs: &[IsoPacketDescriptor]) -> Vec<u8> {
    let mut out = Vec::with_capacity(descs.len() * ISO_PACKET_DESCRIPTOR_LEN);
    for d in descs {
        out.extend_from_slice(&d.encode());
    }
    out
}

/// Unpack `count` iso descriptors from `buf`; `buf` must be exactly sized.
pub fn decode_iso_descriptors(buf: &[u8], count: usize) -> Result<Vec<IsoPacketDescriptor>, Error> {
    let expected = count * ISO_PACKET_DESCRIPTOR_LEN;
    if buf.len() != expected {
        return Err(Error::LengthMismatch {
            context: "iso_packet_descriptor[]",
            expected,
            got: buf.len(),
        });
    }

    let mut out = Vec::with_capacity(count);
    for chunk in buf.chunks_exact(ISO_PACKET_DESCRIPTOR_LEN) {
        let mut raw = [0u8; ISO_PACKET_DESCRIPTOR_LEN];
        raw.copy_from_slice(chunk);
        out.push(IsoPacketDescriptor::decode(&raw));
    }
    Ok(out)
}

/// Bytes following a CMD_SUBMIT header: OUT data, then iso descriptors (the
/// descriptor table is present for isochronous transfers in both directions).
pub fn cmd_submit_payload_len(
    direction: Direction,
    transfer_buffer_length: i32,
    number_of_packets: i32,
) -> usize {
    let data = match direction {
        Direction::Out => transfer_buffer_length.max(0) as usize,
        Direction::In => 0,
    };
    data + number_of_packets.max(0) as usize * ISO_PACKET_DESCRIPTOR_LEN
}

/// Bytes following a RET_SUBMIT header: IN data (compacted for isochronous
/// transfers), then iso descriptors for both directions.
pub fn ret_submit_payload_len(
    direction: Direction,
    actual_length: i32,
    number_of_packets: i32,
) -> usize {
    let data = match direction {
        Direction::In => actual_length.max(0) as usize,
        Direction::Out => 0,
    };
    data + number_of_packets.max(0) as usize * ISO_PACKET_DESCRIPTOR_LEN
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seqnum_helpers() {
        assert!(!is_valid_seqnum(0));
        assert!(!is_valid_seqnum(1)); // direction bit alone is not a seqnum
        assert!(is_valid_seqnum(2));
        assert_eq!(extract_num(0x8000_0001), 0x4000_0000);
        assert_eq!(extract_dir(5), Direction::In);
        assert_eq!(extract_dir(4), Direction::Out);
    }

    #[test]
    fn devid_packing() {
        assert_eq!(make_devid(1, 2), 0x0001_0002);
        assert_eq!(make_devid(0xffff, 0xffff), 0xffff_ffff);
    }

    #[test]
    fn op_import_request_bytes() {
        let pdu = encode_op_import_request("1-1").unwrap();
        assert_eq!(&pdu[..8], &[0x01, 0x11, 0x80, 0x03, 0, 0, 0, 0]);
        assert_eq!(&pdu[8..11], b"1-1");
        assert!(pdu[11..].iter().all(|&b| b == 0));
    }

    #[test]
    fn op_import_request_rejects_long_busid() {
        let long = "x".repeat(BUS_ID_LEN);
        assert!(matches!(
            encode_op_import_request(&long),
            Err(Error::BusIdTooLong { .. })
        ));
    }

    #[test]
    fn op_common_round_trip() {
        let c = OpCommon {
            version: USBIP_VERSION,
            code: OP_REP_IMPORT,
            status: 4,
        };
        assert_eq!(OpCommon::decode(&c.encode()), c);
    }

    #[test]
    fn usb_device_round_trip() {
        let dev = UsbDevice {
            path: "/sys/devices/pci0000:00/0000:00:14.0/usb1/1-1".to_owned(),
            busid: "1-1".to_owned(),
            busnum: 1,
            devnum: 2,
            speed: 3,
            id_vendor: 0x046d,
            id_product: 0xc077,
            bcd_device: 0x7200,
            device_class: 0,
            device_subclass: 0,
            device_protocol: 0,
            configuration_value: 1,
            num_configurations: 1,
            num_interfaces: 1,
        };
        let decoded = UsbDevice::decode(&dev.encode()).unwrap();
        assert_eq!(decoded, dev);
        assert_eq!(decoded.devid(), 0x0001_0002);
    }

    #[test]
    fn cmd_submit_golden_bytes() {
        let hdr = UsbipHeader {
            base: HeaderBasic {
                seqnum: 2,
                devid: 0x0001_0002,
                direction: Direction::In,
                ep: 0,
            },
            cmd: HeaderCmd::Submit(CmdSubmit {
                transfer_flags: URB_DIR_IN,
                transfer_buffer_length: 18,
                start_frame: 0,
                number_of_packets: 0,
                interval: 0,
                setup: [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00],
            }),
        };
        let bytes = hdr.encode();
        assert_eq!(&bytes[0..4], &[0, 0, 0, 1]); // USBIP_CMD_SUBMIT
        assert_eq!(&bytes[4..8], &[0, 0, 0, 2]); // seqnum
        assert_eq!(&bytes[8..12], &[0, 1, 0, 2]); // devid
        assert_eq!(&bytes[12..16], &[0, 0, 0, 1]); // direction IN
        assert_eq!(&bytes[20..24], &[0, 0, 0x02, 0]); // URB_DIR_IN
        assert_eq!(&bytes[24..28], &[0, 0, 0, 18]);
        assert_eq!(&bytes[40..48], &[0x80, 0x06, 0, 0x01, 0, 0, 0x12, 0]);
    }

    #[test]
    fn header_round_trip_all_commands() {
        let base = HeaderBasic {
            seqnum: 7,
            devid: 0x0002_0003,
            direction: Direction::In,
            ep: 1,
        };
        let cmds = [
            HeaderCmd::Submit(CmdSubmit {
                transfer_flags: URB_SHORT_NOT_OK | URB_DIR_IN,
                transfer_buffer_length: 512,
                start_frame: -1,
                number_of_packets: 4,
                interval: 8,
                setup: [1, 2, 3, 4, 5, 6, 7, 8],
            }),
            HeaderCmd::RetSubmit(RetSubmit {
                status: -32,
                actual_length: 100,
                start_frame: 12,
                number_of_packets: 4,
                error_count: 1,
            }),
            HeaderCmd::Unlink(CmdUnlink { seqnum: 5 }),
            HeaderCmd::RetUnlink(RetUnlink { status: -104 }),
        ];
        for cmd in cmds {
            let hdr = UsbipHeader { base, cmd };
            assert_eq!(UsbipHeader::decode(&hdr.encode()).unwrap(), hdr);
        }
    }

    #[test]
    fn decode_rejects_unknown_command() {
        let mut buf = [0u8; USBIP_HEADER_LEN];
        buf[3] = 9;
        assert_eq!(
            UsbipHeader::decode(&buf),
            Err(Error::UnknownCommand { command: 9 })
        );
    }

    #[test]
    fn iso_descriptor_round_trip() {
        let d = IsoPacketDescriptor {
            offset: 512,
            length: 512,
            actual_length: 100,
            status: -18,
        };
        assert_eq!(IsoPacketDescriptor::decode(&d.encode()), d);

        let packed = encode_iso_descriptors(&[d, IsoPacketDescriptor::default()]);
        assert_eq!(packed.len(), 2 * ISO_PACKET_DESCRIPTOR_LEN);
        let unpacked = decode_iso_descriptors(&packed, 2).unwrap();
        assert_eq!(unpacked[0], d);
        assert_eq!(unpacked[1], IsoPacketDescriptor::default());

        assert!(decode_iso_descriptors(&packed, 3).is_err());
    }

    #[test]
    fn payload_length_rules() {
        // normal transfers
        assert_eq!(cmd_submit_payload_len(Direction::Out, 512, 0), 512);
        assert_eq!(cmd_submit_payload_len(Direction::In, 512, 0), 0);
        assert_eq!(ret_submit_payload_len(Direction::In, 100, 0), 100);
        assert_eq!(ret_submit_payload_len(Direction::Out, 100, 0), 0);

        // isochronous: descriptor table regardless of direction
        assert_eq!(cmd_submit_payload_len(Direction::In, 2048, 4), 64);
        assert_eq!(cmd_submit_payload_len(Direction::Out, 2048, 4), 2048 + 64);
        assert_eq!(ret_submit_payload_len(Direction::In, 350, 4), 350 + 64);
        assert_eq!(ret_submit_payload_len(Direction::Out, 350, 4), 64);

        // negative lengths clamp to zero
        assert_eq!(ret_submit_payload_len(Direction::In, -1, 0), 0);
    }
}
