//! USB request blocks as handed to the controller by the host stack.
//!
//! A [`Urb`] pairs a host function code with the transfer it describes. The
//! function code selects the completion handler when the server's reply
//! arrives; the transfer carries the wire-visible parameters (endpoint, setup
//! packet, buffers, isochronous packet table).
//!
//! On completion the URB travels back to the submitter through its completion
//! callback: `status` holds the translated outcome, `actual_length` the number
//! of bytes the device actually moved, and an IN transfer buffer is truncated
//! to exactly the received bytes (isochronous buffers keep their full size,
//! with per-packet results in the packet table).

use usbip_proto::{Direction, IsoPacketDescriptor, URB_ISO_ASAP, URB_SHORT_NOT_OK, URB_ZERO_PACKET};

use crate::status::UsbdStatus;

pub const DESCRIPTOR_TYPE_DEVICE: u8 = 1;
pub const DESCRIPTOR_TYPE_CONFIGURATION: u8 = 2;
pub const DESCRIPTOR_TYPE_STRING: u8 = 3;

/// A full USB device descriptor is always 18 bytes.
pub const DEVICE_DESCRIPTOR_LEN: usize = 18;

/// String descriptor index reserved for the Microsoft OS string descriptor.
pub const OS_STRING_DESCRIPTOR_INDEX: u8 = 0xEE;

/// The 8-byte setup packet of a control transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub const GET_DESCRIPTOR: u8 = 0x06;
    pub const SET_CONFIGURATION: u8 = 0x09;
    pub const SET_INTERFACE: u8 = 0x0b;

    pub fn is_device_to_host(&self) -> bool {
        self.request_type & 0x80 != 0
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    pub fn get_descriptor(descriptor_type: u8, index: u8, language_id: u16, length: u16) -> Self {
        Self {
            request_type: 0x80,
            request: Self::GET_DESCRIPTOR,
            value: (u16::from(descriptor_type) << 8) | u16::from(index),
            index: language_id,
            length,
        }
    }

    pub fn set_configuration(configuration_value: u8) -> Self {
        Self {
            request_type: 0x00,
            request: Self::SET_CONFIGURATION,
            value: u16::from(configuration_value),
            index: 0,
            length: 0,
        }
    }

    pub fn set_interface(interface_number: u8, alternate_setting: u8) -> Self {
        Self {
            request_type: 0x01,
            request: Self::SET_INTERFACE,
            value: u16::from(alternate_setting),
            index: u16::from(interface_number),
            length: 0,
        }
    }

    /// Descriptor type requested by a GET_DESCRIPTOR/SET_DESCRIPTOR setup.
    pub fn descriptor_type(&self) -> u8 {
        (self.value >> 8) as u8
    }

    /// Descriptor index of a GET_DESCRIPTOR/SET_DESCRIPTOR setup.
    pub fn descriptor_index(&self) -> u8 {
        (self.value & 0xff) as u8
    }
}

/// Host function codes. The values mirror the host stack's URB function
/// numbering; [`HandlerClass`] groups them for completion dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum UrbFunction {
    SelectConfiguration = 0x0000,
    SelectInterface = 0x0001,
    AbortPipe = 0x0002,
    TakeFrameLengthControl = 0x0003,
    ReleaseFrameLengthControl = 0x0004,
    GetFrameLength = 0x0005,
    SetFrameLength = 0x0006,
    GetCurrentFrameNumber = 0x0007,
    ControlTransfer = 0x0008,
    BulkOrInterruptTransfer = 0x0009,
    IsochTransfer = 0x000a,
    GetDescriptorFromDevice = 0x000b,
    SetDescriptorToDevice = 0x000c,
    SetFeatureToDevice = 0x000d,
    SetFeatureToInterface = 0x000e,
    SetFeatureToEndpoint = 0x000f,
    ClearFeatureToDevice = 0x0010,
    ClearFeatureToInterface = 0x0011,
    ClearFeatureToEndpoint = 0x0012,
    GetStatusFromDevice = 0x0013,
    GetStatusFromInterface = 0x0014,
    GetStatusFromEndpoint = 0x0015,
    VendorDevice = 0x0017,
    VendorInterface = 0x0018,
    VendorEndpoint = 0x0019,
    ClassDevice = 0x001a,
    ClassInterface = 0x001b,
    ClassEndpoint = 0x001c,
    SyncResetPipeAndClearStall = 0x001e,
    ClassOther = 0x001f,
    VendorOther = 0x0020,
    GetStatusFromOther = 0x0021,
    SetFeatureToOther = 0x0022,
    ClearFeatureToOther = 0x0023,
    GetDescriptorFromEndpoint = 0x0024,
    SetDescriptorToEndpoint = 0x0025,
    GetConfiguration = 0x0026,
    GetInterface = 0x0027,
    GetDescriptorFromInterface = 0x0028,
    SetDescriptorToInterface = 0x0029,
    GetMsFeatureDescriptor = 0x002a,
    SyncResetPipe = 0x0030,
    SyncClearStall = 0x0031,
    ControlTransferEx = 0x0032,
    OpenStaticStreams = 0x0035,
    CloseStaticStreams = 0x0036,
    GetIsochPipeTransferPathDelays = 0x0045,
}

/// Completion handler selected by the function code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandlerClass {
    Generic,
    SelectConfiguration,
    SelectInterface,
    ControlDescriptor,
    Isoch,
    /// Nothing to transfer back; completes success unconditionally.
    Success,
    /// Function codes that must never reach the wire.
    Unexpected,
}

impl UrbFunction {
    pub(crate) fn handler_class(self) -> HandlerClass {
        use UrbFunction::*;
        match self {
            SelectConfiguration => HandlerClass::SelectConfiguration,
            SelectInterface => HandlerClass::SelectInterface,
            ControlTransfer | ControlTransferEx | BulkOrInterruptTransfer => HandlerClass::Generic,
            IsochTransfer => HandlerClass::Isoch,
            GetDescriptorFromDevice | SetDescriptorToDevice | GetDescriptorFromEndpoint
            | SetDescriptorToEndpoint | GetDescriptorFromInterface | SetDescriptorToInterface => {
                HandlerClass::ControlDescriptor
            }
            SetFeatureToDevice | SetFeatureToInterface | SetFeatureToEndpoint
            | SetFeatureToOther | ClearFeatureToDevice | ClearFeatureToInterface
            | ClearFeatureToEndpoint | ClearFeatureToOther | SyncResetPipeAndClearStall => {
                HandlerClass::Success
            }
            GetStatusFromDevice | GetStatusFromInterface | GetStatusFromEndpoint
            | GetStatusFromOther | VendorDevice | VendorInterface | VendorEndpoint
            | VendorOther | ClassDevice | ClassInterface | ClassEndpoint | ClassOther
            | GetConfiguration | GetInterface | GetMsFeatureDescriptor => HandlerClass::Generic,
            AbortPipe | TakeFrameLengthControl | ReleaseFrameLengthControl | GetFrameLength
            | SetFrameLength | GetCurrentFrameNumber | SyncResetPipe | SyncClearStall
            | OpenStaticStreams | CloseStaticStreams | GetIsochPipeTransferPathDelays => {
                HandlerClass::Unexpected
            }
        }
    }
}

/// Transfer flags the host stack may set on a URB. The wire direction bit is
/// derived from the endpoint or setup packet, never from these flags: the
/// flags can lie, the header direction wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferFlags {
    pub short_not_ok: bool,
    /// Start the isochronous transfer on the next available frame.
    pub iso_asap: bool,
    pub zero_packet: bool,
}

impl TransferFlags {
    pub(crate) fn to_wire(self, direction: Direction) -> u32 {
        let mut flags = 0;
        if self.short_not_ok && direction.is_in() {
            flags |= URB_SHORT_NOT_OK;
        }
        if self.iso_asap {
            flags |= URB_ISO_ASAP;
        }
        if self.zero_packet {
            flags |= URB_ZERO_PACKET;
        }
        if direction.is_in() {
            flags |= usbip_proto::URB_DIR_IN;
        }
        flags
    }
}

/// The data stage of a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferBuffer {
    /// No data stage.
    None,
    /// Caller-supplied bytes: OUT data, or the destination of an IN transfer.
    Data(Vec<u8>),
    /// An IN request that only names a length. The send pipeline materializes
    /// the buffer and the request records that it owns it.
    Reserve(usize),
}

impl TransferBuffer {
    pub fn len(&self) -> usize {
        match self {
            TransferBuffer::None => 0,
            TransferBuffer::Data(data) => data.len(),
            TransferBuffer::Reserve(len) => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn data(&self) -> Option<&[u8]> {
        match self {
            TransferBuffer::Data(data) => Some(data),
            _ => None,
        }
    }

    pub(crate) fn data_vec_mut(&mut self) -> Option<&mut Vec<u8>> {
        match self {
            TransferBuffer::Data(data) => Some(data),
            _ => None,
        }
    }

    /// Convert a [`TransferBuffer::Reserve`] into an owned zeroed buffer.
    /// Returns whether a buffer was materialized.
    pub(crate) fn materialize(&mut self) -> bool {
        if let TransferBuffer::Reserve(len) = *self {
            *self = TransferBuffer::Data(vec![0; len]);
            true
        } else {
            false
        }
    }
}

/// One entry of an isochronous packet table. `offset` and `length` are set by
/// the submitter; `actual_length` and `status` by the completion path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoPacket {
    pub offset: u32,
    pub length: u32,
    pub actual_length: u32,
    pub status: UsbdStatus,
}

impl IsoPacket {
    pub fn new(offset: u32, length: u32) -> Self {
        Self {
            offset,
            length,
            actual_length: 0,
            status: UsbdStatus::IsochNotAccessed,
        }
    }
}

/// An isochronous transfer and its packet table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsochTransfer {
    /// Endpoint address, direction bit included.
    pub endpoint: u8,
    pub flags: TransferFlags,
    pub buffer: TransferBuffer,
    /// Frame to start on; updated from the reply when `flags.iso_asap`.
    pub start_frame: i32,
    pub interval: i32,
    pub packets: Vec<IsoPacket>,
    /// Number of packets the server failed; set on completion.
    pub error_count: u32,
}

/// The wire-visible part of a URB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrbTransfer {
    /// An EP0 control request. Select, feature, status and descriptor
    /// requests all travel this way; the setup packet is canonical.
    Control {
        setup: SetupPacket,
        flags: TransferFlags,
        buffer: TransferBuffer,
    },
    BulkOrInterrupt {
        /// Endpoint address, direction bit included.
        endpoint: u8,
        flags: TransferFlags,
        buffer: TransferBuffer,
    },
    Isoch(IsochTransfer),
}

/// A USB request block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Urb {
    pub function: UrbFunction,
    pub status: UsbdStatus,
    /// Bytes actually transferred, set on completion.
    pub actual_length: u32,
    pub transfer: UrbTransfer,
}

impl Urb {
    pub fn control(function: UrbFunction, setup: SetupPacket, buffer: TransferBuffer) -> Self {
        Self {
            function,
            status: UsbdStatus::Success,
            actual_length: 0,
            transfer: UrbTransfer::Control {
                setup,
                flags: TransferFlags::default(),
                buffer,
            },
        }
    }

    pub fn get_descriptor(descriptor_type: u8, index: u8, language_id: u16, length: u16) -> Self {
        Self::control(
            UrbFunction::GetDescriptorFromDevice,
            SetupPacket::get_descriptor(descriptor_type, index, language_id, length),
            TransferBuffer::Reserve(usize::from(length)),
        )
    }

    pub fn select_configuration(configuration_value: u8) -> Self {
        Self::control(
            UrbFunction::SelectConfiguration,
            SetupPacket::set_configuration(configuration_value),
            TransferBuffer::None,
        )
    }

    pub fn select_interface(interface_number: u8, alternate_setting: u8) -> Self {
        Self::control(
            UrbFunction::SelectInterface,
            SetupPacket::set_interface(interface_number, alternate_setting),
            TransferBuffer::None,
        )
    }

    pub fn bulk_or_interrupt(endpoint: u8, flags: TransferFlags, buffer: TransferBuffer) -> Self {
        Self {
            function: UrbFunction::BulkOrInterruptTransfer,
            status: UsbdStatus::Success,
            actual_length: 0,
            transfer: UrbTransfer::BulkOrInterrupt {
                endpoint,
                flags,
                buffer,
            },
        }
    }

    pub fn isoch(transfer: IsochTransfer) -> Self {
        Self {
            function: UrbFunction::IsochTransfer,
            status: UsbdStatus::Success,
            actual_length: 0,
            transfer: UrbTransfer::Isoch(transfer),
        }
    }

    /// Authoritative transfer direction: the setup packet for control
    /// requests, the endpoint address bit otherwise.
    pub fn direction(&self) -> Direction {
        let device_to_host = match &self.transfer {
            UrbTransfer::Control { setup, .. } => setup.is_device_to_host(),
            UrbTransfer::BulkOrInterrupt { endpoint, .. } => endpoint & 0x80 != 0,
            UrbTransfer::Isoch(iso) => iso.endpoint & 0x80 != 0,
        };
        if device_to_host {
            Direction::In
        } else {
            Direction::Out
        }
    }

    /// Endpoint number (0..=15) for the PDU header.
    pub fn endpoint_number(&self) -> u8 {
        match &self.transfer {
            UrbTransfer::Control { .. } => 0,
            UrbTransfer::BulkOrInterrupt { endpoint, .. } => endpoint & 0x0f,
            UrbTransfer::Isoch(iso) => iso.endpoint & 0x0f,
        }
    }

    pub fn buffer(&self) -> &TransferBuffer {
        match &self.transfer {
            UrbTransfer::Control { buffer, .. } => buffer,
            UrbTransfer::BulkOrInterrupt { buffer, .. } => buffer,
            UrbTransfer::Isoch(iso) => &iso.buffer,
        }
    }

    pub(crate) fn buffer_mut(&mut self) -> &mut TransferBuffer {
        match &mut self.transfer {
            UrbTransfer::Control { buffer, .. } => buffer,
            UrbTransfer::BulkOrInterrupt { buffer, .. } => buffer,
            UrbTransfer::Isoch(iso) => &mut iso.buffer,
        }
    }

    pub fn setup(&self) -> Option<&SetupPacket> {
        match &self.transfer {
            UrbTransfer::Control { setup, .. } => Some(setup),
            _ => None,
        }
    }

    pub(crate) fn setup_bytes(&self) -> [u8; 8] {
        match self.setup() {
            Some(setup) => setup.to_bytes(),
            None => [0; 8],
        }
    }

    pub(crate) fn flags(&self) -> TransferFlags {
        match &self.transfer {
            UrbTransfer::Control { flags, .. } => *flags,
            UrbTransfer::BulkOrInterrupt { flags, .. } => *flags,
            UrbTransfer::Isoch(iso) => iso.flags,
        }
    }

    pub fn iso(&self) -> Option<&IsochTransfer> {
        match &self.transfer {
            UrbTransfer::Isoch(iso) => Some(iso),
            _ => None,
        }
    }

    pub(crate) fn iso_mut(&mut self) -> Option<&mut IsochTransfer> {
        match &mut self.transfer {
            UrbTransfer::Isoch(iso) => Some(iso),
            _ => None,
        }
    }

    pub(crate) fn is_isoch(&self) -> bool {
        matches!(self.transfer, UrbTransfer::Isoch(_))
    }

    pub(crate) fn number_of_packets(&self) -> i32 {
        self.iso().map_or(0, |iso| iso.packets.len() as i32)
    }

    pub(crate) fn submit_start_frame(&self) -> i32 {
        match self.iso() {
            Some(iso) if !iso.flags.iso_asap => iso.start_frame,
            _ => 0,
        }
    }

    pub(crate) fn interval(&self) -> i32 {
        self.iso().map_or(0, |iso| iso.interval)
    }

    /// Pack the submit-side iso descriptor table.
    pub(crate) fn wire_iso_descriptors(&self) -> Option<Vec<IsoPacketDescriptor>> {
        self.iso().map(|iso| {
            iso.packets
                .iter()
                .map(|p| IsoPacketDescriptor {
                    offset: p.offset,
                    length: p.length,
                    actual_length: 0,
                    status: 0,
                })
                .collect()
        })
    }
}

/// Parse the Microsoft OS string descriptor and return its vendor code.
///
/// The descriptor lives at string index 0xEE: 18 bytes, `"MSFT100"` in
/// UTF-16LE, then the vendor code and a pad byte.
pub fn parse_os_string_vendor_code(data: &[u8]) -> Option<u8> {
    const SIGNATURE: &[u8; 14] = b"M\0S\0F\0T\x001\x000\x000\0";

    if data.len() != 18 || data[0] != 18 || data[1] != DESCRIPTOR_TYPE_STRING {
        return None;
    }
    if &data[2..16] != SIGNATURE {
        return None;
    }
    Some(data[16])
}

/// A plausible string descriptor: correctly sized, even length, string type.
pub(crate) fn is_valid_string_descriptor(data: &[u8]) -> bool {
    data.len() >= 2
        && data[1] == DESCRIPTOR_TYPE_STRING
        && usize::from(data[0]) == data.len()
        && data.len() % 2 == 0
}

/// Speed reported by the server for an imported device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum UsbSpeed {
    Unknown,
    Low,
    Full,
    High,
    Wireless,
    Super,
    SuperPlus,
}

impl UsbSpeed {
    pub fn from_wire(raw: u32) -> Self {
        match raw {
            1 => UsbSpeed::Low,
            2 => UsbSpeed::Full,
            3 => UsbSpeed::High,
            4 => UsbSpeed::Wireless,
            5 => UsbSpeed::Super,
            6 => UsbSpeed::SuperPlus,
            _ => UsbSpeed::Unknown,
        }
    }

    /// USB3-and-above devices claim ports from the second sub-range.
    pub fn is_super_or_above(self) -> bool {
        self >= UsbSpeed::Super
    }
}
