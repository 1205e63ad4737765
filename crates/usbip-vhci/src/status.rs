//! Translation between USB/IP status codes and host USB status codes.
//!
//! A USB/IP server reports transfer outcomes as Linux negative errno values;
//! the host stack consumes [`UsbdStatus`]. Both translation tables are closed:
//! a success maps to a success, and any code outside the table maps to a
//! generic failure. Isochronous transfers use a separate table because short
//! or stalled packets are encoded differently there.

/// Linux errno values that appear in USB/IP status fields.
pub(crate) mod errno {
    pub const EPERM: i32 = 1;
    pub const ENOENT: i32 = 2;
    pub const ENOMEM: i32 = 12;
    pub const EXDEV: i32 = 18;
    pub const ENODEV: i32 = 19;
    pub const EINVAL: i32 = 22;
    pub const EPIPE: i32 = 32;
    pub const ETIME: i32 = 62;
    pub const EPROTO: i32 = 71;
    pub const EOVERFLOW: i32 = 75;
    pub const EILSEQ: i32 = 84;
    pub const ECONNRESET: i32 = 104;
    pub const ESHUTDOWN: i32 = 108;
    pub const ETIMEDOUT: i32 = 110;
    pub const EREMOTEIO: i32 = 121;
}

/// Host-stack view of a transfer outcome, the `UrbHeader.Status` analog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbdStatus {
    Success,
    /// Endpoint stall. On EP0 this is routinely non-fatal: control endpoints
    /// report protocol stalls with the same code as a true halt.
    Stalled,
    Crc,
    BitStuffing,
    Babble,
    ShortTransfer,
    Timeout,
    NotResponding,
    Canceled,
    DeviceGone,
    IsochRequestFailed,
    IsochTdError,
    IsochNotAccessed,
    InvalidParameter,
    InsufficientResources,
    InternalError,
    RequestFailed,
}

impl UsbdStatus {
    pub fn is_success(self) -> bool {
        self == UsbdStatus::Success
    }
}

/// Map a USB/IP transfer status onto the host status for a non-isochronous
/// transfer. Zero is success; unknown errno values collapse to
/// [`UsbdStatus::RequestFailed`].
pub fn usbd_from_usbip(status: i32) -> UsbdStatus {
    match status {
        0 => UsbdStatus::Success,
        s if s == -errno::EPIPE => UsbdStatus::Stalled,
        s if s == -errno::EILSEQ => UsbdStatus::Crc,
        s if s == -errno::EPROTO => UsbdStatus::BitStuffing,
        s if s == -errno::EOVERFLOW => UsbdStatus::Babble,
        s if s == -errno::EREMOTEIO => UsbdStatus::ShortTransfer,
        s if s == -errno::ETIMEDOUT => UsbdStatus::Timeout,
        s if s == -errno::ETIME => UsbdStatus::NotResponding,
        s if s == -errno::ENOENT || s == -errno::ECONNRESET => UsbdStatus::Canceled,
        s if s == -errno::ENODEV || s == -errno::ESHUTDOWN => UsbdStatus::DeviceGone,
        s if s == -errno::EXDEV => UsbdStatus::IsochRequestFailed,
        s if s == -errno::EINVAL => UsbdStatus::InvalidParameter,
        s if s == -errno::ENOMEM => UsbdStatus::InsufficientResources,
        _ => UsbdStatus::RequestFailed,
    }
}

/// Per-packet variant of [`usbd_from_usbip`]. `-EXDEV` marks a packet the
/// controller never reached, not a failed request.
pub fn usbd_from_usbip_isoch(status: i32) -> UsbdStatus {
    match status {
        0 => UsbdStatus::Success,
        s if s == -errno::EXDEV => UsbdStatus::IsochTdError,
        s if s == -errno::EPIPE => UsbdStatus::Stalled,
        s if s == -errno::EOVERFLOW => UsbdStatus::Babble,
        s if s == -errno::ENOENT || s == -errno::ECONNRESET => UsbdStatus::Canceled,
        s if s == -errno::ENODEV || s == -errno::ESHUTDOWN => UsbdStatus::DeviceGone,
        _ => UsbdStatus::IsochNotAccessed,
    }
}

/// Reverse map, host status onto a USB/IP errno. Statuses without a distinct
/// errno collapse to `-EPERM`.
pub fn usbip_from_usbd(status: UsbdStatus) -> i32 {
    match status {
        UsbdStatus::Success => 0,
        UsbdStatus::Stalled => -errno::EPIPE,
        UsbdStatus::Crc => -errno::EILSEQ,
        UsbdStatus::BitStuffing => -errno::EPROTO,
        UsbdStatus::Babble => -errno::EOVERFLOW,
        UsbdStatus::ShortTransfer => -errno::EREMOTEIO,
        UsbdStatus::Timeout => -errno::ETIMEDOUT,
        UsbdStatus::NotResponding => -errno::ETIME,
        UsbdStatus::Canceled => -errno::ECONNRESET,
        UsbdStatus::DeviceGone => -errno::ENODEV,
        UsbdStatus::IsochRequestFailed | UsbdStatus::IsochTdError => -errno::EXDEV,
        UsbdStatus::InvalidParameter => -errno::EINVAL,
        UsbdStatus::InsufficientResources => -errno::ENOMEM,
        UsbdStatus::IsochNotAccessed
        | UsbdStatus::InternalError
        | UsbdStatus::RequestFailed => -errno::EPERM,
    }
}

/// `op_common.status` of an `OP_REP_IMPORT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    Ok,
    /// Device requested for import is not available.
    Na,
    DevBusy,
    DevErr,
    NoDev,
    Error,
    Unrecognized(u32),
}

impl OpStatus {
    pub fn from_wire(raw: u32) -> Self {
        match raw {
            0 => OpStatus::Ok,
            1 => OpStatus::Na,
            2 => OpStatus::DevBusy,
            3 => OpStatus::DevErr,
            4 => OpStatus::NoDev,
            5 => OpStatus::Error,
            other => OpStatus::Unrecognized(other),
        }
    }
}

impl core::fmt::Display for OpStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            OpStatus::Ok => write!(f, "ST_OK"),
            OpStatus::Na => write!(f, "ST_NA"),
            OpStatus::DevBusy => write!(f, "ST_DEV_BUSY"),
            OpStatus::DevErr => write!(f, "ST_DEV_ERR"),
            OpStatus::NoDev => write!(f, "ST_NODEV"),
            OpStatus::Error => write!(f, "ST_ERROR"),
            OpStatus::Unrecognized(raw) => write!(f, "ST_{raw}"),
        }
    }
}
