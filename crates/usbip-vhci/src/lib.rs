#![forbid(unsafe_code)]

//! Virtual host controller core for a USB/IP client.
//!
//! This crate exposes a set of emulated USB devices to a local USB stack and
//! proxies every USB request block to a remote USB/IP server over TCP. The
//! [`Vhci`] owns a fixed table of virtual ports (USB2 and USB3 sub-ranges);
//! each attached device runs one receive task and multiplexes arbitrarily
//! many concurrent submissions over a single socket, demultiplexing replies
//! by direction-tagged sequence number.
//!
//! The lifecycle of a submission:
//!
//! 1. a [`urb::Urb`] is handed to [`Vhci::submit`] with a completion callback,
//! 2. the send pipeline allocates a sequence number, registers the request
//!    as pending and writes the CMD_SUBMIT PDU (header, OUT payload and iso
//!    descriptor table as one send),
//! 3. the device's receive task matches the RET_SUBMIT by sequence number,
//!    reads the payload into the URB and runs the function-specific
//!    completion dispatch,
//! 4. whichever of the send and receive paths finishes second invokes the
//!    callback; cancellation and disconnect win any race via an atomic
//!    status machine and complete the URB as canceled.
//!
//! Wire encoding lives in the `usbip-proto` crate.

pub mod persistent;
pub mod status;
pub mod urb;

mod device;
mod dispatch;
mod recv;
mod request;
mod vhci;

pub use device::{Location, RequestHandle, SubmitError};
pub use request::UrbComplete;
pub use status::{OpStatus, UsbdStatus};
pub use vhci::{
    AttachError, AttachOptions, DetachError, ImportedDevice, Vhci, TOTAL_PORTS, USB2_PORTS,
    USB3_PORTS,
};
