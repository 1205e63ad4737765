//! URB completion dispatch.
//!
//! When a RET_SUBMIT arrives, the request's function code selects how the
//! reply is folded back into the URB: generic transfers copy the payload and
//! clamp lengths, select-configuration and select-interface update the
//! device's active configuration, descriptor reads feed the string cache and
//! the device-descriptor snapshot, isochronous replies are reassembled
//! packet by packet.

use tracing::{debug, error, info, warn};

use usbip_proto::{Direction, IsoPacketDescriptor, RetSubmit};

use crate::device::{DescriptorCheck, Device};
use crate::status::{usbd_from_usbip, usbd_from_usbip_isoch, UsbdStatus};
use crate::urb::{
    is_valid_string_descriptor, parse_os_string_vendor_code, HandlerClass, Urb,
    DESCRIPTOR_TYPE_DEVICE, DESCRIPTOR_TYPE_STRING,
};

/// IN payload and descriptor table of an isochronous RET_SUBMIT.
pub(crate) struct IsoReply {
    /// Compacted payload: the per-packet actual lengths, no gaps.
    pub payload: Vec<u8>,
    pub descriptors: Vec<IsoPacketDescriptor>,
}

#[derive(Default)]
pub(crate) struct DispatchOutcome {
    /// The device invalidated itself (descriptor snapshot mismatch); the
    /// caller runs the detach sequence.
    pub unplug: bool,
}

#[derive(Debug)]
enum DispatchError {
    InvalidBufferSize,
    InvalidParameter,
    Internal,
}

/// Fold a RET_SUBMIT into its URB and set the completion status.
///
/// If a handler fails while the URB's own status still reads success, the
/// status is overwritten with [`UsbdStatus::InvalidParameter`] so the host
/// observes a consistent failure code.
pub(crate) fn ret_submit(
    device: &Device,
    urb: &mut Urb,
    ret: &RetSubmit,
    iso: Option<IsoReply>,
) -> DispatchOutcome {
    urb.status = if ret.status != 0 {
        usbd_from_usbip(ret.status)
    } else {
        UsbdStatus::Success
    };

    let mut outcome = DispatchOutcome::default();
    let result = match urb.function.handler_class() {
        HandlerClass::Generic => generic(urb, ret),
        HandlerClass::SelectConfiguration => select_configuration(device, urb),
        HandlerClass::SelectInterface => select_interface(device, urb),
        HandlerClass::ControlDescriptor => control_descriptor(device, urb, ret, &mut outcome),
        HandlerClass::Isoch => match iso {
            Some(iso) => isoch(device, urb, ret, iso),
            None => Err(DispatchError::InvalidParameter),
        },
        HandlerClass::Success => Ok(()),
        HandlerClass::Unexpected => {
            error!(function = ?urb.function, "function must never be submitted");
            Err(DispatchError::Internal)
        }
    };

    if let Err(err) = result {
        debug!(function = ?urb.function, ?err, "completion handler failed");
        if urb.status.is_success() {
            urb.status = UsbdStatus::InvalidParameter;
        }
    }

    outcome
}

/// Clamp `actual_length` against the submitted buffer. Mirrors the host
/// stack's rule: an out-of-range reply zeroes the length and fails.
fn assign_actual_length(urb: &mut Urb, actual_length: i32) -> Result<usize, DispatchError> {
    let capacity = urb.buffer().len();
    let ok = actual_length >= 0 && actual_length as usize <= capacity;
    urb.actual_length = if ok { actual_length as u32 } else { 0 };
    if ok {
        Ok(actual_length as usize)
    } else {
        Err(DispatchError::InvalidBufferSize)
    }
}

fn generic(urb: &mut Urb, ret: &RetSubmit) -> Result<(), DispatchError> {
    let actual = assign_actual_length(urb, ret.actual_length)?;

    if urb.direction() == Direction::Out || actual == 0 {
        return Ok(());
    }

    // The receive loop already placed the payload; expose exactly the
    // received bytes.
    if let Some(data) = urb.buffer_mut().data_vec_mut() {
        data.truncate(actual);
    }
    Ok(())
}

/// EP0 stall is not an error here: the control endpoint cannot halt, it
/// reports protocol stalls with the same code.
fn forgive_ep0_stall(urb: &mut Urb, what: &str) {
    if urb.status == UsbdStatus::Stalled {
        warn!("ignoring EP0 stall on {what}");
        urb.status = UsbdStatus::Success;
    }
}

fn select_configuration(device: &Device, urb: &mut Urb) -> Result<(), DispatchError> {
    forgive_ep0_stall(urb, "select configuration");
    if !urb.status.is_success() {
        return Ok(());
    }

    if device.skip_select_config {
        debug!("select configuration short-circuited");
        return Ok(());
    }

    if let Some(setup) = urb.setup() {
        device.select_config((setup.value & 0xff) as u8);
    }
    Ok(())
}

/// A device whose interface has only one altsetting routinely answers
/// SET_INTERFACE with a stall; treated like the EP0 case above.
fn select_interface(device: &Device, urb: &mut Urb) -> Result<(), DispatchError> {
    forgive_ep0_stall(urb, "select interface");
    if !urb.status.is_success() {
        return Ok(());
    }

    if let Some(setup) = urb.setup() {
        device.select_interface((setup.index & 0xff) as u8, (setup.value & 0xff) as u8);
    }
    Ok(())
}

/// A descriptor read may fetch just the header to learn the real size, or the
/// full descriptor. Full string descriptors feed the cache (or the MS OS
/// vendor code); a refetched device descriptor must match the snapshot.
fn control_descriptor(
    device: &Device,
    urb: &mut Urb,
    ret: &RetSubmit,
    outcome: &mut DispatchOutcome,
) -> Result<(), DispatchError> {
    let actual = assign_actual_length(urb, ret.actual_length)?;

    if urb.direction() == Direction::Out {
        return Ok(());
    }

    if actual < 2 {
        urb.actual_length = 0;
        return Err(DispatchError::InvalidBufferSize);
    }

    let Some(setup) = urb.setup().copied() else {
        return Err(DispatchError::InvalidParameter);
    };
    let Some(data) = urb.buffer().data().map(|d| &d[..actual]) else {
        return Err(DispatchError::InvalidParameter);
    };

    match setup.descriptor_type() {
        DESCRIPTOR_TYPE_STRING => {
            if data[1] == DESCRIPTOR_TYPE_STRING && usize::from(data[0]) == actual {
                if let Some(code) = parse_os_string_vendor_code(data) {
                    info!(ms_vendor_code = code, "OS string descriptor");
                    device.set_ms_vendor_code(code);
                } else if is_valid_string_descriptor(data) {
                    device.cache_string_descriptor(setup.descriptor_index(), setup.index, data);
                }
            }
        }
        DESCRIPTOR_TYPE_DEVICE => match device.note_device_descriptor(data) {
            DescriptorCheck::Stored | DescriptorCheck::Matches | DescriptorCheck::Ignored => {}
            DescriptorCheck::Mismatch => {
                error!("device descriptor is not the same");
                outcome.unplug = true;
            }
        },
        _ => {}
    }

    if let Some(buf) = urb.buffer_mut().data_vec_mut() {
        buf.truncate(actual);
    }
    Ok(())
}

/// Reassemble an isochronous reply.
///
/// The server's payload is compacted (the per-packet actual lengths, no
/// gaps), while the descriptor offsets preserve the original sparse layout;
/// each packet is copied back out to its own offset.
fn isoch(
    device: &Device,
    urb: &mut Urb,
    ret: &RetSubmit,
    iso: IsoReply,
) -> Result<(), DispatchError> {
    let direction = urb.direction();
    let count = ret.number_of_packets;

    {
        let Some(transfer) = urb.iso_mut() else {
            return Err(DispatchError::InvalidParameter);
        };
        transfer.error_count = ret.error_count.max(0) as u32;
        if transfer.flags.iso_asap {
            transfer.start_frame = ret.start_frame;
        }
    }

    if count > 0 && count == ret.error_count {
        urb.status = UsbdStatus::IsochRequestFailed;
    }

    let Some(transfer) = urb.iso_mut() else {
        return Err(DispatchError::InvalidParameter);
    };

    if !(count >= 0 && count as usize == transfer.packets.len()) {
        warn!(
            count,
            expected = transfer.packets.len(),
            "iso packet count mismatch"
        );
        return Err(DispatchError::InvalidParameter);
    }
    if !(ret.actual_length >= 0 && ret.actual_length as usize <= transfer.buffer.len()) {
        warn!(
            actual_length = ret.actual_length,
            capacity = transfer.buffer.len(),
            "iso actual length exceeds transfer buffer"
        );
        return Err(DispatchError::InvalidParameter);
    }
    if iso.descriptors.len() != transfer.packets.len() {
        return Err(DispatchError::InvalidParameter);
    }

    device
        .current_frame_number
        .store(ret.start_frame as u32, std::sync::atomic::Ordering::Relaxed);

    let src_len = ret.actual_length as usize;
    let capacity = transfer.buffer.len();
    let mut src_offset = 0usize;

    for (src, dst) in iso.descriptors.iter().zip(transfer.packets.iter_mut()) {
        dst.status = if src.status != 0 {
            usbd_from_usbip_isoch(src.status)
        } else {
            UsbdStatus::Success
        };

        let advance = src.actual_length as usize;

        if direction == Direction::Out {
            src_offset += advance;
            continue;
        }

        if advance == 0 {
            dst.actual_length = 0;
            continue;
        }

        if src.actual_length > src.length {
            warn!(
                actual_length = src.actual_length,
                length = src.length,
                "iso packet overran its slot"
            );
            return Err(DispatchError::InvalidParameter);
        }
        // The server compacts the payload but leaves offsets intact.
        if src.offset != dst.offset {
            warn!(src = src.offset, dst = dst.offset, "iso packet offset mismatch");
            return Err(DispatchError::InvalidParameter);
        }
        if src_offset > dst.offset as usize {
            warn!(src_offset, dst = dst.offset, "iso source has gaps");
            return Err(DispatchError::InvalidParameter);
        }
        if src_offset + advance > src_len {
            warn!(src_offset, advance, src_len, "iso packet past payload end");
            return Err(DispatchError::InvalidParameter);
        }
        if dst.offset as usize + advance > capacity {
            warn!(
                dst = dst.offset,
                advance, capacity, "iso packet past transfer buffer end"
            );
            return Err(DispatchError::InvalidParameter);
        }

        let dst_offset = dst.offset as usize;
        if let Some(buf) = transfer.buffer.data_vec_mut() {
            buf[dst_offset..dst_offset + advance]
                .copy_from_slice(&iso.payload[src_offset..src_offset + advance]);
        } else {
            return Err(DispatchError::InvalidParameter);
        }

        dst.actual_length = src.actual_length;
        src_offset += advance;
    }

    if src_offset != src_len {
        warn!(src_offset, src_len, "iso payload not fully consumed");
        return Err(DispatchError::InvalidParameter);
    }

    urb.actual_length = ret.actual_length as u32;
    Ok(())
}
