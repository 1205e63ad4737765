//! Per-device receive loop.
//!
//! One task per attached device: read a 48-byte header, validate it, match
//! the reply to its pending request, pull the payload, run the completion
//! dispatch and re-arm. Header-level failures (socket loss, protocol
//! violations) terminate the loop and run the detach sequence; a reply for an
//! unknown sequence number is drained and dropped, since a canceled request
//! may legitimately see its late RET_SUBMIT.

use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tracing::{debug, error, warn};

use usbip_proto::{
    self as proto, HeaderCmd, RetSubmit, UsbipHeader, ISO_PACKET_DESCRIPTOR_LEN, USBIP_HEADER_LEN,
};

use crate::device::Device;
use crate::dispatch::{self, IsoReply};
use crate::request::RequestStatus;

enum LoopControl {
    Continue,
    Stop,
}

pub(crate) async fn recv_loop(device: Arc<Device>, mut reader: OwnedReadHalf) {
    let mut header_buf = [0u8; USBIP_HEADER_LEN];

    loop {
        if device.is_unplugged() {
            break;
        }

        tokio::select! {
            biased;
            _ = device.stopped() => break,
            read = reader.read_exact(&mut header_buf) => {
                if let Err(err) = read {
                    disconnect(&device, &err).await;
                    break;
                }
            }
        }

        let header = match UsbipHeader::decode(&header_buf) {
            Ok(header) => header,
            Err(err) => {
                error!(error = %err, "bad usbip header");
                detach(&device).await;
                break;
            }
        };

        let seqnum = header.base.seqnum;
        if !proto::is_valid_seqnum(seqnum) {
            error!(seqnum, "invalid seqnum");
            detach(&device).await;
            break;
        }

        match header.cmd {
            HeaderCmd::RetUnlink(ret) => {
                // The URB was completed when CMD_UNLINK was issued;
                // -ECONNRESET means the unlink won, 0 that the reply had
                // already been sent. Nothing left to do either way.
                debug!(seqnum, status = ret.status, "unlink reply drained");
            }
            HeaderCmd::RetSubmit(ret) => {
                match handle_ret_submit(&device, &mut reader, seqnum, &ret).await {
                    LoopControl::Continue => {}
                    LoopControl::Stop => break,
                }
            }
            HeaderCmd::Submit(_) | HeaderCmd::Unlink(_) => {
                error!(seqnum, "server sent a command PDU");
                detach(&device).await;
                break;
            }
        }
    }

    debug!(devid = device.devid, "receive loop exited");
}

async fn handle_ret_submit(
    device: &Arc<Device>,
    reader: &mut OwnedReadHalf,
    seqnum: u32,
    ret: &RetSubmit,
) -> LoopControl {
    // The server zeroes direction on RET PDUs; the seqnum low bit is
    // authoritative.
    let direction = proto::extract_dir(seqnum);
    let payload_len = proto::ret_submit_payload_len(direction, ret.actual_length, ret.number_of_packets);

    let Some(request) = device.pending.get(seqnum) else {
        // Late reply for a canceled request.
        warn!(seqnum, "no pending request, dropping reply");
        return drain(device, reader, payload_len).await;
    };

    // Pull the whole payload off the socket before touching the request:
    // the entry lock is shared with the cancel and disconnect paths and must
    // never be held across I/O.
    let mut payload = vec![0u8; payload_len];
    if let Err(err) = reader.read_exact(&mut payload).await {
        disconnect(device, &err).await;
        return LoopControl::Stop;
    }

    let mut guard = request.entry.lock().await;
    let Some(entry) = guard.as_mut() else {
        // Canceled while the payload was in flight; already consumed above.
        return LoopControl::Continue;
    };

    let iso = if entry.urb.is_isoch() {
        let data_len = if direction.is_in() {
            ret.actual_length.max(0) as usize
        } else {
            0
        };
        let count = ret.number_of_packets.max(0) as usize;
        debug_assert_eq!(payload.len(), data_len + count * ISO_PACKET_DESCRIPTOR_LEN);

        match proto::decode_iso_descriptors(&payload[data_len..], count) {
            Ok(descriptors) => {
                payload.truncate(data_len);
                Some(IsoReply {
                    payload,
                    descriptors,
                })
            }
            Err(err) => {
                error!(seqnum, error = %err, "bad iso descriptor table");
                drop(guard);
                detach(device).await;
                return LoopControl::Stop;
            }
        }
    } else {
        if direction.is_in() && !payload.is_empty() {
            // Place the reply into the transfer buffer when it fits; an
            // oversized reply is dropped here and flagged by the dispatch.
            if let Some(buf) = entry.urb.buffer_mut().data_vec_mut() {
                if payload.len() <= buf.len() {
                    buf[..payload.len()].copy_from_slice(&payload);
                }
            }
        }
        None
    };

    let outcome = dispatch::ret_submit(device, &mut entry.urb, ret, iso);
    drop(guard);

    match request.mark(RequestStatus::RecvComplete) {
        // Send path still running; it completes the URB.
        RequestStatus::Zero => {}
        RequestStatus::SendComplete => device.finish_second_mover(&request).await,
        // Cancel won; it owns completion and the reply is dropped.
        _ => {}
    }

    if outcome.unplug {
        detach(device).await;
    }

    LoopControl::Continue
}

/// Consume `len` payload bytes that belong to no live request.
async fn drain(device: &Arc<Device>, reader: &mut OwnedReadHalf, len: usize) -> LoopControl {
    if len == 0 {
        return LoopControl::Continue;
    }
    let mut scratch = vec![0u8; len];
    match reader.read_exact(&mut scratch).await {
        Ok(_) => LoopControl::Continue,
        Err(err) => {
            disconnect(device, &err).await;
            LoopControl::Stop
        }
    }
}

async fn disconnect(device: &Arc<Device>, err: &std::io::Error) {
    if !device.is_unplugged() {
        warn!(devid = device.devid, error = %err, "connection lost");
        detach(device).await;
    }
}

async fn detach(device: &Arc<Device>) {
    if let Some(vhci) = device.vhci.upgrade() {
        crate::vhci::detach_device(&vhci, device).await;
    }
}
