//! Per-device context and the submit/cancel side of the request pipeline.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Notify;
use tracing::{debug, warn};

use usbip_proto::{
    self as proto, CmdSubmit, CmdUnlink, Direction, HeaderBasic, HeaderCmd, UsbipHeader,
};

use crate::request::{
    next_seqnum, PendingTable, Request, RequestStatus, UrbComplete, UrbEntry,
};
use crate::status::UsbdStatus;
use crate::urb::{HandlerClass, Urb, UsbSpeed, DEVICE_DESCRIPTOR_LEN};
use crate::vhci::VhciInner;

/// Where an attached device lives: `host:service` plus the bus id claimed on
/// the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub host: String,
    pub service: String,
    pub busid: String,
}

impl core::fmt::Display for Location {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.service, self.busid)
    }
}

/// Submission failure. When `submit` returns an error before the request was
/// queued, the completion callback has not been and will not be invoked.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("no device on that port")]
    NoSuchDevice,
    #[error("device is unplugged")]
    DeviceGone,
    #[error("function {0:?} cannot be submitted")]
    UnexpectedFunction(crate::urb::UrbFunction),
    #[error("transfer failed: {0:?}")]
    Transfer(UsbdStatus),
}

/// Handle for canceling an in-flight URB.
#[derive(Debug, Clone)]
pub struct RequestHandle {
    pub(crate) device: Weak<Device>,
    pub(crate) seqnum: u32,
}

impl RequestHandle {
    pub fn seqnum(&self) -> u32 {
        self.seqnum
    }

    /// Cancel the request. Always legal: a not-yet-sent submit completes
    /// canceled immediately, an in-flight one additionally gets a CMD_UNLINK,
    /// and a request that already completed is left alone.
    pub async fn cancel(&self) {
        if let Some(device) = self.device.upgrade() {
            device.cancel(self.seqnum).await;
        }
    }
}

/// Configuration and alternate settings the host selected on the device.
#[derive(Debug, Default)]
pub(crate) struct ActiveConfig {
    pub configuration_value: Option<u8>,
    /// interface number -> alternate setting
    pub interfaces: std::collections::HashMap<u8, u8>,
}

/// Outcome of checking a refetched device descriptor against the snapshot.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum DescriptorCheck {
    Stored,
    Matches,
    Mismatch,
    Ignored,
}

/// One attached remote device. Owns its socket, sequence counter, pending
/// table and send gate.
pub(crate) struct Device {
    pub devid: u32,
    pub speed: UsbSpeed,
    pub location: Location,
    /// Exported-device properties from OP_REP_IMPORT.
    pub info: proto::UsbDevice,
    pub skip_select_config: bool,

    port: AtomicU32,
    seqnum: AtomicU32,
    pub pending: PendingTable,
    /// Send gate: one PDU reaches the wire at a time, FIFO by lock order.
    /// `None` once the socket is closed.
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    pub unplugged: AtomicBool,
    stop: Notify,

    strings: Mutex<Vec<Option<Arc<[u8]>>>>,
    device_descriptor: Mutex<Option<[u8; DEVICE_DESCRIPTOR_LEN]>>,
    ms_vendor_code: Mutex<Option<u8>>,
    pub(crate) active: Mutex<ActiveConfig>,
    pub current_frame_number: AtomicU32,

    pub(crate) vhci: Weak<VhciInner>,
}

impl Device {
    pub fn new(
        info: proto::UsbDevice,
        location: Location,
        skip_select_config: bool,
        writer: OwnedWriteHalf,
        vhci: Weak<VhciInner>,
    ) -> Arc<Self> {
        Arc::new(Self {
            devid: info.devid(),
            speed: UsbSpeed::from_wire(info.speed),
            location,
            info,
            skip_select_config,
            port: AtomicU32::new(0),
            seqnum: AtomicU32::new(0),
            pending: PendingTable::default(),
            writer: tokio::sync::Mutex::new(Some(writer)),
            unplugged: AtomicBool::new(false),
            stop: Notify::new(),
            strings: Mutex::new(vec![None; 256]),
            device_descriptor: Mutex::new(None),
            ms_vendor_code: Mutex::new(None),
            active: Mutex::new(ActiveConfig::default()),
            current_frame_number: AtomicU32::new(0),
            vhci,
        })
    }

    pub fn port(&self) -> u16 {
        self.port.load(Ordering::Acquire) as u16
    }

    pub fn set_port(&self, port: u16) {
        self.port.store(u32::from(port), Ordering::Release);
    }

    pub fn take_port(&self) -> u16 {
        self.port.swap(0, Ordering::AcqRel) as u16
    }

    pub fn is_unplugged(&self) -> bool {
        self.unplugged.load(Ordering::Acquire)
    }

    /// Resolves once [`Self::stop_receive_loop`] ran.
    pub async fn stopped(&self) {
        self.stop.notified().await;
    }

    pub fn stop_receive_loop(&self) {
        self.stop.notify_one();
    }

    /// Submit a URB. The completion callback is invoked exactly once for
    /// every accepted submission, from whichever of the send, receive, cancel
    /// or disconnect paths finishes the request.
    pub async fn submit(
        self: &Arc<Self>,
        mut urb: Urb,
        complete: UrbComplete,
    ) -> Result<RequestHandle, SubmitError> {
        if self.is_unplugged() {
            return Err(SubmitError::DeviceGone);
        }
        if urb.function.handler_class() == HandlerClass::Unexpected {
            return Err(SubmitError::UnexpectedFunction(urb.function));
        }

        let direction = urb.direction();
        let seqnum = next_seqnum(&self.seqnum, direction);
        let endpoint = urb.endpoint_number();
        let owned_buffer = urb.buffer_mut().materialize();

        let header = UsbipHeader {
            base: HeaderBasic {
                seqnum,
                devid: self.devid,
                direction,
                ep: u32::from(endpoint),
            },
            cmd: HeaderCmd::Submit(CmdSubmit {
                transfer_flags: urb.flags().to_wire(direction),
                transfer_buffer_length: urb.buffer().len() as i32,
                start_frame: urb.submit_start_frame(),
                number_of_packets: urb.number_of_packets(),
                interval: urb.interval(),
                setup: urb.setup_bytes(),
            }),
        };

        // One gathered send per PDU: header, OUT payload, iso descriptors.
        let payload_len = proto::cmd_submit_payload_len(
            direction,
            urb.buffer().len() as i32,
            urb.number_of_packets(),
        );
        let mut pdu = Vec::with_capacity(proto::USBIP_HEADER_LEN + payload_len);
        pdu.extend_from_slice(&header.encode());
        if direction == Direction::Out {
            if let Some(data) = urb.buffer().data() {
                pdu.extend_from_slice(data);
            }
        }
        if let Some(descs) = urb.wire_iso_descriptors() {
            pdu.extend_from_slice(&proto::encode_iso_descriptors(&descs));
        }

        let request = Request::new(
            seqnum,
            endpoint,
            UrbEntry {
                urb,
                complete,
                owned_buffer,
            },
        );
        // Inserted before the first byte is written, so the receive loop can
        // match a reply no matter how fast the server answers.
        self.pending.insert(request.clone());

        let write_result = {
            let mut writer = self.writer.lock().await;
            match writer.as_mut() {
                Some(w) => w.write_all(&pdu).await,
                None => Err(std::io::Error::from(std::io::ErrorKind::NotConnected)),
            }
        };

        let handle = RequestHandle {
            device: Arc::downgrade(self),
            seqnum,
        };

        if let Err(err) = write_result {
            warn!(seqnum, error = %err, "submit send failed");
            self.fail_request(&request, UsbdStatus::DeviceGone).await;
            if let Some(vhci) = self.vhci.upgrade() {
                crate::vhci::detach_device(&vhci, self).await;
            }
            return Ok(handle);
        }

        match request.mark(RequestStatus::SendComplete) {
            // Common case: reply not here yet, the receive loop completes.
            RequestStatus::Zero => {}
            // The reply won the race; second mover completes the URB.
            RequestStatus::RecvComplete => self.finish_second_mover(&request).await,
            // Canceled mid-send; the cancel path owns completion.
            _ => {}
        }

        Ok(handle)
    }

    /// Cancel one in-flight request by sequence number.
    pub async fn cancel(self: &Arc<Self>, seqnum: u32) {
        let Some(request) = self.pending.remove(seqnum) else {
            return;
        };

        let prev = request.mark(RequestStatus::Canceled);
        match prev {
            RequestStatus::Zero | RequestStatus::SendComplete => {
                let entry = request.entry.lock().await.take();
                if let Some(mut entry) = entry {
                    entry.urb.status = UsbdStatus::Canceled;
                    debug!(seqnum, "request canceled");
                    entry.finish();
                }
                // Only a request that reached the wire needs an unlink; a
                // not-yet-sent submit is dropped by seqnum on the server side
                // when its late reply finds no pending entry here.
                if prev == RequestStatus::SendComplete {
                    self.send_unlink(seqnum).await;
                }
            }
            // Completion already in flight on another path.
            _ => {}
        }
    }

    /// Issue CMD_UNLINK for a canceled request. The matching RET_UNLINK is
    /// drained by the receive loop.
    async fn send_unlink(&self, victim: u32) {
        if self.is_unplugged() {
            return;
        }
        let seqnum = next_seqnum(&self.seqnum, Direction::Out);
        let header = UsbipHeader {
            base: HeaderBasic {
                seqnum,
                devid: self.devid,
                direction: Direction::Out,
                ep: 0,
            },
            cmd: HeaderCmd::Unlink(CmdUnlink { seqnum: victim }),
        };

        let mut writer = self.writer.lock().await;
        if let Some(w) = writer.as_mut() {
            if let Err(err) = w.write_all(&header.encode()).await {
                warn!(victim, error = %err, "unlink send failed");
            }
        }
    }

    /// Complete a request as the second mover: both `SendComplete` and
    /// `RecvComplete` have occurred.
    pub(crate) async fn finish_second_mover(&self, request: &Arc<Request>) {
        self.pending.remove(request.seqnum);
        let entry = request.entry.lock().await.take();
        if let Some(entry) = entry {
            entry.finish();
        }
    }

    /// Complete a request with `status` outside the normal receive path.
    pub(crate) async fn fail_request(&self, request: &Arc<Request>, status: UsbdStatus) {
        self.pending.remove(request.seqnum);
        request.mark(RequestStatus::Canceled);
        let entry = request.entry.lock().await.take();
        if let Some(mut entry) = entry {
            entry.urb.status = status;
            entry.finish();
        }
    }

    /// Close the socket; unblocks the receive loop.
    pub(crate) async fn close_socket(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(mut w) = writer {
            let _ = w.shutdown().await;
        }
    }

    // Receive-path state updates. The receive task is the only writer of the
    // caches; entries live until device teardown.

    pub(crate) fn cache_string_descriptor(&self, index: u8, language_id: u16, data: &[u8]) {
        if data.len() == 2 {
            debug!(index, "skip empty string descriptor");
            return;
        }
        let mut strings = self.strings.lock().unwrap();
        let slot = &mut strings[usize::from(index)];
        if slot.is_some() {
            debug!(index, "string descriptor already cached");
            return;
        }
        debug!(index, language_id, len = data.len(), "cached string descriptor");
        *slot = Some(Arc::from(data));
    }

    pub fn string_descriptor(&self, index: u8) -> Option<Arc<[u8]>> {
        self.strings.lock().unwrap()[usize::from(index)].clone()
    }

    pub(crate) fn set_ms_vendor_code(&self, code: u8) {
        *self.ms_vendor_code.lock().unwrap() = Some(code);
    }

    pub fn ms_vendor_code(&self) -> Option<u8> {
        *self.ms_vendor_code.lock().unwrap()
    }

    pub fn device_descriptor(&self) -> Option<[u8; DEVICE_DESCRIPTOR_LEN]> {
        *self.device_descriptor.lock().unwrap()
    }

    /// Record the attach-time snapshot, or compare a refetch against it.
    pub(crate) fn note_device_descriptor(&self, data: &[u8]) -> DescriptorCheck {
        check_descriptor(&mut self.device_descriptor.lock().unwrap(), data)
    }

    pub(crate) fn select_config(&self, configuration_value: u8) {
        let mut active = self.active.lock().unwrap();
        active.configuration_value = (configuration_value != 0).then_some(configuration_value);
        active.interfaces.clear();
    }

    pub(crate) fn select_interface(&self, interface_number: u8, alternate_setting: u8) {
        self.active
            .lock()
            .unwrap()
            .interfaces
            .insert(interface_number, alternate_setting);
    }

    pub fn active_configuration(&self) -> Option<u8> {
        self.active.lock().unwrap().configuration_value
    }

    pub fn alternate_setting(&self, interface_number: u8) -> Option<u8> {
        self.active
            .lock()
            .unwrap()
            .interfaces
            .get(&interface_number)
            .copied()
    }
}

fn check_descriptor(
    snapshot: &mut Option<[u8; DEVICE_DESCRIPTOR_LEN]>,
    data: &[u8],
) -> DescriptorCheck {
    match (&*snapshot, <&[u8; DEVICE_DESCRIPTOR_LEN]>::try_from(data)) {
        (None, Ok(full)) => {
            *snapshot = Some(*full);
            DescriptorCheck::Stored
        }
        (None, Err(_)) => DescriptorCheck::Ignored,
        (Some(snap), Ok(full)) if snap == full => DescriptorCheck::Matches,
        (Some(_), _) => DescriptorCheck::Mismatch,
    }
}
