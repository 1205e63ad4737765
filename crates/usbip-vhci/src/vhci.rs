//! The virtual host controller: port table and attachment manager.

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use usbip_proto::{
    self as proto, OpCommon, OP_COMMON_LEN, OP_REP_IMPORT, USBIP_VERSION, USB_DEVICE_LEN,
};

use crate::device::{Device, Location, RequestHandle, SubmitError};
use crate::request::{RequestStatus, UrbComplete};
use crate::status::{OpStatus, UsbdStatus};
use crate::urb::{SetupPacket, TransferBuffer, Urb, UrbFunction, UsbSpeed, DESCRIPTOR_TYPE_DEVICE};

/// Ports available to USB2 devices.
pub const USB2_PORTS: usize = 30;
/// Ports available to USB3-and-above devices.
pub const USB3_PORTS: usize = 30;
pub const TOTAL_PORTS: usize = USB2_PORTS + USB3_PORTS;

/// Attach failure, observable by the caller and by persistence replay.
#[derive(Debug, thiserror::Error)]
pub enum AttachError {
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),
    #[error("usbip version mismatch: got {got:#06x}, expected {USBIP_VERSION:#06x}")]
    Version { got: u16 },
    #[error("unexpected op code: got {got:#06x}, expected {expected:#06x}")]
    UnexpectedCode { got: u16, expected: u16 },
    #[error("malformed reply: {0}")]
    Wire(proto::Error),
    #[error("import refused: {0}")]
    Import(OpStatus),
    #[error("no free port for this speed")]
    PortsExhausted,
    #[error("device descriptor fetch failed: {0:?}")]
    Descriptor(UsbdStatus),
}

impl AttachError {
    /// Whether persistence replay may try this location again. Version,
    /// protocol and ABI mismatches and the enumerated server refusals are
    /// final; everything else is assumed transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            AttachError::Version { .. }
            | AttachError::UnexpectedCode { .. }
            | AttachError::Wire(_) => false,
            AttachError::Import(status) => !matches!(
                status,
                OpStatus::Na
                    | OpStatus::DevBusy
                    | OpStatus::DevErr
                    | OpStatus::NoDev
                    | OpStatus::Error
            ),
            AttachError::Network(_) | AttachError::PortsExhausted | AttachError::Descriptor(_) => {
                true
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DetachError {
    #[error("no device on that port")]
    NoSuchDevice,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AttachOptions {
    /// Do not apply SELECT_CONFIGURATION results to the device context.
    pub skip_select_config: bool,
}

/// One row of `imported_devices`.
#[derive(Debug, Clone)]
pub struct ImportedDevice {
    pub port: u16,
    pub host: String,
    pub service: String,
    pub busid: String,
    pub devid: u32,
    pub speed: UsbSpeed,
    pub vendor: u16,
    pub product: u16,
}

pub(crate) struct VhciInner {
    /// `ports[i]` holds the device on port `i + 1`. USB2 devices claim the
    /// first sub-range, USB3-and-above the second.
    pub ports: Mutex<Vec<Option<Arc<Device>>>>,
}

/// A virtual host controller. Cloning shares the controller.
#[derive(Clone)]
pub struct Vhci {
    inner: Arc<VhciInner>,
}

impl Default for Vhci {
    fn default() -> Self {
        Self::new()
    }
}

impl Vhci {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(VhciInner {
                ports: Mutex::new(vec![None; TOTAL_PORTS]),
            }),
        }
    }

    /// Attach a remote device and return its claimed port (1-based).
    pub async fn attach(&self, location: Location) -> Result<u16, AttachError> {
        self.attach_with(location, AttachOptions::default()).await
    }

    pub async fn attach_with(
        &self,
        location: Location,
        options: AttachOptions,
    ) -> Result<u16, AttachError> {
        let mut stream = TcpStream::connect((location.host.as_str(), resolve_port(&location)?))
            .await?;
        stream.set_nodelay(true)?;

        let udev = import_device(&mut stream, &location).await?;
        let speed = UsbSpeed::from_wire(udev.speed);
        debug!(
            devid = udev.devid(),
            ?speed,
            vendor = udev.id_vendor,
            product = udev.id_product,
            "import accepted"
        );

        let (reader, writer) = stream.into_split();
        let device = Device::new(
            udev,
            location.clone(),
            options.skip_select_config,
            writer,
            Arc::downgrade(&self.inner),
        );

        let port = claim_port(&self.inner, &device).ok_or(AttachError::PortsExhausted)?;
        tokio::spawn(crate::recv::recv_loop(device.clone(), reader));

        // Snapshot the device descriptor through the normal pipeline; later
        // refetches are compared against it.
        if let Err(err) = fetch_device_descriptor(&device).await {
            detach_device(&self.inner, &device).await;
            return Err(err);
        }

        info!(port, %location, "attached");
        Ok(port)
    }

    /// Detach the device on `port`.
    pub async fn detach(&self, port: u16) -> Result<(), DetachError> {
        let device = lookup_port(&self.inner, port).ok_or(DetachError::NoSuchDevice)?;
        detach_device(&self.inner, &device).await;
        Ok(())
    }

    /// Detach every attached device.
    pub async fn detach_all(&self) {
        let devices: Vec<_> = {
            let ports = self.inner.ports.lock().unwrap();
            ports.iter().flatten().cloned().collect()
        };
        for device in devices {
            detach_device(&self.inner, &device).await;
        }
    }

    /// Submit a URB to the device on `port`. The completion callback fires
    /// exactly once for every accepted submission.
    pub async fn submit(
        &self,
        port: u16,
        urb: Urb,
        complete: UrbComplete,
    ) -> Result<RequestHandle, SubmitError> {
        let device = lookup_port(&self.inner, port).ok_or(SubmitError::NoSuchDevice)?;
        device.submit(urb, complete).await
    }

    /// Reset the upstream port of the device. An EP0 stall from the server is
    /// not an error here.
    pub async fn reset_port(&self, port: u16) -> Result<(), SubmitError> {
        const SET_FEATURE: u8 = 0x03;
        const PORT_RESET: u16 = 4;

        let device = lookup_port(&self.inner, port).ok_or(SubmitError::NoSuchDevice)?;
        let setup = SetupPacket {
            request_type: 0x23, // class request, host to device, other recipient
            request: SET_FEATURE,
            value: PORT_RESET,
            index: 0,
            length: 0,
        };
        let urb = Urb::control(UrbFunction::ControlTransfer, setup, TransferBuffer::None);

        let (tx, rx) = tokio::sync::oneshot::channel();
        device
            .submit(urb, Box::new(move |urb| {
                let _ = tx.send(urb.status);
            }))
            .await?;
        let status = rx.await.map_err(|_| SubmitError::DeviceGone)?;

        match status {
            UsbdStatus::Success => Ok(()),
            UsbdStatus::Stalled => {
                warn!(port, "ignoring EP0 stall on port reset");
                Ok(())
            }
            status => Err(SubmitError::Transfer(status)),
        }
    }

    /// Everything currently attached.
    pub fn imported_devices(&self) -> Vec<ImportedDevice> {
        let ports = self.inner.ports.lock().unwrap();
        ports
            .iter()
            .flatten()
            .map(|device| ImportedDevice {
                port: device.port(),
                host: device.location.host.clone(),
                service: device.location.service.clone(),
                busid: device.location.busid.clone(),
                devid: device.devid,
                speed: device.speed,
                vendor: device.info.id_vendor,
                product: device.info.id_product,
            })
            .collect()
    }

    /// Occupancy bitmap: bit `p - 1` set means port `p` is in use.
    pub fn ports_status(&self) -> u64 {
        let ports = self.inner.ports.lock().unwrap();
        ports
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .fold(0u64, |acc, (i, _)| acc | 1 << i)
    }

    /// A cached string descriptor of the device on `port`, raw bytes.
    pub fn string_descriptor(&self, port: u16, index: u8) -> Option<Vec<u8>> {
        let device = lookup_port(&self.inner, port)?;
        device.string_descriptor(index).map(|s| s.to_vec())
    }

    /// The Microsoft OS vendor code, if the host ever read the OS string
    /// descriptor at index 0xEE.
    pub fn ms_vendor_code(&self, port: u16) -> Option<u8> {
        lookup_port(&self.inner, port).and_then(|device| device.ms_vendor_code())
    }

    /// The configuration the host selected on the device, if any.
    pub fn active_configuration(&self, port: u16) -> Option<u8> {
        lookup_port(&self.inner, port).and_then(|device| device.active_configuration())
    }

    /// The alternate setting selected on `interface_number`, if any.
    pub fn alternate_setting(&self, port: u16, interface_number: u8) -> Option<u8> {
        lookup_port(&self.inner, port).and_then(|device| device.alternate_setting(interface_number))
    }

    /// The frame number reported by the device's latest isochronous reply.
    pub fn current_frame_number(&self, port: u16) -> Option<u32> {
        lookup_port(&self.inner, port).map(|device| {
            device
                .current_frame_number
                .load(std::sync::atomic::Ordering::Relaxed)
        })
    }
}

fn resolve_port(location: &Location) -> Result<u16, AttachError> {
    location.service.parse::<u16>().map_err(|_| {
        AttachError::Network(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("bad service {:?}", location.service),
        ))
    })
}

/// Run the OP_REQ_IMPORT handshake on a fresh connection.
async fn import_device(
    stream: &mut TcpStream,
    location: &Location,
) -> Result<proto::UsbDevice, AttachError> {
    let request = proto::encode_op_import_request(&location.busid).map_err(AttachError::Wire)?;
    stream.write_all(&request).await?;

    let mut common_buf = [0u8; OP_COMMON_LEN];
    stream.read_exact(&mut common_buf).await?;
    let common = OpCommon::decode(&common_buf);

    if common.version != USBIP_VERSION {
        return Err(AttachError::Version {
            got: common.version,
        });
    }
    if common.code != OP_REP_IMPORT {
        return Err(AttachError::UnexpectedCode {
            got: common.code,
            expected: OP_REP_IMPORT,
        });
    }
    let status = OpStatus::from_wire(common.status);
    if status != OpStatus::Ok {
        return Err(AttachError::Import(status));
    }

    let mut device_buf = [0u8; USB_DEVICE_LEN];
    stream.read_exact(&mut device_buf).await?;
    proto::UsbDevice::decode(&device_buf).map_err(AttachError::Wire)
}

async fn fetch_device_descriptor(device: &Arc<Device>) -> Result<(), AttachError> {
    let urb = Urb::get_descriptor(DESCRIPTOR_TYPE_DEVICE, 0, 0, 18);
    let (tx, rx) = tokio::sync::oneshot::channel();
    device
        .submit(urb, Box::new(move |urb| {
            let _ = tx.send(urb.status);
        }))
        .await
        .map_err(|_| AttachError::Descriptor(UsbdStatus::DeviceGone))?;

    let status = rx
        .await
        .map_err(|_| AttachError::Descriptor(UsbdStatus::Canceled))?;
    if !status.is_success() {
        return Err(AttachError::Descriptor(status));
    }
    if device.device_descriptor().is_none() {
        // Short read: the server answered with less than a full descriptor.
        return Err(AttachError::Descriptor(UsbdStatus::InvalidParameter));
    }
    Ok(())
}

/// Scan the sub-range matching the device's speed for a free slot; 1-based
/// port number on success.
pub(crate) fn claim_port(inner: &Arc<VhciInner>, device: &Arc<Device>) -> Option<u16> {
    let range = if device.speed.is_super_or_above() {
        USB2_PORTS..TOTAL_PORTS
    } else {
        0..USB2_PORTS
    };

    let mut ports = inner.ports.lock().unwrap();
    for i in range {
        if ports[i].is_none() {
            ports[i] = Some(device.clone());
            let port = (i + 1) as u16;
            device.set_port(port);
            return Some(port);
        }
    }
    None
}

pub(crate) fn lookup_port(inner: &Arc<VhciInner>, port: u16) -> Option<Arc<Device>> {
    if port == 0 || port as usize > TOTAL_PORTS {
        return None;
    }
    inner.ports.lock().unwrap()[port as usize - 1].clone()
}

fn reclaim_port(inner: &Arc<VhciInner>, device: &Arc<Device>) -> u16 {
    let port = device.take_port();
    if port != 0 {
        let mut ports = inner.ports.lock().unwrap();
        let slot = &mut ports[port as usize - 1];
        if slot
            .as_ref()
            .is_some_and(|occupant| Arc::ptr_eq(occupant, device))
        {
            *slot = None;
        }
    }
    port
}

/// The detach sequence. Idempotent: the first caller to flip `unplugged` runs
/// the teardown, every other caller returns immediately.
pub(crate) async fn detach_device(inner: &Arc<VhciInner>, device: &Arc<Device>) {
    if device.unplugged.swap(true, std::sync::atomic::Ordering::AcqRel) {
        return;
    }

    info!(port = device.port(), location = %device.location, "detaching");

    // Cancel everything still in flight; the URBs complete canceled.
    for request in device.pending.drain() {
        request.mark(RequestStatus::Canceled);
        let entry = request.entry.lock().await.take();
        if let Some(mut entry) = entry {
            entry.urb.status = UsbdStatus::Canceled;
            entry.finish();
        }
    }

    device.close_socket().await;
    device.stop_receive_loop();

    let port = reclaim_port(inner, device);
    debug!(port, "port reclaimed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_bitmap_is_empty_initially() {
        let vhci = Vhci::new();
        assert_eq!(vhci.ports_status(), 0);
        assert!(vhci.imported_devices().is_empty());
    }

    #[test]
    fn lookup_rejects_port_zero_and_out_of_range() {
        let vhci = Vhci::new();
        assert!(lookup_port(&vhci.inner, 0).is_none());
        assert!(lookup_port(&vhci.inner, (TOTAL_PORTS + 1) as u16).is_none());
    }

    #[test]
    fn attach_error_retryability() {
        assert!(AttachError::Network(std::io::Error::from(
            std::io::ErrorKind::ConnectionRefused
        ))
        .is_retryable());
        assert!(AttachError::PortsExhausted.is_retryable());
        assert!(!AttachError::Version { got: 0x0100 }.is_retryable());
        assert!(!AttachError::Import(OpStatus::NoDev).is_retryable());
        assert!(!AttachError::Import(OpStatus::DevBusy).is_retryable());
        assert!(AttachError::Import(OpStatus::Unrecognized(9)).is_retryable());
    }
}
