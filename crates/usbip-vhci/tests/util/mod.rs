//! Scripted USB/IP server for integration tests.
//!
//! Binds a real listener and plays the server side of the protocol move by
//! move, so every test states exactly which PDUs cross the wire and in which
//! order.

#![allow(dead_code)]

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use usbip_proto as proto;
use usbip_vhci::urb::Urb;
use usbip_vhci::{Location, UrbComplete, Vhci};

/// An ordinary full-size device descriptor (a 0x046d:0xc077 mouse).
pub const DEVICE_DESCRIPTOR: [u8; 18] = [
    18, 1, 0x00, 0x02, 0, 0, 0, 64, 0x6d, 0x04, 0x77, 0xc0, 0x00, 0x72, 1, 2, 0, 1,
];

pub fn sample_device(busnum: u32, devnum: u32, speed: u32) -> proto::UsbDevice {
    proto::UsbDevice {
        path: format!("/sys/devices/pci0000:00/0000:00:14.0/usb{busnum}/{busnum}-1"),
        busid: format!("{busnum}-1"),
        busnum,
        devnum,
        speed,
        id_vendor: 0x046d,
        id_product: 0xc077,
        bcd_device: 0x7200,
        device_class: 0,
        device_subclass: 0,
        device_protocol: 0,
        configuration_value: 1,
        num_configurations: 1,
        num_interfaces: 1,
    }
}

pub struct TestServer {
    listener: TcpListener,
    addr: SocketAddr,
}

impl TestServer {
    pub async fn bind() -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        Self { listener, addr }
    }

    pub fn location(&self, busid: &str) -> Location {
        Location {
            host: self.addr.ip().to_string(),
            service: self.addr.port().to_string(),
            busid: busid.to_owned(),
        }
    }

    pub async fn accept(&self) -> ServerConn {
        let (stream, _) = self.listener.accept().await.expect("accept");
        ServerConn { stream }
    }
}

pub struct ServerConn {
    stream: TcpStream,
}

impl ServerConn {
    /// Raw access for tests that script malformed traffic.
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Read an OP_REQ_IMPORT and accept it with `device`.
    pub async fn expect_import(&mut self, busid: &str, device: &proto::UsbDevice) {
        let common = self.read_import_request(busid).await;
        assert_eq!(common.version, proto::USBIP_VERSION);

        let reply = proto::OpCommon {
            version: proto::USBIP_VERSION,
            code: proto::OP_REP_IMPORT,
            status: 0,
        };
        self.stream.write_all(&reply.encode()).await.expect("write");
        self.stream
            .write_all(&device.encode())
            .await
            .expect("write device");
    }

    /// Read an OP_REQ_IMPORT and refuse it with `status`.
    pub async fn refuse_import(&mut self, busid: &str, status: u32) {
        self.read_import_request(busid).await;
        let reply = proto::OpCommon {
            version: proto::USBIP_VERSION,
            code: proto::OP_REP_IMPORT,
            status,
        };
        self.stream.write_all(&reply.encode()).await.expect("write");
    }

    async fn read_import_request(&mut self, busid: &str) -> proto::OpCommon {
        let mut buf = [0u8; proto::OP_IMPORT_REQUEST_LEN];
        self.stream.read_exact(&mut buf).await.expect("read import");
        let mut common_buf = [0u8; proto::OP_COMMON_LEN];
        common_buf.copy_from_slice(&buf[..proto::OP_COMMON_LEN]);
        let common = proto::OpCommon::decode(&common_buf);
        assert_eq!(common.code, proto::OP_REQ_IMPORT);

        let sent_busid = &buf[proto::OP_COMMON_LEN..];
        let end = sent_busid.iter().position(|&b| b == 0).unwrap_or(0);
        assert_eq!(&sent_busid[..end], busid.as_bytes());
        common
    }

    /// Read one CMD PDU and its payload.
    pub async fn read_cmd(&mut self) -> (proto::UsbipHeader, Vec<u8>) {
        let mut buf = [0u8; proto::USBIP_HEADER_LEN];
        self.stream.read_exact(&mut buf).await.expect("read header");
        let header = proto::UsbipHeader::decode(&buf).expect("decode header");

        let payload_len = match &header.cmd {
            proto::HeaderCmd::Submit(cmd) => proto::cmd_submit_payload_len(
                header.base.direction,
                cmd.transfer_buffer_length,
                cmd.number_of_packets,
            ),
            _ => 0,
        };
        let mut payload = vec![0u8; payload_len];
        self.stream
            .read_exact(&mut payload)
            .await
            .expect("read payload");
        (header, payload)
    }

    /// Read one CMD_SUBMIT, panicking on anything else.
    pub async fn read_submit(&mut self) -> (proto::HeaderBasic, proto::CmdSubmit, Vec<u8>) {
        let (header, payload) = self.read_cmd().await;
        match header.cmd {
            proto::HeaderCmd::Submit(cmd) => (header.base, cmd, payload),
            other => panic!("expected CMD_SUBMIT, got {other:?}"),
        }
    }

    /// RET_SUBMIT carrying IN data. The direction field is left zero, as a
    /// real server does; the client recovers it from the seqnum.
    pub async fn reply_in(&mut self, seqnum: u32, status: i32, data: &[u8]) {
        self.reply_submit(seqnum, status, data.len() as i32, 0, 0, 0, data, &[])
            .await;
    }

    /// RET_SUBMIT for an OUT transfer: header only.
    pub async fn reply_out(&mut self, seqnum: u32, status: i32, actual_length: i32) {
        self.reply_submit(seqnum, status, actual_length, 0, 0, 0, &[], &[])
            .await;
    }

    /// Isochronous IN RET_SUBMIT: compacted payload plus descriptor table.
    pub async fn reply_iso(
        &mut self,
        seqnum: u32,
        start_frame: i32,
        error_count: i32,
        payload: &[u8],
        descriptors: &[proto::IsoPacketDescriptor],
    ) {
        self.reply_submit(
            seqnum,
            0,
            payload.len() as i32,
            start_frame,
            descriptors.len() as i32,
            error_count,
            payload,
            descriptors,
        )
        .await;
    }

    /// Isochronous OUT RET_SUBMIT: no payload, `actual_length` reports the
    /// transmitted total, the descriptor table follows the header.
    pub async fn reply_iso_out(
        &mut self,
        seqnum: u32,
        start_frame: i32,
        error_count: i32,
        actual_length: i32,
        descriptors: &[proto::IsoPacketDescriptor],
    ) {
        self.reply_submit(
            seqnum,
            0,
            actual_length,
            start_frame,
            descriptors.len() as i32,
            error_count,
            &[],
            descriptors,
        )
        .await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn reply_submit(
        &mut self,
        seqnum: u32,
        status: i32,
        actual_length: i32,
        start_frame: i32,
        number_of_packets: i32,
        error_count: i32,
        data: &[u8],
        descriptors: &[proto::IsoPacketDescriptor],
    ) {
        let header = proto::UsbipHeader {
            base: proto::HeaderBasic {
                seqnum,
                devid: 0,
                direction: proto::Direction::Out,
                ep: 0,
            },
            cmd: proto::HeaderCmd::RetSubmit(proto::RetSubmit {
                status,
                actual_length,
                start_frame,
                number_of_packets,
                error_count,
            }),
        };
        self.stream
            .write_all(&header.encode())
            .await
            .expect("write ret header");
        self.stream.write_all(data).await.expect("write ret data");
        if !descriptors.is_empty() {
            self.stream
                .write_all(&proto::encode_iso_descriptors(descriptors))
                .await
                .expect("write iso descriptors");
        }
    }

    pub async fn reply_unlink(&mut self, seqnum: u32, status: i32) {
        let header = proto::UsbipHeader {
            base: proto::HeaderBasic {
                seqnum,
                devid: 0,
                direction: proto::Direction::Out,
                ep: 0,
            },
            cmd: proto::HeaderCmd::RetUnlink(proto::RetUnlink { status }),
        };
        self.stream
            .write_all(&header.encode())
            .await
            .expect("write ret unlink");
    }

    /// Serve one GET_DESCRIPTOR(DEVICE) from `descriptor`.
    pub async fn serve_device_descriptor(&mut self, descriptor: &[u8]) {
        let (base, cmd, _) = self.read_submit().await;
        assert_eq!(cmd.setup[0], 0x80);
        assert_eq!(cmd.setup[1], 0x06); // GET_DESCRIPTOR
        assert_eq!(cmd.setup[3], 1); // device descriptor
        let requested = cmd.transfer_buffer_length.max(0) as usize;
        let len = requested.min(descriptor.len());
        self.reply_in(base.seqnum, 0, &descriptor[..len]).await;
    }
}

/// Attach through a scripted import handshake plus the attach-time device
/// descriptor fetch.
pub async fn attach(
    vhci: &Vhci,
    server: &TestServer,
    busid: &str,
    device: &proto::UsbDevice,
) -> (u16, ServerConn) {
    let location = server.location(busid);
    let serve = async {
        let mut conn = server.accept().await;
        conn.expect_import(busid, device).await;
        conn.serve_device_descriptor(&DEVICE_DESCRIPTOR).await;
        conn
    };
    let (port, conn) = tokio::join!(vhci.attach(location), serve);
    (port.expect("attach"), conn)
}

/// A completion callback paired with a receiver for the finished URB.
pub fn completion() -> (UrbComplete, tokio::sync::oneshot::Receiver<Urb>) {
    let (tx, rx) = tokio::sync::oneshot::channel();
    (
        Box::new(move |urb| {
            let _ = tx.send(urb);
        }),
        rx,
    )
}

/// Log to stderr when RUST_LOG asks for it; idempotent across tests.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll until `imported_devices` no longer lists `port`.
pub async fn wait_detached(vhci: &Vhci, port: u16) {
    for _ in 0..200 {
        if !vhci.imported_devices().iter().any(|d| d.port == port) {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("port {port} still attached");
}
