//! Device-descriptor snapshot checks on GET_DESCRIPTOR(DEVICE) refetches.

mod util;

use usbip_vhci::urb::{Urb, DESCRIPTOR_TYPE_DEVICE};
use usbip_vhci::{UsbdStatus, Vhci};

use util::{attach, completion, sample_device, wait_detached, TestServer, DEVICE_DESCRIPTOR};

#[tokio::test(flavor = "multi_thread")]
async fn matching_refetch_succeeds() {
    let vhci = Vhci::new();
    let server = TestServer::bind().await;
    let (port, mut conn) = attach(&vhci, &server, "1-1", &sample_device(1, 2, 3)).await;

    let (complete, done) = completion();
    let urb = Urb::get_descriptor(DESCRIPTOR_TYPE_DEVICE, 0, 0, 18);
    vhci.submit(port, urb, complete).await.expect("submit");

    conn.serve_device_descriptor(&DEVICE_DESCRIPTOR).await;

    let urb = done.await.expect("completion");
    assert_eq!(urb.status, UsbdStatus::Success);
    assert_eq!(urb.actual_length, 18);
    assert_eq!(urb.buffer().data(), Some(&DEVICE_DESCRIPTOR[..]));

    // Still attached.
    assert_eq!(vhci.imported_devices().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn tampered_refetch_detaches_the_device() {
    let vhci = Vhci::new();
    let server = TestServer::bind().await;
    let (port, mut conn) = attach(&vhci, &server, "1-1", &sample_device(1, 2, 3)).await;

    let mut tampered = DEVICE_DESCRIPTOR;
    tampered[10] ^= 0x01; // different idProduct

    let (complete, done) = completion();
    let urb = Urb::get_descriptor(DESCRIPTOR_TYPE_DEVICE, 0, 0, 18);
    vhci.submit(port, urb, complete).await.expect("submit");
    conn.serve_device_descriptor(&tampered).await;

    // The URB itself completes with the server's answer; the device is
    // unplugged as a side effect.
    let urb = done.await.expect("completion");
    assert_eq!(urb.status, UsbdStatus::Success);

    wait_detached(&vhci, port).await;
    assert_eq!(vhci.ports_status(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn string_descriptors_land_in_the_cache() {
    let vhci = Vhci::new();
    let server = TestServer::bind().await;
    let (port, mut conn) = attach(&vhci, &server, "1-1", &sample_device(1, 2, 3)).await;

    // "AB" as a UTF-16LE string descriptor.
    let string_desc = [6u8, 3, b'A', 0, b'B', 0];
    let (complete, done) = completion();
    let urb = Urb::get_descriptor(3, 2, 0x0409, 255);
    vhci.submit(port, urb, complete).await.expect("submit");

    let (base, _, _) = conn.read_submit().await;
    conn.reply_in(base.seqnum, 0, &string_desc).await;

    let urb = done.await.expect("completion");
    assert_eq!(urb.status, UsbdStatus::Success);
    assert_eq!(urb.actual_length as usize, string_desc.len());
    assert_eq!(vhci.string_descriptor(port, 2).as_deref(), Some(&string_desc[..]));

    // The MS OS string descriptor at 0xEE records the vendor code instead.
    let mut os_desc = [0u8; 18];
    os_desc[0] = 18;
    os_desc[1] = 3;
    os_desc[2..16].copy_from_slice(b"M\0S\0F\0T\x001\x000\x000\0");
    os_desc[16] = 0x5c;

    let (complete, done) = completion();
    let urb = Urb::get_descriptor(3, 0xee, 0, 18);
    vhci.submit(port, urb, complete).await.expect("submit");
    let (base, _, _) = conn.read_submit().await;
    conn.reply_in(base.seqnum, 0, &os_desc).await;
    done.await.expect("completion");

    assert_eq!(vhci.ms_vendor_code(port), Some(0x5c));
    assert!(vhci.string_descriptor(port, 0xee).is_none());
}
