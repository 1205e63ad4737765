//! Startup replay of persistent device records.

mod util;

use std::sync::Arc;

use usbip_vhci::persistent::{MemoryStore, PersistentStore};
use usbip_vhci::Vhci;

use util::{sample_device, TestServer, DEVICE_DESCRIPTOR};

#[tokio::test(flavor = "multi_thread")]
async fn replay_drops_refused_lines_and_retries_transient_ones() {
    let vhci = Vhci::new();

    // Line 1: the server refuses with ST_NODEV (never retried).
    // Line 2: the attach-time descriptor fetch fails once (transient),
    //         then succeeds on the second round.
    let server1 = TestServer::bind().await;
    let server2 = TestServer::bind().await;

    let store = Arc::new(MemoryStore::new());
    let l1 = server1.location("1-1");
    let l2 = server2.location("2-2");
    let lines = vec![
        format!("{},{},{}", l1.host, l1.service, l1.busid),
        format!("{},{},{}", l2.host, l2.service, l2.busid),
        "garbage-without-commas".to_owned(),
    ];
    vhci.set_persistent(store.as_ref(), &lines).expect("store");
    assert_eq!(vhci.get_persistent(store.as_ref()).expect("read").len(), 3);

    let replay = vhci.spawn_persistent_replay(store);

    let serve1 = async {
        let mut conn = server1.accept().await;
        conn.refuse_import("1-1", 4).await; // ST_NODEV
    };

    let device2 = sample_device(2, 2, 3);
    let serve2 = async {
        // Round 1: accept the import but stall the descriptor fetch, which
        // fails the attach with a retryable error.
        let mut conn = server2.accept().await;
        conn.expect_import("2-2", &device2).await;
        let (base, _, _) = conn.read_submit().await;
        conn.reply_in(base.seqnum, -32, &[]).await; // -EPIPE

        // Round 2: play it straight.
        let mut conn = server2.accept().await;
        conn.expect_import("2-2", &device2).await;
        conn.serve_device_descriptor(&DEVICE_DESCRIPTOR).await;
        conn
    };

    let (_, _conn) = tokio::join!(serve1, serve2);
    replay.await.expect("replay finishes");

    let imported = vhci.imported_devices();
    assert_eq!(imported.len(), 1);
    assert_eq!(imported[0].busid, "2-2");
}

#[tokio::test(flavor = "multi_thread")]
async fn replay_with_no_records_is_a_no_op() {
    let vhci = Vhci::new();
    let store = Arc::new(MemoryStore::new());
    vhci.spawn_persistent_replay(store)
        .await
        .expect("replay finishes");
    assert!(vhci.imported_devices().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn replay_survives_a_store_error() {
    struct BrokenStore;
    impl PersistentStore for BrokenStore {
        fn read(&self) -> std::io::Result<Vec<String>> {
            Err(std::io::Error::from(std::io::ErrorKind::PermissionDenied))
        }
        fn write(&self, _lines: &[String]) -> std::io::Result<()> {
            Err(std::io::Error::from(std::io::ErrorKind::PermissionDenied))
        }
    }

    let vhci = Vhci::new();
    vhci.spawn_persistent_replay(Arc::new(BrokenStore))
        .await
        .expect("replay finishes");
    assert!(vhci.imported_devices().is_empty());
}
