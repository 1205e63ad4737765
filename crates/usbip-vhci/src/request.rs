//! In-flight request bookkeeping: sequence numbers, the pending table and the
//! dual-completion status machine.
//!
//! A request is shared between the send path, the receive path and the cancel
//! path. The first transition out of [`RequestStatus::Zero`] is recorded with
//! a compare-and-swap; whoever takes the URB entry out of its slot completes
//! the URB, which is what makes completion happen exactly once no matter how
//! the three paths interleave.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use usbip_proto::Direction;

use crate::urb::Urb;

/// Completion callback handed in with a URB submission.
pub type UrbComplete = Box<dyn FnOnce(Urb) + Send>;

/// Allocate the next direction-tagged sequence number. The low bit encodes
/// the direction (IN = 1); zero is reserved and skipped on wraparound.
pub(crate) fn next_seqnum(counter: &AtomicU32, direction: Direction) -> u32 {
    loop {
        let n = counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1) << 1;
        if n != 0 {
            return n | direction.to_wire();
        }
    }
}

/// Lifecycle of an in-flight request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum RequestStatus {
    Zero = 0,
    SendComplete = 1,
    RecvComplete = 2,
    Canceled = 3,
    /// A reply arrived for a sequence number with no pending request; used
    /// for logging only, the reply is drained and dropped.
    #[allow(dead_code)]
    NoHandle = 4,
}

impl RequestStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => RequestStatus::SendComplete,
            2 => RequestStatus::RecvComplete,
            3 => RequestStatus::Canceled,
            4 => RequestStatus::NoHandle,
            _ => RequestStatus::Zero,
        }
    }
}

/// The URB and its completion callback, parked until one path takes them.
pub(crate) struct UrbEntry {
    pub urb: Urb,
    pub complete: UrbComplete,
    /// The send pipeline materialized the transfer buffer; it is dropped with
    /// the entry.
    #[allow(dead_code)]
    pub owned_buffer: bool,
}

impl UrbEntry {
    pub fn finish(self) {
        (self.complete)(self.urb);
    }
}

/// One outstanding URB submission.
pub(crate) struct Request {
    pub seqnum: u32,
    #[allow(dead_code)]
    pub endpoint: u8,
    status: AtomicU8,
    /// Taken by exactly one of the completing paths.
    pub entry: tokio::sync::Mutex<Option<UrbEntry>>,
}

impl Request {
    pub fn new(seqnum: u32, endpoint: u8, entry: UrbEntry) -> Arc<Self> {
        Arc::new(Self {
            seqnum,
            endpoint,
            status: AtomicU8::new(RequestStatus::Zero as u8),
            entry: tokio::sync::Mutex::new(Some(entry)),
        })
    }

    /// Try to record the first transition out of `Zero`. Returns the previous
    /// status: `Zero` means this caller won.
    pub fn mark(&self, status: RequestStatus) -> RequestStatus {
        let prev = self
            .status
            .compare_exchange(
                RequestStatus::Zero as u8,
                status as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .unwrap_or_else(|v| v);
        RequestStatus::from_u8(prev)
    }

    #[cfg(test)]
    pub fn status(&self) -> RequestStatus {
        RequestStatus::from_u8(self.status.load(Ordering::Acquire))
    }
}

/// Per-device map of sequence number to outstanding request. The lock is
/// never held across I/O.
#[derive(Default)]
pub(crate) struct PendingTable {
    map: Mutex<HashMap<u32, Arc<Request>>>,
}

impl PendingTable {
    pub fn insert(&self, request: Arc<Request>) {
        self.map.lock().unwrap().insert(request.seqnum, request);
    }

    pub fn get(&self, seqnum: u32) -> Option<Arc<Request>> {
        self.map.lock().unwrap().get(&seqnum).cloned()
    }

    pub fn remove(&self, seqnum: u32) -> Option<Arc<Request>> {
        self.map.lock().unwrap().remove(&seqnum)
    }

    /// Empty the table, for disconnect teardown.
    pub fn drain(&self) -> Vec<Arc<Request>> {
        self.map.lock().unwrap().drain().map(|(_, r)| r).collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }
}
