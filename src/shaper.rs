// ABOUTME: Priority-ordered, sequence-stable queue of pending write requests
// ABOUTME: Control frames strictly precede concurrently-queued data frames

use bytes::Bytes;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Mutex;
use tokio::sync::{oneshot, Notify};

/// Maximum number of write requests the shaper will hold at once.
pub const SHAPER_CAPACITY: usize = 1024;

/// The class a write request belongs to. `Ctrl` frames (`SYN`, `FIN`, `NOP`, `UPD`) strictly
/// precede concurrently-queued `Data` frames (`PSH`), matching the ordering guarantee in the
/// concurrency model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WriteClass {
    Ctrl,
    Data,
}

/// A single frame awaiting transmission, ordered by `(class, sequence)` so that control
/// frames sort before data frames and ties break in submission order.
pub struct WriteRequest {
    pub class: WriteClass,
    pub sequence: u64,
    pub header: crate::codec::FrameHeader,
    pub payload: Bytes,
    pub completion: oneshot::Sender<crate::error::Result<usize>>,
}

impl std::fmt::Debug for WriteRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteRequest")
            .field("class", &self.class)
            .field("sequence", &self.sequence)
            .field("header", &self.header)
            .finish()
    }
}

impl PartialEq for WriteRequest {
    fn eq(&self, other: &Self) -> bool {
        self.class == other.class && self.sequence == other.sequence
    }
}
impl Eq for WriteRequest {}

impl PartialOrd for WriteRequest {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WriteRequest {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.class, self.sequence).cmp(&(other.class, other.sequence))
    }
}

/// A bounded priority queue of write requests shared between submitters and the sender's
/// pull loop. Implemented as a plain `Mutex<BinaryHeap<_>>` plus a `not_empty`/`not_full`
/// `Notify` pair rather than a spawned task, since the shaper does no I/O of its own.
#[derive(Default)]
pub struct Shaper {
    heap: Mutex<BinaryHeap<Reverse<OrdWrapper>>>,
    not_empty: Notify,
    not_full: Notify,
}

/// `BinaryHeap` is a max-heap; we want the smallest `(class, sequence)` out first, so the
/// heap stores `Reverse<OrdWrapper>` and `OrdWrapper` carries the request by value for
/// `Ord`/`PartialOrd` while `WriteRequest` itself provides the comparison.
struct OrdWrapper(WriteRequest);

impl PartialEq for OrdWrapper {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq(&other.0)
    }
}
impl Eq for OrdWrapper {}
impl PartialOrd for OrdWrapper {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.0.partial_cmp(&other.0)
    }
}
impl Ord for OrdWrapper {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl Shaper {
    pub fn new() -> Self {
        Shaper {
            heap: Mutex::new(BinaryHeap::new()),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    /// Submit a request, blocking (against the session-die signal, by the caller's select)
    /// if the heap is already at capacity.
    pub async fn submit(&self, request: WriteRequest) {
        loop {
            {
                let mut heap = self.heap.lock().unwrap();
                if heap.len() < SHAPER_CAPACITY {
                    heap.push(Reverse(OrdWrapper(request)));
                    drop(heap);
                    self.not_empty.notify_one();
                    return;
                }
            }
            self.not_full.notified().await;
        }
    }

    /// Pull the next request in priority order, blocking (against the session-die signal, by
    /// the caller's select) if the heap is empty.
    pub async fn next(&self) -> WriteRequest {
        loop {
            {
                let mut heap = self.heap.lock().unwrap();
                if let Some(Reverse(OrdWrapper(req))) = heap.pop() {
                    drop(heap);
                    self.not_full.notify_one();
                    return req;
                }
            }
            self.not_empty.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.heap.lock().unwrap().len()
    }
}
