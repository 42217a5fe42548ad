// ABOUTME: Session-wide admission control over aggregate unread bytes
// ABOUTME: One signed counter plus a coalesced, edge-triggered credit notification

use std::sync::atomic::{AtomicI32, Ordering};
use tokio::sync::Notify;

/// Bounds the total number of unread bytes buffered across every stream on a session.
///
/// Invariant: `bucket + sum_over_streams(buffered_bytes) == max_receive_buffer`, modulo the
/// transient window during a single `PSH` ingest. Debited by the receiver on ingest, credited
/// by a stream's consumer on read and by stream teardown crediting back unread bytes.
#[derive(Debug)]
pub struct TokenBucket {
    value: AtomicI32,
    credit: Notify,
}

impl TokenBucket {
    pub fn new(max_receive_buffer: u32) -> Self {
        TokenBucket {
            value: AtomicI32::new(max_receive_buffer as i32),
            credit: Notify::new(),
        }
    }

    /// Current value. May be negative transiently (a large `PSH` debited past zero before
    /// the next ingest's admission check).
    pub fn value(&self) -> i32 {
        self.value.load(Ordering::Acquire)
    }

    pub fn is_positive(&self) -> bool {
        self.value() > 0
    }

    /// Debit by `n` bytes on `PSH` ingest.
    pub fn debit(&self, n: u32) {
        self.value.fetch_sub(n as i32, Ordering::AcqRel);
    }

    /// Credit `n` bytes back (consumer read, or stream teardown returning unread bytes).
    /// Notifies a parked receiver only when the bucket becomes usable again.
    pub fn credit(&self, n: u32) {
        if n == 0 {
            return;
        }
        let prev = self.value.fetch_add(n as i32, Ordering::AcqRel);
        if prev + (n as i32) > 0 {
            self.credit.notify_one();
        }
    }

    /// Park until either a credit notification arrives or the session dies (the caller
    /// selects this future against the terminal latch).
    pub async fn wait_for_credit(&self) {
        self.credit.notified().await;
    }

    /// Wake a parked receiver without changing the balance, used by the keepalive task to
    /// nudge past a credit race (see the ping-tick notification in the design notes).
    pub fn nudge(&self) {
        self.credit.notify_one();
    }
}
