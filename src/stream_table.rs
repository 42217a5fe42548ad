// ABOUTME: id -> stream map plus the bounded accept backlog for newly opened peer streams
// ABOUTME: Synchronous mutex around short critical sections, per the teacher's locking style

use crate::stream::StreamShared;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Capacity of the accept backlog: newly arrived `SYN` streams queued for `accept_stream`.
pub const ACCEPT_BACKLOG_CAPACITY: usize = 1024;

/// Maps stream ids to their shared state and feeds the accept backlog on inbound `SYN`.
pub struct StreamTable {
    streams: Mutex<HashMap<u32, Arc<StreamShared>>>,
    accept_tx: mpsc::Sender<Arc<StreamShared>>,
    // `tokio::sync::Mutex` rather than `std::sync::Mutex`: `accept` holds this guard across
    // the `.await` on `recv()`, which would make the future `!Send` with a std guard.
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Arc<StreamShared>>>,
}

impl StreamTable {
    pub fn new() -> Self {
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG_CAPACITY);
        StreamTable {
            streams: Mutex::new(HashMap::new()),
            accept_tx,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
        }
    }

    pub fn lookup(&self, id: u32) -> Option<Arc<StreamShared>> {
        self.streams.lock().unwrap().get(&id).cloned()
    }

    /// Inserts a locally opened stream. The caller is responsible for not reusing ids.
    pub fn insert_local(&self, shared: Arc<StreamShared>) {
        self.streams.lock().unwrap().insert(shared.id, shared);
    }

    /// Inserts a stream from an inbound `SYN` and pushes it into the accept backlog.
    /// A duplicate `SYN` for an id already present is ignored, matching the wire contract.
    /// Returns `true` if the stream was admitted. Blocks on a full backlog until the
    /// accepter drains it; the caller is expected to race this against session termination.
    pub async fn insert_remote_if_absent(&self, shared: Arc<StreamShared>) -> bool {
        {
            let mut streams = self.streams.lock().unwrap();
            if streams.contains_key(&shared.id) {
                return false;
            }
            streams.insert(shared.id, shared.clone());
        }
        let _ = self.accept_tx.send(shared).await;
        true
    }

    pub fn remove(&self, id: u32) -> Option<Arc<StreamShared>> {
        self.streams.lock().unwrap().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.streams.lock().unwrap().len()
    }

    pub fn mark_all_session_closed(&self) {
        let streams = self.streams.lock().unwrap();
        for stream in streams.values() {
            stream.mark_session_closed();
        }
    }

    pub async fn accept(&self) -> Option<Arc<StreamShared>> {
        let mut rx = self.accept_rx.lock().await;
        rx.recv().await
    }
}

impl Default for StreamTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_syn_for_existing_id_is_ignored() {
        let table = StreamTable::new();
        let a = StreamShared::new(1, 0);
        let b = StreamShared::new(1, 0);
        assert!(table.insert_remote_if_absent(a).await);
        assert!(!table.insert_remote_if_absent(b).await);
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn accepted_stream_matches_inserted_stream() {
        let table = StreamTable::new();
        let shared = StreamShared::new(9, 0);
        table.insert_remote_if_absent(shared.clone()).await;
        let accepted = table.accept().await.unwrap();
        assert_eq!(accepted.id, 9);
    }

    #[test]
    fn remove_drops_from_table() {
        let table = StreamTable::new();
        table.insert_local(StreamShared::new(2, 0));
        assert_eq!(table.len(), 1);
        assert!(table.remove(2).is_some());
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn admission_blocks_on_a_full_backlog_until_it_drains() {
        let table = Arc::new(StreamTable::new());
        for id in 0..ACCEPT_BACKLOG_CAPACITY as u32 {
            assert!(table.insert_remote_if_absent(StreamShared::new(id, 0)).await);
        }

        let blocked_table = table.clone();
        let next_id = ACCEPT_BACKLOG_CAPACITY as u32;
        let admit = tokio::spawn(async move {
            blocked_table
                .insert_remote_if_absent(StreamShared::new(next_id, 0))
                .await
        });

        tokio::task::yield_now().await;
        assert!(!admit.is_finished(), "admission should block on a full backlog");

        table.accept().await.unwrap();
        assert!(admit.await.unwrap());
    }
}
