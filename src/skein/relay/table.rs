use std::{
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::skein::relay::frame::{ProtocolError, StreamProtocol};

#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub host: String,
    pub port: u16,
    pub protocol: StreamProtocol,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StreamSnapshot {
    pub id: u32,
    pub host: String,
    pub port: u16,
    pub protocol: String,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// Registry entry for one live stream. The destination socket itself is owned
/// by the stream's pump task; the table only holds the handles needed to feed
/// it and tear it down.
pub struct StreamEntry {
    /// Client→destination payload queue. `None` once the stream is CLOSING:
    /// dropping the sender lets the pump drain what is already buffered and
    /// then exit on its own.
    data_tx: Option<mpsc::Sender<Bytes>>,
    /// Remaining DATA-frame credit the client holds for this stream.
    pub credit: Arc<AtomicU32>,
    pub bytes_in: Arc<AtomicU64>,
    pub bytes_out: Arc<AtomicU64>,
    pump: JoinHandle<()>,
    pub info: StreamInfo,
}

impl StreamEntry {
    pub fn new(
        data_tx: mpsc::Sender<Bytes>,
        credit: Arc<AtomicU32>,
        bytes_in: Arc<AtomicU64>,
        bytes_out: Arc<AtomicU64>,
        pump: JoinHandle<()>,
        info: StreamInfo,
    ) -> Self {
        Self {
            data_tx: Some(data_tx),
            credit,
            bytes_in,
            bytes_out,
            pump,
            info,
        }
    }
}

/// Per-session map of stream id → live stream.
///
/// The session's control task is the only writer for create/close; pump tasks
/// call `remove` for themselves on exit. The map serializes that overlap.
pub struct StreamTable {
    streams: dashmap::DashMap<u32, StreamEntry>,
    max_streams: usize,
}

impl StreamTable {
    pub fn new(max_streams: usize) -> Self {
        Self {
            streams: dashmap::DashMap::new(),
            max_streams,
        }
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.streams.contains_key(&id)
    }

    pub fn at_capacity(&self) -> bool {
        self.streams.len() >= self.max_streams
    }

    pub fn create(&self, id: u32, entry: StreamEntry) -> Result<(), ProtocolError> {
        match self.streams.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(ProtocolError::DuplicateStream(id)),
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(entry);
                Ok(())
            }
        }
    }

    /// Looks up the payload queue and credit counter for an inbound DATA
    /// frame. Fails if the stream is unknown or already CLOSING.
    pub fn for_data(
        &self,
        id: u32,
    ) -> Result<(mpsc::Sender<Bytes>, Arc<AtomicU32>), ProtocolError> {
        let entry = self
            .streams
            .get(&id)
            .ok_or(ProtocolError::UnknownStream(id))?;
        let tx = entry
            .data_tx
            .clone()
            .ok_or(ProtocolError::StreamClosing(id))?;
        Ok((tx, entry.credit.clone()))
    }

    /// Transitions a stream to CLOSING. Idempotent: closing an unknown or
    /// already-closing stream is a no-op and returns false.
    pub fn begin_close(&self, id: u32) -> bool {
        match self.streams.get_mut(&id) {
            Some(mut entry) => entry.data_tx.take().is_some(),
            None => false,
        }
    }

    /// Removes a stream. Idempotent. This is the single teardown point: the
    /// returned entry is the last owner of the pump handle, and dropping the
    /// queue sender lets the pump (and with it the destination socket) die.
    pub fn remove(&self, id: u32) -> Option<StreamEntry> {
        self.streams.remove(&id).map(|(_, entry)| entry)
    }

    pub fn snapshot(&self) -> Vec<StreamSnapshot> {
        let mut out = Vec::with_capacity(self.streams.len());
        for entry in self.streams.iter() {
            out.push(StreamSnapshot {
                id: *entry.key(),
                host: entry.info.host.clone(),
                port: entry.info.port,
                protocol: entry.info.protocol.to_string(),
                bytes_in: entry.bytes_in.load(Ordering::Relaxed),
                bytes_out: entry.bytes_out.load(Ordering::Relaxed),
            });
        }
        out.sort_by_key(|s| s.id);
        out
    }

    pub fn total_bytes(&self) -> (u64, u64) {
        let mut bytes_in = 0;
        let mut bytes_out = 0;
        for entry in self.streams.iter() {
            bytes_in += entry.bytes_in.load(Ordering::Relaxed);
            bytes_out += entry.bytes_out.load(Ordering::Relaxed);
        }
        (bytes_in, bytes_out)
    }

    /// Force-closes every remaining stream: drop the payload queues so pumps
    /// can drain, then give them a grace period before aborting outright.
    pub async fn shutdown(&self, grace: Duration) {
        let ids: Vec<u32> = self.streams.iter().map(|e| *e.key()).collect();
        let mut pumps = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(mut entry) = self.remove(id) {
                entry.data_tx.take();
                pumps.push(entry.pump);
            }
        }

        let drain = async {
            for pump in &mut pumps {
                let _ = pump.await;
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            for pump in &pumps {
                pump.abort();
            }
        }
    }
}

impl std::fmt::Debug for StreamTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTable")
            .field("len", &self.streams.len())
            .field("max_streams", &self.max_streams)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> (StreamEntry, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(4);
        let e = StreamEntry::new(
            tx,
            Arc::new(AtomicU32::new(4)),
            Arc::new(AtomicU64::new(0)),
            Arc::new(AtomicU64::new(0)),
            tokio::spawn(async {}),
            StreamInfo {
                host: "example.com".into(),
                port: 80,
                protocol: StreamProtocol::Tcp,
            },
        );
        (e, rx)
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let table = StreamTable::new(8);
        let (a, _rx_a) = entry();
        let (b, _rx_b) = entry();
        table.create(1, a).unwrap();
        assert!(matches!(
            table.create(1, b),
            Err(ProtocolError::DuplicateStream(1))
        ));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let table = StreamTable::new(8);
        let (e, _rx) = entry();
        table.create(1, e).unwrap();
        assert!(table.remove(1).is_some());
        assert!(table.remove(1).is_none());
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn begin_close_is_idempotent_and_drops_queue() {
        let table = StreamTable::new(8);
        let (e, mut rx) = entry();
        table.create(1, e).unwrap();

        assert!(table.begin_close(1));
        assert!(!table.begin_close(1));
        assert!(!table.begin_close(99));

        // Sender gone: the pump sees end-of-queue.
        assert!(rx.recv().await.is_none());

        // Still present until the pump removes it.
        assert!(table.contains(1));
        assert!(matches!(
            table.for_data(1),
            Err(ProtocolError::StreamClosing(1))
        ));
    }

    #[tokio::test]
    async fn capacity_is_observed() {
        let table = StreamTable::new(1);
        assert!(!table.at_capacity());
        let (e, _rx) = entry();
        table.create(1, e).unwrap();
        assert!(table.at_capacity());
    }
}
