//! The remote memory engine: catalog enumeration on the info channel, chunked
//!  reads and writes on their own channels, and per-memory-id admission
//!  control so transfers never interleave on the same memory.

mod catalog;
mod queue;
mod read;
mod write;

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::warn;

use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::memory::queue::{MemoryQueueManager, QueuedWrite};
use crate::memory::read::ReadTransfer;
use crate::memory::write::WriteTransfer;
use crate::request_tracker::RequestTracker;

pub use catalog::{MemoryCatalog, MemoryKind, RemoteMemory};
pub use read::MAX_READ_CHUNK;
pub use write::{ProgressFn, MAX_WRITE_CHUNK};

/// A chunked read failed. The chunks committed before the failure are kept in
///  `partial`, so callers can resume from `address + partial.len()`.
#[derive(Debug, thiserror::Error)]
#[error("read of memory {memory_id} at {address:#x} failed after {} bytes", partial.len())]
pub struct ReadError {
    pub memory_id: u8,
    pub address: u32,
    pub partial: Bytes,
    #[source]
    pub cause: LinkError,
}

/// A chunked write failed, or was dropped from its queue before it started.
#[derive(Debug, thiserror::Error)]
#[error("write to memory {memory_id} at {address:#x} failed")]
pub struct WriteError {
    pub memory_id: u8,
    pub address: u32,
    #[source]
    pub cause: LinkError,
}

/// Entry point to everything memory-related on an established connection.
pub struct Memory {
    config: Arc<LinkConfig>,
    tracker: Arc<RequestTracker>,
    catalog: MemoryCatalog,
    queues: Arc<MemoryQueueManager>,
}

impl Memory {
    pub(crate) fn new(config: Arc<LinkConfig>, tracker: Arc<RequestTracker>) -> Memory {
        Memory {
            config,
            catalog: MemoryCatalog::new(tracker.clone()),
            tracker,
            queues: Arc::new(MemoryQueueManager::new()),
        }
    }

    /// Re-enumerates the device's memories, replacing the cached catalog.
    pub async fn refresh(&self) -> Result<Vec<RemoteMemory>, LinkError> {
        self.catalog.refresh().await
    }

    /// The catalog from the most recent successful [Memory::refresh].
    pub async fn memories(&self) -> Vec<RemoteMemory> {
        self.catalog.memories().await
    }

    pub async fn get(&self, id: u8) -> Option<RemoteMemory> {
        self.catalog.get(id).await
    }

    pub async fn by_kind(&self, kind: MemoryKind) -> Vec<RemoteMemory> {
        self.catalog.by_kind(kind).await
    }

    /// Reads `length` bytes starting at `address` from one remote memory.
    ///
    /// At most one read per memory id may be in flight; a second one fails
    ///  with [LinkError::Busy] without sending anything.
    pub async fn read(&self, memory_id: u8, address: u32, length: usize) -> Result<Bytes, ReadError> {
        let permit = self.queues.begin_read(memory_id)
            .map_err(|cause| ReadError { memory_id, address, partial: Bytes::new(), cause })?;

        let result = ReadTransfer::new(memory_id, address, length)
            .run(&self.tracker, &self.config)
            .await;
        drop(permit);
        result
    }

    /// Writes `data` to one remote memory starting at `address`. Writes to
    ///  the same memory id are queued and executed strictly in order.
    ///
    /// With `flush`, all writes for this memory id that are queued but not
    ///  yet started are dropped first; they resolve with
    ///  [LinkError::Superseded]. The write that is already on the wire (if
    ///  any) runs to completion either way.
    ///
    /// `progress` (if given) is called with the committed percentage; it is
    ///  never called after the returned future resolves.
    pub async fn write(
        &self,
        memory_id: u8,
        address: u32,
        data: Bytes,
        progress: Option<ProgressFn>,
        flush: bool,
    ) -> Result<(), WriteError> {
        let (done, done_rx) = oneshot::channel();
        let transfer = WriteTransfer::new(memory_id, address, data, progress);

        if self.queues.enqueue_write(QueuedWrite { transfer, done }, flush) {
            self.spawn_write_worker(memory_id);
        }

        match done_rx.await {
            Ok(result) => result,
            // the worker never drops a job without resolving it, so this only
            //  happens if the runtime tears the task down mid-flight
            Err(_) => Err(WriteError { memory_id, address, cause: LinkError::LinkDown }),
        }
    }

    /// Drains one memory id's write queue, one job at a time. Exits when the
    ///  queue runs dry or the link is gone.
    fn spawn_write_worker(&self, memory_id: u8) {
        let config = self.config.clone();
        let tracker = self.tracker.clone();
        let queues = self.queues.clone();

        tokio::spawn(async move {
            while let Some(job) = queues.next_write(memory_id) {
                let result = job.transfer.run(&tracker, &config).await;
                let link_down = matches!(result, Err(WriteError { cause: LinkError::LinkDown, .. }));
                job.done.send(result).ok();

                if link_down {
                    warn!("write worker for memory id {} stopping, link is down", memory_id);
                    queues.fail_queued_writes(memory_id);
                    return;
                }
            }
        });
    }

    /// Invoked by the connection's teardown path: every queued transfer
    ///  resolves with [LinkError::LinkDown] and nothing new is admitted.
    pub(crate) fn on_link_down(&self) {
        self.queues.tear_down();
    }
}
