use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::error::LinkError;
use crate::memory::write::WriteTransfer;
use crate::memory::WriteError;

/// A write waiting for (or holding) its turn on the wire, together with the
///  channel that resolves its caller.
pub(crate) struct QueuedWrite {
    pub transfer: WriteTransfer,
    pub done: oneshot::Sender<Result<(), WriteError>>,
}

struct WriteQueue {
    /// True while a worker task is draining this queue. The job a worker is
    ///  executing has already been popped, so `queued` only ever holds
    ///  not-yet-started writes.
    active: bool,
    queued: VecDeque<QueuedWrite>,
}

/// Admission control for the memory engine: at most one active read per
///  memory id, a FIFO of writes per memory id, and the full-state teardown
///  sweep on disconnect. This is the single source of truth on whether a
///  transfer may start immediately, must queue, or must be rejected.
pub(crate) struct MemoryQueueManager {
    active_reads: Mutex<FxHashSet<u8>>,
    writes: Mutex<FxHashMap<u8, WriteQueue>>,
    down: AtomicBool,
}

/// Marks a memory id as having an active read; releases the slot when the
///  read resolves, whichever way it resolves.
pub(crate) struct ReadPermit {
    manager: Arc<MemoryQueueManager>,
    memory_id: u8,
}

impl Drop for ReadPermit {
    fn drop(&mut self) {
        self.manager.active_reads.lock().expect("active read set poisoned")
            .remove(&self.memory_id);
    }
}

impl MemoryQueueManager {
    pub fn new() -> MemoryQueueManager {
        MemoryQueueManager {
            active_reads: Mutex::new(FxHashSet::default()),
            writes: Mutex::new(FxHashMap::default()),
            down: AtomicBool::new(false),
        }
    }

    /// Claims the read slot for a memory id. Fails with [LinkError::Busy]
    ///  without touching any link state if a read is already in flight.
    pub fn begin_read(self: &Arc<Self>, memory_id: u8) -> Result<ReadPermit, LinkError> {
        if self.down.load(Ordering::Acquire) {
            return Err(LinkError::LinkDown);
        }

        let mut active = self.active_reads.lock().expect("active read set poisoned");
        if !active.insert(memory_id) {
            debug!("read rejected: memory id {} already has a read in flight", memory_id);
            return Err(LinkError::Busy { memory_id });
        }
        Ok(ReadPermit { manager: self.clone(), memory_id })
    }

    /// Appends a write to its memory id's FIFO. With `flush`, every
    ///  queued-but-not-yet-started write for that id is dropped first; the
    ///  currently active one (if any) is never disturbed.
    ///
    /// Returns true if the queue was idle and the caller must start a worker.
    pub fn enqueue_write(&self, write: QueuedWrite, flush: bool) -> bool {
        if self.down.load(Ordering::Acquire) {
            write.done.send(Err(WriteError {
                memory_id: write.transfer.memory_id(),
                address: write.transfer.base_address(),
                cause: LinkError::LinkDown,
            })).ok();
            return false;
        }

        let memory_id = write.transfer.memory_id();
        let mut writes = self.writes.lock().expect("write queue map poisoned");
        let queue = writes.entry(memory_id).or_insert_with(|| WriteQueue {
            active: false,
            queued: VecDeque::new(),
        });

        if flush {
            for superseded in queue.queued.drain(..) {
                trace!("flush enqueue drops queued write at {:#x} for memory id {}", superseded.transfer.base_address(), memory_id);
                superseded.done.send(Err(WriteError {
                    memory_id,
                    address: superseded.transfer.base_address(),
                    cause: LinkError::Superseded,
                })).ok();
            }
        }

        queue.queued.push_back(write);
        if queue.active {
            false
        }
        else {
            queue.active = true;
            true
        }
    }

    /// Hands the worker its next write, or releases the queue if it has run
    ///  dry.
    pub fn next_write(&self, memory_id: u8) -> Option<QueuedWrite> {
        let mut writes = self.writes.lock().expect("write queue map poisoned");
        let queue = writes.get_mut(&memory_id)?;

        match queue.queued.pop_front() {
            Some(write) => Some(write),
            None => {
                writes.remove(&memory_id);
                None
            }
        }
    }

    /// Called by a worker that hit a terminal link failure: everything still
    ///  queued behind it fails the same way.
    pub fn fail_queued_writes(&self, memory_id: u8) {
        let queue = self.writes.lock().expect("write queue map poisoned")
            .remove(&memory_id);

        if let Some(queue) = queue {
            for write in queue.queued {
                write.done.send(Err(WriteError {
                    memory_id,
                    address: write.transfer.base_address(),
                    cause: LinkError::LinkDown,
                })).ok();
            }
        }
    }

    /// Full-state teardown on disconnect: every queued write resolves via its
    ///  failure channel exactly once and the maps end up empty. Active reads
    ///  and writes resolve through their own in-flight request failing.
    pub fn tear_down(&self) {
        self.down.store(true, Ordering::Release);

        let drained: Vec<(u8, WriteQueue)> = self.writes.lock().expect("write queue map poisoned")
            .drain()
            .collect();

        let mut dropped = 0;
        for (memory_id, queue) in drained {
            for write in queue.queued {
                write.done.send(Err(WriteError {
                    memory_id,
                    address: write.transfer.base_address(),
                    cause: LinkError::LinkDown,
                })).ok();
                dropped += 1;
            }
        }
        if dropped > 0 {
            debug!("link teardown failed {} queued write(s)", dropped);
        }
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.active_reads.lock().unwrap().is_empty()
            && self.writes.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn queued_write(memory_id: u8, address: u32) -> (QueuedWrite, oneshot::Receiver<Result<(), WriteError>>) {
        let (done, done_rx) = oneshot::channel();
        let transfer = WriteTransfer::new(memory_id, address, Bytes::from_static(&[1, 2, 3]), None);
        (QueuedWrite { transfer, done }, done_rx)
    }

    #[test]
    fn test_second_read_on_same_id_is_busy() {
        let manager = Arc::new(MemoryQueueManager::new());

        let permit = manager.begin_read(4).unwrap();
        assert!(matches!(manager.begin_read(4), Err(LinkError::Busy { memory_id: 4 })));
        // a different memory id is unaffected
        manager.begin_read(5).unwrap();

        drop(permit);
        manager.begin_read(4).unwrap();
    }

    #[test]
    fn test_first_write_starts_worker_subsequent_ones_queue() {
        let manager = MemoryQueueManager::new();

        let (first, _rx1) = queued_write(1, 0);
        let (second, _rx2) = queued_write(1, 100);
        let (other_id, _rx3) = queued_write(2, 0);

        assert!(manager.enqueue_write(first, false));
        assert!(!manager.enqueue_write(second, false));
        assert!(manager.enqueue_write(other_id, false));
    }

    #[test]
    fn test_flush_drops_queued_but_not_active() {
        let manager = MemoryQueueManager::new();

        let (active, mut active_rx) = queued_write(1, 0);
        assert!(manager.enqueue_write(active, false));
        // the worker has taken the active write off the queue
        let active = manager.next_write(1).unwrap();

        let mut dropped_rxs = Vec::new();
        for i in 0..3 {
            let (write, rx) = queued_write(1, 100 + i);
            assert!(!manager.enqueue_write(write, false));
            dropped_rxs.push(rx);
        }

        let (flushing, mut flushing_rx) = queued_write(1, 999);
        assert!(!manager.enqueue_write(flushing, true));

        // the three queued writes failed as superseded
        for mut rx in dropped_rxs {
            let result = rx.try_recv().unwrap();
            assert!(matches!(result, Err(WriteError { cause: LinkError::Superseded, .. })));
        }
        // the active write and the flushing one are untouched
        assert!(active_rx.try_recv().is_err());
        assert!(flushing_rx.try_recv().is_err());

        // exactly the flushing write is left in the queue
        let next = manager.next_write(1).unwrap();
        assert_eq!(next.transfer.base_address(), 999);
        assert!(manager.next_write(1).is_none());

        drop(active);
    }

    #[test]
    fn test_flush_on_idle_queue_keeps_only_the_new_write() {
        let manager = MemoryQueueManager::new();

        let mut dropped_rxs = Vec::new();
        let (head, _head_rx) = queued_write(1, 0);
        assert!(manager.enqueue_write(head, false));
        // no worker running in this test, so the head is still queued
        for i in 0..2 {
            let (write, rx) = queued_write(1, 100 + i);
            manager.enqueue_write(write, false);
            dropped_rxs.push(rx);
        }

        let (flushing, _flushing_rx) = queued_write(1, 999);
        manager.enqueue_write(flushing, true);

        // the head counts as queued here and is dropped along with the rest
        let next = manager.next_write(1).unwrap();
        assert_eq!(next.transfer.base_address(), 999);
        assert!(manager.next_write(1).is_none());
    }

    #[test]
    fn test_tear_down_fails_everything_and_empties_maps() {
        let manager = Arc::new(MemoryQueueManager::new());

        let _permit = manager.begin_read(1);
        let (write_a, mut rx_a) = queued_write(2, 0);
        let (write_b, mut rx_b) = queued_write(3, 0);
        manager.enqueue_write(write_a, false);
        manager.enqueue_write(write_b, false);

        manager.tear_down();

        assert!(matches!(rx_a.try_recv().unwrap(), Err(WriteError { cause: LinkError::LinkDown, .. })));
        assert!(matches!(rx_b.try_recv().unwrap(), Err(WriteError { cause: LinkError::LinkDown, .. })));
        assert!(manager.writes.lock().unwrap().is_empty());

        // nothing new is admitted after teardown
        assert!(matches!(manager.begin_read(9), Err(LinkError::LinkDown)));
        let (late, mut late_rx) = queued_write(9, 0);
        assert!(!manager.enqueue_write(late, false));
        assert!(matches!(late_rx.try_recv().unwrap(), Err(WriteError { cause: LinkError::LinkDown, .. })));
    }

    #[test]
    fn test_fail_queued_writes_drains_one_id() {
        let manager = MemoryQueueManager::new();

        let (active, _active_rx) = queued_write(1, 0);
        manager.enqueue_write(active, false);
        manager.next_write(1).unwrap();

        let (queued, mut queued_rx) = queued_write(1, 50);
        manager.enqueue_write(queued, false);
        let (unrelated, mut unrelated_rx) = queued_write(2, 0);
        manager.enqueue_write(unrelated, false);

        manager.fail_queued_writes(1);

        assert!(matches!(queued_rx.try_recv().unwrap(), Err(WriteError { cause: LinkError::LinkDown, .. })));
        assert!(unrelated_rx.try_recv().is_err());
        assert!(!manager.is_empty());
    }
}
