use std::cmp::min;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::memory::catalog::CHAN_WRITE;
use crate::memory::WriteError;
use crate::packet::{CrtpPacket, CrtpPort};
use crate::request_tracker::{ReplyMatcher, RequestTracker};

/// Upper bound on the data bytes one write request can carry.
pub const MAX_WRITE_CHUNK: usize = 25;

/// Per-write progress hook, invoked with the committed percentage (0..=100).
pub type ProgressFn = Box<dyn Fn(u8) + Send + Sync>;

/// One write of one memory region, split into chunks that are committed
///  strictly in order. Only ever driven while it is the head of its memory
///  id's write queue.
pub(crate) struct WriteTransfer {
    memory_id: u8,
    base_address: u32,
    data: Bytes,
    committed: usize,
    progress: Option<ProgressFn>,
    last_percent: u8,
}

impl WriteTransfer {
    pub fn new(memory_id: u8, address: u32, data: Bytes, progress: Option<ProgressFn>) -> WriteTransfer {
        WriteTransfer {
            memory_id,
            base_address: address,
            data,
            committed: 0,
            progress,
            last_percent: 0,
        }
    }

    pub fn memory_id(&self) -> u8 {
        self.memory_id
    }

    pub fn base_address(&self) -> u32 {
        self.base_address
    }

    pub async fn run(mut self, tracker: &RequestTracker, config: &LinkConfig) -> Result<(), WriteError> {
        if self.data.is_empty() {
            self.emit_progress();
            return Ok(());
        }

        while self.committed < self.data.len() {
            if let Err(cause) = self.next_chunk(tracker, config).await {
                return Err(WriteError {
                    memory_id: self.memory_id,
                    address: self.base_address,
                    cause,
                });
            }
            self.emit_progress();
        }

        debug!("write of {} bytes to memory {} at {:#x} done", self.data.len(), self.memory_id, self.base_address);
        Ok(())
    }

    /// Request layout: `[memory_id, address:u32-LE, data...]`; reply:
    ///  `[memory_id, address:u32-LE, status:u8]`. A non-zero status re-sends
    ///  the identical chunk - same address, same bytes, never skipped or
    ///  reordered.
    async fn next_chunk(&mut self, tracker: &RequestTracker, config: &LinkConfig) -> Result<(), LinkError> {
        let chunk_len = min(self.data.len() - self.committed, MAX_WRITE_CHUNK);
        let address = self.base_address + self.committed as u32;
        trace!("writing chunk of {} bytes at {:#x} to memory {}", chunk_len, address, self.memory_id);

        let mut payload = Vec::with_capacity(5 + chunk_len);
        payload.push(self.memory_id);
        payload.extend_from_slice(&address.to_le_bytes());
        payload.extend_from_slice(&self.data[self.committed..self.committed + chunk_len]);

        let request = CrtpPacket::new(CrtpPort::Memory, CHAN_WRITE, payload)?;
        // replies are matched on memory id and chunk address
        let matcher = ReplyMatcher::for_request(&request, &request.payload()[..5]);

        let mut last_status = 0u8;
        for _ in 0..=config.chunk_status_retries {
            let reply = tracker.request(request.clone(), matcher.clone()).await?;
            let body = reply.payload();
            if body.len() < 6 {
                warn!("write reply for memory {} too short, re-sending chunk", self.memory_id);
                continue;
            }

            last_status = body[5];
            if last_status != 0 {
                debug!("write chunk at {:#x} answered with status {}, re-sending", address, last_status);
                continue;
            }

            self.committed += chunk_len;
            return Ok(());
        }

        Err(LinkError::ProtocolStatus { status: last_status, address })
    }

    fn emit_progress(&mut self) {
        let Some(progress) = &self.progress else {
            return;
        };

        let percent = if self.data.is_empty() {
            100
        }
        else {
            (100 * self.committed / self.data.len()) as u8
        };
        if percent > self.last_percent {
            self.last_percent = percent;
            progress(percent);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::runtime::Builder;
    use tokio::sync::mpsc;

    fn test_setup(retries: u32) -> (Arc<LinkConfig>, Arc<RequestTracker>, mpsc::Receiver<CrtpPacket>) {
        let config = Arc::new(LinkConfig {
            reply_timeout: Duration::from_millis(50),
            request_retries: 0,
            chunk_status_retries: retries,
            ..LinkConfig::default()
        });
        let (outbound_tx, outbound_rx) = mpsc::channel(32);
        let tracker = Arc::new(RequestTracker::new(config.clone(), outbound_tx));
        (config, tracker, outbound_rx)
    }

    fn write_reply(memory_id: u8, address: u32, status: u8) -> CrtpPacket {
        let mut payload = vec![memory_id];
        payload.extend_from_slice(&address.to_le_bytes());
        payload.push(status);
        CrtpPacket::new(CrtpPort::Memory, CHAN_WRITE, payload).unwrap()
    }

    /// Acknowledges each write chunk with a scripted status byte and records
    ///  what arrived on the wire.
    fn spawn_device(
        tracker: Arc<RequestTracker>,
        mut outbound_rx: mpsc::Receiver<CrtpPacket>,
        mut statuses: Vec<u8>,
    ) -> tokio::task::JoinHandle<Vec<(u32, Vec<u8>)>> {
        // hold the tracker weakly so dropping the test's Arc closes the channel
        let tracker = Arc::downgrade(&tracker);
        tokio::spawn(async move {
            let mut chunks = Vec::new();
            while let Some(request) = outbound_rx.recv().await {
                assert_eq!(request.port(), CrtpPort::Memory);
                assert_eq!(request.channel(), CHAN_WRITE);

                let body = request.payload();
                let memory_id = body[0];
                let address = u32::from_le_bytes([body[1], body[2], body[3], body[4]]);
                chunks.push((address, body[5..].to_vec()));

                let status = if statuses.is_empty() { 0 } else { statuses.remove(0) };
                assert_eq!(tracker.upgrade().unwrap().dispatch(write_reply(memory_id, address, status)), None);
            }
            chunks
        })
    }

    #[test]
    fn test_write_60_bytes_in_three_chunks() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let (config, tracker, outbound_rx) = test_setup(0);
            let device = spawn_device(tracker.clone(), outbound_rx, vec![]);

            let data: Vec<u8> = (0..60).collect();
            let reported = Arc::new(Mutex::new(Vec::new()));
            let progress: ProgressFn = {
                let reported = reported.clone();
                Box::new(move |percent| reported.lock().unwrap().push(percent))
            };

            WriteTransfer::new(6, 0x200, Bytes::from(data.clone()), Some(progress))
                .run(&tracker, &config)
                .await
                .unwrap();

            drop(tracker);
            let chunks = device.await.unwrap();

            assert_eq!(chunks, vec![
                (0x200, data[..25].to_vec()),
                (0x219, data[25..50].to_vec()),
                (0x232, data[50..].to_vec()),
            ]);

            let reported = reported.lock().unwrap().clone();
            assert!(reported.windows(2).all(|w| w[0] <= w[1]));
            assert_eq!(reported.last(), Some(&100));
        });
    }

    #[test]
    fn test_non_zero_status_resends_identical_chunk() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let (config, tracker, outbound_rx) = test_setup(3);
            let device = spawn_device(tracker.clone(), outbound_rx, vec![5, 0]);

            let data = vec![1, 2, 3];
            WriteTransfer::new(1, 0, Bytes::from(data.clone()), None)
                .run(&tracker, &config)
                .await
                .unwrap();

            drop(tracker);
            let chunks = device.await.unwrap();
            assert_eq!(chunks, vec![(0, data.clone()), (0, data)]);
        });
    }

    #[test]
    fn test_status_retry_exhaustion() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let (config, tracker, outbound_rx) = test_setup(1);
            let device = spawn_device(tracker.clone(), outbound_rx, vec![0, 3, 3]);

            let data: Vec<u8> = (0..30).collect();
            let error = WriteTransfer::new(8, 0x10, Bytes::from(data), None)
                .run(&tracker, &config)
                .await
                .unwrap_err();

            assert_eq!(error.memory_id, 8);
            assert_eq!(error.address, 0x10);
            assert!(matches!(error.cause, LinkError::ProtocolStatus { status: 3, address: 0x29 }));

            drop(tracker);
            device.await.unwrap();
        });
    }

    #[test]
    fn test_empty_write_completes_immediately() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let (config, tracker, mut outbound_rx) = test_setup(0);

            let reported = Arc::new(Mutex::new(Vec::new()));
            let progress: ProgressFn = {
                let reported = reported.clone();
                Box::new(move |percent| reported.lock().unwrap().push(percent))
            };

            WriteTransfer::new(1, 0, Bytes::new(), Some(progress))
                .run(&tracker, &config)
                .await
                .unwrap();

            assert!(outbound_rx.try_recv().is_err());
            assert_eq!(reported.lock().unwrap().clone(), vec![100]);
        });
    }
}
