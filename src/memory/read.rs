use std::cmp::min;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::memory::catalog::CHAN_READ;
use crate::memory::ReadError;
use crate::packet::{CrtpPacket, CrtpPort};
use crate::request_tracker::{ReplyMatcher, RequestTracker};

/// Upper bound on the data bytes one read reply can carry.
pub const MAX_READ_CHUNK: usize = 20;

/// One in-flight chunked read of one memory region.
///
/// Chunks are strictly sequential: the request for the next chunk only goes
///  out once the previous one succeeded, so `accumulated` always covers
///  exactly `base_address..cursor_address`.
pub(crate) struct ReadTransfer {
    memory_id: u8,
    base_address: u32,
    total_length: usize,
    cursor_address: u32,
    accumulated: BytesMut,
}

impl ReadTransfer {
    pub fn new(memory_id: u8, address: u32, length: usize) -> ReadTransfer {
        ReadTransfer {
            memory_id,
            base_address: address,
            total_length: length,
            cursor_address: address,
            accumulated: BytesMut::with_capacity(length),
        }
    }

    pub async fn run(mut self, tracker: &RequestTracker, config: &LinkConfig) -> Result<Bytes, ReadError> {
        while self.remaining() > 0 {
            if let Err(cause) = self.next_chunk(tracker, config).await {
                return Err(ReadError {
                    memory_id: self.memory_id,
                    address: self.base_address,
                    partial: self.accumulated.freeze(),
                    cause,
                });
            }
        }
        Ok(self.accumulated.freeze())
    }

    fn remaining(&self) -> usize {
        self.total_length - self.accumulated.len()
    }

    /// Request layout: `[memory_id, address:u32-LE, length:u8]`; reply:
    ///  `[memory_id, address:u32-LE, status:u8, data...]`. A non-zero status
    ///  re-issues the identical request, never advancing the cursor.
    async fn next_chunk(&mut self, tracker: &RequestTracker, config: &LinkConfig) -> Result<(), LinkError> {
        let chunk_len = min(self.remaining(), MAX_READ_CHUNK);
        trace!("requesting chunk of {} bytes at {:#x} from memory {}", chunk_len, self.cursor_address, self.memory_id);

        let mut payload = Vec::with_capacity(6);
        payload.push(self.memory_id);
        payload.extend_from_slice(&self.cursor_address.to_le_bytes());
        payload.push(chunk_len as u8);

        let request = CrtpPacket::new(CrtpPort::Memory, CHAN_READ, payload)?;
        // replies are matched on memory id and chunk address
        let matcher = ReplyMatcher::for_request(&request, &request.payload()[..5]);

        let mut last_status = 0u8;
        for _ in 0..=config.chunk_status_retries {
            let reply = tracker.request(request.clone(), matcher.clone()).await?;
            let body = reply.payload();
            if body.len() < 6 {
                warn!("read reply for memory {} too short, re-requesting chunk", self.memory_id);
                continue;
            }

            last_status = body[5];
            if last_status != 0 {
                debug!("read chunk at {:#x} answered with status {}, re-requesting", self.cursor_address, last_status);
                continue;
            }

            let data = &body[6..];
            if data.is_empty() {
                return Err(LinkError::MalformedPayload("read chunk reply without data"));
            }

            let accepted = min(data.len(), self.remaining());
            self.accumulated.extend_from_slice(&data[..accepted]);
            self.cursor_address += accepted as u32;
            return Ok(());
        }

        Err(LinkError::ProtocolStatus { status: last_status, address: self.cursor_address })
    }
}
