use std::sync::Arc;

use num_enum::{FromPrimitive, IntoPrimitive};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::LinkError;
use crate::packet::{CrtpPacket, CrtpPort};
use crate::request_tracker::{ReplyMatcher, RequestTracker};

/// Sub-channels of the memory port.
pub(crate) const CHAN_INFO: u8 = 0;
pub(crate) const CHAN_READ: u8 = 1;
pub(crate) const CHAN_WRITE: u8 = 2;

/// Commands on the info channel. Command 0 is a version probe that this
///  implementation never sends.
const CMD_GET_NBR: u8 = 1;
const CMD_GET_DETAILS: u8 = 2;

/// Closed enumeration of the memory types a device can expose. Consumers
///  match on this instead of dispatching on raw type bytes; layouts of the
///  individual types are out of scope here.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MemoryKind {
    I2c = 0x00,
    OneWire = 0x01,
    LedDriver = 0x10,
    Loco = 0x11,
    Trajectory = 0x12,
    Loco2 = 0x13,
    Lighthouse = 0x14,
    MemoryTester = 0x15,
    LedTimings = 0x17,
    App = 0x18,
    DeckMemory = 0x19,
    DeckMultiranger = 0x1A,
    DeckPaa3905 = 0x1B,
    #[num_enum(catch_all)]
    Unknown(u8),
}

/// Descriptor of one remote memory region. Immutable for the session; the id
///  is only stable until the next reconnect.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteMemory {
    pub id: u8,
    pub kind: MemoryKind,
    pub size: u32,
    /// Hardware address, reported for addressed memory types (1-wire).
    pub address: Option<u64>,
}

/// Enumerates the remote memory regions: one count request, then one detail
///  request per index, strictly sequential.
pub struct MemoryCatalog {
    tracker: Arc<RequestTracker>,
    entries: RwLock<Vec<RemoteMemory>>,
    // serializes concurrent refresh() calls; each run re-enumerates from scratch
    refresh_lock: Mutex<()>,
}

enum DetailReply {
    Memory(RemoteMemory),
    /// Known degraded-device behavior: a detail reply too short to parse.
    ///  Enumeration ends immediately with whatever was collected so far.
    Degraded,
}

impl MemoryCatalog {
    pub fn new(tracker: Arc<RequestTracker>) -> MemoryCatalog {
        MemoryCatalog {
            tracker,
            entries: RwLock::new(Vec::new()),
            refresh_lock: Mutex::new(()),
        }
    }

    /// Rebuilds the catalog from scratch. The previously known set is
    ///  invalidated as soon as enumeration starts.
    pub async fn refresh(&self) -> Result<Vec<RemoteMemory>, LinkError> {
        let _guard = self.refresh_lock.lock().await;
        self.entries.write().await.clear();

        debug!("requesting number of memories");
        let count_reply = self.tracker
            .request(info_request(vec![CMD_GET_NBR])?, info_matcher(&[CMD_GET_NBR])?)
            .await?;
        let count = match count_reply.payload().get(1) {
            Some(&count) => count,
            None => return Err(LinkError::MalformedPayload("memory count reply without count byte")),
        };
        info!("{} memories reported", count);

        let mut found = Vec::with_capacity(count as usize);
        for index in 0..count {
            let reply = self.tracker
                .request(info_request(vec![CMD_GET_DETAILS, index])?, info_matcher(&[CMD_GET_DETAILS, index])?)
                .await?;

            match parse_detail_reply(reply.payload()) {
                DetailReply::Memory(memory) => {
                    debug!("memory {}: {:?}, {} bytes", memory.id, memory.kind, memory.size);
                    found.push(memory);
                }
                DetailReply::Degraded => {
                    warn!("got good count but undecodable detail for index {} - ending enumeration with {} of {} memories", index, found.len(), count);
                    break;
                }
            }
        }

        *self.entries.write().await = found.clone();
        Ok(found)
    }

    pub async fn memories(&self) -> Vec<RemoteMemory> {
        self.entries.read().await.clone()
    }

    pub async fn get(&self, id: u8) -> Option<RemoteMemory> {
        self.entries.read().await.iter()
            .find(|m| m.id == id)
            .cloned()
    }

    pub async fn by_kind(&self, kind: MemoryKind) -> Vec<RemoteMemory> {
        self.entries.read().await.iter()
            .filter(|m| m.kind == kind)
            .cloned()
            .collect()
    }
}

fn info_request(payload: Vec<u8>) -> Result<CrtpPacket, LinkError> {
    CrtpPacket::new(CrtpPort::Memory, CHAN_INFO, payload)
}

fn info_matcher(prefix: &[u8]) -> Result<ReplyMatcher, LinkError> {
    let request = info_request(prefix.to_vec())?;
    Ok(ReplyMatcher::for_request(&request, prefix))
}

/// Reply layout: `[CMD_GET_DETAILS, id, kind, size:u32-LE, address:8 bytes]`.
fn parse_detail_reply(payload: &[u8]) -> DetailReply {
    if payload.len() < 2 {
        return DetailReply::Degraded;
    }
    let body = &payload[1..];
    if body.len() < 6 {
        return DetailReply::Degraded;
    }

    let id = body[0];
    let kind = MemoryKind::from_primitive(body[1]);
    let size = u32::from_le_bytes([body[2], body[3], body[4], body[5]]);
    let address = if kind == MemoryKind::OneWire && body.len() >= 14 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&body[6..14]);
        Some(u64::from_le_bytes(raw))
    }
    else {
        None
    };

    DetailReply::Memory(RemoteMemory { id, kind, size, address })
}
