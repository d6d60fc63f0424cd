use std::io;

/// Failure taxonomy of the link core.
///
/// Per-packet and per-chunk problems are retried internally; only retry
///  exhaustion and terminal link failure surface through the public API. Every
///  issued operation resolves exactly once, with either its result or one of
///  these.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// A single frame could not be encoded or decoded. Fatal to that frame
    ///  only, never to the link.
    #[error("malformed CRTP header: {0}")]
    MalformedHeader(&'static str),

    /// A matched reply did not carry the fields its channel requires.
    #[error("malformed payload: {0}")]
    MalformedPayload(&'static str),

    /// No matching reply arrived within the configured number of resends.
    #[error("no reply within {retries} resends")]
    Timeout { retries: u32 },

    /// The link is gone: the no-ack ceiling was hit, the transport failed, or
    ///  the connection was closed. All pending state has been torn down.
    #[error("link is down")]
    LinkDown,

    /// The safelink handshake never succeeded, so the session was never
    ///  established.
    #[error("safelink handshake failed after {attempts} attempts")]
    HandshakeFailed { attempts: u32 },

    /// A second concurrent read was requested for a memory id that already
    ///  has one in flight. Nothing was sent.
    #[error("memory id {memory_id} is busy with another transfer")]
    Busy { memory_id: u8 },

    /// The device kept answering a chunk request with a non-zero status byte
    ///  until the retry budget ran out.
    #[error("device reported status {status} for the chunk at {address:#x}")]
    ProtocolStatus { status: u8, address: u32 },

    /// A queued-but-not-yet-started write was dropped because a newer write
    ///  for the same memory id was enqueued with flush semantics.
    #[error("write superseded by a flush enqueue")]
    Superseded,

    #[error("invalid link configuration: {0}")]
    InvalidConfig(String),

    #[error("transport failure")]
    Transport(#[from] io::Error),
}
