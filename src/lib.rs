//! Host side of a CRTP link to a radio-controlled embedded device. The radio
//!  is half duplex and strictly primary-initiated: the device can only answer,
//!  never speak first, and a single transaction is "send one frame, receive
//!  one acknowledgement that may piggyback a downlink frame".
//!
//! ## Design goals
//!
//! * Make that transactional radio look like a reliable duplex packet link
//!   * one safelink toggle bit per direction detects resends and stale
//!     repeats, so the upper layers never see duplicates
//!   * unacknowledged frames are retried verbatim by the communication loop
//!   * null polling keeps the downlink flowing while the application is idle,
//!     backing off once the device has nothing to say
//! * Request/reply correlation as a generic building block
//!   * a request declares the header and payload prefix its reply must carry
//!   * resend on reply timeout, bounded by a configured retry budget
//!   * every issued operation resolves exactly once - with its result, or
//!     with an error after teardown
//! * The remote memory sub-protocol on top of that
//!   * catalog enumeration (count, then per-id details)
//!   * chunked reads and writes with per-chunk status retries
//!   * per-memory-id admission control: one read at a time, writes strictly
//!     in FIFO order with optional flush-on-enqueue
//! * Terminal link failure (no-ack ceiling, transport error) tears everything
//!   down exactly once and is observable through a watch channel
//!
//! ## Frame layout
//!
//! A frame is at most 32 bytes on the wire:
//! ```ascii
//! 0:  header (u8)
//!     * bit 4-7: port
//!     * bit 2-3: channel
//!     * bit 1:   safelink uplink toggle
//!     * bit 0:   safelink downlink toggle
//! 1:  payload, up to 30 bytes
//! ```
//! The safelink bits belong to the link layer: they are injected on the way
//!  out and masked off on the way in, so packets above the session never
//!  carry them.

pub mod config;
pub mod connection;
pub mod error;
pub mod memory;
pub mod packet;
pub mod request_tracker;
pub mod safelink;
pub mod transport;

pub use config::LinkConfig;
pub use connection::CrtpConnection;
pub use error::LinkError;
pub use memory::{Memory, MemoryKind, ProgressFn, ReadError, RemoteMemory, WriteError, MAX_READ_CHUNK, MAX_WRITE_CHUNK};
pub use packet::{CrtpPacket, CrtpPort};
pub use request_tracker::ReplyMatcher;
pub use transport::{TransportChannel, TransportStats};
