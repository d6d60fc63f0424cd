use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;

/// Counters reported by the radio hardware, read-only. Used for the link
///  quality metric, never for correctness.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TransportStats {
    pub frames_sent: u64,
    pub frames_acked: u64,
}

/// Abstraction over the physical radio dongle, introduced to facilitate
///  mocking the hardware away for testing.
///
/// The link is half-duplex and primary-initiated: the device can only answer
///  inside the transaction started by [TransportChannel::send], never push
///  data on its own. A `receive` returning `None` means the transaction went
///  unacknowledged (frame lost in either direction).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TransportChannel: Send + Sync + 'static {
    /// Transmits one raw frame (header byte plus payload, <= 32 bytes).
    async fn send(&self, frame: &[u8]) -> io::Result<()>;

    /// Waits for the acknowledgement payload of the transaction started by
    ///  the previous `send`. `Ok(None)` is a lost transaction; an empty
    ///  payload is a valid acknowledgement without downlink data.
    async fn receive(&self, timeout: Duration) -> io::Result<Option<Bytes>>;

    fn stats(&self) -> TransportStats;

    async fn close(&self);
}
