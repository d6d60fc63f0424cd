use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::packet::CrtpPacket;
use crate::transport::TransportChannel;

/// Frame that switches the device into safelink mode. The device echoes it
///  verbatim when the handshake succeeds.
const SAFELINK_ENABLE: [u8; 3] = [0xFF, 0x05, 0x01];

const UPLINK_BIT: u8 = 0x02;
const DOWNLINK_BIT: u8 = 0x01;

/// Outcome of a single safelink radio transaction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Exchange {
    /// Acknowledged, and the downlink payload is genuinely new.
    Delivered(CrtpPacket),
    /// Acknowledged, but the downlink carried nothing new: either an empty
    ///  payload or a stale repeat of the device's previous answer.
    AckedEmpty,
    /// The transaction went unacknowledged. The caller retries the identical
    ///  packet.
    NoAck,
}

/// Makes the half-duplex, primary-initiated radio transaction look like a
///  reliable duplex channel.
///
/// One bit per direction rides in the two reserved header bits: the uplink
///  toggle guarantees the device can tell a fresh uplink packet from a resend,
///  the downlink toggle lets this side tell a fresh answer from the device
///  re-sending its last one because no new uplink data had arrived yet.
///
/// The toggle bits are the only protocol state that persists across
///  transactions; they are exclusively owned and mutated here.
pub struct SafelinkSession {
    transport: Arc<dyn TransportChannel>,
    config: Arc<LinkConfig>,
    uplink_toggle: bool,
    downlink_toggle: bool,
    consecutive_no_ack: u32,
    quality: QualityWindow,
}

impl SafelinkSession {
    pub fn new(transport: Arc<dyn TransportChannel>, config: Arc<LinkConfig>) -> SafelinkSession {
        let quality = QualityWindow::new(config.quality_window);
        SafelinkSession {
            transport,
            config,
            uplink_toggle: false,
            downlink_toggle: false,
            consecutive_no_ack: 0,
            quality,
        }
    }

    /// Performs the safelink-enable handshake. Until this succeeds the session
    ///  is not established and must not be used for regular traffic.
    pub async fn activate(&mut self) -> Result<(), LinkError> {
        for attempt in 1..=self.config.handshake_attempts {
            self.transport.send(&SAFELINK_ENABLE).await?;
            match self.transport.receive(self.config.ack_receive_timeout).await? {
                Some(reply) if reply.as_ref() == SAFELINK_ENABLE => {
                    self.uplink_toggle = false;
                    self.downlink_toggle = false;
                    self.consecutive_no_ack = 0;
                    debug!("safelink enabled after {} attempt(s)", attempt);
                    return Ok(());
                }
                Some(_) => trace!("handshake attempt {} answered with non-echo payload", attempt),
                None => trace!("handshake attempt {} went unacknowledged", attempt),
            }
        }

        warn!("safelink handshake failed, session not established");
        Err(LinkError::HandshakeFailed { attempts: self.config.handshake_attempts })
    }

    /// Runs one radio transaction: encodes the current toggles into the two
    ///  reserved header bits, transmits, and classifies the result.
    ///
    /// The uplink toggle flips on every acknowledged transaction (the device
    ///  received our frame); the downlink toggle only moves when the answer
    ///  payload carries a downlink bit different from the last observed one.
    pub async fn exchange(&mut self, packet: &CrtpPacket) -> Result<Exchange, LinkError> {
        let mut frame = packet.to_frame();
        if self.uplink_toggle {
            frame[0] |= UPLINK_BIT;
        }
        if self.downlink_toggle {
            frame[0] |= DOWNLINK_BIT;
        }

        self.transport.send(&frame).await?;
        let reply = self.transport.receive(self.config.ack_receive_timeout).await?;

        let Some(reply) = reply else {
            self.quality.record(false);
            self.consecutive_no_ack += 1;
            if self.consecutive_no_ack >= self.config.no_ack_ceiling {
                warn!("{} consecutive transactions without acknowledgement - link is down", self.consecutive_no_ack);
                return Err(LinkError::LinkDown);
            }
            return Ok(Exchange::NoAck);
        };

        self.quality.record(true);
        self.consecutive_no_ack = 0;
        self.uplink_toggle = !self.uplink_toggle;

        if reply.is_empty() {
            return Ok(Exchange::AckedEmpty);
        }

        let downlink_bit = reply[0] & DOWNLINK_BIT != 0;
        if downlink_bit == self.downlink_toggle {
            trace!("stale downlink repeat, nothing new to deliver");
            return Ok(Exchange::AckedEmpty);
        }
        self.downlink_toggle = downlink_bit;

        match CrtpPacket::from_frame(&reply) {
            Ok(packet) => Ok(Exchange::Delivered(packet)),
            Err(e) => {
                warn!("dropping undecodable downlink frame: {}", e);
                Ok(Exchange::AckedEmpty)
            }
        }
    }

    /// Acknowledged vs. attempted transactions over a rolling window, in
    ///  percent. Observability only, never used for correctness.
    pub fn link_quality(&self) -> f32 {
        self.quality.ratio()
    }
}

struct QualityWindow {
    window: VecDeque<bool>,
    capacity: usize,
    acked: usize,
}

impl QualityWindow {
    fn new(capacity: usize) -> QualityWindow {
        QualityWindow {
            window: VecDeque::with_capacity(capacity),
            capacity,
            acked: 0,
        }
    }

    fn record(&mut self, acked: bool) {
        if self.window.len() == self.capacity {
            if let Some(true) = self.window.pop_front() {
                self.acked -= 1;
            }
        }
        self.window.push_back(acked);
        if acked {
            self.acked += 1;
        }
    }

    fn ratio(&self) -> f32 {
        if self.window.is_empty() {
            return 100.0;
        }
        100.0 * self.acked as f32 / self.window.len() as f32
    }
}
