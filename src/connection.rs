use std::sync::{Arc, Mutex};

use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, trace, warn};

use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::memory::Memory;
use crate::packet::CrtpPacket;
use crate::request_tracker::{ReplyMatcher, RequestTracker};
use crate::safelink::{Exchange, SafelinkSession};
use crate::transport::{TransportChannel, TransportStats};

const OUTBOUND_CAPACITY: usize = 64;

/// An established safelink session plus the background task that owns it.
///
/// The radio is half duplex and every downlink byte rides on the back of an
///  uplink transaction, so a single communication loop task multiplexes
///  everything: application sends, correlated requests, and the null polling
///  that keeps the downlink flowing when nobody has anything to say.
pub struct CrtpConnection {
    transport: Arc<dyn TransportChannel>,
    outbound: mpsc::Sender<CrtpPacket>,
    tracker: Arc<RequestTracker>,
    memory: Arc<Memory>,
    unsolicited: Mutex<Option<mpsc::Receiver<CrtpPacket>>>,
    link_error_rx: watch::Receiver<Option<String>>,
    quality_rx: watch::Receiver<f32>,
    comm_task: JoinHandle<()>,
}

impl CrtpConnection {
    /// Validates the configuration, performs the safelink handshake and
    ///  spawns the communication loop. On success the link is up and every
    ///  API of this struct is usable.
    pub async fn connect(transport: Arc<dyn TransportChannel>, config: Arc<LinkConfig>) -> Result<CrtpConnection, LinkError> {
        config.validate()
            .map_err(|e| LinkError::InvalidConfig(e.to_string()))?;

        let mut session = SafelinkSession::new(transport.clone(), config.clone());
        session.activate().await?;
        info!("safelink session established");

        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (unsolicited_tx, unsolicited_rx) = mpsc::channel(config.unsolicited_channel_capacity);
        let (link_error_tx, link_error_rx) = watch::channel(None);
        let (quality_tx, quality_rx) = watch::channel(100.0);

        let tracker = Arc::new(RequestTracker::new(config.clone(), outbound.clone()));
        let memory = Arc::new(Memory::new(config.clone(), tracker.clone()));

        let comm_task = tokio::spawn(comm_loop(CommLoop {
            config,
            transport: transport.clone(),
            session,
            outbound_rx,
            tracker: tracker.clone(),
            memory: memory.clone(),
            unsolicited_tx,
            link_error_tx,
            quality_tx,
        }));

        Ok(CrtpConnection {
            transport,
            outbound,
            tracker,
            memory,
            unsolicited: Mutex::new(Some(unsolicited_rx)),
            link_error_rx,
            quality_rx,
            comm_task,
        })
    }

    /// Queues a packet for transmission, without any delivery notification
    ///  beyond the link-level acknowledgement. Setpoint streams and other
    ///  send-and-forget traffic go through here.
    pub async fn send(&self, packet: CrtpPacket) -> Result<(), LinkError> {
        self.outbound.send(packet).await
            .map_err(|_| LinkError::LinkDown)
    }

    /// Sends a request and waits for the reply matching `matcher`, resending
    ///  on timeout per the configured retry budget.
    pub async fn request(&self, packet: CrtpPacket, matcher: ReplyMatcher) -> Result<CrtpPacket, LinkError> {
        self.tracker.request(packet, matcher).await
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    /// Acknowledged vs. attempted transactions over a rolling window, in
    ///  percent.
    pub fn link_quality(&self) -> f32 {
        *self.quality_rx.borrow()
    }

    /// Raw frame counters as reported by the radio hardware.
    pub fn transport_stats(&self) -> TransportStats {
        self.transport.stats()
    }

    /// The stream of inbound packets no pending request claimed (console
    ///  text, async telemetry). Can be taken exactly once; while nobody holds
    ///  it, overflowing packets are dropped.
    pub fn take_unsolicited(&self) -> Option<mpsc::Receiver<CrtpPacket>> {
        self.unsolicited.lock().expect("unsolicited receiver lock poisoned")
            .take()
    }

    /// Watch on the terminal link error. Holds `None` while the link is up
    ///  and switches to the error description exactly once.
    pub fn link_errors(&self) -> watch::Receiver<Option<String>> {
        self.link_error_rx.clone()
    }

    /// Shuts the connection down. Everything still pending resolves with
    ///  [LinkError::LinkDown].
    pub async fn close(&self) {
        self.comm_task.abort();
        self.tracker.fail_all();
        self.memory.on_link_down();
        self.transport.close().await;
        debug!("connection closed");
    }
}

impl Drop for CrtpConnection {
    fn drop(&mut self) {
        self.comm_task.abort();
    }
}

struct CommLoop {
    config: Arc<LinkConfig>,
    transport: Arc<dyn TransportChannel>,
    session: SafelinkSession,
    outbound_rx: mpsc::Receiver<CrtpPacket>,
    tracker: Arc<RequestTracker>,
    memory: Arc<Memory>,
    unsolicited_tx: mpsc::Sender<CrtpPacket>,
    link_error_tx: watch::Sender<Option<String>>,
    quality_tx: watch::Sender<f32>,
}

/// Drives the radio until the connection is closed or the link fails.
///
/// While the downlink is productive the loop polls back-to-back so queued
///  downlink data drains at full rate. After `empty_poll_threshold`
///  consecutive empty answers it relaxes to one null poll per
///  `empty_poll_relaxation`, which keeps the link alive without saturating
///  the radio.
async fn comm_loop(mut ctx: CommLoop) {
    let mut empty_polls: u32 = 0;
    let mut in_flight: Option<CrtpPacket> = None;

    loop {
        let packet = match in_flight.take() {
            Some(packet) => Some(packet),
            None if empty_polls < ctx.config.empty_poll_threshold => {
                match ctx.outbound_rx.try_recv() {
                    Ok(packet) => Some(packet),
                    Err(mpsc::error::TryRecvError::Empty) => None,
                    Err(mpsc::error::TryRecvError::Disconnected) => break,
                }
            }
            None => {
                // idle link: block on outbound work, waking for a keep-alive
                //  poll once per relaxation interval
                select! {
                    packet = ctx.outbound_rx.recv() => match packet {
                        Some(packet) => Some(packet),
                        None => break,
                    },
                    _ = time::sleep(ctx.config.empty_poll_relaxation) => None,
                }
            }
        };

        let to_send = packet.clone().unwrap_or_else(CrtpPacket::null);
        match ctx.session.exchange(&to_send).await {
            Ok(Exchange::Delivered(downlink)) => {
                empty_polls = 0;
                if let Some(unclaimed) = ctx.tracker.dispatch(downlink) {
                    trace!("unsolicited packet on port {:?}", unclaimed.port());
                    if ctx.unsolicited_tx.try_send(unclaimed).is_err() {
                        debug!("unsolicited channel full or unclaimed, dropping packet");
                    }
                }
            }
            Ok(Exchange::AckedEmpty) => {
                if packet.is_none() {
                    empty_polls = empty_polls.saturating_add(1);
                }
            }
            Ok(Exchange::NoAck) => {
                // unacknowledged uplink data is retried verbatim; a lost null
                //  poll is simply re-polled
                in_flight = packet;
            }
            Err(e) => {
                warn!("link failed: {}", e);
                ctx.link_error_tx.send_replace(Some(e.to_string()));
                tear_down(&ctx).await;
                return;
            }
        }
        ctx.quality_tx.send_replace(ctx.session.link_quality());
    }

    debug!("outbound channel closed, communication loop stopping");
    tear_down(&ctx).await;
}

async fn tear_down(ctx: &CommLoop) {
    ctx.tracker.fail_all();
    ctx.memory.on_link_down();
    ctx.transport.close().await;
}
