use std::sync::Arc;
use std::sync::Mutex;

use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tracing::{debug, trace};

use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::packet::CrtpPacket;

/// Pattern a reply must start with to resolve a given request: the port and
///  channel of the request plus some leading payload bytes (typically command
///  byte and address), compared on the decoded packet so the safelink bits
///  never interfere.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReplyMatcher {
    port: u8,
    channel: u8,
    payload_prefix: Vec<u8>,
}

impl ReplyMatcher {
    pub fn for_request(request: &CrtpPacket, payload_prefix: &[u8]) -> ReplyMatcher {
        ReplyMatcher {
            port: request.raw_port(),
            channel: request.channel(),
            payload_prefix: payload_prefix.to_vec(),
        }
    }

    pub fn matches(&self, packet: &CrtpPacket) -> bool {
        packet.matches_header(self.port, self.channel)
            && packet.payload().len() >= self.payload_prefix.len()
            && packet.payload()[..self.payload_prefix.len()] == self.payload_prefix[..]
    }
}

struct PendingRequest {
    matcher: ReplyMatcher,
    reply: oneshot::Sender<CrtpPacket>,
}

/// Correlates outgoing packets with their expected replies.
///
/// Replies are matched on content, not arrival order. A request that sees no
///  matching reply within the configured timeout is resent verbatim, a bounded
///  number of times; stale duplicate replies match at most one outstanding
///  request and are otherwise treated as unsolicited traffic.
pub struct RequestTracker {
    config: Arc<LinkConfig>,
    outbound: mpsc::Sender<CrtpPacket>,
    pending: Mutex<Vec<PendingRequest>>,
}

impl RequestTracker {
    pub fn new(config: Arc<LinkConfig>, outbound: mpsc::Sender<CrtpPacket>) -> RequestTracker {
        RequestTracker {
            config,
            outbound,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Sends `packet` and suspends until a reply matching `matcher` arrives.
    ///
    /// Resolves exactly once: with the matching reply, with
    ///  [LinkError::Timeout] after retry exhaustion, or with
    ///  [LinkError::LinkDown] if the link is torn down while waiting.
    pub async fn request(&self, packet: CrtpPacket, matcher: ReplyMatcher) -> Result<CrtpPacket, LinkError> {
        let attempts = self.config.request_retries + 1;
        for attempt in 1..=attempts {
            let rx = self.register(matcher.clone());

            if self.outbound.send(packet.clone()).await.is_err() {
                self.deregister(&matcher);
                return Err(LinkError::LinkDown);
            }

            match time::timeout(self.config.reply_timeout, rx).await {
                Ok(Ok(reply)) => return Ok(reply),
                Ok(Err(_)) => return Err(LinkError::LinkDown),
                Err(_) => {
                    self.deregister(&matcher);
                    trace!("no matching reply within timeout, resend attempt {}/{}", attempt, attempts);
                }
            }
        }

        debug!("request retry budget exhausted for {:?}", matcher);
        Err(LinkError::Timeout { retries: self.config.request_retries })
    }

    /// Routes one inbound packet. A matching pending request is resolved and
    ///  the packet is consumed; anything else is returned to the caller for
    ///  the unsolicited-traffic channel.
    pub fn dispatch(&self, packet: CrtpPacket) -> Option<CrtpPacket> {
        let mut pending = self.pending.lock().expect("pending request list poisoned");

        let position = pending.iter().position(|p| p.matcher.matches(&packet));
        match position {
            Some(idx) => {
                let request = pending.remove(idx);
                // the receiver may be gone if its timeout fired concurrently
                request.reply.send(packet).ok();
                None
            }
            None => Some(packet),
        }
    }

    /// Drops every pending request, resolving each waiting caller with
    ///  [LinkError::LinkDown]. Called exactly once, on link teardown.
    pub fn fail_all(&self) {
        let mut pending = self.pending.lock().expect("pending request list poisoned");
        if !pending.is_empty() {
            debug!("tearing down {} pending request(s)", pending.len());
        }
        pending.clear();
    }

    fn register(&self, matcher: ReplyMatcher) -> oneshot::Receiver<CrtpPacket> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("pending request list poisoned")
            .push(PendingRequest { matcher, reply: tx });
        rx
    }

    fn deregister(&self, matcher: &ReplyMatcher) {
        let mut pending = self.pending.lock().expect("pending request list poisoned");
        if let Some(idx) = pending.iter().position(|p| &p.matcher == matcher) {
            pending.remove(idx);
        }
    }
}
