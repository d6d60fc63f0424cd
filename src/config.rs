use std::time::Duration;

use anyhow::bail;

/// All retry and timeout knobs of the link core.
///
/// The protocol constants (chunk sizes, handshake frame, header layout) are
///  fixed by the wire format and live next to the code that speaks them; this
///  struct only carries the values that tests and deployments legitimately
///  want to vary. Unit tests inject short timeouts for determinism.
#[derive(Clone, Debug)]
pub struct LinkConfig {
    /// How long a single radio transaction waits for the hardware to report
    ///  an acknowledgement before it counts as lost.
    pub ack_receive_timeout: Duration,

    /// How long a correlated request waits for its matching reply before the
    ///  identical packet is resent.
    pub reply_timeout: Duration,

    /// How many times a correlated request is resent before it fails with
    ///  a timeout. The initial send is not counted.
    pub request_retries: u32,

    /// How many times a chunk request that was answered with a non-zero
    ///  status byte is re-issued (same address, same bytes) before the
    ///  transfer fails.
    pub chunk_status_retries: u32,

    /// Consecutive unacknowledged transactions before the session reports a
    ///  terminal link error.
    pub no_ack_ceiling: u32,

    /// Attempts to get the safelink-enable frame echoed back before giving up
    ///  on establishing the session.
    pub handshake_attempts: u32,

    /// After this many consecutive empty downlink payloads the communication
    ///  loop backs off between polls instead of spinning on null packets.
    pub empty_poll_threshold: u32,

    /// The back-off interval for an idle link.
    pub empty_poll_relaxation: Duration,

    /// Number of transactions in the rolling window behind the link quality
    ///  metric.
    pub quality_window: usize,

    /// Capacity of the channel carrying non-correlated inbound packets
    ///  (console text, async telemetry) to the application.
    pub unsolicited_channel_capacity: usize,
}

impl Default for LinkConfig {
    fn default() -> LinkConfig {
        LinkConfig {
            ack_receive_timeout: Duration::from_millis(10),
            reply_timeout: Duration::from_millis(200),
            request_retries: 10,
            chunk_status_retries: 10,
            no_ack_ceiling: 100,
            handshake_attempts: 10,
            empty_poll_threshold: 10,
            empty_poll_relaxation: Duration::from_millis(10),
            quality_window: 100,
            unsolicited_channel_capacity: 64,
        }
    }
}

impl LinkConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ack_receive_timeout.is_zero() {
            bail!("ack receive timeout must be non-zero");
        }
        if self.reply_timeout.is_zero() {
            bail!("reply timeout must be non-zero");
        }
        if self.no_ack_ceiling == 0 {
            bail!("no-ack ceiling must be non-zero");
        }
        if self.handshake_attempts == 0 {
            bail!("at least one handshake attempt is required");
        }
        if self.quality_window == 0 {
            bail!("quality window must be non-zero");
        }
        if self.unsolicited_channel_capacity == 0 {
            bail!("unsolicited channel capacity must be non-zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(LinkConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut config = LinkConfig::default();
        config.reply_timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = LinkConfig::default();
        config.no_ack_ceiling = 0;
        assert!(config.validate().is_err());

        let mut config = LinkConfig::default();
        config.handshake_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = LinkConfig::default();
        config.quality_window = 0;
        assert!(config.validate().is_err());
    }
}
