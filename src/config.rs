use anyhow::bail;
use std::time::Duration;

/// Protocol tuning knobs. [`RudpConfig::default`] matches the nominal values from
///  the wire protocol's reference deployment; games with tighter liveness
///  requirements typically lower `inactivity_timeout` (e.g. to 5s).
#[derive(Clone, Debug)]
pub struct RudpConfig {
    /// Interval between retransmission sweeps, and the minimum age of an
    ///  unacknowledged packet before it is retransmitted.
    pub retransmission_timeout: Duration,

    /// Number of send attempts after which a reliable packet is dropped from the
    ///  pending-ack buffer. Exhaustion is a silent reliability failure - the
    ///  connection itself stays usable until the inactivity timeout expires.
    pub max_retransmissions: u32,

    /// Duration since the last received packet after which a connection is
    ///  considered dead and swept.
    pub inactivity_timeout: Duration,

    /// Interval of the server's garbage-collection sweep over the registry.
    pub sweep_interval: Duration,

    /// Overall deadline for the client handshake.
    pub handshake_timeout: Duration,

    /// Per-read timeout during the handshake, short so shutdown stays prompt.
    pub handshake_poll_interval: Duration,

    /// Capacity of the per-connection inbound and outbound queues (in packets).
    ///  A full outbound queue fails `send` with `BufferFull`; a full inbound queue
    ///  drops deliveries silently.
    pub queue_capacity: usize,
}

impl Default for RudpConfig {
    fn default() -> RudpConfig {
        RudpConfig {
            retransmission_timeout: Duration::from_millis(100),
            max_retransmissions: 5,
            inactivity_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(5),
            handshake_poll_interval: Duration::from_millis(100),
            queue_capacity: 256,
        }
    }
}

impl RudpConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.queue_capacity == 0 {
            bail!("queue capacity must be non-zero");
        }
        if self.retransmission_timeout.is_zero() {
            bail!("retransmission timeout must be non-zero");
        }
        if self.sweep_interval.is_zero() {
            bail!("sweep interval must be non-zero");
        }
        if self.handshake_poll_interval.is_zero()
            || self.handshake_poll_interval > self.handshake_timeout
        {
            bail!("handshake poll interval must be non-zero and at most the handshake timeout");
        }

        Ok(())
    }
}
