use std::time::Duration;
use anyhow::bail;
use crate::retry::RetryPolicy;

pub struct TransportConfig {
    /// Size of the buffer that datagrams are read into. Probe datagrams longer than this are
    ///  truncated by the OS, which skews the bandwidth estimate for that packet, so this must be
    ///  at least as big as the sender's packet size.
    pub max_datagram_len: usize,

    /// If present, SO_RCVBUF is set to this value for the receiving UDP socket. At high probe
    ///  rates the default buffer can overflow while the receive loop is busy writing records,
    ///  which shows up as loss rather than stretch.
    pub recv_buffer_size: Option<usize>,

    /// How long the sender waits for a single feedback message (session ack or train verdict)
    ///  before treating it as missing
    pub feedback_timeout: Duration,

    /// Timeout for a single attempt to connect to the feedback endpoint
    pub connect_timeout: Duration,

    pub feedback_retry: RetryPolicy,

    /// Read timeout while discarding stray datagrams between sessions
    pub drain_timeout: Duration,

    /// Remaining waits shorter than this are done by yielding instead of sleeping on the timer,
    ///  which has millisecond granularity
    pub spin_threshold: Duration,
}

impl TransportConfig {
    pub fn new() -> TransportConfig {
        TransportConfig {
            max_datagram_len: 1600,
            recv_buffer_size: None,
            feedback_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(1),
            feedback_retry: RetryPolicy::default_feedback(),
            drain_timeout: Duration::from_millis(10),
            spin_threshold: Duration::from_millis(1),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_datagram_len == 0 {
            bail!("max datagram length must be positive");
        }
        if self.feedback_timeout.is_zero() {
            bail!("feedback timeout must be positive");
        }
        if self.drain_timeout.is_zero() {
            bail!("drain timeout must be positive - a zero timeout would block forever");
        }
        self.feedback_retry.validate()
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = TransportConfig::new();
        config.validate().unwrap();
        assert_eq!(config.feedback_timeout, Duration::from_secs(5));
        assert_eq!(config.feedback_retry, RetryPolicy { max_attempts: 3, backoff: Duration::from_secs(1) });
    }

    #[test]
    fn test_zero_drain_timeout_is_rejected() {
        let mut config = TransportConfig::new();
        config.drain_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }
}
