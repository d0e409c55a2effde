use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use anyhow::bail;
use transport::config::TransportConfig;
use transport::control_messages::InitMsg;
use transport::pacing::spacing_for_rate;

pub const DEFAULT_DATA_PORT: u16 = 9000;
pub const DEFAULT_FEEDBACK_PORT: u16 = 9100;

/// Upper bound for the gap between two probes of a train. The receiver's train gap timeout
///  must be longer, otherwise it takes every probe for a train of its own.
pub const MAX_PACKET_SPACING: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StretchScope {
    /// Deltas of all trains since the session started are compared. Stretch observed during an
    ///  earlier train makes every later train of the session fail as well.
    Session,
    /// Only the current train's deltas are compared
    Train,
}

pub struct SenderConfig {
    /// The receiver's data address - the INIT datagram and all probe trains go there
    pub target_addr: SocketAddr,
    /// Where the sender listens for the receiver's feedback connections
    pub feedback_addr: SocketAddr,

    pub packet_size: usize,
    pub packets_per_train: u32,

    pub min_rate_mbps: f64,
    pub max_rate_mbps: f64,
    /// The binary search stops once the rate interval is at most this wide
    pub tolerance_mbps: f64,

    /// Goes into the artifact's file name on the receiver side
    pub label: String,

    pub transport: TransportConfig,
}

impl SenderConfig {
    pub fn new(target_addr: SocketAddr) -> SenderConfig {
        SenderConfig {
            target_addr,
            feedback_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_FEEDBACK_PORT)),
            packet_size: 1400,
            packets_per_train: 100,
            min_rate_mbps: 1.0,
            max_rate_mbps: 1000.0,
            tolerance_mbps: 1.0,
            label: "test".to_string(),
            transport: TransportConfig::new(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.packet_size == 0 {
            bail!("packet size must be positive");
        }
        if self.packet_size > self.transport.max_datagram_len {
            bail!("packet size {} exceeds the maximum datagram length {}", self.packet_size, self.transport.max_datagram_len);
        }
        if self.packets_per_train == 0 {
            bail!("a train needs at least one packet");
        }
        if !(self.min_rate_mbps.is_finite() && self.min_rate_mbps > 0.0) {
            bail!("min rate must be positive, was {}", self.min_rate_mbps);
        }
        if !(self.max_rate_mbps.is_finite() && self.max_rate_mbps >= self.min_rate_mbps) {
            bail!("max rate {} must not be below min rate {}", self.max_rate_mbps, self.min_rate_mbps);
        }
        if !(self.tolerance_mbps.is_finite() && self.tolerance_mbps > 0.0) {
            bail!("tolerance must be positive, was {}", self.tolerance_mbps);
        }
        let slowest_spacing = spacing_for_rate(self.min_rate_mbps, self.packet_size)?;
        if slowest_spacing > MAX_PACKET_SPACING {
            bail!("min rate {} Mbps spaces {} byte packets {:?} apart, more than {:?}", self.min_rate_mbps, self.packet_size, slowest_spacing, MAX_PACKET_SPACING);
        }
        InitMsg::validate_label(&self.label)?;
        self.transport.validate()
    }
}

pub struct ReceiverConfig {
    /// The address the data socket is bound to - INIT datagrams and probes arrive here
    pub bind_addr: SocketAddr,

    /// Feedback goes to this port on the host the INIT datagram came from ...
    pub feedback_port: u16,
    /// ... unless an explicit address is given here
    pub feedback_addr: Option<SocketAddr>,

    /// Maximum tolerated difference between two adjacent inter-arrival deltas
    pub stretch_threshold_us: u64,
    pub stretch_scope: StretchScope,

    pub csv_prefix: String,
    /// Must exist before a session starts
    pub results_dir: PathBuf,

    /// Keep accepting sessions after the first one completes
    pub loop_forever: bool,

    /// Maximum silence while waiting for the first packet of a train. Hitting it ends the session.
    pub receive_timeout: Duration,
    /// Maximum silence between two packets of the same train. Hitting it closes the train with
    ///  the packets received so far. Must exceed [`MAX_PACKET_SPACING`].
    pub train_gap_timeout: Duration,

    pub transport: TransportConfig,
}

impl ReceiverConfig {
    pub fn new(bind_addr: SocketAddr) -> ReceiverConfig {
        ReceiverConfig {
            bind_addr,
            feedback_port: DEFAULT_FEEDBACK_PORT,
            feedback_addr: None,
            stretch_threshold_us: 200,
            stretch_scope: StretchScope::Session,
            csv_prefix: "session".to_string(),
            results_dir: PathBuf::from("results"),
            loop_forever: false,
            receive_timeout: Duration::from_secs(10),
            train_gap_timeout: Duration::from_secs(1),
            transport: TransportConfig::new(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.receive_timeout.is_zero() || self.train_gap_timeout.is_zero() {
            bail!("receive timeouts must be positive");
        }
        if self.train_gap_timeout <= MAX_PACKET_SPACING {
            bail!("train gap timeout {:?} must be longer than the maximum packet spacing {:?}", self.train_gap_timeout, MAX_PACKET_SPACING);
        }
        if self.receive_timeout <= self.transport.feedback_timeout {
            // the sender moves on to the next train after its feedback timeout, so the receiver
            //  must still be listening by then
            bail!("receive timeout {:?} must be longer than the feedback timeout {:?}", self.receive_timeout, self.transport.feedback_timeout);
        }
        if self.csv_prefix.contains(std::path::MAIN_SEPARATOR) {
            bail!("csv prefix {:?} must not contain a path separator", self.csv_prefix);
        }
        self.transport.validate()
    }
}
