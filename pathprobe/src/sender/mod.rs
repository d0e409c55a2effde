//! The probing side: announces a session, then runs a binary search over candidate rates with
//!  one packet train per step.

pub mod rate_controller;
pub mod train;

use crate::config::SenderConfig;
use crate::sender::rate_controller::{RateController, RateSearchReport, TrainProber};
use crate::sender::train::TrainTransmitter;
use anyhow::bail;
use async_trait::async_trait;
use bytes::BytesMut;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{error, info, instrument};
use transport::control_messages::{FeedbackVerdict, InitMsg};
use transport::feedback::{FeedbackListener, FeedbackOutcome};
use transport::send_socket::SendSocket;
use transport::socket::{bind_udp, unspecified_for};

/// Owns both of the sender's transport handles for the duration of a run. They are released
///  when the sender is dropped, including when the handshake fails.
pub struct Sender {
    config: SenderConfig,
    socket: Arc<UdpSocket>,
    transmitter: TrainTransmitter<Arc<UdpSocket>>,
    feedback: FeedbackListener,
}

impl Sender {
    pub async fn new(config: SenderConfig) -> anyhow::Result<Sender> {
        config.validate()?;

        let socket = Arc::new(bind_udp(unspecified_for(config.target_addr), None)?);
        let feedback = FeedbackListener::bind(config.feedback_addr, config.transport.feedback_timeout).await?;

        let transmitter = TrainTransmitter::new(
            socket.clone(),
            config.target_addr,
            config.packet_size,
            config.packets_per_train,
            config.transport.spin_threshold,
        );

        Ok(Sender {
            config,
            socket,
            transmitter,
            feedback,
        })
    }

    pub fn feedback_addr(&self) -> anyhow::Result<std::net::SocketAddr> {
        self.feedback.local_addr()
    }

    /// Runs a complete session. A missing session ack aborts the run with an error; after that,
    ///  every train completes and the result is the best rate the receiver accepted.
    #[instrument(name = "probe_session", skip(self), fields(label = %self.config.label, target = %self.config.target_addr))]
    pub async fn run(&mut self) -> anyhow::Result<RateSearchReport> {
        let mut controller = RateController::new(self.config.min_rate_mbps, self.config.max_rate_mbps, self.config.tolerance_mbps)?;

        self.handshake(controller.planned_trains()).await?;

        info!("starting probe trains");
        let report = controller.run(self).await?;
        info!("estimated bandwidth: {:.2} Mbps ({} trains, {} accepted, {} rejected)", report.estimate_mbps, report.trains, report.accepted, report.rejected);
        Ok(report)
    }

    /// Sends the INIT datagram and waits for the receiver's ack. The datagram itself is not
    ///  retransmitted - if it is lost, there is no ack, and the run is aborted.
    async fn handshake(&self, num_trains: u32) -> anyhow::Result<()> {
        let init_msg = InitMsg {
            num_trains,
            packets_per_train: self.config.packets_per_train,
            label: self.config.label.clone(),
        };

        let mut buf = BytesMut::new();
        init_msg.ser(&mut buf);

        info!("sending INIT to {:?}: {} trains of {} packets", self.config.target_addr, num_trains, self.config.packets_per_train);
        self.socket.do_send_packet(self.config.target_addr, &buf).await?;

        match self.feedback.await_feedback().await {
            FeedbackOutcome::Delivered(FeedbackVerdict::SessionAck) => {
                info!("receiver acknowledged the session");
                Ok(())
            }
            FeedbackOutcome::Delivered(other) => {
                error!("expected a session ack, received {}", other);
                bail!("receiver answered INIT with {} instead of ACK - aborting", other)
            }
            FeedbackOutcome::TimedOut | FeedbackOutcome::ConnectionFailed => {
                error!("receiver did not acknowledge INIT");
                bail!("receiver did not acknowledge INIT - aborting")
            }
        }
    }
}

#[async_trait]
impl TrainProber for Sender {
    async fn send_train(&mut self, rate_mbps: f64) -> anyhow::Result<()> {
        let stats = self.transmitter.send_train(rate_mbps).await?;
        info!("sent {} packets at {:.1} µs spacing in {:?}", stats.sent, stats.spacing.as_secs_f64() * 1e6, stats.elapsed);
        Ok(())
    }

    async fn await_verdict(&mut self) -> FeedbackOutcome {
        self.feedback.await_feedback().await
    }
}
