//! The measuring side: waits for a session to be announced, records every probe's arrival and
//!  judges each train by how uniformly its packets arrived.

pub mod recorder;
pub mod session;
pub mod stretch;

use crate::config::ReceiverConfig;
use crate::receiver::recorder::{PacketArrival, SessionRecorder};
use crate::receiver::session::{Session, SessionProgress, SessionSummary};
use anyhow::bail;
use chrono::Local;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, trace, warn};
use transport::control_messages::{FeedbackVerdict, InitMsg};
use transport::feedback::{FeedbackOutcome, FeedbackSender, TcpControlConnector};
use transport::socket::bind_udp;

/// How often an idle receiver checks its stop flag
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Receive errors in a row after which the socket is considered broken
const MAX_CONSECUTIVE_SOCKET_ERRORS: u32 = 16;

/// Tolerates sporadic receive errors, but not a socket that fails on every call
#[derive(Default)]
struct SocketErrors {
    consecutive: u32,
}

impl SocketErrors {
    fn on_error(&mut self, e: std::io::Error) -> anyhow::Result<()> {
        self.consecutive += 1;
        error!("socket error ({} in a row): {}", self.consecutive, e);
        if self.consecutive >= MAX_CONSECUTIVE_SOCKET_ERRORS {
            bail!("giving up after {} consecutive socket errors: {}", self.consecutive, e);
        }
        Ok(())
    }

    fn on_success(&mut self) {
        self.consecutive = 0;
    }
}

pub struct Receiver {
    config: ReceiverConfig,
    socket: UdpSocket,
    feedback: FeedbackSender<TcpControlConnector>,
    stop: Arc<AtomicBool>,
}

impl Receiver {
    pub async fn new(config: ReceiverConfig) -> anyhow::Result<Receiver> {
        config.validate()?;

        let socket = bind_udp(config.bind_addr, config.transport.recv_buffer_size)?;
        info!("listening for probes on {:?}", socket.local_addr()?);

        let feedback = FeedbackSender::from_config(&config.transport);
        Ok(Receiver {
            config,
            socket,
            feedback,
            stop: Default::default(),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Sends all feedback to a fixed address instead of the INIT sender's host
    pub fn set_feedback_addr(&mut self, addr: SocketAddr) {
        self.config.feedback_addr = Some(addr);
    }

    /// Setting the flag makes [`Receiver::run`] return once no session is in progress
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    fn feedback_addr_for(&self, peer: SocketAddr) -> SocketAddr {
        self.config.feedback_addr
            .unwrap_or_else(|| SocketAddr::new(peer.ip(), self.config.feedback_port))
    }

    /// Serves a single session or, with `loop_forever`, one session after the other until the
    ///  stop flag is set. In loop mode a failed session is logged and the receiver waits for the
    ///  next one.
    pub async fn run(&mut self) -> anyhow::Result<Vec<SessionSummary>> {
        let mut summaries = Vec::new();
        while let Some((init, peer)) = self.wait_for_init().await? {
            match self.process_session(init, peer).await {
                Ok(summary) => summaries.push(summary),
                Err(e) if self.config.loop_forever => error!("session aborted: {}", e),
                Err(e) => return Err(e),
            }
            if !self.config.loop_forever {
                break;
            }
        }
        Ok(summaries)
    }

    /// Waits for the next INIT and serves that session
    pub async fn run_session(&mut self) -> anyhow::Result<SessionSummary> {
        match self.wait_for_init().await? {
            Some((init, peer)) => self.process_session(init, peer).await,
            None => bail!("receiver was stopped before a session started"),
        }
    }

    /// Returns `None` if the stop flag was set while waiting. Anything that is not a
    ///  well-formed INIT is discarded.
    async fn wait_for_init(&self) -> anyhow::Result<Option<(InitMsg, SocketAddr)>> {
        let mut buf = vec![0u8; self.config.transport.max_datagram_len];
        let mut socket_errors = SocketErrors::default();
        loop {
            if self.stop.load(Ordering::Acquire) {
                info!("stop requested");
                return Ok(None);
            }

            let (num_read, from) = match timeout(STOP_POLL_INTERVAL, self.socket.recv_from(&mut buf)).await {
                Err(_) => continue,
                Ok(Ok(x)) => {
                    socket_errors.on_success();
                    x
                }
                Ok(Err(e)) => {
                    socket_errors.on_error(e)?;
                    continue;
                }
            };

            let msg = &buf[..num_read];
            if !InitMsg::is_init(msg) {
                trace!("discarding {} byte datagram from {:?} while waiting for INIT", num_read, from);
                continue;
            }

            match InitMsg::deser(msg) {
                Ok(init) => {
                    info!("INIT from {:?}: {} trains of {} packets, label {:?}", from, init.num_trains, init.packets_per_train, init.label);
                    return Ok(Some((init, from)));
                }
                Err(e) => warn!("malformed INIT from {:?}: {} - discarding", from, e),
            }
        }
    }

    #[instrument(name = "session", skip_all, fields(label = %init.label, peer = %peer))]
    async fn process_session(&mut self, init: InitMsg, peer: SocketAddr) -> anyhow::Result<SessionSummary> {
        let session = Session {
            init,
            peer,
            feedback_addr: self.feedback_addr_for(peer),
            created_at: Local::now(),
        };

        // the ACK is only sent once the artifact exists
        let mut recorder = match SessionRecorder::create(&self.config.results_dir, &self.config.csv_prefix, session.label(), session.created_at) {
            Ok(recorder) => recorder,
            Err(e) => {
                self.drain_stray_packets().await;
                return Err(e.context("session not acknowledged"));
            }
        };

        let ack = self.feedback.send(session.feedback_addr, FeedbackVerdict::SessionAck).await;
        if ack != FeedbackOutcome::Delivered(FeedbackVerdict::SessionAck) {
            if let Err(e) = recorder.discard() {
                warn!("could not remove the artifact of the unacknowledged session: {}", e);
            }
            self.drain_stray_packets().await;
            bail!("could not acknowledge the session to {:?}", session.feedback_addr);
        }

        let mut progress = SessionProgress::new(&session.init, self.config.stretch_threshold_us, self.config.stretch_scope);
        let total = session.total_packets();
        info!("session started: expecting {} packets", total);

        let mut buf = vec![0u8; self.config.transport.max_datagram_len];
        let mut socket_errors = SocketErrors::default();
        let mut timed_out = false;

        while !progress.is_complete() {
            let wait = if progress.train_in_progress() {
                self.config.train_gap_timeout
            }
            else {
                self.config.receive_timeout
            };

            let (num_read, from) = match timeout(wait, self.socket.recv_from(&mut buf)).await {
                Ok(Ok(x)) => {
                    socket_errors.on_success();
                    x
                }
                Ok(Err(e)) => {
                    socket_errors.on_error(e)?;
                    continue;
                }
                Err(_) if progress.train_in_progress() => {
                    debug!("no packet for {:?} - closing the train", wait);
                    progress.finish_train(&self.feedback, session.feedback_addr).await;
                    continue;
                }
                Err(_) => {
                    warn!("no packets for {:?} - ending the session", wait);
                    timed_out = true;
                    break;
                }
            };
            let arrival = PacketArrival::now(num_read);

            if from != session.peer {
                debug!("ignoring datagram from {:?}", from);
                continue;
            }

            let record = recorder.append(&arrival)?;
            trace!("packet #{}: {} bytes, delta {:?} µs", record.packet_number, num_read, record.delta_us);

            if progress.on_packet(&record) {
                progress.finish_train(&self.feedback, session.feedback_addr).await;
            }
        }

        if progress.train_in_progress() {
            progress.finish_train(&self.feedback, session.feedback_addr).await;
        }

        let recording = recorder.finalize()?;
        if progress.received() < total {
            warn!("received {} of {} packets", progress.received(), total);
        }
        else {
            info!("received all {} packets", total);
        }

        self.drain_stray_packets().await;
        Ok(progress.into_summary(&session, timed_out, recording.path))
    }

    /// Discards datagrams that are still in flight, e.g. late probes of a session that ended on
    ///  a timeout, so they are not taken for part of the next session
    async fn drain_stray_packets(&self) {
        let mut buf = vec![0u8; self.config.transport.max_datagram_len];
        let mut num_drained = 0;
        while let Ok(Ok(_)) = timeout(self.config.transport.drain_timeout, self.socket.recv_from(&mut buf)).await {
            num_drained += 1;
        }
        if num_drained > 0 {
            debug!("drained {} stray datagrams", num_drained);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receiver::recorder::read_artifact;
    use bytes::BytesMut;
    use transport::feedback::FeedbackListener;
    use transport::retry::RetryPolicy;

    fn loopback() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    /// plays the sender's part of the protocol by hand
    struct FakeSender {
        socket: UdpSocket,
        feedback: FeedbackListener,
        target: SocketAddr,
    }

    impl FakeSender {
        async fn new(target: SocketAddr) -> FakeSender {
            FakeSender {
                socket: UdpSocket::bind(loopback()).await.unwrap(),
                feedback: FeedbackListener::bind(loopback(), Duration::from_secs(2)).await.unwrap(),
                target,
            }
        }

        fn feedback_addr(&self) -> SocketAddr {
            self.feedback.local_addr().unwrap()
        }

        async fn send_raw(&self, payload: &[u8]) {
            self.socket.send_to(payload, self.target).await.unwrap();
        }

        async fn send_init(&self, num_trains: u32, packets_per_train: u32, label: &str) {
            let mut buf = BytesMut::new();
            InitMsg { num_trains, packets_per_train, label: label.to_string() }.ser(&mut buf);
            self.send_raw(&buf).await;
        }

        async fn send_probes(&self, n: u32, spacing: Duration) {
            for _ in 0..n {
                self.send_raw(&[0u8; 200]).await;
                tokio::time::sleep(spacing).await;
            }
        }

        async fn expect(&self, verdict: FeedbackVerdict) {
            assert_eq!(self.feedback.await_feedback().await, FeedbackOutcome::Delivered(verdict));
        }
    }

    fn receiver_config(results_dir: &std::path::Path) -> ReceiverConfig {
        let mut config = ReceiverConfig::new(loopback());
        config.results_dir = results_dir.to_path_buf();
        config.stretch_threshold_us = 1_000_000;
        config.train_gap_timeout = Duration::from_millis(600);
        config.receive_timeout = Duration::from_millis(1500);
        config.transport.feedback_timeout = Duration::from_millis(1000);
        config.transport.feedback_retry = RetryPolicy { max_attempts: 2, backoff: Duration::from_millis(10) };
        config
    }

    async fn receiver_with_fake_sender(config: ReceiverConfig) -> (Receiver, FakeSender) {
        let mut receiver = Receiver::new(config).await.unwrap();
        let sender = FakeSender::new(receiver.local_addr().unwrap()).await;
        receiver.set_feedback_addr(sender.feedback_addr());
        (receiver, sender)
    }

    #[tokio::test]
    async fn test_malformed_init_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let (mut receiver, sender) = receiver_with_fake_sender(receiver_config(dir.path())).await;
        let handle = tokio::spawn(async move { receiver.run_session().await });

        sender.send_raw(b"INIT:abc\n").await;
        sender.send_raw(b"INIT:1:3:a/b\n").await;
        sender.send_raw(b"INIT:1:3:..\n").await;
        sender.send_raw(&[0u8; 200]).await;
        sender.send_init(1, 3, "valid").await;
        sender.expect(FeedbackVerdict::SessionAck).await;

        sender.send_probes(3, Duration::from_millis(2)).await;
        sender.expect(FeedbackVerdict::TrainAccepted).await;

        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.label, "valid");
        assert_eq!(summary.received_packets, 3);
        assert_eq!(summary.train_verdicts, vec![FeedbackVerdict::TrainAccepted]);
        assert_eq!(read_artifact(&summary.artifact).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_irregular_arrivals_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = receiver_config(dir.path());
        config.stretch_threshold_us = 5_000;
        let (mut receiver, sender) = receiver_with_fake_sender(config).await;
        let handle = tokio::spawn(async move { receiver.run_session().await });

        sender.send_init(1, 3, "stretch").await;
        sender.expect(FeedbackVerdict::SessionAck).await;

        sender.send_raw(&[0u8; 200]).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        sender.send_raw(&[0u8; 200]).await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        sender.send_raw(&[0u8; 200]).await;
        sender.expect(FeedbackVerdict::TrainRejected).await;

        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.train_verdicts, vec![FeedbackVerdict::TrainRejected]);
    }

    #[tokio::test]
    async fn test_short_train_is_closed_after_gap() {
        let dir = tempfile::tempdir().unwrap();
        let (mut receiver, sender) = receiver_with_fake_sender(receiver_config(dir.path())).await;
        let handle = tokio::spawn(async move { receiver.run_session().await });

        sender.send_init(2, 4, "lossy").await;
        sender.expect(FeedbackVerdict::SessionAck).await;

        // half of the first train is lost
        sender.send_probes(2, Duration::from_millis(2)).await;
        sender.expect(FeedbackVerdict::TrainAccepted).await;

        sender.send_probes(4, Duration::from_millis(2)).await;
        sender.expect(FeedbackVerdict::TrainAccepted).await;

        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.expected_packets, 8);
        assert_eq!(summary.received_packets, 6);
        assert!(summary.is_short());
        assert_eq!(summary.train_verdicts.len(), 2);
        assert!(!summary.timed_out);
    }

    #[tokio::test]
    async fn test_silent_sender_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let (mut receiver, sender) = receiver_with_fake_sender(receiver_config(dir.path())).await;
        let handle = tokio::spawn(async move { receiver.run_session().await });

        sender.send_init(1, 3, "silent").await;
        sender.expect(FeedbackVerdict::SessionAck).await;

        let summary = handle.await.unwrap().unwrap();
        assert!(summary.timed_out);
        assert_eq!(summary.received_packets, 0);
        assert!(summary.train_verdicts.is_empty());
        assert!(read_artifact(&summary.artifact).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_feedback_endpoint_aborts_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut receiver = Receiver::new(receiver_config(dir.path())).await.unwrap();

        // a port that was just released - nobody listens there
        let closed = {
            let listener = tokio::net::TcpListener::bind(loopback()).await.unwrap();
            listener.local_addr().unwrap()
        };
        receiver.set_feedback_addr(closed);

        let sender = FakeSender::new(receiver.local_addr().unwrap()).await;
        let handle = tokio::spawn(async move { receiver.run_session().await });
        sender.send_init(1, 3, "noack").await;

        assert!(handle.await.unwrap().is_err());
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none(), "no artifact without a session");
    }

    #[tokio::test]
    async fn test_no_ack_if_artifact_cannot_be_created() {
        let dir = tempfile::tempdir().unwrap();
        let (mut receiver, sender) = receiver_with_fake_sender(receiver_config(&dir.path().join("missing"))).await;
        let handle = tokio::spawn(async move { receiver.run_session().await });

        sender.send_init(1, 3, "unrecordable").await;

        let err = handle.await.unwrap().unwrap_err();
        assert!(format!("{:#}", err).contains("not acknowledged"), "{:#}", err);
        assert_eq!(sender.feedback.await_feedback().await, FeedbackOutcome::TimedOut);
    }

    #[test]
    fn test_socket_errors_in_a_row() {
        let mut errors = SocketErrors::default();
        for _ in 1..MAX_CONSECUTIVE_SOCKET_ERRORS {
            errors.on_error(std::io::Error::from(std::io::ErrorKind::ConnectionReset)).unwrap();
        }
        errors.on_success();
        for _ in 1..MAX_CONSECUTIVE_SOCKET_ERRORS {
            errors.on_error(std::io::Error::from(std::io::ErrorKind::ConnectionReset)).unwrap();
        }
        assert!(errors.on_error(std::io::Error::from(std::io::ErrorKind::ConnectionReset)).is_err());
    }

    #[tokio::test]
    async fn test_loop_mode_serves_consecutive_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = receiver_config(dir.path());
        config.loop_forever = true;
        let (mut receiver, sender) = receiver_with_fake_sender(config).await;
        let stop = receiver.stop_handle();
        let handle = tokio::spawn(async move { receiver.run().await });

        sender.send_init(1, 2, "first").await;
        sender.expect(FeedbackVerdict::SessionAck).await;
        sender.send_probes(2, Duration::from_millis(2)).await;
        sender.expect(FeedbackVerdict::TrainAccepted).await;

        // late stragglers must not leak into the next session
        sender.send_probes(3, Duration::ZERO).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        sender.send_init(1, 2, "second").await;
        sender.expect(FeedbackVerdict::SessionAck).await;
        sender.send_probes(2, Duration::from_millis(2)).await;
        sender.expect(FeedbackVerdict::TrainAccepted).await;

        stop.store(true, Ordering::Release);
        let summaries = handle.await.unwrap().unwrap();

        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].label, "first");
        assert_eq!(summaries[1].label, "second");
        assert_eq!(summaries[1].received_packets, 2);

        let records = read_artifact(&summaries[1].artifact).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].delta_us.is_none());
    }

    #[tokio::test]
    async fn test_stop_before_any_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut receiver = Receiver::new(receiver_config(dir.path())).await.unwrap();
        receiver.stop_handle().store(true, Ordering::Release);

        assert!(receiver.run().await.unwrap().is_empty());
        assert!(receiver.run_session().await.is_err());
    }
}
