use crate::config::StretchScope;
use crate::receiver::recorder::PacketRecord;
use crate::receiver::stretch::StretchDetector;
use chrono::{DateTime, Local};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{info, warn};
use transport::control_messages::{FeedbackVerdict, InitMsg};
use transport::feedback::{ControlConnector, FeedbackOutcome, FeedbackSender};
use transport::safe_converter::PrecheckedCast;

/// One probing run as announced by the sender's INIT datagram
#[derive(Debug, Clone)]
pub struct Session {
    pub init: InitMsg,
    /// source of the INIT datagram - probes from any other address are ignored
    pub peer: SocketAddr,
    pub feedback_addr: SocketAddr,
    pub created_at: DateTime<Local>,
}

impl Session {
    pub fn label(&self) -> &str {
        &self.init.label
    }

    pub fn total_packets(&self) -> u64 {
        self.init.total_packets()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub label: String,
    pub expected_packets: u64,
    pub received_packets: u64,
    pub train_verdicts: Vec<FeedbackVerdict>,
    /// verdicts that could not be delivered - the sender counts them as rejections
    pub undelivered_verdicts: u32,
    /// the session ended because no packet arrived within the receive timeout
    pub timed_out: bool,
    pub artifact: PathBuf,
}

impl SessionSummary {
    /// some probes were lost, or the session ended on a timeout
    pub fn is_short(&self) -> bool {
        self.received_packets < self.expected_packets
    }
}

/// Mutable per-session state of the receive loop: packet counts, train boundaries and the
///  stretch detector. It is created for a single session and dropped with it, so nothing
///  carries over into the next session.
pub struct SessionProgress {
    packets_per_train: u32,
    num_trains: u32,
    received: u64,
    packets_in_train: u32,
    stretch: StretchDetector,
    verdicts: Vec<FeedbackVerdict>,
    undelivered: u32,
}

impl SessionProgress {
    pub fn new(init: &InitMsg, stretch_threshold_us: u64, stretch_scope: StretchScope) -> SessionProgress {
        SessionProgress {
            packets_per_train: init.packets_per_train,
            num_trains: init.num_trains,
            received: 0,
            packets_in_train: 0,
            stretch: StretchDetector::new(stretch_threshold_us, stretch_scope),
            verdicts: Vec::new(),
            undelivered: 0,
        }
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn train_in_progress(&self) -> bool {
        self.packets_in_train > 0
    }

    pub fn trains_finished(&self) -> u32 {
        self.verdicts.len().prechecked_cast()
    }

    /// The session is over once all announced packets arrived, or all announced trains were
    ///  closed (some of them possibly short after a gap timeout)
    pub fn is_complete(&self) -> bool {
        self.received >= self.num_trains as u64 * self.packets_per_train as u64
            || self.trains_finished() >= self.num_trains
    }

    /// Registers a received packet. Returns `true` if it completes the current train.
    ///
    /// The delta to the last packet of the previous train spans the feedback round trip and is
    ///  not passed on to the stretch detector.
    pub fn on_packet(&mut self, record: &PacketRecord) -> bool {
        self.received += 1;
        if self.train_in_progress() {
            if let Some(delta_us) = record.delta_us {
                self.stretch.on_delta(delta_us);
            }
        }
        self.packets_in_train += 1;
        self.packets_in_train >= self.packets_per_train
    }

    /// Closes the current train and reports its verdict to the sender
    pub async fn finish_train<C: ControlConnector>(&mut self, feedback: &FeedbackSender<C>, feedback_addr: SocketAddr) -> FeedbackVerdict {
        let train = self.trains_finished() + 1;
        if self.packets_in_train < self.packets_per_train {
            warn!("train {}: only {} of {} packets received", train, self.packets_in_train, self.packets_per_train);
        }

        let verdict = self.stretch.finish_train();
        info!("train {}: {} ({} packets)", train, verdict, self.packets_in_train);
        self.packets_in_train = 0;
        self.verdicts.push(verdict);

        if feedback.send(feedback_addr, verdict).await != FeedbackOutcome::Delivered(verdict) {
            warn!("train {}: verdict {} could not be delivered", train, verdict);
            self.undelivered += 1;
        }
        verdict
    }

    pub fn into_summary(self, session: &Session, timed_out: bool, artifact: PathBuf) -> SessionSummary {
        SessionSummary {
            label: session.label().to_string(),
            expected_packets: session.total_packets(),
            received_packets: self.received,
            train_verdicts: self.verdicts,
            undelivered_verdicts: self.undelivered,
            timed_out,
            artifact,
        }
    }
}
