use std::fmt::{Display, Formatter};
use anyhow::{anyhow, bail};
use bytes::BufMut;

/// Session labels default to this if the INIT message does not carry one
pub const DEFAULT_SESSION_LABEL: &str = "session";

/// Upper bound for a feedback message on the wire, including the trailing newline
pub const MAX_FEEDBACK_MSG_LEN: usize = 16;

/// The datagram that opens a session: it announces how many trains of how many packets the
///  receiver should expect, and a label that ends up in the name of the session artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitMsg {
    pub num_trains: u32,
    pub packets_per_train: u32,
    pub label: String,
}

impl InitMsg {
    pub const PREFIX: &'static [u8] = b"INIT:";

    pub fn is_init(buf: &[u8]) -> bool {
        buf.starts_with(Self::PREFIX)
    }

    pub fn total_packets(&self) -> u64 {
        self.num_trains as u64 * self.packets_per_train as u64
    }

    /// The label becomes part of a file name on the receiver, so it must not reach outside the
    ///  results directory
    pub fn validate_label(label: &str) -> anyhow::Result<()> {
        if label.contains(':') || label.contains('\n') {
            bail!("session label {:?} must not contain ':' or newlines", label);
        }
        if label.contains('/') || label.contains('\\') || label.contains("..") {
            bail!("session label {:?} must not contain path separators or '..'", label);
        }
        Ok(())
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(format!("INIT:{}:{}:{}\n", self.num_trains, self.packets_per_train, self.label).as_bytes());
    }

    pub fn deser(buf: &[u8]) -> anyhow::Result<InitMsg> {
        if !Self::is_init(buf) {
            bail!("not an INIT message");
        }

        let text = std::str::from_utf8(buf)?
            .trim_end();

        let mut parts = text.splitn(4, ':')
            .skip(1);

        let num_trains = parts.next()
            .ok_or_else(|| anyhow!("INIT message without number of trains"))?
            .parse::<u32>()?;
        let packets_per_train = parts.next()
            .ok_or_else(|| anyhow!("INIT message without packets per train"))?
            .parse::<u32>()?;
        let label = match parts.next() {
            Some(l) if !l.is_empty() => l.to_string(),
            _ => DEFAULT_SESSION_LABEL.to_string(),
        };
        Self::validate_label(&label)?;

        Ok(InitMsg {
            num_trains,
            packets_per_train,
            label,
        })
    }
}

/// Everything the receiver tells the sender over the feedback channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackVerdict {
    SessionAck,
    TrainAccepted,
    TrainRejected,
}

impl FeedbackVerdict {
    pub fn for_train(accepted: bool) -> FeedbackVerdict {
        if accepted {
            FeedbackVerdict::TrainAccepted
        }
        else {
            FeedbackVerdict::TrainRejected
        }
    }

    pub fn token(&self) -> &'static str {
        match self {
            FeedbackVerdict::SessionAck => "ACK",
            FeedbackVerdict::TrainAccepted => "OK",
            FeedbackVerdict::TrainRejected => "FAIL",
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(self.token().as_bytes());
        buf.put_u8(b'\n');
    }

    pub fn deser(buf: &[u8]) -> anyhow::Result<FeedbackVerdict> {
        match std::str::from_utf8(buf)?.trim() {
            "ACK" => Ok(FeedbackVerdict::SessionAck),
            "OK" => Ok(FeedbackVerdict::TrainAccepted),
            "FAIL" => Ok(FeedbackVerdict::TrainRejected),
            other => Err(anyhow!("unknown feedback token {:?}", other)),
        }
    }
}

impl Display for FeedbackVerdict {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.token())
    }
}
