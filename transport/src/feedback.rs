//! The feedback channel carries the receiver's decisions back to the sender. Each message is a
//!  connection of its own: the receiver connects to the sender's feedback endpoint, writes a
//!  single token and closes the connection.

use crate::config::TransportConfig;
use crate::control_messages::{FeedbackVerdict, MAX_FEEDBACK_MSG_LEN};
use crate::retry::{RetryOutcome, RetryPolicy};
use crate::safe_converter::SafeCast;
use crate::socket::bind_tcp_listener;
use anyhow::anyhow;
use async_trait::async_trait;
use bytes::BytesMut;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

/// Result of a single feedback exchange, seen from either side of the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackOutcome {
    Delivered(FeedbackVerdict),
    /// Nothing arrived within the configured wait
    TimedOut,
    /// The connection could not be established (sending side, after all retries), or it did
    ///  not carry a valid token (listening side)
    ConnectionFailed,
}

/// This is an abstraction for pushing a control message through a fresh connection, introduced
///  to facilitate mocking the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ControlConnector: Send + Sync + 'static {
    async fn send_control_message(&self, to: SocketAddr, msg: &[u8]) -> anyhow::Result<()>;
}

pub struct TcpControlConnector {
    connect_timeout: Duration,
}

impl TcpControlConnector {
    pub fn new(connect_timeout: Duration) -> TcpControlConnector {
        TcpControlConnector { connect_timeout }
    }
}

#[async_trait]
impl ControlConnector for TcpControlConnector {
    async fn send_control_message(&self, to: SocketAddr, msg: &[u8]) -> anyhow::Result<()> {
        let mut stream = timeout(self.connect_timeout, TcpStream::connect(to)).await
            .map_err(|_| anyhow!("timed out connecting to {:?}", to))??;

        stream.write_all(msg).await?;
        stream.shutdown().await?;
        Ok(())
    }
}

/// The receiver's end of the feedback channel
pub struct FeedbackSender<C: ControlConnector> {
    connector: C,
    retry: RetryPolicy,
}

impl FeedbackSender<TcpControlConnector> {
    pub fn from_config(config: &TransportConfig) -> FeedbackSender<TcpControlConnector> {
        FeedbackSender::new(TcpControlConnector::new(config.connect_timeout), config.feedback_retry)
    }
}

impl <C: ControlConnector> FeedbackSender<C> {
    pub fn new(connector: C, retry: RetryPolicy) -> FeedbackSender<C> {
        FeedbackSender { connector, retry }
    }

    /// Returns [`FeedbackOutcome::Delivered`] or, once the retry policy is exhausted,
    ///  [`FeedbackOutcome::ConnectionFailed`]. It is up to the caller whether that is fatal.
    #[instrument(level = "debug", skip(self))]
    pub async fn send(&self, to: SocketAddr, verdict: FeedbackVerdict) -> FeedbackOutcome {
        let mut buf = BytesMut::with_capacity(MAX_FEEDBACK_MSG_LEN);
        verdict.ser(&mut buf);

        let outcome = self.retry.run(
            &format!("sending {} to {:?}", verdict, to),
            |_| self.connector.send_control_message(to, &buf),
        ).await;

        match outcome {
            RetryOutcome::Succeeded { attempts, .. } => {
                debug!("delivered {} after {} attempt(s)", verdict, attempts);
                FeedbackOutcome::Delivered(verdict)
            }
            RetryOutcome::Exhausted { attempts, last_error } => {
                warn!("giving up delivering {} to {:?} after {} attempts: {}", verdict, to, attempts, last_error);
                FeedbackOutcome::ConnectionFailed
            }
        }
    }
}

/// The sender's end of the feedback channel. It is bound once and owned for the whole run, so
///  a receiver that answers quickly never hits a closed port.
pub struct FeedbackListener {
    listener: TcpListener,
    wait_timeout: Duration,
}

impl FeedbackListener {
    pub async fn bind(addr: SocketAddr, wait_timeout: Duration) -> anyhow::Result<FeedbackListener> {
        let listener = bind_tcp_listener(addr)?;
        info!("feedback listener bound to {:?}", listener.local_addr()?);
        Ok(FeedbackListener {
            listener,
            wait_timeout,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Waits for the next feedback connection and reads its token. This never fails: a missing
    ///  or garbled message is reported as an outcome for the caller to decide on.
    pub async fn await_feedback(&self) -> FeedbackOutcome {
        match timeout(self.wait_timeout, self.read_next()).await {
            Err(_) => {
                debug!("no feedback within {:?}", self.wait_timeout);
                FeedbackOutcome::TimedOut
            }
            Ok(Ok(verdict)) => FeedbackOutcome::Delivered(verdict),
            Ok(Err(e)) => {
                warn!("feedback connection did not deliver a valid message: {}", e);
                FeedbackOutcome::ConnectionFailed
            }
        }
    }

    async fn read_next(&self) -> anyhow::Result<FeedbackVerdict> {
        let (stream, from) = self.listener.accept().await?;
        debug!("feedback connection from {:?}", from);

        let mut buf = Vec::with_capacity(MAX_FEEDBACK_MSG_LEN);
        stream.take(MAX_FEEDBACK_MSG_LEN.safe_cast())
            .read_to_end(&mut buf)
            .await?;

        FeedbackVerdict::deser(&buf)
    }
}
