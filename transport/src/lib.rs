//! Wire level of the path probing protocol: everything that touches a socket or a byte buffer.
//!
//! The protocol runs over two transports with very different guarantees:
//!
//! * **UDP** carries the data plane. The sender opens a session with a single `INIT` datagram
//!    and then sends *trains* of fixed-size, zero-filled probe datagrams at a controlled rate.
//!    Nothing on this transport is acknowledged or retransmitted: loss of a probe is tolerated,
//!    and loss of the `INIT` datagram surfaces as a missing session ack on the sender side.
//! * **TCP** carries the feedback channel. Every control event (session ack, train accepted,
//!    train rejected) is a short-lived connection from receiver to sender that transports a
//!    single newline-terminated token and is then closed. Connection failures are retried
//!    according to a [`retry::RetryPolicy`].
//!
//! ## Control messages
//!
//! ```ascii
//! sender -> receiver (UDP):  INIT:<num_trains>:<packets_per_train>:<label>\n
//! receiver -> sender (TCP):  ACK\n | OK\n | FAIL\n
//! ```
//!
//! Probe datagrams have no header - the receiver only looks at their size and arrival time.
//!
//! ## Pacing
//!
//! Sending at a given rate means spacing packets `packet_size / bytes_per_second` apart. The
//!  [`pacing::Pacer`] schedules packets at absolute deadlines so that oversleeping for one
//!  packet does not shift all following packets. There is no hardware timestamping, and rate
//!  fidelity is bounded by timer granularity - sub-millisecond gaps are waited out by yielding
//!  to the runtime rather than by the timer wheel.

pub mod config;
pub mod control_messages;
pub mod feedback;
pub mod pacing;
pub mod retry;
pub mod safe_converter;
pub mod send_socket;
pub mod socket;
