//! End-to-end available bandwidth estimation between two hosts.
//!
//! The [`sender::Sender`] announces a session to the [`receiver::Receiver`] and then probes the
//!  path with trains of equally spaced UDP datagrams, one train per candidate rate. The receiver
//!  records every arrival and answers each train with a verdict: if the gaps between packets
//!  stayed uniform, the path kept up with the rate, and the next candidate is higher. If they
//!  were stretched, the rate exceeded the path's capacity, and the next candidate is lower. The
//!  binary search over rates converges on the estimate.

pub mod config;
pub mod receiver;
pub mod sender;
