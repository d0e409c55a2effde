use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use transport::pacing::{spacing_for_rate, Pacer};
use transport::send_socket::SendSocket;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrainStats {
    pub spacing: Duration,
    pub sent: u32,
    pub send_errors: u32,
    pub elapsed: Duration,
}

/// Emits bursts of zero-filled datagrams at a given rate. Nothing is acknowledged, and a
///  failed send is counted and otherwise treated like a lost packet.
pub struct TrainTransmitter<S: SendSocket> {
    socket: S,
    destination: SocketAddr,
    payload: Vec<u8>,
    packets_per_train: u32,
    spin_threshold: Duration,
}

impl <S: SendSocket> TrainTransmitter<S> {
    pub fn new(socket: S, destination: SocketAddr, packet_size: usize, packets_per_train: u32, spin_threshold: Duration) -> TrainTransmitter<S> {
        TrainTransmitter {
            socket,
            destination,
            payload: vec![0u8; packet_size],
            packets_per_train,
            spin_threshold,
        }
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn send_train(&self, rate_mbps: f64) -> anyhow::Result<TrainStats> {
        let spacing = spacing_for_rate(rate_mbps, self.payload.len())?;
        debug!("spacing {:.1} µs for {} packets of {} bytes", spacing.as_secs_f64() * 1e6, self.packets_per_train, self.payload.len());

        let pacer = Pacer::start(spacing, self.spin_threshold);
        let mut send_errors = 0;
        for packet_index in 0..self.packets_per_train {
            pacer.wait_for_slot(packet_index).await;
            if let Err(e) = self.socket.do_send_packet(self.destination, &self.payload).await {
                send_errors += 1;
                debug!("sending probe {} failed: {}", packet_index, e);
            }
        }
        let elapsed = pacer.deadline(0).elapsed();

        if send_errors > 0 {
            warn!("{} of {} probes could not be sent", send_errors, self.packets_per_train);
        }

        Ok(TrainStats {
            spacing,
            sent: self.packets_per_train - send_errors,
            send_errors,
            elapsed,
        })
    }
}
