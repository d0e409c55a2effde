use std::time::Duration;
use anyhow::{anyhow, bail};
use tokio::time::{sleep_until, Instant};

/// Inter-packet spacing that makes `packet_size` byte packets add up to `rate_mbps`
pub fn spacing_for_rate(rate_mbps: f64, packet_size: usize) -> anyhow::Result<Duration> {
    if !(rate_mbps.is_finite() && rate_mbps > 0.0) {
        bail!("rate must be a positive number, was {}", rate_mbps);
    }

    let bytes_per_sec = rate_mbps * 1e6 / 8.0;
    Duration::try_from_secs_f64(packet_size as f64 / bytes_per_sec)
        .map_err(|e| anyhow!("no packet spacing for {} Mbps: {}", rate_mbps, e))
}

/// Schedules the packets of a single train at fixed offsets from the train's start
pub struct Pacer {
    start: Instant,
    spacing: Duration,
    spin_threshold: Duration,
}

impl Pacer {
    pub fn start(spacing: Duration, spin_threshold: Duration) -> Pacer {
        Pacer {
            start: Instant::now(),
            spacing,
            spin_threshold,
        }
    }

    /// Deadline for the packet with the given 0-based index within the train
    pub fn deadline(&self, packet_index: u32) -> Instant {
        self.start + self.spacing * packet_index
    }

    pub async fn wait_for_slot(&self, packet_index: u32) {
        let deadline = self.deadline(packet_index);
        loop {
            let now = Instant::now();
            if now >= deadline {
                return;
            }

            if deadline - now > self.spin_threshold {
                sleep_until(deadline - self.spin_threshold).await;
            }
            else {
                tokio::task::yield_now().await;
            }
        }
    }
}
