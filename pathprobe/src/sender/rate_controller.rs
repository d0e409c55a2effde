use anyhow::bail;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tracing::{info, warn};
use transport::control_messages::FeedbackVerdict;
use transport::feedback::FeedbackOutcome;

/// Number of bisection steps needed to narrow `[min_rate, max_rate]` down to `tolerance`. This
///  is announced to the receiver up front, and the controller runs exactly that many trains.
pub fn planned_trains(min_rate_mbps: f64, max_rate_mbps: f64, tolerance_mbps: f64) -> u32 {
    let ratio = (max_rate_mbps - min_rate_mbps) / tolerance_mbps;
    if !(ratio > 1.0) {
        return 0;
    }
    ratio.log2().ceil() as u32
}

/// The part of the sender that the binary search drives: send a train, then learn whether the
///  receiver accepted it
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TrainProber: Send {
    async fn send_train(&mut self, rate_mbps: f64) -> anyhow::Result<()>;

    async fn await_verdict(&mut self) -> FeedbackOutcome;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateInterval {
    pub low: f64,
    pub high: f64,
    /// highest rate confirmed so far not to cause congestion - `low` until a train is accepted
    pub best: f64,
}

impl RateInterval {
    pub fn new(min_rate_mbps: f64, max_rate_mbps: f64) -> RateInterval {
        RateInterval {
            low: min_rate_mbps,
            high: max_rate_mbps,
            best: min_rate_mbps,
        }
    }

    pub fn width(&self) -> f64 {
        self.high - self.low
    }

    pub fn mid(&self) -> f64 {
        (self.low + self.high) / 2.0
    }

    pub fn on_accepted(&mut self, rate: f64) {
        self.best = rate;
        self.low = rate;
    }

    pub fn on_rejected(&mut self, rate: f64) {
        self.high = rate;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateSearchReport {
    pub estimate_mbps: f64,
    pub interval: RateInterval,
    pub trains: u32,
    pub accepted: u32,
    pub rejected: u32,
}

pub struct RateController {
    interval: RateInterval,
    tolerance_mbps: f64,
    planned_trains: u32,
}

impl RateController {
    pub fn new(min_rate_mbps: f64, max_rate_mbps: f64, tolerance_mbps: f64) -> anyhow::Result<RateController> {
        if !(tolerance_mbps > 0.0) {
            bail!("tolerance must be positive");
        }
        if !(min_rate_mbps > 0.0 && max_rate_mbps >= min_rate_mbps) {
            bail!("invalid rate interval [{}, {}]", min_rate_mbps, max_rate_mbps);
        }

        Ok(RateController {
            interval: RateInterval::new(min_rate_mbps, max_rate_mbps),
            tolerance_mbps,
            planned_trains: planned_trains(min_rate_mbps, max_rate_mbps, tolerance_mbps),
        })
    }

    pub fn planned_trains(&self) -> u32 {
        self.planned_trains
    }

    pub fn interval(&self) -> RateInterval {
        self.interval
    }

    /// Runs the binary search to completion. Trains are strictly sequential: the next train is
    ///  only sent once the previous one has a verdict. Anything other than an explicit
    ///  acceptance counts as a rejection.
    pub async fn run<P: TrainProber>(&mut self, prober: &mut P) -> anyhow::Result<RateSearchReport> {
        let mut accepted = 0;
        let mut rejected = 0;

        for train in 1..=self.planned_trains {
            let rate = self.interval.mid();
            info!("train {}/{}: trying {:.2} Mbps", train, self.planned_trains, rate);
            prober.send_train(rate).await?;

            let is_accepted = match prober.await_verdict().await {
                FeedbackOutcome::Delivered(FeedbackVerdict::TrainAccepted) => {
                    info!("train {}: {:.2} Mbps accepted", train, rate);
                    true
                }
                FeedbackOutcome::Delivered(FeedbackVerdict::TrainRejected) => {
                    info!("train {}: {:.2} Mbps rejected", train, rate);
                    false
                }
                FeedbackOutcome::Delivered(FeedbackVerdict::SessionAck) => {
                    warn!("train {}: received a session ack instead of a verdict - treating as rejection", train);
                    false
                }
                FeedbackOutcome::TimedOut => {
                    warn!("train {}: no verdict received - treating as rejection", train);
                    false
                }
                FeedbackOutcome::ConnectionFailed => {
                    warn!("train {}: broken feedback connection - treating as rejection", train);
                    false
                }
            };

            if is_accepted {
                accepted += 1;
                self.interval.on_accepted(rate);
            }
            else {
                rejected += 1;
                self.interval.on_rejected(rate);
            }
        }

        if self.interval.width() > self.tolerance_mbps {
            warn!("rate interval {:?} still wider than tolerance {} after {} trains", self.interval, self.tolerance_mbps, self.planned_trains);
        }

        Ok(RateSearchReport {
            estimate_mbps: self.interval.best,
            interval: self.interval,
            trains: self.planned_trains,
            accepted,
            rejected,
        })
    }
}
