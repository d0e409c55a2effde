use crate::config::StretchScope;
use transport::control_messages::FeedbackVerdict;

/// `true` if no two adjacent deltas differ by more than `threshold_us`. Fewer than two deltas
///  leave nothing to compare and count as uniform.
pub fn is_uniform(deltas_us: &[u64], threshold_us: u64) -> bool {
    deltas_us.windows(2)
        .all(|w| w[1].abs_diff(w[0]) <= threshold_us)
}

/// Classifies trains by the jitter of their inter-arrival deltas. Queueing on a path that is
///  driven above its capacity stretches the gaps between packets unevenly, while a rate within
///  capacity keeps them close to the sender's spacing.
///
/// Only deltas between packets of the same train are fed in. With [`StretchScope::Session`] they
///  accumulate over the whole session, so stretch seen in an earlier train also fails every
///  later one.
pub struct StretchDetector {
    threshold_us: u64,
    scope: StretchScope,
    deltas_us: Vec<u64>,
    /// index into `deltas_us` where the current train starts
    train_start: usize,
}

impl StretchDetector {
    pub fn new(threshold_us: u64, scope: StretchScope) -> StretchDetector {
        StretchDetector {
            threshold_us,
            scope,
            deltas_us: Vec::new(),
            train_start: 0,
        }
    }

    pub fn on_delta(&mut self, delta_us: u64) {
        self.deltas_us.push(delta_us);
    }

    /// deltas that the next verdict is based on
    pub fn deltas_in_scope(&self) -> &[u64] {
        match self.scope {
            StretchScope::Session => &self.deltas_us,
            StretchScope::Train => &self.deltas_us[self.train_start..],
        }
    }

    pub fn verdict(&self) -> FeedbackVerdict {
        FeedbackVerdict::for_train(is_uniform(self.deltas_in_scope(), self.threshold_us))
    }

    /// Closes the current train: returns its verdict and starts a new train
    pub fn finish_train(&mut self) -> FeedbackVerdict {
        let verdict = self.verdict();
        self.train_start = self.deltas_us.len();
        verdict
    }
}
