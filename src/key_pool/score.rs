//! Health-score weighting for upstream key selection.

/// Weights applied to each usage dimension's remaining-capacity ratio.
/// Daily counters dominate because exhausting a day-scoped quota is far
/// more costly than a transient minute-scoped throttle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreWeights {
    pub rpd: f64,
    pub tpd: f64,
    pub rpm: f64,
    pub tpm: f64,
}

pub fn score_weights_default() -> ScoreWeights {
    ScoreWeights {
        rpd: 0.4,
        tpd: 0.3,
        rpm: 0.15,
        tpm: 0.15,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_weights_sum_to_one() {
        let w = score_weights_default();
        assert!((w.rpd + w.tpd + w.rpm + w.tpm - 1.0).abs() < 1e-9);
    }
}
