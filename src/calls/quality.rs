//! Link quality classification.

use crate::types::call::ConnectionQuality;

use super::peer::LinkStats;

fn classify_loss(loss_ratio: f64) -> ConnectionQuality {
    if loss_ratio > 0.10 {
        ConnectionQuality::Poor
    } else if loss_ratio > 0.05 {
        ConnectionQuality::Fair
    } else if loss_ratio > 0.02 {
        ConnectionQuality::Good
    } else {
        ConnectionQuality::Excellent
    }
}

fn classify_rtt(rtt_ms: f64) -> ConnectionQuality {
    if rtt_ms > 300.0 {
        ConnectionQuality::Poor
    } else if rtt_ms > 150.0 {
        ConnectionQuality::Fair
    } else if rtt_ms > 100.0 {
        ConnectionQuality::Good
    } else {
        ConnectionQuality::Excellent
    }
}

/// Classify loss and RTT independently and keep the worse verdict.
pub fn classify(loss_ratio: f64, rtt_ms: f64) -> ConnectionQuality {
    classify_loss(loss_ratio).max(classify_rtt(rtt_ms))
}

pub fn classify_stats(stats: &LinkStats) -> ConnectionQuality {
    classify(stats.loss_ratio(), stats.rtt_ms())
}
