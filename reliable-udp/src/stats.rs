//! Transfer counters exposed by the engines and the lossy channel.

use std::time::Duration;

/// Counters kept by a GBN or SR sender.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SenderStats {
    /// Every DATA frame put on the wire, first transmissions and resends.
    pub frames_sent: u64,
    pub retransmissions: u64,
    pub timeouts: u64,
    /// Payload bytes of first transmissions only.
    pub bytes_sent: u64,
    /// Time from the first `send` to the last acknowledgment.
    pub elapsed: Duration,
}

impl SenderStats {
    /// Payload bytes per second over [`SenderStats::elapsed`].
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes_sent as f64 / secs
        } else {
            0.0
        }
    }
}

/// Counters kept by a GBN or SR receiver.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiverStats {
    pub frames_received: u64,
    /// Intact frames that were not delivered (out of order, duplicate, out
    /// of window).
    pub discarded: u64,
    pub corrupted: u64,
    pub delivered: u64,
    pub acks_sent: u64,
}

/// Counters kept by [`crate::simulator::Simulator`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelStats {
    pub sent: u64,
    pub lost: u64,
    pub corrupted: u64,
}

impl ChannelStats {
    pub fn loss_rate(&self) -> f64 {
        ratio(self.lost, self.sent)
    }

    pub fn corrupt_rate(&self) -> f64 {
        ratio(self.corrupted, self.sent)
    }
}

fn ratio(n: u64, d: u64) -> f64 {
    if d == 0 {
        0.0
    } else {
        n as f64 / d as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throughput_zero_without_elapsed_time() {
        let s = SenderStats {
            bytes_sent: 100,
            ..Default::default()
        };
        assert_eq!(s.throughput(), 0.0);
    }

    #[test]
    fn throughput_per_second() {
        let s = SenderStats {
            bytes_sent: 1000,
            elapsed: Duration::from_millis(500),
            ..Default::default()
        };
        assert!((s.throughput() - 2000.0).abs() < 1e-9);
    }

    #[test]
    fn channel_rates() {
        let s = ChannelStats {
            sent: 10,
            lost: 2,
            corrupted: 1,
        };
        assert!((s.loss_rate() - 0.2).abs() < 1e-9);
        assert!((s.corrupt_rate() - 0.1).abs() < 1e-9);
        assert_eq!(ChannelStats::default().loss_rate(), 0.0);
    }
}
