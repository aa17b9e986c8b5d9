//! Lossy channel for exercising the reliability mechanisms.
//!
//! Real networks drop, corrupt and reorder packets.  To exercise the
//! protocols without depending on actual network conditions, a
//! [`Simulator`] can be installed on a [`crate::socket::Socket`]'s outbound
//! path.  Each datagram independently goes through this fault model:
//!
//! | Fault       | Description                                              |
//! |-------------|----------------------------------------------------------|
//! | Loss        | Dropped with probability `loss_rate`.                    |
//! | Corruption  | Otherwise, with probability `corrupt_rate`, 1..=5 random |
//! |             | bytes are XOR-ed with `0xFF`.                            |
//! | Delay       | Delivered after a uniform delay drawn from `delay_range`;|
//! |             | a slow datagram may be overtaken (reordering).           |
//!
//! Datagram boundaries are always preserved.  Pass a `seed` to make a run
//! reproducible.

use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::net::UdpSocket;

use crate::stats::ChannelStats;

/// Most bytes flipped in one corrupted datagram.
const MAX_CORRUPT_BYTES: usize = 5;

/// Configuration for the fault-injection model.
///
/// All probabilities are in the range `[0.0, 1.0]`.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Probability that any given datagram is silently dropped.
    pub loss_rate: f64,
    /// Probability that a surviving datagram has bytes flipped.
    pub corrupt_rate: f64,
    /// Uniform one-way delay bounds.
    pub delay_range: RangeInclusive<Duration>,
    /// RNG seed; `None` seeds from the OS.
    pub seed: Option<u64>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        // No faults by default; the simulator is a transparent pass-through.
        Self {
            loss_rate: 0.0,
            corrupt_rate: 0.0,
            delay_range: Duration::ZERO..=Duration::ZERO,
            seed: None,
        }
    }
}

impl SimulatorConfig {
    pub fn loss_rate(mut self, p: f64) -> Self {
        self.loss_rate = p.clamp(0.0, 1.0);
        self
    }

    pub fn corrupt_rate(mut self, p: f64) -> Self {
        self.corrupt_rate = p.clamp(0.0, 1.0);
        self
    }

    pub fn delay_range(mut self, range: RangeInclusive<Duration>) -> Self {
        self.delay_range = range;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

/// What the fault model decided for one datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Fate {
    Drop,
    Deliver { bytes: Vec<u8>, delay: Duration },
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

/// A fault-injecting outbound channel.  Share it between sockets with `Arc`.
pub struct Simulator {
    config: SimulatorConfig,
    rng: Mutex<StdRng>,
    sent: AtomicU64,
    lost: AtomicU64,
    corrupted: AtomicU64,
}

impl std::fmt::Debug for Simulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulator")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Simulator {
    pub fn new(config: SimulatorConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            config,
            rng: Mutex::new(rng),
            sent: AtomicU64::new(0),
            lost: AtomicU64::new(0),
            corrupted: AtomicU64::new(0),
        }
    }

    /// Convenience for `Arc::new(Simulator::new(config))`.
    pub fn shared(config: SimulatorConfig) -> Arc<Self> {
        Arc::new(Self::new(config))
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    /// Apply the fault model to `bytes` and, unless dropped, send the result
    /// through `socket` to `dest` (immediately, or from a delayed task).
    pub async fn transmit(
        &self,
        socket: &Arc<UdpSocket>,
        bytes: &[u8],
        dest: SocketAddr,
    ) -> std::io::Result<()> {
        match self.decide(bytes) {
            Fate::Drop => Ok(()),
            Fate::Deliver { bytes, delay } if delay.is_zero() => {
                socket.send_to(&bytes, dest).await.map(|_| ())
            }
            Fate::Deliver { bytes, delay } => {
                let socket = Arc::clone(socket);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(e) = socket.send_to(&bytes, dest).await {
                        log::debug!("[sim] delayed send to {dest} failed: {e}");
                    }
                });
                Ok(())
            }
        }
    }

    fn decide(&self, bytes: &[u8]) -> Fate {
        self.sent.fetch_add(1, Ordering::Relaxed);
        // A poisoned RNG is still a usable RNG.
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());

        if rng.random_bool(self.config.loss_rate.clamp(0.0, 1.0)) {
            self.lost.fetch_add(1, Ordering::Relaxed);
            log::debug!("[sim] dropped {} bytes", bytes.len());
            return Fate::Drop;
        }

        let mut out = bytes.to_vec();
        if !out.is_empty() && rng.random_bool(self.config.corrupt_rate.clamp(0.0, 1.0)) {
            let flips = rng.random_range(1..=MAX_CORRUPT_BYTES.min(out.len()));
            for _ in 0..flips {
                let pos = rng.random_range(0..out.len());
                out[pos] ^= 0xFF;
            }
            self.corrupted.fetch_add(1, Ordering::Relaxed);
            log::debug!("[sim] corrupted {flips} byte(s) of {}", out.len());
        }

        let (lo, hi) = (*self.config.delay_range.start(), *self.config.delay_range.end());
        let delay = if hi > lo {
            Duration::from_secs_f64(rng.random_range(lo.as_secs_f64()..=hi.as_secs_f64()))
        } else {
            lo
        };

        Fate::Deliver { bytes: out, delay }
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            sent: self.sent.load(Ordering::Relaxed),
            lost: self.lost.load(Ordering::Relaxed),
            corrupted: self.corrupted.load(Ordering::Relaxed),
        }
    }

    pub fn reset_stats(&self) {
        self.sent.store(0, Ordering::Relaxed);
        self.lost.store(0, Ordering::Relaxed);
        self.corrupted.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pass_through_by_default() {
        let sim = Simulator::new(SimulatorConfig::default().seed(1));
        for _ in 0..50 {
            assert_eq!(
                sim.decide(b"abc"),
                Fate::Deliver {
                    bytes: b"abc".to_vec(),
                    delay: Duration::ZERO
                }
            );
        }
        assert_eq!(sim.stats().sent, 50);
        assert_eq!(sim.stats().lost, 0);
    }

    #[test]
    fn full_loss_drops_everything() {
        let sim = Simulator::new(SimulatorConfig::default().loss_rate(1.0).seed(2));
        for _ in 0..10 {
            assert_eq!(sim.decide(b"x"), Fate::Drop);
        }
        assert_eq!(sim.stats().loss_rate(), 1.0);
    }

    #[test]
    fn corruption_flips_between_one_and_five_bytes() {
        let sim = Simulator::new(SimulatorConfig::default().corrupt_rate(1.0).seed(3));
        let original = vec![0u8; 64];
        for _ in 0..100 {
            let Fate::Deliver { bytes, .. } = sim.decide(&original) else {
                panic!("unexpected drop");
            };
            assert_eq!(bytes.len(), original.len());
            let changed = bytes.iter().filter(|b| **b != 0).count();
            // The same position may be flipped twice and cancel out.
            assert!(changed <= MAX_CORRUPT_BYTES);
        }
        assert_eq!(sim.stats().corrupted, 100);
    }

    #[test]
    fn delay_drawn_from_range() {
        let lo = Duration::from_millis(5);
        let hi = Duration::from_millis(15);
        let sim = Simulator::new(SimulatorConfig::default().delay_range(lo..=hi).seed(4));
        for _ in 0..50 {
            let Fate::Deliver { delay, .. } = sim.decide(b"d") else {
                panic!("unexpected drop");
            };
            assert!(delay >= lo && delay <= hi, "{delay:?}");
        }
    }

    #[test]
    fn seeded_runs_are_reproducible() {
        let cfg = SimulatorConfig::default().loss_rate(0.3).corrupt_rate(0.3).seed(99);
        let a = Simulator::new(cfg.clone());
        let b = Simulator::new(cfg);
        for i in 0..200u32 {
            let bytes = i.to_be_bytes();
            assert_eq!(a.decide(&bytes), b.decide(&bytes));
        }
    }

    #[test]
    fn observed_loss_rate_tracks_configuration() {
        let sim = Simulator::new(SimulatorConfig::default().loss_rate(0.2).seed(7));
        for _ in 0..5000 {
            sim.decide(b"p");
        }
        let rate = sim.stats().loss_rate();
        assert!((0.15..0.25).contains(&rate), "{rate}");
        sim.reset_stats();
        assert_eq!(sim.stats(), ChannelStats::default());
    }
}
