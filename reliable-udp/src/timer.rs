//! Retransmission timers and RTO estimation.
//!
//! This module provides:
//! - [`Timer`]: a cancel-and-rearm one-shot timer backed by a tokio task.
//!   Engines keep it inside their mutex-guarded state so that arming,
//!   cancelling and firing are all serialised by the same lock.
//! - [`RtoEstimator`]: smoothed RTT / RTT variance tracking with the RTO
//!   derived as `SRTT + 4 × RTTVAR`, clamped to configured bounds.
//!
//! # Firing protocol
//!
//! ```text
//!  arm(d, f) ──▶ spawn { sleep(d); f(gen) }
//!                                   │
//!                                   ▼
//!                     lock state; timer.fire(gen)?
//!                       ├─ false: stale (cancelled/rearmed), do nothing
//!                       └─ true:  act, maybe arm() again
//! ```
//!
//! Every `arm` and `cancel` bumps a generation counter, so a callback that
//! woke up just as the timer was cancelled sees a stale generation and
//! returns without touching state.  Cancelling a timer that already fired is
//! a no-op.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::task::JoinHandle;

/// Boxed future returned by timer callbacks.
///
/// Callbacks that re-arm their own timer must name their return type, which
/// is why engines use this alias instead of `impl Future`.
pub type TimerFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

// ---------------------------------------------------------------------------
// Timer
// ---------------------------------------------------------------------------

/// A one-shot timer that can be re-armed or cancelled at any time.
#[derive(Debug, Default)]
pub struct Timer {
    handle: Option<JoinHandle<()>>,
    generation: u64,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer to run `on_fire` after `delay`, replacing any pending
    /// expiry.  `on_fire` receives the generation to present to [`fire`].
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// [`fire`]: Timer::fire
    pub fn arm<F, Fut>(&mut self, delay: Duration, on_fire: F)
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.abort();
        self.generation = self.generation.wrapping_add(1);
        let gen = self.generation;
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            on_fire(gen).await;
        }));
    }

    /// Cancel any pending expiry.
    pub fn cancel(&mut self) {
        self.abort();
        self.generation = self.generation.wrapping_add(1);
    }

    /// Claim an expiry.  Called by the callback while holding the state lock.
    ///
    /// Returns `true` when `gen` is still current; the timer is then disarmed
    /// (without aborting the caller's own task) and may be re-armed.
    pub fn fire(&mut self, gen: u64) -> bool {
        if gen != self.generation || self.handle.is_none() {
            return false;
        }
        self.handle = None;
        true
    }

    /// `true` while an expiry is pending.
    pub fn is_armed(&self) -> bool {
        self.handle.is_some()
    }

    fn abort(&mut self) {
        if let Some(h) = self.handle.take() {
            h.abort();
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.abort();
    }
}

// ---------------------------------------------------------------------------
// RtoEstimator
// ---------------------------------------------------------------------------

/// Adaptive retransmission-timeout estimator.
#[derive(Debug, Clone)]
pub struct RtoEstimator {
    srtt: Option<Duration>,
    rttvar: Duration,
    rto: Duration,
    min_rto: Duration,
    max_rto: Duration,
}

impl RtoEstimator {
    /// `initial` is used until the first sample arrives.
    pub fn new(initial: Duration, min_rto: Duration, max_rto: Duration) -> Self {
        Self {
            srtt: None,
            rttvar: Duration::ZERO,
            rto: initial.clamp(min_rto, max_rto),
            min_rto,
            max_rto,
        }
    }

    /// Current retransmission timeout.
    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// Smoothed RTT, once at least one sample has been recorded.
    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    pub fn rttvar(&self) -> Duration {
        self.rttvar
    }

    /// Fold in a new RTT sample and return the updated RTO.
    ///
    /// On the first sample:  SRTT = R,  RTTVAR = R/2.
    /// Subsequent samples:   RTTVAR = 3/4·RTTVAR + 1/4·|SRTT − R|
    ///                       SRTT   = 7/8·SRTT   + 1/8·R
    pub fn record_sample(&mut self, sample: Duration) -> Duration {
        match self.srtt {
            None => {
                self.srtt = Some(sample);
                self.rttvar = sample / 2;
            }
            Some(srtt) => {
                // RTTVAR uses the SRTT from before this sample.
                self.rttvar = self.rttvar * 3 / 4 + deviation(srtt, sample) / 4;
                self.srtt = Some(srtt * 7 / 8 + sample / 8);
            }
        }
        let srtt = self.srtt.unwrap_or(sample);
        self.rto = (srtt + self.rttvar * 4).clamp(self.min_rto, self.max_rto);
        self.rto
    }
}

fn deviation(a: Duration, b: Duration) -> Duration {
    if a > b {
        a - b
    } else {
        b - a
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn est() -> RtoEstimator {
        RtoEstimator::new(
            Duration::from_secs(1),
            Duration::from_millis(200),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn initial_rto_before_samples() {
        let e = est();
        assert_eq!(e.rto(), Duration::from_secs(1));
        assert!(e.srtt().is_none());
    }

    #[test]
    fn first_sample_sets_srtt_and_half_variance() {
        let mut e = est();
        let rto = e.record_sample(Duration::from_millis(100));
        assert_eq!(e.srtt(), Some(Duration::from_millis(100)));
        assert_eq!(e.rttvar(), Duration::from_millis(50));
        // 100 + 4·50 = 300ms
        assert_eq!(rto, Duration::from_millis(300));
    }

    #[test]
    fn second_sample_uses_ewma_weights() {
        let mut e = est();
        e.record_sample(Duration::from_millis(400));
        e.record_sample(Duration::from_millis(800));
        // rttvar = 3/4·200 + 1/4·400 = 250, srtt = 7/8·400 + 1/8·800 = 450
        assert_eq!(e.rttvar(), Duration::from_millis(250));
        assert_eq!(e.srtt(), Some(Duration::from_millis(450)));
        assert_eq!(e.rto(), Duration::from_millis(1450));
    }

    #[test]
    fn rto_clamped_to_bounds() {
        let mut e = est();
        assert_eq!(e.record_sample(Duration::from_micros(10)), Duration::from_millis(200));

        let mut e = est();
        assert_eq!(e.record_sample(Duration::from_secs(30)), Duration::from_secs(5));
    }

    #[test]
    fn rto_stays_in_bounds_for_any_sample_sequence() {
        let mut e = est();
        for ms in [0u64, 1, 7000, 3, 250, 60_000, 0, 0, 0, 90, 4999] {
            let rto = e.record_sample(Duration::from_millis(ms));
            assert!(rto >= Duration::from_millis(200) && rto <= Duration::from_secs(5));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn armed_timer_fires_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut t = Timer::new();
        let h = hits.clone();
        t.arm(Duration::from_millis(50), move |_| async move {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert!(t.is_armed());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_does_not_fire() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut t = Timer::new();
        let h = hits.clone();
        t.arm(Duration::from_millis(50), move |_| async move {
            h.fetch_add(1, Ordering::SeqCst);
        });
        t.cancel();
        t.cancel();
        assert!(!t.is_armed());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_replaces_pending_expiry() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut t = Timer::new();
        for _ in 0..3 {
            let h = hits.clone();
            t.arm(Duration::from_millis(50), move |_| async move {
                h.fetch_add(1, Ordering::SeqCst);
            });
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_generation_is_rejected() {
        let mut t = Timer::new();
        t.arm(Duration::from_secs(60), |_| async {});
        // Generation 1 was current; re-arm makes it stale.
        t.arm(Duration::from_secs(60), |_| async {});
        assert!(!t.fire(1));
        assert!(t.fire(2));
        assert!(!t.is_armed());
        // Already claimed.
        assert!(!t.fire(2));
    }
}
