//! Go-Back-N sender.
//!
//! Two layers live here:
//! - [`GbnWindow`]: the pure sliding-window state (no I/O, no clocks beyond
//!   `Instant` stamps), unit-tested directly.
//! - [`GbnSender`]: the async engine that owns a [`Socket`], a receive loop
//!   for ACKs and the single shared retransmission timer.
//!
//! # Protocol contract
//!
//! - Sequence numbers count frames, starting at 0.
//! - At most `window_size` frames may be in flight at once.
//! - ACKs are **cumulative**: `ACK(k)` acknowledges every frame `≤ k`.
//! - One timer covers the oldest outstanding frame.  On expiry **all**
//!   frames in `[base, next_seq)` are re-sent (go back N).
//! - Re-sending the window more than `max_retransmits` times without
//!   progress aborts the transfer.
//!
//! ```text
//!  base               next_seq          base + N
//!    │                    │                 │
//!  ──┼────────────────────┼─────────────────┼──▶ seq space
//!    │ <── in flight ───▶ │ <── sendable ──▶│
//! ```

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::config::ArqConfig;
use crate::error::ArqError;
use crate::packet::{Frame, FrameKind};
use crate::socket::Socket;
use crate::stats::SenderStats;
use crate::timer::{Timer, TimerFuture};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Returns `true` when sequence number `a` is ≤ `b` in wrap-around space.
#[inline]
pub(crate) fn seq_le(a: u32, b: u32) -> bool {
    b.wrapping_sub(a) <= (u32::MAX / 2)
}

/// Returns `true` when sequence number `a` is < `b` in wrap-around space.
#[inline]
pub(crate) fn seq_lt(a: u32, b: u32) -> bool {
    a != b && seq_le(a, b)
}

// ---------------------------------------------------------------------------
// GbnWindow
// ---------------------------------------------------------------------------

/// A single in-flight frame occupying one slot in the window.
#[derive(Debug, Clone)]
pub struct GbnEntry {
    pub seq: u32,
    /// The encoded frame, ready to hand to the socket.
    pub bytes: Vec<u8>,
    /// Total number of times this frame has been transmitted.
    pub tx_count: u32,
    pub sent_at: Instant,
}

/// Outcome of feeding an ACK to the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Below `base` or beyond anything sent; nothing changed.
    Stale,
    /// `base` moved forward by `acked` frames.  `idle` is `true` when
    /// nothing is left in flight.
    Advanced { acked: usize, idle: bool },
}

/// Go-Back-N send-side window.
#[derive(Debug)]
pub struct GbnWindow {
    /// Oldest unacknowledged sequence number (left window edge).
    base: u32,
    /// Sequence number for the next new frame.
    next_seq: u32,
    window_size: usize,
    max_retransmits: u32,
    /// Whole-window retransmissions since the last advancing ACK.
    retries: u32,
    /// In-flight frames ordered by sequence number (front = oldest).
    window: VecDeque<GbnEntry>,
}

impl GbnWindow {
    pub fn new(window_size: usize, max_retransmits: u32) -> Self {
        let window_size = window_size.max(1);
        Self {
            base: 0,
            next_seq: 0,
            window_size,
            max_retransmits,
            retries: 0,
            window: VecDeque::with_capacity(window_size),
        }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn next_seq(&self) -> u32 {
        self.next_seq
    }

    /// `true` while `next_seq < base + N`.
    pub fn can_send(&self) -> bool {
        self.window.len() < self.window_size
    }

    pub fn in_flight(&self) -> usize {
        self.window.len()
    }

    pub fn is_idle(&self) -> bool {
        self.window.is_empty()
    }

    /// Assign the next sequence number to `payload` and place the encoded
    /// frame in the window.
    ///
    /// Returns `(seq, bytes, starts_timer)`; `starts_timer` is `true` when
    /// this frame is the only one outstanding.
    pub fn record_sent(&mut self, payload: Vec<u8>) -> (u32, Vec<u8>, bool) {
        debug_assert!(self.can_send(), "record_sent on a full GBN window");
        let seq = self.next_seq;
        let bytes = Frame::data(seq, payload).encode();
        self.window.push_back(GbnEntry {
            seq,
            bytes: bytes.clone(),
            tx_count: 1,
            sent_at: Instant::now(),
        });
        self.next_seq = self.next_seq.wrapping_add(1);
        (seq, bytes, self.window.len() == 1)
    }

    /// Process cumulative `ACK(k)`.
    pub fn on_ack(&mut self, k: u32) -> AckOutcome {
        if !seq_le(self.base, k) || !seq_lt(k, self.next_seq) {
            return AckOutcome::Stale;
        }
        let mut acked = 0;
        while let Some(front) = self.window.front() {
            if !seq_le(front.seq, k) {
                break;
            }
            self.window.pop_front();
            acked += 1;
        }
        self.base = k.wrapping_add(1);
        self.retries = 0;
        AckOutcome::Advanced {
            acked,
            idle: self.window.is_empty(),
        }
    }

    /// Timer expiry: return every in-flight frame for retransmission, or
    /// fail once the retry ceiling is exceeded.
    pub fn on_timeout(&mut self) -> Result<Vec<Vec<u8>>, ArqError> {
        self.retries += 1;
        if self.retries > self.max_retransmits {
            return Err(ArqError::RetriesExhausted {
                base: self.base,
                limit: self.max_retransmits,
            });
        }
        let now = Instant::now();
        Ok(self
            .window
            .iter_mut()
            .map(|entry| {
                entry.tx_count += 1;
                entry.sent_at = now;
                entry.bytes.clone()
            })
            .collect())
    }

    pub fn window_entries(&self) -> impl Iterator<Item = &GbnEntry> {
        self.window.iter()
    }
}

// ---------------------------------------------------------------------------
// GbnSender
// ---------------------------------------------------------------------------

struct State {
    window: GbnWindow,
    timer: Timer,
    stats: SenderStats,
    started: Option<Instant>,
    /// Set once the retry ceiling is exceeded; the transfer is over.
    failure: Option<(u32, u32)>,
}

impl State {
    fn check(&self) -> Result<(), ArqError> {
        match self.failure {
            Some((base, limit)) => Err(ArqError::RetriesExhausted { base, limit }),
            None => Ok(()),
        }
    }
}

struct Shared {
    socket: Socket,
    dest: SocketAddr,
    config: ArqConfig,
    state: Mutex<State>,
    /// Signalled whenever the window slides, fails, or the engine stops.
    changed: Notify,
    running: AtomicBool,
}

/// Async Go-Back-N sender bound to one destination.
pub struct GbnSender {
    shared: Arc<Shared>,
    recv_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl GbnSender {
    /// Start a sender on `socket` targeting `dest` and spawn its ACK loop.
    pub fn start(socket: Socket, dest: SocketAddr, config: ArqConfig) -> Self {
        let shared = Arc::new(Shared {
            socket,
            dest,
            state: Mutex::new(State {
                window: GbnWindow::new(config.window_size, config.max_retransmits),
                timer: Timer::new(),
                stats: SenderStats::default(),
                started: None,
                failure: None,
            }),
            config,
            changed: Notify::new(),
            running: AtomicBool::new(true),
        });
        let task = tokio::spawn(recv_loop(Arc::clone(&shared)));
        log::debug!(
            "[gbn] sender {} → {} window={}",
            shared.socket.local_addr,
            dest,
            shared.config.window_size
        );
        Self {
            shared,
            recv_task: std::sync::Mutex::new(Some(task)),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.socket.local_addr
    }

    /// Queue one item.  Blocks while the window is full, then transmits it
    /// and returns its sequence number.
    pub async fn send(&self, data: &[u8]) -> Result<u32, ArqError> {
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut st = self.shared.state.lock().await;
                st.check()?;
                if !self.shared.running.load(Ordering::Acquire) {
                    return Err(ArqError::Stopped);
                }
                if st.window.can_send() {
                    let (seq, bytes, starts_timer) = st.window.record_sent(data.to_vec());
                    st.started.get_or_insert_with(Instant::now);
                    st.stats.frames_sent += 1;
                    st.stats.bytes_sent += data.len() as u64;
                    if starts_timer {
                        self.shared.arm_timer(&mut st);
                    }
                    log::debug!(
                        "[gbn] → DATA seq={seq} len={} in_flight={}",
                        data.len(),
                        st.window.in_flight()
                    );
                    if let Err(e) = self.shared.socket.send_to(&bytes, self.shared.dest).await {
                        log::warn!("[gbn] send of {seq} failed: {e}");
                    }
                    return Ok(seq);
                }
            }

            notified.await;
        }
    }

    /// Queue every item in order.
    pub async fn send_all<I, B>(&self, items: I) -> Result<(), ArqError>
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        for item in items {
            self.send(item.as_ref()).await?;
        }
        Ok(())
    }

    /// Wait until every queued item is acknowledged.
    ///
    /// `Ok(false)` when `timeout` elapses first; `Err` if the transfer failed.
    pub async fn wait_for_completion(&self, timeout: Duration) -> Result<bool, ArqError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let st = self.shared.state.lock().await;
                st.check()?;
                if st.window.is_idle() {
                    return Ok(true);
                }
                if !self.shared.running.load(Ordering::Acquire) {
                    return Err(ArqError::Stopped);
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(false);
            }
        }
    }

    pub async fn stats(&self) -> SenderStats {
        self.shared.state.lock().await.stats.clone()
    }

    /// `(base, next_seq)` of the send window.
    pub async fn window(&self) -> (u32, u32) {
        let st = self.shared.state.lock().await;
        (st.window.base(), st.window.next_seq())
    }

    /// Stop the ACK loop and cancel the timer.
    pub async fn close(&self) {
        self.shared.running.store(false, Ordering::Release);
        let task = self
            .recv_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.shared.state.lock().await.timer.cancel();
        self.shared.changed.notify_waiters();
        log::debug!("[gbn] sender {} closed", self.shared.socket.local_addr);
    }
}

impl Drop for GbnSender {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
    }
}

impl Shared {
    fn arm_timer(self: &Arc<Self>, st: &mut State) {
        let weak = Arc::downgrade(self);
        st.timer
            .arm(self.config.timeout, move |gen| on_timeout(weak, gen));
    }

    async fn on_ack(self: &Arc<Self>, k: u32) {
        let mut st = self.state.lock().await;
        match st.window.on_ack(k) {
            AckOutcome::Stale => {
                log::debug!("[gbn] ← ACK {k} (stale, base={})", st.window.base());
            }
            AckOutcome::Advanced { acked, idle } => {
                if let Some(started) = st.started {
                    st.stats.elapsed = started.elapsed();
                }
                if idle {
                    st.timer.cancel();
                } else {
                    self.arm_timer(&mut st);
                }
                log::debug!(
                    "[gbn] ← ACK {k} slid {acked} base={}",
                    st.window.base()
                );
                drop(st);
                self.changed.notify_waiters();
            }
        }
    }
}

fn on_timeout(shared: Weak<Shared>, gen: u64) -> TimerFuture {
    Box::pin(async move {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        let mut st = shared.state.lock().await;
        if !st.timer.fire(gen) || !shared.running.load(Ordering::Acquire) {
            return;
        }
        st.stats.timeouts += 1;
        match st.window.on_timeout() {
            Ok(frames) => {
                log::debug!(
                    "[gbn] timeout: resending {} frame(s) from base={}",
                    frames.len(),
                    st.window.base()
                );
                for bytes in &frames {
                    st.stats.frames_sent += 1;
                    st.stats.retransmissions += 1;
                    if let Err(e) = shared.socket.send_to(bytes, shared.dest).await {
                        log::warn!("[gbn] retransmit failed: {e}");
                    }
                }
                shared.arm_timer(&mut st);
            }
            Err(e) => {
                log::error!("[gbn] {e}; aborting transfer");
                if let ArqError::RetriesExhausted { base, limit } = e {
                    st.failure = Some((base, limit));
                }
                drop(st);
                shared.changed.notify_waiters();
            }
        }
    })
}

async fn recv_loop(shared: Arc<Shared>) {
    while shared.running.load(Ordering::Acquire) {
        let (bytes, from) = match shared.socket.recv_timeout(shared.config.poll_interval).await {
            Ok(Some(datagram)) => datagram,
            Ok(None) => continue,
            Err(e) => {
                log::debug!("[gbn] recv error: {e}");
                continue;
            }
        };
        if from != shared.dest {
            continue;
        }
        match Frame::decode(&bytes) {
            Ok(d) if d.intact && d.frame.kind == FrameKind::Ack => shared.on_ack(d.frame.seq).await,
            Ok(d) => log::debug!("[gbn] ignoring {} (intact={})", d.frame, d.intact),
            Err(e) => log::debug!("[gbn] undecodable datagram: {e}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
