//! Selective-Repeat sender.
//!
//! Unlike Go-Back-N, every outstanding frame has its **own** timer and is
//! acknowledged individually.  Only the frame whose timer expired is re-sent.
//!
//! # Window sliding
//!
//! `base` moves only when the acknowledged sequence *is* `base`; it then
//! advances through every successor already marked acknowledged.
//!
//! # Giving up
//!
//! A sequence re-sent more than `max_retransmits` times is marked
//! acknowledged without ever having been confirmed, so one black-holed frame
//! cannot stall the window forever.  The receiver may therefore never see it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::config::ArqConfig;
use crate::error::ArqError;
use crate::gbn_sender::{seq_le, seq_lt};
use crate::packet::{Frame, FrameKind};
use crate::socket::Socket;
use crate::stats::SenderStats;
use crate::timer::{Timer, TimerFuture};

// ---------------------------------------------------------------------------
// SelectiveWindow
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Unit {
    bytes: Vec<u8>,
    retries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SrAck {
    /// Already acknowledged, below `base`, or never sent.
    Ignored,
    /// Newly acknowledged.  `slid` is `true` when `base` moved.
    Acked { slid: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SrTimeout {
    /// The sequence was acknowledged (or given up on) in the meantime.
    Stale,
    /// Re-send these bytes and re-arm the sequence's timer.
    Retransmit(Vec<u8>),
    /// Retry ceiling exceeded; the sequence now counts as acknowledged.
    GaveUp { slid: bool },
}

/// Selective-Repeat send-side window.
#[derive(Debug)]
pub struct SelectiveWindow {
    base: u32,
    next_seq: u32,
    window_size: usize,
    max_retransmits: u32,
    /// Sent but not yet acknowledged.
    outstanding: BTreeMap<u32, Unit>,
    /// Acknowledged sequences at or above `base`.
    acked: HashSet<u32>,
}

impl SelectiveWindow {
    pub fn new(window_size: usize, max_retransmits: u32) -> Self {
        Self {
            base: 0,
            next_seq: 0,
            window_size: window_size.max(1),
            max_retransmits,
            outstanding: BTreeMap::new(),
            acked: HashSet::new(),
        }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn next_seq(&self) -> u32 {
        self.next_seq
    }

    /// `true` while `next_seq` lies in `[base, base + N)`.
    pub fn can_send(&self) -> bool {
        (self.next_seq.wrapping_sub(self.base) as usize) < self.window_size
    }

    pub fn is_idle(&self) -> bool {
        self.base == self.next_seq
    }

    pub fn is_acked(&self, seq: u32) -> bool {
        seq_lt(seq, self.base) || self.acked.contains(&seq)
    }

    /// Admit `payload` at `next_seq`; returns `(seq, bytes)`.
    pub fn record_sent(&mut self, payload: Vec<u8>) -> (u32, Vec<u8>) {
        debug_assert!(self.can_send(), "record_sent on a full SR window");
        let seq = self.next_seq;
        let bytes = Frame::data(seq, payload).encode();
        self.outstanding.insert(
            seq,
            Unit {
                bytes: bytes.clone(),
                retries: 0,
            },
        );
        self.next_seq = self.next_seq.wrapping_add(1);
        (seq, bytes)
    }

    pub fn on_ack(&mut self, k: u32) -> SrAck {
        if self.outstanding.remove(&k).is_none() {
            return SrAck::Ignored;
        }
        SrAck::Acked {
            slid: self.mark_acked(k),
        }
    }

    pub fn on_timeout(&mut self, seq: u32) -> SrTimeout {
        let Some(unit) = self.outstanding.get_mut(&seq) else {
            return SrTimeout::Stale;
        };
        unit.retries += 1;
        if unit.retries > self.max_retransmits {
            self.outstanding.remove(&seq);
            return SrTimeout::GaveUp {
                slid: self.mark_acked(seq),
            };
        }
        SrTimeout::Retransmit(unit.bytes.clone())
    }

    fn mark_acked(&mut self, seq: u32) -> bool {
        debug_assert!(seq_le(self.base, seq) && seq_lt(seq, self.next_seq));
        self.acked.insert(seq);
        if seq != self.base {
            return false;
        }
        while self.acked.remove(&self.base) {
            self.base = self.base.wrapping_add(1);
        }
        true
    }
}

// ---------------------------------------------------------------------------
// SrSender
// ---------------------------------------------------------------------------

struct State {
    window: SelectiveWindow,
    timers: HashMap<u32, Timer>,
    stats: SenderStats,
    started: Option<Instant>,
    gave_up: u64,
}

struct Shared {
    socket: Socket,
    dest: SocketAddr,
    config: ArqConfig,
    state: Mutex<State>,
    changed: Notify,
    running: AtomicBool,
}

/// Async Selective-Repeat sender bound to one destination.
pub struct SrSender {
    shared: Arc<Shared>,
    recv_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SrSender {
    pub fn start(socket: Socket, dest: SocketAddr, config: ArqConfig) -> Self {
        let shared = Arc::new(Shared {
            socket,
            dest,
            state: Mutex::new(State {
                window: SelectiveWindow::new(config.window_size, config.max_retransmits),
                timers: HashMap::new(),
                stats: SenderStats::default(),
                started: None,
                gave_up: 0,
            }),
            config,
            changed: Notify::new(),
            running: AtomicBool::new(true),
        });
        let task = tokio::spawn(recv_loop(Arc::clone(&shared)));
        log::debug!(
            "[sr] sender {} → {} window={}",
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

    /// Admit one item once the window has room, transmit it and arm its
    /// timer.  Returns the assigned sequence number.
    pub async fn send(&self, data: &[u8]) -> Result<u32, ArqError> {
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut st = self.shared.state.lock().await;
                if !self.shared.running.load(Ordering::Acquire) {
                    return Err(ArqError::Stopped);
                }
                if st.window.can_send() {
                    let (seq, bytes) = st.window.record_sent(data.to_vec());
                    st.started.get_or_insert_with(Instant::now);
                    st.stats.frames_sent += 1;
                    st.stats.bytes_sent += data.len() as u64;
                    self.shared.arm_timer(&mut st, seq);
                    log::debug!("[sr] → DATA seq={seq} len={}", data.len());
                    // A failed transmit is treated like a lost frame.
                    if let Err(e) = self.shared.socket.send_to(&bytes, self.shared.dest).await {
                        log::warn!("[sr] send of {seq} failed: {e}");
                    }
                    return Ok(seq);
                }
            }

            notified.await;
        }
    }

    /// Send every item, admitting each as the window allows.
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

    /// Wait until every admitted sequence is acknowledged or given up on.
    pub async fn wait_for_completion(&self, timeout: Duration) -> Result<bool, ArqError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let st = self.shared.state.lock().await;
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

    /// Sequences abandoned after exceeding the retry ceiling.
    pub async fn given_up(&self) -> u64 {
        self.shared.state.lock().await.gave_up
    }

    /// `(base, next_seq)` of the send window.
    pub async fn window(&self) -> (u32, u32) {
        let st = self.shared.state.lock().await;
        (st.window.base(), st.window.next_seq())
    }

    /// Stop the ACK loop and cancel every per-sequence timer.
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
        {
            let mut st = self.shared.state.lock().await;
            for timer in st.timers.values_mut() {
                timer.cancel();
            }
            st.timers.clear();
        }
        self.shared.changed.notify_waiters();
        log::debug!("[sr] sender {} closed", self.shared.socket.local_addr);
    }
}

impl Drop for SrSender {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
    }
}

impl Shared {
    fn arm_timer(self: &Arc<Self>, st: &mut State, seq: u32) {
        let weak = Arc::downgrade(self);
        st.timers
            .entry(seq)
            .or_default()
            .arm(self.config.timeout, move |gen| on_timeout(weak, seq, gen));
    }

    async fn on_ack(&self, k: u32) {
        let mut st = self.state.lock().await;
        match st.window.on_ack(k) {
            SrAck::Ignored => log::debug!("[sr] ← ACK {k} ignored"),
            SrAck::Acked { slid } => {
                if let Some(mut timer) = st.timers.remove(&k) {
                    timer.cancel();
                }
                if let Some(started) = st.started {
                    st.stats.elapsed = started.elapsed();
                }
                log::debug!("[sr] ← ACK {k} base={}", st.window.base());
                if slid {
                    drop(st);
                    self.changed.notify_waiters();
                }
            }
        }
    }
}

fn on_timeout(shared: Weak<Shared>, seq: u32, gen: u64) -> TimerFuture {
    Box::pin(async move {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        let mut st = shared.state.lock().await;
        let current = st.timers.get_mut(&seq).is_some_and(|t| t.fire(gen));
        if !current || !shared.running.load(Ordering::Acquire) {
            return;
        }
        st.stats.timeouts += 1;
        match st.window.on_timeout(seq) {
            SrTimeout::Stale => {
                st.timers.remove(&seq);
            }
            SrTimeout::Retransmit(bytes) => {
                st.stats.frames_sent += 1;
                st.stats.retransmissions += 1;
                log::debug!("[sr] timeout: resending seq={seq}");
                if let Err(e) = shared.socket.send_to(&bytes, shared.dest).await {
                    log::warn!("[sr] retransmit of {seq} failed: {e}");
                }
                shared.arm_timer(&mut st, seq);
            }
            SrTimeout::GaveUp { slid } => {
                st.timers.remove(&seq);
                st.gave_up += 1;
                log::warn!(
                    "[sr] giving up on seq={seq} after {} retransmissions",
                    shared.config.max_retransmits
                );
                if slid {
                    drop(st);
                    shared.changed.notify_waiters();
                }
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
                log::debug!("[sr] recv error: {e}");
                continue;
            }
        };
        if from != shared.dest {
            continue;
        }
        match Frame::decode(&bytes) {
            Ok(d) if d.intact && d.frame.kind == FrameKind::Ack => shared.on_ack(d.frame.seq).await,
            Ok(d) => log::debug!("[sr] ignoring {} (intact={})", d.frame, d.intact),
            Err(e) => log::debug!("[sr] undecodable datagram: {e}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
