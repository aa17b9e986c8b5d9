//! Selective-Repeat receiver.
//!
//! For a receive window of size N starting at `expected`:
//!
//! ```text
//!        already delivered     │   receive window (N)    │   beyond
//!  ◀───────────────────────────┼─────────────────────────┼──────────▶
//!        re-ACK, no delivery   │ ACK; deliver or buffer  │  ignore
//!                          expected              expected + N
//! ```
//!
//! Every in-window frame is acknowledged individually, duplicates included.
//! Frames below the window are re-acknowledged (the sender may have missed
//! the first ACK).  Frames beyond it get neither buffering nor an ACK.
//! Corrupt frames are dropped silently.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::config::ArqConfig;
use crate::gbn_sender::{seq_le, seq_lt};
use crate::packet::{Decoded, Frame, FrameKind};
use crate::reorder::ReorderBuffer;
use crate::socket::Socket;
use crate::stats::ReceiverStats;

// ---------------------------------------------------------------------------
// SelectiveReceiver
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Delivered, together with any buffered successors it released.
    Delivered,
    /// In window but ahead of `expected`; parked.
    Buffered,
    /// In window and already parked, or below the window.
    Duplicate,
    OutOfWindow,
    Corrupt,
}

/// Result of one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrVerdict {
    pub disposition: Disposition,
    /// Send `ACK(seq)` when present.
    pub ack: Option<u32>,
    /// Payloads released to the application, in order.
    pub delivered: Vec<Vec<u8>>,
}

impl SrVerdict {
    fn silent(disposition: Disposition) -> Self {
        Self {
            disposition,
            ack: None,
            delivered: Vec::new(),
        }
    }
}

/// Selective-Repeat receive-side state.
#[derive(Debug)]
pub struct SelectiveReceiver {
    expected: u32,
    window_size: u32,
    buffer: ReorderBuffer,
}

impl SelectiveReceiver {
    pub fn new(window_size: usize) -> Self {
        Self {
            expected: 0,
            window_size: window_size.max(1) as u32,
            buffer: ReorderBuffer::new(),
        }
    }

    pub fn expected(&self) -> u32 {
        self.expected
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn on_frame(&mut self, decoded: Decoded) -> SrVerdict {
        let Decoded { frame, intact } = decoded;
        if !intact || frame.kind != FrameKind::Data {
            return SrVerdict::silent(Disposition::Corrupt);
        }
        let seq = frame.seq;
        let window_end = self.expected.wrapping_add(self.window_size);

        if seq_lt(seq, self.expected) {
            return SrVerdict {
                disposition: Disposition::Duplicate,
                ack: Some(seq),
                delivered: Vec::new(),
            };
        }
        if !seq_le(self.expected, seq) || !seq_lt(seq, window_end) {
            return SrVerdict::silent(Disposition::OutOfWindow);
        }

        if seq == self.expected {
            let mut delivered = vec![frame.payload];
            self.expected = self.expected.wrapping_add(1);
            delivered.extend(self.buffer.drain_from(&mut self.expected, |_| 1));
            return SrVerdict {
                disposition: Disposition::Delivered,
                ack: Some(seq),
                delivered,
            };
        }

        let disposition = if self.buffer.insert(seq, frame.payload) {
            Disposition::Buffered
        } else {
            Disposition::Duplicate
        };
        SrVerdict {
            disposition,
            ack: Some(seq),
            delivered: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// SrReceiver
// ---------------------------------------------------------------------------

struct State {
    receiver: SelectiveReceiver,
    delivered: VecDeque<Vec<u8>>,
    stats: ReceiverStats,
}

struct Shared {
    socket: Socket,
    config: ArqConfig,
    state: Mutex<State>,
    readable: Notify,
    running: AtomicBool,
}

/// Async Selective-Repeat receiver.
pub struct SrReceiver {
    shared: Arc<Shared>,
    recv_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SrReceiver {
    pub fn start(socket: Socket, config: ArqConfig) -> Self {
        let shared = Arc::new(Shared {
            socket,
            state: Mutex::new(State {
                receiver: SelectiveReceiver::new(config.window_size),
                delivered: VecDeque::new(),
                stats: ReceiverStats::default(),
            }),
            config,
            readable: Notify::new(),
            running: AtomicBool::new(true),
        });
        let task = tokio::spawn(recv_loop(Arc::clone(&shared)));
        log::debug!("[sr] receiver on {}", shared.socket.local_addr);
        Self {
            shared,
            recv_task: std::sync::Mutex::new(Some(task)),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.socket.local_addr
    }

    /// Next delivered item, waiting up to `timeout` (forever when `None`).
    pub async fn recv(&self, timeout: Option<Duration>) -> Option<Vec<u8>> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            let notified = self.shared.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.shared.state.lock().await.delivered.pop_front() {
                return Some(item);
            }
            if !self.shared.running.load(Ordering::Acquire) {
                return None;
            }

            match deadline {
                Some(d) => {
                    if tokio::time::timeout_at(d, notified).await.is_err() {
                        return None;
                    }
                }
                None => notified.await,
            }
        }
    }

    pub async fn collect(&self, expected_count: usize, timeout: Duration) -> Vec<Vec<u8>> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut items = Vec::with_capacity(expected_count);
        while items.len() < expected_count {
            let left = deadline.saturating_duration_since(tokio::time::Instant::now());
            match self.recv(Some(left)).await {
                Some(item) => items.push(item),
                None => break,
            }
        }
        items
    }

    pub async fn stats(&self) -> ReceiverStats {
        self.shared.state.lock().await.stats.clone()
    }

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
        self.shared.readable.notify_waiters();
        log::debug!("[sr] receiver {} closed", self.shared.socket.local_addr);
    }
}

impl Drop for SrReceiver {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
    }
}

impl Shared {
    async fn on_datagram(&self, bytes: &[u8], from: SocketAddr) {
        let decoded = match Frame::decode(bytes) {
            Ok(d) => d,
            Err(e) => {
                log::debug!("[sr] undecodable datagram from {from}: {e}");
                return;
            }
        };
        let seq = decoded.frame.seq;
        let mut st = self.state.lock().await;
        st.stats.frames_received += 1;

        let verdict = st.receiver.on_frame(decoded);
        match verdict.disposition {
            Disposition::Corrupt => st.stats.corrupted += 1,
            Disposition::Delivered | Disposition::Buffered => {}
            Disposition::Duplicate | Disposition::OutOfWindow => st.stats.discarded += 1,
        }
        log::debug!(
            "[sr] ← DATA seq={seq} {:?} expected={}",
            verdict.disposition,
            st.receiver.expected()
        );

        if !verdict.delivered.is_empty() {
            st.stats.delivered += verdict.delivered.len() as u64;
            st.delivered.extend(verdict.delivered);
            self.readable.notify_waiters();
        }

        if let Some(ack) = verdict.ack {
            st.stats.acks_sent += 1;
            if let Err(e) = self.socket.send_to(&Frame::ack(ack).encode(), from).await {
                log::warn!("[sr] ACK {ack} to {from} failed: {e}");
            }
        }
    }
}

async fn recv_loop(shared: Arc<Shared>) {
    while shared.running.load(Ordering::Acquire) {
        match shared.socket.recv_timeout(shared.config.poll_interval).await {
            Ok(Some((bytes, from))) => shared.on_datagram(&bytes, from).await,
            Ok(None) => {}
            Err(e) => log::debug!("[sr] recv error: {e}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
