//! Go-Back-N receiver.
//!
//! - Only the frame at `expected` is accepted; it is delivered and acked.
//! - A corrupt or out-of-order frame is **discarded** and answered with a
//!   duplicate cumulative `ACK(expected - 1)`.  Nothing is ever buffered.
//! - Before the first delivery (`expected == 0`) there is no in-order frame
//!   to re-acknowledge, so rejected frames get no reply.
//!
//! [`InOrderReceiver`] is the pure state; [`GbnReceiver`] is the async engine
//! with its receive loop and delivery queue.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::config::ArqConfig;
use crate::packet::{Decoded, Frame, FrameKind};
use crate::socket::Socket;
use crate::stats::ReceiverStats;

// ---------------------------------------------------------------------------
// InOrderReceiver
// ---------------------------------------------------------------------------

/// What to do with one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// In order: hand `payload` to the application and send `ACK(ack)`.
    Deliver { payload: Vec<u8>, ack: u32 },
    /// Discarded.  Send `ACK(ack)` when present.
    Reject { ack: Option<u32> },
}

/// Go-Back-N receive-side state.
#[derive(Debug, Default)]
pub struct InOrderReceiver {
    /// Next expected sequence number.
    expected: u32,
}

impl InOrderReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expected(&self) -> u32 {
        self.expected
    }

    fn last_in_order(&self) -> Option<u32> {
        self.expected.checked_sub(1)
    }

    pub fn on_frame(&mut self, decoded: Decoded) -> Verdict {
        let Decoded { frame, intact } = decoded;
        if !intact || frame.kind != FrameKind::Data || frame.seq != self.expected {
            return Verdict::Reject {
                ack: self.last_in_order(),
            };
        }
        let ack = self.expected;
        self.expected = self.expected.wrapping_add(1);
        Verdict::Deliver {
            payload: frame.payload,
            ack,
        }
    }
}

// ---------------------------------------------------------------------------
// GbnReceiver
// ---------------------------------------------------------------------------

struct State {
    receiver: InOrderReceiver,
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

/// Async Go-Back-N receiver.  Acks go back to whichever address sent the
/// frame.
pub struct GbnReceiver {
    shared: Arc<Shared>,
    recv_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl GbnReceiver {
    pub fn start(socket: Socket, config: ArqConfig) -> Self {
        let shared = Arc::new(Shared {
            socket,
            config,
            state: Mutex::new(State {
                receiver: InOrderReceiver::new(),
                delivered: VecDeque::new(),
                stats: ReceiverStats::default(),
            }),
            readable: Notify::new(),
            running: AtomicBool::new(true),
        });
        let task = tokio::spawn(recv_loop(Arc::clone(&shared)));
        log::debug!("[gbn] receiver on {}", shared.socket.local_addr);
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

    /// Gather up to `expected_count` items, stopping early at `timeout`.
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

    /// Next sequence number the receiver is waiting for.
    pub async fn expected(&self) -> u32 {
        self.shared.state.lock().await.receiver.expected()
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
        log::debug!("[gbn] receiver {} closed", self.shared.socket.local_addr);
    }
}

impl Drop for GbnReceiver {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
    }
}

impl Shared {
    async fn on_datagram(&self, bytes: &[u8], from: SocketAddr) {
        let decoded = match Frame::decode(bytes) {
            Ok(d) => d,
            Err(e) => {
                log::debug!("[gbn] undecodable datagram from {from}: {e}");
                return;
            }
        };
        let mut st = self.state.lock().await;
        st.stats.frames_received += 1;
        if !decoded.intact {
            st.stats.corrupted += 1;
        }
        let seq = decoded.frame.seq;
        let intact = decoded.intact;

        let ack = match st.receiver.on_frame(decoded) {
            Verdict::Deliver { payload, ack } => {
                log::debug!("[gbn] ← DATA seq={seq} delivered");
                st.delivered.push_back(payload);
                st.stats.delivered += 1;
                self.readable.notify_waiters();
                Some(ack)
            }
            Verdict::Reject { ack } => {
                log::debug!(
                    "[gbn] ← frame seq={seq} discarded, expected={}",
                    st.receiver.expected()
                );
                if intact {
                    st.stats.discarded += 1;
                }
                ack
            }
        };

        if let Some(ack) = ack {
            st.stats.acks_sent += 1;
            if let Err(e) = self.socket.send_to(&Frame::ack(ack).encode(), from).await {
                log::warn!("[gbn] ACK {ack} to {from} failed: {e}");
            }
        }
    }
}

async fn recv_loop(shared: Arc<Shared>) {
    while shared.running.load(Ordering::Acquire) {
        match shared.socket.recv_timeout(shared.config.poll_interval).await {
            Ok(Some((bytes, from))) => shared.on_datagram(&bytes, from).await,
            Ok(None) => {}
            Err(e) => log::debug!("[gbn] recv error: {e}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
