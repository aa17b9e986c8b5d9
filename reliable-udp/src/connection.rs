//! Per-connection lifecycle manager.
//!
//! A [`Connection`] wraps one [`Tcb`] behind a tokio mutex together with the
//! connection's single timer, and executes the [`Effects`] the block asks
//! for.  Three paths touch that state:
//!
//! ```text
//!   application ── open / send / recv / close ──┐
//!   receive loop ── on_segment ─────────────────┼──▶ Mutex<Inner> ──▶ socket
//!   timer task   ── on_timer ───────────────────┘          │
//!                                                          └──▶ Notify (waiters)
//! ```
//!
//! An actively opened connection owns its receive loop.  Connections handed
//! out by [`crate::listener::Listener::accept`] share the listener's socket
//! and are fed by the listener's loop instead.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::config::ConnConfig;
use crate::error::ConnError;
use crate::segment::Segment;
use crate::socket::Socket;
use crate::state::ConnectionState;
use crate::tcb::{Effects, Tcb, TimerCmd};
use crate::timer::{Timer, TimerFuture};

/// Initial sequence numbers are drawn from `0..ISS_RANGE`.
const ISS_RANGE: u32 = 1000;

pub(crate) fn initial_sequence() -> u32 {
    rand::rng().random_range(0..ISS_RANGE)
}

pub(crate) struct Inner {
    pub(crate) tcb: Tcb,
    timer: Timer,
    remote: Option<SocketAddr>,
}

pub(crate) struct ConnShared {
    socket: Socket,
    config: ConnConfig,
    pub(crate) inner: Mutex<Inner>,
    changed: Notify,
    running: AtomicBool,
    /// The application's handle is gone.
    dropped: AtomicBool,
}

impl ConnShared {
    pub(crate) fn new(
        socket: Socket,
        config: ConnConfig,
        tcb: Tcb,
        remote: Option<SocketAddr>,
    ) -> Arc<Self> {
        Arc::new(Self {
            socket,
            config,
            inner: Mutex::new(Inner {
                tcb,
                timer: Timer::new(),
                remote,
            }),
            changed: Notify::new(),
            running: AtomicBool::new(false),
            dropped: AtomicBool::new(false),
        })
    }

    pub(crate) fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::Acquire)
    }

    pub(crate) fn config(&self) -> &ConnConfig {
        &self.config
    }

    /// Put requested segments on the wire and update the timer.
    pub(crate) async fn apply(self: &Arc<Self>, inner: &mut Inner, fx: Effects) {
        if let Some(remote) = inner.remote {
            for seg in &fx.transmit {
                log::debug!("[tcp] → {remote} {seg}");
                if let Err(e) = self.socket.send_to(&seg.encode(), remote).await {
                    log::warn!("[tcp] send to {remote} failed: {e}");
                }
            }
        }
        match fx.timer {
            TimerCmd::Keep => {}
            TimerCmd::Cancel => inner.timer.cancel(),
            TimerCmd::Arm(delay) => {
                let weak = Arc::downgrade(self);
                inner.timer.arm(delay, move |gen| on_timer(weak, gen));
            }
        }
    }

    /// Feed one intact segment from `from` to the state machine.  Returns the
    /// state afterwards.
    pub(crate) async fn on_segment(
        self: &Arc<Self>,
        seg: &Segment,
        from: SocketAddr,
    ) -> ConnectionState {
        let mut inner = self.inner.lock().await;
        if inner.remote != Some(from) {
            log::debug!("[tcp] segment from unexpected peer {from} ignored");
            return inner.tcb.state();
        }
        log::trace!("[tcp] ← {from} {seg}");
        let fx = inner.tcb.on_segment(seg, Instant::now());
        self.apply(&mut inner, fx).await;
        let state = inner.tcb.state();
        drop(inner);
        self.changed.notify_waiters();
        state
    }

    async fn on_datagram(self: &Arc<Self>, bytes: &[u8], from: SocketAddr) {
        match Segment::decode(bytes) {
            Ok(decoded) if decoded.intact => {
                self.on_segment(&decoded.segment, from).await;
            }
            Ok(_) => log::debug!("[tcp] corrupt segment from {from} dropped"),
            Err(e) => log::debug!("[tcp] undecodable datagram from {from}: {e}"),
        }
    }

    /// Re-check `poll` whenever the connection changes, until it yields a
    /// value or `deadline` passes.
    async fn wait_for<T, F>(&self, deadline: Option<tokio::time::Instant>, mut poll: F) -> Option<T>
    where
        F: FnMut(&mut Inner) -> Option<T>,
    {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = poll(&mut *self.inner.lock().await) {
                return Some(value);
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
}

fn on_timer(shared: Weak<ConnShared>, gen: u64) -> TimerFuture {
    Box::pin(async move {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        let mut inner = shared.inner.lock().await;
        if !inner.timer.fire(gen) {
            return;
        }
        let fx = inner.tcb.on_timer(Instant::now());
        shared.apply(&mut inner, fx).await;
        drop(inner);
        shared.changed.notify_waiters();
    })
}

async fn recv_loop(shared: Arc<ConnShared>) {
    while shared.running.load(Ordering::Acquire) {
        match shared.socket.recv_timeout(shared.config.poll_interval).await {
            Ok(Some((bytes, from))) => shared.on_datagram(&bytes, from).await,
            Ok(None) => {}
            Err(e) => log::debug!("[tcp] recv error: {e}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// A reliable, ordered byte stream to one peer.
pub struct Connection {
    shared: Arc<ConnShared>,
    recv_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// A connection in CLOSED bound to `socket`.  Call [`open`] to connect.
    ///
    /// [`open`]: Connection::open
    pub fn new(socket: Socket, config: ConnConfig) -> Self {
        let tcb = Tcb::new(socket.local_addr.port(), config.clone());
        Self {
            shared: ConnShared::new(socket, config, tcb, None),
            recv_task: std::sync::Mutex::new(None),
        }
    }

    /// Shorthand for [`new`] followed by [`open`].
    ///
    /// [`new`]: Connection::new
    /// [`open`]: Connection::open
    pub async fn connect(
        socket: Socket,
        remote: SocketAddr,
        config: ConnConfig,
    ) -> Result<Self, ConnError> {
        let conn = Self::new(socket, config);
        conn.open(remote).await?;
        Ok(conn)
    }

    /// Wrap a child created by a listener.
    pub(crate) fn from_shared(shared: Arc<ConnShared>) -> Self {
        Self {
            shared,
            recv_task: std::sync::Mutex::new(None),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.socket.local_addr
    }

    pub async fn remote_addr(&self) -> Option<SocketAddr> {
        self.shared.inner.lock().await.remote
    }

    pub async fn state(&self) -> ConnectionState {
        self.shared.inner.lock().await.tcb.state()
    }

    /// Most recent receive window advertised by the peer.
    pub async fn peer_window(&self) -> u16 {
        self.shared.inner.lock().await.tcb.peer_window()
    }

    /// Current retransmission timeout.
    pub async fn rto(&self) -> Duration {
        self.shared.inner.lock().await.tcb.rto()
    }

    /// Active open.  Completes the three-way handshake with `remote` or
    /// fails with [`ConnError::HandshakeTimeout`] once `connect_timeout`
    /// elapses or the SYN retry ceiling is reached.
    pub async fn open(&self, remote: SocketAddr) -> Result<(), ConnError> {
        {
            let mut inner = self.shared.inner.lock().await;
            let fx = inner
                .tcb
                .open(remote.port(), initial_sequence(), Instant::now())?;
            inner.remote = Some(remote);
            self.shared.apply(&mut inner, fx).await;
        }
        self.spawn_recv_loop();

        let deadline = tokio::time::Instant::now() + self.shared.config.connect_timeout;
        let state = self
            .shared
            .wait_for(Some(deadline), |inner| {
                let state = inner.tcb.state();
                (state != ConnectionState::SynSent).then_some(state)
            })
            .await;

        match state {
            Some(state) if state.is_synchronized() => {
                log::info!("[tcp] {} connected to {remote}", self.local_addr());
                Ok(())
            }
            _ => {
                log::warn!("[tcp] handshake with {remote} timed out");
                self.release().await;
                Err(ConnError::HandshakeTimeout)
            }
        }
    }

    /// Queue `data` for reliable delivery.  Returns the number of bytes
    /// accepted, which is all of them.
    pub async fn send(&self, data: &[u8]) -> Result<usize, ConnError> {
        let mut inner = self.shared.inner.lock().await;
        let fx = inner.tcb.send(data, Instant::now())?;
        self.shared.apply(&mut inner, fx).await;
        Ok(data.len())
    }

    /// Up to `max_bytes` of in-order data.  Empty on end-of-stream, on a
    /// closed connection, or when `timeout` elapses first (`None` waits
    /// indefinitely).
    pub async fn recv(&self, max_bytes: usize, timeout: Option<Duration>) -> Vec<u8> {
        if max_bytes == 0 {
            return Vec::new();
        }
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        self.shared
            .wait_for(deadline, |inner| {
                if inner.tcb.readable() > 0 {
                    Some(inner.tcb.read(max_bytes))
                } else if inner.tcb.is_eof() || inner.tcb.state() == ConnectionState::Closed {
                    Some(Vec::new())
                } else {
                    None
                }
            })
            .await
            .unwrap_or_default()
    }

    /// Graceful close.  Sends FIN and waits, bounded by `close_timeout`, for
    /// the close sequence to reach CLOSED (TIME_WAIT included).  Resources
    /// are released either way; `false` means the wait ran out.
    pub async fn close(&self) -> bool {
        let deadline = tokio::time::Instant::now() + self.shared.config.close_timeout;
        {
            let mut inner = self.shared.inner.lock().await;
            let fx = inner.tcb.close(Instant::now());
            self.shared.apply(&mut inner, fx).await;
        }
        self.shared.changed.notify_waiters();

        let graceful = self
            .shared
            .wait_for(Some(deadline), |inner| {
                (inner.tcb.state() == ConnectionState::Closed).then_some(())
            })
            .await
            .is_some();

        if !graceful {
            let state = self.state().await;
            log::warn!("[tcp] close timed out in {state}; forcing release");
        }
        self.release().await;
        graceful
    }

    fn spawn_recv_loop(&self) {
        let mut slot = self
            .recv_task
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            self.shared.running.store(true, Ordering::Release);
            *slot = Some(tokio::spawn(recv_loop(Arc::clone(&self.shared))));
        }
    }

    /// Stop the receive loop, cancel the timer and drop to CLOSED.
    async fn release(&self) {
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
            let mut inner = self.shared.inner.lock().await;
            let fx = inner.tcb.abort();
            self.shared.apply(&mut inner, fx).await;
        }
        self.shared.changed.notify_waiters();
        log::debug!("[tcp] {} released", self.local_addr());
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.dropped.store(true, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    async fn loopback() -> Socket {
        Socket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap()
    }

    #[test]
    fn initial_sequence_in_range() {
        for _ in 0..100 {
            assert!(initial_sequence() < ISS_RANGE);
        }
    }

    #[tokio::test]
    async fn new_connection_starts_closed() {
        let conn = Connection::new(loopback().await, ConnConfig::default());
        assert_eq!(conn.state().await, ConnectionState::Closed);
        assert_eq!(conn.remote_addr().await, None);
        assert_eq!(conn.rto().await, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn send_before_open_is_rejected() {
        let conn = Connection::new(loopback().await, ConnConfig::default());
        let err = conn.send(b"x").await.unwrap_err();
        assert!(matches!(
            err,
            ConnError::InvalidState {
                op: "send",
                state: ConnectionState::Closed
            }
        ));
    }

    #[tokio::test]
    async fn recv_on_closed_connection_returns_empty() {
        let conn = Connection::new(loopback().await, ConnConfig::default());
        let got = conn.recv(16, Some(Duration::from_millis(10))).await;
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn open_against_silent_peer_times_out() {
        let silent = loopback().await;
        let config = ConnConfig::default()
            .initial_rto(Duration::from_millis(200))
            .connect_timeout(Duration::from_millis(600))
            .poll_interval(Duration::from_millis(20));
        let conn = Connection::new(loopback().await, config);

        let started = std::time::Instant::now();
        let err = conn.open(silent.local_addr).await.unwrap_err();
        assert!(matches!(err, ConnError::HandshakeTimeout));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(conn.state().await, ConnectionState::Closed);
    }
}
