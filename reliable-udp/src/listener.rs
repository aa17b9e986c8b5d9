//! Passive side: one socket, many peers.
//!
//! The listener's receive loop owns the socket and demultiplexes by remote
//! address:
//!
//! ```text
//!   datagram from A ──▶ children[A]? ── yes ──▶ child.on_segment
//!                             │
//!                             no ── SYN? ── yes ──▶ new child (SYN_RECEIVED),
//!                                    │             send SYN+ACK
//!                                    no ──▶ drop
//! ```
//!
//! A child that reaches ESTABLISHED is queued once for [`Listener::accept`].
//! Children that end up CLOSED, or sit in SYN_RECEIVED longer than
//! `accept_timeout`, are pruned from the table.  An accepted child whose
//! [`Connection`] was dropped without `close()` is closed by the listener and
//! force-released after `close_timeout`.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::config::ConnConfig;
use crate::connection::{initial_sequence, ConnShared, Connection};
use crate::error::ConnError;
use crate::segment::{flags, Segment};
use crate::socket::Socket;
use crate::state::ConnectionState;
use crate::tcb::Tcb;

struct Child {
    conn: Arc<ConnShared>,
    created: Instant,
    queued: bool,
    /// When the listener started closing a child whose handle was dropped.
    orphaned: Option<Instant>,
}

struct Table {
    state: ConnectionState,
    children: HashMap<SocketAddr, Child>,
    ready: VecDeque<Arc<ConnShared>>,
}

struct Shared {
    socket: Socket,
    config: ConnConfig,
    table: Mutex<Table>,
    accepted: Notify,
    running: AtomicBool,
}

/// A listening endpoint.
pub struct Listener {
    shared: Arc<Shared>,
    recv_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Listener {
    /// Bind `addr` and start listening.
    pub async fn bind(addr: SocketAddr, config: ConnConfig) -> Result<Self, ConnError> {
        let socket = Socket::bind(addr).await?;
        Ok(Self::listen(socket, config))
    }

    /// Start listening on an already bound socket: CLOSED → LISTEN.
    pub fn listen(socket: Socket, config: ConnConfig) -> Self {
        let shared = Arc::new(Shared {
            socket,
            config,
            table: Mutex::new(Table {
                state: ConnectionState::Listen,
                children: HashMap::new(),
                ready: VecDeque::new(),
            }),
            accepted: Notify::new(),
            running: AtomicBool::new(true),
        });
        let task = tokio::spawn(recv_loop(Arc::clone(&shared)));
        log::info!("[tcp] listening on {}", shared.socket.local_addr);
        Self {
            shared,
            recv_task: std::sync::Mutex::new(Some(task)),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.socket.local_addr
    }

    /// LISTEN, or CLOSED once [`close`](Listener::close) has run.
    pub async fn state(&self) -> ConnectionState {
        self.shared.table.lock().await.state
    }

    /// Number of peers currently in the dispatch table.
    pub async fn connections(&self) -> usize {
        self.shared.table.lock().await.children.len()
    }

    /// Next connection that completed its handshake.  `Ok(None)` when
    /// `timeout` elapses first (`None` waits indefinitely).
    pub async fn accept(&self, timeout: Option<Duration>) -> Result<Option<Connection>, ConnError> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            let notified = self.shared.accepted.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut table = self.shared.table.lock().await;
                if let Some(child) = table.ready.pop_front() {
                    return Ok(Some(Connection::from_shared(child)));
                }
                if table.state != ConnectionState::Listen {
                    return Err(ConnError::Closed);
                }
            }

            match deadline {
                Some(d) => {
                    if tokio::time::timeout_at(d, notified).await.is_err() {
                        return Ok(None);
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Stop accepting, close every child best-effort, then stop the receive
    /// loop.
    pub async fn close(&self) {
        let children: Vec<Arc<ConnShared>> = {
            let mut table = self.shared.table.lock().await;
            if table.state == ConnectionState::Closed {
                return;
            }
            table.state = ConnectionState::Closed;
            table.ready.clear();
            table
                .children
                .values()
                .map(|child| Arc::clone(&child.conn))
                .collect()
        };
        self.shared.accepted.notify_waiters();

        // Children still need the loop to deliver their ACKs and FINs.
        let closes: Vec<_> = children
            .into_iter()
            .map(|conn| tokio::spawn(async move { Connection::from_shared(conn).close().await }))
            .collect();
        for close in closes {
            if let Ok(false) = close.await {
                log::debug!("[tcp] child did not close cleanly");
            }
        }

        self.shared.running.store(false, Ordering::Release);
        let task = self
            .recv_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.shared.table.lock().await.children.clear();
        log::info!("[tcp] listener {} closed", self.shared.socket.local_addr);
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
    }
}

impl Shared {
    async fn on_datagram(&self, bytes: &[u8], from: SocketAddr) {
        let seg = match Segment::decode(bytes) {
            Ok(decoded) if decoded.intact => decoded.segment,
            Ok(_) => {
                log::debug!("[tcp] corrupt segment from {from} dropped");
                return;
            }
            Err(e) => {
                log::debug!("[tcp] undecodable datagram from {from}: {e}");
                return;
            }
        };

        let existing = {
            let table = self.table.lock().await;
            table.children.get(&from).map(|child| Arc::clone(&child.conn))
        };
        match existing {
            Some(conn) => {
                let state = conn.on_segment(&seg, from).await;
                if state.is_synchronized() {
                    self.mark_ready(from).await;
                }
            }
            None => self.on_new_peer(&seg, from).await,
        }
    }

    /// LISTEN logic for an address with no table entry.
    async fn on_new_peer(&self, seg: &Segment, from: SocketAddr) {
        if !seg.has(flags::SYN) || seg.has(flags::ACK) {
            log::debug!("[tcp] no connection for {from}; {seg} dropped");
            return;
        }
        let mut table = self.table.lock().await;
        if table.state != ConnectionState::Listen {
            return;
        }

        let (tcb, fx) = Tcb::accept_syn(
            self.socket.local_addr.port(),
            seg,
            initial_sequence(),
            self.config.clone(),
            Instant::now(),
        );
        let conn = ConnShared::new(self.socket.clone(), self.config.clone(), tcb, Some(from));
        {
            let mut inner = conn.inner.lock().await;
            conn.apply(&mut inner, fx).await;
        }
        log::info!("[tcp] SYN from {from}; child in SYN_RECEIVED");
        table.children.insert(
            from,
            Child {
                conn,
                created: Instant::now(),
                queued: false,
                orphaned: None,
            },
        );
    }

    async fn mark_ready(&self, from: SocketAddr) {
        let mut table = self.table.lock().await;
        if table.state != ConnectionState::Listen {
            return;
        }
        let Some(child) = table.children.get_mut(&from) else {
            return;
        };
        if child.queued {
            return;
        }
        child.queued = true;
        let conn = Arc::clone(&child.conn);
        table.ready.push_back(conn);
        log::info!("[tcp] connection from {from} established");
        self.accepted.notify_waiters();
    }

    /// Drop CLOSED children, abandon handshakes older than `accept_timeout`
    /// and close children whose handle was dropped.
    async fn prune(&self) {
        let snapshot: Vec<(SocketAddr, Arc<ConnShared>, Instant, Option<Instant>)> = {
            let table = self.table.lock().await;
            table
                .children
                .iter()
                .map(|(addr, child)| {
                    (*addr, Arc::clone(&child.conn), child.created, child.orphaned)
                })
                .collect()
        };

        let mut dead = Vec::new();
        let mut orphaned = Vec::new();
        for (addr, conn, created, orphaned_at) in snapshot {
            let mut inner = conn.inner.lock().await;
            match inner.tcb.state() {
                ConnectionState::Closed => dead.push(addr),
                ConnectionState::SynReceived if created.elapsed() > self.config.accept_timeout => {
                    log::warn!("[tcp] handshake with {addr} not completed; dropping");
                    let fx = inner.tcb.abort();
                    conn.apply(&mut inner, fx).await;
                    dead.push(addr);
                }
                _ if conn.is_dropped() => match orphaned_at {
                    None => {
                        log::info!("[tcp] connection with {addr} dropped without close; closing");
                        let fx = inner.tcb.close(Instant::now());
                        conn.apply(&mut inner, fx).await;
                        orphaned.push(addr);
                    }
                    Some(at) if at.elapsed() > conn.config().close_timeout => {
                        log::warn!("[tcp] close with {addr} did not finish; releasing");
                        let fx = inner.tcb.abort();
                        conn.apply(&mut inner, fx).await;
                        dead.push(addr);
                    }
                    Some(_) => {}
                },
                _ => {}
            }
        }

        if !dead.is_empty() || !orphaned.is_empty() {
            let mut table = self.table.lock().await;
            for addr in dead {
                table.children.remove(&addr);
            }
            let now = Instant::now();
            for addr in orphaned {
                if let Some(child) = table.children.get_mut(&addr) {
                    child.orphaned = Some(now);
                }
            }
        }
    }
}

async fn recv_loop(shared: Arc<Shared>) {
    while shared.running.load(Ordering::Acquire) {
        shared.prune().await;
        match shared.socket.recv_timeout(shared.config.poll_interval).await {
            Ok(Some((bytes, from))) => shared.on_datagram(&bytes, from).await,
            Ok(None) => {}
            Err(e) => log::debug!("[tcp] recv error: {e}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn local() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn listener_starts_in_listen() {
        let listener = Listener::bind(local(), ConnConfig::default()).await.unwrap();
        assert_eq!(listener.state().await, ConnectionState::Listen);
        assert_eq!(listener.connections().await, 0);
    }

    #[tokio::test]
    async fn accept_times_out_without_peers() {
        let listener = Listener::bind(local(), ConnConfig::default()).await.unwrap();
        let got = listener
            .accept(Some(Duration::from_millis(30)))
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn accept_after_close_fails() {
        let listener = Listener::bind(local(), ConnConfig::default()).await.unwrap();
        listener.close().await;
        assert_eq!(listener.state().await, ConnectionState::Closed);
        assert!(matches!(
            listener.accept(Some(Duration::from_millis(10))).await,
            Err(ConnError::Closed)
        ));
    }

    #[tokio::test]
    async fn non_syn_from_unknown_peer_is_ignored() {
        let config = ConnConfig::default().poll_interval(Duration::from_millis(10));
        let listener = Listener::bind(local(), config).await.unwrap();
        let peer = Socket::bind(local()).await.unwrap();
        let stray = Segment {
            flags: flags::ACK,
            ..Segment::default()
        };
        peer.send_to(&stray.encode(), listener.local_addr())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(listener.connections().await, 0);
    }

    #[tokio::test]
    async fn stale_handshake_is_pruned() {
        let config = ConnConfig::default()
            .accept_timeout(Duration::from_millis(100))
            .poll_interval(Duration::from_millis(10));
        let listener = Listener::bind(local(), config).await.unwrap();
        let peer = Socket::bind(local()).await.unwrap();
        let syn = Segment {
            src_port: peer.local_addr.port(),
            dst_port: listener.local_addr().port(),
            seq: 7,
            flags: flags::SYN,
            window: 4096,
            ..Segment::default()
        };
        peer.send_to(&syn.encode(), listener.local_addr())
            .await
            .unwrap();

        // SYN+ACK comes back; the final ACK never does.
        let (bytes, _) = peer.recv_from().await.unwrap();
        let reply = Segment::decode(&bytes).unwrap();
        assert!(reply.intact);
        assert!(reply.segment.has(flags::SYN | flags::ACK));
        assert_eq!(reply.segment.ack, 8);
        assert_eq!(listener.connections().await, 1);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(listener.connections().await, 0);
    }
}
