//! Async UDP socket abstraction.
//!
//! [`Socket`] is a thin, cloneable wrapper around `tokio::net::UdpSocket`
//! that moves raw datagrams.  Encoding lives in [`crate::packet`] and
//! [`crate::segment`]; protocol logic lives in the engines.
//!
//! A [`crate::simulator::Simulator`] may be installed on the outbound path,
//! in which case every `send_to` is subject to its loss / corruption / delay
//! model.  Receiving is unaffected.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::UdpSocket;

use crate::simulator::Simulator;

/// Maximum UDP payload size (theoretical limit; in practice kept much smaller).
const MAX_DATAGRAM: usize = 65_535;

/// Errors that can arise from socket operations.
#[derive(Debug, Error)]
pub enum SocketError {
    /// Underlying I/O error from the OS.
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Socket
// ---------------------------------------------------------------------------

/// An async, datagram-oriented UDP socket.
///
/// Clones share the same OS socket, so an engine can hand one to its receive
/// loop and keep another for sending.
#[derive(Debug, Clone)]
pub struct Socket {
    /// Address this socket is bound to (filled in after OS assigns ephemeral port).
    pub local_addr: SocketAddr,
    inner: Arc<UdpSocket>,
    simulator: Option<Arc<Simulator>>,
}

impl Socket {
    /// Bind a new socket to `local_addr`.
    ///
    /// Passing `127.0.0.1:0` lets the OS choose an ephemeral port.
    pub async fn bind(local_addr: SocketAddr) -> Result<Self, SocketError> {
        let inner = UdpSocket::bind(local_addr).await?;
        let local_addr = inner.local_addr()?;
        Ok(Self {
            local_addr,
            inner: Arc::new(inner),
            simulator: None,
        })
    }

    /// Route every outbound datagram through `simulator`.
    pub fn with_simulator(mut self, simulator: Arc<Simulator>) -> Self {
        self.simulator = Some(simulator);
        self
    }

    /// The installed lossy channel, if any.
    pub fn simulator(&self) -> Option<&Arc<Simulator>> {
        self.simulator.as_ref()
    }

    /// Send `bytes` as a single datagram to `dest`.
    pub async fn send_to(&self, bytes: &[u8], dest: SocketAddr) -> Result<(), SocketError> {
        match &self.simulator {
            Some(sim) => sim.transmit(&self.inner, bytes, dest).await?,
            None => {
                self.inner.send_to(bytes, dest).await?;
            }
        }
        Ok(())
    }

    /// Receive the next datagram.  Returns `(bytes, sender_address)`.
    pub async fn recv_from(&self) -> Result<(Vec<u8>, SocketAddr), SocketError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (n, addr) = self.inner.recv_from(&mut buf).await?;
        buf.truncate(n);
        Ok((buf, addr))
    }

    /// Like [`recv_from`](Socket::recv_from) but gives up after `wait`,
    /// returning `Ok(None)`.  Receive loops use this to poll their running
    /// flag.
    pub async fn recv_timeout(
        &self,
        wait: Duration,
    ) -> Result<Option<(Vec<u8>, SocketAddr)>, SocketError> {
        match tokio::time::timeout(wait, self.recv_from()).await {
            Ok(res) => res.map(Some),
            Err(_) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn loopback() -> Socket {
        Socket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap()
    }

    #[tokio::test]
    async fn datagram_boundaries_preserved() {
        let a = loopback().await;
        let b = loopback().await;
        a.send_to(b"one", b.local_addr).await.unwrap();
        a.send_to(b"two!", b.local_addr).await.unwrap();

        let (first, from) = b.recv_from().await.unwrap();
        assert_eq!(first, b"one");
        assert_eq!(from, a.local_addr);
        let (second, _) = b.recv_from().await.unwrap();
        assert_eq!(second, b"two!");
    }

    #[tokio::test]
    async fn recv_timeout_returns_none_when_idle() {
        let s = loopback().await;
        let got = s.recv_timeout(Duration::from_millis(20)).await.unwrap();
        assert!(got.is_none());
    }
}
