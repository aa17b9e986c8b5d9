//! Tunable parameters for the ARQ engines and the connection layer.
//!
//! Both structs follow the same pattern: a `Default` with the protocol's
//! stock constants plus by-value setters for the values tests typically
//! shorten.

use std::time::Duration;

// ---------------------------------------------------------------------------
// ArqConfig
// ---------------------------------------------------------------------------

/// Parameters shared by the Go-Back-N and Selective-Repeat engines.
#[derive(Debug, Clone)]
pub struct ArqConfig {
    /// Window size N (at least 1).
    pub window_size: usize,
    /// Fixed retransmission timeout.
    pub timeout: Duration,
    /// GBN: how many times the whole window may be re-sent before the
    /// transfer fails.  SR: how many times a single sequence may be re-sent
    /// before it is given up on.
    pub max_retransmits: u32,
    /// Receive-loop poll interval; bounds how quickly `close` is observed.
    pub poll_interval: Duration,
}

impl Default for ArqConfig {
    fn default() -> Self {
        Self::go_back_n()
    }
}

impl ArqConfig {
    /// Stock Go-Back-N parameters.
    pub fn go_back_n() -> Self {
        Self {
            window_size: 4,
            timeout: Duration::from_secs(1),
            max_retransmits: 100,
            poll_interval: Duration::from_millis(100),
        }
    }

    /// Stock Selective-Repeat parameters.
    pub fn selective_repeat() -> Self {
        Self {
            max_retransmits: 30,
            ..Self::go_back_n()
        }
    }

    pub fn window_size(mut self, n: usize) -> Self {
        self.window_size = n.max(1);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn max_retransmits(mut self, n: u32) -> Self {
        self.max_retransmits = n;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

// ---------------------------------------------------------------------------
// ConnConfig
// ---------------------------------------------------------------------------

/// Parameters for [`crate::connection::Connection`] and
/// [`crate::listener::Listener`].
#[derive(Debug, Clone)]
pub struct ConnConfig {
    /// Maximum payload bytes per segment.
    pub mss: usize,
    /// Receive-buffer capacity advertised in every segment's window field.
    pub recv_buffer: u16,
    /// RTO used before the first RTT sample.
    pub initial_rto: Duration,
    pub min_rto: Duration,
    pub max_rto: Duration,
    /// Retransmissions of the pending segment before giving up on it.
    pub max_retries: u32,
    /// How long TIME_WAIT lingers before the connection is released.
    pub time_wait: Duration,
    /// Bounded wait for an active open.
    pub connect_timeout: Duration,
    /// Bounded wait for the final ACK of a passive handshake.
    pub accept_timeout: Duration,
    /// Bounded wait for the close sequence before resources are force-released.
    pub close_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            mss: 1460,
            recv_buffer: 4096,
            initial_rto: Duration::from_secs(1),
            min_rto: Duration::from_millis(200),
            max_rto: Duration::from_secs(5),
            max_retries: 5,
            time_wait: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(10),
            accept_timeout: Duration::from_secs(5),
            close_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl ConnConfig {
    pub fn mss(mut self, mss: usize) -> Self {
        self.mss = mss.max(1);
        self
    }

    pub fn recv_buffer(mut self, bytes: u16) -> Self {
        self.recv_buffer = bytes;
        self
    }

    pub fn initial_rto(mut self, rto: Duration) -> Self {
        self.initial_rto = rto;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    pub fn time_wait(mut self, d: Duration) -> Self {
        self.time_wait = d;
        self
    }

    pub fn connect_timeout(mut self, d: Duration) -> Self {
        self.connect_timeout = d;
        self
    }

    pub fn accept_timeout(mut self, d: Duration) -> Self {
        self.accept_timeout = d;
        self
    }

    pub fn close_timeout(mut self, d: Duration) -> Self {
        self.close_timeout = d;
        self
    }

    pub fn poll_interval(mut self, d: Duration) -> Self {
        self.poll_interval = d;
        self
    }
}
