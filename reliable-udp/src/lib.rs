//! `reliable-udp`: reliable delivery over an unreliable datagram channel.
//!
//! Three engines share one socket layer:
//!
//! - **Go-Back-N**: sliding window, cumulative ACKs, whole-window
//!   retransmission on a single timer.
//! - **Selective Repeat**: per-frame ACKs and timers, receiver-side reorder
//!   buffer.
//! - **Connection**: a TCP-like byte stream with three-way handshake,
//!   adaptive RTO, flow-control advertisement and four-way close.
//!
//! # Architecture
//!
//! ```text
//!  ┌───────────┐ ┌───────────┐ ┌──────────────────────────────┐
//!  │ GbnSender │ │ SrSender  │ │ Connection ◀── Listener      │
//!  │GbnReceiver│ │SrReceiver │ │     │ (demux by address)     │
//!  └─────┬─────┘ └─────┬─────┘ │   Tcb (pure state machine)   │
//!        │ Frame       │ Frame └──────────────┬───────────────┘
//!        │             │                      │ Segment
//!  ┌─────▼─────────────▼──────────────────────▼───────────────┐
//!  │ Socket  (tokio UdpSocket, optional lossy Simulator)      │
//!  └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Module map:
//! - [`packet`]       ARQ frame codec (type, seq, digest)
//! - [`segment`]      connection segment codec
//! - [`gbn_sender`]   / [`gbn_receiver`]  Go-Back-N
//! - [`sr_sender`]    / [`sr_receiver`]   Selective Repeat
//! - [`reorder`]      out-of-order holding area shared by SR and connections
//! - [`state`]        connection states
//! - [`tcb`]          connection state machine
//! - [`connection`]   / [`listener`]      async connection endpoints
//! - [`timer`]        cancel-and-rearm timer, RTO estimator
//! - [`simulator`]    loss / corruption / delay model for testing
//! - [`socket`]       async UDP wrapper
//! - [`config`], [`stats`], [`error`]

pub mod config;
pub mod connection;
pub mod error;
pub mod gbn_receiver;
pub mod gbn_sender;
pub mod listener;
pub mod packet;
pub mod reorder;
pub mod segment;
pub mod simulator;
pub mod socket;
pub mod sr_receiver;
pub mod sr_sender;
pub mod state;
pub mod stats;
pub mod tcb;
pub mod timer;

pub use config::{ArqConfig, ConnConfig};
pub use connection::Connection;
pub use error::{ArqError, ConnError};
pub use gbn_receiver::GbnReceiver;
pub use gbn_sender::GbnSender;
pub use listener::Listener;
pub use simulator::{Simulator, SimulatorConfig};
pub use socket::Socket;
pub use sr_receiver::SrReceiver;
pub use sr_sender::SrSender;
pub use state::ConnectionState;
pub use stats::{ChannelStats, ReceiverStats, SenderStats};
