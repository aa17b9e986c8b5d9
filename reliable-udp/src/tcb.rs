//! Transmission control block: the connection state machine, without I/O.
//!
//! Every entry point takes the current time and returns [`Effects`]: the
//! segments to put on the wire and what to do with the connection's single
//! timer.  [`crate::connection::Connection`] executes those effects under its
//! lock; the unit tests below drive two blocks against each other directly.
//!
//! # Retransmission
//!
//! Sent segments that consume sequence space (SYN, FIN, payload) queue up
//! until cumulatively acknowledged.  One timer guards the oldest of them, the
//! *pending* segment; on expiry exactly that segment is re-sent and the timer
//! re-armed with the current RTO.  After `max_retries` expiries without
//! progress the block stops retransmitting; a handshake in progress falls
//! back to CLOSED.
//!
//! # RTT estimation
//!
//! An ACK that advances `snd_una` and fully covers a segment transmitted
//! only once yields an RTT sample (Karn's rule: retransmitted segments give
//! none).  See [`crate::timer::RtoEstimator`].
//!
//! # Flow control
//!
//! Every outgoing segment advertises the free space of the receive buffer.
//! The peer's advertisement is recorded ([`Tcb::peer_window`]) but sends are
//! not throttled by it.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::ConnConfig;
use crate::error::ConnError;
use crate::gbn_sender::{seq_le, seq_lt};
use crate::reorder::ReorderBuffer;
use crate::segment::{flags, Segment};
use crate::state::ConnectionState;
use crate::timer::RtoEstimator;

/// What to do with the connection's timer after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimerCmd {
    #[default]
    Keep,
    Arm(Duration),
    Cancel,
}

/// Side effects requested by the state machine.
#[derive(Debug, Default)]
pub struct Effects {
    pub transmit: Vec<Segment>,
    pub timer: TimerCmd,
}

#[derive(Debug, Clone)]
struct InFlight {
    segment: Segment,
    sent_at: Instant,
    retransmitted: bool,
}

/// Per-connection protocol state.
#[derive(Debug)]
pub struct Tcb {
    state: ConnectionState,
    local_port: u16,
    remote_port: u16,
    config: ConnConfig,

    /// Oldest unacknowledged sequence number.
    snd_una: u32,
    /// Next sequence number to send.
    snd_nxt: u32,
    /// Next sequence number expected from the peer.
    rcv_nxt: u32,
    peer_window: u16,
    rto: RtoEstimator,

    /// Sent, not yet acknowledged; the front is the pending segment.
    unacked: VecDeque<InFlight>,
    /// Consecutive expiries of the pending segment.
    retries: u32,
    gave_up: bool,

    reorder: ReorderBuffer,
    inbound: VecDeque<u8>,

    /// Sequence number of our FIN once sent.
    fin_seq: Option<u32>,
    /// The peer's FIN has been consumed.
    peer_fin: bool,
}

impl Tcb {
    /// A fresh block in CLOSED.
    pub fn new(local_port: u16, config: ConnConfig) -> Self {
        let rto = RtoEstimator::new(config.initial_rto, config.min_rto, config.max_rto);
        Self {
            state: ConnectionState::Closed,
            local_port,
            remote_port: 0,
            config,
            snd_una: 0,
            snd_nxt: 0,
            rcv_nxt: 0,
            peer_window: 0,
            rto,
            unacked: VecDeque::new(),
            retries: 0,
            gave_up: false,
            reorder: ReorderBuffer::new(),
            inbound: VecDeque::new(),
            fin_seq: None,
            peer_fin: false,
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn peer_window(&self) -> u16 {
        self.peer_window
    }

    pub fn rto(&self) -> Duration {
        self.rto.rto()
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.rto.srtt()
    }

    pub fn snd_una(&self) -> u32 {
        self.snd_una
    }

    pub fn snd_nxt(&self) -> u32 {
        self.snd_nxt
    }

    pub fn rcv_nxt(&self) -> u32 {
        self.rcv_nxt
    }

    /// Bytes delivered in order and not yet read.
    pub fn readable(&self) -> usize {
        self.inbound.len()
    }

    /// The peer has finished sending and everything it sent has been read.
    pub fn is_eof(&self) -> bool {
        self.peer_fin && self.inbound.is_empty()
    }

    /// Retransmission of the pending segment was abandoned.
    pub fn gave_up(&self) -> bool {
        self.gave_up
    }

    /// Every sent segment has been acknowledged.
    pub fn all_acked(&self) -> bool {
        self.unacked.is_empty()
    }

    // -----------------------------------------------------------------------
    // Opening
    // -----------------------------------------------------------------------

    /// Active open: CLOSED → SYN_SENT.
    pub fn open(&mut self, remote_port: u16, iss: u32, now: Instant) -> Result<Effects, ConnError> {
        if self.state != ConnectionState::Closed {
            return Err(ConnError::InvalidState {
                op: "open",
                state: self.state,
            });
        }
        self.remote_port = remote_port;
        self.snd_una = iss;
        self.snd_nxt = iss;
        self.set_state(ConnectionState::SynSent);

        let syn = self.segment(iss, flags::SYN, Vec::new());
        Ok(self.queue(vec![syn], now))
    }

    /// Passive open: build a SYN_RECEIVED block answering `syn`.
    pub fn accept_syn(
        local_port: u16,
        syn: &Segment,
        iss: u32,
        config: ConnConfig,
        now: Instant,
    ) -> (Self, Effects) {
        let mut tcb = Self::new(local_port, config);
        tcb.remote_port = syn.src_port;
        tcb.rcv_nxt = syn.seq.wrapping_add(1);
        tcb.peer_window = syn.window;
        tcb.snd_una = iss;
        tcb.snd_nxt = iss;
        tcb.state = ConnectionState::SynReceived;
        log::debug!(
            "[tcp] :{} SYN from :{}, → SYN_RECEIVED",
            local_port,
            syn.src_port
        );

        let syn_ack = tcb.segment(iss, flags::SYN | flags::ACK, Vec::new());
        let fx = tcb.queue(vec![syn_ack], now);
        (tcb, fx)
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Process one intact inbound segment.
    pub fn on_segment(&mut self, seg: &Segment, now: Instant) -> Effects {
        let mut fx = Effects::default();
        match self.state {
            ConnectionState::Closed | ConnectionState::Listen => return fx,

            ConnectionState::SynSent => {
                if seg.has(flags::SYN | flags::ACK) && seg.ack == self.snd_nxt {
                    self.rcv_nxt = seg.seq.wrapping_add(1);
                    self.peer_window = seg.window;
                    self.acknowledge(seg.ack, now, &mut fx);
                    self.set_state(ConnectionState::Established);
                    fx.transmit.push(self.ack_segment());
                }
                return fx;
            }

            ConnectionState::SynReceived => {
                if seg.has(flags::SYN) && !seg.has(flags::ACK) {
                    // The peer missed our SYN+ACK.
                    if seg.seq.wrapping_add(1) == self.rcv_nxt {
                        if let Some(pending) = self.unacked.front() {
                            fx.transmit.push(pending.segment.clone());
                        }
                    }
                    return fx;
                }
                if !seg.has(flags::ACK) || seg.ack != self.snd_nxt {
                    return fx;
                }
                self.acknowledge(seg.ack, now, &mut fx);
                self.set_state(ConnectionState::Established);
                // The completing ACK may carry payload or a FIN.
            }

            _ => {}
        }

        self.peer_window = seg.window;

        if seg.has(flags::SYN) {
            // Duplicate SYN+ACK: our handshake ACK was lost.
            if seg.has(flags::ACK) && seg.seq.wrapping_add(1) == self.rcv_nxt {
                fx.transmit.push(self.ack_segment());
            }
            return fx;
        }

        if seg.has(flags::ACK) {
            self.acknowledge(seg.ack, now, &mut fx);
        }
        self.receive(seg, &mut fx);
        fx
    }

    fn acknowledge(&mut self, ack: u32, now: Instant, fx: &mut Effects) {
        if !seq_lt(self.snd_una, ack) || !seq_le(ack, self.snd_nxt) {
            return;
        }
        self.snd_una = ack;

        let mut sample = None;
        while let Some(front) = self.unacked.front() {
            let end = front.segment.seq.wrapping_add(front.segment.seq_len());
            if !seq_le(end, ack) {
                break;
            }
            if let Some(done) = self.unacked.pop_front() {
                sample = (!done.retransmitted).then(|| now.saturating_duration_since(done.sent_at));
            }
        }
        if let Some(rtt) = sample {
            let rto = self.rto.record_sample(rtt);
            log::debug!("[tcp] rtt sample {rtt:?} → rto {rto:?}");
        }

        self.retries = 0;
        fx.timer = match self.unacked.front() {
            Some(_) => TimerCmd::Arm(self.rto.rto()),
            None => TimerCmd::Cancel,
        };

        let fin_acked = self.fin_seq.is_some_and(|fin| seq_lt(fin, self.snd_una));
        if !fin_acked {
            return;
        }
        match self.state {
            ConnectionState::FinWait1 => {
                self.set_state(ConnectionState::FinWait2);
                if self.peer_fin {
                    self.enter_time_wait(fx);
                }
            }
            ConnectionState::LastAck => {
                self.set_state(ConnectionState::Closed);
                fx.timer = TimerCmd::Cancel;
            }
            _ => {}
        }
    }

    fn receive(&mut self, seg: &Segment, fx: &mut Effects) {
        let len = seg.payload.len() as u32;
        let mut need_ack = false;

        if len > 0 {
            need_ack = true;
            if self.state.can_receive() {
                if seg.seq == self.rcv_nxt {
                    self.inbound.extend(&seg.payload);
                    self.rcv_nxt = self.rcv_nxt.wrapping_add(len);
                    for chunk in self
                        .reorder
                        .drain_from(&mut self.rcv_nxt, |p| p.len() as u32)
                    {
                        self.inbound.extend(chunk);
                    }
                    let rcv_nxt = self.rcv_nxt;
                    self.reorder.retain(|s| seq_lt(rcv_nxt, s));
                } else if seq_lt(self.rcv_nxt, seg.seq) && !seg.has(flags::FIN) {
                    let limit = self.rcv_nxt.wrapping_add(self.advertised_window() as u32);
                    if seq_le(seg.seq.wrapping_add(len), limit) {
                        log::debug!(
                            "[tcp] out of order seq={} expected={}; buffered",
                            seg.seq,
                            self.rcv_nxt
                        );
                        self.reorder.insert(seg.seq, seg.payload.clone());
                    } else {
                        log::debug!(
                            "[tcp] seq={} beyond receive window (limit {limit}); dropped",
                            seg.seq
                        );
                    }
                }
            }
        }

        if seg.has(flags::FIN) {
            let fin_at = seg.seq.wrapping_add(len);
            if fin_at == self.rcv_nxt && !self.peer_fin {
                self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
                self.peer_fin = true;
                need_ack = true;
                match self.state {
                    ConnectionState::Established => self.set_state(ConnectionState::CloseWait),
                    ConnectionState::FinWait1 => {
                        log::debug!("[tcp] simultaneous close: FIN before ACK of ours");
                    }
                    ConnectionState::FinWait2 => self.enter_time_wait(fx),
                    _ => {}
                }
            } else if seq_lt(fin_at, self.rcv_nxt) {
                // Retransmitted FIN: our ACK was lost.
                need_ack = true;
            }
        }

        if need_ack {
            fx.transmit.push(self.ack_segment());
        }
    }

    // -----------------------------------------------------------------------
    // Application calls
    // -----------------------------------------------------------------------

    /// Split `data` into MSS-sized segments and queue them for transmission.
    pub fn send(&mut self, data: &[u8], now: Instant) -> Result<Effects, ConnError> {
        if !self.state.can_send() {
            return Err(ConnError::InvalidState {
                op: "send",
                state: self.state,
            });
        }
        let mut segments = Vec::new();
        let mut seq = self.snd_nxt;
        for chunk in data.chunks(self.config.mss.max(1)) {
            segments.push(self.segment(seq, flags::ACK, chunk.to_vec()));
            seq = seq.wrapping_add(chunk.len() as u32);
        }
        Ok(self.queue(segments, now))
    }

    /// Begin closing.  A handshake in progress is abandoned outright.
    pub fn close(&mut self, now: Instant) -> Effects {
        let next = match self.state {
            ConnectionState::Established => ConnectionState::FinWait1,
            ConnectionState::CloseWait => ConnectionState::LastAck,
            ConnectionState::Listen | ConnectionState::SynSent | ConnectionState::SynReceived => {
                return self.abort();
            }
            _ => return Effects::default(),
        };
        let fin_seq = self.snd_nxt;
        self.fin_seq = Some(fin_seq);
        let fin = self.segment(fin_seq, flags::FIN | flags::ACK, Vec::new());
        self.set_state(next);
        self.queue(vec![fin], now)
    }

    /// Copy out up to `max` in-order bytes.
    pub fn read(&mut self, max: usize) -> Vec<u8> {
        let n = max.min(self.inbound.len());
        self.inbound.drain(..n).collect()
    }

    /// Drop to CLOSED immediately, discarding anything unacknowledged.
    pub fn abort(&mut self) -> Effects {
        self.unacked.clear();
        self.set_state(ConnectionState::Closed);
        Effects {
            transmit: Vec::new(),
            timer: TimerCmd::Cancel,
        }
    }

    // -----------------------------------------------------------------------
    // Timer
    // -----------------------------------------------------------------------

    /// The connection timer expired: leave TIME_WAIT, or re-send the
    /// pending segment.
    pub fn on_timer(&mut self, now: Instant) -> Effects {
        let mut fx = Effects {
            transmit: Vec::new(),
            timer: TimerCmd::Cancel,
        };
        if self.state == ConnectionState::TimeWait {
            self.set_state(ConnectionState::Closed);
            return fx;
        }
        if self.state == ConnectionState::Closed || self.unacked.is_empty() {
            return fx;
        }

        self.retries += 1;
        if self.retries > self.config.max_retries {
            self.gave_up = true;
            log::warn!(
                "[tcp] :{} giving up after {} retransmissions in {}",
                self.local_port,
                self.config.max_retries,
                self.state
            );
            if matches!(
                self.state,
                ConnectionState::SynSent | ConnectionState::SynReceived
            ) {
                self.unacked.clear();
                self.set_state(ConnectionState::Closed);
            }
            return fx;
        }

        let (rcv_nxt, window) = (self.rcv_nxt, self.advertised_window());
        if let Some(pending) = self.unacked.front_mut() {
            pending.retransmitted = true;
            pending.sent_at = now;
            if pending.segment.has(flags::ACK) {
                pending.segment.ack = rcv_nxt;
            }
            pending.segment.window = window;
            log::debug!("[tcp] timeout: resending {}", pending.segment);
            fx.transmit.push(pending.segment.clone());
        }
        fx.timer = TimerCmd::Arm(self.rto.rto());
        fx
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn set_state(&mut self, next: ConnectionState) {
        if self.state != next {
            log::debug!("[tcp] :{} {} → {}", self.local_port, self.state, next);
            self.state = next;
        }
    }

    fn enter_time_wait(&mut self, fx: &mut Effects) {
        self.set_state(ConnectionState::TimeWait);
        fx.timer = TimerCmd::Arm(self.config.time_wait);
    }

    fn advertised_window(&self) -> u16 {
        let used = self.inbound.len().min(u16::MAX as usize) as u16;
        self.config.recv_buffer.saturating_sub(used)
    }

    fn segment(&self, seq: u32, flags: u8, payload: Vec<u8>) -> Segment {
        Segment {
            src_port: self.local_port,
            dst_port: self.remote_port,
            seq,
            ack: if flags & flags::ACK != 0 { self.rcv_nxt } else { 0 },
            flags,
            window: self.advertised_window(),
            payload,
        }
    }

    fn ack_segment(&self) -> Segment {
        self.segment(self.snd_nxt, flags::ACK, Vec::new())
    }

    /// Put sequence-consuming segments in flight; arms the timer when they
    /// become the pending segment.
    fn queue(&mut self, segments: Vec<Segment>, now: Instant) -> Effects {
        let was_idle = self.unacked.is_empty();
        for seg in &segments {
            self.snd_nxt = self.snd_nxt.wrapping_add(seg.seq_len());
            self.unacked.push_back(InFlight {
                segment: seg.clone(),
                sent_at: now,
                retransmitted: false,
            });
        }
        let timer = if was_idle && !segments.is_empty() {
            TimerCmd::Arm(self.rto.rto())
        } else {
            TimerCmd::Keep
        };
        Effects {
            transmit: segments,
            timer,
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
