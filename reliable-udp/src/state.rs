//! Connection finite-state machine (FSM) states.
//!
//! Transitions live in [`crate::tcb`]; this module only names the states.
//!
//! ```text
//!                 open                     listen
//!   CLOSED ──────────────▶ SYN_SENT   CLOSED ──────▶ LISTEN
//!                            │ SYN+ACK / ACK           │ SYN / SYN+ACK (child)
//!                            ▼                         ▼
//!                       ESTABLISHED ◀──── ACK ──── SYN_RECEIVED
//!                  close /  │   │  FIN / ACK
//!                    FIN    │   └──────────────▶ CLOSE_WAIT
//!                           ▼                         │ close / FIN
//!                      FIN_WAIT_1                     ▼
//!                           │ ACK                 LAST_ACK
//!                           ▼                         │ ACK
//!                      FIN_WAIT_2                     ▼
//!                           │ FIN / ACK            CLOSED
//!                           ▼
//!                       TIME_WAIT ── timeout ──▶ CLOSED
//! ```
//!
//! A FIN that reaches FIN_WAIT_1 before the ACK of our own FIN is
//! acknowledged immediately; the connection then passes through FIN_WAIT_2
//! into TIME_WAIT as soon as that ACK arrives.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No connection exists; initial and terminal state.
    #[default]
    Closed,
    /// Passive endpoint waiting for SYNs.
    Listen,
    /// SYN has been sent; waiting for SYN+ACK.
    SynSent,
    /// SYN received; SYN+ACK sent; waiting for ACK.
    SynReceived,
    /// Three-way handshake complete; data transfer in progress.
    Established,
    /// Local side sent FIN; waiting for its ACK.
    FinWait1,
    /// ACK of local FIN received; waiting for peer's FIN.
    FinWait2,
    /// Peer's FIN received; waiting for the local application to close.
    CloseWait,
    /// Local FIN sent after the peer's; waiting for its ACK.
    LastAck,
    /// Lingering so stray duplicates of the peer's FIN are still answered.
    TimeWait,
}

impl ConnectionState {
    /// States in which the peer may still deliver payload to us.
    pub fn can_receive(self) -> bool {
        matches!(self, Self::Established | Self::FinWait1 | Self::FinWait2)
    }

    /// States in which the application may still send.
    pub fn can_send(self) -> bool {
        matches!(self, Self::Established | Self::CloseWait)
    }

    /// Synchronised states (handshake finished, not yet closed).
    pub fn is_synchronized(self) -> bool {
        !matches!(
            self,
            Self::Closed | Self::Listen | Self::SynSent | Self::SynReceived
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Closed => "CLOSED",
            Self::Listen => "LISTEN",
            Self::SynSent => "SYN_SENT",
            Self::SynReceived => "SYN_RECEIVED",
            Self::Established => "ESTABLISHED",
            Self::FinWait1 => "FIN_WAIT_1",
            Self::FinWait2 => "FIN_WAIT_2",
            Self::CloseWait => "CLOSE_WAIT",
            Self::LastAck => "LAST_ACK",
            Self::TimeWait => "TIME_WAIT",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_uses_protocol_names() {
        assert_eq!(ConnectionState::SynReceived.to_string(), "SYN_RECEIVED");
        assert_eq!(ConnectionState::FinWait1.to_string(), "FIN_WAIT_1");
        assert_eq!(ConnectionState::default(), ConnectionState::Closed);
    }

    #[test]
    fn half_close_receive_states() {
        assert!(ConnectionState::FinWait2.can_receive());
        assert!(!ConnectionState::CloseWait.can_receive());
        assert!(ConnectionState::CloseWait.can_send());
        assert!(!ConnectionState::FinWait1.can_send());
    }
}
